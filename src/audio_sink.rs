use std::collections::VecDeque;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("Failed to queue audio data: {0}")]
    QueueError(String),

    #[error("Buffer full")]
    BufferFull,

    #[error("Audio device error: {0}")]
    DeviceError(String),
}

/// Consumer of the assistant's streamed audio.
///
/// The client calls `queue` for every audio chunk, `flush` when a turn
/// completes, `clear` when a turn is interrupted and `reset` before each new
/// outbound message.
#[async_trait::async_trait]
pub trait AudioSink: Send + Sync {
    async fn queue(&self, audio_data: &[u8]) -> Result<(), AudioError>;

    /// Everything queued so far belongs to a finished turn
    async fn flush(&self) -> Result<(), AudioError>;

    /// Drop buffered audio without playing it
    async fn clear(&self) -> Result<(), AudioError>;

    async fn reset(&self) -> Result<(), AudioError>;
}

#[derive(Debug, Default)]
struct BufferedState {
    pending: Vec<u8>,
    turns: VecDeque<Vec<u8>>,
    cleared_bytes: usize,
    resets: usize,
}

/// Completed turns kept by default
pub const DEFAULT_MAX_TURNS: usize = 8;

/// In-memory sink that keeps audio grouped by turn.
///
/// Only the most recent `max_turns` completed turns are retained; older
/// ones are dropped on flush.
#[derive(Debug)]
pub struct BufferedSink {
    state: Mutex<BufferedState>,
    max_pending_bytes: usize,
    max_turns: usize,
}

impl Default for BufferedSink {
    fn default() -> Self {
        Self::new(64 * 1024 * 1024)
    }
}

impl BufferedSink {
    pub fn new(max_pending_bytes: usize) -> Self {
        Self {
            state: Mutex::new(BufferedState::default()),
            max_pending_bytes,
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    /// Keep at most `max_turns` completed turns; zero keeps none
    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    /// Bytes queued for the current, unfinished turn
    pub fn pending_bytes(&self) -> usize {
        self.lock().pending.len()
    }

    /// Audio of every turn flushed so far
    pub fn completed_turns(&self) -> Vec<Vec<u8>> {
        self.lock().turns.iter().cloned().collect()
    }

    pub fn cleared_bytes(&self) -> usize {
        self.lock().cleared_bytes
    }

    pub fn reset_count(&self) -> usize {
        self.lock().resets
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferedState> {
        // A poisoned lock only means a panicking test; the data is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl AudioSink for BufferedSink {
    async fn queue(&self, audio_data: &[u8]) -> Result<(), AudioError> {
        let mut state = self.lock();
        if state.pending.len() + audio_data.len() > self.max_pending_bytes {
            return Err(AudioError::BufferFull);
        }
        state.pending.extend_from_slice(audio_data);
        Ok(())
    }

    async fn flush(&self) -> Result<(), AudioError> {
        let mut state = self.lock();
        if !state.pending.is_empty() {
            let turn = std::mem::take(&mut state.pending);
            log::debug!("AudioSink: Flushed turn of {} bytes", turn.len());
            state.turns.push_back(turn);
            while state.turns.len() > self.max_turns {
                state.turns.pop_front();
            }
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), AudioError> {
        let mut state = self.lock();
        state.cleared_bytes += state.pending.len();
        state.pending.clear();
        Ok(())
    }

    async fn reset(&self) -> Result<(), AudioError> {
        let mut state = self.lock();
        state.pending.clear();
        state.resets += 1;
        Ok(())
    }
}

#[cfg(feature = "playback")]
pub use cpal_sink::CpalSink;

#[cfg(feature = "playback")]
mod cpal_sink {
    use super::{AudioError, AudioSink};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::collections::VecDeque;
    use std::sync::mpsc::{channel, Sender};
    use std::sync::{Arc, Mutex};
    use std::thread;

    /// Sample rate of the PCM the backend streams
    const INPUT_SAMPLE_RATE: u32 = 16000;

    enum AudioCommand {
        Queue(Vec<u8>),
        Clear,
        Stop,
    }

    /// Plays 16-bit little-endian mono PCM through the default output device.
    pub struct CpalSink {
        commands: Mutex<Sender<AudioCommand>>,
        audio_thread: Option<thread::JoinHandle<()>>,
    }

    impl CpalSink {
        pub fn new() -> Result<Self, AudioError> {
            let (sender, receiver) = channel::<AudioCommand>();

            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| AudioError::DeviceError("No output device found".to_string()))?;
            log::debug!("AudioSink: Using output device: {:?}", device.name());

            let supported_config = device
                .default_output_config()
                .map_err(|e| AudioError::DeviceError(e.to_string()))?;
            let output_rate = supported_config.sample_rate().0;
            let channels = supported_config.channels() as usize;
            let step = INPUT_SAMPLE_RATE as f32 / output_rate as f32;

            let samples: Arc<Mutex<VecDeque<f32>>> = Arc::new(Mutex::new(VecDeque::new()));
            let playback_samples = Arc::clone(&samples);

            // cpal streams are not Send, so the stream lives on its own thread
            let audio_thread = thread::spawn(move || {
                let mut position = 0.0f32;
                let stream = match device.build_output_stream(
                    &supported_config.config(),
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut queue = playback_samples.lock().unwrap_or_else(|e| e.into_inner());
                        for frame in data.chunks_mut(channels) {
                            let sample = queue.front().copied().unwrap_or(0.0);
                            frame.iter_mut().for_each(|out| *out = sample);
                            position += step;
                            while position >= 1.0 {
                                queue.pop_front();
                                position -= 1.0;
                            }
                        }
                    },
                    |err| log::error!("AudioSink: Stream error: {}", err),
                    None,
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        log::error!("AudioSink: Failed to create audio stream: {}", e);
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    log::error!("AudioSink: Failed to start audio stream: {}", e);
                    return;
                }

                while let Ok(command) = receiver.recv() {
                    let mut queue = samples.lock().unwrap_or_else(|e| e.into_inner());
                    match command {
                        AudioCommand::Queue(pcm) => queue.extend(
                            pcm.chunks_exact(2)
                                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32),
                        ),
                        AudioCommand::Clear => queue.clear(),
                        AudioCommand::Stop => break,
                    }
                }
                log::debug!("AudioSink: Audio thread exiting");
            });

            Ok(Self {
                commands: Mutex::new(sender),
                audio_thread: Some(audio_thread),
            })
        }

        fn send(&self, command: AudioCommand) -> Result<(), AudioError> {
            self.commands
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .send(command)
                .map_err(|e| AudioError::QueueError(e.to_string()))
        }
    }

    #[async_trait::async_trait]
    impl AudioSink for CpalSink {
        async fn queue(&self, audio_data: &[u8]) -> Result<(), AudioError> {
            self.send(AudioCommand::Queue(audio_data.to_vec()))
        }

        async fn flush(&self) -> Result<(), AudioError> {
            // Playback drains the queue on its own
            Ok(())
        }

        async fn clear(&self) -> Result<(), AudioError> {
            self.send(AudioCommand::Clear)
        }

        async fn reset(&self) -> Result<(), AudioError> {
            self.send(AudioCommand::Clear)
        }
    }

    impl Drop for CpalSink {
        fn drop(&mut self) {
            if let Err(e) = self.send(AudioCommand::Stop) {
                log::error!("Failed to send stop command: {}", e);
            }
            if let Some(handle) = self.audio_thread.take() {
                let _ = handle.join();
            }
        }
    }
}
