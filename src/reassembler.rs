use crate::connection::{Connection, Received};
use crate::error::{ChatError, Result};

/// Rebuilds logical messages from transport chunks.
///
/// A message may span several reads; bytes accumulate until a chunk marked
/// as the end of its message arrives.
#[derive(Debug)]
pub struct FrameReassembler {
    buffer: Vec<u8>,
    max_message_bytes: usize,
    /// Set while the rest of an oversized message is being skipped
    discarding: bool,
}

impl FrameReassembler {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_message_bytes,
            discarding: false,
        }
    }

    /// Feed one chunk. Returns the complete message when `end_of_message`
    /// closes it.
    pub fn push(&mut self, data: &[u8], end_of_message: bool) -> Result<Option<Vec<u8>>> {
        if !self.discarding {
            let size = self.buffer.len() + data.len();
            if size > self.max_message_bytes {
                self.buffer.clear();
                self.discarding = !end_of_message;
                return Err(ChatError::MessageTooLarge {
                    size,
                    limit: self.max_message_bytes,
                });
            }
            self.buffer.extend_from_slice(data);
        }

        if !end_of_message {
            return Ok(None);
        }
        if self.discarding {
            self.discarding = false;
            return Ok(None);
        }
        Ok(Some(std::mem::take(&mut self.buffer)))
    }

    /// Drop a partial message cut off by a connection close
    pub fn abort(&mut self) {
        let pending = self.buffered_bytes();
        if pending > 0 {
            log::debug!(
                "Reassembler: Discarding {} bytes of an unfinished message",
                pending
            );
        }
        self.buffer.clear();
        self.discarding = false;
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Read from `connection` until one complete message is available.
    ///
    /// Returns `Ok(None)` once the connection closes. Oversized messages are
    /// logged and skipped.
    pub async fn next_message(&mut self, connection: &dyn Connection) -> Result<Option<Vec<u8>>> {
        loop {
            match connection.receive_chunk().await {
                Ok(Received::Chunk {
                    data,
                    end_of_message,
                }) => match self.push(&data, end_of_message) {
                    Ok(Some(message)) => return Ok(Some(message)),
                    Ok(None) => continue,
                    Err(e) => {
                        log::warn!("Reassembler: {}", e);
                        continue;
                    }
                },
                Ok(Received::Closed) => {
                    self.abort();
                    return Ok(None);
                }
                Err(e) => {
                    self.abort();
                    return Err(e);
                }
            }
        }
    }
}
