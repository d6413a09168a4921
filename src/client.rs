//! Session orchestration: connect, stream events, recover, disconnect.
//!
//! All state that more than one background task touches (connection state,
//! reconnect policy, the current episode) lives in one `Session` behind a
//! single mutex. State-change events are emitted while that lock is held, so
//! they interleave with content events in the order the transitions happened.

use crate::audio_sink::AudioSink;
use crate::config::ClientConfig;
use crate::connection::{Connection, Connector, WsConnector};
use crate::error::{ChatError, Result};
use crate::events::{ChatEvent, ConnectionState};
use crate::heartbeat::{HeartbeatExit, HeartbeatMonitor};
use crate::protocol::{self, ChatRequest, Decoded};
use crate::reassembler::FrameReassembler;
use crate::reconnect::ReconnectPolicy;
use futures_util::Stream;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One connected period, from handshake to teardown
struct Episode {
    id: u64,
    connection: Arc<dyn Connection>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Episode {
    /// Stop both loops, wait for them to finish, then close the transport
    async fn retire(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    log::error!("Episode {} task panicked: {}", self.id, e);
                }
            }
        }
        self.connection.close().await;
        log::debug!("Episode {} retired", self.id);
    }
}

struct Session {
    state: ConnectionState,
    policy: ReconnectPolicy,
    auto_reconnect: bool,
    disposed: bool,
    events: Option<broadcast::Sender<ChatEvent>>,
    /// Cancels whichever connect loop is currently running
    run_token: CancellationToken,
    episode: Option<Episode>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl Session {
    fn emit(&self, event: ChatEvent) {
        if let Some(events) = &self.events {
            // No subscribers is not an error
            let _ = events.send(event);
        }
    }

    fn transition(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        log::info!("🔄 Connection state: {} -> {}", self.state, state);
        self.state = state;
        self.emit(ChatEvent::state(state));
    }
}

struct Inner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    audio_sink: OnceLock<Arc<dyn AudioSink>>,
    session: Mutex<Session>,
    next_episode: AtomicU64,
}

/// Streaming chat client with automatic reconnection.
///
/// Every outcome (content, state changes and failures) is reported through
/// the event stream returned by [`ChatClient::events`] or
/// [`ChatClient::subscribe`]. The event channel is bounded; a subscriber that
/// falls more than `event_capacity` events behind loses the oldest ones.
pub struct ChatClient {
    inner: Arc<Inner>,
}

impl ChatClient {
    /// Create a client that talks WebSocket to `config.server_url`.
    ///
    /// Fails with `ChatError::Config` if the configuration does not validate.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let mut connector = WsConnector::new(config.connect_timeout);
        if let Some(key) = config.api_key() {
            connector = connector.with_api_key(key);
        }
        Self::with_connector(config, Arc::new(connector))
    }

    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity);
        let session = Session {
            state: ConnectionState::Disconnected,
            policy: ReconnectPolicy::new(&config.reconnect),
            auto_reconnect: false,
            disposed: false,
            events: Some(events),
            run_token: CancellationToken::new(),
            episode: None,
            reconnect_task: None,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connector,
                audio_sink: OnceLock::new(),
                session: Mutex::new(session),
                next_episode: AtomicU64::new(1),
            }),
        })
    }

    /// Hand decoded audio to `sink`; only the first sink set is used
    pub fn with_audio_sink(self, sink: Arc<dyn AudioSink>) -> Self {
        if self.inner.audio_sink.set(sink).is_err() {
            log::warn!("Audio sink already set, ignoring replacement");
        }
        self
    }

    pub fn current_state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().policy.attempts()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Receive future events. Events sent before this call are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        match &self.inner.lock().events {
            Some(events) => events.subscribe(),
            None => {
                // Disposed: hand out a receiver that is already closed
                let (_, receiver) = broadcast::channel(1);
                receiver
            }
        }
    }

    /// Future events as a stream; lag notices are logged and skipped.
    pub fn events(&self) -> impl Stream<Item = ChatEvent> + Send + 'static {
        let mut receiver = self.subscribe();
        async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Event subscriber lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Connect, retrying per the reconnect policy.
    ///
    /// Returns `Ok(true)` once connected, `Ok(false)` if every attempt failed
    /// or the attempt was cancelled by `disconnect`. The failure itself is
    /// reported as an `ErrorOccurred` event.
    pub async fn connect(&self) -> Result<bool> {
        let (token, previous) = {
            let mut session = self.inner.lock();
            if session.disposed {
                return Err(ChatError::Disposed);
            }
            if session.state.is_connected() {
                return Ok(true);
            }
            session.policy.reset();
            session.auto_reconnect = true;
            session.run_token.cancel();
            session.run_token = CancellationToken::new();
            (session.run_token.clone(), session.reconnect_task.take())
        };

        // A background reconnect from an earlier episode must be fully gone
        // before this connect loop starts
        if let Some(task) = previous {
            let _ = task.await;
        }

        Ok(self.inner.connect_loop(token, false).await)
    }

    /// Send a user message.
    ///
    /// Sending while not connected emits an `ErrorOccurred` event instead of
    /// failing; transport errors additionally start recovery.
    pub async fn send(&self, text: &str) -> Result<()> {
        self.send_with_context(text, Value::Object(Default::default()))
            .await
    }

    pub async fn send_with_context(&self, text: &str, context: Value) -> Result<()> {
        let (connection, episode_id) = {
            let session = self.inner.lock();
            if session.disposed {
                return Err(ChatError::Disposed);
            }
            match (&session.episode, session.state) {
                (Some(episode), ConnectionState::Connected) => {
                    (Arc::clone(&episode.connection), episode.id)
                }
                _ => {
                    log::warn!("Cannot send message while {}", session.state);
                    session.emit(ChatEvent::error("Cannot send message: not connected"));
                    return Ok(());
                }
            }
        };

        if let Some(sink) = self.inner.audio_sink.get() {
            if let Err(e) = sink.reset().await {
                log::warn!("AudioSink: reset failed: {}", e);
            }
        }

        let config = &self.inner.config;
        let request = ChatRequest {
            user_id: config.user_id.clone(),
            session_id: config.session_id.clone(),
            message: text.to_string(),
            configuration: config.configuration.clone(),
            context,
            include_audio: config.include_audio,
        };
        let frame = match protocol::encode_request(&request) {
            Ok(frame) => frame,
            Err(e) => {
                self.inner
                    .emit(ChatEvent::error(format!("Failed to encode message: {}", e)));
                return Ok(());
            }
        };

        log::debug!("📤 Sending message ({} bytes)", frame.len());
        if let Err(e) = connection.send_frame(frame).await {
            log::warn!("❌ Failed to send message: {}", e);
            self.inner
                .emit(ChatEvent::error(format!("Failed to send message: {}", e)));
            self.inner
                .trigger_recovery(episode_id, format!("send failed: {}", e));
        }
        Ok(())
    }

    /// Stop all activity and close the connection. Safe to call repeatedly
    /// and from any state; automatic reconnection stays off until the next
    /// `connect`.
    pub async fn disconnect(&self) -> Result<()> {
        if self.inner.lock().disposed {
            return Err(ChatError::Disposed);
        }
        self.inner.teardown().await;
        Ok(())
    }

    /// Disconnect and close the event stream. Later calls other than
    /// `shutdown` return `ChatError::Disposed`.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut session = self.inner.lock();
            if session.disposed {
                return Ok(());
            }
            // Set before teardown so a concurrent connect cannot start a new episode
            session.disposed = true;
        }
        self.inner.teardown().await;

        self.inner.lock().events = None;
        log::info!("👋 Chat client shut down");
        Ok(())
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        let mut session = self.inner.lock();
        session.disposed = true;
        session.auto_reconnect = false;
        session.run_token.cancel();
        session.events = None;
        if let Some(task) = session.reconnect_task.take() {
            task.abort();
        }
        if let Some(episode) = session.episode.take() {
            episode.cancel.cancel();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(episode.retire());
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Session> {
        // Session updates are single assignments; a poisoned guard is still consistent
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ChatEvent) {
        self.lock().emit(event);
    }

    /// Stop reconnecting, retire the current episode and any background
    /// reconnect, then report `Disconnected`
    async fn teardown(&self) {
        let (episode, task) = {
            let mut session = self.lock();
            session.auto_reconnect = false;
            session.policy.stop();
            session.run_token.cancel();
            (session.episode.take(), session.reconnect_task.take())
        };

        if let Some(episode) = episode {
            episode.retire().await;
        }
        if let Some(task) = task {
            let _ = task.await;
        }

        self.lock().transition(ConnectionState::Disconnected);
    }

    /// Attempt connections until one succeeds, the policy gives up, or
    /// `token` is cancelled.
    async fn connect_loop(self: &Arc<Self>, token: CancellationToken, reconnecting: bool) -> bool {
        let mut first_attempt = !reconnecting;

        loop {
            {
                let mut session = self.lock();
                if token.is_cancelled() || session.disposed {
                    return false;
                }
                if !session.policy.can_retry() {
                    if session.policy.is_stopped() {
                        log::debug!("Reconnect policy stopped, not attempting");
                    }
                    return false;
                }
                session.transition(if first_attempt {
                    ConnectionState::Connecting
                } else {
                    ConnectionState::Reconnecting
                });
            }
            first_attempt = false;

            let attempt = tokio::select! {
                biased;
                _ = token.cancelled() => Err(ChatError::Cancelled),
                result = self.open_and_handshake() => result,
            };

            let error = match attempt {
                Ok((connection, status)) => {
                    let established = {
                        let mut session = self.lock();
                        if token.is_cancelled() || session.disposed {
                            false
                        } else {
                            session.emit(ChatEvent::StatusMessageReceived { message: status });
                            session.policy.reset();
                            session.transition(ConnectionState::Connected);
                            session.episode = Some(self.start_episode(Arc::clone(&connection)));
                            true
                        }
                    };
                    if !established {
                        connection.close().await;
                    }
                    return established;
                }
                Err(ChatError::Cancelled) => return false,
                Err(e) => e,
            };

            let delay = {
                let mut session = self.lock();
                if token.is_cancelled() {
                    return false;
                }
                session.policy.record_attempt();
                if !error.is_transient() {
                    // Retrying cannot fix a bad URL, header or config
                    session.policy.stop();
                }
                let attempts = session.policy.attempts();
                log::warn!(
                    "❌ Connection attempt {}/{} failed: {}",
                    attempts,
                    session.policy.max_attempts(),
                    error
                );
                if !session.policy.can_retry() {
                    session.emit(ChatEvent::error(format!(
                        "Failed to connect after {} attempts: {}",
                        attempts, error
                    )));
                    session.transition(ConnectionState::Disconnected);
                    return false;
                }
                session.policy.next_delay()
            };

            log::info!("⏳ Retrying in {:?}", delay);
            tokio::select! {
                biased;
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Open a connection and wait for the server's status message
    async fn open_and_handshake(&self) -> Result<(Arc<dyn Connection>, String)> {
        let connection = self.connector.open(&self.config.server_url).await?;
        let timeout = self.config.connect_timeout;

        let handshake = async {
            let mut reassembler = FrameReassembler::new(self.config.max_message_bytes);
            loop {
                let Some(message) = reassembler.next_message(connection.as_ref()).await? else {
                    return Err(ChatError::ConnectionClosed);
                };
                match protocol::decode(&message) {
                    Some(Decoded::Event(ChatEvent::StatusMessageReceived { message })) => {
                        return Ok(message)
                    }
                    Some(Decoded::Event(other)) => {
                        return Err(ChatError::Handshake(format!(
                            "expected status message, got {:?}",
                            other
                        )))
                    }
                    Some(Decoded::Ack) | None => continue,
                }
            }
        };

        let result = match tokio::time::timeout(timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(ChatError::Timeout(timeout)),
        };

        match result {
            Ok(status) => {
                log::info!("✅ Handshake complete: {}", status);
                Ok((connection, status))
            }
            Err(e) => {
                connection.close().await;
                Err(e)
            }
        }
    }

    fn start_episode(self: &Arc<Self>, connection: Arc<dyn Connection>) -> Episode {
        let id = self.next_episode.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let heartbeat = Arc::new(HeartbeatMonitor::new(&self.config.heartbeat));

        let receive = tokio::spawn(Arc::clone(self).receive_loop(
            id,
            Arc::clone(&connection),
            Arc::clone(&heartbeat),
            cancel.clone(),
        ));
        let ping = tokio::spawn(Arc::clone(self).heartbeat_loop(
            id,
            Arc::clone(&connection),
            heartbeat,
            cancel.clone(),
        ));

        log::debug!("Episode {} started", id);
        Episode {
            id,
            connection,
            cancel,
            tasks: vec![receive, ping],
        }
    }

    async fn receive_loop(
        self: Arc<Self>,
        episode_id: u64,
        connection: Arc<dyn Connection>,
        heartbeat: Arc<HeartbeatMonitor>,
        cancel: CancellationToken,
    ) {
        let mut reassembler = FrameReassembler::new(self.config.max_message_bytes);

        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = reassembler.next_message(connection.as_ref()) => next,
            };

            let message = match next {
                Ok(Some(message)) => message,
                Ok(None) => break "connection closed".to_string(),
                Err(e) => break format!("receive failed: {}", e),
            };

            match protocol::decode(&message) {
                Some(Decoded::Ack) => heartbeat.record_ack(),
                Some(Decoded::Event(event)) => self.deliver(event).await,
                None => {}
            }
        };

        log::warn!("🔌 Episode {} ended: {}", episode_id, reason);
        self.trigger_recovery(episode_id, reason);
    }

    async fn heartbeat_loop(
        self: Arc<Self>,
        episode_id: u64,
        connection: Arc<dyn Connection>,
        heartbeat: Arc<HeartbeatMonitor>,
        cancel: CancellationToken,
    ) {
        if heartbeat.run(connection.as_ref(), cancel).await == HeartbeatExit::Dead {
            self.trigger_recovery(episode_id, "heartbeat acknowledgment overdue".to_string());
        }
    }

    /// Pass one event to the audio sink (if any) and then to subscribers
    async fn deliver(&self, event: ChatEvent) {
        if let Some(sink) = self.audio_sink.get() {
            let result = match &event {
                ChatEvent::AudioChunkReceived { bytes } => sink.queue(bytes).await,
                ChatEvent::ResponseCompleted => sink.flush().await,
                ChatEvent::ResponseInterrupted => sink.clear().await,
                ChatEvent::ConnectionStateChanged { .. }
                | ChatEvent::StatusMessageReceived { .. }
                | ChatEvent::TextChunkReceived { .. }
                | ChatEvent::ErrorOccurred { .. } => Ok(()),
            };
            if let Err(e) = result {
                log::warn!("AudioSink: {}", e);
            }
        }
        self.emit(event);
    }

    /// Single entry point for every failure detector. The first caller for
    /// an episode takes it out of the session; later callers find it gone
    /// and return.
    fn trigger_recovery(self: &Arc<Self>, episode_id: u64, reason: String) {
        let mut session = self.lock();
        let episode = match session.episode.take() {
            Some(episode) if episode.id == episode_id => episode,
            other => {
                session.episode = other;
                log::debug!(
                    "Recovery for episode {} already handled ({})",
                    episode_id,
                    reason
                );
                return;
            }
        };

        log::info!("🛠️ Recovering episode {}: {}", episode_id, reason);
        episode.cancel.cancel();
        let token = session.run_token.clone();
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move { inner.recover(episode, token).await });
        session.reconnect_task = Some(task);
    }

    async fn recover(self: Arc<Self>, episode: Episode, token: CancellationToken) {
        episode.retire().await;

        {
            let mut session = self.lock();
            session.transition(ConnectionState::Disconnected);
            if !session.auto_reconnect || session.disposed || token.is_cancelled() {
                return;
            }
        }

        if self.connect_loop(token, true).await {
            log::info!("✅ Reconnected");
        }
    }
}
