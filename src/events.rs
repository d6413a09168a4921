//! Connection state and the events surfaced to callers.

/// Lifecycle state of the client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// Returns true if the connection is usable for sending.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Returns true while a connect attempt is in flight.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }
}

/// Everything the client reports, in wire order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    ConnectionStateChanged { state: ConnectionState },
    /// Handshake payload sent by the server at the start of every connection
    StatusMessageReceived { message: String },
    TextChunkReceived { chunk: String },
    AudioChunkReceived { bytes: Vec<u8> },
    ResponseCompleted,
    ResponseInterrupted,
    ErrorOccurred { message: String },
}

impl ChatEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ChatEvent::ErrorOccurred {
            message: message.into(),
        }
    }

    pub fn state(state: ConnectionState) -> Self {
        ChatEvent::ConnectionStateChanged { state }
    }

    /// True for the two markers that end an assistant turn
    pub fn is_turn_terminator(&self) -> bool {
        matches!(
            self,
            ChatEvent::ResponseCompleted | ChatEvent::ResponseInterrupted
        )
    }

    /// True for partial assistant output (text or audio)
    pub fn is_content(&self) -> bool {
        matches!(
            self,
            ChatEvent::TextChunkReceived { .. } | ChatEvent::AudioChunkReceived { .. }
        )
    }
}
