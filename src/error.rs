use crate::config::ConfigError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Invalid request header: {0}")]
    InvalidHeader(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Client has been shut down")]
    Disposed,
}

impl ChatError {
    /// Transport-class failures are retried by the reconnect policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChatError::WebSocket(_)
                | ChatError::ConnectionClosed
                | ChatError::Timeout(_)
                | ChatError::Handshake(_)
        )
    }
}
