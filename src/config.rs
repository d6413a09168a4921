use secrecy::{ExposeSecret, SecretBox};
use serde_json::{Map, Value};
use std::env;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
    #[error("Invalid server URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Backoff settings for automatic reconnection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Liveness ping settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for the chat client
#[derive(Debug)]
pub struct ClientConfig {
    pub server_url: Url,
    pub user_id: String,
    pub session_id: Option<String>,
    pub api_key: Option<SecretBox<String>>,
    /// Ask the backend to stream synthesized audio alongside text
    pub include_audio: bool,
    /// Opaque settings forwarded with every message
    pub configuration: Map<String, Value>,
    pub connect_timeout: Duration,
    pub event_capacity: usize,
    pub max_message_bytes: usize,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: Url::parse("ws://127.0.0.1:8000/ws/chat").expect("static URL is valid"),
            user_id: "anonymous".to_string(),
            session_id: None,
            api_key: None,
            include_audio: true,
            configuration: Map::new(),
            connect_timeout: Duration::from_secs(10),
            event_capacity: 256,
            max_message_bytes: 16 * 1024 * 1024,
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: Url, user_id: impl Into<String>) -> Self {
        Self {
            server_url,
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let server_url = env::var("CHAT_SERVER_URL")
            .map_err(|_| ConfigError::MissingEnvVar("CHAT_SERVER_URL".to_string()))?;
        let mut config = Self::new(Url::parse(&server_url)?, "anonymous");

        if let Ok(user_id) = env::var("CHAT_USER_ID") {
            config.user_id = user_id;
        }
        config.session_id = env::var("CHAT_SESSION_ID").ok();
        config.api_key = env::var("CHAT_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(|key| SecretBox::new(Box::new(key)));

        if let Some(include_audio) = parse_var::<bool>("CHAT_INCLUDE_AUDIO")? {
            config.include_audio = include_audio;
        }
        if let Some(attempts) = parse_var::<u32>("CHAT_MAX_RECONNECT_ATTEMPTS")? {
            config.reconnect.max_attempts = attempts;
        }
        if let Some(ms) = parse_var::<u64>("CHAT_PING_INTERVAL_MS")? {
            config.heartbeat.ping_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("CHAT_PONG_TIMEOUT_MS")? {
            config.heartbeat.pong_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the client cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.server_url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(invalid(
                    "server_url",
                    format!("unsupported scheme '{}', expected ws or wss", other),
                ))
            }
        }
        if self.user_id.trim().is_empty() {
            return Err(invalid("user_id", "cannot be empty"));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(invalid("max_attempts", "must be at least 1"));
        }
        if self.reconnect.base_delay > self.reconnect.max_delay {
            return Err(invalid("base_delay", "cannot exceed max_delay"));
        }
        if self.heartbeat.ping_interval.is_zero() {
            return Err(invalid("ping_interval", "must be non-zero"));
        }
        if self.event_capacity == 0 {
            return Err(invalid("event_capacity", "must be non-zero"));
        }
        Ok(())
    }

    /// Get the API key (use only when building the upgrade request)
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_ref().map(|key| key.expose_secret().as_str())
    }
}

fn invalid(name: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(name, e.to_string())),
        Err(_) => Ok(None),
    }
}
