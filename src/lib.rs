//! Streaming chat client for a conversational voice backend.
//!
//! [`ChatClient`] keeps one WebSocket session alive across network
//! failures and reports everything that happens on it as [`ChatEvent`]s.

pub mod audio_sink;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod protocol;
pub mod reassembler;
pub mod reconnect;

pub use client::ChatClient;
pub use config::ClientConfig;
pub use error::{ChatError, Result};
pub use events::{ChatEvent, ConnectionState};
