use crate::error::{ChatError, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::header::{HeaderValue, AUTHORIZATION};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// One read from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Chunk { data: Vec<u8>, end_of_message: bool },
    /// The peer closed the connection
    Closed,
}

/// A live bidirectional connection to the backend.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    /// Send one complete text frame
    async fn send_frame(&self, frame: Vec<u8>) -> Result<()>;

    /// Read the next chunk of an inbound message
    async fn receive_chunk(&self) -> Result<Received>;

    /// Close the connection; safe to call more than once
    async fn close(&self);

    fn is_open(&self) -> bool;

    /// Cancelled once the connection is closed for any reason
    fn lifetime(&self) -> CancellationToken;
}

/// Opens connections; the seam that lets tests substitute the transport.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &Url) -> Result<Arc<dyn Connection>>;
}

/// Opens WebSocket connections with tokio-tungstenite
pub struct WsConnector {
    api_key: Option<String>,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            api_key: None,
            connect_timeout,
        }
    }

    /// Send the key as a bearer token on the upgrade request
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &Url) -> Result<Arc<dyn Connection>> {
        let mut request = url.as_str().into_client_request()?;
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| ChatError::InvalidHeader(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        log::info!("📡 Connecting to chat server at {}", url);
        let (ws_stream, response) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| ChatError::Timeout(self.connect_timeout))??;
        log::info!("✅ WebSocket connected, status: {}", response.status());

        Ok(Arc::new(WsConnection::new(ws_stream)))
    }
}

/// WebSocket transport. Each inbound WebSocket message arrives as a single
/// chunk marked as the end of its message.
pub struct WsConnection {
    sink: Mutex<WsSink>,
    source: Mutex<WsSource>,
    open: AtomicBool,
    lifetime: CancellationToken,
}

impl WsConnection {
    pub fn new(ws_stream: WsStream) -> Self {
        let (sink, source) = ws_stream.split();
        Self {
            sink: Mutex::new(sink),
            source: Mutex::new(source),
            open: AtomicBool::new(true),
            lifetime: CancellationToken::new(),
        }
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
        self.lifetime.cancel();
    }

    async fn send_message(&self, message: Message) -> Result<()> {
        if !self.is_open() {
            return Err(ChatError::ConnectionClosed);
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(message).await {
            log::warn!("❌ WebSocket write error: {}", e);
            self.mark_closed();
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Connection for WsConnection {
    async fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        let text = String::from_utf8(frame).map_err(|e| {
            ChatError::Serialization(serde::ser::Error::custom(format!(
                "frame is not valid UTF-8: {}",
                e
            )))
        })?;
        self.send_message(Message::Text(text.into())).await
    }

    async fn receive_chunk(&self) -> Result<Received> {
        loop {
            if !self.is_open() {
                return Ok(Received::Closed);
            }

            let next = {
                let mut source = self.source.lock().await;
                source.next().await
            };

            match next {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Received::Chunk {
                        data: text.as_bytes().to_vec(),
                        end_of_message: true,
                    })
                }
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Received::Chunk {
                        data: data.to_vec(),
                        end_of_message: true,
                    })
                }
                Some(Ok(Message::Ping(data))) => {
                    log::trace!("🏓 Received transport ping, sending pong");
                    if let Err(e) = self.send_message(Message::Pong(data)).await {
                        log::debug!("Failed to answer transport ping: {}", e);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    log::info!("🔚 Server closed connection: {:?}", frame);
                    self.mark_closed();
                    return Ok(Received::Closed);
                }
                Some(Ok(_)) => {
                    // Transport pongs and raw frames carry nothing for us
                }
                Some(Err(e)) => {
                    log::warn!("❌ WebSocket read error: {}", e);
                    self.mark_closed();
                    return Err(e.into());
                }
                None => {
                    self.mark_closed();
                    return Ok(Received::Closed);
                }
            }
        }
    }

    async fn close(&self) {
        let was_open = self.open.swap(false, Ordering::AcqRel);
        self.lifetime.cancel();
        if was_open {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.close().await {
                log::debug!("WebSocket close failed: {}", e);
            }
            log::info!("🔚 WebSocket closed");
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn lifetime(&self) -> CancellationToken {
        self.lifetime.clone()
    }
}
