//! Session orchestration tests against a scripted in-memory transport

use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use url::Url;
use voice_chat_client::audio_sink::BufferedSink;
use voice_chat_client::connection::{Connection, Connector, Received};
use voice_chat_client::{ChatClient, ChatError, ChatEvent, ClientConfig, ConnectionState, Result};

const GREETING: &str = "Connected to chat server";

fn init_logger() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

/// Client half of an in-memory link. Frames pushed by the test through a
/// [`ServerEnd`] come out of `receive_chunk`.
struct ScriptedConnection {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Received>>,
    inbound_tx: mpsc::UnboundedSender<Received>,
    sent: Mutex<Vec<Value>>,
    pings: AtomicUsize,
    answer_pings: bool,
    /// How long `close` takes to complete
    close_delay: Duration,
    open: AtomicBool,
    lifetime: CancellationToken,
}

#[async_trait::async_trait]
impl Connection for ScriptedConnection {
    async fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        if !self.is_open() {
            return Err(ChatError::ConnectionClosed);
        }
        let value: Value = serde_json::from_slice(&frame)?;
        if value["type"] == "ping" {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.answer_pings {
                let pong = json!({"type": "pong"}).to_string().into_bytes();
                let _ = self.inbound_tx.send(Received::Chunk {
                    data: pong,
                    end_of_message: true,
                });
            }
        } else {
            self.sent.lock().unwrap().push(value);
        }
        Ok(())
    }

    async fn receive_chunk(&self) -> Result<Received> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.lifetime.cancelled() => Ok(Received::Closed),
            next = inbound.recv() => Ok(next.unwrap_or(Received::Closed)),
        }
    }

    async fn close(&self) {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        self.open.store(false, Ordering::SeqCst);
        self.lifetime.cancel();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn lifetime(&self) -> CancellationToken {
        self.lifetime.clone()
    }
}

/// Test-side handle of one scripted connection
#[derive(Clone)]
struct ServerEnd {
    connection: Arc<ScriptedConnection>,
}

impl ServerEnd {
    fn new(answer_pings: bool, close_delay: Duration) -> Self {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let server = Self {
            connection: Arc::new(ScriptedConnection {
                inbound: tokio::sync::Mutex::new(inbound),
                inbound_tx,
                sent: Mutex::new(Vec::new()),
                pings: AtomicUsize::new(0),
                answer_pings,
                close_delay,
                open: AtomicBool::new(true),
                lifetime: CancellationToken::new(),
            }),
        };
        server.send_json(json!({"type": "status", "message": GREETING}));
        server
    }

    fn send_chunk(&self, data: &[u8], end_of_message: bool) {
        let _ = self.connection.inbound_tx.send(Received::Chunk {
            data: data.to_vec(),
            end_of_message,
        });
    }

    fn send_json(&self, value: Value) {
        self.send_chunk(value.to_string().as_bytes(), true);
    }

    fn close(&self) {
        let _ = self.connection.inbound_tx.send(Received::Closed);
    }

    fn messages(&self) -> Vec<Value> {
        self.connection.sent.lock().unwrap().clone()
    }

    fn pings(&self) -> usize {
        self.connection.pings.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.connection.is_open()
    }
}

/// Hands out scripted connections in order; refuses once the script is empty
#[derive(Default)]
struct ScriptedConnector {
    script: Mutex<VecDeque<ServerEnd>>,
    opens: AtomicUsize,
}

impl ScriptedConnector {
    fn accept(&self, answer_pings: bool) -> ServerEnd {
        self.accept_with(answer_pings, Duration::ZERO)
    }

    fn accept_with(&self, answer_pings: bool, close_delay: Duration) -> ServerEnd {
        let server = ServerEnd::new(answer_pings, close_delay);
        self.script.lock().unwrap().push_back(server.clone());
        server
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self, _url: &Url) -> Result<Arc<dyn Connection>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(server) => Ok(server.connection as Arc<dyn Connection>),
            None => Err(ChatError::ConnectionClosed),
        }
    }
}

fn config() -> ClientConfig {
    let mut config = ClientConfig::new(
        Url::parse("ws://chat.test/ws/chat").unwrap(),
        "tester",
    );
    config.reconnect.max_attempts = 3;
    config
}

fn client_with(config: ClientConfig) -> (ChatClient, Arc<ScriptedConnector>) {
    init_logger();
    let connector = Arc::new(ScriptedConnector::default());
    let client = ChatClient::with_connector(config, connector.clone()).unwrap();
    (client, connector)
}

async fn next_event(events: &mut broadcast::Receiver<ChatEvent>) -> ChatEvent {
    tokio::time::timeout(Duration::from_secs(300), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn expect_events(events: &mut broadcast::Receiver<ChatEvent>, expected: Vec<ChatEvent>) {
    for want in expected {
        assert_eq!(next_event(events).await, want);
    }
}

fn connected_sequence(first: ConnectionState) -> Vec<ChatEvent> {
    vec![
        ChatEvent::state(first),
        ChatEvent::StatusMessageReceived {
            message: GREETING.to_string(),
        },
        ChatEvent::state(ConnectionState::Connected),
    ]
}

#[tokio::test(start_paused = true)]
async fn test_text_chunks_arrive_in_order() {
    let (client, connector) = client_with(config());
    let server = connector.accept(true);
    let mut events = client.subscribe();

    assert!(client.connect().await.unwrap());
    expect_events(&mut events, connected_sequence(ConnectionState::Connecting)).await;

    // First message split across two reads
    server.send_chunk(br#"{"type":"text","#, false);
    server.send_chunk(br#""content":"Hel"}"#, true);
    server.send_json(json!({"type": "text", "content": "lo"}));
    server.send_json(json!({"type": "text_delta", "delta": "!"}));
    server.send_json(json!({"type": "done"}));

    expect_events(
        &mut events,
        vec![
            ChatEvent::TextChunkReceived { chunk: "Hel".into() },
            ChatEvent::TextChunkReceived { chunk: "lo".into() },
            ChatEvent::TextChunkReceived { chunk: "!".into() },
            ChatEvent::ResponseCompleted,
        ],
    )
    .await;
    assert_eq!(client.current_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_and_malformed_messages_are_dropped() {
    let (client, connector) = client_with(config());
    let server = connector.accept(true);
    let mut events = client.subscribe();
    assert!(client.connect().await.unwrap());
    expect_events(&mut events, connected_sequence(ConnectionState::Connecting)).await;

    server.send_json(json!({"type": "typing_indicator", "on": true}));
    server.send_chunk(b"not json", true);
    server.send_json(json!({"type": "audio", "data": "%%%"}));
    server.send_json(json!({"type": "error", "message": "model overloaded"}));
    server.send_json(json!({"type": "interrupted"}));

    expect_events(
        &mut events,
        vec![
            ChatEvent::error("model overloaded"),
            ChatEvent::ResponseInterrupted,
        ],
    )
    .await;
    // A server-reported error does not end the session
    assert_eq!(client.current_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_timeout_triggers_reconnect() {
    let mut config = config();
    config.heartbeat.ping_interval = Duration::from_secs(5);
    config.heartbeat.pong_timeout = Duration::from_secs(10);
    let (client, connector) = client_with(config);
    let silent = connector.accept(false);
    let healthy = connector.accept(true);
    let mut events = client.subscribe();

    assert!(client.connect().await.unwrap());
    let connected_at = tokio::time::Instant::now();
    expect_events(&mut events, connected_sequence(ConnectionState::Connecting)).await;

    assert_eq!(
        next_event(&mut events).await,
        ChatEvent::state(ConnectionState::Disconnected)
    );
    let elapsed = connected_at.elapsed();
    assert!(elapsed >= Duration::from_secs(20) && elapsed < Duration::from_secs(21));
    assert_eq!(silent.pings(), 3);
    assert!(!silent.is_open());

    expect_events(&mut events, connected_sequence(ConnectionState::Reconnecting)).await;
    assert_eq!(connector.opens(), 2);
    assert_eq!(client.reconnect_attempts(), 0);

    // The new connection keeps answering pings, so it stays up
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(client.current_state(), ConnectionState::Connected);
    assert!(healthy.pings() >= 10);
}

#[tokio::test(start_paused = true)]
async fn test_server_close_triggers_reconnect() {
    let (client, connector) = client_with(config());
    let first = connector.accept(true);
    let second = connector.accept(true);
    let mut events = client.subscribe();

    assert!(client.connect().await.unwrap());
    expect_events(&mut events, connected_sequence(ConnectionState::Connecting)).await;

    first.send_json(json!({"type": "text", "content": "partial"}));
    first.send_chunk(br#"{"type":"te"#, false);
    first.close();

    assert_eq!(
        next_event(&mut events).await,
        ChatEvent::TextChunkReceived {
            chunk: "partial".into()
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        ChatEvent::state(ConnectionState::Disconnected)
    );
    expect_events(&mut events, connected_sequence(ConnectionState::Reconnecting)).await;

    // The cut-off message never resurfaces on the new connection
    second.send_json(json!({"type": "text", "content": "fresh"}));
    assert_eq!(
        next_event(&mut events).await,
        ChatEvent::TextChunkReceived {
            chunk: "fresh".into()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_simultaneous_failures_recover_once() {
    let (client, connector) = client_with(config());
    let first = connector.accept(true);
    connector.accept(true);
    let mut events = client.subscribe();
    assert!(client.connect().await.unwrap());
    expect_events(&mut events, connected_sequence(ConnectionState::Connecting)).await;

    // The link drops and a send fails on it before the receive loop reacts
    first.connection.close().await;
    client.send("hello").await.unwrap();

    let mut expected = vec![ChatEvent::error("Failed to send message: Connection closed")];
    expected.push(ChatEvent::state(ConnectionState::Disconnected));
    expected.extend(connected_sequence(ConnectionState::Reconnecting));
    expect_events(&mut events, expected).await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.opens(), 2);
    assert!(events.try_recv().is_err());
    assert_eq!(client.current_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_reconnect_backoff() {
    let (client, connector) = client_with(config());
    let server = connector.accept(true);
    let mut events = client.subscribe();
    assert!(client.connect().await.unwrap());
    expect_events(&mut events, connected_sequence(ConnectionState::Connecting)).await;

    server.close();
    expect_events(
        &mut events,
        vec![
            ChatEvent::state(ConnectionState::Disconnected),
            ChatEvent::state(ConnectionState::Reconnecting),
        ],
    )
    .await;

    // The first reconnect attempt is refused; the next one would be at 2s
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(connector.opens(), 2);

    client.disconnect().await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        ChatEvent::state(ConnectionState::Disconnected)
    );

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.opens(), 2);
    assert!(events.try_recv().is_err());
    assert_eq!(client.current_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_attempts() {
    let (client, connector) = client_with(config());
    let mut events = client.subscribe();

    assert!(!client.connect().await.unwrap());
    assert_eq!(connector.opens(), 3);

    expect_events(
        &mut events,
        vec![
            ChatEvent::state(ConnectionState::Connecting),
            ChatEvent::state(ConnectionState::Reconnecting),
        ],
    )
    .await;
    match next_event(&mut events).await {
        ChatEvent::ErrorOccurred { message } => assert!(message.contains("3 attempts")),
        other => panic!("expected error event, got {:?}", other),
    }
    assert_eq!(
        next_event(&mut events).await,
        ChatEvent::state(ConnectionState::Disconnected)
    );

    // Nothing else is attempted afterwards
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.opens(), 3);
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_retry_delays_grow() {
    let mut config = config();
    config.reconnect.max_attempts = 4;
    let (client, connector) = client_with(config);

    let started = tokio::time::Instant::now();
    assert!(!client.connect().await.unwrap());

    // 2s + 4s + 8s of backoff between four attempts
    assert_eq!(connector.opens(), 4);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(14) && elapsed < Duration::from_secs(15));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_backoff_stops_retries() {
    let mut config = config();
    config.reconnect.max_attempts = 5;
    let (client, connector) = client_with(config);
    let client = Arc::new(client);

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };

    // Second attempt fails at 2s, the next one would be at 6s
    tokio::time::sleep(Duration::from_secs(3)).await;
    let opens = connector.opens();
    assert_eq!(opens, 2);

    client.disconnect().await.unwrap();
    assert!(!connecting.await.unwrap().unwrap());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.opens(), opens);
    assert_eq!(client.current_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let (client, connector) = client_with(config());
    let server = connector.accept(true);
    let mut events = client.subscribe();
    assert!(client.connect().await.unwrap());
    expect_events(&mut events, connected_sequence(ConnectionState::Connecting)).await;

    client.disconnect().await.unwrap();
    client.disconnect().await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        ChatEvent::state(ConnectionState::Disconnected)
    );
    assert!(!server.is_open());

    // No automatic reconnect after an explicit disconnect
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_when_connected_is_noop() {
    let (client, connector) = client_with(config());
    connector.accept(true);

    assert!(client.connect().await.unwrap());
    assert!(client.connect().await.unwrap());
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_disconnect() {
    let (client, connector) = client_with(config());
    connector.accept(true);
    connector.accept(true);
    let mut events = client.subscribe();

    assert!(client.connect().await.unwrap());
    client.disconnect().await.unwrap();
    assert!(client.connect().await.unwrap());

    let mut expected = connected_sequence(ConnectionState::Connecting);
    expected.push(ChatEvent::state(ConnectionState::Disconnected));
    expected.extend(connected_sequence(ConnectionState::Connecting));
    expect_events(&mut events, expected).await;
    assert_eq!(connector.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_send_message() {
    let mut config = config();
    config.session_id = Some("session-1".to_string());
    config
        .configuration
        .insert("voice".to_string(), json!("alloy"));
    let (client, connector) = client_with(config);
    let sink = Arc::new(BufferedSink::default());
    let client = client.with_audio_sink(sink.clone());
    let server = connector.accept(true);

    assert!(client.connect().await.unwrap());
    client
        .send_with_context("Hello there", json!({"page": "home"}))
        .await
        .unwrap();

    let messages = server.messages();
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    assert_eq!(message["type"], "message");
    assert_eq!(message["message"], "Hello there");
    assert_eq!(message["user_id"], "tester");
    assert_eq!(message["session_id"], "session-1");
    assert_eq!(message["include_audio"], true);
    assert_eq!(message["configuration"]["voice"], "alloy");
    assert_eq!(message["context"]["page"], "home");
    assert!(message["timestamp"].is_i64());

    // Each new message starts a fresh audio turn
    assert_eq!(sink.reset_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_while_disconnected_reports_error() {
    let (client, connector) = client_with(config());
    let mut events = client.subscribe();

    client.send("anyone there?").await.unwrap();

    match next_event(&mut events).await {
        ChatEvent::ErrorOccurred { message } => assert!(message.contains("not connected")),
        other => panic!("expected error event, got {:?}", other),
    }
    assert_eq!(connector.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_audio_is_routed_to_sink() {
    let (client, connector) = client_with(config());
    let sink = Arc::new(BufferedSink::default());
    let client = client.with_audio_sink(sink.clone());
    let server = connector.accept(true);
    let mut events = client.subscribe();
    assert!(client.connect().await.unwrap());
    expect_events(&mut events, connected_sequence(ConnectionState::Connecting)).await;

    server.send_json(json!({"type": "audio", "data": "AQID"}));
    server.send_json(json!({"type": "audio_delta", "audio": "BAU="}));
    server.send_json(json!({"type": "done"}));
    server.send_json(json!({"type": "audio", "data": "Bg=="}));
    server.send_json(json!({"type": "interrupted"}));

    expect_events(
        &mut events,
        vec![
            ChatEvent::AudioChunkReceived {
                bytes: vec![1, 2, 3],
            },
            ChatEvent::AudioChunkReceived { bytes: vec![4, 5] },
            ChatEvent::ResponseCompleted,
            ChatEvent::AudioChunkReceived { bytes: vec![6] },
            ChatEvent::ResponseInterrupted,
        ],
    )
    .await;

    assert_eq!(sink.completed_turns(), vec![vec![1, 2, 3, 4, 5]]);
    assert_eq!(sink.cleared_bytes(), 1);
    assert_eq!(sink.pending_bytes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_ends_event_stream() {
    let (client, connector) = client_with(config());
    let server = connector.accept(true);
    let mut stream = Box::pin(client.events());

    assert!(client.connect().await.unwrap());
    client.shutdown().await.unwrap();

    let mut received = Vec::new();
    while let Some(event) = stream.next().await {
        received.push(event);
    }
    assert_eq!(
        received.last(),
        Some(&ChatEvent::state(ConnectionState::Disconnected))
    );
    assert_eq!(received.len(), 4);
    assert!(!server.is_open());

    assert!(matches!(client.connect().await, Err(ChatError::Disposed)));
    assert!(matches!(client.disconnect().await, Err(ChatError::Disposed)));
}

#[tokio::test(start_paused = true)]
async fn test_connect_rejected_while_shutting_down() {
    let (client, connector) = client_with(config());
    let server = connector.accept_with(true, Duration::from_secs(5));
    assert!(client.connect().await.unwrap());
    let client = Arc::new(client);

    let shutting_down = {
        let client = client.clone();
        tokio::spawn(async move { client.shutdown().await })
    };

    // Shutdown is still waiting on the connection to close
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(server.is_open());
    assert!(matches!(client.connect().await, Err(ChatError::Disposed)));
    assert!(matches!(client.send("late").await, Err(ChatError::Disposed)));

    shutting_down.await.unwrap().unwrap();
    assert!(!server.is_open());
    assert_eq!(connector.opens(), 1);
    assert_eq!(client.current_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_client_closes_connection() {
    let (client, connector) = client_with(config());
    let server = connector.accept(true);
    assert!(client.connect().await.unwrap());

    drop(client);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(!server.is_open());
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_subscriber_loses_oldest_events() {
    let mut config = config();
    config.event_capacity = 4;
    let (client, connector) = client_with(config);
    let server = connector.accept(true);
    let mut events = client.subscribe();
    assert!(client.connect().await.unwrap());

    for i in 0..10 {
        server.send_json(json!({"type": "text", "content": i.to_string()}));
    }
    server.send_json(json!({"type": "done"}));
    tokio::time::sleep(Duration::from_millis(10)).await;

    // 3 connect events + 11 content events through a 4-slot buffer
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Lagged(10))
    ));
    let mut retained = Vec::new();
    while let Ok(event) = events.try_recv() {
        retained.push(event);
    }
    assert_eq!(
        retained,
        vec![
            ChatEvent::TextChunkReceived { chunk: "7".into() },
            ChatEvent::TextChunkReceived { chunk: "8".into() },
            ChatEvent::TextChunkReceived { chunk: "9".into() },
            ChatEvent::ResponseCompleted,
        ]
    );
    // The producer never waited on the slow subscriber
    assert_eq!(client.current_state(), ConnectionState::Connected);
}
