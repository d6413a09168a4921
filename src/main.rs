use anyhow::Context;
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use url::Url;
use voice_chat_client::audio_sink::AudioSink;
use voice_chat_client::{ChatClient, ChatEvent, ClientConfig};

/// Interactive terminal client for the voice chat backend
#[derive(Parser, Debug)]
#[command(name = "voice-chat", version, about)]
struct Args {
    /// WebSocket endpoint, e.g. ws://localhost:8000/ws/chat
    #[arg(long, env = "CHAT_SERVER_URL")]
    url: Option<String>,

    #[arg(long, env = "CHAT_USER_ID")]
    user_id: Option<String>,

    /// Ask for text only
    #[arg(long)]
    no_audio: bool,

    #[arg(long)]
    max_attempts: Option<u32>,
}

fn build_config(args: &Args) -> anyhow::Result<ClientConfig> {
    let mut config = match &args.url {
        Some(url) => {
            let url = Url::parse(url).with_context(|| format!("invalid server URL '{}'", url))?;
            ClientConfig::new(url, "anonymous")
        }
        None => ClientConfig::from_env().context("failed to load configuration")?,
    };

    if let Some(user_id) = &args.user_id {
        config.user_id = user_id.clone();
    }
    if args.no_audio {
        config.include_audio = false;
    }
    if let Some(attempts) = args.max_attempts {
        config.reconnect.max_attempts = attempts;
    }
    Ok(config)
}

#[cfg(feature = "playback")]
fn audio_sink() -> anyhow::Result<Arc<dyn AudioSink>> {
    let sink = voice_chat_client::audio_sink::CpalSink::new().context("audio output failed")?;
    Ok(Arc::new(sink))
}

#[cfg(not(feature = "playback"))]
fn audio_sink() -> anyhow::Result<Arc<dyn AudioSink>> {
    // Without playback, finished turns are not kept around
    let sink = voice_chat_client::audio_sink::BufferedSink::default().with_max_turns(0);
    Ok(Arc::new(sink))
}

/// Renders events to the terminal, keeping a streamed reply on one line
#[derive(Default)]
struct Printer {
    in_response: bool,
}

impl Printer {
    fn print(&mut self, event: &ChatEvent) {
        if self.in_response && !event.is_content() && !event.is_turn_terminator() {
            println!();
            self.in_response = false;
        }
        match event {
            ChatEvent::ConnectionStateChanged { state } if state.is_transitioning() => {
                println!("⏳ [{}]", state)
            }
            ChatEvent::ConnectionStateChanged { state } => println!("🔌 [{}]", state),
            ChatEvent::StatusMessageReceived { message } => println!("ℹ️  {}", message),
            ChatEvent::TextChunkReceived { chunk } => {
                print!("{}", chunk);
                let _ = std::io::stdout().flush();
            }
            ChatEvent::AudioChunkReceived { bytes } => log::debug!("🔊 {} audio bytes", bytes.len()),
            ChatEvent::ResponseCompleted => println!(),
            ChatEvent::ResponseInterrupted => println!("\n⏹️  (interrupted)"),
            ChatEvent::ErrorOccurred { message } => println!("❌ {}", message),
        }
        if event.is_content() {
            self.in_response = true;
        } else if event.is_turn_terminator() {
            self.in_response = false;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    log::info!("🚀 Starting voice-chat client");

    let args = Args::parse();
    let config = build_config(&args)?;
    println!("📡 Server: {} (user {})", config.server_url, config.user_id);

    let client = ChatClient::new(config)?.with_audio_sink(audio_sink()?);

    let mut events = Box::pin(client.events());
    let printer = tokio::spawn(async move {
        let mut printer = Printer::default();
        while let Some(event) = events.next().await {
            printer.print(&event);
        }
    });

    if !client.connect().await? {
        println!("⚠️  Could not connect; type /reconnect to try again");
    }
    println!("💬 Type a message and press Enter. /reconnect, /quit or Ctrl+C to exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/reconnect" => {
                        client.disconnect().await?;
                        client.connect().await?;
                    }
                    text => client.send(text).await?,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    client.shutdown().await?;
    let _ = printer.await;
    println!("\n👋 Goodbye!");
    Ok(())
}
