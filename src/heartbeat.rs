use crate::config::HeartbeatConfig;
use crate::connection::Connection;
use crate::protocol;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Why the heartbeat loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatExit {
    Cancelled,
    /// No acknowledgment within `ping_interval + pong_timeout`
    Dead,
}

/// Sends liveness pings and watches for their acknowledgments.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    ping_interval: Duration,
    pong_timeout: Duration,
    last_ack: Mutex<Instant>,
}

impl HeartbeatMonitor {
    /// The acknowledgment clock starts now, at connect time
    pub fn new(config: &HeartbeatConfig) -> Self {
        Self {
            ping_interval: config.ping_interval,
            pong_timeout: config.pong_timeout,
            last_ack: Mutex::new(Instant::now()),
        }
    }

    pub fn record_ack(&self) {
        *self.last_ack.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        log::trace!("💓 Heartbeat acknowledged");
    }

    pub fn last_ack(&self) -> Instant {
        *self.last_ack.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Longest silence tolerated before the link is declared dead
    pub fn staleness_limit(&self) -> Duration {
        self.pong_timeout + self.ping_interval
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_ack()) > self.staleness_limit()
    }

    /// Ping every `ping_interval` until cancelled or the link goes stale.
    ///
    /// A failed ping is only logged; the next staleness check decides
    /// whether the link is really gone.
    pub async fn run(&self, connection: &dyn Connection, cancel: CancellationToken) -> HeartbeatExit {
        let mut ticker = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return HeartbeatExit::Cancelled,
                _ = ticker.tick() => {}
            }

            let silence = Instant::now().saturating_duration_since(self.last_ack());
            if silence > self.staleness_limit() {
                log::warn!(
                    "💔 No heartbeat acknowledgment for {:?} (limit {:?})",
                    silence,
                    self.staleness_limit()
                );
                return HeartbeatExit::Dead;
            }

            let frame = match protocol::encode_ping() {
                Ok(frame) => frame,
                Err(e) => {
                    log::error!("Failed to encode ping: {}", e);
                    continue;
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return HeartbeatExit::Cancelled,
                result = connection.send_frame(frame) => match result {
                    Ok(()) => log::debug!("💓 Ping sent"),
                    Err(e) => log::debug!("Ping send failed: {}", e),
                },
            }
        }
    }
}
