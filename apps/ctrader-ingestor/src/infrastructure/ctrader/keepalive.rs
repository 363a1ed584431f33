//! Keepalive Monitor
//!
//! cTrader drops sockets that stay silent, so the session sends a
//! `ProtoHeartbeatEvent` on a fixed interval. The broker sends its own
//! heartbeats too; if nothing at all arrives for `inbound_timeout` the
//! connection is considered dead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Configuration for keepalive behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Interval between outbound heartbeats.
    pub interval: Duration,
    /// Silence after which the connection is considered dead.
    pub inbound_timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            inbound_timeout: Duration::from_secs(45),
        }
    }
}

impl KeepaliveConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(interval: Duration, inbound_timeout: Duration) -> Self {
        Self {
            interval,
            inbound_timeout,
        }
    }
}

/// Events emitted by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveEvent {
    /// Send a heartbeat now.
    SendHeartbeat,
    /// Nothing received for too long.
    Timeout(Duration),
}

/// Inbound activity shared between the session and the monitor.
#[derive(Debug)]
pub struct KeepaliveState {
    last_inbound: RwLock<Instant>,
}

impl Default for KeepaliveState {
    fn default() -> Self {
        Self::new()
    }
}

impl KeepaliveState {
    /// Create new state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_inbound: RwLock::new(Instant::now()),
        }
    }

    /// Record that a frame was received.
    pub fn record_inbound(&self) {
        *self.last_inbound.write() = Instant::now();
    }

    /// Time since the last received frame.
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.last_inbound.read().elapsed()
    }
}

/// Periodically requests heartbeats and watches for silence.
pub struct KeepaliveMonitor {
    config: KeepaliveConfig,
    state: Arc<KeepaliveState>,
    event_tx: mpsc::Sender<KeepaliveEvent>,
    cancel: CancellationToken,
}

impl KeepaliveMonitor {
    /// Create a new monitor.
    #[must_use]
    pub const fn new(
        config: KeepaliveConfig,
        state: Arc<KeepaliveState>,
        event_tx: mpsc::Sender<KeepaliveEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the event channel closes, or a timeout fires.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Keepalive monitor cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if !self.check_and_send().await {
                        break;
                    }
                }
            }
        }
    }

    async fn check_and_send(&self) -> bool {
        let silence = self.state.silence();
        if silence > self.config.inbound_timeout {
            tracing::warn!(
                silence_secs = silence.as_secs(),
                timeout_secs = self.config.inbound_timeout.as_secs(),
                "No inbound traffic, connection considered dead"
            );
            let _ = self.event_tx.send(KeepaliveEvent::Timeout(silence)).await;
            return false;
        }

        if self.event_tx.send(KeepaliveEvent::SendHeartbeat).await.is_err() {
            tracing::debug!("Session gone, stopping keepalive");
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = KeepaliveConfig::default();
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.inbound_timeout, Duration::from_secs(45));
    }

    #[test]
    fn state_records_inbound() {
        let state = KeepaliveState::new();
        *state.last_inbound.write() = Instant::now()
            .checked_sub(Duration::from_secs(5))
            .unwrap();
        assert!(state.silence() >= Duration::from_secs(5));

        state.record_inbound();
        assert!(state.silence() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn monitor_requests_heartbeats() {
        let config = KeepaliveConfig::new(Duration::from_millis(50), Duration::from_secs(1));
        let state = Arc::new(KeepaliveState::new());
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(KeepaliveMonitor::new(config, state, event_tx, cancel.clone()).run());

        let event = tokio::time::timeout(Duration::from_millis(500), event_rx.recv())
            .await
            .expect("should receive event")
            .expect("channel should not close");
        assert_eq!(event, KeepaliveEvent::SendHeartbeat);

        cancel.cancel();
        handle.await.expect("task should complete");
    }

    #[tokio::test]
    async fn monitor_detects_silence() {
        let config = KeepaliveConfig::new(Duration::from_millis(50), Duration::from_millis(100));
        let state = Arc::new(KeepaliveState::new());
        *state.last_inbound.write() = Instant::now()
            .checked_sub(Duration::from_millis(500))
            .unwrap();
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(KeepaliveMonitor::new(config, state, event_tx, cancel).run());

        let event = tokio::time::timeout(Duration::from_millis(500), event_rx.recv())
            .await
            .expect("should receive event")
            .expect("channel should not close");
        assert!(matches!(event, KeepaliveEvent::Timeout(_)));

        // the monitor exits on its own after a timeout
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("monitor should stop")
            .expect("task should complete");
    }

    #[tokio::test]
    async fn monitor_cancellation() {
        let config = KeepaliveConfig::new(Duration::from_secs(10), Duration::from_secs(10));
        let (event_tx, _event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            KeepaliveMonitor::new(config, Arc::new(KeepaliveState::new()), event_tx, cancel.clone())
                .run(),
        );
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_millis(100), handle).await;
        assert!(result.is_ok(), "monitor should shut down on cancellation");
    }
}
