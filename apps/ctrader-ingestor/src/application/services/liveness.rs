//! Liveness Reporter
//!
//! Writes a self-expiring heartbeat record on a fixed interval so an
//! external watchdog can tell the ingestor is alive. The record is an
//! RFC 3339 timestamp of the write.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;

use crate::application::ports::HeartbeatSink;
use crate::infrastructure::metrics::{self, SinkKind};

/// Default heartbeat key.
pub const DEFAULT_HEARTBEAT_KEY: &str = "service:ingestor:heartbeat";

/// Heartbeat schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Key the record is written under.
    pub key: String,
    /// Time between writes.
    pub interval: Duration,
    /// Expiry set on each write.
    pub expiry: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            key: DEFAULT_HEARTBEAT_KEY.to_string(),
            interval: Duration::from_secs(5),
            expiry: Duration::from_secs(30),
        }
    }
}

/// Periodic heartbeat writer.
pub struct LivenessReporter {
    sink: Arc<dyn HeartbeatSink>,
    config: LivenessConfig,
}

impl LivenessReporter {
    /// Create a reporter.
    #[must_use]
    pub fn new(sink: Arc<dyn HeartbeatSink>, config: LivenessConfig) -> Self {
        Self { sink, config }
    }

    /// Write one heartbeat now. Failures are logged, never returned.
    pub async fn beat(&self) {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        match self
            .sink
            .beat(&self.config.key, &now, self.config.expiry)
            .await
        {
            Ok(()) => {
                metrics::record_heartbeat_written();
                tracing::trace!(key = %self.config.key, "Heartbeat written");
            }
            Err(e) => {
                metrics::record_sink_error(SinkKind::Heartbeat);
                tracing::warn!(key = %self.config.key, error = %e, "Failed to write heartbeat");
            }
        }
    }

    /// Write a heartbeat every interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.beat().await,
            }
        }
        tracing::debug!("Liveness reporter stopped");
    }
}
