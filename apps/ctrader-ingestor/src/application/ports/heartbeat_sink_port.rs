//! Heartbeat Sink Port (Driven Port)
//!
//! Interface for writing a liveness marker that expires on its own.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::SinkError;

/// Port for writing liveness heartbeats.
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    /// Set `key` to `value`, expiring after `expiry`.
    async fn beat(&self, key: &str, value: &str, expiry: Duration) -> Result<(), SinkError>;
}

/// In-memory heartbeat sink for testing.
///
/// Keeps the latest value per key and counts writes; expiry is recorded,
/// not enforced.
#[derive(Debug, Default)]
pub struct InMemoryHeartbeatSink {
    entries: Mutex<HashMap<String, (String, Duration)>>,
    writes: Mutex<usize>,
}

impl InMemoryHeartbeatSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest value and expiry written for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<(String, Duration)> {
        self.entries.lock().get(key).cloned()
    }

    /// Total number of writes.
    #[must_use]
    pub fn writes(&self) -> usize {
        *self.writes.lock()
    }
}

#[async_trait]
impl HeartbeatSink for InMemoryHeartbeatSink {
    async fn beat(&self, key: &str, value: &str, expiry: Duration) -> Result<(), SinkError> {
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_string(), expiry));
        *self.writes.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_sink_keeps_latest_value() {
        let sink = InMemoryHeartbeatSink::new();
        sink.beat("k", "a", Duration::from_secs(30)).await.unwrap();
        sink.beat("k", "b", Duration::from_secs(30)).await.unwrap();

        assert_eq!(sink.get("k"), Some(("b".to_string(), Duration::from_secs(30))));
        assert_eq!(sink.writes(), 2);
        assert!(sink.get("other").is_none());
    }
}
