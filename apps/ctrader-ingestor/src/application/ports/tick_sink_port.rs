//! Tick Sink Port (Driven Port)
//!
//! Interface for appending live ticks to a durable per-symbol log.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::market_data::Tick;

/// Sink write error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    /// Connection error.
    #[error("sink connection error: {message}")]
    ConnectionError {
        /// Error detail.
        message: String,
    },

    /// Write rejected.
    #[error("sink write failed: {message}")]
    WriteFailed {
        /// Error detail.
        message: String,
    },
}

/// Port for appending ticks.
#[async_trait]
pub trait TickSink: Send + Sync {
    /// Append one tick to the log for its symbol.
    async fn append(&self, tick: &Tick) -> Result<(), SinkError>;
}

/// In-memory tick sink for testing.
#[derive(Debug, Default)]
pub struct InMemoryTickSink {
    ticks: Mutex<Vec<Tick>>,
}

impl InMemoryTickSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything appended so far.
    #[must_use]
    pub fn ticks(&self) -> Vec<Tick> {
        self.ticks.lock().clone()
    }

    /// Ticks appended for one symbol.
    #[must_use]
    pub fn ticks_for(&self, symbol: &str) -> Vec<Tick> {
        self.ticks
            .lock()
            .iter()
            .filter(|tick| tick.symbol == symbol)
            .cloned()
            .collect()
    }

    /// Number of ticks appended.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ticks.lock().len()
    }

    /// Whether nothing was appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ticks.lock().is_empty()
    }
}

#[async_trait]
impl TickSink for InMemoryTickSink {
    async fn append(&self, tick: &Tick) -> Result<(), SinkError> {
        self.ticks.lock().push(tick.clone());
        Ok(())
    }
}
