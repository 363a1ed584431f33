//! Spot Forwarder
//!
//! Drains client events into a [`TickSink`]. One forwarder runs per
//! session; it returns when the session disconnects so the caller can
//! decide whether to restart.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::TickSink;
use crate::infrastructure::ctrader::{ClientEvent, DisconnectReason};
use crate::infrastructure::metrics::{self, SinkKind};

/// Why the forwarder stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwarderExit {
    /// The session reported a disconnect.
    Disconnected(DisconnectReason),
    /// Every event sender was dropped.
    ChannelClosed,
    /// Shutdown was requested.
    Cancelled,
}

/// Counters for a forwarder's lifetime.
#[derive(Debug, Default)]
pub struct ForwarderStats {
    forwarded: AtomicU64,
    failed: AtomicU64,
}

impl ForwarderStats {
    /// Ticks written successfully.
    #[must_use]
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Ticks the sink rejected.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Forwards ticks from client events to a sink.
pub struct SpotForwarder {
    sink: Arc<dyn TickSink>,
    stats: Arc<ForwarderStats>,
}

impl SpotForwarder {
    /// Create a forwarder writing to `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn TickSink>) -> Self {
        Self {
            sink,
            stats: Arc::new(ForwarderStats::default()),
        }
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> Arc<ForwarderStats> {
        Arc::clone(&self.stats)
    }

    /// Forward until the session disconnects, the channel closes or
    /// `cancel` fires. A failed write is logged and the tick dropped.
    pub async fn run(
        &self,
        events: &mut mpsc::Receiver<ClientEvent>,
        cancel: &CancellationToken,
    ) -> ForwarderExit {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return ForwarderExit::Cancelled,
                event = events.recv() => event,
            };

            match event {
                None => return ForwarderExit::ChannelClosed,
                Some(ClientEvent::Tick(tick)) => match self.sink.append(&tick).await {
                    Ok(()) => {
                        self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                        metrics::record_tick_forwarded(&tick.symbol);
                    }
                    Err(e) => {
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        metrics::record_sink_error(SinkKind::Tick);
                        tracing::warn!(symbol = %tick.symbol, error = %e, "Failed to write tick");
                    }
                },
                Some(ClientEvent::Connected) => tracing::debug!("Forwarder saw session connect"),
                Some(ClientEvent::Subscribed { symbols }) => {
                    tracing::debug!(?symbols, "Forwarding spots");
                }
                Some(ClientEvent::Error(message)) => {
                    tracing::warn!(error = %message, "Broker reported an error");
                }
                Some(ClientEvent::Disconnected(reason)) => {
                    tracing::info!(
                        reason = %reason,
                        forwarded = self.stats.forwarded(),
                        "Forwarder stopping"
                    );
                    return ForwarderExit::Disconnected(reason);
                }
            }
        }
    }
}
