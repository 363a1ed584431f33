//! Redis Sink Adapters
//!
//! Implements the sink ports on top of a shared Redis connection:
//!
//! - **Ticks**: `XADD tick:{symbol} * symbol .. price .. [ask ..] timestamp ..`
//! - **Heartbeat**: `SET {key} {value} EX {expiry}`
//!
//! Both adapters hold a [`ConnectionManager`], which reconnects on its own
//! after a dropped connection. A write during an outage fails with
//! [`SinkError::ConnectionError`] and the caller moves on.

use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use redis::aio::ConnectionManager;

use crate::application::ports::{HeartbeatSink, SinkError, TickSink};
use crate::domain::market_data::Tick;

/// Stream key prefix for tick logs.
pub const TICK_STREAM_PREFIX: &str = "tick:";

/// Redis sink error.
#[derive(Debug, thiserror::Error)]
pub enum RedisSinkError {
    /// Could not open the connection.
    #[error("failed to connect to Redis at {url}: {source}")]
    Connect {
        /// Connection URL.
        url: String,
        /// Underlying error.
        #[source]
        source: redis::RedisError,
    },
}

/// Connection URL for `host:port`.
#[must_use]
pub fn redis_url(host: &str, port: u16) -> String {
    format!("redis://{host}:{port}/")
}

/// Open a managed connection.
///
/// # Errors
///
/// Returns an error if the URL is invalid or the first connection fails.
pub async fn connect(host: &str, port: u16) -> Result<ConnectionManager, RedisSinkError> {
    let url = redis_url(host, port);
    let client = redis::Client::open(url.as_str()).map_err(|source| RedisSinkError::Connect {
        url: url.clone(),
        source,
    })?;
    let manager = ConnectionManager::new(client)
        .await
        .map_err(|source| RedisSinkError::Connect {
            url: url.clone(),
            source,
        })?;

    tracing::info!(url = %url, "Connected to Redis");
    Ok(manager)
}

fn sink_error(e: &redis::RedisError) -> SinkError {
    if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() || e.is_timeout() {
        SinkError::ConnectionError {
            message: e.to_string(),
        }
    } else {
        SinkError::WriteFailed {
            message: e.to_string(),
        }
    }
}

// =============================================================================
// Tick Sink
// =============================================================================

/// Appends ticks to one Redis stream per symbol.
#[derive(Clone)]
pub struct RedisTickSink {
    conn: ConnectionManager,
}

impl RedisTickSink {
    /// Wrap a managed connection.
    #[must_use]
    pub const fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

/// Stream key for a symbol.
#[must_use]
pub fn tick_stream_key(symbol: &str) -> String {
    format!("{TICK_STREAM_PREFIX}{symbol}")
}

/// Field/value pairs for a tick's stream entry.
#[must_use]
pub fn tick_fields(tick: &Tick) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("symbol", tick.symbol.clone()),
        ("price", tick.bid.to_string()),
    ];
    if let Some(ask) = tick.ask {
        fields.push(("ask", ask.to_string()));
    }
    fields.push((
        "timestamp",
        tick.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
    ));
    fields
}

#[async_trait]
impl TickSink for RedisTickSink {
    async fn append(&self, tick: &Tick) -> Result<(), SinkError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(tick_stream_key(&tick.symbol)).arg("*");
        for (field, value) in tick_fields(tick) {
            cmd.arg(field).arg(value);
        }

        let _: String = cmd.query_async(&mut conn).await.map_err(|e| sink_error(&e))?;
        Ok(())
    }
}

// =============================================================================
// Heartbeat Sink
// =============================================================================

/// Writes heartbeat keys with an expiry.
#[derive(Clone)]
pub struct RedisHeartbeatSink {
    conn: ConnectionManager,
}

impl RedisHeartbeatSink {
    /// Wrap a managed connection.
    #[must_use]
    pub const fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl HeartbeatSink for RedisHeartbeatSink {
    async fn beat(&self, key: &str, value: &str, expiry: Duration) -> Result<(), SinkError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(expiry.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| sink_error(&e))?;
        Ok(())
    }
}
