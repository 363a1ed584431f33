//! cTrader Symbol Dump
//!
//! Connects once, lists every symbol the account can see and writes them
//! to a JSON file sorted by name.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin ctrader-dump-symbols -- [output.json]
//! ```
//!
//! Reads the same `CTRADER_*` variables as the ingestor. The output path
//! defaults to `ctrader_symbols_dump.json`.

use anyhow::Context;
use ctrader_ingestor::application::services::{DEFAULT_DUMP_PATH, write_symbol_dump};
use ctrader_ingestor::infrastructure::telemetry::{self, TelemetryConfig};
use ctrader_ingestor::{CTraderClient, IngestorConfig};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let _telemetry_guard = telemetry::init_with_config(TelemetryConfig {
        enabled: false,
        ..TelemetryConfig::from_env()
    });

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_DUMP_PATH.to_string());

    let config = IngestorConfig::from_env().context("invalid configuration")?;
    let (event_tx, _event_rx) = mpsc::channel(16);
    let client = CTraderClient::new(config.to_client_config(), event_tx);

    tracing::info!(endpoint = %config.endpoint(), "Connecting");
    client.connect().await.context("failed to connect")?;

    let symbols = client.fetch_all_symbols().await;
    client.disconnect().await;
    let symbols = symbols.context("failed to list symbols")?;

    let count = write_symbol_dump(&path, symbols)?;
    println!("Wrote {count} symbols to {path}");
    Ok(())
}
