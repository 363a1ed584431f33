//! cTrader Ingestor Binary
//!
//! Streams live spot quotes from the cTrader Open API into Redis and keeps
//! a liveness heartbeat fresh while the stream runs.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin ctrader-ingestor
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `CTRADER_CLIENT_ID`, `CTRADER_CLIENT_SECRET`: Open API application
//! - `CTRADER_ACCESS_TOKEN`: OAuth access token
//! - `CTRADER_ACCOUNT_ID`: Trading account id (digits are extracted)
//!
//! ## Optional
//! - `CTRADER_ENV`: demo | live (default: demo)
//! - `CTRADER_HOST`, `CTRADER_PORT`, `CTRADER_TLS`: Endpoint overrides
//! - `CTRADER_SYMBOLS`: Comma-separated symbols (default: eight FX majors)
//! - `CTRADER_SYMBOL_ALIASES`: `CALLER=BROKER` pairs, comma-separated
//! - `REDIS_HOST`, `REDIS_PORT`: Redis (default: localhost:6379)
//! - `INGESTOR_HEARTBEAT_KEY`: Heartbeat key (default: service:ingestor:heartbeat)
//! - `INGESTOR_HEARTBEAT_INTERVAL_SECS`, `INGESTOR_HEARTBEAT_TTL_SECS`: 5 / 30
//! - `INGESTOR_METRICS_PORT`: Prometheus port, 0 disables (default: 9091)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use anyhow::Context;
use ctrader_ingestor::application::services::{
    ForwarderExit, LivenessReporter, RestartPolicy, SpotForwarder,
};
use ctrader_ingestor::infrastructure::metrics;
use ctrader_ingestor::infrastructure::redis::{
    self as redis_sink, RedisHeartbeatSink, RedisTickSink,
};
use ctrader_ingestor::infrastructure::telemetry;
use ctrader_ingestor::{CTraderClient, ClientEvent, IngestorConfig};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Client event buffer; ticks queue here while a sink write is slow.
const EVENT_BUFFER: usize = 4096;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let _telemetry_guard = telemetry::init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting cTrader ingestor");

    let config = IngestorConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    if config.metrics_port != 0 {
        let addr = metrics::init_metrics(config.metrics_port)
            .context("failed to start metrics exporter")?;
        tracing::info!(addr = %addr, "Metrics exporter listening");
    }

    let redis = redis_sink::connect(&config.redis.host, config.redis.port).await?;
    let tick_sink = Arc::new(RedisTickSink::new(redis.clone()));
    let heartbeat_sink = Arc::new(RedisHeartbeatSink::new(redis));

    let shutdown = CancellationToken::new();
    tokio::spawn(await_shutdown(shutdown.clone()));

    let (event_tx, mut event_rx) = mpsc::channel::<ClientEvent>(EVENT_BUFFER);
    let client = CTraderClient::new(config.to_client_config(), event_tx);
    let forwarder = SpotForwarder::new(tick_sink);
    let liveness = Arc::new(LivenessReporter::new(heartbeat_sink, config.heartbeat.clone()));
    let mut restart = RestartPolicy::new(config.restart);

    let result = loop {
        if shutdown.is_cancelled() {
            break Ok(());
        }

        match client.connect().await {
            Ok(()) => {
                restart.reset();
                let exit = stream(
                    &client,
                    &config,
                    &forwarder,
                    &liveness,
                    &mut event_rx,
                    &shutdown,
                )
                .await;
                match exit {
                    Ok(ForwarderExit::Disconnected(reason)) => {
                        tracing::warn!(reason = %reason, "Session lost");
                    }
                    Ok(ForwarderExit::Cancelled | ForwarderExit::ChannelClosed) => break Ok(()),
                    Err(e) => {
                        tracing::error!(error = %e, "Subscribe failed");
                        // leftovers from the dead session must not end the next one
                        while event_rx.try_recv().is_ok() {}
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to connect to cTrader"),
        }

        client.disconnect().await;
        metrics::record_restart();

        let Some(delay) = restart.next_delay() else {
            break Err(anyhow::anyhow!(
                "giving up after {} restart attempts",
                restart.attempt_count()
            ));
        };
        tracing::info!(
            attempt = restart.attempt_count(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Restarting session"
        );

        tokio::select! {
            () = shutdown.cancelled() => break Ok(()),
            () = tokio::time::sleep(delay) => {}
        }
    };

    client.disconnect().await;
    tracing::info!(
        forwarded = forwarder.stats().forwarded(),
        failed = forwarder.stats().failed(),
        "cTrader ingestor stopped"
    );
    result
}

/// Subscribe and forward ticks until the session ends, with the liveness
/// heartbeat running alongside.
async fn stream(
    client: &CTraderClient,
    config: &IngestorConfig,
    forwarder: &SpotForwarder,
    liveness: &Arc<LivenessReporter>,
    events: &mut mpsc::Receiver<ClientEvent>,
    shutdown: &CancellationToken,
) -> Result<ForwarderExit, ctrader_ingestor::ClientError> {
    client.subscribe(config.symbols.iter().cloned()).await?;

    let heartbeat = shutdown.child_token();
    let liveness_task = tokio::spawn({
        let liveness = Arc::clone(liveness);
        let heartbeat = heartbeat.clone();
        async move { liveness.run(heartbeat).await }
    });

    let exit = forwarder.run(events, shutdown).await;

    heartbeat.cancel();
    if let Err(e) = liveness_task.await {
        tracing::warn!(error = %e, "Liveness task failed");
    }
    Ok(exit)
}

/// Load .env from the current directory or the nearest ancestor.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &IngestorConfig) {
    tracing::info!(
        environment = config.broker.environment.as_str(),
        endpoint = %config.endpoint(),
        account_id = config.credentials.account_id(),
        symbols = ?config.symbols,
        metrics_port = config.metrics_port,
        "Configuration loaded"
    );
    tracing::debug!(
        redis_host = %config.redis.host,
        redis_port = config.redis.port,
        heartbeat_key = %config.heartbeat.key,
        "Sink settings"
    );
}

/// Wait for Ctrl+C or SIGTERM, then cancel `shutdown`.
async fn await_shutdown(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }

    shutdown.cancel();
}
