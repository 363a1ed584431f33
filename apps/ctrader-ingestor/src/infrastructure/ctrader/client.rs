//! cTrader Open API Client
//!
//! Public face of the protocol client. One [`CTraderClient`] owns at most
//! one live session; the session task owns the socket and all protocol
//! state, and the client talks to it over a command channel.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──app auth──► AppAuthenticated
//!       ▲                                                    │
//!       │                                               account auth
//!       │                                                    ▼
//!       └──── error / disconnect() ◄──── Ready ◄──── AccountAuthenticated
//! ```
//!
//! There is no automatic reconnect. When the session ends every waiting
//! call fails with [`ClientError::Disconnected`], the subscription set is
//! dropped and a single [`ClientEvent::Disconnected`] is emitted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::auth::{AuthError, Credentials};
use super::codec::{BrokerError, CodecError};
use super::keepalive::KeepaliveConfig;
use super::prices::PriceError;
use super::session::{Command, Session, SessionHandle, SessionParams};
use super::transport;
use crate::application::ports::{MarketDataError, MarketDataSource};
use crate::domain::market_data::{Bar, SymbolInfo, Tick};
use crate::domain::symbols::SymbolAliases;

/// Demo environment host.
pub const DEMO_HOST: &str = "demo.ctraderapi.com";

/// Live environment host.
pub const LIVE_HOST: &str = "live.ctraderapi.com";

/// Protobuf API port.
pub const DEFAULT_PORT: u16 = 5035;

const COMMAND_BUFFER: usize = 32;

// =============================================================================
// Error Type
// =============================================================================

/// Errors returned by client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No authenticated session.
    #[error("not connected")]
    NotConnected,

    /// Another history or symbol-list request is in flight.
    #[error("another blocking request is in flight")]
    Busy,

    /// The broker did not answer in time.
    #[error("request timed out")]
    Timeout,

    /// The session ended while waiting.
    #[error("disconnected")]
    Disconnected,

    /// The broker rejected the request.
    #[error("broker error {code}: {}", .description.as_deref().unwrap_or("no description"))]
    Broker {
        /// Error code name.
        code: String,
        /// Description, when sent.
        description: Option<String>,
    },

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// TLS setup failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Invalid arguments.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Bars could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] PriceError),
}

impl From<BrokerError> for ClientError {
    fn from(err: BrokerError) -> Self {
        Self::Broker {
            code: err.code,
            description: err.description,
        }
    }
}

impl From<ClientError> for MarketDataError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Timeout => Self::Timeout,
            ClientError::InvalidRequest(message) => Self::InvalidRequest { message },
            other => Self::Unavailable {
                message: other.to_string(),
            },
        }
    }
}

// =============================================================================
// Events and State
// =============================================================================

/// Connection state, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session.
    #[default]
    Disconnected,
    /// Socket opening, application auth pending.
    Connecting,
    /// Application authenticated, account auth pending.
    AppAuthenticated,
    /// Account authenticated.
    AccountAuthenticated,
    /// Accepting requests.
    Ready,
}

impl ConnectionState {
    /// Check if requests are accepted.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Numeric level for the state gauge.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::AppAuthenticated => 2.0,
            Self::AccountAuthenticated => 3.0,
            Self::Ready => 4.0,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called or the client was dropped.
    Requested,
    /// The broker closed the socket.
    PeerClosed,
    /// Socket error.
    Io(String),
    /// Nothing received within the keepalive window.
    KeepaliveTimeout,
    /// Authentication did not complete.
    AuthFailed,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => f.write_str("requested"),
            Self::PeerClosed => f.write_str("closed by peer"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::KeepaliveTimeout => f.write_str("keepalive timeout"),
            Self::AuthFailed => f.write_str("authentication failed"),
        }
    }
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Session authenticated and ready.
    Connected,
    /// Session ended. Emitted once per session that reached `Ready`.
    Disconnected(DisconnectReason),
    /// Broker confirmed a spot subscription.
    Subscribed {
        /// Caller-facing names covered by the confirmation.
        symbols: Vec<String>,
    },
    /// Live price update.
    Tick(Tick),
    /// Broker error not tied to a caller request.
    Error(String),
}

// =============================================================================
// Configuration
// =============================================================================

/// Broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Wrap the socket in TLS.
    pub tls: bool,
}

impl Endpoint {
    /// Demo environment.
    #[must_use]
    pub fn demo() -> Self {
        Self {
            host: DEMO_HOST.to_string(),
            port: DEFAULT_PORT,
            tls: true,
        }
    }

    /// Live environment.
    #[must_use]
    pub fn live() -> Self {
        Self {
            host: LIVE_HOST.to_string(),
            port: DEFAULT_PORT,
            tls: true,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Deadlines enforced by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Socket open plus both auth steps.
    pub connect: Duration,
    /// History and symbol-list requests.
    pub request: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            request: Duration::from_secs(30),
        }
    }
}

/// Configuration for the client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker endpoint.
    pub endpoint: Endpoint,
    /// API credentials.
    pub credentials: Credentials,
    /// Request deadlines.
    pub timeouts: Timeouts,
    /// Keepalive configuration.
    pub keepalive: KeepaliveConfig,
    /// Caller to broker name mapping.
    pub aliases: SymbolAliases,
}

impl ClientConfig {
    /// Create a configuration with default timeouts and aliases.
    #[must_use]
    pub fn new(endpoint: Endpoint, credentials: Credentials) -> Self {
        Self {
            endpoint,
            credentials,
            timeouts: Timeouts::default(),
            keepalive: KeepaliveConfig::default(),
            aliases: SymbolAliases::builtin(),
        }
    }

    /// Replace the timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Replace the keepalive configuration.
    #[must_use]
    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Replace the alias table.
    #[must_use]
    pub fn with_aliases(mut self, aliases: SymbolAliases) -> Self {
        self.aliases = aliases;
        self
    }
}

// =============================================================================
// Client
// =============================================================================

/// cTrader Open API client.
///
/// # Example
///
/// ```rust,no_run
/// use ctrader_ingestor::infrastructure::ctrader::{
///     CTraderClient, ClientConfig, Credentials, Endpoint,
/// };
/// use tokio::sync::mpsc;
///
/// async fn example() -> anyhow::Result<()> {
///     let credentials = Credentials::new("id", "secret", "token", "12345")?;
///     let (event_tx, _event_rx) = mpsc::channel(1024);
///     let client = CTraderClient::new(ClientConfig::new(Endpoint::demo(), credentials), event_tx);
///
///     client.connect().await?;
///     let symbols = client.fetch_all_symbols().await?;
///     println!("{} symbols", symbols.len());
///     client.disconnect().await;
///     Ok(())
/// }
/// ```
pub struct CTraderClient {
    config: ClientConfig,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    event_tx: mpsc::Sender<ClientEvent>,
    session: Mutex<Option<SessionHandle>>,
}

impl CTraderClient {
    /// Create a new client. Events are delivered on `event_tx`.
    #[must_use]
    pub fn new(config: ClientConfig, event_tx: mpsc::Sender<ClientEvent>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            state_tx: Arc::new(state_tx),
            event_tx,
            session: Mutex::new(None),
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Client configuration.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open the socket and authenticate.
    ///
    /// Returns immediately if already `Ready`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Busy`] if another connect is in progress,
    /// [`ClientError::Timeout`] if the handshake does not finish within
    /// the connect timeout, or the transport / authentication failure.
    ///
    /// # Cancel Safety
    ///
    /// Dropping the future while the socket is still opening leaves the
    /// client `Disconnected`. Once the session runs, its own auth deadline
    /// settles the state.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let stale = {
            let mut session = self.session.lock();
            match self.state() {
                ConnectionState::Ready => return Ok(()),
                ConnectionState::Disconnected => {}
                _ => return Err(ClientError::Busy),
            }
            self.set_state(ConnectionState::Connecting);
            session.take()
        };
        // until a session owns the state, a dropped or failed connect resets it
        let mut connecting = ConnectingGuard::new(self);

        // a session that already tore itself down may still be exiting
        if let Some(stale) = stale {
            stale.cancel.cancel();
            let _ = stale.task.await;
        }

        let deadline = Instant::now() + self.config.timeouts.connect;
        tracing::info!(endpoint = %self.config.endpoint, "Connecting to cTrader");

        let transport = match tokio::time::timeout_at(
            deadline,
            transport::connect(&self.config.endpoint),
        )
        .await
        {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ClientError::Timeout),
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let cancel = CancellationToken::new();

        let session = Session::new(SessionParams {
            credentials: self.config.credentials.clone(),
            timeouts: self.config.timeouts,
            keepalive: self.config.keepalive,
            aliases: self.config.aliases.clone(),
            auth_deadline: deadline,
            ready: ready_tx,
            state_tx: Arc::clone(&self.state_tx),
            event_tx: self.event_tx.clone(),
        });
        let task = tokio::spawn(session.run(transport, command_rx, cancel.clone()));

        *self.session.lock() = Some(SessionHandle {
            commands: command_tx,
            cancel,
            task,
        });
        // the session enforces the auth deadline and resets the state itself
        connecting.disarm();

        ready_rx.await.map_err(|_| ClientError::Disconnected)?
    }

    /// Close the session, if any. Pending calls fail with
    /// [`ClientError::Disconnected`].
    pub async fn disconnect(&self) {
        let handle = self.session.lock().take();
        let Some(handle) = handle else {
            return;
        };

        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            tracing::warn!(error = %e, "Session task did not shut down cleanly");
        }
        tracing::info!("Disconnected from cTrader");
    }

    /// Minute bars for `symbol` between `start` and `end`.
    ///
    /// Bars are keyed by `symbol` as given, even when it is an alias.
    /// An unknown symbol yields an empty vec.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`], [`ClientError::Busy`],
    /// [`ClientError::Timeout`], [`ClientError::Disconnected`] or the
    /// broker's rejection.
    pub async fn fetch_history(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, ClientError> {
        if start > end {
            return Err(ClientError::InvalidRequest(format!(
                "start {start} is after end {end}"
            )));
        }

        let (reply, rx) = oneshot::channel();
        self.send(Command::History {
            symbol: symbol.to_string(),
            start,
            end,
            reply,
        })
        .await?;

        rx.await.map_err(|_| ClientError::Disconnected)?
    }

    /// Refresh and return the broker's symbol list, sorted by name.
    ///
    /// # Errors
    ///
    /// Same as [`Self::fetch_history`].
    pub async fn fetch_all_symbols(&self) -> Result<Vec<SymbolInfo>, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Symbols { reply }).await?;

        rx.await.map_err(|_| ClientError::Disconnected)?
    }

    /// Subscribe to live spots. Names already subscribed are ignored and
    /// unknown names are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] without a ready session.
    pub async fn subscribe<I, S>(&self, symbols: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let symbols: Vec<String> = symbols.into_iter().map(Into::into).collect();
        if symbols.is_empty() {
            return Ok(());
        }

        self.send(Command::Subscribe { symbols }).await
    }

    async fn send(&self, command: Command) -> Result<(), ClientError> {
        if !self.state().is_ready() {
            return Err(ClientError::NotConnected);
        }

        let commands = self
            .session
            .lock()
            .as_ref()
            .map(|handle| handle.commands.clone())
            .ok_or(ClientError::NotConnected)?;

        commands
            .send(command)
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
        crate::infrastructure::metrics::set_connection_state(state.as_gauge());
    }
}

impl Drop for CTraderClient {
    fn drop(&mut self) {
        if let Some(handle) = self.session.get_mut().take() {
            handle.cancel.cancel();
        }
    }
}

/// Puts the client back to `Disconnected` unless disarmed.
struct ConnectingGuard<'a> {
    client: &'a CTraderClient,
    armed: bool,
}

impl<'a> ConnectingGuard<'a> {
    const fn new(client: &'a CTraderClient) -> Self {
        Self {
            client,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!("Connect abandoned before the session started");
            self.client.set_state(ConnectionState::Disconnected);
        }
    }
}

#[async_trait]
impl MarketDataSource for CTraderClient {
    async fn fetch_history(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, MarketDataError> {
        Ok(Self::fetch_history(self, symbol, start, end).await?)
    }

    async fn fetch_all_symbols(&self) -> Result<Vec<SymbolInfo>, MarketDataError> {
        Ok(Self::fetch_all_symbols(self).await?)
    }
}
