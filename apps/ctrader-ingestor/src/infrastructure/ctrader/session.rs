//! Session Task
//!
//! One task per connection owns the socket, the authentication state, the
//! symbol directory, the subscription set and every in-flight request.
//! Nothing here is shared: callers reach the session only through
//! [`Command`]s and get answers on `oneshot` replies.
//!
//! # Loop
//!
//! Each iteration flushes queued frames and events, then waits on the
//! first of: cancellation, the nearest deadline, a keepalive event, a
//! caller command, an inbound frame. Handlers are synchronous; they queue
//! frames and events instead of writing directly.
//!
//! # Blocking Slot
//!
//! At most one history or symbol-list call is in flight per connection.
//! A second one fails immediately with [`ClientError::Busy`]. Spot
//! subscriptions never take the slot.
//!
//! # Deadlines
//!
//! The session enforces deadlines itself. When one passes, the waiter gets
//! [`ClientError::Timeout`] and the request's `clientMsgId` is forgotten,
//! so a late response is discarded like any unknown one.
//!
//! # Events
//!
//! The loop never waits on the event receiver. Ticks that do not fit are
//! dropped and counted. Lifecycle events that do not fit wait in a backlog
//! that is drained as capacity frees up; ticks never overtake them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::auth::{AuthHandler, AuthStep, Credentials};
use super::client::{ClientError, ClientEvent, ConnectionState, DisconnectReason, Timeouts};
use super::codec::{self, BrokerError, InboundMessage, OutboundMessage, ProtoCodec};
use super::keepalive::{KeepaliveConfig, KeepaliveEvent, KeepaliveMonitor, KeepaliveState};
use super::messages::{
    ProtoOaGetTrendbarsReq, ProtoOaGetTrendbarsRes, ProtoOaSpotEvent, ProtoOaSubscribeSpotsReq,
    ProtoOaSymbolByIdReq, ProtoOaSymbolByIdRes, ProtoOaSymbolsListReq, ProtoOaSymbolsListRes,
    TrendbarPeriod,
};
use super::pending::Correlator;
use super::prices::{PriceScale, decode_spot, decode_trendbars};
use super::transport::Transport;
use crate::domain::market_data::{Bar, SymbolId, SymbolInfo, Tick};
use crate::domain::subscription::SpotSubscriptions;
use crate::domain::symbols::{RELATIVE_PRICE_DIGITS, Resolution, SymbolAliases, SymbolDirectory};
use crate::infrastructure::metrics::{self, Outcome, RequestKind};

/// How long teardown waits for a stalled receiver to take lifecycle events.
const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type HistoryReply = oneshot::Sender<Result<Vec<Bar>, ClientError>>;
type SymbolsReply = oneshot::Sender<Result<Vec<SymbolInfo>, ClientError>>;

// =============================================================================
// Handle and Commands
// =============================================================================

/// Requests from the client to its session.
#[derive(Debug)]
pub enum Command {
    /// Fetch minute bars.
    History {
        /// Caller-facing name.
        symbol: String,
        /// Range start.
        start: DateTime<Utc>,
        /// Range end.
        end: DateTime<Utc>,
        /// Reply channel.
        reply: HistoryReply,
    },
    /// Refresh and return the symbol list.
    Symbols {
        /// Reply channel.
        reply: SymbolsReply,
    },
    /// Add instruments to the spot subscription.
    Subscribe {
        /// Caller-facing names.
        symbols: Vec<String>,
    },
}

/// The client's grip on a running session.
#[derive(Debug)]
pub struct SessionHandle {
    pub(super) commands: mpsc::Sender<Command>,
    pub(super) cancel: CancellationToken,
    pub(super) task: JoinHandle<()>,
}

/// Everything a session needs besides the socket.
pub struct SessionParams {
    pub(super) credentials: Credentials,
    pub(super) timeouts: Timeouts,
    pub(super) keepalive: KeepaliveConfig,
    pub(super) aliases: SymbolAliases,
    pub(super) auth_deadline: Instant,
    pub(super) ready: oneshot::Sender<Result<(), ClientError>>,
    pub(super) state_tx: Arc<watch::Sender<ConnectionState>>,
    pub(super) event_tx: mpsc::Sender<ClientEvent>,
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug)]
enum Route {
    Auth,
    SymbolList,
    SymbolDetails,
    Trendbars,
    Subscribe {
        symbols: Vec<String>,
        ids: Vec<SymbolId>,
    },
}

#[derive(Debug)]
enum HistoryStage {
    AwaitingSymbols,
    AwaitingDetails { symbol_id: SymbolId, msg_id: String },
    AwaitingBars { symbol_id: SymbolId, msg_id: String },
}

impl HistoryStage {
    fn msg_id(&self) -> Option<&str> {
        match self {
            Self::AwaitingSymbols => None,
            Self::AwaitingDetails { msg_id, .. } | Self::AwaitingBars { msg_id, .. } => {
                Some(msg_id)
            }
        }
    }
}

#[derive(Debug)]
struct HistoryOp {
    symbol: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    started: Instant,
    deadline: Instant,
    stage: HistoryStage,
    reply: HistoryReply,
}

#[derive(Debug)]
struct SymbolsOp {
    started: Instant,
    deadline: Instant,
    reply: SymbolsReply,
}

#[derive(Debug)]
enum BlockingOp {
    History(HistoryOp),
    Symbols(SymbolsOp),
}

impl BlockingOp {
    const fn deadline(&self) -> Instant {
        match self {
            Self::History(op) => op.deadline,
            Self::Symbols(op) => op.deadline,
        }
    }

    const fn waits_for_symbols(&self) -> bool {
        matches!(
            self,
            Self::Symbols(_)
                | Self::History(HistoryOp {
                    stage: HistoryStage::AwaitingSymbols,
                    ..
                })
        )
    }

    fn fail(self, error: ClientError) {
        match self {
            Self::History(op) => finish_history(op, Err(error)),
            Self::Symbols(op) => finish_symbols(op, Err(error)),
        }
    }
}

#[derive(Debug)]
struct SymbolLoad {
    msg_id: String,
    started: Instant,
    deadline: Instant,
}

// =============================================================================
// Session
// =============================================================================

/// Protocol state for one connection.
pub struct Session {
    account_id: i64,
    timeouts: Timeouts,
    keepalive: KeepaliveConfig,
    codec: ProtoCodec,
    auth: AuthHandler,
    auth_started: Instant,
    auth_deadline: Instant,
    ready: Option<oneshot::Sender<Result<(), ClientError>>>,
    connected: bool,
    correlator: Correlator<Route>,
    directory: SymbolDirectory,
    subscriptions: SpotSubscriptions,
    blocking: Option<BlockingOp>,
    symbol_load: Option<SymbolLoad>,
    deferred_subscribes: Vec<String>,
    outbox: Vec<Bytes>,
    events: Vec<ClientEvent>,
    event_backlog: VecDeque<ClientEvent>,
    ticks_dropped: u64,
    closing: Option<DisconnectReason>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl Session {
    /// Create a session; nothing is sent until [`Self::run`].
    #[must_use]
    pub fn new(params: SessionParams) -> Self {
        Self {
            account_id: params.credentials.account_id(),
            timeouts: params.timeouts,
            keepalive: params.keepalive,
            codec: ProtoCodec::new(),
            auth: AuthHandler::new(params.credentials),
            auth_started: Instant::now(),
            auth_deadline: params.auth_deadline,
            ready: Some(params.ready),
            connected: false,
            correlator: Correlator::new(),
            directory: SymbolDirectory::new(params.aliases),
            subscriptions: SpotSubscriptions::new(),
            blocking: None,
            symbol_load: None,
            deferred_subscribes: Vec::new(),
            outbox: Vec::new(),
            events: Vec::new(),
            event_backlog: VecDeque::new(),
            ticks_dropped: 0,
            closing: None,
            state_tx: params.state_tx,
            event_tx: params.event_tx,
        }
    }

    /// Authenticate, then serve commands and inbound frames until the
    /// connection ends.
    pub async fn run(
        mut self,
        transport: Box<dyn Transport>,
        mut commands: mpsc::Receiver<Command>,
        cancel: CancellationToken,
    ) {
        let (mut write, mut read) = Framed::new(transport, codec::length_delimited()).split();

        let keepalive_state = Arc::new(KeepaliveState::new());
        let (keepalive_tx, mut keepalive_rx) = mpsc::channel(8);
        let keepalive_cancel = cancel.child_token();
        tokio::spawn(
            KeepaliveMonitor::new(
                self.keepalive,
                Arc::clone(&keepalive_state),
                keepalive_tx,
                keepalive_cancel.clone(),
            )
            .run(),
        );

        let event_tx = self.event_tx.clone();
        let first = self.auth.start();
        self.request(first, Route::Auth);

        let reason = loop {
            if let Err(e) = self.flush(&mut write).await {
                break DisconnectReason::Io(e.to_string());
            }
            self.flush_events();
            if let Some(reason) = self.closing.take() {
                break reason;
            }

            tokio::select! {
                () = cancel.cancelled() => break DisconnectReason::Requested,
                () = sleep_until(self.next_deadline()) => self.on_deadline(Instant::now()),
                permit = event_tx.reserve(), if !self.event_backlog.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(event) = self.event_backlog.pop_front() {
                            permit.send(event);
                        }
                    }
                    Err(_) => self.event_backlog.clear(),
                },
                Some(event) = keepalive_rx.recv() => match event {
                    KeepaliveEvent::SendHeartbeat => self.queue(&OutboundMessage::Heartbeat),
                    KeepaliveEvent::Timeout(_) => break DisconnectReason::KeepaliveTimeout,
                },
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break DisconnectReason::Requested,
                },
                frame = read.next() => match frame {
                    Some(Ok(frame)) => {
                        keepalive_state.record_inbound();
                        self.on_frame(&frame);
                    }
                    Some(Err(e)) => break DisconnectReason::Io(e.to_string()),
                    None => break DisconnectReason::PeerClosed,
                },
            }
        };

        keepalive_cancel.cancel();
        self.teardown(reason).await;
    }

    // =========================================================================
    // Output
    // =========================================================================

    fn queue(&mut self, message: &OutboundMessage) {
        self.outbox.push(self.codec.encode(message, None));
    }

    fn request(&mut self, message: OutboundMessage, route: Route) -> String {
        let msg_id = self.correlator.issue(route);
        tracing::debug!(
            client_msg_id = %msg_id,
            payload = message.payload_type().as_str(),
            "Sending request"
        );
        self.outbox.push(self.codec.encode(&message, Some(&msg_id)));
        msg_id
    }

    async fn flush<W>(&mut self, write: &mut W) -> Result<(), std::io::Error>
    where
        W: Sink<Bytes, Error = std::io::Error> + Unpin,
    {
        if self.outbox.is_empty() {
            return Ok(());
        }
        for frame in self.outbox.drain(..) {
            write.feed(frame).await?;
        }
        write.flush().await
    }

    fn flush_events(&mut self) {
        self.drain_backlog();

        for event in std::mem::take(&mut self.events) {
            if let ClientEvent::Tick(tick) = event {
                self.offer_tick(tick);
                continue;
            }
            if !self.event_backlog.is_empty() {
                self.event_backlog.push_back(event);
                continue;
            }
            match self.event_tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => self.event_backlog.push_back(event),
                Err(TrySendError::Closed(_)) => tracing::trace!("Event receiver dropped"),
            }
        }
    }

    fn drain_backlog(&mut self) {
        while let Some(event) = self.event_backlog.pop_front() {
            match self.event_tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    self.event_backlog.push_front(event);
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    self.event_backlog.clear();
                    return;
                }
            }
        }
    }

    fn offer_tick(&mut self, tick: Tick) {
        if self.event_backlog.is_empty() {
            match self.event_tx.try_send(ClientEvent::Tick(tick)) {
                Ok(()) => {
                    if self.ticks_dropped > 0 {
                        tracing::info!(dropped = self.ticks_dropped, "Event receiver caught up");
                        self.ticks_dropped = 0;
                    }
                    return;
                }
                Err(TrySendError::Closed(_)) => return,
                Err(TrySendError::Full(_)) => {}
            }
        }

        if self.ticks_dropped == 0 {
            tracing::warn!("Event receiver is full, dropping ticks");
        }
        self.ticks_dropped += 1;
        metrics::record_tick_dropped();
    }

    /// Hand the backlog over, waiting at most `limit` for the receiver.
    async fn deliver_backlog(&mut self, limit: Duration) {
        let event_tx = self.event_tx.clone();
        let backlog = &mut self.event_backlog;
        let delivered = tokio::time::timeout(limit, async {
            while let Some(event) = backlog.pop_front() {
                if event_tx.send(event).await.is_err() {
                    backlog.clear();
                }
            }
        })
        .await;

        if delivered.is_err() {
            tracing::warn!(
                dropped = self.event_backlog.len() + 1,
                "Event receiver stalled, dropping lifecycle events"
            );
            self.event_backlog.clear();
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
        metrics::set_connection_state(state.as_gauge());
    }

    // =========================================================================
    // Deadlines
    // =========================================================================

    fn next_deadline(&self) -> Option<Instant> {
        let auth = self.ready.as_ref().map(|_| self.auth_deadline);
        let blocking = self.blocking.as_ref().map(BlockingOp::deadline);
        let load = self.symbol_load.as_ref().map(|load| load.deadline);

        [auth, blocking, load].into_iter().flatten().min()
    }

    fn on_deadline(&mut self, now: Instant) {
        if self.ready.is_some() && now >= self.auth_deadline {
            tracing::warn!(state = ?self.auth.state(), "Authentication timed out");
            metrics::record_request(RequestKind::Auth, Outcome::Timeout);
            self.fail_connect(ClientError::Timeout);
            self.closing = Some(DisconnectReason::AuthFailed);
            return;
        }

        if self.symbol_load.as_ref().is_some_and(|load| now >= load.deadline)
            && let Some(load) = self.symbol_load.take()
        {
            tracing::warn!(client_msg_id = %load.msg_id, "Symbol list request timed out");
            self.correlator.forget(&load.msg_id);
            metrics::record_request(RequestKind::SymbolList, Outcome::Timeout);
            self.drop_deferred_subscribes("symbol list timed out");

            // a caller that joined an older load keeps its own deadline
            if self
                .blocking
                .as_ref()
                .is_some_and(|op| op.waits_for_symbols() && now < op.deadline())
            {
                tracing::debug!("Requesting the symbol list again for the waiting caller");
                self.ensure_symbol_load(now);
            }
        }

        if self.blocking.as_ref().is_some_and(|op| now >= op.deadline())
            && let Some(op) = self.blocking.take()
        {
            if let BlockingOp::History(history) = &op {
                tracing::warn!(symbol = %history.symbol, "History request timed out");
                if let Some(msg_id) = history.stage.msg_id() {
                    self.correlator.forget(msg_id);
                }
            } else {
                tracing::warn!("Symbol list request timed out");
            }
            op.fail(ClientError::Timeout);
        }
    }

    // =========================================================================
    // Authentication
    // =========================================================================

    fn on_auth_message(&mut self, message: InboundMessage) {
        let step = match message {
            InboundMessage::ApplicationAuth => {
                let step = self.auth.on_application_auth();
                if matches!(step, AuthStep::Send(_)) {
                    tracing::debug!("Application authenticated");
                    self.set_state(ConnectionState::AppAuthenticated);
                }
                step
            }
            InboundMessage::AccountAuth(res) => self.auth.on_account_auth(res.ctid_trader_account_id),
            InboundMessage::AccountList(res) => self.auth.on_account_list(&res),
            InboundMessage::Error(error) => {
                tracing::warn!(code = %error.code, "Broker error during authentication");
                self.auth.on_error(error)
            }
            other => {
                tracing::debug!(payload = other.label(), "Ignoring message before authentication");
                return;
            }
        };

        match step {
            AuthStep::Send(message) => {
                self.request(message, Route::Auth);
            }
            AuthStep::Complete => self.on_authenticated(),
            AuthStep::Failed(error) => {
                tracing::error!(error = %error, "Authentication failed");
                metrics::record_request(RequestKind::Auth, Outcome::Error);
                self.fail_connect(ClientError::Auth(error));
                self.closing = Some(DisconnectReason::AuthFailed);
            }
        }
    }

    fn on_authenticated(&mut self) {
        self.set_state(ConnectionState::AccountAuthenticated);
        self.set_state(ConnectionState::Ready);
        self.connected = true;

        metrics::record_request(RequestKind::Auth, Outcome::Ok);
        metrics::record_request_duration(RequestKind::Auth, self.auth_started.elapsed());
        tracing::info!(account_id = self.account_id, "cTrader session ready");

        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Ok(()));
        }
        self.events.push(ClientEvent::Connected);
    }

    fn fail_connect(&mut self, error: ClientError) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(error));
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn on_command(&mut self, command: Command) {
        if !self.connected {
            match command {
                Command::History { reply, .. } => {
                    let _ = reply.send(Err(ClientError::NotConnected));
                }
                Command::Symbols { reply } => {
                    let _ = reply.send(Err(ClientError::NotConnected));
                }
                Command::Subscribe { symbols } => {
                    tracing::warn!(?symbols, "Subscribe before session is ready, ignoring");
                }
            }
            return;
        }

        match command {
            Command::History {
                symbol,
                start,
                end,
                reply,
            } => self.start_history(symbol, start, end, reply),
            Command::Symbols { reply } => self.start_symbols(reply),
            Command::Subscribe { symbols } => self.subscribe(symbols),
        }
    }

    fn start_history(
        &mut self,
        symbol: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        reply: HistoryReply,
    ) {
        if self.blocking.is_some() {
            metrics::record_request(RequestKind::History, Outcome::Busy);
            let _ = reply.send(Err(ClientError::Busy));
            return;
        }

        let now = Instant::now();
        let op = HistoryOp {
            symbol,
            start,
            end,
            started: now,
            deadline: now + self.timeouts.request,
            stage: HistoryStage::AwaitingSymbols,
            reply,
        };

        match self.directory.resolve(&op.symbol) {
            Resolution::NotLoaded => {
                self.ensure_symbol_load(now);
                self.blocking = Some(BlockingOp::History(op));
            }
            Resolution::NotFound => {
                tracing::warn!(
                    symbol = %op.symbol,
                    broker_name = %self.directory.broker_name(&op.symbol),
                    "Unknown symbol, no history"
                );
                finish_history(op, Ok(Vec::new()));
            }
            Resolution::Found(symbol_id) => {
                self.blocking = Some(BlockingOp::History(op));
                self.advance_history(symbol_id);
            }
        }
    }

    fn start_symbols(&mut self, reply: SymbolsReply) {
        if self.blocking.is_some() {
            metrics::record_request(RequestKind::SymbolList, Outcome::Busy);
            let _ = reply.send(Err(ClientError::Busy));
            return;
        }

        let now = Instant::now();
        self.ensure_symbol_load(now);
        self.blocking = Some(BlockingOp::Symbols(SymbolsOp {
            started: now,
            deadline: now + self.timeouts.request,
            reply,
        }));
    }

    fn ensure_symbol_load(&mut self, now: Instant) {
        if self.symbol_load.is_some() {
            return;
        }

        let msg_id = self.request(
            OutboundMessage::SymbolsList(ProtoOaSymbolsListReq {
                ctid_trader_account_id: self.account_id,
                include_archived_symbols: Some(false),
            }),
            Route::SymbolList,
        );
        self.symbol_load = Some(SymbolLoad {
            msg_id,
            started: now,
            deadline: now + self.timeouts.request,
        });
    }

    // =========================================================================
    // History
    // =========================================================================

    fn advance_history(&mut self, symbol_id: SymbolId) {
        if self.directory.digits(symbol_id).is_some() {
            self.request_trendbars(symbol_id);
            return;
        }

        let msg_id = self.request(
            OutboundMessage::SymbolById(ProtoOaSymbolByIdReq {
                ctid_trader_account_id: self.account_id,
                symbol_id: vec![symbol_id],
            }),
            Route::SymbolDetails,
        );
        if let Some(BlockingOp::History(op)) = &mut self.blocking {
            op.stage = HistoryStage::AwaitingDetails { symbol_id, msg_id };
        }
    }

    fn request_trendbars(&mut self, symbol_id: SymbolId) {
        let Some(BlockingOp::History(op)) = &self.blocking else {
            return;
        };

        let message = OutboundMessage::Trendbars(ProtoOaGetTrendbarsReq {
            ctid_trader_account_id: self.account_id,
            from_timestamp: Some(op.start.timestamp_millis()),
            to_timestamp: Some(op.end.timestamp_millis()),
            period: TrendbarPeriod::M1.as_i32(),
            symbol_id,
            count: None,
        });
        let msg_id = self.request(message, Route::Trendbars);

        if let Some(BlockingOp::History(op)) = &mut self.blocking {
            op.stage = HistoryStage::AwaitingBars { symbol_id, msg_id };
        }
    }

    fn current_history_stage(&self, msg_id: &str) -> Option<&HistoryStage> {
        match &self.blocking {
            Some(BlockingOp::History(op)) if op.stage.msg_id() == Some(msg_id) => Some(&op.stage),
            _ => None,
        }
    }

    fn on_symbol_details(&mut self, msg_id: &str, res: ProtoOaSymbolByIdRes) {
        let Some(&HistoryStage::AwaitingDetails { symbol_id, .. }) =
            self.current_history_stage(msg_id)
        else {
            return;
        };

        for symbol in res.symbol {
            match u32::try_from(symbol.digits) {
                Ok(digits) => self.directory.set_digits(symbol.symbol_id, digits),
                Err(_) => tracing::warn!(
                    symbol_id = symbol.symbol_id,
                    digits = symbol.digits,
                    "Ignoring negative precision"
                ),
            }
        }
        metrics::record_request(RequestKind::SymbolDetails, Outcome::Ok);

        if self.directory.digits(symbol_id).is_none() {
            tracing::warn!(symbol_id, "No precision published, assuming five digits");
            self.directory.set_digits(symbol_id, RELATIVE_PRICE_DIGITS);
        }
        self.request_trendbars(symbol_id);
    }

    fn on_symbol_details_failed(&mut self, msg_id: &str, error: &BrokerError) {
        let Some(&HistoryStage::AwaitingDetails { symbol_id, .. }) =
            self.current_history_stage(msg_id)
        else {
            return;
        };

        tracing::warn!(
            symbol_id,
            error = %error,
            "Symbol details unavailable, assuming five digits"
        );
        metrics::record_request(RequestKind::SymbolDetails, Outcome::Error);
        self.directory.set_digits(symbol_id, RELATIVE_PRICE_DIGITS);
        self.request_trendbars(symbol_id);
    }

    fn on_trendbars(&mut self, msg_id: &str, res: &ProtoOaGetTrendbarsRes) {
        let result = {
            let Some(BlockingOp::History(op)) = &self.blocking else {
                return;
            };
            let HistoryStage::AwaitingBars { symbol_id, .. } = op.stage else {
                return;
            };
            if op.stage.msg_id() != Some(msg_id) {
                return;
            }

            if res.has_more == Some(true) {
                tracing::debug!(symbol = %op.symbol, "Broker truncated the requested range");
            }
            let scale = PriceScale::for_digits(self.directory.digits(symbol_id));
            decode_trendbars(&op.symbol, &res.trendbar, scale).map_err(ClientError::from)
        };

        self.finish_blocking_history(result);
    }

    fn finish_blocking_history(&mut self, result: Result<Vec<Bar>, ClientError>) {
        if let Some(BlockingOp::History(op)) = self.blocking.take() {
            finish_history(op, result);
        }
    }

    // =========================================================================
    // Symbols
    // =========================================================================

    fn on_symbols_loaded(&mut self, res: ProtoOaSymbolsListRes) {
        if let Some(load) = self.symbol_load.take() {
            metrics::record_request(RequestKind::SymbolList, Outcome::Ok);
            metrics::record_request_duration(RequestKind::SymbolList, load.started.elapsed());
        }

        let listed = res.symbol.len();
        let symbols: Vec<SymbolInfo> = res
            .symbol
            .into_iter()
            .filter_map(|symbol| {
                symbol.symbol_name.map(|name| SymbolInfo {
                    id: symbol.symbol_id,
                    name,
                })
            })
            .collect();
        if symbols.len() < listed {
            tracing::debug!(skipped = listed - symbols.len(), "Skipping unnamed symbols");
        }
        self.directory.load(symbols);
        tracing::info!(count = self.directory.len(), "Symbol list loaded");

        match self.blocking.take() {
            Some(BlockingOp::Symbols(op)) => {
                let symbols = self.directory.symbols();
                finish_symbols(op, Ok(symbols));
            }
            Some(BlockingOp::History(op)) if matches!(op.stage, HistoryStage::AwaitingSymbols) => {
                match self.directory.resolve(&op.symbol) {
                    Resolution::Found(symbol_id) => {
                        self.blocking = Some(BlockingOp::History(op));
                        self.advance_history(symbol_id);
                    }
                    Resolution::NotFound | Resolution::NotLoaded => {
                        tracing::warn!(
                            symbol = %op.symbol,
                            broker_name = %self.directory.broker_name(&op.symbol),
                            "Unknown symbol, no history"
                        );
                        finish_history(op, Ok(Vec::new()));
                    }
                }
            }
            other => self.blocking = other,
        }

        let deferred = std::mem::take(&mut self.deferred_subscribes);
        if !deferred.is_empty() {
            self.subscribe_resolved(deferred);
        }
    }

    fn on_symbols_failed(&mut self, error: BrokerError) {
        tracing::warn!(error = %error, "Symbol list request rejected");
        self.symbol_load = None;
        metrics::record_request(RequestKind::SymbolList, Outcome::Error);
        self.drop_deferred_subscribes("symbol list rejected");

        if self.blocking.as_ref().is_some_and(BlockingOp::waits_for_symbols)
            && let Some(op) = self.blocking.take()
        {
            op.fail(error.into());
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    fn subscribe(&mut self, symbols: Vec<String>) {
        if self.directory.is_loaded() {
            self.subscribe_resolved(symbols);
        } else {
            self.deferred_subscribes.extend(symbols);
            self.ensure_symbol_load(Instant::now());
        }
    }

    fn subscribe_resolved(&mut self, symbols: Vec<String>) {
        let mut ids = Vec::new();
        let mut names = Vec::new();

        for name in symbols {
            if self.subscriptions.contains_caller(&name) {
                continue;
            }
            match self.directory.resolve(&name) {
                Resolution::Found(id) => {
                    if self.subscriptions.insert(id, &name) {
                        ids.push(id);
                        names.push(name);
                    } else {
                        tracing::debug!(
                            symbol = %name,
                            existing = ?self.subscriptions.caller_name(id),
                            "Instrument already subscribed under another name"
                        );
                    }
                }
                Resolution::NotFound | Resolution::NotLoaded => {
                    tracing::warn!(
                        symbol = %name,
                        broker_name = %self.directory.broker_name(&name),
                        "Unknown symbol, not subscribing"
                    );
                }
            }
        }

        if ids.is_empty() {
            return;
        }

        tracing::info!(symbols = ?names, "Subscribing to spots");
        metrics::set_subscriptions(self.subscriptions.len());
        self.request(
            OutboundMessage::SubscribeSpots(ProtoOaSubscribeSpotsReq {
                ctid_trader_account_id: self.account_id,
                symbol_id: ids.clone(),
                subscribe_to_spot_timestamp: Some(true),
            }),
            Route::Subscribe {
                symbols: names,
                ids,
            },
        );
    }

    fn drop_deferred_subscribes(&mut self, why: &str) {
        if !self.deferred_subscribes.is_empty() {
            tracing::warn!(
                symbols = ?self.deferred_subscribes,
                reason = why,
                "Dropping pending subscribe"
            );
            self.deferred_subscribes.clear();
        }
    }

    fn on_spot(&mut self, event: &ProtoOaSpotEvent) {
        if !self.subscriptions.contains(event.symbol_id) {
            tracing::trace!(symbol_id = event.symbol_id, "Spot for unsubscribed symbol");
            return;
        }

        let scale = PriceScale::for_digits(self.directory.digits(event.symbol_id));
        let update = decode_spot(event, scale);
        match self.subscriptions.apply(&update) {
            Some(tick) => self.events.push(ClientEvent::Tick(tick)),
            None => tracing::trace!(symbol_id = event.symbol_id, "No bid yet, dropping spot"),
        }
    }

    // =========================================================================
    // Inbound Routing
    // =========================================================================

    fn on_frame(&mut self, frame: &[u8]) {
        let envelope = match self.codec.decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, len = frame.len(), "Undecodable frame");
                return;
            }
        };
        metrics::record_message_received(envelope.message.label());

        match envelope.message {
            InboundMessage::Heartbeat => {}
            InboundMessage::Spot(event) => self.on_spot(&event),
            message if !self.connected => {
                if let Some(msg_id) = &envelope.client_msg_id {
                    self.correlator.forget(msg_id);
                }
                self.on_auth_message(message);
            }
            message => self.on_response(envelope.client_msg_id, message),
        }
    }

    fn on_response(&mut self, client_msg_id: Option<String>, message: InboundMessage) {
        let Some(msg_id) = client_msg_id else {
            match message {
                InboundMessage::Error(error) => {
                    tracing::warn!(error = %error, "Unsolicited broker error");
                    self.events.push(ClientEvent::Error(error.to_string()));
                }
                other => {
                    tracing::debug!(payload = other.label(), "Ignoring uncorrelated message");
                }
            }
            return;
        };

        let Some(route) = self.correlator.resolve(&msg_id) else {
            tracing::debug!(
                client_msg_id = %msg_id,
                payload = message.label(),
                "Discarding response nobody is waiting for"
            );
            metrics::record_response_discarded();
            return;
        };

        match (route, message) {
            (Route::SymbolList, InboundMessage::SymbolsList(res)) => self.on_symbols_loaded(res),
            (Route::SymbolList, InboundMessage::Error(error)) => self.on_symbols_failed(error),
            (Route::SymbolDetails, InboundMessage::SymbolById(res)) => {
                self.on_symbol_details(&msg_id, res);
            }
            (Route::SymbolDetails, InboundMessage::Error(error)) => {
                self.on_symbol_details_failed(&msg_id, &error);
            }
            (Route::Trendbars, InboundMessage::Trendbars(res)) => self.on_trendbars(&msg_id, &res),
            (Route::Trendbars, InboundMessage::Error(error)) => {
                if self.current_history_stage(&msg_id).is_some() {
                    tracing::warn!(error = %error, "History request rejected");
                    self.finish_blocking_history(Err(error.into()));
                }
            }
            (Route::Subscribe { symbols, .. }, InboundMessage::SubscribeSpots(_)) => {
                tracing::info!(?symbols, "Spot subscription confirmed");
                metrics::record_request(RequestKind::Subscribe, Outcome::Ok);
                self.events.push(ClientEvent::Subscribed { symbols });
            }
            (Route::Subscribe { symbols, ids }, InboundMessage::Error(error)) => {
                tracing::warn!(?symbols, error = %error, "Spot subscription rejected");
                metrics::record_request(RequestKind::Subscribe, Outcome::Error);
                for id in ids {
                    self.subscriptions.remove(id);
                }
                metrics::set_subscriptions(self.subscriptions.len());
                self.events.push(ClientEvent::Error(error.to_string()));
            }
            (route, message) => {
                tracing::warn!(
                    ?route,
                    payload = message.label(),
                    "Response does not match its request"
                );
            }
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    async fn teardown(mut self, reason: DisconnectReason) {
        tracing::info!(reason = %reason, "cTrader session closed");

        self.fail_connect(ClientError::Disconnected);
        if let Some(op) = self.blocking.take() {
            op.fail(ClientError::Disconnected);
        }
        self.symbol_load = None;
        self.deferred_subscribes.clear();
        self.correlator.clear();
        self.subscriptions.clear();
        self.auth.reset();
        metrics::set_subscriptions(0);
        self.set_state(ConnectionState::Disconnected);

        if self.connected {
            self.connected = false;
            self.events.push(ClientEvent::Disconnected(reason));
        }
        self.flush_events();
        self.deliver_backlog(EVENT_DRAIN_TIMEOUT).await;
    }
}

// =============================================================================
// Replies
// =============================================================================

fn finish_history(op: HistoryOp, result: Result<Vec<Bar>, ClientError>) {
    let outcome = outcome_of(&result);
    metrics::record_request(RequestKind::History, outcome);
    metrics::record_request_duration(RequestKind::History, op.started.elapsed());

    match &result {
        Ok(bars) => tracing::debug!(
            symbol = %op.symbol,
            bars = bars.len(),
            elapsed_ms = op.started.elapsed().as_millis(),
            "History request complete"
        ),
        Err(e) => tracing::debug!(symbol = %op.symbol, error = %e, "History request failed"),
    }

    if op.reply.send(result).is_err() {
        tracing::debug!(symbol = %op.symbol, "History caller went away");
    }
}

fn finish_symbols(op: SymbolsOp, result: Result<Vec<SymbolInfo>, ClientError>) {
    metrics::record_request_duration(RequestKind::SymbolList, op.started.elapsed());
    if op.reply.send(result).is_err() {
        tracing::debug!("Symbol list caller went away");
    }
}

fn outcome_of<T>(result: &Result<T, ClientError>) -> Outcome {
    match result {
        Ok(_) => Outcome::Ok,
        Err(ClientError::Timeout) => Outcome::Timeout,
        Err(ClientError::Busy) => Outcome::Busy,
        Err(ClientError::Disconnected) => Outcome::Disconnected,
        Err(_) => Outcome::Error,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::ctrader::codec::{Envelope, decode_envelope};
    use crate::infrastructure::ctrader::messages::{
        ProtoOaLightSymbol, ProtoOaSymbol, ProtoOaTrendbar,
    };

    struct Harness {
        session: Session,
        events: mpsc::Receiver<ClientEvent>,
        ready: oneshot::Receiver<Result<(), ClientError>>,
    }

    fn harness() -> Harness {
        harness_with_capacity(64)
    }

    fn harness_with_capacity(event_capacity: usize) -> Harness {
        let (ready_tx, ready) = oneshot::channel();
        let (event_tx, events) = mpsc::channel(event_capacity);
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let session = Session::new(SessionParams {
            credentials: Credentials::new("client", "secret", "token", "42").unwrap(),
            timeouts: Timeouts::default(),
            keepalive: KeepaliveConfig::default(),
            aliases: SymbolAliases::builtin(),
            auth_deadline: Instant::now() + Duration::from_secs(10),
            ready: ready_tx,
            state_tx: Arc::new(state_tx),
            event_tx,
        });
        Harness {
            session,
            events,
            ready,
        }
    }

    fn sent(session: &mut Session) -> Vec<Envelope<OutboundMessage>> {
        session
            .outbox
            .drain(..)
            .map(|frame| {
                let envelope = decode_envelope(&frame).unwrap();
                Envelope {
                    client_msg_id: envelope.client_msg_id,
                    message: OutboundMessage::decode(
                        envelope.payload_type,
                        envelope.payload.as_deref().unwrap_or_default(),
                    )
                    .unwrap(),
                }
            })
            .collect()
    }

    fn authenticate(session: &mut Session) {
        let first = session.auth.start();
        session.request(first, Route::Auth);
        session.on_auth_message(InboundMessage::ApplicationAuth);
        session.on_auth_message(InboundMessage::AccountAuth(
            crate::infrastructure::ctrader::messages::ProtoOaAccountAuthRes {
                ctid_trader_account_id: 42,
            },
        ));
        session.outbox.clear();
        session.events.clear();
    }

    fn symbol_list() -> ProtoOaSymbolsListRes {
        ProtoOaSymbolsListRes {
            ctid_trader_account_id: 42,
            symbol: vec![
                ProtoOaLightSymbol {
                    symbol_id: 1,
                    symbol_name: Some("EURUSD".to_string()),
                    enabled: Some(true),
                    description: None,
                },
                ProtoOaLightSymbol {
                    symbol_id: 2,
                    symbol_name: Some("USTEC".to_string()),
                    enabled: Some(true),
                    description: None,
                },
            ],
        }
    }

    fn history_command(symbol: &str) -> (Command, oneshot::Receiver<Result<Vec<Bar>, ClientError>>) {
        let (reply, rx) = oneshot::channel();
        let now = Utc::now();
        (
            Command::History {
                symbol: symbol.to_string(),
                start: now - chrono::Duration::hours(1),
                end: now,
                reply,
            },
            rx,
        )
    }

    #[test]
    fn auth_flow_reaches_ready() {
        let mut h = harness();
        authenticate(&mut h.session);

        assert!(h.session.connected);
        assert_eq!(*h.session.state_tx.borrow(), ConnectionState::Ready);
        assert!(matches!(h.ready.try_recv(), Ok(Ok(()))));
    }

    #[test]
    fn history_loads_symbols_then_details_then_bars() {
        let mut h = harness();
        authenticate(&mut h.session);

        let (command, mut rx) = history_command("NSXUSD");
        h.session.on_command(command);

        let out = sent(&mut h.session);
        assert!(matches!(out[0].message, OutboundMessage::SymbolsList(_)));
        let list_id = out[0].client_msg_id.clone();

        h.session.on_response(list_id, InboundMessage::SymbolsList(symbol_list()));
        let out = sent(&mut h.session);
        let OutboundMessage::SymbolById(req) = &out[0].message else {
            panic!("expected symbol details request");
        };
        assert_eq!(req.symbol_id, vec![2]);

        h.session.on_response(
            out[0].client_msg_id.clone(),
            InboundMessage::SymbolById(ProtoOaSymbolByIdRes {
                ctid_trader_account_id: 42,
                symbol: vec![ProtoOaSymbol {
                    symbol_id: 2,
                    digits: 2,
                    pip_position: 0,
                }],
            }),
        );
        let out = sent(&mut h.session);
        let OutboundMessage::Trendbars(req) = &out[0].message else {
            panic!("expected trendbars request");
        };
        assert_eq!(req.symbol_id, 2);
        assert_eq!(req.period, 1);

        h.session.on_response(
            out[0].client_msg_id.clone(),
            InboundMessage::Trendbars(ProtoOaGetTrendbarsRes {
                ctid_trader_account_id: 42,
                period: 1,
                timestamp: None,
                trendbar: vec![ProtoOaTrendbar {
                    volume: 10,
                    period: Some(1),
                    low: Some(1_812_345_678),
                    delta_open: Some(0),
                    delta_close: Some(0),
                    delta_high: Some(0),
                    utc_timestamp_in_minutes: Some(1),
                }],
                symbol_id: Some(2),
                has_more: Some(false),
            }),
        );

        let bars = rx.try_recv().unwrap().unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].symbol, "NSXUSD");
        assert_eq!(bars[0].low, "18123.46".parse().unwrap());
        assert!(h.session.blocking.is_none());
    }

    #[test]
    fn second_blocking_request_is_busy() {
        let mut h = harness();
        authenticate(&mut h.session);

        let (first, _first_rx) = history_command("EURUSD");
        h.session.on_command(first);

        let (reply, mut rx) = oneshot::channel();
        h.session.on_command(Command::Symbols { reply });
        assert!(matches!(rx.try_recv(), Ok(Err(ClientError::Busy))));
    }

    #[test]
    fn deadline_times_out_and_forgets_request() {
        let mut h = harness();
        authenticate(&mut h.session);

        let (command, mut rx) = history_command("EURUSD");
        h.session.on_command(command);
        let list_id = sent(&mut h.session)[0].client_msg_id.clone().unwrap();

        let deadline = h.session.next_deadline().unwrap();
        h.session.on_deadline(deadline);

        assert!(matches!(rx.try_recv(), Ok(Err(ClientError::Timeout))));
        assert!(!h.session.correlator.is_pending(&list_id));

        // a late response is discarded and leaves the directory untouched
        h.session
            .on_response(Some(list_id), InboundMessage::SymbolsList(symbol_list()));
        assert!(!h.session.directory.is_loaded());
    }

    #[test]
    fn history_joining_older_symbol_load_keeps_its_own_deadline() {
        let mut h = harness();
        authenticate(&mut h.session);

        h.session.on_command(Command::Subscribe {
            symbols: vec!["EURUSD".to_string()],
        });
        let first_list = sent(&mut h.session)[0].client_msg_id.clone().unwrap();
        // the subscribe's load is about to expire when history joins it
        let load_deadline = Instant::now();
        h.session.symbol_load.as_mut().unwrap().deadline = load_deadline;

        let (command, mut rx) = history_command("EURUSD");
        h.session.on_command(command);
        assert!(h.session.outbox.is_empty());

        h.session.on_deadline(load_deadline);

        assert!(rx.try_recv().is_err(), "history failed before its own deadline");
        assert!(!h.session.correlator.is_pending(&first_list));
        assert!(h.session.deferred_subscribes.is_empty());

        let out = sent(&mut h.session);
        assert!(matches!(out[0].message, OutboundMessage::SymbolsList(_)));
        h.session
            .on_response(out[0].client_msg_id.clone(), InboundMessage::SymbolsList(symbol_list()));

        let out = sent(&mut h.session);
        assert!(matches!(out[0].message, OutboundMessage::SymbolById(_)));
        assert!(matches!(
            h.session.blocking,
            Some(BlockingOp::History(HistoryOp {
                stage: HistoryStage::AwaitingDetails { symbol_id: 1, .. },
                ..
            }))
        ));
    }

    #[test]
    fn history_still_times_out_when_its_own_deadline_passes() {
        let mut h = harness();
        authenticate(&mut h.session);

        h.session.on_command(Command::Subscribe {
            symbols: vec!["EURUSD".to_string()],
        });
        sent(&mut h.session);
        let (command, mut rx) = history_command("EURUSD");
        h.session.on_command(command);

        let history_deadline = h.session.blocking.as_ref().unwrap().deadline();
        h.session.on_deadline(history_deadline);

        assert!(matches!(rx.try_recv(), Ok(Err(ClientError::Timeout))));
        assert!(h.session.blocking.is_none());
    }

    fn tick(bid: i64) -> ClientEvent {
        ClientEvent::Tick(Tick {
            symbol: "EURUSD".to_string(),
            bid: rust_decimal::Decimal::new(bid, 5),
            ask: None,
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn full_receiver_drops_ticks_but_keeps_lifecycle_events() {
        let mut h = harness_with_capacity(1);
        authenticate(&mut h.session);

        h.session.events.push(ClientEvent::Subscribed {
            symbols: vec!["EURUSD".to_string()],
        });
        h.session.events.push(tick(110_000));
        h.session.events.push(tick(110_001));
        h.session.events.push(ClientEvent::Error("late".to_string()));
        h.session.events.push(tick(110_002));
        h.session.flush_events();

        assert_eq!(h.session.ticks_dropped, 3);
        assert_eq!(h.session.event_backlog.len(), 1);
        assert!(matches!(h.events.try_recv(), Ok(ClientEvent::Subscribed { .. })));

        // freed capacity goes to the backlog before any new tick
        h.session.events.push(tick(110_003));
        h.session.flush_events();
        assert_eq!(h.events.try_recv().unwrap(), ClientEvent::Error("late".to_string()));
        assert_eq!(h.session.ticks_dropped, 4);

        h.session.events.push(tick(110_004));
        h.session.flush_events();
        assert!(matches!(
            h.events.try_recv(),
            Ok(ClientEvent::Tick(tick)) if tick.bid == rust_decimal::Decimal::new(110_004, 5)
        ));
        assert_eq!(h.session.ticks_dropped, 0);
    }

    #[tokio::test]
    async fn teardown_does_not_wait_forever_on_a_stalled_receiver() {
        let mut h = harness_with_capacity(1);
        authenticate(&mut h.session);
        h.session.event_tx.try_send(ClientEvent::Connected).unwrap();

        let (command, rx) = history_command("EURUSD");
        h.session.on_command(command);

        let teardown = h.session.teardown(DisconnectReason::PeerClosed);
        assert!(
            tokio::time::timeout(Duration::from_secs(3), teardown)
                .await
                .is_ok(),
            "teardown blocked on the event receiver"
        );
        assert!(matches!(rx.await, Ok(Err(ClientError::Disconnected))));
        assert_eq!(h.events.recv().await, Some(ClientEvent::Connected));
    }

    #[test]
    fn unknown_symbol_history_is_empty() {
        let mut h = harness();
        authenticate(&mut h.session);
        h.session.directory.load(Vec::new());

        let (command, mut rx) = history_command("UNKNOWNXYZ");
        h.session.on_command(command);

        assert!(rx.try_recv().unwrap().unwrap().is_empty());
        assert!(h.session.outbox.is_empty());
    }

    #[test]
    fn subscribe_defers_until_symbols_load_and_skips_unknown() {
        let mut h = harness();
        authenticate(&mut h.session);

        h.session.on_command(Command::Subscribe {
            symbols: vec!["EURUSD".to_string(), "UNKNOWNXYZ".to_string()],
        });
        let out = sent(&mut h.session);
        assert_eq!(out.len(), 1);
        h.session
            .on_response(out[0].client_msg_id.clone(), InboundMessage::SymbolsList(symbol_list()));

        let out = sent(&mut h.session);
        let OutboundMessage::SubscribeSpots(req) = &out[0].message else {
            panic!("expected subscribe request");
        };
        assert_eq!(req.symbol_id, vec![1]);
        assert!(h.session.subscriptions.contains_caller("EURUSD"));

        // resubscribing the same name sends nothing
        h.session.on_command(Command::Subscribe {
            symbols: vec!["EURUSD".to_string()],
        });
        assert!(h.session.outbox.is_empty());
    }

    #[test]
    fn spot_becomes_tick_keyed_by_caller_name() {
        let mut h = harness();
        authenticate(&mut h.session);
        h.session.directory.load(vec![SymbolInfo {
            id: 2,
            name: "USTEC".to_string(),
        }]);
        h.session.on_command(Command::Subscribe {
            symbols: vec!["NSXUSD".to_string()],
        });

        h.session.on_spot(&ProtoOaSpotEvent {
            ctid_trader_account_id: 42,
            symbol_id: 2,
            bid: Some(1_812_345_000),
            ask: Some(1_812_355_000),
            session_close: None,
            timestamp: Some(1_700_000_000_000),
        });

        let Some(ClientEvent::Tick(tick)) = h.session.events.pop() else {
            panic!("expected tick");
        };
        assert_eq!(tick.symbol, "NSXUSD");
        assert_eq!(tick.bid, "18123.45".parse().unwrap());
    }

    #[tokio::test]
    async fn teardown_fails_waiters_and_emits_once() {
        let mut h = harness();
        authenticate(&mut h.session);

        let (command, rx) = history_command("EURUSD");
        h.session.on_command(command);

        h.session.teardown(DisconnectReason::PeerClosed).await;

        assert!(matches!(rx.await, Ok(Err(ClientError::Disconnected))));
        assert_eq!(
            h.events.recv().await,
            Some(ClientEvent::Disconnected(DisconnectReason::PeerClosed))
        );
        assert!(h.events.recv().await.is_none());
    }
}
