//! In-process mock of the cTrader Open API.
//!
//! Speaks the real framing and envelope over plain TCP and answers from a
//! scripted [`BrokerScript`]. Every decoded request is recorded so tests
//! can assert on what the client actually sent.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use ctrader_ingestor::infrastructure::ctrader::codec::{
    OutboundMessage, decode_envelope, encode_frame, length_delimited,
};
use ctrader_ingestor::infrastructure::ctrader::messages::{
    PayloadType, ProtoOaAccountAuthRes, ProtoOaApplicationAuthRes, ProtoOaCtidTraderAccount,
    ProtoOaErrorRes, ProtoOaGetAccountListByAccessTokenRes, ProtoOaGetTrendbarsRes,
    ProtoOaLightSymbol, ProtoOaSpotEvent, ProtoOaSubscribeSpotsRes, ProtoOaSymbol,
    ProtoOaSymbolByIdRes, ProtoOaSymbolsListRes, ProtoOaTrendbar,
};
use ctrader_ingestor::infrastructure::ctrader::{
    CTraderClient, ClientConfig, ClientEvent, Credentials, Endpoint, KeepaliveConfig, Timeouts,
};

pub const ACCOUNT_ID: i64 = 12345;
pub const CLIENT_ID: &str = "test-client";
pub const CLIENT_SECRET: &str = "test-secret";

/// How the mock broker answers.
#[derive(Debug, Clone)]
pub struct BrokerScript {
    /// Accepted application client secret.
    pub client_secret: String,
    /// Accounts the access token can see.
    pub accounts: Vec<i64>,
    /// `(id, name, digits)` for every listed symbol.
    pub symbols: Vec<(i64, String, Option<i32>)>,
    /// Bars per symbol id.
    pub trendbars: HashMap<i64, Vec<ProtoOaTrendbar>>,
    /// Delay before answering a trendbar request.
    pub trendbar_delay: Duration,
    /// Drop the connection instead of answering a trendbar request.
    pub close_on_trendbars: bool,
    /// Spot events pushed right after a subscription is confirmed.
    pub spots: Vec<ProtoOaSpotEvent>,
}

impl Default for BrokerScript {
    fn default() -> Self {
        Self {
            client_secret: CLIENT_SECRET.to_string(),
            accounts: vec![ACCOUNT_ID],
            symbols: vec![
                (1, "EURUSD".to_string(), Some(5)),
                (2, "GBPUSD".to_string(), Some(5)),
                (41, "USTEC".to_string(), Some(2)),
            ],
            trendbars: HashMap::new(),
            trendbar_delay: Duration::ZERO,
            close_on_trendbars: false,
            spots: Vec::new(),
        }
    }
}

/// A running mock broker.
pub struct MockBroker {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<OutboundMessage>>>,
    connections: Arc<Mutex<usize>>,
}

impl MockBroker {
    /// Bind to an ephemeral port and serve `script` to every connection.
    pub async fn start(script: BrokerScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(Mutex::new(0));

        let script = Arc::new(script);
        let recorded = Arc::clone(&requests);
        let accepted = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                *accepted.lock() += 1;
                tokio::spawn(serve(stream, Arc::clone(&script), Arc::clone(&recorded)));
            }
        });

        Self {
            addr,
            requests,
            connections,
        }
    }

    /// Endpoint pointing at this broker, without TLS.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            tls: false,
        }
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<OutboundMessage> {
        self.requests.lock().clone()
    }

    /// Number of requests matching `pred`.
    pub fn count(&self, pred: impl Fn(&OutboundMessage) -> bool) -> usize {
        self.requests.lock().iter().filter(|m| pred(m)).count()
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        *self.connections.lock()
    }
}

async fn serve(
    stream: TcpStream,
    script: Arc<BrokerScript>,
    requests: Arc<Mutex<Vec<OutboundMessage>>>,
) {
    let (mut write, mut read) = Framed::new(stream, length_delimited()).split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Bytes>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = reply_rx.recv().await {
            if write.send(frame).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = read.next().await {
        let envelope = decode_envelope(&frame).unwrap();
        let payload = envelope.payload.as_deref().unwrap_or_default();
        let message = OutboundMessage::decode(envelope.payload_type, payload).unwrap();
        requests.lock().push(message.clone());

        let id = envelope.client_msg_id;
        if !respond(&script, message, id, &reply_tx) {
            break;
        }
    }

    drop(reply_tx);
    writer.abort();
}

/// Queue the scripted answer. Returns `false` to drop the connection.
fn respond(
    script: &BrokerScript,
    message: OutboundMessage,
    id: Option<String>,
    reply: &mpsc::UnboundedSender<Bytes>,
) -> bool {
    let id = id.as_deref();
    let send = |frame: Bytes| {
        let _ = reply.send(frame);
    };

    match message {
        OutboundMessage::ApplicationAuth(req) => {
            if req.client_secret == script.client_secret {
                let res = ProtoOaApplicationAuthRes {};
                send(encode_frame(PayloadType::ApplicationAuthRes, &res, id));
            } else {
                send(oa_error("CH_CLIENT_AUTH_FAILURE", id));
            }
        }
        OutboundMessage::AccountAuth(req) => {
            if script.accounts.contains(&req.ctid_trader_account_id) {
                let res = ProtoOaAccountAuthRes {
                    ctid_trader_account_id: req.ctid_trader_account_id,
                };
                send(encode_frame(PayloadType::AccountAuthRes, &res, id));
            } else {
                send(oa_error("CH_CTID_TRADER_ACCOUNT_NOT_FOUND", id));
            }
        }
        OutboundMessage::AccountList(req) => {
            let res = ProtoOaGetAccountListByAccessTokenRes {
                access_token: req.access_token,
                permission_scope: None,
                ctid_trader_account: script
                    .accounts
                    .iter()
                    .map(|&account| ProtoOaCtidTraderAccount {
                        ctid_trader_account_id: u64::try_from(account).unwrap(),
                        is_live: Some(false),
                        trader_login: None,
                    })
                    .collect(),
            };
            send(encode_frame(PayloadType::GetAccountListRes, &res, id));
        }
        OutboundMessage::SymbolsList(_) => {
            let res = ProtoOaSymbolsListRes {
                ctid_trader_account_id: ACCOUNT_ID,
                symbol: script
                    .symbols
                    .iter()
                    .map(|(symbol_id, name, _)| ProtoOaLightSymbol {
                        symbol_id: *symbol_id,
                        symbol_name: Some(name.clone()),
                        enabled: Some(true),
                        description: None,
                    })
                    .collect(),
            };
            send(encode_frame(PayloadType::SymbolsListRes, &res, id));
        }
        OutboundMessage::SymbolById(req) => {
            let res = ProtoOaSymbolByIdRes {
                ctid_trader_account_id: ACCOUNT_ID,
                symbol: script
                    .symbols
                    .iter()
                    .filter(|(symbol_id, _, _)| req.symbol_id.contains(symbol_id))
                    .filter_map(|(symbol_id, _, digits)| {
                        digits.map(|digits| ProtoOaSymbol {
                            symbol_id: *symbol_id,
                            digits,
                            pip_position: digits - 1,
                        })
                    })
                    .collect(),
            };
            send(encode_frame(PayloadType::SymbolByIdRes, &res, id));
        }
        OutboundMessage::Trendbars(req) => {
            if script.close_on_trendbars {
                return false;
            }
            let res = ProtoOaGetTrendbarsRes {
                ctid_trader_account_id: ACCOUNT_ID,
                period: req.period,
                timestamp: None,
                trendbar: script
                    .trendbars
                    .get(&req.symbol_id)
                    .cloned()
                    .unwrap_or_default(),
                symbol_id: Some(req.symbol_id),
                has_more: Some(false),
            };
            let frame = encode_frame(PayloadType::GetTrendbarsRes, &res, id);
            if script.trendbar_delay.is_zero() {
                send(frame);
            } else {
                let delay = script.trendbar_delay;
                let reply = reply.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = reply.send(frame);
                });
            }
        }
        OutboundMessage::SubscribeSpots(req) => {
            let res = ProtoOaSubscribeSpotsRes {
                ctid_trader_account_id: ACCOUNT_ID,
            };
            send(encode_frame(PayloadType::SubscribeSpotsRes, &res, id));
            for spot in script
                .spots
                .iter()
                .filter(|s| req.symbol_id.contains(&s.symbol_id))
            {
                send(encode_frame(PayloadType::SpotEvent, spot, None));
            }
        }
        OutboundMessage::Heartbeat => {}
    }
    true
}

fn oa_error(code: &str, id: Option<&str>) -> Bytes {
    encode_frame(
        PayloadType::OaErrorRes,
        &ProtoOaErrorRes {
            ctid_trader_account_id: None,
            error_code: code.to_string(),
            description: Some(format!("mock broker: {code}")),
            maintenance_end_timestamp: None,
        },
        id,
    )
}

/// Trendbar in relative format.
pub fn trendbar(low: i64, open: u64, high: u64, close: u64, minutes: u32) -> ProtoOaTrendbar {
    ProtoOaTrendbar {
        volume: 100,
        period: Some(1),
        low: Some(low),
        delta_open: Some(open),
        delta_close: Some(close),
        delta_high: Some(high),
        utc_timestamp_in_minutes: Some(minutes),
    }
}

/// Spot event for `symbol_id` in relative format.
pub fn spot(symbol_id: i64, bid: Option<u64>, ask: Option<u64>) -> ProtoOaSpotEvent {
    ProtoOaSpotEvent {
        ctid_trader_account_id: ACCOUNT_ID,
        symbol_id,
        bid,
        ask,
        session_close: None,
        timestamp: Some(1_700_000_000_000),
    }
}

/// Client for `broker` authenticating as `account_id`.
pub fn client_for(
    broker: &MockBroker,
    secret: &str,
    account_id: &str,
    request_timeout: Duration,
) -> (CTraderClient, mpsc::Receiver<ClientEvent>) {
    let credentials = Credentials::new(CLIENT_ID, secret, "test-token", account_id).unwrap();
    let timeouts = Timeouts {
        connect: Duration::from_secs(5),
        request: request_timeout,
    };
    client_with(broker.endpoint(), credentials, timeouts, 256)
}

/// Client with explicit endpoint, timeouts and event channel capacity.
pub fn client_with(
    endpoint: Endpoint,
    credentials: Credentials,
    timeouts: Timeouts,
    event_capacity: usize,
) -> (CTraderClient, mpsc::Receiver<ClientEvent>) {
    let config = ClientConfig::new(endpoint, credentials)
        .with_timeouts(timeouts)
        .with_keepalive(KeepaliveConfig::new(
            Duration::from_secs(10),
            Duration::from_secs(45),
        ));
    let (event_tx, event_rx) = mpsc::channel(event_capacity);
    (CTraderClient::new(config, event_tx), event_rx)
}

/// Valid credentials for the mock broker.
pub fn credentials() -> Credentials {
    Credentials::new(CLIENT_ID, CLIENT_SECRET, "test-token", &ACCOUNT_ID.to_string()).unwrap()
}

/// Accepts TCP connections and never writes a byte back.
pub async fn silent_listener() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

/// Client with valid credentials and a generous request timeout.
pub fn client(broker: &MockBroker) -> (CTraderClient, mpsc::Receiver<ClientEvent>) {
    client_for(broker, CLIENT_SECRET, &ACCOUNT_ID.to_string(), Duration::from_secs(5))
}

/// Next event, failing the test if none arrives within a second.
pub async fn next_event(events: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("no event within a second")
        .expect("event channel closed")
}
