//! cTrader Open API Adapter
//!
//! Client for the broker's protobuf-over-TLS protocol:
//!
//! - **messages**: Hand-written protobuf structs for the payloads we use
//! - **codec**: Envelope framing, typed inbound and outbound messages
//! - **auth**: Application then account authentication
//! - **keepalive**: Outbound heartbeats and inbound silence detection
//! - **prices**: Relative price and trendbar decoding
//! - **session**: The per-connection task that owns all protocol state
//! - **client**: The public handle callers talk to

pub mod auth;
pub mod client;
pub mod codec;
pub mod keepalive;
pub mod messages;
pub mod pending;
pub mod prices;
mod session;
pub mod transport;

pub use auth::{AuthError, AuthHandler, AuthState, AuthStep, Credentials, CredentialsError};
pub use client::{
    CTraderClient, ClientConfig, ClientError, ClientEvent, ConnectionState, DEFAULT_PORT,
    DEMO_HOST, DisconnectReason, Endpoint, LIVE_HOST, Timeouts,
};
pub use codec::{BrokerError, CodecError, InboundMessage, OutboundMessage, ProtoCodec};
pub use keepalive::{KeepaliveConfig, KeepaliveEvent, KeepaliveMonitor, KeepaliveState};
pub use messages::{PayloadType, TrendbarPeriod};
pub use prices::{PriceError, PriceScale};
