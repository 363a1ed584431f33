//! cTrader Open API Wire Messages
//!
//! Protobuf (proto2) message types for the subset of the Open API the
//! ingestor speaks. Every frame on the socket is a [`ProtoMessage`]
//! envelope whose `payload` holds one of the messages below, selected by
//! `payload_type`.
//!
//! Fields the ingestor never reads are left out; prost skips unknown
//! fields on decode, and the broker takes the payload type from the
//! envelope.
//!
//! # Message Types
//!
//! ## Common
//! - `ProtoErrorRes` (50): generic error
//! - `ProtoHeartbeatEvent` (51): keepalive, both directions
//!
//! ## Open API
//! - Application / account auth (2100-2103)
//! - Symbol list and symbol details (2114-2117)
//! - Spot subscription and spot events (2127, 2128, 2131)
//! - Trendbars (2137, 2138)
//! - Open API error (2142)
//! - Accounts by access token (2149, 2150)
//!
//! # References
//!
//! - [Open API messages](https://help.ctrader.com/open-api/messages/)

// =============================================================================
// Payload Types
// =============================================================================

/// Payload type discriminator carried by every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PayloadType {
    /// `ProtoErrorRes`
    ErrorRes = 50,
    /// `ProtoHeartbeatEvent`
    HeartbeatEvent = 51,
    /// `ProtoOAApplicationAuthReq`
    ApplicationAuthReq = 2100,
    /// `ProtoOAApplicationAuthRes`
    ApplicationAuthRes = 2101,
    /// `ProtoOAAccountAuthReq`
    AccountAuthReq = 2102,
    /// `ProtoOAAccountAuthRes`
    AccountAuthRes = 2103,
    /// `ProtoOASymbolsListReq`
    SymbolsListReq = 2114,
    /// `ProtoOASymbolsListRes`
    SymbolsListRes = 2115,
    /// `ProtoOASymbolByIdReq`
    SymbolByIdReq = 2116,
    /// `ProtoOASymbolByIdRes`
    SymbolByIdRes = 2117,
    /// `ProtoOASubscribeSpotsReq`
    SubscribeSpotsReq = 2127,
    /// `ProtoOASubscribeSpotsRes`
    SubscribeSpotsRes = 2128,
    /// `ProtoOASpotEvent`
    SpotEvent = 2131,
    /// `ProtoOAGetTrendbarsReq`
    GetTrendbarsReq = 2137,
    /// `ProtoOAGetTrendbarsRes`
    GetTrendbarsRes = 2138,
    /// `ProtoOAErrorRes`
    OaErrorRes = 2142,
    /// `ProtoOAGetAccountListByAccessTokenReq`
    GetAccountListReq = 2149,
    /// `ProtoOAGetAccountListByAccessTokenRes`
    GetAccountListRes = 2150,
}

impl PayloadType {
    /// Map a raw discriminator to a known payload type.
    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            50 => Self::ErrorRes,
            51 => Self::HeartbeatEvent,
            2100 => Self::ApplicationAuthReq,
            2101 => Self::ApplicationAuthRes,
            2102 => Self::AccountAuthReq,
            2103 => Self::AccountAuthRes,
            2114 => Self::SymbolsListReq,
            2115 => Self::SymbolsListRes,
            2116 => Self::SymbolByIdReq,
            2117 => Self::SymbolByIdRes,
            2127 => Self::SubscribeSpotsReq,
            2128 => Self::SubscribeSpotsRes,
            2131 => Self::SpotEvent,
            2137 => Self::GetTrendbarsReq,
            2138 => Self::GetTrendbarsRes,
            2142 => Self::OaErrorRes,
            2149 => Self::GetAccountListReq,
            2150 => Self::GetAccountListRes,
            _ => return None,
        })
    }

    /// Raw discriminator.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ErrorRes | Self::OaErrorRes => "error",
            Self::HeartbeatEvent => "heartbeat",
            Self::ApplicationAuthReq | Self::ApplicationAuthRes => "application_auth",
            Self::AccountAuthReq | Self::AccountAuthRes => "account_auth",
            Self::SymbolsListReq | Self::SymbolsListRes => "symbols_list",
            Self::SymbolByIdReq | Self::SymbolByIdRes => "symbol_by_id",
            Self::SubscribeSpotsReq | Self::SubscribeSpotsRes => "subscribe_spots",
            Self::SpotEvent => "spot_event",
            Self::GetTrendbarsReq | Self::GetTrendbarsRes => "trendbars",
            Self::GetAccountListReq | Self::GetAccountListRes => "account_list",
        }
    }
}

/// Trendbar aggregation period (`ProtoOATrendbarPeriod`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum TrendbarPeriod {
    /// One minute.
    #[default]
    M1 = 1,
    /// Five minutes.
    M5 = 5,
    /// One hour.
    H1 = 9,
    /// One day.
    D1 = 12,
}

impl TrendbarPeriod {
    /// Wire value.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

// =============================================================================
// Envelope and Common Messages
// =============================================================================

/// Envelope wrapping every frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoMessage {
    /// Payload type discriminator.
    #[prost(uint32, required, tag = "1")]
    pub payload_type: u32,
    /// Encoded payload message.
    #[prost(bytes = "vec", optional, tag = "2")]
    pub payload: Option<Vec<u8>>,
    /// Correlation id echoed by the broker on responses.
    #[prost(string, optional, tag = "3")]
    pub client_msg_id: Option<String>,
}

/// Generic error response (payload 50).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoErrorRes {
    /// Error code name.
    #[prost(string, required, tag = "2")]
    pub error_code: String,
    /// Human-readable description.
    #[prost(string, optional, tag = "3")]
    pub description: Option<String>,
    /// End of a maintenance window, when applicable.
    #[prost(uint64, optional, tag = "4")]
    pub maintenance_end_timestamp: Option<u64>,
}

/// Keepalive event (payload 51).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoHeartbeatEvent {}

// =============================================================================
// Authentication
// =============================================================================

/// Application authentication request (payload 2100).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaApplicationAuthReq {
    /// Application client id.
    #[prost(string, required, tag = "2")]
    pub client_id: String,
    /// Application client secret.
    #[prost(string, required, tag = "3")]
    pub client_secret: String,
}

/// Application authentication response (payload 2101).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaApplicationAuthRes {}

/// Account authentication request (payload 2102).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaAccountAuthReq {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    /// OAuth access token.
    #[prost(string, required, tag = "3")]
    pub access_token: String,
}

/// Account authentication response (payload 2103).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaAccountAuthRes {
    /// Authenticated account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
}

/// Accounts-by-token request (payload 2149).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaGetAccountListByAccessTokenReq {
    /// OAuth access token.
    #[prost(string, required, tag = "2")]
    pub access_token: String,
}

/// Accounts-by-token response (payload 2150).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaGetAccountListByAccessTokenRes {
    /// Token the list was requested for.
    #[prost(string, required, tag = "2")]
    pub access_token: String,
    /// Token permission scope.
    #[prost(int32, optional, tag = "3")]
    pub permission_scope: Option<i32>,
    /// Accounts the token grants access to.
    #[prost(message, repeated, tag = "4")]
    pub ctid_trader_account: Vec<ProtoOaCtidTraderAccount>,
}

/// Account descriptor in an accounts-by-token response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaCtidTraderAccount {
    /// Trading account id.
    #[prost(uint64, required, tag = "1")]
    pub ctid_trader_account_id: u64,
    /// Live (true) or demo account.
    #[prost(bool, optional, tag = "2")]
    pub is_live: Option<bool>,
    /// Trader login number.
    #[prost(int64, optional, tag = "3")]
    pub trader_login: Option<i64>,
}

/// Open API error response (payload 2142).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaErrorRes {
    /// Account the error relates to.
    #[prost(int64, optional, tag = "2")]
    pub ctid_trader_account_id: Option<i64>,
    /// Error code name.
    #[prost(string, required, tag = "3")]
    pub error_code: String,
    /// Human-readable description.
    #[prost(string, optional, tag = "4")]
    pub description: Option<String>,
    /// End of a maintenance window, when applicable.
    #[prost(int64, optional, tag = "5")]
    pub maintenance_end_timestamp: Option<i64>,
}

// =============================================================================
// Symbols
// =============================================================================

/// Symbol list request (payload 2114).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaSymbolsListReq {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    /// Whether archived symbols are included.
    #[prost(bool, optional, tag = "3")]
    pub include_archived_symbols: Option<bool>,
}

/// Symbol list response (payload 2115).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaSymbolsListRes {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    /// Listed symbols.
    #[prost(message, repeated, tag = "3")]
    pub symbol: Vec<ProtoOaLightSymbol>,
}

/// Lightweight symbol descriptor.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaLightSymbol {
    /// Symbol id.
    #[prost(int64, required, tag = "1")]
    pub symbol_id: i64,
    /// Symbol name.
    #[prost(string, optional, tag = "2")]
    pub symbol_name: Option<String>,
    /// Whether the symbol is tradable.
    #[prost(bool, optional, tag = "3")]
    pub enabled: Option<bool>,
    /// Long description.
    #[prost(string, optional, tag = "7")]
    pub description: Option<String>,
}

/// Symbol details request (payload 2116).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaSymbolByIdReq {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    /// Symbols to describe.
    #[prost(int64, repeated, packed = "false", tag = "3")]
    pub symbol_id: Vec<i64>,
}

/// Symbol details response (payload 2117).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaSymbolByIdRes {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    /// Symbol details.
    #[prost(message, repeated, tag = "3")]
    pub symbol: Vec<ProtoOaSymbol>,
}

/// Full symbol descriptor (only the precision fields are read).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaSymbol {
    /// Symbol id.
    #[prost(int64, required, tag = "1")]
    pub symbol_id: i64,
    /// Quoted decimal places.
    #[prost(int32, required, tag = "2")]
    pub digits: i32,
    /// Pip position.
    #[prost(int32, required, tag = "3")]
    pub pip_position: i32,
}

// =============================================================================
// Spots
// =============================================================================

/// Spot subscription request (payload 2127).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaSubscribeSpotsReq {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    /// Symbols to subscribe.
    #[prost(int64, repeated, packed = "false", tag = "3")]
    pub symbol_id: Vec<i64>,
    /// Ask the broker to stamp each spot event.
    #[prost(bool, optional, tag = "4")]
    pub subscribe_to_spot_timestamp: Option<bool>,
}

/// Spot subscription response (payload 2128).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaSubscribeSpotsRes {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
}

/// Spot price push (payload 2131).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaSpotEvent {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    /// Symbol id.
    #[prost(int64, required, tag = "3")]
    pub symbol_id: i64,
    /// Bid in relative format (1e-5), if changed.
    #[prost(uint64, optional, tag = "4")]
    pub bid: Option<u64>,
    /// Ask in relative format (1e-5), if changed.
    #[prost(uint64, optional, tag = "5")]
    pub ask: Option<u64>,
    /// Previous session close.
    #[prost(uint64, optional, tag = "7")]
    pub session_close: Option<u64>,
    /// Event time, epoch milliseconds.
    #[prost(int64, optional, tag = "8")]
    pub timestamp: Option<i64>,
}

// =============================================================================
// Trendbars
// =============================================================================

/// Historical trendbar request (payload 2137).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaGetTrendbarsReq {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    /// Range start, epoch milliseconds.
    #[prost(int64, optional, tag = "3")]
    pub from_timestamp: Option<i64>,
    /// Range end, epoch milliseconds.
    #[prost(int64, optional, tag = "4")]
    pub to_timestamp: Option<i64>,
    /// Aggregation period.
    #[prost(int32, required, tag = "5")]
    pub period: i32,
    /// Symbol id.
    #[prost(int64, required, tag = "6")]
    pub symbol_id: i64,
    /// Maximum number of bars.
    #[prost(uint32, optional, tag = "7")]
    pub count: Option<u32>,
}

/// Historical trendbar response (payload 2138).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaGetTrendbarsRes {
    /// Trading account id.
    #[prost(int64, required, tag = "2")]
    pub ctid_trader_account_id: i64,
    /// Aggregation period.
    #[prost(int32, required, tag = "3")]
    pub period: i32,
    /// Server time of the response.
    #[prost(int64, optional, tag = "4")]
    pub timestamp: Option<i64>,
    /// Bars, oldest first.
    #[prost(message, repeated, tag = "5")]
    pub trendbar: Vec<ProtoOaTrendbar>,
    /// Symbol id.
    #[prost(int64, optional, tag = "6")]
    pub symbol_id: Option<i64>,
    /// Whether the range was truncated.
    #[prost(bool, optional, tag = "7")]
    pub has_more: Option<bool>,
}

/// Delta-encoded OHLCV bar.
///
/// `low` is absolute in relative format (1e-5); open, high and close are
/// unsigned offsets above `low`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoOaTrendbar {
    /// Volume.
    #[prost(int64, required, tag = "3")]
    pub volume: i64,
    /// Aggregation period.
    #[prost(int32, optional, tag = "4")]
    pub period: Option<i32>,
    /// Absolute low.
    #[prost(int64, optional, tag = "5")]
    pub low: Option<i64>,
    /// Open minus low.
    #[prost(uint64, optional, tag = "6")]
    pub delta_open: Option<u64>,
    /// Close minus low.
    #[prost(uint64, optional, tag = "7")]
    pub delta_close: Option<u64>,
    /// High minus low.
    #[prost(uint64, optional, tag = "8")]
    pub delta_high: Option<u64>,
    /// Bar open time, minutes since the Unix epoch (UTC).
    #[prost(uint32, optional, tag = "9")]
    pub utc_timestamp_in_minutes: Option<u32>,
}
