//! Open API Frame Codec
//!
//! Encodes outbound requests into [`ProtoMessage`] envelopes and decodes
//! inbound envelopes into typed messages.
//!
//! # Framing
//!
//! ```text
//! +----------------+-----------------------------------------------+
//! | length (u32BE) | ProtoMessage { payloadType, payload, msgId }  |
//! +----------------+-----------------------------------------------+
//! ```
//!
//! The length prefix is handled by [`LengthDelimitedCodec`]; this module
//! only deals with the envelope body.

use bytes::Bytes;
use prost::Message;
use tokio_util::codec::LengthDelimitedCodec;

use super::messages::{
    PayloadType, ProtoErrorRes, ProtoHeartbeatEvent, ProtoMessage, ProtoOaAccountAuthReq,
    ProtoOaAccountAuthRes, ProtoOaApplicationAuthReq, ProtoOaErrorRes,
    ProtoOaGetAccountListByAccessTokenReq, ProtoOaGetAccountListByAccessTokenRes,
    ProtoOaGetTrendbarsReq, ProtoOaGetTrendbarsRes, ProtoOaSpotEvent, ProtoOaSubscribeSpotsReq,
    ProtoOaSubscribeSpotsRes, ProtoOaSymbolByIdReq, ProtoOaSymbolByIdRes, ProtoOaSymbolsListReq,
    ProtoOaSymbolsListRes,
};

/// Largest frame accepted from the broker (a full symbol list is a few MiB).
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Protobuf decoding failed.
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Payload type not valid in this direction.
    #[error("unexpected payload type: {0}")]
    UnexpectedPayloadType(u32),
}

/// Length-prefix codec configured for the Open API framing.
#[must_use]
pub fn length_delimited() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

// =============================================================================
// Message Enums
// =============================================================================

/// Requests the client sends.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Application authentication.
    ApplicationAuth(ProtoOaApplicationAuthReq),
    /// Account authentication.
    AccountAuth(ProtoOaAccountAuthReq),
    /// Accounts available to the access token.
    AccountList(ProtoOaGetAccountListByAccessTokenReq),
    /// Full symbol list.
    SymbolsList(ProtoOaSymbolsListReq),
    /// Symbol details.
    SymbolById(ProtoOaSymbolByIdReq),
    /// Historical bars.
    Trendbars(ProtoOaGetTrendbarsReq),
    /// Spot subscription.
    SubscribeSpots(ProtoOaSubscribeSpotsReq),
    /// Keepalive.
    Heartbeat,
}

impl OutboundMessage {
    /// Payload type of this request.
    #[must_use]
    pub const fn payload_type(&self) -> PayloadType {
        match self {
            Self::ApplicationAuth(_) => PayloadType::ApplicationAuthReq,
            Self::AccountAuth(_) => PayloadType::AccountAuthReq,
            Self::AccountList(_) => PayloadType::GetAccountListReq,
            Self::SymbolsList(_) => PayloadType::SymbolsListReq,
            Self::SymbolById(_) => PayloadType::SymbolByIdReq,
            Self::Trendbars(_) => PayloadType::GetTrendbarsReq,
            Self::SubscribeSpots(_) => PayloadType::SubscribeSpotsReq,
            Self::Heartbeat => PayloadType::HeartbeatEvent,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        match self {
            Self::ApplicationAuth(m) => m.encode_to_vec(),
            Self::AccountAuth(m) => m.encode_to_vec(),
            Self::AccountList(m) => m.encode_to_vec(),
            Self::SymbolsList(m) => m.encode_to_vec(),
            Self::SymbolById(m) => m.encode_to_vec(),
            Self::Trendbars(m) => m.encode_to_vec(),
            Self::SubscribeSpots(m) => m.encode_to_vec(),
            Self::Heartbeat => ProtoHeartbeatEvent {}.encode_to_vec(),
        }
    }

    /// Decode a request payload (broker side of the conversation).
    ///
    /// # Errors
    ///
    /// Returns an error for response payload types or malformed payloads.
    pub fn decode(payload_type: u32, payload: &[u8]) -> Result<Self, CodecError> {
        let kind = PayloadType::from_u32(payload_type)
            .ok_or(CodecError::UnexpectedPayloadType(payload_type))?;

        Ok(match kind {
            PayloadType::ApplicationAuthReq => {
                Self::ApplicationAuth(ProtoOaApplicationAuthReq::decode(payload)?)
            }
            PayloadType::AccountAuthReq => Self::AccountAuth(ProtoOaAccountAuthReq::decode(payload)?),
            PayloadType::GetAccountListReq => {
                Self::AccountList(ProtoOaGetAccountListByAccessTokenReq::decode(payload)?)
            }
            PayloadType::SymbolsListReq => Self::SymbolsList(ProtoOaSymbolsListReq::decode(payload)?),
            PayloadType::SymbolByIdReq => Self::SymbolById(ProtoOaSymbolByIdReq::decode(payload)?),
            PayloadType::GetTrendbarsReq => Self::Trendbars(ProtoOaGetTrendbarsReq::decode(payload)?),
            PayloadType::SubscribeSpotsReq => {
                Self::SubscribeSpots(ProtoOaSubscribeSpotsReq::decode(payload)?)
            }
            PayloadType::HeartbeatEvent => Self::Heartbeat,
            other => return Err(CodecError::UnexpectedPayloadType(other.as_u32())),
        })
    }
}

/// Error reported by the broker, from either error payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerError {
    /// Error code name, e.g. `CH_CLIENT_AUTH_FAILURE`.
    pub code: String,
    /// Description, when the broker sent one.
    pub description: Option<String>,
}

impl BrokerError {
    /// Whether the broker rejected the account id.
    #[must_use]
    pub fn is_account_not_found(&self) -> bool {
        self.code.contains("ACCOUNT_NOT_FOUND")
    }
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {description}", self.code),
            None => f.write_str(&self.code),
        }
    }
}

impl From<ProtoErrorRes> for BrokerError {
    fn from(res: ProtoErrorRes) -> Self {
        Self {
            code: res.error_code,
            description: res.description,
        }
    }
}

impl From<ProtoOaErrorRes> for BrokerError {
    fn from(res: ProtoOaErrorRes) -> Self {
        Self {
            code: res.error_code,
            description: res.description,
        }
    }
}

/// Messages the broker sends.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Application authenticated.
    ApplicationAuth,
    /// Account authenticated.
    AccountAuth(ProtoOaAccountAuthRes),
    /// Accounts available to the access token.
    AccountList(ProtoOaGetAccountListByAccessTokenRes),
    /// Full symbol list.
    SymbolsList(ProtoOaSymbolsListRes),
    /// Symbol details.
    SymbolById(ProtoOaSymbolByIdRes),
    /// Historical bars.
    Trendbars(ProtoOaGetTrendbarsRes),
    /// Spot subscription confirmed.
    SubscribeSpots(ProtoOaSubscribeSpotsRes),
    /// Spot price push.
    Spot(ProtoOaSpotEvent),
    /// Error response.
    Error(BrokerError),
    /// Keepalive.
    Heartbeat,
    /// A payload type the client does not handle.
    Other(u32),
}

impl InboundMessage {
    /// Metric / log label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::ApplicationAuth => "application_auth",
            Self::AccountAuth(_) => "account_auth",
            Self::AccountList(_) => "account_list",
            Self::SymbolsList(_) => "symbols_list",
            Self::SymbolById(_) => "symbol_by_id",
            Self::Trendbars(_) => "trendbars",
            Self::SubscribeSpots(_) => "subscribe_spots",
            Self::Spot(_) => "spot_event",
            Self::Error(_) => "error",
            Self::Heartbeat => "heartbeat",
            Self::Other(_) => "other",
        }
    }
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<M> {
    /// Correlation id, if present.
    pub client_msg_id: Option<String>,
    /// Decoded message.
    pub message: M,
}

// =============================================================================
// Codec
// =============================================================================

/// Protobuf envelope codec for the client side of the connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtoCodec;

impl ProtoCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Encode a request into an envelope body.
    #[must_use]
    pub fn encode(&self, message: &OutboundMessage, client_msg_id: Option<&str>) -> Bytes {
        envelope_bytes(
            message.payload_type().as_u32(),
            message.encode_payload(),
            client_msg_id,
        )
    }

    /// Decode an envelope body.
    ///
    /// Unknown payload types decode to [`InboundMessage::Other`].
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope or its payload is malformed.
    pub fn decode(&self, frame: &[u8]) -> Result<Envelope<InboundMessage>, CodecError> {
        let envelope = decode_envelope(frame)?;
        let payload = envelope.payload.as_deref().unwrap_or_default();

        let message = match PayloadType::from_u32(envelope.payload_type) {
            Some(PayloadType::ApplicationAuthRes) => InboundMessage::ApplicationAuth,
            Some(PayloadType::AccountAuthRes) => {
                InboundMessage::AccountAuth(ProtoOaAccountAuthRes::decode(payload)?)
            }
            Some(PayloadType::GetAccountListRes) => {
                InboundMessage::AccountList(ProtoOaGetAccountListByAccessTokenRes::decode(payload)?)
            }
            Some(PayloadType::SymbolsListRes) => {
                InboundMessage::SymbolsList(ProtoOaSymbolsListRes::decode(payload)?)
            }
            Some(PayloadType::SymbolByIdRes) => {
                InboundMessage::SymbolById(ProtoOaSymbolByIdRes::decode(payload)?)
            }
            Some(PayloadType::GetTrendbarsRes) => {
                InboundMessage::Trendbars(ProtoOaGetTrendbarsRes::decode(payload)?)
            }
            Some(PayloadType::SubscribeSpotsRes) => {
                InboundMessage::SubscribeSpots(ProtoOaSubscribeSpotsRes::decode(payload)?)
            }
            Some(PayloadType::SpotEvent) => InboundMessage::Spot(ProtoOaSpotEvent::decode(payload)?),
            Some(PayloadType::ErrorRes) => {
                InboundMessage::Error(ProtoErrorRes::decode(payload)?.into())
            }
            Some(PayloadType::OaErrorRes) => {
                InboundMessage::Error(ProtoOaErrorRes::decode(payload)?.into())
            }
            Some(PayloadType::HeartbeatEvent) => InboundMessage::Heartbeat,
            _ => InboundMessage::Other(envelope.payload_type),
        };

        Ok(Envelope {
            client_msg_id: envelope.client_msg_id,
            message,
        })
    }
}

/// Encode any payload message into an envelope body.
#[must_use]
pub fn encode_frame(
    payload_type: PayloadType,
    payload: &impl Message,
    client_msg_id: Option<&str>,
) -> Bytes {
    envelope_bytes(payload_type.as_u32(), payload.encode_to_vec(), client_msg_id)
}

/// Decode the outer envelope without interpreting the payload.
///
/// # Errors
///
/// Returns an error if the envelope is malformed.
pub fn decode_envelope(frame: &[u8]) -> Result<ProtoMessage, CodecError> {
    Ok(ProtoMessage::decode(frame)?)
}

fn envelope_bytes(payload_type: u32, payload: Vec<u8>, client_msg_id: Option<&str>) -> Bytes {
    ProtoMessage {
        payload_type,
        payload: Some(payload),
        client_msg_id: client_msg_id.map(str::to_string),
    }
    .encode_to_vec()
    .into()
}
