//! Protocol messages.
//!
//! Every message travels in a [`ChMsgPkt`] envelope. The envelope names its
//! payload with a `message_id` string; decoding first reads the id and only
//! then the payload shape that id selects.

use alloy_primitives::Address;
use chrono::{DateTime, FixedOffset, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::contract::ContractHandler;
use crate::error::MessageError;
use crate::identity::OffChainId;
use crate::primitives::{MscBaseStateSigned, SessionId, VpcStateSigned};

/// Version of the message protocol.
pub const VERSION: &str = "0.1";

/// Identifies the kind of payload carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    IdentityRequest,
    IdentityResponse,
    NewChannelRequest,
    NewChannelResponse,
    SessionIdRequest,
    SessionIdResponse,
    ContractAddrRequest,
    ContractAddrResponse,
    MscBaseStateRequest,
    MscBaseStateResponse,
    VpcStateRequest,
    VpcStateResponse,
}

impl MessageId {
    pub const ALL: [MessageId; 12] = [
        Self::IdentityRequest,
        Self::IdentityResponse,
        Self::NewChannelRequest,
        Self::NewChannelResponse,
        Self::SessionIdRequest,
        Self::SessionIdResponse,
        Self::ContractAddrRequest,
        Self::ContractAddrResponse,
        Self::MscBaseStateRequest,
        Self::MscBaseStateResponse,
        Self::VpcStateRequest,
        Self::VpcStateResponse,
    ];

    /// Wire name of the id.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdentityRequest => "MsgIdentityRequest",
            Self::IdentityResponse => "MsgIdentityResponse",
            Self::NewChannelRequest => "MsgNewChannelRequest",
            Self::NewChannelResponse => "MsgNewChannelResponse",
            Self::SessionIdRequest => "MsgSessionIdRequest",
            Self::SessionIdResponse => "MsgSessionIdResponse",
            Self::ContractAddrRequest => "MsgContractAddrRequest",
            Self::ContractAddrResponse => "MsgContractAddrResponse",
            Self::MscBaseStateRequest => "MsgMSCBaseStateRequest",
            Self::MscBaseStateResponse => "MsgMSCBaseStateResponse",
            Self::VpcStateRequest => "MsgVPCStateRequest",
            Self::VpcStateResponse => "MsgVPCStateResponse",
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageId {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| MessageError::UnsupportedMessageId(s.to_string()))
    }
}

/// Status field of a request or response payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Require,
    Accept,
    Decline,
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Require => "require",
            Self::Accept => "accept",
            Self::Decline => "decline",
            Self::Unknown => "unknown",
        })
    }
}

/// Statuses a request may carry.
pub const REQUEST_STATUS_LIST: &[MessageStatus] = &[MessageStatus::Require];

/// Statuses a response may carry.
pub const RESPONSE_STATUS_LIST: &[MessageStatus] = &[MessageStatus::Accept, MessageStatus::Decline];

/// Whether `status` is one of `list`.
pub fn contains_status(list: &[MessageStatus], status: MessageStatus) -> bool {
    list.contains(&status)
}

/// Identity of the sending party.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgIdentity {
    pub id: OffChainId,
}

/// Negotiates the contract store and message protocol versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgNewChannel {
    #[serde(with = "hex::serde")]
    pub contract_store_version: Vec<u8>,
    pub msg_protocol_version: String,
    pub status: MessageStatus,
    pub reason: String,
}

/// Carries the session id under construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgSessionId {
    pub sid: SessionId,
    pub status: MessageStatus,
}

/// Carries the address of a deployed contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgContractAddr {
    pub addr: Address,
    pub contract_type: ContractHandler,
    pub status: MessageStatus,
}

/// Carries the signed msc base state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgMscBaseState {
    pub signed_state_val: MscBaseStateSigned,
    pub status: MessageStatus,
}

/// Carries a signed vpc state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgVpcState {
    pub signed_state_val: VpcStateSigned,
    pub status: MessageStatus,
}

/// A protocol message. The variant determines the wire `message_id`.
///
/// Serializes as the bare payload; the id is written by the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Message {
    IdentityRequest(MsgIdentity),
    IdentityResponse(MsgIdentity),
    NewChannelRequest(MsgNewChannel),
    NewChannelResponse(MsgNewChannel),
    SessionIdRequest(MsgSessionId),
    SessionIdResponse(MsgSessionId),
    ContractAddrRequest(MsgContractAddr),
    ContractAddrResponse(MsgContractAddr),
    MscBaseStateRequest(MsgMscBaseState),
    MscBaseStateResponse(MsgMscBaseState),
    VpcStateRequest(MsgVpcState),
    VpcStateResponse(MsgVpcState),
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Self::IdentityRequest(_) => MessageId::IdentityRequest,
            Self::IdentityResponse(_) => MessageId::IdentityResponse,
            Self::NewChannelRequest(_) => MessageId::NewChannelRequest,
            Self::NewChannelResponse(_) => MessageId::NewChannelResponse,
            Self::SessionIdRequest(_) => MessageId::SessionIdRequest,
            Self::SessionIdResponse(_) => MessageId::SessionIdResponse,
            Self::ContractAddrRequest(_) => MessageId::ContractAddrRequest,
            Self::ContractAddrResponse(_) => MessageId::ContractAddrResponse,
            Self::MscBaseStateRequest(_) => MessageId::MscBaseStateRequest,
            Self::MscBaseStateResponse(_) => MessageId::MscBaseStateResponse,
            Self::VpcStateRequest(_) => MessageId::VpcStateRequest,
            Self::VpcStateResponse(_) => MessageId::VpcStateResponse,
        }
    }

    /// Decode the payload shape selected by `id`.
    pub fn from_payload(id: MessageId, payload: serde_json::Value) -> Result<Self, MessageError> {
        fn decode<T: serde::de::DeserializeOwned>(
            id: MessageId,
            payload: serde_json::Value,
        ) -> Result<T, MessageError> {
            serde_json::from_value(payload).map_err(|source| MessageError::Payload { id, source })
        }

        Ok(match id {
            MessageId::IdentityRequest => Self::IdentityRequest(decode(id, payload)?),
            MessageId::IdentityResponse => Self::IdentityResponse(decode(id, payload)?),
            MessageId::NewChannelRequest => Self::NewChannelRequest(decode(id, payload)?),
            MessageId::NewChannelResponse => Self::NewChannelResponse(decode(id, payload)?),
            MessageId::SessionIdRequest => Self::SessionIdRequest(decode(id, payload)?),
            MessageId::SessionIdResponse => Self::SessionIdResponse(decode(id, payload)?),
            MessageId::ContractAddrRequest => Self::ContractAddrRequest(decode(id, payload)?),
            MessageId::ContractAddrResponse => Self::ContractAddrResponse(decode(id, payload)?),
            MessageId::MscBaseStateRequest => Self::MscBaseStateRequest(decode(id, payload)?),
            MessageId::MscBaseStateResponse => Self::MscBaseStateResponse(decode(id, payload)?),
            MessageId::VpcStateRequest => Self::VpcStateRequest(decode(id, payload)?),
            MessageId::VpcStateResponse => Self::VpcStateResponse(decode(id, payload)?),
        })
    }
}

/// Envelope of every message exchanged between two nodes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawChMsgPkt")]
pub struct ChMsgPkt {
    pub version: String,
    pub message: Message,
    pub timestamp: DateTime<FixedOffset>,
}

impl ChMsgPkt {
    /// Wrap `message` with the current protocol version and time.
    pub fn new(message: Message) -> Self {
        Self {
            version: VERSION.to_string(),
            message,
            timestamp: Local::now().fixed_offset(),
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message.id()
    }
}

#[derive(Serialize)]
struct WirePkt<'a> {
    version: &'a str,
    message_id: &'static str,
    message: &'a Message,
    timestamp: &'a DateTime<FixedOffset>,
}

impl Serialize for ChMsgPkt {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WirePkt {
            version: &self.version,
            message_id: self.message.id().as_str(),
            message: &self.message,
            timestamp: &self.timestamp,
        }
        .serialize(serializer)
    }
}

#[derive(Deserialize)]
struct RawChMsgPkt {
    version: String,
    message_id: String,
    message: serde_json::Value,
    timestamp: DateTime<FixedOffset>,
}

impl TryFrom<RawChMsgPkt> for ChMsgPkt {
    type Error = MessageError;

    fn try_from(raw: RawChMsgPkt) -> Result<Self, Self::Error> {
        let id = raw.message_id.parse()?;
        Ok(Self {
            version: raw.version,
            message: Message::from_payload(id, raw.message)?,
            timestamp: raw.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{MscBaseState, VpcState};
    use alloy_primitives::U256;

    fn sample(id: MessageId) -> Message {
        let peer = OffChainId::new(Address::repeat_byte(7), "127.0.0.1:9605", "/dst");
        let mut sid = SessionId::new(Address::repeat_byte(1), Address::repeat_byte(2));
        sid.generate_sender_part(Address::repeat_byte(1)).unwrap();
        let new_channel = MsgNewChannel {
            contract_store_version: vec![0xde, 0xad],
            msg_protocol_version: VERSION.to_string(),
            status: MessageStatus::Require,
            reason: String::new(),
        };
        let contract = MsgContractAddr {
            addr: Address::repeat_byte(3),
            contract_type: ContractHandler::new("VPC", "0.0.1", "aa", "bb"),
            status: MessageStatus::Accept,
        };
        let msc = MsgMscBaseState {
            signed_state_val: MscBaseStateSigned::new(MscBaseState {
                sid: U256::from(5u64),
                ..Default::default()
            }),
            status: MessageStatus::Require,
        };
        let vpc = MsgVpcState {
            signed_state_val: VpcStateSigned::new(VpcState {
                id: vec![9; 32],
                version: U256::from(2u64),
                ..Default::default()
            }),
            status: MessageStatus::Decline,
        };
        let sid = MsgSessionId {
            sid,
            status: MessageStatus::Require,
        };

        match id {
            MessageId::IdentityRequest => Message::IdentityRequest(MsgIdentity { id: peer }),
            MessageId::IdentityResponse => Message::IdentityResponse(MsgIdentity { id: peer }),
            MessageId::NewChannelRequest => Message::NewChannelRequest(new_channel),
            MessageId::NewChannelResponse => Message::NewChannelResponse(new_channel),
            MessageId::SessionIdRequest => Message::SessionIdRequest(sid),
            MessageId::SessionIdResponse => Message::SessionIdResponse(sid),
            MessageId::ContractAddrRequest => Message::ContractAddrRequest(contract),
            MessageId::ContractAddrResponse => Message::ContractAddrResponse(contract),
            MessageId::MscBaseStateRequest => Message::MscBaseStateRequest(msc),
            MessageId::MscBaseStateResponse => Message::MscBaseStateResponse(msc),
            MessageId::VpcStateRequest => Message::VpcStateRequest(vpc),
            MessageId::VpcStateResponse => Message::VpcStateResponse(vpc),
        }
    }

    #[test]
    fn envelope_carries_each_message_kind() {
        for id in MessageId::ALL {
            let pkt = ChMsgPkt::new(sample(id));
            let json = serde_json::to_value(&pkt).unwrap();
            assert_eq!(json["message_id"], id.as_str());
            assert_eq!(json["version"], VERSION);

            let decoded: ChMsgPkt = serde_json::from_value(json).unwrap();
            assert_eq!(decoded.message_id(), id);
            assert_eq!(decoded, pkt);
        }
    }

    #[test]
    fn unknown_message_id_is_rejected() {
        let json = serde_json::json!({
            "version": VERSION,
            "message_id": "MsgBogusRequest",
            "message": {},
            "timestamp": "2018-06-01T10:00:00+02:00",
        });
        let err = serde_json::from_value::<ChMsgPkt>(json).unwrap_err();
        assert!(err.to_string().contains("unsupported message id - MsgBogusRequest"));
    }

    #[test]
    fn payload_shape_must_match_id() {
        let raw = RawChMsgPkt {
            version: VERSION.to_string(),
            message_id: MessageId::SessionIdRequest.as_str().to_string(),
            message: serde_json::json!({ "id": "nope" }),
            timestamp: Local::now().fixed_offset(),
        };
        let err = ChMsgPkt::try_from(raw).unwrap_err();
        assert!(matches!(
            err,
            MessageError::Payload { id: MessageId::SessionIdRequest, .. }
        ));
    }

    #[test]
    fn status_lists() {
        assert!(contains_status(REQUEST_STATUS_LIST, MessageStatus::Require));
        assert!(!contains_status(REQUEST_STATUS_LIST, MessageStatus::Accept));
        assert!(contains_status(RESPONSE_STATUS_LIST, MessageStatus::Decline));
        assert!(!contains_status(RESPONSE_STATUS_LIST, MessageStatus::Unknown));

        let status: MessageStatus = serde_json::from_str("\"whatever\"").unwrap();
        assert_eq!(status, MessageStatus::Unknown);
        assert_eq!(serde_json::to_string(&MessageStatus::Accept).unwrap(), "\"accept\"");
    }

    #[test]
    fn message_id_parse() {
        for id in MessageId::ALL {
            assert_eq!(id.as_str().parse::<MessageId>().unwrap(), id);
        }
        assert!(matches!(
            "MsgUnknown".parse::<MessageId>(),
            Err(MessageError::UnsupportedMessageId(s)) if s == "MsgUnknown"
        ));
    }
}
