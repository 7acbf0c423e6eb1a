//! Core types for direct state transfer channels.
//!
//! This crate provides the identities, signed state primitives and wire
//! messages shared by both ends of an off-chain channel. It performs no I/O;
//! transports live in `dst-channel`.

mod contract;
mod error;
mod identity;
mod message;
mod primitives;
mod signature;

pub use contract::{ContractHandler, ContractStore};
pub use error::{MessageError, SessionIdError, SignatureError};
pub use identity::{ListenerAddrError, OffChainId};
pub use message::{
    contains_status, ChMsgPkt, Message, MessageId, MessageStatus, MsgContractAddr, MsgIdentity,
    MsgMscBaseState, MsgNewChannel, MsgSessionId, MsgVpcState, REQUEST_STATUS_LIST,
    RESPONSE_STATUS_LIST, VERSION,
};
pub use primitives::{
    generate_random_number, MscBaseState, MscBaseStateSigned, Role, SessionId, SignedState,
    VpcState, VpcStateId, VpcStateSigned, SESSION_ID_NONCE_SIZE,
};
pub use signature::{
    rehash_with_ethereum_prefix, sign_hash_eth, verify_signature_eth, Credentials, SIGNATURE_LEN,
};

pub use alloy_primitives::{Address, B256, U256};
