//! Error types for the channel layer.

use dst_core::{
    Address, ListenerAddrError, MessageId, MessageStatus, Role, SessionIdError, SignatureError,
};
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::config::AdapterType;

/// Errors surfaced by a channel adapter and its background tasks.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("channel not connected")]
    NotConnected,

    #[error("channel already closed")]
    AlreadyClosed,

    /// A background task stopped with an error before the adapter was closed.
    #[error("channel close error: {0}")]
    HandlerExited(#[source] Box<AdapterError>),

    /// The background task went away without reporting an error.
    #[error("channel handler is gone")]
    HandlerGone,

    #[error("websocket: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("no frame from peer within {0:?}")]
    ReadTimeout(Duration),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("connection closed by peer")]
    ClosedByPeer,

    /// Non-binary data frame. The connection stays usable.
    #[error("message type not binary")]
    NonBinaryFrame,

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("decoding message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("encoding message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("unsupported adapter type: {0}")]
    UnsupportedAdapter(AdapterType),
}

/// Errors produced by the request-response exchanges.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Transport(#[from] AdapterError),

    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage { expected: MessageId, got: MessageId },

    #[error("invalid status {status} in {id}")]
    InvalidStatus { id: MessageId, status: MessageStatus },

    /// A field the peer had to echo verbatim came back altered.
    #[error("peer tampered with {0} in response")]
    PeerTampered(&'static str),

    #[error("instance has no adapter")]
    NoAdapter,
}

/// Errors produced by channel instance mutators.
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("instance has no adapter")]
    NoAdapter,

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("channel role not set")]
    RoleNotSet,

    #[error("{0} signature does not verify")]
    InvalidSignature(Role),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    SessionId(#[from] SessionIdError),

    #[error("state version {proposed} is not greater than current version {current}")]
    StaleVersion { current: String, proposed: String },
}

/// Errors produced while starting a session or opening a channel.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    ListenerAddr(#[from] ListenerAddrError),

    #[error("listener: {0}")]
    Listener(#[from] std::io::Error),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("peer identity mismatch: expected {expected}, got {got}")]
    PeerMismatch { expected: Address, got: Address },

    #[error("listener self check failed: {0}")]
    SelfCheck(String),
}
