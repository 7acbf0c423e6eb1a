//! Error types for the core primitives.

use thiserror::Error;

use crate::message::MessageId;

/// Errors produced while signing or verifying Ethereum-style signatures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// The identity has no signing key attached.
    #[error("credentials not set in identity")]
    MissingCredentials,
    /// The signature is not 65 bytes long.
    #[error("invalid Ethereum signature (length is {0}, expected 65 bytes)")]
    InvalidLength(usize),
    /// The trailing recovery byte is not 27 or 28.
    #[error("invalid Ethereum signature (V is {0}, expected 27 or 28)")]
    InvalidRecoveryByte(u8),
    /// The private key material could not be parsed.
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    /// The underlying ECDSA operation failed.
    #[error("ecdsa: {0}")]
    Ecdsa(String),
}

/// Errors produced by session id derivation and validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionIdError {
    #[error("session id is locked for further changes")]
    Locked,
    #[error("session id is not locked")]
    NotLocked,
    #[error("sid sender part is empty")]
    MissingSenderPart,
    #[error("sid receiver part is empty")]
    MissingReceiverPart,
    #[error("sid sender part invalid")]
    InvalidSenderPart,
    #[error("sid receiver part invalid")]
    InvalidReceiverPart,
    #[error("sid complete invalid")]
    InvalidComplete,
}

/// Errors produced while decoding a wire envelope.
#[derive(Debug, Error)]
pub enum MessageError {
    /// The envelope carried a message id outside the closed set.
    #[error("unsupported message id - {0}")]
    UnsupportedMessageId(String),
    /// The payload did not match the shape selected by the message id.
    #[error("invalid payload for {id}: {source}")]
    Payload {
        id: MessageId,
        #[source]
        source: serde_json::Error,
    },
}
