//! Signed channel state primitives.
//!
//! Every state has a canonical preimage: the Solidity tightly packed encoding
//! of its fields in declaration order (addresses as 20 bytes, integers as
//! 32-byte big-endian words). The keccak-256 of that preimage is what both
//! parties sign, so the field order below must not change.

use alloy_primitives::{keccak256, Address, B256, U256};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{SessionIdError, SignatureError};
use crate::identity::OffChainId;
use crate::signature::{sign_hash_eth, verify_signature_eth};

/// Size in bytes of the nonces used for session id generation.
pub const SESSION_ID_NONCE_SIZE: usize = 32;

/// Role of a participant in a channel or in a closing procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Initiated the channel (or the closing procedure).
    Sender,
    /// Accepted the channel (or responds to the closing procedure).
    Receiver,
}

impl Role {
    /// The role of the other participant.
    pub fn counterpart(self) -> Self {
        match self {
            Self::Sender => Self::Receiver,
            Self::Receiver => Self::Sender,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sender => f.write_str("sender"),
            Self::Receiver => f.write_str("receiver"),
        }
    }
}

/// Solidity `abi.encodePacked` builder.
#[derive(Default)]
struct Packed(Vec<u8>);

impl Packed {
    fn address(mut self, addr: &Address) -> Self {
        self.0.extend_from_slice(addr.as_slice());
        self
    }

    fn uint256(mut self, value: &U256) -> Self {
        self.0.extend_from_slice(&value.to_be_bytes::<32>());
        self
    }

    /// Left-aligned, zero padded on the right, truncated past 32 bytes.
    fn bytes32(mut self, bytes: &[u8]) -> Self {
        let mut word = [0u8; 32];
        let n = bytes.len().min(32);
        word[..n].copy_from_slice(&bytes[..n]);
        self.0.extend_from_slice(&word);
        self
    }

    fn keccak(self) -> B256 {
        keccak256(&self.0)
    }
}

/// Generate `size` cryptographically random bytes.
pub fn generate_random_number(size: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; size];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

fn part_hash(nonce: &[u8], addr: &Address) -> Vec<u8> {
    let mut preimage = nonce.to_vec();
    preimage.extend_from_slice(addr.as_slice());
    keccak256(&preimage).to_vec()
}

fn complete_hash(sender_part: &[u8], receiver_part: &[u8]) -> U256 {
    let mut preimage = sender_part.to_vec();
    preimage.extend_from_slice(receiver_part);
    U256::from_be_bytes(keccak256(&preimage).0)
}

/// Unique identifier of an off-chain channel.
///
/// Built in three steps: the sender contributes `hash(nonce_sender || addr_sender)`,
/// the receiver contributes `hash(nonce_receiver || addr_receiver)`, and the
/// complete id is the hash of both parts. Generating the complete id locks
/// the session id; every generator fails on a locked id without touching it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionId {
    pub sid_complete: Option<U256>,
    #[serde(with = "hex::serde")]
    pub sid_sender_part: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub sid_receiver_part: Vec<u8>,

    pub addr_sender: Address,
    pub addr_receiver: Address,
    #[serde(with = "hex::serde")]
    pub nonce_sender: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub nonce_receiver: Vec<u8>,

    pub locked: bool,
}

impl SessionId {
    /// An unlocked session id with only the addresses set.
    pub fn new(addr_sender: Address, addr_receiver: Address) -> Self {
        Self {
            addr_sender,
            addr_receiver,
            ..Default::default()
        }
    }

    /// Sender parts, receiver parts and complete id are all equal.
    pub fn equal(&self, other: &Self) -> bool {
        self.equal_sender(other)
            && self.equal_receiver(other)
            && self.sid_complete == other.sid_complete
    }

    /// Address, nonce and derived part of the sender are equal.
    pub fn equal_sender(&self, other: &Self) -> bool {
        self.addr_sender == other.addr_sender
            && self.nonce_sender == other.nonce_sender
            && self.sid_sender_part == other.sid_sender_part
    }

    /// Address, nonce and derived part of the receiver are equal.
    pub fn equal_receiver(&self, other: &Self) -> bool {
        self.addr_receiver == other.addr_receiver
            && self.nonce_receiver == other.nonce_receiver
            && self.sid_receiver_part == other.sid_receiver_part
    }

    /// Generate the sender part from a fresh random nonce.
    pub fn generate_sender_part(&mut self, addr_sender: Address) -> Result<(), SessionIdError> {
        self.generate_sender_part_with_nonce(
            addr_sender,
            generate_random_number(SESSION_ID_NONCE_SIZE),
        )
    }

    /// Generate the sender part from the given nonce.
    pub fn generate_sender_part_with_nonce(
        &mut self,
        addr_sender: Address,
        nonce: Vec<u8>,
    ) -> Result<(), SessionIdError> {
        if self.locked {
            return Err(SessionIdError::Locked);
        }
        self.sid_sender_part = part_hash(&nonce, &addr_sender);
        self.addr_sender = addr_sender;
        self.nonce_sender = nonce;
        Ok(())
    }

    /// Generate the receiver part from a fresh random nonce.
    pub fn generate_receiver_part(&mut self, addr_receiver: Address) -> Result<(), SessionIdError> {
        self.generate_receiver_part_with_nonce(
            addr_receiver,
            generate_random_number(SESSION_ID_NONCE_SIZE),
        )
    }

    /// Generate the receiver part from the given nonce.
    pub fn generate_receiver_part_with_nonce(
        &mut self,
        addr_receiver: Address,
        nonce: Vec<u8>,
    ) -> Result<(), SessionIdError> {
        if self.locked {
            return Err(SessionIdError::Locked);
        }
        self.sid_receiver_part = part_hash(&nonce, &addr_receiver);
        self.addr_receiver = addr_receiver;
        self.nonce_receiver = nonce;
        Ok(())
    }

    /// Combine both parts into the complete id and lock the session id.
    pub fn generate_complete_sid(&mut self) -> Result<(), SessionIdError> {
        if self.locked {
            return Err(SessionIdError::Locked);
        }
        if self.sid_sender_part.is_empty() {
            return Err(SessionIdError::MissingSenderPart);
        }
        if self.sid_receiver_part.is_empty() {
            return Err(SessionIdError::MissingReceiverPart);
        }

        self.sid_complete = Some(complete_hash(&self.sid_sender_part, &self.sid_receiver_part));
        self.locked = true;
        tracing::info!("complete session id generated");
        Ok(())
    }

    /// Check the lock and all three hash relations.
    pub fn validate(&self) -> Result<(), SessionIdError> {
        if !self.locked {
            return Err(SessionIdError::NotLocked);
        }
        if self.sid_sender_part.is_empty() {
            return Err(SessionIdError::MissingSenderPart);
        }
        if self.sid_receiver_part.is_empty() {
            return Err(SessionIdError::MissingReceiverPart);
        }

        let sender_part = part_hash(&self.nonce_sender, &self.addr_sender);
        if sender_part != self.sid_sender_part {
            return Err(SessionIdError::InvalidSenderPart);
        }
        let receiver_part = part_hash(&self.nonce_receiver, &self.addr_receiver);
        if receiver_part != self.sid_receiver_part {
            return Err(SessionIdError::InvalidReceiverPart);
        }
        if self.sid_complete != Some(complete_hash(&sender_part, &receiver_part)) {
            return Err(SessionIdError::InvalidComplete);
        }
        Ok(())
    }

    /// Shorthand for `validate().is_ok()`.
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Hash of the session id as emitted by the vpc closing and closed events.
    pub fn solidity_sha3(&self) -> B256 {
        Packed::default()
            .uint256(&self.sid_complete.unwrap_or_default())
            .address(&self.addr_sender)
            .address(&self.addr_receiver)
            .keccak()
    }
}

/// A state carrying one signature slot per channel role.
///
/// Implementors only describe where the hash and signatures live; signing and
/// verification are shared.
pub trait SignedState {
    /// Keccak-256 of the canonical preimage of the embedded state.
    fn state_hash(&self) -> B256;

    /// Signature slot of `role`.
    fn signature(&self, role: Role) -> &[u8];

    /// Mutable signature slot of `role`.
    fn signature_mut(&mut self, role: Role) -> &mut Vec<u8>;

    /// Sign the state with `id`'s credentials into the slot of `role`.
    fn add_sign(&mut self, id: &OffChainId, role: Role) -> Result<(), SignatureError> {
        let credentials = id.credentials().ok_or(SignatureError::MissingCredentials)?;
        let sign = sign_hash_eth(credentials, self.state_hash().as_slice())?;
        *self.signature_mut(role) = sign;
        Ok(())
    }

    /// Verify that the slot of `role` holds a signature by `id`.
    fn verify_sign(&self, id: &OffChainId, role: Role) -> Result<bool, SignatureError> {
        verify_signature_eth(
            self.state_hash().as_slice(),
            self.signature(role),
            &id.on_chain_id,
        )
    }
}

/// Base state registered in the multi-session contract.
///
/// Field types mirror the Solidity struct.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MscBaseState {
    pub vpc_address: Address,
    pub sid: U256,
    pub blocked_sender: U256,
    pub blocked_receiver: U256,
    pub version: U256,
}

impl MscBaseState {
    pub fn solidity_sha3(&self) -> B256 {
        Packed::default()
            .address(&self.vpc_address)
            .uint256(&self.sid)
            .uint256(&self.blocked_sender)
            .uint256(&self.blocked_receiver)
            .uint256(&self.version)
            .keccak()
    }
}

impl fmt::Display for MscBaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{VpcAddress:{} Sid:{:#x} BlockedSender:{} BlockedReceiver:{} Version:{}}}",
            self.vpc_address, self.sid, self.blocked_sender, self.blocked_receiver, self.version
        )
    }
}

/// [`MscBaseState`] with the signatures of both participants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MscBaseStateSigned {
    #[serde(rename = "ms_contract_state")]
    pub ms_contract_base_state: MscBaseState,
    #[serde(with = "hex::serde")]
    pub sign_sender: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub sign_receiver: Vec<u8>,
}

impl MscBaseStateSigned {
    pub fn new(state: MscBaseState) -> Self {
        Self {
            ms_contract_base_state: state,
            ..Default::default()
        }
    }
}

impl SignedState for MscBaseStateSigned {
    fn state_hash(&self) -> B256 {
        self.ms_contract_base_state.solidity_sha3()
    }

    fn signature(&self, role: Role) -> &[u8] {
        match role {
            Role::Sender => &self.sign_sender,
            Role::Receiver => &self.sign_receiver,
        }
    }

    fn signature_mut(&mut self, role: Role) -> &mut Vec<u8> {
        match role {
            Role::Sender => &mut self.sign_sender,
            Role::Receiver => &mut self.sign_receiver,
        }
    }
}

impl fmt::Display for MscBaseStateSigned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{MSCBaseState:{} SignSender:0x{} SignReceiver:0x{}}}",
            self.ms_contract_base_state,
            hex::encode(&self.sign_sender),
            hex::encode(&self.sign_receiver)
        )
    }
}

/// Inputs from which the id of a vpc state is derived.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VpcStateId {
    pub addr_sender: Address,
    pub addr_receiver: Address,
    pub sid: U256,
}

impl VpcStateId {
    pub fn solidity_sha3(&self) -> B256 {
        Packed::default()
            .address(&self.addr_sender)
            .address(&self.addr_receiver)
            .uint256(&self.sid)
            .keccak()
    }
}

/// Per-update state of the virtual payment channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpcState {
    #[serde(with = "hex::serde")]
    pub id: Vec<u8>,
    pub version: U256,
    #[serde(rename = "blocked_alice")]
    pub blocked_sender: U256,
    #[serde(rename = "blocked_bob")]
    pub blocked_receiver: U256,
}

impl VpcState {
    pub fn solidity_sha3(&self) -> B256 {
        Packed::default()
            .bytes32(&self.id)
            .uint256(&self.version)
            .uint256(&self.blocked_sender)
            .uint256(&self.blocked_receiver)
            .keccak()
    }
}

impl fmt::Display for VpcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{Id:0x{} Version:{} BlockedSender:{} BlockedReceiver:{}}}",
            hex::encode(&self.id),
            self.version,
            self.blocked_sender,
            self.blocked_receiver
        )
    }
}

/// [`VpcState`] with the signatures of both participants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpcStateSigned {
    pub vpc_state: VpcState,
    #[serde(with = "hex::serde")]
    pub sign_sender: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub sign_receiver: Vec<u8>,
}

impl VpcStateSigned {
    pub fn new(state: VpcState) -> Self {
        Self {
            vpc_state: state,
            ..Default::default()
        }
    }
}

impl SignedState for VpcStateSigned {
    fn state_hash(&self) -> B256 {
        self.vpc_state.solidity_sha3()
    }

    fn signature(&self, role: Role) -> &[u8] {
        match role {
            Role::Sender => &self.sign_sender,
            Role::Receiver => &self.sign_receiver,
        }
    }

    fn signature_mut(&mut self, role: Role) -> &mut Vec<u8> {
        match role {
            Role::Sender => &mut self.sign_sender,
            Role::Receiver => &mut self.sign_receiver,
        }
    }
}

impl fmt::Display for VpcStateSigned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{VPCState:{} SignSender:0x{} SignReceiver:0x{}}}",
            self.vpc_state,
            hex::encode(&self.sign_sender),
            hex::encode(&self.sign_receiver)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::Credentials;
    use proptest::prelude::*;

    fn signer() -> OffChainId {
        OffChainId::from_credentials(Credentials::random(), "127.0.0.1:9601", "/dst")
    }

    fn complete_sid(sender: Address, receiver: Address) -> SessionId {
        let mut sid = SessionId::new(sender, receiver);
        sid.generate_sender_part(sender).unwrap();
        sid.generate_receiver_part(receiver).unwrap();
        sid.generate_complete_sid().unwrap();
        sid
    }

    proptest! {
        #[test]
        fn generated_session_id_validates_and_locks(
            nonce_sender in proptest::collection::vec(any::<u8>(), 32),
            nonce_receiver in proptest::collection::vec(any::<u8>(), 32),
            sender in any::<[u8; 20]>(),
            receiver in any::<[u8; 20]>(),
        ) {
            let sender = Address::from(sender);
            let receiver = Address::from(receiver);
            let mut sid = SessionId::default();
            sid.generate_sender_part_with_nonce(sender, nonce_sender).unwrap();
            sid.generate_receiver_part_with_nonce(receiver, nonce_receiver).unwrap();
            sid.generate_complete_sid().unwrap();
            prop_assert_eq!(sid.validate(), Ok(()));

            let frozen = sid.clone();
            prop_assert_eq!(sid.generate_sender_part(receiver), Err(SessionIdError::Locked));
            prop_assert_eq!(sid.generate_receiver_part(sender), Err(SessionIdError::Locked));
            prop_assert_eq!(sid.generate_complete_sid(), Err(SessionIdError::Locked));
            prop_assert_eq!(&sid, &frozen);
        }
    }

    #[test]
    fn complete_sid_requires_both_parts() {
        let mut sid = SessionId::default();
        assert_eq!(sid.generate_complete_sid(), Err(SessionIdError::MissingSenderPart));
        sid.generate_sender_part(Address::repeat_byte(1)).unwrap();
        assert_eq!(sid.generate_complete_sid(), Err(SessionIdError::MissingReceiverPart));
        assert!(!sid.locked);
    }

    #[test]
    fn validate_detects_tampering() {
        let sid = complete_sid(Address::repeat_byte(1), Address::repeat_byte(2));

        let mut unlocked = sid.clone();
        unlocked.locked = false;
        assert_eq!(unlocked.validate(), Err(SessionIdError::NotLocked));

        let mut bad_sender = sid.clone();
        bad_sender.nonce_sender[0] ^= 0xff;
        assert_eq!(bad_sender.validate(), Err(SessionIdError::InvalidSenderPart));

        let mut bad_receiver = sid.clone();
        bad_receiver.addr_receiver = Address::repeat_byte(3);
        assert_eq!(bad_receiver.validate(), Err(SessionIdError::InvalidReceiverPart));

        let mut bad_complete = sid.clone();
        bad_complete.sid_complete = Some(U256::from(7u64));
        assert_eq!(bad_complete.validate(), Err(SessionIdError::InvalidComplete));
    }

    #[test]
    fn equal_sender_ignores_receiver_fields() {
        let sender = Address::repeat_byte(1);
        let mut request = SessionId::new(sender, Address::repeat_byte(2));
        request.generate_sender_part(sender).unwrap();

        let mut response = request.clone();
        response.generate_receiver_part(Address::repeat_byte(2)).unwrap();
        response.generate_complete_sid().unwrap();

        assert!(request.equal_sender(&response));
        assert!(!request.equal_receiver(&response));
        assert!(!request.equal(&response));
        assert!(response.equal(&response.clone()));
    }

    #[test]
    fn msc_base_state_sign_and_verify() {
        let sender = signer();
        let receiver = signer();
        let mut state = MscBaseStateSigned::new(MscBaseState {
            vpc_address: Address::repeat_byte(9),
            sid: U256::from(42u64),
            blocked_sender: U256::from(10u64),
            blocked_receiver: U256::from(20u64),
            version: U256::from(1u64),
        });
        assert_eq!(state, state.clone());

        state.add_sign(&sender, Role::Sender).unwrap();
        state.add_sign(&receiver, Role::Receiver).unwrap();

        assert!(state.verify_sign(&sender, Role::Sender).unwrap());
        assert!(state.verify_sign(&receiver, Role::Receiver).unwrap());
        assert!(!state.verify_sign(&receiver, Role::Sender).unwrap());
    }

    #[test]
    fn vpc_state_verify_malformed_is_error() {
        let sender = signer();
        let mut state = VpcStateSigned::new(VpcState {
            id: vec![1; 32],
            version: U256::from(3u64),
            blocked_sender: U256::from(5u64),
            blocked_receiver: U256::from(6u64),
        });
        state.add_sign(&sender, Role::Sender).unwrap();
        assert!(state.verify_sign(&sender, Role::Sender).unwrap());

        // Receiver slot is still empty.
        assert_eq!(
            state.verify_sign(&sender, Role::Receiver),
            Err(SignatureError::InvalidLength(0))
        );

        state.sign_sender[64] = 30;
        assert_eq!(
            state.verify_sign(&sender, Role::Sender),
            Err(SignatureError::InvalidRecoveryByte(30))
        );
    }

    #[test]
    fn add_sign_requires_credentials() {
        let id = signer().public();
        let mut state = VpcStateSigned::default();
        assert_eq!(
            state.add_sign(&id, Role::Sender),
            Err(SignatureError::MissingCredentials)
        );
        assert!(state.sign_sender.is_empty());
    }

    #[test]
    fn canonical_preimage_layout() {
        let state = MscBaseState {
            vpc_address: Address::repeat_byte(0xab),
            sid: U256::from(1u64),
            blocked_sender: U256::from(2u64),
            blocked_receiver: U256::from(3u64),
            version: U256::from(4u64),
        };
        let mut preimage = vec![0xab; 20];
        for v in 1u8..=4 {
            let mut word = [0u8; 32];
            word[31] = v;
            preimage.extend_from_slice(&word);
        }
        assert_eq!(state.solidity_sha3(), keccak256(&preimage));
    }

    #[test]
    fn vpc_state_id_hash_is_deterministic() {
        let id = VpcStateId {
            addr_sender: Address::repeat_byte(1),
            addr_receiver: Address::repeat_byte(2),
            sid: U256::from(99u64),
        };
        assert_eq!(id.solidity_sha3(), id.clone().solidity_sha3());
        let swapped = VpcStateId {
            addr_sender: id.addr_receiver,
            addr_receiver: id.addr_sender,
            ..id.clone()
        };
        assert_ne!(id.solidity_sha3(), swapped.solidity_sha3());
    }
}
