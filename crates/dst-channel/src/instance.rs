//! Channel instance and its lifecycle state machine.
//!
//! An [`Instance`] owns the adapter of one off-chain channel together with
//! the roles, status and signed states agreed on it. Every mutator takes the
//! instance lock and leaves the instance untouched when it rejects a value.

use dst_core::{
    ContractStore, MscBaseStateSigned, OffChainId, Role, SessionId, SignedState, VpcStateSigned,
};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::adapter::ReadWriteCloser;
use crate::error::InstanceError;

/// Lifecycle status of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Status {
    #[default]
    PreSetup,
    Setup,
    Init,
    Open,
    InConflict,
    Settled,
    WaitingToClose,
    VpcClosing,
    VpcClosed,
    Closed,
}

impl Status {
    pub const ALL: [Status; 10] = [
        Self::PreSetup,
        Self::Setup,
        Self::Init,
        Self::Open,
        Self::InConflict,
        Self::Settled,
        Self::WaitingToClose,
        Self::VpcClosing,
        Self::VpcClosed,
        Self::Closed,
    ];

    /// States from which a transition into `self` is legal.
    pub fn predecessors(self) -> &'static [Status] {
        match self {
            Self::PreSetup => &[],
            Self::Setup => &[Self::PreSetup],
            // Init is entered by the setup procedure that runs outside this table.
            Self::Init => &[],
            Self::Open => &[Self::Init],
            Self::InConflict => &[Self::Open, Self::WaitingToClose],
            Self::Settled => &[Self::InConflict],
            Self::WaitingToClose => &[Self::Open],
            Self::VpcClosing => &[Self::Settled],
            Self::VpcClosed => &[Self::VpcClosing],
            Self::Closed => &[
                Self::Init,
                Self::VpcClosing,
                Self::VpcClosed,
                Self::WaitingToClose,
            ],
        }
    }

    /// Whether moving from `self` to `to` is legal.
    pub fn can_transition_to(self, to: Status) -> bool {
        to.predecessors().contains(&self)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PreSetup => "pre-setup",
            Self::Setup => "setup",
            Self::Init => "init",
            Self::Open => "open",
            Self::InConflict => "in-conflict",
            Self::Settled => "settled",
            Self::WaitingToClose => "waiting-to-close",
            Self::VpcClosing => "vpc-closing",
            Self::VpcClosed => "vpc-closed",
            Self::Closed => "closed",
        })
    }
}

/// How the channel is closed once the vpc has been settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClosingMode {
    /// Wait for the user to close.
    #[default]
    Manual,
    /// Close automatically after the vpc validity period.
    AutoNormal,
    /// Close automatically right away.
    AutoImmediate,
}

#[derive(Default)]
struct State {
    closing_mode: ClosingMode,
    self_id: OffChainId,
    peer_id: OffChainId,
    role_channel: Option<Role>,
    role_closing: Option<Role>,
    status: Status,
    contract_store: ContractStore,
    session_id: SessionId,
    msc_base_state: Option<MscBaseStateSigned>,
    vpc_states: Vec<VpcStateSigned>,
}

impl State {
    fn id_for(&self, role: Role) -> Result<&OffChainId, InstanceError> {
        let own = self.role_channel.ok_or(InstanceError::RoleNotSet)?;
        Ok(if own == role {
            &self.self_id
        } else {
            &self.peer_id
        })
    }

    fn verify<S: SignedState>(&self, state: &S, role: Role) -> Result<(), InstanceError> {
        if state.verify_sign(self.id_for(role)?, role)? {
            Ok(())
        } else {
            Err(InstanceError::InvalidSignature(role))
        }
    }

    fn check_version(&self, state: &VpcStateSigned) -> Result<(), InstanceError> {
        match self.vpc_states.last() {
            Some(last) if state.vpc_state.version <= last.vpc_state.version => {
                Err(InstanceError::StaleVersion {
                    current: last.vpc_state.version.to_string(),
                    proposed: state.vpc_state.version.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn check_full(&self, state: &VpcStateSigned) -> Result<(), InstanceError> {
        self.verify(state, Role::Sender)?;
        self.verify(state, Role::Receiver)?;
        self.check_version(state)
    }
}

/// One off-chain channel with a peer.
pub struct Instance {
    adapter: Option<Arc<dyn ReadWriteCloser>>,
    state: Mutex<State>,
}

impl Instance {
    /// A fresh instance in [`Status::PreSetup`].
    pub fn new(adapter: Option<Arc<dyn ReadWriteCloser>>) -> Self {
        Self {
            adapter,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn adapter(&self) -> Option<&Arc<dyn ReadWriteCloser>> {
        self.adapter.as_ref()
    }

    /// Whether the underlying connection is active.
    pub fn connected(&self) -> bool {
        self.adapter.as_ref().is_some_and(|a| a.connected())
    }

    /// Close the underlying connection.
    pub async fn close(&self) -> Result<(), InstanceError> {
        let adapter = self.adapter.as_ref().ok_or(InstanceError::NoAdapter)?;
        adapter.close().await?;
        Ok(())
    }

    pub fn closing_mode(&self) -> ClosingMode {
        self.state().closing_mode
    }

    pub fn set_closing_mode(&self, mode: ClosingMode) {
        self.state().closing_mode = mode;
    }

    pub fn self_id(&self) -> OffChainId {
        self.state().self_id.clone()
    }

    pub(crate) fn set_self_id(&self, id: OffChainId) {
        self.state().self_id = id;
    }

    pub fn peer_id(&self) -> OffChainId {
        self.state().peer_id.clone()
    }

    pub(crate) fn set_peer_id(&self, id: OffChainId) {
        self.state().peer_id = id;
    }

    /// Identity of the party in the sender role of this channel.
    pub fn sender_id(&self) -> Option<OffChainId> {
        self.state().id_for(Role::Sender).ok().cloned()
    }

    /// Identity of the party in the receiver role of this channel.
    pub fn receiver_id(&self) -> Option<OffChainId> {
        self.state().id_for(Role::Receiver).ok().cloned()
    }

    pub fn role_channel(&self) -> Option<Role> {
        self.state().role_channel
    }

    pub fn set_role_channel(&self, role: Role) {
        self.state().role_channel = Some(role);
    }

    pub fn role_closing(&self) -> Option<Role> {
        self.state().role_closing
    }

    pub fn set_role_closing(&self, role: Role) {
        self.state().role_closing = Some(role);
    }

    pub fn status(&self) -> Status {
        self.state().status
    }

    /// Move to `status` if the transition is legal. Returns whether it was.
    pub fn set_status(&self, status: Status) -> bool {
        let mut state = self.state();
        if !state.status.can_transition_to(status) {
            debug!(from = %state.status, to = %status, "illegal status transition");
            return false;
        }
        state.status = status;
        true
    }

    pub fn contract_store(&self) -> ContractStore {
        self.state().contract_store.clone()
    }

    pub fn set_contract_store(&self, store: ContractStore) {
        self.state().contract_store = store;
    }

    pub fn session_id(&self) -> SessionId {
        self.state().session_id.clone()
    }

    /// Store a session id after checking that it is complete and valid.
    pub fn set_session_id(&self, sid: SessionId) -> Result<(), InstanceError> {
        sid.validate()?;
        self.state().session_id = sid;
        Ok(())
    }

    pub fn msc_base_state(&self) -> Option<MscBaseStateSigned> {
        self.state().msc_base_state.clone()
    }

    /// Store the base state once both parties' signatures verify.
    pub fn set_msc_base_state(&self, new: MscBaseStateSigned) -> Result<(), InstanceError> {
        let mut state = self.state();
        state.verify(&new, Role::Sender)?;
        state.verify(&new, Role::Receiver)?;
        state.msc_base_state = Some(new);
        debug!("new msc base state set");
        Ok(())
    }

    /// The latest agreed vpc state, if any.
    pub fn current_vpc_state(&self) -> Option<VpcStateSigned> {
        self.state().vpc_states.last().cloned()
    }

    /// All agreed vpc states, oldest first.
    pub fn vpc_states(&self) -> Vec<VpcStateSigned> {
        self.state().vpc_states.clone()
    }

    /// Append a vpc state signed by both parties with a version above the current one.
    pub fn set_current_vpc_state(&self, new: VpcStateSigned) -> Result<(), InstanceError> {
        let mut state = self.state();
        state.check_full(&new)?;
        info!(version = %new.vpc_state.version, "new vpc state set");
        state.vpc_states.push(new);
        Ok(())
    }

    /// Check a state proposed by the peer: the peer's signature and the version.
    pub fn validate_incoming_state(&self, new: &VpcStateSigned) -> (bool, String) {
        let state = self.state();
        let result = state
            .role_channel
            .ok_or(InstanceError::RoleNotSet)
            .and_then(|own| state.verify(new, own.counterpart()))
            .and_then(|()| state.check_version(new));
        into_verdict(result)
    }

    /// Check a fully signed state: both signatures and the version.
    pub fn validate_full_state(&self, new: &VpcStateSigned) -> (bool, String) {
        into_verdict(self.state().check_full(new))
    }
}

fn into_verdict(result: Result<(), InstanceError>) -> (bool, String) {
    match result {
        Ok(()) => (true, String::new()),
        Err(e) => (false, e.to_string()),
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Instance")
            .field("connected", &self.connected())
            .field("self_id", &state.self_id)
            .field("peer_id", &state.peer_id)
            .field("role_channel", &state.role_channel)
            .field("status", &state.status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dst_core::{Credentials, MscBaseState, VpcState, U256};
    use proptest::prelude::*;

    struct Parties {
        sender: OffChainId,
        receiver: OffChainId,
    }

    fn parties() -> Parties {
        Parties {
            sender: OffChainId::from_credentials(Credentials::random(), "127.0.0.1:9601", "/dst"),
            receiver: OffChainId::from_credentials(Credentials::random(), "127.0.0.1:9602", "/dst"),
        }
    }

    fn sender_instance(p: &Parties) -> Instance {
        let inst = Instance::new(None);
        inst.set_self_id(p.sender.clone());
        inst.set_peer_id(p.receiver.public());
        inst.set_role_channel(Role::Sender);
        inst
    }

    fn vpc_state(p: &Parties, version: u64) -> VpcStateSigned {
        let mut state = VpcStateSigned::new(VpcState {
            id: vec![7; 32],
            version: U256::from(version),
            blocked_sender: U256::from(10u64),
            blocked_receiver: U256::from(20u64),
        });
        state.add_sign(&p.sender, Role::Sender).unwrap();
        state.add_sign(&p.receiver, Role::Receiver).unwrap();
        state
    }

    fn status_strategy() -> impl Strategy<Value = Status> {
        prop::sample::select(Status::ALL.to_vec())
    }

    fn instance_in(status: Status) -> Instance {
        let inst = Instance::new(None);
        inst.state().status = status;
        inst
    }

    proptest! {
        #[test]
        fn set_status_follows_table(from in status_strategy(), to in status_strategy()) {
            let inst = instance_in(from);
            let legal = to.predecessors().contains(&from);
            prop_assert_eq!(inst.set_status(to), legal);
            prop_assert_eq!(inst.status(), if legal { to } else { from });
        }
    }

    #[test]
    fn status_table_examples() {
        let cases = [
            (Status::PreSetup, Status::Setup, true),
            (Status::Init, Status::Setup, false),
            (Status::Open, Status::InConflict, true),
            (Status::Init, Status::InConflict, false),
            (Status::Settled, Status::Closed, false),
            (Status::WaitingToClose, Status::Closed, true),
        ];
        for (from, to, legal) in cases {
            let inst = instance_in(from);
            assert_eq!(inst.set_status(to), legal, "{from} -> {to}");
        }
        assert_eq!(Instance::new(None).status(), Status::PreSetup);
    }

    #[test]
    fn sender_and_receiver_follow_role() {
        let p = parties();
        let inst = Instance::new(None);
        assert!(inst.sender_id().is_none());

        inst.set_self_id(p.sender.clone());
        inst.set_peer_id(p.receiver.clone());
        inst.set_role_channel(Role::Receiver);
        assert_eq!(inst.sender_id(), Some(p.receiver.clone()));
        assert_eq!(inst.receiver_id(), Some(p.sender.clone()));

        inst.set_role_channel(Role::Sender);
        assert_eq!(inst.sender_id(), Some(p.sender));
    }

    #[test]
    fn vpc_states_must_increase() {
        let p = parties();
        let inst = sender_instance(&p);
        assert!(inst.current_vpc_state().is_none());

        inst.set_current_vpc_state(vpc_state(&p, 5)).unwrap();
        let before = inst.vpc_states();

        for version in [5, 4] {
            let err = inst.set_current_vpc_state(vpc_state(&p, version)).unwrap_err();
            assert!(matches!(err, InstanceError::StaleVersion { .. }));
            assert_eq!(inst.vpc_states(), before);
        }

        inst.set_current_vpc_state(vpc_state(&p, 6)).unwrap();
        assert_eq!(inst.vpc_states().len(), 2);
        assert_eq!(
            inst.current_vpc_state().unwrap().vpc_state.version,
            U256::from(6u64)
        );
    }

    #[test]
    fn vpc_state_needs_both_signatures() {
        let p = parties();
        let inst = sender_instance(&p);

        let mut state = vpc_state(&p, 1);
        state.sign_receiver = state.sign_sender.clone();
        let err = inst.set_current_vpc_state(state).unwrap_err();
        assert!(matches!(err, InstanceError::InvalidSignature(Role::Receiver)));
        assert!(inst.vpc_states().is_empty());
    }

    #[test]
    fn validation_does_not_mutate() {
        let p = parties();
        let inst = sender_instance(&p);

        // Only the peer (receiver) signed so far.
        let mut proposed = VpcStateSigned::new(VpcState {
            id: vec![1; 32],
            version: U256::from(1u64),
            ..Default::default()
        });
        proposed.add_sign(&p.receiver, Role::Receiver).unwrap();
        let snapshot = proposed.clone();

        assert_eq!(inst.validate_incoming_state(&proposed), (true, String::new()));
        let (valid, reason) = inst.validate_full_state(&proposed);
        assert!(!valid);
        assert!(!reason.is_empty());
        assert_eq!(proposed, snapshot);
        assert!(inst.vpc_states().is_empty());
    }

    #[test]
    fn msc_base_state_checks_signatures() {
        let p = parties();
        let inst = sender_instance(&p);
        let mut state = MscBaseStateSigned::new(MscBaseState {
            version: U256::from(1u64),
            ..Default::default()
        });
        state.add_sign(&p.sender, Role::Sender).unwrap();

        assert!(inst.set_msc_base_state(state.clone()).is_err());
        assert!(inst.msc_base_state().is_none());

        state.add_sign(&p.receiver, Role::Receiver).unwrap();
        inst.set_msc_base_state(state.clone()).unwrap();
        assert_eq!(inst.msc_base_state(), Some(state));
    }

    #[test]
    fn session_id_must_be_valid() {
        let inst = Instance::new(None);
        let mut sid = SessionId::default();
        assert!(inst.set_session_id(sid.clone()).is_err());

        sid.generate_sender_part(dst_core::Address::repeat_byte(1)).unwrap();
        sid.generate_receiver_part(dst_core::Address::repeat_byte(2)).unwrap();
        sid.generate_complete_sid().unwrap();
        inst.set_session_id(sid.clone()).unwrap();
        assert_eq!(inst.session_id(), sid);
    }

    #[tokio::test]
    async fn close_without_adapter() {
        let inst = Instance::new(None);
        assert!(!inst.connected());
        assert!(matches!(inst.close().await, Err(InstanceError::NoAdapter)));
    }
}
