//! Request-response exchanges over a channel instance.
//!
//! Each protocol step has three halves: `*_request` on the active side sends
//! the request and waits for the response, `*_read` on the passive side waits
//! for the request, and `*_respond` answers it. Requests check that every
//! field the peer must echo came back unchanged.
//!
//! Nothing here retries; any error ends the current negotiation attempt.

use dst_core::{
    contains_status, Address, ChMsgPkt, ContractHandler, Message, MessageId, MessageStatus,
    MscBaseStateSigned, MsgContractAddr, MsgIdentity, MsgMscBaseState, MsgNewChannel,
    MsgSessionId, MsgVpcState, OffChainId, SessionId, VpcStateSigned, REQUEST_STATUS_LIST,
    RESPONSE_STATUS_LIST,
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::adapter::ReadWriteCloser;
use crate::error::ProtocolError;
use crate::instance::Instance;

fn unexpected(expected: MessageId, got: &Message) -> ProtocolError {
    ProtocolError::UnexpectedMessage {
        expected,
        got: got.id(),
    }
}

fn tampered(field: &'static str) -> ProtocolError {
    warn!(security = true, field, "peer modified an echoed field");
    ProtocolError::PeerTampered(field)
}

fn check_status(
    list: &[MessageStatus],
    id: MessageId,
    status: MessageStatus,
) -> Result<(), ProtocolError> {
    if contains_status(list, status) {
        Ok(())
    } else {
        Err(ProtocolError::InvalidStatus { id, status })
    }
}

impl Instance {
    fn connection(&self) -> Result<&Arc<dyn ReadWriteCloser>, ProtocolError> {
        self.adapter().ok_or(ProtocolError::NoAdapter)
    }

    async fn send(&self, message: Message) -> Result<(), ProtocolError> {
        self.connection()?.write(ChMsgPkt::new(message)).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Message, ProtocolError> {
        Ok(self.connection()?.read().await?.message)
    }

    async fn exchange(&self, request: Message) -> Result<Message, ProtocolError> {
        self.send(request).await?;
        self.receive().await
    }

    /// Send our identity and return the peer's.
    pub async fn identity_request(&self, self_id: &OffChainId) -> Result<OffChainId, ProtocolError> {
        debug!("requesting peer identity");
        let request = Message::IdentityRequest(MsgIdentity { id: self_id.public() });
        match self.exchange(request).await? {
            Message::IdentityResponse(msg) => Ok(msg.id),
            other => Err(unexpected(MessageId::IdentityResponse, &other)),
        }
    }

    /// Wait for the peer's identity request.
    pub async fn identity_read(&self) -> Result<OffChainId, ProtocolError> {
        debug!("reading identity request");
        match self.receive().await? {
            Message::IdentityRequest(msg) => Ok(msg.id),
            other => Err(unexpected(MessageId::IdentityRequest, &other)),
        }
    }

    /// Answer an identity request with our identity.
    pub async fn identity_respond(&self, self_id: &OffChainId) -> Result<(), ProtocolError> {
        debug!("responding to identity request");
        self.send(Message::IdentityResponse(MsgIdentity { id: self_id.public() }))
            .await
    }

    /// Propose a new channel. Returns the peer's status and reason.
    pub async fn new_channel_request(
        &self,
        msg_protocol_version: &str,
        contract_store_version: &[u8],
    ) -> Result<(MessageStatus, String), ProtocolError> {
        debug!("requesting new channel");
        let request = Message::NewChannelRequest(MsgNewChannel {
            contract_store_version: contract_store_version.to_vec(),
            msg_protocol_version: msg_protocol_version.to_string(),
            status: MessageStatus::Require,
            reason: String::new(),
        });
        let msg = match self.exchange(request).await? {
            Message::NewChannelResponse(msg) => msg,
            other => return Err(unexpected(MessageId::NewChannelResponse, &other)),
        };

        if msg.contract_store_version != contract_store_version {
            return Err(tampered("contract store version"));
        }
        if msg.msg_protocol_version != msg_protocol_version {
            return Err(tampered("message protocol version"));
        }
        check_status(RESPONSE_STATUS_LIST, MessageId::NewChannelResponse, msg.status)?;
        Ok((msg.status, msg.reason))
    }

    /// Wait for a new channel request. Returns the protocol and contract store versions.
    pub async fn new_channel_read(&self) -> Result<(String, Vec<u8>), ProtocolError> {
        debug!("reading new channel request");
        let msg = match self.receive().await? {
            Message::NewChannelRequest(msg) => msg,
            other => return Err(unexpected(MessageId::NewChannelRequest, &other)),
        };
        check_status(REQUEST_STATUS_LIST, MessageId::NewChannelRequest, msg.status)?;
        Ok((msg.msg_protocol_version, msg.contract_store_version))
    }

    /// Accept or decline a new channel request.
    pub async fn new_channel_respond(
        &self,
        msg_protocol_version: &str,
        contract_store_version: &[u8],
        status: MessageStatus,
        reason: &str,
    ) -> Result<(), ProtocolError> {
        check_status(RESPONSE_STATUS_LIST, MessageId::NewChannelResponse, status)?;
        debug!(%status, "responding to new channel request");
        self.send(Message::NewChannelResponse(MsgNewChannel {
            contract_store_version: contract_store_version.to_vec(),
            msg_protocol_version: msg_protocol_version.to_string(),
            status,
            reason: reason.to_string(),
        }))
        .await
    }

    /// Send a session id carrying our sender part. Returns the peer's
    /// completed session id and status.
    pub async fn session_id_request(
        &self,
        sid: &SessionId,
    ) -> Result<(SessionId, MessageStatus), ProtocolError> {
        debug!("requesting session id");
        let request = Message::SessionIdRequest(MsgSessionId {
            sid: sid.clone(),
            status: MessageStatus::Require,
        });
        let msg = match self.exchange(request).await? {
            Message::SessionIdResponse(msg) => msg,
            other => return Err(unexpected(MessageId::SessionIdResponse, &other)),
        };

        if !sid.equal_sender(&msg.sid) {
            return Err(tampered("session id sender part"));
        }
        check_status(RESPONSE_STATUS_LIST, MessageId::SessionIdResponse, msg.status)?;
        Ok((msg.sid, msg.status))
    }

    pub async fn session_id_read(&self) -> Result<SessionId, ProtocolError> {
        debug!("reading session id request");
        let msg = match self.receive().await? {
            Message::SessionIdRequest(msg) => msg,
            other => return Err(unexpected(MessageId::SessionIdRequest, &other)),
        };
        check_status(REQUEST_STATUS_LIST, MessageId::SessionIdRequest, msg.status)?;
        Ok(msg.sid)
    }

    pub async fn session_id_respond(
        &self,
        sid: &SessionId,
        status: MessageStatus,
    ) -> Result<(), ProtocolError> {
        check_status(RESPONSE_STATUS_LIST, MessageId::SessionIdResponse, status)?;
        debug!(%status, "responding to session id request");
        self.send(Message::SessionIdResponse(MsgSessionId {
            sid: sid.clone(),
            status,
        }))
        .await
    }

    /// Announce a deployed contract. Returns the peer's status.
    pub async fn contract_addr_request(
        &self,
        addr: Address,
        handler: &ContractHandler,
    ) -> Result<MessageStatus, ProtocolError> {
        debug!(%addr, contract = %handler.name, "requesting contract address");
        let request = Message::ContractAddrRequest(MsgContractAddr {
            addr,
            contract_type: handler.clone(),
            status: MessageStatus::Require,
        });
        let msg = match self.exchange(request).await? {
            Message::ContractAddrResponse(msg) => msg,
            other => return Err(unexpected(MessageId::ContractAddrResponse, &other)),
        };

        if msg.contract_type != *handler {
            return Err(tampered("contract handler"));
        }
        if msg.addr != addr {
            return Err(tampered("contract address"));
        }
        check_status(RESPONSE_STATUS_LIST, MessageId::ContractAddrResponse, msg.status)?;
        Ok(msg.status)
    }

    pub async fn contract_addr_read(&self) -> Result<(Address, ContractHandler), ProtocolError> {
        debug!("reading contract address request");
        let msg = match self.receive().await? {
            Message::ContractAddrRequest(msg) => msg,
            other => return Err(unexpected(MessageId::ContractAddrRequest, &other)),
        };
        check_status(REQUEST_STATUS_LIST, MessageId::ContractAddrRequest, msg.status)?;
        Ok((msg.addr, msg.contract_type))
    }

    pub async fn contract_addr_respond(
        &self,
        addr: Address,
        handler: &ContractHandler,
        status: MessageStatus,
    ) -> Result<(), ProtocolError> {
        check_status(RESPONSE_STATUS_LIST, MessageId::ContractAddrResponse, status)?;
        debug!(%status, "responding to contract address request");
        self.send(Message::ContractAddrResponse(MsgContractAddr {
            addr,
            contract_type: handler.clone(),
            status,
        }))
        .await
    }

    /// Send a partially signed base state. Returns the peer's version of it
    /// (normally with its signature added) and status.
    pub async fn msc_base_state_request(
        &self,
        state: &MscBaseStateSigned,
    ) -> Result<(MscBaseStateSigned, MessageStatus), ProtocolError> {
        debug!("requesting new msc base state");
        let request = Message::MscBaseStateRequest(MsgMscBaseState {
            signed_state_val: state.clone(),
            status: MessageStatus::Require,
        });
        let msg = match self.exchange(request).await? {
            Message::MscBaseStateResponse(msg) => msg,
            other => return Err(unexpected(MessageId::MscBaseStateResponse, &other)),
        };

        if msg.signed_state_val.ms_contract_base_state != state.ms_contract_base_state {
            return Err(tampered("msc base state"));
        }
        check_status(RESPONSE_STATUS_LIST, MessageId::MscBaseStateResponse, msg.status)?;
        Ok((msg.signed_state_val, msg.status))
    }

    pub async fn msc_base_state_read(&self) -> Result<MscBaseStateSigned, ProtocolError> {
        debug!("reading msc base state request");
        let msg = match self.receive().await? {
            Message::MscBaseStateRequest(msg) => msg,
            other => return Err(unexpected(MessageId::MscBaseStateRequest, &other)),
        };
        check_status(REQUEST_STATUS_LIST, MessageId::MscBaseStateRequest, msg.status)?;
        Ok(msg.signed_state_val)
    }

    pub async fn msc_base_state_respond(
        &self,
        state: &MscBaseStateSigned,
        status: MessageStatus,
    ) -> Result<(), ProtocolError> {
        check_status(RESPONSE_STATUS_LIST, MessageId::MscBaseStateResponse, status)?;
        debug!(%status, "responding to msc base state request");
        self.send(Message::MscBaseStateResponse(MsgMscBaseState {
            signed_state_val: state.clone(),
            status,
        }))
        .await
    }

    /// Send a partially signed vpc state. Returns the peer's version of it
    /// and status.
    pub async fn vpc_state_request(
        &self,
        state: &VpcStateSigned,
    ) -> Result<(VpcStateSigned, MessageStatus), ProtocolError> {
        debug!(version = %state.vpc_state.version, "requesting new vpc state");
        let request = Message::VpcStateRequest(MsgVpcState {
            signed_state_val: state.clone(),
            status: MessageStatus::Require,
        });
        let msg = match self.exchange(request).await? {
            Message::VpcStateResponse(msg) => msg,
            other => return Err(unexpected(MessageId::VpcStateResponse, &other)),
        };

        if msg.signed_state_val.vpc_state != state.vpc_state {
            return Err(tampered("vpc state"));
        }
        check_status(RESPONSE_STATUS_LIST, MessageId::VpcStateResponse, msg.status)?;
        Ok((msg.signed_state_val, msg.status))
    }

    pub async fn vpc_state_read(&self) -> Result<VpcStateSigned, ProtocolError> {
        debug!("reading vpc state request");
        let msg = match self.receive().await? {
            Message::VpcStateRequest(msg) => msg,
            other => return Err(unexpected(MessageId::VpcStateRequest, &other)),
        };
        check_status(REQUEST_STATUS_LIST, MessageId::VpcStateRequest, msg.status)?;
        Ok(msg.signed_state_val)
    }

    pub async fn vpc_state_respond(
        &self,
        state: &VpcStateSigned,
        status: MessageStatus,
    ) -> Result<(), ProtocolError> {
        check_status(RESPONSE_STATUS_LIST, MessageId::VpcStateResponse, status)?;
        debug!(%status, "responding to vpc state request");
        self.send(Message::VpcStateResponse(MsgVpcState {
            signed_state_val: state.clone(),
            status,
        }))
        .await
    }
}
