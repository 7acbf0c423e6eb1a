//! Off-chain identity of a channel participant.
//!
//! An identity pairs an on-chain address with the listener location used for
//! off-chain connections. Signing credentials can be attached locally; they
//! never travel over the wire and never take part in comparisons.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SignatureError;
use crate::signature::Credentials;

/// The off-chain identity of a user.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct OffChainId {
    /// On-chain address.
    pub on_chain_id: Address,
    /// `host:port` on which the user accepts off-chain connections.
    pub listener_ip_addr: String,
    /// URL path of the off-chain endpoint, e.g. `/dst`.
    pub listener_endpoint: String,

    #[serde(skip)]
    credentials: Option<Credentials>,
}

impl OffChainId {
    /// Create an identity without credentials.
    pub fn new(
        on_chain_id: Address,
        listener_ip_addr: impl Into<String>,
        listener_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            on_chain_id,
            listener_ip_addr: listener_ip_addr.into(),
            listener_endpoint: listener_endpoint.into(),
            credentials: None,
        }
    }

    /// Create an identity whose address is derived from `credentials`.
    pub fn from_credentials(
        credentials: Credentials,
        listener_ip_addr: impl Into<String>,
        listener_endpoint: impl Into<String>,
    ) -> Self {
        let mut id = Self::new(credentials.address(), listener_ip_addr, listener_endpoint);
        id.credentials = Some(credentials);
        id
    }

    /// Attach signing credentials.
    ///
    /// Fails if the key does not belong to this identity's on-chain address.
    pub fn set_credentials(&mut self, credentials: Credentials) -> Result<(), SignatureError> {
        if credentials.address() != self.on_chain_id {
            return Err(SignatureError::InvalidKey(format!(
                "key address {} does not match identity {}",
                credentials.address(),
                self.on_chain_id
            )));
        }
        self.credentials = Some(credentials);
        Ok(())
    }

    /// Attached signing credentials, if any.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Drop any attached credentials.
    pub fn clear_credentials(&mut self) {
        self.credentials = None;
    }

    /// Copy of this identity without credentials, as sent to peers.
    pub fn public(&self) -> Self {
        Self {
            credentials: None,
            ..self.clone()
        }
    }

    /// Address the listener should bind to.
    ///
    /// The host part of `listener_ip_addr` is replaced by the unspecified
    /// address so that the listener accepts on every interface.
    pub fn listener_local_addr(&self) -> Result<String, ListenerAddrError> {
        let (_, port) = self
            .listener_ip_addr
            .rsplit_once(':')
            .ok_or_else(|| ListenerAddrError(self.listener_ip_addr.clone()))?;
        if port.is_empty() || port.parse::<u16>().is_err() {
            return Err(ListenerAddrError(self.listener_ip_addr.clone()));
        }
        Ok(format!("0.0.0.0:{port}"))
    }
}

impl PartialEq for OffChainId {
    fn eq(&self, other: &Self) -> bool {
        self.on_chain_id == other.on_chain_id
            && self.listener_ip_addr == other.listener_ip_addr
            && self.listener_endpoint == other.listener_endpoint
    }
}

impl Eq for OffChainId {}

impl fmt::Debug for OffChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffChainId")
            .field("on_chain_id", &self.on_chain_id)
            .field("listener_ip_addr", &self.listener_ip_addr)
            .field("listener_endpoint", &self.listener_endpoint)
            .field("has_credentials", &self.credentials.is_some())
            .finish()
    }
}

impl fmt::Display for OffChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OnChainID: {}, Listener: {}{}",
            self.on_chain_id, self.listener_ip_addr, self.listener_endpoint
        )
    }
}

/// The listener address is missing its `:port` suffix.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid off-chain address format, missing \":port number\" - {0}")]
pub struct ListenerAddrError(pub String);
