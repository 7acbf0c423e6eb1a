//! Entry points for opening channels.
//!
//! [`new_session`] starts a listener that hands out identity-verified
//! inbound channels. [`new_channel`] dials a peer and verifies its identity.

use dst_core::{OffChainId, Role};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::adapter::{GenericAdapter, ReadWriteCloser};
use crate::config::{AdapterType, SessionConfig};
use crate::error::{AdapterError, SessionError};
use crate::instance::Instance;
use crate::websocket::{self, Listener};

/// A running listener and the channels it has accepted.
pub struct Session {
    /// Own identity, with the listener port resolved if it was configured as 0.
    pub self_id: OffChainId,
    /// Identity-verified inbound channels, in the receiver role.
    pub channels: mpsc::Receiver<Instance>,
    /// Stops accepting when shut down or dropped.
    pub listener: Listener,
}

/// Open a connection to `peer` with the configured adapter type.
pub async fn new_channel_conn(
    peer: &OffChainId,
    config: &SessionConfig,
) -> Result<Arc<dyn ReadWriteCloser>, AdapterError> {
    match config.adapter_type {
        AdapterType::WebSocket => {
            let conn: Arc<dyn ReadWriteCloser> = websocket::dial(
                &peer.listener_ip_addr,
                &peer.listener_endpoint,
                config.ws.clone(),
                config.adapter.clone(),
            )
            .await
            .inspect_err(|e| error!(peer = %peer.listener_ip_addr, error = %e, "websocket dial failed"))?;
            Ok(conn)
        }
        other => Err(AdapterError::UnsupportedAdapter(other)),
    }
}

/// Start listening on the address and endpoint of `self_id`.
///
/// Accepted connections are delivered, not yet identity-verified, on `inbound`.
pub async fn start_listener(
    self_id: &OffChainId,
    config: &SessionConfig,
    inbound: mpsc::Sender<Arc<GenericAdapter>>,
) -> Result<Listener, SessionError> {
    if config.adapter_type != AdapterType::WebSocket {
        return Err(AdapterError::UnsupportedAdapter(config.adapter_type).into());
    }
    let local_addr = self_id.listener_local_addr()?;
    let listener = websocket::start_listener(
        &local_addr,
        &self_id.listener_endpoint,
        config.ws.clone(),
        config.adapter.clone(),
        inbound,
    )
    .await?;
    Ok(listener)
}

async fn close_quietly(inst: &Instance) {
    if let Err(e) = inst.close().await {
        debug!(error = %e, "closing rejected channel");
    }
}

/// Dial `peer_id`, take the sender role and exchange identities.
///
/// Fails, closing the connection, if the peer answers with a different
/// on-chain address than expected.
#[instrument(skip_all, fields(peer = %peer_id.on_chain_id))]
pub async fn new_channel(
    self_id: &OffChainId,
    peer_id: &OffChainId,
    config: &SessionConfig,
) -> Result<Instance, SessionError> {
    let conn = new_channel_conn(peer_id, config).await?;
    let inst = Instance::new(Some(conn));
    inst.set_self_id(self_id.clone());
    inst.set_role_channel(Role::Sender);

    let got = match inst.identity_request(self_id).await {
        Ok(got) => got,
        Err(e) => {
            close_quietly(&inst).await;
            return Err(e.into());
        }
    };
    if got.on_chain_id != peer_id.on_chain_id {
        warn!(security = true, got = %got.on_chain_id, "peer answered with another identity");
        close_quietly(&inst).await;
        return Err(SessionError::PeerMismatch {
            expected: peer_id.on_chain_id,
            got: got.on_chain_id,
        });
    }

    inst.set_peer_id(got);
    info!("channel opened");
    Ok(inst)
}

/// Receive-side identity exchange on a freshly accepted connection.
async fn verify_inbound(self_id: OffChainId, conn: Arc<GenericAdapter>, verified: mpsc::Sender<Instance>) {
    let peer = conn.peer().to_string();
    let conn: Arc<dyn ReadWriteCloser> = conn;
    let inst = Instance::new(Some(conn));
    inst.set_self_id(self_id.clone());
    inst.set_role_channel(Role::Receiver);

    let handshake = async {
        let peer_id = inst.identity_read().await?;
        inst.identity_respond(&self_id).await?;
        Ok::<_, SessionError>(peer_id)
    };
    match handshake.await {
        Ok(peer_id) => {
            debug!(%peer, peer_id = %peer_id.on_chain_id, "inbound channel identified");
            inst.set_peer_id(peer_id);
            if let Err(mpsc::error::SendError(inst)) = verified.send(inst).await {
                debug!(%peer, "session receiver dropped");
                close_quietly(&inst).await;
            }
        }
        Err(e) => {
            warn!(%peer, error = %e, "inbound identity exchange failed");
            close_quietly(&inst).await;
        }
    }
}

/// Replace the port of `addr` with `port`.
fn with_port(addr: &str, port: u16) -> String {
    match addr.rsplit_once(':') {
        Some((host, _)) => format!("{host}:{port}"),
        None => format!("{addr}:{port}"),
    }
}

/// Start a listener for `self_id` and check it by dialing it once.
///
/// Every accepted connection gets the receiver role and goes through the
/// identity exchange before it is delivered on [`Session::channels`]; at most
/// `max_conn` delivered channels wait for pickup.
#[instrument(skip_all, fields(self_id = %self_id.on_chain_id))]
pub async fn new_session(self_id: &OffChainId, config: &SessionConfig) -> Result<Session, SessionError> {
    let (conn_tx, mut conn_rx) = mpsc::channel(config.max_conn);
    let listener = start_listener(self_id, config, conn_tx).await?;

    let mut self_id = self_id.clone();
    self_id.listener_ip_addr = with_port(&self_id.listener_ip_addr, listener.local_addr().port());

    let (verified_tx, mut verified_rx) = mpsc::channel(config.max_conn);
    let requeue = verified_tx.clone();
    let responder_id = self_id.clone();
    tokio::spawn(async move {
        while let Some(conn) = conn_rx.recv().await {
            tokio::spawn(verify_inbound(responder_id.clone(), conn, verified_tx.clone()));
        }
        debug!("listener stopped, no more inbound channels");
    });

    let mut early = Vec::new();
    if let Err(e) = self_check(&self_id, config, &mut verified_rx, &mut early).await {
        error!(error = %e, "channel self check failed");
        for inst in &early {
            close_quietly(inst).await;
        }
        if let Err(e) = listener.shutdown(Duration::from_secs(1)).await {
            debug!(error = %e, "listener shutdown after failed self check");
        }
        return Err(e);
    }
    if !early.is_empty() {
        // Peers that arrived during the self check go back on the queue.
        tokio::spawn(async move {
            for inst in early {
                if let Err(mpsc::error::SendError(inst)) = requeue.send(inst).await {
                    close_quietly(&inst).await;
                }
            }
        });
    }

    info!(addr = %self_id.listener_ip_addr, "channel session started");
    Ok(Session {
        self_id,
        channels: verified_rx,
        listener,
    })
}

/// Dial `self_id`, then wait for the loopback connection on `verified`.
///
/// Other channels received meanwhile are moved to `early`.
async fn self_check(
    self_id: &OffChainId,
    config: &SessionConfig,
    verified: &mut mpsc::Receiver<Instance>,
    early: &mut Vec<Instance>,
) -> Result<(), SessionError> {
    let outgoing = new_channel(self_id, self_id, config).await?;
    outgoing.close().await.map_err(|e| SessionError::SelfCheck(e.to_string()))?;
    await_loopback(self_id, config.ws.write_wait, verified, early).await
}

async fn await_loopback(
    self_id: &OffChainId,
    wait: Duration,
    verified: &mut mpsc::Receiver<Instance>,
    early: &mut Vec<Instance>,
) -> Result<(), SessionError> {
    let deadline = Instant::now() + wait;
    loop {
        match timeout_at(deadline, verified.recv()).await {
            Ok(Some(inst)) if inst.peer_id().on_chain_id == self_id.on_chain_id => {
                if let Err(e) = inst.close().await {
                    debug!(error = %e, "loopback channel already closed");
                }
                debug!("channel self check success");
                return Ok(());
            }
            Ok(Some(inst)) => {
                debug!(peer = %inst.peer_id().on_chain_id, "channel arrived during self check");
                early.push(inst);
            }
            Ok(None) => return Err(SessionError::SelfCheck("listener stopped".into())),
            Err(_) => {
                return Err(SessionError::SelfCheck(format!(
                    "loopback channel not delivered within {wait:?}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_port_replaces_port() {
        assert_eq!(with_port("127.0.0.1:0", 9605), "127.0.0.1:9605");
        assert_eq!(with_port("localhost", 80), "localhost:80");
    }

    #[tokio::test]
    async fn mock_adapter_cannot_dial_or_listen() {
        let config = SessionConfig::default().with_adapter_type(AdapterType::Mock);
        let id = OffChainId::new(dst_core::Address::ZERO, "127.0.0.1:0", "/dst");

        assert!(matches!(
            new_channel_conn(&id, &config).await,
            Err(AdapterError::UnsupportedAdapter(AdapterType::Mock))
        ));
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            start_listener(&id, &config, tx).await,
            Err(SessionError::Adapter(AdapterError::UnsupportedAdapter(AdapterType::Mock)))
        ));
    }

    fn verified_from(addr: dst_core::Address) -> Instance {
        let inst = Instance::new(None);
        inst.set_peer_id(OffChainId::new(addr, "127.0.0.1:9605", "/dst"));
        inst
    }

    #[tokio::test]
    async fn self_check_keeps_channels_from_other_peers() {
        let self_id = OffChainId::new(dst_core::Address::repeat_byte(1), "127.0.0.1:9605", "/dst");
        let stranger = dst_core::Address::repeat_byte(2);
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(verified_from(stranger)).await.unwrap();
        tx.send(verified_from(self_id.on_chain_id)).await.unwrap();
        tx.send(verified_from(stranger)).await.unwrap();

        let mut early = Vec::new();
        await_loopback(&self_id, Duration::from_secs(1), &mut rx, &mut early)
            .await
            .unwrap();
        assert_eq!(early.len(), 1);
        assert_eq!(early[0].peer_id().on_chain_id, stranger);
        // Channels behind the loopback stay queued.
        assert_eq!(rx.recv().await.unwrap().peer_id().on_chain_id, stranger);
    }

    #[tokio::test]
    async fn self_check_times_out_without_loopback() {
        let self_id = OffChainId::new(dst_core::Address::repeat_byte(1), "127.0.0.1:9605", "/dst");
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(verified_from(dst_core::Address::repeat_byte(2))).await.unwrap();

        let mut early = Vec::new();
        let err = await_loopback(&self_id, Duration::from_millis(50), &mut rx, &mut early)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SelfCheck(_)));
        assert_eq!(early.len(), 1);
        drop(tx);
    }

    #[tokio::test]
    async fn listener_requires_port() {
        let id = OffChainId::new(dst_core::Address::ZERO, "127.0.0.1", "/dst");
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            start_listener(&id, &SessionConfig::default(), tx).await,
            Err(SessionError::ListenerAddr(_))
        ));
    }
}
