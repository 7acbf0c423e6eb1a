//! Transport-agnostic channel adapter.
//!
//! An adapter talks to two background tasks, one per direction, through
//! handler pipes. Each pipe carries a message queue, a single-slot error cell
//! the task fills when it dies, and a quit rendezvous used by [`close`]. The
//! transport specific tasks live in [`crate::websocket`].
//!
//! [`close`]: ReadWriteCloser::close

use async_trait::async_trait;
use chrono::Local;
use dst_core::ChMsgPkt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::AdapterConfig;
use crate::error::AdapterError;

/// Item delivered by the read task.
///
/// An `Err` here is not terminal; terminal errors go to the error cell.
pub(crate) type Inbound = Result<ChMsgPkt, AdapterError>;

/// One encoded frame handed to the write task, with the slot it answers on.
pub(crate) struct Outbound {
    pub(crate) frame: Vec<u8>,
    pub(crate) done: oneshot::Sender<Result<(), AdapterError>>,
}

/// Acknowledgement the task sends once it stopped touching the transport.
pub(crate) type QuitAck = oneshot::Sender<()>;

/// Adapter side of a handler pipe.
pub(crate) struct HandlerPipe<M> {
    pub(crate) msg: M,
    pub(crate) error: mpsc::Receiver<AdapterError>,
    pub(crate) quit: mpsc::Sender<QuitAck>,
}

/// Task side of a handler pipe.
pub(crate) struct HandlerEnd<M> {
    pub(crate) msg: M,
    pub(crate) error: mpsc::Sender<AdapterError>,
    pub(crate) quit: mpsc::Receiver<QuitAck>,
}

impl<M> HandlerEnd<M> {
    /// Record the error that terminates the task. Never blocks.
    pub(crate) fn fail(&self, err: AdapterError) {
        if let Err(e) = self.error.try_send(err) {
            debug!(error = %e, "handler error cell already full");
        }
    }
}

pub(crate) type ReadPipe = HandlerPipe<mpsc::Receiver<Inbound>>;
pub(crate) type WritePipe = HandlerPipe<mpsc::Sender<Outbound>>;
pub(crate) type ReadEnd = HandlerEnd<mpsc::Sender<Inbound>>;
pub(crate) type WriteEnd = HandlerEnd<mpsc::Receiver<Outbound>>;

fn pipe<A, B>(msg: (A, B)) -> (HandlerPipe<B>, HandlerEnd<A>) {
    let (error_tx, error_rx) = mpsc::channel(1);
    let (quit_tx, quit_rx) = mpsc::channel(1);
    (
        HandlerPipe {
            msg: msg.1,
            error: error_rx,
            quit: quit_tx,
        },
        HandlerEnd {
            msg: msg.0,
            error: error_tx,
            quit: quit_rx,
        },
    )
}

/// Read pipe: one received message may wait while the next is being read.
pub(crate) fn read_pipe() -> (ReadPipe, ReadEnd) {
    pipe(mpsc::channel(1))
}

/// Write pipe: every frame is answered on its own slot before the next is taken.
pub(crate) fn write_pipe() -> (WritePipe, WriteEnd) {
    let (tx, rx) = mpsc::channel(1);
    pipe((rx, tx))
}

/// Stop the task behind `pipe` and wait until it has exited.
///
/// An error already recorded by the task is returned instead; the task has
/// exited on its own in that case. A task that went away silently counts as
/// stopped.
pub(crate) async fn close_handler<M>(pipe: &mut HandlerPipe<M>) -> Result<(), AdapterError> {
    if let Ok(err) = pipe.error.try_recv() {
        return Err(err);
    }

    let (ack_tx, ack_rx) = oneshot::channel();
    if pipe.quit.send(ack_tx).await.is_err() {
        debug!("handler exited before quit");
        return Ok(());
    }
    if ack_rx.await.is_err() {
        debug!("handler exited without acknowledging quit");
    }
    Ok(())
}

/// The error recorded by the task behind `pipe`, or `fallback` if there is none.
fn recorded_or<M>(pipe: &mut HandlerPipe<M>, fallback: AdapterError) -> AdapterError {
    pipe.error.try_recv().unwrap_or(fallback)
}

/// Read, write and close a channel connection.
#[async_trait]
pub trait ReadWriteCloser: Send + Sync {
    /// Whether the connection with the peer is active.
    fn connected(&self) -> bool;

    /// Next message received from the peer.
    async fn read(&self) -> Result<ChMsgPkt, AdapterError>;

    /// Send a message, stamped with the current time, and wait until the
    /// transport has taken it.
    async fn write(&self, pkt: ChMsgPkt) -> Result<(), AdapterError>;

    /// Stop the background tasks and close the connection.
    async fn close(&self) -> Result<(), AdapterError>;
}

struct Pipes {
    read: ReadPipe,
    write: WritePipe,
}

/// Adapter over any transport driven by a read task and a write task.
///
/// `read`, `write` and `close` run one at a time. A `close` wakes a pending
/// `read` or `write` so that it cannot be held off by a silent peer.
pub struct GenericAdapter {
    connected: AtomicBool,
    access: Mutex<Pipes>,
    closing: watch::Sender<bool>,
    config: AdapterConfig,
    peer: String,
}

impl GenericAdapter {
    pub(crate) fn new(
        read: ReadPipe,
        write: WritePipe,
        config: AdapterConfig,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            connected: AtomicBool::new(true),
            access: Mutex::new(Pipes { read, write }),
            closing: watch::Sender::new(false),
            config,
            peer: peer.into(),
        }
    }

    /// Address of the remote end, for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    async fn closing(&self) {
        let mut rx = self.closing.subscribe();
        // The sender lives in `self`, so `wait_for` only returns once closing.
        let _ = rx.wait_for(|closing| *closing).await;
    }
}

#[async_trait]
impl ReadWriteCloser for GenericAdapter {
    fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn read(&self) -> Result<ChMsgPkt, AdapterError> {
        let mut guard = self.access.lock().await;
        if !self.connected() {
            return Err(AdapterError::NotConnected);
        }
        let pipe = &mut guard.read;

        // A dying task fills its error cell before the queue closes and before
        // the adapter starts closing, so the cell is checked first.
        let item = tokio::select! {
            biased;
            Some(err) = pipe.error.recv() => Err(err),
            item = pipe.msg.recv() => match item {
                Some(item) => item,
                None => Err(recorded_or(pipe, AdapterError::HandlerGone)),
            },
            _ = self.closing() => Err(recorded_or(pipe, AdapterError::AlreadyClosed)),
        };

        if self.config.read_write_logging {
            match &item {
                Ok(pkt) => debug!(peer = %self.peer, message_id = %pkt.message_id(), "read"),
                Err(e) => debug!(peer = %self.peer, error = %e, "read failed"),
            }
        }
        item
    }

    async fn write(&self, mut pkt: ChMsgPkt) -> Result<(), AdapterError> {
        let mut guard = self.access.lock().await;
        if !self.connected() {
            return Err(AdapterError::NotConnected);
        }
        let pipe = &mut guard.write;

        if let Ok(err) = pipe.error.try_recv() {
            return Err(err);
        }

        pkt.timestamp = Local::now().fixed_offset();
        let frame = serde_json::to_vec(&pkt).map_err(AdapterError::Encode)?;
        let (done_tx, mut done_rx) = oneshot::channel();
        let outbound = Outbound {
            frame,
            done: done_tx,
        };

        tokio::select! {
            biased;
            sent = pipe.msg.send(outbound) => {
                if sent.is_err() {
                    return Err(recorded_or(pipe, AdapterError::HandlerGone));
                }
            }
            _ = self.closing() => return Err(recorded_or(pipe, AdapterError::AlreadyClosed)),
        }

        let result = tokio::select! {
            biased;
            Some(err) = pipe.error.recv() => Err(err),
            done = &mut done_rx => match done {
                Ok(result) => result,
                Err(_) => Err(recorded_or(pipe, AdapterError::HandlerGone)),
            },
            _ = self.closing() => Err(recorded_or(pipe, AdapterError::AlreadyClosed)),
        };

        if self.config.read_write_logging {
            match &result {
                Ok(()) => debug!(peer = %self.peer, message_id = %pkt.message_id(), "write"),
                Err(e) => debug!(peer = %self.peer, error = %e, "write failed"),
            }
        }
        result
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.closing.send_replace(true);
        let mut guard = self.access.lock().await;
        if !self.connected() {
            return Err(AdapterError::AlreadyClosed);
        }

        // Stopping the writer closes the transport; the reader is stopped
        // afterwards and may already have failed on the closed connection.
        let result = close_handler(&mut guard.write)
            .await
            .map_err(|e| AdapterError::HandlerExited(Box::new(e)));
        if let Err(e) = close_handler(&mut guard.read).await {
            debug!(peer = %self.peer, error = %e, "read handler exited with error");
        }

        self.connected.store(false, Ordering::Release);
        match &result {
            Ok(()) => info!(peer = %self.peer, "channel closed"),
            Err(e) => warn!(peer = %self.peer, error = %e, "channel closed after handler error"),
        }
        result
    }
}
