//! WebSocket transport.
//!
//! Every connection is split into a read task and a write task that feed a
//! [`GenericAdapter`] through its handler pipes. Liveness: the write task
//! pings every `ping_period`, and the read task gives up when no frame of any
//! kind arrives within `pong_wait`.

use dst_core::ChMsgPkt;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::error::{CapacityError, Error as WsError};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::adapter::{read_pipe, write_pipe, GenericAdapter, QuitAck, ReadEnd, ReadWriteCloser, WriteEnd};
use crate::config::{AdapterConfig, WsConfig, MIN_WAIT};
use crate::error::AdapterError;

/// TCP keep-alive probe period on accepted connections.
pub const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

/// Stream limits for `config`. Oversized frames are refused from their header,
/// before the payload is buffered.
pub(crate) fn stream_config(config: &WsConfig) -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(config.max_message_size))
        .max_frame_size(Some(config.max_message_size))
}

/// Handle to a running WebSocket listener.
///
/// Dropping the handle stops accepting new connections.
pub struct Listener {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Listener {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for in-flight upgrades to finish.
    ///
    /// Connections that are already open stay open. If upgrades are still
    /// running when `deadline` expires they are aborted and `TimedOut` is
    /// returned.
    pub async fn shutdown(mut self, deadline: Duration) -> io::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match timeout(deadline, &mut self.task).await {
            Ok(Ok(())) => {
                info!(addr = %self.local_addr, "listener shut down");
                Ok(())
            }
            Ok(Err(e)) => Err(io::Error::other(e)),
            Err(_) => {
                self.task.abort();
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "listener shutdown deadline expired",
                ))
            }
        }
    }
}

/// Bind `addr` and upgrade connections on `endpoint`, delivering each new
/// adapter on `inbound`.
pub(crate) async fn start_listener(
    addr: &str,
    endpoint: &str,
    ws: WsConfig,
    adapter: AdapterConfig,
    inbound: mpsc::Sender<Arc<GenericAdapter>>,
) -> io::Result<Listener> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!("Listening on ws://{}{}", local_addr, endpoint);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(accept_loop(
        listener,
        endpoint.to_string(),
        ws,
        adapter,
        inbound,
        shutdown_rx,
    ));

    Ok(Listener {
        local_addr,
        shutdown: Some(shutdown_tx),
        task,
    })
}

async fn accept_loop(
    listener: TcpListener,
    endpoint: String,
    ws: WsConfig,
    adapter: AdapterConfig,
    inbound: mpsc::Sender<Arc<GenericAdapter>>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut upgrades = JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    upgrades.spawn(upgrade(
                        stream,
                        peer,
                        endpoint.clone(),
                        ws.clone(),
                        adapter.clone(),
                        inbound.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(_) = upgrades.join_next(), if !upgrades.is_empty() => {}
        }
    }

    drop(listener);
    while upgrades.join_next().await.is_some() {}
}

fn set_keepalive(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new().with_time(KEEP_ALIVE_PERIOD);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "enabling tcp keep-alive failed");
    }
}

async fn upgrade(
    stream: TcpStream,
    peer: SocketAddr,
    endpoint: String,
    ws: WsConfig,
    adapter: AdapterConfig,
    inbound: mpsc::Sender<Arc<GenericAdapter>>,
) {
    set_keepalive(&stream);

    let check_path = |req: &Request, resp: Response| {
        if req.uri().path() == endpoint {
            Ok(resp)
        } else {
            let mut err = ErrorResponse::new(Some(format!("no channel endpoint at {}", req.uri().path())));
            *err.status_mut() = StatusCode::NOT_FOUND;
            Err(err)
        }
    };
    let limits = Some(stream_config(&ws));
    let stream = match tokio_tungstenite::accept_hdr_async_with_config(stream, check_path, limits).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%peer, error = %e, "websocket upgrade failed");
            return;
        }
    };

    let channel = spawn_adapter(stream, ws, adapter, peer.to_string());
    debug!(%peer, "accepted channel connection");
    if inbound.send(channel.clone()).await.is_err() {
        debug!(%peer, "inbound queue closed, dropping connection");
        if let Err(e) = channel.close().await {
            debug!(%peer, error = %e, "closing dropped connection");
        }
    }
}

/// Open a WebSocket connection to `addr` + `endpoint`.
pub(crate) async fn dial(
    addr: &str,
    endpoint: &str,
    ws: WsConfig,
    adapter: AdapterConfig,
) -> Result<Arc<GenericAdapter>, AdapterError> {
    let url = format!("ws://{addr}{endpoint}");
    let (stream, _) =
        tokio_tungstenite::connect_async_with_config(url.as_str(), Some(stream_config(&ws)), false).await?;
    debug!(%url, "dialed channel connection");
    Ok(spawn_adapter(stream, ws, adapter, addr))
}

/// Wrap an established WebSocket in an adapter and start its two tasks.
pub(crate) fn spawn_adapter<S>(
    stream: WebSocketStream<S>,
    ws: WsConfig,
    config: AdapterConfig,
    peer: impl Into<String>,
) -> Arc<GenericAdapter>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = stream.split();
    let (read, read_end) = read_pipe();
    let (write, write_end) = write_pipe();
    let adapter = Arc::new(GenericAdapter::new(read, write, config, peer));

    tokio::spawn(read_task(stream, read_end, ws.clone(), Arc::downgrade(&adapter)));
    tokio::spawn(write_task(sink, write_end, ws, Arc::downgrade(&adapter)));
    adapter
}

/// Close the adapter from a background task that hit a terminal error.
fn close_in_background(adapter: Weak<GenericAdapter>) {
    tokio::spawn(async move {
        let Some(adapter) = adapter.upgrade() else {
            return;
        };
        match adapter.close().await {
            Ok(()) | Err(AdapterError::AlreadyClosed) => {}
            Err(e) => error!(peer = %adapter.peer(), error = %e, "error closing channel"),
        }
    });
}

enum Exit {
    Quit(Option<QuitAck>),
    Failed,
}

async fn read_task<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    mut end: ReadEnd,
    config: WsConfig,
    adapter: Weak<GenericAdapter>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut deadline = Instant::now() + config.pong_wait;

    let exit = loop {
        let frame = tokio::select! {
            ack = end.quit.recv() => break Exit::Quit(ack),
            frame = timeout_at(deadline, stream.next()) => frame,
        };

        let message = match frame {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(WsError::Capacity(CapacityError::MessageTooLong { size, max_size })))) => {
                end.fail(AdapterError::FrameTooLarge {
                    size,
                    limit: max_size,
                });
                break Exit::Failed;
            }
            Ok(Some(Err(e))) => {
                end.fail(e.into());
                break Exit::Failed;
            }
            Ok(None) => {
                end.fail(AdapterError::ClosedByPeer);
                break Exit::Failed;
            }
            Err(_) => {
                end.fail(AdapterError::ReadTimeout(config.pong_wait));
                break Exit::Failed;
            }
        };
        deadline = Instant::now() + config.pong_wait;

        let item = match message {
            Message::Binary(data) => {
                if data.len() > config.max_message_size {
                    end.fail(AdapterError::FrameTooLarge {
                        size: data.len(),
                        limit: config.max_message_size,
                    });
                    break Exit::Failed;
                }
                serde_json::from_slice::<ChMsgPkt>(&data).map_err(AdapterError::Decode)
            }
            Message::Close(_) => {
                end.fail(AdapterError::ClosedByPeer);
                break Exit::Failed;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            Message::Text(_) => Err(AdapterError::NonBinaryFrame),
        };

        tokio::select! {
            ack = end.quit.recv() => break Exit::Quit(ack),
            sent = end.msg.send(item) => {
                if sent.is_err() {
                    break Exit::Quit(None);
                }
            }
        }
    };

    drop(stream);
    match exit {
        Exit::Quit(ack) => {
            debug!("exiting message reader");
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
        }
        Exit::Failed => {
            info!("message reader stopped with error");
            close_in_background(adapter);
        }
    }
}

async fn write_task<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut end: WriteEnd,
    config: WsConfig,
    adapter: Weak<GenericAdapter>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let period = config.ping_period.max(MIN_WAIT);
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);

    let exit = loop {
        tokio::select! {
            outbound = end.msg.recv() => {
                let Some(outbound) = outbound else {
                    break Exit::Quit(None);
                };
                match timeout(config.write_wait, sink.send(Message::Binary(outbound.frame.into()))).await {
                    Ok(Ok(())) => {
                        let _ = outbound.done.send(Ok(()));
                    }
                    Ok(Err(e)) => {
                        end.fail(e.into());
                        break Exit::Failed;
                    }
                    Err(_) => {
                        end.fail(AdapterError::WriteTimeout(config.write_wait));
                        break Exit::Failed;
                    }
                }
            }
            ack = end.quit.recv() => break Exit::Quit(ack),
            _ = ping.tick() => {
                match timeout(config.write_wait, sink.send(Message::Ping(Vec::new().into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(error = %e, "ping failed");
                        end.fail(e.into());
                        break Exit::Failed;
                    }
                    Err(_) => {
                        warn!("ping timed out");
                        end.fail(AdapterError::WriteTimeout(config.write_wait));
                        break Exit::Failed;
                    }
                }
            }
        }
    };

    match timeout(config.write_wait, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => info!(error = %e, "connection already closed by peer"),
        Err(_) => info!("closing connection timed out"),
    }
    match exit {
        Exit::Quit(ack) => {
            debug!("exiting message sender");
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
        }
        Exit::Failed => {
            info!("message sender stopped with error");
            close_in_background(adapter);
        }
    }
}
