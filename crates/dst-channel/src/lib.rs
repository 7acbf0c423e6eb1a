//! Off-chain channel transport and protocol.
//!
//! Layers, bottom up:
//!
//! - [`GenericAdapter`]: read/write/close over a connection served by two
//!   background tasks.
//! - [`websocket`]: the WebSocket transport behind the adapter.
//! - The request-response exchanges, as methods on [`Instance`].
//! - [`Instance`]: one channel with its status machine and signed states.
//! - [`new_session`] / [`new_channel`]: listener and dialer entry points.

mod adapter;
mod config;
mod error;
mod instance;
mod protocol;
mod session;
pub mod websocket;

pub use adapter::{GenericAdapter, ReadWriteCloser};
pub use config::{AdapterConfig, AdapterType, SessionConfig, WsConfig, MIN_WAIT};
pub use error::{AdapterError, InstanceError, ProtocolError, SessionError};
pub use instance::{ClosingMode, Instance, Status};
pub use session::{new_channel, new_channel_conn, new_session, start_listener, Session};
pub use websocket::Listener;
