//! Keel runtime - the production transport for the consensus engine.
//!
//! The consensus core assumes an async request/response transport; this
//! crate provides it over TCP. Frames carry a correlation ID so responses
//! match up with their requests regardless of completion order, while
//! requests from one sender are written in issue order.
//!
//! [`TcpPeerClient`] is the outbound side (implements
//! [`keel_raft::PeerClient`]); [`RaftService`] is the inbound side,
//! dispatching decoded requests to the [`GroupRegistry`]'s members.

#![forbid(unsafe_code)]
#![deny(clippy::all)]

pub mod codec;
mod config;
mod service;
mod transport;

pub use config::{PeerConfig, ServerConfig};
pub use service::{GroupRegistry, RaftService, ServiceHandle};
pub use transport::{TcpPeerClient, TransportError};
