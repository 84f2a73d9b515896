//! Runtime configuration for one server node.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use keel_core::NodeId;

/// Configuration for a peer node.
///
/// The address may be `ip:port` or `hostname:port`; resolution is deferred
/// to connection time.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// The peer's node ID.
    pub node_id: NodeId,
    /// The peer's listen address.
    pub addr: String,
}

impl PeerConfig {
    /// Creates a peer configuration.
    #[must_use]
    pub fn new(node_id: NodeId, addr: impl Into<String>) -> Self {
        Self {
            node_id,
            addr: addr.into(),
        }
    }
}

/// Configuration for this server node.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// This node's ID.
    pub node_id: NodeId,
    /// Address to listen on for peer RPCs.
    pub listen_addr: SocketAddr,
    /// The other nodes of the cluster.
    pub peers: Vec<PeerConfig>,
    /// Data directory for durable member state.
    pub data_dir: PathBuf,
    /// Deadline for one outbound request/response round trip.
    pub request_timeout: Duration,
    /// Deadline for an outbound snapshot transfer.
    pub snapshot_timeout: Duration,
}

impl ServerConfig {
    /// Creates a configuration with defaults for everything but identity.
    #[must_use]
    pub fn new(node_id: NodeId, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            peers: Vec::new(),
            data_dir: PathBuf::from("data"),
            request_timeout: Duration::from_secs(5),
            snapshot_timeout: Duration::from_secs(300),
        }
    }

    /// Adds a peer.
    #[must_use]
    pub fn with_peer(mut self, node_id: NodeId, addr: impl Into<String>) -> Self {
        self.peers.push(PeerConfig::new(node_id, addr));
        self
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.peers.iter().any(|p| p.node_id == self.node_id) {
            return Err("peer list contains this node");
        }
        if self.request_timeout.is_zero() {
            return Err("request_timeout must be non-zero");
        }
        if self.snapshot_timeout < self.request_timeout {
            return Err("snapshot_timeout must be at least request_timeout");
        }
        Ok(())
    }
}
