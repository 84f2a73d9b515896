//! Outbound TCP transport.
//!
//! Each peer gets one connection actor: a task that owns the socket,
//! writes request frames in issue order, matches response frames back to
//! their waiters by correlation ID, and reconnects with exponential
//! backoff. Connections are established lazily on first demand.
//!
//! Request ordering follows the sender: frames are written in the order
//! requests are issued, which is what the dispatcher's per-peer FIFO
//! relies on.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use keel_core::{GroupId, NodeId};
use keel_raft::{
    AppendEntriesRequest, AppendEntryResult, CommitIndexResponse, ElectionRequest,
    ExecuteRequest, ExecuteResponse, HeartbeatRequest, HeartbeatResponse, MatchTermRequest,
    PeerClient, RpcError, SendSnapshotRequest,
};
use socket2::{Domain, Socket, Type};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::codec::{self, CodecError, Frame, FrameKind, Method};
use crate::config::{PeerConfig, ServerConfig};

/// Read buffer size for connection actors (1 MiB).
const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Connect timeout.
const CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Reconnect backoff bounds.
const RECONNECT_DELAY_MIN_MS: u64 = 100;
const RECONNECT_DELAY_MAX_MS: u64 = 10_000;

/// Pending requests per peer before sends fail fast.
const MAX_PENDING_REQUESTS: usize = 1_024;

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to bind the listen address.
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        /// The address we tried to bind.
        addr: SocketAddr,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Codec failure on a stream.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O failure on a stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

struct OutboundRequest {
    method: Method,
    payload: Bytes,
    reply: oneshot::Sender<Result<Bytes, RpcError>>,
}

struct PeerHandle {
    sender: mpsc::Sender<OutboundRequest>,
}

/// TCP-backed implementation of [`PeerClient`].
#[derive(Clone)]
pub struct TcpPeerClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    node_id: NodeId,
    peers: HashMap<u64, PeerHandle>,
    request_timeout: Duration,
    snapshot_timeout: Duration,
}

impl TcpPeerClient {
    /// Creates the client and spawns one connection actor per peer.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        let mut peers = HashMap::new();
        for peer in &config.peers {
            peers.insert(peer.node_id.get(), Self::spawn_actor(config.node_id, peer));
        }
        Self {
            inner: Arc::new(ClientInner {
                node_id: config.node_id,
                peers,
                request_timeout: config.request_timeout,
                snapshot_timeout: config.snapshot_timeout,
            }),
        }
    }

    fn spawn_actor(node_id: NodeId, peer: &PeerConfig) -> PeerHandle {
        let (tx, rx) = mpsc::channel(MAX_PENDING_REQUESTS);
        tokio::spawn(connection_loop(node_id, peer.node_id, peer.addr.clone(), rx));
        PeerHandle { sender: tx }
    }

    /// Returns this node's ID.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    async fn request(
        &self,
        peer: NodeId,
        method: Method,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, RpcError> {
        debug_assert!(peer != self.inner.node_id, "cannot send request to self");

        let handle = self
            .inner
            .peers
            .get(&peer.get())
            .ok_or(RpcError::Unreachable { peer })?;

        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .sender
            .send(OutboundRequest {
                method,
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RpcError::Shutdown)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Unreachable { peer }),
            Err(_) => Err(RpcError::Timeout { peer }),
        }
    }

    fn remote(err: CodecError) -> RpcError {
        RpcError::Remote {
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl PeerClient for TcpPeerClient {
    async fn heartbeat(
        &self,
        peer: NodeId,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, RpcError> {
        let payload = codec::encode_heartbeat_request(&request);
        let reply = self
            .request(peer, Method::Heartbeat, payload, self.inner.request_timeout)
            .await?;
        codec::decode_heartbeat_response(reply).map_err(Self::remote)
    }

    async fn request_vote(&self, peer: NodeId, request: ElectionRequest) -> Result<i64, RpcError> {
        let payload = codec::encode_election_request(&request);
        let reply = self
            .request(peer, Method::Election, payload, self.inner.request_timeout)
            .await?;
        codec::decode_vote_verdict(reply).map_err(Self::remote)
    }

    async fn append_entries(
        &self,
        peer: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntryResult, RpcError> {
        let payload = codec::encode_append_request(&request);
        let reply = self
            .request(
                peer,
                Method::AppendEntries,
                payload,
                self.inner.request_timeout,
            )
            .await?;
        codec::decode_append_result(reply).map_err(Self::remote)
    }

    async fn send_snapshot(
        &self,
        peer: NodeId,
        request: SendSnapshotRequest,
    ) -> Result<(), RpcError> {
        let payload = codec::encode_snapshot_request(&request);
        // Snapshots get the extended deadline.
        self.request(
            peer,
            Method::SendSnapshot,
            payload,
            self.inner.snapshot_timeout,
        )
        .await?;
        Ok(())
    }

    async fn match_term(&self, peer: NodeId, request: MatchTermRequest) -> Result<bool, RpcError> {
        let payload = codec::encode_match_term_request(&request);
        let reply = self
            .request(peer, Method::MatchTerm, payload, self.inner.request_timeout)
            .await?;
        codec::decode_match_verdict(reply).map_err(Self::remote)
    }

    async fn execute(
        &self,
        peer: NodeId,
        request: ExecuteRequest,
    ) -> Result<ExecuteResponse, RpcError> {
        let payload = codec::encode_execute_request(&request);
        let reply = self
            .request(peer, Method::Execute, payload, self.inner.request_timeout)
            .await?;
        codec::decode_execute_response(reply).map_err(Self::remote)
    }

    async fn commit_index(
        &self,
        peer: NodeId,
        group_id: GroupId,
    ) -> Result<CommitIndexResponse, RpcError> {
        let payload = codec::encode_commit_index_request(group_id);
        let reply = self
            .request(
                peer,
                Method::CommitIndex,
                payload,
                self.inner.request_timeout,
            )
            .await?;
        codec::decode_commit_index_response(reply).map_err(Self::remote)
    }
}

/// Owns one peer's socket: connects on demand, writes requests in order,
/// resolves responses by correlation ID, reconnects on failure.
async fn connection_loop(
    node_id: NodeId,
    peer: NodeId,
    addr: String,
    mut requests: mpsc::Receiver<OutboundRequest>,
) {
    let mut reconnect_delay_ms = RECONNECT_DELAY_MIN_MS;
    let mut next_correlation: u64 = 1;

    loop {
        // Wait for demand before holding a connection.
        let Some(first) = requests.recv().await else {
            debug!(%peer, "connection actor exits");
            return;
        };

        let mut stream = match connect(peer, &addr).await {
            Ok(stream) => {
                reconnect_delay_ms = RECONNECT_DELAY_MIN_MS;
                info!(node_id = node_id.get(), %peer, %addr, "connected to peer");
                stream
            }
            Err(err) => {
                warn!(%peer, %err, "connect failed, will retry");
                let _ = first.reply.send(Err(RpcError::Unreachable { peer }));
                tokio::time::sleep(Duration::from_millis(reconnect_delay_ms)).await;
                reconnect_delay_ms = (reconnect_delay_ms * 2).min(RECONNECT_DELAY_MAX_MS);
                continue;
            }
        };

        let mut pending: HashMap<u64, oneshot::Sender<Result<Bytes, RpcError>>> = HashMap::new();
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut inflight = Some(first);

        'connected: loop {
            if let Some(request) = inflight.take() {
                let correlation = next_correlation;
                next_correlation += 1;
                let frame = Frame {
                    kind: FrameKind::Request,
                    method: request.method,
                    correlation,
                    payload: request.payload,
                };
                if let Err(err) = stream.write_all(&codec::encode_frame(&frame)).await {
                    warn!(%peer, %err, "write failed, reconnecting");
                    let _ = request.reply.send(Err(RpcError::Unreachable { peer }));
                    break 'connected;
                }
                pending.insert(correlation, request.reply);
            }

            tokio::select! {
                maybe_request = requests.recv() => {
                    match maybe_request {
                        Some(request) => inflight = Some(request),
                        None => {
                            debug!(%peer, "connection actor exits");
                            return;
                        }
                    }
                }
                read = stream.read_buf(&mut buf) => {
                    match read {
                        Ok(0) => {
                            debug!(%peer, "connection closed by peer");
                            break 'connected;
                        }
                        Ok(_) => {
                            if !drain_responses(peer, &mut buf, &mut pending) {
                                break 'connected;
                            }
                        }
                        Err(err) => {
                            warn!(%peer, %err, "read failed, reconnecting");
                            break 'connected;
                        }
                    }
                }
            }
        }

        // Anything still pending on this connection is lost.
        for (_, reply) in pending.drain() {
            let _ = reply.send(Err(RpcError::Unreachable { peer }));
        }
    }
}

/// Decodes every complete response frame in `buf`. Returns false when the
/// stream is poisoned and must be dropped.
fn drain_responses(
    peer: NodeId,
    buf: &mut BytesMut,
    pending: &mut HashMap<u64, oneshot::Sender<Result<Bytes, RpcError>>>,
) -> bool {
    loop {
        match codec::decode_frame(buf) {
            Ok((frame, consumed)) => {
                let _ = buf.split_to(consumed);
                let Some(reply) = pending.remove(&frame.correlation) else {
                    debug!(%peer, correlation = frame.correlation, "response for unknown request");
                    continue;
                };
                let result = match frame.kind {
                    FrameKind::ResponseOk => Ok(frame.payload),
                    FrameKind::ResponseError => Err(RpcError::Remote {
                        message: String::from_utf8_lossy(&frame.payload).into_owned(),
                    }),
                    FrameKind::Request => {
                        debug!(%peer, "request frame on client connection");
                        continue;
                    }
                };
                let _ = reply.send(result);
            }
            Err(CodecError::InsufficientData { .. }) => return true,
            Err(err) => {
                warn!(%peer, %err, "undecodable frame, dropping connection");
                return false;
            }
        }
    }
}

async fn connect(peer: NodeId, addr: &str) -> Result<TcpStream, std::io::Error> {
    let timeout = Duration::from_millis(CONNECT_TIMEOUT_MS);
    let connect_future = async {
        let mut addrs = tokio::net::lookup_host(addr).await?;
        let resolved = addrs.next().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses found for {addr}"),
            )
        })?;
        TcpStream::connect(resolved).await
    };

    match tokio::time::timeout(timeout, connect_future).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(err)) => Err(err),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connect to {peer} timed out"),
        )),
    }
}

/// Creates a TCP listener with `SO_REUSEADDR`, so restarts can rebind a
/// port still in `TIME_WAIT`.
pub(crate) fn create_reusable_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_to_unknown_peer_fails() {
        let config = ServerConfig::new(NodeId::new(1), "127.0.0.1:0".parse().unwrap());
        let client = TcpPeerClient::new(&config);

        let result = client
            .request_vote(
                NodeId::new(9),
                ElectionRequest {
                    group_id: GroupId::new(1),
                    term: keel_core::TermId::new(1),
                    elector: NodeId::new(1),
                    last_log_index: keel_core::LogIndex::new(0),
                    last_log_term: keel_core::TermId::new(0),
                },
            )
            .await;
        assert!(matches!(result, Err(RpcError::Unreachable { .. })));
    }

    #[tokio::test]
    async fn request_to_dead_peer_reports_unreachable() {
        // Nothing listens on this port.
        let config = ServerConfig::new(NodeId::new(1), "127.0.0.1:0".parse().unwrap())
            .with_peer(NodeId::new(2), "127.0.0.1:1");
        let client = TcpPeerClient::new(&config);

        let result = client
            .match_term(
                NodeId::new(2),
                MatchTermRequest {
                    group_id: GroupId::new(1),
                    index: keel_core::LogIndex::new(1),
                    term: keel_core::TermId::new(1),
                },
            )
            .await;
        assert!(matches!(
            result,
            Err(RpcError::Unreachable { .. } | RpcError::Timeout { .. })
        ));
    }

    #[test]
    fn reusable_listener_binds() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        let listener = create_reusable_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }
}
