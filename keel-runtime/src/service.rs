//! Inbound RPC surface.
//!
//! One [`RaftService`] listens for peer connections and dispatches decoded
//! requests to the members registered for each group. Requests on one
//! connection are handled in arrival order - the per-peer FIFO the
//! dispatcher relies on - except forwarded client requests, which may wait
//! on consensus and are handled concurrently; the correlation ID keeps
//! their responses matched.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use keel_core::GroupId;
use keel_raft::{ExecuteResponse, RaftError, RaftMember};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::codec::{self, CodecError, Frame, FrameKind, Method};
use crate::config::ServerConfig;
use crate::transport::{create_reusable_listener, TransportError};

/// Read buffer size for inbound connections (1 MiB).
const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// The members this node hosts, one per replication group.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    members: Mutex<HashMap<u64, RaftMember>>,
}

impl GroupRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `member` for its group, replacing any previous member.
    pub fn register(&self, member: RaftMember) {
        self.members
            .lock()
            .expect("members mutex poisoned")
            .insert(member.group_id().get(), member);
    }

    /// Removes the member for `group_id`.
    pub fn remove(&self, group_id: GroupId) {
        self.members
            .lock()
            .expect("members mutex poisoned")
            .remove(&group_id.get());
    }

    /// Looks up the member for `group_id`.
    #[must_use]
    pub fn get(&self, group_id: GroupId) -> Option<RaftMember> {
        self.members
            .lock()
            .expect("members mutex poisoned")
            .get(&group_id.get())
            .cloned()
    }

    /// Returns the number of hosted groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.lock().expect("members mutex poisoned").len()
    }

    /// Returns true if no groups are hosted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a running service.
pub struct ServiceHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl ServiceHandle {
    /// Returns the bound listen address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// The inbound RPC service.
pub struct RaftService;

impl RaftService {
    /// Binds the configured address and starts serving.
    ///
    /// # Errors
    /// Returns an error if the listen address cannot be bound.
    pub fn serve(
        config: &ServerConfig,
        registry: Arc<GroupRegistry>,
    ) -> Result<ServiceHandle, TransportError> {
        let listener = create_reusable_listener(config.listen_addr).map_err(|source| {
            TransportError::BindFailed {
                addr: config.listen_addr,
                source,
            }
        })?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!(node_id = config.node_id.get(), %local_addr, "raft service listening");
        tokio::spawn(accept_loop(listener, registry, shutdown_rx));

        Ok(ServiceHandle {
            local_addr,
            shutdown,
        })
    }
}

async fn accept_loop(
    listener: tokio::net::TcpListener,
    registry: Arc<GroupRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!(%peer_addr, "accepted connection");
                        let registry = Arc::clone(&registry);
                        tokio::spawn(async move {
                            if let Err(err) = serve_connection(stream, registry).await {
                                debug!(%peer_addr, %err, "connection ended");
                            }
                        });
                    }
                    Err(err) => warn!(%err, "accept failed"),
                }
            }
            _ = shutdown.changed() => {
                info!("raft service shutting down");
                break;
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    registry: Arc<GroupRegistry>,
) -> Result<(), TransportError> {
    let (mut reader, mut writer) = stream.into_split();

    // Responses may complete out of order; a writer task serializes them.
    let (response_tx, mut response_rx) = mpsc::channel::<Frame>(64);
    let write_task = tokio::spawn(async move {
        while let Some(frame) = response_rx.recv().await {
            if writer.write_all(&codec::encode_frame(&frame)).await.is_err() {
                break;
            }
        }
    });

    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    'read: loop {
        let read = reader.read_buf(&mut buf).await?;
        if read == 0 {
            break;
        }

        loop {
            match codec::decode_frame(&buf) {
                Ok((frame, consumed)) => {
                    let _ = buf.split_to(consumed);
                    if frame.kind != FrameKind::Request {
                        debug!("non-request frame on server connection");
                        continue;
                    }
                    // Forwarded client requests wait on consensus; handle
                    // them concurrently so they cannot stall heartbeats.
                    if frame.method == Method::Execute {
                        let registry = Arc::clone(&registry);
                        let response_tx = response_tx.clone();
                        tokio::spawn(async move {
                            let response = handle_request(&registry, frame).await;
                            let _ = response_tx.send(response).await;
                        });
                    } else {
                        let response = handle_request(&registry, frame).await;
                        if response_tx.send(response).await.is_err() {
                            break 'read;
                        }
                    }
                }
                Err(CodecError::InsufficientData { .. }) => break,
                Err(err) => {
                    warn!(%err, "undecodable request frame");
                    return Err(err.into());
                }
            }
        }
    }

    drop(response_tx);
    let _ = write_task.await;
    Ok(())
}

async fn handle_request(registry: &GroupRegistry, frame: Frame) -> Frame {
    let correlation = frame.correlation;
    let method = frame.method;

    match dispatch(registry, method, frame.payload).await {
        Ok(payload) => Frame {
            kind: FrameKind::ResponseOk,
            method,
            correlation,
            payload,
        },
        Err(message) => Frame {
            kind: FrameKind::ResponseError,
            method,
            correlation,
            payload: Bytes::from(message),
        },
    }
}

/// Decodes, routes and executes one request, returning the encoded
/// response payload.
async fn dispatch(
    registry: &GroupRegistry,
    method: Method,
    payload: Bytes,
) -> Result<Bytes, String> {
    let member_for = |group_id: GroupId| {
        registry
            .get(group_id)
            .ok_or_else(|| format!("no member for {group_id}"))
    };

    match method {
        Method::Heartbeat => {
            let request =
                codec::decode_heartbeat_request(payload).map_err(|e| e.to_string())?;
            let member = member_for(request.group_id)?;
            let response = member.process_heartbeat_request(request).await;
            Ok(codec::encode_heartbeat_response(&response))
        }
        Method::Election => {
            let request = codec::decode_election_request(payload).map_err(|e| e.to_string())?;
            let member = member_for(request.group_id)?;
            let verdict = member.process_election_request(request).await;
            Ok(codec::encode_vote_verdict(verdict))
        }
        Method::AppendEntries => {
            let request = codec::decode_append_request(payload).map_err(|e| e.to_string())?;
            let member = member_for(request.group_id)?;
            let result = member
                .append_entries(request)
                .await
                .map_err(|e| e.to_string())?;
            Ok(codec::encode_append_result(&result))
        }
        Method::SendSnapshot => {
            let request = codec::decode_snapshot_request(payload).map_err(|e| e.to_string())?;
            let member = member_for(request.group_id)?;
            member
                .install_snapshot(request.snapshot)
                .await
                .map_err(|e| e.to_string())?;
            Ok(Bytes::new())
        }
        Method::MatchTerm => {
            let request =
                codec::decode_match_term_request(payload).map_err(|e| e.to_string())?;
            let member = member_for(request.group_id)?;
            let matched = member.match_log(request.index, request.term).await;
            Ok(codec::encode_match_verdict(matched))
        }
        Method::Execute => {
            let request = codec::decode_execute_request(payload).map_err(|e| e.to_string())?;
            let member = member_for(request.group_id)?;
            // Consensus rejections travel as status codes, not transport
            // errors; only real failures become error frames.
            let response = match member.execute(request.request).await {
                Ok(response) => response,
                Err(RaftError::NotLeader { leader }) => ExecuteResponse::not_leader(leader),
                Err(RaftError::UnknownLeader) => ExecuteResponse::not_leader(None),
                Err(err) => return Err(err.to_string()),
            };
            Ok(codec::encode_execute_response(&response))
        }
        Method::CommitIndex => {
            let group_id =
                codec::decode_commit_index_request(payload).map_err(|e| e.to_string())?;
            let member = member_for(group_id)?;
            let response = member.request_commit_index().await;
            Ok(codec::encode_commit_index_response(&response))
        }
    }
}
