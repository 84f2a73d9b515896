//! The outbound RPC seam.
//!
//! The consensus core assumes an async request/response transport exists;
//! this trait is its contract. `keel-runtime` provides the TCP
//! implementation, tests provide in-process doubles.

use std::fmt;

use async_trait::async_trait;
use keel_core::{GroupId, NodeId};

use crate::message::{
    AppendEntriesRequest, AppendEntryResult, CommitIndexResponse, ElectionRequest,
    ExecuteRequest, ExecuteResponse, HeartbeatRequest, HeartbeatResponse, MatchTermRequest,
    SendSnapshotRequest,
};

/// Transport-level failure reaching a consensus component.
///
/// These are never fatal to the member; they decrement failure counters and
/// feed the catch-up trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The peer could not be reached.
    Unreachable {
        /// The peer in question.
        peer: NodeId,
    },
    /// The request did not complete within its deadline.
    Timeout {
        /// The peer in question.
        peer: NodeId,
    },
    /// The peer answered with a transport-level error.
    Remote {
        /// The peer's error text.
        message: String,
    },
    /// The local transport has shut down.
    Shutdown,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable { peer } => write!(f, "peer {peer} unreachable"),
            Self::Timeout { peer } => write!(f, "request to {peer} timed out"),
            Self::Remote { message } => write!(f, "remote error: {message}"),
            Self::Shutdown => write!(f, "transport shut down"),
        }
    }
}

impl std::error::Error for RpcError {}

/// Async request/response client to the other members of a group.
///
/// All sends are non-blocking with respect to member locks: callers must
/// never hold the term monitor across an invocation.
#[async_trait]
pub trait PeerClient: Send + Sync + 'static {
    /// Sends a heartbeat.
    async fn heartbeat(
        &self,
        peer: NodeId,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, RpcError>;

    /// Solicits a vote. The reply is a response-code sentinel or a term.
    async fn request_vote(&self, peer: NodeId, request: ElectionRequest)
        -> Result<i64, RpcError>;

    /// Replicates a batch of entries.
    async fn append_entries(
        &self,
        peer: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntryResult, RpcError>;

    /// Transfers a snapshot. May take much longer than other calls.
    async fn send_snapshot(
        &self,
        peer: NodeId,
        request: SendSnapshotRequest,
    ) -> Result<(), RpcError>;

    /// Asks whether the peer's log holds `(index, term)`.
    async fn match_term(&self, peer: NodeId, request: MatchTermRequest)
        -> Result<bool, RpcError>;

    /// Forwards a client request, typically to the leader.
    async fn execute(
        &self,
        peer: NodeId,
        request: ExecuteRequest,
    ) -> Result<ExecuteResponse, RpcError>;

    /// Reads the peer's commit point.
    async fn commit_index(
        &self,
        peer: NodeId,
        group_id: GroupId,
    ) -> Result<CommitIndexResponse, RpcError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scriptable in-process peer client.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::message::response;

    /// How the mock answers one call.
    #[derive(Debug, Clone)]
    pub(crate) enum Reply<T> {
        Value(T),
        Error(RpcError),
        /// Never resolves; models a voter that goes dark.
        Pending,
    }

    type AppendFn =
        dyn Fn(NodeId, &AppendEntriesRequest) -> Result<AppendEntryResult, RpcError> + Send + Sync;

    /// Records requests and answers them from per-peer scripts.
    pub(crate) struct MockClient {
        pub(crate) append_log: Mutex<Vec<(NodeId, AppendEntriesRequest)>>,
        pub(crate) snapshot_log: Mutex<Vec<(NodeId, SendSnapshotRequest)>>,
        pub(crate) heartbeat_log: Mutex<Vec<(NodeId, HeartbeatRequest)>>,
        vote_script: Mutex<HashMap<u64, Reply<i64>>>,
        append_reply: Mutex<Box<AppendFn>>,
        snapshot_reply: Mutex<Reply<()>>,
        heartbeat_reply: Mutex<HashMap<u64, Reply<HeartbeatResponse>>>,
    }

    impl MockClient {
        pub(crate) fn new() -> Self {
            Self {
                append_log: Mutex::new(Vec::new()),
                snapshot_log: Mutex::new(Vec::new()),
                heartbeat_log: Mutex::new(Vec::new()),
                vote_script: Mutex::new(HashMap::new()),
                append_reply: Mutex::new(Box::new(|peer, req| {
                    let last = req
                        .prev_log_index
                        .get()
                        .saturating_add(req.entries.len() as u64);
                    Ok(AppendEntryResult::agree(
                        peer,
                        keel_core::LogIndex::new(last),
                        req.term,
                    ))
                })),
                snapshot_reply: Mutex::new(Reply::Value(())),
                heartbeat_reply: Mutex::new(HashMap::new()),
            }
        }

        pub(crate) fn script_vote(&self, peer: NodeId, reply: Reply<i64>) {
            self.vote_script
                .lock()
                .unwrap()
                .insert(peer.get(), reply);
        }

        pub(crate) fn script_append(
            &self,
            f: impl Fn(NodeId, &AppendEntriesRequest) -> Result<AppendEntryResult, RpcError>
                + Send
                + Sync
                + 'static,
        ) {
            *self.append_reply.lock().unwrap() = Box::new(f);
        }

        pub(crate) fn script_snapshot(&self, reply: Reply<()>) {
            *self.snapshot_reply.lock().unwrap() = reply;
        }

        pub(crate) fn script_heartbeat(&self, peer: NodeId, reply: Reply<HeartbeatResponse>) {
            self.heartbeat_reply
                .lock()
                .unwrap()
                .insert(peer.get(), reply);
        }

        pub(crate) fn append_requests_to(&self, peer: NodeId) -> Vec<AppendEntriesRequest> {
            self.append_log
                .lock()
                .unwrap()
                .iter()
                .filter(|(p, _)| *p == peer)
                .map(|(_, r)| r.clone())
                .collect()
        }
    }

    #[async_trait]
    impl PeerClient for MockClient {
        async fn heartbeat(
            &self,
            peer: NodeId,
            request: HeartbeatRequest,
        ) -> Result<HeartbeatResponse, RpcError> {
            self.heartbeat_log.lock().unwrap().push((peer, request));
            let reply = self
                .heartbeat_reply
                .lock()
                .unwrap()
                .get(&peer.get())
                .cloned();
            match reply {
                Some(Reply::Value(resp)) => Ok(resp),
                Some(Reply::Error(err)) => Err(err),
                Some(Reply::Pending) => std::future::pending().await,
                None => Ok(HeartbeatResponse {
                    status: response::AGREE,
                    follower: peer,
                    last_log_index: request.commit_index,
                    last_log_term: request.commit_term,
                }),
            }
        }

        async fn request_vote(
            &self,
            peer: NodeId,
            _request: ElectionRequest,
        ) -> Result<i64, RpcError> {
            let reply = self.vote_script.lock().unwrap().get(&peer.get()).cloned();
            match reply {
                Some(Reply::Value(resp)) => Ok(resp),
                Some(Reply::Error(err)) => Err(err),
                Some(Reply::Pending) => std::future::pending().await,
                None => Ok(response::AGREE),
            }
        }

        async fn append_entries(
            &self,
            peer: NodeId,
            request: AppendEntriesRequest,
        ) -> Result<AppendEntryResult, RpcError> {
            self.append_log
                .lock()
                .unwrap()
                .push((peer, request.clone()));
            (self.append_reply.lock().unwrap())(peer, &request)
        }

        async fn send_snapshot(
            &self,
            peer: NodeId,
            request: SendSnapshotRequest,
        ) -> Result<(), RpcError> {
            self.snapshot_log.lock().unwrap().push((peer, request));
            let reply = self.snapshot_reply.lock().unwrap().clone();
            match reply {
                Reply::Value(()) => Ok(()),
                Reply::Error(err) => Err(err),
                Reply::Pending => std::future::pending().await,
            }
        }

        async fn match_term(
            &self,
            _peer: NodeId,
            _request: MatchTermRequest,
        ) -> Result<bool, RpcError> {
            Ok(true)
        }

        async fn execute(
            &self,
            _peer: NodeId,
            _request: ExecuteRequest,
        ) -> Result<ExecuteResponse, RpcError> {
            Err(RpcError::Shutdown)
        }

        async fn commit_index(
            &self,
            peer: NodeId,
            _group_id: GroupId,
        ) -> Result<CommitIndexResponse, RpcError> {
            Err(RpcError::Unreachable { peer })
        }
    }
}
