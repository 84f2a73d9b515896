//! Out-of-band resynchronization of lagging followers.
//!
//! When a follower's next index is still inside the live log, a log
//! catch-up replays the missing slice in frame-limited batches, outside
//! the dispatcher queues and free of rate limiting. When the follower has
//! fallen behind the compaction boundary, a snapshot is transferred first
//! and the log tail replayed after it.
//!
//! At most one task runs per peer; a task unregisters itself on every exit
//! path so a later trigger may retry.

use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;

use keel_core::{limits, LogIndex, NodeId, TermId};
use tracing::{info, warn};

use crate::client::RpcError;
use crate::log::Entry;
use crate::member::RaftMember;
use crate::message::{AppendEntriesRequest, SendSnapshotRequest};
use crate::snapshot::Snapshot;

/// What a lagging peer needs.
pub(crate) struct CatchUpPlan {
    /// Transferred first when the peer is behind the compaction boundary.
    pub(crate) snapshot: Option<Snapshot>,
    /// The log slice to replay.
    pub(crate) entries: Vec<Entry>,
}

/// Why a catch-up task ended early.
#[derive(Debug)]
pub enum CatchUpError {
    /// This node stopped being the leader.
    LeaderUnknown,
    /// The snapshot send did not complete within the wait bound.
    SnapshotTimeout,
    /// The snapshot send failed in transport.
    SnapshotFailed(RpcError),
    /// The peer rejected a replayed batch.
    PeerRejected(i64),
    /// A replayed batch failed in transport.
    Transport(RpcError),
    /// A larger term was observed; this node stepped down.
    SteppedDown(TermId),
    /// The plan could not be built.
    Aborted(String),
}

impl fmt::Display for CatchUpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LeaderUnknown => write!(f, "no longer the leader"),
            Self::SnapshotTimeout => write!(f, "snapshot send timed out"),
            Self::SnapshotFailed(err) => write!(f, "snapshot send failed: {err}"),
            Self::PeerRejected(status) => write!(f, "peer rejected replay: {status}"),
            Self::Transport(err) => write!(f, "replay failed: {err}"),
            Self::SteppedDown(term) => write!(f, "stepped down to term {term}"),
            Self::Aborted(reason) => write!(f, "aborted: {reason}"),
        }
    }
}

impl std::error::Error for CatchUpError {}

/// Registry enforcing at most one active catch-up per peer.
#[derive(Debug, Default)]
pub struct CatchUpManager {
    active: Mutex<HashSet<NodeId>>,
}

impl CatchUpManager {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `peer` for a new task. Returns false if one is active.
    pub fn register(&self, peer: NodeId) -> bool {
        self.active.lock().expect("active mutex poisoned").insert(peer)
    }

    /// Releases `peer` so a future trigger may retry.
    pub fn unregister(&self, peer: NodeId) {
        self.active.lock().expect("active mutex poisoned").remove(&peer);
    }

    /// Returns true if a task is active for `peer`.
    #[must_use]
    pub fn is_active(&self, peer: NodeId) -> bool {
        self.active.lock().expect("active mutex poisoned").contains(&peer)
    }
}

/// Runs one catch-up task to completion and releases the registration.
///
/// Returns true on success. Test observability; production callers ignore
/// the result and rely on a later trigger to retry.
pub(crate) async fn run_catch_up(member: RaftMember, peer: NodeId, next_index: LogIndex) -> bool {
    debug_assert!(member.catch_up().is_active(peer), "task not registered");

    let result = drive(&member, peer, next_index).await;
    member.catch_up().unregister(peer);

    match result {
        Ok(()) => {
            info!(%peer, "catch up finished");
            true
        }
        Err(err) => {
            warn!(%peer, %err, "catch up failed");
            false
        }
    }
}

async fn drive(
    member: &RaftMember,
    peer: NodeId,
    next_index: LogIndex,
) -> Result<(), CatchUpError> {
    let term = member.current_term().await;
    let plan = member
        .catch_up_plan(next_index)
        .await
        .map_err(|err| CatchUpError::Aborted(err.to_string()))?;

    if let Some(snapshot) = plan.snapshot {
        send_snapshot(member, peer, term, &snapshot).await?;
        info!(
            %peer,
            last_included = snapshot.last_included_index.get(),
            "snapshot delivered, replaying log tail"
        );
    }

    replay_entries(member, peer, term, &plan.entries).await
}

async fn send_snapshot(
    member: &RaftMember,
    peer: NodeId,
    term: TermId,
    snapshot: &Snapshot,
) -> Result<(), CatchUpError> {
    // The role must be re-checked under the term monitor right before a
    // transfer this expensive.
    if !member.is_still_leader(term).await {
        return Err(CatchUpError::LeaderUnknown);
    }

    let request = SendSnapshotRequest {
        group_id: member.config().group_id,
        snapshot: snapshot.encode(),
    };
    info!(%peer, size = request.snapshot.len(), "sending snapshot");

    let send = member.client().send_snapshot(peer, request);
    match tokio::time::timeout(member.config().catch_up_timeout, send).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(CatchUpError::SnapshotFailed(err)),
        Err(_) => Err(CatchUpError::SnapshotTimeout),
    }
}

async fn replay_entries(
    member: &RaftMember,
    peer: NodeId,
    term: TermId,
    entries: &[Entry],
) -> Result<(), CatchUpError> {
    let config = member.config();
    let mut i = 0;

    while i < entries.len() {
        // Leadership is validated once per batch, not per entry.
        if !member.is_still_leader(term).await {
            return Err(CatchUpError::LeaderUnknown);
        }

        let first = i;
        let mut size = 0u64;
        let mut batch = Vec::new();
        while i < entries.len() {
            let wire = entries[i].encode();
            let wire_size = wire.len() as u64;
            if !batch.is_empty()
                && size + wire_size + limits::FRAME_RESERVED_BYTES > config.max_frame_size
            {
                break;
            }
            size += wire_size;
            batch.push(wire);
            i += 1;
        }

        let head = &entries[first];
        let request = AppendEntriesRequest {
            group_id: config.group_id,
            term,
            leader: config.node_id,
            leader_commit: member.commit_view(),
            prev_log_index: head.index.prev(),
            prev_log_term: head.prev_term,
            entries: batch,
        };

        match member.client().append_entries(peer, request).await {
            Ok(result) if result.is_accepted() => {}
            Ok(result) => {
                if let Some(observed) = result.rejecting_term() {
                    if observed > term {
                        member.step_down(observed, None).await;
                        return Err(CatchUpError::SteppedDown(observed));
                    }
                }
                return Err(CatchUpError::PeerRejected(result.status));
            }
            Err(err) => return Err(CatchUpError::Transport(err)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::apply::testing::JournalMachine;
    use crate::client::testing::{MockClient, Reply};
    use crate::client::PeerClient;
    use crate::config::RaftConfig;
    use crate::message::AppendEntryResult;
    use crate::state::RaftRole;
    use crate::storage::MemoryStore;
    use keel_core::GroupId;

    fn leader_member(client: Arc<MockClient>) -> RaftMember {
        let config = RaftConfig::new(
            NodeId::new(1),
            GroupId::new(1),
            vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)],
        )
        .fast_for_testing();
        RaftMember::new(
            config,
            Box::new(MemoryStore::new()),
            Box::new(JournalMachine::default()),
            client as Arc<dyn PeerClient>,
        )
        .unwrap()
    }

    #[test]
    fn registry_is_exclusive_per_peer() {
        let manager = CatchUpManager::new();
        let peer = NodeId::new(2);

        assert!(manager.register(peer));
        assert!(!manager.register(peer));
        assert!(manager.is_active(peer));
        // A different peer is independent.
        assert!(manager.register(NodeId::new(3)));

        manager.unregister(peer);
        assert!(!manager.is_active(peer));
        assert!(manager.register(peer));
    }

    #[tokio::test]
    async fn log_catch_up_replays_missing_slice() {
        let client = Arc::new(MockClient::new());
        let member = leader_member(client.clone());
        member.test_seed_leader(10, TermId::new(1)).await;

        let peer = NodeId::new(2);
        assert!(member.catch_up().register(peer));
        let ok = run_catch_up(member.clone(), peer, LogIndex::new(4)).await;
        assert!(ok);

        assert!(client.snapshot_log.lock().unwrap().is_empty());
        let requests = client.append_requests_to(peer);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].prev_log_index.get(), 3);
        assert_eq!(requests[0].entries.len(), 7);
        assert!(!member.catch_up().is_active(peer));
    }

    #[tokio::test]
    async fn snapshot_catch_up_sends_snapshot_then_tail() {
        let client = Arc::new(MockClient::new());
        let member = leader_member(client.clone());
        member.test_seed_leader(10, TermId::new(1)).await;
        member.take_snapshot().await.unwrap();
        member.test_append_tail(5, TermId::new(1)).await;

        // Follower far behind the boundary (next index 5 < first live 11).
        let peer = NodeId::new(2);
        assert!(member.catch_up().register(peer));
        let ok = run_catch_up(member.clone(), peer, LogIndex::new(5)).await;
        assert!(ok);

        let snapshots = client.snapshot_log.lock().unwrap();
        assert_eq!(snapshots.len(), 1);
        let sent = Snapshot::decode(snapshots[0].1.snapshot.clone()).unwrap();
        assert_eq!(sent.last_included_index.get(), 10);

        let requests = client.append_requests_to(peer);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].prev_log_index.get(), 10);
        assert_eq!(requests[0].entries.len(), 5);
        assert!(!member.catch_up().is_active(peer));
    }

    #[tokio::test]
    async fn concurrent_trigger_is_refused_while_active() {
        let client = Arc::new(MockClient::new());
        client.script_snapshot(Reply::Pending);
        let member = leader_member(client.clone());
        member.test_seed_leader(10, TermId::new(1)).await;
        member.take_snapshot().await.unwrap();

        let peer = NodeId::new(2);
        assert!(member.catch_up().register(peer));
        let task = {
            let member = member.clone();
            tokio::spawn(async move { run_catch_up(member, peer, LogIndex::new(1)).await })
        };
        tokio::task::yield_now().await;

        // While the snapshot send hangs, a second trigger must be refused.
        assert!(!member.catch_up().register(peer));

        // The wait bound expires, the task fails and unregisters.
        let ok = task.await.unwrap();
        assert!(!ok);
        assert!(!member.catch_up().is_active(peer));
    }

    #[tokio::test]
    async fn snapshot_send_aborts_when_not_leader() {
        let client = Arc::new(MockClient::new());
        let member = leader_member(client.clone());
        member.test_seed_leader(10, TermId::new(1)).await;
        member.take_snapshot().await.unwrap();
        member.step_down(TermId::new(2), None).await;

        let peer = NodeId::new(2);
        assert!(member.catch_up().register(peer));
        let ok = run_catch_up(member.clone(), peer, LogIndex::new(1)).await;

        assert!(!ok);
        assert!(client.snapshot_log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_rejected_by_larger_term_steps_down() {
        let client = Arc::new(MockClient::new());
        client.script_append(|peer, _| {
            Ok(AppendEntryResult::stale_term(
                peer,
                TermId::new(9),
                LogIndex::new(0),
                TermId::new(0),
            ))
        });
        let member = leader_member(client.clone());
        member.test_seed_leader(3, TermId::new(1)).await;

        let peer = NodeId::new(2);
        assert!(member.catch_up().register(peer));
        let ok = run_catch_up(member.clone(), peer, LogIndex::new(1)).await;

        assert!(!ok);
        assert_eq!(member.role().await, RaftRole::Follower);
        assert_eq!(member.term().await.get(), 9);
    }

    #[tokio::test]
    async fn replay_validates_leadership_per_batch() {
        let client = Arc::new(MockClient::new());
        let member = leader_member(client.clone());
        member.test_seed_leader(3, TermId::new(1)).await;
        member.step_down(TermId::new(5), None).await;

        let peer = NodeId::new(2);
        assert!(member.catch_up().register(peer));
        let ok = run_catch_up(member.clone(), peer, LogIndex::new(1)).await;

        assert!(!ok);
        assert!(client.append_requests_to(peer).is_empty());
    }

    #[tokio::test]
    async fn mismatch_rejection_fails_the_task() {
        let client = Arc::new(MockClient::new());
        client.script_append(|peer, _| {
            Ok(AppendEntryResult::log_mismatch(
                peer,
                LogIndex::new(0),
                TermId::new(0),
            ))
        });
        let member = leader_member(client.clone());
        member.test_seed_leader(3, TermId::new(1)).await;

        let peer = NodeId::new(2);
        assert!(member.catch_up().register(peer));
        let ok = run_catch_up(member.clone(), peer, LogIndex::new(2)).await;

        assert!(!ok);
        assert!(!member.catch_up().is_active(peer));
        assert_eq!(client.append_requests_to(peer).len(), 1);
    }
}
