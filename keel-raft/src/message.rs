//! RPC request and response types, and the response-code sentinels.
//!
//! Vote and append outcomes travel as a single `i64`: non-negative values
//! carry a term, reserved negative values carry a verdict. The numeric
//! mapping is part of the wire contract and must not change.

use bytes::Bytes;
use keel_core::{GroupId, LogIndex, NodeId, TermId};

/// Response-code sentinels.
///
/// A response that is `>= 0` is a term; everything else is one of these.
pub mod response {
    /// The request is accepted (vote granted, entry appended).
    pub const AGREE: i64 = -1;
    /// The follower's log does not match `prev_log_index`/`prev_log_term`.
    pub const LOG_MISMATCH: i64 = -2;
    /// Generic rejection.
    pub const REJECT: i64 = -3;
    /// A live leader was heard from within the stickiness window.
    pub const LEADER_STILL_ONLINE: i64 = -7;
    /// The batch landed beyond the follower's sliding window.
    pub const OUT_OF_WINDOW: i64 = -8;
    /// The receiver is overloaded and dropped the request.
    pub const TOO_BUSY: i64 = -9;
    /// The addressed node is not a member of the group.
    pub const NODE_IS_NOT_IN_GROUP: i64 = -10;
    /// The batch was received but is not yet durable.
    pub const WEAK_ACCEPT: i64 = -11;
    /// No response available.
    pub const NULL: i64 = i64::MIN;

    /// Returns true if `code` is a sentinel rather than a term.
    #[must_use]
    pub const fn is_sentinel(code: i64) -> bool {
        code < 0
    }
}

/// Leader-to-follower liveness probe. Also carries the leader's commit
/// point so idle followers can advance without waiting for entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatRequest {
    /// The replication group.
    pub group_id: GroupId,
    /// Leader's term.
    pub term: TermId,
    /// The leader sending this probe.
    pub leader: NodeId,
    /// Leader's commit index.
    pub commit_index: LogIndex,
    /// Term of the entry at the leader's commit index.
    pub commit_term: TermId,
}

/// Follower's reply to a heartbeat.
///
/// `status` is [`response::AGREE`] or the follower's larger term. The log
/// position lets the leader spot followers that have fallen behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatResponse {
    /// [`response::AGREE`] or the follower's term.
    pub status: i64,
    /// The responding follower.
    pub follower: NodeId,
    /// Follower's last log index.
    pub last_log_index: LogIndex,
    /// Follower's last log term.
    pub last_log_term: TermId,
}

/// Vote solicitation from a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionRequest {
    /// The replication group.
    pub group_id: GroupId,
    /// The term the candidate is contesting.
    pub term: TermId,
    /// The candidate requesting the vote.
    pub elector: NodeId,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: TermId,
}

/// Log replication request. Entries are pre-serialized so the dispatcher
/// can chunk batches by wire size without re-encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    /// The replication group.
    pub group_id: GroupId,
    /// Leader's term.
    pub term: TermId,
    /// The leader sending this request.
    pub leader: NodeId,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
    /// Index of the entry immediately preceding this batch.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: TermId,
    /// Serialized entries, in strictly increasing index order.
    pub entries: Vec<Bytes>,
}

/// Outcome of an `AppendEntries` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendEntryResult {
    /// A [`response`] sentinel, or the receiver's larger term.
    pub status: i64,
    /// Receiver's last log index after processing.
    pub last_log_index: LogIndex,
    /// Receiver's last log term after processing.
    pub last_log_term: TermId,
    /// The responding node.
    pub receiver: NodeId,
}

impl AppendEntryResult {
    /// The batch was appended durably.
    #[must_use]
    pub const fn agree(receiver: NodeId, last_log_index: LogIndex, last_log_term: TermId) -> Self {
        Self {
            status: response::AGREE,
            last_log_index,
            last_log_term,
            receiver,
        }
    }

    /// The batch was buffered in the sliding window but is not durable.
    #[must_use]
    pub const fn weak_accept(
        receiver: NodeId,
        last_log_index: LogIndex,
        last_log_term: TermId,
    ) -> Self {
        Self {
            status: response::WEAK_ACCEPT,
            last_log_index,
            last_log_term,
            receiver,
        }
    }

    /// The receiver's log does not contain the expected previous entry.
    #[must_use]
    pub const fn log_mismatch(
        receiver: NodeId,
        last_log_index: LogIndex,
        last_log_term: TermId,
    ) -> Self {
        Self {
            status: response::LOG_MISMATCH,
            last_log_index,
            last_log_term,
            receiver,
        }
    }

    /// The batch landed beyond the sliding window.
    #[must_use]
    pub const fn out_of_window(
        receiver: NodeId,
        last_log_index: LogIndex,
        last_log_term: TermId,
    ) -> Self {
        Self {
            status: response::OUT_OF_WINDOW,
            last_log_index,
            last_log_term,
            receiver,
        }
    }

    /// The request's term is behind the receiver's.
    #[must_use]
    pub const fn stale_term(
        receiver: NodeId,
        term: TermId,
        last_log_index: LogIndex,
        last_log_term: TermId,
    ) -> Self {
        Self {
            status: term.get() as i64,
            last_log_index,
            last_log_term,
            receiver,
        }
    }

    /// Returns the carried term, if the status is a term.
    #[must_use]
    pub const fn rejecting_term(&self) -> Option<TermId> {
        if response::is_sentinel(self.status) {
            None
        } else {
            Some(TermId::new(self.status as u64))
        }
    }

    /// Returns true if the batch was accepted, strongly or weakly.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        self.status == response::AGREE || self.status == response::WEAK_ACCEPT
    }
}

/// Bulk state transfer to a follower whose log has been compacted away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendSnapshotRequest {
    /// The replication group.
    pub group_id: GroupId,
    /// Encoded snapshot, see [`crate::Snapshot`].
    pub snapshot: Bytes,
}

/// A client request forwarded into the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteRequest {
    /// The replication group.
    pub group_id: GroupId,
    /// Opaque state-machine command.
    pub request: Bytes,
}

/// Outcome of an [`ExecuteRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteResponse {
    /// [`response::AGREE`] on commit, otherwise a rejection sentinel.
    pub status: i64,
    /// Where the leader is believed to be, on rejection.
    pub leader_hint: Option<NodeId>,
}

impl ExecuteResponse {
    /// The request was committed and applied.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            status: response::AGREE,
            leader_hint: None,
        }
    }

    /// The receiver is not the leader.
    #[must_use]
    pub const fn not_leader(leader_hint: Option<NodeId>) -> Self {
        Self {
            status: response::REJECT,
            leader_hint,
        }
    }

    /// Returns true if the request committed.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.status == response::AGREE
    }
}

/// Probe for log matching: does the receiver hold `(index, term)`?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchTermRequest {
    /// The replication group.
    pub group_id: GroupId,
    /// The index to probe.
    pub index: LogIndex,
    /// The expected term at `index`.
    pub term: TermId,
}

/// Observational read of a member's commit point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitIndexResponse {
    /// [`response::AGREE`], or [`response::NODE_IS_NOT_IN_GROUP`].
    pub status: i64,
    /// The member's current term.
    pub term: TermId,
    /// The member's commit index.
    pub commit_index: LogIndex,
    /// Term of the entry at the commit index.
    pub commit_term: TermId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_negative() {
        assert!(response::is_sentinel(response::AGREE));
        assert!(response::is_sentinel(response::LEADER_STILL_ONLINE));
        assert!(response::is_sentinel(response::NODE_IS_NOT_IN_GROUP));
        assert!(response::is_sentinel(response::NULL));
        assert!(!response::is_sentinel(0));
        assert!(!response::is_sentinel(42));
    }

    #[test]
    fn sentinel_values_are_stable() {
        // Wire contract: these exact numbers are what peers exchange.
        assert_eq!(response::AGREE, -1);
        assert_eq!(response::LOG_MISMATCH, -2);
        assert_eq!(response::REJECT, -3);
        assert_eq!(response::LEADER_STILL_ONLINE, -7);
        assert_eq!(response::OUT_OF_WINDOW, -8);
        assert_eq!(response::TOO_BUSY, -9);
        assert_eq!(response::NODE_IS_NOT_IN_GROUP, -10);
        assert_eq!(response::WEAK_ACCEPT, -11);
    }

    #[test]
    fn append_result_term_round_trip() {
        let result = AppendEntryResult::stale_term(
            NodeId::new(2),
            TermId::new(9),
            LogIndex::new(4),
            TermId::new(8),
        );
        assert_eq!(result.rejecting_term(), Some(TermId::new(9)));
        assert!(!result.is_accepted());

        let ok = AppendEntryResult::agree(NodeId::new(2), LogIndex::new(4), TermId::new(8));
        assert_eq!(ok.rejecting_term(), None);
        assert!(ok.is_accepted());
    }

    #[test]
    fn weak_accept_is_accepted() {
        let weak =
            AppendEntryResult::weak_accept(NodeId::new(3), LogIndex::new(10), TermId::new(2));
        assert!(weak.is_accepted());
        assert_eq!(weak.status, response::WEAK_ACCEPT);
    }

    #[test]
    fn execute_response() {
        assert!(ExecuteResponse::ok().is_ok());
        let rejected = ExecuteResponse::not_leader(Some(NodeId::new(1)));
        assert!(!rejected.is_ok());
        assert_eq!(rejected.leader_hint, Some(NodeId::new(1)));
    }
}
