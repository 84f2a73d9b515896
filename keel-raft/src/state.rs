//! Member role and shared status.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use keel_core::{LogIndex, NodeId, TermId};

/// The role a member plays in its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RaftRole {
    /// Passive; responds to RPCs and watches the election timer.
    #[default]
    Follower,
    /// Actively contesting an election.
    Candidate,
    /// Handles client requests and replicates the log.
    Leader,
}

/// Mutable member state guarded by one mutex (the term monitor).
///
/// Every safety decision - "am I still leader", "is this term current" -
/// re-acquires the mutex around this struct. Writes go through the member's
/// `step_down` / `become_leader` entry points only.
#[derive(Debug)]
pub struct RaftStatus {
    /// Current term. Never decreases.
    pub term: TermId,
    /// Current role.
    pub role: RaftRole,
    /// Who we voted for in `term`.
    pub voted_for: Option<NodeId>,
    /// The leader we believe in, if any.
    pub leader: Option<NodeId>,
    /// When we last heard from a valid leader or granted a vote. Drives
    /// the election timer and the leader-stickiness window.
    pub last_leader_contact: Option<Instant>,
}

impl RaftStatus {
    /// Creates follower status at the given term.
    #[must_use]
    pub const fn new(term: TermId, voted_for: Option<NodeId>) -> Self {
        Self {
            term,
            role: RaftRole::Follower,
            voted_for,
            leader: None,
            last_leader_contact: None,
        }
    }

    /// Returns true if a leader was heard from within `window`.
    #[must_use]
    pub fn leader_alive_within(&self, window: std::time::Duration) -> bool {
        self.leader.is_some()
            && self
                .last_leader_contact
                .is_some_and(|at| at.elapsed() < window)
    }
}

/// Lock-free view of the fields the dispatcher reads on every send.
///
/// The member updates this alongside the guarded status; workers read it
/// without taking the term monitor.
#[derive(Debug, Default)]
pub(crate) struct StatusView {
    term: AtomicU64,
    commit_index: AtomicU64,
    leading: AtomicBool,
}

impl StatusView {
    pub(crate) fn term(&self) -> TermId {
        TermId::new(self.term.load(Ordering::Acquire))
    }

    pub(crate) fn commit_index(&self) -> LogIndex {
        LogIndex::new(self.commit_index.load(Ordering::Acquire))
    }

    pub(crate) fn is_leading(&self) -> bool {
        self.leading.load(Ordering::Acquire)
    }

    pub(crate) fn set_term(&self, term: TermId) {
        self.term.fetch_max(term.get(), Ordering::AcqRel);
    }

    pub(crate) fn set_commit_index(&self, index: LogIndex) {
        self.commit_index.fetch_max(index.get(), Ordering::AcqRel);
    }

    pub(crate) fn set_leading(&self, leading: bool) {
        self.leading.store(leading, Ordering::Release);
    }
}
