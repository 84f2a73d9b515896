//! Per-entry quorum tracking and commit advancement.
//!
//! Every uncommitted leader entry is wrapped in a [`VotingEntry`] that
//! carries its quorum size and collects follower acknowledgements. The
//! [`VotingTracker`] holds the strong references and drops them on commit
//! or term change; dispatch handlers hold shared references only.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use keel_core::{LogIndex, NodeId, TermId};
use tokio::sync::Notify;

use crate::log::Entry;

/// Terminal state of a voting entry, observed by its waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteResult {
    /// The entry reached quorum and was committed.
    Committed,
    /// The entry was abandoned (term change or shutdown).
    Terminated,
}

/// An uncommitted entry plus the acks required to commit it.
#[derive(Debug)]
pub struct VotingEntry {
    entry: Entry,
    quorum_size: usize,
    /// Wire encoding, produced once on first dispatch.
    wire: OnceLock<Bytes>,
    /// Peers that have durably accepted the entry. The leader itself is
    /// counted implicitly.
    acks: Mutex<HashSet<NodeId>>,
    /// Peers that have received but not yet persisted the entry.
    weak_acks: Mutex<HashSet<NodeId>>,
    committed: AtomicBool,
    terminated: AtomicBool,
    decided: Notify,
}

impl VotingEntry {
    /// Wraps `entry` with the quorum size fixed at creation.
    #[must_use]
    pub fn new(entry: Entry, quorum_size: usize) -> Self {
        debug_assert!(quorum_size >= 1);
        Self {
            entry,
            quorum_size,
            wire: OnceLock::new(),
            acks: Mutex::new(HashSet::new()),
            weak_acks: Mutex::new(HashSet::new()),
            committed: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            decided: Notify::new(),
        }
    }

    /// Returns the wrapped entry.
    #[must_use]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Returns the quorum size fixed at creation.
    #[must_use]
    pub fn quorum_size(&self) -> usize {
        self.quorum_size
    }

    /// Returns the wire encoding, serializing on first use.
    #[must_use]
    pub fn wire_bytes(&self) -> &Bytes {
        self.wire.get_or_init(|| self.entry.encode())
    }

    /// Records a durable ack from `peer`.
    ///
    /// Returns true exactly when this ack completes the quorum. Acks after
    /// termination or commit change nothing.
    pub fn record_ack(&self, peer: NodeId) -> bool {
        if self.is_decided() {
            return false;
        }
        let mut acks = self.acks.lock().expect("acks mutex poisoned");
        if !acks.insert(peer) {
            return false;
        }
        // Self-counted: the leader's own copy plus |acks| replicas.
        acks.len() + 1 == self.quorum_size
    }

    /// Records a weak (received, not durable) ack from `peer`. Returns the
    /// weak-ack count. Never drives commit.
    pub fn record_weak_ack(&self, peer: NodeId) -> usize {
        let mut weak = self.weak_acks.lock().expect("weak_acks mutex poisoned");
        weak.insert(peer);
        weak.len()
    }

    /// Returns the current durable ack count, excluding the leader.
    #[must_use]
    pub fn ack_count(&self) -> usize {
        self.acks.lock().expect("acks mutex poisoned").len()
    }

    /// Returns true if the quorum has been reached, counting the leader.
    #[must_use]
    pub fn has_quorum(&self) -> bool {
        self.ack_count() + 1 >= self.quorum_size
    }

    /// Returns true once committed or terminated.
    #[must_use]
    pub fn is_decided(&self) -> bool {
        self.committed.load(Ordering::Acquire) || self.terminated.load(Ordering::Acquire)
    }

    /// Returns true once committed.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_committed(&self) {
        self.committed.store(true, Ordering::Release);
        self.decided.notify_waiters();
    }

    pub(crate) fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        self.decided.notify_waiters();
    }

    /// Waits until the entry is committed or terminated.
    pub async fn wait_decided(&self) -> VoteResult {
        loop {
            let notified = self.decided.notified();
            if self.committed.load(Ordering::Acquire) {
                return VoteResult::Committed;
            }
            if self.terminated.load(Ordering::Acquire) {
                return VoteResult::Terminated;
            }
            notified.await;
        }
    }
}

/// Owner of all in-flight voting entries for one leadership.
#[derive(Debug, Default)]
pub struct VotingTracker {
    /// The leadership term these entries belong to.
    term: AtomicU64,
    pending: Mutex<BTreeMap<u64, Arc<VotingEntry>>>,
}

impl VotingTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new leadership: terminates everything pending and adopts
    /// `term`.
    pub fn reset(&self, term: TermId) {
        self.terminate_all();
        self.term.store(term.get(), Ordering::Release);
    }

    /// Returns the leadership term the tracker is counting for.
    #[must_use]
    pub fn term(&self) -> TermId {
        TermId::new(self.term.load(Ordering::Acquire))
    }

    /// Registers an in-flight entry.
    pub fn insert(&self, entry: Arc<VotingEntry>) {
        let mut pending = self.pending.lock().expect("pending mutex poisoned");
        pending.insert(entry.entry().index.get(), entry);
    }

    /// Returns the number of undecided entries.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending mutex poisoned").len()
    }

    /// Records a durable ack and reports whether `entry` just reached
    /// quorum *for the current term* - the Raft restriction that only
    /// current-term entries commit by counting replicas.
    pub fn record_ack(&self, entry: &Arc<VotingEntry>, peer: NodeId) -> bool {
        let reached = entry.record_ack(peer);
        reached && entry.entry().term == self.term()
    }

    /// Commits every pending entry at or below `index`: marks them, wakes
    /// their waiters, and drops the strong references.
    pub fn release_up_to(&self, index: LogIndex) -> Vec<Arc<VotingEntry>> {
        let mut pending = self.pending.lock().expect("pending mutex poisoned");
        let keep = pending.split_off(&(index.get() + 1));
        let released: Vec<Arc<VotingEntry>> =
            std::mem::replace(&mut *pending, keep).into_values().collect();
        drop(pending);

        for entry in &released {
            entry.mark_committed();
        }
        released
    }

    /// Terminates every pending entry (term change or shutdown).
    pub fn terminate_all(&self) {
        let drained: Vec<Arc<VotingEntry>> = {
            let mut pending = self.pending.lock().expect("pending mutex poisoned");
            std::mem::take(&mut *pending).into_values().collect()
        };
        for entry in drained {
            entry.terminate();
        }
    }
}
