//! One election attempt.
//!
//! An [`ElectionContext`] aggregates the vote responses for a single
//! attempt. Two independent counters decide the outcome without
//! enumerating responses: `required_votes` counts down to a win,
//! `failing_votes` counts down to an early loss. Either counter reaching
//! zero is terminal, as is a response revealing a larger term.
//!
//! The waiter is always woken while holding the waiter lock, so a wake
//! can never slip between the waiter's final check and its park.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use keel_core::{NodeId, TermId};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::info;

use crate::message::response;

/// What a single vote response asks of the member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteAction {
    /// Nothing; keep waiting.
    Continue,
    /// The quorum is complete; this attempt is won.
    Won,
    /// A voter revealed a larger term; step down to it.
    StepDown(TermId),
    /// A voter reports this node is no longer in the group.
    Removed,
}

/// Terminal state of an election attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// Quorum reached in the contested term.
    Won,
    /// Enough rejections or errors to rule out a win, or timeout.
    Lost,
    /// A larger term was observed.
    SteppedDown(TermId),
}

/// Shared state of one election attempt.
#[derive(Debug)]
pub struct ElectionContext {
    /// The contested term.
    term: TermId,
    /// Grants still needed. The self-vote is pre-counted.
    required_votes: AtomicI64,
    /// Rejections/errors still tolerable before the attempt is unwinnable.
    failing_votes: AtomicI64,
    terminated: AtomicBool,
    election_valid: AtomicBool,
    removed_from_group: AtomicBool,
    /// Larger term observed, or 0.
    observed_term: AtomicU64,
    /// The monitor guarding wakes of the election waiter.
    waiter: Mutex<()>,
    signal: Notify,
}

impl ElectionContext {
    /// Creates the context for an attempt in `term`.
    ///
    /// `quorum` and `cluster_size` count this node. A single-node group is
    /// decided immediately.
    #[must_use]
    pub fn new(term: TermId, quorum: usize, cluster_size: usize) -> Self {
        debug_assert!(quorum >= 1 && quorum <= cluster_size);

        let required = quorum as i64 - 1;
        let failing = cluster_size as i64 - quorum as i64 + 1;

        let ctx = Self {
            term,
            required_votes: AtomicI64::new(required),
            failing_votes: AtomicI64::new(failing),
            terminated: AtomicBool::new(false),
            election_valid: AtomicBool::new(false),
            removed_from_group: AtomicBool::new(false),
            observed_term: AtomicU64::new(0),
            waiter: Mutex::new(()),
            signal: Notify::new(),
        };

        if required <= 0 {
            ctx.election_valid.store(true, Ordering::Release);
            ctx.terminated.store(true, Ordering::Release);
        }
        ctx
    }

    /// Returns the contested term.
    #[must_use]
    pub const fn term(&self) -> TermId {
        self.term
    }

    /// Returns true once a terminal signal has been recorded.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Returns true if the attempt was won.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.election_valid.load(Ordering::Acquire)
    }

    /// Returns true if a voter reported this node removed from the group.
    #[must_use]
    pub fn was_removed(&self) -> bool {
        self.removed_from_group.load(Ordering::Acquire)
    }

    /// Returns the grants still required. Test observability.
    #[must_use]
    pub fn required_votes(&self) -> i64 {
        self.required_votes.load(Ordering::Acquire)
    }

    /// Returns the failures still tolerable. Test observability.
    #[must_use]
    pub fn failing_votes(&self) -> i64 {
        self.failing_votes.load(Ordering::Acquire)
    }

    /// Feeds one voter's response into the attempt.
    pub async fn on_response(&self, voter: NodeId, resp: i64) -> VoteAction {
        if self.is_terminated() {
            info!(term = self.term.get(), %voter, resp, "vote response after election terminated");
            return VoteAction::Continue;
        }

        if resp == response::AGREE {
            let remaining = self.required_votes.fetch_sub(1, Ordering::AcqRel) - 1;
            info!(term = self.term.get(), %voter, remaining, "vote granted");
            if remaining == 0 {
                self.election_valid.store(true, Ordering::Release);
                self.terminate_and_wake().await;
                info!(term = self.term.get(), "election won");
                return VoteAction::Won;
            }
            return VoteAction::Continue;
        }

        if resp == response::LEADER_STILL_ONLINE {
            info!(term = self.term.get(), %voter, "voter still hears a live leader");
            self.on_fail().await;
            return VoteAction::Continue;
        }

        if resp == response::NODE_IS_NOT_IN_GROUP {
            info!(term = self.term.get(), %voter, "removed from the group");
            self.removed_from_group.store(true, Ordering::Release);
            self.on_fail().await;
            return VoteAction::Removed;
        }

        if resp >= 0 && (resp as u64) > self.term.get() {
            // A voter with a larger term: this attempt is over.
            info!(term = self.term.get(), %voter, observed = resp, "election rejected by larger term");
            self.observed_term.store(resp as u64, Ordering::Release);
            self.terminate_and_wake().await;
            return VoteAction::StepDown(TermId::new(resp as u64));
        }

        // A rejection carrying a term at or below ours: our log is behind
        // on some axis, or a sentinel we do not act on.
        info!(term = self.term.get(), %voter, resp, "vote rejected");
        self.on_fail().await;
        VoteAction::Continue
    }

    /// Feeds a transport error into the attempt.
    pub async fn on_error(&self, voter: NodeId) {
        info!(term = self.term.get(), %voter, "voter unreachable");
        self.on_fail().await;
    }

    /// Waits until the attempt is decided or `dur` elapses.
    pub async fn wait(&self, dur: Duration) -> ElectionOutcome {
        let deadline = Instant::now() + dur;
        loop {
            let notified = self.signal.notified();
            if self.is_terminated() || self.failing_votes.load(Ordering::Acquire) <= 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }

        if self.is_valid() {
            return ElectionOutcome::Won;
        }
        match self.observed_term.load(Ordering::Acquire) {
            0 => ElectionOutcome::Lost,
            term => ElectionOutcome::SteppedDown(TermId::new(term)),
        }
    }

    async fn on_fail(&self) {
        let remaining = self.failing_votes.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining <= 0 {
            // Unwinnable: wake the waiter so the next attempt can start
            // without sitting out the full timeout.
            let _guard = self.waiter.lock().await;
            self.signal.notify_waiters();
        }
    }

    async fn terminate_and_wake(&self) {
        let _guard = self.waiter.lock().await;
        self.terminated.store(true, Ordering::Release);
        self.signal.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn three_node_win() {
        // Peers {A,B,C}: quorum 2, self-vote pre-counted.
        let ctx = ElectionContext::new(TermId::new(6), 2, 3);
        assert_eq!(ctx.required_votes(), 1);

        let action = ctx.on_response(NodeId::new(2), response::AGREE).await;
        assert_eq!(action, VoteAction::Won);
        assert!(ctx.is_valid());
        assert!(ctx.is_terminated());

        // C's grant arrives late; it changes nothing.
        let late = ctx.on_response(NodeId::new(3), response::AGREE).await;
        assert_eq!(late, VoteAction::Continue);
        assert_eq!(ctx.wait(Duration::from_millis(10)).await, ElectionOutcome::Won);
    }

    #[tokio::test]
    async fn higher_term_steps_down() {
        let ctx = ElectionContext::new(TermId::new(6), 2, 3);

        let action = ctx.on_response(NodeId::new(3), 8).await;
        assert_eq!(action, VoteAction::StepDown(TermId::new(8)));
        assert!(ctx.is_terminated());
        assert!(!ctx.is_valid());
        assert_eq!(
            ctx.wait(Duration::from_millis(10)).await,
            ElectionOutcome::SteppedDown(TermId::new(8))
        );
    }

    #[tokio::test]
    async fn fast_fail_without_waiting_for_stragglers() {
        // Peers {A..E}: quorum 3, so required 2 and failing 3.
        let ctx = ElectionContext::new(TermId::new(2), 3, 5);
        assert_eq!(ctx.required_votes(), 2);
        assert_eq!(ctx.failing_votes(), 3);

        for voter in [2, 3, 4] {
            let action = ctx
                .on_response(NodeId::new(voter), response::LEADER_STILL_ONLINE)
                .await;
            assert_eq!(action, VoteAction::Continue);
        }
        assert_eq!(ctx.failing_votes(), 0);

        // E never answers; the wait must return well inside the timeout.
        let started = std::time::Instant::now();
        let outcome = ctx.wait(Duration::from_secs(30)).await;
        assert_eq!(outcome, ElectionOutcome::Lost);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn smaller_term_rejection_is_hard_failure() {
        let ctx = ElectionContext::new(TermId::new(6), 2, 3);
        let before = ctx.failing_votes();

        let action = ctx.on_response(NodeId::new(2), 4).await;
        assert_eq!(action, VoteAction::Continue);
        assert_eq!(ctx.failing_votes(), before - 1);
        assert!(!ctx.is_terminated());
    }

    #[tokio::test]
    async fn removed_from_group() {
        let ctx = ElectionContext::new(TermId::new(6), 2, 3);
        let action = ctx
            .on_response(NodeId::new(2), response::NODE_IS_NOT_IN_GROUP)
            .await;
        assert_eq!(action, VoteAction::Removed);
        assert!(ctx.was_removed());
    }

    #[tokio::test]
    async fn transport_errors_count_as_failures() {
        let ctx = ElectionContext::new(TermId::new(2), 2, 3);
        assert_eq!(ctx.failing_votes(), 2);

        ctx.on_error(NodeId::new(2)).await;
        ctx.on_error(NodeId::new(3)).await;

        let outcome = ctx.wait(Duration::from_secs(5)).await;
        assert_eq!(outcome, ElectionOutcome::Lost);
    }

    #[tokio::test]
    async fn single_node_group_wins_immediately() {
        let ctx = ElectionContext::new(TermId::new(1), 1, 1);
        assert!(ctx.is_valid());
        assert_eq!(ctx.wait(Duration::from_millis(1)).await, ElectionOutcome::Won);
    }

    #[tokio::test]
    async fn waiter_wakes_from_another_task() {
        let ctx = std::sync::Arc::new(ElectionContext::new(TermId::new(3), 2, 3));

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.wait(Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;

        ctx.on_response(NodeId::new(2), response::AGREE).await;
        assert_eq!(waiter.await.unwrap(), ElectionOutcome::Won);
    }
}
