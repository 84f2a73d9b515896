//! One group member.
//!
//! [`RaftMember`] binds the election coordinator, the log dispatcher, the
//! voting tracker and the catch-up manager to one replication group. Term
//! and role live behind a single mutex; every safety decision re-acquires
//! it and no lock is ever held across a network send. Lock order, outermost
//! first: status, log, then the leaf locks (store, state machine, window,
//! snapshot).
//!
//! RPC completions do not mutate member state from callbacks: dispatcher
//! workers post [`MemberEvent`]s onto the member's inbox, and the event
//! loop consumes them serially.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use keel_core::{GroupId, LogIndex, NodeId, TermId};
use rand::Rng;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::apply::StateMachine;
use crate::catchup::{run_catch_up, CatchUpManager, CatchUpPlan};
use crate::client::{PeerClient, RpcError};
use crate::config::RaftConfig;
use crate::dispatch::LogDispatcher;
use crate::election::{ElectionContext, ElectionOutcome, VoteAction};
use crate::log::{Entry, RaftLog};
use crate::message::{
    response, AppendEntriesRequest, AppendEntryResult, CommitIndexResponse, ExecuteRequest,
    ExecuteResponse, HeartbeatRequest, HeartbeatResponse,
};
use crate::snapshot::{Snapshot, SnapshotMeta};
use crate::state::{RaftRole, RaftStatus, StatusView};
use crate::storage::{HardState, StableStore};
use crate::voting::{VoteResult, VotingEntry, VotingTracker};

/// Events posted onto the member's inbox by RPC completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEvent {
    /// An in-flight entry reached quorum.
    QuorumReached {
        /// The entry's index.
        index: LogIndex,
        /// The entry's term.
        term: TermId,
    },
    /// A response revealed a larger term.
    HigherTerm {
        /// The observed term.
        term: TermId,
        /// Who revealed it, if known.
        from: Option<NodeId>,
    },
    /// A follower rejected an append for log mismatch, or was seen lagging.
    PeerLagging {
        /// The lagging follower.
        peer: NodeId,
        /// The follower's last log index, from its response.
        follower_last: LogIndex,
    },
}

/// Errors surfaced to callers of member operations.
#[derive(Debug)]
pub enum RaftError {
    /// This member is not the leader.
    NotLeader {
        /// Where the leader is believed to be.
        leader: Option<NodeId>,
    },
    /// No leader is known to forward to.
    UnknownLeader,
    /// A wire entry could not be decoded.
    CorruptEntry,
    /// A snapshot frame could not be decoded or failed its checksum.
    CorruptSnapshot,
    /// The request did not commit within the write timeout.
    CommitTimeout,
    /// Durable storage failed.
    Store(keel_core::Error),
    /// A forwarded request failed in transport.
    Rpc(RpcError),
    /// The configuration failed validation.
    InvalidConfig(&'static str),
    /// There is nothing to snapshot yet.
    NothingToSnapshot,
}

impl fmt::Display for RaftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotLeader { leader } => match leader {
                Some(node) => write!(f, "not leader, try {node}"),
                None => write!(f, "not leader"),
            },
            Self::UnknownLeader => write!(f, "no known leader"),
            Self::CorruptEntry => write!(f, "undecodable log entry"),
            Self::CorruptSnapshot => write!(f, "undecodable snapshot"),
            Self::CommitTimeout => write!(f, "request did not commit in time"),
            Self::Store(err) => write!(f, "storage failure: {err}"),
            Self::Rpc(err) => write!(f, "forwarding failed: {err}"),
            Self::InvalidConfig(reason) => write!(f, "invalid config: {reason}"),
            Self::NothingToSnapshot => write!(f, "nothing applied to snapshot"),
        }
    }
}

impl std::error::Error for RaftError {}

/// Out-of-order batches buffered by a follower until the gap fills.
#[derive(Debug, Default)]
struct FollowerWindow {
    buffered: BTreeMap<u64, Entry>,
    capacity: usize,
}

impl FollowerWindow {
    fn new(capacity: usize) -> Self {
        Self {
            buffered: BTreeMap::new(),
            capacity,
        }
    }

    /// Returns false if the entries land beyond the window.
    fn buffer(&mut self, next_expected: LogIndex, entries: Vec<Entry>) -> bool {
        let Some(last) = entries.last() else {
            return true;
        };
        if last.index.get().saturating_sub(next_expected.get()) >= self.capacity as u64 {
            return false;
        }
        for entry in entries {
            self.buffered.insert(entry.index.get(), entry);
        }
        true
    }

    /// Pops the contiguous run starting at `next`.
    fn take_contiguous(&mut self, next: LogIndex) -> Vec<Entry> {
        let mut run = Vec::new();
        let mut cursor = next.get();
        while let Some(entry) = self.buffered.remove(&cursor) {
            run.push(entry);
            cursor += 1;
        }
        run
    }
}

struct MemberInner {
    config: RaftConfig,
    status: Mutex<RaftStatus>,
    log: Mutex<RaftLog>,
    store: Mutex<Box<dyn StableStore>>,
    state_machine: Mutex<Box<dyn StateMachine>>,
    latest_snapshot: Mutex<Option<Snapshot>>,
    window: Mutex<FollowerWindow>,
    client: Arc<dyn PeerClient>,
    dispatcher: LogDispatcher,
    tracker: Arc<VotingTracker>,
    catch_up: CatchUpManager,
    view: Arc<StatusView>,
    events: mpsc::Sender<MemberEvent>,
    events_rx: StdMutex<Option<mpsc::Receiver<MemberEvent>>>,
    removed_from_group: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// A cheaply clonable handle to one group member.
#[derive(Clone)]
pub struct RaftMember {
    inner: Arc<MemberInner>,
}

impl fmt::Debug for RaftMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftMember").finish_non_exhaustive()
    }
}

impl RaftMember {
    /// Creates a member, recovering persisted state from `store`.
    ///
    /// Must be called from within a tokio runtime: the dispatcher spawns
    /// its workers immediately.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the store
    /// cannot be read.
    pub fn new(
        config: RaftConfig,
        store: Box<dyn StableStore>,
        state_machine: Box<dyn StateMachine>,
        client: Arc<dyn PeerClient>,
    ) -> Result<Self, RaftError> {
        config.validate().map_err(RaftError::InvalidConfig)?;

        let hard = store
            .load_hard_state()
            .map_err(RaftError::Store)?
            .unwrap_or(HardState::initial());

        let mut log = RaftLog::new();
        let stored = store.load_entries().map_err(RaftError::Store)?;
        if let Some(first) = stored.first() {
            // Entries before the first retained one were compacted into a
            // snapshot; reconstruct the boundary from the entry's own
            // predecessor term.
            if first.index.get() > 1 {
                log.compact_to(first.index.prev(), first.prev_term);
            }
        }
        for entry in stored {
            log.append_entries(vec![entry]);
        }

        let view = Arc::new(StatusView::default());
        view.set_term(hard.term);

        let tracker = Arc::new(VotingTracker::new());
        let (events_tx, events_rx) = mpsc::channel(1024);
        let dispatcher = LogDispatcher::new(
            &config,
            Arc::clone(&client),
            Arc::clone(&tracker),
            Arc::clone(&view),
            events_tx.clone(),
        );
        let (shutdown, _) = watch::channel(false);
        let window_capacity = config.window_capacity;

        Ok(Self {
            inner: Arc::new(MemberInner {
                status: Mutex::new(RaftStatus::new(hard.term, hard.voted_for)),
                log: Mutex::new(log),
                store: Mutex::new(store),
                state_machine: Mutex::new(state_machine),
                latest_snapshot: Mutex::new(None),
                window: Mutex::new(FollowerWindow::new(window_capacity)),
                client,
                dispatcher,
                tracker,
                catch_up: CatchUpManager::new(),
                view,
                events: events_tx,
                events_rx: StdMutex::new(Some(events_rx)),
                removed_from_group: AtomicBool::new(false),
                config,
                shutdown,
            }),
        })
    }

    /// Starts the heartbeat/election timer and the event loop. Idempotent.
    pub fn start(&self) {
        let taken = self
            .inner
            .events_rx
            .lock()
            .expect("events_rx mutex poisoned")
            .take();
        let Some(events_rx) = taken else {
            return;
        };

        tokio::spawn(event_loop(
            self.clone(),
            events_rx,
            self.inner.shutdown.subscribe(),
        ));
        tokio::spawn(heartbeat_loop(self.clone(), self.inner.shutdown.subscribe()));
    }

    /// Stops the background loops and drains the dispatcher.
    pub fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
        self.inner.dispatcher.shutdown();
        self.inner.tracker.terminate_all();
    }

    /// Returns this node's ID.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.inner.config.node_id
    }

    /// Returns the group ID.
    #[must_use]
    pub fn group_id(&self) -> GroupId {
        self.inner.config.group_id
    }

    /// Returns the current role.
    pub async fn role(&self) -> RaftRole {
        self.inner.status.lock().await.role
    }

    /// Returns the current term.
    pub async fn term(&self) -> TermId {
        self.inner.status.lock().await.term
    }

    /// Returns the leader this member believes in, if any.
    pub async fn leader(&self) -> Option<NodeId> {
        self.inner.status.lock().await.leader
    }

    /// Returns true if this member is the leader.
    pub async fn is_leader(&self) -> bool {
        self.inner.status.lock().await.role == RaftRole::Leader
    }

    /// Returns the commit index.
    pub async fn commit_index(&self) -> LogIndex {
        self.inner.log.lock().await.commit_index()
    }

    /// Returns the dispatcher, for rate updates and introspection.
    #[must_use]
    pub fn dispatcher(&self) -> &LogDispatcher {
        &self.inner.dispatcher
    }

    /// Returns the catch-up manager.
    #[must_use]
    pub fn catch_up(&self) -> &CatchUpManager {
        &self.inner.catch_up
    }

    // ---- inbound RPC surface -------------------------------------------

    /// Handles a leader's heartbeat.
    pub async fn process_heartbeat_request(&self, request: HeartbeatRequest) -> HeartbeatResponse {
        let node = self.inner.config.node_id;
        {
            let mut status = self.inner.status.lock().await;
            if request.term < status.term {
                let log = self.inner.log.lock().await;
                return HeartbeatResponse {
                    status: status.term.get() as i64,
                    follower: node,
                    last_log_index: log.last_index(),
                    last_log_term: log.last_term(),
                };
            }
            self.adopt_leader_locked(&mut status, request.term, request.leader)
                .await;
        }

        // Idle followers advance their commit point from the heartbeat.
        {
            let mut log = self.inner.log.lock().await;
            if request.commit_index > log.commit_index()
                && log.match_term(request.commit_index, request.commit_term)
            {
                self.apply_up_to(&mut log, request.commit_index).await;
            }
        }

        let log = self.inner.log.lock().await;
        HeartbeatResponse {
            status: response::AGREE,
            follower: node,
            last_log_index: log.last_index(),
            last_log_term: log.last_term(),
        }
    }

    /// Handles a candidate's vote solicitation.
    pub async fn process_election_request(&self, request: crate::message::ElectionRequest) -> i64 {
        if !self.inner.config.cluster.contains(&request.elector) {
            return response::NODE_IS_NOT_IN_GROUP;
        }

        let mut status = self.inner.status.lock().await;

        // Leader stickiness: refuse to depose a leader we can still hear.
        if request.term > status.term
            && status.leader != Some(request.elector)
            && status.leader_alive_within(self.inner.config.leader_stickiness())
        {
            info!(
                elector = %request.elector,
                term = request.term.get(),
                "rejecting election, leader still online"
            );
            return response::LEADER_STILL_ONLINE;
        }

        if request.term < status.term {
            return status.term.get() as i64;
        }

        if request.term > status.term {
            status.term = request.term;
            status.voted_for = None;
            if status.role != RaftRole::Follower {
                status.role = RaftRole::Follower;
                self.inner.view.set_leading(false);
                self.inner.tracker.terminate_all();
            }
            self.inner.view.set_term(request.term);
        }

        let can_vote = status.voted_for.map_or(true, |v| v == request.elector);
        let up_to_date = {
            let log = self.inner.log.lock().await;
            log.candidate_up_to_date(request.last_log_term, request.last_log_index)
        };
        if !can_vote || !up_to_date {
            debug!(
                elector = %request.elector,
                can_vote,
                up_to_date,
                "vote refused"
            );
            let _ = self.persist_status(&status).await;
            return status.term.get() as i64;
        }

        status.voted_for = Some(request.elector);
        status.last_leader_contact = Some(Instant::now());
        if let Err(err) = self.persist_status(&status).await {
            // Without a durable vote we must not grant it.
            error!(%err, "failed to persist vote");
            status.voted_for = None;
            return status.term.get() as i64;
        }
        info!(elector = %request.elector, term = request.term.get(), "vote granted");
        response::AGREE
    }

    /// Handles a leader's append.
    ///
    /// # Errors
    /// Returns an error on undecodable entries or storage failure.
    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntryResult, RaftError> {
        let node = self.inner.config.node_id;

        let mut entries = Vec::with_capacity(request.entries.len());
        for raw in &request.entries {
            entries.push(Entry::decode(raw.clone()).ok_or(RaftError::CorruptEntry)?);
        }

        {
            let mut status = self.inner.status.lock().await;
            if request.term < status.term {
                let log = self.inner.log.lock().await;
                return Ok(AppendEntryResult::stale_term(
                    node,
                    status.term,
                    log.last_index(),
                    log.last_term(),
                ));
            }
            self.adopt_leader_locked(&mut status, request.term, request.leader)
                .await;
        }

        let mut log = self.inner.log.lock().await;

        if !log.match_term(request.prev_log_index, request.prev_log_term) {
            // A gap ahead of our log may be bridgeable by the sliding
            // window; a divergent prefix never is.
            if self.inner.config.use_follower_sliding_window
                && request.prev_log_index > log.last_index()
            {
                let next_expected = log.last_index().next();
                let mut window = self.inner.window.lock().await;
                if window.buffer(next_expected, entries) {
                    return Ok(AppendEntryResult::weak_accept(
                        node,
                        log.last_index(),
                        log.last_term(),
                    ));
                }
                return Ok(AppendEntryResult::out_of_window(
                    node,
                    log.last_index(),
                    log.last_term(),
                ));
            }
            debug!(
                prev_index = request.prev_log_index.get(),
                prev_term = request.prev_log_term.get(),
                local_last = log.last_index().get(),
                "append rejected, log mismatch"
            );
            return Ok(AppendEntryResult::log_mismatch(
                node,
                log.last_index(),
                log.last_term(),
            ));
        }

        self.append_durably(&mut log, entries).await?;

        // Drain any window runs the append just connected.
        loop {
            let ready = {
                let mut window = self.inner.window.lock().await;
                window.take_contiguous(log.last_index().next())
            };
            if ready.is_empty() {
                break;
            }
            self.append_durably(&mut log, ready).await?;
        }

        if request.leader_commit > log.commit_index() {
            let target = request.leader_commit.min(log.last_index());
            self.apply_up_to(&mut log, target).await;
        }

        Ok(AppendEntryResult::agree(
            node,
            log.last_index(),
            log.last_term(),
        ))
    }

    /// Installs a snapshot, atomically replacing the state machine and
    /// discarding the covered log prefix.
    ///
    /// # Errors
    /// Returns an error on an undecodable frame or storage failure.
    pub async fn install_snapshot(&self, data: Bytes) -> Result<(), RaftError> {
        let snapshot = Snapshot::decode(data).ok_or(RaftError::CorruptSnapshot)?;

        let mut log = self.inner.log.lock().await;
        if snapshot.last_included_index <= log.commit_index() {
            debug!(
                last_included = snapshot.last_included_index.get(),
                commit = log.commit_index().get(),
                "snapshot already covered"
            );
            return Ok(());
        }

        {
            let mut sm = self.inner.state_machine.lock().await;
            sm.install_snapshot(&snapshot.data)
                .map_err(RaftError::Store)?;
        }

        log.compact_to(snapshot.last_included_index, snapshot.last_included_term);
        if let Err(err) = self
            .inner
            .store
            .lock()
            .await
            .compact_to(snapshot.last_included_index)
        {
            warn!(%err, "failed to compact stored entries after snapshot");
        }
        self.inner.view.set_commit_index(log.commit_index());

        info!(
            last_included = snapshot.last_included_index.get(),
            size = snapshot.data_size(),
            "snapshot installed"
        );
        *self.inner.latest_snapshot.lock().await = Some(snapshot);
        Ok(())
    }

    /// Executes a client request: leads it, or forwards it to the leader.
    ///
    /// # Errors
    /// Returns an error when no leader is known, on storage failure, or
    /// when the commit wait times out.
    pub async fn execute(&self, payload: Bytes) -> Result<ExecuteResponse, RaftError> {
        let (role, term, leader) = {
            let status = self.inner.status.lock().await;
            (status.role, status.term, status.leader)
        };

        match role {
            RaftRole::Leader => self.lead_request(term, payload).await,
            _ => match leader {
                Some(target) if target != self.inner.config.node_id => self
                    .inner
                    .client
                    .execute(
                        target,
                        ExecuteRequest {
                            group_id: self.inner.config.group_id,
                            request: payload,
                        },
                    )
                    .await
                    .map_err(RaftError::Rpc),
                _ => Err(RaftError::UnknownLeader),
            },
        }
    }

    /// Returns the member's commit point. Never blocks on consensus.
    pub async fn request_commit_index(&self) -> CommitIndexResponse {
        let term = self.inner.status.lock().await.term;
        let log = self.inner.log.lock().await;
        CommitIndexResponse {
            status: response::AGREE,
            term,
            commit_index: log.commit_index(),
            commit_term: log.term_at(log.commit_index()),
        }
    }

    /// Returns true if the local log contains `(index, term)`.
    pub async fn match_log(&self, index: LogIndex, term: TermId) -> bool {
        self.inner.log.lock().await.match_term(index, term)
    }

    // ---- role transitions ----------------------------------------------

    /// Observes `new_term` and falls back to follower.
    ///
    /// Idempotent and safe under concurrent observation; the term never
    /// decreases, and a stepdown at the current term only drops the role.
    pub async fn step_down(&self, new_term: TermId, leader: Option<NodeId>) {
        {
            let mut status = self.inner.status.lock().await;
            if new_term > status.term {
                status.term = new_term;
                status.voted_for = None;
                if let Err(err) = self.persist_status(&status).await {
                    error!(%err, "failed to persist term on stepdown");
                }
                self.inner.view.set_term(new_term);
            }
            if status.role != RaftRole::Follower {
                info!(
                    term = status.term.get(),
                    new_term = new_term.get(),
                    "stepping down to follower"
                );
                status.role = RaftRole::Follower;
            }
            if leader.is_some() {
                status.leader = leader;
            }
            status.last_leader_contact = Some(Instant::now());
        }
        self.inner.view.set_leading(false);
        self.inner.tracker.terminate_all();
    }

    async fn become_leader(&self, term: TermId) {
        {
            let mut status = self.inner.status.lock().await;
            if status.term != term || status.role != RaftRole::Candidate {
                debug!(
                    term = term.get(),
                    current = status.term.get(),
                    "election won for a stale attempt"
                );
                return;
            }
            status.role = RaftRole::Leader;
            status.leader = Some(self.inner.config.node_id);
        }
        self.inner.tracker.reset(term);
        self.inner.view.set_leading(true);
        info!(term = term.get(), "became leader");
        self.broadcast_heartbeats().await;
    }

    // ---- leader path ---------------------------------------------------

    async fn lead_request(
        &self,
        term: TermId,
        payload: Bytes,
    ) -> Result<ExecuteResponse, RaftError> {
        let ventry = {
            let mut log = self.inner.log.lock().await;
            let entry = log.append_new(term, payload);
            if let Err(err) = self.inner.store.lock().await.append_entry(&entry) {
                // An unpersisted append is fatal to the role.
                log.truncate_after(entry.index.prev());
                drop(log);
                error!(%err, "failed to persist entry, stepping down");
                self.step_down(term, None).await;
                return Err(RaftError::Store(err));
            }
            Arc::new(VotingEntry::new(entry, self.inner.config.quorum_size()))
        };

        self.inner.tracker.insert(Arc::clone(&ventry));
        self.inner.dispatcher.offer(&ventry);

        // A single-node group has its quorum the moment the entry exists.
        if ventry.quorum_size() == 1 {
            self.on_quorum(ventry.entry().index, term).await;
        }

        let waited =
            tokio::time::timeout(self.inner.config.write_timeout, ventry.wait_decided()).await;
        match waited {
            Ok(VoteResult::Committed) => Ok(ExecuteResponse::ok()),
            Ok(VoteResult::Terminated) => {
                // Leadership was lost while the entry was in flight.
                let leader = self.inner.status.lock().await.leader;
                Err(RaftError::NotLeader { leader })
            }
            Err(_) => Err(RaftError::CommitTimeout),
        }
    }

    /// Takes a state-machine snapshot and compacts the log behind it.
    ///
    /// # Errors
    /// Returns an error if nothing has been applied yet or serialization
    /// fails.
    pub async fn take_snapshot(&self) -> Result<SnapshotMeta, RaftError> {
        let mut log = self.inner.log.lock().await;
        let applied = log.applied_index();
        let (boundary, _) = log.snapshot_boundary();
        if applied <= boundary {
            return Err(RaftError::NothingToSnapshot);
        }
        let term = log.term_at(applied);

        let data = {
            let sm = self.inner.state_machine.lock().await;
            sm.take_snapshot().map_err(RaftError::Store)?
        };
        let snapshot = Snapshot::new(applied, term, data);

        log.compact_to(applied, term);
        if let Err(err) = self.inner.store.lock().await.compact_to(applied) {
            warn!(%err, "failed to compact stored entries after snapshot");
        }

        let meta = SnapshotMeta::from_snapshot(&snapshot);
        *self.inner.latest_snapshot.lock().await = Some(snapshot);
        info!(
            last_included = meta.last_included_index.get(),
            size = meta.size,
            "snapshot taken"
        );
        Ok(meta)
    }

    async fn broadcast_heartbeats(&self) {
        let request = {
            let status = self.inner.status.lock().await;
            if status.role != RaftRole::Leader {
                return;
            }
            let term = status.term;
            drop(status);
            let log = self.inner.log.lock().await;
            HeartbeatRequest {
                group_id: self.inner.config.group_id,
                term,
                leader: self.inner.config.node_id,
                commit_index: log.commit_index(),
                commit_term: log.term_at(log.commit_index()),
            }
        };

        for peer in self.inner.config.peers() {
            let member = self.clone();
            tokio::spawn(async move {
                member.heartbeat_peer(peer, request).await;
            });
        }
    }

    async fn heartbeat_peer(&self, peer: NodeId, request: HeartbeatRequest) {
        match self.inner.client.heartbeat(peer, request).await {
            Ok(reply) => {
                if reply.status >= 0 && reply.status as u64 > request.term.get() {
                    self.step_down(TermId::new(reply.status as u64), None).await;
                    return;
                }

                // A follower behind the compaction boundary, or one whose
                // queue overflowed, needs out-of-band catch-up.
                let (first_index, last_index) = {
                    let log = self.inner.log.lock().await;
                    (log.first_index(), log.last_index())
                };
                let overflowed = self.inner.dispatcher.drop_count(peer) > 0
                    || self.inner.dispatcher.failure_count(peer) > 0;
                if reply.last_log_index < last_index
                    && (reply.last_log_index.next() < first_index || overflowed)
                {
                    let _ = self
                        .inner
                        .events
                        .send(MemberEvent::PeerLagging {
                            peer,
                            follower_last: reply.last_log_index,
                        })
                        .await;
                }
            }
            Err(err) => debug!(%peer, %err, "heartbeat failed"),
        }
    }

    // ---- event handling ------------------------------------------------

    pub(crate) async fn handle_event(&self, event: MemberEvent) {
        match event {
            MemberEvent::QuorumReached { index, term } => self.on_quorum(index, term).await,
            MemberEvent::HigherTerm { term, from } => self.step_down(term, from).await,
            MemberEvent::PeerLagging {
                peer,
                follower_last,
            } => self.trigger_catch_up(peer, follower_last.next()).await,
        }
    }

    async fn on_quorum(&self, index: LogIndex, term: TermId) {
        let still_leading = {
            let status = self.inner.status.lock().await;
            status.role == RaftRole::Leader && status.term == term
        };
        if !still_leading {
            return;
        }
        self.advance_commit(index).await;
        self.inner.tracker.release_up_to(index);
    }

    async fn advance_commit(&self, to: LogIndex) {
        let apply_ok = {
            let mut log = self.inner.log.lock().await;
            self.apply_up_to(&mut log, to).await
        };
        if !apply_ok {
            let term = self.inner.status.lock().await.term;
            self.step_down(term, None).await;
        }
    }

    /// Commits and applies up to `to` with the log lock held. Returns
    /// false if the state machine failed, which is fatal to a leader.
    async fn apply_up_to(&self, log: &mut RaftLog, to: LogIndex) -> bool {
        let newly = log.commit_to(to);
        if newly.is_empty() {
            self.inner.view.set_commit_index(log.commit_index());
            return true;
        }

        let mut ok = true;
        {
            let mut sm = self.inner.state_machine.lock().await;
            for entry in &newly {
                match sm.apply(entry) {
                    Ok(_) => log.set_applied(entry.index),
                    Err(err) => {
                        error!(index = entry.index.get(), %err, "state machine apply failed");
                        ok = false;
                        break;
                    }
                }
            }
        }
        self.inner.view.set_commit_index(log.commit_index());
        ok
    }

    async fn trigger_catch_up(&self, peer: NodeId, next_index: LogIndex) {
        if !self.inner.catch_up.register(peer) {
            debug!(%peer, "catch-up already active");
            return;
        }
        self.inner.dispatcher.reset_counters(peer);
        let member = self.clone();
        tokio::spawn(async move {
            run_catch_up(member, peer, next_index).await;
        });
    }

    // ---- internals shared with the election and catch-up drivers -------

    pub(crate) fn config(&self) -> &RaftConfig {
        &self.inner.config
    }

    pub(crate) fn client(&self) -> &Arc<dyn PeerClient> {
        &self.inner.client
    }

    pub(crate) fn commit_view(&self) -> LogIndex {
        self.inner.view.commit_index()
    }

    pub(crate) async fn current_term(&self) -> TermId {
        self.inner.status.lock().await.term
    }

    /// Re-checks leadership under the term monitor.
    pub(crate) async fn is_still_leader(&self, term: TermId) -> bool {
        let status = self.inner.status.lock().await;
        status.role == RaftRole::Leader && status.term == term
    }

    /// Decides what a lagging peer needs: a log slice, or a snapshot plus
    /// the tail after it.
    pub(crate) async fn catch_up_plan(&self, next_index: LogIndex) -> Result<CatchUpPlan, RaftError> {
        let log = self.inner.log.lock().await;
        if next_index >= log.first_index() {
            return Ok(CatchUpPlan {
                snapshot: None,
                entries: log.entries_from(next_index),
            });
        }

        if let Some(snapshot) = self.inner.latest_snapshot.lock().await.clone() {
            let entries = log.entries_from(snapshot.last_included_index.next());
            return Ok(CatchUpPlan {
                snapshot: Some(snapshot),
                entries,
            });
        }

        // The boundary predates this process; rebuild from the live state.
        let applied = log.applied_index();
        let term = log.term_at(applied);
        let data = {
            let sm = self.inner.state_machine.lock().await;
            sm.take_snapshot().map_err(RaftError::Store)?
        };
        let snapshot = Snapshot::new(applied, term, data);
        let entries = log.entries_from(applied.next());
        Ok(CatchUpPlan {
            snapshot: Some(snapshot),
            entries,
        })
    }

    /// Applies follower-side entries to the log and mirrors the change
    /// into durable storage. Caller holds the log lock.
    async fn append_durably(
        &self,
        log: &mut RaftLog,
        entries: Vec<Entry>,
    ) -> Result<(), RaftError> {
        let outcome = log.append_entries(entries);
        if outcome.truncated_from.is_none() && outcome.appended.is_empty() {
            return Ok(());
        }
        let mut store = self.inner.store.lock().await;
        if let Some(from) = outcome.truncated_from {
            store.truncate_from(from).map_err(RaftError::Store)?;
        }
        for entry in &outcome.appended {
            store.append_entry(entry).map_err(RaftError::Store)?;
        }
        Ok(())
    }

    async fn persist_status(&self, status: &RaftStatus) -> keel_core::Result<()> {
        self.inner.store.lock().await.save_hard_state(&HardState {
            term: status.term,
            voted_for: status.voted_for,
        })
    }

    /// Adopts `term`/`leader` from a valid leader message. Caller holds the
    /// status lock.
    async fn adopt_leader_locked(
        &self,
        status: &mut RaftStatus,
        term: TermId,
        leader: NodeId,
    ) {
        if term > status.term {
            status.term = term;
            status.voted_for = None;
            if let Err(err) = self.persist_status(status).await {
                error!(%err, "failed to persist adopted term");
            }
            self.inner.view.set_term(term);
        }
        if status.role != RaftRole::Follower {
            info!(term = term.get(), %leader, "yielding to leader");
            status.role = RaftRole::Follower;
            self.inner.view.set_leading(false);
            self.inner.tracker.terminate_all();
        }
        status.leader = Some(leader);
        status.last_leader_contact = Some(Instant::now());
    }
}

// ---- background loops --------------------------------------------------

/// Drives one election attempt in `currTerm + 1`.
pub(crate) async fn run_election(member: &RaftMember) {
    if member.inner.removed_from_group.load(Ordering::Acquire) {
        return;
    }

    let config = member.config().clone();
    let (ctx, request) = {
        let mut status = member.inner.status.lock().await;
        if status.role == RaftRole::Leader {
            return;
        }
        let term = status.term.next();
        status.term = term;
        status.role = RaftRole::Candidate;
        status.voted_for = Some(config.node_id);
        status.leader = None;
        if let Err(err) = member.persist_status(&status).await {
            error!(%err, "failed to persist candidacy, aborting election");
            status.role = RaftRole::Follower;
            return;
        }
        member.inner.view.set_term(term);

        let (last_log_index, last_log_term) = {
            let log = member.inner.log.lock().await;
            (log.last_index(), log.last_term())
        };
        let ctx = Arc::new(ElectionContext::new(
            term,
            config.quorum_size(),
            config.cluster_size(),
        ));
        let request = crate::message::ElectionRequest {
            group_id: config.group_id,
            term,
            elector: config.node_id,
            last_log_index,
            last_log_term,
        };
        (ctx, request)
    };

    info!(term = request.term.get(), "starting election");

    for peer in config.peers() {
        let member = member.clone();
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            match member.inner.client.request_vote(peer, request).await {
                Ok(resp) => match ctx.on_response(peer, resp).await {
                    VoteAction::StepDown(term) => member.step_down(term, None).await,
                    VoteAction::Removed => {
                        member
                            .inner
                            .removed_from_group
                            .store(true, Ordering::Release);
                    }
                    VoteAction::Won | VoteAction::Continue => {}
                },
                Err(_) => ctx.on_error(peer).await,
            }
        });
    }

    match ctx.wait(config.election_timeout_max).await {
        ElectionOutcome::Won => member.become_leader(ctx.term()).await,
        ElectionOutcome::SteppedDown(term) => {
            debug!(term = term.get(), "election superseded by larger term");
        }
        ElectionOutcome::Lost => debug!(term = ctx.term().get(), "election lost"),
    }
}

fn random_election_timeout(config: &RaftConfig) -> Duration {
    let min = config.election_timeout_min;
    let max = config.election_timeout_max;
    if max <= min {
        return min;
    }
    let span_ms = (max - min).as_millis() as u64;
    min + Duration::from_millis(rand::thread_rng().gen_range(0..=span_ms))
}

async fn heartbeat_loop(member: RaftMember, mut shutdown: watch::Receiver<bool>) {
    // Leader-side limiter retune cadence, in heartbeat ticks.
    const RATE_UPDATE_TICKS: u64 = 100;

    let mut ticker = tokio::time::interval(member.config().heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut election_timeout = random_election_timeout(member.config());
    let mut last_attempt = Instant::now();
    let mut leader_ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let (role, contact) = {
            let status = member.inner.status.lock().await;
            (status.role, status.last_leader_contact)
        };

        if role == RaftRole::Leader {
            member.broadcast_heartbeats().await;
            leader_ticks += 1;
            if leader_ticks % RATE_UPDATE_TICKS == 0 {
                member.inner.dispatcher.update_rate_limiters();
            }
            continue;
        }

        if member.inner.removed_from_group.load(Ordering::Acquire) {
            continue;
        }

        let reference = contact.map_or(last_attempt, |at| at.max(last_attempt));
        if reference.elapsed() >= election_timeout {
            run_election(&member).await;
            last_attempt = Instant::now();
            election_timeout = random_election_timeout(member.config());
        }
    }
    debug!("heartbeat loop exits");
}

async fn event_loop(
    member: RaftMember,
    mut events: mpsc::Receiver<MemberEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => member.handle_event(event).await,
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("event loop exits");
}

#[cfg(test)]
impl RaftMember {
    /// Forces leadership and seeds `count` committed, applied entries.
    pub(crate) async fn test_seed_leader(&self, count: u64, term: TermId) {
        {
            let mut status = self.inner.status.lock().await;
            status.term = term;
            status.role = RaftRole::Leader;
            status.leader = Some(self.inner.config.node_id);
        }
        self.inner.view.set_term(term);
        self.inner.view.set_leading(true);
        self.inner.tracker.reset(term);

        let to = {
            let mut log = self.inner.log.lock().await;
            for i in 0..count {
                let entry = log.append_new(term, Bytes::from(format!("seed-{i}")));
                self.inner
                    .store
                    .lock()
                    .await
                    .append_entry(&entry)
                    .expect("seed entry persists");
            }
            log.last_index()
        };
        self.advance_commit(to).await;
    }

    /// Appends `count` uncommitted entries to the leader's log.
    pub(crate) async fn test_append_tail(&self, count: u64, term: TermId) {
        let mut log = self.inner.log.lock().await;
        for i in 0..count {
            let entry = log.append_new(term, Bytes::from(format!("tail-{i}")));
            self.inner
                .store
                .lock()
                .await
                .append_entry(&entry)
                .expect("tail entry persists");
        }
    }

    pub(crate) async fn test_last_log(&self) -> (LogIndex, TermId) {
        let log = self.inner.log.lock().await;
        (log.last_index(), log.last_term())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::testing::JournalMachine;
    use crate::client::testing::{MockClient, Reply};
    use crate::message::ElectionRequest;
    use crate::storage::MemoryStore;

    fn three_node_config(node: u64) -> RaftConfig {
        RaftConfig::new(
            NodeId::new(node),
            GroupId::new(1),
            vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)],
        )
        .fast_for_testing()
    }

    fn member_with(config: RaftConfig, client: Arc<MockClient>) -> RaftMember {
        RaftMember::new(
            config,
            Box::new(MemoryStore::new()),
            Box::new(JournalMachine::default()),
            client as Arc<dyn PeerClient>,
        )
        .unwrap()
    }

    fn vote_request(term: u64, elector: u64, last_index: u64, last_term: u64) -> ElectionRequest {
        ElectionRequest {
            group_id: GroupId::new(1),
            term: TermId::new(term),
            elector: NodeId::new(elector),
            last_log_index: LogIndex::new(last_index),
            last_log_term: TermId::new(last_term),
        }
    }

    fn heartbeat(term: u64, leader: u64, commit: u64, commit_term: u64) -> HeartbeatRequest {
        HeartbeatRequest {
            group_id: GroupId::new(1),
            term: TermId::new(term),
            leader: NodeId::new(leader),
            commit_index: LogIndex::new(commit),
            commit_term: TermId::new(commit_term),
        }
    }

    fn append_request(
        term: u64,
        leader: u64,
        prev_index: u64,
        prev_term: u64,
        leader_commit: u64,
        entries: &[Entry],
    ) -> AppendEntriesRequest {
        AppendEntriesRequest {
            group_id: GroupId::new(1),
            term: TermId::new(term),
            leader: NodeId::new(leader),
            leader_commit: LogIndex::new(leader_commit),
            prev_log_index: LogIndex::new(prev_index),
            prev_log_term: TermId::new(prev_term),
            entries: entries.iter().map(Entry::encode).collect(),
        }
    }

    fn entries(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<Entry> {
        range
            .map(|i| {
                Entry::new(
                    LogIndex::new(i),
                    TermId::new(term),
                    TermId::new(if i == 1 { 0 } else { term }),
                    Bytes::from(format!("cmd-{i}")),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn fresh_member_is_follower() {
        let member = member_with(three_node_config(1), Arc::new(MockClient::new()));
        assert_eq!(member.role().await, RaftRole::Follower);
        assert_eq!(member.term().await.get(), 0);
        assert_eq!(member.leader().await, None);
    }

    #[tokio::test]
    async fn grants_vote_to_up_to_date_candidate() {
        let member = member_with(three_node_config(1), Arc::new(MockClient::new()));

        let resp = member
            .process_election_request(vote_request(1, 2, 0, 0))
            .await;
        assert_eq!(resp, response::AGREE);
        assert_eq!(member.term().await.get(), 1);

        // A competing candidate in the same term is refused with our term.
        let resp = member
            .process_election_request(vote_request(1, 3, 0, 0))
            .await;
        assert_eq!(resp, 1);
    }

    #[tokio::test]
    async fn rejects_unknown_elector() {
        let member = member_with(three_node_config(1), Arc::new(MockClient::new()));
        let resp = member
            .process_election_request(vote_request(5, 99, 10, 5))
            .await;
        assert_eq!(resp, response::NODE_IS_NOT_IN_GROUP);
    }

    #[tokio::test]
    async fn stale_election_request_returns_term() {
        let member = member_with(three_node_config(1), Arc::new(MockClient::new()));
        member
            .process_heartbeat_request(heartbeat(5, 2, 0, 0))
            .await;

        let resp = member
            .process_election_request(vote_request(3, 3, 0, 0))
            .await;
        assert_eq!(resp, 5);
    }

    #[tokio::test]
    async fn leader_stickiness_rejects_elector() {
        let member = member_with(three_node_config(1), Arc::new(MockClient::new()));
        // Heartbeat from a live leader at term 5.
        member
            .process_heartbeat_request(heartbeat(5, 2, 0, 0))
            .await;

        // A third node immediately contests term 6.
        let resp = member
            .process_election_request(vote_request(6, 3, 0, 0))
            .await;
        assert_eq!(resp, response::LEADER_STILL_ONLINE);
    }

    #[tokio::test]
    async fn refuses_vote_for_stale_log() {
        let member = member_with(three_node_config(1), Arc::new(MockClient::new()));
        // Give ourselves a log entry at term 2, then wait out the
        // stickiness window the append opened.
        let batch = entries(1..=2, 2);
        member
            .append_entries(append_request(2, 2, 0, 0, 0, &batch))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Candidate's log ends at term 1: refuse, reply with our term.
        let resp = member
            .process_election_request(vote_request(3, 3, 5, 1))
            .await;
        assert_eq!(resp, 3);
    }

    #[tokio::test]
    async fn heartbeat_adopts_leader_and_term() {
        let member = member_with(three_node_config(1), Arc::new(MockClient::new()));

        let reply = member
            .process_heartbeat_request(heartbeat(4, 3, 0, 0))
            .await;
        assert_eq!(reply.status, response::AGREE);
        assert_eq!(member.term().await.get(), 4);
        assert_eq!(member.leader().await, Some(NodeId::new(3)));

        // A stale heartbeat gets our term back.
        let reply = member
            .process_heartbeat_request(heartbeat(2, 2, 0, 0))
            .await;
        assert_eq!(reply.status, 4);
    }

    #[tokio::test]
    async fn append_then_commit_via_heartbeat() {
        let member = member_with(three_node_config(1), Arc::new(MockClient::new()));
        let batch = entries(1..=3, 1);

        let result = member
            .append_entries(append_request(1, 2, 0, 0, 0, &batch))
            .await
            .unwrap();
        assert_eq!(result.status, response::AGREE);
        assert_eq!(result.last_log_index.get(), 3);
        assert_eq!(member.commit_index().await.get(), 0);

        // The heartbeat carries the leader's commit point.
        member
            .process_heartbeat_request(heartbeat(1, 2, 2, 1))
            .await;
        assert_eq!(member.commit_index().await.get(), 2);
    }

    #[tokio::test]
    async fn append_rejects_mismatch() {
        let member = member_with(three_node_config(1), Arc::new(MockClient::new()));

        let batch = entries(5..=6, 1);
        let result = member
            .append_entries(append_request(1, 2, 4, 1, 0, &batch))
            .await
            .unwrap();
        assert_eq!(result.status, response::LOG_MISMATCH);
        assert_eq!(result.last_log_index.get(), 0);
    }

    #[tokio::test]
    async fn append_redelivery_is_noop_success() {
        let member = member_with(three_node_config(1), Arc::new(MockClient::new()));
        let batch = entries(1..=2, 1);

        let first = member
            .append_entries(append_request(1, 2, 0, 0, 2, &batch))
            .await
            .unwrap();
        assert_eq!(first.status, response::AGREE);

        let again = member
            .append_entries(append_request(1, 2, 0, 0, 2, &batch))
            .await
            .unwrap();
        assert_eq!(again.status, response::AGREE);
        assert_eq!(again.last_log_index.get(), 2);
        assert_eq!(member.commit_index().await.get(), 2);
    }

    #[tokio::test]
    async fn append_truncates_conflicting_suffix() {
        let member = member_with(three_node_config(1), Arc::new(MockClient::new()));
        member
            .append_entries(append_request(1, 2, 0, 0, 1, &entries(1..=3, 1)))
            .await
            .unwrap();

        // New leader at term 2 overwrites indexes 2..3.
        let replacement = vec![
            Entry::new(LogIndex::new(2), TermId::new(2), TermId::new(1), Bytes::from("x")),
            Entry::new(LogIndex::new(3), TermId::new(2), TermId::new(2), Bytes::from("y")),
        ];
        let result = member
            .append_entries(append_request(2, 3, 1, 1, 0, &replacement))
            .await
            .unwrap();
        assert_eq!(result.status, response::AGREE);
        assert!(member.match_log(LogIndex::new(3), TermId::new(2)).await);
        assert!(!member.match_log(LogIndex::new(3), TermId::new(1)).await);
    }

    #[tokio::test]
    async fn sliding_window_buffers_gap_and_drains() {
        let config = three_node_config(1).with_window_mode(true, true);
        let member = member_with(config, Arc::new(MockClient::new()));
        let all = entries(1..=6, 1);

        // Batch [4..6] arrives first: buffered, weakly accepted.
        let result = member
            .append_entries(append_request(1, 2, 3, 1, 0, &all[3..]))
            .await
            .unwrap();
        assert_eq!(result.status, response::WEAK_ACCEPT);
        assert_eq!(result.last_log_index.get(), 0);

        // The gap [1..3] arrives: both runs land.
        let result = member
            .append_entries(append_request(1, 2, 0, 0, 0, &all[..3]))
            .await
            .unwrap();
        assert_eq!(result.status, response::AGREE);
        assert_eq!(result.last_log_index.get(), 6);
    }

    #[tokio::test]
    async fn sliding_window_bounds_the_gap() {
        let mut config = three_node_config(1).with_window_mode(true, true);
        config.window_capacity = 4;
        let member = member_with(config, Arc::new(MockClient::new()));

        let far = entries(100..=101, 1);
        let result = member
            .append_entries(append_request(1, 2, 99, 1, 0, &far))
            .await
            .unwrap();
        assert_eq!(result.status, response::OUT_OF_WINDOW);
    }

    #[tokio::test]
    async fn three_node_election_won() {
        let client = Arc::new(MockClient::new());
        client.script_vote(NodeId::new(2), Reply::Value(response::AGREE));
        client.script_vote(NodeId::new(3), Reply::Value(response::AGREE));
        let member = member_with(three_node_config(1), client);

        run_election(&member).await;

        assert_eq!(member.role().await, RaftRole::Leader);
        assert_eq!(member.term().await.get(), 1);
        assert_eq!(member.leader().await, Some(NodeId::new(1)));
    }

    #[tokio::test]
    async fn election_rejected_by_higher_term_steps_down() {
        let client = Arc::new(MockClient::new());
        client.script_vote(NodeId::new(2), Reply::Pending);
        client.script_vote(NodeId::new(3), Reply::Value(8));
        let member = member_with(three_node_config(1), client);
        // Start from term 5 so the attempt contests term 6.
        member
            .process_heartbeat_request(heartbeat(5, 2, 0, 0))
            .await;

        run_election(&member).await;

        assert_eq!(member.role().await, RaftRole::Follower);
        assert_eq!(member.term().await.get(), 8);
    }

    #[tokio::test]
    async fn election_against_dark_cluster_is_lost() {
        let client = Arc::new(MockClient::new());
        client.script_vote(
            NodeId::new(2),
            Reply::Error(RpcError::Unreachable {
                peer: NodeId::new(2),
            }),
        );
        client.script_vote(
            NodeId::new(3),
            Reply::Error(RpcError::Unreachable {
                peer: NodeId::new(3),
            }),
        );
        let member = member_with(three_node_config(1), client);

        let started = Instant::now();
        run_election(&member).await;

        assert_eq!(member.role().await, RaftRole::Candidate);
        // Fast-fail: both errors arrive immediately, no full timeout wait.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn single_node_group_commits_on_self_append() {
        let config = RaftConfig::new(NodeId::new(1), GroupId::new(1), vec![NodeId::new(1)])
            .fast_for_testing();
        let member = member_with(config, Arc::new(MockClient::new()));

        run_election(&member).await;
        assert_eq!(member.role().await, RaftRole::Leader);

        let response = member.execute(Bytes::from("only me")).await.unwrap();
        assert!(response.is_ok());
        assert_eq!(member.commit_index().await.get(), 1);
    }

    #[tokio::test]
    async fn execute_without_leader_fails() {
        let member = member_with(three_node_config(1), Arc::new(MockClient::new()));
        let err = member.execute(Bytes::from("nope")).await.unwrap_err();
        assert!(matches!(err, RaftError::UnknownLeader));
    }

    #[tokio::test]
    async fn step_down_is_idempotent_and_monotonic() {
        let member = member_with(three_node_config(1), Arc::new(MockClient::new()));
        member.test_seed_leader(2, TermId::new(3)).await;
        assert_eq!(member.role().await, RaftRole::Leader);

        member.step_down(TermId::new(7), Some(NodeId::new(2))).await;
        assert_eq!(member.role().await, RaftRole::Follower);
        assert_eq!(member.term().await.get(), 7);

        // Observing a smaller term again never decreases ours.
        member.step_down(TermId::new(4), None).await;
        assert_eq!(member.term().await.get(), 7);
    }

    #[tokio::test]
    async fn commit_index_read_never_blocks() {
        let member = member_with(three_node_config(1), Arc::new(MockClient::new()));
        member.test_seed_leader(3, TermId::new(1)).await;

        let reply = member.request_commit_index().await;
        assert_eq!(reply.status, response::AGREE);
        assert_eq!(reply.commit_index.get(), 3);
        assert_eq!(reply.commit_term.get(), 1);
    }

    #[tokio::test]
    async fn install_snapshot_replaces_state() {
        // Build a donor member with applied state and snapshot it.
        let donor = member_with(three_node_config(1), Arc::new(MockClient::new()));
        donor.test_seed_leader(5, TermId::new(1)).await;
        donor.take_snapshot().await.unwrap();
        let snapshot = donor.inner.latest_snapshot.lock().await.clone().unwrap();

        let member = member_with(three_node_config(2), Arc::new(MockClient::new()));
        member.install_snapshot(snapshot.encode()).await.unwrap();

        assert_eq!(member.commit_index().await.get(), 5);
        let (last_index, last_term) = member.test_last_log().await;
        assert_eq!(last_index.get(), 5);
        assert_eq!(last_term.get(), 1);

        // Re-delivery of an already-covered snapshot is a no-op.
        member.install_snapshot(snapshot.encode()).await.unwrap();
        assert_eq!(member.commit_index().await.get(), 5);
    }

    #[tokio::test]
    async fn install_snapshot_rejects_garbage() {
        let member = member_with(three_node_config(1), Arc::new(MockClient::new()));
        let err = member
            .install_snapshot(Bytes::from_static(b"not a snapshot"))
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::CorruptSnapshot));
    }

    #[tokio::test]
    async fn take_snapshot_compacts_log() {
        let member = member_with(three_node_config(1), Arc::new(MockClient::new()));
        member.test_seed_leader(10, TermId::new(1)).await;

        let meta = member.take_snapshot().await.unwrap();
        assert_eq!(meta.last_included_index.get(), 10);

        // Nothing new applied since: a second snapshot has nothing to do.
        let err = member.take_snapshot().await.unwrap_err();
        assert!(matches!(err, RaftError::NothingToSnapshot));
    }

    #[tokio::test]
    async fn quorum_event_advances_commit() {
        let client = Arc::new(MockClient::new());
        let member = member_with(three_node_config(1), client);
        member.test_seed_leader(0, TermId::new(2)).await;

        let entry = {
            let mut log = member.inner.log.lock().await;
            log.append_new(TermId::new(2), Bytes::from("cmd"))
        };
        let ventry = Arc::new(VotingEntry::new(entry, 2));
        member.inner.tracker.insert(Arc::clone(&ventry));
        ventry.record_ack(NodeId::new(2));

        member
            .handle_event(MemberEvent::QuorumReached {
                index: LogIndex::new(1),
                term: TermId::new(2),
            })
            .await;

        assert_eq!(member.commit_index().await.get(), 1);
        assert!(ventry.is_committed());
    }

    #[tokio::test]
    async fn heartbeat_reply_behind_boundary_triggers_catch_up() {
        let client = Arc::new(MockClient::new());
        let member = member_with(three_node_config(1), client.clone());
        member.test_seed_leader(10, TermId::new(1)).await;
        member.take_snapshot().await.unwrap();

        // Follower 2 reports a log that ends before our first live entry.
        client.script_heartbeat(
            NodeId::new(2),
            Reply::Value(HeartbeatResponse {
                status: response::AGREE,
                follower: NodeId::new(2),
                last_log_index: LogIndex::new(3),
                last_log_term: TermId::new(1),
            }),
        );

        let request = heartbeat(1, 1, 10, 1);
        member.heartbeat_peer(NodeId::new(2), request).await;

        let mut events = member
            .inner
            .events_rx
            .lock()
            .unwrap()
            .take()
            .expect("events receiver available");
        match events.try_recv().expect("expected an event") {
            MemberEvent::PeerLagging {
                peer,
                follower_last,
            } => {
                assert_eq!(peer, NodeId::new(2));
                assert_eq!(follower_last.get(), 3);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn heartbeat_reply_with_larger_term_steps_down() {
        let client = Arc::new(MockClient::new());
        let member = member_with(three_node_config(1), client.clone());
        member.test_seed_leader(1, TermId::new(2)).await;

        client.script_heartbeat(
            NodeId::new(2),
            Reply::Value(HeartbeatResponse {
                status: 9,
                follower: NodeId::new(2),
                last_log_index: LogIndex::new(0),
                last_log_term: TermId::new(0),
            }),
        );

        member
            .heartbeat_peer(NodeId::new(2), heartbeat(2, 1, 1, 2))
            .await;

        assert_eq!(member.role().await, RaftRole::Follower);
        assert_eq!(member.term().await.get(), 9);
    }

    #[tokio::test]
    async fn stale_quorum_event_is_ignored() {
        let member = member_with(three_node_config(1), Arc::new(MockClient::new()));
        member.test_seed_leader(0, TermId::new(3)).await;

        {
            let mut log = member.inner.log.lock().await;
            log.append_new(TermId::new(3), Bytes::from("cmd"));
        }
        member
            .handle_event(MemberEvent::QuorumReached {
                index: LogIndex::new(1),
                term: TermId::new(2),
            })
            .await;
        assert_eq!(member.commit_index().await.get(), 0);
    }
}
