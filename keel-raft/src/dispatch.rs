//! Per-peer log dispatch.
//!
//! The dispatcher serves a leader by queueing entries per follower and
//! shipping them in index order, so a follower never stalls waiting for an
//! earlier entry that was overtaken in flight. Each follower gets a bounded
//! queue and one or more binding workers. Offers never block the leader: a
//! full queue drops the entry for that peer and the catch-up path recovers
//! it later.
//!
//! A worker takes one entry (blocking), opportunistically drains what else
//! is already queued up to the batch limit, chunks the batch by wire size,
//! paces each chunk through the peer's rate limiter, and fans the single
//! response out to every included entry's quorum bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use keel_core::{limits, GroupId, NodeId};
use keel_flow::{FlowMonitor, RateLimiter};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::client::PeerClient;
use crate::config::RaftConfig;
use crate::member::MemberEvent;
use crate::message::{response, AppendEntriesRequest, AppendEntryResult};
use crate::state::StatusView;
use crate::voting::{VotingEntry, VotingTracker};

/// Context cloned into every dispatcher worker.
#[derive(Clone)]
struct DispatchContext {
    group_id: GroupId,
    leader: NodeId,
    client: Arc<dyn PeerClient>,
    tracker: Arc<VotingTracker>,
    view: Arc<StatusView>,
    events: mpsc::Sender<MemberEvent>,
    monitor: Arc<StdMutex<FlowMonitor>>,
    max_batch_size: usize,
    max_frame_size: u64,
    queue_ordered: bool,
    /// Epoch for the monotonic microsecond clock fed to flow control.
    epoch: Instant,
}

impl DispatchContext {
    fn now_us(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

/// Per-peer pacing and failure state shared with workers.
#[derive(Clone)]
struct LaneHandles {
    limiter: Arc<StdMutex<RateLimiter>>,
    failures: Arc<AtomicU64>,
}

/// One follower's queue plus its control state.
struct PeerLane {
    queue: mpsc::Sender<Arc<VotingEntry>>,
    enabled: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    handles: LaneHandles,
}

/// Leader-side dispatch of entries to every follower.
pub struct LogDispatcher {
    lanes: HashMap<NodeId, PeerLane>,
    monitor: Arc<StdMutex<FlowMonitor>>,
    ctx: DispatchContext,
    shutdown: watch::Sender<bool>,
}

impl LogDispatcher {
    pub(crate) fn new(
        config: &RaftConfig,
        client: Arc<dyn PeerClient>,
        tracker: Arc<VotingTracker>,
        view: Arc<StatusView>,
        events: mpsc::Sender<MemberEvent>,
    ) -> Self {
        let monitor = Arc::new(StdMutex::new(FlowMonitor::default()));
        let (shutdown, _) = watch::channel(false);

        let ctx = DispatchContext {
            group_id: config.group_id,
            leader: config.node_id,
            client,
            tracker,
            view,
            events,
            monitor: Arc::clone(&monitor),
            max_batch_size: config.max_batch_size.max(1),
            max_frame_size: config.max_frame_size,
            queue_ordered: config.queue_ordered(),
            epoch: Instant::now(),
        };

        let mut lanes = HashMap::new();
        for peer in config.peers() {
            let (tx, rx) = mpsc::channel(config.queue_capacity);
            let handles = LaneHandles {
                limiter: Arc::new(StdMutex::new(RateLimiter::unlimited(0))),
                failures: Arc::new(AtomicU64::new(0)),
            };
            monitor
                .lock()
                .expect("monitor mutex poisoned")
                .register(peer.get());

            let shared_rx = Arc::new(Mutex::new(rx));
            for _ in 0..config.binding_workers.max(1) {
                tokio::spawn(worker_loop(
                    ctx.clone(),
                    peer,
                    Arc::clone(&shared_rx),
                    handles.clone(),
                    shutdown.subscribe(),
                ));
            }

            lanes.insert(
                peer,
                PeerLane {
                    queue: tx,
                    enabled: Arc::new(AtomicBool::new(true)),
                    dropped: Arc::new(AtomicU64::new(0)),
                    handles,
                },
            );
        }

        Self {
            lanes,
            monitor,
            ctx,
            shutdown,
        }
    }

    /// Enqueues `entry` for every enabled peer. Never blocks; a full queue
    /// drops the entry for that peer and bumps its drop counter.
    pub fn offer(&self, entry: &Arc<VotingEntry>) {
        for (peer, lane) in &self.lanes {
            if !lane.enabled.load(Ordering::Acquire) {
                continue;
            }
            match lane.queue.try_send(Arc::clone(entry)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    lane.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(%peer, index = entry.entry().index.get(), "dispatch queue full, dropping");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(%peer, "dispatch queue closed");
                }
            }
        }
    }

    /// Pulls the measured throughput for each peer into its rate limiter.
    pub fn update_rate_limiters(&self) {
        let now = self.ctx.now_us();
        let rates = self
            .monitor
            .lock()
            .expect("monitor mutex poisoned")
            .rates(now);
        info!(?rates, "peer send rates");

        for (peer, lane) in &self.lanes {
            if let Some(Some(rate)) = rates.get(&peer.get()) {
                lane.handles
                    .limiter
                    .lock()
                    .expect("limiter mutex poisoned")
                    .set_rate(*rate);
            }
        }
    }

    /// Enables or disables dispatch to `peer`.
    pub fn set_peer_enabled(&self, peer: NodeId, enabled: bool) {
        if let Some(lane) = self.lanes.get(&peer) {
            lane.enabled.store(enabled, Ordering::Release);
        }
    }

    /// Returns how many offers were dropped for `peer` on a full queue.
    #[must_use]
    pub fn drop_count(&self, peer: NodeId) -> u64 {
        self.lanes
            .get(&peer)
            .map_or(0, |lane| lane.dropped.load(Ordering::Relaxed))
    }

    /// Returns how many sends to `peer` failed or were rejected.
    #[must_use]
    pub fn failure_count(&self, peer: NodeId) -> u64 {
        self.lanes
            .get(&peer)
            .map_or(0, |lane| lane.handles.failures.load(Ordering::Relaxed))
    }

    /// Clears the drop and failure counters for `peer` after a catch-up.
    pub fn reset_counters(&self, peer: NodeId) {
        if let Some(lane) = self.lanes.get(&peer) {
            lane.dropped.store(0, Ordering::Relaxed);
            lane.handles.failures.store(0, Ordering::Relaxed);
        }
    }

    /// Signals workers to drain their queues and exit.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn worker_loop(
    ctx: DispatchContext,
    peer: NodeId,
    queue: Arc<Mutex<mpsc::Receiver<Arc<VotingEntry>>>>,
    handles: LaneHandles,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut drain_deadline: Option<Instant> = None;

    loop {
        let shutting_down = *shutdown.borrow();
        if shutting_down {
            let deadline = *drain_deadline.get_or_insert_with(|| {
                Instant::now() + Duration::from_millis(limits::SHUTDOWN_DRAIN_TIMEOUT_MS)
            });
            if Instant::now() >= deadline {
                warn!(%peer, "drain timeout, dropping queued entries");
                break;
            }
        }

        let mut batch: Vec<Arc<VotingEntry>> = Vec::new();
        {
            let mut rx = queue.lock().await;
            if shutting_down {
                match rx.try_recv() {
                    Ok(entry) => batch.push(entry),
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                }
            } else {
                tokio::select! {
                    item = rx.recv() => match item {
                        Some(entry) => batch.push(entry),
                        None => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            while batch.len() < ctx.max_batch_size {
                match rx.try_recv() {
                    Ok(entry) => batch.push(entry),
                    Err(_) => break,
                }
            }
        }

        if !ctx.queue_ordered {
            // Producers may have interleaved; the follower's sliding
            // window needs ascending indexes within a request.
            batch.sort_by_key(|v| v.entry().index);
        }

        debug!(count = batch.len(), %peer, "dispatching batch");
        send_batch(&ctx, peer, &handles, &batch).await;
    }

    debug!(%peer, "dispatcher worker exits");
}

/// Ships `batch` to `peer` in frame-size-limited chunks.
async fn send_batch(
    ctx: &DispatchContext,
    peer: NodeId,
    handles: &LaneHandles,
    batch: &[Arc<VotingEntry>],
) {
    let mut i = 0;
    while i < batch.len() {
        let first = i;
        let mut size = 0u64;
        let mut entries: Vec<Bytes> = Vec::new();

        while i < batch.len() {
            let wire = batch[i].wire_bytes();
            let wire_size = wire.len() as u64;
            if !entries.is_empty()
                && size + wire_size + limits::FRAME_RESERVED_BYTES > ctx.max_frame_size
            {
                break;
            }
            size += wire_size;
            entries.push(wire.clone());
            i += 1;
        }

        let head = batch[first].entry();
        let request = AppendEntriesRequest {
            group_id: ctx.group_id,
            term: ctx.view.term(),
            leader: ctx.leader,
            leader_commit: ctx.view.commit_index(),
            prev_log_index: head.index.prev(),
            prev_log_term: head.prev_term,
            entries,
        };

        {
            let now = ctx.now_us();
            ctx.monitor
                .lock()
                .expect("monitor mutex poisoned")
                .report(peer.get(), size, now);
        }
        let wait_us = {
            let now = ctx.now_us();
            handles
                .limiter
                .lock()
                .expect("limiter mutex poisoned")
                .acquire_wait_us(size, now)
        };
        if wait_us > 0 {
            tokio::time::sleep(Duration::from_micros(wait_us)).await;
        }

        match ctx.client.append_entries(peer, request).await {
            Ok(result) => fan_out(ctx, handles, peer, &batch[first..i], &result).await,
            Err(err) => {
                warn!(%peer, %err, "append entries failed");
                handles.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Applies one response to every entry included in the request.
async fn fan_out(
    ctx: &DispatchContext,
    handles: &LaneHandles,
    peer: NodeId,
    included: &[Arc<VotingEntry>],
    result: &AppendEntryResult,
) {
    if let Some(term) = result.rejecting_term() {
        if term > ctx.view.term() {
            let _ = ctx
                .events
                .send(MemberEvent::HigherTerm {
                    term,
                    from: Some(peer),
                })
                .await;
        }
        return;
    }

    match result.status {
        response::AGREE => {
            for ventry in included {
                if ctx.tracker.record_ack(ventry, peer) {
                    let _ = ctx
                        .events
                        .send(MemberEvent::QuorumReached {
                            index: ventry.entry().index,
                            term: ventry.entry().term,
                        })
                        .await;
                }
            }
        }
        response::WEAK_ACCEPT => {
            for ventry in included {
                ventry.record_weak_ack(peer);
            }
        }
        response::LOG_MISMATCH | response::OUT_OF_WINDOW => {
            handles.failures.fetch_add(1, Ordering::Relaxed);
            let _ = ctx
                .events
                .send(MemberEvent::PeerLagging {
                    peer,
                    follower_last: result.last_log_index,
                })
                .await;
        }
        other => debug!(%peer, status = other, "unhandled append result"),
    }
}
