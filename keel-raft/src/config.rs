//! Member configuration.

use std::time::Duration;

use keel_core::{limits, GroupId, NodeId};

/// Configuration for one group member.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's ID.
    pub node_id: NodeId,
    /// The replication group this member belongs to.
    pub group_id: GroupId,
    /// All voting nodes in the group, including this one.
    pub cluster: Vec<NodeId>,

    /// Capacity of each per-peer dispatch queue, in entries.
    pub queue_capacity: usize,
    /// Dispatcher workers bound to each peer queue.
    pub binding_workers: usize,
    /// Entries drained into one dispatch batch.
    pub max_batch_size: usize,
    /// Wire-frame size limit for one request, in bytes.
    pub max_frame_size: u64,

    /// Wait bound for a snapshot catch-up send.
    pub catch_up_timeout: Duration,
    /// Wait bound for a client request to commit.
    pub write_timeout: Duration,

    /// Followers buffer out-of-order batches in a sliding window.
    pub use_follower_sliding_window: bool,
    /// Followers may acknowledge receipt before durability.
    pub enable_weak_acceptance: bool,
    /// Capacity of the follower sliding window, in entries.
    pub window_capacity: usize,

    /// Minimum election timeout.
    pub election_timeout_min: Duration,
    /// Maximum election timeout.
    pub election_timeout_max: Duration,
    /// Leader heartbeat interval.
    pub heartbeat_interval: Duration,
}

impl RaftConfig {
    /// Creates a configuration with defaults for everything but identity.
    ///
    /// # Panics
    /// Panics if the cluster is empty, exceeds the size limit, or does not
    /// contain this node.
    #[must_use]
    pub fn new(node_id: NodeId, group_id: GroupId, cluster: Vec<NodeId>) -> Self {
        assert!(!cluster.is_empty(), "cluster cannot be empty");
        assert!(
            cluster.len() <= limits::CLUSTER_SIZE_MAX,
            "cluster size {} exceeds maximum {}",
            cluster.len(),
            limits::CLUSTER_SIZE_MAX
        );
        assert!(cluster.contains(&node_id), "node_id must be in cluster");

        Self {
            node_id,
            group_id,
            cluster,
            queue_capacity: limits::DISPATCH_QUEUE_CAPACITY_DEFAULT,
            binding_workers: limits::BINDING_WORKERS_DEFAULT,
            max_batch_size: limits::BATCH_ENTRIES_DEFAULT,
            max_frame_size: limits::FRAME_SIZE_DEFAULT,
            catch_up_timeout: Duration::from_millis(limits::CATCH_UP_TIMEOUT_DEFAULT_MS),
            write_timeout: Duration::from_secs(10),
            use_follower_sliding_window: false,
            enable_weak_acceptance: false,
            window_capacity: limits::FOLLOWER_WINDOW_CAPACITY_DEFAULT,
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
        }
    }

    /// Returns the number of nodes in the group.
    #[must_use]
    pub fn cluster_size(&self) -> usize {
        self.cluster.len()
    }

    /// Returns the quorum size (majority, self-counted).
    #[must_use]
    pub fn quorum_size(&self) -> usize {
        self.cluster.len() / 2 + 1
    }

    /// Returns the other nodes in the group.
    #[must_use]
    pub fn peers(&self) -> Vec<NodeId> {
        self.cluster
            .iter()
            .copied()
            .filter(|&id| id != self.node_id)
            .collect()
    }

    /// Returns whether per-peer queues deliver in index order.
    ///
    /// With the sliding window and weak acceptance both enabled, producers
    /// may interleave and the follower reorders; the dispatcher then sorts
    /// each batch before sending. Computed once at member construction and
    /// immutable for the member's lifetime.
    #[must_use]
    pub const fn queue_ordered(&self) -> bool {
        !(self.use_follower_sliding_window && self.enable_weak_acceptance)
    }

    /// Returns the leader-stickiness window: how recently a leader must
    /// have been heard from for this node to refuse competing electors.
    #[must_use]
    pub const fn leader_stickiness(&self) -> Duration {
        self.election_timeout_min
    }

    /// Sets the election timeout range.
    #[must_use]
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the dispatch batch size.
    #[must_use]
    pub const fn with_max_batch_size(mut self, entries: usize) -> Self {
        self.max_batch_size = entries;
        self
    }

    /// Sets the wire-frame size limit.
    #[must_use]
    pub const fn with_max_frame_size(mut self, bytes: u64) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Sets the per-peer queue capacity.
    #[must_use]
    pub const fn with_queue_capacity(mut self, entries: usize) -> Self {
        self.queue_capacity = entries;
        self
    }

    /// Sets the sliding-window / weak-acceptance pair.
    #[must_use]
    pub const fn with_window_mode(mut self, sliding_window: bool, weak_acceptance: bool) -> Self {
        self.use_follower_sliding_window = sliding_window;
        self.enable_weak_acceptance = weak_acceptance;
        self
    }

    /// Timing suitable for tests: fast elections, fast heartbeats.
    #[must_use]
    pub fn fast_for_testing(mut self) -> Self {
        self.election_timeout_min = Duration::from_millis(50);
        self.election_timeout_max = Duration::from_millis(100);
        self.heartbeat_interval = Duration::from_millis(20);
        self.write_timeout = Duration::from_secs(2);
        self.catch_up_timeout = Duration::from_secs(2);
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.cluster.is_empty() {
            return Err("cluster cannot be empty");
        }
        if self.cluster.len() > limits::CLUSTER_SIZE_MAX {
            return Err("cluster too large");
        }
        if !self.cluster.contains(&self.node_id) {
            return Err("node_id not in cluster");
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err("election timeout min > max");
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err("heartbeat interval must be less than election timeout");
        }
        if self.max_batch_size == 0 || self.max_batch_size > limits::BATCH_ENTRIES_MAX {
            return Err("max_batch_size out of range");
        }
        if self.max_frame_size <= limits::FRAME_RESERVED_BYTES {
            return Err("max_frame_size must exceed the reserved headroom");
        }
        if self.binding_workers == 0 {
            return Err("binding_workers must be at least 1");
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be at least 1");
        }
        Ok(())
    }
}
