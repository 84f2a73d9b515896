//! Protocol limits and defaults.
//!
//! Every tunable the engine exposes has a named ceiling or default here so
//! that configs can be validated against one authoritative set of numbers.

/// Maximum number of voting nodes in a replication group.
pub const CLUSTER_SIZE_MAX: usize = 7;

/// Default number of entries batched into one `AppendEntries` request.
pub const BATCH_ENTRIES_DEFAULT: usize = 10;

/// Maximum number of entries batched into one `AppendEntries` request.
pub const BATCH_ENTRIES_MAX: usize = 1_000;

/// Default wire-frame size limit for one request, in bytes (64 MiB).
pub const FRAME_SIZE_DEFAULT: u64 = 64 * 1024 * 1024;

/// Headroom reserved inside a frame for the request envelope, in bytes.
///
/// Entry chunking stops accumulating once the next entry would leave less
/// than this much room below the frame limit.
pub const FRAME_RESERVED_BYTES: u64 = 64 * 1024;

/// Default capacity of each per-peer dispatch queue, in entries.
pub const DISPATCH_QUEUE_CAPACITY_DEFAULT: usize = 4_096;

/// Default number of dispatcher workers bound to each peer queue.
pub const BINDING_WORKERS_DEFAULT: usize = 1;

/// Maximum snapshot payload size, in bytes (256 MiB).
pub const SNAPSHOT_SIZE_MAX: u64 = 256 * 1024 * 1024;

/// Default bound on a snapshot catch-up send, in milliseconds.
pub const CATCH_UP_TIMEOUT_DEFAULT_MS: u64 = 300_000;

/// Default capacity of the follower sliding window, in entries.
pub const FOLLOWER_WINDOW_CAPACITY_DEFAULT: usize = 64;

/// Bound on draining dispatch queues at shutdown, in milliseconds.
pub const SHUTDOWN_DRAIN_TIMEOUT_MS: u64 = 10_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_headroom_is_sane() {
        assert!(FRAME_RESERVED_BYTES < FRAME_SIZE_DEFAULT);
    }

    #[test]
    fn batch_default_within_max() {
        assert!(BATCH_ENTRIES_DEFAULT <= BATCH_ENTRIES_MAX);
    }
}
