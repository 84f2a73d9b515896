//! The state-machine seam.

use bytes::Bytes;
use keel_core::Result;

use crate::log::Entry;

/// The replicated state machine a member drives.
///
/// Implementations are exercised single-threaded: the member serializes
/// `apply` calls in log order and never interleaves them with snapshot
/// installation.
pub trait StateMachine: Send + 'static {
    /// Applies a committed entry and returns its result.
    ///
    /// # Errors
    /// An error here is treated as a persistence-class failure: fatal to
    /// the leader role.
    fn apply(&mut self, entry: &Entry) -> Result<Bytes>;

    /// Serializes the current state for transfer to a lagging follower.
    ///
    /// # Errors
    /// Returns a storage error if the state cannot be serialized.
    fn take_snapshot(&self) -> Result<Bytes>;

    /// Atomically replaces the current state with `data`.
    ///
    /// # Errors
    /// Returns a storage error if the data cannot be installed.
    fn install_snapshot(&mut self, data: &Bytes) -> Result<()>;
}
