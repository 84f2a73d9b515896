//! Keel flow - per-peer flow control.
//!
//! The leader's log dispatcher paces each follower independently: a flow
//! monitor measures how fast a peer actually absorbs bytes, and a token
//! bucket limiter enforces that measured rate on subsequent sends. Both
//! pieces take the current time as an argument rather than reading a clock,
//! so they stay deterministic under test.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]

mod error;
mod monitor;
mod token_bucket;

pub use error::{FlowError, FlowResult};
pub use monitor::FlowMonitor;
pub use token_bucket::RateLimiter;

/// Key identifying a flow-controlled peer. Callers map their node IDs onto
/// this to keep the crate free of consensus types.
pub type PeerKey = u64;
