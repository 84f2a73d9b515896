//! Keel raft - consensus replication engine.
//!
//! One [`RaftMember`] drives a replicated state machine for one group:
//! leader election, per-peer log dispatch with batching and rate limiting,
//! and snapshot/log catch-up for followers that have fallen behind.
//!
//! # Design
//!
//! - The member's term and role live behind one mutex; every safety
//!   decision re-acquires it, and no lock is held across a network send.
//! - RPC completions are posted as events onto the member's inbox and
//!   consumed serially, instead of mutating shared state from callbacks.
//! - Each follower gets a bounded dispatch queue with non-blocking offers;
//!   a full queue drops the entry and the catch-up path recovers the peer.

#![forbid(unsafe_code)]
#![deny(clippy::all)]

mod apply;
mod catchup;
mod client;
mod config;
mod dispatch;
mod election;
mod log;
mod member;
pub mod message;
mod snapshot;
mod state;
mod storage;
mod voting;

pub use apply::StateMachine;
pub use catchup::{CatchUpError, CatchUpManager};
pub use client::{PeerClient, RpcError};
pub use config::RaftConfig;
pub use dispatch::LogDispatcher;
pub use election::{ElectionContext, ElectionOutcome, VoteAction};
pub use log::{AppendOutcome, Entry, RaftLog};
pub use member::{MemberEvent, RaftError, RaftMember};
pub use message::{
    AppendEntriesRequest, AppendEntryResult, CommitIndexResponse, ElectionRequest,
    ExecuteRequest, ExecuteResponse, HeartbeatRequest, HeartbeatResponse, MatchTermRequest,
    SendSnapshotRequest,
};
pub use snapshot::{Snapshot, SnapshotMeta};
pub use state::{RaftRole, RaftStatus};
pub use storage::{FileStore, HardState, MemoryStore, StableStore};
pub use voting::{VoteResult, VotingEntry, VotingTracker};
