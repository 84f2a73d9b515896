//! Keel core - shared types for the consensus replication engine.
//!
//! This crate carries the strongly-typed identifiers, the shared error
//! taxonomy, and the protocol limits used by every other keel crate. It is
//! deliberately dependency-free so that the consensus core can be tested
//! without pulling in the runtime stack.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]

mod error;
pub mod limits;
mod types;

pub use error::{Error, NetworkErrorKind, Result, StorageErrorKind};
pub use types::{GroupId, LogIndex, NodeId, TermId};
