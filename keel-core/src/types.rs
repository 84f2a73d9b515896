//! Strongly-typed identifiers for keel entities.
//!
//! Every identifier wraps a `u64`. Distinct wrapper types keep a `NodeId`
//! from being confused with a `LogIndex` at compile time while costing
//! nothing at runtime.

use std::fmt;

/// Generates a `u64` newtype identifier.
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates an ID from a raw `u64` value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw `u64` value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

define_id!(NodeId, "node", "Unique identifier for a node in the cluster.");
define_id!(GroupId, "group", "Unique identifier for a replication group.");
define_id!(TermId, "term", "Raft term number. Monotonically increasing.");
define_id!(LogIndex, "idx", "Index into the replicated log. Dense, starts at 1.");

impl LogIndex {
    /// Returns the preceding index, saturating at zero.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let node = NodeId::new(7);
        let group = GroupId::new(7);

        // Same raw value, but the types cannot be compared directly.
        assert_eq!(node.get(), group.get());
    }

    #[test]
    fn display_and_debug() {
        let term = TermId::new(3);
        assert_eq!(format!("{term}"), "term-3");
        assert_eq!(format!("{term:?}"), "term(3)");
    }

    #[test]
    fn next_and_prev() {
        let idx = LogIndex::new(5);
        assert_eq!(idx.next().get(), 6);
        assert_eq!(idx.prev().get(), 4);
        assert_eq!(LogIndex::new(0).prev().get(), 0);
    }

    #[test]
    #[should_panic(expected = "ID overflow")]
    fn next_overflow_panics() {
        let _ = NodeId::new(u64::MAX).next();
    }

    #[test]
    fn ordering() {
        assert!(TermId::new(1) < TermId::new(2));
        assert!(LogIndex::new(10) > LogIndex::new(9));
    }
}
