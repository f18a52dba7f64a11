//! Identifier newtypes shared across the engine.
//!
//! Request and collective ids are derived from per-process progress, never
//! from a global counter: two interleavings that reach the same program
//! configuration must produce identical ids, or state deduplication by
//! content hash would silently stop working.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A process's index within the world communicator.
pub type Rank = usize;

/// Message tag. Negative tags are reserved for internal use.
pub type Tag = i32;

/// Communicator identifier. Id 0 is the world communicator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct CommId(pub u32);

impl CommId {
    pub const WORLD: CommId = CommId(0);
}

impl fmt::Display for CommId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "comm{}", self.0)
    }
}

/// Request identifier: the posting rank plus that rank's post sequence
/// number. Deterministic across interleavings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReqId {
    pub rank: u32,
    pub seq: u32,
}

impl ReqId {
    pub fn new(rank: Rank, seq: u32) -> Self {
        Self {
            rank: rank as u32,
            seq,
        }
    }
}

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req{}.{}", self.rank, self.seq)
    }
}

/// Collective-operation identifier: the communicator plus its per-communicator
/// collective round. This is exactly the key collectives are matched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollId {
    pub comm: CommId,
    pub seq: u32,
}

impl fmt::Display for CollId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "coll{}.{}", self.comm.0, self.seq)
    }
}

/// Source designator for a receive or probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    /// A fixed peer rank.
    Rank(Rank),
    /// Wildcard: any sender is eligible.
    Any,
    /// The null process: the operation completes immediately with no data.
    Null,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Rank(r) => write!(f, "{}", r),
            Source::Any => write!(f, "any"),
            Source::Null => write!(f, "null"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_req_id_ordering() {
        assert!(ReqId::new(0, 0) < ReqId::new(0, 1));
        assert!(ReqId::new(0, 5) < ReqId::new(1, 0));
    }

    #[test]
    fn test_display() {
        assert_eq!(CommId::WORLD.to_string(), "comm0");
        assert_eq!(ReqId::new(1, 7).to_string(), "req1.7");
        assert_eq!(
            CollId {
                comm: CommId(2),
                seq: 3
            }
            .to_string(),
            "coll2.3"
        );
        assert_eq!(Source::Any.to_string(), "any");
    }
}
