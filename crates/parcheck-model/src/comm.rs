//! Communicators, groups, datatypes and reduction operators.

use crate::ids::{CommId, Rank};
use serde::{Deserialize, Serialize};

/// An ordered set of world ranks. Position in the list is the local rank.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Group {
    pub ranks: Vec<Rank>,
}

impl Group {
    pub fn world(size: usize) -> Self {
        Self {
            ranks: (0..size).collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    /// Local rank of a world rank within this group, if a member.
    pub fn local_rank(&self, world: Rank) -> Option<usize> {
        self.ranks.iter().position(|&r| r == world)
    }

    pub fn world_rank(&self, local: usize) -> Option<Rank> {
        self.ranks.get(local).copied()
    }
}

/// A named group of ranks that may exchange messages and collectives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Communicator {
    pub id: CommId,
    pub group: Group,
    /// Per-communicator collective sequence counter; collectives are keyed
    /// by `(id, seq)` so independent collective rounds never collide.
    pub coll_seq: u32,
    /// The world and self communicators are permanent and may not be freed.
    pub permanent: bool,
}

impl Communicator {
    pub fn world(size: usize) -> Self {
        Self {
            id: CommId::WORLD,
            group: Group::world(size),
            coll_seq: 0,
            permanent: true,
        }
    }

    pub fn size(&self) -> usize {
        self.group.size()
    }

    pub fn contains(&self, world: Rank) -> bool {
        self.group.local_rank(world).is_some()
    }
}

/// A datatype, reduced to its extent in bytes. The engine never interprets
/// element contents beyond moving `count * extent` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Datatype {
    pub id: u32,
    pub extent: usize,
}

impl Datatype {
    pub const BYTE: Datatype = Datatype { id: 0, extent: 1 };
    pub const INT: Datatype = Datatype { id: 1, extent: 4 };
    pub const DOUBLE: Datatype = Datatype { id: 2, extent: 8 };
}

/// Reduction operator for reduce/allreduce collectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
    Land,
    Lor,
    /// User-defined operator; applied by re-running the user function on the
    /// target, so the engine only tracks its identity.
    User(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_group_ranks() {
        let g = Group::world(4);
        assert_eq!(g.size(), 4);
        assert_eq!(g.local_rank(2), Some(2));
        assert_eq!(g.world_rank(3), Some(3));
    }

    #[test]
    fn test_subgroup_local_ranks() {
        let g = Group {
            ranks: vec![3, 1, 5],
        };
        assert_eq!(g.local_rank(1), Some(1));
        assert_eq!(g.local_rank(5), Some(2));
        assert_eq!(g.local_rank(0), None);
        assert_eq!(g.world_rank(0), Some(3));
    }

    #[test]
    fn test_world_comm_permanent() {
        let c = Communicator::world(2);
        assert!(c.permanent);
        assert!(c.contains(0));
        assert!(!c.contains(2));
    }
}
