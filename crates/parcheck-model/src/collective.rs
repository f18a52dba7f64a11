//! Multi-rank collective operations.

use crate::comm::ReduceOp;
use crate::fault::Fault;
use crate::ids::{CollId, CommId, Rank};
use crate::request::BufRef;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of collective kinds the engine models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollKind {
    Barrier,
    Bcast { root: Rank },
    Gather { root: Rank },
    Gatherv { root: Rank },
    Scatter { root: Rank },
    Scatterv { root: Rank },
    Reduce { root: Rank, op: ReduceOp },
    Allreduce { op: ReduceOp },
    CommSplit,
    CommDup,
}

impl fmt::Display for CollKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollKind::Barrier => write!(f, "barrier"),
            CollKind::Bcast { root } => write!(f, "bcast(root={})", root),
            CollKind::Gather { root } => write!(f, "gather(root={})", root),
            CollKind::Gatherv { root } => write!(f, "gatherv(root={})", root),
            CollKind::Scatter { root } => write!(f, "scatter(root={})", root),
            CollKind::Scatterv { root } => write!(f, "scatterv(root={})", root),
            CollKind::Reduce { root, .. } => write!(f, "reduce(root={})", root),
            CollKind::Allreduce { .. } => write!(f, "allreduce"),
            CollKind::CommSplit => write!(f, "comm_split"),
            CollKind::CommDup => write!(f, "comm_dup"),
        }
    }
}

/// Tracks one multi-rank call keyed by `(comm, seq)`. Created when the first
/// rank enters, completable once all ranks have entered, disposed when the
/// last participant completes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectiveOp {
    pub id: CollId,
    pub comm: CommId,
    pub seq: u32,
    pub kind: CollKind,
    pub blocking: bool,
    pub expected: usize,
    /// Entered flags indexed by local rank.
    pub entered: Vec<bool>,
    pub entered_count: usize,
    pub completed_count: usize,
    /// Per-local-rank contributed data (gather/reduce inputs, scatter slices).
    pub data: Vec<Option<BufRef>>,
    /// Per-local-rank `(color, key)` for comm-split.
    pub split_keys: Vec<Option<(i64, i64)>>,
    /// Per-local-rank result payloads, computed once all ranks entered.
    pub results: Vec<Option<BufRef>>,
    /// Per-local-rank communicators produced by split/dup.
    pub new_comms: Vec<Option<crate::comm::Communicator>>,
    /// Results computed and participant requests marked finished.
    pub resolved: bool,
}

impl CollectiveOp {
    pub fn new(id: CollId, comm: CommId, seq: u32, kind: CollKind, blocking: bool, expected: usize) -> Self {
        Self {
            id,
            comm,
            seq,
            kind,
            blocking,
            expected,
            entered: vec![false; expected],
            entered_count: 0,
            completed_count: 0,
            data: vec![None; expected],
            split_keys: vec![None; expected],
            results: vec![None; expected],
            new_comms: vec![None; expected],
            resolved: false,
        }
    }

    /// Attach a participant. Kind or blocking-ness disagreement with the
    /// already-present operation is a usage error, never a branch.
    pub fn join(
        &mut self,
        local: usize,
        world_rank: Rank,
        kind: CollKind,
        blocking: bool,
        data: Option<BufRef>,
        split_key: Option<(i64, i64)>,
    ) -> Result<(), Fault> {
        if kind != self.kind || blocking != self.blocking {
            return Err(Fault::CollectiveMismatch {
                rank: world_rank,
                expected: self.kind.to_string(),
                found: kind.to_string(),
            });
        }
        if self.entered[local] {
            return Err(Fault::CollectiveReentry {
                rank: world_rank,
                op: self.kind.to_string(),
            });
        }
        self.entered[local] = true;
        self.entered_count += 1;
        self.data[local] = data;
        self.split_keys[local] = split_key;
        Ok(())
    }

    /// All ranks have entered; every participant's collective request may
    /// finish.
    pub fn ready(&self) -> bool {
        self.entered_count == self.expected
    }

    /// Record one rank's completion call. Returns true when this was the
    /// last participant and the operation must be disposed.
    pub fn complete_one(&mut self) -> bool {
        self.completed_count += 1;
        debug_assert!(self.completed_count <= self.expected);
        self.completed_count == self.expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn barrier(expected: usize) -> CollectiveOp {
        let id = CollId {
            comm: CommId::WORLD,
            seq: 0,
        };
        CollectiveOp::new(id, CommId::WORLD, 0, CollKind::Barrier, true, expected)
    }

    #[test]
    fn test_join_until_ready() {
        let mut op = barrier(3);
        for local in 0..3 {
            assert!(!op.ready());
            op.join(local, local, CollKind::Barrier, true, None, None)
                .unwrap();
        }
        assert!(op.ready());
    }

    #[test]
    fn test_kind_mismatch_is_usage_fault() {
        let mut op = barrier(2);
        op.join(0, 0, CollKind::Barrier, true, None, None).unwrap();
        let err = op.join(1, 1, CollKind::CommDup, true, None, None);
        assert!(matches!(err, Err(Fault::CollectiveMismatch { .. })));
    }

    #[test]
    fn test_blocking_mismatch_is_usage_fault() {
        let mut op = barrier(2);
        let err = op.join(0, 0, CollKind::Barrier, false, None, None);
        assert!(matches!(err, Err(Fault::CollectiveMismatch { .. })));
    }

    #[test]
    fn test_disposed_after_last_complete() {
        let mut op = barrier(2);
        op.join(0, 0, CollKind::Barrier, true, None, None).unwrap();
        op.join(1, 1, CollKind::Barrier, true, None, None).unwrap();
        assert!(!op.complete_one());
        assert!(op.complete_one());
    }
}
