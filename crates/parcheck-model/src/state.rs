//! Per-process and global protocol state.
//!
//! `GlobalState` is the unit of branching. Cloning is cheap: process states
//! sit behind `Arc` and are deep-copied only when a branch actually mutates
//! them (`Arc::make_mut`). Heavy objects (snapshots, payload buffers) are
//! referenced by handle + content hash; their reference counts live in the
//! owning worker's `ResourceManager`s and are bumped whenever a state that
//! references them is retained.

use crate::collective::CollectiveOp;
use crate::comm::{Communicator, Datatype, Group, ReduceOp};
use crate::hash::{hash_value, mix_component, StateHash};
use crate::ids::{CommId, Rank, ReqId, Source, Tag};
use crate::request::{Request, RequestKind, SnapRef};
use crate::resource::ResourceId;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::Arc;

/// What a process is currently doing, from the checker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcStatus {
    /// Runnable: user code executes until the next call.
    Ready,
    /// Exited; the snapshot handle may be dropped.
    Finished,
    WaitAll,
    WaitAny,
    WaitSome,
    Test,
    Probe,
}

/// Target data for an in-progress probe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub source: Source,
    pub tag: Option<Tag>,
    pub comm: CommId,
    /// Blocking probe enumerates promised matches; a non-blocking probe
    /// (flag pointer present) may also report "no message".
    pub blocking: bool,
}

/// One rank's view of the world.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessState {
    pub rank: Rank,
    pub status: ProcStatus,
    pub comms: Vec<Communicator>,
    pub groups: Vec<Group>,
    pub datatypes: Vec<Datatype>,
    pub user_ops: Vec<ReduceOp>,
    /// Requests posted and not yet consumed by a wait/test, in post order.
    pub active: Vec<Request>,
    /// Requests finished and consumed, awaiting nothing. Kept only for
    /// persistent requests and trace reporting.
    pub retired: Vec<ReqId>,
    /// Memory under engine buffer ownership, write-protected while a request
    /// is outstanding: `(addr, len)` pairs.
    pub locked: Vec<(u64, u64)>,
    /// Snapshot of process memory; `None` once the process has exited.
    pub snapshot: Option<SnapRef>,
    /// Requests tested by the current wait/test, in program order.
    pub wait_set: SmallVec<[ReqId; 4]>,
    pub probe: Option<ProbeSpec>,
    /// A blocking probe's promised match: the receive that follows must take
    /// this message.
    pub probe_promise: Option<(Rank, ReqId)>,
    /// Post sequence counter feeding deterministic request ids.
    pub next_req_seq: u32,
    pub finalized: bool,
}

impl ProcessState {
    pub fn new(rank: Rank, world_size: usize) -> Self {
        Self {
            rank,
            status: ProcStatus::Ready,
            comms: vec![Communicator::world(world_size)],
            groups: Vec::new(),
            datatypes: vec![Datatype::BYTE, Datatype::INT, Datatype::DOUBLE],
            user_ops: Vec::new(),
            active: Vec::new(),
            retired: Vec::new(),
            locked: Vec::new(),
            snapshot: None,
            wait_set: SmallVec::new(),
            probe: None,
            probe_promise: None,
            next_req_seq: 0,
            finalized: false,
        }
    }

    pub fn next_req_id(&mut self) -> ReqId {
        let id = ReqId::new(self.rank, self.next_req_seq);
        self.next_req_seq += 1;
        id
    }

    pub fn comm(&self, id: CommId) -> Option<&Communicator> {
        self.comms.iter().find(|c| c.id == id)
    }

    pub fn comm_mut(&mut self, id: CommId) -> Option<&mut Communicator> {
        self.comms.iter_mut().find(|c| c.id == id)
    }

    pub fn request(&self, id: ReqId) -> Option<&Request> {
        self.active.iter().find(|r| r.id == id)
    }

    pub fn request_mut(&mut self, id: ReqId) -> Option<&mut Request> {
        self.active.iter_mut().find(|r| r.id == id)
    }

    /// Remove a consumed request from the active list. Persistent requests
    /// stay, and so does an unmatched send: its message is still in flight
    /// and must remain visible to receivers. Either way the id is recorded
    /// in `retired`.
    pub fn consume_request(&mut self, id: ReqId) {
        if let Some(pos) = self.active.iter().position(|r| r.id == id) {
            let keep = self.active[pos].persistent
                || matches!(
                    self.active[pos].kind,
                    RequestKind::Send { matched: false, .. }
                );
            if !keep {
                self.active.remove(pos);
            }
            self.retired.push(id);
        }
    }

    pub fn is_blocked(&self) -> bool {
        !matches!(self.status, ProcStatus::Ready | ProcStatus::Finished)
    }

    /// Model invariants checked after every transition in debug builds.
    pub fn check_invariants(&self) {
        if self.status == ProcStatus::Finished {
            debug_assert!(
                self.active.iter().all(|r| r.done),
                "finished rank {} still has active requests",
                self.rank
            );
            debug_assert!(self.snapshot.is_none());
        }
        if self.status == ProcStatus::Probe {
            debug_assert!(self.probe.is_some(), "probing rank {} lost target", self.rank);
        }
    }
}

/// The unit of branching: every rank's state plus active collectives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalState {
    pub procs: Vec<Arc<ProcessState>>,
    pub collectives: Vec<CollectiveOp>,
    /// Monotone allocator for communicator ids created by split/dup.
    pub next_comm_id: u32,
}

impl GlobalState {
    pub fn new(world_size: usize) -> Self {
        Self {
            procs: (0..world_size)
                .map(|r| Arc::new(ProcessState::new(r, world_size)))
                .collect(),
            collectives: Vec::new(),
            next_comm_id: 1,
        }
    }

    pub fn world_size(&self) -> usize {
        self.procs.len()
    }

    pub fn proc(&self, rank: Rank) -> &ProcessState {
        &self.procs[rank]
    }

    /// Copy-on-write access: the first mutation on a branch deep-copies the
    /// process state, later ones reuse the copy.
    pub fn proc_mut(&mut self, rank: Rank) -> &mut ProcessState {
        Arc::make_mut(&mut self.procs[rank])
    }

    pub fn alloc_comm_id(&mut self) -> CommId {
        let id = CommId(self.next_comm_id);
        self.next_comm_id += 1;
        id
    }

    pub fn collective(&self, id: crate::ids::CollId) -> Option<&CollectiveOp> {
        self.collectives.iter().find(|c| c.id == id)
    }

    pub fn collective_mut(&mut self, id: crate::ids::CollId) -> Option<&mut CollectiveOp> {
        self.collectives.iter_mut().find(|c| c.id == id)
    }

    pub fn all_finished(&self) -> bool {
        self.procs.iter().all(|p| p.status == ProcStatus::Finished)
    }

    pub fn any_blocked(&self) -> bool {
        self.procs.iter().any(|p| p.is_blocked())
    }

    /// Content hash. XOR of position-mixed per-rank hashes plus the
    /// collective set; handle fields are excluded by construction (`SnapRef`
    /// and `BufRef` hash only their content hash).
    pub fn state_hash(&self) -> StateHash {
        let mut h: u64 = 0;
        for (rank, proc) in self.procs.iter().enumerate() {
            h ^= mix_component(rank, hash_value(proc.as_ref()));
        }
        for coll in &self.collectives {
            // Collectives carry their own key; position-independent.
            h ^= mix_component(usize::MAX, hash_value(coll));
        }
        h ^= mix_component(usize::MAX - 1, self.next_comm_id as u64);
        StateHash::from_u64(h)
    }

    /// Every resource handle this state references, with multiplicity.
    /// The owning worker bumps or drops reference counts from this list when
    /// the state is retained or disposed.
    pub fn resource_refs(&self) -> Vec<ResourceId> {
        let mut refs = Vec::new();
        for proc in &self.procs {
            if let Some(snap) = &proc.snapshot {
                refs.push(snap.id);
            }
            for req in &proc.active {
                match &req.kind {
                    RequestKind::Send { payload, .. } => refs.push(payload.id),
                    RequestKind::Recv { payload, .. } => {
                        if let Some(p) = payload {
                            refs.push(p.id);
                        }
                    }
                    _ => {}
                }
            }
        }
        for coll in &self.collectives {
            for buf in coll.data.iter().flatten() {
                refs.push(buf.id);
            }
        }
        refs
    }

    pub fn check_invariants(&self) {
        for proc in &self.procs {
            proc.check_invariants();
        }
        for coll in &self.collectives {
            debug_assert!(coll.completed_count < coll.expected, "undisposed collective");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use crate::request::{BufRef, SendMode};
    use proptest::prelude::*;

    fn payload(bytes: &[u8], id: u64) -> BufRef {
        BufRef {
            hash: hash_bytes(bytes),
            len: bytes.len(),
            id: ResourceId(id),
        }
    }

    fn post_send(state: &mut GlobalState, rank: Rank, dest: Rank, tag: Tag, bytes: &[u8]) {
        let proc = state.proc_mut(rank);
        let id = proc.next_req_id();
        proc.active.push(Request::new(
            id,
            RequestKind::Send {
                dest,
                tag,
                comm: CommId::WORLD,
                payload: payload(bytes, 0),
                addr: 0,
                mode: SendMode::Standard,
                synchronous: false,
                matched: false,
            },
        ));
    }

    #[test]
    fn test_structurally_equal_states_hash_equal() {
        let mut a = GlobalState::new(2);
        let mut b = GlobalState::new(2);
        post_send(&mut a, 0, 1, 5, b"hello");
        post_send(&mut b, 0, 1, 5, b"hello");
        assert_eq!(a, b);
        assert_eq!(a.state_hash(), b.state_hash());
    }

    #[test]
    fn test_handle_ids_do_not_affect_hash() {
        let mut a = GlobalState::new(2);
        let mut b = GlobalState::new(2);
        post_send(&mut a, 0, 1, 5, b"hello");
        post_send(&mut b, 0, 1, 5, b"hello");
        // Same content behind different worker-local handles.
        if let RequestKind::Send { payload, .. } = &mut b.proc_mut(0).active[0].kind {
            payload.id = ResourceId(41);
        }
        assert_eq!(a.state_hash(), b.state_hash());
    }

    #[test]
    fn test_rank_position_affects_hash() {
        let mut a = GlobalState::new(2);
        let mut b = GlobalState::new(2);
        post_send(&mut a, 0, 1, 5, b"x");
        post_send(&mut b, 1, 0, 5, b"x");
        assert_ne!(a.state_hash(), b.state_hash());
    }

    #[test]
    fn test_cow_isolation() {
        let base = GlobalState::new(2);
        let mut branch = base.clone();
        branch.proc_mut(0).finalized = true;
        assert!(!base.proc(0).finalized);
        assert!(branch.proc(0).finalized);
        // Unmodified rank still shares the allocation.
        assert!(Arc::ptr_eq(&base.procs[1], &branch.procs[1]));
    }

    #[test]
    fn test_resource_refs_collects_payloads() {
        let mut state = GlobalState::new(2);
        post_send(&mut state, 0, 1, 1, b"a");
        state.proc_mut(1).snapshot = Some(SnapRef {
            hash: hash_bytes(b"mem"),
            id: ResourceId(9),
        });
        let refs = state.resource_refs();
        assert_eq!(refs.len(), 2);
        assert!(refs.contains(&ResourceId(9)));
    }

    proptest! {
        #[test]
        fn prop_hash_deterministic(tag in 0i32..100, dest in 0usize..2, bytes in proptest::collection::vec(any::<u8>(), 0..16)) {
            let mut a = GlobalState::new(3);
            let mut b = GlobalState::new(3);
            post_send(&mut a, 2, dest, tag, &bytes);
            post_send(&mut b, 2, dest, tag, &bytes);
            prop_assert_eq!(a.state_hash(), b.state_hash());
        }
    }
}
