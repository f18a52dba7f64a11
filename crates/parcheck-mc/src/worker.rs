//! The exploration worker.
//!
//! One worker drives one execution substrate through the state space:
//! run every ready rank to its next call, fast-expand the deterministic
//! consequences, hash, then branch over the enumerated communication
//! choices. New states enter the frontier queue; known hashes close the
//! branch on the spot, which is where interleavings collapse.

use crate::config::{current_memory_mb, CheckConfig};
use crate::error::{CheckError, CheckResult};
use crate::graph::{NodeId, StateGraph};
use ahash::RandomState;
use parcheck_model::{
    apply_action, apply_call, enumerate, fast_expand, hash_bytes, BufRef, BufStore, Event, Fault,
    GlobalState, Observed, ProcStatus, ProgramCall, Rank, RequestKind, ResourceId, ResourceManager,
    StreamKind,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use tracing::{debug, info, trace, warn};

/// An execution substrate: whatever produces the next call of a rank.
/// Scripted programs implement this directly; controller-backed substrates
/// implement it by resuming the real process from its snapshot.
pub trait Substrate {
    /// Branch-local program progress, carried alongside every state.
    type Cursor: Clone;

    fn initial_cursor(&self) -> Self::Cursor;

    /// Run `rank`'s user code to its next call. Returns any standard-stream
    /// output emitted on the way, then the decoded call.
    fn next_call(
        &mut self,
        cursor: &mut Self::Cursor,
        rank: Rank,
        bufs: &mut Buffers,
    ) -> CheckResult<(Vec<(StreamKind, Vec<u8>)>, ProgramCall)>;
}

/// Engine-owned payload buffers, plus an allocation log so a discarded
/// branch can hand back exactly the references it took while being built.
#[derive(Default)]
pub struct Buffers {
    mgr: ResourceManager<Vec<u8>>,
    log: Vec<ResourceId>,
}

impl Buffers {
    pub fn manager(&self) -> &ResourceManager<Vec<u8>> {
        &self.mgr
    }

    pub fn manager_mut(&mut self) -> &mut ResourceManager<Vec<u8>> {
        &mut self.mgr
    }

    /// References taken by `alloc` since the last call.
    pub fn take_log(&mut self) -> Vec<ResourceId> {
        std::mem::take(&mut self.log)
    }

    /// Every buffer site in `state`, with multiplicity. Snapshot handles are
    /// managed separately by the substrate and are not listed here.
    pub fn sites(state: &GlobalState) -> Vec<ResourceId> {
        let mut sites = Vec::new();
        let mut push = |b: &BufRef| {
            if !b.id.is_detached() {
                sites.push(b.id);
            }
        };
        for proc in &state.procs {
            for req in &proc.active {
                match &req.kind {
                    RequestKind::Send { payload, .. } => push(payload),
                    RequestKind::Recv {
                        payload: Some(p), ..
                    } => push(p),
                    _ => {}
                }
            }
        }
        for coll in &state.collectives {
            for buf in coll.data.iter().flatten() {
                push(buf);
            }
            for buf in coll.results.iter().flatten() {
                push(buf);
            }
        }
        sites
    }

    /// Bump one reference per site; retained states keep their payloads
    /// alive for as long as the graph holds them.
    pub fn retain_sites(&mut self, sites: &[ResourceId]) {
        for &id in sites {
            self.mgr.inc_ref(id);
        }
    }

    pub fn release_sites(&mut self, sites: &[ResourceId]) {
        for &id in sites {
            self.mgr.dec_ref(id);
        }
    }

    pub fn sweep(&mut self) {
        self.mgr.drain_pending(|_, _| {});
    }
}

impl BufStore for Buffers {
    fn bytes(&self, id: ResourceId) -> &[u8] {
        self.mgr.get(id)
    }

    fn alloc(&mut self, bytes: Vec<u8>) -> BufRef {
        let hash = hash_bytes(&bytes);
        let len = bytes.len();
        let (id, _) = self.mgr.alloc(hash, bytes);
        self.log.push(id);
        BufRef { hash, len, id }
    }
}

/// Run every ready rank to its next call and fast-expand after each.
/// Ready ranks are drained in rank order; this is not a branch point, so any
/// deterministic order gives the same state. A fault aborts the branch, not
/// the run; substrate failures abort the run.
pub fn drain_ready<S: Substrate>(
    substrate: &mut S,
    bufs: &mut Buffers,
    protocol: parcheck_model::SendProtocol,
    state: &mut GlobalState,
    cursor: &mut S::Cursor,
    events: &mut Vec<Event>,
    observed: &mut Observed,
) -> CheckResult<Result<(), Fault>> {
    loop {
        let Some(rank) =
            (0..state.world_size()).find(|&r| state.proc(r).status == ProcStatus::Ready)
        else {
            return Ok(Ok(()));
        };
        let (output, call) = substrate.next_call(cursor, rank, bufs)?;
        observed.commands += 1;
        for (stream, bytes) in output {
            observed.push_output(rank, stream, bytes);
        }
        trace!(rank, ?call, "drained call");
        if let Err(fault) = apply_call(state, rank, call, protocol, events) {
            return Ok(Err(fault));
        }
        if let Err(fault) = fast_expand(state, bufs, events) {
            return Ok(Err(fault));
        }
    }
}

/// A usage or runtime fault hit on one branch, with the trail that led
/// there. The branch itself is abandoned; exploration continues elsewhere.
#[derive(Debug, Clone)]
pub struct FaultRecord {
    pub fault: Fault,
    /// The node the faulting branch left from, if any survived seeding.
    pub node: Option<NodeId>,
    /// Label of the action that faulted, or the drained call.
    pub action: String,
    pub trail: Vec<String>,
}

/// Single-threaded exploration engine over one substrate.
pub struct Worker<S: Substrate> {
    pub substrate: S,
    pub bufs: Buffers,
    pub config: CheckConfig,
    pub graph: StateGraph,
    pub faults: Vec<FaultRecord>,
    /// Output emitted while draining to the initial state. The root has no
    /// incoming arc, so this is reported separately.
    pub seed_observed: Observed,
    /// Events of the seed drain; the deadlock checker folds them into the
    /// root marking.
    pub seed_events: Vec<Event>,
    cursors: HashMap<NodeId, S::Cursor, RandomState>,
    queue: VecDeque<NodeId>,
    expanded: usize,
}

impl<S: Substrate> Worker<S> {
    pub fn new(substrate: S, config: CheckConfig) -> Self {
        let graph = StateGraph::new(config.max_nodes);
        Self {
            substrate,
            bufs: Buffers::default(),
            config,
            graph,
            faults: Vec::new(),
            seed_observed: Observed::default(),
            seed_events: Vec::new(),
            cursors: HashMap::default(),
            queue: VecDeque::new(),
            expanded: 0,
        }
    }

    fn drain(
        &mut self,
        state: &mut GlobalState,
        cursor: &mut S::Cursor,
        events: &mut Vec<Event>,
        observed: &mut Observed,
    ) -> CheckResult<Result<(), Fault>> {
        drain_ready(
            &mut self.substrate,
            &mut self.bufs,
            self.config.protocol,
            state,
            cursor,
            events,
            observed,
        )
    }

    /// Produce and retain the initial node.
    pub fn seed(&mut self) -> CheckResult<()> {
        let mut state = GlobalState::new(self.config.world_size);
        let mut cursor = self.substrate.initial_cursor();
        let mut events = Vec::new();
        let mut observed = Observed::default();
        let _ = self.bufs.take_log();
        let outcome = self.drain(&mut state, &mut cursor, &mut events, &mut observed)?;
        let log = self.bufs.take_log();
        if let Err(fault) = outcome {
            warn!(%fault, "fault while producing the initial state");
            self.bufs.release_sites(&log);
            self.bufs.sweep();
            self.faults.push(FaultRecord {
                fault,
                node: None,
                action: "init".to_string(),
                trail: Vec::new(),
            });
            return Ok(());
        }
        let hash = state.state_hash();
        let sites = Buffers::sites(&state);
        self.bufs.retain_sites(&sites);
        self.bufs.release_sites(&log);
        let (root, _) = self.graph.add_node(hash, state, None)?;
        self.cursors.insert(root, cursor);
        self.queue.push_back(root);
        self.seed_observed = observed;
        self.seed_events = events;
        debug!(%hash, "initial state");
        self.bump_progress();
        Ok(())
    }

    /// Expand one frontier node: enumerate its communication choices and
    /// follow each branch to the next hashed state.
    pub fn expand(&mut self, node: NodeId) -> CheckResult<()> {
        let hash = self
            .graph
            .node(node)
            .hash
            .unwrap_or(parcheck_model::StateHash::from_u64(0));
        let state = self
            .graph
            .state_of(node)
            .cloned()
            .ok_or(CheckError::UnknownState { hash })?;
        let cursor = self
            .cursors
            .get(&node)
            .cloned()
            .ok_or(CheckError::UnknownState { hash })?;
        let actions = enumerate(&state);
        if actions.is_empty() {
            if !state.all_finished() {
                debug!(node = node.0, "stuck leaf");
                self.graph.mark_stuck(node);
            }
            return self.after_expand();
        }
        for action in &actions {
            let mut branch = state.clone();
            let mut bcur = cursor.clone();
            let mut events = Vec::new();
            let mut observed = Observed::default();
            let _ = self.bufs.take_log();
            let outcome = match apply_action(&mut branch, action, &mut self.bufs, &mut events) {
                Err(fault) => Err(fault),
                Ok(()) => self.drain(&mut branch, &mut bcur, &mut events, &mut observed)?,
            };
            let log = self.bufs.take_log();
            if let Err(fault) = outcome {
                self.bufs.release_sites(&log);
                self.record_fault(fault, node, action.to_string());
                continue;
            }
            let bhash = branch.state_hash();
            let sites = Buffers::sites(&branch);
            // Retained sites replace the construction references from the
            // allocation log; a duplicate hands both back.
            self.bufs.retain_sites(&sites);
            self.bufs.release_sites(&log);
            let (to, is_new) = self.graph.add_node(bhash, branch, None)?;
            if is_new {
                self.cursors.insert(to, bcur);
                self.queue.push_back(to);
            } else {
                self.bufs.release_sites(&sites);
            }
            self.graph.add_arc(node, to, action, events, observed);
        }
        self.after_expand()
    }

    fn after_expand(&mut self) -> CheckResult<()> {
        self.expanded += 1;
        self.bump_progress();
        if self.expanded % 64 == 0 {
            self.bufs.sweep();
            if self.config.memory_limit_mb > 0 {
                if let Some(mb) = current_memory_mb() {
                    if mb > self.config.memory_limit_mb {
                        return Err(CheckError::MemoryLimit {
                            nodes: self.graph.node_count(),
                            memory_mb: mb,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn record_fault(&mut self, fault: Fault, node: NodeId, action: String) {
        debug!(%fault, node = node.0, "branch faulted");
        let trail = self.graph.trail(node);
        self.faults.push(FaultRecord {
            fault,
            node: Some(node),
            action,
            trail,
        });
    }

    fn bump_progress(&mut self) {
        if let Some(progress) = &self.config.progress {
            progress
                .nodes
                .store(self.graph.node_count(), Ordering::Relaxed);
            progress
                .arcs
                .store(self.graph.arc_count(), Ordering::Relaxed);
            progress
                .queue_len
                .store(self.queue.len(), Ordering::Relaxed);
            progress.expanded.store(self.expanded, Ordering::Relaxed);
        }
    }

    /// Explore to exhaustion (or a resource ceiling).
    pub fn run(&mut self) -> CheckResult<()> {
        self.seed()?;
        while let Some(node) = self.queue.pop_front() {
            self.expand(node)?;
        }
        self.bufs.sweep();
        info!(
            nodes = self.graph.node_count(),
            arcs = self.graph.arc_count(),
            faults = self.faults.len(),
            "exploration finished"
        );
        Ok(())
    }

    /// Pop the next frontier node, if any. The mesh scheduler drives
    /// expansion itself instead of calling `run`.
    pub fn pop_frontier(&mut self) -> Option<NodeId> {
        self.queue.pop_front()
    }

    pub fn insert_frontier(&mut self, node: NodeId, cursor: S::Cursor) {
        self.cursors.insert(node, cursor);
        self.queue.push_back(node);
    }

    pub fn cursor_of(&self, node: NodeId) -> Option<&S::Cursor> {
        self.cursors.get(&node)
    }
}
