//! Distributed exploration: one coordinator, N workers.
//!
//! The coordinator owns the graph and all bookkeeping; workers own their
//! substrates and explore one branch per `START`. States travel as packed
//! transfer blobs routed through the coordinator, so a worker can pick up
//! any pending branch, not just ones it produced (`PUSH`/`SAVE` on the way
//! out, `PULL` when a worker lost a state it is asked about). A state whose
//! branches are all explored is `FREE`d from every worker holding it.
//!
//! Workers run over in-process channels or TCP; the protocol is identical.

use crate::config::{current_memory_mb, CheckConfig};
use crate::error::{CheckError, CheckResult};
use crate::graph::{NodeId, StateGraph};
use crate::report::{assemble, report_worker, CheckReport};
use crate::transfer::TransferState;
use crate::wire::{Channel, ChannelTx, MeshMsg};
use crate::worker::{drain_ready, Buffers, FaultRecord, Substrate, Worker};
use ahash::RandomState;
use parcheck_model::{
    apply_action, enumerate, Event, Fault, GlobalState, Observed, StateHash,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use tracing::{debug, info, warn};

/// `action_index` of the start message that asks for the initial state.
const INIT_ACTION: usize = usize::MAX;

fn init_hash() -> StateHash {
    StateHash::from_u64(0)
}

/// Binary frames riding behind `SAVE` lines.
#[derive(Serialize, Deserialize)]
enum Payload<C> {
    /// Coordinator -> worker: retain this state under its hash.
    Saved { transfer: TransferState, cursor: C },
    /// Worker -> coordinator: outcome of one `START`.
    Branch {
        parent: StateHash,
        action_index: usize,
        events: Vec<Event>,
        observed: Observed,
        result: BranchResult,
    },
}

#[derive(Serialize, Deserialize)]
enum BranchResult {
    /// A state this worker had not seen before. `saved` is a nested
    /// `Payload::Saved` frame the coordinator can forward verbatim.
    New {
        hash: StateHash,
        n_actions: usize,
        saved: Vec<u8>,
    },
    /// Converged on a state this worker already holds.
    Known { hash: StateHash },
    Faulted { fault: Fault },
}

fn encode<C: Serialize>(payload: &Payload<C>) -> CheckResult<Vec<u8>> {
    Ok(postcard::to_stdvec(payload)?)
}

fn decode<C: DeserializeOwned>(bytes: &[u8]) -> CheckResult<Payload<C>> {
    Ok(postcard::from_bytes(bytes)?)
}

/// Serve one worker over `chan` until `QUIT`. Blocks the calling thread.
pub fn serve<S>(
    mut substrate: S,
    config: &CheckConfig,
    me: usize,
    chan: &mut dyn Channel,
) -> CheckResult<()>
where
    S: Substrate,
    S::Cursor: Serialize + DeserializeOwned,
{
    let mut bufs = Buffers::default();
    let mut cache: HashMap<StateHash, (GlobalState, S::Cursor), RandomState> = HashMap::default();
    info!(worker = me, "mesh worker up");
    loop {
        match chan.recv()? {
            MeshMsg::Save => {
                let blob = expect_blob(chan)?;
                save_into_cache::<S>(&mut bufs, &mut cache, &blob)?;
            }
            MeshMsg::Start { hash, action_index } => {
                if action_index != INIT_ACTION && !cache.contains_key(&hash) {
                    // Lost to an earlier FREE; ask again.
                    chan.send(MeshMsg::Pull { worker: me, hash })?;
                    loop {
                        match chan.recv()? {
                            MeshMsg::Push { .. } => {}
                            MeshMsg::Save => {
                                let blob = expect_blob(chan)?;
                                save_into_cache::<S>(&mut bufs, &mut cache, &blob)?;
                                break;
                            }
                            other => {
                                return Err(CheckError::Wire {
                                    line: other.to_string(),
                                })
                            }
                        }
                    }
                }
                let payload = if action_index == INIT_ACTION {
                    produce_init(&mut substrate, config, &mut bufs, &mut cache)?
                } else {
                    explore_branch(
                        &mut substrate,
                        config,
                        &mut bufs,
                        &mut cache,
                        hash,
                        action_index,
                    )?
                };
                if let Payload::Branch {
                    result: BranchResult::New { hash, n_actions, .. },
                    ..
                } = &payload
                {
                    chan.send(MeshMsg::State {
                        hash: *hash,
                        n_actions: *n_actions,
                    })?;
                }
                let bytes = encode(&payload)?;
                chan.send(MeshMsg::Save)?;
                chan.send(MeshMsg::Blob(bytes))?;
            }
            MeshMsg::Free { hash } => {
                if let Some((state, _)) = cache.remove(&hash) {
                    bufs.release_sites(&Buffers::sites(&state));
                    bufs.sweep();
                }
            }
            // Advisory: the named state is on its way to us.
            MeshMsg::Push { .. } => {}
            // Peer channels are unused in the star topology.
            MeshMsg::Listen { .. } | MeshMsg::Connect { .. } => {}
            MeshMsg::FinalCheck => {
                bufs.sweep();
                bufs.manager().assert_consistent();
                chan.send(MeshMsg::FinalCheck)?;
            }
            MeshMsg::Quit => {
                debug!(worker = me, "mesh worker down");
                return Ok(());
            }
            other => {
                return Err(CheckError::Wire {
                    line: other.to_string(),
                })
            }
        }
    }
}

fn expect_blob(chan: &mut dyn Channel) -> CheckResult<Vec<u8>> {
    match chan.recv()? {
        MeshMsg::Blob(bytes) => Ok(bytes),
        other => Err(CheckError::Wire {
            line: other.to_string(),
        }),
    }
}

fn save_into_cache<S>(
    bufs: &mut Buffers,
    cache: &mut HashMap<StateHash, (GlobalState, S::Cursor), RandomState>,
    blob: &[u8],
) -> CheckResult<()>
where
    S: Substrate,
    S::Cursor: Serialize + DeserializeOwned,
{
    let Payload::Saved { transfer, cursor } = decode::<S::Cursor>(blob)? else {
        return Err(CheckError::Wire {
            line: "SAVE carried a non-state payload".to_string(),
        });
    };
    let hash = transfer.state_hash();
    // Attach takes one reference per referencing site, which is exactly the
    // retention the cache needs.
    let state = transfer.attach(bufs.manager_mut());
    cache.insert(hash, (state, cursor));
    Ok(())
}

fn pack_new<S>(
    bufs: &mut Buffers,
    cache: &mut HashMap<StateHash, (GlobalState, S::Cursor), RandomState>,
    state: GlobalState,
    cursor: S::Cursor,
    action_index: Option<usize>,
) -> CheckResult<BranchResult>
where
    S: Substrate,
    S::Cursor: Serialize + DeserializeOwned + Clone,
{
    let hash = state.state_hash();
    let n_actions = enumerate(&state).len();
    let transfer = TransferState::pack(state.clone(), action_index, bufs.manager());
    let saved = encode(&Payload::Saved {
        transfer,
        cursor: cursor.clone(),
    })?;
    cache.insert(hash, (state, cursor));
    Ok(BranchResult::New {
        hash,
        n_actions,
        saved,
    })
}

fn produce_init<S>(
    substrate: &mut S,
    config: &CheckConfig,
    bufs: &mut Buffers,
    cache: &mut HashMap<StateHash, (GlobalState, S::Cursor), RandomState>,
) -> CheckResult<Payload<S::Cursor>>
where
    S: Substrate,
    S::Cursor: Serialize + DeserializeOwned + Clone,
{
    let mut state = GlobalState::new(config.world_size);
    let mut cursor = substrate.initial_cursor();
    let mut events = Vec::new();
    let mut observed = Observed::default();
    let _ = bufs.take_log();
    let outcome = drain_ready(
        substrate,
        bufs,
        config.protocol,
        &mut state,
        &mut cursor,
        &mut events,
        &mut observed,
    )?;
    let log = bufs.take_log();
    let result = match outcome {
        Err(fault) => {
            bufs.release_sites(&log);
            bufs.sweep();
            BranchResult::Faulted { fault }
        }
        Ok(()) => {
            let sites = Buffers::sites(&state);
            bufs.retain_sites(&sites);
            bufs.release_sites(&log);
            pack_new::<S>(bufs, cache, state, cursor, None)?
        }
    };
    Ok(Payload::Branch {
        parent: init_hash(),
        action_index: INIT_ACTION,
        events,
        observed,
        result,
    })
}

fn explore_branch<S>(
    substrate: &mut S,
    config: &CheckConfig,
    bufs: &mut Buffers,
    cache: &mut HashMap<StateHash, (GlobalState, S::Cursor), RandomState>,
    parent: StateHash,
    action_index: usize,
) -> CheckResult<Payload<S::Cursor>>
where
    S: Substrate,
    S::Cursor: Serialize + DeserializeOwned + Clone,
{
    let (state, cursor) = cache
        .get(&parent)
        .ok_or(CheckError::UnknownState { hash: parent })?;
    let mut branch = state.clone();
    let mut bcur = cursor.clone();
    let actions = enumerate(&branch);
    let Some(action) = actions.get(action_index) else {
        return Err(CheckError::Wire {
            line: format!("START {parent} {action_index} out of range"),
        });
    };
    let mut events = Vec::new();
    let mut observed = Observed::default();
    let _ = bufs.take_log();
    let outcome = match apply_action(&mut branch, action, bufs, &mut events) {
        Err(fault) => Err(fault),
        Ok(()) => drain_ready(
            substrate,
            bufs,
            config.protocol,
            &mut branch,
            &mut bcur,
            &mut events,
            &mut observed,
        )?,
    };
    let log = bufs.take_log();
    let result = match outcome {
        Err(fault) => {
            bufs.release_sites(&log);
            bufs.sweep();
            BranchResult::Faulted { fault }
        }
        Ok(()) => {
            let hash = branch.state_hash();
            if cache.contains_key(&hash) {
                bufs.release_sites(&log);
                BranchResult::Known { hash }
            } else {
                let sites = Buffers::sites(&branch);
                bufs.retain_sites(&sites);
                bufs.release_sites(&log);
                pack_new::<S>(bufs, cache, branch, bcur, Some(action_index))?
            }
        }
    };
    Ok(Payload::Branch {
        parent,
        action_index,
        events,
        observed,
        result,
    })
}

struct Coordinator<C> {
    config: CheckConfig,
    txs: Vec<Box<dyn ChannelTx>>,
    rx: mpsc::Receiver<(usize, CheckResult<MeshMsg>)>,
    graph: StateGraph,
    bufs: Buffers,
    faults: Vec<FaultRecord>,
    seed_events: Vec<Event>,
    seed_observed: Observed,
    /// Forwardable `Saved` frames, dropped once the state is fully expanded.
    saved: HashMap<StateHash, Vec<u8>, RandomState>,
    holders: HashMap<StateHash, HashSet<usize, RandomState>, RandomState>,
    /// Branch jobs not yet completed, per parent state.
    outstanding: HashMap<StateHash, usize, RandomState>,
    pending: VecDeque<(StateHash, usize)>,
    idle: Vec<usize>,
    busy: usize,
    handled: usize,
    _cursor: std::marker::PhantomData<C>,
}

impl<C: Serialize + DeserializeOwned> Coordinator<C> {
    fn new(
        config: CheckConfig,
        txs: Vec<Box<dyn ChannelTx>>,
        rx: mpsc::Receiver<(usize, CheckResult<MeshMsg>)>,
    ) -> Self {
        let graph = StateGraph::new(config.max_nodes);
        let n = txs.len();
        Self {
            config,
            txs,
            rx,
            graph,
            bufs: Buffers::default(),
            faults: Vec::new(),
            seed_events: Vec::new(),
            seed_observed: Observed::default(),
            saved: HashMap::default(),
            holders: HashMap::default(),
            outstanding: HashMap::default(),
            pending: VecDeque::new(),
            // Everyone but worker 0, which seeds.
            idle: (1..n).collect(),
            busy: 0,
            handled: 0,
            _cursor: std::marker::PhantomData,
        }
    }

    fn dispatch(&mut self, worker: usize, hash: StateHash, action_index: usize) -> CheckResult<()> {
        let has_it = self
            .holders
            .get(&hash)
            .map(|h| h.contains(&worker))
            .unwrap_or(false);
        if !has_it {
            let blob = self
                .saved
                .get(&hash)
                .cloned()
                .ok_or(CheckError::UnknownState { hash })?;
            self.txs[worker].send(MeshMsg::Push { worker, hash })?;
            self.txs[worker].send(MeshMsg::Save)?;
            self.txs[worker].send(MeshMsg::Blob(blob))?;
            self.holders.entry(hash).or_default().insert(worker);
        }
        self.txs[worker].send(MeshMsg::Start { hash, action_index })?;
        self.busy += 1;
        Ok(())
    }

    /// A state was absorbed into the graph: queue its branches, or mark it
    /// stuck or final if it has none.
    fn absorb_new(&mut self, hash: StateHash, node: NodeId, n_actions: usize) {
        if n_actions == 0 {
            let finished = self
                .graph
                .state_of(node)
                .map(|s| s.all_finished())
                .unwrap_or(false);
            if !finished {
                self.graph.mark_stuck(node);
            }
            self.outstanding.insert(hash, 0);
        } else {
            self.outstanding.insert(hash, n_actions);
            for i in 0..n_actions {
                self.pending.push_back((hash, i));
            }
        }
        self.maybe_free(hash);
    }

    /// Free the state from every worker once nothing references it anymore.
    fn maybe_free(&mut self, hash: StateHash) {
        if self.outstanding.get(&hash).copied() != Some(0) {
            return;
        }
        self.outstanding.remove(&hash);
        self.saved.remove(&hash);
        if let Some(holders) = self.holders.remove(&hash) {
            for worker in holders {
                // A closed worker is reported through the receive side.
                let _ = self.txs[worker].send(MeshMsg::Free { hash });
            }
        }
    }

    fn branch_done(&mut self, parent: StateHash) {
        if let Some(count) = self.outstanding.get_mut(&parent) {
            *count = count.saturating_sub(1);
        }
        self.maybe_free(parent);
    }

    fn handle_branch(&mut self, worker: usize, blob: &[u8]) -> CheckResult<()> {
        let payload: Payload<C> = decode(blob)?;
        let Payload::Branch {
            parent,
            action_index,
            events,
            observed,
            result,
        } = payload
        else {
            return Err(CheckError::Wire {
                line: "worker sent a SAVED frame".to_string(),
            });
        };

        if action_index == INIT_ACTION {
            self.seed_events = events;
            self.seed_observed = observed;
            match result {
                BranchResult::Faulted { fault } => {
                    warn!(%fault, "fault while producing the initial state");
                    self.faults.push(FaultRecord {
                        fault,
                        node: None,
                        action: "init".to_string(),
                        trail: Vec::new(),
                    });
                }
                BranchResult::New {
                    hash,
                    n_actions,
                    saved,
                } => {
                    let node = self.adopt_state(worker, hash, &saved)?;
                    self.absorb_new(hash, node, n_actions);
                }
                BranchResult::Known { hash } => {
                    return Err(CheckError::UnknownState { hash });
                }
            }
            return Ok(());
        }

        let parent_node = self
            .graph
            .lookup(parent)
            .ok_or(CheckError::UnknownState { hash: parent })?;
        // Re-enumerate the parent for the arc label; the enumeration is a
        // pure function of the state, so every worker sees the same list.
        let action = {
            let state = self
                .graph
                .state_of(parent_node)
                .ok_or(CheckError::UnknownState { hash: parent })?;
            enumerate(state)
                .into_iter()
                .nth(action_index)
                .ok_or(CheckError::Wire {
                    line: format!("branch report {parent} {action_index} out of range"),
                })?
        };
        match result {
            BranchResult::Faulted { fault } => {
                debug!(%fault, "branch faulted");
                self.faults.push(FaultRecord {
                    fault,
                    node: Some(parent_node),
                    action: action.to_string(),
                    trail: self.graph.trail(parent_node),
                });
            }
            BranchResult::Known { hash } => {
                let to = self
                    .graph
                    .lookup(hash)
                    .ok_or(CheckError::UnknownState { hash })?;
                self.graph.add_arc(parent_node, to, &action, events, observed);
            }
            BranchResult::New {
                hash,
                n_actions,
                saved,
            } => {
                let known_before = self.graph.lookup(hash).is_some();
                let to = self.adopt_state(worker, hash, &saved)?;
                self.graph.add_arc(parent_node, to, &action, events, observed);
                if !known_before {
                    self.absorb_new(hash, to, n_actions);
                }
            }
        }
        self.branch_done(parent);
        Ok(())
    }

    /// Decode a worker's state frame into the coordinator's own graph and
    /// keep the frame for forwarding.
    fn adopt_state(&mut self, worker: usize, hash: StateHash, saved: &[u8]) -> CheckResult<NodeId> {
        let node = match self.graph.lookup(hash) {
            Some(node) => node,
            None => {
                let payload: Payload<C> = decode(saved)?;
                let Payload::Saved { transfer, .. } = payload else {
                    return Err(CheckError::Wire {
                        line: "nested frame is not a state".to_string(),
                    });
                };
                let state = transfer.attach(self.bufs.manager_mut());
                let (node, _) = self.graph.add_node(hash, state, None)?;
                self.saved.insert(hash, saved.to_vec());
                node
            }
        };
        self.holders.entry(hash).or_default().insert(worker);
        Ok(node)
    }

    fn bump_progress(&self) {
        if let Some(progress) = &self.config.progress {
            progress
                .nodes
                .store(self.graph.node_count(), Ordering::Relaxed);
            progress
                .arcs
                .store(self.graph.arc_count(), Ordering::Relaxed);
            progress
                .queue_len
                .store(self.pending.len(), Ordering::Relaxed);
            progress.expanded.store(self.handled, Ordering::Relaxed);
        }
    }

    fn run_loop(&mut self) -> CheckResult<()> {
        self.txs[0].send(MeshMsg::Start {
            hash: init_hash(),
            action_index: INIT_ACTION,
        })?;
        self.busy = 1;
        loop {
            while !self.idle.is_empty() && !self.pending.is_empty() {
                let Some(worker) = self.idle.pop() else { break };
                let Some((hash, idx)) = self.pending.pop_front() else {
                    break;
                };
                self.dispatch(worker, hash, idx)?;
            }
            if self.busy == 0 && self.pending.is_empty() {
                return Ok(());
            }
            let (worker, msg) = self.rx.recv().map_err(|_| CheckError::ChannelClosed)?;
            match msg? {
                // Advisory announcement ahead of the blob.
                MeshMsg::State { .. } | MeshMsg::Save => {}
                MeshMsg::Blob(bytes) => {
                    self.busy -= 1;
                    self.idle.push(worker);
                    self.handle_branch(worker, &bytes)?;
                    self.handled += 1;
                    self.bump_progress();
                    if self.handled % 64 == 0 && self.config.memory_limit_mb > 0 {
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
                MeshMsg::Pull { worker, hash } => {
                    let blob = self
                        .saved
                        .get(&hash)
                        .cloned()
                        .ok_or(CheckError::UnknownState { hash })?;
                    self.txs[worker].send(MeshMsg::Push { worker, hash })?;
                    self.txs[worker].send(MeshMsg::Save)?;
                    self.txs[worker].send(MeshMsg::Blob(blob))?;
                    self.holders.entry(hash).or_default().insert(worker);
                }
                other => {
                    return Err(CheckError::Wire {
                        line: other.to_string(),
                    })
                }
            }
        }
    }

    /// Flush workers and shut the mesh down; best effort once aborting.
    fn shutdown(&mut self, clean: bool) {
        if clean {
            for tx in &mut self.txs {
                let _ = tx.send(MeshMsg::FinalCheck);
            }
            let mut acks = 0;
            while acks < self.txs.len() {
                match self.rx.recv() {
                    Ok((_, Ok(MeshMsg::FinalCheck))) => acks += 1,
                    Ok((_, Ok(_))) => {}
                    Ok((_, Err(_))) | Err(_) => break,
                }
            }
        }
        for tx in &mut self.txs {
            let _ = tx.send(MeshMsg::Quit);
        }
    }
}

/// Run a mesh check over pre-connected coordinator-side channels.
pub fn coordinate<C>(
    channels: Vec<Box<dyn Channel>>,
    config: &CheckConfig,
) -> CheckResult<CheckReport>
where
    C: Serialize + DeserializeOwned,
{
    let (agg_tx, agg_rx) = mpsc::channel();
    let mut txs = Vec::new();
    let mut readers = Vec::new();
    for (idx, chan) in channels.into_iter().enumerate() {
        let (tx, mut rx) = chan.split();
        txs.push(tx);
        let agg = agg_tx.clone();
        readers.push(thread::spawn(move || loop {
            match rx.recv() {
                Ok(msg) => {
                    if agg.send((idx, Ok(msg))).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = agg.send((idx, Err(err)));
                    break;
                }
            }
        }));
    }
    drop(agg_tx);

    let mut coordinator: Coordinator<C> = Coordinator::new(config.clone(), txs, agg_rx);
    let outcome = coordinator.run_loop();
    let abort = match outcome {
        Ok(()) => {
            coordinator.shutdown(true);
            None
        }
        Err(err @ (CheckError::NodeLimit { .. } | CheckError::MemoryLimit { .. })) => {
            coordinator.shutdown(false);
            Some(err)
        }
        Err(err) => {
            coordinator.shutdown(false);
            for reader in readers {
                let _ = reader.join();
            }
            return Err(err);
        }
    };
    let report = assemble(
        &coordinator.graph,
        &coordinator.faults,
        &coordinator.seed_events,
        &coordinator.seed_observed,
        config,
        abort.as_ref(),
    );
    drop(coordinator);
    for reader in readers {
        let _ = reader.join();
    }
    Ok(report)
}

/// Check `substrate`, spawning in-process workers when the configuration
/// asks for more than one.
pub fn check<S>(substrate: S, config: CheckConfig) -> CheckResult<CheckReport>
where
    S: Substrate + Clone + Send + 'static,
    S::Cursor: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    if config.workers <= 1 {
        let mut worker = Worker::new(substrate, config);
        return match worker.run() {
            Ok(()) => Ok(report_worker(&worker, None)),
            Err(err @ (CheckError::NodeLimit { .. } | CheckError::MemoryLimit { .. })) => {
                Ok(report_worker(&worker, Some(&err)))
            }
            Err(err) => Err(err),
        };
    }
    let mut channels: Vec<Box<dyn Channel>> = Vec::new();
    let mut joins = Vec::new();
    for i in 0..config.workers {
        let (coord_end, mut worker_end) = crate::wire::mpsc_pair();
        let sub = substrate.clone();
        let cfg = config.clone();
        joins.push(thread::spawn(move || serve(sub, &cfg, i, &mut worker_end)));
        channels.push(Box::new(coord_end));
    }
    let result = coordinate::<S::Cursor>(channels, &config);
    for (i, join) in joins.into_iter().enumerate() {
        match join.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(worker = i, %err, "worker exited with error"),
            Err(_) => {
                if result.is_ok() {
                    return Err(CheckError::WorkerPanic { worker: i });
                }
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PathReduce;
    use crate::report::Verdict;
    use crate::sim::script::*;
    use crate::sim::SimProgram;
    use crate::wire::mpsc_pair;
    use parcheck_model::{Source, StreamKind};

    fn wildcard_program() -> SimProgram {
        let mut prog = SimProgram::new(3);
        prog.rank(0).push(send(2, 1, b"a"));
        prog.rank(1).push(send(2, 1, b"b"));
        prog.rank(2).push(recv(Source::Any, None));
        prog.rank(2).push(recv(Source::Any, None));
        prog
    }

    fn config(world_size: usize, workers: usize) -> CheckConfig {
        CheckConfig {
            world_size,
            workers,
            ..CheckConfig::default()
        }
    }

    #[test]
    fn test_mesh_agrees_with_single_worker() {
        let single = check(wildcard_program(), config(3, 1)).unwrap();
        let meshed = check(wildcard_program(), config(3, 3)).unwrap();
        assert_eq!(single.verdict, Verdict::Passed);
        assert_eq!(meshed.verdict, Verdict::Passed);
        assert_eq!(meshed.nodes, single.nodes);
        assert_eq!(meshed.arcs, single.arcs);
        assert_eq!(meshed.stuck, single.stuck);
    }

    #[test]
    fn test_mesh_finds_deadlock() {
        let mut prog = SimProgram::new(2);
        prog.rank(0).push(ssend(1, 0, b"x"));
        prog.rank(0).push(recv(Source::Rank(1), Some(0)));
        prog.rank(1).push(ssend(0, 0, b"y"));
        prog.rank(1).push(recv(Source::Rank(0), Some(0)));
        let report = check(prog, config(2, 2)).unwrap();
        assert_eq!(report.verdict, Verdict::Deadlock);
        assert_eq!(report.stuck, 1);
    }

    #[test]
    fn test_mesh_reports_faults() {
        let mut prog = wildcard_program();
        prog.rank(2).push(send(9, 0, b"bad"));
        let report = check(prog, config(3, 2)).unwrap();
        assert_eq!(report.verdict, Verdict::Faults);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind_key, "invalid-rank:2");
    }

    #[test]
    fn test_mesh_preserves_outputs() {
        let mut prog = SimProgram::new(2);
        prog.rank(0).push(print(b"hi\n"));
        prog.rank(0).push(ssend(1, 0, b"m"));
        prog.rank(1).push(recv(Source::Rank(0), Some(0)));
        let report = check(prog, config(2, 2)).unwrap();
        assert_eq!(report.verdict, Verdict::Passed);
        let out = report
            .outputs
            .iter()
            .find(|o| o.rank == 0 && o.stream == StreamKind::Stdout)
            .unwrap();
        assert_eq!(out.outputs, PathReduce::Values(vec![b"hi\n".to_vec()]));
    }

    #[test]
    fn test_serve_speaks_the_protocol() {
        let (mut coord, mut worker_end) = mpsc_pair();
        let cfg = config(2, 1);
        let handle = std::thread::spawn(move || {
            let mut prog = SimProgram::new(2);
            prog.rank(0).push(ssend(1, 0, b"m"));
            prog.rank(1).push(recv(Source::Rank(0), Some(0)));
            serve(prog, &cfg, 0, &mut worker_end)
        });
        coord
            .send(MeshMsg::Start {
                hash: init_hash(),
                action_index: INIT_ACTION,
            })
            .unwrap();
        // Deterministic program: one new state with no actions left.
        let MeshMsg::State { n_actions, .. } = coord.recv().unwrap() else {
            panic!("expected STATE");
        };
        assert_eq!(n_actions, 0);
        assert_eq!(coord.recv().unwrap(), MeshMsg::Save);
        let MeshMsg::Blob(bytes) = coord.recv().unwrap() else {
            panic!("expected BLOB");
        };
        let payload: Payload<Vec<usize>> = decode(&bytes).unwrap();
        let Payload::Branch { result, .. } = payload else {
            panic!("expected branch report");
        };
        assert!(matches!(result, BranchResult::New { .. }));
        coord.send(MeshMsg::FinalCheck).unwrap();
        assert_eq!(coord.recv().unwrap(), MeshMsg::FinalCheck);
        coord.send(MeshMsg::Quit).unwrap();
        handle.join().unwrap().unwrap();
    }
}
