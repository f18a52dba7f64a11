//! The hash-deduplicated state-space graph.
//!
//! Nodes are keyed by state hash; a node is created at most once per hash,
//! which is what collapses equivalent interleavings. States are retained on
//! nodes both for collision detection (structurally different states behind
//! one hash make results unsound and are counted and logged) and for
//! re-expansion after a transfer.

use crate::error::{CheckError, CheckResult};
use ahash::RandomState;
use parcheck_model::{Action, Event, GlobalState, Observed, Rank, StateHash, StreamKind};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArcId(pub usize);

/// A graph vertex. `hash` is `None` while the node sits in the provisional
/// pool (state produced, not yet hashed).
#[derive(Debug)]
pub struct Node {
    pub hash: Option<StateHash>,
    /// Stable human-readable id for DOT export and traces.
    pub uid: usize,
    /// Retained state; dropped once the node is fully expanded unless full
    /// tracking is on.
    pub state: Option<GlobalState>,
    pub succs: Vec<ArcId>,
    pub preds: Vec<ArcId>,
    /// The arc that first discovered this node, for trace reconstruction.
    pub discovered_by: Option<ArcId>,
    /// No outgoing transition although not every rank finished.
    pub stuck: bool,
}

/// A directed transition: the applied action, everything it caused, and the
/// externally observable effects attached to it.
#[derive(Debug)]
pub struct ArcEdge {
    pub from: NodeId,
    pub to: NodeId,
    pub label: String,
    pub events: Vec<Event>,
    pub observed: Observed,
}

/// Result of a bounded path reduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathReduce<V> {
    Values(Vec<V>),
    /// More distinct values than the caller's limit.
    TooMany,
    /// A visible cycle makes the reduction undefined.
    Undefined,
}

pub struct StateGraph {
    nodes: Vec<Node>,
    arcs: Vec<ArcEdge>,
    by_hash: HashMap<StateHash, NodeId, RandomState>,
    root: Option<NodeId>,
    /// Different states behind one hash. Non-zero means unsound results.
    collisions: usize,
    max_nodes: usize,
}

impl StateGraph {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            nodes: Vec::new(),
            arcs: Vec::new(),
            by_hash: HashMap::default(),
            root: None,
            collisions: 0,
            max_nodes,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn arc_count(&self) -> usize {
        self.arcs.len()
    }

    pub fn collisions(&self) -> usize {
        self.collisions
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn arc(&self, id: ArcId) -> &ArcEdge {
        &self.arcs[id.0]
    }

    pub fn lookup(&self, hash: StateHash) -> Option<NodeId> {
        self.by_hash.get(&hash).copied()
    }

    pub fn mark_stuck(&mut self, id: NodeId) {
        self.nodes[id.0].stuck = true;
    }

    /// Take the retained state off a fully expanded node.
    pub fn take_state(&mut self, id: NodeId) -> Option<GlobalState> {
        self.nodes[id.0].state.take()
    }

    pub fn state_of(&self, id: NodeId) -> Option<&GlobalState> {
        self.nodes[id.0].state.as_ref()
    }

    /// Insert or look up the node for `hash`. Returns the node and whether
    /// it was new; enforces the node ceiling on insertion.
    pub fn add_node(
        &mut self,
        hash: StateHash,
        state: GlobalState,
        discovered_by: Option<ArcId>,
    ) -> CheckResult<(NodeId, bool)> {
        if let Some(&id) = self.by_hash.get(&hash) {
            // Same hash: contents must agree, or the hash function lied.
            if let Some(existing) = &self.nodes[id.0].state {
                if *existing != state {
                    self.collisions += 1;
                    if self.collisions == 1 {
                        error!(
                            %hash,
                            "hash collision detected: different states share a hash, results may be unsound"
                        );
                    }
                }
            }
            return Ok((id, false));
        }
        if self.max_nodes > 0 && self.nodes.len() >= self.max_nodes {
            return Err(CheckError::NodeLimit {
                nodes: self.nodes.len(),
            });
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            hash: Some(hash),
            uid: id.0,
            state: Some(state),
            succs: Vec::new(),
            preds: Vec::new(),
            discovered_by,
            stuck: false,
        });
        self.by_hash.insert(hash, id);
        if self.root.is_none() {
            self.root = Some(id);
        }
        Ok((id, true))
    }

    pub fn add_arc(
        &mut self,
        from: NodeId,
        to: NodeId,
        action: &Action,
        events: Vec<Event>,
        observed: Observed,
    ) -> ArcId {
        let id = ArcId(self.arcs.len());
        self.arcs.push(ArcEdge {
            from,
            to,
            label: action.to_string(),
            events,
            observed,
        });
        self.nodes[from.0].succs.push(id);
        self.nodes[to.0].preds.push(id);
        if self.nodes[to.0].discovered_by.is_none() && to != self.root.unwrap_or(to) {
            self.nodes[to.0].discovered_by = Some(id);
        }
        id
    }

    /// The unique discovery path from the root to `target`, oldest arc
    /// first. Used to replay a counterexample.
    pub fn reconstruct_path(&self, target: NodeId) -> Vec<ArcId> {
        let mut path = Vec::new();
        let mut cur = target;
        while let Some(arc_id) = self.nodes[cur.0].discovered_by {
            path.push(arc_id);
            let prev = self.arcs[arc_id.0].from;
            debug_assert_ne!(prev, cur, "discovery arc is a self-loop");
            cur = prev;
        }
        path.reverse();
        path
    }

    /// Human-readable trail for a node: the discovery path's labels and
    /// events.
    pub fn trail(&self, target: NodeId) -> Vec<String> {
        self.reconstruct_path(target)
            .into_iter()
            .map(|aid| {
                let arc = self.arc(aid);
                let mut line = arc.label.clone();
                for e in &arc.events {
                    let _ = write!(line, "; {e}");
                }
                line
            })
            .collect()
    }

    /// Combine arc values over every root-to-`target` path with `combine`,
    /// starting each path at `identity`, and collect the distinct per-path
    /// results.
    ///
    /// `arc_value` returning `None` means the arc contributes nothing
    /// (invisible). A cycle on the current path through a visible arc makes
    /// the reduction undefined; an invisible cycle is skipped. More than
    /// `limit` distinct results gives up cleanly with `TooMany`.
    pub fn tree_reduce<V, FV, FC>(
        &self,
        target: NodeId,
        identity: V,
        limit: usize,
        arc_value: FV,
        combine: FC,
    ) -> PathReduce<V>
    where
        V: Clone + Eq + std::hash::Hash,
        FV: Fn(&ArcEdge) -> Option<V>,
        FC: Fn(&V, &V) -> V,
    {
        let Some(root) = self.root else {
            return PathReduce::Values(Vec::new());
        };
        let mut results: HashSet<V, RandomState> = HashSet::default();
        let mut on_path: HashSet<NodeId, RandomState> = HashSet::default();
        // Explicit DFS keeps deep graphs off the call stack.
        enum Frame<V> {
            Visit(NodeId, V),
            Leave(NodeId),
        }
        let mut stack = vec![Frame::Visit(root, identity)];
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Leave(node) => {
                    on_path.remove(&node);
                }
                Frame::Visit(node, acc) => {
                    if node == target {
                        results.insert(acc.clone());
                        if results.len() > limit {
                            return PathReduce::TooMany;
                        }
                        // Paths may continue through the target and come
                        // back only via cycles, which contribute nothing
                        // new; stop here.
                        continue;
                    }
                    on_path.insert(node);
                    stack.push(Frame::Leave(node));
                    for &aid in &self.nodes[node.0].succs {
                        let arc = &self.arcs[aid.0];
                        let value = arc_value(arc);
                        if on_path.contains(&arc.to) {
                            if value.is_some() {
                                return PathReduce::Undefined;
                            }
                            continue;
                        }
                        let next = match &value {
                            Some(v) => combine(&acc, v),
                            None => acc.clone(),
                        };
                        stack.push(Frame::Visit(arc.to, next));
                    }
                }
            }
        }
        PathReduce::Values(results.into_iter().collect())
    }

    /// Distinct possible outputs of `rank` on `stream` over every complete
    /// execution (root to a node where every process finished).
    pub fn output_set(&self, rank: Rank, stream: StreamKind, limit: usize) -> PathReduce<Vec<u8>> {
        let finals: Vec<NodeId> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| {
                n.succs.is_empty()
                    && !n.stuck
                    && n.state
                        .as_ref()
                        .map(|s| s.all_finished())
                        .unwrap_or(true)
            })
            .map(|(i, _)| NodeId(i))
            .collect();
        let mut all: HashSet<Vec<u8>, RandomState> = HashSet::default();
        for node in finals {
            let reduced = self.tree_reduce(
                node,
                Vec::new(),
                limit,
                |arc| {
                    let mut chunk = Vec::new();
                    for (r, s, bytes) in &arc.observed.output {
                        if *r == rank && *s == stream {
                            chunk.extend_from_slice(bytes);
                        }
                    }
                    if chunk.is_empty() {
                        None
                    } else {
                        Some(chunk)
                    }
                },
                |acc: &Vec<u8>, v: &Vec<u8>| {
                    let mut out = acc.clone();
                    out.extend_from_slice(v);
                    out
                },
            );
            match reduced {
                PathReduce::Values(vals) => {
                    all.extend(vals);
                    if all.len() > limit {
                        return PathReduce::TooMany;
                    }
                }
                other => return other,
            }
        }
        let mut out: Vec<Vec<u8>> = all.into_iter().collect();
        out.sort();
        PathReduce::Values(out)
    }

    /// Leaves where not every rank finished: deadlock candidates.
    pub fn stuck_leaves(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.stuck)
            .map(|(i, _)| NodeId(i))
            .collect()
    }

    /// DOT dump for external visualization. Write-only; never re-read.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph parcheck {\n  rankdir=TB;\n");
        for node in &self.nodes {
            let shape = if node.stuck { "octagon" } else { "ellipse" };
            let label = match node.hash {
                Some(h) => format!("{} {}", node.uid, h),
                None => format!("{} ?", node.uid),
            };
            let _ = writeln!(
                out,
                "  n{} [label=\"{}\", shape={}];",
                node.uid, label, shape
            );
        }
        for arc in &self.arcs {
            let _ = writeln!(
                out,
                "  n{} -> n{} [label=\"{}\"];",
                self.nodes[arc.from.0].uid,
                self.nodes[arc.to.0].uid,
                arc.label.replace('"', "'")
            );
        }
        out.push_str("}\n");
        debug!(nodes = self.nodes.len(), arcs = self.arcs.len(), "dot export");
        out
    }

    /// Breadth-first distance from the root, for reporting.
    pub fn depth_of(&self, target: NodeId) -> usize {
        let Some(root) = self.root else { return 0 };
        let mut dist: HashMap<NodeId, usize, RandomState> = HashMap::default();
        let mut queue = VecDeque::new();
        dist.insert(root, 0);
        queue.push_back(root);
        while let Some(n) = queue.pop_front() {
            let d = dist[&n];
            if n == target {
                return d;
            }
            for &aid in &self.nodes[n.0].succs {
                let to = self.arcs[aid.0].to;
                dist.entry(to).or_insert_with(|| {
                    queue.push_back(to);
                    d + 1
                });
            }
        }
        0
    }
}
