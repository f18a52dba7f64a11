//! Post-hoc deadlock and synchronization checking.
//!
//! A forward fixpoint over the finished graph propagates markings: per-rank
//! sets of synchronization obligations still owed. An arc's events first
//! discharge obligations, then add the ones they introduce. A leaf carrying
//! a non-empty marking proves some process is permanently blocked; so does a
//! branch point where no outgoing choice can discharge anything new.

use crate::graph::{ArcId, NodeId, StateGraph};
use parcheck_model::{Event, Obligation, Rank};
use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, trace};

/// One owed obligation.
pub type Mark = (Rank, Obligation);

/// The set of obligations owed in one reachable configuration class.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Marking {
    marks: BTreeSet<Mark>,
}

impl Marking {
    pub fn empty() -> Self {
        Self {
            marks: BTreeSet::new(),
        }
    }

    pub fn from_marks<I: IntoIterator<Item = Mark>>(marks: I) -> Self {
        Self {
            marks: marks.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    pub fn marks(&self) -> impl Iterator<Item = &Mark> {
        self.marks.iter()
    }

    pub fn contains(&self, mark: &Mark) -> bool {
        self.marks.contains(mark)
    }

    /// Apply one arc's events: discharge what they resolve, then add what
    /// they introduce.
    pub fn step(&self, events: &[Event]) -> Marking {
        let mut marks = self.marks.clone();
        for event in events {
            for resolved in event.resolves() {
                marks.remove(&resolved);
            }
        }
        for event in events {
            if let Some(introduced) = event.introduces() {
                marks.insert(introduced);
            }
        }
        Marking { marks }
    }

    fn ranks(&self) -> BTreeSet<Rank> {
        self.marks.iter().map(|(r, _)| *r).collect()
    }

    /// Obligations of one rank, with the rank stripped.
    fn obligations_of(&self, rank: Rank) -> BTreeSet<Obligation> {
        self.marks
            .iter()
            .filter(|(r, _)| *r == rank)
            .map(|(_, o)| *o)
            .collect()
    }

    /// Whether `other` covers this marking under some bijection of ranks:
    /// two markings that differ only in which physical rank plays an
    /// interchangeable role are equivalent. The search is exponential in the
    /// number of marked ranks, which stays small in practice.
    pub fn is_covered_by(&self, other: &Marking) -> bool {
        if self.marks.len() != other.marks.len() {
            return false;
        }
        let ours: Vec<Rank> = self.ranks().into_iter().collect();
        let theirs: Vec<Rank> = other.ranks().into_iter().collect();
        if ours.len() != theirs.len() {
            return false;
        }
        // Obligations reference request ids that embed ranks, so a rank
        // bijection must also rewrite the obligations it maps.
        fn rewrite(obls: &BTreeSet<Obligation>, from: Rank, to: Rank) -> BTreeSet<Obligation> {
            obls.iter()
                .map(|o| match o {
                    Obligation::RequestDone(id) if id.rank as usize == from => {
                        Obligation::RequestDone(parcheck_model::ReqId::new(to, id.seq))
                    }
                    Obligation::SyncSendMatched(id) if id.rank as usize == from => {
                        Obligation::SyncSendMatched(parcheck_model::ReqId::new(to, id.seq))
                    }
                    other => *other,
                })
                .collect()
        }
        fn search(
            ours: &[Rank],
            used: &mut Vec<bool>,
            theirs: &[Rank],
            a: &Marking,
            b: &Marking,
        ) -> bool {
            let Some(&rank) = ours.first() else {
                return true;
            };
            let rest = &ours[1..];
            for (i, &cand) in theirs.iter().enumerate() {
                if used[i] {
                    continue;
                }
                let mapped = rewrite(&a.obligations_of(rank), rank, cand);
                if mapped == b.obligations_of(cand) {
                    used[i] = true;
                    if search(rest, used, theirs, a, b) {
                        return true;
                    }
                    used[i] = false;
                }
            }
            false
        }
        let mut used = vec![false; theirs.len()];
        search(&ours, &mut used, &theirs, self, other)
    }
}

/// A bounded set of pairwise non-equivalent markings.
#[derive(Debug, Clone, Default)]
pub struct MarkingSet {
    markings: Vec<Marking>,
}

impl MarkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.markings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Marking> {
        self.markings.iter()
    }

    /// Insert unless an equivalent marking is already present. Returns
    /// whether the set changed.
    pub fn insert(&mut self, marking: Marking) -> bool {
        if self.markings.iter().any(|m| marking.is_covered_by(m)) {
            return false;
        }
        self.markings.push(marking);
        true
    }
}

/// One proven deadlock.
#[derive(Debug, Clone)]
pub struct DeadlockFinding {
    pub node: NodeId,
    pub marking: Marking,
    /// True when found by the branch-point rule rather than at a leaf.
    pub at_branch: bool,
}

/// Run the marking fixpoint over a finished graph. `root_marking` carries
/// the obligations introduced while draining to the initial state, which sit
/// before the first arc.
pub fn find_deadlocks(graph: &StateGraph, root_marking: Marking) -> Vec<DeadlockFinding> {
    let Some(root) = graph.root() else {
        return Vec::new();
    };
    let n = graph.node_count();
    let mut sets: Vec<MarkingSet> = (0..n).map(|_| MarkingSet::new()).collect();
    sets[root.0].insert(root_marking);

    // Forward propagation to a fixpoint. Self-loops and back arcs cannot add
    // marks forever because MarkingSet::insert is idempotent under covering.
    let mut queue: VecDeque<NodeId> = VecDeque::new();
    queue.push_back(root);
    let mut queued = vec![false; n];
    queued[root.0] = true;
    while let Some(node) = queue.pop_front() {
        queued[node.0] = false;
        let outgoing: Vec<ArcId> = graph.node(node).succs.clone();
        let current: Vec<Marking> = sets[node.0].iter().cloned().collect();
        for arc_id in outgoing {
            let arc = graph.arc(arc_id);
            let mut changed = false;
            for marking in &current {
                let stepped = marking.step(&arc.events);
                if sets[arc.to.0].insert(stepped) {
                    changed = true;
                }
            }
            if changed && !queued[arc.to.0] {
                queued[arc.to.0] = true;
                queue.push_back(arc.to);
            }
        }
    }

    let mut findings = Vec::new();
    for idx in 0..n {
        let node = NodeId(idx);
        let succs = &graph.node(node).succs;
        if succs.is_empty() {
            for marking in sets[idx].iter() {
                if !marking.is_empty() {
                    trace!(node = idx, ?marking, "leaf with owed marks");
                    findings.push(DeadlockFinding {
                        node,
                        marking: marking.clone(),
                        at_branch: false,
                    });
                }
            }
        } else if succs.len() > 1 {
            // Branch point: if, under some owed marking, every outgoing
            // arc's first event introduces an obligation already owed, no
            // choice can unblock the waiter.
            for marking in sets[idx].iter() {
                if marking.is_empty() {
                    continue;
                }
                let all_owed = succs.iter().all(|&aid| {
                    let arc = graph.arc(aid);
                    match arc.events.first().and_then(|e| e.introduces()) {
                        Some(mark) => marking.contains(&mark),
                        None => false,
                    }
                });
                if all_owed {
                    findings.push(DeadlockFinding {
                        node,
                        marking: marking.clone(),
                        at_branch: true,
                    });
                }
            }
        }
    }
    debug!(findings = findings.len(), "marking fixpoint done");
    findings
}
