//! Checker configuration and shared progress counters.

use memory_stats::memory_stats;
use parcheck_model::SendProtocol;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

/// Current process memory usage in MB, or None if unavailable.
pub(crate) fn current_memory_mb() -> Option<usize> {
    memory_stats().map(|stats| stats.physical_mem / (1024 * 1024))
}

/// Lock-free progress counters shared between the engine and the CLI
/// spinner. The engine writes, the CLI reads on its own timer; neither side
/// ever blocks the other.
pub struct ProgressCounters {
    pub nodes: AtomicUsize,
    pub arcs: AtomicUsize,
    pub queue_len: AtomicUsize,
    /// Branches fully drained and expanded (always increasing, even when no
    /// new node came out of them).
    pub expanded: AtomicUsize,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self {
            nodes: AtomicUsize::new(0),
            arcs: AtomicUsize::new(0),
            queue_len: AtomicUsize::new(0),
            expanded: AtomicUsize::new(0),
        }
    }
}

impl Default for ProgressCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for one check run.
#[derive(Clone)]
pub struct CheckConfig {
    /// Number of ranks in the world communicator.
    pub world_size: usize,
    /// Send-protocol policy applied to every standard-mode send.
    pub protocol: SendProtocol,
    /// Run the marking fixpoint after exploration.
    pub check_deadlock: bool,
    /// Maximum number of graph nodes (0 = unlimited). Exceeding it aborts
    /// with a node-limit outcome, never a silent truncation.
    pub max_nodes: usize,
    /// Maximum memory usage in MB (0 = unlimited).
    pub memory_limit_mb: usize,
    /// Cap on per-rank distinct-output enumeration before reporting
    /// "too many".
    pub max_outputs: usize,
    /// Number of exploration workers (1 = in-process single worker).
    pub workers: usize,
    /// Shared progress counters; the engine updates them atomically.
    pub progress: Option<Arc<ProgressCounters>>,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            world_size: 2,
            protocol: SendProtocol::Eager,
            check_deadlock: true,
            max_nodes: 0,
            memory_limit_mb: 0,
            max_outputs: 64,
            workers: 1,
            progress: None,
        }
    }
}

impl std::fmt::Debug for CheckConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckConfig")
            .field("world_size", &self.world_size)
            .field("protocol", &self.protocol)
            .field("check_deadlock", &self.check_deadlock)
            .field("max_nodes", &self.max_nodes)
            .field("memory_limit_mb", &self.memory_limit_mb)
            .field("max_outputs", &self.max_outputs)
            .field("workers", &self.workers)
            .field("progress", &self.progress.as_ref().map(|_| "..."))
            .finish()
    }
}
