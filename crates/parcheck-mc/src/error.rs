//! Engine-level errors.
//!
//! Per-branch usage and runtime faults are *not* errors here; they are
//! recorded in the report and exploration continues. `CheckError` covers
//! conditions that stop the whole run.

use parcheck_model::StateHash;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("node ceiling reached: {nodes} nodes")]
    NodeLimit { nodes: usize },

    #[error("memory ceiling reached: {memory_mb} MB at {nodes} nodes")]
    MemoryLimit { nodes: usize, memory_mb: usize },

    #[error("execution controller: {0}")]
    Exec(#[from] parcheck_exec::ExecError),

    #[error("state transfer codec: {0}")]
    Codec(#[from] postcard::Error),

    #[error("malformed mesh message: `{line}`")]
    Wire { line: String },

    #[error("mesh channel closed")]
    ChannelClosed,

    #[error("transferred state {hash} unknown at receiver")]
    UnknownState { hash: StateHash },

    #[error("worker {worker} panicked")]
    WorkerPanic { worker: usize },

    #[error("unsupported program call `{name}` at rank {rank}")]
    UnknownCall { name: String, rank: usize },
}

pub type CheckResult<T> = Result<T, CheckError>;
