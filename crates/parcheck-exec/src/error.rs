//! Controller-client errors.

use parcheck_model::RuntimeFaultKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("controller i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to spawn controller `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("controller channel closed")]
    Closed,

    #[error("malformed controller reply: `{line}`")]
    Malformed { line: String },

    #[error("unexpected controller reply: expected {expected}, got `{got}`")]
    Unexpected {
        expected: &'static str,
        got: String,
    },

    /// A `REPORT` fault line from the substrate. Mapped to a per-branch
    /// runtime fault by the worker.
    #[error("controller fault report {}: {detail}", kind.as_str())]
    Report {
        kind: RuntimeFaultKind,
        detail: String,
    },
}
