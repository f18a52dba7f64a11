//! Fault taxonomy.
//!
//! Usage faults and substrate runtime faults abort only the branch that hit
//! them; they are deduplicated by kind key before entering the final report.
//! Liveness and resource faults are raised at the graph level by the checker
//! and scheduler, not here.

use crate::ids::Rank;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Runtime fault kinds reported by the execution substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeFaultKind {
    HeapExhausted,
    InvalidRead,
    InvalidWrite,
}

impl RuntimeFaultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeFaultKind::HeapExhausted => "heap-exhausted",
            RuntimeFaultKind::InvalidRead => "invalid-read",
            RuntimeFaultKind::InvalidWrite => "invalid-write",
        }
    }
}

/// A per-branch fault, detected synchronously during action application.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fault {
    #[error("rank {rank}: invalid rank {value} for communicator of size {size}")]
    InvalidRank { rank: Rank, value: i64, size: usize },

    #[error("rank {rank}: invalid tag {tag}")]
    InvalidTag { rank: Rank, tag: i64 },

    #[error("rank {rank}: invalid count {count}")]
    InvalidCount { rank: Rank, count: i64 },

    #[error("rank {rank}: invalid {kind} handle {handle}")]
    InvalidHandle {
        rank: Rank,
        // Spelled via an alias so serde's syntactic borrow detection does not
        // pin the `Deserialize` impl to `'de: 'static`.
        #[serde(deserialize_with = "deserialize_kind")]
        kind: StaticStr,
        handle: u64,
    },

    #[error("rank {rank}: invalid argument: {detail}")]
    InvalidArgument { rank: Rank, detail: String },

    #[error("rank {rank}: collective mismatch, expected {expected}, found {found}")]
    CollectiveMismatch {
        rank: Rank,
        expected: String,
        found: String,
    },

    #[error("rank {rank}: rank entered collective {op} twice")]
    CollectiveReentry { rank: Rank, op: String },

    #[error("rank {rank}: freeing a permanent communicator")]
    FreePermanentComm { rank: Rank },

    #[error("rank {rank}: finalize called twice")]
    DoubleFinalize { rank: Rank },

    #[error("rank {rank}: call after finalize")]
    CallAfterFinalize { rank: Rank },

    #[error("rank {rank}: receive buffer of {capacity} bytes overrun by {got}-byte message")]
    MessageTruncated {
        rank: Rank,
        capacity: usize,
        got: usize,
    },

    #[error("rank {rank}: runtime fault {}: {detail}", kind.as_str())]
    Runtime {
        rank: Rank,
        kind: RuntimeFaultKind,
        detail: String,
    },
}

type StaticStr = &'static str;

/// `&'static str` cannot be deserialized for an arbitrary input lifetime;
/// re-intern the known kind strings (leaking only for unknown values).
fn deserialize_kind<'de, D>(deserializer: D) -> Result<&'static str, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(match s.as_str() {
        "communicator" => "communicator",
        "request" => "request",
        "send-request" => "send-request",
        "recv-request" => "recv-request",
        _ => Box::leak(s.into_boxed_str()),
    })
}

impl Fault {
    /// Deduplication key: faults reachable via many branches are reported
    /// once per kind+key with one representative trace.
    pub fn kind_key(&self) -> String {
        match self {
            Fault::InvalidRank { rank, .. } => format!("invalid-rank:{rank}"),
            Fault::InvalidTag { rank, .. } => format!("invalid-tag:{rank}"),
            Fault::InvalidCount { rank, .. } => format!("invalid-count:{rank}"),
            Fault::InvalidHandle { rank, kind, .. } => format!("invalid-handle:{kind}:{rank}"),
            Fault::InvalidArgument { rank, .. } => format!("invalid-argument:{rank}"),
            Fault::CollectiveMismatch { rank, .. } => format!("collective-mismatch:{rank}"),
            Fault::CollectiveReentry { rank, .. } => format!("collective-reentry:{rank}"),
            Fault::FreePermanentComm { rank } => format!("free-permanent-comm:{rank}"),
            Fault::DoubleFinalize { rank } => format!("double-finalize:{rank}"),
            Fault::CallAfterFinalize { rank } => format!("call-after-finalize:{rank}"),
            Fault::MessageTruncated { rank, .. } => format!("message-truncated:{rank}"),
            Fault::Runtime { rank, kind, .. } => format!("runtime:{}:{rank}", kind.as_str()),
        }
    }

    /// The rank the fault is attributed to.
    pub fn rank(&self) -> Rank {
        match self {
            Fault::InvalidRank { rank, .. }
            | Fault::InvalidTag { rank, .. }
            | Fault::InvalidCount { rank, .. }
            | Fault::InvalidHandle { rank, .. }
            | Fault::InvalidArgument { rank, .. }
            | Fault::CollectiveMismatch { rank, .. }
            | Fault::CollectiveReentry { rank, .. }
            | Fault::FreePermanentComm { rank }
            | Fault::DoubleFinalize { rank }
            | Fault::CallAfterFinalize { rank }
            | Fault::MessageTruncated { rank, .. }
            | Fault::Runtime { rank, .. } => *rank,
        }
    }
}
