//! Pure protocol-state model for the parcheck model checker.
//!
//! Everything in this crate is deterministic and I/O-free: states, the
//! transition rules, and the branch-point enumerator. Execution substrates
//! and the exploration scheduler live in sibling crates.

pub mod apply;
pub mod collective;
pub mod comm;
pub mod enumerate;
pub mod event;
pub mod fault;
pub mod hash;
pub mod ids;
pub mod request;
pub mod resource;
pub mod state;

pub use apply::{apply_call, fast_expand, BufStore, ProgramCall, WaitKind};
pub use collective::{CollKind, CollectiveOp};
pub use comm::{Communicator, Datatype, Group, ReduceOp};
pub use enumerate::{apply_action, enumerate, Action};
pub use event::{Event, Obligation, Observed, StreamKind};
pub use fault::{Fault, RuntimeFaultKind};
pub use hash::{hash_bytes, hash_value, ContentHash, StateHash};
pub use ids::{CollId, CommId, Rank, ReqId, Source, Tag};
pub use request::{BufRef, Request, RequestKind, SendMode, SendProtocol, SnapRef};
pub use resource::{ResourceId, ResourceManager};
pub use state::{GlobalState, ProbeSpec, ProcStatus, ProcessState};
