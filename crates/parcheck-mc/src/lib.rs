//! The exploration engine: state graph, workers, the worker mesh, and the
//! post-hoc checkers.
//!
//! The model crate supplies the transition semantics; this crate decides
//! what to explore, where states live, and what to tell the user at the
//! end.

pub mod config;
pub mod deadlock;
pub mod error;
pub mod graph;
pub mod mesh;
pub mod report;
pub mod sim;
pub mod transfer;
pub mod wire;
pub mod worker;

pub use config::{CheckConfig, ProgressCounters};
pub use deadlock::{find_deadlocks, DeadlockFinding, Marking, MarkingSet};
pub use error::{CheckError, CheckResult};
pub use graph::{ArcEdge, ArcId, Node, NodeId, PathReduce, StateGraph};
pub use mesh::{check, coordinate, serve};
pub use report::{CheckReport, ErrorRecord, OutputRecord, Verdict};
pub use sim::{SimCall, SimProgram};
pub use transfer::TransferState;
pub use wire::{mpsc_pair, Channel, ChannelRx, ChannelTx, MeshMsg, TcpChannel};
pub use worker::{Buffers, FaultRecord, Substrate, Worker};
