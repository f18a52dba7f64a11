//! Execution Controller client.
//!
//! The controller owns one process-under-test: it intercepts its
//! message-passing calls, snapshots and restores its memory, and hashes its
//! contents. This crate speaks the controller's line protocol and multiplexes
//! several controllers per worker; it knows nothing about exploration.

pub mod controller;
pub mod error;
pub mod pool;
pub mod proto;

pub use controller::{ChildTransport, Link};
pub use error::ExecError;
pub use pool::{ControllerPool, PoolLink};
pub use proto::{Access, Command, Reply, RunEvent, RunStop};
