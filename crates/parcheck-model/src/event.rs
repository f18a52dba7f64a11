//! Events generated by applying actions, and the observable effects
//! attached to graph arcs.

use crate::ids::{CollId, Rank, ReqId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A synchronization obligation a blocked process is owed. The deadlock
/// checker propagates these as marks along arcs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Obligation {
    /// The request must reach its finished state.
    RequestDone(ReqId),
    /// A synchronous send must be matched by a receive.
    SyncSendMatched(ReqId),
    /// The process must be able to run to termination.
    Terminate,
}

impl fmt::Display for Obligation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Obligation::RequestDone(r) => write!(f, "done({})", r),
            Obligation::SyncSendMatched(r) => write!(f, "sync-matched({})", r),
            Obligation::Terminate => write!(f, "terminate"),
        }
    }
}

/// One thing that happened while applying an action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    /// A send was consumed by a receive.
    Matched {
        sender: Rank,
        send: ReqId,
        receiver: Rank,
        recv: ReqId,
    },
    /// A request reached its finished state.
    RequestDone { rank: Rank, req: ReqId },
    /// A process entered a blocking state owing the given obligation.
    Blocked { rank: Rank, obligation: Obligation },
    /// A collective operation completed and was disposed.
    CollectiveDone { op: CollId },
    /// A probe was promised a match from `sender`.
    Probed { rank: Rank, sender: Rank },
    /// A process ran user code to its next call.
    Stepped { rank: Rank },
    /// A process exited.
    Exited { rank: Rank },
}

impl Event {
    /// The obligation this event discharges, if any.
    pub fn resolves(&self) -> Vec<(Rank, Obligation)> {
        match self {
            Event::Matched {
                sender,
                send,
                receiver,
                recv,
            } => vec![
                (*sender, Obligation::SyncSendMatched(*send)),
                (*sender, Obligation::RequestDone(*send)),
                (*receiver, Obligation::RequestDone(*recv)),
            ],
            Event::RequestDone { rank, req } => vec![(*rank, Obligation::RequestDone(*req))],
            Event::Exited { rank } => vec![(*rank, Obligation::Terminate)],
            _ => vec![],
        }
    }

    /// The obligation this event introduces, if any.
    pub fn introduces(&self) -> Option<(Rank, Obligation)> {
        match self {
            Event::Blocked { rank, obligation } => Some((*rank, *obligation)),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Matched {
                sender,
                send,
                receiver,
                recv,
            } => write!(f, "match {}:{} -> {}:{}", sender, send, receiver, recv),
            Event::RequestDone { rank, req } => write!(f, "done {}:{}", rank, req),
            Event::Blocked { rank, obligation } => write!(f, "blocked {}:{}", rank, obligation),
            Event::CollectiveDone { op } => write!(f, "collective {}", op),
            Event::Probed { rank, sender } => write!(f, "probe {} <- {}", rank, sender),
            Event::Stepped { rank } => write!(f, "step {}", rank),
            Event::Exited { rank } => write!(f, "exit {}", rank),
        }
    }
}

/// Output stream of an observable byte chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Externally observable effects of one transition, attached to the arc.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Observed {
    /// Byte chunks written to standard streams, in emission order.
    pub output: Vec<(Rank, StreamKind, Vec<u8>)>,
    /// Number of substrate commands issued while producing the transition.
    pub commands: u32,
}

impl Observed {
    pub fn is_empty(&self) -> bool {
        self.output.is_empty()
    }

    pub fn push_output(&mut self, rank: Rank, stream: StreamKind, bytes: Vec<u8>) {
        self.output.push((rank, stream, bytes));
    }
}
