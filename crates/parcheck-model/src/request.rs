//! In-flight requests and the send-protocol policy.

use crate::hash::ContentHash;
use crate::ids::{CommId, Rank, ReqId, Source, Tag};
use crate::resource::ResourceId;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Reference to an engine-owned message buffer. Identity for hashing and
/// equality is the content hash; the handle is worker-local and re-attached
/// after a transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufRef {
    pub hash: ContentHash,
    pub len: usize,
    #[serde(skip, default = "ResourceId::detached")]
    pub id: ResourceId,
}

impl ResourceId {
    fn detached() -> Self {
        ResourceId::DETACHED
    }
}

impl PartialEq for BufRef {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.len == other.len
    }
}

impl Eq for BufRef {}

impl Hash for BufRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
        self.len.hash(state);
    }
}

/// Reference to a process-memory snapshot held by the Execution Controller.
/// Same identity rules as `BufRef`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapRef {
    pub hash: ContentHash,
    #[serde(skip, default = "ResourceId::detached")]
    pub id: ResourceId,
}

impl PartialEq for SnapRef {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for SnapRef {}

impl Hash for SnapRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

/// Send flavor as written in the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendMode {
    Standard,
    Synchronous,
    Buffered,
}

/// Policy deciding when a standard-mode send may be considered finished.
/// Selected from static parameters only; it changes completion timing but
/// never program-visible data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendProtocol {
    /// Every standard send is logically delivered at post time.
    Eager,
    /// Every standard send completes only when both sides have met.
    Rendezvous,
    /// Size-based: messages strictly larger than the threshold rendezvous.
    Threshold(usize),
}

impl Default for SendProtocol {
    fn default() -> Self {
        SendProtocol::Eager
    }
}

impl SendProtocol {
    /// Whether a send of `nbytes` in `mode` completes only at match time.
    pub fn is_synchronous(self, mode: SendMode, nbytes: usize) -> bool {
        match mode {
            SendMode::Synchronous => true,
            SendMode::Buffered => false,
            SendMode::Standard => match self {
                SendProtocol::Eager => false,
                SendProtocol::Rendezvous => true,
                SendProtocol::Threshold(limit) => nbytes > limit,
            },
        }
    }
}

/// One in-flight operation. Carries enough to recompute its effect
/// deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Send {
        dest: Rank,
        tag: Tag,
        comm: CommId,
        payload: BufRef,
        /// Program-memory address of the send buffer, locked while the
        /// request is outstanding.
        addr: u64,
        mode: SendMode,
        /// Resolved from mode + protocol policy at post time.
        synchronous: bool,
        /// Consumed by a receive. A completed-but-unmatched eager send stays
        /// active for matching purposes.
        matched: bool,
    },
    Recv {
        source: Source,
        /// `None` is the wildcard tag.
        tag: Option<Tag>,
        comm: CommId,
        /// Destination address in program memory, written at commit time.
        addr: u64,
        capacity: usize,
        /// Filled when matched; the worker writes it back to `addr`.
        payload: Option<BufRef>,
        matched_from: Option<Rank>,
    },
    Collective {
        op: crate::ids::CollId,
    },
    /// Send or receive to/from the null process: complete at post, no data.
    Completed,
}

/// A request with identity. Requests survive from post until a wait or test
/// consumes them; persistent requests additionally survive consumption.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    pub id: ReqId,
    pub kind: RequestKind,
    pub persistent: bool,
    /// The owning process may complete a wait on this request.
    pub done: bool,
}

impl Request {
    pub fn new(id: ReqId, kind: RequestKind) -> Self {
        let done = matches!(kind, RequestKind::Completed);
        Self {
            id,
            kind,
            persistent: false,
            done,
        }
    }

    pub fn is_send(&self) -> bool {
        matches!(self.kind, RequestKind::Send { .. })
    }

    pub fn is_recv(&self) -> bool {
        matches!(self.kind, RequestKind::Recv { .. })
    }

    /// An active send that a receive on `receiver` over `comm_id` with
    /// `recv_tag` (None = wildcard) could consume.
    pub fn send_matches(&self, receiver: Rank, comm_id: CommId, recv_tag: Option<Tag>) -> bool {
        match &self.kind {
            RequestKind::Send {
                dest,
                tag,
                comm,
                matched,
                ..
            } => {
                !*matched
                    && *dest == receiver
                    && *comm == comm_id
                    && recv_tag.map(|t| t == *tag).unwrap_or(true)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_policy() {
        assert!(!SendProtocol::Eager.is_synchronous(SendMode::Standard, 1 << 20));
        assert!(SendProtocol::Rendezvous.is_synchronous(SendMode::Standard, 1));
        assert!(SendProtocol::Threshold(64).is_synchronous(SendMode::Standard, 65));
        assert!(!SendProtocol::Threshold(64).is_synchronous(SendMode::Standard, 64));
        // Mode always wins over policy.
        assert!(SendProtocol::Eager.is_synchronous(SendMode::Synchronous, 1));
        assert!(!SendProtocol::Rendezvous.is_synchronous(SendMode::Buffered, 1 << 20));
    }

    #[test]
    fn test_bufref_identity_ignores_handle() {
        let a = BufRef {
            hash: crate::hash::hash_bytes(b"m"),
            len: 1,
            id: ResourceId(1),
        };
        let b = BufRef {
            hash: crate::hash::hash_bytes(b"m"),
            len: 1,
            id: ResourceId(999),
        };
        assert_eq!(a, b);
        assert_eq!(crate::hash::hash_value(&a), crate::hash::hash_value(&b));
    }

    #[test]
    fn test_send_match_rules() {
        let payload = BufRef {
            hash: crate::hash::hash_bytes(b"x"),
            len: 1,
            id: ResourceId(0),
        };
        let send = Request::new(
            ReqId::new(0, 0),
            RequestKind::Send {
                dest: 1,
                tag: 7,
                comm: CommId::WORLD,
                payload,
                addr: 0,
                mode: SendMode::Standard,
                synchronous: false,
                matched: false,
            },
        );
        assert!(send.send_matches(1, CommId::WORLD, Some(7)));
        assert!(send.send_matches(1, CommId::WORLD, None)); // wildcard tag
        assert!(!send.send_matches(1, CommId::WORLD, Some(8)));
        assert!(!send.send_matches(0, CommId::WORLD, Some(7)));
        assert!(!send.send_matches(1, CommId(3), Some(7)));
    }
}
