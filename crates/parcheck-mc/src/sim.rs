//! Scripted execution substrate.
//!
//! Programs are described as per-rank call scripts and checked without any
//! controller process. This is both a usable front end for protocol-level
//! models and the harness the engine's own tests are built on. Program
//! progress is a per-rank instruction pointer carried with each branch, the
//! way snapshot handles carry progress for real targets.

use crate::error::CheckResult;
use crate::worker::{Buffers, Substrate};
use parcheck_model::{
    BufStore, CollKind, CommId, ProgramCall, Rank, ReqId, SendMode, Source, StreamKind, Tag,
    WaitKind,
};
use serde::{Deserialize, Serialize};

/// One scripted statement. Payloads are literal bytes; the substrate
/// allocates them as engine-owned buffers at post time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimCall {
    Send {
        /// Local rank in `comm`; `None` is the null process.
        dest: Option<i64>,
        tag: Tag,
        comm: CommId,
        bytes: Vec<u8>,
        mode: SendMode,
        nonblocking: bool,
    },
    Recv {
        source: Source,
        tag: Option<Tag>,
        comm: CommId,
        capacity: usize,
        nonblocking: bool,
    },
    Wait {
        kind: WaitKind,
        reqs: Vec<ReqId>,
    },
    Test {
        reqs: Vec<ReqId>,
    },
    Probe {
        source: Source,
        tag: Option<Tag>,
        comm: CommId,
        blocking: bool,
    },
    Collective {
        kind: CollKind,
        comm: CommId,
        blocking: bool,
        bytes: Option<Vec<u8>>,
        split_key: Option<(i64, i64)>,
    },
    CommFree {
        comm: CommId,
    },
    /// Write to a standard stream; observable on the arc that runs it.
    Print {
        stream: StreamKind,
        bytes: Vec<u8>,
    },
    Finalize,
}

/// A complete scripted program: one call list per rank. Every script
/// implicitly ends with an exit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimProgram {
    pub scripts: Vec<Vec<SimCall>>,
}

impl SimProgram {
    pub fn new(world_size: usize) -> Self {
        Self {
            scripts: vec![Vec::new(); world_size],
        }
    }

    pub fn world_size(&self) -> usize {
        self.scripts.len()
    }

    pub fn rank(&mut self, rank: Rank) -> &mut Vec<SimCall> {
        &mut self.scripts[rank]
    }
}

impl Substrate for SimProgram {
    /// Per-rank instruction pointers.
    type Cursor = Vec<usize>;

    fn initial_cursor(&self) -> Self::Cursor {
        vec![0; self.scripts.len()]
    }

    fn next_call(
        &mut self,
        cursor: &mut Self::Cursor,
        rank: Rank,
        bufs: &mut Buffers,
    ) -> CheckResult<(Vec<(StreamKind, Vec<u8>)>, ProgramCall)> {
        let mut output = Vec::new();
        loop {
            let ip = cursor[rank];
            let Some(call) = self.scripts[rank].get(ip) else {
                // Script exhausted: the process exits.
                return Ok((output, ProgramCall::Exit));
            };
            cursor[rank] += 1;
            let call = match call.clone() {
                SimCall::Print { stream, bytes } => {
                    output.push((stream, bytes));
                    continue;
                }
                SimCall::Send {
                    dest,
                    tag,
                    comm,
                    bytes,
                    mode,
                    nonblocking,
                } => ProgramCall::Send {
                    dest,
                    tag,
                    comm,
                    payload: bufs.alloc(bytes),
                    addr: 0,
                    mode,
                    nonblocking,
                },
                SimCall::Recv {
                    source,
                    tag,
                    comm,
                    capacity,
                    nonblocking,
                } => ProgramCall::Recv {
                    source,
                    tag,
                    comm,
                    addr: 0,
                    capacity,
                    nonblocking,
                },
                SimCall::Wait { kind, reqs } => ProgramCall::Wait { kind, reqs },
                SimCall::Test { reqs } => ProgramCall::Test { reqs },
                SimCall::Probe {
                    source,
                    tag,
                    comm,
                    blocking,
                } => ProgramCall::Probe {
                    source,
                    tag,
                    comm,
                    blocking,
                },
                SimCall::Collective {
                    kind,
                    comm,
                    blocking,
                    bytes,
                    split_key,
                } => ProgramCall::Collective {
                    kind,
                    comm,
                    blocking,
                    data: bytes.map(|b| bufs.alloc(b)),
                    split_key,
                },
                SimCall::CommFree { comm } => ProgramCall::CommFree { comm },
                SimCall::Finalize => ProgramCall::Finalize,
            };
            return Ok((output, call));
        }
    }
}

/// Script-building helpers used across the engine's tests.
pub mod script {
    use super::*;

    pub fn send(dest: i64, tag: Tag, bytes: &[u8]) -> SimCall {
        SimCall::Send {
            dest: Some(dest),
            tag,
            comm: CommId::WORLD,
            bytes: bytes.to_vec(),
            mode: SendMode::Standard,
            nonblocking: false,
        }
    }

    pub fn ssend(dest: i64, tag: Tag, bytes: &[u8]) -> SimCall {
        SimCall::Send {
            dest: Some(dest),
            tag,
            comm: CommId::WORLD,
            bytes: bytes.to_vec(),
            mode: SendMode::Synchronous,
            nonblocking: false,
        }
    }

    pub fn isend(dest: i64, tag: Tag, bytes: &[u8]) -> SimCall {
        SimCall::Send {
            dest: Some(dest),
            tag,
            comm: CommId::WORLD,
            bytes: bytes.to_vec(),
            mode: SendMode::Standard,
            nonblocking: true,
        }
    }

    pub fn recv(source: Source, tag: Option<Tag>) -> SimCall {
        SimCall::Recv {
            source,
            tag,
            comm: CommId::WORLD,
            capacity: 1 << 16,
            nonblocking: false,
        }
    }

    pub fn irecv(source: Source, tag: Option<Tag>) -> SimCall {
        SimCall::Recv {
            source,
            tag,
            comm: CommId::WORLD,
            capacity: 1 << 16,
            nonblocking: true,
        }
    }

    pub fn wait_all(reqs: Vec<ReqId>) -> SimCall {
        SimCall::Wait {
            kind: WaitKind::All,
            reqs,
        }
    }

    pub fn wait_any(reqs: Vec<ReqId>) -> SimCall {
        SimCall::Wait {
            kind: WaitKind::Any,
            reqs,
        }
    }

    pub fn wait_some(reqs: Vec<ReqId>) -> SimCall {
        SimCall::Wait {
            kind: WaitKind::Some,
            reqs,
        }
    }

    pub fn barrier() -> SimCall {
        SimCall::Collective {
            kind: CollKind::Barrier,
            comm: CommId::WORLD,
            blocking: true,
            bytes: None,
            split_key: None,
        }
    }

    pub fn print(bytes: &[u8]) -> SimCall {
        SimCall::Print {
            stream: StreamKind::Stdout,
            bytes: bytes.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::script::*;
    use super::*;

    #[test]
    fn test_script_exhaustion_is_exit() {
        let mut prog = SimProgram::new(1);
        let mut cursor = prog.initial_cursor();
        let mut bufs = Buffers::default();
        let (out, call) = prog.next_call(&mut cursor, 0, &mut bufs).unwrap();
        assert!(out.is_empty());
        assert_eq!(call, ProgramCall::Exit);
    }

    #[test]
    fn test_prints_fold_into_next_call_output() {
        let mut prog = SimProgram::new(1);
        prog.rank(0).push(print(b"a"));
        prog.rank(0).push(print(b"b"));
        prog.rank(0).push(send(0, 1, b"x"));
        let mut cursor = prog.initial_cursor();
        let mut bufs = Buffers::default();
        let (out, call) = prog.next_call(&mut cursor, 0, &mut bufs).unwrap();
        assert_eq!(out.len(), 2);
        assert!(matches!(call, ProgramCall::Send { .. }));
        assert_eq!(cursor[0], 3);
    }

    #[test]
    fn test_cursor_is_branch_local() {
        let mut prog = SimProgram::new(1);
        prog.rank(0).push(print(b"a"));
        let base = prog.initial_cursor();
        let mut branch = base.clone();
        let mut bufs = Buffers::default();
        let _ = prog.next_call(&mut branch, 0, &mut bufs).unwrap();
        assert_eq!(base[0], 0);
        assert_eq!(branch[0], 1);
    }
}
