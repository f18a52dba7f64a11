//! Transition rules: translating program calls into protocol state and
//! applying deterministic completion ("fast expansion").
//!
//! Everything here is pure with respect to I/O. Payload bytes live in an
//! injected `BufStore`; the driving worker is responsible for moving bytes
//! between program memory and the store around these calls.

use crate::collective::{CollKind, CollectiveOp};
use crate::comm::{Communicator, Group, ReduceOp};
use crate::event::{Event, Obligation};
use crate::fault::Fault;
use crate::ids::{CollId, CommId, Rank, ReqId, Source, Tag};
use crate::request::{BufRef, Request, RequestKind, SendMode, SendProtocol};
use crate::resource::ResourceId;
use crate::state::{GlobalState, ProbeSpec, ProcStatus, ProcessState};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Access to engine-owned payload bytes. Implemented by the worker over its
/// buffer `ResourceManager`; tests use the same implementation.
pub trait BufStore {
    fn bytes(&self, id: ResourceId) -> &[u8];
    fn alloc(&mut self, bytes: Vec<u8>) -> BufRef;
}

/// Wait flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaitKind {
    All,
    Any,
    Some,
}

/// One call the program under test made, as decoded by the worker.
/// Peer ranks are local to `comm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgramCall {
    Send {
        /// `None` is the null process.
        dest: Option<i64>,
        tag: Tag,
        comm: CommId,
        payload: BufRef,
        addr: u64,
        mode: SendMode,
        nonblocking: bool,
    },
    Recv {
        source: Source,
        /// `None` is the wildcard tag.
        tag: Option<Tag>,
        comm: CommId,
        addr: u64,
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
        data: Option<BufRef>,
        split_key: Option<(i64, i64)>,
    },
    CommFree {
        comm: CommId,
    },
    Finalize,
    Exit,
}

fn resolve_comm(proc: &ProcessState, id: CommId) -> Result<&Communicator, Fault> {
    proc.comm(id).ok_or(Fault::InvalidHandle {
        rank: proc.rank,
        kind: "communicator",
        handle: id.0 as u64,
    })
}

fn resolve_peer(proc: &ProcessState, comm: &Communicator, peer: i64) -> Result<Rank, Fault> {
    if peer < 0 || peer as usize >= comm.size() {
        return Err(Fault::InvalidRank {
            rank: proc.rank,
            value: peer,
            size: comm.size(),
        });
    }
    Ok(comm.group.world_rank(peer as usize).unwrap())
}

fn check_tag(rank: Rank, tag: Tag) -> Result<(), Fault> {
    if tag < 0 {
        return Err(Fault::InvalidTag {
            rank,
            tag: tag as i64,
        });
    }
    Ok(())
}

/// Apply one program call on `rank`. Returns the events generated; the
/// caller runs `fast_expand` afterwards.
pub fn apply_call(
    state: &mut GlobalState,
    rank: Rank,
    call: ProgramCall,
    policy: SendProtocol,
    events: &mut Vec<Event>,
) -> Result<(), Fault> {
    let finalized = state.proc(rank).finalized;
    // A repeated finalize is its own fault kind, raised in the arm below.
    if finalized && !matches!(call, ProgramCall::Exit | ProgramCall::Finalize) {
        return Err(Fault::CallAfterFinalize { rank });
    }
    match call {
        ProgramCall::Send {
            dest,
            tag,
            comm,
            payload,
            addr,
            mode,
            nonblocking,
        } => {
            check_tag(rank, tag)?;
            let (dest_world, len) = {
                let proc = state.proc(rank);
                let c = resolve_comm(proc, comm)?;
                match dest {
                    None => (None, payload.len),
                    Some(d) => (Some(resolve_peer(proc, c, d)?), payload.len),
                }
            };
            let proc = state.proc_mut(rank);
            let id = proc.next_req_id();
            let req = match dest_world {
                None => Request::new(id, RequestKind::Completed),
                Some(dest_world) => {
                    let synchronous = policy.is_synchronous(mode, len);
                    let mut req = Request::new(
                        id,
                        RequestKind::Send {
                            dest: dest_world,
                            tag,
                            comm,
                            payload,
                            addr,
                            mode,
                            synchronous,
                            matched: false,
                        },
                    );
                    // Eager and buffered sends are logically delivered at
                    // post time; only synchronous completion waits for the
                    // rendezvous.
                    req.done = !synchronous;
                    if synchronous {
                        events.push(Event::Blocked {
                            rank,
                            obligation: Obligation::SyncSendMatched(id),
                        });
                    } else {
                        events.push(Event::RequestDone { rank, req: id });
                    }
                    if addr != 0 {
                        proc.locked.push((addr, len as u64));
                    }
                    req
                }
            };
            proc.active.push(req);
            if !nonblocking {
                enter_wait(state, rank, WaitKind::All, vec![id], events)?;
            }
            Ok(())
        }
        ProgramCall::Recv {
            source,
            tag,
            comm,
            addr,
            capacity,
            nonblocking,
        } => {
            if let Some(t) = tag {
                check_tag(rank, t)?;
            }
            let source = {
                let proc = state.proc(rank);
                let c = resolve_comm(proc, comm)?;
                match source {
                    Source::Rank(local) => Source::Rank(resolve_peer(proc, c, local as i64)?),
                    other => other,
                }
            };
            let proc = state.proc_mut(rank);
            let id = proc.next_req_id();
            let req = if source == Source::Null {
                Request::new(id, RequestKind::Completed)
            } else {
                if addr != 0 {
                    proc.locked.push((addr, capacity as u64));
                }
                Request::new(
                    id,
                    RequestKind::Recv {
                        source,
                        tag,
                        comm,
                        addr,
                        capacity,
                        payload: None,
                        matched_from: None,
                    },
                )
            };
            proc.active.push(req);
            if !nonblocking {
                enter_wait(state, rank, WaitKind::All, vec![id], events)?;
            }
            Ok(())
        }
        ProgramCall::Wait { kind, reqs } => enter_wait(state, rank, kind, reqs, events),
        ProgramCall::Test { reqs } => {
            validate_reqs(state.proc(rank), &reqs)?;
            let proc = state.proc_mut(rank);
            proc.status = ProcStatus::Test;
            proc.wait_set = reqs.into_iter().collect();
            Ok(())
        }
        ProgramCall::Probe {
            source,
            tag,
            comm,
            blocking,
        } => {
            if let Some(t) = tag {
                check_tag(rank, t)?;
            }
            let source = {
                let proc = state.proc(rank);
                let c = resolve_comm(proc, comm)?;
                match source {
                    Source::Rank(local) => Source::Rank(resolve_peer(proc, c, local as i64)?),
                    other => other,
                }
            };
            let proc = state.proc_mut(rank);
            proc.status = ProcStatus::Probe;
            proc.probe = Some(ProbeSpec {
                source,
                tag,
                comm,
                blocking,
            });
            Ok(())
        }
        ProgramCall::Collective {
            kind,
            comm,
            blocking,
            data,
            split_key,
        } => {
            let (coll_id, local, expected) = {
                let proc = state.proc(rank);
                let c = resolve_comm(proc, comm)?;
                let local = c.group.local_rank(rank).ok_or(Fault::InvalidHandle {
                    rank,
                    kind: "communicator",
                    handle: comm.0 as u64,
                })?;
                (
                    CollId {
                        comm,
                        seq: c.coll_seq,
                    },
                    local,
                    c.size(),
                )
            };
            // Advance this rank's collective round on the communicator.
            state.proc_mut(rank).comm_mut(comm).unwrap().coll_seq += 1;

            if state.collective(coll_id).is_none() {
                state.collectives.push(CollectiveOp::new(
                    coll_id, comm, coll_id.seq, kind, blocking, expected,
                ));
            }
            let op = state.collective_mut(coll_id).unwrap();
            op.join(local, rank, kind, blocking, data, split_key)?;

            let proc = state.proc_mut(rank);
            let id = proc.next_req_id();
            proc.active
                .push(Request::new(id, RequestKind::Collective { op: coll_id }));
            if blocking {
                enter_wait(state, rank, WaitKind::All, vec![id], events)?;
            }
            Ok(())
        }
        ProgramCall::CommFree { comm } => {
            let proc = state.proc(rank);
            let c = resolve_comm(proc, comm)?;
            if c.permanent {
                return Err(Fault::FreePermanentComm { rank });
            }
            let proc = state.proc_mut(rank);
            proc.comms.retain(|c| c.id != comm);
            Ok(())
        }
        ProgramCall::Finalize => {
            let proc = state.proc_mut(rank);
            if proc.finalized {
                return Err(Fault::DoubleFinalize { rank });
            }
            proc.finalized = true;
            Ok(())
        }
        ProgramCall::Exit => {
            let proc = state.proc_mut(rank);
            proc.status = ProcStatus::Finished;
            proc.snapshot = None;
            events.push(Event::Exited { rank });
            Ok(())
        }
    }
}

fn validate_reqs(proc: &ProcessState, reqs: &[ReqId]) -> Result<(), Fault> {
    for &id in reqs {
        if proc.request(id).is_none() {
            return Err(Fault::InvalidHandle {
                rank: proc.rank,
                kind: "request",
                handle: ((id.rank as u64) << 32) | id.seq as u64,
            });
        }
    }
    Ok(())
}

fn enter_wait(
    state: &mut GlobalState,
    rank: Rank,
    kind: WaitKind,
    reqs: Vec<ReqId>,
    events: &mut Vec<Event>,
) -> Result<(), Fault> {
    validate_reqs(state.proc(rank), &reqs)?;
    // Wait-some subsets are enumerated through a 64-bit mask.
    if kind == WaitKind::Some && reqs.len() > 63 {
        return Err(Fault::InvalidCount {
            rank,
            count: reqs.len() as i64,
        });
    }
    let proc = state.proc_mut(rank);
    proc.status = match kind {
        WaitKind::All => ProcStatus::WaitAll,
        WaitKind::Any => ProcStatus::WaitAny,
        WaitKind::Some => ProcStatus::WaitSome,
    };
    proc.wait_set = reqs.iter().copied().collect();
    for &id in &reqs {
        if !proc.request(id).map(|r| r.done).unwrap_or(false) {
            events.push(Event::Blocked {
                rank,
                obligation: Obligation::RequestDone(id),
            });
        }
    }
    Ok(())
}

/// A send `m` on `sender` is masked for receive `recv_pos` on `receiver` if
/// an earlier-posted, still-pending receive on the same process could match
/// it (FIFO-per-source interception).
fn masked(receiver: &ProcessState, recv_pos: usize, sender: Rank, send: &Request) -> bool {
    let (send_tag, send_comm) = match &send.kind {
        RequestKind::Send { tag, comm, .. } => (*tag, *comm),
        _ => return false,
    };
    receiver.active[..recv_pos].iter().any(|earlier| {
        if earlier.done {
            return false;
        }
        match &earlier.kind {
            RequestKind::Recv {
                source,
                tag,
                comm,
                payload: None,
                ..
            } => {
                *comm == send_comm
                    && tag.map(|t| t == send_tag).unwrap_or(true)
                    && match source {
                        Source::Rank(r) => *r == sender,
                        Source::Any => true,
                        Source::Null => false,
                    }
            }
            _ => false,
        }
    })
}

/// The oldest still-active send on `sender` that `(receiver, comm, tag)`
/// could consume.
fn oldest_eligible_send(
    state: &GlobalState,
    sender: Rank,
    receiver: Rank,
    comm: CommId,
    tag: Option<Tag>,
) -> Option<ReqId> {
    state
        .proc(sender)
        .active
        .iter()
        .find(|r| r.send_matches(receiver, comm, tag))
        .map(|r| r.id)
}

/// Candidate `(sender, send)` pairs for a wildcard receive or probe, scanned
/// in increasing process-id order. Masking by earlier receives is respected.
pub fn eligible_senders(
    state: &GlobalState,
    receiver: Rank,
    recv_pos: Option<usize>,
    source: Source,
    comm: CommId,
    tag: Option<Tag>,
) -> Vec<(Rank, ReqId)> {
    let mut out = Vec::new();
    let ranks: Vec<Rank> = match source {
        Source::Rank(r) => vec![r],
        Source::Any => (0..state.world_size()).collect(),
        Source::Null => return out,
    };
    for sender in ranks {
        if let Some(send_id) = oldest_eligible_send(state, sender, receiver, comm, tag) {
            let send = state.proc(sender).request(send_id).unwrap();
            let is_masked = match recv_pos {
                Some(pos) => masked(state.proc(receiver), pos, sender, send),
                None => false,
            };
            if !is_masked {
                out.push((sender, send_id));
            }
        }
    }
    out
}

/// Commit a send/receive match. The receive's payload is filled; a
/// synchronous send finishes here.
pub fn commit_match(
    state: &mut GlobalState,
    sender: Rank,
    send_id: ReqId,
    receiver: Rank,
    recv_id: ReqId,
    events: &mut Vec<Event>,
) -> Result<(), Fault> {
    let (payload, send_was_done) = {
        let send_proc = state.proc_mut(sender);
        let send = send_proc
            .request_mut(send_id)
            .ok_or(Fault::InvalidHandle {
                rank: sender,
                kind: "request",
                handle: send_id.seq as u64,
            })?;
        let was_done = send.done;
        let payload = match &mut send.kind {
            RequestKind::Send {
                payload, matched, ..
            } => {
                debug_assert!(!*matched);
                *matched = true;
                payload.clone()
            }
            _ => {
                return Err(Fault::InvalidHandle {
                    rank: sender,
                    kind: "send-request",
                    handle: send_id.seq as u64,
                })
            }
        };
        send.done = true;
        (payload, was_done)
    };
    if !send_was_done {
        events.push(Event::RequestDone {
            rank: sender,
            req: send_id,
        });
    }
    // A send the owner already consumed was only kept alive for this match.
    {
        let send_proc = state.proc_mut(sender);
        if send_proc.retired.contains(&send_id) && !send_proc.request(send_id).map(|r| r.persistent).unwrap_or(false) {
            send_proc.active.retain(|r| r.id != send_id);
        }
    }

    let recv_proc = state.proc_mut(receiver);
    let recv = recv_proc
        .request_mut(recv_id)
        .ok_or(Fault::InvalidHandle {
            rank: receiver,
            kind: "request",
            handle: recv_id.seq as u64,
        })?;
    match &mut recv.kind {
        RequestKind::Recv {
            capacity,
            payload: slot,
            matched_from,
            ..
        } => {
            if payload.len > *capacity {
                return Err(Fault::MessageTruncated {
                    rank: receiver,
                    capacity: *capacity,
                    got: payload.len,
                });
            }
            *slot = Some(payload);
            *matched_from = Some(sender);
        }
        _ => {
            return Err(Fault::InvalidHandle {
                rank: receiver,
                kind: "recv-request",
                handle: recv_id.seq as u64,
            })
        }
    }
    recv.done = true;
    recv_proc.probe_promise = None;
    events.push(Event::RequestDone {
        rank: receiver,
        req: recv_id,
    });
    events.push(Event::Matched {
        sender,
        send: send_id,
        receiver,
        recv: recv_id,
    });
    trace!(sender, receiver, %send_id, %recv_id, "match committed");
    Ok(())
}

fn combine(op: ReduceOp, a: i64, b: i64) -> Option<i64> {
    Some(match op {
        ReduceOp::Sum => a.wrapping_add(b),
        ReduceOp::Prod => a.wrapping_mul(b),
        ReduceOp::Min => a.min(b),
        ReduceOp::Max => a.max(b),
        ReduceOp::Land => ((a != 0) && (b != 0)) as i64,
        ReduceOp::Lor => ((a != 0) || (b != 0)) as i64,
        // User operators run inside the target program; the engine cannot
        // evaluate them here. The worker materializes the result via
        // RUN_FUNCTION instead.
        ReduceOp::User(_) => return None,
    })
}

fn bytes_to_i64s(bytes: &[u8]) -> Vec<i64> {
    bytes
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

fn i64s_to_bytes(vals: &[i64]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Compute per-rank results for a fully entered collective.
fn resolve_collective(
    state: &mut GlobalState,
    coll_id: CollId,
    bufs: &mut dyn BufStore,
) -> Result<(), Fault> {
    // Communicator ids for split/dup must be allocated deterministically.
    let mut fresh_ids: Vec<CommId> = Vec::new();
    let (kind, expected) = {
        let op = state.collective(coll_id).unwrap();
        (op.kind, op.expected)
    };
    let group = {
        let op = state.collective(coll_id).unwrap();
        // Any participant's view of the communicator group will do; take the
        // first entered rank's.
        let comm = op.comm;
        let first = state
            .procs
            .iter()
            .find_map(|p| p.comm(comm).cloned())
            .expect("collective on unknown communicator");
        first.group
    };

    match kind {
        CollKind::CommSplit => {
            // One fresh id per distinct color, ascending.
            let op = state.collective(coll_id).unwrap();
            let mut colors: Vec<i64> = op
                .split_keys
                .iter()
                .filter_map(|k| k.map(|(c, _)| c))
                .filter(|&c| c >= 0)
                .collect();
            colors.sort_unstable();
            colors.dedup();
            for _ in &colors {
                fresh_ids.push(state.alloc_comm_id());
            }
            let op = state.collective_mut(coll_id).unwrap();
            for local in 0..expected {
                let Some((color, _key)) = op.split_keys[local] else {
                    continue;
                };
                if color < 0 {
                    // Undefined color: the rank gets no communicator.
                    continue;
                }
                let idx = colors.binary_search(&color).unwrap();
                // Members of this color, ordered by (key, world rank).
                let mut members: Vec<(i64, Rank)> = op
                    .split_keys
                    .iter()
                    .enumerate()
                    .filter_map(|(l, k)| {
                        k.and_then(|(c, key)| {
                            (c == color).then(|| (key, group.ranks[l]))
                        })
                    })
                    .collect();
                members.sort_unstable();
                op.new_comms[local] = Some(Communicator {
                    id: fresh_ids[idx],
                    group: Group {
                        ranks: members.into_iter().map(|(_, r)| r).collect(),
                    },
                    coll_seq: 0,
                    permanent: false,
                });
            }
        }
        CollKind::CommDup => {
            let id = state.alloc_comm_id();
            let op = state.collective_mut(coll_id).unwrap();
            for local in 0..expected {
                op.new_comms[local] = Some(Communicator {
                    id,
                    group: group.clone(),
                    coll_seq: 0,
                    permanent: false,
                });
            }
        }
        CollKind::Barrier => {}
        CollKind::Bcast { root } => {
            let op = state.collective_mut(coll_id).unwrap();
            let root_local = group.local_rank(root).unwrap_or(0);
            let src = op.data[root_local].clone();
            for local in 0..expected {
                if local != root_local {
                    op.results[local] = src.clone();
                }
            }
        }
        CollKind::Gather { root } | CollKind::Gatherv { root } => {
            let (contrib, root_local) = {
                let op = state.collective(coll_id).unwrap();
                (op.data.clone(), group.local_rank(root).unwrap_or(0))
            };
            let mut all = Vec::new();
            for buf in contrib.iter().flatten() {
                all.extend_from_slice(bufs.bytes(buf.id));
            }
            let gathered = bufs.alloc(all);
            let op = state.collective_mut(coll_id).unwrap();
            op.results[root_local] = Some(gathered);
        }
        CollKind::Scatter { root } | CollKind::Scatterv { root } => {
            let (src, root_local) = {
                let op = state.collective(coll_id).unwrap();
                (op.data.clone(), group.local_rank(root).unwrap_or(0))
            };
            if let Some(buf) = &src[root_local] {
                let bytes = bufs.bytes(buf.id).to_vec();
                if expected > 0 && bytes.len() % expected != 0 {
                    return Err(Fault::InvalidArgument {
                        rank: group.ranks[root_local],
                        detail: format!(
                            "scatter payload of {} bytes does not split over {} ranks",
                            bytes.len(),
                            expected
                        ),
                    });
                }
                let chunk = bytes.len() / expected.max(1);
                let mut slices = Vec::with_capacity(expected);
                for local in 0..expected {
                    let lo = local * chunk;
                    let hi = (lo + chunk).min(bytes.len());
                    slices.push(bufs.alloc(bytes[lo..hi].to_vec()));
                }
                let op = state.collective_mut(coll_id).unwrap();
                for (local, slice) in slices.into_iter().enumerate() {
                    op.results[local] = Some(slice);
                }
            }
        }
        CollKind::Reduce { root, op: rop } => {
            let (contrib, root_local) = {
                let op = state.collective(coll_id).unwrap();
                (op.data.clone(), group.local_rank(root).unwrap_or(0))
            };
            if let Some(result) = reduce_contributions(&contrib, rop, &group, bufs)? {
                let buf = bufs.alloc(result);
                let op = state.collective_mut(coll_id).unwrap();
                op.results[root_local] = Some(buf);
            }
        }
        CollKind::Allreduce { op: rop } => {
            let contrib = state.collective(coll_id).unwrap().data.clone();
            if let Some(result) = reduce_contributions(&contrib, rop, &group, bufs)? {
                let buf = bufs.alloc(result);
                let op = state.collective_mut(coll_id).unwrap();
                for local in 0..expected {
                    op.results[local] = Some(buf.clone());
                }
            }
        }
    }

    let op = state.collective_mut(coll_id).unwrap();
    op.resolved = true;
    Ok(())
}

/// Fold the per-rank contributions element-wise. Contributions are arrays of
/// little-endian i64; a ragged length or a rank disagreeing on the element
/// count is a usage fault on that rank. `Ok(None)` means the operator is
/// user-defined and the engine leaves the result unmaterialized.
fn reduce_contributions(
    contrib: &[Option<BufRef>],
    rop: ReduceOp,
    group: &Group,
    bufs: &dyn BufStore,
) -> Result<Option<Vec<u8>>, Fault> {
    let mut acc: Option<Vec<i64>> = None;
    for (local, buf) in contrib.iter().enumerate() {
        let Some(buf) = buf else {
            continue;
        };
        let bytes = bufs.bytes(buf.id);
        if bytes.len() % 8 != 0 {
            return Err(Fault::InvalidArgument {
                rank: group.ranks[local],
                detail: format!(
                    "reduce contribution of {} bytes is not whole 8-byte elements",
                    bytes.len()
                ),
            });
        }
        let vals = bytes_to_i64s(bytes);
        acc = Some(match acc {
            None => vals,
            Some(prev) => {
                if prev.len() != vals.len() {
                    return Err(Fault::InvalidArgument {
                        rank: group.ranks[local],
                        detail: format!(
                            "reduce contribution of {} elements, others sent {}",
                            vals.len(),
                            prev.len()
                        ),
                    });
                }
                let combined: Option<Vec<i64>> = prev
                    .iter()
                    .zip(vals.iter())
                    .map(|(&a, &b)| combine(rop, a, b))
                    .collect();
                match combined {
                    Some(v) => v,
                    None => return Ok(None),
                }
            }
        });
    }
    Ok(acc.map(|vals| i64s_to_bytes(&vals)))
}

/// Consume one finished request from a wait/test on `rank`: retire it,
/// unlock its memory region, and apply collective completion effects.
fn consume_one(
    state: &mut GlobalState,
    rank: Rank,
    req_id: ReqId,
    events: &mut Vec<Event>,
) -> Result<(), Fault> {
    let (coll, addr) = {
        let proc = state.proc(rank);
        let req = proc.request(req_id).ok_or(Fault::InvalidHandle {
            rank,
            kind: "request",
            handle: req_id.seq as u64,
        })?;
        debug_assert!(req.done, "consuming an unfinished request");
        match &req.kind {
            RequestKind::Collective { op } => (Some(*op), 0),
            RequestKind::Send { addr, .. } => (None, *addr),
            RequestKind::Recv { addr, .. } => (None, *addr),
            RequestKind::Completed => (None, 0),
        }
    };

    if let Some(coll_id) = coll {
        let local = {
            let op = state.collective(coll_id).unwrap();
            let comm = op.comm;
            state
                .proc(rank)
                .comm(comm)
                .and_then(|c| c.group.local_rank(rank))
                .unwrap_or(0)
        };
        let (new_comm, disposed) = {
            let op = state.collective_mut(coll_id).unwrap();
            let new_comm = op.new_comms[local].take();
            let disposed = op.complete_one();
            (new_comm, disposed)
        };
        if let Some(c) = new_comm {
            state.proc_mut(rank).comms.push(c);
        }
        if disposed {
            state.collectives.retain(|c| c.id != coll_id);
            events.push(Event::CollectiveDone { op: coll_id });
        }
    }

    let proc = state.proc_mut(rank);
    if addr != 0 {
        proc.locked.retain(|&(a, _)| a != addr);
    }
    proc.consume_request(req_id);
    Ok(())
}

/// Complete a wait by consuming `reqs` and returning the process to Ready.
pub fn complete_wait(
    state: &mut GlobalState,
    rank: Rank,
    reqs: &[ReqId],
    events: &mut Vec<Event>,
) -> Result<(), Fault> {
    for &id in reqs {
        consume_one(state, rank, id, events)?;
    }
    let proc = state.proc_mut(rank);
    proc.wait_set.clear();
    proc.status = ProcStatus::Ready;
    events.push(Event::Stepped { rank });
    Ok(())
}

/// Apply every deterministic completion rule to a fixpoint: fixed-source
/// matches, promised-probe matches, collective readiness, and WaitAll
/// completion. Nondeterministic choices are left to the enumerator.
pub fn fast_expand(
    state: &mut GlobalState,
    bufs: &mut dyn BufStore,
    events: &mut Vec<Event>,
) -> Result<(), Fault> {
    loop {
        let mut progressed = false;

        // Promised probe matches bind the next compatible receive.
        for rank in 0..state.world_size() {
            let Some((sender, send_id)) = state.proc(rank).probe_promise else {
                continue;
            };
            let recv = state.proc(rank).active.iter().find_map(|r| {
                if r.done {
                    return None;
                }
                match &r.kind {
                    RequestKind::Recv { .. } => Some(r.id),
                    _ => None,
                }
            });
            if let Some(recv_id) = recv {
                // The promise only holds if the send is still unmatched.
                if state.proc(sender).request(send_id).is_some() {
                    commit_match(state, sender, send_id, rank, recv_id, events)?;
                    progressed = true;
                }
            }
        }

        // Deterministic fixed-source matches, oldest receive first.
        'receivers: for rank in 0..state.world_size() {
            let candidates: Vec<(usize, ReqId, Rank, CommId, Option<Tag>)> = state
                .proc(rank)
                .active
                .iter()
                .enumerate()
                .filter_map(|(pos, r)| {
                    if r.done {
                        return None;
                    }
                    match &r.kind {
                        RequestKind::Recv {
                            source: Source::Rank(s),
                            tag,
                            comm,
                            payload: None,
                            ..
                        } => Some((pos, r.id, *s, *comm, *tag)),
                        _ => None,
                    }
                })
                .collect();
            for (pos, recv_id, sender, comm, tag) in candidates {
                let Some(send_id) = oldest_eligible_send(state, sender, rank, comm, tag) else {
                    continue;
                };
                let send = state.proc(sender).request(send_id).unwrap().clone();
                if masked(state.proc(rank), pos, sender, &send) {
                    continue;
                }
                commit_match(state, sender, send_id, rank, recv_id, events)?;
                progressed = true;
                continue 'receivers;
            }
        }

        // Collectives with all ranks entered: compute results, finish every
        // participant's request.
        let ready: Vec<CollId> = state
            .collectives
            .iter()
            .filter(|op| op.ready() && !op.resolved)
            .map(|op| op.id)
            .collect();
        for coll_id in ready {
            resolve_collective(state, coll_id, bufs)?;
            for rank in 0..state.world_size() {
                let req = state.proc(rank).active.iter().find_map(|r| match &r.kind {
                    RequestKind::Collective { op } if *op == coll_id && !r.done => Some(r.id),
                    _ => None,
                });
                if let Some(req_id) = req {
                    state.proc_mut(rank).request_mut(req_id).unwrap().done = true;
                    events.push(Event::RequestDone { rank, req: req_id });
                }
            }
            progressed = true;
        }

        // WaitAll completes exactly when every tested request is finished.
        for rank in 0..state.world_size() {
            if state.proc(rank).status != ProcStatus::WaitAll {
                continue;
            }
            let set: Vec<ReqId> = state.proc(rank).wait_set.to_vec();
            let all_done = set
                .iter()
                .all(|&id| state.proc(rank).request(id).map(|r| r.done).unwrap_or(true));
            if all_done {
                complete_wait(state, rank, &set, events)?;
                progressed = true;
            }
        }

        if !progressed {
            break;
        }
    }
    state.check_invariants();
    Ok(())
}

#[cfg(test)]
pub(crate) mod teststore {
    use super::*;
    use crate::hash::hash_bytes;
    use crate::resource::ResourceManager;

    /// Minimal buffer store over a `ResourceManager`, shared by model tests.
    #[derive(Default)]
    pub struct VecStore {
        pub mgr: ResourceManager<Vec<u8>>,
    }

    impl BufStore for VecStore {
        fn bytes(&self, id: ResourceId) -> &[u8] {
            self.mgr.get(id)
        }

        fn alloc(&mut self, bytes: Vec<u8>) -> BufRef {
            let hash = hash_bytes(&bytes);
            let len = bytes.len();
            let (id, _) = self.mgr.alloc(hash, bytes);
            BufRef { hash, len, id }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::teststore::VecStore;
    use super::*;

    fn send_call(dest: i64, tag: Tag, bytes: &[u8], store: &mut VecStore) -> ProgramCall {
        ProgramCall::Send {
            dest: Some(dest),
            tag,
            comm: CommId::WORLD,
            payload: store.alloc(bytes.to_vec()),
            addr: 0,
            mode: SendMode::Standard,
            nonblocking: false,
        }
    }

    fn recv_call(source: Source, tag: Option<Tag>) -> ProgramCall {
        ProgramCall::Recv {
            source,
            tag,
            comm: CommId::WORLD,
            addr: 0,
            capacity: 1 << 16,
            nonblocking: false,
        }
    }

    #[test]
    fn test_blocking_send_recv_pair_completes() {
        let mut store = VecStore::default();
        let mut state = GlobalState::new(2);
        let mut events = Vec::new();
        let call = send_call(1, 3, b"hi", &mut store);
        apply_call(&mut state, 0, call, SendProtocol::Eager, &mut events).unwrap();
        fast_expand(&mut state, &mut store, &mut events).unwrap();
        // Eager: sender already unblocked.
        assert_eq!(state.proc(0).status, ProcStatus::Ready);

        apply_call(
            &mut state,
            1,
            recv_call(Source::Rank(0), Some(3)),
            SendProtocol::Eager,
            &mut events,
        )
        .unwrap();
        fast_expand(&mut state, &mut store, &mut events).unwrap();
        assert_eq!(state.proc(1).status, ProcStatus::Ready);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Matched { sender: 0, receiver: 1, .. })));
    }

    #[test]
    fn test_rendezvous_send_blocks_until_matched() {
        let mut store = VecStore::default();
        let mut state = GlobalState::new(2);
        let mut events = Vec::new();
        let call = send_call(1, 0, b"x", &mut store);
        apply_call(&mut state, 0, call, SendProtocol::Rendezvous, &mut events).unwrap();
        fast_expand(&mut state, &mut store, &mut events).unwrap();
        assert_eq!(state.proc(0).status, ProcStatus::WaitAll);

        apply_call(
            &mut state,
            1,
            recv_call(Source::Rank(0), None),
            SendProtocol::Rendezvous,
            &mut events,
        )
        .unwrap();
        fast_expand(&mut state, &mut store, &mut events).unwrap();
        assert_eq!(state.proc(0).status, ProcStatus::Ready);
        assert_eq!(state.proc(1).status, ProcStatus::Ready);
    }

    #[test]
    fn test_fifo_matching_order() {
        let mut store = VecStore::default();
        let mut state = GlobalState::new(2);
        let mut events = Vec::new();
        // Two nonblocking sends 0 -> 1 with the same tag.
        for msg in [b"first", b"secnd"] {
            let mut call = send_call(1, 9, msg, &mut store);
            if let ProgramCall::Send { nonblocking, .. } = &mut call {
                *nonblocking = true;
            }
            apply_call(&mut state, 0, call, SendProtocol::Eager, &mut events).unwrap();
        }
        // Receives match in post order.
        apply_call(
            &mut state,
            1,
            recv_call(Source::Rank(0), Some(9)),
            SendProtocol::Eager,
            &mut events,
        )
        .unwrap();
        fast_expand(&mut state, &mut store, &mut events).unwrap();
        let first = state.proc(1).active.iter().find(|r| r.is_recv());
        // Blocking recv was consumed; check via events instead.
        assert!(first.is_none());
        let matched: Vec<ReqId> = events
            .iter()
            .filter_map(|e| match e {
                Event::Matched { send, .. } => Some(*send),
                _ => None,
            })
            .collect();
        assert_eq!(matched, vec![ReqId::new(0, 0)]);
    }

    #[test]
    fn test_wildcard_not_auto_matched() {
        let mut store = VecStore::default();
        let mut state = GlobalState::new(3);
        let mut events = Vec::new();
        for sender in [1i64, 2] {
            let call = send_call(0, 1, b"m", &mut store);
            // Rewrite the destination: the senders target rank 0.
            let call = match call {
                ProgramCall::Send { tag, payload, addr, mode, comm, .. } => ProgramCall::Send {
                    dest: Some(0),
                    tag,
                    comm,
                    payload,
                    addr,
                    mode,
                    nonblocking: true,
                },
                _ => unreachable!(),
            };
            apply_call(&mut state, sender as usize, call, SendProtocol::Eager, &mut events)
                .unwrap();
        }
        apply_call(
            &mut state,
            0,
            recv_call(Source::Any, Some(1)),
            SendProtocol::Eager,
            &mut events,
        )
        .unwrap();
        fast_expand(&mut state, &mut store, &mut events).unwrap();
        // Still blocked: the wildcard match is a branch point.
        assert_eq!(state.proc(0).status, ProcStatus::WaitAll);
        let senders = eligible_senders(&state, 0, Some(0), Source::Any, CommId::WORLD, Some(1));
        assert_eq!(
            senders.iter().map(|(r, _)| *r).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn test_barrier_roundtrip() {
        let mut store = VecStore::default();
        let mut state = GlobalState::new(2);
        let mut events = Vec::new();
        for rank in 0..2 {
            apply_call(
                &mut state,
                rank,
                ProgramCall::Collective {
                    kind: CollKind::Barrier,
                    comm: CommId::WORLD,
                    blocking: true,
                    data: None,
                    split_key: None,
                },
                SendProtocol::Eager,
                &mut events,
            )
            .unwrap();
        }
        fast_expand(&mut state, &mut store, &mut events).unwrap();
        assert!(state.collectives.is_empty());
        assert_eq!(state.proc(0).status, ProcStatus::Ready);
        assert_eq!(state.proc(1).status, ProcStatus::Ready);
        assert!(events.iter().any(|e| matches!(e, Event::CollectiveDone { .. })));
    }

    #[test]
    fn test_collective_kind_mismatch_fault() {
        let mut state = GlobalState::new(2);
        let mut events = Vec::new();
        apply_call(
            &mut state,
            0,
            ProgramCall::Collective {
                kind: CollKind::Barrier,
                comm: CommId::WORLD,
                blocking: true,
                data: None,
                split_key: None,
            },
            SendProtocol::Eager,
            &mut events,
        )
        .unwrap();
        let err = apply_call(
            &mut state,
            1,
            ProgramCall::Collective {
                kind: CollKind::CommDup,
                comm: CommId::WORLD,
                blocking: true,
                data: None,
                split_key: None,
            },
            SendProtocol::Eager,
            &mut events,
        );
        assert!(matches!(err, Err(Fault::CollectiveMismatch { .. })));
    }

    #[test]
    fn test_allreduce_sums() {
        let mut store = VecStore::default();
        let mut state = GlobalState::new(2);
        let mut events = Vec::new();
        for (rank, v) in [(0usize, 4i64), (1, 6)] {
            let data = Some(store.alloc(v.to_le_bytes().to_vec()));
            apply_call(
                &mut state,
                rank,
                ProgramCall::Collective {
                    kind: CollKind::Allreduce { op: ReduceOp::Sum },
                    comm: CommId::WORLD,
                    blocking: false,
                    data,
                    split_key: None,
                },
                SendProtocol::Eager,
                &mut events,
            )
            .unwrap();
        }
        fast_expand(&mut state, &mut store, &mut events).unwrap();
        let op = &state.collectives[0];
        let result = op.results[0].as_ref().unwrap();
        assert_eq!(store.bytes(result.id), 10i64.to_le_bytes());
    }

    #[test]
    fn test_comm_split_groups_by_color() {
        let mut store = VecStore::default();
        let mut state = GlobalState::new(3);
        let mut events = Vec::new();
        // Ranks 0 and 2 join color 0; rank 1 joins color 1.
        for (rank, color) in [(0usize, 0i64), (1, 1), (2, 0)] {
            apply_call(
                &mut state,
                rank,
                ProgramCall::Collective {
                    kind: CollKind::CommSplit,
                    comm: CommId::WORLD,
                    blocking: true,
                    data: None,
                    split_key: Some((color, rank as i64)),
                },
                SendProtocol::Eager,
                &mut events,
            )
            .unwrap();
        }
        fast_expand(&mut state, &mut store, &mut events).unwrap();
        let c0 = state.proc(0).comms.last().unwrap().clone();
        let c1 = state.proc(1).comms.last().unwrap().clone();
        let c2 = state.proc(2).comms.last().unwrap().clone();
        assert_eq!(c0.group.ranks, vec![0, 2]);
        assert_eq!(c2.group.ranks, vec![0, 2]);
        assert_eq!(c1.group.ranks, vec![1]);
        assert_eq!(c0.id, c2.id);
        assert_ne!(c0.id, c1.id);
    }

    #[test]
    fn test_null_peer_completes_immediately() {
        let mut state = GlobalState::new(1);
        let mut events = Vec::new();
        apply_call(
            &mut state,
            0,
            ProgramCall::Recv {
                source: Source::Null,
                tag: None,
                comm: CommId::WORLD,
                addr: 0,
                capacity: 0,
                nonblocking: false,
            },
            SendProtocol::Eager,
            &mut events,
        )
        .unwrap();
        let mut store = VecStore::default();
        fast_expand(&mut state, &mut store, &mut events).unwrap();
        assert_eq!(state.proc(0).status, ProcStatus::Ready);
    }

    #[test]
    fn test_invalid_rank_fault() {
        let mut store = VecStore::default();
        let mut state = GlobalState::new(2);
        let mut events = Vec::new();
        let call = send_call(5, 0, b"x", &mut store);
        let err = apply_call(&mut state, 0, call, SendProtocol::Eager, &mut events);
        assert!(matches!(err, Err(Fault::InvalidRank { value: 5, .. })));
    }

    #[test]
    fn test_double_finalize_fault() {
        let mut state = GlobalState::new(1);
        let mut events = Vec::new();
        apply_call(&mut state, 0, ProgramCall::Finalize, SendProtocol::Eager, &mut events)
            .unwrap();
        let err = apply_call(&mut state, 0, ProgramCall::Finalize, SendProtocol::Eager, &mut events);
        assert!(matches!(err, Err(Fault::DoubleFinalize { rank: 0 })));
    }

    #[test]
    fn test_call_after_finalize_fault() {
        let mut store = VecStore::default();
        let mut state = GlobalState::new(2);
        let mut events = Vec::new();
        apply_call(&mut state, 0, ProgramCall::Finalize, SendProtocol::Eager, &mut events)
            .unwrap();
        let call = send_call(1, 0, b"late", &mut store);
        let err = apply_call(&mut state, 0, call, SendProtocol::Eager, &mut events);
        assert!(matches!(err, Err(Fault::CallAfterFinalize { rank: 0 })));
        // Exit stays legal after finalize.
        apply_call(&mut state, 0, ProgramCall::Exit, SendProtocol::Eager, &mut events).unwrap();
    }

    #[test]
    fn test_scatter_indivisible_payload_faults_root() {
        let mut store = VecStore::default();
        let mut state = GlobalState::new(2);
        let mut events = Vec::new();
        // Five bytes over two ranks: no equal split exists.
        for rank in 0..2usize {
            let data = (rank == 0).then(|| store.alloc(b"abcde".to_vec()));
            apply_call(
                &mut state,
                rank,
                ProgramCall::Collective {
                    kind: CollKind::Scatter { root: 0 },
                    comm: CommId::WORLD,
                    blocking: true,
                    data,
                    split_key: None,
                },
                SendProtocol::Eager,
                &mut events,
            )
            .unwrap();
        }
        let err = fast_expand(&mut state, &mut store, &mut events);
        assert!(matches!(err, Err(Fault::InvalidArgument { rank: 0, .. })));
    }

    #[test]
    fn test_scatter_splits_evenly() {
        let mut store = VecStore::default();
        let mut state = GlobalState::new(2);
        let mut events = Vec::new();
        for rank in 0..2usize {
            let data = (rank == 0).then(|| store.alloc(b"abcd".to_vec()));
            apply_call(
                &mut state,
                rank,
                ProgramCall::Collective {
                    kind: CollKind::Scatter { root: 0 },
                    comm: CommId::WORLD,
                    blocking: false,
                    data,
                    split_key: None,
                },
                SendProtocol::Eager,
                &mut events,
            )
            .unwrap();
        }
        fast_expand(&mut state, &mut store, &mut events).unwrap();
        let op = &state.collectives[0];
        assert_eq!(store.bytes(op.results[0].as_ref().unwrap().id), b"ab");
        assert_eq!(store.bytes(op.results[1].as_ref().unwrap().id), b"cd");
    }

    #[test]
    fn test_reduce_malformed_contributions_fault() {
        // A contribution that is not whole 8-byte elements.
        let mut store = VecStore::default();
        let mut state = GlobalState::new(2);
        let mut events = Vec::new();
        for (rank, bytes) in [(0usize, &b"12345678"[..]), (1, &b"12345"[..])] {
            let data = Some(store.alloc(bytes.to_vec()));
            apply_call(
                &mut state,
                rank,
                ProgramCall::Collective {
                    kind: CollKind::Allreduce { op: ReduceOp::Sum },
                    comm: CommId::WORLD,
                    blocking: false,
                    data,
                    split_key: None,
                },
                SendProtocol::Eager,
                &mut events,
            )
            .unwrap();
        }
        let err = fast_expand(&mut state, &mut store, &mut events);
        assert!(matches!(err, Err(Fault::InvalidArgument { rank: 1, .. })));

        // Ranks disagreeing on the element count.
        let mut store = VecStore::default();
        let mut state = GlobalState::new(2);
        let mut events = Vec::new();
        for (rank, count) in [(0usize, 1usize), (1, 2)] {
            let data = Some(store.alloc(vec![0u8; count * 8]));
            apply_call(
                &mut state,
                rank,
                ProgramCall::Collective {
                    kind: CollKind::Allreduce { op: ReduceOp::Sum },
                    comm: CommId::WORLD,
                    blocking: false,
                    data,
                    split_key: None,
                },
                SendProtocol::Eager,
                &mut events,
            )
            .unwrap();
        }
        let err = fast_expand(&mut state, &mut store, &mut events);
        assert!(matches!(err, Err(Fault::InvalidArgument { rank: 1, .. })));
    }

    #[test]
    fn test_wait_some_oversized_set_faults() {
        let mut store = VecStore::default();
        let mut state = GlobalState::new(2);
        let mut events = Vec::new();
        let mut ids = Vec::new();
        for tag in 0..64i32 {
            let mut call = send_call(1, tag, b"p", &mut store);
            if let ProgramCall::Send { nonblocking, .. } = &mut call {
                *nonblocking = true;
            }
            apply_call(&mut state, 0, call, SendProtocol::Eager, &mut events).unwrap();
            ids.push(ReqId::new(0, tag as u32));
        }
        let err = apply_call(
            &mut state,
            0,
            ProgramCall::Wait {
                kind: WaitKind::Some,
                reqs: ids,
            },
            SendProtocol::Eager,
            &mut events,
        );
        assert!(matches!(err, Err(Fault::InvalidCount { rank: 0, count: 64 })));
    }
}
