//! Branch-point enumeration.
//!
//! After `fast_expand` reaches its fixpoint, the remaining progress is
//! genuinely nondeterministic: wildcard matches, any/some wait completions,
//! test and probe outcomes. `enumerate` lists every outgoing action in a
//! stable order; applying each to a clone of the state yields the node's
//! successors. An empty list on an unfinished state is a deadlock.

use crate::apply::{complete_wait, commit_match, eligible_senders, BufStore};
use crate::event::Event;
use crate::fault::Fault;
use crate::ids::{Rank, ReqId, Source};
use crate::request::RequestKind;
use crate::state::{GlobalState, ProcStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One nondeterministic choice at a branch point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// A wildcard receive takes this particular sender's message.
    MatchWildcard {
        receiver: Rank,
        recv: ReqId,
        sender: Rank,
        send: ReqId,
    },
    /// A wait-any returns this finished request.
    CompleteAny { rank: Rank, req: ReqId },
    /// A wait-some returns exactly this non-empty subset of finished
    /// requests.
    CompleteSome { rank: Rank, reqs: Vec<ReqId> },
    /// A test observes this flag value.
    TestFlag { rank: Rank, ready: bool },
    /// A blocking probe is promised this sender's oldest eligible message.
    ProbeMatch {
        rank: Rank,
        sender: Rank,
        send: ReqId,
    },
    /// A non-blocking probe reports a match, or no message.
    ProbeFlag {
        rank: Rank,
        matched: Option<(Rank, ReqId)>,
    },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::MatchWildcard {
                receiver,
                recv,
                sender,
                send,
            } => write!(f, "recv {}:{} <- {}:{}", receiver, recv, sender, send),
            Action::CompleteAny { rank, req } => write!(f, "any {}:{}", rank, req),
            Action::CompleteSome { rank, reqs } => {
                write!(f, "some {}:", rank)?;
                for (i, r) in reqs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", r)?;
                }
                Ok(())
            }
            Action::TestFlag { rank, ready } => write!(f, "test {}:{}", rank, ready),
            Action::ProbeMatch { rank, sender, .. } => {
                write!(f, "probe {} <- {}", rank, sender)
            }
            Action::ProbeFlag { rank, matched } => match matched {
                Some((sender, _)) => write!(f, "iprobe {} <- {}", rank, sender),
                None => write!(f, "iprobe {}: none", rank),
            },
        }
    }
}

/// Every action available from `state`, in stable rank order. Requires the
/// state to be fast-expanded first; deterministic completions left in the
/// state would show up here as spurious branches.
pub fn enumerate(state: &GlobalState) -> Vec<Action> {
    let mut actions = Vec::new();
    for rank in 0..state.world_size() {
        let proc = state.proc(rank);
        match proc.status {
            ProcStatus::WaitAny => {
                for &id in &proc.wait_set {
                    if proc.request(id).map(|r| r.done).unwrap_or(true) {
                        actions.push(Action::CompleteAny { rank, req: id });
                    }
                }
            }
            ProcStatus::WaitSome => {
                let finished: Vec<ReqId> = proc
                    .wait_set
                    .iter()
                    .copied()
                    .filter(|&id| proc.request(id).map(|r| r.done).unwrap_or(true))
                    .collect();
                // Every non-empty subset of the finished set is a distinct
                // return value the program can observe. Wait-some sets are
                // capped at 63 entries at post time, so the shift is safe.
                let n = finished.len();
                for mask in 1u64..(1u64 << n) {
                    let reqs: Vec<ReqId> = (0..n)
                        .filter(|i| mask & (1 << i) != 0)
                        .map(|i| finished[i])
                        .collect();
                    actions.push(Action::CompleteSome { rank, reqs });
                }
            }
            ProcStatus::Test => {
                // The flag may always read false (the test raced ahead of
                // completion), and true only once everything finished.
                actions.push(Action::TestFlag { rank, ready: false });
                let all_done = proc
                    .wait_set
                    .iter()
                    .all(|&id| proc.request(id).map(|r| r.done).unwrap_or(true));
                if all_done {
                    actions.push(Action::TestFlag { rank, ready: true });
                }
            }
            ProcStatus::Probe => {
                let spec = proc.probe.clone().expect("probing rank without target");
                let senders =
                    eligible_senders(state, rank, None, spec.source, spec.comm, spec.tag);
                if spec.blocking {
                    for (sender, send) in senders {
                        actions.push(Action::ProbeMatch { rank, sender, send });
                    }
                } else {
                    actions.push(Action::ProbeFlag {
                        rank,
                        matched: None,
                    });
                    for (sender, send) in senders {
                        actions.push(Action::ProbeFlag {
                            rank,
                            matched: Some((sender, send)),
                        });
                    }
                }
            }
            _ => {}
        }
        // Pending wildcard receives branch regardless of process status; a
        // nonblocking wildcard posted before a fixed-source wait still takes
        // messages.
        for (pos, req) in proc.active.iter().enumerate() {
            if req.done {
                continue;
            }
            let RequestKind::Recv {
                source: Source::Any,
                tag,
                comm,
                payload: None,
                ..
            } = &req.kind
            else {
                continue;
            };
            for (sender, send) in
                eligible_senders(state, rank, Some(pos), Source::Any, *comm, *tag)
            {
                actions.push(Action::MatchWildcard {
                    receiver: rank,
                    recv: req.id,
                    sender,
                    send,
                });
            }
        }
    }
    actions
}

/// Apply one enumerated action, then fast-expand back to a fixpoint.
pub fn apply_action(
    state: &mut GlobalState,
    action: &Action,
    bufs: &mut dyn BufStore,
    events: &mut Vec<Event>,
) -> Result<(), Fault> {
    match action {
        Action::MatchWildcard {
            receiver,
            recv,
            sender,
            send,
        } => {
            commit_match(state, *sender, *send, *receiver, *recv, events)?;
        }
        Action::CompleteAny { rank, req } => {
            complete_wait(state, *rank, &[*req], events)?;
        }
        Action::CompleteSome { rank, reqs } => {
            complete_wait(state, *rank, reqs, events)?;
        }
        Action::TestFlag { rank, ready } => {
            if *ready {
                let set: Vec<ReqId> = state.proc(*rank).wait_set.to_vec();
                complete_wait(state, *rank, &set, events)?;
            } else {
                let proc = state.proc_mut(*rank);
                proc.wait_set.clear();
                proc.status = ProcStatus::Ready;
                events.push(Event::Stepped { rank: *rank });
            }
        }
        Action::ProbeMatch { rank, sender, send } => {
            let proc = state.proc_mut(*rank);
            proc.probe = None;
            proc.probe_promise = Some((*sender, *send));
            proc.status = ProcStatus::Ready;
            events.push(Event::Probed {
                rank: *rank,
                sender: *sender,
            });
            events.push(Event::Stepped { rank: *rank });
        }
        Action::ProbeFlag { rank, matched } => {
            let proc = state.proc_mut(*rank);
            proc.probe = None;
            proc.probe_promise = *matched;
            proc.status = ProcStatus::Ready;
            if let Some((sender, _)) = matched {
                events.push(Event::Probed {
                    rank: *rank,
                    sender: *sender,
                });
            }
            events.push(Event::Stepped { rank: *rank });
        }
    }
    crate::apply::fast_expand(state, bufs, events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::teststore::VecStore;
    use crate::apply::{apply_call, ProgramCall, WaitKind};
    use crate::collective::CollKind;
    use crate::ids::{CommId, Tag};
    use crate::request::{SendMode, SendProtocol};

    fn nb_send(store: &mut VecStore, dest: i64, tag: Tag, bytes: &[u8]) -> ProgramCall {
        ProgramCall::Send {
            dest: Some(dest),
            tag,
            comm: CommId::WORLD,
            payload: store.alloc(bytes.to_vec()),
            addr: 0,
            mode: SendMode::Standard,
            nonblocking: true,
        }
    }

    fn nb_recv(source: Source, tag: Option<Tag>) -> ProgramCall {
        ProgramCall::Recv {
            source,
            tag,
            comm: CommId::WORLD,
            addr: 0,
            capacity: 1 << 16,
            nonblocking: true,
        }
    }

    #[test]
    fn test_wildcard_branches_per_sender() {
        let mut store = VecStore::default();
        let mut state = GlobalState::new(3);
        let mut events = Vec::new();
        for sender in [1usize, 2] {
            let call = nb_send(&mut store, 0, 1, b"m");
            apply_call(&mut state, sender, call, SendProtocol::Eager, &mut events).unwrap();
        }
        apply_call(
            &mut state,
            0,
            nb_recv(Source::Any, Some(1)),
            SendProtocol::Eager,
            &mut events,
        )
        .unwrap();
        crate::apply::fast_expand(&mut state, &mut store, &mut events).unwrap();

        let actions = enumerate(&state);
        assert_eq!(actions.len(), 2);
        let senders: Vec<Rank> = actions
            .iter()
            .map(|a| match a {
                Action::MatchWildcard { sender, .. } => *sender,
                other => panic!("unexpected action {other:?}"),
            })
            .collect();
        assert_eq!(senders, vec![1, 2]);

        // Each branch delivers a different sender's payload.
        for action in &actions {
            let mut branch = state.clone();
            let mut ev = Vec::new();
            apply_action(&mut branch, action, &mut store, &mut ev).unwrap();
            let Action::MatchWildcard { sender, recv, .. } = action else {
                unreachable!()
            };
            let req = branch.proc(0).request(*recv).unwrap();
            let RequestKind::Recv { matched_from, .. } = &req.kind else {
                unreachable!()
            };
            assert_eq!(*matched_from, Some(*sender));
        }
        // The base state is untouched.
        assert_eq!(enumerate(&state).len(), 2);
    }

    #[test]
    fn test_wait_some_enumerates_power_set() {
        let mut store = VecStore::default();
        let mut state = GlobalState::new(2);
        let mut events = Vec::new();
        // Three eager sends from 0, all finished at post.
        let mut ids = Vec::new();
        for tag in 0..3 {
            let call = nb_send(&mut store, 1, tag, b"p");
            apply_call(&mut state, 0, call, SendProtocol::Eager, &mut events).unwrap();
            ids.push(ReqId::new(0, tag as u32));
        }
        apply_call(
            &mut state,
            0,
            ProgramCall::Wait {
                kind: WaitKind::Some,
                reqs: ids,
            },
            SendProtocol::Eager,
            &mut events,
        )
        .unwrap();
        crate::apply::fast_expand(&mut state, &mut store, &mut events).unwrap();

        let actions = enumerate(&state);
        // 2^3 - 1 non-empty subsets.
        assert_eq!(actions.len(), 7);
        assert!(actions
            .iter()
            .all(|a| matches!(a, Action::CompleteSome { .. })));
    }

    #[test]
    fn test_wait_any_branches_per_done_request() {
        let mut store = VecStore::default();
        let mut state = GlobalState::new(2);
        let mut events = Vec::new();
        for tag in 0..2 {
            let call = nb_send(&mut store, 1, tag, b"p");
            apply_call(&mut state, 0, call, SendProtocol::Eager, &mut events).unwrap();
        }
        apply_call(
            &mut state,
            0,
            ProgramCall::Wait {
                kind: WaitKind::Any,
                reqs: vec![ReqId::new(0, 0), ReqId::new(0, 1)],
            },
            SendProtocol::Eager,
            &mut events,
        )
        .unwrap();
        crate::apply::fast_expand(&mut state, &mut store, &mut events).unwrap();
        let actions = enumerate(&state);
        assert_eq!(actions.len(), 2);

        let mut branch = state.clone();
        let mut ev = Vec::new();
        apply_action(&mut branch, &actions[0], &mut store, &mut ev).unwrap();
        assert_eq!(branch.proc(0).status, ProcStatus::Ready);
        // One request consumed; both stay active as in-flight unmatched
        // messages.
        assert_eq!(branch.proc(0).retired.len(), 1);
        assert_eq!(branch.proc(0).active.len(), 2);
    }

    #[test]
    fn test_test_flag_false_always_offered() {
        let mut store = VecStore::default();
        let mut state = GlobalState::new(2);
        let mut events = Vec::new();
        // Rendezvous send: not done until matched.
        let call = ProgramCall::Send {
            dest: Some(1),
            tag: 0,
            comm: CommId::WORLD,
            payload: store.alloc(b"x".to_vec()),
            addr: 0,
            mode: SendMode::Standard,
            nonblocking: true,
        };
        apply_call(&mut state, 0, call, SendProtocol::Rendezvous, &mut events).unwrap();
        apply_call(
            &mut state,
            0,
            ProgramCall::Test {
                reqs: vec![ReqId::new(0, 0)],
            },
            SendProtocol::Rendezvous,
            &mut events,
        )
        .unwrap();
        crate::apply::fast_expand(&mut state, &mut store, &mut events).unwrap();
        let actions = enumerate(&state);
        assert_eq!(
            actions,
            vec![Action::TestFlag {
                rank: 0,
                ready: false
            }]
        );
    }

    #[test]
    fn test_blocking_probe_promises_match() {
        let mut store = VecStore::default();
        let mut state = GlobalState::new(2);
        let mut events = Vec::new();
        let call = nb_send(&mut store, 0, 4, b"probe-me");
        apply_call(&mut state, 1, call, SendProtocol::Eager, &mut events).unwrap();
        apply_call(
            &mut state,
            0,
            ProgramCall::Probe {
                source: Source::Any,
                tag: None,
                comm: CommId::WORLD,
                blocking: true,
            },
            SendProtocol::Eager,
            &mut events,
        )
        .unwrap();
        crate::apply::fast_expand(&mut state, &mut store, &mut events).unwrap();
        let actions = enumerate(&state);
        assert_eq!(actions.len(), 1);
        let mut ev = Vec::new();
        apply_action(&mut state, &actions[0], &mut store, &mut ev).unwrap();
        assert_eq!(state.proc(0).probe_promise, Some((1, ReqId::new(1, 0))));

        // The promised message binds the next receive.
        apply_call(
            &mut state,
            0,
            nb_recv(Source::Any, None),
            SendProtocol::Eager,
            &mut events,
        )
        .unwrap();
        crate::apply::fast_expand(&mut state, &mut store, &mut events).unwrap();
        assert_eq!(state.proc(0).probe_promise, None);
        assert!(enumerate(&state).is_empty());
    }

    #[test]
    fn test_nonblocking_probe_offers_none() {
        let mut store = VecStore::default();
        let mut state = GlobalState::new(2);
        let mut events = Vec::new();
        let call = nb_send(&mut store, 0, 4, b"m");
        apply_call(&mut state, 1, call, SendProtocol::Eager, &mut events).unwrap();
        apply_call(
            &mut state,
            0,
            ProgramCall::Probe {
                source: Source::Rank(1),
                tag: Some(4),
                comm: CommId::WORLD,
                blocking: false,
            },
            SendProtocol::Eager,
            &mut events,
        )
        .unwrap();
        crate::apply::fast_expand(&mut state, &mut store, &mut events).unwrap();
        let actions = enumerate(&state);
        assert_eq!(actions.len(), 2);
        assert!(matches!(
            actions[0],
            Action::ProbeFlag { matched: None, .. }
        ));
        assert!(matches!(
            actions[1],
            Action::ProbeFlag {
                matched: Some((1, _)),
                ..
            }
        ));
    }

    #[test]
    fn test_deadlock_is_empty_enumeration() {
        // Cross rendezvous sends with no receivers: classic deadlock.
        let mut store = VecStore::default();
        let mut state = GlobalState::new(2);
        let mut events = Vec::new();
        for (rank, dest) in [(0usize, 1i64), (1, 0)] {
            let call = ProgramCall::Send {
                dest: Some(dest),
                tag: 0,
                comm: CommId::WORLD,
                payload: store.alloc(b"x".to_vec()),
                addr: 0,
                mode: SendMode::Synchronous,
                nonblocking: false,
            };
            apply_call(&mut state, rank, call, SendProtocol::Eager, &mut events).unwrap();
        }
        crate::apply::fast_expand(&mut state, &mut store, &mut events).unwrap();
        assert!(!state.all_finished());
        assert!(state.any_blocked());
        assert!(enumerate(&state).is_empty());
    }

    #[test]
    fn test_collective_is_not_a_branch_point() {
        let mut store = VecStore::default();
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
        crate::apply::fast_expand(&mut state, &mut store, &mut events).unwrap();
        // Rank 0 is blocked waiting on the barrier; no choices exist.
        assert!(enumerate(&state).is_empty());
        assert!(state.any_blocked());
    }
}
