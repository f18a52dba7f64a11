//! A pool of controllers multiplexed by readiness.
//!
//! One worker drives one controller per rank. Each controller's stdout is
//! pumped by a reader thread into a shared channel, so the worker can issue
//! commands to several controllers and then block on whichever replies
//! first. The worker blocks only when every controller it cares about is
//! still pending.

use crate::controller::{ChildTransport, Link};
use crate::error::ExecError;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::JoinHandle;
use tracing::{debug, warn};

struct Slot {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    /// Lines received for this controller while the worker was waiting on a
    /// different one.
    buffered: VecDeque<String>,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

/// A fixed set of controller children with shared readiness.
pub struct ControllerPool {
    slots: Vec<Slot>,
    rx: Receiver<(usize, std::io::Result<String>)>,
    tx: Sender<(usize, std::io::Result<String>)>,
}

impl ControllerPool {
    pub fn new() -> Self {
        let (tx, rx) = channel();
        Self {
            slots: Vec::new(),
            rx,
            tx,
        }
    }

    /// Spawn one controller child and add it to the pool. Returns its index.
    pub fn spawn(&mut self, program: &str, args: &[String]) -> Result<usize, ExecError> {
        let mut child = std::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: program.to_string(),
                source,
            })?;
        let stdin = BufWriter::new(child.stdin.take().expect("piped stdin"));
        let stdout = child.stdout.take().expect("piped stdout");
        let idx = self.slots.len();
        let tx = self.tx.clone();
        let reader = std::thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        while line.ends_with('\n') || line.ends_with('\r') {
                            line.pop();
                        }
                        if tx.send((idx, Ok(line))).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send((idx, Err(e)));
                        break;
                    }
                }
            }
        });
        debug!(program, idx, pid = child.id(), "pool controller spawned");
        self.slots.push(Slot {
            child,
            stdin,
            buffered: VecDeque::new(),
            reader: Some(reader),
            closed: false,
        });
        Ok(idx)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn send(&mut self, idx: usize, line: &str) -> Result<(), ExecError> {
        let slot = &mut self.slots[idx];
        slot.stdin.write_all(line.as_bytes())?;
        slot.stdin.write_all(b"\n")?;
        slot.stdin.flush()?;
        Ok(())
    }

    /// Next line from any controller; blocks until one is ready. Buffered
    /// lines are served before the channel is polled.
    pub fn recv_any(&mut self) -> Result<(usize, String), ExecError> {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if let Some(line) = slot.buffered.pop_front() {
                return Ok((idx, line));
            }
        }
        match self.rx.recv() {
            Ok((idx, Ok(line))) => Ok((idx, line)),
            Ok((idx, Err(e))) => {
                self.slots[idx].closed = true;
                Err(ExecError::Io(e))
            }
            Err(_) => Err(ExecError::Closed),
        }
    }

    /// Next line from a specific controller, buffering lines that arrive for
    /// the others meanwhile.
    pub fn recv_from(&mut self, idx: usize) -> Result<String, ExecError> {
        if let Some(line) = self.slots[idx].buffered.pop_front() {
            return Ok(line);
        }
        loop {
            match self.rx.recv() {
                Ok((got, Ok(line))) => {
                    if got == idx {
                        return Ok(line);
                    }
                    self.slots[got].buffered.push_back(line);
                }
                Ok((got, Err(e))) => {
                    self.slots[got].closed = true;
                    if got == idx {
                        return Err(ExecError::Io(e));
                    }
                    warn!(idx = got, "controller read failed while waiting elsewhere");
                }
                Err(_) => return Err(ExecError::Closed),
            }
        }
    }

    /// Borrow one controller as a [`Link`] for the typed session helpers.
    pub fn link(&mut self, idx: usize) -> PoolLink<'_> {
        PoolLink { pool: self, idx }
    }
}

impl Default for ControllerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ControllerPool {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            let _ = slot.child.kill();
            let _ = slot.child.wait();
            if let Some(handle) = slot.reader.take() {
                let _ = handle.join();
            }
        }
    }
}

/// One pool slot viewed as a synchronous line channel.
pub struct PoolLink<'a> {
    pool: &'a mut ControllerPool,
    idx: usize,
}

impl Link for PoolLink<'_> {
    fn send_line(&mut self, line: &str) -> Result<(), ExecError> {
        self.pool.send(self.idx, line)
    }

    fn recv_line(&mut self) -> Result<String, ExecError> {
        self.pool.recv_from(self.idx)
    }
}

/// Convenience constructor: a standalone controller outside any pool.
pub fn spawn_controller(program: &str, args: &[String]) -> Result<ChildTransport, ExecError> {
    ChildTransport::spawn(program, args)
}

#[cfg(test)]
mod tests {
    use super::*;

    // `cat` echoes its stdin, which is enough to exercise the plumbing.
    fn cat_pool(n: usize) -> ControllerPool {
        let mut pool = ControllerPool::new();
        for _ in 0..n {
            pool.spawn("cat", &[]).unwrap();
        }
        pool
    }

    #[test]
    fn test_round_trip_single() {
        let mut pool = cat_pool(1);
        pool.send(0, "HASH").unwrap();
        assert_eq!(pool.recv_from(0).unwrap(), "HASH");
    }

    #[test]
    fn test_recv_from_buffers_other_slots() {
        let mut pool = cat_pool(2);
        pool.send(0, "alpha").unwrap();
        pool.send(1, "beta").unwrap();
        // Waiting on slot 1 must not lose slot 0's line.
        assert_eq!(pool.recv_from(1).unwrap(), "beta");
        assert_eq!(pool.recv_from(0).unwrap(), "alpha");
    }

    #[test]
    fn test_recv_any_returns_something() {
        let mut pool = cat_pool(2);
        pool.send(1, "only").unwrap();
        let (idx, line) = pool.recv_any().unwrap();
        assert_eq!(idx, 1);
        assert_eq!(line, "only");
    }

    #[test]
    fn test_pool_link_with_session_helpers() {
        use crate::controller::request;
        use crate::proto::{Command, Reply};
        let mut pool = cat_pool(1);
        // cat echoes the command line itself back; it parses as a value.
        let reply = request(&mut pool.link(0), &Command::Stats).unwrap();
        assert_eq!(reply, Reply::Value("STATS".to_string()));
    }
}
