//! Typed session over one Execution Controller.
//!
//! The transport is a trait so the same typed helpers drive a spawned
//! controller child, a pool slot, or a scripted test double.

use crate::error::ExecError;
use crate::proto::{from_hex, parse_reply, parse_run_event, Access, Command, Reply, RunEvent, RunStop};
use parcheck_model::{hash_bytes, ContentHash, StreamKind};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::process::{Child, ChildStdin, ChildStdout, Stdio};
use tracing::{debug, trace};

/// A synchronous line channel to one controller.
pub trait Link {
    fn send_line(&mut self, line: &str) -> Result<(), ExecError>;
    fn recv_line(&mut self) -> Result<String, ExecError>;
}

/// Stdio transport to a spawned controller child process.
pub struct ChildTransport {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl ChildTransport {
    pub fn spawn(program: &str, args: &[String]) -> Result<Self, ExecError> {
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
        let stdout = BufReader::new(child.stdout.take().expect("piped stdout"));
        debug!(program, pid = child.id(), "controller spawned");
        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

impl Link for ChildTransport {
    fn send_line(&mut self, line: &str) -> Result<(), ExecError> {
        self.stdin.write_all(line.as_bytes())?;
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()?;
        Ok(())
    }

    fn recv_line(&mut self) -> Result<String, ExecError> {
        let mut line = String::new();
        let n = self.stdout.read_line(&mut line)?;
        if n == 0 {
            return Err(ExecError::Closed);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }
}

impl Drop for ChildTransport {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Send a command and parse its single-line reply.
pub fn request(link: &mut dyn Link, cmd: &Command) -> Result<Reply, ExecError> {
    let line = cmd.to_string();
    trace!(%line, "-> controller");
    link.send_line(&line)?;
    let reply = link.recv_line()?;
    trace!(%reply, "<- controller");
    parse_reply(&reply)
}

fn expect_ok(reply: Reply) -> Result<(), ExecError> {
    match reply {
        Reply::Ok => Ok(()),
        Reply::Report { kind, detail } => Err(ExecError::Report { kind, detail }),
        Reply::Value(v) => Err(ExecError::Unexpected {
            expected: "OK",
            got: v,
        }),
    }
}

fn expect_value(reply: Reply) -> Result<String, ExecError> {
    match reply {
        Reply::Value(v) => Ok(v),
        Reply::Report { kind, detail } => Err(ExecError::Report { kind, detail }),
        Reply::Ok => Err(ExecError::Unexpected {
            expected: "a value",
            got: "OK".to_string(),
        }),
    }
}

fn parse_dec<T: std::str::FromStr>(v: String) -> Result<T, ExecError> {
    v.parse().map_err(|_| ExecError::Malformed { line: v })
}

/// Run the target until its next intercepted call or exit, collecting any
/// output emitted along the way.
pub fn run(
    link: &mut dyn Link,
    cmd: Command,
) -> Result<(Vec<(StreamKind, Vec<u8>)>, RunStop), ExecError> {
    debug_assert!(matches!(
        cmd,
        Command::Run | Command::RunDropSyscall | Command::RunFunction { .. }
    ));
    link.send_line(&cmd.to_string())?;
    let mut output = Vec::new();
    loop {
        let line = link.recv_line()?;
        match parse_run_event(&line)? {
            RunEvent::Output { stream, bytes } => output.push((stream, bytes)),
            RunEvent::Stop(stop) => {
                trace!(?stop, "run stopped");
                return Ok((output, stop));
            }
        }
    }
}

pub fn read_int(link: &mut dyn Link, addr: u64) -> Result<i64, ExecError> {
    parse_dec(expect_value(request(link, &Command::ReadInt { addr })?)?)
}

pub fn read_pointer(link: &mut dyn Link, addr: u64) -> Result<u64, ExecError> {
    let v = expect_value(request(link, &Command::ReadPointer { addr })?)?;
    let hex = v.strip_prefix("0x").unwrap_or(&v);
    u64::from_str_radix(hex, 16).map_err(|_| ExecError::Malformed { line: v })
}

pub fn read_string(link: &mut dyn Link, addr: u64) -> Result<String, ExecError> {
    let v = expect_value(request(link, &Command::ReadString { addr })?)?;
    let bytes = from_hex(&v)?;
    String::from_utf8(bytes).map_err(|_| ExecError::Malformed { line: v })
}

pub fn read_bytes(link: &mut dyn Link, addr: u64, len: usize) -> Result<Vec<u8>, ExecError> {
    from_hex(&expect_value(request(link, &Command::ReadBytes { addr, len })?)?)
}

pub fn write_bytes(link: &mut dyn Link, addr: u64, bytes: Vec<u8>) -> Result<(), ExecError> {
    expect_ok(request(link, &Command::WriteBytes { addr, bytes })?)
}

pub fn write_int(link: &mut dyn Link, addr: u64, value: i64) -> Result<(), ExecError> {
    expect_ok(request(link, &Command::WriteInt { addr, value })?)
}

/// Snapshot the target's memory; returns the controller-side handle.
pub fn save(link: &mut dyn Link) -> Result<u64, ExecError> {
    parse_dec(expect_value(request(link, &Command::Save)?)?)
}

pub fn restore(link: &mut dyn Link, snap: u64) -> Result<(), ExecError> {
    expect_ok(request(link, &Command::Restore { snap })?)
}

pub fn free(link: &mut dyn Link, snap: u64) -> Result<(), ExecError> {
    expect_ok(request(link, &Command::Free { snap })?)
}

/// Content hash of current target memory. Exactness is the substrate's
/// guarantee; the engine trusts it for dedup.
pub fn hash(link: &mut dyn Link) -> Result<ContentHash, ExecError> {
    let v = expect_value(request(link, &Command::Hash)?)?;
    let hex = v.strip_prefix("0x").unwrap_or(&v);
    u64::from_str_radix(hex, 16)
        .map(ContentHash::from_u64)
        .map_err(|_| ExecError::Malformed { line: v })
}

pub fn new_buffer(link: &mut dyn Link, len: usize) -> Result<u64, ExecError> {
    parse_dec(expect_value(request(link, &Command::NewBuffer { len })?)?)
}

pub fn free_buffer(link: &mut dyn Link, buf: u64) -> Result<(), ExecError> {
    expect_ok(request(link, &Command::FreeBuffer { buf })?)
}

pub fn read_buffer(link: &mut dyn Link, buf: u64) -> Result<Vec<u8>, ExecError> {
    from_hex(&expect_value(request(link, &Command::ReadBuffer { buf })?)?)
}

pub fn write_buffer(link: &mut dyn Link, buf: u64, bytes: Vec<u8>) -> Result<(), ExecError> {
    expect_ok(request(link, &Command::WriteBuffer { buf, bytes })?)
}

pub fn lock(link: &mut dyn Link, addr: u64, len: u64) -> Result<(), ExecError> {
    expect_ok(request(link, &Command::Lock { addr, len })?)
}

pub fn unlock(link: &mut dyn Link, addr: u64, len: u64) -> Result<(), ExecError> {
    expect_ok(request(link, &Command::Unlock { addr, len })?)
}

/// Probe whether a region is readable or writable without faulting.
pub fn check(link: &mut dyn Link, access: Access, addr: u64, len: u64) -> Result<bool, ExecError> {
    let v = expect_value(request(link, &Command::Check { access, addr, len })?)?;
    match v.as_str() {
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err(ExecError::Malformed { line: v }),
    }
}

pub fn stats(link: &mut dyn Link) -> Result<String, ExecError> {
    expect_value(request(link, &Command::Stats)?)
}

/// Pull a buffer's bytes and hash them locally. Used when the substrate's
/// `HASH_BUFFER` is unavailable or distrusted in tests.
pub fn fetch_and_hash(link: &mut dyn Link, buf: u64) -> Result<(Vec<u8>, ContentHash), ExecError> {
    let bytes = read_buffer(link, buf)?;
    let hash = hash_bytes(&bytes);
    Ok((bytes, hash))
}

#[cfg(test)]
pub(crate) mod testlink {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted controller double: records sent lines, replays canned
    /// replies.
    #[derive(Default)]
    pub struct ScriptLink {
        pub sent: Vec<String>,
        pub replies: VecDeque<String>,
    }

    impl ScriptLink {
        pub fn with_replies(replies: &[&str]) -> Self {
            Self {
                sent: Vec::new(),
                replies: replies.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    impl Link for ScriptLink {
        fn send_line(&mut self, line: &str) -> Result<(), ExecError> {
            self.sent.push(line.to_string());
            Ok(())
        }

        fn recv_line(&mut self) -> Result<String, ExecError> {
            self.replies.pop_front().ok_or(ExecError::Closed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testlink::ScriptLink;
    use super::*;

    #[test]
    fn test_run_collects_output_until_stop() {
        let mut link =
            ScriptLink::with_replies(&["OUT stdout 6869", "OUT stderr 21", "CALL barrier 0x0"]);
        let (output, stop) = run(&mut link, Command::Run).unwrap();
        assert_eq!(link.sent, vec!["RUN"]);
        assert_eq!(output.len(), 2);
        assert_eq!(output[0], (StreamKind::Stdout, b"hi".to_vec()));
        assert_eq!(
            stop,
            RunStop::Call {
                name: "barrier".to_string(),
                args: vec![0]
            }
        );
    }

    #[test]
    fn test_typed_reads() {
        let mut link = ScriptLink::with_replies(&["-7", "0xdead", "68656c6c6f"]);
        assert_eq!(read_int(&mut link, 0x10).unwrap(), -7);
        assert_eq!(read_pointer(&mut link, 0x18).unwrap(), 0xdead);
        assert_eq!(read_string(&mut link, 0x20).unwrap(), "hello");
        assert_eq!(
            link.sent,
            vec!["READ int 0x10", "READ pointer 0x18", "READ string 0x20"]
        );
    }

    #[test]
    fn test_snapshot_lifecycle_lines() {
        let mut link = ScriptLink::with_replies(&["3", "OK", "OK"]);
        let snap = save(&mut link).unwrap();
        assert_eq!(snap, 3);
        restore(&mut link, snap).unwrap();
        free(&mut link, snap).unwrap();
        assert_eq!(link.sent, vec!["SAVE", "RESTORE 3", "FREE 3"]);
    }

    #[test]
    fn test_report_reply_surfaces_as_error() {
        let mut link = ScriptLink::with_replies(&["REPORT invalid-write addr 0x0 len 4"]);
        let err = write_int(&mut link, 0, 1).unwrap_err();
        assert!(matches!(err, ExecError::Report { .. }));
    }

    #[test]
    fn test_hash_parses_hex() {
        let mut link = ScriptLink::with_replies(&["0xabc123"]);
        assert_eq!(hash(&mut link).unwrap(), ContentHash::from_u64(0xabc123));
    }

    #[test]
    fn test_check_flag() {
        let mut link = ScriptLink::with_replies(&["1", "0"]);
        assert!(check(&mut link, Access::Read, 0x10, 8).unwrap());
        assert!(!check(&mut link, Access::Write, 0x10, 8).unwrap());
        assert_eq!(
            link.sent,
            vec!["CHECK read 0x10 8", "CHECK write 0x10 8"]
        );
    }
}
