//! The line-oriented Execution Controller wire protocol.
//!
//! One command per line, one reply per line. Binary payloads travel
//! hex-encoded inside the line so the channel stays textual and greppable.
//! Replies are `OK`, a single value line, or `REPORT <kind> <detail>`.

use crate::error::ExecError;
use parcheck_model::{RuntimeFaultKind, StreamKind};
use std::fmt;

/// Memory-access direction for a `CHECK` probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
        }
    }
}

/// Commands understood by an Execution Controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run until the next intercepted call, the next output, or exit.
    Run,
    /// Run, suppressing the intercepted syscall's real effect.
    RunDropSyscall,
    /// Call a function inside the target and run it to return.
    RunFunction { addr: u64, args: Vec<u64> },

    ReadInt { addr: u64 },
    ReadPointer { addr: u64 },
    ReadString { addr: u64 },
    ReadBytes { addr: u64, len: usize },
    ReadArray { addr: u64, extent: usize, count: usize },
    WriteInt { addr: u64, value: i64 },
    WritePointer { addr: u64, value: u64 },
    WriteString { addr: u64, value: String },
    WriteBytes { addr: u64, bytes: Vec<u8> },
    WriteArray { addr: u64, extent: usize, bytes: Vec<u8> },

    /// Snapshot process memory; replies with a snapshot handle.
    Save,
    Restore { snap: u64 },
    Free { snap: u64 },

    /// Content hash of current process memory.
    Hash,
    HashBuffer { buf: u64 },

    NewBuffer { len: usize },
    FreeBuffer { buf: u64 },
    ReadBuffer { buf: u64 },
    WriteBuffer { buf: u64, bytes: Vec<u8> },

    /// Write-protect a region while a request owns it.
    Lock { addr: u64, len: u64 },
    Unlock { addr: u64, len: u64 },

    Check { access: Access, addr: u64, len: u64 },
    Stats,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Run => write!(f, "RUN"),
            Command::RunDropSyscall => write!(f, "RUN_DROP_SYSCALL"),
            Command::RunFunction { addr, args } => {
                write!(f, "RUN_FUNCTION 0x{addr:x}")?;
                for a in args {
                    write!(f, " 0x{a:x}")?;
                }
                Ok(())
            }
            Command::ReadInt { addr } => write!(f, "READ int 0x{addr:x}"),
            Command::ReadPointer { addr } => write!(f, "READ pointer 0x{addr:x}"),
            Command::ReadString { addr } => write!(f, "READ string 0x{addr:x}"),
            Command::ReadBytes { addr, len } => write!(f, "READ bytes 0x{addr:x} {len}"),
            Command::ReadArray {
                addr,
                extent,
                count,
            } => write!(f, "READ array 0x{addr:x} {extent} {count}"),
            Command::WriteInt { addr, value } => write!(f, "WRITE int 0x{addr:x} {value}"),
            Command::WritePointer { addr, value } => {
                write!(f, "WRITE pointer 0x{addr:x} 0x{value:x}")
            }
            Command::WriteString { addr, value } => {
                write!(f, "WRITE string 0x{addr:x} {}", to_hex(value.as_bytes()))
            }
            Command::WriteBytes { addr, bytes } => {
                write!(f, "WRITE bytes 0x{addr:x} {}", to_hex(bytes))
            }
            Command::WriteArray {
                addr,
                extent,
                bytes,
            } => write!(f, "WRITE array 0x{addr:x} {extent} {}", to_hex(bytes)),
            Command::Save => write!(f, "SAVE"),
            Command::Restore { snap } => write!(f, "RESTORE {snap}"),
            Command::Free { snap } => write!(f, "FREE {snap}"),
            Command::Hash => write!(f, "HASH"),
            Command::HashBuffer { buf } => write!(f, "HASH_BUFFER {buf}"),
            Command::NewBuffer { len } => write!(f, "NEW_BUFFER {len}"),
            Command::FreeBuffer { buf } => write!(f, "FREE_BUFFER {buf}"),
            Command::ReadBuffer { buf } => write!(f, "READ_BUFFER {buf}"),
            Command::WriteBuffer { buf, bytes } => {
                write!(f, "WRITE_BUFFER {buf} {}", to_hex(bytes))
            }
            Command::Lock { addr, len } => write!(f, "LOCK 0x{addr:x} {len}"),
            Command::Unlock { addr, len } => write!(f, "UNLOCK 0x{addr:x} {len}"),
            Command::Check { access, addr, len } => {
                write!(f, "CHECK {access} 0x{addr:x} {len}")
            }
            Command::Stats => write!(f, "STATS"),
        }
    }
}

/// A non-run reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    /// Everything after command-specific parsing is left to the caller.
    Value(String),
    Report {
        kind: RuntimeFaultKind,
        detail: String,
    },
}

/// Where a `RUN` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStop {
    /// The target reached an intercepted call.
    Call { name: String, args: Vec<u64> },
    /// The target exited.
    Exited { code: i32 },
}

/// One line emitted while a `RUN` is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// `OUT stdout|stderr <hex>` — bytes the target wrote to a stream.
    Output { stream: StreamKind, bytes: Vec<u8> },
    Stop(RunStop),
}

pub fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

pub fn from_hex(s: &str) -> Result<Vec<u8>, ExecError> {
    if s.len() % 2 != 0 {
        return Err(ExecError::Malformed { line: s.into() });
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ExecError::Malformed {
                line: s.into(),
            })
        })
        .collect()
}

fn parse_u64(tok: &str, line: &str) -> Result<u64, ExecError> {
    let res = match tok.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => tok.parse(),
    };
    res.map_err(|_| ExecError::Malformed { line: line.into() })
}

fn parse_fault_kind(tok: &str, line: &str) -> Result<RuntimeFaultKind, ExecError> {
    match tok {
        "heap-exhausted" => Ok(RuntimeFaultKind::HeapExhausted),
        "invalid-read" => Ok(RuntimeFaultKind::InvalidRead),
        "invalid-write" => Ok(RuntimeFaultKind::InvalidWrite),
        _ => Err(ExecError::Malformed { line: line.into() }),
    }
}

/// Parse the reply to a non-run command.
pub fn parse_reply(line: &str) -> Result<Reply, ExecError> {
    if line == "OK" {
        return Ok(Reply::Ok);
    }
    if let Some(rest) = line.strip_prefix("REPORT ") {
        let (kind, detail) = rest.split_once(' ').unwrap_or((rest, ""));
        return Ok(Reply::Report {
            kind: parse_fault_kind(kind, line)?,
            detail: detail.to_string(),
        });
    }
    Ok(Reply::Value(line.to_string()))
}

/// Parse one line arriving while a `RUN` is outstanding.
pub fn parse_run_event(line: &str) -> Result<RunEvent, ExecError> {
    let mut toks = line.split(' ');
    match toks.next() {
        Some("OUT") => {
            let stream = match toks.next() {
                Some("stdout") => StreamKind::Stdout,
                Some("stderr") => StreamKind::Stderr,
                _ => return Err(ExecError::Malformed { line: line.into() }),
            };
            let hex = toks.next().unwrap_or("");
            Ok(RunEvent::Output {
                stream,
                bytes: from_hex(hex)?,
            })
        }
        Some("CALL") => {
            let name = toks
                .next()
                .ok_or_else(|| ExecError::Malformed { line: line.into() })?
                .to_string();
            let args = toks
                .map(|t| parse_u64(t, line))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(RunEvent::Stop(RunStop::Call { name, args }))
        }
        Some("EXIT") => {
            let code = toks
                .next()
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| ExecError::Malformed { line: line.into() })?;
            Ok(RunEvent::Stop(RunStop::Exited { code }))
        }
        Some("REPORT") => {
            let kind = toks
                .next()
                .ok_or_else(|| ExecError::Malformed { line: line.into() })?;
            let detail = toks.collect::<Vec<_>>().join(" ");
            Err(ExecError::Report {
                kind: parse_fault_kind(kind, line)?,
                detail,
            })
        }
        _ => Err(ExecError::Malformed { line: line.into() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encoding() {
        assert_eq!(Command::Run.to_string(), "RUN");
        assert_eq!(
            Command::ReadBytes {
                addr: 0x1000,
                len: 8
            }
            .to_string(),
            "READ bytes 0x1000 8"
        );
        assert_eq!(
            Command::WriteBytes {
                addr: 0x20,
                bytes: vec![0xde, 0xad]
            }
            .to_string(),
            "WRITE bytes 0x20 dead"
        );
        assert_eq!(
            Command::Check {
                access: Access::Write,
                addr: 16,
                len: 4
            }
            .to_string(),
            "CHECK write 0x10 4"
        );
        assert_eq!(
            Command::RunFunction {
                addr: 0xff,
                args: vec![1, 2]
            }
            .to_string(),
            "RUN_FUNCTION 0xff 0x1 0x2"
        );
    }

    #[test]
    fn test_hex_round_trip() {
        let bytes = vec![0u8, 1, 0xab, 0xff];
        assert_eq!(from_hex(&to_hex(&bytes)).unwrap(), bytes);
        assert!(from_hex("abc").is_err());
        assert!(from_hex("zz").is_err());
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(parse_reply("OK").unwrap(), Reply::Ok);
        assert_eq!(
            parse_reply("42").unwrap(),
            Reply::Value("42".to_string())
        );
        let r = parse_reply("REPORT invalid-read addr 0x10").unwrap();
        assert_eq!(
            r,
            Reply::Report {
                kind: RuntimeFaultKind::InvalidRead,
                detail: "addr 0x10".to_string()
            }
        );
        assert!(parse_reply("REPORT bogus x").is_err());
    }

    #[test]
    fn test_parse_run_events() {
        assert_eq!(
            parse_run_event("OUT stdout 6869").unwrap(),
            RunEvent::Output {
                stream: StreamKind::Stdout,
                bytes: b"hi".to_vec()
            }
        );
        assert_eq!(
            parse_run_event("CALL send 0x1 0x2 0xff").unwrap(),
            RunEvent::Stop(RunStop::Call {
                name: "send".to_string(),
                args: vec![1, 2, 0xff]
            })
        );
        assert_eq!(
            parse_run_event("EXIT 0").unwrap(),
            RunEvent::Stop(RunStop::Exited { code: 0 })
        );
        assert!(matches!(
            parse_run_event("REPORT heap-exhausted brk failed"),
            Err(ExecError::Report { .. })
        ));
    }
}
