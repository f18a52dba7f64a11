//! The worker-mesh control protocol.
//!
//! Control messages are single text lines; a `BLOB` line announces a binary
//! frame of the given length immediately after it (the `postcard` transfer
//! payload). Channels come in two flavors: in-process `mpsc` pairs and TCP
//! streams, behind one trait so the mesh never cares which it is on. The
//! coordinator splits each channel into halves and parks the receive half on
//! a reader thread, the same layout the controller pool uses.

use crate::error::{CheckError, CheckResult};
use parcheck_model::StateHash;
use std::fmt;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{channel, Receiver, Sender};
use tracing::debug;

/// One mesh control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshMsg {
    /// Worker -> coordinator: a new state with this many outgoing actions.
    State { hash: StateHash, n_actions: usize },
    /// The next blob is a packed transfer payload to retain.
    Save,
    /// Coordinator -> worker: explore one branch of a known state.
    Start { hash: StateHash, action_index: usize },
    /// Drop a retained state.
    Free { hash: StateHash },
    /// A state is about to be handed to `worker`.
    Push { worker: usize, hash: StateHash },
    /// `worker` lacks a state it was started on and asks for it again.
    Pull { worker: usize, hash: StateHash },
    /// Peer channel setup.
    Listen { port: u16 },
    Connect { addr: String },
    /// All frontiers empty: flush and acknowledge.
    FinalCheck,
    Quit,
    /// Binary payload frame.
    Blob(Vec<u8>),
}

impl fmt::Display for MeshMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshMsg::State { hash, n_actions } => write!(f, "STATE {hash} {n_actions}"),
            MeshMsg::Save => write!(f, "SAVE"),
            MeshMsg::Start { hash, action_index } => write!(f, "START {hash} {action_index}"),
            MeshMsg::Free { hash } => write!(f, "FREE {hash}"),
            MeshMsg::Push { worker, hash } => write!(f, "PUSH {worker} {hash}"),
            MeshMsg::Pull { worker, hash } => write!(f, "PULL {worker} {hash}"),
            MeshMsg::Listen { port } => write!(f, "LISTEN {port}"),
            MeshMsg::Connect { addr } => write!(f, "CONNECT {addr}"),
            MeshMsg::FinalCheck => write!(f, "FINAL_CHECK"),
            MeshMsg::Quit => write!(f, "QUIT"),
            MeshMsg::Blob(bytes) => write!(f, "BLOB {}", bytes.len()),
        }
    }
}

fn parse_hash(tok: &str, line: &str) -> CheckResult<StateHash> {
    u64::from_str_radix(tok, 16)
        .map(StateHash::from_u64)
        .map_err(|_| CheckError::Wire { line: line.into() })
}

fn parse_num<T: std::str::FromStr>(tok: Option<&str>, line: &str) -> CheckResult<T> {
    tok.and_then(|t| t.parse().ok())
        .ok_or_else(|| CheckError::Wire { line: line.into() })
}

/// Parse a control line. `Blob` is handled by the channel layer, not here.
pub fn parse_msg(line: &str) -> CheckResult<MeshMsg> {
    let mut toks = line.split(' ');
    let msg = match toks.next() {
        Some("STATE") => {
            let hash = parse_hash(
                toks.next()
                    .ok_or_else(|| CheckError::Wire { line: line.into() })?,
                line,
            )?;
            MeshMsg::State {
                hash,
                n_actions: parse_num(toks.next(), line)?,
            }
        }
        Some("SAVE") => MeshMsg::Save,
        Some("START") => {
            let hash = parse_hash(
                toks.next()
                    .ok_or_else(|| CheckError::Wire { line: line.into() })?,
                line,
            )?;
            MeshMsg::Start {
                hash,
                action_index: parse_num(toks.next(), line)?,
            }
        }
        Some("FREE") => MeshMsg::Free {
            hash: parse_hash(
                toks.next()
                    .ok_or_else(|| CheckError::Wire { line: line.into() })?,
                line,
            )?,
        },
        Some("PUSH") => MeshMsg::Push {
            worker: parse_num(toks.next(), line)?,
            hash: parse_hash(
                toks.next()
                    .ok_or_else(|| CheckError::Wire { line: line.into() })?,
                line,
            )?,
        },
        Some("PULL") => MeshMsg::Pull {
            worker: parse_num(toks.next(), line)?,
            hash: parse_hash(
                toks.next()
                    .ok_or_else(|| CheckError::Wire { line: line.into() })?,
                line,
            )?,
        },
        Some("LISTEN") => MeshMsg::Listen {
            port: parse_num(toks.next(), line)?,
        },
        Some("CONNECT") => MeshMsg::Connect {
            addr: toks
                .next()
                .ok_or_else(|| CheckError::Wire { line: line.into() })?
                .to_string(),
        },
        Some("FINAL_CHECK") => MeshMsg::FinalCheck,
        Some("QUIT") => MeshMsg::Quit,
        _ => return Err(CheckError::Wire { line: line.into() }),
    };
    Ok(msg)
}

/// Send half of a mesh channel.
pub trait ChannelTx: Send {
    fn send(&mut self, msg: MeshMsg) -> CheckResult<()>;
}

/// Receive half of a mesh channel.
pub trait ChannelRx: Send {
    fn recv(&mut self) -> CheckResult<MeshMsg>;
}

/// A bidirectional mesh channel. Workers use it whole; the coordinator
/// splits it and parks the receive half on a reader thread.
pub trait Channel: Send {
    fn send(&mut self, msg: MeshMsg) -> CheckResult<()>;
    fn recv(&mut self) -> CheckResult<MeshMsg>;
    fn split(self: Box<Self>) -> (Box<dyn ChannelTx>, Box<dyn ChannelRx>);
}

/// In-process channel half backed by `std::sync::mpsc`.
pub struct MpscChannel {
    tx: Sender<MeshMsg>,
    rx: Receiver<MeshMsg>,
}

/// A connected pair of in-process channel endpoints.
pub fn mpsc_pair() -> (MpscChannel, MpscChannel) {
    let (atx, brx) = channel();
    let (btx, arx) = channel();
    (
        MpscChannel { tx: atx, rx: arx },
        MpscChannel { tx: btx, rx: brx },
    )
}

pub struct MpscTx(Sender<MeshMsg>);
pub struct MpscRx(Receiver<MeshMsg>);

impl ChannelTx for MpscTx {
    fn send(&mut self, msg: MeshMsg) -> CheckResult<()> {
        self.0.send(msg).map_err(|_| CheckError::ChannelClosed)
    }
}

impl ChannelRx for MpscRx {
    fn recv(&mut self) -> CheckResult<MeshMsg> {
        self.0.recv().map_err(|_| CheckError::ChannelClosed)
    }
}

impl Channel for MpscChannel {
    fn send(&mut self, msg: MeshMsg) -> CheckResult<()> {
        self.tx.send(msg).map_err(|_| CheckError::ChannelClosed)
    }

    fn recv(&mut self) -> CheckResult<MeshMsg> {
        self.rx.recv().map_err(|_| CheckError::ChannelClosed)
    }

    fn split(self: Box<Self>) -> (Box<dyn ChannelTx>, Box<dyn ChannelRx>) {
        (Box::new(MpscTx(self.tx)), Box::new(MpscRx(self.rx)))
    }
}

/// TCP channel: text lines plus length-prefixed blob frames.
pub struct TcpChannel {
    rx: TcpRx,
    tx: TcpTx,
}

pub struct TcpTx {
    writer: BufWriter<TcpStream>,
}

pub struct TcpRx {
    reader: BufReader<TcpStream>,
}

impl TcpChannel {
    pub fn from_stream(stream: TcpStream) -> CheckResult<Self> {
        let reader = BufReader::new(stream.try_clone().map_err(parcheck_exec::ExecError::Io)?);
        let writer = BufWriter::new(stream);
        Ok(Self {
            rx: TcpRx { reader },
            tx: TcpTx { writer },
        })
    }

    pub fn connect(addr: &str) -> CheckResult<Self> {
        let stream = TcpStream::connect(addr).map_err(parcheck_exec::ExecError::Io)?;
        stream
            .set_nodelay(true)
            .map_err(parcheck_exec::ExecError::Io)?;
        debug!(addr, "mesh channel connected");
        Self::from_stream(stream)
    }

    pub fn accept_one(listener: &TcpListener) -> CheckResult<Self> {
        let (stream, peer) = listener.accept().map_err(parcheck_exec::ExecError::Io)?;
        stream
            .set_nodelay(true)
            .map_err(parcheck_exec::ExecError::Io)?;
        debug!(%peer, "mesh channel accepted");
        Self::from_stream(stream)
    }
}

impl ChannelTx for TcpTx {
    fn send(&mut self, msg: MeshMsg) -> CheckResult<()> {
        match msg {
            MeshMsg::Blob(bytes) => {
                writeln!(self.writer, "BLOB {}", bytes.len())
                    .map_err(parcheck_exec::ExecError::Io)?;
                self.writer
                    .write_all(&bytes)
                    .map_err(parcheck_exec::ExecError::Io)?;
            }
            other => {
                writeln!(self.writer, "{other}").map_err(parcheck_exec::ExecError::Io)?;
            }
        }
        self.writer.flush().map_err(parcheck_exec::ExecError::Io)?;
        Ok(())
    }
}

impl ChannelRx for TcpRx {
    fn recv(&mut self) -> CheckResult<MeshMsg> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(parcheck_exec::ExecError::Io)?;
        if n == 0 {
            return Err(CheckError::ChannelClosed);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        if let Some(len) = line.strip_prefix("BLOB ") {
            let len: usize = len
                .parse()
                .map_err(|_| CheckError::Wire { line: line.clone() })?;
            let mut bytes = vec![0u8; len];
            self.reader
                .read_exact(&mut bytes)
                .map_err(parcheck_exec::ExecError::Io)?;
            return Ok(MeshMsg::Blob(bytes));
        }
        parse_msg(&line)
    }
}

impl Channel for TcpChannel {
    fn send(&mut self, msg: MeshMsg) -> CheckResult<()> {
        self.tx.send(msg)
    }

    fn recv(&mut self) -> CheckResult<MeshMsg> {
        self.rx.recv()
    }

    fn split(self: Box<Self>) -> (Box<dyn ChannelTx>, Box<dyn ChannelRx>) {
        (Box::new(self.tx), Box::new(self.rx))
    }
}
