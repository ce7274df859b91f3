//! Supervisor/worker message framing.
//!
//! Workers report upstream on stdout and take directives on stdin, one JSON
//! object per line. Lines from one worker are read by one thread, so messages
//! from a slot are applied in send order.

use std::io::Write;

use serde::{Deserialize, Serialize};

use drover_types::PoolStatus;

/// Worker slot index.
pub const ENV_WORKER_INDEX: &str = "DROVER_WORKER_INDEX";
/// Phase the worker was spawned in.
pub const ENV_WORKER_PHASE: &str = "DROVER_WORKER_PHASE";
/// Resolved configuration as JSON.
pub const ENV_WORKER_CONFIG: &str = "DROVER_WORKER_CONFIG";
/// Inherited listener fds (`tcp:3,unix:4`).
pub const ENV_LISTEN_FDS: &str = "DROVER_LISTEN_FDS";

/// Worker to supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Sent once when the pool and acceptors are ready.
    Booted { index: usize, pid: u32, phase: u64 },
    /// Periodic heartbeat.
    Status {
        index: usize,
        pid: u32,
        phase: u64,
        booted: bool,
        status: PoolStatus,
    },
}

impl WorkerMessage {
    pub fn pid(&self) -> u32 {
        match self {
            WorkerMessage::Booted { pid, .. } | WorkerMessage::Status { pid, .. } => *pid,
        }
    }
}

/// Supervisor to worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Directive {
    /// Drain the pool and exit 0.
    Stop,
    /// Exit immediately.
    Halt,
}

/// Serialize one message as a newline-terminated JSON line.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String, String> {
    let mut line = serde_json::to_string(msg).map_err(|e| format!("encode message: {e}"))?;
    line.push('\n');
    Ok(line)
}

/// Write one message and flush. An error means the other side is gone.
pub fn send<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> std::io::Result<()> {
    let line = encode_line(msg).map_err(std::io::Error::other)?;
    writer.write_all(line.as_bytes())?;
    writer.flush()
}

pub fn decode_message(line: &str) -> Result<WorkerMessage, String> {
    serde_json::from_str(line.trim()).map_err(|e| format!("invalid worker message: {e}"))
}

pub fn decode_directive(line: &str) -> Result<Directive, String> {
    serde_json::from_str(line.trim()).map_err(|e| format!("invalid directive: {e}"))
}
