//! Worker slot: one supervised worker process and its record.
//!
//! A slot is created when the supervisor spawns a worker and dropped when the
//! process is reaped. Several slots can share an `index` during a rollover;
//! `phase` tells the generations apart.

use std::io::{BufRead, BufReader};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, warn};

use drover_types::{DroverError, WorkerRecord};

use crate::heartbeat::{
    self, Directive, WorkerMessage, ENV_LISTEN_FDS, ENV_WORKER_CONFIG, ENV_WORKER_INDEX,
    ENV_WORKER_PHASE,
};

/// Program and arguments that start a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// Re-exec the running binary with the hidden `worker` subcommand.
    pub fn current_exe() -> Result<Self, DroverError> {
        let program = std::env::current_exe()
            .map_err(|e| DroverError::Spawn(format!("cannot locate own executable: {e}")))?;
        Ok(Self {
            program,
            args: vec!["worker".into()],
        })
    }
}

/// Everything needed to spawn a worker, fixed for the fleet's lifetime.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: WorkerCommand,
    /// Worker configuration as JSON.
    pub config_json: String,
    /// `DROVER_LISTEN_FDS` value.
    pub listen_fds: String,
    pub env: Vec<(String, String)>,
}

/// Lifecycle position of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Spawned, no boot message yet.
    Starting,
    /// Reported ready at least once.
    Booted,
    /// Told to stop or halt; waiting to be reaped.
    Stopping { since: Instant, killed: bool },
}

/// Messages from per-slot reader threads to the fleet event thread.
#[derive(Debug)]
pub enum FleetEvent {
    Message { pid: u32, msg: WorkerMessage },
    /// Ends the event thread.
    Shutdown,
}

/// Runtime state for a single supervised worker process.
pub struct Slot {
    pub record: WorkerRecord,
    pub state: SlotState,
    pub spawned_at: Instant,
    child: Child,
    stdin: Option<ChildStdin>,
}

impl Slot {
    /// Spawn a worker for `index` in `phase`, with a reader thread forwarding
    /// its stdout into `events`.
    pub fn spawn(
        spec: &SpawnSpec,
        index: usize,
        phase: u64,
        events: mpsc::Sender<FleetEvent>,
    ) -> Result<Self, DroverError> {
        let mut cmd = Command::new(&spec.command.program);
        cmd.args(&spec.command.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(ENV_WORKER_INDEX, index.to_string())
            .env(ENV_WORKER_PHASE, phase.to_string())
            .env(ENV_WORKER_CONFIG, &spec.config_json)
            .env(ENV_LISTEN_FDS, &spec.listen_fds)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            // Keep terminal signals away from workers; the supervisor decides
            // how they stop.
            .process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| DroverError::Spawn(format!("{}: {e}", spec.command.program.display())))?;
        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DroverError::Spawn("worker stdout not captured".into()))?;

        let spawned = std::thread::Builder::new()
            .name(format!("worker-{index}-reader"))
            .spawn(move || read_messages(pid, stdout, events));
        if let Err(e) = spawned {
            let _ = child.kill();
            let _ = child.wait();
            return Err(DroverError::Spawn(format!("reader thread: {e}")));
        }

        Ok(Self {
            record: WorkerRecord::starting(index, pid, phase),
            state: SlotState::Starting,
            spawned_at: Instant::now(),
            child,
            stdin,
        })
    }

    pub fn pid(&self) -> u32 {
        self.record.pid
    }

    pub fn index(&self) -> usize {
        self.record.index
    }

    pub fn is_stopping(&self) -> bool {
        matches!(self.state, SlotState::Stopping { .. })
    }

    /// Apply a worker message. Returns `true` if the slot just booted.
    pub fn apply(&mut self, msg: &WorkerMessage) -> bool {
        self.record.last_checkin = Utc::now();
        if let WorkerMessage::Status { status, .. } = msg {
            self.record.last_status = *status;
        }
        let newly = !self.record.booted;
        self.record.booted = true;
        if self.state == SlotState::Starting {
            self.state = SlotState::Booted;
        }
        newly
    }

    fn send(&mut self, directive: Directive) {
        let Some(stdin) = self.stdin.as_mut() else {
            return;
        };
        if let Err(e) = heartbeat::send(stdin, &directive) {
            debug!(pid = self.pid(), error = %e, "directive not delivered");
            self.stdin = None;
        }
    }

    /// Ask the worker to drain and exit.
    pub fn stop(&mut self) {
        if self.is_stopping() {
            return;
        }
        self.send(Directive::Stop);
        self.state = SlotState::Stopping {
            since: Instant::now(),
            killed: false,
        };
    }

    /// Ask the worker to exit without draining.
    pub fn halt(&mut self) {
        self.send(Directive::Halt);
        if !self.is_stopping() {
            self.state = SlotState::Stopping {
                since: Instant::now(),
                killed: false,
            };
        }
    }

    /// SIGKILL the worker.
    pub fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!(pid = self.pid(), error = %e, "kill failed");
        }
        let since = match self.state {
            SlotState::Stopping { since, .. } => since,
            _ => Instant::now(),
        };
        self.state = SlotState::Stopping { since, killed: true };
    }

    /// Non-blocking reap.
    pub fn try_wait(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!(pid = self.pid(), error = %e, "failed to poll worker");
                None
            }
        }
    }
}

fn read_messages(pid: u32, stdout: std::process::ChildStdout, events: mpsc::Sender<FleetEvent>) {
    for line in BufReader::new(stdout).lines() {
        let Ok(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match heartbeat::decode_message(&line) {
            Ok(msg) if msg.pid() == pid => {
                if events.send(FleetEvent::Message { pid, msg }).is_err() {
                    break;
                }
            }
            Ok(msg) => warn!(pid, reported = msg.pid(), "worker reported a foreign pid"),
            Err(e) => warn!(pid, error = %e, "ignoring malformed worker output"),
        }
    }
    debug!(pid, "worker output closed");
}
