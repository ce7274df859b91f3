use anyhow::Result;

use drover_server::worker::{self, WorkerExit};

/// Run the hidden `drover worker` command.
pub fn run() -> Result<()> {
    match worker::run_process()? {
        WorkerExit::Stopped => Ok(()),
        // Skip destructors; nothing is drained on halt.
        WorkerExit::Halted => std::process::exit(0),
    }
}
