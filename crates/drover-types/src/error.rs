//! Error types shared across all drover crates.

/// Errors that can occur across the drover runtime.
///
/// Most variants are recovered locally (a rejected submission is backpressure,
/// a crashed worker is respawned, a boot timeout degrades a single slot). Only
/// [`DroverError::StateWrite`] and [`DroverError::Bind`] are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum DroverError {
    #[error("work rejected: thread pool is shutting down")]
    Rejected,

    #[error("worker {index} (pid {pid}) exited unexpectedly with {status}")]
    WorkerCrash { index: usize, pid: u32, status: String },

    #[error("worker {index} did not boot within {secs}s")]
    BootTimeout { index: usize, secs: u64 },

    #[error("control request rejected: invalid auth token")]
    ControlAuth,

    #[error("control protocol error: {0}")]
    ControlProtocol(String),

    #[error("failed to persist state: {0}")]
    StateWrite(String),

    #[error("failed to bind listener: {0}")]
    Bind(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
