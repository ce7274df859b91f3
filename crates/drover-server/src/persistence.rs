//! Pid file management and process liveness checks.

use std::path::Path;

use drover_types::DroverError;

/// Write the current pid, newline-terminated.
pub fn write_pid_file(path: &Path) -> Result<(), DroverError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DroverError::StateWrite(format!("create {}: {e}", parent.display())))?;
        }
    }

    let pid = std::process::id();
    std::fs::write(path, format!("{pid}\n"))
        .map_err(|e| DroverError::StateWrite(format!("write pid file {}: {e}", path.display())))?;

    tracing::info!(pid, path = %path.display(), "pid file written");
    Ok(())
}

/// Read a pid from a pid file.
pub fn read_pid(path: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(path).ok()?;
    content.trim().parse().ok()
}

/// Remove the pid file.
pub fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::debug!(error = %e, "failed to remove pid file (may not exist)");
    }
}

/// Check whether a process with the given pid is alive.
pub fn is_process_alive(pid: u32) -> bool {
    // Values that wrap negative would address process groups.
    let Ok(raw_pid) = i32::try_from(pid) else {
        return false;
    };
    if raw_pid == 0 {
        return false;
    }
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw_pid), None).is_ok()
}
