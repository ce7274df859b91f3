//! Fleet restarts. Each runs on a driver thread and blocks only on the fleet
//! condvar, never on a worker's pool.
//!
//! A slot is always replaced new-first: the old worker for an index is told
//! to stop only after the new one has booted, so serving capacity never drops
//! below the configured worker count during a phased restart.

use tracing::{debug, info, warn};

use drover_types::DroverError;

use crate::cluster::{BootWait, Fleet, REAP_GRACE};

/// Bump the phase and replace every slot, one index at a time.
pub(crate) fn phased_restart(fleet: &Fleet) {
    let (phase, workers) = {
        let mut state = fleet.lock();
        state.phase += 1;
        state.degraded.clear();
        (state.phase, fleet.config.workers)
    };
    fleet.changed.notify_all();
    info!(phase, workers, "phased restart started");

    for index in 0..workers {
        if fleet.is_shutting_down() {
            info!(phase, "phased restart abandoned, fleet is stopping");
            return;
        }
        let old: Vec<u32> = fleet
            .lock()
            .slots
            .iter()
            .filter(|s| s.index() == index && s.record.phase < phase && !s.is_stopping())
            .map(|s| s.pid())
            .collect();

        if let Err(e) = replace_slot(fleet, index, phase, &old) {
            warn!(index, error = %e, "slot keeps its old worker");
            fleet.lock().degraded.insert(index);
        }
    }

    let degraded: Vec<usize> = fleet.lock().degraded.iter().copied().collect();
    if degraded.is_empty() {
        info!(phase, "phased restart complete");
    } else {
        warn!(phase, ?degraded, "phased restart finished with degraded slots");
    }
}

/// Stop every worker, wait for them to exit, then start a fresh set in the
/// current phase.
pub(crate) fn restart(fleet: &Fleet) {
    let (phase, old) = {
        let mut state = fleet.lock();
        state.respawn_at.clear();
        let old: Vec<u32> = state
            .slots
            .iter()
            .filter(|s| !s.is_stopping())
            .map(|s| s.pid())
            .collect();
        for slot in state.slots.iter_mut() {
            slot.stop();
        }
        (state.phase, old)
    };
    fleet.changed.notify_all();
    info!(phase, workers = old.len(), "restarting workers");

    let grace = fleet.config.worker_shutdown_timeout() + REAP_GRACE;
    for pid in old {
        if !fleet.wait_reaped(pid, grace) {
            if fleet.is_shutting_down() {
                return;
            }
            warn!(pid, "worker outlived its shutdown timeout");
        }
    }

    let mut spawned = Vec::new();
    for index in 0..fleet.config.workers {
        let result = {
            let mut state = fleet.lock();
            if state.serves(index) {
                continue;
            }
            fleet.spawn_locked(&mut state, index, phase)
        };
        match result {
            Ok(pid) => spawned.push(pid),
            Err(e) => warn!(index, error = %e, "failed to spawn worker during restart"),
        }
    }
    fleet.changed.notify_all();

    let all_booted = fleet
        .wait_for(fleet.config.worker_boot_timeout(), |state| {
            spawned
                .iter()
                .all(|pid| state.slots.iter().any(|s| s.pid() == *pid && s.record.booted))
                .then_some(())
        })
        .is_some();
    if all_booted {
        info!(phase, "restart complete");
    } else {
        warn!(phase, "restart finished before every worker booted");
    }
}

/// Replace one worker that stopped sending heartbeats.
pub(crate) fn replace_stalled(fleet: &Fleet, index: usize, pid: u32) {
    let phase = fleet.lock().phase;
    match replace_slot(fleet, index, phase, &[pid]) {
        Ok(()) => info!(index, old_pid = pid, "stalled worker replaced"),
        Err(e) => {
            warn!(index, error = %e, "stalled worker could not be replaced");
            fleet.lock().degraded.insert(index);
        }
    }
}

/// Start a worker for `index`, wait for it to boot, then stop each of `old`
/// and wait until it is reaped.
///
/// If the new worker does not boot in time it is killed and the old workers
/// are left serving.
pub(crate) fn replace_slot(
    fleet: &Fleet,
    index: usize,
    phase: u64,
    old: &[u32],
) -> Result<(), DroverError> {
    // A crash respawn may already have started this index in `phase`.
    let adopted = fleet
        .lock()
        .slots
        .iter()
        .find(|s| {
            s.index() == index
                && s.record.phase == phase
                && !s.is_stopping()
                && !old.contains(&s.pid())
        })
        .map(|s| s.pid());
    let pid = match adopted {
        Some(pid) => {
            debug!(index, pid, phase, "slot already has a current-phase worker");
            pid
        }
        None => fleet.spawn(index, phase)?,
    };
    let boot_timeout = fleet.config.worker_boot_timeout();

    match fleet.wait_booted(pid, boot_timeout) {
        BootWait::Booted => {}
        BootWait::Exited => {
            return Err(DroverError::WorkerCrash {
                index,
                pid,
                status: "exited before booting".into(),
            });
        }
        BootWait::TimedOut => {
            fleet.kill_worker(pid);
            return Err(DroverError::BootTimeout {
                index,
                secs: boot_timeout.as_secs(),
            });
        }
    }

    for &old_pid in old {
        fleet.stop_worker(old_pid);
    }
    let grace = fleet.config.worker_shutdown_timeout() + REAP_GRACE;
    for &old_pid in old {
        if !fleet.wait_reaped(old_pid, grace) && !fleet.is_shutting_down() {
            warn!(index, pid = old_pid, "old worker outlived its shutdown timeout");
        }
    }

    fleet.lock().degraded.remove(&index);
    info!(index, pid, phase, "slot replaced");
    Ok(())
}
