//! Cluster supervisor: spawns worker processes, tracks their records, and
//! replaces the ones that crash or stall.
//!
//! All fleet state sits behind one mutex paired with a condvar. Three kinds
//! of threads touch it:
//! - the supervisor main loop ([`Supervisor::run`]): control actions, reaping,
//!   crash respawn, stall checks, kill escalation
//! - the event thread: applies worker messages in arrival order
//! - at most one rollover driver (phased restart, restart, or single-slot
//!   replacement), which blocks on the condvar with timeouts
//!
//! Control reads take a cloned snapshot under the lock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use drover_control::{ControlAction, ControlCmdRx, ControlReply, ReplyStatus};
use drover_types::{DroverConfig, DroverError, FleetStatus, WorkerRecord};

use crate::events::{Events, LifecycleEvent};
use crate::gc::Collector;
use crate::rollover;
use crate::slot::{FleetEvent, Slot, SlotState, SpawnSpec, WorkerCommand};

/// Main loop period.
const TICK: Duration = Duration::from_millis(100);

/// Delay before respawning a worker that died before it ever booted.
const RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

/// Extra wait after SIGKILL before a worker is given up on.
pub(crate) const REAP_GRACE: Duration = Duration::from_secs(5);

/// Mutable fleet state.
pub(crate) struct FleetState {
    pub slots: Vec<Slot>,
    pub phase: u64,
    pub started_at: DateTime<Utc>,
    pub crashes: u64,
    pub degraded: BTreeSet<usize>,
    pub shutting_down: bool,
    /// A rollover driver is running.
    pub rolling: bool,
    /// Deferred crash respawns by index.
    pub respawn_at: BTreeMap<usize, Instant>,
}

impl FleetState {
    /// Whether a live, non-stopping worker serves `index`.
    pub fn serves(&self, index: usize) -> bool {
        self.slots
            .iter()
            .any(|s| s.index() == index && !s.is_stopping())
    }

    pub fn slot_mut(&mut self, pid: u32) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.pid() == pid)
    }
}

/// Outcome of waiting for a worker to boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BootWait {
    Booted,
    /// Reaped before it booted.
    Exited,
    /// Timed out, or the fleet began shutting down.
    TimedOut,
}

/// Shared fleet handle.
pub(crate) struct Fleet {
    state: Mutex<FleetState>,
    pub changed: Condvar,
    pub config: Arc<DroverConfig>,
    spec: SpawnSpec,
    events_tx: mpsc::Sender<FleetEvent>,
    pub events: Events,
}

impl Fleet {
    pub fn lock(&self) -> MutexGuard<'_, FleetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Spawn a worker while already holding the lock.
    pub fn spawn_locked(
        &self,
        state: &mut FleetState,
        index: usize,
        phase: u64,
    ) -> Result<u32, DroverError> {
        if state.shutting_down {
            return Err(DroverError::Spawn("fleet is shutting down".into()));
        }
        let slot = Slot::spawn(&self.spec, index, phase, self.events_tx.clone())?;
        let pid = slot.pid();
        info!(index, pid, phase, "worker spawned");
        state.slots.push(slot);
        Ok(pid)
    }

    pub fn spawn(&self, index: usize, phase: u64) -> Result<u32, DroverError> {
        let result = {
            let mut state = self.lock();
            self.spawn_locked(&mut state, index, phase)
        };
        self.changed.notify_all();
        result
    }

    /// Block until `check` yields a value, the timeout passes, or the fleet
    /// starts shutting down.
    pub fn wait_for<T>(
        &self,
        timeout: Duration,
        mut check: impl FnMut(&FleetState) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(value) = check(&state) {
                return Some(value);
            }
            let now = Instant::now();
            if state.shutting_down || now >= deadline {
                return None;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    pub fn wait_booted(&self, pid: u32, timeout: Duration) -> BootWait {
        self.wait_for(timeout, |state| match state.slots.iter().find(|s| s.pid() == pid) {
            None => Some(BootWait::Exited),
            Some(slot) if slot.record.booted => Some(BootWait::Booted),
            Some(_) => None,
        })
        .unwrap_or(BootWait::TimedOut)
    }

    /// Wait until the worker has been reaped.
    pub fn wait_reaped(&self, pid: u32, timeout: Duration) -> bool {
        self.wait_for(timeout, |state| {
            (!state.slots.iter().any(|s| s.pid() == pid)).then_some(())
        })
        .is_some()
    }

    pub fn stop_worker(&self, pid: u32) {
        if let Some(slot) = self.lock().slot_mut(pid) {
            info!(index = slot.index(), pid, "stopping worker");
            slot.stop();
        }
        self.changed.notify_all();
    }

    pub fn kill_worker(&self, pid: u32) {
        if let Some(slot) = self.lock().slot_mut(pid) {
            warn!(index = slot.index(), pid, "killing worker");
            slot.kill();
        }
        self.changed.notify_all();
    }

    /// Consistent status snapshot.
    pub fn snapshot(&self) -> FleetStatus {
        let state = self.lock();
        let mut worker_status: Vec<WorkerRecord> =
            state.slots.iter().map(|s| s.record.clone()).collect();
        worker_status.sort_by_key(|r| (r.index, r.phase));

        FleetStatus {
            started_at: state.started_at,
            workers: self.config.workers,
            phase: state.phase,
            booted_workers: state
                .slots
                .iter()
                .filter(|s| s.record.booted && s.record.phase == state.phase && !s.is_stopping())
                .count(),
            old_workers: state
                .slots
                .iter()
                .filter(|s| s.record.phase < state.phase)
                .count(),
            worker_status,
            crashes: state.crashes,
            degraded_slots: state.degraded.iter().copied().collect(),
        }
    }
}

/// Marks the fleet as no longer rolling when a driver finishes, even if it
/// panicked.
struct RollingGuard<'a>(&'a Fleet);

impl Drop for RollingGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().rolling = false;
        self.0.changed.notify_all();
    }
}

/// How the supervisor main loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetExit {
    /// Workers were drained and reaped.
    Stopped,
    /// Workers were told to exit immediately.
    Halted,
}

/// Owns the worker fleet.
pub struct Supervisor {
    fleet: Arc<Fleet>,
    events_rx: Option<mpsc::Receiver<FleetEvent>>,
    collector: Arc<dyn Collector>,
    driver: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Prepare a fleet of `config.workers` processes started with `command`
    /// and inheriting the listeners named by `listen_fds`.
    pub fn new(
        config: Arc<DroverConfig>,
        command: WorkerCommand,
        listen_fds: String,
        collector: Arc<dyn Collector>,
        events: Events,
    ) -> Result<Self, DroverError> {
        if !config.is_clustered() {
            return Err(DroverError::Config("cluster mode needs workers >= 1".into()));
        }
        // Workers never need the control token.
        let mut worker_config = (*config).clone();
        worker_config.control_token = None;
        let config_json = serde_json::to_string(&worker_config)
            .map_err(|e| DroverError::Config(format!("failed to encode worker config: {e}")))?;

        let spec = SpawnSpec {
            command,
            config_json,
            listen_fds,
            env: config
                .worker_env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };

        let (events_tx, events_rx) = mpsc::channel();
        let fleet = Arc::new(Fleet {
            state: Mutex::new(FleetState {
                slots: Vec::new(),
                phase: 0,
                started_at: Utc::now(),
                crashes: 0,
                degraded: BTreeSet::new(),
                shutting_down: false,
                rolling: false,
                respawn_at: BTreeMap::new(),
            }),
            changed: Condvar::new(),
            config,
            spec,
            events_tx,
            events,
        });

        Ok(Self {
            fleet,
            events_rx: Some(events_rx),
            collector,
            driver: None,
        })
    }

    pub fn status(&self) -> FleetStatus {
        self.fleet.snapshot()
    }

    /// Spawn the fleet and supervise it until `stop`, `halt`, or the command
    /// channel closes.
    pub fn run(&mut self, commands: ControlCmdRx) -> Result<FleetExit, DroverError> {
        let events_rx = self
            .events_rx
            .take()
            .ok_or_else(|| DroverError::Config("supervisor already ran".into()))?;
        let fleet = Arc::clone(&self.fleet);
        let event_thread = std::thread::Builder::new()
            .name("fleet-events".into())
            .spawn(move || process_events(&fleet, events_rx))
            .map_err(|e| DroverError::Spawn(format!("event thread: {e}")))?;

        let result = self.boot().map(|()| self.supervise(&commands));
        match result {
            Ok(FleetExit::Stopped) | Err(_) => self.shutdown(),
            Ok(FleetExit::Halted) => self.halt(),
        }

        if let Some(driver) = self.driver.take() {
            if driver.join().is_err() {
                error!("rollover driver panicked");
            }
        }
        let _ = self.fleet.events_tx.send(FleetEvent::Shutdown);
        if event_thread.join().is_err() {
            error!("fleet event thread panicked");
        }
        result
    }

    fn boot(&mut self) -> Result<(), DroverError> {
        let workers = self.fleet.config.workers;
        info!(workers, "starting worker fleet");
        for index in 0..workers {
            self.fleet.spawn(index, 0)?;
        }
        self.fleet
            .events
            .emit(LifecycleEvent::Booted { clustered: true });
        Ok(())
    }

    fn supervise(&mut self, commands: &ControlCmdRx) -> FleetExit {
        loop {
            match commands.recv_timeout(TICK) {
                Ok((action, reply)) => {
                    if let Some(exit) = self.handle(action, reply) {
                        return exit;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("control channel closed, stopping fleet");
                    return FleetExit::Stopped;
                }
            }
            self.reap();
            self.respawn_due();
            self.fill_vacancies();
            self.check_boot_timeouts();
            self.check_stalled();
            self.escalate();
        }
    }

    fn handle(
        &mut self,
        action: ControlAction,
        reply: oneshot::Sender<ControlReply>,
    ) -> Option<FleetExit> {
        debug!(action = %action, "control action");
        let (response, exit) = match action {
            ControlAction::Stats => match serde_json::to_value(self.status()) {
                Ok(body) => (ControlReply::json(body), None),
                Err(e) => (
                    ControlReply::error(ReplyStatus::Unavailable, format!("stats: {e}")),
                    None,
                ),
            },
            ControlAction::Gc => {
                self.collector.force_collect();
                (ControlReply::ok(), None)
            }
            ControlAction::GcStats => (
                ControlReply::json(serde_json::Value::Object(self.collector.stats())),
                None,
            ),
            ControlAction::Stop => (ControlReply::ok(), Some(FleetExit::Stopped)),
            ControlAction::Halt => (ControlReply::ok(), Some(FleetExit::Halted)),
            ControlAction::Restart => (self.start_driver(false), None),
            ControlAction::PhasedRestart => (self.start_driver(true), None),
        };
        let _ = reply.send(response);
        exit
    }

    fn start_driver(&mut self, phased: bool) -> ControlReply {
        let job: fn(&Fleet) = if phased {
            rollover::phased_restart
        } else {
            rollover::restart
        };
        let name = if phased { "phased-restart" } else { "restart" };
        match self.spawn_driver(name, job) {
            Ok(()) => {
                self.fleet.events.emit(LifecycleEvent::Restarting { phased });
                ControlReply::ok()
            }
            Err(e) => ControlReply::error(ReplyStatus::Unavailable, e),
        }
    }

    /// Run `job` on a driver thread unless another driver is active.
    fn spawn_driver<F>(&mut self, name: &str, job: F) -> Result<(), String>
    where
        F: FnOnce(&Fleet) + Send + 'static,
    {
        {
            let mut state = self.fleet.lock();
            if state.shutting_down {
                return Err("fleet is shutting down".into());
            }
            if state.rolling {
                return Err("a restart is already in progress".into());
            }
            state.rolling = true;
        }

        if let Some(previous) = self.driver.take() {
            let _ = previous.join();
        }

        let fleet = Arc::clone(&self.fleet);
        let spawned = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = RollingGuard(&fleet);
                job(&fleet);
            });
        match spawned {
            Ok(handle) => {
                self.driver = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.fleet.lock().rolling = false;
                Err(format!("failed to start {name}: {e}"))
            }
        }
    }

    /// Reap exited workers and respawn crashed slots.
    fn reap(&mut self) {
        let mut crashed = Vec::new();
        let mut reaped = false;
        {
            let mut state = self.fleet.lock();
            let mut i = 0;
            while i < state.slots.len() {
                let Some(status) = state.slots[i].try_wait() else {
                    i += 1;
                    continue;
                };
                reaped = true;
                let slot = state.slots.remove(i);
                let (index, pid) = (slot.index(), slot.pid());

                if slot.is_stopping() || state.shutting_down {
                    info!(index, pid, %status, "worker exited");
                    continue;
                }

                state.crashes += 1;
                let err = DroverError::WorkerCrash {
                    index,
                    pid,
                    status: status.to_string(),
                };
                warn!(error = %err, booted = slot.record.booted, "worker crashed");
                crashed.push(LifecycleEvent::WorkerCrashed {
                    index,
                    pid,
                    status: status.to_string(),
                });

                if state.serves(index) {
                    debug!(index, "slot still served, not respawning");
                } else if state.rolling && slot.record.phase < state.phase {
                    // The phased restart replaces this index when it gets
                    // there; a vacancy left behind is refilled once it ends.
                    debug!(index, "old-phase slot left to the rollover");
                } else if slot.record.booted {
                    let phase = state.phase;
                    if let Err(e) = self.fleet.spawn_locked(&mut state, index, phase) {
                        warn!(index, error = %e, "respawn failed, retrying");
                        state.respawn_at.insert(index, Instant::now() + RESPAWN_BACKOFF);
                    }
                } else {
                    state.respawn_at.insert(index, Instant::now() + RESPAWN_BACKOFF);
                }
            }
        }

        if reaped {
            self.fleet.changed.notify_all();
        }
        for event in crashed {
            self.fleet.events.emit(event);
        }
    }

    fn respawn_due(&mut self) {
        let now = Instant::now();
        let mut state = self.fleet.lock();
        if state.respawn_at.is_empty() || state.shutting_down {
            return;
        }
        let due: Vec<usize> = state
            .respawn_at
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(index, _)| *index)
            .collect();
        for index in due {
            state.respawn_at.remove(&index);
            if state.serves(index) {
                continue;
            }
            let phase = state.phase;
            if let Err(e) = self.fleet.spawn_locked(&mut state, index, phase) {
                warn!(index, error = %e, "respawn failed, retrying");
                state.respawn_at.insert(index, now + RESPAWN_BACKOFF);
            }
        }
        drop(state);
        self.fleet.changed.notify_all();
    }

    /// Spawn a worker for any index left without one, outside rollovers.
    fn fill_vacancies(&mut self) {
        let mut state = self.fleet.lock();
        if state.rolling || state.shutting_down {
            return;
        }
        let vacant: Vec<usize> = (0..self.fleet.config.workers)
            .filter(|index| !state.serves(*index) && !state.respawn_at.contains_key(index))
            .collect();
        if vacant.is_empty() {
            return;
        }
        let phase = state.phase;
        for index in vacant {
            warn!(index, phase, "no worker serves this index, spawning one");
            if let Err(e) = self.fleet.spawn_locked(&mut state, index, phase) {
                warn!(index, error = %e, "respawn failed, retrying");
                state.respawn_at.insert(index, Instant::now() + RESPAWN_BACKOFF);
            }
        }
        drop(state);
        self.fleet.changed.notify_all();
    }

    /// Kill workers that never reported booted within the boot timeout and
    /// schedule their replacement. Rollover drivers bound their own spawns.
    fn check_boot_timeouts(&mut self) {
        let timeout = self.fleet.config.worker_boot_timeout();
        let mut state = self.fleet.lock();
        if state.rolling || state.shutting_down {
            return;
        }
        let mut timed_out = Vec::new();
        for slot in state.slots.iter_mut() {
            if slot.state == SlotState::Starting && slot.spawned_at.elapsed() > timeout {
                let err = DroverError::BootTimeout {
                    index: slot.index(),
                    secs: timeout.as_secs(),
                };
                warn!(pid = slot.pid(), error = %err, "killing unbooted worker");
                slot.kill();
                timed_out.push(slot.index());
            }
        }
        for index in timed_out {
            state.respawn_at.insert(index, Instant::now() + RESPAWN_BACKOFF);
        }
        drop(state);
        self.fleet.changed.notify_all();
    }

    /// Replace one booted worker whose heartbeat is overdue.
    fn check_stalled(&mut self) {
        let timeout = self.fleet.config.worker_timeout();
        let stalled = {
            let state = self.fleet.lock();
            if state.rolling || state.shutting_down {
                return;
            }
            let now = Utc::now();
            state
                .slots
                .iter()
                .filter(|s| s.state == SlotState::Booted)
                .find(|s| {
                    (now - s.record.last_checkin)
                        .to_std()
                        .is_ok_and(|age| age > timeout)
                })
                .map(|s| (s.index(), s.pid()))
        };

        if let Some((index, pid)) = stalled {
            warn!(index, pid, timeout_secs = timeout.as_secs(), "worker missed its heartbeat, replacing");
            if let Err(e) = self.spawn_driver("replace-worker", move |f| {
                rollover::replace_stalled(f, index, pid)
            }) {
                debug!(error = %e, "stalled worker replacement deferred");
            }
        }
    }

    /// SIGKILL stopping workers that outlived the shutdown timeout.
    fn escalate(&mut self) {
        let timeout = self.fleet.config.worker_shutdown_timeout();
        let mut state = self.fleet.lock();
        for slot in state.slots.iter_mut() {
            if let SlotState::Stopping { since, killed: false } = slot.state {
                if since.elapsed() > timeout {
                    warn!(
                        index = slot.index(),
                        pid = slot.pid(),
                        "worker did not stop within {}s, killing",
                        timeout.as_secs()
                    );
                    slot.kill();
                }
            }
        }
    }

    /// Stop every worker and wait until all are reaped.
    fn shutdown(&mut self) {
        let count = {
            let mut state = self.fleet.lock();
            state.shutting_down = true;
            state.respawn_at.clear();
            for slot in state.slots.iter_mut() {
                slot.stop();
            }
            state.slots.len()
        };
        self.fleet.changed.notify_all();
        info!(workers = count, "stopping worker fleet");

        let deadline = Instant::now() + self.fleet.config.worker_shutdown_timeout() + REAP_GRACE;
        loop {
            self.reap();
            self.escalate();
            let remaining = self.fleet.lock().slots.len();
            if remaining == 0 {
                break;
            }
            if Instant::now() >= deadline {
                error!(remaining, "workers still running after kill, giving up");
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        info!("worker fleet stopped");
    }

    /// Tell every worker to exit immediately and return.
    fn halt(&mut self) {
        let mut state = self.fleet.lock();
        state.shutting_down = true;
        state.respawn_at.clear();
        for slot in state.slots.iter_mut() {
            slot.halt();
        }
        drop(state);
        self.fleet.changed.notify_all();
        info!("worker fleet halted");
    }
}

fn process_events(fleet: &Fleet, rx: mpsc::Receiver<FleetEvent>) {
    while let Ok(event) = rx.recv() {
        let (pid, msg) = match event {
            FleetEvent::Shutdown => break,
            FleetEvent::Message { pid, msg } => (pid, msg),
        };
        let booted = {
            let mut state = fleet.lock();
            match state.slot_mut(pid) {
                Some(slot) => slot
                    .apply(&msg)
                    .then(|| (slot.index(), slot.record.phase)),
                None => {
                    debug!(pid, "message from unknown worker");
                    None
                }
            }
        };
        fleet.changed.notify_all();

        if let Some((index, phase)) = booted {
            info!(index, pid, phase, "worker booted");
            fleet
                .events
                .emit(LifecycleEvent::WorkerBooted { index, pid, phase });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::AllocatorCollector;
    use drover_control::{control_channel, ControlCmdTx};

    const WORKER: &str = r#"printf '{"type":"booted","index":%s,"pid":%s,"phase":%s}\n' "$DROVER_WORKER_INDEX" $$ "$DROVER_WORKER_PHASE"
while read line; do case "$line" in *stop*|*halt*) exit 0;; esac; done"#;

    fn config(workers: usize) -> DroverConfig {
        DroverConfig {
            workers,
            worker_boot_timeout: 10,
            worker_shutdown_timeout: 5,
            worker_timeout: 600,
            ..Default::default()
        }
    }

    fn start(
        config: DroverConfig,
        script: &str,
    ) -> (ControlCmdTx, std::thread::JoinHandle<Result<FleetExit, DroverError>>) {
        let command = WorkerCommand {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
        };
        let mut supervisor = Supervisor::new(
            Arc::new(config),
            command,
            String::new(),
            Arc::new(AllocatorCollector::new()),
            Events::new(),
        )
        .unwrap();
        let (tx, rx) = control_channel();
        let handle = std::thread::spawn(move || supervisor.run(rx));
        (tx, handle)
    }

    fn ask(tx: &ControlCmdTx, action: ControlAction) -> ControlReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send((action, reply_tx)).unwrap();
        reply_rx.blocking_recv().unwrap()
    }

    fn stats(tx: &ControlCmdTx) -> FleetStatus {
        serde_json::from_value(ask(tx, ControlAction::Stats).body).unwrap()
    }

    fn wait_stats(tx: &ControlCmdTx, mut cond: impl FnMut(&FleetStatus) -> bool) -> FleetStatus {
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let status = stats(tx);
            if cond(&status) {
                return status;
            }
            assert!(Instant::now() < deadline, "condition not reached: {status:?}");
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    fn pids(status: &FleetStatus) -> BTreeSet<u32> {
        status.worker_status.iter().map(|w| w.pid).collect()
    }

    fn stop(tx: &ControlCmdTx, handle: std::thread::JoinHandle<Result<FleetExit, DroverError>>) {
        assert!(ask(tx, ControlAction::Stop).is_ok());
        assert_eq!(handle.join().unwrap().unwrap(), FleetExit::Stopped);
    }

    #[test]
    fn fleet_boots_every_index() {
        let (tx, handle) = start(config(2), WORKER);
        let status = wait_stats(&tx, |s| s.booted_workers == 2);

        assert_eq!(status.workers, 2);
        assert_eq!(status.phase, 0);
        assert_eq!(status.old_workers, 0);
        let indices: Vec<usize> = status.worker_status.iter().map(|w| w.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert!(status.worker_status.iter().all(|w| w.booted));

        let before = pids(&status);
        stop(&tx, handle);
        for pid in before {
            assert!(!crate::persistence::is_process_alive(pid));
        }
    }

    #[test]
    fn phased_restart_replaces_every_pid() {
        let (tx, handle) = start(config(2), WORKER);
        let phase0 = pids(&wait_stats(&tx, |s| s.booted_workers == 2));

        assert!(ask(&tx, ControlAction::PhasedRestart).is_ok());
        let done = wait_stats(&tx, |s| {
            s.phase == 1
                && s.old_workers == 0
                && s.worker_status.len() == 2
                && s.worker_status.iter().all(|w| w.booted && w.phase == 1)
        });
        let phase1 = pids(&done);

        assert_eq!(phase0.len(), 2);
        assert_eq!(phase1.len(), 2);
        assert!(phase0.is_disjoint(&phase1));
        assert!(done.degraded_slots.is_empty());
        stop(&tx, handle);
    }

    #[test]
    fn crashed_worker_is_respawned_in_place() {
        let (tx, handle) = start(config(2), WORKER);
        let status = wait_stats(&tx, |s| s.booted_workers == 2);
        let victim = status.worker_status[0].pid;

        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(victim as i32),
            nix::sys::signal::Signal::SIGKILL,
        )
        .unwrap();

        let after = wait_stats(&tx, |s| {
            s.crashes == 1 && s.booted_workers == 2 && !pids(s).contains(&victim)
        });
        assert_eq!(after.phase, 0);
        let indices: Vec<usize> = after.worker_status.iter().map(|w| w.index).collect();
        assert_eq!(indices, vec![0, 1]);
        stop(&tx, handle);
    }

    #[test]
    fn boot_timeout_keeps_old_worker() {
        let script = format!(
            "if [ \"$DROVER_WORKER_PHASE\" != 0 ]; then exec sleep 30; fi\n{WORKER}"
        );
        let mut cfg = config(1);
        cfg.worker_boot_timeout = 1;
        let (tx, handle) = start(cfg, &script);
        let original = wait_stats(&tx, |s| s.booted_workers == 1).worker_status[0].pid;

        assert!(ask(&tx, ControlAction::PhasedRestart).is_ok());
        let after = wait_stats(&tx, |s| s.degraded_slots == vec![0] && s.worker_status.len() == 1);
        assert_eq!(after.worker_status[0].pid, original);
        assert_eq!(after.phase, 1);
        assert_eq!(after.old_workers, 1);
        stop(&tx, handle);
    }

    #[test]
    fn old_worker_crash_during_phased_restart_is_replaced_once() {
        let script = format!(
            "if [ \"$DROVER_WORKER_PHASE\" != 0 ]; then sleep 2; fi\n{WORKER}"
        );
        let (tx, handle) = start(config(2), &script);
        let status = wait_stats(&tx, |s| s.booted_workers == 2);
        let victim = status
            .worker_status
            .iter()
            .find(|w| w.index == 1)
            .map(|w| w.pid)
            .unwrap();

        assert!(ask(&tx, ControlAction::PhasedRestart).is_ok());
        std::thread::sleep(Duration::from_millis(300));
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(victim as i32),
            nix::sys::signal::Signal::SIGKILL,
        )
        .unwrap();

        wait_stats(&tx, |s| {
            s.phase == 1
                && s.worker_status.len() == 2
                && s.worker_status.iter().all(|w| w.booted && w.phase == 1)
        });
        // Long enough for a duplicate spawn to have booted.
        std::thread::sleep(Duration::from_secs(3));

        let after = stats(&tx);
        let indices: Vec<usize> = after.worker_status.iter().map(|w| w.index).collect();
        assert_eq!(indices, vec![0, 1], "{after:?}");
        assert_eq!(after.booted_workers, 2);
        assert!(after.crashes >= 1);
        assert!(after.degraded_slots.is_empty());
        stop(&tx, handle);
    }

    #[test]
    fn hung_respawn_is_killed_after_boot_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("spawns");
        let script = format!(
            "n=$(( $(cat \"$DROVER_TEST_COUNT\" 2>/dev/null || echo 0) + 1 ))\n\
             echo $n > \"$DROVER_TEST_COUNT\"\n\
             if [ $n = 2 ]; then exec sleep 60; fi\n{WORKER}"
        );
        let mut cfg = config(1);
        cfg.worker_boot_timeout = 1;
        cfg.worker_env
            .insert("DROVER_TEST_COUNT".into(), counter.display().to_string());
        let (tx, handle) = start(cfg, &script);
        let original = wait_stats(&tx, |s| s.booted_workers == 1).worker_status[0].pid;

        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(original as i32),
            nix::sys::signal::Signal::SIGKILL,
        )
        .unwrap();

        let after = wait_stats(&tx, |s| {
            s.booted_workers == 1 && s.worker_status.len() == 1 && !pids(s).contains(&original)
        });
        assert_eq!(after.worker_status[0].index, 0);
        let spawns: u32 = std::fs::read_to_string(&counter).unwrap().trim().parse().unwrap();
        assert!(spawns >= 3, "spawned {spawns} times");
        stop(&tx, handle);
    }

    #[test]
    fn restart_keeps_phase_and_replaces_workers() {
        let (tx, handle) = start(config(2), WORKER);
        let before = pids(&wait_stats(&tx, |s| s.booted_workers == 2));

        assert!(ask(&tx, ControlAction::Restart).is_ok());
        let after = wait_stats(&tx, |s| {
            s.booted_workers == 2 && s.worker_status.len() == 2 && pids(s).is_disjoint(&before)
        });
        assert_eq!(after.phase, 0);
        assert_eq!(after.crashes, 0);
        stop(&tx, handle);
    }

    #[test]
    fn stalled_worker_is_replaced() {
        let mut cfg = config(1);
        cfg.worker_timeout = 1;
        let (tx, handle) = start(cfg, WORKER);
        let original = wait_stats(&tx, |s| s.booted_workers == 1).worker_status[0].pid;

        let after = wait_stats(&tx, |s| !pids(s).contains(&original) && s.booted_workers == 1);
        assert_eq!(after.worker_status[0].index, 0);
        assert_eq!(after.phase, 0);
        stop(&tx, handle);
    }

    #[test]
    fn gc_and_halt_actions() {
        let (tx, handle) = start(config(1), WORKER);
        wait_stats(&tx, |s| s.booted_workers == 1);

        assert_eq!(ask(&tx, ControlAction::GcStats).body["count"], 0);
        assert!(ask(&tx, ControlAction::Gc).is_ok());
        assert_eq!(ask(&tx, ControlAction::GcStats).body["count"], 1);

        assert!(ask(&tx, ControlAction::Halt).is_ok());
        assert_eq!(handle.join().unwrap().unwrap(), FleetExit::Halted);
    }

    #[test]
    fn failing_worker_program_fails_boot() {
        let mut supervisor = Supervisor::new(
            Arc::new(config(1)),
            WorkerCommand {
                program: "/nonexistent/drover".into(),
                args: vec![],
            },
            String::new(),
            Arc::new(AllocatorCollector::new()),
            Events::new(),
        )
        .unwrap();
        let (_tx, rx) = control_channel();
        assert!(matches!(supervisor.run(rx), Err(DroverError::Spawn(_))));
    }

    #[test]
    fn single_mode_config_is_rejected() {
        let result = Supervisor::new(
            Arc::new(config(0)),
            WorkerCommand {
                program: "/bin/true".into(),
                args: vec![],
            },
            String::new(),
            Arc::new(AllocatorCollector::new()),
            Events::new(),
        );
        assert!(result.is_err());
    }
}
