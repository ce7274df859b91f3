//! Launcher: turns a resolved configuration into a running server.
//!
//! Boot order:
//! 1. resolve the control endpoint and token
//! 2. bind listeners (fatal only if none bind)
//! 3. start the control plane
//! 4. write the pid and state files (fatal on failure)
//! 5. run single mode or the cluster supervisor until stopped
//!
//! Cleanup removes the pid file and the Unix socket files this process
//! created. The state file is left for the next launch to overwrite.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use drover_control::{control_channel, ControlAction, ControlCmdRx, ControlCmdTx, ControlReply};
use drover_types::{BindUrl, DroverConfig, DroverError, AUTO_CONTROL_URL};

use crate::app::{self, App};
use crate::cluster::{FleetExit, Supervisor};
use crate::control::ControlPlane;
use crate::events::{Events, LifecycleEvent};
use crate::gc::{AllocatorCollector, Collector};
use crate::listener::{self, Listener};
use crate::persistence;
use crate::single::{SingleExit, SingleServer};
use crate::slot::WorkerCommand;
use crate::state::{launch_snapshot, StateStore};
use crate::worker::WorkerServer;

/// How a launch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchExit {
    Stopped,
    Halted,
}

/// Sends control actions to a running launcher without a socket.
#[derive(Clone)]
pub struct LauncherHandle {
    tx: ControlCmdTx,
}

impl LauncherHandle {
    /// Send an action and block for the reply. Must not be called from inside
    /// an async runtime.
    pub fn send(&self, action: ControlAction) -> Result<ControlReply, DroverError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((action, reply_tx))
            .map_err(|_| DroverError::ControlProtocol("server is not running".into()))?;
        reply_rx
            .blocking_recv()
            .map_err(|_| DroverError::ControlProtocol("server dropped the request".into()))
    }

    /// Request a graceful stop.
    pub fn stop(&self) -> Result<(), DroverError> {
        self.send(ControlAction::Stop).map(|_| ())
    }
}

/// Builder and entry point for a server process.
pub struct Launcher {
    config: Arc<DroverConfig>,
    worker_command: Option<WorkerCommand>,
    app: Option<Arc<dyn App>>,
    collector: Arc<dyn Collector>,
    events: Events,
    cmd_tx: ControlCmdTx,
    cmd_rx: ControlCmdRx,
}

impl Launcher {
    pub fn new(config: DroverConfig) -> Result<Self, DroverError> {
        config.validate()?;
        let (cmd_tx, cmd_rx) = control_channel();
        Ok(Self {
            config: Arc::new(config),
            worker_command: None,
            app: None,
            collector: Arc::new(AllocatorCollector::new()),
            events: Events::new(),
            cmd_tx,
            cmd_rx,
        })
    }

    pub fn config(&self) -> &DroverConfig {
        &self.config
    }

    /// Override how worker processes are started (cluster mode).
    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.worker_command = Some(command);
        self
    }

    /// Serve a custom application (single mode; workers use the configured
    /// built-in app).
    pub fn with_app(mut self, app: Arc<dyn App>) -> Self {
        self.app = Some(app);
        self
    }

    pub fn with_collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.collector = collector;
        self
    }

    /// Subscribe to lifecycle events.
    pub fn on_event<F>(&mut self, hook: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(hook);
    }

    pub fn handle(&self) -> LauncherHandle {
        LauncherHandle {
            tx: self.cmd_tx.clone(),
        }
    }

    /// Boot and serve until stopped.
    pub fn run(self) -> Result<LaunchExit, DroverError> {
        let Launcher {
            config,
            worker_command,
            app,
            collector,
            events,
            cmd_tx,
            cmd_rx,
        } = self;

        info!(
            version = env!("CARGO_PKG_VERSION"),
            pid = std::process::id(),
            mode = if config.is_clustered() { "cluster" } else { "single" },
            workers = config.workers,
            tag = config.tag.as_deref().unwrap_or(""),
            "drover starting"
        );
        if !events.is_empty() {
            debug!(hooks = events.len(), "lifecycle hooks registered");
        }

        let endpoint = resolve_control_url(&config)?;
        let token = resolve_token(&config, endpoint.is_some());

        let listeners = listener::bind_all(&config.bind_urls()?)?;
        let socket_paths: Vec<PathBuf> = listeners.iter().filter_map(Listener::socket_path).collect();

        let plane = match ControlPlane::start(endpoint, token.clone(), cmd_tx) {
            Ok(plane) => plane,
            Err(e) => {
                remove_sockets(&socket_paths);
                return Err(e);
            }
        };
        if let Some(url) = plane.url() {
            info!(url = %url, "control endpoint ready");
        }

        let mut wrote_pid = false;
        let result = (|| {
            if let Some(path) = &config.pidfile {
                persistence::write_pid_file(path)?;
                wrote_pid = true;
            }
            if let Some(path) = &config.state_path {
                StateStore::new(path).write(&launch_snapshot(&config, plane.url(), &token))?;
            }
            serve(&config, listeners, worker_command, app, collector, &events, cmd_rx)
        })();

        plane.shutdown();
        if wrote_pid {
            if let Some(path) = &config.pidfile {
                persistence::remove_pid_file(path);
            }
        }
        remove_sockets(&socket_paths);

        match &result {
            Ok(exit) => info!(?exit, "drover stopped"),
            Err(e) => warn!(error = %e, "drover stopped with an error"),
        }
        events.emit(LifecycleEvent::Stopped);
        result
    }
}

fn serve(
    config: &Arc<DroverConfig>,
    listeners: Vec<Listener>,
    worker_command: Option<WorkerCommand>,
    app: Option<Arc<dyn App>>,
    collector: Arc<dyn Collector>,
    events: &Events,
    cmd_rx: ControlCmdRx,
) -> Result<LaunchExit, DroverError> {
    if config.is_clustered() {
        for listener in &listeners {
            listener.clear_cloexec()?;
        }
        let listen_fds = listener::encode_inherited(&listeners);
        let command = match worker_command {
            Some(command) => command,
            None => WorkerCommand::current_exe()?,
        };
        let mut supervisor = Supervisor::new(
            Arc::clone(config),
            command,
            listen_fds,
            collector,
            events.clone(),
        )?;
        // `listeners` stays open here so the sockets outlive every worker.
        let exit = supervisor.run(cmd_rx)?;
        drop(listeners);
        Ok(match exit {
            FleetExit::Stopped => LaunchExit::Stopped,
            FleetExit::Halted => LaunchExit::Halted,
        })
    } else {
        let app = app.unwrap_or_else(|| app::builtin(config.app));
        let server = WorkerServer::start(config, listeners, app, "server")?;
        let single = SingleServer::new(server, Arc::clone(config), collector, events.clone());
        Ok(match single.run(cmd_rx)? {
            SingleExit::Stopped => LaunchExit::Stopped,
            SingleExit::Halted => LaunchExit::Halted,
        })
    }
}

fn resolve_control_url(config: &DroverConfig) -> Result<Option<BindUrl>, DroverError> {
    match config.control_url.as_deref() {
        None => Ok(None),
        Some(AUTO_CONTROL_URL) => Ok(Some(BindUrl::auto_control())),
        Some(url) => url.parse().map(Some),
    }
}

fn resolve_token(config: &DroverConfig, has_endpoint: bool) -> String {
    match config.control_token.as_deref() {
        Some(token) if token.trim().is_empty() => {
            if has_endpoint {
                warn!("control token is empty: control requests are not authenticated");
            }
            String::new()
        }
        Some(token) => token.to_string(),
        None => {
            let token = uuid::Uuid::new_v4().simple().to_string();
            if has_endpoint {
                info!(token = %token, "generated control token");
            }
            token
        }
    }
}

fn remove_sockets(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            debug!(path = %path.display(), error = %e, "socket file not removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use drover_control::ControlClient;

    fn wait_for_file(path: &std::path::Path) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !path.exists() {
            assert!(Instant::now() < deadline, "{} never appeared", path.display());
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn single_config(dir: &std::path::Path) -> DroverConfig {
        DroverConfig {
            binds: vec![format!("unix://{}", dir.join("app.sock").display())],
            control_url: Some(format!("unix://{}", dir.join("ctl.sock").display())),
            control_token: Some("secret".into()),
            state_path: Some(dir.join("drover.state")),
            pidfile: Some(dir.join("drover.pid")),
            ..Default::default()
        }
    }

    #[test]
    fn single_mode_boot_serve_and_cleanup() {
        let tmp = tempfile::tempdir().unwrap();
        let config = single_config(tmp.path());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut launcher = Launcher::new(config).unwrap();
        let s = Arc::clone(&seen);
        launcher.on_event(move |ev| s.lock().unwrap().push(ev.clone()));
        let handle = launcher.handle();
        let running = std::thread::spawn(move || launcher.run());

        let state_path = tmp.path().join("drover.state");
        wait_for_file(&state_path);
        let state = StateStore::read(&state_path).unwrap();
        assert_eq!(state["pid"], std::process::id());
        assert!(!state.contains_key("control_token"));
        let control_url: BindUrl = state["control_url"].as_str().unwrap().parse().unwrap();

        // The state file is written before the pool starts; wait for it.
        let client = ControlClient::new(control_url, Some("secret".into()));
        let deadline = Instant::now() + Duration::from_secs(10);
        let stats = loop {
            let reply = client.send("stats").unwrap();
            if reply.is_ok() {
                break reply.body;
            }
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(20));
        };
        assert_eq!(stats["pool_capacity"], 16);

        handle.stop().unwrap();
        assert_eq!(running.join().unwrap().unwrap(), LaunchExit::Stopped);

        assert!(!tmp.path().join("drover.pid").exists());
        assert!(!tmp.path().join("ctl.sock").exists());
        assert!(!tmp.path().join("app.sock").exists());
        assert!(state_path.exists());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&LifecycleEvent::Booted { clustered: false }));
        assert_eq!(seen.last(), Some(&LifecycleEvent::Stopped));
    }

    #[test]
    fn state_write_failure_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let mut config = single_config(tmp.path());
        config.state_path = Some(blocker.join("drover.state"));
        let result = Launcher::new(config).unwrap().run();

        assert!(matches!(result, Err(DroverError::StateWrite(_))));
        assert!(!tmp.path().join("app.sock").exists());
        assert!(!tmp.path().join("drover.pid").exists());
    }

    #[derive(Default)]
    struct CountingCollector(std::sync::atomic::AtomicU64);

    impl Collector for CountingCollector {
        fn force_collect(&self) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }

        fn stats(&self) -> serde_json::Map<String, serde_json::Value> {
            let mut map = serde_json::Map::new();
            let count = self.0.load(std::sync::atomic::Ordering::SeqCst);
            map.insert("count".into(), count.into());
            map.insert("kind".into(), "counting".into());
            map
        }
    }

    #[test]
    fn custom_collector_serves_gc_actions() {
        let tmp = tempfile::tempdir().unwrap();
        let collector = Arc::new(CountingCollector::default());
        let launcher = Launcher::new(single_config(tmp.path()))
            .unwrap()
            .with_collector(collector.clone());
        let handle = launcher.handle();
        let running = std::thread::spawn(move || launcher.run());

        assert!(handle.send(ControlAction::Gc).unwrap().is_ok());
        assert!(handle.send(ControlAction::Gc).unwrap().is_ok());
        let stats = handle.send(ControlAction::GcStats).unwrap();
        assert_eq!(stats.body["count"], 2);
        assert_eq!(stats.body["kind"], "counting");
        assert_eq!(collector.0.load(std::sync::atomic::Ordering::SeqCst), 2);

        handle.stop().unwrap();
        assert_eq!(running.join().unwrap().unwrap(), LaunchExit::Stopped);
    }

    #[test]
    fn handle_reports_stopped_server() {
        let launcher = Launcher::new(DroverConfig::default()).unwrap();
        let handle = launcher.handle();
        drop(launcher);
        assert!(handle.stop().is_err());
    }

    #[test]
    fn token_resolution() {
        let mut config = DroverConfig::default();
        assert_eq!(resolve_token(&config, true).len(), 32);

        config.control_token = Some(String::new());
        assert_eq!(resolve_token(&config, true), "");

        config.control_token = Some("abc".into());
        assert_eq!(resolve_token(&config, true), "abc");
    }

    #[test]
    fn auto_control_url_is_a_fresh_socket() {
        let config = DroverConfig {
            control_url: Some(AUTO_CONTROL_URL.into()),
            ..Default::default()
        };
        let url = resolve_control_url(&config).unwrap().unwrap();
        assert!(url.unix_path().is_some());
        assert_eq!(resolve_control_url(&DroverConfig::default()).unwrap(), None);
    }
}
