//! Worker server: one thread pool plus one acceptor thread per listener.
//!
//! Single mode runs a [`WorkerServer`] in the launcher process. In cluster mode
//! each worker process runs one through [`run_process`], reporting to the
//! supervisor over stdout and taking directives on stdin.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use drover_types::{DroverConfig, DroverError, LogFormat, PoolStatus, ServerStats};

use crate::app::{self, App};
use crate::heartbeat::{
    self, Directive, WorkerMessage, ENV_LISTEN_FDS, ENV_WORKER_CONFIG, ENV_WORKER_INDEX,
    ENV_WORKER_PHASE,
};
use crate::listener::{self, Listener};
use crate::logging;
use crate::pool::{PoolConfig, ThreadPool};

/// Sleep between accept attempts when no connection is pending.
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// How long an acceptor waits for pool capacity before re-checking its stop
/// flag.
const CAPACITY_POLL: Duration = Duration::from_millis(100);

/// A pool serving a set of listeners.
pub struct WorkerServer {
    pool: Arc<ThreadPool>,
    listeners: Vec<Arc<Listener>>,
    app: Arc<dyn App>,
    stop: Arc<AtomicBool>,
    acceptors: Vec<JoinHandle<()>>,
    started_at: DateTime<Utc>,
    name: String,
}

impl WorkerServer {
    /// Build the pool and start accepting on every listener.
    pub fn start(
        config: &DroverConfig,
        listeners: Vec<Listener>,
        app: Arc<dyn App>,
        name: impl Into<String>,
    ) -> Result<Self, DroverError> {
        let name = name.into();
        for listener in &listeners {
            listener.set_nonblocking(true)?;
        }
        let mut server = Self {
            pool: Arc::new(build_pool(config, &name)?),
            listeners: listeners.into_iter().map(Arc::new).collect(),
            app,
            stop: Arc::new(AtomicBool::new(false)),
            acceptors: Vec::new(),
            started_at: Utc::now(),
            name,
        };
        server.spawn_acceptors()?;
        info!(
            app = server.app.name(),
            min_threads = config.min_threads,
            max_threads = config.max_threads,
            listeners = server.listeners.len(),
            "server ready"
        );
        Ok(server)
    }

    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            started_at: self.started_at,
            pool: self.pool.status(),
        }
    }

    /// Stop taking new connections and wait for the acceptors to exit.
    pub fn stop_accepting(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.acceptors.drain(..) {
            if handle.join().is_err() {
                error!("acceptor thread panicked");
            }
        }
    }

    /// Graceful stop: close admission, finish in-flight work.
    pub fn stop(mut self) {
        self.stop_accepting();
        self.pool.drain_and_stop();
        info!(server = %self.name, "server stopped");
    }

    /// Drain the current pool and start a fresh one on the same listeners.
    pub fn restart(&mut self, config: &DroverConfig) -> Result<(), DroverError> {
        self.stop_accepting();
        self.pool.drain_and_stop();

        self.pool = Arc::new(build_pool(config, &self.name)?);
        self.stop = Arc::new(AtomicBool::new(false));
        self.started_at = Utc::now();
        self.spawn_acceptors()?;
        info!(server = %self.name, "server restarted");
        Ok(())
    }

    fn spawn_acceptors(&mut self) -> Result<(), DroverError> {
        for (i, listener) in self.listeners.iter().enumerate() {
            let listener = Arc::clone(listener);
            let pool = Arc::clone(&self.pool);
            let app = Arc::clone(&self.app);
            let stop = Arc::clone(&self.stop);
            let handle = std::thread::Builder::new()
                .name(format!("{}-accept-{i}", self.name))
                .spawn(move || accept_loop(&listener, &pool, &app, &stop))
                .map_err(|e| DroverError::Spawn(format!("acceptor thread: {e}")))?;
            self.acceptors.push(handle);
        }
        Ok(())
    }
}

impl Drop for WorkerServer {
    fn drop(&mut self) {
        // Detached acceptors notice on their next poll.
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn build_pool(config: &DroverConfig, name: &str) -> Result<ThreadPool, DroverError> {
    ThreadPool::new(PoolConfig {
        min_threads: config.min_threads,
        max_threads: config.max_threads,
        idle_timeout: config.thread_idle_timeout(),
        name: format!("{name}-pool"),
    })
}

fn accept_loop(listener: &Listener, pool: &ThreadPool, app: &Arc<dyn App>, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        // Leave connections in the kernel backlog while saturated so a less
        // loaded sibling can take them.
        if !pool.wait_for_capacity(CAPACITY_POLL) {
            continue;
        }
        match listener.accept() {
            Ok(conn) => {
                let app = Arc::clone(app);
                if let Err(e) = pool.submit(Box::new(move || app.handle(conn))) {
                    debug!(error = %e, "connection dropped");
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(error = %e, "accept failed");
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Drained after a stop directive or parent loss.
    Stopped,
    /// Halt directive; nothing was drained.
    Halted,
}

/// Identity and configuration handed to a worker process by its supervisor.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub index: usize,
    pub phase: u64,
    pub config: DroverConfig,
    pub listen_fds: String,
}

impl WorkerEnv {
    /// Read the worker environment set by the supervisor.
    pub fn from_env() -> Result<Self, DroverError> {
        let var = |name: &str| {
            std::env::var(name).map_err(|_| {
                DroverError::Config(format!(
                    "{name} is not set; `worker` is spawned by the supervisor"
                ))
            })
        };
        let index = var(ENV_WORKER_INDEX)?
            .parse()
            .map_err(|e| DroverError::Config(format!("invalid {ENV_WORKER_INDEX}: {e}")))?;
        let phase = var(ENV_WORKER_PHASE)?
            .parse()
            .map_err(|e| DroverError::Config(format!("invalid {ENV_WORKER_PHASE}: {e}")))?;
        let config: DroverConfig = serde_json::from_str(&var(ENV_WORKER_CONFIG)?)
            .map_err(|e| DroverError::Config(format!("invalid {ENV_WORKER_CONFIG}: {e}")))?;
        config.validate()?;
        Ok(Self {
            index,
            phase,
            config,
            listen_fds: var(ENV_LISTEN_FDS)?,
        })
    }
}

/// Worker process main: serve inherited listeners until told to stop.
pub fn run_process() -> Result<WorkerExit, DroverError> {
    let env = WorkerEnv::from_env()?;
    let format = match env.config.log_format {
        LogFormat::Auto => LogFormat::Pid,
        other => other,
    };
    logging::init(format);

    // SAFETY: the supervisor passes listening sockets it bound and made
    // inheritable; nothing else in this process wraps those fds.
    let listeners = unsafe { listener::decode_inherited(&env.listen_fds)? };
    let app = app::builtin(env.config.app);
    run_worker(
        &env,
        listeners,
        app,
        std::io::BufReader::new(std::io::stdin()),
        std::io::stdout(),
    )
}

/// Worker loop over explicit channels. `directives` is read on a helper
/// thread; `heartbeats` receives the boot message and periodic status.
pub fn run_worker<R, W>(
    env: &WorkerEnv,
    listeners: Vec<Listener>,
    app: Arc<dyn App>,
    directives: R,
    mut heartbeats: W,
) -> Result<WorkerExit, DroverError>
where
    R: BufRead + Send + 'static,
    W: std::io::Write,
{
    let pid = std::process::id();
    let (index, phase) = (env.index, env.phase);
    let server = WorkerServer::start(&env.config, listeners, app, format!("worker-{index}"))?;

    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("directives".into())
        .spawn(move || read_directives(directives, tx))
        .map_err(|e| DroverError::Spawn(format!("directive reader: {e}")))?;

    if let Err(e) = heartbeat::send(&mut heartbeats, &WorkerMessage::Booted { index, pid, phase }) {
        warn!(error = %e, "supervisor unreachable at boot, stopping");
        server.stop();
        return Ok(WorkerExit::Stopped);
    }
    info!(index, phase, "worker booted");

    let interval = env.config.worker_check_interval();
    loop {
        match rx.recv_timeout(interval) {
            Ok(Directive::Stop) => {
                info!(index, "stop requested, draining");
                server.stop();
                return Ok(WorkerExit::Stopped);
            }
            Ok(Directive::Halt) => {
                info!(index, "halt requested");
                return Ok(WorkerExit::Halted);
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                warn!(index, "supervisor went away, stopping");
                server.stop();
                return Ok(WorkerExit::Stopped);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let msg = WorkerMessage::Status {
                    index,
                    pid,
                    phase,
                    booted: true,
                    status: server.status(),
                };
                if let Err(e) = heartbeat::send(&mut heartbeats, &msg) {
                    warn!(index, error = %e, "heartbeat failed, supervisor gone; stopping");
                    server.stop();
                    return Ok(WorkerExit::Stopped);
                }
            }
        }
    }
}

/// Forward directives until EOF. Dropping `tx` on EOF tells the main loop the
/// supervisor is gone.
fn read_directives<R: BufRead>(reader: R, tx: mpsc::Sender<Directive>) {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!(error = %e, "directive channel closed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match heartbeat::decode_directive(&line) {
            Ok(directive) => {
                if tx.send(directive).is_err() {
                    return;
                }
            }
            Err(e) => warn!(error = %e, "ignoring malformed directive"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read, Write};
    use std::net::TcpStream;
    use std::sync::Mutex;

    use drover_types::BindUrl;

    use crate::app::HelloApp;

    fn config() -> DroverConfig {
        DroverConfig {
            max_threads: 4,
            worker_check_interval: 1,
            ..Default::default()
        }
    }

    fn tcp_listener() -> (Listener, String) {
        let listener = Listener::bind(&"tcp://127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = match listener.local_url().unwrap() {
            BindUrl::Tcp(addr) => addr,
            other => panic!("unexpected {other:?}"),
        };
        (listener, addr)
    }

    fn get(addr: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn server_answers_and_reports_idle_pool() {
        let (listener, addr) = tcp_listener();
        let server = WorkerServer::start(&config(), vec![listener], Arc::new(HelloApp), "t").unwrap();

        assert!(get(&addr).contains("Hello World"));
        let stats = server.stats();
        assert_eq!(stats.pool.max_threads, 4);
        assert_eq!(stats.pool.backlog, 0);
        server.stop();
    }

    #[test]
    fn restart_keeps_listener() {
        let (listener, addr) = tcp_listener();
        let mut server =
            WorkerServer::start(&config(), vec![listener], Arc::new(HelloApp), "t").unwrap();
        let before = server.stats().started_at;

        server.restart(&config()).unwrap();
        assert!(server.stats().started_at >= before);
        assert!(get(&addr).contains("Hello World"));
        server.stop();
    }

    /// Writer shared with the test so heartbeats can be inspected.
    #[derive(Clone, Default)]
    struct Lines(Arc<Mutex<Vec<u8>>>);

    impl Write for Lines {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn worker_env() -> WorkerEnv {
        WorkerEnv {
            index: 3,
            phase: 1,
            config: config(),
            listen_fds: String::new(),
        }
    }

    #[test]
    fn stop_directive_drains_and_reports_boot() {
        let (listener, _) = tcp_listener();
        let out = Lines::default();
        let directives = Cursor::new(b"{\"type\":\"stop\"}\n".to_vec());

        let exit = run_worker(&worker_env(), vec![listener], Arc::new(HelloApp), directives, out.clone())
            .unwrap();
        assert_eq!(exit, WorkerExit::Stopped);

        let written = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        let first = heartbeat::decode_message(written.lines().next().unwrap()).unwrap();
        assert_eq!(
            first,
            WorkerMessage::Booted { index: 3, pid: std::process::id(), phase: 1 }
        );
    }

    #[test]
    fn halt_directive_exits_without_drain() {
        let (listener, _) = tcp_listener();
        let directives = Cursor::new(b"{\"type\":\"halt\"}\n".to_vec());
        let exit = run_worker(&worker_env(), vec![listener], Arc::new(HelloApp), directives, Lines::default())
            .unwrap();
        assert_eq!(exit, WorkerExit::Halted);
    }

    #[test]
    fn parent_eof_stops_worker() {
        let (listener, _) = tcp_listener();
        let exit = run_worker(
            &worker_env(),
            vec![listener],
            Arc::new(HelloApp),
            Cursor::new(Vec::new()),
            Lines::default(),
        )
        .unwrap();
        assert_eq!(exit, WorkerExit::Stopped);
    }

    #[test]
    fn missing_env_is_a_config_error() {
        std::env::remove_var(ENV_WORKER_INDEX);
        assert!(matches!(WorkerEnv::from_env(), Err(DroverError::Config(_))));
    }
}
