use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;
use tracing::info;

use drover_server::{logging, LaunchExit, Launcher};
use drover_types::{parse_threads, AppKind, DroverConfig, LogFormat};

/// Flags for `drover run`. Every flag overrides the matching config file key.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// TOML configuration file
    #[arg(short = 'C', long)]
    pub config: Option<PathBuf>,

    /// Worker processes (0 runs a single process)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Threads per process as MIN:MAX (or MAX)
    #[arg(short, long)]
    pub threads: Option<String>,

    /// Listener URL (tcp://host:port or unix://path); repeatable
    #[arg(short, long)]
    pub bind: Vec<String>,

    /// Control endpoint URL, or `auto` for a generated local socket
    #[arg(long)]
    pub control_url: Option<String>,

    /// Control token; an empty value disables authentication
    #[arg(long)]
    pub control_token: Option<String>,

    /// State file written at boot
    #[arg(short = 'S', long)]
    pub state: Option<PathBuf>,

    /// Pid file written at boot
    #[arg(long)]
    pub pidfile: Option<PathBuf>,

    /// Built-in application (hello or sleep)
    #[arg(long)]
    pub app: Option<String>,

    /// Log line format (auto, default, or pid)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Tag echoed into logs and the state file
    #[arg(long)]
    pub tag: Option<String>,

    /// Seconds a new worker may take to boot
    #[arg(long)]
    pub worker_boot_timeout: Option<u64>,

    /// Seconds a stopping worker may take to drain
    #[arg(long)]
    pub worker_shutdown_timeout: Option<u64>,

    /// Seconds between worker heartbeats
    #[arg(long)]
    pub worker_check_interval: Option<u64>,

    /// Seconds without a heartbeat before a worker is replaced
    #[arg(long)]
    pub worker_timeout: Option<u64>,
}

/// Run the `drover run` command.
pub fn run(args: RunArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    logging::init(config.log_format.resolve(config.is_clustered()));

    let launcher = Launcher::new(config).context("invalid configuration")?;
    match launcher.run()? {
        LaunchExit::Stopped => Ok(()),
        LaunchExit::Halted => {
            info!("halted");
            std::process::exit(0);
        }
    }
}

/// Load the config file (if any), apply flag overrides, and validate.
pub fn resolve_config(args: &RunArgs) -> Result<DroverConfig> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => DroverConfig::default(),
    };
    apply_overrides(&mut config, args)?;
    config.validate()?;
    Ok(config)
}

fn load_config(path: &Path) -> Result<DroverConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    DroverConfig::from_toml(&content).with_context(|| format!("in {}", path.display()))
}

fn apply_overrides(config: &mut DroverConfig, args: &RunArgs) -> Result<()> {
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(spec) = &args.threads {
        let (min, max) = parse_threads(spec)?;
        config.min_threads = min;
        config.max_threads = max;
    }
    if !args.bind.is_empty() {
        config.binds = args.bind.clone();
    }
    if let Some(url) = &args.control_url {
        config.control_url = Some(url.clone());
    }
    if let Some(token) = &args.control_token {
        config.control_token = Some(token.clone());
    }
    if let Some(path) = &args.state {
        config.state_path = Some(path.clone());
    }
    if let Some(path) = &args.pidfile {
        config.pidfile = Some(path.clone());
    }
    if let Some(app) = &args.app {
        config.app = match app.as_str() {
            "hello" => AppKind::Hello,
            "sleep" => AppKind::Sleep,
            other => bail!("unknown app {other:?} (expected hello or sleep)"),
        };
    }
    if let Some(format) = &args.log_format {
        config.log_format = match format.as_str() {
            "auto" => LogFormat::Auto,
            "default" => LogFormat::Default,
            "pid" => LogFormat::Pid,
            other => bail!("unknown log format {other:?} (expected auto, default, or pid)"),
        };
    }
    if let Some(tag) = &args.tag {
        config.tag = Some(tag.clone());
    }
    if let Some(secs) = args.worker_boot_timeout {
        config.worker_boot_timeout = secs;
    }
    if let Some(secs) = args.worker_shutdown_timeout {
        config.worker_shutdown_timeout = secs;
    }
    if let Some(secs) = args.worker_check_interval {
        config.worker_check_interval = secs;
    }
    if let Some(secs) = args.worker_timeout {
        config.worker_timeout = secs;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("drover.toml");
        std::fs::write(&path, "workers = 4\nmax_threads = 8\ntag = \"file\"\n").unwrap();

        let args = RunArgs {
            config: Some(path),
            workers: Some(2),
            threads: Some("1:4".into()),
            control_token: Some(String::new()),
            ..Default::default()
        };
        let config = resolve_config(&args).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!((config.min_threads, config.max_threads), (1, 4));
        assert_eq!(config.tag.as_deref(), Some("file"));
        assert_eq!(config.control_token.as_deref(), Some(""));
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        let args = RunArgs {
            threads: Some("8:2".into()),
            ..Default::default()
        };
        assert!(resolve_config(&args).is_err());

        let args = RunArgs {
            app: Some("rack".into()),
            ..Default::default()
        };
        assert!(resolve_config(&args).is_err());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let args = RunArgs {
            config: Some(PathBuf::from("/nonexistent/drover.toml")),
            ..Default::default()
        };
        let err = resolve_config(&args).unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }
}
