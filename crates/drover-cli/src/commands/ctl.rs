use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use drover_control::{ControlAction, ControlClient};
use drover_server::persistence;
use drover_server::StateStore;
use drover_types::BindUrl;

/// Flags for `drover ctl`.
#[derive(Args, Debug)]
pub struct CtlArgs {
    /// Control endpoint URL
    #[arg(short = 'C', long)]
    pub control_url: Option<String>,

    /// Control token
    #[arg(short = 'T', long)]
    pub control_token: Option<String>,

    /// State file to read the control URL from
    #[arg(short = 'S', long)]
    pub state: Option<PathBuf>,

    /// Signal this pid directly instead of using the control endpoint
    #[arg(short, long)]
    pub pid: Option<u32>,

    /// Read the pid to signal from this pid file
    #[arg(short = 'P', long, conflicts_with = "pid")]
    pub pidfile: Option<PathBuf>,

    /// stats, gc, gc-stats, stop, halt, restart, or phased-restart
    pub action: String,
}

/// Run the `drover ctl` command.
pub fn run(args: CtlArgs) -> Result<()> {
    let action: ControlAction = args.action.parse().map_err(|e: String| anyhow!(e))?;

    if let Some(pid) = target_pid(&args)? {
        return send_signal(pid, action);
    }

    let url = resolve_url(&args)?;
    let client = ControlClient::new(url, args.control_token.clone());
    let reply = client
        .send(action.as_str())
        .map_err(|e| anyhow!("control request to {} failed: {e}", client.url()))?;

    println!("{}", reply.body);
    if !reply.is_ok() {
        bail!("{action} failed ({})", reply.status.code());
    }
    Ok(())
}

fn resolve_url(args: &CtlArgs) -> Result<BindUrl> {
    if let Some(url) = &args.control_url {
        return Ok(url.parse()?);
    }
    let Some(state_path) = &args.state else {
        bail!("no control endpoint: pass -C URL, -S STATE, or -p PID");
    };
    let state = StateStore::read(state_path)
        .with_context(|| format!("failed to read state file {}", state_path.display()))?;
    let url = state
        .get("control_url")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("state file {} has no control_url", state_path.display()))?;
    Ok(url.parse()?)
}

/// The pid to signal, from `-p` or a pid file.
fn target_pid(args: &CtlArgs) -> Result<Option<u32>> {
    if let Some(pid) = args.pid {
        return Ok(Some(pid));
    }
    let Some(path) = &args.pidfile else {
        return Ok(None);
    };
    persistence::read_pid(path)
        .map(Some)
        .ok_or_else(|| anyhow!("no pid in pid file {}", path.display()))
}

fn send_signal(pid: u32, action: ControlAction) -> Result<()> {
    let sig = match action {
        ControlAction::Stop => Signal::SIGTERM,
        ControlAction::Halt => Signal::SIGKILL,
        ControlAction::Restart => Signal::SIGUSR2,
        ControlAction::PhasedRestart => Signal::SIGUSR1,
        other => bail!("{other} is not available by pid; use the control endpoint"),
    };
    if !persistence::is_process_alive(pid) {
        bail!("No pid '{pid}' found");
    }
    let raw = i32::try_from(pid).map_err(|_| anyhow!("No pid '{pid}' found"))?;
    signal::kill(Pid::from_raw(raw), sig).with_context(|| format!("failed to signal pid {pid}"))?;
    println!("Command {action} sent success");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(action: &str) -> CtlArgs {
        CtlArgs {
            control_url: None,
            control_token: None,
            state: None,
            pid: None,
            pidfile: None,
            action: action.into(),
        }
    }

    #[test]
    fn url_from_state_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("drover.state");
        std::fs::write(&path, r#"{"control_url":"unix:///tmp/ctl.sock","pid":1}"#).unwrap();

        let mut a = args("stats");
        a.state = Some(path);
        assert_eq!(resolve_url(&a).unwrap(), BindUrl::Unix("/tmp/ctl.sock".into()));
    }

    #[test]
    fn explicit_url_wins_over_state() {
        let mut a = args("stats");
        a.control_url = Some("tcp://127.0.0.1:9293".into());
        a.state = Some(PathBuf::from("/nonexistent"));
        assert_eq!(resolve_url(&a).unwrap(), BindUrl::Tcp("127.0.0.1:9293".into()));
    }

    #[test]
    fn no_endpoint_is_an_error() {
        assert!(resolve_url(&args("stats")).is_err());
    }

    #[test]
    fn pid_comes_from_flag_or_pid_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("drover.pid");
        std::fs::write(&path, "4242\n").unwrap();

        assert_eq!(target_pid(&args("stop")).unwrap(), None);

        let mut a = args("stop");
        a.pidfile = Some(path);
        assert_eq!(target_pid(&a).unwrap(), Some(4242));

        a.pid = Some(7);
        assert_eq!(target_pid(&a).unwrap(), Some(7));

        let mut missing = args("stop");
        missing.pidfile = Some(tmp.path().join("absent.pid"));
        assert!(target_pid(&missing).unwrap_err().to_string().contains("no pid"));
    }

    #[test]
    fn read_actions_cannot_be_signalled() {
        let err = send_signal(std::process::id(), ControlAction::Stats).unwrap_err();
        assert!(err.to_string().contains("not available by pid"));
    }

    #[test]
    fn unknown_action_is_rejected() {
        assert!(run(args("reload")).is_err());
    }
}
