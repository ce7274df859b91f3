mod commands;

use clap::{Parser, Subcommand};

use commands::ctl::CtlArgs;
use commands::run::RunArgs;

/// Drover -- a concurrent application server with supervised worker processes.
#[derive(Parser, Debug)]
#[command(name = "drover", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server (single process, or a supervised fleet with -w)
    Run(RunArgs),

    /// Send a control action to a running server
    Ctl(CtlArgs),

    /// Worker process entry point, spawned by the supervisor
    #[command(hide = true)]
    Worker,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => commands::run::run(args),
        Commands::Ctl(args) => commands::ctl::run(args),
        Commands::Worker => commands::worker::run(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn cli_parse_run_defaults() {
        let cli = Cli::try_parse_from(["drover", "run"]);
        assert!(cli.is_ok(), "should parse bare run: {cli:?}");
        match cli.unwrap().command {
            Commands::Run(args) => {
                assert!(args.config.is_none());
                assert!(args.workers.is_none());
                assert!(args.bind.is_empty());
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn cli_parse_run_with_flags() {
        let cli = Cli::try_parse_from([
            "drover",
            "run",
            "-C",
            "/etc/drover.toml",
            "-w",
            "2",
            "-t",
            "2:8",
            "-b",
            "tcp://127.0.0.1:9292",
            "-b",
            "unix:///tmp/app.sock",
            "--control-url",
            "auto",
            "--control-token",
            "",
            "-S",
            "/tmp/drover.state",
            "--app",
            "sleep",
        ]);
        assert!(cli.is_ok(), "should parse run flags: {cli:?}");
        match cli.unwrap().command {
            Commands::Run(args) => {
                assert_eq!(args.config, Some(PathBuf::from("/etc/drover.toml")));
                assert_eq!(args.workers, Some(2));
                assert_eq!(args.threads.as_deref(), Some("2:8"));
                assert_eq!(args.bind.len(), 2);
                assert_eq!(args.control_url.as_deref(), Some("auto"));
                assert_eq!(args.control_token.as_deref(), Some(""));
                assert_eq!(args.state, Some(PathBuf::from("/tmp/drover.state")));
                assert_eq!(args.app.as_deref(), Some("sleep"));
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn cli_parse_ctl() {
        let cli = Cli::try_parse_from([
            "drover",
            "ctl",
            "-C",
            "unix:///tmp/ctl.sock",
            "-T",
            "secret",
            "phased-restart",
        ]);
        assert!(cli.is_ok(), "should parse ctl: {cli:?}");
        match cli.unwrap().command {
            Commands::Ctl(args) => {
                assert_eq!(args.control_url.as_deref(), Some("unix:///tmp/ctl.sock"));
                assert_eq!(args.control_token.as_deref(), Some("secret"));
                assert_eq!(args.action, "phased-restart");
            }
            other => panic!("expected Ctl, got {other:?}"),
        }
    }

    #[test]
    fn cli_parse_ctl_by_pid() {
        let cli = Cli::try_parse_from(["drover", "ctl", "-p", "1234", "stop"]);
        match cli.unwrap().command {
            Commands::Ctl(args) => {
                assert_eq!(args.pid, Some(1234));
                assert_eq!(args.action, "stop");
            }
            other => panic!("expected Ctl, got {other:?}"),
        }
    }

    #[test]
    fn cli_ctl_requires_action() {
        assert!(Cli::try_parse_from(["drover", "ctl"]).is_err());
    }

    #[test]
    fn cli_parse_hidden_worker() {
        let cli = Cli::try_parse_from(["drover", "worker"]).unwrap();
        assert!(matches!(cli.command, Commands::Worker));
    }
}
