//! Command-line interface.

use clap::{Parser, Subcommand};
use courier_queue::{JobId, Priority};
use std::path::PathBuf;

/// Background worker and federated delivery queue.
#[derive(Debug, Parser)]
#[command(name = "courier", version)]
pub struct Cli {
    /// Directory holding `default.toml` and the environment overlays.
    #[arg(long, global = true, env = "COURIER_CONFIG_DIR", default_value = "./config")]
    pub config_dir: PathBuf,

    #[command(subcommand)]
    pub command: Mode,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Mode {
    /// Control the background daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },

    /// Run one supervisor tick and exit
    Worker {
        /// Use the frontend process limit
        #[arg(long, default_value_t = false)]
        frontend: bool,
    },

    /// Run the periodic sweep once
    Cron,

    /// Run a single claimed job (spawned by the supervisor)
    Execute {
        #[arg(long)]
        job: JobId,
    },

    /// Add a job to the queue
    Enqueue {
        /// Command name, e.g. `APDelivery`
        command: String,

        /// Ordered command parameters
        parameters: Vec<String>,

        /// Priority name or number
        #[arg(short, long, default_value = "medium")]
        priority: Priority,

        /// Overwrite the priority of an identical queued job
        #[arg(long, default_value_t = false)]
        force: bool,

        /// Seconds before the job may be claimed
        #[arg(long)]
        delay: Option<u64>,
    },

    /// Apply database migrations
    Migrate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum DaemonAction {
    /// Launch a detached daemon
    Start,
    /// Stop the running daemon
    Stop,
    /// Report whether the daemon runs
    Status,
    /// Run the daemon loop in the foreground
    Run,
}

impl Cli {
    /// Arguments that make a child process load the same configuration.
    pub fn child_args(&self) -> Vec<String> {
        vec![
            "--config-dir".to_string(),
            self.config_dir.display().to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_daemon_actions() {
        for (arg, expected) in [
            ("start", DaemonAction::Start),
            ("stop", DaemonAction::Stop),
            ("status", DaemonAction::Status),
            ("run", DaemonAction::Run),
        ] {
            let cli = Cli::try_parse_from(["courier", "daemon", arg]).unwrap();
            match cli.command {
                Mode::Daemon { action } => assert_eq!(action, expected),
                other => panic!("unexpected mode {:?}", other),
            }
        }
    }

    #[test]
    fn test_parse_execute_job() {
        let cli = Cli::try_parse_from(["courier", "execute", "--job", "42"]).unwrap();
        assert!(matches!(cli.command, Mode::Execute { job } if job == JobId(42)));
        assert_eq!(cli.config_dir, PathBuf::from("./config"));
    }

    #[test]
    fn test_parse_enqueue() {
        let cli = Cli::try_parse_from([
            "courier",
            "--config-dir",
            "/etc/courier",
            "enqueue",
            "APDelivery",
            "https://remote.example/inbox",
            "--priority",
            "high",
            "--force",
        ])
        .unwrap();

        match cli.command.clone() {
            Mode::Enqueue {
                command,
                parameters,
                priority,
                force,
                delay,
            } => {
                assert_eq!(command, "APDelivery");
                assert_eq!(parameters, vec!["https://remote.example/inbox".to_string()]);
                assert_eq!(priority, Priority::High);
                assert!(force);
                assert!(delay.is_none());
            }
            other => panic!("unexpected mode {:?}", other),
        }
        assert_eq!(cli.child_args(), vec!["--config-dir", "/etc/courier"]);
    }

    #[test]
    fn test_rejects_unknown_priority() {
        let result = Cli::try_parse_from(["courier", "enqueue", "Cron", "--priority", "urgent"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_worker_frontend_flag() {
        let cli = Cli::try_parse_from(["courier", "worker", "--frontend"]).unwrap();
        assert!(matches!(cli.command, Mode::Worker { frontend: true }));
    }
}
