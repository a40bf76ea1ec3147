//! Command-line interface for Rigwarden
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use crate::manifest::{MinerKind, WatchdogConfig};
use crate::sickbay::probe::WorkerFamily;

/// Rigwarden - mining rig watchdog and process supervisor
#[derive(Parser)]
#[command(name = "rigwarden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "rigwarden.toml", global = true)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Append log output to this file instead of stdout
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Launch the process roster and keep it running
    Supervise,

    /// Monitor the local worker and remediate when it stalls
    Watchdog(WatchdogArgs),

    /// Write a default configuration file
    Init {
        /// Miner template to use
        #[arg(short, long, value_enum, default_value = "ccminer")]
        miner: MinerKind,

        /// Overwrite an existing file
        #[arg(short = 'y', long)]
        force: bool,
    },

    /// Validate configuration and show resolved commands
    Check,

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Overrides for the `[watchdog]` section
#[derive(clap::Args, Debug, Default)]
pub struct WatchdogArgs {
    /// Worker family to monitor
    #[arg(short, long, value_enum)]
    pub family: Option<WorkerFamily>,

    /// Lowest healthy rolling average
    #[arg(short, long)]
    pub minimal_performance: Option<f64>,

    /// Worker API host
    #[arg(long)]
    pub host: Option<String>,

    /// Worker API port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Debug logging (same as --verbose)
    #[arg(short, long)]
    pub debug: bool,
}

impl WatchdogArgs {
    /// Apply command-line overrides on top of the file configuration
    pub fn apply(&self, config: &mut WatchdogConfig) {
        if let Some(family) = self.family {
            config.family = family;
        }
        if let Some(minimal) = self.minimal_performance {
            config.minimal_performance = minimal;
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Debug-level logging requested
    pub fn debug_logging(&self) -> bool {
        self.verbose || matches!(&self.command, Commands::Watchdog(args) if args.debug)
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "rigwarden", &mut std::io::stdout());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_watchdog_overrides() {
        let cli = Cli::try_parse_from([
            "rigwarden",
            "-c",
            "/etc/rig.toml",
            "watchdog",
            "--family",
            "gpu-load",
            "--minimal-performance",
            "85",
            "--port",
            "42000",
            "--debug",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("/etc/rig.toml"));
        assert!(cli.debug_logging());
        let Commands::Watchdog(args) = &cli.command else {
            panic!("expected watchdog command");
        };

        let mut config = WatchdogConfig::default();
        args.apply(&mut config);
        assert_eq!(config.family, WorkerFamily::GpuLoad);
        assert_eq!(config.minimal_performance, 85.0);
        assert_eq!(config.port, 42000);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_init_defaults() {
        let cli = Cli::try_parse_from(["rigwarden", "init", "--miner", "ethminer"]).unwrap();
        assert!(!cli.debug_logging());
        assert!(matches!(
            cli.command,
            Commands::Init { miner: MinerKind::Ethminer, force: false }
        ));
        assert_eq!(cli.config, PathBuf::from("rigwarden.toml"));
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from(["rigwarden", "supervise", "-v", "--log-file", "/tmp/rig.log"])
            .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.log_file, Some(PathBuf::from("/tmp/rig.log")));
    }
}
