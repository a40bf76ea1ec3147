//! Rigwarden - mining rig watchdog and process supervisor
//!
//! Keeps the miner and its helper processes running, watches the miner's
//! reported performance, and escalates from miner restart to host reboot
//! when it stalls.

mod cli;
mod error;
mod manifest;
mod sickbay;
mod sys;
mod warden;

use cli::{Cli, Commands, WatchdogArgs};
use error::{Error, Result};
use manifest::WatchdogConfig;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

fn main() {
    let cli = Cli::parse_args();

    if let Err(e) = init_logging(&cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(cli) {
        error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Install the tracing subscriber; `RUST_LOG` takes precedence over flags
fn init_logging(cli: &Cli) -> Result<()> {
    let level = if cli.debug_logging() { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if let Some(ref log_file) = cli.log_file {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| Error::ConfigRead {
                path: log_file.clone(),
                source: e,
            })?;
        let file_layer = fmt::layer()
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false);
        subscriber.with(file_layer).init();
    } else {
        let stdout_layer = fmt::layer().with_target(cli.debug_logging());
        subscriber.with(stdout_layer).init();
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
        }

        Commands::Init { miner, force } => {
            if cli.config.exists() && !force {
                eprintln!(
                    "Error: {} already exists. Use -y/--force to overwrite.",
                    cli.config.display()
                );
                std::process::exit(1);
            }
            if let Some(parent) = cli.config.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            fs::write(&cli.config, manifest::default_document(miner))?;
            println!("Created {}", cli.config.display());
            println!("Edit every \"{}\" value before starting.", manifest::UNCONFIGURED);
        }

        Commands::Check => {
            let config = manifest::load(&cli.config)?;
            println!("Configuration OK: {}", cli.config.display());
            println!();
            for spec in config.roster()? {
                let status = if spec.enabled { "enabled" } else { "disabled" };
                println!("  {:<10} [{}] {}", spec.name, status, spec.argv.join(" "));
            }
            println!();
            print_watchdog(&config.watchdog);
        }

        Commands::Supervise => {
            let config = manifest::load(&cli.config)?;
            if let Some(pid_file) = &config.supervisor.pid_file {
                sys::write_pid_file(pid_file)?;
            }

            let mut supervisor =
                warden::ProcessSupervisor::new(Arc::new(config), warden::OsProcessTable::new())?;
            supervisor.start()?;

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(supervisor.run())?;
            info!("Supervisor stopped; children left running");
        }

        Commands::Watchdog(args) => {
            let config = watchdog_config(&cli.config, &args)?;
            let mut watchdog = sickbay::Watchdog::from_config(&config)?;
            watchdog.run();
        }
    }

    Ok(())
}

/// Watchdog settings from the config file (if any) plus CLI overrides
fn watchdog_config(path: &Path, args: &WatchdogArgs) -> Result<WatchdogConfig> {
    let mut config = if path.exists() {
        manifest::load(path)?.watchdog
    } else {
        warn!("{} not found, using watchdog defaults", path.display());
        WatchdogConfig::default()
    };
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn print_watchdog(config: &WatchdogConfig) {
    println!("Watchdog:");
    println!("  family:              {}", config.family);
    match config.family {
        sickbay::probe::WorkerFamily::GpuLoad => match config.gpu_source {
            manifest::GpuSource::Telemetry => {
                println!("  source:              {}", config.telemetry_url)
            }
            manifest::GpuSource::Local => println!("  source:              {}", config.query_tool),
        },
        _ => println!("  source:              {}:{}", config.host, config.port),
    }
    println!("  minimal performance: {}", config.minimal_performance);
    println!("  samples:             {}", config.samples);
    println!("  miss threshold:      {}", config.miss_threshold);
    println!("  min valid shares:    {}", config.min_valid);
    println!("  grace period:        {}s", config.grace_period);
    println!("  max restarts:        {}", config.max_restarts);
    println!("  reboot command:      {}", config.reboot_command.join(" "));
}
