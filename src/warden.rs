//! The Warden - Process Supervisor
//!
//! Keeps the rig's process roster (`api`, `oc`, `miner`, `watchdog`) alive:
//! - Checks every enabled process on a fixed interval
//! - Treats a PID whose command line no longer matches as dead (PID reuse)
//! - Relaunches dead processes with output captured per process
//! - Reloads configuration on SIGHUP without touching running children
//! - Backs off exponentially while checks keep failing

pub mod descriptor;
pub mod procs;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use rand::rng;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::manifest::{self, RigConfig};

pub use descriptor::{ProcessDescriptor, ProcessState};
pub use procs::{OsProcessTable, ProcessTable};

const MAX_FAILURE_DELAY_MS: u64 = 60_000;

fn failure_backoff(config: &RigConfig) -> ExponentialBackoff {
    let base = config.supervisor.restart_delay.saturating_mul(1000).max(1);
    ExponentialBackoff::new()
        .base_delay_ms(base)
        .max_delay_ms(base.max(MAX_FAILURE_DELAY_MS))
        .multiplier(2.0)
        .max_attempts(10)
        .jitter_factor(0.5)
}

/// Supervises the process roster with a one-for-one restart strategy
pub struct ProcessSupervisor<P: ProcessTable> {
    config: Arc<RigConfig>,
    descriptors: Vec<ProcessDescriptor>,
    processes: P,
    /// Consecutive ticks that ended with an error
    failures: u8,
    backoff: ExponentialBackoff,
}

impl<P: ProcessTable> ProcessSupervisor<P> {
    /// Create a supervisor with one descriptor per roster entry
    pub fn new(config: Arc<RigConfig>, processes: P) -> Result<Self> {
        let descriptors = config
            .roster()?
            .into_iter()
            .map(ProcessDescriptor::new)
            .collect();

        Ok(Self {
            backoff: failure_backoff(&config),
            config,
            descriptors,
            processes,
            failures: 0,
        })
    }

    pub fn config(&self) -> &Arc<RigConfig> {
        &self.config
    }

    pub fn descriptors(&self) -> &[ProcessDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, name: &str) -> Option<&ProcessDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    pub fn processes(&mut self) -> &mut P {
        &mut self.processes
    }

    /// Launch every enabled process
    ///
    /// Any launch failure here is returned to the caller; a supervisor that
    /// cannot bring the roster up the first time does not keep going.
    pub fn start(&mut self) -> Result<()> {
        let log_dir = self.config.supervisor.log_dir.clone();
        for desc in self.descriptors.iter_mut().filter(|d| d.enabled) {
            if desc.state() == ProcessState::NotStarted {
                launch(desc, &mut self.processes, &log_dir)?;
            }
        }
        Ok(())
    }

    /// Check every enabled process once, relaunching the ones that died
    ///
    /// A failing process does not stop the others from being checked; the
    /// first error is returned after the whole roster was visited. Exited
    /// children are reaped first, including those no longer supervised.
    pub fn tick(&mut self) -> Result<()> {
        let reaped = self.processes.reap();
        if reaped > 0 {
            debug!("Reaped {} exited process(es)", reaped);
        }

        let log_dir = self.config.supervisor.log_dir.clone();
        let mut first_error = None;

        for desc in self.descriptors.iter_mut().filter(|d| d.enabled) {
            if let Err(e) = check(desc, &mut self.processes, &log_dir) {
                error!("Check of process '{}' failed: {}", desc.name, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => {
                self.failures = self.failures.saturating_add(1);
                Err(e)
            }
            None => {
                self.failures = 0;
                Ok(())
            }
        }
    }

    /// Pause to take after a failed tick
    pub fn failure_delay(&self) -> Duration {
        let mut rng = rng();
        let ms = self
            .backoff
            .delay(self.failures, &mut rng)
            .unwrap_or(MAX_FAILURE_DELAY_MS);
        Duration::from_millis(ms)
    }

    /// Swap in a new configuration
    ///
    /// Running processes are left alone. A changed command is applied the
    /// next time its process has to be launched.
    pub fn apply_config(&mut self, config: Arc<RigConfig>) -> Result<()> {
        for spec in config.roster()? {
            match self.descriptors.iter_mut().find(|d| d.name == spec.name) {
                Some(desc) => {
                    let name = spec.name.clone();
                    if desc.adopt(spec) {
                        info!("Command of process '{}' changed", name);
                    }
                }
                None => self.descriptors.push(ProcessDescriptor::new(spec)),
            }
        }

        self.backoff = failure_backoff(&config);
        self.config = config;
        Ok(())
    }

    /// Re-read the configuration file and apply it
    ///
    /// On error the previous configuration stays in effect.
    pub fn reload(&mut self, path: &Path) -> Result<()> {
        let config = manifest::load(path)?;
        self.apply_config(Arc::new(config))?;
        info!("Configuration reloaded from {}", path.display());
        Ok(())
    }

    /// Run the supervision loop until SIGINT or SIGTERM
    ///
    /// Children are left running on exit.
    pub async fn run(&mut self) -> Result<()> {
        let mut terminate = signal(SignalKind::terminate())?;
        let shutdown = async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Interrupted, supervisor stopping"),
                _ = terminate.recv() => info!("SIGTERM received, supervisor stopping"),
            }
        };
        self.run_until(shutdown).await
    }

    /// Run the supervision loop until `shutdown` completes, reloading on SIGHUP
    pub async fn run_until<F: Future<Output = ()>>(&mut self, shutdown: F) -> Result<()> {
        let mut hangup = signal(SignalKind::hangup())?;
        tokio::pin!(shutdown);

        let mut period = self.check_period();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Supervising {} process(es)", self.enabled_count());

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.tick().is_err() {
                        let delay = self.failure_delay();
                        warn!("Supervisor tick failed, pausing {:?}", delay);
                        tokio::time::sleep(delay).await;
                    }
                }
                _ = hangup.recv() => {
                    let path = self.config.source.clone();
                    info!("SIGHUP received, reloading {}", path.display());
                    if let Err(e) = self.reload(&path) {
                        error!("Reload failed, keeping previous configuration: {}", e);
                    }
                    if self.check_period() != period {
                        period = self.check_period();
                        interval = tokio::time::interval(period);
                        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }
                _ = &mut shutdown => break,
            }
        }

        Ok(())
    }

    fn check_period(&self) -> Duration {
        Duration::from_secs(self.config.supervisor.checks_delay.max(1))
    }

    fn enabled_count(&self) -> usize {
        self.descriptors.iter().filter(|d| d.enabled).count()
    }
}

/// Start a descriptor's process and mark it running
fn launch<P: ProcessTable>(
    desc: &mut ProcessDescriptor,
    processes: &mut P,
    log_dir: &Path,
) -> Result<()> {
    let command = desc.take_launch_command().to_vec();
    let pid = processes.launch(&desc.name, &command, log_dir)?;
    desc.launched(pid).ok();
    info!("Launched process '{}' (pid {}): {}", desc.name, pid, command.join(" "));
    Ok(())
}

/// Verify one descriptor, relaunching it when it is gone or replaced
fn check<P: ProcessTable>(
    desc: &mut ProcessDescriptor,
    processes: &mut P,
    log_dir: &Path,
) -> Result<()> {
    if desc.state() == ProcessState::Running {
        let Some(pid) = desc.pid else {
            desc.died().ok();
            return launch(desc, processes, log_dir);
        };

        match processes.cmdline(pid) {
            Some(argv) if argv == desc.command => {
                debug!("Process '{}' (pid {}) is alive", desc.name, pid);
                return Ok(());
            }
            Some(argv) => warn!(
                "PID {} of process '{}' now runs '{}', expected '{}'",
                pid,
                desc.name,
                argv.join(" "),
                desc.command.join(" ")
            ),
            None => warn!("Process '{}' (pid {}) is not running", desc.name, pid),
        }
        desc.died().ok();
    }

    launch(desc, processes, log_dir)
}
