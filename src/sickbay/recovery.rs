//! Remediation for unhealthy workers
//!
//! Carries out the policy's actions: a worker restart through the health
//! source's control channel, or a machine reboot, optionally preceded by a
//! kernel log capture for post-mortem analysis.

use crate::error::{Error, Result};
use crate::manifest::WatchdogConfig;
use crate::sickbay::policy::Action;
use crate::sickbay::probe::HealthSource;
use crate::sickbay::watchdog::Clock;
use chrono::{DateTime, Local};
use nom::{
    bytes::complete::{tag, take_until},
    character::complete::{digit1, space0},
    Parser,
};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{error, info, warn};

/// Marker that introduces an NVIDIA hardware fault in the kernel log
const XID_MARKER: &str = "NVRM: Xid (";

/// An external command as an argument vector, never a shell string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Build from a configured argument vector
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::ConfigValidation("Empty command".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Host-level side effects of a remediation
pub trait HostOps {
    /// Current kernel ring buffer contents
    fn kernel_log(&self) -> Result<String>;

    /// Run a privileged command to completion
    fn run(&self, command: &CommandSpec) -> Result<()>;
}

/// The real host
pub struct LocalHost {
    kernel_log_command: CommandSpec,
}

impl LocalHost {
    pub fn new(kernel_log_command: CommandSpec) -> Self {
        Self { kernel_log_command }
    }
}

impl HostOps for LocalHost {
    fn kernel_log(&self) -> Result<String> {
        let output = self
            .kernel_log_command
            .to_command()
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::CommandFailed {
                command: self.kernel_log_command.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: self.kernel_log_command.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run(&self, command: &CommandSpec) -> Result<()> {
        let status = command
            .to_command()
            .stdin(Stdio::null())
            .status()
            .map_err(|e| Error::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        if !status.success() {
            return Err(Error::CommandFailed {
                command: command.to_string(),
                message: format!("exited with {}", status),
            });
        }
        Ok(())
    }
}

/// Remediation timings and targets
#[derive(Debug, Clone)]
pub struct RemediationConfig {
    /// Pause before a restart request
    pub restart_cooldown: Duration,
    /// Pause before the reboot command
    pub reboot_delay: Duration,
    pub diagnostic_log: PathBuf,
    pub reboot_command: CommandSpec,
}

impl RemediationConfig {
    pub fn from_watchdog(config: &WatchdogConfig) -> Result<Self> {
        Ok(Self {
            restart_cooldown: Duration::from_secs(config.restart_cooldown),
            reboot_delay: Duration::from_secs(config.reboot_delay),
            diagnostic_log: config.diagnostic_log.clone(),
            reboot_command: CommandSpec::from_argv(&config.reboot_command)?,
        })
    }
}

/// One kernel log line matching a hardware fault signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultLine {
    /// Bus address, e.g. `PCI:0000:01:00`
    pub bus: String,
    /// Error class (Xid number)
    pub code: u32,
    pub line: String,
}

fn xid_fault(input: &str) -> nom::IResult<&str, (&str, &str)> {
    let (input, _) = take_until(XID_MARKER).parse(input)?;
    let (input, _) = tag(XID_MARKER).parse(input)?;
    let (input, bus) = take_until(")").parse(input)?;
    let (input, _) = tag("):").parse(input)?;
    let (input, _) = space0.parse(input)?;
    let (input, code) = digit1.parse(input)?;
    Ok((input, (bus, code)))
}

/// Parse one kernel log line
pub fn parse_fault_line(line: &str) -> Option<FaultLine> {
    let (_, (bus, code)) = xid_fault(line).ok()?;
    Some(FaultLine {
        bus: bus.trim().to_string(),
        code: code.parse().ok()?,
        line: line.trim_end().to_string(),
    })
}

/// Group fault lines by bus address
pub fn scan_kernel_log(log: &str) -> BTreeMap<String, Vec<FaultLine>> {
    let mut groups: BTreeMap<String, Vec<FaultLine>> = BTreeMap::new();
    for fault in log.lines().filter_map(parse_fault_line) {
        groups.entry(fault.bus.clone()).or_default().push(fault);
    }
    groups
}

/// Append one block per bus address and fsync before returning
pub fn append_diagnostics(
    path: &Path,
    groups: &BTreeMap<String, Vec<FaultLine>>,
    at: DateTime<Local>,
) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut block = String::new();
    let stamp = at.format("%Y-%m-%d %H:%M:%S");
    for (bus, faults) in groups {
        block.push_str(&format!("[{}] {}\n", stamp, bus));
        for fault in faults {
            block.push_str(&fault.line);
            block.push('\n');
        }
        block.push_str(&"=".repeat(64));
        block.push('\n');
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(block.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Carries out remediation actions
pub struct RemediationExecutor<H: HostOps> {
    host: H,
    config: RemediationConfig,
}

impl<H: HostOps> RemediationExecutor<H> {
    pub fn new(host: H, config: RemediationConfig) -> Self {
        Self { host, config }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Execute `action`. Failures are logged; nothing here aborts the watchdog.
    pub fn act(&self, action: Action, source: &mut dyn HealthSource, clock: &dyn Clock) {
        match action {
            Action::None => {}
            Action::Restart => {
                warn!(
                    "Restarting worker via {} in {:?}",
                    source.describe(),
                    self.config.restart_cooldown
                );
                clock.sleep(self.config.restart_cooldown);
                if !source.request_restart() {
                    warn!("Worker has no restart control channel");
                }
            }
            Action::RebootQuiet | Action::RebootWithDiagnostics => {
                if action == Action::RebootWithDiagnostics {
                    match self.capture_diagnostics() {
                        Ok(0) => info!("No hardware faults found in kernel log"),
                        Ok(n) => warn!(
                            "Recorded {} hardware fault line(s) in {}",
                            n,
                            self.config.diagnostic_log.display()
                        ),
                        Err(e) => error!("{}", e),
                    }
                }
                self.reboot(clock);
            }
        }
    }

    fn reboot(&self, clock: &dyn Clock) {
        warn!("System reboot in {:?} ...", self.config.reboot_delay);
        clock.sleep(self.config.reboot_delay);
        warn!("Issuing reboot: {}", self.config.reboot_command);
        if let Err(e) = self.host.run(&self.config.reboot_command) {
            error!("Reboot failed: {}", e);
        }
    }

    /// Scan the kernel log and append matches to the diagnostic log.
    /// Returns the number of matched lines.
    pub fn capture_diagnostics(&self) -> Result<usize> {
        let log = self
            .host
            .kernel_log()
            .map_err(|e| Error::Diagnostics(e.to_string()))?;
        let groups = scan_kernel_log(&log);
        let matched = groups.values().map(Vec::len).sum();
        if matched == 0 {
            return Ok(0);
        }

        append_diagnostics(&self.config.diagnostic_log, &groups, Local::now()).map_err(|e| {
            Error::Diagnostics(format!(
                "Failed to write {}: {}",
                self.config.diagnostic_log.display(),
                e
            ))
        })?;
        Ok(matched)
    }
}
