//! Configuration file parsing for Rigwarden
//!
//! Parses `rigwarden.toml` using serde. The configuration is loaded once,
//! validated, and handed to each component as an immutable value; a reload
//! builds a fresh value instead of mutating the old one.

use crate::error::{Error, Result};
use crate::sickbay::probe::WorkerFamily;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Placeholder written by `rigwarden init` for values the operator must set
pub const UNCONFIGURED: &str = "change_me";

/// Logical processes supervised on a rig, in launch order
pub const ROSTER: [&str; 4] = ["api", "oc", "miner", "watchdog"];

/// Load configuration from a file
pub fn load(path: &Path) -> Result<RigConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut config: RigConfig = toml::from_str(&content)?;
    config.source = path.to_path_buf();
    config.validate()?;

    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct RigConfig {
    /// Supervisor loop settings
    #[serde(default)]
    pub supervisor: SupervisorSection,

    /// Miner launch options
    pub miner: MinerSection,

    /// Auxiliary processes (`api`, `oc`, `watchdog`)
    #[serde(default)]
    pub processes: BTreeMap<String, ProcessSpec>,

    /// Watchdog policy and worker API
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// File this configuration was read from
    #[serde(skip)]
    pub source: PathBuf,
}

impl RigConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (key, value) in self.miner.options() {
            if value == UNCONFIGURED {
                return Err(Error::Unconfigured {
                    section: "miner".to_string(),
                    key: key.to_string(),
                });
            }
        }

        if self.miner.name == MinerKind::Ethminer && self.miner.worker_name.is_none() {
            return Err(Error::ConfigValidation(
                "ethminer requires miner.worker_name".to_string(),
            ));
        }

        for (name, spec) in &self.processes {
            if !ROSTER.contains(&name.as_str()) || name == "miner" {
                return Err(Error::ConfigValidation(format!(
                    "Unknown process '{}' (expected one of: api, oc, watchdog)",
                    name
                )));
            }
            if spec.binary.as_deref().is_some_and(str::is_empty) {
                return Err(Error::ConfigValidation(format!(
                    "Process '{}' has an empty binary",
                    name
                )));
            }
            if name != "watchdog" && spec.enabled && spec.binary.is_none() {
                return Err(Error::ConfigValidation(format!(
                    "Process '{}' is enabled but has no binary",
                    name
                )));
            }
        }

        if self.supervisor.checks_delay == 0 {
            return Err(Error::ConfigValidation(
                "supervisor.checks_delay must be at least 1 second".to_string(),
            ));
        }

        self.watchdog.validate()
    }

    /// Resolve the launch command of every roster entry
    pub fn roster(&self) -> Result<Vec<LaunchSpec>> {
        let mut specs = Vec::with_capacity(ROSTER.len());
        for name in ROSTER {
            let spec = match name {
                "miner" => LaunchSpec {
                    name: name.to_string(),
                    argv: self.miner.command(),
                    enabled: true,
                },
                "watchdog" => self.watchdog_launch()?,
                _ => match self.processes.get(name) {
                    Some(process) => LaunchSpec {
                        name: name.to_string(),
                        argv: process.command(),
                        enabled: process.enabled && process.binary.is_some(),
                    },
                    None => LaunchSpec {
                        name: name.to_string(),
                        argv: Vec::new(),
                        enabled: false,
                    },
                },
            };
            specs.push(spec);
        }
        Ok(specs)
    }

    fn watchdog_launch(&self) -> Result<LaunchSpec> {
        let process = self.processes.get("watchdog");
        let enabled = process.is_none_or(|p| p.enabled);

        let argv = match process.filter(|p| p.binary.is_some()) {
            Some(p) => p.command(),
            None => {
                let exe = std::env::current_exe()?;
                let config = if self.source.as_os_str().is_empty() {
                    PathBuf::from("rigwarden.toml")
                } else {
                    self.source.clone()
                };
                vec![
                    exe.to_string_lossy().into_owned(),
                    "watchdog".to_string(),
                    "--config".to_string(),
                    config.to_string_lossy().into_owned(),
                ]
            }
        };

        Ok(LaunchSpec {
            name: "watchdog".to_string(),
            argv,
            enabled,
        })
    }
}

/// Resolved launch command for one roster entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub name: String,
    /// Program followed by its arguments
    pub argv: Vec<String>,
    pub enabled: bool,
}

/// Supervisor loop settings
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
    /// Seconds between liveness checks
    #[serde(default = "default_checks_delay")]
    pub checks_delay: u64,

    /// Base backoff in seconds after a failed tick
    #[serde(default = "default_restart_delay")]
    pub restart_delay: u64,

    /// Directory for per-process stdout/stderr files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Write the supervisor PID here
    pub pid_file: Option<PathBuf>,
}

fn default_checks_delay() -> u64 {
    1
}

fn default_restart_delay() -> u64 {
    5
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            checks_delay: default_checks_delay(),
            restart_delay: default_restart_delay(),
            log_dir: default_log_dir(),
            pid_file: None,
        }
    }
}

/// Supported miner binaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MinerKind {
    Ccminer,
    Ethminer,
}

impl std::fmt::Display for MinerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MinerKind::Ccminer => write!(f, "ccminer"),
            MinerKind::Ethminer => write!(f, "ethminer"),
        }
    }
}

/// Miner launch options
#[derive(Debug, Clone, Deserialize)]
pub struct MinerSection {
    pub name: MinerKind,

    /// Miner executable (defaults to the miner name on PATH)
    pub binary: Option<String>,

    pub pool: String,
    pub user: String,

    #[serde(default = "default_password")]
    pub password: String,

    /// ethminer only
    pub worker_name: Option<String>,

    /// Whitespace-separated extra arguments
    #[serde(default)]
    pub extra_options: String,
}

fn default_password() -> String {
    "x".to_string()
}

impl MinerSection {
    /// All operator-supplied options as (key, value) pairs
    pub fn options(&self) -> Vec<(&'static str, &str)> {
        let mut options = vec![
            ("pool", self.pool.as_str()),
            ("user", self.user.as_str()),
            ("password", self.password.as_str()),
            ("extra_options", self.extra_options.as_str()),
        ];
        if let Some(binary) = &self.binary {
            options.push(("binary", binary.as_str()));
        }
        if let Some(worker) = &self.worker_name {
            options.push(("worker_name", worker.as_str()));
        }
        options
    }

    /// Launch command as an argument vector
    pub fn command(&self) -> Vec<String> {
        let binary = self
            .binary
            .clone()
            .unwrap_or_else(|| self.name.to_string());
        let mut argv = vec![binary];

        match self.name {
            MinerKind::Ccminer => {
                argv.extend([
                    "-o".to_string(),
                    self.pool.clone(),
                    "-u".to_string(),
                    self.user.clone(),
                    "-p".to_string(),
                    self.password.clone(),
                ]);
            }
            MinerKind::Ethminer => {
                let worker = self.worker_name.as_deref().unwrap_or_default();
                argv.extend([
                    "-S".to_string(),
                    self.pool.clone(),
                    "-O".to_string(),
                    format!("{}.{}:{}", self.user, worker, self.password),
                ]);
            }
        }

        argv.extend(self.extra_options.split_whitespace().map(str::to_string));
        argv
    }
}

/// An auxiliary process
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessSpec {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    pub binary: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl ProcessSpec {
    pub fn command(&self) -> Vec<String> {
        let mut argv: Vec<String> = self.binary.iter().cloned().collect();
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// Where the GPU-load watchdog reads device load from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GpuSource {
    /// HTTP JSON telemetry endpoint
    Telemetry,
    /// Vendor query tool run on this host
    #[default]
    Local,
}

/// Watchdog policy and worker API
#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_family")]
    pub family: WorkerFamily,

    /// Worker API host
    #[serde(default = "default_host")]
    pub host: String,

    /// Worker API port
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub gpu_source: GpuSource,

    #[serde(default = "default_telemetry_url")]
    pub telemetry_url: String,

    #[serde(default = "default_query_tool")]
    pub query_tool: String,

    /// Lowest healthy rolling average (MH/s, Sol/s or load %)
    #[serde(default)]
    pub minimal_performance: f64,

    /// Rolling window size
    #[serde(default = "default_samples")]
    pub samples: usize,

    /// Misses within the window tolerated before rebooting
    #[serde(default = "default_miss_threshold")]
    pub miss_threshold: u32,

    /// Accepted shares that must be exceeded before degradation counts
    #[serde(default = "default_min_valid")]
    pub min_valid: u64,

    /// Seconds after watchdog start during which nothing fires
    #[serde(default = "default_grace_period")]
    pub grace_period: u64,

    /// Tick interval in milliseconds
    #[serde(default = "default_tick")]
    pub tick: u64,

    /// Poll timeout in milliseconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout: u64,

    /// Seconds to wait before a restart request
    #[serde(default = "default_restart_cooldown")]
    pub restart_cooldown: u64,

    /// Seconds to wait before rebooting
    #[serde(default = "default_reboot_delay")]
    pub reboot_delay: u64,

    /// Restarts without recovery before a reboot
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "default_diagnostic_log")]
    pub diagnostic_log: PathBuf,

    #[serde(default = "default_reboot_command")]
    pub reboot_command: Vec<String>,

    #[serde(default = "default_kernel_log_command")]
    pub kernel_log_command: Vec<String>,
}

fn default_family() -> WorkerFamily {
    WorkerFamily::Ethminer
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3333
}

fn default_telemetry_url() -> String {
    "http://localhost:8000/api/v1".to_string()
}

fn default_query_tool() -> String {
    "nvidia-smi".to_string()
}

fn default_samples() -> usize {
    16
}

fn default_miss_threshold() -> u32 {
    10
}

fn default_min_valid() -> u64 {
    10
}

fn default_grace_period() -> u64 {
    60
}

fn default_tick() -> u64 {
    1000
}

fn default_poll_timeout() -> u64 {
    2000
}

fn default_restart_cooldown() -> u64 {
    3
}

fn default_reboot_delay() -> u64 {
    30
}

fn default_max_restarts() -> u32 {
    3
}

fn default_diagnostic_log() -> PathBuf {
    PathBuf::from("/var/log/rigwarden/diagnostics.log")
}

fn default_reboot_command() -> Vec<String> {
    vec!["sudo".into(), "reboot".into(), "-dnf".into()]
}

fn default_kernel_log_command() -> Vec<String> {
    vec!["dmesg".into()]
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            family: default_family(),
            host: default_host(),
            port: default_port(),
            gpu_source: GpuSource::default(),
            telemetry_url: default_telemetry_url(),
            query_tool: default_query_tool(),
            minimal_performance: 0.0,
            samples: default_samples(),
            miss_threshold: default_miss_threshold(),
            min_valid: default_min_valid(),
            grace_period: default_grace_period(),
            tick: default_tick(),
            poll_timeout: default_poll_timeout(),
            restart_cooldown: default_restart_cooldown(),
            reboot_delay: default_reboot_delay(),
            max_restarts: default_max_restarts(),
            diagnostic_log: default_diagnostic_log(),
            reboot_command: default_reboot_command(),
            kernel_log_command: default_kernel_log_command(),
        }
    }
}

impl WatchdogConfig {
    pub fn validate(&self) -> Result<()> {
        if self.samples == 0 {
            return Err(Error::ConfigValidation(
                "watchdog.samples must be positive".to_string(),
            ));
        }
        if self.tick == 0 || self.poll_timeout == 0 {
            return Err(Error::ConfigValidation(
                "watchdog.tick and watchdog.poll_timeout must be positive".to_string(),
            ));
        }
        if !self.minimal_performance.is_finite() || self.minimal_performance < 0.0 {
            return Err(Error::ConfigValidation(
                "watchdog.minimal_performance must be a non-negative number".to_string(),
            ));
        }
        if self.reboot_command.is_empty() || self.kernel_log_command.is_empty() {
            return Err(Error::ConfigValidation(
                "watchdog.reboot_command and watchdog.kernel_log_command must not be empty"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Default configuration document written by `rigwarden init`
pub fn default_document(miner: MinerKind) -> String {
    let worker_line = match miner {
        MinerKind::Ethminer => format!("worker_name = \"{}\"\n", UNCONFIGURED),
        MinerKind::Ccminer => String::new(),
    };
    let family = match miner {
        MinerKind::Ethminer => "ethminer",
        MinerKind::Ccminer => "gpu-load",
    };

    format!(
        r#"# Rigwarden configuration

[supervisor]
checks_delay = 1
restart_delay = 5
log_dir = "/tmp"
# pid_file = "/run/rigwarden.pid"

[miner]
name = "{miner}"
# binary = "/opt/miners/{miner}"
pool = "{placeholder}"
user = "{placeholder}"
password = "{placeholder}"
{worker_line}extra_options = ""

[processes.api]
enabled = true
binary = "python3"
args = ["api/api.py", "--api", "--gpu-type", "nvidia", "--getdata-interval", "10"]

[processes.oc]
enabled = true
binary = "python3"
args = ["nvset.py", "-c", "oc.ini", "-D"]

[processes.watchdog]
enabled = true

[watchdog]
family = "{family}"
minimal_performance = 0
# host = "127.0.0.1"
# port = 3333
# grace_period = 60
# samples = 16
# miss_threshold = 10
# reboot_command = ["sudo", "reboot", "-dnf"]
"#,
        miner = miner,
        placeholder = UNCONFIGURED,
        worker_line = worker_line,
        family = family,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ETHMINER: &str = r#"
[supervisor]
checks_delay = 2
log_dir = "/var/log/rig"

[miner]
name = "ethminer"
binary = "/opt/ethminer/ethminer"
pool = "stratum+tcp://eu1.example.org:4444"
user = "0xabc"
worker_name = "rig01"
extra_options = "--farm-recheck 200  -G"

[processes.api]
binary = "python3"
args = ["api/api.py", "--api"]

[processes.oc]
enabled = false
binary = "python3"
args = ["nvset.py", "-c", "oc.ini", "-D"]

[watchdog]
family = "ethminer"
minimal_performance = 305
port = 3334
"#;

    #[test]
    fn test_parse_full_config() {
        let config: RigConfig = toml::from_str(ETHMINER).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.supervisor.checks_delay, 2);
        assert_eq!(config.supervisor.restart_delay, 5);
        assert_eq!(config.watchdog.family, WorkerFamily::Ethminer);
        assert_eq!(config.watchdog.port, 3334);
        assert_eq!(config.watchdog.samples, 16);
        assert_eq!(config.watchdog.reboot_command, vec!["sudo", "reboot", "-dnf"]);
    }

    #[test]
    fn test_ethminer_command() {
        let config: RigConfig = toml::from_str(ETHMINER).unwrap();
        assert_eq!(
            config.miner.command(),
            vec![
                "/opt/ethminer/ethminer",
                "-S",
                "stratum+tcp://eu1.example.org:4444",
                "-O",
                "0xabc.rig01:x",
                "--farm-recheck",
                "200",
                "-G",
            ]
        );
    }

    #[test]
    fn test_ccminer_command() {
        let toml = r#"
[miner]
name = "ccminer"
pool = "stratum+tcp://pool:3333"
user = "wallet"
password = "c=BTC"
"#;
        let config: RigConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.miner.command(),
            vec!["ccminer", "-o", "stratum+tcp://pool:3333", "-u", "wallet", "-p", "c=BTC"]
        );
    }

    #[test]
    fn test_roster() {
        let config: RigConfig = toml::from_str(ETHMINER).unwrap();
        let roster = config.roster().unwrap();
        let names: Vec<_> = roster.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ROSTER);

        assert!(roster[0].enabled);
        assert_eq!(roster[0].argv, vec!["python3", "api/api.py", "--api"]);
        assert!(!roster[1].enabled);
        assert!(roster[2].enabled);

        let watchdog = &roster[3];
        assert!(watchdog.enabled);
        assert_eq!(watchdog.argv[1..], ["watchdog", "--config", "rigwarden.toml"]);
    }

    #[test]
    fn test_placeholder_aborts() {
        let toml = r#"
[miner]
name = "ccminer"
pool = "change_me"
user = "wallet"
"#;
        let config: RigConfig = toml::from_str(toml).unwrap();
        match config.validate() {
            Err(Error::Unconfigured { section, key }) => {
                assert_eq!(section, "miner");
                assert_eq!(key, "pool");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_default_document_requires_configuration() {
        for miner in [MinerKind::Ccminer, MinerKind::Ethminer] {
            let config: RigConfig = toml::from_str(&default_document(miner)).unwrap();
            assert_eq!(config.miner.name, miner);
            assert!(matches!(config.validate(), Err(Error::Unconfigured { .. })));
        }
    }

    #[test]
    fn test_unknown_process_rejected() {
        let toml = r#"
[miner]
name = "ccminer"
pool = "p"
user = "u"

[processes.miner]
binary = "/bin/true"
"#;
        let config: RigConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ethminer_requires_worker_name() {
        let toml = r#"
[miner]
name = "ethminer"
pool = "p"
user = "u"
"#;
        let config: RigConfig = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(Error::ConfigValidation(_))));
    }

    #[test]
    fn test_watchdog_validation() {
        let toml = r#"
[miner]
name = "ccminer"
pool = "p"
user = "u"

[watchdog]
family = "gpu-load"
gpu_source = "telemetry"
samples = 0
"#;
        let config: RigConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.watchdog.gpu_source, GpuSource::Telemetry);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = load(Path::new("/nonexistent/rigwarden.toml")).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }
}
