//! Health sources for supervised workers
//!
//! A health source is polled once per watchdog tick and yields either a
//! [`HealthSnapshot`], a [`Poll::Miss`], or [`Poll::Pending`] while a
//! background query has not finished. Transport failures, timeouts and
//! malformed responses never escape as errors; they are misses.

use crate::error::{Error, Result};
use crate::manifest::{GpuSource, WatchdogConfig};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Supported worker families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerFamily {
    /// ethminer JSON-RPC (`miner_getstat1`)
    Ethminer,
    /// EWBF JSON API (`getstat`), per-device results
    Ewbf,
    /// Per-GPU load, no worker API
    GpuLoad,
}

impl std::fmt::Display for WorkerFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerFamily::Ethminer => write!(f, "ethminer"),
            WorkerFamily::Ewbf => write!(f, "ewbf"),
            WorkerFamily::GpuLoad => write!(f, "gpu-load"),
        }
    }
}

impl WorkerFamily {
    /// Whether the worker accepts a restart control message
    pub fn can_restart(&self) -> bool {
        matches!(self, WorkerFamily::Ethminer)
    }

    /// Whether the worker reports accepted share counters
    pub fn reports_shares(&self) -> bool {
        !matches!(self, WorkerFamily::GpuLoad)
    }
}

/// One device's contribution to a snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSample {
    /// Index, bus id or name, whatever the source reports
    pub id: String,
    /// Hashrate or load percentage
    pub performance: f64,
    pub power_watts: Option<f64>,
}

/// Immutable record produced by one successful poll
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HealthSnapshot {
    /// Worker-reported uptime in seconds
    pub uptime_secs: Option<u64>,
    /// Primary performance metric (MH/s, Sol/s or load %)
    pub performance: f64,
    /// Accepted units (shares) since worker start
    pub accepted: Option<u64>,
    pub rejected: Option<u64>,
    pub power_watts: Option<f64>,
    pub devices: Vec<DeviceSample>,
}

impl HealthSnapshot {
    /// Accepted shares per minute of worker uptime
    pub fn share_rate(&self) -> Option<f64> {
        let accepted = self.accepted? as f64;
        let minutes = self.uptime_secs? as f64 / 60.0;
        if minutes <= 0.0 {
            return None;
        }
        Some((accepted / minutes * 100.0).round() / 100.0)
    }

    /// Devices whose performance is strictly below `threshold`
    pub fn devices_below(&self, threshold: f64) -> usize {
        self.devices
            .iter()
            .filter(|d| d.performance < threshold)
            .count()
    }
}

/// Outcome of a poll
#[derive(Debug, Clone, PartialEq)]
pub enum Poll {
    Snapshot(HealthSnapshot),
    /// No usable snapshot; the reason is only logged
    Miss(String),
    /// Nothing new yet; neither a success nor a miss
    Pending,
}

impl From<Result<HealthSnapshot>> for Poll {
    fn from(result: Result<HealthSnapshot>) -> Self {
        match result {
            Ok(snapshot) => Poll::Snapshot(snapshot),
            Err(e) => Poll::Miss(e.to_string()),
        }
    }
}

/// A worker's reporting channel
pub trait HealthSource {
    /// Poll once, never blocking longer than the configured timeout
    fn poll(&mut self) -> Poll;

    /// Ask the worker to restart itself. Returns false when the source has
    /// no control channel. A missing acknowledgement is not an error.
    fn request_restart(&mut self) -> bool {
        false
    }

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// Build the health source for the configured worker family
pub fn source_for(config: &WatchdogConfig) -> Box<dyn HealthSource> {
    let timeout = Duration::from_millis(config.poll_timeout);
    match config.family {
        WorkerFamily::Ethminer => Box::new(RpcSource::new(
            RpcDialect::Ethminer,
            &config.host,
            config.port,
            timeout,
        )),
        WorkerFamily::Ewbf => Box::new(RpcSource::new(
            RpcDialect::Ewbf,
            &config.host,
            config.port,
            timeout,
        )),
        WorkerFamily::GpuLoad => match config.gpu_source {
            GpuSource::Telemetry => Box::new(TelemetrySource::new(&config.telemetry_url, timeout)),
            GpuSource::Local => Box::new(LocalQuerySource::nvidia(&config.query_tool, timeout)),
        },
    }
}

// ---------------------------------------------------------------------------
// RPC socket strategy
// ---------------------------------------------------------------------------

/// Line protocol spoken by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcDialect {
    Ethminer,
    Ewbf,
}

impl RpcDialect {
    fn stat_request(&self) -> Value {
        match self {
            RpcDialect::Ethminer => json!({"method": "miner_getstat1", "jsonrpc": "2.0", "id": 0}),
            RpcDialect::Ewbf => json!({"id": 1, "method": "getstat"}),
        }
    }

    fn restart_request(&self) -> Option<Value> {
        match self {
            RpcDialect::Ethminer => {
                Some(json!({"method": "miner_restart", "jsonrpc": "2.0", "id": 0}))
            }
            RpcDialect::Ewbf => None,
        }
    }
}

/// Largest response line accepted from a worker
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

/// Short-lived TCP connection per request, JSON line in, JSON line out
pub struct RpcSource {
    dialect: RpcDialect,
    host: String,
    port: u16,
    timeout: Duration,
}

impl RpcSource {
    pub fn new(dialect: RpcDialect, host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            dialect,
            host: host.to_string(),
            port,
            timeout,
        }
    }

    /// Send one request and return the `result` field of the response.
    ///
    /// The whole exchange shares one deadline of `timeout`.
    fn call(&self, request: &Value) -> Result<Value> {
        let deadline = Instant::now() + self.timeout;
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Telemetry(format!("Cannot resolve {}", self.host)))?;

        let mut stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_write_timeout(Some(remaining(deadline)?))?;

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        stream.write_all(line.as_bytes())?;

        let response = read_line_until(&mut stream, deadline)?;
        let response = String::from_utf8_lossy(&response);
        if response.trim().is_empty() {
            return Err(Error::Telemetry("Empty response".to_string()));
        }

        let value: Value = serde_json::from_str(response.trim())?;
        value
            .get("result")
            .cloned()
            .filter(|r| !r.is_null())
            .ok_or_else(|| Error::Telemetry("Response has no result".to_string()))
    }

    fn snapshot(&self) -> Result<HealthSnapshot> {
        let result = self.call(&self.dialect.stat_request())?;
        debug!("Worker API result: {}", result);
        match self.dialect {
            RpcDialect::Ethminer => parse_ethminer(&result),
            RpcDialect::Ewbf => parse_ewbf(&result, unix_now()),
        }
    }
}

impl HealthSource for RpcSource {
    fn poll(&mut self) -> Poll {
        self.snapshot().into()
    }

    fn request_restart(&mut self) -> bool {
        let Some(request) = self.dialect.restart_request() else {
            return false;
        };
        // Workers frequently drop the connection while restarting
        if let Err(e) = self.call(&request) {
            debug!("No acknowledgement for restart request: {}", e);
        }
        true
    }

    fn describe(&self) -> String {
        format!("{:?} API at {}:{}", self.dialect, self.host, self.port)
    }
}

fn remaining(deadline: Instant) -> Result<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(Error::Telemetry("Worker API timed out".to_string()));
    }
    Ok(left)
}

/// Read up to the first newline, giving up at `deadline` or after
/// `MAX_RESPONSE_BYTES`
fn read_line_until(stream: &mut TcpStream, deadline: Instant) -> Result<Vec<u8>> {
    let mut response = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        stream.set_read_timeout(Some(remaining(deadline)?))?;
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(response);
        }
        if let Some(end) = chunk[..n].iter().position(|b| *b == b'\n') {
            response.extend_from_slice(&chunk[..end]);
            return Ok(response);
        }
        response.extend_from_slice(&chunk[..n]);
        if response.len() > MAX_RESPONSE_BYTES {
            return Err(Error::Telemetry(format!(
                "Response exceeds {} bytes",
                MAX_RESPONSE_BYTES
            )));
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Numbers arrive as JSON numbers or as numeric strings
fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    as_f64(value).filter(|v| *v >= 0.0).map(|v| v as u64)
}

/// Parse an ethminer `miner_getstat1` result
///
/// Layout: `[version, uptime_minutes, "khs;accepted;rejected", "gpu0_khs;gpu1_khs", ...]`
pub fn parse_ethminer(result: &Value) -> Result<HealthSnapshot> {
    let fields = result
        .as_array()
        .ok_or_else(|| Error::Telemetry("Expected a result list".to_string()))?;

    let uptime_minutes = fields
        .get(1)
        .and_then(as_u64)
        .ok_or_else(|| Error::Telemetry("Missing uptime".to_string()))?;

    let totals = fields
        .get(2)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Telemetry("Missing hashrate totals".to_string()))?;
    let mut parts = totals.split(';').map(str::trim);
    let khs: f64 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Telemetry(format!("Bad hashrate field '{}'", totals)))?;
    let accepted = parts.next().and_then(|s| s.parse().ok());
    let rejected = parts.next().and_then(|s| s.parse().ok());

    // Per-GPU rates are optional and may be partially garbled
    let devices = fields
        .get(3)
        .and_then(Value::as_str)
        .map(|per_gpu| {
            per_gpu
                .split(';')
                .enumerate()
                .filter_map(|(idx, rate)| {
                    rate.trim().parse::<f64>().ok().map(|khs| DeviceSample {
                        id: idx.to_string(),
                        performance: khs_to_mhs(khs),
                        power_watts: None,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(HealthSnapshot {
        uptime_secs: Some(uptime_minutes * 60),
        performance: khs_to_mhs(khs),
        accepted,
        rejected,
        power_watts: None,
        devices,
    })
}

fn khs_to_mhs(khs: f64) -> f64 {
    (khs / 1000.0 * 100.0).round() / 100.0
}

/// Parse an EWBF `getstat` result (a list of per-device records)
pub fn parse_ewbf(result: &Value, now: u64) -> Result<HealthSnapshot> {
    let records = result
        .as_array()
        .ok_or_else(|| Error::Telemetry("Expected a device list".to_string()))?;

    let mut snapshot = HealthSnapshot::default();
    let mut accepted = 0;
    let mut rejected = 0;
    let mut power = 0.0;
    let mut earliest_start: Option<u64> = None;

    for (idx, record) in records.iter().enumerate() {
        let Some(speed) = record.get("speed_sps").and_then(as_f64) else {
            continue;
        };
        let device_power = record.get("gpu_power_usage").and_then(as_f64);
        let id = record
            .get("busid")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| idx.to_string());

        accepted += record.get("accepted_shares").and_then(as_u64).unwrap_or(0);
        rejected += record.get("rejected_shares").and_then(as_u64).unwrap_or(0);
        power += device_power.unwrap_or(0.0);
        if let Some(start) = record.get("start_time").and_then(as_u64) {
            earliest_start = Some(earliest_start.map_or(start, |s| s.min(start)));
        }

        snapshot.performance += speed;
        snapshot.devices.push(DeviceSample {
            id,
            performance: speed,
            power_watts: device_power,
        });
    }

    if snapshot.devices.is_empty() {
        return Err(Error::Telemetry("No device reported a speed".to_string()));
    }

    snapshot.accepted = Some(accepted);
    snapshot.rejected = Some(rejected);
    snapshot.power_watts = Some(power);
    snapshot.uptime_secs = earliest_start.map(|start| now.saturating_sub(start));
    Ok(snapshot)
}

/// Fold per-device loads into a snapshot; the weakest device decides
fn load_snapshot(devices: Vec<DeviceSample>) -> Result<HealthSnapshot> {
    if devices.is_empty() {
        return Err(Error::Telemetry("No device reported a load".to_string()));
    }
    let performance = devices
        .iter()
        .map(|d| d.performance)
        .fold(f64::INFINITY, f64::min);
    let power: Vec<f64> = devices.iter().filter_map(|d| d.power_watts).collect();

    Ok(HealthSnapshot {
        uptime_secs: None,
        performance,
        accepted: None,
        rejected: None,
        power_watts: (!power.is_empty()).then(|| power.iter().sum()),
        devices,
    })
}

// ---------------------------------------------------------------------------
// HTTP JSON strategy
// ---------------------------------------------------------------------------

/// Polls the rig telemetry endpoint (`[{"cards": [...]}, ...]`)
pub struct TelemetrySource {
    url: String,
    agent: ureq::Agent,
}

impl TelemetrySource {
    pub fn new(url: &str, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            url: url.to_string(),
            agent: ureq::Agent::new_with_config(config),
        }
    }

    fn snapshot(&self) -> Result<HealthSnapshot> {
        let mut response = self
            .agent
            .get(&self.url)
            .call()
            .map_err(|e| Error::Telemetry(format!("GET {} failed: {}", self.url, e)))?;
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| Error::Telemetry(format!("Failed to read body: {}", e)))?;
        parse_telemetry(&body)
    }
}

impl HealthSource for TelemetrySource {
    fn poll(&mut self) -> Poll {
        self.snapshot().into()
    }

    fn describe(&self) -> String {
        format!("telemetry endpoint {}", self.url)
    }
}

/// Extract per-card load from a telemetry document. Missing keys are absent,
/// not fatal; cards without a usable `core_load` are skipped.
pub fn parse_telemetry(body: &str) -> Result<HealthSnapshot> {
    let document: Value = serde_json::from_str(body)?;
    let cards = document
        .get(0)
        .and_then(|first| first.get("cards"))
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Telemetry("Document has no cards list".to_string()))?;

    let devices = cards
        .iter()
        .enumerate()
        .filter_map(|(idx, card)| {
            let load = card.get("core_load").and_then(as_f64)?;
            let id = ["bus_id", "index", "name"]
                .iter()
                .find_map(|key| card.get(*key).filter(|v| !v.is_null()))
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .unwrap_or_else(|| idx.to_string());
            Some(DeviceSample {
                id,
                performance: load,
                power_watts: card.get("power_current").and_then(as_f64),
            })
        })
        .collect();

    load_snapshot(devices)
}

// ---------------------------------------------------------------------------
// Local query-tool strategy
// ---------------------------------------------------------------------------

struct PendingQuery {
    child: Child,
    started: Instant,
}

/// Runs a vendor query tool in the background and reads its result on the
/// following poll, so a slow tool never stalls the tick.
pub struct LocalQuerySource {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    pending: Option<PendingQuery>,
}

impl LocalQuerySource {
    pub fn new(program: &str, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            args,
            timeout,
            pending: None,
        }
    }

    /// `nvidia-smi` per-GPU index, utilization and power draw
    pub fn nvidia(program: &str, timeout: Duration) -> Self {
        let args = [
            "--query-gpu=index,utilization.gpu,power.draw",
            "--format=csv,noheader,nounits",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        Self::new(program, args, timeout)
    }

    fn spawn_query(&mut self) -> Result<()> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::CommandFailed {
                command: self.program.clone(),
                message: e.to_string(),
            })?;
        self.pending = Some(PendingQuery {
            child,
            started: Instant::now(),
        });
        Ok(())
    }

    /// Check on a running query. `None` while it is still within its timeout.
    fn collect(&mut self, mut query: PendingQuery) -> Option<Result<HealthSnapshot>> {
        match query.child.try_wait() {
            Err(e) => Some(Err(e.into())),
            Ok(Some(status)) => Some(self.finish(&mut query.child, status)),
            Ok(None) if query.started.elapsed() > self.timeout => {
                let _ = query.child.kill();
                let _ = query.child.wait();
                Some(Err(Error::Telemetry(format!(
                    "{} timed out after {:?}",
                    self.program, self.timeout
                ))))
            }
            Ok(None) => {
                self.pending = Some(query);
                None
            }
        }
    }

    fn finish(&self, child: &mut Child, status: ExitStatus) -> Result<HealthSnapshot> {
        let mut output = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            stdout.read_to_string(&mut output)?;
        }
        if !status.success() {
            return Err(Error::CommandFailed {
                command: self.program.clone(),
                message: format!("exited with {}", status),
            });
        }
        parse_query_output(&output)
    }
}

impl HealthSource for LocalQuerySource {
    fn poll(&mut self) -> Poll {
        let outcome = match self.pending.take() {
            Some(query) => match self.collect(query) {
                Some(result) => Poll::from(result),
                None => return Poll::Pending,
            },
            None => Poll::Pending,
        };

        match self.spawn_query() {
            Ok(()) => outcome,
            // With no result to report, a tool that cannot start is a miss
            Err(e) if outcome == Poll::Pending => Poll::Miss(e.to_string()),
            Err(e) => {
                debug!("{}", e);
                outcome
            }
        }
    }

    fn describe(&self) -> String {
        format!("local query via {}", self.program)
    }
}

impl Drop for LocalQuerySource {
    fn drop(&mut self) {
        if let Some(mut query) = self.pending.take() {
            let _ = query.child.kill();
            let _ = query.child.wait();
        }
    }
}

/// Parse `index, load, power` CSV rows; rows that do not parse are skipped
pub fn parse_query_output(output: &str) -> Result<HealthSnapshot> {
    let devices = output
        .lines()
        .filter_map(|line| {
            let mut cols = line.split(',').map(str::trim);
            let id = cols.next().filter(|s| !s.is_empty())?.to_string();
            let load = cols.next()?.parse::<f64>().ok()?;
            let power_watts = cols.next().and_then(|p| p.parse::<f64>().ok());
            Some(DeviceSample {
                id,
                performance: load,
                power_watts,
            })
        })
        .collect();

    load_snapshot(devices)
}
