//! Worker health monitoring and recovery
//!
//! Provides:
//! - Health sources per worker family (RPC socket, HTTP telemetry, local query)
//! - Rolling sample windows
//! - The escalation policy (restart before reboot)
//! - Remediation with kernel log diagnostics
//! - The per-worker watchdog loop

pub mod policy;
pub mod probe;
pub mod recovery;
pub mod watchdog;
pub mod window;

pub use watchdog::Watchdog;
