//! Unified error types for Rigwarden

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Rigwarden operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    #[error("Please configure option: \"{key}\" in section: \"{section}\"")]
    Unconfigured { section: String, key: String },

    // Process errors
    #[error("Failed to launch process '{name}': {source}")]
    LaunchFailed { name: String, source: io::Error },

    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    // Telemetry errors (converted to misses at the probe boundary)
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("Failed to decode worker response: {0}")]
    Decode(#[from] serde_json::Error),

    // Diagnostics
    #[error("Diagnostic capture failed: {0}")]
    Diagnostics(String),
}

/// Result type alias for Rigwarden operations
pub type Result<T> = std::result::Result<T, Error>;
