//! Logging configuration
//!
//! Controls how the uploader reports what it is doing. The binary turns this
//! into a `tracing_subscriber` filter and formatter.

use serde::Deserialize;

/// Log level
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level - every record and tick
    Trace,
    /// Debug level - rollovers and upload attempts
    Debug,
    /// Info level - startup, shutdown, statistics (default)
    #[default]
    Info,
    /// Warn level - upload failures and cleanup problems
    Warn,
    /// Error level - fatal write errors only
    Error,
}

impl LogLevel {
    /// Convert to tracing level filter string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable console output (default)
    #[default]
    Console,
    /// JSON structured logging
    Json,
}

/// Log output destination
///
/// Stdout is not offered: the uploader reads records from stdin and is
/// usually the tail of a pipe, so logs go to stderr unless a file is named.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    /// Write to stderr (default)
    #[default]
    Stderr,
    /// Append to a file
    #[serde(untagged)]
    File(String),
}

/// Logging configuration
///
/// # Example
///
/// ```toml
/// [log]
/// level = "info"
/// format = "json"
/// output = "/var/log/spool.log"
/// directives = "spool_sinks=debug,object_store=warn"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    /// Default: info
    pub level: LogLevel,

    /// Output format (console, json)
    /// Default: console
    pub format: LogFormat,

    /// Output destination (stderr or file path)
    /// Default: stderr
    pub output: LogOutput,

    /// Extra per-target filter directives appended after `level`
    /// Default: none
    pub directives: Option<String>,
}

impl LogConfig {
    /// Filter string in `EnvFilter` syntax
    pub fn filter(&self) -> String {
        match self.directives.as_deref().map(str::trim) {
            Some(extra) if !extra.is_empty() => format!("{},{}", self.level.as_str(), extra),
            _ => self.level.as_str().to_string(),
        }
    }
}
