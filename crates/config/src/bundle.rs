//! Bundle sink configuration
//!
//! The `[bundle]` section: where records are buffered, when the live file
//! rolls over, and which backend receives the rolled files.
//!
//! # Defaults
//!
//! - `base_name`: event-bundle
//! - `max_file_size`: 10 MiB
//! - `roll_over_interval`: 5m
//! - `tick_interval`: 1s
//! - `max_in_flight`: unbounded
//! - `queue_size`: 10000 records
//! - `backend`: local_mirror
//!
//! Only `connection` has no default.

use serde::Deserialize;
use spool_sinks::bundle::{
    DEFAULT_BASE_NAME, DEFAULT_MAX_FILE_SIZE, DEFAULT_ROLL_OVER_INTERVAL, DEFAULT_TICK_INTERVAL,
};
use spool_sinks::util::DEFAULT_LOG_INTERVAL;
use std::time::Duration;

/// Backend that receives rolled-over files
///
/// # Example
///
/// ```toml
/// [bundle.backend]
/// type = "object_store"
/// url = "s3://logs-bucket/ingest"
/// ```
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Copy files into the directory named by the connection string
    #[default]
    LocalMirror,

    /// Put files into an object store bucket
    ObjectStore {
        /// Store URL, e.g. `s3://bucket/prefix` or `memory:///`
        url: String,
    },
}

impl BackendConfig {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LocalMirror => "local_mirror",
            Self::ObjectStore { .. } => "object_store",
        }
    }
}

/// Bundle sink configuration
///
/// # Example
///
/// ```toml
/// [bundle]
/// connection = "/var/lib/spool/bundles:/mnt/archive"
/// max_file_size = 1048576
/// roll_over_interval = "1m"
/// max_in_flight = 4
///
/// [bundle.backend]
/// type = "local_mirror"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BundleSinkConfig {
    /// `[localDirectory:]backendSpecificSuffix`
    /// Required
    pub connection: String,

    /// Live file name inside the buffer directory
    /// Default: event-bundle
    pub base_name: String,

    /// Rollover before an append that would exceed this many bytes
    /// Default: 10485760
    pub max_file_size: u64,

    /// Rollover once the live file is this old
    /// Default: 5m
    #[serde(with = "humantime_serde")]
    pub roll_over_interval: Duration,

    /// Period of the rollover check and upload dispatch
    /// Default: 1s
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Cap on concurrent uploads
    /// Default: unbounded
    pub max_in_flight: Option<usize>,

    /// Records buffered between the reader and the sink
    /// Default: 10000
    pub queue_size: usize,

    /// Minimum interval between upload failure log lines
    /// Default: 10s
    #[serde(with = "humantime_serde")]
    pub failure_log_interval: Duration,

    /// Log statistics periodically
    /// Default: true
    pub metrics_enabled: bool,

    /// Statistics reporting interval
    /// Default: 60s
    #[serde(with = "humantime_serde")]
    pub metrics_interval: Duration,

    /// Upload backend
    /// Default: local_mirror
    pub backend: BackendConfig,
}

impl Default for BundleSinkConfig {
    fn default() -> Self {
        Self {
            connection: String::new(),
            base_name: DEFAULT_BASE_NAME.into(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            roll_over_interval: DEFAULT_ROLL_OVER_INTERVAL,
            tick_interval: DEFAULT_TICK_INTERVAL,
            max_in_flight: None,
            queue_size: 10_000,
            failure_log_interval: DEFAULT_LOG_INTERVAL,
            metrics_enabled: true,
            metrics_interval: Duration::from_secs(60),
            backend: BackendConfig::LocalMirror,
        }
    }
}
