//! Sink utilities for local buffering
//!
//! - **rolling_file**: append-only live file with rename-based rollover
//! - **rate_limited_logger**: failure logging that stays quiet during outages

pub mod rate_limited_logger;
pub mod rolling_file;

pub use rate_limited_logger::{DEFAULT_LOG_INTERVAL, RateLimitedLogger};
pub use rolling_file::{
    ROLLOVER_TIMESTAMP_FORMAT, RollingFileMetrics, RollingFileSnapshot, RollingFileWriter,
    SinkWriter,
};
