//! Configuration validation
//!
//! Checks values serde cannot reject on its own:
//! - `connection` is present
//! - Size, interval and queue thresholds are non-zero
//! - `base_name` is a plain file name
//! - Object store backends name a URL

use crate::Config;
use crate::bundle::BackendConfig;
use crate::error::{ConfigError, Result};

const SECTION: &str = "bundle";

/// Validate the entire configuration
pub fn validate_config(config: &Config) -> Result<()> {
    let bundle = &config.bundle;

    if bundle.connection.trim().is_empty() {
        return Err(ConfigError::missing_field(SECTION, "connection"));
    }

    if bundle.base_name.is_empty()
        || bundle.base_name.contains('/')
        || bundle.base_name.starts_with('.')
    {
        return Err(ConfigError::invalid_value(
            SECTION,
            "base_name",
            format!("'{}' is not a plain file name", bundle.base_name),
        ));
    }

    if bundle.max_file_size == 0 {
        return Err(ConfigError::invalid_value(
            SECTION,
            "max_file_size",
            "must be greater than 0",
        ));
    }

    if bundle.tick_interval.is_zero() {
        return Err(ConfigError::invalid_value(
            SECTION,
            "tick_interval",
            "must be greater than 0",
        ));
    }

    if bundle.roll_over_interval.is_zero() {
        return Err(ConfigError::invalid_value(
            SECTION,
            "roll_over_interval",
            "must be greater than 0",
        ));
    }

    if bundle.max_in_flight == Some(0) {
        return Err(ConfigError::invalid_value(
            SECTION,
            "max_in_flight",
            "must be at least 1 when set",
        ));
    }

    if bundle.queue_size == 0 {
        return Err(ConfigError::invalid_value(
            SECTION,
            "queue_size",
            "must be greater than 0",
        ));
    }

    if bundle.metrics_enabled && bundle.metrics_interval.is_zero() {
        return Err(ConfigError::invalid_value(
            SECTION,
            "metrics_interval",
            "must be greater than 0 when metrics are enabled",
        ));
    }

    if let BackendConfig::ObjectStore { url } = &bundle.backend
        && url.trim().is_empty()
    {
        return Err(ConfigError::missing_field("bundle.backend", "url"));
    }

    Ok(())
}
