//! Common types shared by the bundle sink and its collaborators
//!
//! Errors and the statistics-provider seam used by writers and backends.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::backend::UploadError;

/// Source of an opaque statistics document
///
/// Writers and backends expose their own statistics through this trait so
/// the bundle sink can nest them without knowing the concrete types.
pub trait StatisticsSource: Send + Sync {
    /// Point-in-time statistics, ready for a JSON status page
    fn statistics(&self) -> serde_json::Value;
}

/// Bundle sink errors
///
/// `Write` and `RollOver` are fatal to the event loop. Upload failures never
/// surface here; they are counted and retried.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Sink initialization failed
    #[error("failed to initialize sink: {0}")]
    Init(String),

    /// Buffer directory could not be created or is not writable
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Appending to the live file failed
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),

    /// Rolling the live file over failed
    #[error("rollover failed: {0}")]
    RollOver(#[source] std::io::Error),

    /// The upload backend rejected its configuration
    #[error("backend error: {0}")]
    Backend(#[from] UploadError),
}

impl SinkError {
    /// Create an initialization error
    pub fn init(msg: impl Into<String>) -> Self {
        Self::Init(msg.into())
    }

    /// Create a directory creation error
    pub fn create_dir(path: &Path, source: std::io::Error) -> Self {
        Self::CreateDir {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Parsed `[localDirectory:]backendSpecificSuffix` connection string
///
/// Everything before the first `:` is the local buffer directory; the rest
/// (or the whole string when there is no `:`) belongs to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    raw: String,
    local_dir: Option<PathBuf>,
    remainder: String,
}

impl ConnectionString {
    /// Split a connection string into buffer directory and backend remainder
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let (local_dir, remainder) = match raw.split_once(':') {
            Some((dir, rest)) => (Some(PathBuf::from(dir)), rest.to_string()),
            None => (None, raw.clone()),
        };

        Self {
            raw,
            local_dir,
            remainder,
        }
    }

    /// The full, unmodified descriptor
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Buffer directory prefix, if one was given
    pub fn local_dir(&self) -> Option<&Path> {
        self.local_dir.as_deref()
    }

    /// Backend-specific part of the descriptor
    pub fn remainder(&self) -> &str {
        &self.remainder
    }
}

impl std::fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
#[path = "common_test.rs"]
mod common_test;
