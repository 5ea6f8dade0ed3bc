//! Append-only live file with rename-based rollover
//!
//! The live file always has the same name. Rolling over closes it, renames
//! it to `<name>.<timestamp>` and opens a fresh, empty live file in its
//! place, so appends never observe a missing file.
//!
//! ```text
//! event-bundle                        <- live, accepting appends
//! event-bundle.2026-10-17T09:15:02    <- rolled, awaiting upload
//! event-bundle.2026-10-17T09:15:02.1  <- rolled twice in the same second
//! ```

use std::fmt::Write as FmtWrite;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::common::StatisticsSource;

/// Sortable suffix appended to rolled-over files
pub const ROLLOVER_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Writer that owns the live file of a bundle sink
pub trait SinkWriter: Send {
    /// Append a message to the live file
    fn append(&mut self, message: &str) -> io::Result<()>;

    /// Close and rename the live file, start a new one, return the rolled path
    fn roll_over(&mut self, timestamp_format: &str) -> io::Result<PathBuf>;

    /// When the live file was created or last rolled over
    fn last_rolled_over(&self) -> Instant;

    /// Bytes currently in the live file
    fn current_size(&self) -> u64;

    /// Path of the live file
    fn path(&self) -> &Path;

    /// Close the live file; further appends fail
    fn close(&mut self);

    /// Shareable statistics handle, valid after the writer is dropped
    fn statistics_source(&self) -> Arc<dyn StatisticsSource>;
}

/// Counters for a rolling file writer
#[derive(Debug)]
pub struct RollingFileMetrics {
    file_name: String,
    bytes_written: AtomicU64,
    messages_written: AtomicU64,
    rollovers: AtomicU64,
    live_file_size: AtomicU64,
    last_rolled_over: Mutex<DateTime<Utc>>,
}

impl RollingFileMetrics {
    fn new(file_name: String, live_file_size: u64) -> Self {
        Self {
            file_name,
            bytes_written: AtomicU64::new(0),
            messages_written: AtomicU64::new(0),
            rollovers: AtomicU64::new(0),
            live_file_size: AtomicU64::new(live_file_size),
            last_rolled_over: Mutex::new(Utc::now()),
        }
    }

    #[inline]
    fn record_append(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.messages_written.fetch_add(1, Ordering::Relaxed);
        self.live_file_size.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_rollover(&self) {
        self.rollovers.fetch_add(1, Ordering::Relaxed);
        self.live_file_size.store(0, Ordering::Relaxed);
        *self.last_rolled_over.lock() = Utc::now();
    }

    /// Get snapshot of metrics
    pub fn snapshot(&self) -> RollingFileSnapshot {
        RollingFileSnapshot {
            file_name: self.file_name.clone(),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            messages_written: self.messages_written.load(Ordering::Relaxed),
            rollovers: self.rollovers.load(Ordering::Relaxed),
            live_file_size: self.live_file_size.load(Ordering::Relaxed),
            last_rolled_over: *self.last_rolled_over.lock(),
        }
    }
}

impl StatisticsSource for RollingFileMetrics {
    fn statistics(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_default()
    }
}

/// Point-in-time snapshot of writer metrics
#[derive(Debug, Clone, Serialize)]
pub struct RollingFileSnapshot {
    pub file_name: String,
    pub bytes_written: u64,
    pub messages_written: u64,
    pub rollovers: u64,
    pub live_file_size: u64,
    pub last_rolled_over: DateTime<Utc>,
}

/// Unbuffered append-only writer for the live file
///
/// Every append is a single `write_all` on the file, so a rolled-over file
/// holds exactly the bytes appended before the rollover.
pub struct RollingFileWriter {
    path: PathBuf,
    file: Option<File>,
    size: u64,
    last_rolled_over: Instant,
    metrics: Arc<RollingFileMetrics>,
}

impl RollingFileWriter {
    /// Open (or create) the live file in append mode
    ///
    /// An existing live file left by a previous run is kept and appended to.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_owned)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("live file path has no file name: {}", path.display()),
                )
            })?;

        let file = open_append(&path)?;
        let size = file.metadata()?.len();

        if size > 0 {
            tracing::info!(path = %path.display(), bytes = size, "reopened existing live file");
        }

        Ok(Self {
            path,
            file: Some(file),
            size,
            last_rolled_over: Instant::now(),
            metrics: Arc::new(RollingFileMetrics::new(file_name, size)),
        })
    }

    /// Get reference to metrics
    pub fn metrics(&self) -> &RollingFileMetrics {
        &self.metrics
    }

    /// Pick a rolled-over name that does not exist yet
    fn rollover_target(&self, timestamp_format: &str) -> io::Result<PathBuf> {
        let mut stamp = String::new();
        write!(stamp, "{}", Utc::now().format(timestamp_format)).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid rollover timestamp format: {timestamp_format}"),
            )
        })?;

        let base = format!("{}.{}", self.metrics.file_name, stamp);
        let mut target = self.path.with_file_name(&base);
        let mut counter = 1u32;
        while target.exists() {
            target = self.path.with_file_name(format!("{base}.{counter}"));
            counter += 1;
        }

        Ok(target)
    }
}

impl SinkWriter for RollingFileWriter {
    fn append(&mut self, message: &str) -> io::Result<()> {
        let file = self.file.as_mut().ok_or_else(closed_error)?;
        file.write_all(message.as_bytes())?;

        let bytes = message.len() as u64;
        self.size += bytes;
        self.metrics.record_append(bytes);
        Ok(())
    }

    fn roll_over(&mut self, timestamp_format: &str) -> io::Result<PathBuf> {
        let file = self.file.take().ok_or_else(closed_error)?;
        let target = match self.rollover_target(timestamp_format) {
            Ok(target) => target,
            Err(e) => {
                self.file = Some(file);
                return Err(e);
            }
        };

        if let Err(e) = file.sync_all() {
            tracing::warn!(path = %self.path.display(), error = %e, "sync before rollover failed");
        }
        drop(file);

        if let Err(e) = fs::rename(&self.path, &target) {
            // Keep appending to the same live file
            self.file = Some(open_append(&self.path)?);
            return Err(e);
        }

        self.file = Some(open_append(&self.path)?);
        self.size = 0;
        self.last_rolled_over = Instant::now();
        self.metrics.record_rollover();

        tracing::debug!(
            live = %self.path.display(),
            rolled = %target.display(),
            "live file rolled over"
        );

        Ok(target)
    }

    fn last_rolled_over(&self) -> Instant {
        self.last_rolled_over
    }

    fn current_size(&self) -> u64 {
        self.size
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn close(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_all() {
                tracing::warn!(path = %self.path.display(), error = %e, "sync on close failed");
            }
        }
    }

    fn statistics_source(&self) -> Arc<dyn StatisticsSource> {
        Arc::clone(&self.metrics) as Arc<dyn StatisticsSource>
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    File::options().create(true).append(true).open(path)
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "live file is closed")
}

#[cfg(test)]
#[path = "rolling_file_test.rs"]
mod rolling_file_test;
