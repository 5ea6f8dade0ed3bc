//! Bundle sink - disk-buffered uploads with indefinite retry
//!
//! Records are appended to a local live file. When the file would grow past
//! `max_file_size`, when it has been open longer than `roll_over_interval`,
//! or when a flush is requested, it is rolled over and the closed file is
//! handed to an upload task. Failed uploads go to the back of a FIFO queue
//! and are retried, one dispatch per tick, until they succeed.
//!
//! ```text
//! [records] --> output() --> [live file]
//!                                | size / time / flush
//!                                v
//!                          [rolled file] --> upload task --> [backend]
//!                                ^                |
//!                                |   failure      v
//!                          [pending queue] <-- outcome --> success: file deleted
//! ```
//!
//! # Durability
//!
//! Every record is on disk before `output()` returns and a rolled file is
//! only deleted after its upload succeeds. Files left behind by a crash are
//! found again at startup. Delivery is at-least-once: an upload that
//! succeeds remotely but whose acknowledgment is lost is uploaded again.
//!
//! # Shutdown
//!
//! Cancellation closes the record channel and persists every record already
//! queued in it before the loop stops. In-flight uploads are not awaited;
//! their files stay on disk and are found again at the next start.
//!
//! # Disk usage
//!
//! Buffered bytes are the live file plus every pending or in-flight file.
//! In steady state that is bounded by roughly `max_file_size` times one
//! plus the retry backlog. While the backend keeps failing the backlog, and
//! with it the buffer directory, grows without limit: records are kept
//! rather than dropped.

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::backend::UploadBackend;
use crate::common::{ConnectionString, SinkError};
use crate::util::{
    DEFAULT_LOG_INTERVAL, ROLLOVER_TIMESTAMP_FORMAT, RateLimitedLogger, RollingFileWriter,
    SinkWriter,
};

mod dispatch;
mod statistics;
pub mod stragglers;

pub use dispatch::{UploadOutcome, upload_one};
pub use statistics::{BundleStatistics, BundleStatisticsHandle};

use statistics::UploadCounters;

/// Buffer directory used when the connection string has no local prefix
pub const DEFAULT_BUFFER_DIR: &str = "/var/lib/spool/bundles";

/// Name of the live file inside the buffer directory
pub const DEFAULT_BASE_NAME: &str = "event-bundle";

/// Default size that triggers a rollover (10 MiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Default maximum age of the live file
pub const DEFAULT_ROLL_OVER_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default period of the rollover check and upload dispatch
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

const WRITE_CHECK_FILE_NAME: &str = ".spool-write-check";

/// Configuration for a bundle sink
#[derive(Debug, Clone)]
pub struct BundleConfig {
    /// `[localDirectory:]backendSpecificSuffix`
    pub connection: String,

    /// Live file name; rolled files are `<base_name>.<timestamp>`
    pub base_name: String,

    /// Rollover before an append that would exceed this many bytes
    pub max_file_size: u64,

    /// Rollover when the live file is older than this
    pub roll_over_interval: Duration,

    /// Period of the rollover check and upload dispatch
    pub tick_interval: Duration,

    /// Cap on concurrent uploads (None = unbounded)
    pub max_in_flight: Option<usize>,

    /// Minimum interval between upload failure log lines
    pub failure_log_interval: Duration,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            connection: String::new(),
            base_name: DEFAULT_BASE_NAME.into(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            roll_over_interval: DEFAULT_ROLL_OVER_INTERVAL,
            tick_interval: DEFAULT_TICK_INTERVAL,
            max_in_flight: None,
            failure_log_interval: DEFAULT_LOG_INTERVAL,
        }
    }
}

impl BundleConfig {
    /// Create config with the given connection string
    #[must_use]
    pub fn with_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = connection.into();
        self
    }

    /// Create config with a custom rollover size
    #[must_use]
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Create config with a custom rollover age
    #[must_use]
    pub fn with_roll_over_interval(mut self, interval: Duration) -> Self {
        self.roll_over_interval = interval;
        self
    }

    /// Create config with a custom tick period
    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Create config with a cap on concurrent uploads
    #[must_use]
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = Some(max);
        self
    }

    /// Create config with a custom live file name
    #[must_use]
    pub fn with_base_name(mut self, base_name: impl Into<String>) -> Self {
        self.base_name = base_name.into();
        self
    }

    /// Create config with a custom failure log interval
    #[must_use]
    pub fn with_failure_log_interval(mut self, interval: Duration) -> Self {
        self.failure_log_interval = interval;
        self
    }
}

/// Requests an immediate rollover of a running bundle sink
///
/// Requests coalesce: while one is waiting to be handled, further requests
/// are dropped, so a burst of signals causes a single rollover.
#[derive(Debug, Clone)]
pub struct FlushTrigger {
    sender: mpsc::Sender<()>,
}

impl FlushTrigger {
    /// Ask for a rollover; false if one is already pending or the sink stopped
    pub fn request(&self) -> bool {
        self.sender.try_send(()).is_ok()
    }
}

/// Disk-buffered sink that uploads rolled-over files through a backend
///
/// All state is owned by the event loop started with [`BundleSink::run`].
/// Upload tasks share nothing with it except the backend and the outcome
/// channel.
pub struct BundleSink {
    config: BundleConfig,
    buffer_dir: PathBuf,
    backend: Arc<dyn UploadBackend>,
    writer: Box<dyn SinkWriter>,

    /// Mirror of the live file size used for the rollover decision
    current_file_size: u64,

    /// Rolled-over files waiting for an upload attempt
    pending: VecDeque<PathBuf>,
    in_flight: usize,

    counters: Arc<RwLock<UploadCounters>>,
    results_tx: mpsc::UnboundedSender<UploadOutcome>,
    results_rx: mpsc::UnboundedReceiver<UploadOutcome>,
    flush_tx: mpsc::Sender<()>,
    flush_rx: mpsc::Receiver<()>,

    failure_logger: RateLimitedLogger,
}

impl BundleSink {
    /// Set up the buffer directory, live file and backend
    ///
    /// Rolled-over files left by a previous run are queued for upload.
    /// Problems finding them are logged and otherwise ignored.
    pub fn initialize(
        config: BundleConfig,
        backend: Option<Box<dyn UploadBackend>>,
    ) -> Result<Self, SinkError> {
        let connection = ConnectionString::parse(config.connection.clone());
        let buffer_dir = connection
            .local_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BUFFER_DIR));

        let mut backend =
            backend.ok_or_else(|| SinkError::init("bundle sink initialized without a backend"))?;
        backend.initialize(&connection)?;
        let backend: Arc<dyn UploadBackend> = Arc::from(backend);

        prepare_buffer_dir(&buffer_dir)?;

        if let Some(destination) = backend.local_destination()
            && same_dir(destination, &buffer_dir)
        {
            return Err(SinkError::init(format!(
                "upload destination {} is the buffer directory",
                destination.display()
            )));
        }

        let live_path = buffer_dir.join(&config.base_name);
        let writer = RollingFileWriter::open(&live_path).map_err(|e| {
            SinkError::init(format!("failed to open {}: {e}", live_path.display()))
        })?;

        let mut sink = Self::assemble(config, buffer_dir, backend, Box::new(writer));
        sink.queue_stragglers();

        tracing::info!(
            sink = %sink,
            max_file_size = sink.config.max_file_size,
            roll_over_interval = ?sink.config.roll_over_interval,
            pending = sink.pending.len(),
            "bundle sink initialized"
        );

        Ok(sink)
    }

    /// Put a sink together from already-initialized parts
    pub(crate) fn assemble(
        config: BundleConfig,
        buffer_dir: PathBuf,
        backend: Arc<dyn UploadBackend>,
        writer: Box<dyn SinkWriter>,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (flush_tx, flush_rx) = mpsc::channel(1);
        let failure_logger = RateLimitedLogger::new(config.failure_log_interval);

        Self {
            current_file_size: writer.current_size(),
            config,
            buffer_dir,
            backend,
            writer,
            pending: VecDeque::new(),
            in_flight: 0,
            counters: Arc::new(RwLock::new(UploadCounters::default())),
            results_tx,
            results_rx,
            flush_tx,
            flush_rx,
            failure_logger,
        }
    }

    /// Directory holding the live and rolled-over files
    pub fn buffer_dir(&self) -> &Path {
        &self.buffer_dir
    }

    /// Bytes in the live file, as tracked for the rollover decision
    pub fn current_file_size(&self) -> u64 {
        self.current_file_size
    }

    /// Files waiting for an upload attempt, in dispatch order
    pub fn pending_uploads(&self) -> impl Iterator<Item = &Path> {
        self.pending.iter().map(PathBuf::as_path)
    }

    /// Upload tasks currently running
    pub fn uploads_in_flight(&self) -> usize {
        self.in_flight
    }

    /// Stable identity: backend key plus buffer directory
    pub fn key(&self) -> String {
        format!("{}:{}", self.backend.key(), self.buffer_dir.display())
    }

    /// Handle used by the host to force a rollover
    pub fn flush_trigger(&self) -> FlushTrigger {
        FlushTrigger {
            sender: self.flush_tx.clone(),
        }
    }

    /// Statistics handle that outlives `run()`
    pub fn statistics_handle(&self) -> BundleStatisticsHandle {
        BundleStatisticsHandle {
            counters: Arc::clone(&self.counters),
            holding_area: self.writer.statistics_source(),
            backend: Arc::clone(&self.backend),
        }
    }

    /// Current statistics
    pub fn statistics(&self) -> BundleStatistics {
        self.statistics_handle().snapshot()
    }

    /// Append one record, rolling over first if it would overflow the file
    ///
    /// The record lands verbatim; callers supply their own separators. A
    /// record larger than `max_file_size` still rolls the live file over,
    /// even an empty one, and then gets a file to itself. An error here
    /// means the local disk is unusable. Must be called from within a tokio
    /// runtime, since a rollover spawns an upload.
    pub fn output(&mut self, message: &str) -> Result<(), SinkError> {
        let len = message.len() as u64;
        if self.current_file_size + len > self.config.max_file_size {
            self.roll_over()?;
        }

        self.current_file_size += len;
        self.writer.append(message).map_err(SinkError::Write)
    }

    /// Close the live file under a timestamped name and start uploading it
    pub fn roll_over(&mut self) -> Result<PathBuf, SinkError> {
        let rolled = self
            .writer
            .roll_over(ROLLOVER_TIMESTAMP_FORMAT)
            .map_err(SinkError::RollOver)?;
        self.current_file_size = 0;

        if self.at_upload_capacity() {
            self.pending.push_back(rolled.clone());
            self.publish_queue_state();
        } else {
            self.dispatch(rolled.clone());
        }

        Ok(rolled)
    }

    /// Start the event loop in the background and return immediately
    ///
    /// The loop ends when `shutdown` is cancelled, when `messages` closes,
    /// or on a fatal write/rollover error, which is sent to `errors` first.
    /// On cancellation the records still queued in `messages` are written
    /// out before the loop ends.
    /// The handle resolves to the final statistics.
    pub fn run(
        self,
        messages: mpsc::Receiver<String>,
        errors: mpsc::Sender<SinkError>,
        shutdown: CancellationToken,
    ) -> JoinHandle<BundleStatistics> {
        tokio::spawn(self.event_loop(messages, errors, shutdown))
    }

    async fn event_loop(
        mut self,
        mut messages: mpsc::Receiver<String>,
        errors: mpsc::Sender<SinkError>,
        shutdown: CancellationToken,
    ) -> BundleStatistics {
        let period = self.config.tick_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(sink = %self, "bundle sink starting");

        loop {
            let mut stopping = false;
            let result = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(sink = %self, "bundle sink cancelled");
                    stopping = true;
                    self.drain(&mut messages).await
                }

                message = messages.recv() => match message {
                    Some(message) => self.output(&message),
                    None => {
                        tracing::info!(sink = %self, "record channel closed");
                        break;
                    }
                },

                _ = ticker.tick() => self.on_tick(),

                Some(outcome) = self.results_rx.recv() => {
                    self.on_outcome(outcome);
                    Ok(())
                }

                Some(()) = self.flush_rx.recv() => {
                    tracing::info!(
                        backend = %self.backend.describe(),
                        "flush requested, rolling over now"
                    );
                    self.roll_over().map(|_| ())
                }
            };

            if let Err(e) = result {
                tracing::error!(sink = %self, error = %e, "bundle sink stopping on fatal error");
                if errors.send(e).await.is_err() {
                    tracing::warn!("error channel closed, fatal error not delivered");
                }
                break;
            }
            if stopping {
                break;
            }
        }

        self.writer.close();

        let statistics = self.statistics();
        tracing::info!(
            sink = %self,
            files_uploaded = statistics.files_uploaded,
            upload_errors = statistics.upload_errors,
            pending = statistics.pending_uploads,
            in_flight = statistics.uploads_in_flight,
            "bundle sink stopped"
        );
        statistics
    }

    /// Refuse new records and persist the ones already queued
    async fn drain(&mut self, messages: &mut mpsc::Receiver<String>) -> Result<(), SinkError> {
        messages.close();

        let mut drained = 0u64;
        while let Some(message) = messages.recv().await {
            self.output(&message)?;
            drained += 1;
        }

        if drained > 0 {
            tracing::info!(sink = %self, drained, "persisted queued records before stopping");
        }
        Ok(())
    }

    /// Time-based rollover, then at most one dispatch from the queue
    fn on_tick(&mut self) -> Result<(), SinkError> {
        if self.writer.last_rolled_over().elapsed() > self.config.roll_over_interval {
            self.roll_over()?;
        }

        if !self.at_upload_capacity()
            && let Some(path) = self.pending.pop_front()
        {
            self.dispatch(path);
        }
        Ok(())
    }

    fn on_outcome(&mut self, outcome: UploadOutcome) {
        self.in_flight = self.in_flight.saturating_sub(1);

        match outcome.result {
            Ok(()) => {
                self.counters.write().record_success();
                tracing::info!(path = %outcome.path.display(), "uploaded file");
            }
            Err(e) => {
                self.counters.write().record_failure(e.to_string());
                self.failure_logger
                    .failure("upload failed, will retry", &outcome.path, &e);
                self.pending.push_back(outcome.path);
            }
        }

        self.publish_queue_state();
    }

    fn dispatch(&mut self, path: PathBuf) {
        tracing::debug!(path = %path.display(), "dispatching upload");

        self.in_flight += 1;
        tokio::spawn(upload_one(
            Arc::clone(&self.backend),
            path,
            self.results_tx.clone(),
        ));
        self.publish_queue_state();
    }

    fn at_upload_capacity(&self) -> bool {
        self.config
            .max_in_flight
            .is_some_and(|max| self.in_flight >= max)
    }

    fn publish_queue_state(&self) {
        let mut counters = self.counters.write();
        counters.pending_uploads = self.pending.len();
        counters.uploads_in_flight = self.in_flight;
    }

    fn queue_stragglers(&mut self) {
        match stragglers::scan(&self.buffer_dir, &self.config.base_name) {
            Ok(found) => {
                if !found.is_empty() {
                    tracing::info!(
                        dir = %self.buffer_dir.display(),
                        count = found.len(),
                        "queued files left by a previous run"
                    );
                }
                self.pending.extend(found);
                self.publish_queue_state();
            }
            Err(e) => {
                tracing::warn!(
                    dir = %self.buffer_dir.display(),
                    error = %e,
                    "could not scan buffer directory for leftover files"
                );
            }
        }
    }
}

impl fmt::Display for BundleSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.backend.describe(), self.key())
    }
}

/// Whether two existing directories are the same, following symlinks
fn same_dir(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Create the buffer directory and make sure files can be written in it
fn prepare_buffer_dir(dir: &Path) -> Result<(), SinkError> {
    fs::create_dir_all(dir).map_err(|e| SinkError::create_dir(dir, e))?;

    let check = dir.join(WRITE_CHECK_FILE_NAME);
    fs::write(&check, b"").map_err(|e| SinkError::create_dir(dir, e))?;
    if let Err(e) = fs::remove_file(&check) {
        tracing::warn!(path = %check.display(), error = %e, "failed to remove write check file");
    }
    Ok(())
}

#[cfg(test)]
#[path = "bundle_test.rs"]
mod bundle_test;
