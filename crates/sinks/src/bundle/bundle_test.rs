use super::*;

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;

use crate::backend::{LocalMirrorBackend, UploadError};
use crate::common::StatisticsSource;

// =============================================================================
// Test doubles
// =============================================================================

/// Shared, inspectable state of the fake backend
#[derive(Default)]
struct FakeState {
    /// Remaining attempts that should fail
    failures_left: AtomicU64,
    attempts: AtomicU64,
    uploaded: Mutex<Vec<(String, String)>>,
    gate: Option<Semaphore>,
}

impl FakeState {
    fn failing(times: u64) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicU64::new(times),
            ..Default::default()
        })
    }

    fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Semaphore::new(0)),
            ..Default::default()
        })
    }

    fn uploaded_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.uploaded.lock().iter().map(|(n, _)| n.clone()).collect();
        names.sort();
        names
    }
}

struct FakeBackend {
    state: Arc<FakeState>,
}

impl FakeBackend {
    fn boxed(state: &Arc<FakeState>) -> Option<Box<dyn UploadBackend>> {
        Some(Box::new(Self {
            state: Arc::clone(state),
        }))
    }
}

#[async_trait]
impl UploadBackend for FakeBackend {
    fn initialize(&mut self, connection: &ConnectionString) -> Result<(), UploadError> {
        if connection.remainder() == "reject" {
            return Err(UploadError::descriptor("rejected by fake backend"));
        }
        Ok(())
    }

    async fn upload(&self, path: &Path, mut file: tokio::fs::File) -> Result<(), UploadError> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.state.gate {
            gate.acquire()
                .await
                .map_err(|e| UploadError::backend(e.to_string()))?
                .forget();
        }

        let should_fail = self
            .state
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(UploadError::backend("simulated outage"));
        }

        let mut body = String::new();
        file.read_to_string(&mut body).await?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        self.state.uploaded.lock().push((name, body));
        Ok(())
    }

    fn statistics(&self) -> serde_json::Value {
        serde_json::json!({ "attempts": self.state.attempts.load(Ordering::SeqCst) })
    }

    fn key(&self) -> String {
        "fake".into()
    }

    fn describe(&self) -> String {
        "fake backend".into()
    }
}

/// Writer whose appends and rollovers always fail
struct BrokenWriter {
    path: PathBuf,
    opened: tokio::time::Instant,
}

impl BrokenWriter {
    fn boxed(dir: &Path) -> Box<dyn SinkWriter> {
        Box::new(Self {
            path: dir.join(DEFAULT_BASE_NAME),
            opened: tokio::time::Instant::now(),
        })
    }
}

struct NoStatistics;

impl StatisticsSource for NoStatistics {
    fn statistics(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

impl SinkWriter for BrokenWriter {
    fn append(&mut self, _message: &str) -> io::Result<()> {
        Err(io::Error::other("disk on fire"))
    }

    fn roll_over(&mut self, _timestamp_format: &str) -> io::Result<PathBuf> {
        Err(io::Error::other("disk on fire"))
    }

    fn last_rolled_over(&self) -> tokio::time::Instant {
        self.opened
    }

    fn current_size(&self) -> u64 {
        0
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn close(&mut self) {}

    fn statistics_source(&self) -> Arc<dyn StatisticsSource> {
        Arc::new(NoStatistics)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn config_in(dir: &Path) -> BundleConfig {
    BundleConfig::default().with_connection(format!("{}:remote", dir.display()))
}

fn fake_sink(config: BundleConfig, state: &Arc<FakeState>) -> BundleSink {
    BundleSink::initialize(config, FakeBackend::boxed(state)).expect("initialize failed")
}

fn broken_sink(config: BundleConfig, dir: &Path) -> BundleSink {
    let backend: Arc<dyn UploadBackend> = Arc::new(FakeBackend {
        state: FakeState::failing(0),
    });
    BundleSink::assemble(config, dir.to_path_buf(), backend, BrokenWriter::boxed(dir))
}

fn rolled_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = stragglers::scan(dir, DEFAULT_BASE_NAME).expect("scan failed");
    files.sort();
    files
}

fn live_content(dir: &Path) -> String {
    fs::read_to_string(dir.join(DEFAULT_BASE_NAME)).expect("read live file")
}

async fn wait_for(
    handle: &BundleStatisticsHandle,
    mut done: impl FnMut(&BundleStatistics) -> bool,
) -> BundleStatistics {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = handle.snapshot();
        if done(&snapshot) {
            return snapshot;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting, last statistics: {snapshot:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct Running {
    records: mpsc::Sender<String>,
    errors: mpsc::Receiver<SinkError>,
    shutdown: CancellationToken,
    stats: BundleStatisticsHandle,
    flush: FlushTrigger,
    handle: JoinHandle<BundleStatistics>,
}

fn start(sink: BundleSink) -> Running {
    let (records, rx) = mpsc::channel(100);
    let (err_tx, errors) = mpsc::channel(1);
    let shutdown = CancellationToken::new();
    let stats = sink.statistics_handle();
    let flush = sink.flush_trigger();
    let handle = sink.run(rx, err_tx, shutdown.clone());

    Running {
        records,
        errors,
        shutdown,
        stats,
        flush,
        handle,
    }
}

// =============================================================================
// Config tests
// =============================================================================

#[test]
fn test_config_defaults() {
    let config = BundleConfig::default();

    assert!(config.connection.is_empty());
    assert_eq!(config.base_name, "event-bundle");
    assert_eq!(config.max_file_size, 10 * 1024 * 1024);
    assert_eq!(config.roll_over_interval, Duration::from_secs(300));
    assert_eq!(config.tick_interval, Duration::from_secs(1));
    assert!(config.max_in_flight.is_none());
}

#[test]
fn test_config_chained_builders() {
    let config = BundleConfig::default()
        .with_connection("/tmp/spool:dest")
        .with_max_file_size(100)
        .with_roll_over_interval(Duration::from_secs(30))
        .with_tick_interval(Duration::from_millis(50))
        .with_max_in_flight(4);

    assert_eq!(config.connection, "/tmp/spool:dest");
    assert_eq!(config.max_file_size, 100);
    assert_eq!(config.roll_over_interval, Duration::from_secs(30));
    assert_eq!(config.tick_interval, Duration::from_millis(50));
    assert_eq!(config.max_in_flight, Some(4));
}

// =============================================================================
// Initialize tests
// =============================================================================

#[test]
fn test_initialize_without_backend_fails() {
    let dir = TempDir::new().expect("failed to create temp dir");

    let err = BundleSink::initialize(config_in(dir.path()), None)
        .err()
        .expect("initialized without backend");
    assert!(matches!(err, SinkError::Init(_)));
}

#[test]
fn test_initialize_propagates_backend_error() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let config =
        BundleConfig::default().with_connection(format!("{}:reject", dir.path().display()));

    let err = BundleSink::initialize(config, FakeBackend::boxed(&FakeState::failing(0)))
        .err()
        .expect("backend error swallowed");
    assert!(matches!(err, SinkError::Backend(UploadError::Descriptor(_))));
}

#[test]
fn test_initialize_creates_buffer_dir_and_live_file() {
    let root = TempDir::new().expect("failed to create temp dir");
    let dir = root.path().join("nested").join("buffer");

    let sink = fake_sink(config_in(&dir), &FakeState::failing(0));

    assert_eq!(sink.buffer_dir(), dir);
    assert!(dir.join(DEFAULT_BASE_NAME).is_file());
    assert!(!dir.join(WRITE_CHECK_FILE_NAME).exists());
    assert_eq!(sink.current_file_size(), 0);
    assert_eq!(sink.key(), format!("fake:{}", dir.display()));
    assert_eq!(sink.to_string(), format!("fake backend fake:{}", dir.display()));
}

#[test]
fn test_initialize_fails_when_buffer_dir_is_a_file() {
    let root = TempDir::new().expect("failed to create temp dir");
    let not_a_dir = root.path().join("occupied");
    fs::write(&not_a_dir, "x").expect("write failed");

    let state = FakeState::failing(0);
    let err = BundleSink::initialize(config_in(&not_a_dir), FakeBackend::boxed(&state))
        .err()
        .expect("initialized inside a file");
    assert!(matches!(err, SinkError::CreateDir { .. }));
}

#[test]
fn test_initialize_rejects_mirror_into_buffer_dir() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let d = dir.path().display();

    for connection in [format!("{d}:{d}"), format!("{d}:{d}/.")] {
        let config = BundleConfig::default().with_connection(connection.clone());
        let err = BundleSink::initialize(config, Some(Box::new(LocalMirrorBackend::new())))
            .err()
            .unwrap_or_else(|| panic!("accepted {connection}"));
        assert!(matches!(err, SinkError::Init(_)));
        assert!(err.to_string().contains("buffer directory"));
    }
}

#[test]
fn test_initialize_accepts_mirror_beside_buffer_dir() {
    let root = TempDir::new().expect("failed to create temp dir");
    let buffer = root.path().join("buffer");
    let archive = root.path().join("archive");
    let config = BundleConfig::default()
        .with_connection(format!("{}:{}", buffer.display(), archive.display()));

    let sink = BundleSink::initialize(config, Some(Box::new(LocalMirrorBackend::new())))
        .expect("initialize failed");
    assert_eq!(sink.buffer_dir(), buffer);
    assert!(archive.is_dir());
}

#[test]
fn test_initialize_queues_stragglers() {
    let dir = TempDir::new().expect("failed to create temp dir");
    fs::write(dir.path().join(DEFAULT_BASE_NAME), "live\n").expect("write failed");
    for stamp in ["2026-10-17T09:00:00", "2026-10-17T09:05:00", "2026-10-17T09:10:00"] {
        let name = format!("{DEFAULT_BASE_NAME}.{stamp}");
        fs::write(dir.path().join(name), stamp).expect("write failed");
    }
    fs::write(dir.path().join("other.txt"), "ignored").expect("write failed");

    let sink = fake_sink(config_in(dir.path()), &FakeState::failing(0));

    let listed = stragglers::scan(dir.path(), DEFAULT_BASE_NAME).expect("scan failed");
    let pending: Vec<PathBuf> = sink.pending_uploads().map(Path::to_path_buf).collect();
    assert_eq!(pending, listed);
    assert_eq!(pending.len(), 3);
    assert_eq!(sink.statistics().pending_uploads, 3);

    // Live file content from the previous run is kept and counted
    assert_eq!(sink.current_file_size(), 5);
}

// =============================================================================
// Output / rollover tests
// =============================================================================

#[tokio::test]
async fn test_output_under_threshold_does_not_roll() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let config = config_in(dir.path()).with_max_file_size(100);
    let mut sink = fake_sink(config, &FakeState::failing(0));

    for message in ["alpha\n", "beta\n", "gamma\n"] {
        sink.output(message).expect("output failed");
    }

    assert!(rolled_files(dir.path()).is_empty());
    assert_eq!(live_content(dir.path()), "alpha\nbeta\ngamma\n");
    assert_eq!(sink.current_file_size(), 17);
    assert_eq!(sink.uploads_in_flight(), 0);
}

#[tokio::test]
async fn test_output_exactly_at_threshold_does_not_roll() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let config = config_in(dir.path()).with_max_file_size(100);
    let mut sink = fake_sink(config, &FakeState::failing(0));

    sink.output(&"a".repeat(40)).expect("output failed");
    sink.output(&"b".repeat(60)).expect("output failed");

    assert!(rolled_files(dir.path()).is_empty());
    assert_eq!(sink.current_file_size(), 100);
}

#[tokio::test]
async fn test_output_overflow_rolls_before_append() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let config = config_in(dir.path()).with_max_file_size(100);
    let mut sink = fake_sink(config, &FakeState::gated());

    let first = "a".repeat(60);
    let second = "b".repeat(60);
    sink.output(&first).expect("output failed");
    sink.output(&second).expect("output failed");

    let rolled = rolled_files(dir.path());
    assert_eq!(rolled.len(), 1);
    assert_eq!(fs::read_to_string(&rolled[0]).expect("read failed"), first);
    assert_eq!(live_content(dir.path()), second);
    assert_eq!(sink.current_file_size(), 60);

    // The rolled file went straight to an upload task
    assert_eq!(sink.uploads_in_flight(), 1);
    assert_eq!(sink.pending_uploads().count(), 0);
}

#[tokio::test]
async fn test_oversized_record_rolls_even_an_empty_file() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let config = config_in(dir.path()).with_max_file_size(10);
    let mut sink = fake_sink(config, &FakeState::gated());

    let oversized = "this record is longer than ten bytes";
    sink.output(oversized).expect("output failed");

    let rolled = rolled_files(dir.path());
    assert_eq!(rolled.len(), 1);
    assert_eq!(fs::read_to_string(&rolled[0]).expect("read failed"), "");
    assert_eq!(live_content(dir.path()), oversized);
    assert_eq!(sink.current_file_size(), 36);

    // The oversized record gets a file to itself
    sink.output("next\n").expect("output failed");
    let rolled = rolled_files(dir.path());
    assert_eq!(rolled.len(), 2);
    let contents: Vec<String> = rolled
        .iter()
        .map(|path| fs::read_to_string(path).expect("read failed"))
        .collect();
    assert!(contents.contains(&oversized.to_string()));
    assert_eq!(live_content(dir.path()), "next\n");
}

#[tokio::test]
async fn test_roll_over_with_capacity_reached_queues_file() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let config = config_in(dir.path()).with_max_in_flight(1);
    let mut sink = fake_sink(config, &FakeState::gated());

    sink.output("one\n").expect("output failed");
    let first = sink.roll_over().expect("rollover failed");
    sink.output("two\n").expect("output failed");
    let second = sink.roll_over().expect("rollover failed");

    assert_ne!(first, second);
    assert_eq!(sink.uploads_in_flight(), 1);
    let pending: Vec<&Path> = sink.pending_uploads().collect();
    assert_eq!(pending, vec![second.as_path()]);
}

// =============================================================================
// Outcome accounting tests
// =============================================================================

#[tokio::test]
async fn test_failed_outcome_requeues_once() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let mut sink = fake_sink(config_in(dir.path()), &FakeState::failing(0));
    let path = dir.path().join("event-bundle.2026-10-17T11:00:00");

    sink.on_outcome(UploadOutcome {
        path: path.clone(),
        result: Err(UploadError::backend("503 slow down")),
    });

    let pending: Vec<&Path> = sink.pending_uploads().collect();
    assert_eq!(pending, vec![path.as_path()]);

    let stats = sink.statistics();
    assert_eq!(stats.upload_errors, 1);
    assert_eq!(stats.files_uploaded, 0);
    assert_eq!(stats.last_error_text, "503 slow down");
    assert!(stats.last_error_time.is_some());
    assert_eq!(stats.pending_uploads, 1);
}

#[tokio::test]
async fn test_successful_outcome_counts_once() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let mut sink = fake_sink(config_in(dir.path()), &FakeState::failing(0));

    sink.on_outcome(UploadOutcome {
        path: dir.path().join("event-bundle.2026-10-17T11:00:00"),
        result: Ok(()),
    });

    let stats = sink.statistics();
    assert_eq!(stats.files_uploaded, 1);
    assert_eq!(stats.upload_errors, 0);
    assert!(stats.last_error_time.is_none());
    assert_eq!(sink.pending_uploads().count(), 0);
}

#[test]
fn test_statistics_serialize_with_stable_field_names() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let sink = fake_sink(config_in(dir.path()), &FakeState::failing(0));

    let json = serde_json::to_value(sink.statistics()).expect("serialize failed");

    for field in [
        "files_uploaded",
        "upload_errors",
        "last_error_time",
        "last_error_text",
        "pending_uploads",
        "uploads_in_flight",
        "file_holding_area",
        "storage_statistics",
    ] {
        assert!(json.get(field).is_some(), "missing field {field}");
    }
    assert!(json["last_error_time"].is_null());
    assert_eq!(json["storage_statistics"]["attempts"], 0);
    assert_eq!(json["file_holding_area"]["file_name"], DEFAULT_BASE_NAME);
}

// =============================================================================
// Event loop tests
// =============================================================================

#[tokio::test]
async fn test_flush_uploads_and_deletes_file() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let state = FakeState::failing(0);
    let sink = fake_sink(config_in(dir.path()), &state);
    let running = start(sink);

    running.records.send("hello\n".into()).await.expect("send failed");
    // Let the record land before the flush is handled
    wait_for(&running.stats, |s| s.file_holding_area["messages_written"] == 1).await;
    assert!(running.flush.request());

    let stats = wait_for(&running.stats, |s| s.files_uploaded == 1).await;
    assert_eq!(stats.upload_errors, 0);

    let uploaded = state.uploaded.lock().clone();
    assert_eq!(uploaded.len(), 1);
    assert_eq!(uploaded[0].1, "hello\n");
    assert!(rolled_files(dir.path()).is_empty());

    running.shutdown.cancel();
    let final_stats = running.handle.await.expect("loop panicked");
    assert_eq!(final_stats.files_uploaded, 1);
}

#[tokio::test]
async fn test_flush_requests_coalesce() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let sink = fake_sink(config_in(dir.path()), &FakeState::gated());
    let flush = sink.flush_trigger();

    assert!(flush.request());
    assert!(!flush.request());
    assert!(!flush.clone().request());

    let running = start(sink);
    wait_for(&running.stats, |s| s.file_holding_area["rollovers"] == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(running.stats.snapshot().file_holding_area["rollovers"], 1);

    running.shutdown.cancel();
    running.handle.await.expect("loop panicked");
}

#[tokio::test]
async fn test_flush_trigger_reports_stopped_sink() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let sink = fake_sink(config_in(dir.path()), &FakeState::failing(0));
    let flush = sink.flush_trigger();
    drop(sink);

    assert!(!flush.request());
}

#[tokio::test]
async fn test_failed_upload_keeps_file_and_requeues() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let state = FakeState::failing(u64::MAX);
    // No retry dispatch during the test
    let config = config_in(dir.path()).with_tick_interval(Duration::from_secs(3600));
    let sink = fake_sink(config, &state);
    let running = start(sink);

    running.records.send("keep me\n".into()).await.expect("send failed");
    wait_for(&running.stats, |s| s.file_holding_area["messages_written"] == 1).await;
    assert!(running.flush.request());

    let stats = wait_for(&running.stats, |s| {
        s.upload_errors == 1 && s.uploads_in_flight == 0
    })
    .await;
    assert_eq!(stats.files_uploaded, 0);
    assert_eq!(stats.pending_uploads, 1);
    assert_eq!(stats.last_error_text, "simulated outage");
    assert!(stats.last_error_time.is_some());

    let rolled = rolled_files(dir.path());
    assert_eq!(rolled.len(), 1);
    assert_eq!(fs::read_to_string(&rolled[0]).expect("read failed"), "keep me\n");

    running.shutdown.cancel();
    running.handle.await.expect("loop panicked");
}

#[tokio::test]
async fn test_failed_upload_is_retried_until_success() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let state = FakeState::failing(2);
    let config = config_in(dir.path()).with_tick_interval(Duration::from_millis(10));
    let sink = fake_sink(config, &state);
    let running = start(sink);

    running.records.send("eventually\n".into()).await.expect("send failed");
    wait_for(&running.stats, |s| s.file_holding_area["messages_written"] == 1).await;
    assert!(running.flush.request());

    let stats = wait_for(&running.stats, |s| s.files_uploaded == 1).await;
    assert_eq!(stats.upload_errors, 2);
    assert_eq!(stats.pending_uploads, 0);
    assert_eq!(state.attempts.load(Ordering::SeqCst), 3);
    assert!(rolled_files(dir.path()).is_empty());

    running.shutdown.cancel();
    running.handle.await.expect("loop panicked");
}

#[tokio::test]
async fn test_stragglers_are_uploaded_after_restart() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let names = [
        "event-bundle.2026-10-16T23:55:00",
        "event-bundle.2026-10-16T23:59:59",
        "event-bundle.2026-10-17T00:00:00.1",
    ];
    for name in names {
        fs::write(dir.path().join(name), name).expect("write failed");
    }

    let state = FakeState::failing(0);
    let config = config_in(dir.path()).with_tick_interval(Duration::from_millis(10));
    let sink = fake_sink(config, &state);
    let running = start(sink);

    let stats = wait_for(&running.stats, |s| s.files_uploaded == 3).await;
    assert_eq!(stats.pending_uploads, 0);
    assert_eq!(state.uploaded_names(), names.to_vec());
    assert!(rolled_files(dir.path()).is_empty());
    assert!(dir.path().join(DEFAULT_BASE_NAME).exists());

    running.shutdown.cancel();
    running.handle.await.expect("loop panicked");
}

#[tokio::test]
async fn test_in_flight_cap_limits_concurrent_uploads() {
    let dir = TempDir::new().expect("failed to create temp dir");
    for i in 0..3 {
        let name = format!("event-bundle.2026-10-17T00:00:0{i}");
        fs::write(dir.path().join(name), "x").expect("write failed");
    }

    let state = FakeState::gated();
    let config = config_in(dir.path())
        .with_tick_interval(Duration::from_millis(10))
        .with_max_in_flight(1);
    let sink = fake_sink(config, &state);
    let running = start(sink);

    wait_for(&running.stats, |s| s.uploads_in_flight == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = running.stats.snapshot();
    assert_eq!(stats.uploads_in_flight, 1);
    assert_eq!(stats.pending_uploads, 2);

    if let Some(gate) = &state.gate {
        gate.add_permits(3);
    }
    let stats = wait_for(&running.stats, |s| s.files_uploaded == 3).await;
    assert_eq!(stats.uploads_in_flight, 0);

    running.shutdown.cancel();
    running.handle.await.expect("loop panicked");
}

#[tokio::test(start_paused = true)]
async fn test_idle_sink_rolls_over_after_interval() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let state = FakeState::gated();
    let sink = fake_sink(config_in(dir.path()), &state);
    let running = start(sink);

    tokio::time::sleep(Duration::from_secs(299)).await;
    assert_eq!(running.stats.snapshot().file_holding_area["rollovers"], 0);

    tokio::time::sleep(Duration::from_secs(6)).await;
    let stats = running.stats.snapshot();
    assert_eq!(stats.file_holding_area["rollovers"], 1);
    assert_eq!(stats.uploads_in_flight, 1);

    running.shutdown.cancel();
    running.handle.await.expect("loop panicked");
}

#[tokio::test]
async fn test_write_error_is_fatal_and_reported() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let mut running = start(broken_sink(config_in(dir.path()), dir.path()));

    running.records.send("doomed\n".into()).await.expect("send failed");

    let err = running.errors.recv().await.expect("no fatal error reported");
    assert!(matches!(err, SinkError::Write(_)));
    running.handle.await.expect("loop panicked");
}

#[tokio::test]
async fn test_flush_rollover_error_is_fatal_and_reported() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let mut running = start(broken_sink(config_in(dir.path()), dir.path()));

    assert!(running.flush.request());

    let err = running.errors.recv().await.expect("no fatal error reported");
    assert!(matches!(err, SinkError::RollOver(_)));
    assert_eq!(err.to_string(), "rollover failed: disk on fire");
    running.handle.await.expect("loop panicked");
    assert!(!running.flush.request());
}

#[tokio::test]
async fn test_size_rollover_error_is_fatal_and_reported() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let config = config_in(dir.path()).with_max_file_size(1);
    let mut running = start(broken_sink(config, dir.path()));

    running.records.send("too big\n".into()).await.expect("send failed");

    let err = running.errors.recv().await.expect("no fatal error reported");
    assert!(matches!(err, SinkError::RollOver(_)));
    running.handle.await.expect("loop panicked");
}

#[tokio::test(start_paused = true)]
async fn test_tick_rollover_error_is_fatal_and_reported() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let config = config_in(dir.path()).with_roll_over_interval(Duration::from_secs(5));
    let mut running = start(broken_sink(config, dir.path()));

    tokio::time::sleep(Duration::from_secs(7)).await;

    let err = running.errors.recv().await.expect("no fatal error reported");
    assert!(matches!(err, SinkError::RollOver(_)));
    running.handle.await.expect("loop panicked");
}

#[tokio::test]
async fn test_cancellation_stops_loop_without_error() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let sink = fake_sink(config_in(dir.path()), &FakeState::failing(0));
    let mut running = start(sink);

    running.records.send("stays local\n".into()).await.expect("send failed");
    wait_for(&running.stats, |s| s.file_holding_area["messages_written"] == 1).await;

    running.shutdown.cancel();
    let stats = running.handle.await.expect("loop panicked");

    assert_eq!(stats.files_uploaded, 0);
    assert!(running.errors.try_recv().is_err());
    assert_eq!(live_content(dir.path()), "stays local\n");
}

#[tokio::test]
async fn test_cancellation_persists_queued_records() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let sink = fake_sink(config_in(dir.path()), &FakeState::failing(0));
    let (records, rx) = mpsc::channel(100);
    let (err_tx, mut errors) = mpsc::channel(1);
    let shutdown = CancellationToken::new();

    for i in 0..50 {
        records.send(format!("record {i}\n")).await.expect("send failed");
    }
    shutdown.cancel();

    let stats = sink.run(rx, err_tx, shutdown).await.expect("loop panicked");

    let expected: String = (0..50).map(|i| format!("record {i}\n")).collect();
    assert_eq!(live_content(dir.path()), expected);
    assert_eq!(stats.file_holding_area["messages_written"], 50);
    assert!(errors.try_recv().is_err());
    assert!(records.send("late\n".into()).await.is_err());
}

#[tokio::test]
async fn test_write_error_while_draining_is_reported() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let sink = broken_sink(config_in(dir.path()), dir.path());
    let (records, rx) = mpsc::channel(100);
    let (err_tx, mut errors) = mpsc::channel(1);
    let shutdown = CancellationToken::new();

    records.send("queued\n".into()).await.expect("send failed");
    shutdown.cancel();

    sink.run(rx, err_tx, shutdown).await.expect("loop panicked");

    let err = errors.recv().await.expect("no fatal error reported");
    assert!(matches!(err, SinkError::Write(_)));
}

#[tokio::test]
async fn test_closed_record_channel_stops_loop() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let sink = fake_sink(config_in(dir.path()), &FakeState::failing(0));
    let running = start(sink);

    drop(running.records);
    let stats = running.handle.await.expect("loop panicked");
    assert_eq!(stats.files_uploaded, 0);
}

// =============================================================================
// Dispatcher tests
// =============================================================================

#[tokio::test]
async fn test_upload_one_reports_open_failure() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let state = FakeState::failing(0);
    let backend: Arc<dyn UploadBackend> = Arc::new(FakeBackend {
        state: Arc::clone(&state),
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    let missing = dir.path().join("event-bundle.gone");

    upload_one(backend, missing.clone(), tx).await;

    let outcome = rx.recv().await.expect("no outcome");
    assert_eq!(outcome.path, missing);
    assert!(matches!(outcome.result, Err(UploadError::Io(_))));
    assert!(rx.recv().await.is_none());
    assert_eq!(state.attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_upload_one_deletes_only_on_success() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let ok_path = dir.path().join("event-bundle.ok");
    let bad_path = dir.path().join("event-bundle.bad");
    fs::write(&ok_path, "ok").expect("write failed");
    fs::write(&bad_path, "bad").expect("write failed");

    let (tx, mut rx) = mpsc::unbounded_channel();

    let succeeding: Arc<dyn UploadBackend> = Arc::new(FakeBackend {
        state: FakeState::failing(0),
    });
    upload_one(succeeding, ok_path.clone(), tx.clone()).await;
    let outcome = rx.recv().await.expect("no outcome");
    assert!(outcome.is_success());
    assert!(!ok_path.exists());

    let failing: Arc<dyn UploadBackend> = Arc::new(FakeBackend {
        state: FakeState::failing(1),
    });
    upload_one(failing, bad_path.clone(), tx).await;
    let outcome = rx.recv().await.expect("no outcome");
    assert!(!outcome.is_success());
    assert!(bad_path.exists());
}
