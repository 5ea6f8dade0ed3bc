//! Process wiring: config to sink, input to records, signals to flush/stop

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use spool_config::{BackendConfig, BundleSinkConfig, Config};
use spool_sinks::{
    BundleConfig, BundleSink, BundleStatistics, BundleStatisticsHandle, FlushTrigger,
    LocalMirrorBackend, ObjectStoreBackend, UploadBackend,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Run the uploader until `shutdown` resolves, the input ends, or the sink
/// hits a fatal error
///
/// Returns the sink's final statistics.
pub async fn run<R, S>(config: Config, input: R, shutdown: S) -> Result<BundleStatistics>
where
    R: AsyncRead + Unpin + Send + 'static,
    S: Future<Output = ()>,
{
    let section = &config.bundle;

    let backend = build_backend(&section.backend)?;
    let sink = BundleSink::initialize(bundle_config(section), Some(backend))
        .context("failed to initialize bundle sink")?;

    info!(
        sink = %sink,
        buffer_dir = %sink.buffer_dir().display(),
        backend = section.backend.kind(),
        "bundle sink ready"
    );

    let cancel = CancellationToken::new();
    let statistics = sink.statistics_handle();

    #[cfg(unix)]
    spawn_flush_on_hangup(sink.flush_trigger(), cancel.clone())?;

    let (records_tx, records_rx) = mpsc::channel(section.queue_size);
    let (errors_tx, mut errors_rx) = mpsc::channel(1);
    let sink_handle = sink.run(records_rx, errors_tx, cancel.clone());

    let reader = tokio::spawn(read_records(input, records_tx, cancel.clone()));

    if section.metrics_enabled {
        tokio::spawn(report_statistics(
            statistics,
            section.metrics_interval,
            cancel.clone(),
        ));
    }

    let fatal = tokio::select! {
        _ = shutdown => {
            info!("shutdown signal received");
            None
        }
        fatal = errors_rx.recv() => fatal,
    };

    cancel.cancel();

    let final_statistics = sink_handle.await.context("bundle sink task failed")?;
    info!(
        statistics = %statistics_json(&final_statistics),
        "final bundle statistics"
    );

    let read = reader.await.context("input reader task failed")?;

    if let Some(e) = fatal {
        return Err(anyhow::Error::new(e).context("bundle sink stopped"));
    }

    let records = read?;
    info!(records, "input finished");

    Ok(final_statistics)
}

/// Translate the `[bundle]` section into sink settings
pub fn bundle_config(section: &BundleSinkConfig) -> BundleConfig {
    let config = BundleConfig::default()
        .with_connection(section.connection.clone())
        .with_base_name(section.base_name.clone())
        .with_max_file_size(section.max_file_size)
        .with_roll_over_interval(section.roll_over_interval)
        .with_tick_interval(section.tick_interval)
        .with_failure_log_interval(section.failure_log_interval);

    match section.max_in_flight {
        Some(max) => config.with_max_in_flight(max),
        None => config,
    }
}

/// Build the configured upload backend
pub fn build_backend(config: &BackendConfig) -> Result<Box<dyn UploadBackend>> {
    let backend: Box<dyn UploadBackend> = match config {
        BackendConfig::LocalMirror => Box::new(LocalMirrorBackend::new()),
        BackendConfig::ObjectStore { url } => Box::new(
            ObjectStoreBackend::from_url(url)
                .with_context(|| format!("invalid object store url '{url}'"))?,
        ),
    };
    Ok(backend)
}

/// Forward each input line, newline restored, as one record
///
/// Stops at end of input, on cancellation, or once the sink stops
/// accepting records. Returns the number of records forwarded.
pub async fn read_records<R>(
    input: R,
    records: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let mut forwarded = 0u64;

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line.context("failed to read records from input")?,
        };

        let Some(mut line) = line else {
            debug!("end of input");
            break;
        };

        line.push('\n');
        if records.send(line).await.is_err() {
            debug!("bundle sink stopped accepting records");
            break;
        }
        forwarded += 1;
    }

    Ok(forwarded)
}

async fn report_statistics(
    handle: BundleStatisticsHandle,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                info!(statistics = %statistics_json(&handle.snapshot()), "bundle statistics");
            }
        }
    }
}

fn statistics_json(statistics: &BundleStatistics) -> String {
    serde_json::to_string(statistics).unwrap_or_else(|e| {
        warn!(error = %e, "failed to serialize statistics");
        String::from("{}")
    })
}

/// Request a rollover on every SIGHUP
#[cfg(unix)]
fn spawn_flush_on_hangup(flush: FlushTrigger, cancel: CancellationToken) -> Result<()> {
    let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .context("failed to install SIGHUP handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    if flush.request() {
                        info!("SIGHUP: rollover requested");
                    } else {
                        debug!("SIGHUP: rollover already pending");
                    }
                }
            }
        }
    });

    debug!("SIGHUP handler installed for on-demand rollover");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
#[path = "run_test.rs"]
mod run_test;
