//! Spool - Sinks
//!
//! Durable, disk-buffered output stage for a log forwarding pipeline.
//!
//! # Architecture
//!
//! Records are appended to a local live file, which is rolled over into
//! size- and time-bounded chunks. Each closed chunk is uploaded by a
//! background task through a pluggable backend and deleted only once the
//! upload succeeds. Failed uploads are retried forever; chunks left behind
//! by a crash are picked up again at startup.
//!
//! ```text
//! [Records] --mpsc--> [BundleSink loop] --append--> [live file]
//!                           |  rollover
//!                           v
//!                     [upload task] --> [UploadBackend] --> outcome --> loop
//! ```
//!
//! # Backends
//!
//! | Backend | Purpose |
//! |---------|---------|
//! | `local_mirror` | Copy chunks into another directory |
//! | `object_store` | Put chunks into S3 or another object store |
//!
//! # Example
//!
//! ```ignore
//! use spool_sinks::{BundleConfig, BundleSink, LocalMirrorBackend};
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = BundleConfig::default().with_connection("/var/spool:/mnt/archive");
//! let sink = BundleSink::initialize(config, Some(Box::new(LocalMirrorBackend::new())))?;
//!
//! let stats = sink.statistics_handle();
//! let flush = sink.flush_trigger();
//!
//! let (tx, rx) = mpsc::channel(10_000);
//! let (err_tx, mut err_rx) = mpsc::channel(1);
//! let handle = sink.run(rx, err_tx, CancellationToken::new());
//! ```

/// Orchestrator: rollover policy, upload dispatch, retries, recovery
pub mod bundle;

/// Upload backends and the trait they implement
pub mod backend;

/// Live file writer and logging helpers
pub mod util;

/// Errors, connection strings and the statistics seam
mod common;

pub use backend::{LocalMirrorBackend, ObjectStoreBackend, UploadBackend, UploadError};
pub use bundle::{
    BundleConfig, BundleSink, BundleStatistics, BundleStatisticsHandle, FlushTrigger,
    UploadOutcome,
};
pub use common::{ConnectionString, SinkError, StatisticsSource};
