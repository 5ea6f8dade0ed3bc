//! Upload accounting for the status page
//!
//! The event loop is the only writer; status readers take a read lock and
//! copy the counters out, so a snapshot never mixes two updates.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::backend::UploadBackend;
use crate::common::StatisticsSource;

/// Counters owned by the event loop
#[derive(Debug, Clone, Default)]
pub(crate) struct UploadCounters {
    pub files_uploaded: u64,
    pub upload_errors: u64,
    pub last_error_text: String,
    pub last_error_time: Option<DateTime<Utc>>,
    pub pending_uploads: usize,
    pub uploads_in_flight: usize,
}

impl UploadCounters {
    pub fn record_success(&mut self) {
        self.files_uploaded += 1;
    }

    pub fn record_failure(&mut self, error: String) {
        self.upload_errors += 1;
        self.last_error_text = error;
        self.last_error_time = Some(Utc::now());
    }
}

/// Serializable statistics for one bundle sink
#[derive(Debug, Clone, Serialize)]
pub struct BundleStatistics {
    pub files_uploaded: u64,
    pub upload_errors: u64,
    pub last_error_time: Option<DateTime<Utc>>,
    pub last_error_text: String,
    pub pending_uploads: usize,
    pub uploads_in_flight: usize,
    pub file_holding_area: serde_json::Value,
    pub storage_statistics: serde_json::Value,
}

/// Handle for reading bundle sink statistics
///
/// Cheap to clone and safe to read from any task. It stays valid after
/// `run()` consumes the sink.
#[derive(Clone)]
pub struct BundleStatisticsHandle {
    pub(crate) counters: Arc<RwLock<UploadCounters>>,
    pub(crate) holding_area: Arc<dyn StatisticsSource>,
    pub(crate) backend: Arc<dyn UploadBackend>,
}

impl BundleStatisticsHandle {
    /// Take a consistent snapshot
    pub fn snapshot(&self) -> BundleStatistics {
        let counters = self.counters.read().clone();

        BundleStatistics {
            files_uploaded: counters.files_uploaded,
            upload_errors: counters.upload_errors,
            last_error_time: counters.last_error_time,
            last_error_text: counters.last_error_text,
            pending_uploads: counters.pending_uploads,
            uploads_in_flight: counters.uploads_in_flight,
            file_holding_area: self.holding_area.statistics(),
            storage_statistics: self.backend.statistics(),
        }
    }
}

impl std::fmt::Debug for BundleStatisticsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleStatisticsHandle")
            .field("backend", &self.backend.key())
            .finish_non_exhaustive()
    }
}
