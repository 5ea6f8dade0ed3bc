//! One upload attempt for one rolled-over file
//!
//! Spawned fire-and-forget by the bundle sink. Retrying is not done here:
//! the outcome goes back to the event loop, which requeues failures.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::backend::{UploadBackend, UploadError};

/// Result of a single upload attempt
#[derive(Debug)]
pub struct UploadOutcome {
    /// File the attempt was for
    pub path: PathBuf,

    /// `Ok` means the backend accepted it and the local file was removed
    pub result: Result<(), UploadError>,
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Upload `path` and report exactly one outcome on `results`
///
/// The local file is deleted only after the backend succeeds. A failed
/// delete is logged and still reported as success.
pub async fn upload_one(
    backend: Arc<dyn UploadBackend>,
    path: PathBuf,
    results: mpsc::UnboundedSender<UploadOutcome>,
) {
    let result = attempt(backend.as_ref(), &path).await;

    if results.send(UploadOutcome { path, result }).is_err() {
        tracing::debug!("bundle sink stopped, upload outcome dropped");
    }
}

async fn attempt(backend: &dyn UploadBackend, path: &Path) -> Result<(), UploadError> {
    let file = tokio::fs::File::open(path).await?;
    backend.upload(path, file).await?;

    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove uploaded file");
    }
    Ok(())
}
