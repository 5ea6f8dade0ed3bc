//! Upload backends
//!
//! A backend receives one closed, rolled-over file at a time and ships it
//! somewhere durable. The bundle sink owns retries; a backend makes exactly
//! one attempt per call and reports the result.
//!
//! | Backend | Destination |
//! |---------|-------------|
//! | `local_mirror` | Another directory (NFS mount, archive disk) |
//! | `object_store` | S3 or any `object_store` implementation |

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::common::ConnectionString;

pub mod local_mirror;
pub mod object_store;

pub use self::local_mirror::LocalMirrorBackend;
pub use self::object_store::ObjectStoreBackend;

/// Destination for rolled-over files
#[async_trait]
pub trait UploadBackend: Send + Sync + 'static {
    /// Configure the backend from the sink's connection string
    ///
    /// Called once, before any upload.
    fn initialize(&mut self, connection: &ConnectionString) -> Result<(), UploadError>;

    /// Upload one file
    ///
    /// `file` is open for reading at offset zero and is closed when this
    /// returns. The caller deletes `path` only on `Ok`.
    async fn upload(&self, path: &Path, file: tokio::fs::File) -> Result<(), UploadError>;

    /// Backend-specific statistics for the status page
    fn statistics(&self) -> serde_json::Value;

    /// Stable identity used to tell configured outputs apart
    fn key(&self) -> String;

    /// Human-readable description for logs
    fn describe(&self) -> String;

    /// Local directory uploads are written into, if the backend has one
    ///
    /// The bundle sink refuses to start when this is its own buffer
    /// directory.
    fn local_destination(&self) -> Option<&Path> {
        None
    }
}

/// Upload failures; always retried by the bundle sink
#[derive(Debug, Error)]
pub enum UploadError {
    /// Local or remote I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Object store rejected the request
    #[error("object store error: {0}")]
    Store(#[from] ::object_store::Error),

    /// Connection string could not be understood by the backend
    #[error("invalid backend descriptor: {0}")]
    Descriptor(String),

    /// Any other backend-specific failure
    #[error("{0}")]
    Backend(String),
}

impl UploadError {
    /// Create a descriptor error
    pub fn descriptor(msg: impl Into<String>) -> Self {
        Self::Descriptor(msg.into())
    }

    /// Create a generic backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

/// File name component used as the remote name of an upload
pub(crate) fn upload_name(path: &Path) -> Result<&str, UploadError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| UploadError::backend(format!("not a file path: {}", path.display())))
}
