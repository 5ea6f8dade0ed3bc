//! Local mirror backend
//!
//! Copies each file into a destination directory, typically a mounted
//! network share. The copy lands under a `.partial` name and is renamed into
//! place, so readers of the destination never see a half-written bundle.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;

use super::{UploadBackend, UploadError, upload_name};
use crate::common::ConnectionString;

/// Counters for the mirror backend
#[derive(Debug, Default)]
pub struct LocalMirrorMetrics {
    files_mirrored: AtomicU64,
    bytes_mirrored: AtomicU64,
    failures: AtomicU64,
}

impl LocalMirrorMetrics {
    /// Get snapshot of metrics
    pub fn snapshot(&self) -> LocalMirrorSnapshot {
        LocalMirrorSnapshot {
            files_mirrored: self.files_mirrored.load(Ordering::Relaxed),
            bytes_mirrored: self.bytes_mirrored.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of mirror metrics
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LocalMirrorSnapshot {
    pub files_mirrored: u64,
    pub bytes_mirrored: u64,
    pub failures: u64,
}

/// Backend that mirrors bundles into another directory
#[derive(Debug, Default)]
pub struct LocalMirrorBackend {
    destination: PathBuf,
    metrics: LocalMirrorMetrics,
}

impl LocalMirrorBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory bundles are copied into
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Get reference to metrics
    pub fn metrics(&self) -> &LocalMirrorMetrics {
        &self.metrics
    }

    async fn copy_into_place(
        &self,
        path: &Path,
        mut file: tokio::fs::File,
    ) -> Result<u64, UploadError> {
        let name = upload_name(path)?;
        let target = self.destination.join(name);
        let partial = self.destination.join(format!("{name}.partial"));

        let mut out = tokio::fs::File::create(&partial).await?;
        let copied = tokio::io::copy(&mut file, &mut out).await;
        let copied = match copied {
            Ok(bytes) => bytes,
            Err(e) => {
                drop(out);
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e.into());
            }
        };
        out.sync_all().await?;
        drop(out);

        tokio::fs::rename(&partial, &target).await?;
        Ok(copied)
    }
}

#[async_trait]
impl UploadBackend for LocalMirrorBackend {
    fn initialize(&mut self, connection: &ConnectionString) -> Result<(), UploadError> {
        let destination = connection.remainder().trim();
        if destination.is_empty() {
            return Err(UploadError::descriptor(
                "local mirror needs a destination directory",
            ));
        }

        let destination = PathBuf::from(destination);
        std::fs::create_dir_all(&destination)?;
        self.destination = destination;
        Ok(())
    }

    async fn upload(&self, path: &Path, file: tokio::fs::File) -> Result<(), UploadError> {
        match self.copy_into_place(path, file).await {
            Ok(bytes) => {
                self.metrics.files_mirrored.fetch_add(1, Ordering::Relaxed);
                self.metrics.bytes_mirrored.fetch_add(bytes, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn statistics(&self) -> serde_json::Value {
        serde_json::to_value(self.metrics.snapshot()).unwrap_or_default()
    }

    fn key(&self) -> String {
        format!("local_mirror:{}", self.destination.display())
    }

    fn describe(&self) -> String {
        format!("local mirror into {}", self.destination.display())
    }
    fn local_destination(&self) -> Option<&Path> {
        Some(&self.destination)
    }
}

#[cfg(test)]
#[path = "local_mirror_test.rs"]
mod local_mirror_test;
