//! Object store backend
//!
//! Puts each bundle as one object. The store comes from a URL
//! (`s3://bucket/base`, `file:///srv/archive`, `memory:///`) and the
//! backend part of the connection string is a key prefix under it:
//!
//! ```text
//! connection: /var/spool/bundles:forwarder/host-17
//! store url:  s3://events-archive/raw
//! object:     s3://events-archive/raw/forwarder/host-17/event-bundle.2026-10-17T09:15:02
//! ```

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ::object_store::path::Path as ObjectPath;
use ::object_store::{ObjectStore, PutPayload};
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use url::Url;

use super::{UploadBackend, UploadError, upload_name};
use crate::common::ConnectionString;

/// Counters for the object store backend
#[derive(Debug, Default)]
pub struct ObjectStoreMetrics {
    objects_uploaded: AtomicU64,
    bytes_uploaded: AtomicU64,
    failures: AtomicU64,
}

impl ObjectStoreMetrics {
    /// Get snapshot of metrics
    pub fn snapshot(&self) -> ObjectStoreSnapshot {
        ObjectStoreSnapshot {
            objects_uploaded: self.objects_uploaded.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of object store metrics
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ObjectStoreSnapshot {
    pub objects_uploaded: u64,
    pub bytes_uploaded: u64,
    pub failures: u64,
}

/// Backend that uploads bundles to an object store
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    label: String,
    base: ObjectPath,
    prefix: ObjectPath,
    metrics: ObjectStoreMetrics,
}

impl ObjectStoreBackend {
    /// Wrap an existing store; `label` names it in keys and logs
    pub fn new(store: Arc<dyn ObjectStore>, label: impl Into<String>) -> Self {
        Self {
            store,
            label: label.into(),
            base: ObjectPath::default(),
            prefix: ObjectPath::default(),
            metrics: ObjectStoreMetrics::default(),
        }
    }

    /// Build the store from a URL understood by `object_store::parse_url`
    pub fn from_url(url: &str) -> Result<Self, UploadError> {
        let parsed = Url::parse(url)
            .map_err(|e| UploadError::descriptor(format!("invalid store url '{url}': {e}")))?;
        let (store, base) = ::object_store::parse_url(&parsed)?;

        let mut backend = Self::new(Arc::from(store), url);
        backend.base = base;
        Ok(backend)
    }

    /// Key prefix taken from the connection string
    pub fn prefix(&self) -> &ObjectPath {
        &self.prefix
    }

    /// Get reference to metrics
    pub fn metrics(&self) -> &ObjectStoreMetrics {
        &self.metrics
    }

    /// Object location for a local bundle file
    pub fn location_for(&self, path: &Path) -> Result<ObjectPath, UploadError> {
        let name = upload_name(path)?;
        let mut location = self.base.clone();
        for part in self.prefix.parts() {
            location = location.child(part);
        }
        Ok(location.child(name))
    }

    async fn put_file(
        &self,
        path: &Path,
        mut file: tokio::fs::File,
    ) -> Result<u64, UploadError> {
        let location = self.location_for(path)?;

        let mut body = Vec::new();
        file.read_to_end(&mut body).await?;
        drop(file);

        let bytes = body.len() as u64;
        self.store.put(&location, PutPayload::from(body)).await?;

        tracing::debug!(
            path = %path.display(),
            location = %location,
            bytes,
            "object uploaded"
        );
        Ok(bytes)
    }
}

#[async_trait]
impl UploadBackend for ObjectStoreBackend {
    fn initialize(&mut self, connection: &ConnectionString) -> Result<(), UploadError> {
        let prefix = connection.remainder().trim().trim_matches('/');
        self.prefix = ObjectPath::parse(prefix)
            .map_err(|e| UploadError::descriptor(format!("invalid key prefix '{prefix}': {e}")))?;
        Ok(())
    }

    async fn upload(&self, path: &Path, file: tokio::fs::File) -> Result<(), UploadError> {
        match self.put_file(path, file).await {
            Ok(bytes) => {
                self.metrics.objects_uploaded.fetch_add(1, Ordering::Relaxed);
                self.metrics.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
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
        format!("object_store:{}/{}", self.label, self.prefix)
    }

    fn describe(&self) -> String {
        format!("object store {}", self.label)
    }
}

#[cfg(test)]
#[path = "object_store_test.rs"]
mod object_store_test;
