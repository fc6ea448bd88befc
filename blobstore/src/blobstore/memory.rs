use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{instrument, warn};

use super::BlobStore;
use crate::composition::{CompositionContext, ServiceBuilder};
use crate::metrics::{OperationMetricsDelta, OperationMetricsTracker, OperationType};
use crate::{
    is_temporary, B3HashingReader, Blob, BlobContent, BlobHeaders, BlobId, BlobMetrics,
    BlobStoreConfiguration, Error, TEMPORARY_BLOB_HEADER,
};

struct MemoryEntry {
    headers: BlobHeaders,
    metrics: BlobMetrics,
    contents: Bytes,
    /// The reason given when soft-deleted.
    deleted: Option<String>,
}

impl MemoryEntry {
    fn to_blob(&self, id: &BlobId) -> Blob {
        Blob::new(
            id.clone(),
            self.headers.clone(),
            self.metrics.clone(),
            self.deleted.is_some(),
            BlobContent::Memory(self.contents.clone()),
        )
    }
}

/// Keeps blobs in a map in memory. Clones share the same contents.
#[derive(Clone)]
pub struct MemoryBlobStore {
    configuration: Arc<BlobStoreConfiguration>,
    db: Arc<RwLock<HashMap<BlobId, MemoryEntry>>>,
    writable: Arc<AtomicBool>,
    metrics: Arc<OperationMetricsTracker>,
}

impl MemoryBlobStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            configuration: Arc::new(BlobStoreConfiguration::new(name, "memory")),
            db: Default::default(),
            writable: Arc::new(AtomicBool::new(true)),
            metrics: Default::default(),
        }
    }

    /// Marks the store read-only (or writable again).
    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::Relaxed);
    }

    fn ensure_writable(&self) -> Result<(), Error> {
        if !self.is_writable() {
            return Err(Error::InvalidRequest(format!(
                "blob store {} is read-only",
                self.configuration.name
            )));
        }
        Ok(())
    }

    /// Stores a blob under a given id, for seeding tests.
    #[cfg(test)]
    pub(crate) fn insert_with_id(&self, id: BlobId, headers: BlobHeaders, contents: Bytes) -> Blob {
        let b3_digest = data_encoding::HEXLOWER.encode(blake3::hash(&contents).as_bytes());
        self.insert(id, headers, contents, b3_digest)
    }

    fn insert(&self, id: BlobId, headers: BlobHeaders, contents: Bytes, b3_digest: String) -> Blob {
        let entry = MemoryEntry {
            headers,
            metrics: BlobMetrics {
                size: contents.len() as u64,
                b3_digest,
                created: SystemTime::now(),
            },
            contents,
            deleted: None,
        };
        let blob = entry.to_blob(&id);
        self.db.write().insert(id, entry);
        blob
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    #[instrument(skip_all, fields(blob_store.name = %self.configuration.name))]
    async fn create(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        headers: BlobHeaders,
    ) -> Result<Blob, Error> {
        self.ensure_writable()?;

        let start = Instant::now();
        let mut hashing_reader = B3HashingReader::from(reader);
        let mut buf = Vec::new();
        if let Err(e) = hashing_reader.read_to_end(&mut buf).await {
            self.metrics
                .record_error(OperationType::Upload, start.elapsed());
            return Err(e.into());
        }

        let blob = self.insert(BlobId::random(), headers, buf.into(), hashing_reader.digest());
        self.metrics.record_success(
            OperationType::Upload,
            blob.metrics().size,
            start.elapsed(),
        );
        Ok(blob)
    }

    #[instrument(skip_all, fields(blob_store.name = %self.configuration.name, path = %path.display()))]
    async fn create_from_path(
        &self,
        path: &Path,
        headers: BlobHeaders,
        size: u64,
        b3_digest: &str,
    ) -> Result<Blob, Error> {
        self.ensure_writable()?;

        let start = Instant::now();
        let contents = tokio::fs::read(path).await?;
        if contents.len() as u64 != size {
            self.metrics
                .record_error(OperationType::Upload, start.elapsed());
            return Err(Error::InvalidRequest(format!(
                "{}: expected {} bytes, got {}",
                path.display(),
                size,
                contents.len()
            )));
        }

        let blob = self.insert(BlobId::random(), headers, contents.into(), b3_digest.to_string());
        self.metrics
            .record_success(OperationType::Upload, size, start.elapsed());
        Ok(blob)
    }

    #[instrument(skip(self, headers), fields(blob.id = %id))]
    async fn copy(&self, id: &BlobId, headers: BlobHeaders) -> Result<Blob, Error> {
        self.ensure_writable()?;

        let (contents, b3_digest) = match self.db.read().get(id) {
            Some(entry) if entry.deleted.is_none() => {
                (entry.contents.clone(), entry.metrics.b3_digest.clone())
            }
            _ => return Err(Error::NotFound(id.clone())),
        };

        Ok(self.insert(BlobId::random(), headers, contents, b3_digest))
    }

    #[instrument(skip(self), fields(blob.id = %id))]
    async fn get(&self, id: &BlobId, include_deleted: bool) -> Result<Option<Blob>, Error> {
        let start = Instant::now();
        let blob = match self.db.read().get(id) {
            Some(entry) if include_deleted || entry.deleted.is_none() => Some(entry.to_blob(id)),
            _ => None,
        };

        if let Some(blob) = &blob {
            self.metrics.record_success(
                OperationType::Download,
                blob.metrics().size,
                start.elapsed(),
            );
        }
        Ok(blob)
    }

    #[instrument(skip(self), fields(blob.id = %id))]
    async fn exists(&self, id: &BlobId) -> Result<bool, Error> {
        Ok(self
            .db
            .read()
            .get(id)
            .is_some_and(|entry| entry.deleted.is_none()))
    }

    #[instrument(skip(self), fields(blob.id = %id))]
    async fn exists_including_deleted(&self, id: &BlobId) -> Result<bool, Error> {
        Ok(self.db.read().contains_key(id))
    }

    #[instrument(skip(self), fields(blob.id = %id))]
    async fn delete(&self, id: &BlobId, reason: &str) -> Result<bool, Error> {
        match self.db.write().get_mut(id) {
            Some(entry) if entry.deleted.is_none() => {
                entry.deleted = Some(reason.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    #[instrument(skip(self), fields(blob.id = %id))]
    async fn delete_hard(&self, id: &BlobId) -> Result<bool, Error> {
        Ok(self.db.write().remove(id).is_some())
    }

    fn blob_id_stream(&self) -> BoxStream<'static, Result<BlobId, Error>> {
        let ids: Vec<BlobId> = self.db.read().keys().cloned().collect();
        futures::stream::iter(ids.into_iter().map(Ok)).boxed()
    }

    #[instrument(skip_all, fields(blob.id = %blob.id()))]
    async fn is_owner(&self, blob: &Blob) -> Result<bool, Error> {
        self.exists(blob.id()).await
    }

    #[instrument(skip_all, fields(blob.id = %blob.id()))]
    async fn make_blob_permanent(
        &self,
        blob: &Blob,
        mut headers: BlobHeaders,
    ) -> Result<Blob, Error> {
        headers.remove(TEMPORARY_BLOB_HEADER);

        let mut db = self.db.write();
        match db.get_mut(blob.id()) {
            Some(entry) if entry.deleted.is_none() => {
                entry.headers = headers;
                Ok(entry.to_blob(blob.id()))
            }
            _ => Err(Error::NotFound(blob.id().clone())),
        }
    }

    #[instrument(skip_all, fields(blob.id = %blob.id()))]
    async fn delete_if_temp(&self, blob: &Blob) -> Result<bool, Error> {
        let mut db = self.db.write();
        match db.get(blob.id()) {
            Some(entry) if is_temporary(&entry.headers) => {
                db.remove(blob.id());
                Ok(true)
            }
            Some(_) => {
                warn!("not deleting permanent blob");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Relaxed)
    }

    fn operation_metrics_delta(&self) -> OperationMetricsDelta {
        self.metrics.take_delta()
    }

    fn configuration(&self) -> &BlobStoreConfiguration {
        &self.configuration
    }
}

#[derive(serde::Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct MemoryBlobStoreConfig {
    /// Start out read-only.
    #[serde(default)]
    read_only: bool,
}

impl TryFrom<url::Url> for MemoryBlobStoreConfig {
    type Error = Box<dyn std::error::Error + Send + Sync>;
    fn try_from(url: url::Url) -> Result<Self, Self::Error> {
        // memory doesn't support host or path in the URL.
        if url.has_host() || !url.path().is_empty() {
            return Err(Error::StorageError("invalid url".to_string()).into());
        }
        Ok(MemoryBlobStoreConfig::default())
    }
}

#[async_trait]
impl ServiceBuilder for MemoryBlobStoreConfig {
    type Output = dyn BlobStore;
    async fn build(
        &self,
        instance_name: &str,
        _context: &CompositionContext<dyn BlobStore>,
    ) -> Result<Arc<dyn BlobStore>, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let store = MemoryBlobStore::new(instance_name);
        store.set_writable(!self.read_only);
        Ok(Arc::new(store))
    }
}
