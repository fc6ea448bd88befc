use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use super::BlobStore;
use crate::composition::{CompositionContext, ServiceBuilder};
use crate::metrics::{OperationMetricsDelta, OperationMetricsTracker, OperationType};
use crate::{
    is_temporary, B3HashingReader, Blob, BlobContent, BlobHeaders, BlobId, BlobMetrics,
    BlobStoreConfiguration, Error, TEMPORARY_BLOB_HEADER,
};

const BYTES_EXTENSION: &str = "bytes";
const PROPERTIES_EXTENSION: &str = "properties";

/// Stores blobs on an existing path backed by a POSIX-compliant filesystem.
///
/// It builds a `tmp` and a `content` directory inside of the path. Blobs are
/// staged in `tmp`, then moved **atomically** into
/// `content/ID[:2]/ID.bytes`, next to an `ID.properties` JSON file holding
/// headers, metrics and deletion state. The properties file is written last,
/// a blob without one doesn't exist.
///
/// **Disclaimer** : This very simple implementation is subject to change and
/// does not give any final guarantees on the on-disk format.
#[derive(Clone)]
pub struct SimpleFilesystemBlobStore {
    configuration: Arc<BlobStoreConfiguration>,
    /// Where the blobs are located on a filesystem already mounted.
    path: PathBuf,
    writable: Arc<AtomicBool>,
    metrics: Arc<OperationMetricsTracker>,
}

#[derive(Serialize, Deserialize)]
struct BlobProperties {
    headers: BlobHeaders,
    metrics: BlobMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deleted_reason: Option<String>,
}

impl BlobProperties {
    fn is_live(&self) -> bool {
        self.deleted_reason.is_none()
    }
}

/// Returns the bytes and properties paths of a blob, or None if the id can't
/// name a blob in this store.
fn derive_paths(root: &Path, id: &BlobId) -> Option<(PathBuf, PathBuf)> {
    let id = id.as_str();
    if id.len() < 3
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return None;
    }

    let shard = root.join("content").join(&id[..2]);
    Some((
        shard.join(format!("{}.{}", id, BYTES_EXTENSION)),
        shard.join(format!("{}.{}", id, PROPERTIES_EXTENSION)),
    ))
}

fn map_tempfile_error(e: async_tempfile::Error) -> io::Error {
    match e {
        async_tempfile::Error::Io(io_error) => io_error,
        async_tempfile::Error::InvalidFile => io::Error::new(
            io::ErrorKind::NotFound,
            "invalid or missing file specified",
        ),
        async_tempfile::Error::InvalidDirectory => io::Error::new(
            io::ErrorKind::NotFound,
            "invalid or missing directory specified",
        ),
    }
}

/// Removes a leftover file, logging instead of failing.
async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), err = %e, "unable to remove leftover file"),
    }
}

impl SimpleFilesystemBlobStore {
    pub async fn new(name: impl Into<String>, path: PathBuf) -> io::Result<Self> {
        tokio::fs::create_dir_all(&path).await?;
        tokio::fs::create_dir_all(path.join("tmp")).await?;
        tokio::fs::create_dir_all(path.join("content")).await?;

        Ok(Self {
            configuration: Arc::new(
                BlobStoreConfiguration::new(name, "filesystem")
                    .with_attribute("file", "path", path.to_string_lossy().into_owned()),
            ),
            path,
            writable: Arc::new(AtomicBool::new(true)),
            metrics: Default::default(),
        })
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

    fn staging_path(&self, extension: &str) -> PathBuf {
        self.path
            .join("tmp")
            .join(format!("{}.{}", uuid::Uuid::new_v4(), extension))
    }

    async fn read_properties(&self, id: &BlobId) -> Result<Option<BlobProperties>, Error> {
        let Some((_, properties_path)) = derive_paths(&self.path, id) else {
            return Ok(None);
        };

        match tokio::fs::read(&properties_path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_properties(
        &self,
        id: &BlobId,
        properties: &BlobProperties,
    ) -> Result<(), Error> {
        let (_, properties_path) = derive_paths(&self.path, id)
            .ok_or_else(|| Error::InvalidRequest(format!("invalid blob id {}", id)))?;

        // stage and rename, so readers never see a partial file.
        let staged = self.staging_path(PROPERTIES_EXTENSION);
        let res = async {
            tokio::fs::write(&staged, serde_json::to_vec(properties)?).await?;
            tokio::fs::rename(&staged, &properties_path).await?;
            Ok::<_, Error>(())
        }
        .await;

        if res.is_err() {
            remove_quietly(&staged).await;
        }
        res
    }

    fn to_blob(&self, id: &BlobId, properties: BlobProperties) -> Blob {
        let bytes_path = derive_paths(&self.path, id)
            .map(|(bytes_path, _)| bytes_path)
            .unwrap_or_default();

        Blob::new(
            id.clone(),
            properties.headers,
            properties.metrics,
            properties.deleted_reason.is_some(),
            BlobContent::File(bytes_path),
        )
    }

    /// Moves a staged file into place under a fresh id, then writes its
    /// properties. On failure, neither the staged file nor a half-committed
    /// blob is left behind.
    async fn commit(
        &self,
        staged: &Path,
        headers: BlobHeaders,
        size: u64,
        b3_digest: String,
    ) -> Result<Blob, Error> {
        let id = BlobId::random();
        let (bytes_path, _) = derive_paths(&self.path, &id)
            .ok_or_else(|| Error::StorageError(format!("unusable blob id {}", id)))?;

        let properties = BlobProperties {
            headers,
            metrics: BlobMetrics {
                size,
                b3_digest,
                created: SystemTime::now(),
            },
            deleted_reason: None,
        };

        let res = async {
            if let Some(shard) = bytes_path.parent() {
                tokio::fs::create_dir_all(shard).await?;
            }
            tokio::fs::rename(staged, &bytes_path).await?;
            self.write_properties(&id, &properties).await?;
            Ok::<_, Error>(())
        }
        .await;

        if let Err(e) = res {
            remove_quietly(staged).await;
            remove_quietly(&bytes_path).await;
            return Err(e);
        }

        debug!(blob.id = %id, size, "committed blob");
        Ok(self.to_blob(&id, properties))
    }

    /// Copies (or hard-links) a file into `tmp`, then commits it.
    async fn stage_and_commit(
        &self,
        source: &Path,
        link: bool,
        headers: BlobHeaders,
        size: u64,
        b3_digest: String,
    ) -> Result<Blob, Error> {
        let staged = self.staging_path(BYTES_EXTENSION);

        let linked = if link {
            match tokio::fs::hard_link(source, &staged).await {
                Ok(()) => true,
                Err(e) => {
                    debug!(err = %e, "hard link failed, copying");
                    false
                }
            }
        } else {
            false
        };
        if !linked {
            if let Err(e) = tokio::fs::copy(source, &staged).await {
                remove_quietly(&staged).await;
                return Err(e.into());
            }
        }

        self.commit(&staged, headers, size, b3_digest).await
    }

    async fn create_inner(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        headers: BlobHeaders,
    ) -> Result<Blob, Error> {
        let mut file = async_tempfile::TempFile::new_in(self.path.join("tmp"))
            .await
            .map_err(map_tempfile_error)?;

        let mut hashing_reader = B3HashingReader::from(reader);
        tokio::io::copy(&mut hashing_reader, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;

        self.commit(
            file.file_path(),
            headers,
            hashing_reader.size(),
            hashing_reader.digest(),
        )
        .await
    }

    async fn create_from_path_inner(
        &self,
        path: &Path,
        headers: BlobHeaders,
        size: u64,
        b3_digest: &str,
    ) -> Result<Blob, Error> {
        let actual_size = tokio::fs::metadata(path).await?.len();
        if actual_size != size {
            return Err(Error::InvalidRequest(format!(
                "{}: expected {} bytes, got {}",
                path.display(),
                size,
                actual_size
            )));
        }

        self.stage_and_commit(path, true, headers, size, b3_digest.to_string())
            .await
    }

    fn record<T>(
        &self,
        op: OperationType,
        start: Instant,
        res: &Result<T, Error>,
        size: impl Fn(&T) -> u64,
    ) {
        match res {
            Ok(v) => self.metrics.record_success(op, size(v), start.elapsed()),
            Err(_) => self.metrics.record_error(op, start.elapsed()),
        }
    }
}

#[async_trait]
impl BlobStore for SimpleFilesystemBlobStore {
    #[instrument(skip_all, fields(blob_store.name = %self.configuration.name))]
    async fn create(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        headers: BlobHeaders,
    ) -> Result<Blob, Error> {
        self.ensure_writable()?;

        let start = Instant::now();
        let res = self.create_inner(reader, headers).await;
        self.record(OperationType::Upload, start, &res, |b| b.metrics().size);
        res
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
        let res = self
            .create_from_path_inner(path, headers, size, b3_digest)
            .await;
        self.record(OperationType::Upload, start, &res, |b| b.metrics().size);
        res
    }

    #[instrument(skip(self, headers), fields(blob.id = %id))]
    async fn copy(&self, id: &BlobId, headers: BlobHeaders) -> Result<Blob, Error> {
        self.ensure_writable()?;

        let properties = match self.read_properties(id).await? {
            Some(properties) if properties.is_live() => properties,
            _ => return Err(Error::NotFound(id.clone())),
        };
        let (bytes_path, _) = derive_paths(&self.path, id)
            .ok_or_else(|| Error::NotFound(id.clone()))?;

        self.stage_and_commit(
            &bytes_path,
            false,
            headers,
            properties.metrics.size,
            properties.metrics.b3_digest,
        )
        .await
    }

    #[instrument(skip(self), fields(blob.id = %id))]
    async fn get(&self, id: &BlobId, include_deleted: bool) -> Result<Option<Blob>, Error> {
        let start = Instant::now();
        let res = match self.read_properties(id).await {
            Ok(Some(properties)) if include_deleted || properties.is_live() => {
                Ok(Some(self.to_blob(id, properties)))
            }
            Ok(_) => return Ok(None),
            Err(e) => Err(e),
        };
        self.record(OperationType::Download, start, &res, |b| {
            b.as_ref().map(|b| b.metrics().size).unwrap_or_default()
        });
        res
    }

    #[instrument(skip(self), fields(blob.id = %id))]
    async fn exists(&self, id: &BlobId) -> Result<bool, Error> {
        Ok(self
            .read_properties(id)
            .await?
            .is_some_and(|properties| properties.is_live()))
    }

    #[instrument(skip(self), fields(blob.id = %id))]
    async fn exists_including_deleted(&self, id: &BlobId) -> Result<bool, Error> {
        Ok(self.read_properties(id).await?.is_some())
    }

    #[instrument(skip(self), fields(blob.id = %id))]
    async fn delete(&self, id: &BlobId, reason: &str) -> Result<bool, Error> {
        match self.read_properties(id).await? {
            Some(mut properties) if properties.is_live() => {
                properties.deleted_reason = Some(reason.to_string());
                self.write_properties(id, &properties).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    #[instrument(skip(self), fields(blob.id = %id))]
    async fn delete_hard(&self, id: &BlobId) -> Result<bool, Error> {
        let Some((bytes_path, properties_path)) = derive_paths(&self.path, id) else {
            return Ok(false);
        };

        let deleted = match tokio::fs::remove_file(&properties_path).await {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        match tokio::fs::remove_file(&bytes_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(deleted)
    }

    fn blob_id_stream(&self) -> BoxStream<'static, Result<BlobId, Error>> {
        let content = self.path.join("content");
        Box::pin(try_stream! {
            let mut shards = tokio::fs::read_dir(&content).await.map_err(Error::from)?;
            while let Some(shard) = shards.next_entry().await.map_err(Error::from)? {
                if !shard.file_type().await.map_err(Error::from)?.is_dir() {
                    continue;
                }

                let mut entries = tokio::fs::read_dir(shard.path()).await.map_err(Error::from)?;
                while let Some(entry) = entries.next_entry().await.map_err(Error::from)? {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some(PROPERTIES_EXTENSION) {
                        continue;
                    }
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        yield BlobId::new(stem);
                    }
                }
            }
        })
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

        match self.read_properties(blob.id()).await? {
            Some(mut properties) if properties.is_live() => {
                properties.headers = headers;
                self.write_properties(blob.id(), &properties).await?;
                Ok(self.to_blob(blob.id(), properties))
            }
            _ => Err(Error::NotFound(blob.id().clone())),
        }
    }

    #[instrument(skip_all, fields(blob.id = %blob.id()))]
    async fn delete_if_temp(&self, blob: &Blob) -> Result<bool, Error> {
        match self.read_properties(blob.id()).await? {
            Some(properties) if is_temporary(&properties.headers) => {
                self.delete_hard(blob.id()).await
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

#[derive(serde::Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct SimpleFilesystemBlobStoreConfig {
    path: PathBuf,
    /// Start out read-only.
    #[serde(default)]
    read_only: bool,
}

impl TryFrom<url::Url> for SimpleFilesystemBlobStoreConfig {
    type Error = Box<dyn std::error::Error + Send + Sync>;
    fn try_from(url: url::Url) -> Result<Self, Self::Error> {
        // a path must be provided, but no host.
        if url.has_host() {
            return Err(Error::StorageError("no host allowed".to_string()).into());
        }
        if url.path().is_empty() || url.path() == "/" {
            return Err(Error::StorageError(
                "cowardly refusing to use / as blob store path".to_string(),
            )
            .into());
        }

        Ok(SimpleFilesystemBlobStoreConfig {
            path: PathBuf::from(url.path()),
            read_only: false,
        })
    }
}

#[async_trait]
impl ServiceBuilder for SimpleFilesystemBlobStoreConfig {
    type Output = dyn BlobStore;
    async fn build(
        &self,
        instance_name: &str,
        _context: &CompositionContext<dyn BlobStore>,
    ) -> Result<Arc<dyn BlobStore>, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let store = SimpleFilesystemBlobStore::new(instance_name, self.path.clone()).await?;
        store.set_writable(!self.read_only);
        Ok(Arc::new(store))
    }
}
