use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Header carrying the logical (repository-side) name of a blob.
pub const BLOB_NAME_HEADER: &str = "BlobStore.blob-name";

/// Header naming the principal that created a blob.
pub const CREATED_BY_HEADER: &str = "BlobStore.created-by";

pub const CONTENT_TYPE_HEADER: &str = "BlobStore.content-type";

/// Marks a blob as temporary. Temporary blobs are either promoted with
/// [crate::blobstore::BlobStore::make_blob_permanent], or cleaned up with
/// [crate::blobstore::BlobStore::delete_if_temp].
pub const TEMPORARY_BLOB_HEADER: &str = "BlobStore.temporary-blob";

pub type BlobHeaders = BTreeMap<String, String>;

/// Returns true if the headers mark a temporary blob.
pub fn is_temporary(headers: &BlobHeaders) -> bool {
    headers.contains_key(TEMPORARY_BLOB_HEADER)
}

/// Opaque identifier of a blob. Compared and hashed by value, no internal
/// structure is assumed.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(String);

impl BlobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mints a fresh, random id. Used by backends when creating blobs.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BlobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for BlobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for BlobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for BlobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "blob:{}", self.0)
    }
}

/// Size and content digest of a stored blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetrics {
    pub size: u64,
    /// BLAKE3 digest of the contents, lower hex.
    pub b3_digest: String,
    pub created: SystemTime,
}

/// Where the contents of a [Blob] can be read from.
#[derive(Clone)]
pub enum BlobContent {
    Memory(Bytes),
    File(PathBuf),
}

/// A handle to a stored blob, as returned by a blob store.
/// The store that created it owns it; groups only forward it.
#[derive(Clone)]
pub struct Blob {
    id: BlobId,
    headers: BlobHeaders,
    metrics: BlobMetrics,
    deleted: bool,
    content: BlobContent,
}

impl Blob {
    pub fn new(
        id: BlobId,
        headers: BlobHeaders,
        metrics: BlobMetrics,
        deleted: bool,
        content: BlobContent,
    ) -> Self {
        Self {
            id,
            headers,
            metrics,
            deleted,
            content,
        }
    }

    pub fn id(&self) -> &BlobId {
        &self.id
    }

    pub fn headers(&self) -> &BlobHeaders {
        &self.headers
    }

    pub fn metrics(&self) -> &BlobMetrics {
        &self.metrics
    }

    /// Whether the blob was soft-deleted. Only returned by reads including
    /// deleted blobs.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_temporary(&self) -> bool {
        is_temporary(&self.headers)
    }

    /// Opens the contents for reading.
    pub async fn open_read(&self) -> io::Result<Box<dyn BlobReader>> {
        match &self.content {
            BlobContent::Memory(bytes) => Ok(Box::new(io::Cursor::new(bytes.clone()))),
            BlobContent::File(path) => Ok(Box::new(tokio::fs::File::open(path).await?)),
        }
    }
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("id", &self.id)
            .field("headers", &self.headers)
            .field("metrics", &self.metrics)
            .field("deleted", &self.deleted)
            .finish_non_exhaustive()
    }
}

/// BlobReader is a [tokio::io::AsyncRead] that also allows seeking.
pub trait BlobReader: tokio::io::AsyncRead + tokio::io::AsyncSeek + Send + Unpin + 'static {}

impl BlobReader for io::Cursor<&'static [u8]> {}
impl BlobReader for io::Cursor<Vec<u8>> {}
impl BlobReader for io::Cursor<Bytes> {}
impl BlobReader for tokio::fs::File {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_marker() {
        let mut headers = BlobHeaders::new();
        headers.insert(BLOB_NAME_HEADER.to_string(), "foo.jar".to_string());
        assert!(!is_temporary(&headers));

        headers.insert(TEMPORARY_BLOB_HEADER.to_string(), "true".to_string());
        assert!(is_temporary(&headers));
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(BlobId::random(), BlobId::random());
    }

    #[test]
    fn id_serializes_transparently() {
        let id = BlobId::from("abc");
        assert_eq!("\"abc\"", serde_json::to_string(&id).unwrap());
        assert_eq!("abc", id.to_string());
    }
}
