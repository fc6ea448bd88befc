use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::io::AsyncRead;

use crate::composition::{Registry, ServiceBuilder};
use crate::metrics::OperationMetricsDelta;
use crate::{Blob, BlobHeaders, BlobId, BlobStoreConfiguration, Error};

mod from_addr;
mod group;
mod memory;
mod simplefs;

#[cfg(test)]
mod tests;

pub use self::from_addr::from_addr;
pub use self::group::{
    BlobStoreGroup, BlobStoreGroupConfig, LocationCache, Member, PlacementPolicy,
    PolicyFactory, PolicyRegistry, RoundRobinPolicy, WriteToFirstPolicy,
    DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL, DEFAULT_FILL_POLICY,
};
pub use self::memory::{MemoryBlobStore, MemoryBlobStoreConfig};
pub use self::simplefs::{SimpleFilesystemBlobStore, SimpleFilesystemBlobStoreConfig};

/// The contract every blob store implements, physical backends and groups of
/// them alike.
///
/// Absence is never an error: reads return `Ok(None)`, checks and deletions
/// `Ok(false)`. Errors are backend failures.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Makes the store servable. Stores without a lifecycle of their own
    /// are always servable.
    async fn start(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Releases resources. Stores without a lifecycle of their own ignore this.
    async fn stop(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Stores the contents of the reader as a new blob.
    async fn create(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        headers: BlobHeaders,
    ) -> Result<Blob, Error>;

    /// Stores an existing file as a new blob. The caller vouches for size and
    /// BLAKE3 digest (lower hex) of the file, a size mismatch is rejected.
    async fn create_from_path(
        &self,
        path: &Path,
        headers: BlobHeaders,
        size: u64,
        b3_digest: &str,
    ) -> Result<Blob, Error>;

    /// Duplicates an existing blob inside this store, under a new id.
    async fn copy(&self, id: &BlobId, headers: BlobHeaders) -> Result<Blob, Error>;

    /// Returns the blob, or None if not present. Soft-deleted blobs are only
    /// returned if `include_deleted` is set.
    async fn get(&self, id: &BlobId, include_deleted: bool) -> Result<Option<Blob>, Error>;

    /// Checks for a live (not soft-deleted) blob.
    async fn exists(&self, id: &BlobId) -> Result<bool, Error>;

    /// Checks for a blob, soft-deleted or not. Unlike [BlobStore::get], this
    /// is not counted as a download.
    async fn exists_including_deleted(&self, id: &BlobId) -> Result<bool, Error>;

    /// Soft-deletes a blob, recording the reason. Returns true iff a live blob
    /// was deleted.
    async fn delete(&self, id: &BlobId, reason: &str) -> Result<bool, Error>;

    /// Purges a blob, soft-deleted or not. Returns true iff something was
    /// purged.
    async fn delete_hard(&self, id: &BlobId) -> Result<bool, Error>;

    /// Lists the ids of all blobs stored, soft-deleted ones included, in
    /// backend order.
    fn blob_id_stream(&self) -> BoxStream<'static, Result<BlobId, Error>>;

    /// Whether this store holds the blob and can promote it in place.
    async fn is_owner(&self, blob: &Blob) -> Result<bool, Error>;

    /// Promotes a temporary blob in place, replacing its headers. Never
    /// copies content.
    async fn make_blob_permanent(&self, blob: &Blob, headers: BlobHeaders)
        -> Result<Blob, Error>;

    /// Purges the blob if it's temporary. Returns true iff it was.
    async fn delete_if_temp(&self, blob: &Blob) -> Result<bool, Error>;

    /// Whether the store currently accepts new blobs.
    fn is_writable(&self) -> bool;

    /// Counters accumulated since the previous call.
    fn operation_metrics_delta(&self) -> OperationMetricsDelta;

    fn configuration(&self) -> &BlobStoreConfiguration;
}

#[async_trait]
impl<A> BlobStore for A
where
    A: AsRef<dyn BlobStore> + Send + Sync,
{
    async fn start(&self) -> Result<(), Error> {
        self.as_ref().start().await
    }

    async fn stop(&self) -> Result<(), Error> {
        self.as_ref().stop().await
    }

    async fn create(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        headers: BlobHeaders,
    ) -> Result<Blob, Error> {
        self.as_ref().create(reader, headers).await
    }

    async fn create_from_path(
        &self,
        path: &Path,
        headers: BlobHeaders,
        size: u64,
        b3_digest: &str,
    ) -> Result<Blob, Error> {
        self.as_ref()
            .create_from_path(path, headers, size, b3_digest)
            .await
    }

    async fn copy(&self, id: &BlobId, headers: BlobHeaders) -> Result<Blob, Error> {
        self.as_ref().copy(id, headers).await
    }

    async fn get(&self, id: &BlobId, include_deleted: bool) -> Result<Option<Blob>, Error> {
        self.as_ref().get(id, include_deleted).await
    }

    async fn exists(&self, id: &BlobId) -> Result<bool, Error> {
        self.as_ref().exists(id).await
    }

    async fn exists_including_deleted(&self, id: &BlobId) -> Result<bool, Error> {
        self.as_ref().exists_including_deleted(id).await
    }

    async fn delete(&self, id: &BlobId, reason: &str) -> Result<bool, Error> {
        self.as_ref().delete(id, reason).await
    }

    async fn delete_hard(&self, id: &BlobId) -> Result<bool, Error> {
        self.as_ref().delete_hard(id).await
    }

    fn blob_id_stream(&self) -> BoxStream<'static, Result<BlobId, Error>> {
        self.as_ref().blob_id_stream()
    }

    async fn is_owner(&self, blob: &Blob) -> Result<bool, Error> {
        self.as_ref().is_owner(blob).await
    }

    async fn make_blob_permanent(
        &self,
        blob: &Blob,
        headers: BlobHeaders,
    ) -> Result<Blob, Error> {
        self.as_ref().make_blob_permanent(blob, headers).await
    }

    async fn delete_if_temp(&self, blob: &Blob) -> Result<bool, Error> {
        self.as_ref().delete_if_temp(blob).await
    }

    fn is_writable(&self) -> bool {
        self.as_ref().is_writable()
    }

    fn operation_metrics_delta(&self) -> OperationMetricsDelta {
        self.as_ref().operation_metrics_delta()
    }

    fn configuration(&self) -> &BlobStoreConfiguration {
        self.as_ref().configuration()
    }
}

/// Resolves configured member names to running blob stores.
#[async_trait]
pub trait MemberRegistry: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Arc<dyn BlobStore>, Error>;
}

/// A fixed set of named stores.
#[async_trait]
impl MemberRegistry for std::collections::BTreeMap<String, Arc<dyn BlobStore>> {
    async fn resolve(&self, name: &str) -> Result<Arc<dyn BlobStore>, Error> {
        self.get(name)
            .cloned()
            .ok_or_else(|| Error::InvalidRequest(format!("unknown blob store {}", name)))
    }
}

/// Registers the builtin BlobStore implementations with the registry.
pub(crate) fn register_blob_stores(reg: &mut Registry) {
    reg.register::<Box<dyn ServiceBuilder<Output = dyn BlobStore>>, MemoryBlobStoreConfig>(
        "memory",
    );
    reg.register::<
        Box<dyn ServiceBuilder<Output = dyn BlobStore>>,
        SimpleFilesystemBlobStoreConfig,
    >("filesystem");
    reg.register::<Box<dyn ServiceBuilder<Output = dyn BlobStore>>, BlobStoreGroupConfig>("group");
}
