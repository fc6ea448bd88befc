use std::sync::Arc;

use url::Url;

use super::BlobStore;
use crate::composition::{
    with_registry, CompositionContext, DeserializeWithRegistry, ServiceBuilder, REG,
};
use crate::Error;

/// Constructs a new instance of a [BlobStore] from an URI.
///
/// The following schemes are supported:
/// - `memory://` ([super::MemoryBlobStore])
/// - `filesystem:///absolute/path` ([super::SimpleFilesystemBlobStore])
///
/// Groups refer to other named stores, so they can only be built from a
/// composition, see [crate::composition].
pub async fn from_addr(uri: &str) -> Result<Arc<dyn BlobStore>, Error> {
    let url =
        Url::parse(uri).map_err(|e| Error::StorageError(format!("unable to parse url: {}", e)))?;

    let config = with_registry(&REG, || {
        DeserializeWithRegistry::<Box<dyn ServiceBuilder<Output = dyn BlobStore>>>::try_from(url)
    })
    .map_err(|e| Error::StorageError(e.to_string()))?;

    config
        .0
        .build("anonymous", &CompositionContext::blank())
        .await
        .map_err(|e| Error::StorageError(e.to_string()))
}
