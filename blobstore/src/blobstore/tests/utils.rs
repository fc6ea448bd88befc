use std::collections::HashMap;
use std::sync::Arc;

use tempfile::TempDir;

use crate::blobstore::{BlobStore, SimpleFilesystemBlobStore};
use crate::composition::{with_registry, Composition, DeserializeWithRegistry, ServiceBuilder, REG};

/// A blob store living in a temporary directory, removed on drop.
pub struct TempDirBlobStore {
    store: Arc<dyn BlobStore>,
    _dir: TempDir,
}

impl AsRef<dyn BlobStore> for TempDirBlobStore {
    fn as_ref(&self) -> &(dyn BlobStore + 'static) {
        self.store.as_ref()
    }
}

pub async fn make_filesystem_blob_store() -> TempDirBlobStore {
    let dir = TempDir::new().unwrap();
    let store = SimpleFilesystemBlobStore::new("filesystem", dir.path().join("blobs"))
        .await
        .unwrap();

    TempDirBlobStore {
        store: Arc::new(store),
        _dir: dir,
    }
}

/// Constructs a group of two memory stores, through a composition.
pub async fn make_group_blob_store(fill_policy: &str) -> Arc<dyn BlobStore> {
    let configs: HashMap<
        String,
        DeserializeWithRegistry<Box<dyn ServiceBuilder<Output = dyn BlobStore>>>,
    > = with_registry(&REG, || {
        serde_json::from_value(serde_json::json!({
            "one": { "type": "memory" },
            "two": { "type": "memory" },
            "default": {
                "type": "group",
                "members": ["one", "two"],
                "fill_policy": fill_policy,
            }
        }))
    })
    .unwrap();

    Composition::<dyn BlobStore>::from_configs(configs)
        .build("default")
        .await
        .unwrap()
}
