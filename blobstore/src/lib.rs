mod blob;
mod configuration;
mod errors;
mod hashing_reader;

pub mod blobstore;
pub mod composition;
pub mod fixtures;
pub mod metrics;

pub use blob::{
    is_temporary, Blob, BlobContent, BlobHeaders, BlobId, BlobMetrics, BlobReader,
    BLOB_NAME_HEADER, CONTENT_TYPE_HEADER, CREATED_BY_HEADER, TEMPORARY_BLOB_HEADER,
};
pub use configuration::{
    BlobStoreConfiguration, GroupConfiguration, GROUP_FILL_POLICY_KEY, GROUP_MEMBERS_KEY,
    GROUP_SECTION,
};
pub use errors::Error;
pub use hashing_reader::B3HashingReader;

// rstest_reuse's #[apply] expects the crate in scope at the crate root.
#[cfg(test)]
#[allow(clippy::single_component_path_imports)]
use rstest_reuse;
