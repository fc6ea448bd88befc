//! This contains test scenarios that a given [BlobStore] needs to pass.
//! We use [rstest] and [rstest_reuse] to provide all stores we want to test
//! against, and then apply this template to all test functions.

use std::io;

use futures::TryStreamExt;
use rstest::*;
use rstest_reuse::{self, *};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::BlobStore;
use crate::blobstore;
use crate::fixtures::{
    BLOB_A, BLOB_A_DIGEST, BLOB_B, BLOB_B_DIGEST, PERMANENT_HEADERS, TEMPORARY_HEADERS,
};
use crate::metrics::OperationType;
use crate::{Blob, BlobId, Error, BLOB_NAME_HEADER};

mod utils;
use self::utils::{make_filesystem_blob_store, make_group_blob_store};

/// This produces a template, which will be applied to all individual test functions.
/// See https://github.com/la10736/rstest/issues/130#issuecomment-968864832
#[template]
#[rstest]
#[case::memory(blobstore::from_addr("memory://").await.unwrap())]
#[case::filesystem(make_filesystem_blob_store().await)]
#[case::group_write_to_first(make_group_blob_store("writeToFirst").await)]
#[case::group_round_robin(make_group_blob_store("roundRobin").await)]
pub fn blob_stores(#[case] blob_store: impl BlobStore) {}

async fn read_all(blob: &Blob) -> Vec<u8> {
    let mut buf = Vec::new();
    blob.open_read()
        .await
        .expect("open_read must succeed")
        .read_to_end(&mut buf)
        .await
        .expect("read must succeed");
    buf
}

/// Nothing is found in an empty store, and absence is not an error.
#[apply(blob_stores)]
#[tokio::test]
async fn not_found(blob_store: impl BlobStore) {
    let id = BlobId::random();

    assert!(blob_store.get(&id, false).await.expect("must not fail").is_none());
    assert!(blob_store.get(&id, true).await.expect("must not fail").is_none());
    assert!(!blob_store.exists(&id).await.expect("must not fail"));
    assert!(!blob_store.delete(&id, "test").await.expect("must not fail"));
    assert!(!blob_store.delete_hard(&id).await.expect("must not fail"));
}

/// Create a blob, check exists, get it back.
#[apply(blob_stores)]
#[tokio::test]
async fn create_exists_get(blob_store: impl BlobStore) {
    for (blob_contents, blob_digest) in [
        (&*BLOB_A, &*BLOB_A_DIGEST),
        (&*BLOB_B, &*BLOB_B_DIGEST),
    ] {
        let blob = blob_store
            .create(
                &mut io::Cursor::new(blob_contents.to_vec()),
                PERMANENT_HEADERS.clone(),
            )
            .await
            .expect("create must succeed");

        assert_eq!(blob_contents.len() as u64, blob.metrics().size);
        assert_eq!(blob_digest, &blob.metrics().b3_digest);
        assert!(!blob.is_deleted());

        assert!(
            blob_store.exists(blob.id()).await.expect("must not fail"),
            "blob store should now have the blob"
        );

        let got = blob_store
            .get(blob.id(), false)
            .await
            .expect("get must succeed")
            .expect("must be some");
        assert_eq!(blob.id(), got.id());
        assert_eq!(
            PERMANENT_HEADERS.get(BLOB_NAME_HEADER),
            got.headers().get(BLOB_NAME_HEADER)
        );
        assert_eq!(
            &blob_contents[..],
            &read_all(&got).await,
            "read blob contents must match"
        );
    }
}

/// Create a blob, and seek inside it a bit.
#[apply(blob_stores)]
#[tokio::test]
async fn create_seek(blob_store: impl BlobStore) {
    let blob = blob_store
        .create(&mut io::Cursor::new(BLOB_B.to_vec()), PERMANENT_HEADERS.clone())
        .await
        .expect("create must succeed");

    let mut r = blob.open_read().await.expect("open_read must succeed");

    let mut buf = [0; 10];
    r.read_exact(&mut buf).await.expect("must succeed");
    assert_eq!(&BLOB_B[..10], buf, "expected first 10 bytes to match");

    let p = r
        .seek(io::SeekFrom::Current(12345))
        .await
        .expect("must not fail");
    assert_eq!(12355, p);

    r.read_exact(&mut buf).await.expect("must succeed");
    assert_eq!(&BLOB_B[12355..12365], buf, "expected data to match");

    // seeking past the end is allowed, reading there yields nothing.
    let p = r
        .seek(io::SeekFrom::End(100))
        .await
        .expect("must not fail");
    assert_eq!(BLOB_B.len() as u64 + 100, p);
    assert_eq!(0, r.read(&mut buf).await.expect("must not fail"));
}

/// Store an existing file as blob.
#[apply(blob_stores)]
#[tokio::test]
async fn create_from_path(blob_store: impl BlobStore) {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("upload");
    tokio::fs::write(&path, &*BLOB_B).await.unwrap();

    let blob = blob_store
        .create_from_path(
            &path,
            PERMANENT_HEADERS.clone(),
            BLOB_B.len() as u64,
            &BLOB_B_DIGEST,
        )
        .await
        .expect("create_from_path must succeed");
    assert_eq!(&BLOB_B[..], &read_all(&blob).await);

    // the size must match.
    assert!(blob_store
        .create_from_path(&path, PERMANENT_HEADERS.clone(), 1, &BLOB_B_DIGEST)
        .await
        .is_err());
}

/// Soft-deleted blobs are hidden unless asked for, and can still be purged.
#[apply(blob_stores)]
#[tokio::test]
async fn soft_and_hard_delete(blob_store: impl BlobStore) {
    let blob = blob_store
        .create(&mut io::Cursor::new(BLOB_A.to_vec()), PERMANENT_HEADERS.clone())
        .await
        .expect("create must succeed");
    let id = blob.id();

    assert!(blob_store.delete(id, "superseded").await.expect("must not fail"));
    assert!(!blob_store.exists(id).await.expect("must not fail"));
    assert!(blob_store.get(id, false).await.expect("must not fail").is_none());

    let deleted = blob_store
        .get(id, true)
        .await
        .expect("must not fail")
        .expect("must be some");
    assert!(deleted.is_deleted());

    // only live blobs can be soft-deleted.
    assert!(!blob_store.delete(id, "again").await.expect("must not fail"));

    assert!(blob_store.delete_hard(id).await.expect("must not fail"));
    assert!(blob_store.get(id, true).await.expect("must not fail").is_none());
}

/// Soft-deleted blobs are still held. Checking for them is not a download.
#[apply(blob_stores)]
#[tokio::test]
async fn exists_including_deleted(blob_store: impl BlobStore) {
    let blob = blob_store
        .create(&mut io::Cursor::new(BLOB_A.to_vec()), PERMANENT_HEADERS.clone())
        .await
        .expect("create must succeed");
    let id = blob.id();
    assert!(blob_store.delete(id, "superseded").await.expect("must not fail"));
    let _ = blob_store.operation_metrics_delta();

    assert!(!blob_store.exists(id).await.expect("must not fail"));
    assert!(blob_store
        .exists_including_deleted(id)
        .await
        .expect("must not fail"));

    assert!(blob_store.delete_hard(id).await.expect("must not fail"));
    assert!(!blob_store
        .exists_including_deleted(id)
        .await
        .expect("must not fail"));

    let delta = blob_store.operation_metrics_delta();
    assert_eq!(0, delta[&OperationType::Download].successful_requests);
    assert_eq!(0, delta[&OperationType::Download].blob_size);
}

/// Temporary blobs are promoted in place.
#[apply(blob_stores)]
#[tokio::test]
async fn make_blob_permanent(blob_store: impl BlobStore) {
    let blob = blob_store
        .create(&mut io::Cursor::new(BLOB_A.to_vec()), TEMPORARY_HEADERS.clone())
        .await
        .expect("create must succeed");
    assert!(blob.is_temporary());
    assert!(blob_store.is_owner(&blob).await.expect("must not fail"));

    let promoted = blob_store
        .make_blob_permanent(&blob, TEMPORARY_HEADERS.clone())
        .await
        .expect("must succeed");
    assert_eq!(blob.id(), promoted.id());
    assert!(!promoted.is_temporary());

    // permanent blobs survive delete_if_temp.
    assert!(!blob_store.delete_if_temp(&promoted).await.expect("must not fail"));
    assert!(blob_store.exists(blob.id()).await.expect("must not fail"));

    assert!(blob_store.delete_hard(blob.id()).await.expect("must not fail"));
    assert!(matches!(
        blob_store.make_blob_permanent(&blob, PERMANENT_HEADERS.clone()).await,
        Err(Error::NotFound(_))
    ));
}

#[apply(blob_stores)]
#[tokio::test]
async fn delete_if_temp(blob_store: impl BlobStore) {
    let blob = blob_store
        .create(&mut io::Cursor::new(BLOB_A.to_vec()), TEMPORARY_HEADERS.clone())
        .await
        .expect("create must succeed");

    assert!(blob_store.delete_if_temp(&blob).await.expect("must not fail"));
    assert!(blob_store.get(blob.id(), true).await.expect("must not fail").is_none());
    assert!(!blob_store.delete_if_temp(&blob).await.expect("must not fail"));
}

#[apply(blob_stores)]
#[tokio::test]
async fn copy(blob_store: impl BlobStore) {
    let blob = blob_store
        .create(&mut io::Cursor::new(BLOB_A.to_vec()), PERMANENT_HEADERS.clone())
        .await
        .expect("create must succeed");

    let copied = blob_store
        .copy(blob.id(), TEMPORARY_HEADERS.clone())
        .await
        .expect("copy must succeed");
    assert_ne!(blob.id(), copied.id());
    assert_eq!(blob.metrics().b3_digest, copied.metrics().b3_digest);
    assert!(copied.is_temporary());
    assert_eq!(&BLOB_A[..], &read_all(&copied).await);

    assert!(matches!(
        blob_store.copy(&BlobId::random(), PERMANENT_HEADERS.clone()).await,
        Err(Error::NotFound(_))
    ));
}

/// All ids are listed, soft-deleted ones included.
#[apply(blob_stores)]
#[tokio::test]
async fn blob_id_stream(blob_store: impl BlobStore) {
    let mut expected = Vec::new();
    for contents in [&*BLOB_A, &*BLOB_B] {
        let blob = blob_store
            .create(&mut io::Cursor::new(contents.to_vec()), PERMANENT_HEADERS.clone())
            .await
            .expect("create must succeed");
        expected.push(blob.id().clone());
    }
    assert!(blob_store.delete(&expected[0], "test").await.expect("must not fail"));

    let mut ids: Vec<BlobId> = blob_store
        .blob_id_stream()
        .try_collect()
        .await
        .expect("must not fail");
    ids.sort();
    expected.sort();
    assert_eq!(expected, ids);
}

#[apply(blob_stores)]
#[tokio::test]
async fn operation_metrics(blob_store: impl BlobStore) {
    // start from a clean slate.
    let _ = blob_store.operation_metrics_delta();

    let blob = blob_store
        .create(&mut io::Cursor::new(BLOB_B.to_vec()), PERMANENT_HEADERS.clone())
        .await
        .expect("create must succeed");
    blob_store
        .get(blob.id(), false)
        .await
        .expect("must not fail")
        .expect("must be some");

    let delta = blob_store.operation_metrics_delta();
    let uploads = &delta[&OperationType::Upload];
    assert_eq!(1, uploads.successful_requests);
    assert_eq!(BLOB_B.len() as u64, uploads.blob_size);
    let downloads = &delta[&OperationType::Download];
    assert_eq!(1, downloads.successful_requests);
    assert_eq!(BLOB_B.len() as u64, downloads.blob_size);

    let delta = blob_store.operation_metrics_delta();
    assert_eq!(0, delta[&OperationType::Upload].successful_requests);
}

#[apply(blob_stores)]
#[tokio::test]
async fn writable(blob_store: impl BlobStore) {
    assert!(blob_store.is_writable());
}
