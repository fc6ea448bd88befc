use data_encoding::HEXLOWER;
use lazy_static::lazy_static;

use crate::{BlobHeaders, BLOB_NAME_HEADER, CREATED_BY_HEADER, TEMPORARY_BLOB_HEADER};

pub const HELLOWORLD_BLOB_CONTENTS: &[u8] = b"Hello World!";
pub const EMPTY_BLOB_CONTENTS: &[u8] = b"";

lazy_static! {
    pub static ref HELLOWORLD_BLOB_DIGEST: String =
        HEXLOWER.encode(blake3::hash(HELLOWORLD_BLOB_CONTENTS).as_bytes());
    pub static ref EMPTY_BLOB_DIGEST: String =
        HEXLOWER.encode(blake3::hash(EMPTY_BLOB_CONTENTS).as_bytes());

    // 2 bytes
    pub static ref BLOB_A: bytes::Bytes = vec![0x00, 0x01].into();
    pub static ref BLOB_A_DIGEST: String = HEXLOWER.encode(blake3::hash(&BLOB_A).as_bytes());

    // 1MB
    pub static ref BLOB_B: bytes::Bytes = (0..255).collect::<Vec<u8>>().repeat(4 * 1024).into();
    pub static ref BLOB_B_DIGEST: String = HEXLOWER.encode(blake3::hash(&BLOB_B).as_bytes());

    pub static ref PERMANENT_HEADERS: BlobHeaders = BlobHeaders::from([
        (BLOB_NAME_HEADER.to_string(), "org/example/foo/1.0/foo-1.0.jar".to_string()),
        (CREATED_BY_HEADER.to_string(), "admin".to_string()),
    ]);

    pub static ref TEMPORARY_HEADERS: BlobHeaders = {
        let mut headers = PERMANENT_HEADERS.clone();
        headers.insert(TEMPORARY_BLOB_HEADER.to_string(), "true".to_string());
        headers
    };
}
