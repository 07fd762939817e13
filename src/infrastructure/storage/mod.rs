pub mod cdn;
pub mod s3;

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

pub use cdn::CloudFrontInvalidator;
pub use s3::{StorageService, StorageSettings};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("S3 error: {0}")]
    S3(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("CDN invalidation failed: {0}")]
    Cdn(String),

    #[error("Stream interrupted: {0}")]
    Stream(String),

    #[error("Payload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Location of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub url: String,
    pub key: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub url: String,
    pub key: String,
    pub file_name: String,
}

/// Object storage as seen by the transcoding worker.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Streams `url` to `dest`, returning the number of bytes written.
    async fn download_to_file(&self, url: &str, dest: &Path) -> StorageResult<u64>;

    /// Uploads every file under `dir` to `<prefix>/<relative path>`.
    async fn upload_folder(&self, dir: &Path, prefix: &str) -> StorageResult<Vec<UploadedFile>>;

    async fn delete(&self, key: &str) -> StorageResult<()>;
}

#[async_trait]
pub trait CdnInvalidator: Send + Sync {
    async fn invalidate(&self, key: &str) -> StorageResult<()>;
}
