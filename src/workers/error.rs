use crate::infrastructure::queue::QueueError;
use crate::infrastructure::storage::StorageError;
use crate::modules::transcoding::repository::StoreError;
use thiserror::Error;

/// Why a transcoding job did not complete.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Failed to download source: {0}")]
    Download(StorageError),

    #[error("Encoding {resolution} failed: {message}")]
    Encode { resolution: String, message: String },

    #[error("Failed to upload renditions: {0}")]
    Upload(StorageError),

    #[error("Master playlist missing from uploaded files")]
    ManifestMissing,

    #[error("Job has no source url")]
    MissingSource,

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Broker error: {0}")]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    /// Text persisted on the job row when it is marked FAILED.
    pub fn error_info(&self) -> String {
        format!("Error processing video. {}", self)
    }
}
