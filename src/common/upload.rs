use crate::infrastructure::storage::{StorageError, StorageResult, StorageService, StoredObject};
use aws_sdk_s3::types::CompletedPart;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tracing::{error, warn};

// Minimum part size for S3 is 5MB. We use 6MB to be safe.
const MIN_PART_SIZE: usize = 6 * 1024 * 1024;

pub struct MultipartUploader<'a> {
    storage: &'a StorageService,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
    part_number: i32,
    buffer: BytesMut,
    bytes_written: u64,
}

impl<'a> MultipartUploader<'a> {
    pub async fn new(storage: &'a StorageService, key: String, content_type: &str) -> StorageResult<Self> {
        let upload_id = storage.create_multipart_upload(&key, content_type).await?;

        Ok(Self {
            storage,
            key,
            upload_id,
            parts: Vec::new(),
            part_number: 1,
            buffer: BytesMut::with_capacity(MIN_PART_SIZE),
            bytes_written: 0,
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub async fn write_chunk(&mut self, chunk: Bytes) -> StorageResult<()> {
        self.bytes_written += chunk.len() as u64;
        self.buffer.extend_from_slice(&chunk);

        if self.buffer.len() >= MIN_PART_SIZE {
            self.flush_part().await?;
        }

        Ok(())
    }

    async fn flush_part(&mut self) -> StorageResult<()> {
        let body = self.buffer.split().freeze();
        self.buffer.reserve(MIN_PART_SIZE);

        let part = self
            .storage
            .upload_part(&self.key, &self.upload_id, self.part_number, body)
            .await?;

        self.parts.push(part);
        self.part_number += 1;

        Ok(())
    }

    pub async fn finish(mut self) -> StorageResult<StoredObject> {
        // An empty object still needs one (empty) part.
        if !self.buffer.is_empty() || self.parts.is_empty() {
            self.flush_part().await?;
        }

        self.storage
            .complete_multipart_upload(&self.key, &self.upload_id, self.parts)
            .await?;

        Ok(StoredObject {
            url: self.storage.public_url(&self.key),
            key: self.key,
            size: self.bytes_written,
        })
    }

    pub async fn abort(&self) {
        if let Err(e) = self
            .storage
            .abort_multipart_upload(&self.key, &self.upload_id)
            .await
        {
            warn!("Failed to abort upload of {}: {}", self.key, e);
        }
    }
}

/// Streams `body` into `key` without buffering more than one part, aborting
/// the multipart upload on any error. `max_bytes` caps the accepted size.
pub async fn upload_stream<S, E>(
    storage: &StorageService,
    body: S,
    key: String,
    content_type: &str,
    max_bytes: Option<u64>,
) -> StorageResult<StoredObject>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut uploader = MultipartUploader::new(storage, key, content_type).await?;

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                error!("Stream error: {}", e);
                uploader.abort().await;
                return Err(StorageError::Stream(e.to_string()));
            }
        };

        if let Some(limit) = max_bytes {
            if uploader.bytes_written() + chunk.len() as u64 > limit {
                uploader.abort().await;
                return Err(StorageError::PayloadTooLarge { limit });
            }
        }

        if let Err(e) = uploader.write_chunk(chunk).await {
            error!("Upload error: {}", e);
            uploader.abort().await;
            return Err(e);
        }
    }

    uploader.finish().await
}
