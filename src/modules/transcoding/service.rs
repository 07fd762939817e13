use super::model::{Job, JobPatch, NewJob};
use super::repository::StoreError;
use crate::common::mime::{file_extension_for, is_allowed_video_type};
use crate::common::response::ApiError;
use crate::common::upload::upload_stream;
use crate::infrastructure::queue::channel::DEFAULT_ROUTING_KEY;
use crate::infrastructure::queue::QueueError;
use crate::infrastructure::storage::StorageError;
use crate::state::AppState;
use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::Stream;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{0}")]
    Validation(String),

    #[error("File exceeds the maximum upload size of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl From<StorageError> for IngestError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::PayloadTooLarge { limit } => IngestError::PayloadTooLarge { limit },
            other => IngestError::Storage(other),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        let status = match &e {
            IngestError::Validation(_) => StatusCode::BAD_REQUEST,
            IngestError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            IngestError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(e.to_string(), status)
    }
}

pub struct TranscodingService;

impl TranscodingService {
    /// Records a new job, streams `body` into storage and queues the job
    /// for transcoding. Any failure after the job exists marks it FAILED.
    pub async fn ingest<S, E>(
        state: &AppState,
        body: S,
        file_name: Option<String>,
        mime_type: Option<String>,
    ) -> Result<Job, IngestError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: std::fmt::Display,
    {
        let job = state.jobs.create(NewJob { file_name, mime_type }).await?;
        info!(job_id = %job.id, "Created job for {:?}", job.file_name);

        match Self::store_and_enqueue(state, &job, body).await {
            Ok(job) => Ok(job),
            Err(e) => {
                error!(job_id = %job.id, "Ingest failed: {}", e);
                if let Err(store_error) = state.jobs.update(job.id, JobPatch::failed(e.to_string())).await {
                    error!(job_id = %job.id, "Failed to mark job as FAILED: {}", store_error);
                }
                Err(e)
            }
        }
    }

    async fn store_and_enqueue<S, E>(state: &AppState, job: &Job, body: S) -> Result<Job, IngestError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: std::fmt::Display,
    {
        let mime_type = job.mime_type.as_deref().unwrap_or_default();
        if !is_allowed_video_type(mime_type) {
            return Err(IngestError::Validation(format!(
                "Unsupported video type '{}'",
                mime_type
            )));
        }

        let key = format!("sources/{}{}", job.id, file_extension_for(mime_type));
        let stored = upload_stream(
            &state.storage,
            body,
            key,
            mime_type,
            Some(state.config.max_upload_bytes),
        )
        .await?;
        info!(job_id = %job.id, "⬆️ Stored {} bytes at {}", stored.size, stored.key);

        let size = i64::try_from(stored.size).unwrap_or(i64::MAX);
        let job = state
            .jobs
            .update(job.id, JobPatch::processing(stored.key, stored.url, size))
            .await?;

        let payload = serde_json::to_vec(&job).map_err(QueueError::from)?;
        let message_id = state.publisher.publish_task(&payload, DEFAULT_ROUTING_KEY).await?;
        info!(job_id = %job.id, message_id = %message_id, "Queued job for transcoding");

        Ok(job)
    }

    pub async fn get_job(state: &AppState, id: Uuid) -> Result<Job, IngestError> {
        state
            .jobs
            .get(id)
            .await?
            .ok_or(IngestError::Store(StoreError::NotFound(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::transcoding::model::JobStatus;
    use crate::state::testing::test_state;

    fn body(data: &'static [u8]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
        futures_util::stream::iter(vec![Ok(Bytes::from_static(data))])
    }

    #[tokio::test]
    async fn unsupported_type_fails_job_without_queueing() {
        let t = test_state().await;

        let err = TranscodingService::ingest(
            &t.state,
            body(b"%PDF"),
            Some("notes.pdf".into()),
            Some("application/pdf".into()),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, IngestError::Validation(_)));
        assert_eq!(ApiError::from(err).1, StatusCode::BAD_REQUEST);

        let published = t.broker.channel().published();
        assert!(published.is_empty());
    }

    #[tokio::test]
    async fn failed_ingest_leaves_job_failed() {
        let t = test_state().await;

        let _ = TranscodingService::ingest(&t.state, body(b""), None, None).await;

        let jobs: Vec<_> = t.jobs.all();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(jobs[0].error_info.as_deref().unwrap().contains("Unsupported video type"));
        assert_eq!(
            t.jobs.history(jobs[0].id),
            vec![JobStatus::Uploading, JobStatus::Failed]
        );
    }

    #[tokio::test]
    async fn get_job_reports_missing_job() {
        let t = test_state().await;
        let err = TranscodingService::get_job(&t.state, Uuid::new_v4()).await.unwrap_err();
        assert_eq!(ApiError::from(err).1, StatusCode::NOT_FOUND);
    }

    #[test]
    fn oversized_upload_maps_to_413() {
        let err = IngestError::from(StorageError::PayloadTooLarge { limit: 10 });
        assert_eq!(ApiError::from(err).1, StatusCode::PAYLOAD_TOO_LARGE);
    }
}
