use super::model::{Job, JobPatch, JobStatus, NewJob};
use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Job record persistence: create, get and partial update by id.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a job in `UPLOADING`.
    async fn create(&self, job: NewJob) -> Result<Job, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Applies `patch`, refusing status moves that would regress the job.
    async fn update(&self, id: Uuid, patch: JobPatch) -> Result<Job, StoreError>;
}

#[derive(Clone)]
pub struct JobRepository {
    pool: PgPool,
}

impl JobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for JobRepository {
    async fn create(&self, job: NewJob) -> Result<Job, StoreError> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (id, status, file_name, mime_type)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(JobStatus::Uploading.as_str())
        .bind(job.file_name)
        .bind(job.mime_type)
        .fetch_one(&self.pool)
        .await?;

        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    async fn update(&self, id: Uuid, patch: JobPatch) -> Result<Job, StoreError> {
        let next = patch.status;
        let predecessors: Option<Vec<String>> = next.map(|status| {
            status
                .allowed_predecessors()
                .iter()
                .map(|s| s.as_str().to_string())
                .collect()
        });

        let updated = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs SET
                status = COALESCE($2, status),
                source_key = COALESCE($3, source_key),
                source_url = COALESCE($4, source_url),
                output_key = COALESCE($5, output_key),
                output_url = COALESCE($6, output_url),
                size = COALESCE($7, size),
                error_info = COALESCE($8, error_info),
                updated_at = NOW()
            WHERE id = $1
              AND ($9::text[] IS NULL OR status = ANY($9))
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(next.map(|s| s.as_str()))
        .bind(patch.source_key)
        .bind(patch.source_url)
        .bind(patch.output_key)
        .bind(patch.output_url)
        .bind(patch.size)
        .bind(patch.error_info)
        .bind(predecessors)
        .fetch_optional(&self.pool)
        .await?;

        match (updated, next) {
            (Some(job), _) => Ok(job),
            (None, Some(to)) => match self.get(id).await? {
                Some(current) => Err(StoreError::InvalidTransition {
                    id,
                    from: current.status,
                    to,
                }),
                None => Err(StoreError::NotFound(id)),
            },
            (None, None) => Err(StoreError::NotFound(id)),
        }
    }
}
