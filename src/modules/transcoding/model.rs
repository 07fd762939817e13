use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Uploading,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Error)]
#[error("unknown job status: {0}")]
pub struct UnknownStatus(String);

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Uploading => "UPLOADING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// States a job may be in when it is moved to `self`. Rewriting the
    /// current state is allowed so redelivered work can overwrite by id.
    pub fn allowed_predecessors(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::Uploading => &[JobStatus::Uploading],
            JobStatus::Processing => &[JobStatus::Uploading, JobStatus::Processing],
            JobStatus::Completed => &[JobStatus::Processing, JobStatus::Completed],
            JobStatus::Failed => &[JobStatus::Uploading, JobStatus::Processing, JobStatus::Failed],
        }
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        next.allowed_predecessors().contains(self)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPLOADING" => Ok(JobStatus::Uploading),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One uploaded video and its transcoding outcome. Also the task payload.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub source_key: Option<String>,
    pub source_url: Option<String>,
    pub output_key: Option<String>,
    pub output_url: Option<String>,
    pub file_name: Option<String>,
    pub size: Option<i64>,
    pub mime_type: Option<String>,
    pub error_info: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

/// Partial update; `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub source_key: Option<String>,
    pub source_url: Option<String>,
    pub output_key: Option<String>,
    pub output_url: Option<String>,
    pub size: Option<i64>,
    pub error_info: Option<String>,
}

impl JobPatch {
    pub fn processing(source_key: String, source_url: String, size: i64) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            source_key: Some(source_key),
            source_url: Some(source_url),
            size: Some(size),
            ..Self::default()
        }
    }

    pub fn completed(output_key: String, output_url: String) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            output_key: Some(output_key),
            output_url: Some(output_url),
            ..Self::default()
        }
    }

    pub fn failed(error_info: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error_info: Some(error_info.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_never_move() {
        for terminal in [JobStatus::Completed, JobStatus::Failed] {
            for next in [JobStatus::Uploading, JobStatus::Processing] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn forward_transitions_are_allowed() {
        assert!(JobStatus::Uploading.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Uploading.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Uploading.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Uploading));
    }

    #[test]
    fn job_json_uses_uppercase_status_and_camel_case() {
        let job = Job {
            id: Uuid::nil(),
            status: JobStatus::Processing,
            source_key: Some("sources/a.mp4".into()),
            source_url: None,
            output_key: None,
            output_url: None,
            file_name: Some("a.mp4".into()),
            size: Some(42),
            mime_type: Some("video/mp4".into()),
            error_info: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        };

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], "PROCESSING");
        assert_eq!(value["sourceKey"], "sources/a.mp4");

        let parsed: Job = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.status, JobStatus::Processing);
        assert_eq!(parsed.size, Some(42));
    }
}
