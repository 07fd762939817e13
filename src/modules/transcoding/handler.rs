use super::model::Job;
use super::service::TranscodingService;
use crate::common::response::{ApiError, ApiResponse, ApiSuccess};
use crate::state::AppState;
use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

const FILE_FIELD: &str = "file";

/// Upload a video for transcoding.
/// The `file` part is streamed straight to object storage.
#[utoipa::path(
    post,
    path = "/api/transcoding/upload",
    request_body(content = String, content_type = "multipart/form-data"),
    responses(
        (status = 201, description = "Upload stored and job queued", body = ApiResponse<Job>),
        (status = 400, description = "Missing file or unsupported video type"),
        (status = 413, description = "File too large"),
        (status = 500, description = "Internal Server Error")
    ),
    tag = "Transcoding"
)]
pub async fn upload_video(State(state): State<AppState>, mut multipart: Multipart) -> impl IntoResponse {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return ApiError(e.body_text(), e.status()).into_response(),
        };

        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let file_name = field.file_name().map(str::to_string);
        let mime_type = field.content_type().map(str::to_string);
        info!("Receiving upload {:?} ({:?})", file_name, mime_type);

        return match TranscodingService::ingest(&state, field, file_name, mime_type).await {
            Ok(job) => ApiSuccess(
                ApiResponse::success(job, "Video uploaded, transcoding queued"),
                StatusCode::CREATED,
            )
            .into_response(),
            Err(e) => ApiError::from(e).into_response(),
        };
    }

    ApiError::bad_request("No file field found in multipart request").into_response()
}

#[utoipa::path(
    get,
    path = "/api/transcoding/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job status", body = ApiResponse<Job>),
        (status = 404, description = "Job Not Found"),
        (status = 500, description = "Internal Server Error")
    ),
    tag = "Transcoding"
)]
pub async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match TranscodingService::get_job(&state, id).await {
        Ok(job) => ApiSuccess(ApiResponse::success(job, "Job retrieved successfully"), StatusCode::OK)
            .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}
