use crate::modules::transcoding::model::{Job, JobStatus};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::modules::transcoding::handler::upload_video,
        crate::modules::transcoding::handler::get_job,
    ),
    components(
        schemas(Job, JobStatus)
    ),
    tags(
        (name = "Transcoding", description = "Video upload and HLS transcoding jobs")
    )
)]
pub struct ApiDoc;
