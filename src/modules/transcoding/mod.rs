use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};

pub mod handler;
pub mod model;
pub mod rendition;
pub mod repository;
pub mod service;

pub fn router() -> Router<AppState> {
    Router::new()
        // Size is capped while streaming to storage.
        .route(
            "/upload",
            post(handler::upload_video).layer(DefaultBodyLimit::disable()),
        )
        .route("/{id}", get(handler::get_job))
}
