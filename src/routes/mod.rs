pub mod files;
pub mod health;
pub mod metrics;
pub mod upload;

use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

/// Versioned API routes, without `/health` and `/metrics`.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/upload/presigned-url", post(upload::presigned_url))
        .route("/upload/finished", post(upload::upload_finished))
        .route("/files", get(files::list_files))
        .route(
            "/files/{uuid}",
            get(files::get_file).delete(files::delete_file),
        )
        .route("/files/{uuid}/status", get(files::file_status))
        .route("/files/{uuid}/render-url", get(files::render_url))
}
