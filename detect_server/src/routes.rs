//! HTTP routes.
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Router,
};
use tower_http::services::ServeDir;

use crate::{
    endpoints::{healthcheck, index, upload, video_feed, webcam},
    nn::Detector,
    settings::Settings,
};

/// URL prefix the static directory is served under.
pub const STATIC_URL: &str = "/static";

/// URL prefix of stored uploads, the `uploads` directory below `STATIC_URL`.
pub const UPLOADS_URL: &str = "/static/uploads";

/// State shared by all endpoints.
///
/// The detector is `None` if the model could not be loaded, detection endpoints then answer with
/// `503 Service Unavailable`.
pub struct AppState {
    pub detector: Option<Arc<dyn Detector>>,
    pub settings: Settings,
}

/// Build the router with all endpoints.
pub fn app(state: AppState) -> Router {
    let static_files = ServeDir::new(&state.settings.static_dir);
    let upload_limit = DefaultBodyLimit::max(state.settings.max_upload_bytes);

    Router::new()
        .route("/", get(index))
        .route("/webcam", get(webcam))
        .route("/video_feed", get(video_feed))
        .route("/upload", post(upload).layer(upload_limit))
        .route("/healthcheck", get(healthcheck))
        .nest_service(STATIC_URL, static_files)
        .layer(Extension(Arc::new(state)))
}
