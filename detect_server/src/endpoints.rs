//! Endpoints of HTTP server.
//!
use std::{convert::Infallible, sync::Arc};

use axum::{
    body::StreamBody,
    extract::{Multipart, Query},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    Extension,
};
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    encode::STREAM_CONTENT_TYPE,
    pages::{index_page, result_page, webcam_page, Flash},
    publisher::spawn_publisher,
    routes::{AppState, UPLOADS_URL},
    upload::{process_upload, secure_filename, UploadError, UploadOutcome},
};

/// Search parameters of the index page.
#[derive(Debug, Deserialize)]
pub struct IndexParams {
    #[serde(default)]
    flash: Option<String>,
}

/// Health check endpoint.
pub async fn healthcheck(Extension(state): Extension<Arc<AppState>>) -> &'static str {
    match state.detector {
        Some(_) => "healthy",
        None => "degraded: model unavailable",
    }
}

pub async fn index(Query(params): Query<IndexParams>) -> Html<String> {
    let flash = params.flash.as_deref().and_then(Flash::from_code);
    Html(index_page(flash))
}

pub async fn webcam() -> Html<String> {
    Html(webcam_page())
}

/// Endpoint of the annotated camera stream.
pub async fn video_feed(Extension(state): Extension<Arc<AppState>>) -> Response {
    let detector = match &state.detector {
        Some(detector) => Arc::clone(detector),
        None => {
            log::warn!("Stream requested without a loaded model");
            return (StatusCode::SERVICE_UNAVAILABLE, "Detection model unavailable").into_response();
        }
    };

    let camera = state.settings.camera.clone();
    log::info!("Stream from {} requested", &camera);

    let rx = match spawn_publisher(move || camera.open(), detector, state.settings.stream.clone())
        .await
    {
        Ok(rx) => rx,
        Err(e) => {
            log::warn!("Could not start stream: {e}");
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);

    // Set body and headers for multipart streaming
    let body = StreamBody::new(stream);
    let headers = [
        (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
        (header::CACHE_CONTROL, "no-cache"),
    ];

    (headers, body).into_response()
}

/// Endpoint receiving an image to run detection on.
///
/// Failures redirect to the index page with a flash message.
pub async fn upload(Extension(state): Extension<Arc<AppState>>, multipart: Multipart) -> Response {
    match handle_upload(&state, multipart).await {
        Ok(outcome) => Html(result_page(&outcome, UPLOADS_URL)).into_response(),
        Err(e) => {
            log::warn!("Upload failed: {e}");
            Redirect::to(&e.flash().redirect_target()).into_response()
        }
    }
}

async fn handle_upload(
    state: &AppState,
    mut multipart: Multipart,
) -> Result<UploadOutcome, UploadError> {
    let (client_name, data) = loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| UploadError::Multipart(e.to_string()))?
            .ok_or(UploadError::NoFilePart)?;
        if field.name() != Some("file") {
            continue;
        }

        let client_name = field.file_name().unwrap_or_default().to_owned();
        let data = field
            .bytes()
            .await
            .map_err(|e| UploadError::Multipart(e.to_string()))?;
        break (client_name, data);
    };

    if client_name.is_empty() {
        return Err(UploadError::NoSelectedFile);
    }
    let detector = state
        .detector
        .clone()
        .ok_or(UploadError::ModelUnavailable)?;
    let filename = secure_filename(&client_name).ok_or(UploadError::InvalidFilename)?;
    log::info!("Received {} ({} bytes) as {}", &client_name, data.len(), &filename);

    let upload_dir = state.settings.upload_dir();
    let min_confidence = state.settings.min_confidence();
    let jpeg_quality = state.settings.jpeg_quality;

    tokio::task::spawn_blocking(move || {
        process_upload(
            detector.as_ref(),
            &data,
            &filename,
            &upload_dir,
            min_confidence,
            jpeg_quality,
        )
    })
    .await
    .map_err(|e| UploadError::Storage(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}
