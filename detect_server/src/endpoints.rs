//! Endpoints of HTTP server.
//!
use std::{
    path::{Component, Path as FsPath},
    sync::Arc,
};

use anyhow::Context;
use axum::{
    body::StreamBody,
    extract::{DefaultBodyLimit, Multipart, Path},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Extension, Router,
};
use simple_error::simple_error;
use tokio_util::io::ReaderStream;

use crate::{
    annotate::Annotator,
    bootstrap::ModelHandle,
    pages::{camera_page, index_page},
    responder::{spawn_detection_stream, CameraLease, StreamSetup, STREAM_CONTENT_TYPE},
    sensors::OpenCameraFn,
    storage::{Storage, STATIC_URL},
    upload::{process_upload, UploadedImage},
    utils::content_type_for,
};

/// Largest accepted upload request.
pub const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Name of the form field carrying the image.
const FILE_FIELD: &str = "file";

/// State shared by all handlers.
pub struct AppState {
    pub storage: Arc<Storage>,
    /// `None` if no model could be loaded at startup.
    pub model: Option<ModelHandle>,
    pub annotator: Arc<Annotator>,
    pub open_camera: OpenCameraFn,
    pub camera_lease: CameraLease,
    pub jpeg_quality: i32,
}

/// Error turned into a plain text response.
pub struct AppError(pub StatusCode, pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let AppError(status, err) = self;
        match status.is_server_error() {
            true => log::error!("Request failed with {}: {:#}", status, err),
            false => log::info!("Request rejected with {}: {:#}", status, err),
        }

        (status, format!("{err:#}")).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        AppError(StatusCode::INTERNAL_SERVER_ERROR, err.into())
    }
}

/// Build the router with all endpoints.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index).post(upload))
        .route("/camera", get(camera))
        .route("/camera_feed", get(camera_feed))
        .route(&format!("{STATIC_URL}/*path"), get(static_file))
        .route("/healthcheck", get(healthcheck))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(Extension(state))
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

pub async fn index() -> Html<String> {
    Html(index_page(None))
}

/// Run detection on the image of the upload form.
pub async fn upload(
    Extension(state): Extension<Arc<AppState>>,
    multipart: Option<Multipart>,
) -> Result<Html<String>, AppError> {
    let uploaded = match multipart {
        Some(multipart) => read_file_field(multipart).await?,
        None => None,
    };

    if let Some(uploaded) = &uploaded {
        log::info!(
            "Received upload {:?} with {} bytes",
            &uploaded.filename,
            uploaded.data.len()
        );
    }

    let outcome = tokio::task::spawn_blocking(move || {
        process_upload(
            &state.storage,
            state.model.as_deref(),
            &state.annotator,
            uploaded,
        )
    })
    .await
    .context("upload task failed")??;

    Ok(Html(index_page(Some(&outcome))))
}

/// Find the file field of a form, other fields are skipped.
async fn read_file_field(mut multipart: Multipart) -> Result<Option<UploadedImage>, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError(StatusCode::BAD_REQUEST, err.into()))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_owned();
        let data = field
            .bytes()
            .await
            .map_err(|err| AppError(StatusCode::BAD_REQUEST, err.into()))?;

        return Ok(Some(UploadedImage { filename, data }));
    }

    Ok(None)
}

pub async fn camera() -> Html<String> {
    Html(camera_page())
}

/// Multipart stream of annotated camera frames.
pub async fn camera_feed(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let model = state.model.clone().ok_or_else(|| {
        AppError(
            StatusCode::INTERNAL_SERVER_ERROR,
            simple_error!("Model not loaded").into(),
        )
    })?;

    let permit = state
        .camera_lease
        .try_acquire()
        .ok_or_else(|| AppError(StatusCode::CONFLICT, simple_error!("Camera busy").into()))?;

    log::info!("Camera stream requested");

    let setup = StreamSetup {
        open_camera: state.open_camera.clone(),
        model,
        annotator: state.annotator.clone(),
        jpeg_quality: state.jpeg_quality,
    };
    let stream = spawn_detection_stream(setup, permit).await?;

    // Set body and headers for multipart streaming
    let body = StreamBody::new(stream);
    let headers = [
        (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
        (header::CACHE_CONTROL, "no-cache"),
    ];

    Ok((headers, body))
}

/// Files below the static directory.
pub async fn static_file(
    Extension(state): Extension<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let relative = FsPath::new(path.trim_start_matches('/'));
    let not_found = || AppError(StatusCode::NOT_FOUND, simple_error!("Not found").into());

    let is_plain = relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if !is_plain || relative.as_os_str().is_empty() {
        return Err(not_found());
    }

    let full_path = state.storage.static_dir().join(relative);
    let file = match tokio::fs::File::open(&full_path).await {
        Ok(file) => file,
        Err(err) => {
            log::debug!("Could not open {}: {}", full_path.display(), err);
            return Err(not_found());
        }
    };
    if !file.metadata().await?.is_file() {
        return Err(not_found());
    }

    let headers = [(header::CONTENT_TYPE, content_type_for(relative))];
    Ok((headers, StreamBody::new(ReaderStream::new(file))))
}
