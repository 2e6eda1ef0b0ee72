//! Detection server binary.
//!
use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use clap::Parser;
use detect_server::{
    annotate::Annotator,
    bootstrap::{ensure_model_available, load_model},
    config::Config,
    detection::ClassNames,
    endpoints::{build_router, AppState},
    meter::spawn_meter_logger,
    responder::CameraLease,
    sensors::V4lCamera,
    storage::Storage,
};
use env_logger::TimestampPrecision;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .filter_level(config.log_level())
        .parse_default_env()
        .init();

    let storage = Arc::new(Storage::new(&config.static_dir, config.keep_results));
    storage.reset()?;

    // A missing model is reported to the users, not fatal
    if let Err(err) = ensure_model_available(&config.model_path, &config.model_url()).await {
        log::error!("Could not download model: {err:#}");
    }

    let names = match &config.class_names {
        Some(path) => Some(ClassNames::from_file(path)?),
        None => None,
    };
    let model = {
        let (path, params) = (config.model_path.clone(), config.yolo_params());
        tokio::task::spawn_blocking(move || load_model(path, params, names))
            .await
            .unwrap_or_else(|err| {
                log::error!("Loading the model crashed: {err}");
                None
            })
    };

    let annotator = match &config.font {
        Some(path) => Annotator::with_font_file(path),
        None => Annotator::with_embedded_font(),
    };
    let annotator = annotator.unwrap_or_else(|err| {
        log::warn!("Drawing boxes without captions: {err:#}");
        Annotator::default()
    });

    spawn_meter_logger();

    let state = Arc::new(AppState {
        storage,
        model,
        annotator: Arc::new(annotator),
        open_camera: V4lCamera::opener(config.camera_settings()),
        camera_lease: CameraLease::default(),
        jpeg_quality: config.jpeg_quality,
    });
    let app = build_router(state);

    // Serve HTTP server
    let addr: SocketAddr = config.server_address.parse()?;
    log::info!("Serving on http://{addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
