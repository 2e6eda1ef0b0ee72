//! Make the detection model available before the server starts.
//!
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use reqwest::Client;

use crate::{
    detection::ClassNames,
    nn::{InferModel, YoloModel, YoloParams},
    utils::download_file,
};

/// Google Drive file id of the default weights.
pub const DRIVE_FILE_ID: &str = "13B1-kTOYRkStX-Ityzm8OYjfF2YqIjMa";

/// Shared handle to the loaded model.
pub type ModelHandle = Arc<dyn InferModel>;

/// Public download URL of a Google Drive file.
pub fn drive_download_url(file_id: &str) -> String {
    format!("https://drive.google.com/uc?export=download&confirm=t&id={file_id}")
}

/// Make sure the model weights exist at `path`, downloading them from `url` if necessary.
///
/// Nothing is verified after the download.
pub async fn ensure_model_available(path: impl AsRef<Path>, url: &str) -> Result<PathBuf> {
    let path = path.as_ref();

    if path.exists() {
        log::info!("Model {} already exists locally", path.display());
        return Ok(path.to_path_buf());
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    log::info!("Downloading model from {} to {}", url, path.display());
    download_file(&Client::new(), url, path).await?;

    Ok(path.to_path_buf())
}

/// Load the model at `path`.
///
/// Returns `None` if there is no usable model, the server then runs without detection.
pub fn load_model(
    path: impl AsRef<Path>,
    params: YoloParams,
    names: Option<ClassNames>,
) -> Option<ModelHandle> {
    let path = path.as_ref();

    if !path.exists() {
        log::error!("Model file {} not found", path.display());
        return None;
    }

    match YoloModel::new(path, params, names) {
        Ok(model) => {
            log::info!("Loaded model {}", path.display());
            Some(Arc::new(model))
        }
        Err(err) => {
            log::error!("Failed to load model {}: {:#}", path.display(), err);
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn drive_url_contains_file_id() {
        let url = drive_download_url(DRIVE_FILE_ID);
        assert!(url.starts_with("https://drive.google.com/uc?"));
        assert!(url.ends_with(&format!("id={DRIVE_FILE_ID}")));
    }

    #[tokio::test]
    async fn existing_model_is_not_downloaded() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("best.onnx");
        std::fs::write(&path, b"weights")?;

        // The URL is never contacted
        let resolved = ensure_model_available(&path, "http://127.0.0.1:1/best.onnx").await?;
        assert_eq!(resolved, path);

        Ok(())
    }

    #[tokio::test]
    async fn failed_download_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("models").join("best.onnx");

        let res = ensure_model_available(&path, "http://127.0.0.1:1/best.onnx").await;
        assert!(res.is_err());
        assert!(!path.exists());

        Ok(())
    }

    #[test]
    fn missing_or_invalid_model_loads_as_none() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(load_model(dir.path().join("missing.onnx"), YoloParams::default(), None).is_none());

        let garbage = dir.path().join("garbage.onnx");
        std::fs::write(&garbage, b"definitely not protobuf")?;
        assert!(load_model(&garbage, YoloParams::default(), None).is_none());

        Ok(())
    }
}
