//! Detection on uploaded images.
//!
use std::{fs, path::Path};

use anyhow::{Context, Result};
use bytes::Bytes;
use image::{io::Reader as ImageReader, ImageError, ImageFormat, RgbImage};

use crate::{
    annotate::Annotator, meter::METER, nn::InferModel, storage::Storage, utils::secure_filename,
};

pub const NO_FILE_SELECTED: &str = "No file selected";
pub const MODEL_NOT_FOUND: &str = "Model not found";
pub const UNREADABLE_IMAGE: &str = "Could not read image";

/// Name used when nothing of the client's filename survives sanitizing.
const FALLBACK_FILENAME: &str = "upload.jpg";

/// File received from the upload form.
#[derive(Clone, Debug)]
pub struct UploadedImage {
    pub filename: String,
    pub data: Bytes,
}

/// What the index page shows after an upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    NoFile,
    ModelMissing,
    Unreadable,
    Detected { label: String, result_url: String },
}

impl UploadOutcome {
    /// Message for the user, if the upload did not produce a result.
    pub fn message(&self) -> Option<&'static str> {
        match self {
            UploadOutcome::NoFile => Some(NO_FILE_SELECTED),
            UploadOutcome::ModelMissing => Some(MODEL_NOT_FOUND),
            UploadOutcome::Unreadable => Some(UNREADABLE_IMAGE),
            UploadOutcome::Detected { .. } => None,
        }
    }
}

/// Run detection on an uploaded image and store the annotated result.
///
/// Blocks on file I/O and inference.
pub fn process_upload(
    storage: &Storage,
    model: Option<&dyn InferModel>,
    annotator: &Annotator,
    upload: Option<UploadedImage>,
) -> Result<UploadOutcome> {
    let upload = match upload {
        Some(upload) if !upload.filename.is_empty() => upload,
        _ => return Ok(UploadOutcome::NoFile),
    };

    let model = match model {
        Some(model) => model,
        None => return Ok(UploadOutcome::ModelMissing),
    };

    let filename = match secure_filename(&upload.filename) {
        name if name.is_empty() => FALLBACK_FILENAME.to_owned(),
        name => name,
    };

    let workspace = storage.acquire()?;
    let upload_path = workspace.upload_path(&filename);
    fs::write(&upload_path, &upload.data)
        .with_context(|| format!("failed to save upload {}", upload_path.display()))?;
    log::info!(
        "Saved upload {} ({} bytes)",
        upload_path.display(),
        upload.data.len()
    );

    let mut frame = match read_image(&upload_path) {
        Ok(frame) => frame,
        Err(err) => {
            log::warn!("Could not read {}: {}", upload_path.display(), err);
            return Ok(UploadOutcome::Unreadable);
        }
    };

    let result = model.run(&frame)?;
    log::debug!("Found {} objects in {}", result.detections.len(), &filename);

    annotator.draw(&mut frame, &result);

    let result_path = workspace.result_path(&filename);
    save_image(&frame, &result_path)
        .with_context(|| format!("failed to save result {}", result_path.display()))?;

    let outcome = UploadOutcome::Detected {
        label: result.top_label(),
        result_url: workspace.result_url(&filename),
    };
    workspace.persist();
    METER.tick_upload();

    Ok(outcome)
}

/// Decode an image file, guessing the format from its content.
fn read_image(path: &Path) -> Result<RgbImage> {
    let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    Ok(image.to_rgb8())
}

/// Encode in the format matching the file extension, JPEG if there is none.
fn save_image(frame: &RgbImage, path: &Path) -> Result<()> {
    match frame.save(path) {
        Err(ImageError::Unsupported(_)) => frame.save_with_format(path, ImageFormat::Jpeg)?,
        res => res?,
    }
    Ok(())
}
