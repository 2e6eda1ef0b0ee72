//! Command line configuration of the server.
//!
use std::path::PathBuf;

use clap::Parser;

use crate::{
    bootstrap::{drive_download_url, DRIVE_FILE_ID},
    nn::YoloParams,
    sensors::{parse_resolution, CameraSettings},
};

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Config {
    /// Address to serve the web interface on
    #[clap(long, default_value = "127.0.0.1:5000")]
    pub server_address: String,

    /// Directory with uploads and annotated results, served under /static
    #[clap(long, default_value = "static")]
    pub static_dir: PathBuf,

    /// ONNX weights of the detection model, downloaded if missing
    #[clap(long, default_value = "best.onnx")]
    pub model_path: PathBuf,

    /// URL to download the weights from, overrides --drive-file-id
    #[clap(long)]
    pub model_url: Option<String>,

    /// Google Drive file id of the weights
    #[clap(long, default_value = DRIVE_FILE_ID)]
    pub drive_file_id: String,

    /// Side length of the square model input
    #[clap(long, default_value_t = 640)]
    pub input_size: u32,

    /// Minimum confidence of a detection
    #[clap(long, default_value_t = 0.25)]
    pub confidence: f32,

    /// IoU threshold of the non-maximum suppression
    #[clap(long, default_value_t = 0.45)]
    pub iou: f32,

    /// Text file with one class name per line
    #[clap(long)]
    pub class_names: Option<PathBuf>,

    /// TTF font for box captions instead of the built-in DejaVu Sans Mono
    #[clap(long)]
    pub font: Option<PathBuf>,

    /// Video device of the camera
    #[clap(long, default_value = "/dev/video0")]
    pub camera_device: String,

    /// Pixel format of the camera
    #[clap(long, default_value = "MJPG")]
    pub camera_format: String,

    /// Camera resolution as <width>x<height>, the maximum supported if not set
    #[clap(long, value_parser = parse_resolution)]
    pub camera_resolution: Option<(u32, u32)>,

    /// JPEG quality of streamed frames
    #[clap(long, default_value_t = 80, value_parser = clap::value_parser!(i32).range(1..=100))]
    pub jpeg_quality: i32,

    /// Number of annotated results kept on disk
    #[clap(long, default_value_t = 16)]
    pub keep_results: usize,

    /// Log debug messages
    #[clap(long)]
    pub debug: bool,
}

impl Config {
    /// Where to download the weights from.
    pub fn model_url(&self) -> String {
        match &self.model_url {
            Some(url) => url.clone(),
            None => drive_download_url(&self.drive_file_id),
        }
    }

    pub fn yolo_params(&self) -> YoloParams {
        YoloParams {
            input_size: self.input_size,
            min_confidence: self.confidence,
            max_iou: self.iou,
        }
    }

    pub fn camera_settings(&self) -> CameraSettings {
        CameraSettings {
            device: self.camera_device.clone(),
            format: self.camera_format.clone(),
            resolution: self.camera_resolution,
            frame_rate: None,
        }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        match self.debug {
            true => log::LevelFilter::Debug,
            false => log::LevelFilter::Info,
        }
    }
}
