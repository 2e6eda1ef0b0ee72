//! Sensors module.
//!
use std::sync::Arc;

use anyhow::{Context, Result};
use image::RgbImage;
use rscam::{Camera, Config};
use simple_error::simple_error;

/// Source of camera frames.
///
/// Dropping the source releases the device.
pub trait FrameSource {
    /// Capture the next frame. `None` means the device failed and the stream is over.
    fn capture(&mut self) -> Option<RgbImage>;
}

/// Opens a fresh frame source for every stream.
pub type OpenCameraFn = Arc<dyn Fn() -> Result<Box<dyn FrameSource>> + Send + Sync>;

/// Settings to open a video device.
#[derive(Clone, Debug)]
pub struct CameraSettings {
    pub device: String,
    pub format: String,
    /// Use the maximum supported resolution if not set.
    pub resolution: Option<(u32, u32)>,
    /// Use the maximum supported frame rate if not set.
    pub frame_rate: Option<(u32, u32)>,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_owned(),
            format: "MJPG".to_owned(),
            resolution: None,
            frame_rate: None,
        }
    }
}

/// Video4Linux camera delivering MJPG frames.
pub struct V4lCamera {
    camera: Camera,
    device: String,
}

impl V4lCamera {
    /// Open and start a video device on a Linux machine.
    pub fn open(settings: &CameraSettings) -> Result<Self> {
        let mut camera = Camera::new(&settings.device)
            .with_context(|| format!("failed to open camera {}", &settings.device))?;
        log_supported_formats(&camera, &settings.format);
        let format = settings.format.as_bytes();

        log::info!("Using camera {}", &settings.device);

        let resolution = settings
            .resolution
            .map(Ok)
            .unwrap_or_else(|| get_max_resolution(&camera, format))?;

        let frame_rate = settings
            .frame_rate
            .map(Ok)
            .unwrap_or_else(|| get_max_frame_rate(&camera, format, resolution))?;

        camera
            .start(&Config {
                interval: frame_rate,
                resolution,
                format,
                ..Default::default()
            })
            .with_context(|| format!("failed to start camera {}", &settings.device))?;

        log::debug!(
            "Camera {} started with {:?} at {:?}",
            &settings.device,
            resolution,
            frame_rate
        );

        Ok(Self {
            camera,
            device: settings.device.clone(),
        })
    }

    /// Opener for the stream endpoint.
    pub fn opener(settings: CameraSettings) -> OpenCameraFn {
        Arc::new(move || {
            let camera = V4lCamera::open(&settings)?;
            Ok(Box::new(camera) as Box<dyn FrameSource>)
        })
    }
}

impl FrameSource for V4lCamera {
    fn capture(&mut self) -> Option<RgbImage> {
        let frame = match self.camera.capture() {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("Error capturing frame from {}: {}", &self.device, err);
                return None;
            }
        };

        match turbojpeg::decompress_image(&frame[..]) {
            Ok(image) => Some(image),
            Err(err) => {
                log::warn!("Error decoding frame from {}: {}", &self.device, err);
                None
            }
        }
    }
}

impl Drop for V4lCamera {
    fn drop(&mut self) {
        log::info!("Releasing camera {}", &self.device);
    }
}

/// Parse a resolution given as `<width>x<height>`.
pub fn parse_resolution(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .split_once(&['x', 'X'][..])
        .ok_or_else(|| format!("expected <width>x<height>, got {value}"))?;
    let width = width.trim().parse().map_err(|_| format!("invalid width {width}"))?;
    let height = height
        .trim()
        .parse()
        .map_err(|_| format!("invalid height {height}"))?;

    Ok((width, height))
}

/// Get the maximum supported resolution for the given format.
fn get_max_resolution(cam: &Camera, format: &[u8]) -> Result<(u32, u32)> {
    let resolution_info = cam.resolutions(format)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        rscam::ResolutionInfo::Discretes(resolutions) => resolutions
            .iter()
            // Get the highest resolution in terms of number of pixels
            .max_by_key(|res| res.0 * res.1)
            .copied(),
        rscam::ResolutionInfo::Stepwise { max, .. } => Some(max),
    }
    .ok_or_else(|| simple_error!("No resolution found").into())
}

/// Get the maximum supported frame rate for the given format and resolution.
fn get_max_frame_rate(cam: &Camera, format: &[u8], resolution: (u32, u32)) -> Result<(u32, u32)> {
    let interval_info = cam.intervals(format, resolution)?;
    log::debug!("Found frame rates: {:?}", &interval_info);
    match interval_info {
        // Intervals are (numerator, denominator) of the frame duration, the shortest one wins
        rscam::IntervalInfo::Discretes(intervals) => intervals
            .iter()
            .filter(|(numerator, _)| *numerator > 0)
            .max_by_key(|(numerator, denominator)| denominator / numerator)
            .copied(),
        rscam::IntervalInfo::Stepwise { min, .. } => Some(min),
    }
    .ok_or_else(|| simple_error!("No frame rate found").into())
}

fn log_supported_formats(cam: &Camera, format: &str) {
    let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
    log::debug!(
        "Supported formats: {:?}, using format {:?}",
        formats,
        format
    );
}
