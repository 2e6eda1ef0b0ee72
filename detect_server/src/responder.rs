//! Live detection stream of the camera.
//!
//! Frames are captured, run through the model and annotated on a blocking task which feeds a
//! bounded channel. The HTTP response drains the channel. Once the client goes away the channel
//! closes, the task stops and releases the camera together with its [`CameraLease`].
use std::{convert::Infallible, sync::Arc};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    annotate::Annotator,
    meter::METER,
    nn::InferModel,
    sensors::{FrameSource, OpenCameraFn},
};

/// Content type of the multipart stream.
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Frames buffered between the camera task and the response.
const FRAME_BUFFER: usize = 2;

/// Wrap a JPEG image as one part of the multipart stream.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(
        &[
            "--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_bytes(),
            data,
            "\r\n".as_bytes(),
        ]
        .concat(),
    )
}

/// Exclusive right to stream from the camera.
#[derive(Clone)]
pub struct CameraLease(Arc<Semaphore>);

impl Default for CameraLease {
    fn default() -> Self {
        Self(Arc::new(Semaphore::new(1)))
    }
}

impl CameraLease {
    /// Take the lease, `None` if another stream holds it.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.0.clone().try_acquire_owned().ok()
    }

    pub fn is_free(&self) -> bool {
        self.0.available_permits() > 0
    }
}

/// Everything a detection stream needs besides the lease.
#[derive(Clone)]
pub struct StreamSetup {
    pub open_camera: OpenCameraFn,
    pub model: Arc<dyn InferModel>,
    pub annotator: Arc<Annotator>,
    pub jpeg_quality: i32,
}

/// Open the camera and start streaming annotated frames.
///
/// Returns once the camera is open, opening errors are returned instead of an empty stream.
pub async fn spawn_detection_stream(
    setup: StreamSetup,
    permit: OwnedSemaphorePermit,
) -> Result<impl Stream<Item = Result<Bytes, Infallible>>> {
    let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(FRAME_BUFFER);
    let (opened_tx, opened_rx) = oneshot::channel::<Result<()>>();

    tokio::task::spawn_blocking(move || {
        // Dropped after the camera
        let _permit = permit;

        let mut camera = match (setup.open_camera)() {
            Ok(camera) => {
                opened_tx.send(Ok(())).ok();
                camera
            }
            Err(err) => {
                opened_tx.send(Err(err)).ok();
                return;
            }
        };

        let frames = pump_frames(
            camera.as_mut(),
            setup.model.as_ref(),
            &setup.annotator,
            setup.jpeg_quality,
            &frame_tx,
        );
        log::info!("Detection stream ended after {frames} frames");
    });

    opened_rx
        .await
        .context("camera task exited before opening the camera")??;

    Ok(ReceiverStream::new(frame_rx).map(|item| {
        METER.tick_streamed();
        Ok::<_, Infallible>(item)
    }))
}

/// Capture, detect, annotate and send frames until the camera fails or the receiver is gone.
///
/// Returns the number of frames sent.
fn pump_frames(
    camera: &mut dyn FrameSource,
    model: &dyn InferModel,
    annotator: &Annotator,
    jpeg_quality: i32,
    frame_tx: &mpsc::Sender<Bytes>,
) -> usize {
    let mut frames = 0;

    while let Some(mut frame) = camera.capture() {
        let result = match model.run(&frame) {
            Ok(result) => result,
            Err(err) => {
                log::error!("Inference failed, stopping stream: {err:#}");
                break;
            }
        };
        log::debug!("Found {} objects in frame", result.detections.len());

        annotator.draw(&mut frame, &result);

        let jpeg = match turbojpeg::compress_image(&frame, jpeg_quality, turbojpeg::Subsamp::Sub2x2)
        {
            Ok(jpeg) => jpeg,
            Err(err) => {
                log::error!("Could not encode frame, stopping stream: {err}");
                break;
            }
        };

        if frame_tx.blocking_send(as_jpeg_stream_item(&jpeg)).is_err() {
            log::info!("Stream client disconnected");
            break;
        }
        frames += 1;
    }

    frames
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use image::RgbImage;
    use simple_error::simple_error;

    use super::*;
    use crate::detection::{ClassNames, DetectionResult};

    /// Camera delivering a fixed number of frames.
    struct FakeCamera {
        frames_left: usize,
        released: Arc<AtomicBool>,
    }

    impl FrameSource for FakeCamera {
        fn capture(&mut self) -> Option<RgbImage> {
            match self.frames_left {
                0 => None,
                _ => {
                    self.frames_left -= 1;
                    Some(RgbImage::new(32, 24))
                }
            }
        }
    }

    impl Drop for FakeCamera {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    struct FakeModel {
        runs: AtomicUsize,
        fail: bool,
    }

    impl InferModel for FakeModel {
        fn run(&self, _input: &RgbImage) -> Result<DetectionResult> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match self.fail {
                true => Err(simple_error!("broken model").into()),
                false => Ok(DetectionResult::new(vec![], Arc::new(ClassNames::default()))),
            }
        }
    }

    fn setup(frames: usize, fail: bool) -> (StreamSetup, Arc<FakeModel>, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(false));
        let model = Arc::new(FakeModel {
            runs: AtomicUsize::new(0),
            fail,
        });

        let released_ = released.clone();
        let open_camera: OpenCameraFn = Arc::new(move || {
            Ok(Box::new(FakeCamera {
                frames_left: frames,
                released: released_.clone(),
            }) as Box<dyn FrameSource>)
        });

        let setup = StreamSetup {
            open_camera,
            model: model.clone(),
            annotator: Arc::new(Annotator::default()),
            jpeg_quality: 80,
        };

        (setup, model, released)
    }

    #[test]
    fn stream_item_format() {
        let item = as_jpeg_stream_item(b"JPEG");
        assert_eq!(
            &item[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEG\r\n"
        );
    }

    #[tokio::test]
    async fn failing_first_capture_gives_empty_stream() -> Result<()> {
        let (setup, model, released) = setup(0, false);
        let lease = CameraLease::default();

        let stream = spawn_detection_stream(setup, lease.try_acquire().unwrap()).await?;
        let frames: Vec<_> = stream.collect().await;

        assert!(frames.is_empty());
        assert_eq!(model.runs.load(Ordering::SeqCst), 0);
        assert!(released.load(Ordering::SeqCst));

        Ok(())
    }

    #[tokio::test]
    async fn stream_ends_when_camera_fails() -> Result<()> {
        let (setup, model, _released) = setup(3, false);
        let lease = CameraLease::default();

        let stream = spawn_detection_stream(setup, lease.try_acquire().unwrap()).await?;
        let frames: Vec<_> = stream.collect().await;

        assert_eq!(frames.len(), 3);
        assert_eq!(model.runs.load(Ordering::SeqCst), 3);
        for frame in frames {
            let frame = frame.unwrap();
            assert!(frame.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xff\xd8"));
            assert!(frame.ends_with(b"\xff\xd9\r\n"));
        }
        assert!(lease.is_free());

        Ok(())
    }

    #[tokio::test]
    async fn inference_error_ends_stream() -> Result<()> {
        let (setup, model, released) = setup(5, true);
        let lease = CameraLease::default();

        let stream = spawn_detection_stream(setup, lease.try_acquire().unwrap()).await?;
        let frames: Vec<_> = stream.collect().await;

        assert!(frames.is_empty());
        assert_eq!(model.runs.load(Ordering::SeqCst), 1);
        assert!(released.load(Ordering::SeqCst));

        Ok(())
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_client_disconnects() -> Result<()> {
        let (setup, _model, released) = setup(usize::MAX, false);
        let lease = CameraLease::default();

        let mut stream =
            Box::pin(spawn_detection_stream(setup, lease.try_acquire().unwrap()).await?);
        assert!(stream.next().await.is_some());
        assert!(lease.try_acquire().is_none());

        drop(stream);

        // The camera task notices the disconnect on its next send
        for _ in 0..100 {
            if lease.is_free() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(released.load(Ordering::SeqCst));
        assert!(lease.try_acquire().is_some());

        Ok(())
    }

    #[tokio::test]
    async fn open_error_is_returned_and_lease_released() {
        let lease = CameraLease::default();
        let (mut setup, _model, _released) = setup(1, false);
        setup.open_camera = Arc::new(|| Err(simple_error!("no such device").into()));

        let res = spawn_detection_stream(setup, lease.try_acquire().unwrap()).await;
        assert!(res.is_err());

        for _ in 0..100 {
            if lease.is_free() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(lease.is_free());
    }
}
