//! Neural network models.
//!
use std::{path::Path, sync::Arc};

use anyhow::{bail, Context, Result};
use image::RgbImage;
use ndarray::{s, ArrayView2, Axis, Ix2};
use tract_onnx::prelude::*;

use crate::detection::{Bbox, ClassNames, Detection, DetectionResult};

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Upper limit of detections returned for one image.
const MAX_DETECTIONS: usize = 300;

/// Object detection model.
pub trait InferModel: Send + Sync {
    fn run(&self, input: &RgbImage) -> Result<DetectionResult>;
}

/// Tunable parameters of the YOLO model.
#[derive(Clone, Debug)]
pub struct YoloParams {
    /// Side length of the square network input.
    pub input_size: u32,
    pub min_confidence: f32,
    pub max_iou: f32,
}

impl Default for YoloParams {
    fn default() -> Self {
        Self {
            input_size: 640,
            min_confidence: 0.25,
            max_iou: 0.45,
        }
    }
}

/// YOLOv8-style detection model exported to ONNX.
pub struct YoloModel {
    model: NnModel,
    names: Arc<ClassNames>,
    params: YoloParams,
}

impl YoloModel {
    /// Load and optimize the model.
    ///
    /// Class names are taken from `names` if given, otherwise from the `names` metadata entry of
    /// the ONNX file.
    pub fn new(
        path: impl AsRef<Path>,
        params: YoloParams,
        names: Option<ClassNames>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let onnx = tract_onnx::onnx();
        let proto = onnx
            .proto_model_for_path(path)
            .with_context(|| format!("failed to read ONNX model {}", path.display()))?;

        let names = names
            .or_else(|| {
                proto
                    .metadata_props
                    .iter()
                    .find(|prop| prop.key == "names")
                    .and_then(|prop| ClassNames::from_metadata(&prop.value))
            })
            .unwrap_or_default();
        log::info!("Model {} knows {} classes", path.display(), names.len());

        let size = params.input_size as usize;
        let input_fact = InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size));
        let model = onnx
            .model_for_proto_model(&proto)?
            .with_input_fact(0, input_fact)?
            .into_optimized()?
            .into_runnable()?;

        Ok(Self {
            model,
            names: Arc::new(names),
            params,
        })
    }

    fn preproc(&self, input: &RgbImage) -> Tensor {
        let size = self.params.input_size;
        let resized: RgbImage =
            image::imageops::resize(input, size, size, image::imageops::FilterType::Triangle);

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, size as usize, size as usize),
            |(_, c, y, x)| resized[(x as _, y as _)][c] as f32 / 255.0,
        )
        .into()
    }

    fn postproc(&self, raw_nn_out: &Tensor) -> Result<DetectionResult> {
        let output = raw_nn_out.to_array_view::<f32>()?;
        if output.ndim() != 3 {
            bail!("unexpected model output shape {:?}", output.shape());
        }
        let output = output.slice(s![0, .., ..]).into_dimensionality::<Ix2>()?;

        // Rows are `cx, cy, w, h, score_0, ..`, some exports have them transposed
        let output = if output.shape()[0] > output.shape()[1] {
            output.reversed_axes()
        } else {
            output
        };

        let mut names = Arc::clone(&self.names);
        if names.is_empty() {
            names = Arc::new(ClassNames::numbered(output.shape()[0].saturating_sub(4)));
        }

        let detections = decode_predictions(
            output,
            self.params.input_size as f32,
            self.params.min_confidence,
            self.params.max_iou,
        );

        Ok(DetectionResult::new(detections, names))
    }
}

impl InferModel for YoloModel {
    fn run(&self, input: &RgbImage) -> Result<DetectionResult> {
        let valid_input = tvec!(self.preproc(input).into_tvalue());
        let raw_nn_out = self.model.run(valid_input)?;
        let first = raw_nn_out.first().context("model returned no output")?;

        self.postproc(first)
    }
}

/// Turn raw predictions of shape `(4 + num_classes, num_candidates)` into detections.
///
/// Box coordinates are expected in pixels of the square network input. The result is sorted by
/// descending confidence.
pub fn decode_predictions(
    predictions: ArrayView2<f32>,
    input_size: f32,
    min_confidence: f32,
    max_iou: f32,
) -> Vec<Detection> {
    if predictions.shape()[0] <= 4 {
        return Vec::new();
    }

    let mut candidates: Vec<Detection> = predictions
        .axis_iter(Axis(1))
        .filter_map(|candidate| {
            let (class_id, confidence) = candidate
                .slice(s![4..])
                .iter()
                .cloned()
                .enumerate()
                .fold((0, f32::MIN), |best, (id, score)| match score > best.1 {
                    true => (id, score),
                    false => best,
                });

            if confidence <= min_confidence {
                return None;
            }

            let (cx, cy, w, h) = (candidate[0], candidate[1], candidate[2], candidate[3]);
            let bbox = [
                ((cx - w / 2.0) / input_size).clamp(0.0, 1.0),
                ((cy - h / 2.0) / input_size).clamp(0.0, 1.0),
                ((cx + w / 2.0) / input_size).clamp(0.0, 1.0),
                ((cy + h / 2.0) / input_size).clamp(0.0, 1.0),
            ];

            Some(Detection {
                class_id,
                confidence,
                bbox,
            })
        })
        .collect();

    candidates.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    let mut selected = non_maximum_suppression(candidates, max_iou);
    selected.truncate(MAX_DETECTIONS);
    selected
}

/// Run non-maximum-suppression on candidate detections sorted by ascending confidence.
///
/// Start with the most confident candidate and iterate over all others in the order of sinking
/// confidence. A candidate is dropped if it overlaps an already selected detection of the same
/// class by more than `max_iou`.
pub fn non_maximum_suppression(
    mut sorted_candidates: Vec<Detection>,
    max_iou: f32,
) -> Vec<Detection> {
    let mut selected: Vec<Detection> = vec![];
    'candidates: loop {
        // Get next most confident candidate from the back of the ascending-sorted vector
        match sorted_candidates.pop() {
            Some(candidate) => {
                for chosen in selected.iter() {
                    if chosen.class_id == candidate.class_id
                        && iou(&candidate.bbox, &chosen.bbox) > max_iou
                    {
                        continue 'candidates;
                    }
                }

                selected.push(candidate)
            }
            None => break 'candidates,
        }
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
pub fn iou(bbox_a: &Bbox, bbox_b: &Bbox) -> f32 {
    // If the boxes do not overlap, the corner points of the overlap box are ill defined and its
    // area is zero.
    let overlap_box: Bbox = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box.
///
/// An ill-defined box with the bottom-right point above or left of the top-left point has zero
/// area.
fn bbox_area(bbox: &Bbox) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}
