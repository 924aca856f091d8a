//! Object detection with a YOLOv8 network exported to ONNX.
//!
//! The network is loaded once with `tract` and shared read-only between the upload handler and all
//! running streams through the `Detector` trait.
use std::path::Path;

use image::RgbImage;
use tract_onnx::prelude::tract_ndarray::{Array4, ArrayView2, Axis, Ix2};
use tract_onnx::prelude::*;

use crate::error::{InferenceError, ModelLoadError};
use crate::labels::class_label;

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Number of leading rows in the network output holding the box geometry.
const BOX_ROWS: usize = 4;

/// Axis-aligned bounding box with corners normalized to the image size.
///
/// `[x1, y1]` is the top left and `[x2, y2]` the bottom right corner, all values in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    /// Build a box from its center and size, clamping it to the unit square.
    pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        let clamp = |v: f32| v.clamp(0.0, 1.0);
        Self {
            x1: clamp(cx - width / 2.0),
            y1: clamp(cy - height / 2.0),
            x2: clamp(cx + width / 2.0),
            y2: clamp(cy + height / 2.0),
        }
    }

    /// Area enclosed by the box, zero if the corners are swapped.
    pub fn area(&self) -> f32 {
        let width = self.x2 - self.x1;
        let height = self.y2 - self.y1;
        if width < 0.0 || height < 0.0 {
            return 0.0;
        }

        width * height
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BBox) -> f32 {
        // For disjoint boxes the overlap corners are swapped and its area is zero.
        let overlap = BBox {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        };
        let overlap_area = overlap.area();

        overlap_area / (self.area() + other.area() - overlap_area + EPS)
    }

    /// Pixel rectangle `(x, y, width, height)` of the box in an image of the given size.
    pub fn to_pixels(&self, width: u32, height: u32) -> (i32, i32, u32, u32) {
        let (w, h) = (width as f32, height as f32);
        let (x_tl, y_tl) = ((self.x1 * w).round() as i32, (self.y1 * h).round() as i32);
        let (x_br, y_br) = ((self.x2 * w).round() as i32, (self.y2 * h).round() as i32);

        (
            x_tl,
            y_tl,
            (x_br - x_tl).max(1) as u32,
            (y_br - y_tl).max(1) as u32,
        )
    }
}

/// One labeled, confidence-scored bounding box.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BBox, class_id: usize, confidence: f32) -> Self {
        Self {
            bbox,
            class_id,
            label: class_label(class_id),
            confidence,
        }
    }
}

/// Stateless detector of objects in an image.
///
/// Implementations must not mutate the image and must be safe to call from several streams at once.
pub trait Detector: Send + Sync {
    /// Detect all objects with a confidence strictly above `min_confidence`.
    fn detect(
        &self,
        image: &RgbImage,
        min_confidence: f32,
    ) -> Result<Vec<Detection>, InferenceError>;
}

/// YOLOv8 detection network.
pub struct YoloModel {
    model: NnModel,
    width: u32,
    height: u32,
    max_iou: f32,
}

impl YoloModel {
    /// Load an ONNX export of YOLOv8 with a square input of `input_size` pixels.
    pub fn load(path: &Path, input_size: u32, max_iou: f32) -> Result<Self, ModelLoadError> {
        let model = load_onnx(path, input_size, input_size).map_err(|source| {
            ModelLoadError::Load {
                path: path.to_owned(),
                source,
            }
        })?;
        log::info!("Loaded model {} ({input_size}x{input_size})", path.display());

        Ok(Self {
            model,
            width: input_size,
            height: input_size,
            max_iou,
        })
    }

    fn preproc(&self, input: &RgbImage) -> Tensor {
        let resized: RgbImage = image::imageops::resize(
            input,
            self.width,
            self.height,
            image::imageops::FilterType::Triangle,
        );

        Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, c, y, x)| resized[(x as _, y as _)][c] as f32 / 255.0,
        )
        .into()
    }

    fn postproc(&self, output: &Tensor, min_confidence: f32) -> Result<Vec<Detection>, InferenceError> {
        let output = output.to_array_view::<f32>()?;
        let shape = output.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= BOX_ROWS {
            return Err(InferenceError::OutputShape(shape));
        }

        let output = output
            .index_axis(Axis(0), 0)
            .into_dimensionality::<Ix2>()
            .map_err(|e| InferenceError::Run(e.into()))?;

        Ok(postproc_yolo(
            output,
            (self.width, self.height),
            min_confidence,
            self.max_iou,
        ))
    }
}

impl Detector for YoloModel {
    fn detect(
        &self,
        image: &RgbImage,
        min_confidence: f32,
    ) -> Result<Vec<Detection>, InferenceError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(InferenceError::EmptyImage);
        }

        let raw_nn_out = self.model.run(tvec!(self.preproc(image).into()))?;
        let output = raw_nn_out
            .first()
            .ok_or_else(|| InferenceError::OutputShape(vec![]))?;

        self.postproc(output, min_confidence)
    }
}

fn load_onnx(path: &Path, width: u32, height: u32) -> TractResult<NnModel> {
    let input_fact = InferenceFact::dt_shape(
        f32::datum_type(),
        tvec!(1, 3, height as usize, width as usize),
    );

    tract_onnx::onnx()
        .model_for_path(path)?
        .with_input_fact(0, input_fact)?
        .into_optimized()?
        .into_runnable()
}

/// Turn the raw YOLOv8 output into detections.
///
/// The output has one column per anchor. The first four rows hold the box center and size in
/// pixels of the network input, the remaining rows one score per class. Candidates with a best
/// class score above `min_confidence` are ranked by score and thinned out per class with
/// non-maximum suppression.
pub fn postproc_yolo(
    output: ArrayView2<f32>,
    input_dims: (u32, u32),
    min_confidence: f32,
    max_iou: f32,
) -> Vec<Detection> {
    let (width, height) = (input_dims.0 as f32, input_dims.1 as f32);

    let mut candidates: Vec<Detection> = output
        .columns()
        .into_iter()
        .filter_map(|column| {
            let (class_id, confidence) = column
                .iter()
                .skip(BOX_ROWS)
                .cloned()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))?;
            if confidence <= min_confidence {
                return None;
            }

            let bbox = BBox::from_center(
                column[0] / width,
                column[1] / height,
                column[2] / width,
                column[3] / height,
            );
            Some(Detection::new(bbox, class_id, confidence))
        })
        .collect();

    // Stable sort keeps equally confident candidates in anchor order.
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    non_maximum_suppression(candidates, max_iou)
}

/// Run greedy non-maximum-suppression on candidates sorted by descending confidence.
///
/// A candidate is kept unless it overlaps an already kept box of the same class with an IoU above
/// `max_iou`.
fn non_maximum_suppression(sorted_candidates: Vec<Detection>, max_iou: f32) -> Vec<Detection> {
    let mut selected: Vec<Detection> = Vec::new();

    'candidates: for candidate in sorted_candidates {
        for kept in selected.iter() {
            if kept.class_id == candidate.class_id && kept.bbox.iou(&candidate.bbox) > max_iou {
                continue 'candidates;
            }
        }
        selected.push(candidate);
    }

    selected
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use tract_onnx::prelude::tract_ndarray::Array2;

    use super::*;

    /// Build a raw output with two classes from `(cx, cy, w, h, score_0, score_1)` anchors.
    fn raw_output(anchors: &[[f32; 6]]) -> Array2<f32> {
        Array2::from_shape_fn((6, anchors.len()), |(row, col)| anchors[col][row])
    }

    fn sample_anchors() -> Vec<[f32; 6]> {
        vec![
            [100.0, 100.0, 50.0, 50.0, 0.90, 0.05],
            // Overlaps the first box heavily, same class
            [102.0, 101.0, 50.0, 50.0, 0.80, 0.10],
            // Same place, other class
            [100.0, 100.0, 50.0, 50.0, 0.10, 0.70],
            [400.0, 300.0, 80.0, 120.0, 0.55, 0.20],
            [500.0, 500.0, 20.0, 20.0, 0.30, 0.45],
            [50.0, 600.0, 40.0, 40.0, 0.02, 0.01],
        ]
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BBox::from_center(0.5, 0.5, 0.2, 0.2);
        let b = BBox::from_center(0.1, 0.1, 0.1, 0.1);
        assert!((a.iou(&a) - 1.0).abs() < 1e-4);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn boxes_are_clamped_to_the_image() {
        let bbox = BBox::from_center(0.05, 0.95, 0.2, 0.2);
        assert_eq!(bbox.x1, 0.0);
        assert_eq!(bbox.y2, 1.0);
        assert!((bbox.x2 - 0.15).abs() < 1e-6);
    }

    #[test]
    fn suppression_is_per_class() {
        let output = raw_output(&sample_anchors());
        let detections = postproc_yolo(output.view(), (640, 640), 0.4, 0.45);

        let summary: Vec<(usize, f32)> = detections
            .iter()
            .map(|d| (d.class_id, d.confidence))
            .collect();
        assert_eq!(summary, vec![(0, 0.90), (1, 0.70), (0, 0.55), (1, 0.45)]);
        assert_eq!(detections[0].label, "person");
        assert_eq!(detections[1].label, "bicycle");
    }

    #[test]
    fn higher_threshold_never_yields_more_detections() {
        let output = raw_output(&sample_anchors());
        let thresholds = [0.0, 0.1, 0.25, 0.4, 0.5, 0.6, 0.75, 0.85, 0.95];

        let counts: Vec<usize> = thresholds
            .iter()
            .map(|t| postproc_yolo(output.view(), (640, 640), *t, 0.45).len())
            .collect();

        for pair in counts.windows(2) {
            assert!(pair[1] <= pair[0], "counts not monotonic: {counts:?}");
        }
        assert_eq!(counts.last(), Some(&0));
    }

    #[test]
    fn threshold_is_exclusive() {
        let output = raw_output(&[[10.0, 10.0, 4.0, 4.0, 0.5, 0.0]]);
        assert!(postproc_yolo(output.view(), (640, 640), 0.5, 0.45).is_empty());
        assert_eq!(postproc_yolo(output.view(), (640, 640), 0.49, 0.45).len(), 1);
    }

    #[test]
    fn box_is_normalized_to_input_size() {
        let output = raw_output(&[[320.0, 160.0, 64.0, 32.0, 0.9, 0.0]]);
        let detections = postproc_yolo(output.view(), (640, 320), 0.5, 0.45);

        let bbox = detections[0].bbox;
        assert!((bbox.x1 - 0.45).abs() < 1e-6);
        assert!((bbox.x2 - 0.55).abs() < 1e-6);
        assert!((bbox.y1 - 0.45).abs() < 1e-6);
        assert!((bbox.y2 - 0.55).abs() < 1e-6);
    }

    #[test]
    fn missing_model_fails_to_load() {
        let res = YoloModel::load(Path::new("does/not/exist.onnx"), 640, 0.45);
        assert!(matches!(res, Err(ModelLoadError::Load { .. })));
    }

    /// Needs `yolov8n.onnx` in the crate directory.
    #[test]
    #[ignore]
    fn run_yolov8n_inference() -> Result<(), Box<dyn std::error::Error>> {
        let path = PathBuf::from("yolov8n.onnx");
        let model = YoloModel::load(&path, 640, 0.45)?;

        let image = RgbImage::from_pixel(640, 480, image::Rgb([127, 127, 127]));
        let detections = model.detect(&image, 0.4)?;
        println!("Detections on gray image: {detections:?}");

        let empty = RgbImage::new(0, 0);
        assert!(matches!(
            model.detect(&empty, 0.4),
            Err(InferenceError::EmptyImage)
        ));

        Ok(())
    }
}
