//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three strides followed by NMS. Input images
//! are letterboxed into the top-left corner of a 640x640 canvas.

use crate::error::ExtractError;
use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Output tensor positions for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
}

/// SCRFD-based multi-face detector.
pub struct FaceDetector {
    session: Session,
    layout: [StrideOutputs; 3],
    max_faces: usize,
}

impl FaceDetector {
    /// Load the SCRFD ONNX model. At most `max_faces` faces are returned per image.
    pub fn load(model_path: &Path, max_faces: usize) -> Result<Self, ExtractError> {
        if !model_path.exists() {
            return Err(ExtractError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if names.len() < 6 {
            return Err(ExtractError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }

        let layout = output_layout(&names);
        tracing::info!(path = %model_path.display(), outputs = ?names, ?layout, "loaded SCRFD model");

        Ok(Self {
            session,
            layout,
            max_faces,
        })
    }

    /// Detect faces, highest confidence first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, ExtractError> {
        let (input, scale) = letterbox(image);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut detections = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let layout = self.layout[slot];
            let (_, scores) = outputs[layout.score]
                .try_extract_tensor::<f32>()
                .map_err(|e| ExtractError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[layout.bbox]
                .try_extract_tensor::<f32>()
                .map_err(|e| ExtractError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            detections.extend(decode_stride(scores, boxes, stride, scale));
        }

        let mut faces: Vec<BoundingBox> = nms(detections, SCRFD_NMS_THRESHOLD)
            .into_iter()
            .filter_map(|f| clip(f, image.width() as f32, image.height() as f32))
            .collect();
        faces.truncate(self.max_faces);

        tracing::debug!(faces = faces.len(), "SCRFD detection complete");
        Ok(faces)
    }
}

/// Resize into the top-left of the square input, returning the tensor and
/// the applied scale. Padding normalizes to zero.
fn letterbox(image: &RgbImage) -> (Array4<f32>, f32) {
    let (w, h) = (image.width().max(1), image.height().max(1));
    let scale = SCRFD_INPUT_SIZE as f32 / w.max(h) as f32;
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }
    (tensor, scale)
}

/// Prefer `score_<stride>` / `bbox_<stride>` names; otherwise assume the
/// standard export order (scores 8/16/32, then boxes 8/16/32).
fn output_layout(names: &[String]) -> [StrideOutputs; 3] {
    let position = |kind: &str, stride: usize| {
        let target = format!("{kind}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideOutputs {
                score: position("score", stride)?,
                bbox: position("bbox", stride)?,
            })
        })
        .collect();

    match named.as_deref() {
        Some(&[a, b, c]) => [a, b, c],
        _ => [
            StrideOutputs { score: 0, bbox: 3 },
            StrideOutputs { score: 1, bbox: 4 },
            StrideOutputs { score: 2, bbox: 5 },
        ],
    }
}

/// Decode one stride's anchors into boxes in source image coordinates.
fn decode_stride(scores: &[f32], boxes: &[f32], stride: usize, scale: f32) -> Vec<BoundingBox> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= SCRFD_CONFIDENCE_THRESHOLD {
                return None;
            }
            let offsets = boxes.get(idx * 4..idx * 4 + 4)?;

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * step;
            let cy = (cell / grid) as f32 * step;

            let x1 = (cx - offsets[0] * step) / scale;
            let y1 = (cy - offsets[1] * step) / scale;
            let x2 = (cx + offsets[2] * step) / scale;
            let y2 = (cy + offsets[3] * step) / scale;

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(detections.len());
    for det in detections {
        if kept.iter().all(|k| iou(k, &det) <= iou_threshold) {
            kept.push(det);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Clamp a box to the image; drops boxes with no area left.
fn clip(face: BoundingBox, width: f32, height: f32) -> Option<BoundingBox> {
    let x1 = face.x.clamp(0.0, width);
    let y1 = face.y.clamp(0.0, height);
    let x2 = (face.x + face.width).clamp(0.0, width);
    let y2 = (face.y + face.height).clamp(0.0, height);
    (x2 > x1 && y2 > y1).then(|| BoundingBox {
        x: x1,
        y: y1,
        width: x2 - x1,
        height: y2 - y1,
        confidence: face.confidence,
    })
}
