//! Object detector over the shared session.
//!
//! Input is a `[B, 3, 640, 640]` tensor assembled from raw BGR frames with
//! an aspect-preserving letterbox; output rows are `(x1, y1, x2, y2,
//! score, class)` in input pixels, decoded back to normalized frame
//! coordinates, thresholded and run through greedy per-class NMS.

use std::sync::Arc;

use tract_onnx::prelude::Tensor;

use crate::config::DetectionConfig;
use crate::inference::session::{InferenceError, InferenceSession, TensorPool};
use crate::types::{BoundingBox, Detection, RawFrame, FRAME_HEIGHT, FRAME_WIDTH};

pub const DETECTOR_INPUT: usize = 640;

/// COCO class labels in model output order.
pub const LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich",
    "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote",
    "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book",
    "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

pub const PERSON_CLASS: u32 = 0;
const VEHICLE_CLASSES: [u32; 5] = [1, 2, 3, 5, 7];

pub fn label_for(class_id: u32) -> &'static str {
    LABELS.get(class_id as usize).copied().unwrap_or("unknown")
}

pub fn is_person(class_id: u32) -> bool {
    class_id == PERSON_CLASS
}

pub fn is_vehicle(class_id: u32) -> bool {
    VEHICLE_CLASSES.contains(&class_id)
}

/// Letterbox geometry from a source frame into the square detector input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    pub fn for_frame(width: u32, height: u32, target: usize) -> Self {
        let target = target as f32;
        let scale = (target / width as f32).min(target / height as f32);
        let pad_x = (target - width as f32 * scale) / 2.0;
        let pad_y = (target - height as f32 * scale) / 2.0;
        Self { scale, pad_x, pad_y }
    }

    /// Maps an input-pixel coordinate back to normalized frame space.
    pub fn to_norm(&self, x: f32, y: f32, width: u32, height: u32) -> (f32, f32) {
        let nx = (x - self.pad_x) / (width as f32 * self.scale);
        let ny = (y - self.pad_y) / (height as f32 * self.scale);
        (nx.clamp(0.0, 1.0), ny.clamp(0.0, 1.0))
    }
}

pub struct Detector {
    session: Arc<InferenceSession>,
    pool: TensorPool,
    cfg: DetectionConfig,
}

impl Detector {
    pub fn new(session: Arc<InferenceSession>, pool: TensorPool, cfg: DetectionConfig) -> Self {
        Self { session, pool, cfg }
    }

    /// Runs one batch. Output order matches input order; frames without
    /// detections get an empty list.
    pub async fn detect(&self, frames: &[RawFrame]) -> Result<Vec<Vec<Detection>>, InferenceError> {
        if frames.is_empty() {
            return Ok(Vec::new());
        }

        let staged = self.preprocess(frames);
        let input = staged.to_tensor()?;
        drop(staged); // staging buffer back to the pool before the forward pass

        let outputs = self.session.run(vec![input]).await?;
        let output = outputs
            .first()
            .ok_or_else(|| InferenceError::Output("detector produced no outputs".to_string()))?;
        decode_output(output, frames, &self.cfg)
    }

    fn preprocess(&self, frames: &[RawFrame]) -> crate::inference::session::TensorBuf {
        let batch = frames.len();
        let mut buf = self
            .pool
            .rent(&[batch, 3, DETECTOR_INPUT, DETECTOR_INPUT]);
        for (b, frame) in frames.iter().enumerate() {
            stage_frame(&frame.pixels, &mut buf[b * 3 * DETECTOR_INPUT * DETECTOR_INPUT..]);
        }
        buf
    }
}

/// Writes one 640×480 BGR frame into a 3×640×640 CHW RGB slot, normalized
/// to `[0, 1]`, letterboxed with zero padding.
fn stage_frame(pixels: &[u8], dst: &mut [f32]) {
    let lb = Letterbox::for_frame(FRAME_WIDTH, FRAME_HEIGHT, DETECTOR_INPUT);
    let plane = DETECTOR_INPUT * DETECTOR_INPUT;
    let (w, h) = (FRAME_WIDTH as usize, FRAME_HEIGHT as usize);

    for y in 0..DETECTOR_INPUT {
        let src_y = ((y as f32 - lb.pad_y) / lb.scale) as isize;
        if src_y < 0 || src_y >= h as isize {
            continue; // padding rows stay zero
        }
        for x in 0..DETECTOR_INPUT {
            let src_x = ((x as f32 - lb.pad_x) / lb.scale) as isize;
            if src_x < 0 || src_x >= w as isize {
                continue;
            }
            let src = (src_y as usize * w + src_x as usize) * 3;
            let (b, g, r) = (pixels[src], pixels[src + 1], pixels[src + 2]);
            let idx = y * DETECTOR_INPUT + x;
            dst[idx] = f32::from(r) / 255.0;
            dst[plane + idx] = f32::from(g) / 255.0;
            dst[2 * plane + idx] = f32::from(b) / 255.0;
        }
    }
}

/// Decodes `[B, N, 6]` detector output into per-frame detections.
pub(crate) fn decode_output(
    output: &Tensor,
    frames: &[RawFrame],
    cfg: &DetectionConfig,
) -> Result<Vec<Vec<Detection>>, InferenceError> {
    let shape = output.shape();
    if shape.len() != 3 || shape[2] < 6 {
        return Err(InferenceError::Output(format!(
            "expected [B, N, 6] detector output, got {shape:?}"
        )));
    }
    if shape[0] != frames.len() {
        return Err(InferenceError::Output(format!(
            "batch mismatch: {} frames, {} output rows",
            frames.len(),
            shape[0]
        )));
    }

    let data = output
        .as_slice::<f32>()
        .map_err(|e| InferenceError::Output(e.to_string()))?;
    let (rows, stride) = (shape[1], shape[2]);
    let lb = Letterbox::for_frame(FRAME_WIDTH, FRAME_HEIGHT, DETECTOR_INPUT);

    let mut all = Vec::with_capacity(frames.len());
    for (b, frame) in frames.iter().enumerate() {
        let mut candidates = Vec::new();
        for n in 0..rows {
            let row = &data[(b * rows + n) * stride..(b * rows + n) * stride + stride];
            let score = row[4];
            if score < cfg.confidence_threshold {
                continue;
            }
            let class_id = row[5] as u32;
            let (x1, y1) = lb.to_norm(row[0], row[1], FRAME_WIDTH, FRAME_HEIGHT);
            let (x2, y2) = lb.to_norm(row[2], row[3], FRAME_WIDTH, FRAME_HEIGHT);
            if x2 <= x1 || y2 <= y1 {
                continue;
            }
            candidates.push(Detection {
                class_id,
                label: label_for(class_id).to_string(),
                confidence: score.clamp(0.0, 1.0),
                bbox: BoundingBox { x1, y1, x2, y2 },
                camera_id: frame.camera_id.clone(),
                frame_no: frame.frame_no,
                timestamp: frame.captured_at,
                key_frame_id: None,
            });
        }
        all.push(non_max_suppress(candidates, cfg.nms_iou_threshold));
    }
    Ok(all)
}

/// Greedy per-class non-maximum suppression, highest confidence first.
pub(crate) fn non_max_suppress(mut candidates: Vec<Detection>, iou: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut kept: Vec<Detection> = Vec::new();
    for det in candidates {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == det.class_id && k.bbox.iou(&det.bbox) > iou);
        if !suppressed {
            kept.push(det);
        }
    }
    kept
}
