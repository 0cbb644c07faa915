//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three strides followed by NMS. Every detection
//! carries the five alignment keypoints, which the landmarker reuses.

use crate::session::{load_session, OnnxError};
use image::imageops::{self, FilterType};
use image::GrayImage;
use mirror_core::{Detector, DetectorFactory, FaceInfo, Keypoints, ProviderError};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::cmp::Ordering;
use std::path::Path;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const SCRFD_OUTPUTS: usize = 9;

/// A face box with its keypoints, in source image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Detection {
    pub face: FaceInfo,
    pub keypoints: Keypoints,
}

/// Maps letterboxed coordinates back to the source image.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> (Self, u32, u32) {
        let size = SCRFD_INPUT_SIZE as f32;
        let scale = (size / width as f32).min(size / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
        let letterbox = Self {
            scale,
            pad_x: (SCRFD_INPUT_SIZE as u32 - new_w) as f32 / 2.0,
            pad_y: (SCRFD_INPUT_SIZE as u32 - new_h) as f32 / 2.0,
        };
        (letterbox, new_w, new_h)
    }

    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// (score, bbox, kps) output tensor indices for one stride.
type StrideOutputIndices = (usize, usize, usize);

/// A loaded SCRFD session.
pub(crate) struct Scrfd {
    session: Session,
    stride_indices: [StrideOutputIndices; 3],
}

impl Scrfd {
    pub(crate) fn load(path: &Path) -> Result<Self, OnnxError> {
        let session = load_session(path, "SCRFD")?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < SCRFD_OUTPUTS {
            return Err(OnnxError::InferenceFailed(format!(
                "SCRFD model requires {SCRFD_OUTPUTS} outputs (score/bbox/kps per stride), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            stride_indices,
        })
    }

    /// Detect faces, sorted by descending score.
    pub(crate) fn run(&mut self, image: &GrayImage) -> Result<Vec<Detection>, OnnxError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = preprocess(image);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut detections = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[slot];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| OnnxError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(score_idx, "scores")?;
            let bboxes = extract(bbox_idx, "bboxes")?;
            let kps = extract(kps_idx, "kps")?;

            detections.extend(decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        Ok(nms(detections, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox a grayscale image into a normalized NCHW tensor.
///
/// Padding is filled with the mean so it normalizes to zero. The single
/// channel is replicated into all three model channels.
fn preprocess(image: &GrayImage) -> (Array4<f32>, Letterbox) {
    let (letterbox, new_w, new_h) = Letterbox::fit(image.width(), image.height());
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let pad_x = letterbox.pad_x.floor() as usize;
    let pad_y = letterbox.pad_y.floor() as usize;
    let (new_w, new_h) = (new_w as usize, new_h as usize);

    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    for y in 0..SCRFD_INPUT_SIZE {
        for x in 0..SCRFD_INPUT_SIZE {
            let inside = (pad_y..pad_y + new_h).contains(&y) && (pad_x..pad_x + new_w).contains(&x);
            let pixel = if inside {
                resized.get_pixel((x - pad_x) as u32, (y - pad_y) as u32)[0] as f32
            } else {
                SCRFD_MEAN
            };
            let normalized = (pixel - SCRFD_MEAN) / SCRFD_STD;
            for c in 0..3 {
                tensor[[0, c, y, x]] = normalized;
            }
        }
    }

    (tensor, letterbox)
}

/// Map output tensors to stride slots.
///
/// Exports either name their tensors ("score_8", "bbox_16", "kps_32", ...)
/// or use generic numeric names, in which case the standard positional layout
/// applies: scores 0..3, bboxes 3..6, kps 6..9.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named {
        Some(found) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [found[0], found[1], found[2]]
        }
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<Detection> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let (Some(b), Some(k)) = (bboxes.get(idx * 4..idx * 4 + 4), kps.get(idx * 10..idx * 10 + 10))
        else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid_w) as f32 * s;
        let anchor_y = (cell / grid_w) as f32 * s;

        let (x1, y1) = letterbox.unmap(anchor_x - b[0] * s, anchor_y - b[1] * s);
        let (x2, y2) = letterbox.unmap(anchor_x + b[2] * s, anchor_y + b[3] * s);

        let keypoints: Keypoints = std::array::from_fn(|i| {
            letterbox.unmap(anchor_x + k[i * 2] * s, anchor_y + k[i * 2 + 1] * s)
        });

        detections.push(Detection {
            face: FaceInfo {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                score,
            },
            keypoints,
        });
    }
    detections
}

/// Greedy non-maximum suppression. Output is sorted by descending score.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.face.score.partial_cmp(&a.face.score).unwrap_or(Ordering::Equal));

    let mut keep: Vec<Detection> = Vec::new();
    for candidate in detections {
        if keep.iter().all(|k| k.face.iou(&candidate.face) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Detection provider backed by an SCRFD model file.
pub struct ScrfdDetector {
    model_file: &'static str,
    model: Option<Scrfd>,
}

impl ScrfdDetector {
    pub fn new(model_file: &'static str) -> Self {
        Self {
            model_file,
            model: None,
        }
    }
}

impl Detector for ScrfdDetector {
    fn name(&self) -> &str {
        "scrfd"
    }

    fn load_model(&mut self, root: &Path) -> Result<(), ProviderError> {
        self.model = Some(Scrfd::load(&root.join(self.model_file))?);
        Ok(())
    }

    fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceInfo>, ProviderError> {
        let model = self.model.as_mut().ok_or(ProviderError::NotLoaded)?;
        Ok(model.run(image)?.into_iter().map(|d| d.face).collect())
    }
}

pub struct ScrfdDetectorFactory {
    pub model_file: &'static str,
}

impl DetectorFactory for ScrfdDetectorFactory {
    fn create_detector(&self) -> Box<dyn Detector> {
        Box::new(ScrfdDetector::new(self.model_file))
    }
}
