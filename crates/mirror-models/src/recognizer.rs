//! ArcFace embedding extraction via ONNX Runtime.
//!
//! Works for both the ResNet-50 and MobileFaceNet exports: each takes a
//! 112x112 aligned crop and yields a 512-d vector, which is L2-normalized.

use crate::session::{load_session, OnnxError};
use image::imageops::{self, FilterType};
use image::GrayImage;
use mirror_core::{ProviderError, Recognizer, RecognizerFactory};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

pub struct ArcFaceRecognizer {
    model_file: &'static str,
    session: Option<Session>,
}

impl ArcFaceRecognizer {
    pub fn new(model_file: &'static str) -> Self {
        Self {
            model_file,
            session: None,
        }
    }

    fn embed(session: &mut Session, aligned: &GrayImage) -> Result<Vec<f32>, OnnxError> {
        let input = preprocess(aligned);
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| OnnxError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(OnnxError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        Ok(l2_normalize(raw))
    }
}

impl Recognizer for ArcFaceRecognizer {
    fn name(&self) -> &str {
        "arcface"
    }

    fn load_model(&mut self, root: &Path) -> Result<(), ProviderError> {
        self.session = Some(load_session(&root.join(self.model_file), "ArcFace")?);
        Ok(())
    }

    fn extract_feature(&mut self, aligned_face: &GrayImage) -> Result<Vec<f32>, ProviderError> {
        let session = self.session.as_mut().ok_or(ProviderError::NotLoaded)?;
        Ok(Self::embed(session, aligned_face)?)
    }
}

pub struct ArcFaceRecognizerFactory {
    pub model_file: &'static str,
}

impl RecognizerFactory for ArcFaceRecognizerFactory {
    fn create_recognizer(&self) -> Box<dyn Recognizer> {
        Box::new(ArcFaceRecognizer::new(self.model_file))
    }
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

/// Convert an aligned crop into a normalized NCHW tensor.
///
/// Crops that are not already 112x112 are resized first.
fn preprocess(aligned: &GrayImage) -> Array4<f32> {
    let resized;
    let face = if aligned.dimensions() == (ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE) {
        aligned
    } else {
        resized = imageops::resize(aligned, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, FilterType::Triangle);
        &resized
    };

    let size = ARCFACE_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in face.enumerate_pixels() {
        let normalized = (pixel[0] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = normalized;
        }
    }
    tensor
}
