//! Capability provider contracts consumed by the engine.
//!
//! Each pipeline stage (detection, landmarks, embedding) is implemented by a
//! provider that is produced by a matching factory. The engine only sees these
//! traits, so a different model family can be substituted without changes.

use crate::types::{FaceInfo, Keypoints};
use image::GrayImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("model file not found: {0}")]
    ModelNotFound(PathBuf),
    #[error("model not loaded")]
    NotLoaded,
    #[error("no face found in region")]
    NoFace,
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Face detector.
pub trait Detector: Send {
    /// Short backend name used in logs (e.g., "scrfd").
    fn name(&self) -> &str;

    /// Locate and load the detection model beneath `root`.
    fn load_model(&mut self, root: &Path) -> Result<(), ProviderError>;

    /// Detect all faces in `image`. An empty result is not an error.
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceInfo>, ProviderError>;
}

/// Facial landmark localizer.
pub trait Landmarker: Send {
    fn name(&self) -> &str;

    fn load_model(&mut self, root: &Path) -> Result<(), ProviderError>;

    /// Localize the five alignment keypoints of one face.
    fn extract_keypoints(
        &mut self,
        image: &GrayImage,
        face: &FaceInfo,
    ) -> Result<Keypoints, ProviderError>;
}

/// Face embedding extractor.
pub trait Recognizer: Send {
    fn name(&self) -> &str;

    fn load_model(&mut self, root: &Path) -> Result<(), ProviderError>;

    /// Extract an identity embedding from an aligned face crop.
    fn extract_feature(&mut self, aligned_face: &GrayImage) -> Result<Vec<f32>, ProviderError>;
}

pub trait DetectorFactory {
    fn create_detector(&self) -> Box<dyn Detector>;
}

pub trait LandmarkerFactory {
    fn create_landmarker(&self) -> Box<dyn Landmarker>;
}

pub trait RecognizerFactory {
    fn create_recognizer(&self) -> Box<dyn Recognizer>;
}

/// One factory per pipeline stage, chosen at configuration time.
pub struct ProviderFactories {
    pub detector: Box<dyn DetectorFactory>,
    pub landmarker: Box<dyn LandmarkerFactory>,
    pub recognizer: Box<dyn RecognizerFactory>,
}
