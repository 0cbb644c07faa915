//! ONNX model backends for the mirror face pipeline.
//!
//! Models come from the insightface `buffalo_*` packs and are looked up by
//! file name beneath a model root directory.

pub mod landmarker;
pub mod recognizer;
pub mod scrfd;
mod session;

pub use landmarker::{ScrfdLandmarker, ScrfdLandmarkerFactory};
pub use recognizer::{ArcFaceRecognizer, ArcFaceRecognizerFactory, ARCFACE_EMBEDDING_DIM};
pub use scrfd::{ScrfdDetector, ScrfdDetectorFactory};
pub use session::OnnxError;

use mirror_core::ProviderFactories;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Default model root when none is configured.
pub fn default_model_dir() -> PathBuf {
    if let Some(data) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(data).join("mirror/models");
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/mirror/models"),
        None => PathBuf::from("/usr/share/mirror/models"),
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("unknown model family {0:?} (expected buffalo_l or buffalo_s)")]
pub struct UnknownFamily(pub String);

/// A matched detector/recognizer pair from one insightface pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelFamily {
    /// SCRFD-10G detector with the ResNet-50 ArcFace recognizer.
    #[default]
    BuffaloL,
    /// SCRFD-500M detector with the MobileFaceNet recognizer.
    BuffaloS,
}

impl ModelFamily {
    pub fn detector_file(self) -> &'static str {
        match self {
            ModelFamily::BuffaloL => "det_10g.onnx",
            ModelFamily::BuffaloS => "det_500m.onnx",
        }
    }

    pub fn recognizer_file(self) -> &'static str {
        match self {
            ModelFamily::BuffaloL => "w600k_r50.onnx",
            ModelFamily::BuffaloS => "w600k_mbf.onnx",
        }
    }

    /// Provider factories for every pipeline stage of this family.
    pub fn factories(self) -> ProviderFactories {
        ProviderFactories {
            detector: Box::new(ScrfdDetectorFactory {
                model_file: self.detector_file(),
            }),
            landmarker: Box::new(ScrfdLandmarkerFactory {
                model_file: self.detector_file(),
            }),
            recognizer: Box::new(ArcFaceRecognizerFactory {
                model_file: self.recognizer_file(),
            }),
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelFamily::BuffaloL => "buffalo_l",
            ModelFamily::BuffaloS => "buffalo_s",
        })
    }
}

impl FromStr for ModelFamily {
    type Err = UnknownFamily;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buffalo_l" => Ok(ModelFamily::BuffaloL),
            "buffalo_s" => Ok(ModelFamily::BuffaloS),
            _ => Err(UnknownFamily(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::{Engine, EngineError, EngineOptions, Stage};
    use std::path::Path;

    #[test]
    fn test_family_parse_and_display() {
        assert_eq!("buffalo_l".parse(), Ok(ModelFamily::BuffaloL));
        assert_eq!(" BUFFALO_S ".parse(), Ok(ModelFamily::BuffaloS));
        assert_eq!(
            "antelopev2".parse::<ModelFamily>(),
            Err(UnknownFamily("antelopev2".into()))
        );
        for family in [ModelFamily::BuffaloL, ModelFamily::BuffaloS] {
            assert_eq!(family.to_string().parse(), Ok(family));
        }
    }

    #[test]
    fn test_family_file_names() {
        assert_eq!(ModelFamily::BuffaloL.detector_file(), "det_10g.onnx");
        assert_eq!(ModelFamily::BuffaloS.recognizer_file(), "w600k_mbf.onnx");
    }

    #[test]
    fn test_engine_reports_missing_detector_model() {
        let mut engine = Engine::new(ModelFamily::BuffaloL.factories(), EngineOptions::default());
        match engine.load_model(Path::new("/nonexistent/models")) {
            Err(EngineError::ModelLoad { stage, .. }) => assert_eq!(stage, Stage::Detector),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!engine.is_initialized());
    }
}
