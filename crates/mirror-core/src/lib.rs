//! mirror-core: face recognition pipeline orchestration.
//!
//! Binds pluggable detection, landmark and embedding providers together with
//! alignment, tracking and a persistent gallery database behind one [`Engine`].

pub mod aligner;
pub mod compute;
pub mod engine;
pub mod gallery;
pub mod provider;
pub mod tracker;
pub mod types;

pub use engine::{Engine, EngineError, EngineOptions, FaceMatch, FrameMatch, Stage};
pub use gallery::{Gallery, GalleryError, PersistError};
pub use provider::{
    Detector, DetectorFactory, Landmarker, LandmarkerFactory, ProviderError, ProviderFactories,
    Recognizer, RecognizerFactory,
};
pub use tracker::{Tracker, TrackerConfig};
pub use types::{FaceInfo, GalleryRecord, Keypoints, Point2D, QueryResult, TrackState, TrackedFaceInfo};
