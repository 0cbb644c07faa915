//! Face engine: the single owner of every pipeline stage.
//!
//! Sequencing per video frame:
//! detect → track → for each face: keypoints → align → feature → query.
//! Enrollment: feature → insert → (optionally) save.
//!
//! The engine starts unloaded. Every operation other than [`Engine::load_model`]
//! is rejected with [`EngineError::NotInitialized`] until all three models have
//! loaded from one root path.

use crate::aligner::Aligner;
use crate::compute::ComputeContext;
use crate::gallery::{Gallery, GalleryError};
use crate::provider::{Detector, Landmarker, ProviderError, ProviderFactories, Recognizer};
use crate::tracker::{Tracker, TrackerConfig};
use crate::types::{FaceInfo, GalleryRecord, Keypoints, QueryResult, TrackedFaceInfo};
use image::GrayImage;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Pipeline stage whose model failed to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Detector,
    Landmarker,
    Recognizer,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Detector => "detector",
            Stage::Landmarker => "landmarker",
            Stage::Recognizer => "recognizer",
        })
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model load failure ({stage}): {source}")]
    ModelLoad {
        stage: Stage,
        #[source]
        source: ProviderError,
    },
    #[error("engine not initialized: call load_model first")]
    NotInitialized,
    #[error("no face detected")]
    NoFace,
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
}

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub tracker: TrackerConfig,
    /// Save the gallery under the model root when the engine is dropped.
    pub flush_on_drop: bool,
}

/// One face in a still image and its best gallery match.
#[derive(Debug, Clone, Serialize)]
pub struct FaceMatch {
    pub face: FaceInfo,
    /// `None` while the gallery has no records or when this face failed.
    pub result: Option<QueryResult>,
    /// Why this face could not be embedded or matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One tracked face in a processed frame and its best gallery match.
#[derive(Debug, Clone, Serialize)]
pub struct FrameMatch {
    pub track: TrackedFaceInfo,
    /// `None` while the gallery has no records or when this face failed.
    pub result: Option<QueryResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Engine {
    // Fields drop in declaration order: the reverse of construction in `new`,
    // with the compute context released last.
    gallery: Gallery,
    aligner: Aligner,
    tracker: Tracker,
    recognizer: Box<dyn Recognizer>,
    landmarker: Box<dyn Landmarker>,
    detector: Box<dyn Detector>,
    store_key: Option<PathBuf>,
    initialized: bool,
    flush_on_drop: bool,
    _compute: ComputeContext,
}

impl Engine {
    /// Build an unloaded engine from one factory per stage.
    ///
    /// Factories are only needed to create the providers and are released here.
    pub fn new(factories: ProviderFactories, options: EngineOptions) -> Self {
        let compute = ComputeContext::acquire();
        let detector = factories.detector.create_detector();
        let landmarker = factories.landmarker.create_landmarker();
        let recognizer = factories.recognizer.create_recognizer();

        tracing::debug!(
            detector = detector.name(),
            landmarker = landmarker.name(),
            recognizer = recognizer.name(),
            "engine created"
        );

        let tracker = Tracker::new(options.tracker);
        let aligner = Aligner::new();
        let gallery = Gallery::new();

        Self {
            gallery,
            aligner,
            tracker,
            recognizer,
            landmarker,
            detector,
            store_key: None,
            initialized: false,
            flush_on_drop: options.flush_on_drop,
            _compute: compute,
        }
    }

    /// Load detector, landmarker and recognizer models from `root`, in that order.
    ///
    /// Stops at the first stage that fails. Providers that already loaded keep
    /// their new weights, and the engine's readiness is left as it was.
    pub fn load_model(&mut self, root: impl AsRef<Path>) -> Result<(), EngineError> {
        let root = root.as_ref();

        self.detector
            .load_model(root)
            .map_err(|source| load_failure(Stage::Detector, source))?;
        self.landmarker
            .load_model(root)
            .map_err(|source| load_failure(Stage::Landmarker, source))?;
        self.recognizer
            .load_model(root)
            .map_err(|source| load_failure(Stage::Recognizer, source))?;

        self.store_key = Some(root.to_path_buf());
        self.initialized = true;
        tracing::info!(root = %root.display(), "engine models loaded");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Root path recorded by the last successful `load_model`.
    pub fn store_key(&self) -> Option<&Path> {
        self.store_key.as_deref()
    }

    fn ensure_initialized(&self) -> Result<(), EngineError> {
        if self.initialized {
            Ok(())
        } else {
            Err(EngineError::NotInitialized)
        }
    }

    fn store_key_or_err(&self) -> Result<&Path, EngineError> {
        self.ensure_initialized()?;
        self.store_key.as_deref().ok_or(EngineError::NotInitialized)
    }

    pub fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceInfo>, EngineError> {
        self.ensure_initialized()?;
        Ok(self.detector.detect(image)?)
    }

    /// Associate this frame's detections with existing tracks.
    ///
    /// Must be called once per frame, in frame order.
    pub fn track(&mut self, faces: &[FaceInfo]) -> Result<Vec<TrackedFaceInfo>, EngineError> {
        self.ensure_initialized()?;
        Ok(self.tracker.track(faces))
    }

    pub fn extract_keypoints(
        &mut self,
        image: &GrayImage,
        face: &FaceInfo,
    ) -> Result<Keypoints, EngineError> {
        self.ensure_initialized()?;
        Ok(self.landmarker.extract_keypoints(image, face)?)
    }

    pub fn align_face(&self, image: &GrayImage, keypoints: &Keypoints) -> Result<GrayImage, EngineError> {
        self.ensure_initialized()?;
        Ok(self.aligner.align(image, keypoints))
    }

    pub fn extract_feature(&mut self, aligned_face: &GrayImage) -> Result<Vec<f32>, EngineError> {
        self.ensure_initialized()?;
        Ok(self.recognizer.extract_feature(aligned_face)?)
    }

    pub fn insert(&self, embedding: &[f32], label: &str) -> Result<i64, EngineError> {
        self.ensure_initialized()?;
        Ok(self.gallery.insert(embedding, label)?)
    }

    pub fn delete(&self, index: i64) -> Result<(), EngineError> {
        self.ensure_initialized()?;
        Ok(self.gallery.delete(index)?)
    }

    pub fn query_top(&self, embedding: &[f32]) -> Result<QueryResult, EngineError> {
        self.ensure_initialized()?;
        Ok(self.gallery.query_top(embedding)?)
    }

    pub fn query_top_k(&self, embedding: &[f32], k: usize) -> Result<Vec<QueryResult>, EngineError> {
        self.ensure_initialized()?;
        Ok(self.gallery.query_top_k(embedding, k)?)
    }

    /// Persist the gallery under the model root.
    pub fn save(&self) -> Result<(), EngineError> {
        let key = self.store_key_or_err()?;
        Ok(self.gallery.save(key)?)
    }

    /// Restore the gallery from the model root. On failure nothing changes.
    pub fn load(&self) -> Result<(), EngineError> {
        let key = self.store_key_or_err()?;
        Ok(self.gallery.load(key)?)
    }

    pub fn gallery_len(&self) -> Result<usize, EngineError> {
        self.ensure_initialized()?;
        Ok(self.gallery.len())
    }

    pub fn records(&self) -> Result<Vec<GalleryRecord>, EngineError> {
        self.ensure_initialized()?;
        Ok(self.gallery.records())
    }

    /// Embedding of one detected face: keypoints → align → feature.
    fn embed_face(&mut self, image: &GrayImage, face: &FaceInfo) -> Result<Vec<f32>, EngineError> {
        let keypoints = self.extract_keypoints(image, face)?;
        let aligned = self.align_face(image, &keypoints)?;
        self.extract_feature(&aligned)
    }

    /// Run the full per-frame pipeline on one video frame.
    pub fn process_frame(&mut self, image: &GrayImage) -> Result<Vec<FrameMatch>, EngineError> {
        let faces = self.detect(image)?;
        let tracked = self.track(&faces)?;

        let mut matches = Vec::with_capacity(tracked.len());
        for track in tracked {
            let (result, error) = self.match_face(image, &track.face)?;
            matches.push(FrameMatch { track, result, error });
        }

        tracing::debug!(faces = matches.len(), "frame processed");
        Ok(matches)
    }

    /// Identify every face in a still image. The tracker is not touched.
    pub fn identify(&mut self, image: &GrayImage) -> Result<Vec<FaceMatch>, EngineError> {
        let faces = self.detect(image)?;

        let mut matches = Vec::with_capacity(faces.len());
        for face in faces {
            let (result, error) = self.match_face(image, &face)?;
            matches.push(FaceMatch { face, result, error });
        }
        Ok(matches)
    }

    /// Embed and match one face. Failures local to this face are returned as
    /// the second element so the rest of the image is still reported.
    fn match_face(
        &mut self,
        image: &GrayImage,
        face: &FaceInfo,
    ) -> Result<(Option<QueryResult>, Option<String>), EngineError> {
        let outcome = self
            .embed_face(image, face)
            .and_then(|embedding| self.best_match(&embedding));
        match outcome {
            Ok(result) => Ok((result, None)),
            Err(e @ (EngineError::Provider(_) | EngineError::Gallery(GalleryError::InvalidEmbedding(_)))) => {
                tracing::warn!(error = %e, x = face.x, y = face.y, "face skipped");
                Ok((None, Some(e.to_string())))
            }
            Err(e) => Err(e),
        }
    }

    fn best_match(&self, embedding: &[f32]) -> Result<Option<QueryResult>, EngineError> {
        match self.gallery.query_top(embedding) {
            Ok(result) => Ok(Some(result)),
            Err(GalleryError::EmptyDatabase) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Enroll the most confident face in `image` under `label`.
    pub fn enroll(&mut self, image: &GrayImage, label: &str) -> Result<i64, EngineError> {
        let faces = self.detect(image)?;
        let face = faces
            .iter()
            .copied()
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
            .ok_or(EngineError::NoFace)?;

        let embedding = self.embed_face(image, &face)?;
        let index = self.insert(&embedding, label)?;
        tracing::info!(index, label, score = face.score, "face enrolled");
        Ok(index)
    }
}

fn load_failure(stage: Stage, source: ProviderError) -> EngineError {
    tracing::error!(%stage, error = %source, "model load failed");
    EngineError::ModelLoad { stage, source }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !(self.flush_on_drop && self.initialized) {
            return;
        }
        if let Some(key) = &self.store_key {
            if let Err(e) = self.gallery.save(key) {
                tracing::warn!(error = %e, "gallery flush on teardown failed");
            }
        }
    }
}
