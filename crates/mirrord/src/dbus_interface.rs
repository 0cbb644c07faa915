use crate::engine::{EngineHandle, WorkerError};
use mirror_core::{EngineError, FaceInfo, FaceMatch, FrameMatch, GalleryError, QueryResult, TrackedFaceInfo};
use mirror_models::ModelFamily;
use serde::Serialize;
use std::path::PathBuf;
use zbus::interface;

/// Well-known bus name and object path of the daemon.
pub const BUS_NAME: &str = "org.mirror.FaceEngine1";
pub const OBJECT_PATH: &str = "/org/mirror/FaceEngine1";

/// A query result with the daemon's match decision attached.
#[derive(Debug, Serialize)]
struct Verdict<'a> {
    index: i64,
    label: &'a str,
    score: f32,
    matched: bool,
}

impl<'a> Verdict<'a> {
    fn new(result: &'a QueryResult, threshold: f32) -> Self {
        Self {
            index: result.index,
            label: &result.label,
            score: result.score,
            matched: result.score >= threshold,
        }
    }
}

#[derive(Debug, Serialize)]
struct IdentifiedFace<'a> {
    face: &'a FaceInfo,
    best: Option<Verdict<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct TrackedFace<'a> {
    track: &'a TrackedFaceInfo,
    best: Option<Verdict<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct RecordSummary<'a> {
    index: i64,
    label: &'a str,
    dimension: usize,
}

fn identify_json(matches: &[FaceMatch], threshold: f32) -> serde_json::Value {
    let faces: Vec<IdentifiedFace> = matches
        .iter()
        .map(|m| IdentifiedFace {
            face: &m.face,
            best: m.result.as_ref().map(|r| Verdict::new(r, threshold)),
            error: m.error.as_deref(),
        })
        .collect();
    serde_json::json!({ "threshold": threshold, "faces": faces })
}

fn frame_json(matches: &[FrameMatch], threshold: f32) -> serde_json::Value {
    let faces: Vec<TrackedFace> = matches
        .iter()
        .map(|m| TrackedFace {
            track: &m.track,
            best: m.result.as_ref().map(|r| Verdict::new(r, threshold)),
            error: m.error.as_deref(),
        })
        .collect();
    serde_json::json!({ "threshold": threshold, "faces": faces })
}

/// Map worker failures onto D-Bus errors: caller mistakes become
/// `InvalidArgs`, everything else `Failed`.
fn to_fdo(err: WorkerError) -> zbus::fdo::Error {
    let message = err.to_string();
    match err {
        WorkerError::Image { .. }
        | WorkerError::Engine(EngineError::NoFace)
        | WorkerError::Engine(EngineError::Gallery(
            GalleryError::DimensionMismatch { .. } | GalleryError::InvalidEmbedding(_),
        )) => zbus::fdo::Error::InvalidArgs(message),
        _ => {
            tracing::warn!(error = %message, "request failed");
            zbus::fdo::Error::Failed(message)
        }
    }
}

/// D-Bus interface for the face engine daemon.
///
/// Bus name: org.mirror.FaceEngine1
/// Object path: /org/mirror/FaceEngine1
pub struct FaceEngineService {
    engine: EngineHandle,
    similarity_threshold: f32,
    model_family: ModelFamily,
    model_dir: PathBuf,
}

impl FaceEngineService {
    pub fn new(
        engine: EngineHandle,
        similarity_threshold: f32,
        model_family: ModelFamily,
        model_dir: PathBuf,
    ) -> Self {
        Self {
            engine,
            similarity_threshold,
            model_family,
            model_dir,
        }
    }
}

#[interface(name = "org.mirror.FaceEngine1")]
impl FaceEngineService {
    /// Enroll the most confident face in an image file. Returns the new index.
    async fn enroll(&self, image_path: &str, label: &str) -> zbus::fdo::Result<i64> {
        tracing::info!(image_path, label, "enroll requested");
        self.engine
            .enroll(PathBuf::from(image_path), label.to_string())
            .await
            .map_err(to_fdo)
    }

    /// Identify every face in a still image.
    async fn identify(&self, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::debug!(image_path, "identify requested");
        let matches = self
            .engine
            .identify(PathBuf::from(image_path))
            .await
            .map_err(to_fdo)?;
        Ok(identify_json(&matches, self.similarity_threshold).to_string())
    }

    /// Run an image through the pipeline as the next frame of a video stream.
    async fn process_frame(&self, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::debug!(image_path, "process_frame requested");
        let matches = self
            .engine
            .process_frame(PathBuf::from(image_path))
            .await
            .map_err(to_fdo)?;
        Ok(frame_json(&matches, self.similarity_threshold).to_string())
    }

    /// Remove a gallery record. Returns false if no record has that index.
    async fn delete(&self, index: i64) -> zbus::fdo::Result<bool> {
        tracing::info!(index, "delete requested");
        self.engine.delete(index).await.map_err(to_fdo)
    }

    /// List gallery records (embeddings omitted).
    async fn list_records(&self) -> zbus::fdo::Result<String> {
        let records = self.engine.list_records().await.map_err(to_fdo)?;
        let summaries: Vec<RecordSummary> = records
            .iter()
            .map(|r| RecordSummary {
                index: r.index,
                label: &r.label,
                dimension: r.embedding.len(),
            })
            .collect();
        serde_json::to_string(&summaries).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    async fn save(&self) -> zbus::fdo::Result<()> {
        tracing::info!("save requested");
        self.engine.save().await.map_err(to_fdo)
    }

    async fn load(&self) -> zbus::fdo::Result<()> {
        tracing::info!("load requested");
        self.engine.load().await.map_err(to_fdo)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "model_family": self.model_family.to_string(),
            "model_dir": self.model_dir,
            "models_loaded": status.initialized,
            "store_key": status.store_key,
            "records": status.records,
            "similarity_threshold": self.similarity_threshold,
        })
        .to_string())
    }
}
