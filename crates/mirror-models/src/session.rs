//! Shared ONNX Runtime session loading and error mapping.

use mirror_core::ProviderError;
use ort::session::Session;
use std::path::{Path, PathBuf};
use thiserror::Error;

const INTRA_THREADS: usize = 2;

#[derive(Error, Debug)]
pub enum OnnxError {
    #[error("model file not found: {0} (download from insightface and place under the model root)")]
    ModelNotFound(PathBuf),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<OnnxError> for ProviderError {
    fn from(err: OnnxError) -> Self {
        match err {
            OnnxError::ModelNotFound(path) => ProviderError::ModelNotFound(path),
            OnnxError::InferenceFailed(msg) => ProviderError::Inference(msg),
            OnnxError::Ort(e) => ProviderError::Backend(Box::new(e)),
        }
    }
}

/// Open an ONNX model as a CPU inference session.
pub(crate) fn load_session(path: &Path, kind: &str) -> Result<Session, OnnxError> {
    if !path.exists() {
        return Err(OnnxError::ModelNotFound(path.to_path_buf()));
    }

    let session = Session::builder()?
        .with_intra_threads(INTRA_THREADS)?
        .commit_from_file(path)?;

    tracing::info!(
        path = %path.display(),
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded {kind} model"
    );

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_maps_to_provider_error() {
        let err = load_session(Path::new("/nonexistent/det_10g.onnx"), "SCRFD").unwrap_err();
        assert!(matches!(err, OnnxError::ModelNotFound(_)));
        assert!(matches!(ProviderError::from(err), ProviderError::ModelNotFound(_)));
    }

    #[test]
    fn test_inference_failure_maps_to_provider_error() {
        let err = OnnxError::InferenceFailed("bad shape".into());
        match ProviderError::from(err) {
            ProviderError::Inference(msg) => assert_eq!(msg, "bad shape"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
