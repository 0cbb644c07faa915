//! Dedicated engine thread.
//!
//! The engine owns blocking ONNX sessions, so it lives on its own OS thread and
//! serves requests from D-Bus handlers one at a time.

use image::GrayImage;
use mirror_core::{
    Engine, EngineError, EngineOptions, FaceMatch, FrameMatch, GalleryError, GalleryRecord,
    PersistError,
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;

const REQUEST_QUEUE_DEPTH: usize = 8;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("cannot read image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Snapshot of engine state for status queries.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub initialized: bool,
    pub store_key: Option<PathBuf>,
    pub records: Option<usize>,
}

type Reply<T> = oneshot::Sender<Result<T, WorkerError>>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        image_path: PathBuf,
        label: String,
        reply: Reply<i64>,
    },
    Identify {
        image_path: PathBuf,
        reply: Reply<Vec<FaceMatch>>,
    },
    ProcessFrame {
        image_path: PathBuf,
        reply: Reply<Vec<FrameMatch>>,
    },
    Delete {
        index: i64,
        reply: Reply<bool>,
    },
    ListRecords {
        reply: Reply<Vec<GalleryRecord>>,
    },
    Save {
        reply: Reply<()>,
    },
    Load {
        reply: Reply<()>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| WorkerError::ChannelClosed)?
    }

    /// Enroll the most confident face in the image under `label`.
    pub async fn enroll(&self, image_path: PathBuf, label: String) -> Result<i64, WorkerError> {
        self.call(|reply| EngineRequest::Enroll { image_path, label, reply }).await
    }

    /// Identify every face in a still image.
    pub async fn identify(&self, image_path: PathBuf) -> Result<Vec<FaceMatch>, WorkerError> {
        self.call(|reply| EngineRequest::Identify { image_path, reply }).await
    }

    /// Feed the next frame of a video stream through tracking and identification.
    pub async fn process_frame(&self, image_path: PathBuf) -> Result<Vec<FrameMatch>, WorkerError> {
        self.call(|reply| EngineRequest::ProcessFrame { image_path, reply }).await
    }

    /// Delete a record. Returns `false` when no record has that index.
    pub async fn delete(&self, index: i64) -> Result<bool, WorkerError> {
        self.call(|reply| EngineRequest::Delete { index, reply }).await
    }

    pub async fn list_records(&self) -> Result<Vec<GalleryRecord>, WorkerError> {
        self.call(|reply| EngineRequest::ListRecords { reply }).await
    }

    pub async fn save(&self) -> Result<(), WorkerError> {
        self.call(|reply| EngineRequest::Save { reply }).await
    }

    pub async fn load(&self) -> Result<(), WorkerError> {
        self.call(|reply| EngineRequest::Load { reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| WorkerError::ChannelClosed)
    }

    /// Stop the engine thread. Resolves once the engine has been dropped,
    /// so any flush-on-exit save has completed.
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Shutdown { reply: reply_tx })
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| WorkerError::ChannelClosed)
    }
}

/// Build the engine for the configured model family and load its models.
///
/// Fails fast if any model is missing. When configured, a stored gallery
/// under the model directory is restored; a missing store is not an error.
pub fn build_engine(config: &Config) -> Result<Engine, WorkerError> {
    let options = EngineOptions {
        tracker: config.tracker,
        flush_on_drop: config.flush_on_exit,
    };
    let mut engine = Engine::new(config.model_family.factories(), options);
    engine.load_model(&config.model_dir)?;
    tracing::info!(
        family = %config.model_family,
        model_dir = %config.model_dir.display(),
        "models loaded"
    );

    if config.load_gallery {
        match engine.load() {
            Ok(()) => tracing::info!(records = engine.gallery_len()?, "gallery restored"),
            Err(EngineError::Gallery(GalleryError::Persistence(PersistError::Missing(path)))) => {
                tracing::info!(path = %path.display(), "no stored gallery, starting empty");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(engine)
}

/// Move `engine` onto a dedicated OS thread and return a handle to it.
pub fn spawn_engine(engine: Engine) -> Result<EngineHandle, WorkerError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(REQUEST_QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("mirror-engine".into())
        .spawn(move || {
            let mut engine = engine;
            tracing::info!("engine thread started");
            let mut shutdown_reply = None;
            while let Some(req) = rx.blocking_recv() {
                if let Some(reply) = handle_request(&mut engine, req) {
                    shutdown_reply = Some(reply);
                    break;
                }
            }
            drop(rx);
            drop(engine);
            tracing::info!("engine thread exiting");
            if let Some(reply) = shutdown_reply {
                let _ = reply.send(());
            }
        })?;

    Ok(EngineHandle { tx })
}

/// Serve one request. Returns the shutdown acknowledgement when asked to stop.
fn handle_request(engine: &mut Engine, req: EngineRequest) -> Option<oneshot::Sender<()>> {
    match req {
        EngineRequest::Enroll {
            image_path,
            label,
            reply,
        } => {
            let result = read_image(&image_path)
                .and_then(|image| Ok(engine.enroll(&image, &label)?));
            let _ = reply.send(result);
        }
        EngineRequest::Identify { image_path, reply } => {
            let result = read_image(&image_path).and_then(|image| Ok(engine.identify(&image)?));
            let _ = reply.send(result);
        }
        EngineRequest::ProcessFrame { image_path, reply } => {
            let result =
                read_image(&image_path).and_then(|image| Ok(engine.process_frame(&image)?));
            let _ = reply.send(result);
        }
        EngineRequest::Delete { index, reply } => {
            let result = match engine.delete(index) {
                Ok(()) => Ok(true),
                Err(EngineError::Gallery(GalleryError::NotFound(_))) => Ok(false),
                Err(e) => Err(e.into()),
            };
            let _ = reply.send(result);
        }
        EngineRequest::ListRecords { reply } => {
            let _ = reply.send(engine.records().map_err(Into::into));
        }
        EngineRequest::Save { reply } => {
            let _ = reply.send(engine.save().map_err(Into::into));
        }
        EngineRequest::Load { reply } => {
            let _ = reply.send(engine.load().map_err(Into::into));
        }
        EngineRequest::Status { reply } => {
            let _ = reply.send(EngineStatus {
                initialized: engine.is_initialized(),
                store_key: engine.store_key().map(Path::to_path_buf),
                records: engine.gallery_len().ok(),
            });
        }
        EngineRequest::Shutdown { reply } => return Some(reply),
    }
    None
}

fn read_image(path: &Path) -> Result<GrayImage, WorkerError> {
    let image = image::open(path).map_err(|source| WorkerError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), width = image.width(), height = image.height(), "image decoded");
    Ok(image.into_luma8())
}
