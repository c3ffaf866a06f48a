//! Dedicated extraction thread.
//!
//! Model inference is slow and needs `&mut` access to its sessions, so the
//! extractor lives on its own OS thread and async callers talk to it over a
//! channel. Nothing here touches a registry lock.

use crate::error::{RegistryError, Result};
use facereg_core::{EmbeddingExtractor, Embedding, ExtractError};
use tokio::sync::{mpsc, oneshot};

const QUEUE_DEPTH: usize = 32;

struct ExtractRequest {
    image: Vec<u8>,
    reply: oneshot::Sender<std::result::Result<Vec<Embedding>, ExtractError>>,
}

/// Clone-safe handle to the extraction thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<ExtractRequest>,
    model: String,
    dim: Option<usize>,
}

impl EngineHandle {
    /// Embed every face in the image. An empty vector means no face.
    pub async fn extract(&self, image: Vec<u8>) -> Result<Vec<Embedding>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ExtractRequest { image, reply })
            .await
            .map_err(|_| RegistryError::WorkerClosed)?;
        Ok(rx.await.map_err(|_| RegistryError::WorkerClosed)??)
    }

    /// Name reported by the extractor at spawn time.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Embedding dimension the extractor produces, if it is fixed.
    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    /// A handle with no extractor behind it, for operations that only read
    /// or remove records. Every `extract` fails with `WorkerClosed`.
    pub fn offline() -> Self {
        let (tx, _) = mpsc::channel(1);
        Self {
            tx,
            model: "none".into(),
            dim: None,
        }
    }

    /// False for an [`offline`](Self::offline) handle or once the thread has exited.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Move the extractor onto a named thread and return a handle to it.
///
/// The thread exits once every handle has been dropped.
pub fn spawn_engine(mut extractor: Box<dyn EmbeddingExtractor>) -> Result<EngineHandle> {
    let model = extractor.name().to_string();
    let dim = extractor.dim();
    let (tx, mut rx) = mpsc::channel::<ExtractRequest>(QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("facereg-engine".into())
        .spawn(move || {
            tracing::info!(model = extractor.name(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                // A caller that gave up (cancelled or timed out) no longer needs the work.
                if req.reply.is_closed() {
                    continue;
                }
                let started = std::time::Instant::now();
                let result = extractor.extract(&req.image);
                tracing::debug!(
                    bytes = req.image.len(),
                    faces = result.as_ref().map(Vec::len).unwrap_or(0),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "extraction finished"
                );
                let _ = req.reply.send(result);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(|e| RegistryError::io("facereg-engine thread", e))?;

    Ok(EngineHandle { tx, model, dim })
}
