use facereg_core::{ExtractError, FaceError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Face(#[from] FaceError),
    #[error("invalid registry name {0:?}: use 1-64 of [A-Za-z0-9_-]")]
    InvalidName(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
    #[error("operation cancelled")]
    Cancelled,
    #[error("extraction worker exited")]
    WorkerClosed,
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl RegistryError {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        RegistryError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Stable name of the failure kind, surfaced to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::Face(e) => e.kind(),
            RegistryError::InvalidName(_) => "InvalidName",
            RegistryError::InvalidRequest(_) | RegistryError::Base64(_) => "InvalidRequest",
            RegistryError::Io { .. } => "Io",
            RegistryError::Json(_) => "Serialization",
            RegistryError::Cancelled => "Cancelled",
            RegistryError::WorkerClosed => "WorkerClosed",
            RegistryError::Task(_) => "Internal",
        }
    }

    /// Whether this is the "image has no face" outcome rather than a fault.
    pub fn is_no_face(&self) -> bool {
        matches!(self, RegistryError::Face(FaceError::NoFaceDetected))
    }
}

impl From<ExtractError> for RegistryError {
    fn from(e: ExtractError) -> Self {
        RegistryError::Face(FaceError::Extractor(e))
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
