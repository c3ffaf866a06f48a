use thiserror::Error;

/// Errors raised by an [`EmbeddingExtractor`](crate::extractor::EmbeddingExtractor).
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("model file not found: {0}; download it from insightface into the model directory")]
    ModelNotFound(String),
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Failure kinds shared by enrollment, matching and persistence.
#[derive(Error, Debug)]
pub enum FaceError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("source not found: {0}")]
    SourceNotFound(String),
    #[error("embedding dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("registry store corrupt: {0}")]
    StoreCorrupt(String),
    #[error("probe {0} was not enrolled after sync")]
    ProbeOwnRecordMissing(String),
    #[error("extractor: {0}")]
    Extractor(#[from] ExtractError),
}

impl FaceError {
    /// Stable name of the failure kind, surfaced to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            FaceError::NoFaceDetected => "NoFaceDetected",
            FaceError::SourceNotFound(_) => "SourceNotFound",
            FaceError::DimensionMismatch { .. } => "DimensionMismatch",
            FaceError::StoreCorrupt(_) => "StoreCorrupt",
            FaceError::ProbeOwnRecordMissing(_) => "ProbeOwnRecordMissing",
            FaceError::Extractor(_) => "ExtractorFailed",
        }
    }
}
