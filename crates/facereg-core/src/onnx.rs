//! SCRFD + ArcFace pipeline behind [`EmbeddingExtractor`].

use crate::detector::FaceDetector;
use crate::error::ExtractError;
use crate::extractor::EmbeddingExtractor;
use crate::recognizer::{FaceRecognizer, ARCFACE_EMBEDDING_DIM};
use crate::types::Embedding;
use std::path::{Path, PathBuf};

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";
const DEFAULT_MAX_FACES: usize = 16;

/// Model directory used when none is configured:
/// `$XDG_DATA_HOME/facereg/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facereg/models")
}

/// Detects every face in an image and embeds each one.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    /// Load both models from `model_dir`. Fails fast if either file is missing.
    pub fn load(model_dir: &Path) -> Result<Self, ExtractError> {
        let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE), DEFAULT_MAX_FACES)?;
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn extract(&mut self, image: &[u8]) -> Result<Vec<Embedding>, ExtractError> {
        let rgb = image::load_from_memory(image)?.to_rgb8();
        let faces = self.detector.detect(&rgb)?;

        let embeddings = faces
            .iter()
            .map(|face| self.recognizer.embed(&rgb, face))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            width = rgb.width(),
            height = rgb.height(),
            faces = embeddings.len(),
            "extracted embeddings"
        );
        Ok(embeddings)
    }

    fn name(&self) -> &str {
        "scrfd-arcface-w600k_r50"
    }

    fn dim(&self) -> Option<usize> {
        Some(ARCFACE_EMBEDDING_DIM)
    }
}
