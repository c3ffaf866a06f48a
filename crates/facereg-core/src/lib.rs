//! facereg-core — face embeddings, similarity matching and identity resolution.
//!
//! Uses SCRFD for multi-face detection and ArcFace for embeddings, both
//! running via ONNX Runtime for CPU inference. Extraction sits behind the
//! [`EmbeddingExtractor`] trait so callers can substitute a fake.

pub mod detector;
pub mod error;
pub mod extractor;
pub mod identity;
pub mod matcher;
pub mod onnx;
pub mod recognizer;
pub mod types;

pub use error::{ExtractError, FaceError};
pub use extractor::EmbeddingExtractor;
pub use identity::{resolve_subject, resolve_with_hints, NameHint};
pub use matcher::{CosineMatcher, MatchQuery, Matcher, Probe};
pub use onnx::{default_model_dir, OnnxExtractor};
pub use types::{cosine_similarity, BoundingBox, Embedding, EnrollmentRecord, MatchCandidate, Registry};
