use crate::error::FaceError;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Bounding box for a detected face, in source image pixels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Face embedding vector (512-dimensional for ArcFace w600k_r50).
///
/// Serialized as a bare array of numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Zero when either vector has zero norm.
    ///
    /// Accumulates in f64 so that `a.similarity(b) == b.similarity(a)` bit for bit.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }
}

/// `dot(a, b) / (|a| * |b|)`, or 0.0 if either norm is zero.
///
/// Only the common prefix is compared; callers validate dimensions first.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        (dot / denom) as f32
    } else {
        0.0
    }
}

/// One embedded source image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentRecord {
    pub image_key: String,
    pub subject_name: String,
    pub source_path: PathBuf,
    /// One vector per detected face. Never empty, all of one dimension.
    pub embeddings: Vec<Embedding>,
    pub enrolled_at: DateTime<Utc>,
}

impl EnrollmentRecord {
    /// Build a record stamped with the current time.
    ///
    /// Fails with [`FaceError::NoFaceDetected`] on an empty embedding list and
    /// with [`FaceError::DimensionMismatch`] if the faces disagree on length.
    pub fn new(
        image_key: impl Into<String>,
        subject_name: impl Into<String>,
        source_path: impl Into<PathBuf>,
        embeddings: Vec<Embedding>,
    ) -> Result<Self, FaceError> {
        let record = Self {
            image_key: image_key.into(),
            subject_name: subject_name.into(),
            source_path: source_path.into(),
            embeddings,
            enrolled_at: Utc::now(),
        };
        record.validate()?;
        Ok(record)
    }

    /// Dimension shared by every embedding, `None` for a record with no faces.
    pub fn dim(&self) -> Option<usize> {
        self.embeddings.first().map(Embedding::dim)
    }

    pub fn validate(&self) -> Result<usize, FaceError> {
        let expected = self.dim().ok_or(FaceError::NoFaceDetected)?;
        if let Some(bad) = self.embeddings.iter().find(|e| e.dim() != expected) {
            return Err(FaceError::DimensionMismatch {
                expected,
                found: bad.dim(),
            });
        }
        Ok(expected)
    }
}

/// A named collection of enrollment records, in insertion order.
///
/// Mutation is crate-internal by convention: callers go through the
/// registry store so every change is flushed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    pub name: String,
    records: IndexMap<String, EnrollmentRecord>,
}

impl Registry {
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: IndexMap::new(),
        }
    }

    pub fn get(&self, image_key: &str) -> Option<&EnrollmentRecord> {
        self.records.get(image_key)
    }

    pub fn contains(&self, image_key: &str) -> bool {
        self.records.contains_key(image_key)
    }

    pub fn records(&self) -> impl Iterator<Item = &EnrollmentRecord> {
        self.records.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Embedding dimension of the registry, taken from its first record.
    pub fn dim(&self) -> Option<usize> {
        self.records.values().next().and_then(EnrollmentRecord::dim)
    }

    /// Insert or overwrite by key. An overwrite keeps the original position.
    ///
    /// Returns true when the key was new.
    pub fn insert(&mut self, record: EnrollmentRecord) -> bool {
        self.records
            .insert(record.image_key.clone(), record)
            .is_none()
    }

    /// Remove by key, preserving the order of the remaining records.
    pub fn remove(&mut self, image_key: &str) -> Option<EnrollmentRecord> {
        self.records.shift_remove(image_key)
    }

    pub fn as_map(&self) -> &IndexMap<String, EnrollmentRecord> {
        &self.records
    }
}

/// A scored candidate produced by a [`Matcher`](crate::matcher::Matcher).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCandidate {
    pub image_key: String,
    pub subject_name: String,
    pub similarity: f32,
}
