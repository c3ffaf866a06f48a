//! Nearest-neighbour identity matching over a registry.

use crate::error::FaceError;
use crate::types::{Embedding, EnrollmentRecord, MatchCandidate, Registry};
use std::cmp::Ordering;

/// Threshold and result size for one match request.
#[derive(Debug, Clone, Copy)]
pub struct MatchQuery {
    /// Minimum score (inclusive) for a candidate to be returned.
    pub threshold: f32,
    pub top_k: usize,
}

/// A probe image reduced to its face embeddings.
#[derive(Debug, Clone, Copy)]
pub struct Probe<'a> {
    pub embeddings: &'a [Embedding],
    /// Registry key of the probe image, if it is itself enrolled.
    /// The record with this key is never returned as a candidate.
    pub image_key: Option<&'a str>,
}

impl<'a> Probe<'a> {
    pub fn new(embeddings: &'a [Embedding]) -> Self {
        Self {
            embeddings,
            image_key: None,
        }
    }

    pub fn with_key(mut self, image_key: &'a str) -> Self {
        self.image_key = Some(image_key);
        self
    }
}

/// Strategy for ranking a registry against a probe.
pub trait Matcher {
    fn rank(
        &self,
        probe: Probe<'_>,
        registry: &Registry,
        query: MatchQuery,
    ) -> Result<Vec<MatchCandidate>, FaceError>;
}

/// Scores each record by the best cosine similarity over every
/// (probe face, record face) pair.
pub struct CosineMatcher;

impl CosineMatcher {
    /// Maximum pairwise cosine similarity between two sets of faces.
    pub fn score(probe: &[Embedding], record: &EnrollmentRecord) -> f32 {
        let mut best = f32::NEG_INFINITY;
        for p in probe {
            for r in &record.embeddings {
                best = best.max(p.similarity(r));
            }
        }
        best
    }
}

impl Matcher for CosineMatcher {
    fn rank(
        &self,
        probe: Probe<'_>,
        registry: &Registry,
        query: MatchQuery,
    ) -> Result<Vec<MatchCandidate>, FaceError> {
        if probe.embeddings.is_empty() {
            return Err(FaceError::NoFaceDetected);
        }

        if let Some(expected) = registry.dim() {
            if let Some(bad) = probe.embeddings.iter().find(|e| e.dim() != expected) {
                return Err(FaceError::DimensionMismatch {
                    expected,
                    found: bad.dim(),
                });
            }
        }

        let mut candidates: Vec<MatchCandidate> = registry
            .records()
            .filter(|record| Some(record.image_key.as_str()) != probe.image_key)
            .filter_map(|record| {
                let similarity = Self::score(probe.embeddings, record);
                (similarity >= query.threshold).then(|| MatchCandidate {
                    image_key: record.image_key.clone(),
                    subject_name: record.subject_name.clone(),
                    similarity,
                })
            })
            .collect();

        // Stable: equal scores keep registry insertion order.
        candidates.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
        });
        candidates.truncate(query.top_k);

        tracing::debug!(
            registry = %registry.name,
            probe_faces = probe.embeddings.len(),
            returned = candidates.len(),
            "ranked registry"
        );

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn record(key: &str, subject: &str, faces: &[&[f32]]) -> EnrollmentRecord {
        EnrollmentRecord::new(
            key,
            subject,
            format!("/img/{key}"),
            faces.iter().map(|f| emb(f)).collect(),
        )
        .unwrap()
    }

    fn registry(records: Vec<EnrollmentRecord>) -> Registry {
        let mut registry = Registry::empty("test");
        for r in records {
            registry.insert(r);
        }
        registry
    }

    fn query(threshold: f32, top_k: usize) -> MatchQuery {
        MatchQuery { threshold, top_k }
    }

    #[test]
    fn test_exact_probe_matches_single_subject() {
        let reg = registry(vec![
            record("A_1.jpg", "A", &[&[1.0, 0.0, 0.0]]),
            record("B_1.jpg", "B", &[&[0.0, 1.0, 0.0]]),
        ]);
        let probe = [emb(&[1.0, 0.0, 0.0])];

        let result = CosineMatcher
            .rank(Probe::new(&probe), &reg, query(0.99, 5))
            .unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].image_key, "A_1.jpg");
        assert_eq!(result[0].subject_name, "A");
        assert!((result[0].similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_multi_face_uses_best_pair() {
        // Candidate has an irrelevant face first; probe has a decoy face first.
        let reg = registry(vec![record(
            "group.jpg",
            "G",
            &[&[0.0, 0.0, 1.0], &[1.0, 1.0, 0.0]],
        )]);
        let probe = [emb(&[0.0, 1.0, 0.0]), emb(&[1.0, 1.0, 0.0])];

        let result = CosineMatcher
            .rank(Probe::new(&probe), &reg, query(0.0, 5))
            .unwrap();
        assert!((result[0].similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_sorted_descending_and_truncated_after_sort() {
        // Best candidate inserted last must survive top-1 truncation.
        let reg = registry(vec![
            record("a.jpg", "A", &[&[0.6, 0.8]]),
            record("b.jpg", "B", &[&[0.8, 0.6]]),
            record("c.jpg", "C", &[&[1.0, 0.0]]),
        ]);
        let probe = [emb(&[1.0, 0.0])];

        let all = CosineMatcher
            .rank(Probe::new(&probe), &reg, query(-1.0, 10))
            .unwrap();
        let keys: Vec<_> = all.iter().map(|c| c.image_key.as_str()).collect();
        assert_eq!(keys, ["c.jpg", "b.jpg", "a.jpg"]);
        assert!(all.windows(2).all(|w| w[0].similarity >= w[1].similarity));

        let top1 = CosineMatcher
            .rank(Probe::new(&probe), &reg, query(-1.0, 1))
            .unwrap();
        assert_eq!(top1.len(), 1);
        assert_eq!(top1[0].image_key, "c.jpg");
    }

    #[test]
    fn test_length_is_min_of_top_k_and_above_threshold() {
        let reg = registry(vec![
            record("a.jpg", "A", &[&[1.0, 0.0]]),
            record("b.jpg", "B", &[&[1.0, 0.1]]),
            record("c.jpg", "C", &[&[0.0, 1.0]]),
        ]);
        let probe = [emb(&[1.0, 0.0])];

        for top_k in 0..5 {
            let result = CosineMatcher
                .rank(Probe::new(&probe), &reg, query(0.9, top_k))
                .unwrap();
            assert_eq!(result.len(), top_k.min(2));
        }
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let reg = registry(vec![
            record("z.jpg", "Z", &[&[1.0, 0.0]]),
            record("a.jpg", "A", &[&[2.0, 0.0]]),
            record("m.jpg", "M", &[&[3.0, 0.0]]),
        ]);
        let probe = [emb(&[1.0, 0.0])];

        let result = CosineMatcher
            .rank(Probe::new(&probe), &reg, query(0.5, 10))
            .unwrap();
        let keys: Vec<_> = result.iter().map(|c| c.image_key.as_str()).collect();
        assert_eq!(keys, ["z.jpg", "a.jpg", "m.jpg"]);
    }

    #[test]
    fn test_raising_threshold_never_grows_result() {
        let reg = registry(vec![
            record("a.jpg", "A", &[&[1.0, 0.0, 0.0]]),
            record("b.jpg", "B", &[&[0.7, 0.7, 0.0]]),
            record("c.jpg", "C", &[&[0.2, 0.9, 0.3]]),
            record("d.jpg", "D", &[&[-1.0, 0.0, 0.0]]),
        ]);
        let probe = [emb(&[0.9, 0.3, 0.1])];

        let mut previous = usize::MAX;
        for step in -10..=10 {
            let threshold = step as f32 / 10.0;
            let n = CosineMatcher
                .rank(Probe::new(&probe), &reg, query(threshold, 100))
                .unwrap()
                .len();
            assert!(n <= previous, "threshold {threshold} grew result to {n}");
            previous = n;
        }
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let reg = registry(vec![record("a.jpg", "A", &[&[1.0, 0.0]])]);
        let probe = [emb(&[1.0, 0.0])];
        let score = CosineMatcher::score(&probe, reg.get("a.jpg").unwrap());

        let result = CosineMatcher
            .rank(Probe::new(&probe), &reg, query(score, 5))
            .unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_excludes_probe_own_key_only() {
        // Same embedding under another key is still a match.
        let reg = registry(vec![
            record("A_1.jpg", "A", &[&[1.0, 0.0]]),
            record("A_2.jpg", "A", &[&[1.0, 0.0]]),
        ]);
        let probe = [emb(&[1.0, 0.0])];

        let result = CosineMatcher
            .rank(Probe::new(&probe).with_key("A_1.jpg"), &reg, query(0.5, 5))
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].image_key, "A_2.jpg");
    }

    #[test]
    fn test_no_face_is_an_error() {
        let reg = registry(vec![record("a.jpg", "A", &[&[1.0, 0.0]])]);
        let err = CosineMatcher
            .rank(Probe::new(&[]), &reg, query(0.0, 5))
            .unwrap_err();
        assert!(matches!(err, FaceError::NoFaceDetected));
    }

    #[test]
    fn test_no_match_is_empty_success() {
        let reg = registry(vec![record("a.jpg", "A", &[&[1.0, 0.0]])]);
        let probe = [emb(&[0.0, 1.0])];
        let result = CosineMatcher
            .rank(Probe::new(&probe), &reg, query(0.5, 5))
            .unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_empty_registry() {
        let probe = [emb(&[1.0, 0.0])];
        let result = CosineMatcher
            .rank(Probe::new(&probe), &Registry::empty("x"), query(0.5, 5))
            .unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_dimension_mismatch() {
        let reg = registry(vec![record("a.jpg", "A", &[&[1.0, 0.0]])]);
        let probe = [emb(&[1.0, 0.0, 0.0])];
        let err = CosineMatcher
            .rank(Probe::new(&probe), &reg, query(0.5, 5))
            .unwrap_err();
        assert!(matches!(
            err,
            FaceError::DimensionMismatch { expected: 2, found: 3 }
        ));
    }
}
