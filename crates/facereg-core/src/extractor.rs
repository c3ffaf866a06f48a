use crate::error::ExtractError;
use crate::types::Embedding;

/// Turns encoded image bytes into one embedding per detected face.
///
/// An empty result means no face was found; that is not an error at this
/// layer. Implementations may hold inference sessions and are driven from
/// a single thread, hence `&mut self`.
pub trait EmbeddingExtractor: Send {
    fn extract(&mut self, image: &[u8]) -> Result<Vec<Embedding>, ExtractError>;

    /// Short identifier for logs and status output.
    fn name(&self) -> &str;

    /// Length of every embedding this extractor produces, when fixed by the model.
    fn dim(&self) -> Option<usize> {
        None
    }
}

/// Deterministic extractor that reads embeddings from the image bytes
/// themselves, for tests.
///
/// The bytes are UTF-8 text: one face per `;`-separated group of
/// comma-separated floats. `none` or blank text yields no faces and
/// `fail` yields an inference error. Every call is counted, and an
/// optional delay stands in for slow inference.
#[cfg(any(test, feature = "fake"))]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Clone, Default)]
    pub struct FakeExtractor {
        calls: Arc<AtomicUsize>,
        dim: Option<usize>,
        delay: Option<Duration>,
    }

    impl FakeExtractor {
        pub fn new() -> Self {
            Self::default()
        }

        /// Report a fixed embedding dimension.
        pub fn with_dim(mut self, dim: usize) -> Self {
            self.dim = Some(dim);
            self
        }

        /// Sleep this long inside every `extract` call.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Number of `extract` calls so far, shared across clones.
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Encode faces in the format `extract` parses.
        pub fn encode(faces: &[&[f32]]) -> Vec<u8> {
            if faces.is_empty() {
                return b"none".to_vec();
            }
            faces
                .iter()
                .map(|f| {
                    f.iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(",")
                })
                .collect::<Vec<_>>()
                .join(";")
                .into_bytes()
        }
    }

    impl EmbeddingExtractor for FakeExtractor {
        fn extract(&mut self, image: &[u8]) -> Result<Vec<Embedding>, ExtractError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            let text = std::str::from_utf8(image)
                .map_err(|e| ExtractError::InferenceFailed(format!("fake image not utf-8: {e}")))?
                .trim();

            match text {
                "" | "none" => Ok(Vec::new()),
                "fail" => Err(ExtractError::InferenceFailed("fake failure".into())),
                _ => text
                    .split(';')
                    .map(|face| {
                        face.split(',')
                            .map(|v| v.trim().parse::<f32>())
                            .collect::<Result<Vec<_>, _>>()
                            .map(Embedding::new)
                            .map_err(|e| ExtractError::InferenceFailed(format!("fake face: {e}")))
                    })
                    .collect(),
            }
        }

        fn name(&self) -> &str {
            "fake"
        }

        fn dim(&self) -> Option<usize> {
            self.dim
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_fake_parses_faces() {
            let mut fx = FakeExtractor::new();
            let faces = fx.extract(&FakeExtractor::encode(&[&[1.0, 0.5], &[0.0, 2.0]])).unwrap();
            assert_eq!(faces, vec![Embedding::new(vec![1.0, 0.5]), Embedding::new(vec![0.0, 2.0])]);
            assert!(fx.extract(b"none").unwrap().is_empty());
            assert!(fx.extract(b"fail").is_err());
            assert_eq!(fx.calls(), 3);
        }
    }
}
