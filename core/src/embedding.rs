use crate::error::{ErrorKind, KindedError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingDomain {
    Text,
    Code,
}

impl EmbeddingDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingDomain::Text => "text",
            EmbeddingDomain::Code => "code",
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding backend failed: {0}")]
    Backend(String),
}

impl KindedError for EmbeddingError {
    fn error_kind(&self) -> ErrorKind {
        ErrorKind::EmbeddingError
    }
}

/// Embedding backend contract. Implementations must be pure functions of
/// `(domain, input)`; the dimension is fixed per deployment.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed(
        &self,
        domain: EmbeddingDomain,
        inputs: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

pub fn deterministic_embedding(domain: EmbeddingDomain, text: &str, dims: usize) -> Vec<f32> {
    let dims = dims.max(1);

    let mut hasher = Sha256::new();
    hasher.update(domain.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();

    let mut out = Vec::with_capacity(dims);
    for i in 0..dims {
        let byte = digest[i % digest.len()];
        let value = (byte as f32 / 127.5) - 1.0;
        out.push(value);
    }

    out
}

/// Hash-derived embedder: reproducible vectors without a model backend.
/// Carries an outage switch so degraded-mode paths are testable.
pub struct DeterministicEmbedder {
    dims: usize,
    failing: AtomicBool,
}

impl DeterministicEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(1),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Default for DeterministicEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for DeterministicEmbedder {
    fn dimension(&self) -> usize {
        self.dims
    }

    async fn embed(
        &self,
        domain: EmbeddingDomain,
        inputs: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Backend("simulated outage".to_string()));
        }

        Ok(inputs
            .iter()
            .map(|input| deterministic_embedding(domain, input, self.dims))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_embedding_is_reproducible_for_same_inputs() {
        let a = deterministic_embedding(EmbeddingDomain::Text, "hello", 8);
        let b = deterministic_embedding(EmbeddingDomain::Text, "hello", 8);
        assert_eq!(a, b);
    }

    #[test]
    fn deterministic_embedding_differs_across_domains() {
        let a = deterministic_embedding(EmbeddingDomain::Text, "hello", 8);
        let b = deterministic_embedding(EmbeddingDomain::Code, "hello", 8);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn embedder_batches_and_respects_dimension() {
        let embedder = DeterministicEmbedder::new(32);
        let vectors = embedder
            .embed(
                EmbeddingDomain::Code,
                &["fn a() {}".to_string(), "fn b() {}".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert!(vectors.iter().all(|v| v.len() == 32));
    }

    #[tokio::test]
    async fn embedder_outage_switch_fails_calls() {
        let embedder = DeterministicEmbedder::new(8);
        embedder.set_failing(true);
        let result = embedder
            .embed(EmbeddingDomain::Text, &["query".to_string()])
            .await;
        assert!(result.is_err());
    }
}
