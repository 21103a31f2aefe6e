//! Deterministic feature-hashing embedder.
//!
//! Each lower-cased alphanumeric token is hashed (SHA-256) into one of
//! `dims` buckets with a sign taken from the hash; the resulting vector is
//! L2-normalized. Texts sharing vocabulary get high cosine similarity. The
//! mapping is stable across processes and platforms, so indexes persisted
//! with it can be queried later by another process.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::EmbeddingProvider;

pub(crate) const DEFAULT_DIMS: usize = 256;

pub struct HashProvider {
    dims: usize,
}

impl HashProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        let lower = text.to_lowercase();
        for token in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]) % self.dims as u64;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket as usize] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashProvider {
    fn model_name(&self) -> &str {
        "feature-hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::cosine_similarity;

    #[test]
    fn test_same_text_same_vector() {
        let p = HashProvider::new(64);
        assert_eq!(p.embed_one("Quarterly revenue"), p.embed_one("quarterly  REVENUE!"));
    }

    #[test]
    fn test_shared_vocabulary_scores_higher() {
        let p = HashProvider::new(256);
        let q = p.embed_one("kubernetes deployment");
        let related = p.embed_one("notes about kubernetes deployment and docker");
        let unrelated = p.embed_one("a recipe for lemon cake");
        assert!(cosine_similarity(&q, &related) > cosine_similarity(&q, &unrelated));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let p = HashProvider::new(8);
        assert!(p.embed_one("  ...  ").iter().all(|x| *x == 0.0));
    }
}
