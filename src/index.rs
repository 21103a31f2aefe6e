//! In-memory vector index over embedded chunks.
//!
//! Retrieval is an exact cosine-similarity scan over every entry, so recall
//! is always 1.0. Results are ordered by descending similarity; entries with
//! equal scores keep their insertion order.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::models::{Chunk, ScoredChunk};

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// A session's collection of (vector, chunk) pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    dims: usize,
    model: String,
    created_at: DateTime<Utc>,
    entries: Vec<IndexEntry>,
}

impl VectorIndex {
    /// Build an index from parallel sequences.
    ///
    /// # Errors
    ///
    /// [`Error::EmptyIndex`] when `chunks` is empty; [`Error::DimensionMismatch`]
    /// when the sequences differ in length or a vector's dimension differs
    /// from the first one's.
    pub fn build(chunks: Vec<Chunk>, vectors: Vec<Vec<f32>>, model: &str) -> Result<Self> {
        if chunks.is_empty() {
            return Err(Error::EmptyIndex);
        }
        if chunks.len() != vectors.len() {
            return Err(Error::DimensionMismatch {
                expected: chunks.len(),
                found: vectors.len(),
            });
        }
        let dims = vectors[0].len();
        if dims == 0 {
            return Err(Error::DimensionMismatch {
                expected: 1,
                found: 0,
            });
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(Error::DimensionMismatch {
                expected: dims,
                found: bad.len(),
            });
        }
        let entries = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexEntry { chunk, vector })
            .collect();
        Ok(Self {
            dims,
            model: model.to_string(),
            created_at: Utc::now(),
            entries,
        })
    }

    /// Reassemble an index read back from storage. Callers are trusted to
    /// pass entries that were validated by [`VectorIndex::build`].
    pub(crate) fn from_parts(
        dims: usize,
        model: String,
        created_at: DateTime<Utc>,
        entries: Vec<IndexEntry>,
    ) -> Self {
        Self {
            dims,
            model,
            created_at,
            entries,
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// The `k` most similar chunks, best first. `k` larger than the index
    /// returns every chunk.
    pub fn query(&self, query_vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        if query_vector.len() != self.dims {
            return Err(Error::DimensionMismatch {
                expected: self.dims,
                found: query_vector.len(),
            });
        }
        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i, cosine_similarity(query_vector, &e.vector)))
            .collect();
        // sort_by is stable: equal scores stay in insertion order
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k.min(self.entries.len()));
        Ok(scored
            .into_iter()
            .map(|(i, score)| ScoredChunk {
                score,
                chunk: self.entries[i].chunk.clone(),
            })
            .collect())
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use document_portal::index::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors of
/// different lengths, and zero vectors.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn chunk(ordinal: i64, text: &str) -> Chunk {
        Chunk {
            ordinal,
            source: "a.txt".to_string(),
            position: 0,
            chunk_index: ordinal,
            char_start: 0,
            char_end: text.chars().count() as i64,
            overlap: 0,
            text: text.to_string(),
            hash: format!("h{}", ordinal),
        }
    }

    fn sample() -> VectorIndex {
        VectorIndex::build(
            vec![chunk(0, "x"), chunk(1, "y"), chunk(2, "xy"), chunk(3, "x again")],
            vec![
                vec![1.0, 0.0],
                vec![0.0, 1.0],
                vec![1.0, 1.0],
                vec![2.0, 0.0],
            ],
            "test",
        )
        .unwrap()
    }

    #[test]
    fn test_empty_build_fails() {
        let err = VectorIndex::build(vec![], vec![], "m").unwrap_err();
        assert!(matches!(err, Error::EmptyIndex));
    }

    #[test]
    fn test_non_uniform_dims_fail() {
        let err = VectorIndex::build(
            vec![chunk(0, "a"), chunk(1, "b")],
            vec![vec![1.0, 0.0], vec![1.0, 0.0, 0.0]],
            "m",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 2,
                found: 3
            }
        ));
    }

    #[test]
    fn test_chunk_vector_count_mismatch_fails() {
        let err = VectorIndex::build(vec![chunk(0, "a"), chunk(1, "b")], vec![vec![1.0, 0.0]], "m")
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn test_nan_scores_do_not_break_ordering() {
        let index = VectorIndex::build(
            vec![chunk(0, "nan"), chunk(1, "x"), chunk(2, "y")],
            vec![vec![f32::NAN, 0.0], vec![1.0, 0.0], vec![0.0, 1.0]],
            "m",
        )
        .unwrap();
        let results = index.query(&[1.0, 0.0], 3).unwrap();
        assert_eq!(results.len(), 3);
        let finite: Vec<i64> = results
            .iter()
            .filter(|r| !r.score.is_nan())
            .map(|r| r.chunk.ordinal)
            .collect();
        assert_eq!(finite, [1, 2]);
    }

    #[test]
    fn test_query_orders_by_similarity_with_stable_ties() {
        let results = sample().query(&[1.0, 0.0], 3).unwrap();
        let ordinals: Vec<i64> = results.iter().map(|r| r.chunk.ordinal).collect();
        // chunks 0 and 3 both score 1.0; insertion order breaks the tie
        assert_eq!(ordinals, [0, 3, 2]);
        assert!(results[0].score >= results[2].score);
    }

    #[test]
    fn test_k_larger_than_index_returns_all() {
        let results = sample().query(&[0.0, 1.0], 50).unwrap();
        assert_eq!(results.len(), 4);
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_k_zero_returns_nothing() {
        assert!(sample().query(&[0.0, 1.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_query_dimension_checked() {
        let err = sample().query(&[1.0, 0.0, 0.0], 2).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }
}
