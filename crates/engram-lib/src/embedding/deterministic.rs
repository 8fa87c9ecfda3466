//! Model-free embedder deriving vectors from a keyed hash stream.

use crate::embedding::Embedder;
use crate::error::Result;
use crate::vecmath;

/// Deterministic embedder: expands a BLAKE3 XOF over the input text into a
/// unit-norm vector of the requested dimension.
///
/// Identical texts always produce bit-identical vectors, which is the
/// property the test suite and air-gapped deployments need. There is no
/// semantic structure; keyword (BM25) retrieval carries relevance when this
/// variant is active.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(text.as_bytes());
        let mut reader = hasher.finalize_xof();
        let mut bytes = vec![0u8; self.dimension * 4];
        reader.fill(&mut bytes);

        let mut vector: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| {
                let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                // Map the 32-bit stream into [-1, 1].
                (f64::from(raw) / f64::from(u32::MAX)).mul_add(2.0, -1.0) as f32
            })
            .collect();
        vecmath::normalize(&mut vector);
        vector
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_one(text))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hash-deterministic"
    }
}
