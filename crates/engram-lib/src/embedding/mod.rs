//! Text embedding: the `Embedder` capability, its implementations, the
//! two-tier cache, and the background model lifecycle.

pub mod cache;
pub mod deterministic;
pub mod hashing;
pub mod lifecycle;
pub mod model;

use crate::error::Result;

/// Capability turning text into fixed-width unit-norm float vectors.
///
/// Implementations must be deterministic for a given input and must return
/// vectors of exactly `dimension()` elements. Two variants ship with the
/// crate: [`model::FastembedEmbedder`] (native ONNX model) and
/// [`deterministic::HashEmbedder`] (model-free, for tests and air-gapped
/// hosts).
pub trait Embedder: Send + Sync {
    /// Embed a single string.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of strings, preserving order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Vector width produced by this embedder.
    fn dimension(&self) -> usize;

    /// Human-readable embedder identity for stats output.
    fn name(&self) -> &str;
}

/// Factory producing an [`Embedder`]; invoked by the lifecycle on (re)load.
pub type EmbedderLoader =
    Box<dyn Fn() -> Result<std::sync::Arc<dyn Embedder>> + Send + Sync + 'static>;
