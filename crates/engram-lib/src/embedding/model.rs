use std::path::Path;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use parking_lot::Mutex;
use tracing::info;

use crate::config::EMBEDDING_DIMENSION;
use crate::embedding::Embedder;
use crate::error::{EngramError, Result};
use crate::vecmath;

/// Native embedder backed by fastembed's ONNX runtime.
///
/// Model files are cached under the configured cache directory; the first
/// construction downloads them. `TextEmbedding::embed` needs `&mut self`,
/// so the model sits behind a mutex to satisfy the shared [`Embedder`]
/// capability.
pub struct FastembedEmbedder {
    model: Mutex<TextEmbedding>,
    model_name: String,
    batch_size: usize,
}

impl FastembedEmbedder {
    /// Load the named model, downloading artefacts into `cache_dir` if
    /// missing.
    pub fn new(model_name: &str, cache_dir: &Path, batch_size: usize) -> Result<Self> {
        let model_kind = resolve_model(model_name)?;
        std::fs::create_dir_all(cache_dir).map_err(|e| {
            EngramError::Embedding(format!(
                "cannot create model cache dir {}: {e}",
                cache_dir.display()
            ))
        })?;

        info!(model = %model_name, cache_dir = %cache_dir.display(), "Loading embedding model");
        let model = TextEmbedding::try_new(
            InitOptions::new(model_kind)
                .with_cache_dir(cache_dir.to_path_buf())
                .with_show_download_progress(false),
        )
        .map_err(|e| EngramError::Embedding(format!("failed to load model {model_name}: {e}")))?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            batch_size,
        })
    }

    fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let mut model = self.model.lock();
        let mut vectors = model
            .embed(texts, Some(self.batch_size))
            .map_err(|e| EngramError::Embedding(format!("embedding failed: {e}")))?;
        for v in &mut vectors {
            vecmath::normalize(v);
        }
        Ok(vectors)
    }
}

impl Embedder for FastembedEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_texts(vec![text.to_string()])?;
        vectors.pop().ok_or_else(|| {
            EngramError::Embedding("model returned no vector for input".to_string())
        })
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.embed_texts(texts.to_vec())?;
        if vectors.len() != texts.len() {
            return Err(EngramError::Embedding(format!(
                "model returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        EMBEDDING_DIMENSION
    }

    fn name(&self) -> &str {
        &self.model_name
    }
}

/// Map a configured model name to a fastembed model variant.
///
/// Only 384-dimensional models are accepted; the vector width is fixed per
/// database.
fn resolve_model(model_name: &str) -> Result<EmbeddingModel> {
    match model_name {
        "sentence-transformers/all-MiniLM-L6-v2" => Ok(EmbeddingModel::AllMiniLML6V2),
        "BAAI/bge-small-en-v1.5" => Ok(EmbeddingModel::BGESmallENV15),
        other => Err(EngramError::Configuration(format!(
            "unsupported embedding model: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_name_is_rejected() {
        assert!(matches!(
            resolve_model("no-such/model"),
            Err(EngramError::Configuration(_))
        ));
    }

    #[test]
    #[ignore = "requires model files (or network) for fastembed"]
    fn embeds_to_384_unit_norm() {
        let tmp = tempfile::tempdir().unwrap();
        let embedder =
            FastembedEmbedder::new("sentence-transformers/all-MiniLM-L6-v2", tmp.path(), 32)
                .unwrap();
        let v = embedder.embed("hello world").unwrap();
        assert_eq!(v.len(), 384);
        assert!((crate::vecmath::l2_norm(&v) - 1.0).abs() < 1e-5);
    }
}
