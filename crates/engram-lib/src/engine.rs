//! The public engine facade and the per-path instance registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::info;

use crate::compact::{CompactionReport, CompactionStats, Compactor, CompactorConfig};
use crate::config::{EMBEDDING_DIMENSION, EngramConfig};
use crate::db::store::{Record, RecordStore, StoreStats};
use crate::embedding::cache::{CacheStats, DiskCache, EmbedCache};
use crate::embedding::lifecycle::ModelLifecycle;
use crate::embedding::model::FastembedEmbedder;
use crate::embedding::{Embedder, EmbedderLoader};
use crate::error::Result;
use crate::pipeline::filters::RecallOptions;
use crate::pipeline::ingest::{IngestPipeline, RememberOptions};
use crate::pipeline::recall::{RetrievalEngine, SearchResult};

/// Process-wide registry: one engine instance per database path.
fn registry() -> &'static Mutex<HashMap<PathBuf, Arc<Engram>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Arc<Engram>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn registry_key(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// The semantic-memory engine: a record store, the embedding cache, and the
/// ingest/retrieval pipelines behind one handle.
pub struct Engram {
    store: Arc<RecordStore>,
    cache: Arc<EmbedCache>,
    ingest: IngestPipeline,
    retrieval: RetrievalEngine,
    config: EngramConfig,
}

impl Engram {
    /// Open the engine at `db_path`, registering the instance so later
    /// opens of the same path return the same handle.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let mut config = EngramConfig::load()?;
        config.storage.db_path = db_path.as_ref().to_path_buf();
        Self::open_with_config(config)
    }

    /// Open with an explicit configuration and the default fastembed-backed
    /// embedder.
    pub fn open_with_config(config: EngramConfig) -> Result<Arc<Self>> {
        let model_name = config.embed.model_name.clone();
        let cache_dir = config.embed.cache_dir.clone();
        let batch_size = config.embed.batch_size;
        let loader: EmbedderLoader = Box::new(move || {
            let embedder = FastembedEmbedder::new(&model_name, &cache_dir, batch_size)?;
            Ok(Arc::new(embedder) as Arc<dyn Embedder>)
        });
        Self::open_with(config, loader)
    }

    /// Open with an explicit configuration and embedder loader. This is the
    /// injection point for the deterministic embedder in tests and
    /// air-gapped hosts.
    pub fn open_with(config: EngramConfig, loader: EmbedderLoader) -> Result<Arc<Self>> {
        let key = registry_key(&config.storage.db_path);
        let mut instances = registry().lock();
        if let Some(existing) = instances.get(&key) {
            return Ok(Arc::clone(existing));
        }

        let store = Arc::new(RecordStore::open(&config, EMBEDDING_DIMENSION)?);
        let lifecycle = ModelLifecycle::new(loader, EMBEDDING_DIMENSION);
        lifecycle.set_idle_timeout(config.embed.idle_unload_minutes);
        // cache.db sits next to memory.db in the engine's home directory.
        let cache_db = config
            .storage
            .db_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("cache.db");
        let disk = DiskCache::open(&cache_db)?;
        let cache = Arc::new(EmbedCache::new(lifecycle, disk, config.embed.cache_size));

        let engine = Arc::new(Self {
            ingest: IngestPipeline::new(Arc::clone(&store), Arc::clone(&cache)),
            retrieval: RetrievalEngine::new(
                Arc::clone(&store),
                Arc::clone(&cache),
                config.search.clone(),
            ),
            store,
            cache,
            config,
        });
        instances.insert(key, Arc::clone(&engine));
        Ok(engine)
    }

    /// Store a memory; returns its id (or an existing near-duplicate's id).
    pub fn remember(&self, text: &str, options: &RememberOptions) -> Result<String> {
        self.ingest.remember(text, options)
    }

    /// Chunk and store a long document; returns the chunk ids in order.
    pub fn remember_document(
        &self,
        text: &str,
        title: Option<&str>,
        options: &RememberOptions,
    ) -> Result<Vec<String>> {
        self.ingest.remember_document(text, title, options)
    }

    /// Hybrid semantic search.
    pub fn recall(&self, query: &str, options: &RecallOptions) -> Result<Vec<SearchResult>> {
        self.retrieval.recall(query, options)
    }

    /// Batched recall sharing one embedding batch and candidate scan.
    pub fn batch_recall(
        &self,
        queries: &[String],
        options: &RecallOptions,
    ) -> Result<Vec<Vec<SearchResult>>> {
        self.retrieval.batch_recall(queries, options)
    }

    /// The N most recent records in a collection.
    pub fn get_recent(&self, n: usize, collection: &str) -> Result<Vec<Record>> {
        self.retrieval.get_recent(n, collection)
    }

    /// Records similar to an existing text.
    pub fn find_similar(
        &self,
        text: &str,
        exclude_id: Option<&str>,
        topk: usize,
    ) -> Result<Vec<SearchResult>> {
        self.retrieval.find_similar(text, exclude_id, topk)
    }

    /// The most recent records carrying any of the given tags.
    pub fn search_by_tag(&self, tags: &[String], topk: usize) -> Result<Vec<Record>> {
        self.retrieval.search_by_tag(tags, topk)
    }

    /// Point lookup by id.
    pub fn get(&self, id: &str) -> Result<Option<Record>> {
        self.store.get(id)
    }

    /// Delete by id; deleting a missing id is a successful no-op.
    pub fn delete(&self, id: &str) -> Result<bool> {
        self.store.delete(id)
    }

    /// Store-level counters.
    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    /// Embedding-cache counters and model state.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Copy the database to `dest` or a timestamped default.
    pub fn backup(&self, dest: Option<&Path>) -> Result<PathBuf> {
        self.store.backup(dest)
    }

    /// Dump all records to JSON.
    pub fn export_json(&self, dest: Option<&Path>) -> Result<PathBuf> {
        self.store.export_json(dest)
    }

    /// Run a compaction pass with the given settings.
    pub fn compact(&self, config: CompactorConfig) -> Result<CompactionStats> {
        Compactor::new(Arc::clone(&self.store), Arc::clone(&self.cache), config).run()
    }

    /// Age profile and compaction recommendation.
    pub fn compaction_report(&self) -> Result<CompactionReport> {
        Compactor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
            CompactorConfig::default(),
        )
        .report()
    }

    /// Block until the embedding model is ready.
    pub fn warmup(&self) -> Result<String> {
        self.cache.lifecycle().warmup()
    }

    /// Release the embedding model now.
    pub fn unload_model(&self) -> bool {
        self.cache.lifecycle().force_unload()
    }

    pub fn config(&self) -> &EngramConfig {
        &self.config
    }

    /// Deregister this instance and release the model. The database closes
    /// when the last handle drops; files are never left to a finaliser.
    pub fn close(self: &Arc<Self>) {
        let key = registry_key(&self.config.storage.db_path);
        registry().lock().remove(&key);
        self.cache.lifecycle().force_unload();
        info!(db_path = %self.config.storage.db_path.display(), "Engine closed");
    }
}
