//! Two-tier embedding cache: in-memory LRU, on-disk KV, then the model.
//!
//! Lookup order is LRU → disk → compute. Computed vectors are written back
//! to the disk tier; disk hits are promoted into the LRU. Cache eviction is
//! always safe; stored records keep their own vector copies.

#![allow(clippy::cast_precision_loss)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use moka::sync::Cache;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::CACHE_BATCH_THRESHOLD;
use crate::embedding::hashing::{digest_hex, text_digest};
use crate::embedding::lifecycle::{ModelLifecycle, ModelMemoryReport};
use crate::error::Result;

/// Persistent digest → vector table backed by its own small database.
///
/// Schema: `embeddings(hash TEXT PRIMARY KEY, vector BLOB, last_accessed
/// REAL)` with an index on `last_accessed`; reads refresh the timestamp so
/// a future eviction pass can drop cold entries.
pub struct DiskCache {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl DiskCache {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS embeddings (
                 hash TEXT PRIMARY KEY,
                 vector BLOB,
                 last_accessed REAL
             );
             CREATE INDEX IF NOT EXISTS idx_access ON embeddings(last_accessed);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn get(&self, hash_hex: &str) -> Result<Option<Vec<f32>>> {
        let conn = self.conn.lock();
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT vector FROM embeddings WHERE hash = ?1",
                params![hash_hex],
                |row| row.get(0),
            )
            .optional()?;
        let Some(blob) = blob else {
            return Ok(None);
        };
        conn.execute(
            "UPDATE embeddings SET last_accessed = ?1 WHERE hash = ?2",
            params![unix_now(), hash_hex],
        )?;
        if blob.len() % 4 != 0 {
            warn!(hash = hash_hex, "Discarding corrupt cached vector");
            return Ok(None);
        }
        // pod_collect_to_vec copies, so the blob's alignment doesn't matter.
        Ok(Some(bytemuck::pod_collect_to_vec::<u8, f32>(&blob)))
    }

    fn set(&self, hash_hex: &str, vector: &[f32]) -> Result<()> {
        let blob: &[u8] = bytemuck::cast_slice(vector);
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO embeddings (hash, vector, last_accessed)
             VALUES (?1, ?2, ?3)",
            params![hash_hex, blob, unix_now()],
        )?;
        Ok(())
    }

    fn len(&self) -> Result<i64> {
        let count =
            self.conn
                .lock()
                .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Cache counters and identity snapshot.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    pub lru_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub lru_size: u64,
    pub lru_capacity: u64,
    pub hit_rate: f64,
    pub embedder: Option<String>,
    pub model_ready: bool,
    pub model_loaded: bool,
    pub memory: ModelMemoryReport,
}

/// The caching front-end over the model lifecycle.
pub struct EmbedCache {
    lru: Cache<[u8; 16], Arc<Vec<f32>>>,
    lru_capacity: u64,
    disk: DiskCache,
    lifecycle: Arc<ModelLifecycle>,
    lru_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbedCache {
    pub fn new(lifecycle: Arc<ModelLifecycle>, disk: DiskCache, lru_capacity: u64) -> Self {
        Self {
            lru: Cache::builder().max_capacity(lru_capacity).build(),
            lru_capacity,
            disk,
            lifecycle,
            lru_hits: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn lifecycle(&self) -> &Arc<ModelLifecycle> {
        &self.lifecycle
    }

    /// Embed one text through all cache tiers.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_cached(text).map(|v| v.as_ref().clone())
    }

    /// Embed one text, bypassing every tier.
    pub fn embed_uncached(&self, text: &str) -> Result<Vec<f32>> {
        self.lifecycle.embed(text)
    }

    /// Embed a batch. Small batches go through per-item caching; larger
    /// batches skip the cache and hit the model in a single call for
    /// throughput.
    pub fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.len() <= CACHE_BATCH_THRESHOLD {
            texts.iter().map(|t| self.embed(t)).collect()
        } else {
            debug!(batch = texts.len(), "Large batch bypasses embedding cache");
            self.lifecycle.embed_batch(texts)
        }
    }

    fn embed_cached(&self, text: &str) -> Result<Arc<Vec<f32>>> {
        let key = text_digest(text);
        if let Some(hit) = self.lru.get(&key) {
            self.lru_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }

        let hex = digest_hex(&key);
        match self.disk.get(&hex) {
            Ok(Some(vector)) => {
                self.disk_hits.fetch_add(1, Ordering::Relaxed);
                let vector = Arc::new(vector);
                self.lru.insert(key, Arc::clone(&vector));
                return Ok(vector);
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "Disk cache read failed"),
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let vector = self.lifecycle.embed(text)?;
        if let Err(err) = self.disk.set(&hex, &vector) {
            warn!(error = %err, "Disk cache write failed");
        }
        let vector = Arc::new(vector);
        self.lru.insert(key, Arc::clone(&vector));
        Ok(vector)
    }

    /// Counters across all tiers plus the model's resource report.
    pub fn stats(&self) -> CacheStats {
        let lru_hits = self.lru_hits.load(Ordering::Relaxed);
        let disk_hits = self.disk_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = lru_hits + disk_hits + misses;
        let hits = lru_hits + disk_hits;
        self.lru.run_pending_tasks();
        CacheStats {
            lru_hits,
            disk_hits,
            misses,
            lru_size: self.lru.entry_count(),
            lru_capacity: self.lru_capacity,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64 * 100.0
            },
            embedder: self.lifecycle.embedder_name(),
            model_ready: self.lifecycle.is_ready(),
            model_loaded: self.lifecycle.is_loaded(),
            memory: self.lifecycle.memory_report(),
        }
    }

    /// Drop the in-memory tier and reset counters. The disk tier is kept;
    /// entries there age out via `last_accessed`.
    pub fn clear(&self) {
        self.lru.invalidate_all();
        self.lru.run_pending_tasks();
        self.lru_hits.store(0, Ordering::Relaxed);
        self.disk_hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Number of entries in the persistent tier.
    pub fn disk_len(&self) -> Result<i64> {
        self.disk.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EMBEDDING_DIMENSION;
    use crate::embedding::Embedder;
    use crate::embedding::deterministic::HashEmbedder;

    fn test_cache(dir: &Path) -> EmbedCache {
        let lifecycle = ModelLifecycle::new(
            Box::new(|| Ok(Arc::new(HashEmbedder::new(EMBEDDING_DIMENSION)) as Arc<dyn Embedder>)),
            EMBEDDING_DIMENSION,
        );
        let disk = DiskCache::open(&dir.join("cache.db")).unwrap();
        EmbedCache::new(lifecycle, disk, 1_000)
    }

    #[test]
    fn second_lookup_hits_the_lru() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = test_cache(tmp.path());

        let first = cache.embed("repeat me").unwrap();
        let second = cache.embed("repeat me").unwrap();
        assert_eq!(first, second);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert!(stats.lru_hits >= 1);
    }

    #[test]
    fn disk_tier_survives_an_lru_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = test_cache(tmp.path());

        let first = cache.embed("persist me").unwrap();
        cache.clear();
        let second = cache.embed("persist me").unwrap();

        assert_eq!(first, second);
        let stats = cache.stats();
        assert_eq!(stats.disk_hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn disk_tier_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let first = {
            let cache = test_cache(tmp.path());
            cache.embed("durable vector").unwrap()
        };
        let cache = test_cache(tmp.path());
        let second = cache.embed("durable vector").unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.stats().disk_hits, 1);
    }

    #[test]
    fn small_batches_populate_the_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = test_cache(tmp.path());

        let texts: Vec<String> = (0..3).map(|i| format!("text {i}")).collect();
        let batch = cache.embed_batch(&texts).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(cache.stats().misses, 3);

        // Re-embedding one of them is now an LRU hit.
        cache.embed("text 1").unwrap();
        assert_eq!(cache.stats().lru_hits, 1);
    }

    #[test]
    fn large_batches_bypass_the_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = test_cache(tmp.path());

        let texts: Vec<String> = (0..CACHE_BATCH_THRESHOLD + 5)
            .map(|i| format!("bulk {i}"))
            .collect();
        let batch = cache.embed_batch(&texts).unwrap();
        assert_eq!(batch.len(), texts.len());

        let stats = cache.stats();
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.lru_size, 0);
    }

    #[test]
    fn uncached_embedding_skips_all_tiers() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = test_cache(tmp.path());
        cache.embed_uncached("no caching").unwrap();
        let stats = cache.stats();
        assert_eq!(stats.lru_hits + stats.disk_hits + stats.misses, 0);
        assert_eq!(cache.disk_len().unwrap(), 0);
    }

    #[test]
    fn stats_report_embedder_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = test_cache(tmp.path());
        cache.embed("warm the model").unwrap();
        let stats = cache.stats();
        assert_eq!(stats.embedder.as_deref(), Some("hash-deterministic"));
        assert!(stats.model_ready);
        assert_eq!(stats.lru_capacity, 1_000);
    }
}
