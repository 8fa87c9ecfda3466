//! The write path: rate limiting, sanitisation, validation, near-duplicate
//! detection, embedding, and the committed insert.

#![allow(clippy::cast_possible_wrap)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{
    DEDUP_MIN_CHARS, DEDUP_THRESHOLD, MAX_TAGS, MAX_TEXT_CHARS, RATE_LIMIT_MAX,
    RATE_LIMIT_WINDOW_SECS,
};
use crate::db::store::{Predicate, Record, RecordStore, SqlValue};
use crate::embedding::cache::EmbedCache;
use crate::embedding::hashing::id_digest;
use crate::error::{EngramError, Result};
use crate::pipeline::chunker::{ChunkerConfig, SemanticChunker};
use crate::vecmath;

/// Options accepted by `remember`.
#[derive(Debug, Clone)]
pub struct RememberOptions {
    pub collection: String,
    pub importance: f64,
    pub source: String,
    pub session_id: String,
    pub tags: Vec<String>,
}

impl Default for RememberOptions {
    fn default() -> Self {
        Self {
            collection: "knowledge".to_string(),
            importance: 0.5,
            source: "conversation".to_string(),
            session_id: "default".to_string(),
            tags: Vec::new(),
        }
    }
}

/// Sliding-window insert limiter keyed by source.
pub struct RateLimiter {
    window: Duration,
    limit: usize,
    buckets: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            window,
            limit,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Record one attempt for `key`; `false` when over the limit, in which
    /// case nothing is recorded.
    pub fn admit(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_default();
        bucket.retain(|t| now.duration_since(*t) < self.window);
        if bucket.len() >= self.limit {
            return false;
        }
        bucket.push(now);
        true
    }
}

/// Strip non-printable characters, keeping newline, tab, and carriage
/// return.
pub fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t' | '\r'))
        .collect()
}

/// The write pipeline; one per engine instance.
pub struct IngestPipeline {
    store: Arc<RecordStore>,
    cache: Arc<EmbedCache>,
    rate_limiter: RateLimiter,
    chunker: SemanticChunker,
}

impl IngestPipeline {
    pub fn new(store: Arc<RecordStore>, cache: Arc<EmbedCache>) -> Self {
        Self {
            store,
            cache,
            rate_limiter: RateLimiter::new(
                RATE_LIMIT_MAX,
                Duration::from_secs(RATE_LIMIT_WINDOW_SECS),
            ),
            chunker: SemanticChunker::new(ChunkerConfig::default()),
        }
    }

    /// Store one record; returns its stable id, or the id of an existing
    /// near-duplicate.
    pub fn remember(&self, text: &str, options: &RememberOptions) -> Result<String> {
        let rate_key = if options.source.is_empty() {
            "global"
        } else {
            options.source.as_str()
        };
        if !self.rate_limiter.admit(rate_key) {
            warn!(source = rate_key, "Rate limit exceeded");
            return Err(EngramError::Storage(format!(
                "Rate limit exceeded for source: {rate_key}"
            )));
        }

        let text = sanitize_text(text);
        validate_text(&text, &options.tags)?;

        if let Some(existing) = self.find_duplicate(&text, &options.collection)? {
            debug!(id = %existing, "Near-duplicate detected, returning existing id");
            return Ok(existing);
        }

        let mut embedding = self.cache.embed(&text)?;
        vecmath::normalize(&mut embedding);

        let timestamp = unix_seconds();
        let id = new_record_id(&text, timestamp);
        let record = Record {
            id: id.clone(),
            text,
            timestamp,
            source: options.source.clone(),
            session_id: options.session_id.clone(),
            importance: options.importance,
            tags: options.tags.clone(),
            collection: options.collection.clone(),
            embedding: None,
        };
        self.store.insert(&record, &embedding)?;
        Ok(id)
    }

    /// Chunk a long document and store every chunk; returns the new ids in
    /// document order. Chunk embeddings are computed in one batch.
    pub fn remember_document(
        &self,
        text: &str,
        title: Option<&str>,
        options: &RememberOptions,
    ) -> Result<Vec<String>> {
        let sanitized = sanitize_text(text);
        let chunks = self
            .chunker
            .chunk_with_context(&sanitized, title, Some(&options.source));
        if chunks.is_empty() {
            return Err(EngramError::Validation(
                "Document text cannot be empty".to_string(),
            ));
        }

        // Two bookkeeping tags are appended per chunk; the cap applies to
        // the final tag list.
        if options.tags.len() + 2 > MAX_TAGS {
            return Err(EngramError::Validation(format!(
                "Too many tags ({} > {})",
                options.tags.len() + 2,
                MAX_TAGS
            )));
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        for chunk_text in &texts {
            validate_text(chunk_text, &options.tags)?;
        }
        let mut embeddings = self.cache.embed_batch(&texts)?;
        for embedding in &mut embeddings {
            vecmath::normalize(embedding);
        }

        let timestamp = unix_seconds();
        let mut ids = Vec::with_capacity(chunks.len());
        for (chunk, embedding) in chunks.iter().zip(embeddings.iter()) {
            let mut tags = options.tags.clone();
            if let Some(title) = title {
                tags.push(format!("doc:{title}"));
            }
            tags.push(format!("chunk:{}/{}", chunk.chunk_index + 1, chunk.total_chunks));

            let id = new_record_id(&chunk.text, timestamp);
            let record = Record {
                id: id.clone(),
                text: chunk.text.clone(),
                timestamp,
                source: options.source.clone(),
                session_id: options.session_id.clone(),
                importance: options.importance,
                tags,
                collection: options.collection.clone(),
                embedding: None,
            };
            self.store.insert(&record, embedding)?;
            ids.push(id);
        }
        debug!(chunks = ids.len(), "Stored document");
        Ok(ids)
    }

    /// Dense-only probe for a near-duplicate of `text` in `collection`.
    ///
    /// Short texts skip the probe entirely. The probe deliberately bypasses
    /// hybrid fusion and reranking: the decision is purely cosine
    /// similarity against the threshold.
    fn find_duplicate(&self, text: &str, collection: &str) -> Result<Option<String>> {
        if text.chars().count() <= DEDUP_MIN_CHARS {
            return Ok(None);
        }
        let mut query = self.cache.embed(text)?;
        vecmath::normalize(&mut query);
        let predicate = Predicate {
            clause: "m.collection = ?".to_string(),
            values: vec![SqlValue::Text(collection.to_string())],
        };
        let hits = self.store.dense_search(&query, 1, &predicate, None)?;
        Ok(hits
            .into_iter()
            .find(|(_, score)| *score >= DEDUP_THRESHOLD)
            .map(|(id, _)| id))
    }
}

fn validate_text(text: &str, tags: &[String]) -> Result<()> {
    if text.trim().is_empty() {
        return Err(EngramError::Validation(
            "Memory text cannot be empty".to_string(),
        ));
    }
    let chars = text.chars().count();
    if chars > MAX_TEXT_CHARS {
        return Err(EngramError::Validation(format!(
            "Memory text too long ({chars} > {MAX_TEXT_CHARS} chars)"
        )));
    }
    if tags.len() > MAX_TAGS {
        return Err(EngramError::Validation(format!(
            "Too many tags ({} > {MAX_TAGS})",
            tags.len()
        )));
    }
    Ok(())
}

fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Hash text, wall-clock, and a random salt into a 16-hex-character id, so
/// identical texts stored at different times stay distinguishable.
fn new_record_id(text: &str, timestamp: i64) -> String {
    let salt: u128 = rand::random();
    id_digest(&format!("{text}:{timestamp}:{salt:032x}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EMBEDDING_DIMENSION, EngramConfig};
    use crate::embedding::Embedder;
    use crate::embedding::cache::DiskCache;
    use crate::embedding::deterministic::HashEmbedder;
    use crate::embedding::lifecycle::ModelLifecycle;
    use std::path::Path;

    fn test_pipeline(dir: &Path) -> IngestPipeline {
        let mut config = EngramConfig::default();
        config.storage.db_path = dir.join("memory.db");
        let store = Arc::new(RecordStore::open(&config, EMBEDDING_DIMENSION).unwrap());
        let lifecycle = ModelLifecycle::new(
            Box::new(|| Ok(Arc::new(HashEmbedder::new(EMBEDDING_DIMENSION)) as Arc<dyn Embedder>)),
            EMBEDDING_DIMENSION,
        );
        let disk = DiskCache::open(&dir.join("cache.db")).unwrap();
        let cache = Arc::new(EmbedCache::new(lifecycle, disk, 1_000));
        IngestPipeline::new(store, cache)
    }

    fn pipeline_with_store(dir: &Path) -> (IngestPipeline, Arc<RecordStore>) {
        let pipeline = test_pipeline(dir);
        let store = Arc::clone(&pipeline.store);
        (pipeline, store)
    }

    #[test]
    fn remember_returns_a_16_hex_id() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(tmp.path());
        let id = pipeline
            .remember("a small note", &RememberOptions::default())
            .unwrap();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identical_long_text_dedups_to_the_first_id() {
        let tmp = tempfile::tempdir().unwrap();
        let (pipeline, store) = pipeline_with_store(tmp.path());
        let text = "Deploy the new model to production on Friday after the review completes";
        let first = pipeline.remember(text, &RememberOptions::default()).unwrap();
        let vectors_before = store.stats().unwrap().total_vectors;

        let second = pipeline.remember(text, &RememberOptions::default()).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.stats().unwrap().total_vectors, vectors_before);
    }

    #[test]
    fn short_duplicates_are_stored_twice() {
        let tmp = tempfile::tempdir().unwrap();
        let (pipeline, store) = pipeline_with_store(tmp.path());
        let first = pipeline.remember("short note", &RememberOptions::default()).unwrap();
        let second = pipeline.remember("short note", &RememberOptions::default()).unwrap();
        assert_ne!(first, second);
        assert_eq!(store.stats().unwrap().total_vectors, 2);
    }

    #[test]
    fn empty_text_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(tmp.path());
        for text in ["", "   ", "\u{0007}\u{0000}"] {
            let err = pipeline.remember(text, &RememberOptions::default()).unwrap_err();
            assert!(matches!(err, EngramError::Validation(_)), "input {text:?}");
        }
    }

    #[test]
    fn oversized_text_is_rejected_at_the_boundary() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(tmp.path());
        let just_fits = "x".repeat(MAX_TEXT_CHARS);
        assert!(pipeline.remember(&just_fits, &RememberOptions::default()).is_ok());

        let too_long = "x".repeat(MAX_TEXT_CHARS + 1);
        let err = pipeline
            .remember(&too_long, &RememberOptions::default())
            .unwrap_err();
        assert!(matches!(err, EngramError::Validation(_)));
    }

    #[test]
    fn tag_count_is_bounded() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(tmp.path());
        let mut options = RememberOptions {
            tags: (0..MAX_TAGS).map(|i| format!("t{i}")).collect(),
            ..Default::default()
        };
        assert!(pipeline.remember("tagged note", &options).is_ok());

        options.tags.push("one-too-many".to_string());
        let err = pipeline.remember("tagged note 2", &options).unwrap_err();
        assert!(matches!(err, EngramError::Validation(_)));
    }

    #[test]
    fn sanitisation_strips_control_characters() {
        assert_eq!(sanitize_text("a\u{0007}b\u{0000}c"), "abc");
        assert_eq!(sanitize_text("line\nbreak\ttab\rcr"), "line\nbreak\ttab\rcr");
    }

    #[test]
    fn rate_limit_rejects_the_61st_insert() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(tmp.path());
        let options = RememberOptions {
            source: "s1".to_string(),
            ..Default::default()
        };
        for i in 0..RATE_LIMIT_MAX {
            pipeline
                .remember(&format!("burst message number {i}"), &options)
                .unwrap();
        }
        let err = pipeline.remember("one more", &options).unwrap_err();
        match err {
            EngramError::Storage(message) => assert!(message.contains("Rate limit")),
            other => panic!("expected StorageError, got {other:?}"),
        }
    }

    #[test]
    fn rate_limit_is_per_source() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(tmp.path());
        for i in 0..RATE_LIMIT_MAX {
            pipeline
                .remember(
                    &format!("from s1 number {i}"),
                    &RememberOptions {
                        source: "s1".to_string(),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        // A different source is unaffected.
        assert!(pipeline
            .remember(
                "from s2",
                &RememberOptions {
                    source: "s2".to_string(),
                    ..Default::default()
                },
            )
            .is_ok());
    }

    #[test]
    fn document_ingest_stores_every_chunk() {
        let tmp = tempfile::tempdir().unwrap();
        let (pipeline, store) = pipeline_with_store(tmp.path());
        let text = (1..=80)
            .map(|i| format!("Paragraph sentence number {i} with a few extra words attached."))
            .collect::<Vec<_>>()
            .join(" ");
        let ids = pipeline
            .remember_document(&text, Some("Test Doc"), &RememberOptions::default())
            .unwrap();
        assert!(ids.len() > 1);
        assert_eq!(store.stats().unwrap().total_vectors as usize, ids.len());

        let first = store.get(&ids[0]).unwrap().unwrap();
        assert!(first.tags.iter().any(|t| t == "doc:Test Doc"));
        assert!(first.tags.iter().any(|t| t.starts_with("chunk:")));
    }

    #[test]
    fn rate_limiter_window_slides() {
        let limiter = RateLimiter::new(2, Duration::from_millis(50));
        assert!(limiter.admit("k"));
        assert!(limiter.admit("k"));
        assert!(!limiter.admit("k"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.admit("k"));
    }
}
