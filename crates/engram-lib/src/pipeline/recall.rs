//! The read path: hybrid dense + BM25 retrieval with filters, fusion,
//! reranking, and a cooperative per-call deadline.

#![allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::debug;

use crate::config::{MAX_QUERY_CHARS, OVER_FETCH_MULTIPLIER, SearchConfig};
use crate::db::store::{Deadline, Predicate, Record, RecordStore, SqlValue};
use crate::embedding::cache::EmbedCache;
use crate::error::{EngramError, Result};
use crate::pipeline::filters::{RecallOptions, build_predicate};
use crate::vecmath;

/// Weight of the fused relevance score in the final ranking; importance and
/// recency split the remainder evenly.
const RERANK_RELEVANCE_WEIGHT: f64 = 0.6;
const RERANK_IMPORTANCE_WEIGHT: f64 = 0.2;
const RERANK_RECENCY_WEIGHT: f64 = 0.2;

/// Recency decays linearly to zero over this many days.
const RECENCY_HORIZON_DAYS: f64 = 30.0;

/// A record returned from recall, with its scores.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    #[serde(flatten)]
    pub record: Record,
    /// Final rank score after folding in importance and recency.
    pub score: f64,
    /// Dense (cosine) channel score.
    pub vector_score: f64,
    /// Sparse (BM25) channel score in `[0, 1]`.
    pub bm25_score: f64,
    /// Relevance before importance and recency are folded in: the weighted
    /// fusion of the two channels, or the raw similarity when only the
    /// dense channel ran.
    pub hybrid_score: f64,
}

impl Deref for SearchResult {
    type Target = Record;

    fn deref(&self) -> &Record {
        &self.record
    }
}

/// The read pipeline; one per engine instance.
pub struct RetrievalEngine {
    store: Arc<RecordStore>,
    cache: Arc<EmbedCache>,
    config: SearchConfig,
}

impl RetrievalEngine {
    pub fn new(store: Arc<RecordStore>, cache: Arc<EmbedCache>, config: SearchConfig) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    /// Hybrid search over the store.
    ///
    /// Empty or whitespace-only queries return no results without touching
    /// the model. The deadline covers the whole call; when it fires the
    /// in-flight index query is interrupted and partial work discarded.
    pub fn recall(&self, query: &str, options: &RecallOptions) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let query_chars = query.chars().count();
        if query_chars > MAX_QUERY_CHARS {
            return Err(EngramError::Validation(format!(
                "Query too long ({query_chars} > {MAX_QUERY_CHARS} chars)"
            )));
        }

        let timeout_ms = options.timeout_ms.unwrap_or(self.config.timeout_ms);
        let deadline = (timeout_ms > 0).then(|| Deadline::after_ms(timeout_ms));
        let deadline = deadline.as_ref();

        let topk = options.topk.unwrap_or(self.config.default_topk);
        let predicate = build_predicate(options, unix_seconds())?;

        let mut query_vector = self.cache.embed(query)?;
        vecmath::normalize(&mut query_vector);
        if let Some(d) = deadline {
            d.check()?;
        }

        let fetch = topk * OVER_FETCH_MULTIPLIER;
        let dense = self
            .store
            .dense_search(&query_vector, fetch, &predicate, deadline)?;
        let sparse = self
            .store
            .keyword_search(query, fetch, &predicate, deadline)?;
        debug!(
            dense = dense.len(),
            sparse = sparse.len(),
            "Retrieved candidates"
        );

        let fused = self.fuse(dense, sparse);
        if let Some(d) = deadline {
            d.check()?;
        }
        let mut results = self.hydrate(fused)?;
        rerank(&mut results, unix_seconds());
        results.truncate(topk);
        Ok(results)
    }

    /// Batched recall: queries share one embedding batch and one
    /// candidate-predicate scan. The dense channel alone feeds the scores.
    pub fn batch_recall(
        &self,
        queries: &[String],
        options: &RecallOptions,
    ) -> Result<Vec<Vec<SearchResult>>> {
        for query in queries {
            let query_chars = query.chars().count();
            if query_chars > MAX_QUERY_CHARS {
                return Err(EngramError::Validation(format!(
                    "Query too long ({query_chars} > {MAX_QUERY_CHARS} chars)"
                )));
            }
        }

        let timeout_ms = options.timeout_ms.unwrap_or(self.config.timeout_ms);
        let deadline = (timeout_ms > 0).then(|| Deadline::after_ms(timeout_ms));
        let deadline = deadline.as_ref();

        let topk = options.topk.unwrap_or(self.config.default_topk);
        let predicate = build_predicate(options, unix_seconds())?;

        // Embed every non-empty query in a single batch, then map results
        // back to their original positions.
        let live: Vec<(usize, String)> = queries
            .iter()
            .enumerate()
            .filter(|(_, q)| !q.trim().is_empty())
            .map(|(i, q)| (i, q.clone()))
            .collect();
        let texts: Vec<String> = live.iter().map(|(_, q)| q.clone()).collect();
        let mut vectors = self.cache.embed_batch(&texts)?;
        for vector in &mut vectors {
            vecmath::normalize(vector);
        }
        if let Some(d) = deadline {
            d.check()?;
        }

        let hits = self
            .store
            .dense_search_batch(&vectors, topk, &predicate, deadline)?;

        let mut out: Vec<Vec<SearchResult>> = (0..queries.len()).map(|_| Vec::new()).collect();
        for ((slot, _), query_hits) in live.iter().zip(hits) {
            // No BM25 channel was queried, so the score is the raw cosine
            // similarity, not an alpha-weighted blend.
            let scored: Vec<ScoredId> = query_hits
                .into_iter()
                .map(|(id, sim)| ScoredId {
                    id,
                    vector_score: sim,
                    bm25_score: 0.0,
                    combined: sim,
                })
                .collect();
            out[*slot] = self.hydrate(scored)?;
        }
        Ok(out)
    }

    /// The N most recent records in a collection, newest first.
    pub fn get_recent(&self, n: usize, collection: &str) -> Result<Vec<Record>> {
        self.store.recent(n, collection)
    }

    /// Records similar to an existing text, excluding the record itself.
    pub fn find_similar(
        &self,
        text: &str,
        exclude_id: Option<&str>,
        topk: usize,
    ) -> Result<Vec<SearchResult>> {
        let options = RecallOptions {
            topk: Some(topk + 1),
            ..Default::default()
        };
        let mut results = self.recall(text, &options)?;
        if let Some(exclude) = exclude_id {
            results.retain(|r| r.record.id != exclude);
        }
        results.truncate(topk);
        Ok(results)
    }

    /// Filter-only lookup: the most recent records carrying any of `tags`.
    pub fn search_by_tag(&self, tags: &[String], topk: usize) -> Result<Vec<Record>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let clause = format!(
            "({})",
            tags.iter()
                .map(|_| "m.tags LIKE ?")
                .collect::<Vec<_>>()
                .join(" OR ")
        );
        let predicate = Predicate {
            clause,
            values: tags
                .iter()
                .map(|t| SqlValue::Text(format!("%{t}%")))
                .collect(),
        };
        self.store.find_filtered(&predicate, topk)
    }

    /// Merge the dense and sparse candidate lists by id, computing the
    /// weighted combined score. A candidate seen by only one channel keeps
    /// a zero for the other.
    fn fuse(&self, dense: Vec<(String, f64)>, sparse: Vec<(String, f64)>) -> Vec<ScoredId> {
        let alpha = self.config.hybrid_alpha.clamp(0.0, 1.0);
        let mut by_id: HashMap<String, (f64, f64)> = HashMap::new();
        for (id, sim) in dense {
            by_id.entry(id).or_insert((0.0, 0.0)).0 = sim;
        }
        for (id, bm25) in sparse {
            by_id.entry(id).or_insert((0.0, 0.0)).1 = bm25;
        }
        let mut fused: Vec<ScoredId> = by_id
            .into_iter()
            .map(|(id, (vector_score, bm25_score))| ScoredId {
                id,
                vector_score,
                bm25_score,
                combined: alpha * vector_score + (1.0 - alpha) * bm25_score,
            })
            .collect();
        fused.sort_by(|a, b| {
            b.combined
                .partial_cmp(&a.combined)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        fused
    }

    /// Bulk-load the scored candidates into full records, preserving scored
    /// order. The combined score is taken as given so dense-only callers
    /// keep the raw similarity.
    fn hydrate(&self, scored: Vec<ScoredId>) -> Result<Vec<SearchResult>> {
        let ids: Vec<String> = scored.iter().map(|s| s.id.clone()).collect();
        let records = self.store.get_many(&ids)?;
        let mut by_id: HashMap<String, Record> =
            records.into_iter().map(|r| (r.id.clone(), r)).collect();

        Ok(scored
            .into_iter()
            .filter_map(|candidate| {
                by_id.remove(&candidate.id).map(|record| SearchResult {
                    record,
                    score: candidate.combined,
                    vector_score: candidate.vector_score,
                    bm25_score: candidate.bm25_score,
                    hybrid_score: candidate.combined,
                })
            })
            .collect())
    }
}

/// A candidate id with its per-channel scores and the combined score the
/// results are ordered by.
struct ScoredId {
    id: String,
    vector_score: f64,
    bm25_score: f64,
    combined: f64,
}

/// Fold importance and recency into the relevance score and re-sort.
fn rerank(results: &mut [SearchResult], now: i64) {
    for result in results.iter_mut() {
        let age_days = (now - result.record.timestamp).max(0) as f64 / 86_400.0;
        let recency = (1.0 - age_days / RECENCY_HORIZON_DAYS).max(0.0);
        result.score = RERANK_RELEVANCE_WEIGHT * result.hybrid_score
            + RERANK_IMPORTANCE_WEIGHT * result.record.importance
            + RERANK_RECENCY_WEIGHT * recency;
    }
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
}

fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, hybrid: f64, importance: f64, age_days: i64) -> SearchResult {
        let now = 100 * 86_400;
        SearchResult {
            record: Record {
                id: id.to_string(),
                text: String::new(),
                timestamp: now - age_days * 86_400,
                source: "test".to_string(),
                session_id: String::new(),
                importance,
                tags: vec![],
                collection: "knowledge".to_string(),
                embedding: None,
            },
            score: 0.0,
            vector_score: hybrid,
            bm25_score: 0.0,
            hybrid_score: hybrid,
        }
    }

    #[test]
    fn rerank_prefers_recent_and_important_records() {
        let now = 100 * 86_400;
        // Same relevance; fresher and more important must win.
        let mut results = vec![
            result("old-dull", 0.8, 0.1, 60),
            result("new-sharp", 0.8, 0.9, 0),
        ];
        rerank(&mut results, now);
        assert_eq!(results[0].record.id, "new-sharp");

        // 0.6 * 0.8 + 0.2 * 0.9 + 0.2 * 1.0 = 0.86
        assert!((results[0].score - 0.86).abs() < 1e-9);
        // Recency floors at zero past the horizon.
        assert!((results[1].score - (0.6 * 0.8 + 0.2 * 0.1)).abs() < 1e-9);
    }

    #[test]
    fn rerank_is_deterministic_on_score_ties() {
        let now = 100 * 86_400;
        let mut results = vec![
            result("bbb", 0.5, 0.5, 10),
            result("aaa", 0.5, 0.5, 10),
        ];
        rerank(&mut results, now);
        assert_eq!(results[0].record.id, "aaa");
    }
}
