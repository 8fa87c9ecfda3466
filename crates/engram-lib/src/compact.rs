//! Compaction: replace many aged low-importance records with one extractive
//! summary record per group, reclaiming space while keeping the gist.

#![allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{info, warn};

use crate::db::store::{Record, RecordStore};
use crate::embedding::cache::EmbedCache;
use crate::embedding::hashing::id_digest;
use crate::error::Result;
use crate::vecmath;

/// Compaction tuning knobs.
#[derive(Debug, Clone)]
pub struct CompactorConfig {
    /// Records younger than this never compact.
    pub age_days: i64,
    /// Records above this importance never compact.
    pub compact_importance_threshold: f64,
    /// Groups smaller than this are left alone.
    pub min_memories_to_compact: usize,
    /// Importance assigned to summary records so they survive later runs.
    pub summary_importance: f64,
    /// Report what would change without writing.
    pub dry_run: bool,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            age_days: 30,
            compact_importance_threshold: 0.6,
            min_memories_to_compact: 5,
            summary_importance: 0.85,
            dry_run: false,
        }
    }
}

/// Outcome of one compaction run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompactionStats {
    pub memories_scanned: usize,
    pub memories_compacted: usize,
    pub summaries_created: usize,
    pub groups_compacted: Vec<String>,
    /// Groups that failed, with their error messages; failures never abort
    /// the rest of the run.
    pub groups_failed: Vec<(String, String)>,
    /// Dry-run only: group key → the summary text that would replace the
    /// group's members.
    pub summary_previews: Vec<(String, String)>,
}

/// Snapshot of the store's age profile with a compaction recommendation.
#[derive(Debug, Clone, Serialize)]
pub struct CompactionReport {
    pub total_memories: i64,
    pub unique_sources: i64,
    pub age_distribution: HashMap<String, AgeBucket>,
    pub collection_counts: HashMap<String, i64>,
    pub compaction_candidates: usize,
    pub recommendation: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgeBucket {
    pub count: i64,
    pub avg_importance: f64,
}

/// Keyword taxonomy for topic detection, first match wins.
const TOPICS: &[(&[&str], &str)] = &[
    (&["federation", "ssh", "tunnel"], "federation"),
    (&["memory", "vector", "embedding"], "memory_system"),
    (&["wifi", "network", "driver"], "network"),
    (&["server", "hardware"], "hardware"),
    (&["agent", "skill", "framework"], "agent_framework"),
    (&["cron", "backup", "scheduled"], "automation"),
];

pub struct Compactor {
    store: Arc<RecordStore>,
    cache: Arc<EmbedCache>,
    config: CompactorConfig,
}

impl Compactor {
    pub fn new(store: Arc<RecordStore>, cache: Arc<EmbedCache>, config: CompactorConfig) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    /// Run one compaction pass. Per-group failures are collected in the
    /// stats rather than aborting the run.
    pub fn run(&self) -> Result<CompactionStats> {
        let now = unix_seconds();
        let cutoff = now - self.config.age_days * 86_400;
        let candidates = self
            .store
            .compaction_candidates(cutoff, self.config.compact_importance_threshold)?;
        info!(
            candidates = candidates.len(),
            age_days = self.config.age_days,
            dry_run = self.config.dry_run,
            "Compaction scan"
        );

        let mut stats = CompactionStats {
            memories_scanned: candidates.len(),
            ..Default::default()
        };
        if candidates.len() < self.config.min_memories_to_compact {
            return Ok(stats);
        }

        let mut groups = self.group_by_topic(candidates);
        // Deterministic processing order.
        let mut keys: Vec<String> = groups.keys().cloned().collect();
        keys.sort();

        for key in keys {
            let members = groups.remove(&key).expect("key came from the map");
            if self.config.dry_run {
                // Build the summary anyway so the caller can inspect what
                // would replace the group; only the write is skipped.
                let summary = summarize_group(&key, &members);
                info!(group = %key, members = members.len(), "Dry run: would compact");
                stats.memories_compacted += members.len();
                stats.summaries_created += 1;
                stats.groups_compacted.push(key.clone());
                stats.summary_previews.push((key, summary));
                continue;
            }
            match self.compact_group(&key, &members, now) {
                Ok(()) => {
                    stats.memories_compacted += members.len();
                    stats.summaries_created += 1;
                    stats.groups_compacted.push(key);
                }
                Err(err) => {
                    warn!(group = %key, error = %err, "Group compaction failed");
                    stats.groups_failed.push((key, err.to_string()));
                }
            }
        }

        info!(
            compacted = stats.memories_compacted,
            summaries = stats.summaries_created,
            failed = stats.groups_failed.len(),
            "Compaction complete"
        );
        Ok(stats)
    }

    /// Age profile and candidate count for hosts deciding when to compact.
    pub fn report(&self) -> Result<CompactionReport> {
        let now = unix_seconds();
        let cutoff = now - self.config.age_days * 86_400;
        let (total_memories, unique_sources) = self.store.totals()?;
        let age_distribution = self
            .store
            .age_distribution(now)?
            .into_iter()
            .map(|(bucket, (count, avg_importance))| {
                (
                    bucket,
                    AgeBucket {
                        count,
                        avg_importance: (avg_importance * 100.0).round() / 100.0,
                    },
                )
            })
            .collect();
        let collection_counts = self.store.stats()?.collections;
        let candidates = self
            .store
            .compaction_candidates(cutoff, self.config.compact_importance_threshold)?
            .len();

        Ok(CompactionReport {
            total_memories,
            unique_sources,
            age_distribution,
            collection_counts,
            compaction_candidates: candidates,
            recommendation: if candidates > 50 {
                "Run compaction"
            } else {
                "No action needed"
            },
        })
    }

    /// Bucket candidates by `(collection, month)` for conversational data
    /// and `(collection, detected topic)` otherwise; drop under-sized
    /// groups.
    fn group_by_topic(&self, candidates: Vec<Record>) -> HashMap<String, Vec<Record>> {
        let mut groups: HashMap<String, Vec<Record>> = HashMap::new();
        for record in candidates {
            let key = if record.collection == "conversations" {
                format!("{}_{}", record.collection, month_bucket(record.timestamp))
            } else if let Some(topic) = detect_topic(&record.text) {
                format!("{}_{topic}", record.collection)
            } else {
                format!("{}_{}", record.collection, month_bucket(record.timestamp))
            };
            groups.entry(key).or_default().push(record);
        }
        groups.retain(|_, members| members.len() >= self.config.min_memories_to_compact);
        groups
    }

    /// Insert the summary and delete the members, all-or-nothing.
    fn compact_group(&self, group_key: &str, members: &[Record], now: i64) -> Result<()> {
        let summary_text = summarize_group(group_key, members);
        let mut embedding = self.cache.embed(&summary_text)?;
        vecmath::normalize(&mut embedding);

        let salt: u128 = rand::random();
        let summary = Record {
            id: id_digest(&format!("{summary_text}:{now}:{salt:032x}")),
            text: summary_text,
            timestamp: now,
            source: "compaction".to_string(),
            session_id: "default".to_string(),
            importance: self.config.summary_importance,
            tags: vec![
                "compacted".to_string(),
                "summary".to_string(),
                group_key.to_string(),
            ],
            collection: "compacted".to_string(),
            embedding: None,
        };
        let member_ids: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
        self.store.swap_for_summary(&summary, &embedding, &member_ids)
    }
}

/// Extractive summary: header with date range and count, the most important
/// excerpts, and a closing footer.
fn summarize_group(group_key: &str, members: &[Record]) -> String {
    let first_ts = members.iter().map(|m| m.timestamp).min().unwrap_or(0);
    let last_ts = members.iter().map(|m| m.timestamp).max().unwrap_or(0);
    let start_date = date_string(first_ts);
    let end_date = date_string(last_ts);
    let date_range = if start_date == end_date {
        start_date
    } else {
        format!("{start_date} to {end_date}")
    };

    let collection = group_key.split('_').next().unwrap_or("knowledge");

    let mut sorted: Vec<&Record> = members.iter().collect();
    sorted.sort_by(|a, b| {
        b.importance
            .partial_cmp(&a.importance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut lines = vec![
        format!("[COMPACTED SUMMARY] {collection} from {date_range}"),
        format!("Original memories: {}", members.len()),
        String::new(),
        "Key points:".to_string(),
    ];
    for member in sorted.iter().take(5) {
        lines.push(format!("- {}", truncate_chars(&member.text, 200)));
    }
    lines.push(String::new());
    lines.push(format!(
        "[This summary replaces {} individual memories to save space]",
        members.len()
    ));
    lines.join("\n")
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{cut}...")
}

/// First matching topic from the fixed taxonomy.
fn detect_topic(text: &str) -> Option<&'static str> {
    let lowered = text.to_lowercase();
    TOPICS
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|kw| lowered.contains(kw)))
        .map(|(_, topic)| *topic)
}

fn month_bucket(timestamp: i64) -> String {
    jiff::Timestamp::from_second(timestamp)
        .map(|ts| ts.strftime("%Y_%m").to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn date_string(timestamp: i64) -> String {
    jiff::Timestamp::from_second(timestamp)
        .map(|ts| ts.strftime("%Y-%m-%d").to_string())
        .unwrap_or_else(|_| "unknown".to_string())
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
    use crate::config::{EMBEDDING_DIMENSION, EngramConfig};
    use crate::embedding::Embedder;
    use crate::embedding::cache::DiskCache;
    use crate::embedding::deterministic::HashEmbedder;
    use crate::embedding::lifecycle::ModelLifecycle;
    use std::path::Path;

    fn test_parts(dir: &Path) -> (Arc<RecordStore>, Arc<EmbedCache>) {
        let mut config = EngramConfig::default();
        config.storage.db_path = dir.join("memory.db");
        let store = Arc::new(RecordStore::open(&config, EMBEDDING_DIMENSION).unwrap());
        let lifecycle = ModelLifecycle::new(
            Box::new(|| Ok(Arc::new(HashEmbedder::new(EMBEDDING_DIMENSION)) as Arc<dyn Embedder>)),
            EMBEDDING_DIMENSION,
        );
        let disk = DiskCache::open(&dir.join("cache.db")).unwrap();
        (store, Arc::new(EmbedCache::new(lifecycle, disk, 100)))
    }

    fn aged_record(id: &str, text: &str, importance: f64, age_days: i64) -> (Record, Vec<f32>) {
        let embedder = HashEmbedder::new(EMBEDDING_DIMENSION);
        let record = Record {
            id: id.to_string(),
            text: text.to_string(),
            timestamp: unix_seconds() - age_days * 86_400,
            source: "test".to_string(),
            session_id: "default".to_string(),
            importance,
            tags: vec![],
            collection: "knowledge".to_string(),
            embedding: None,
        };
        let embedding = embedder.embed(text).unwrap();
        (record, embedding)
    }

    fn seed_aged_group(store: &RecordStore, count: usize, topic_word: &str) {
        for i in 0..count {
            let (record, embedding) = aged_record(
                &format!("aaaa0000000000{i:02x}"),
                &format!("note {i} about the {topic_word} rollout"),
                0.3,
                60,
            );
            store.insert(&record, &embedding).unwrap();
        }
    }

    #[test]
    fn compaction_swaps_a_group_for_one_summary() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, cache) = test_parts(tmp.path());
        seed_aged_group(&store, 6, "wifi");

        let compactor = Compactor::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            CompactorConfig::default(),
        );
        let stats = compactor.run().unwrap();
        assert_eq!(stats.memories_scanned, 6);
        assert_eq!(stats.memories_compacted, 6);
        assert_eq!(stats.summaries_created, 1);
        assert_eq!(stats.groups_compacted, vec!["knowledge_network".to_string()]);
        assert!(stats.groups_failed.is_empty());

        let store_stats = store.stats().unwrap();
        assert_eq!(store_stats.collections.get("compacted"), Some(&1));
        assert_eq!(store_stats.collections.get("knowledge"), None);
        assert_eq!(store_stats.total_vectors, 1);
    }

    #[test]
    fn summaries_are_not_recompacted() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, cache) = test_parts(tmp.path());
        seed_aged_group(&store, 6, "wifi");

        let compactor = Compactor::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            CompactorConfig::default(),
        );
        compactor.run().unwrap();
        let stats = compactor.run().unwrap();
        assert_eq!(stats.memories_compacted, 0);
        assert_eq!(stats.summaries_created, 0);
    }

    #[test]
    fn dry_run_reports_without_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, cache) = test_parts(tmp.path());
        seed_aged_group(&store, 6, "wifi");

        let compactor = Compactor::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            CompactorConfig {
                dry_run: true,
                ..Default::default()
            },
        );
        let stats = compactor.run().unwrap();
        assert_eq!(stats.memories_compacted, 6);
        assert_eq!(stats.summaries_created, 1);

        // The summary is still constructed so its content can be inspected.
        assert_eq!(stats.summary_previews.len(), 1);
        let (group, preview) = &stats.summary_previews[0];
        assert_eq!(group, "knowledge_network");
        assert!(preview.starts_with("[COMPACTED SUMMARY]"));
        assert!(preview.contains("Original memories: 6"));

        // Nothing actually changed.
        let store_stats = store.stats().unwrap();
        assert_eq!(store_stats.collections.get("knowledge"), Some(&6));
        assert_eq!(store_stats.collections.get("compacted"), None);
    }

    #[test]
    fn recent_and_important_records_are_spared() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, cache) = test_parts(tmp.path());
        // Old but important.
        for i in 0..3 {
            let (record, embedding) = aged_record(
                &format!("bbbb0000000000{i:02x}"),
                &format!("critical decision {i} about the wifi rollout"),
                0.9,
                60,
            );
            store.insert(&record, &embedding).unwrap();
        }
        // Unimportant but recent.
        for i in 0..3 {
            let (record, embedding) = aged_record(
                &format!("cccc0000000000{i:02x}"),
                &format!("minor note {i} about the wifi rollout"),
                0.2,
                1,
            );
            store.insert(&record, &embedding).unwrap();
        }

        let compactor = Compactor::new(store, cache, CompactorConfig::default());
        let stats = compactor.run().unwrap();
        assert_eq!(stats.memories_scanned, 0);
        assert_eq!(stats.memories_compacted, 0);
    }

    #[test]
    fn small_groups_are_left_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, cache) = test_parts(tmp.path());
        seed_aged_group(&store, 4, "wifi");

        let compactor = Compactor::new(
            Arc::clone(&store),
            cache,
            CompactorConfig::default(),
        );
        let stats = compactor.run().unwrap();
        assert_eq!(stats.memories_compacted, 0);
        assert_eq!(store.stats().unwrap().collections.get("knowledge"), Some(&4));
    }

    #[test]
    fn summary_text_carries_header_excerpts_and_footer() {
        let members: Vec<Record> = (0..6)
            .map(|i| {
                Record {
                    id: format!("dddd0000000000{i:02x}"),
                    text: format!("member {i} text"),
                    timestamp: 1_700_000_000 + i * 86_400,
                    source: "test".to_string(),
                    session_id: String::new(),
                    importance: 0.1 * i as f64,
                    tags: vec![],
                    collection: "knowledge".to_string(),
                    embedding: None,
                }
            })
            .collect();
        let summary = summarize_group("knowledge_network", &members);
        assert!(summary.starts_with("[COMPACTED SUMMARY] knowledge from "));
        assert!(summary.contains("Original memories: 6"));
        assert!(summary.contains("Key points:"));
        // Top-5 excerpts only, most important first.
        assert!(summary.contains("- member 5 text"));
        assert!(!summary.contains("- member 0 text"));
        assert!(summary.ends_with("[This summary replaces 6 individual memories to save space]"));
    }

    #[test]
    fn topic_detection_uses_the_taxonomy() {
        assert_eq!(detect_topic("the SSH tunnel dropped"), Some("federation"));
        assert_eq!(detect_topic("vector embeddings are neat"), Some("memory_system"));
        assert_eq!(detect_topic("completely unrelated text"), None);
    }

    #[test]
    fn report_counts_candidates() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, cache) = test_parts(tmp.path());
        seed_aged_group(&store, 6, "wifi");

        let compactor = Compactor::new(store, cache, CompactorConfig::default());
        let report = compactor.report().unwrap();
        assert_eq!(report.total_memories, 6);
        assert_eq!(report.unique_sources, 1);
        assert_eq!(report.compaction_candidates, 6);
        assert_eq!(report.recommendation, "No action needed");
        assert!(report.age_distribution.contains_key("last_90d"));
    }
}
