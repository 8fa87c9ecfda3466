use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::error::{EngramError, Result};

/// Embedding dimension, fixed per database. all-MiniLM-L6-v2 produces 384.
pub const EMBEDDING_DIMENSION: usize = 384;

/// Maximum record text length in characters, measured after sanitisation.
pub const MAX_TEXT_CHARS: usize = 100_000;

/// Maximum number of tags per record.
pub const MAX_TAGS: usize = 50;

/// Maximum recall query length in characters.
pub const MAX_QUERY_CHARS: usize = 1_000;

/// Minimum text length (in characters) for the near-duplicate probe to run.
pub const DEDUP_MIN_CHARS: usize = 50;

/// Cosine similarity above which a new record is treated as a duplicate.
pub const DEDUP_THRESHOLD: f64 = 0.95;

/// Multiplier for over-fetching KNN candidates before fusion and reranking.
pub const OVER_FETCH_MULTIPLIER: usize = 3;

/// Sliding-window rate limit: at most this many inserts per source...
pub const RATE_LIMIT_MAX: usize = 60;

/// ...within this many seconds.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// How long `embed` waits on the model ready-gate before giving up.
pub const MODEL_WAIT_SECS: u64 = 60;

/// Batches up to this size go through per-item caching; larger batches
/// bypass the cache and hit the model in one call.
pub const CACHE_BATCH_THRESHOLD: usize = 10;

/// Storage section of the engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the durable record store.
    pub db_path: PathBuf,
    /// SQLite journal mode. WAL keeps readers and the writer concurrent.
    pub journal_mode: String,
    /// SQLite synchronous level. NORMAL trades fsync strictness for
    /// throughput; WAL keeps the file consistent across crashes.
    pub synchronous: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_home().join("memory.db"),
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
        }
    }
}

/// Embedding section of the engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    /// Model identifier resolved by the fastembed-backed embedder.
    pub model_name: String,
    /// Directory for model artefacts and the persistent embedding cache.
    pub cache_dir: PathBuf,
    /// Capacity of the in-memory LRU tier.
    pub cache_size: u64,
    /// Batch size passed to the model for bulk embedding.
    pub batch_size: usize,
    /// Idle minutes before the model is unloaded; `None` disables the timer.
    pub idle_unload_minutes: Option<f64>,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            model_name: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            cache_dir: default_home().join("models"),
            cache_size: 1_000,
            batch_size: 32,
            idle_unload_minutes: None,
        }
    }
}

/// Search section of the engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Default number of results returned by recall.
    pub default_topk: usize,
    /// Weight of the dense (vector) channel in hybrid fusion; the sparse
    /// (BM25) channel gets `1 - hybrid_alpha`.
    pub hybrid_alpha: f64,
    /// Default recall deadline in milliseconds.
    pub timeout_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_topk: 5,
            hybrid_alpha: 0.6,
            timeout_ms: 5_000,
        }
    }
}

/// Engine configuration, merged from defaults, config files, and environment.
///
/// Precedence low to high: built-in defaults, `/etc/engram/config.toml`,
/// `~/.engram/config.toml`, then environment variables (`ENGRAM_DB_PATH`,
/// `ENGRAM_DEBUG`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngramConfig {
    pub storage: StorageConfig,
    pub embed: EmbedConfig,
    pub search: SearchConfig,
    pub debug: bool,
}

/// Default home directory for the engine's on-disk layout.
pub fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".engram")
}

impl EngramConfig {
    /// Load configuration with the full precedence chain.
    pub fn load() -> Result<Self> {
        let user_path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".engram")
            .join("config.toml");
        Self::load_from(Path::new("/etc/engram/config.toml"), &user_path)
    }

    /// Load from explicit system and user config paths (missing files are
    /// skipped), then apply environment overrides.
    pub fn load_from(system_path: &Path, user_path: &Path) -> Result<Self> {
        let mut config = Self::default();
        for path in [system_path, user_path] {
            if let Some(layer) = Self::read_layer(path)? {
                config.merge(layer);
            }
        }
        config.apply_env();
        Ok(config)
    }

    fn read_layer(path: &Path) -> Result<Option<PartialConfig>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngramError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        let parsed: PartialConfig = toml::from_str(&raw).map_err(|e| {
            EngramError::Configuration(format!("malformed config {}: {e}", path.display()))
        })?;
        Ok(Some(parsed))
    }

    fn merge(&mut self, layer: PartialConfig) {
        if let Some(storage) = layer.storage {
            if let Some(db_path) = storage.db_path {
                self.storage.db_path = db_path;
            }
            if let Some(journal_mode) = storage.journal_mode {
                self.storage.journal_mode = journal_mode;
            }
            if let Some(synchronous) = storage.synchronous {
                self.storage.synchronous = synchronous;
            }
        }
        if let Some(embed) = layer.embed {
            if let Some(model_name) = embed.model_name {
                self.embed.model_name = model_name;
            }
            if let Some(cache_dir) = embed.cache_dir {
                self.embed.cache_dir = cache_dir;
            }
            if let Some(cache_size) = embed.cache_size {
                self.embed.cache_size = cache_size;
            }
            if let Some(batch_size) = embed.batch_size {
                self.embed.batch_size = batch_size;
            }
            if let Some(minutes) = embed.idle_unload_minutes {
                self.embed.idle_unload_minutes = Some(minutes);
            }
        }
        if let Some(search) = layer.search {
            if let Some(default_topk) = search.default_topk {
                self.search.default_topk = default_topk;
            }
            if let Some(hybrid_alpha) = search.hybrid_alpha {
                self.search.hybrid_alpha = hybrid_alpha;
            }
            if let Some(timeout_ms) = search.timeout_ms {
                self.search.timeout_ms = timeout_ms;
            }
        }
        if let Some(debug) = layer.debug {
            self.debug = debug;
        }
    }

    fn apply_env(&mut self) {
        if let Ok(db_path) = std::env::var("ENGRAM_DB_PATH") {
            if !db_path.is_empty() {
                self.storage.db_path = PathBuf::from(db_path);
            }
        }
        if let Ok(debug) = std::env::var("ENGRAM_DEBUG") {
            self.debug = matches!(debug.to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    /// Validate the journal mode against the set SQLite accepts; unknown
    /// values would otherwise be spliced into a PRAGMA statement.
    pub fn validated_journal_mode(&self) -> Result<&str> {
        const MODES: &[&str] = &["WAL", "DELETE", "TRUNCATE", "PERSIST", "MEMORY", "OFF"];
        let mode = self.storage.journal_mode.to_uppercase();
        MODES
            .iter()
            .find(|m| **m == mode)
            .copied()
            .ok_or_else(|| {
                warn!(journal_mode = %self.storage.journal_mode, "Unknown journal mode");
                EngramError::Configuration(format!(
                    "unknown journal_mode: {}",
                    self.storage.journal_mode
                ))
            })
    }

    /// Validate the synchronous level the same way.
    pub fn validated_synchronous(&self) -> Result<&str> {
        const LEVELS: &[&str] = &["OFF", "NORMAL", "FULL", "EXTRA"];
        let level = self.storage.synchronous.to_uppercase();
        LEVELS
            .iter()
            .find(|l| **l == level)
            .copied()
            .ok_or_else(|| {
                EngramError::Configuration(format!(
                    "unknown synchronous level: {}",
                    self.storage.synchronous
                ))
            })
    }
}

/// A config-file layer: every field optional so files can override sparsely.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialConfig {
    storage: Option<PartialStorage>,
    embed: Option<PartialEmbed>,
    search: Option<PartialSearch>,
    debug: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialStorage {
    db_path: Option<PathBuf>,
    journal_mode: Option<String>,
    synchronous: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialEmbed {
    model_name: Option<String>,
    cache_dir: Option<PathBuf>,
    cache_size: Option<u64>,
    batch_size: Option<usize>,
    idle_unload_minutes: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialSearch {
    default_topk: Option<usize>,
    hybrid_alpha: Option<f64>,
    timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngramConfig::default();
        assert_eq!(config.storage.journal_mode, "WAL");
        assert_eq!(config.embed.cache_size, 1_000);
        assert_eq!(config.search.default_topk, 5);
        assert!((config.search.hybrid_alpha - 0.6).abs() < f64::EPSILON);
        assert!(!config.debug);
    }

    #[test]
    fn user_layer_overrides_system_layer() {
        let tmp = tempfile::tempdir().unwrap();
        let system = tmp.path().join("system.toml");
        let user = tmp.path().join("user.toml");
        std::fs::write(
            &system,
            "[search]\ndefault_topk = 10\ntimeout_ms = 1000\n",
        )
        .unwrap();
        std::fs::write(&user, "[search]\ndefault_topk = 7\n").unwrap();

        let config = EngramConfig::load_from(&system, &user).unwrap();
        assert_eq!(config.search.default_topk, 7);
        // Untouched keys keep the lower layer's value.
        assert_eq!(config.search.timeout_ms, 1000);
    }

    #[test]
    fn malformed_file_is_a_configuration_error() {
        let tmp = tempfile::tempdir().unwrap();
        let bad = tmp.path().join("bad.toml");
        std::fs::write(&bad, "storage = \"not a table\"").unwrap();

        let missing = tmp.path().join("missing.toml");
        let err = EngramConfig::load_from(&bad, &missing).unwrap_err();
        assert!(matches!(err, EngramError::Configuration(_)));
    }

    #[test]
    fn journal_mode_is_validated() {
        let mut config = EngramConfig::default();
        assert_eq!(config.validated_journal_mode().unwrap(), "WAL");
        config.storage.journal_mode = "wal".to_string();
        assert_eq!(config.validated_journal_mode().unwrap(), "WAL");
        config.storage.journal_mode = "EVIL; DROP TABLE".to_string();
        assert!(config.validated_journal_mode().is_err());
    }
}
