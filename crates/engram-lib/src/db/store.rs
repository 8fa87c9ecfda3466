//! Durable record storage with the integrated vector index and FTS mirror.
//!
//! All writes funnel through one connection behind a mutex; a committed
//! transaction always carries the record row, its vector-index entry, and
//! its FTS row together, so readers never observe a half-indexed record.

#![allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use rusqlite::types::ToSqlOutput;
use rusqlite::{Connection, OptionalExtension, ToSql, params, params_from_iter};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngramConfig;
use crate::db::schema;
use crate::db::vector_index::{MatrixIndex, VectorIndex};
use crate::error::{EngramError, Result};

/// A stored memory unit: text, metadata, and (when loaded) its vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    /// Opaque 16-hex-character identifier.
    pub id: String,
    pub text: String,
    /// Seconds since epoch, set at creation.
    pub timestamp: i64,
    /// Caller-supplied tag used for rate-limiting and filtering.
    pub source: String,
    pub session_id: String,
    /// Salience in `[0.0, 1.0]`.
    pub importance: f64,
    pub tags: Vec<String>,
    /// Partition key, default `"knowledge"`.
    pub collection: String,
    /// Unit-norm vector; populated on point lookup, skipped on bulk reads.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

/// Per-store counters.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub collections: HashMap<String, i64>,
    pub total_vectors: i64,
    pub backend: &'static str,
    pub db_path: PathBuf,
}

/// A dynamically-typed SQL parameter for predicate building.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Text(String),
    Int(i64),
    Real(f64),
    Blob(Vec<u8>),
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            SqlValue::Text(s) => s.to_sql(),
            SqlValue::Int(i) => i.to_sql(),
            SqlValue::Real(f) => f.to_sql(),
            SqlValue::Blob(b) => b.to_sql(),
        }
    }
}

/// A WHERE fragment over the `memories` table (aliased `m`) plus its bound
/// values. Placeholders are plain `?` so the fragment splices into any
/// position of a larger statement.
#[derive(Debug, Clone)]
pub struct Predicate {
    pub clause: String,
    pub values: Vec<SqlValue>,
}

impl Predicate {
    /// The always-true predicate.
    pub fn always() -> Self {
        Self {
            clause: "1=1".to_string(),
            values: Vec::new(),
        }
    }

    pub fn is_trivial(&self) -> bool {
        self.clause == "1=1"
    }
}

/// A per-call deadline for cooperative query cancellation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    pub at: Instant,
    pub timeout_ms: u64,
}

impl Deadline {
    pub fn after_ms(timeout_ms: u64) -> Self {
        Self {
            at: Instant::now() + std::time::Duration::from_millis(timeout_ms),
            timeout_ms,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Surface a typed timeout once the deadline has passed.
    pub fn check(&self) -> Result<()> {
        if self.expired() {
            Err(EngramError::QueryTimeout {
                timeout_ms: self.timeout_ms,
            })
        } else {
            Ok(())
        }
    }
}

enum VectorBackend {
    /// `vec0` virtual table inside the database, written in-transaction.
    Integrated,
    /// In-memory matrix rebuilt from record rows on open.
    Matrix(RwLock<MatrixIndex>),
}

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the `vec0` module for every subsequently opened connection.
#[allow(unsafe_code)]
fn register_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute::<
            *const (),
            unsafe extern "C" fn(),
        >(sqlite_vec::sqlite3_vec_init as *const ())));
    });
}

/// The durable record store.
pub struct RecordStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    dim: usize,
    fts_available: bool,
    backend: VectorBackend,
}

impl RecordStore {
    /// Open (or create) the store at the configured path, applying
    /// migrations and initialising the vector and FTS indexes.
    pub fn open(config: &EngramConfig, dim: usize) -> Result<Self> {
        Self::open_inner(config, dim, true)
    }

    fn open_inner(config: &EngramConfig, dim: usize, prefer_integrated: bool) -> Result<Self> {
        register_sqlite_vec();

        let db_path = config.storage.db_path.clone();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(&db_path)?;
        let journal_mode = config.validated_journal_mode()?;
        // journal_mode returns the resulting mode as a row.
        let _mode: String = conn.query_row(
            &format!("PRAGMA journal_mode={journal_mode}"),
            [],
            |row| row.get(0),
        )?;
        conn.pragma_update(None, "synchronous", config.validated_synchronous()?)?;

        schema::apply_migrations(&mut conn)?;

        let backend = if prefer_integrated {
            match Self::init_vec_table(&conn, dim) {
                Ok(()) => VectorBackend::Integrated,
                Err(err) => {
                    warn!(error = %err, "vec0 unavailable, falling back to in-memory index");
                    VectorBackend::Matrix(RwLock::new(Self::build_matrix(&conn, dim)?))
                }
            }
        } else {
            VectorBackend::Matrix(RwLock::new(Self::build_matrix(&conn, dim)?))
        };

        let fts_available = match Self::init_fts(&conn) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "FTS5 unavailable, keyword channel disabled");
                false
            }
        };

        let backend_label = match backend {
            VectorBackend::Integrated => "sqlite-vec",
            VectorBackend::Matrix(_) => "matrix",
        };
        info!(
            db_path = %db_path.display(),
            backend = backend_label,
            fts_available,
            "Opened record store"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
            dim,
            fts_available,
            backend,
        })
    }

    /// Create the `vec0` table and backfill entries missing for existing
    /// records (e.g. after restoring a backup taken mid-life).
    fn init_vec_table(conn: &Connection, dim: usize) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS memories_vec USING vec0(
                 id TEXT PRIMARY KEY,
                 embedding FLOAT[{dim}] distance_metric=cosine
             )"
        ))?;

        let vec_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM memories_vec", [], |row| row.get(0))?;
        let mem_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE embedding IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        if vec_count < mem_count {
            info!(missing = mem_count - vec_count, "Backfilling vector index");
            conn.execute(
                "INSERT INTO memories_vec (id, embedding)
                 SELECT id, embedding FROM memories
                 WHERE embedding IS NOT NULL
                   AND id NOT IN (SELECT id FROM memories_vec)",
                [],
            )?;
        }
        Ok(())
    }

    fn build_matrix(conn: &Connection, dim: usize) -> Result<MatrixIndex> {
        let mut index = MatrixIndex::new(dim);
        let mut stmt =
            conn.prepare("SELECT id, embedding FROM memories WHERE embedding IS NOT NULL")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        for row in rows {
            let (id, blob) = row?;
            if blob.len() == dim * 4 {
                index.add(&id, &bytemuck::pod_collect_to_vec::<u8, f32>(&blob))?;
            } else {
                warn!(id = %id, "Skipping record with malformed embedding blob");
            }
        }
        Ok(index)
    }

    /// Create the external-content FTS5 mirror and populate it on first use.
    fn init_fts(conn: &Connection) -> Result<()> {
        let exists: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'memories_fts'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            conn.execute_batch(
                "CREATE VIRTUAL TABLE memories_fts USING fts5(
                     text, content='memories', content_rowid='rowid'
                 )",
            )?;
            conn.execute(
                "INSERT INTO memories_fts (rowid, text)
                 SELECT rowid, text FROM memories WHERE text IS NOT NULL",
                [],
            )?;
        }
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn fts_available(&self) -> bool {
        self.fts_available
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            VectorBackend::Integrated => "sqlite-vec",
            VectorBackend::Matrix(_) => "matrix",
        }
    }

    /// Insert a record together with its vector and FTS rows in one
    /// transaction.
    pub fn insert(&self, record: &Record, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dim {
            return Err(EngramError::Embedding(format!(
                "vector dimension {} does not match database dimension {}",
                embedding.len(),
                self.dim
            )));
        }
        let blob: &[u8] = bytemuck::cast_slice(embedding);

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO memories
                 (id, text, timestamp, source, session_id, importance, tags, collection, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id,
                record.text,
                record.timestamp,
                record.source,
                record.session_id,
                record.importance,
                record.tags.join(","),
                record.collection,
                blob,
            ],
        )?;
        if self.fts_available {
            tx.execute(
                "INSERT INTO memories_fts (rowid, text) VALUES (last_insert_rowid(), ?1)",
                params![record.text],
            )?;
        }
        if matches!(self.backend, VectorBackend::Integrated) {
            tx.execute(
                "INSERT INTO memories_vec (id, embedding) VALUES (?1, ?2)",
                params![record.id, blob],
            )?;
        }
        tx.commit()?;
        drop(conn);

        if let VectorBackend::Matrix(index) = &self.backend {
            index.write().add(&record.id, embedding)?;
        }
        debug!(id = %record.id, collection = %record.collection, "Inserted record");
        Ok(())
    }

    /// Delete a record and its vector entry. Deleting a missing id is a
    /// successful no-op returning `false`.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let deleted = tx.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        if matches!(self.backend, VectorBackend::Integrated) {
            tx.execute("DELETE FROM memories_vec WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        drop(conn);

        if let VectorBackend::Matrix(index) = &self.backend {
            index.write().remove(id);
        }
        debug!(id, deleted = deleted > 0, "Deleted record");
        Ok(deleted > 0)
    }

    /// Point lookup including the stored vector.
    pub fn get(&self, id: &str) -> Result<Option<Record>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, text, timestamp, source, session_id, importance, tags, collection,
                        embedding
                 FROM memories WHERE id = ?1",
                params![id],
                |row| {
                    let mut record = record_from_row(row)?;
                    let blob: Option<Vec<u8>> = row.get(8)?;
                    record.embedding =
                        blob.map(|b| bytemuck::pod_collect_to_vec::<u8, f32>(&b));
                    Ok(record)
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Bulk lookup preserving caller order; missing ids are skipped.
    pub fn get_many(&self, ids: &[String]) -> Result<Vec<Record>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, text, timestamp, source, session_id, importance, tags, collection
             FROM memories WHERE id IN ({placeholders})"
        ))?;
        let mut by_id: HashMap<String, Record> = stmt
            .query_map(params_from_iter(ids.iter()), |row| {
                let record = record_from_row(row)?;
                Ok((record.id.clone(), record))
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// The N most recent records in a collection.
    pub fn recent(&self, n: usize, collection: &str) -> Result<Vec<Record>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, text, timestamp, source, session_id, importance, tags, collection
             FROM memories WHERE collection = ?1
             ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![collection, n as i64], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Most recent records matching a predicate, newest first.
    pub fn find_filtered(&self, predicate: &Predicate, limit: usize) -> Result<Vec<Record>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, text, timestamp, source, session_id, importance, tags, collection
             FROM memories m WHERE {}
             ORDER BY m.timestamp DESC LIMIT ?",
            predicate.clause
        ))?;
        let mut values = predicate.values.clone();
        values.push(SqlValue::Int(limit as i64));
        let rows = stmt
            .query_map(params_from_iter(values.iter()), record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Ids matching a predicate (the fallback index's candidate scan).
    pub fn filtered_ids(&self, predicate: &Predicate) -> Result<HashSet<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT id FROM memories m WHERE {}",
            predicate.clause
        ))?;
        let ids = stmt
            .query_map(params_from_iter(predicate.values.iter()), |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(ids)
    }

    /// Dense KNN: `(id, similarity)` pairs satisfying the predicate, best
    /// first.
    pub fn dense_search(
        &self,
        query: &[f32],
        k: usize,
        predicate: &Predicate,
        deadline: Option<&Deadline>,
    ) -> Result<Vec<(String, f64)>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        match &self.backend {
            VectorBackend::Integrated => {
                let conn = self.conn.lock();
                with_deadline(&conn, deadline, || {
                    knn_integrated(&conn, query, k, predicate)
                })
            }
            VectorBackend::Matrix(index) => {
                let candidates = if predicate.is_trivial() {
                    None
                } else {
                    Some(self.filtered_ids(predicate)?)
                };
                if let Some(d) = deadline {
                    d.check()?;
                }
                Ok(index.read().search_within(query, k, candidates.as_ref()))
            }
        }
    }

    /// Batched dense KNN sharing the candidate scan (and the prepared KNN
    /// statement) across all queries.
    pub fn dense_search_batch(
        &self,
        queries: &[Vec<f32>],
        k: usize,
        predicate: &Predicate,
        deadline: Option<&Deadline>,
    ) -> Result<Vec<Vec<(String, f64)>>> {
        match &self.backend {
            VectorBackend::Integrated => {
                let conn = self.conn.lock();
                with_deadline(&conn, deadline, || {
                    queries
                        .iter()
                        .map(|q| knn_integrated(&conn, q, k, predicate))
                        .collect()
                })
            }
            VectorBackend::Matrix(index) => {
                let candidates = if predicate.is_trivial() {
                    None
                } else {
                    Some(self.filtered_ids(predicate)?)
                };
                let index = index.read();
                queries
                    .iter()
                    .map(|q| {
                        if let Some(d) = deadline {
                            d.check()?;
                        }
                        Ok(index.search_within(q, k, candidates.as_ref()))
                    })
                    .collect()
            }
        }
    }

    /// Sparse (BM25) search over the FTS mirror. The raw FTS rank is mapped
    /// into `[0, 1]`; an unavailable FTS index yields no candidates.
    pub fn keyword_search(
        &self,
        query: &str,
        k: usize,
        predicate: &Predicate,
        deadline: Option<&Deadline>,
    ) -> Result<Vec<(String, f64)>> {
        if !self.fts_available || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        // Quote the query as a literal phrase so FTS operators and
        // punctuation (e.g. dots in an IP address) cannot break the parse.
        let phrase = format!("\"{}\"", query.replace('"', "\"\""));

        let mut values = vec![SqlValue::Text(phrase)];
        values.extend(predicate.values.iter().cloned());
        values.push(SqlValue::Int(k as i64));

        let conn = self.conn.lock();
        with_deadline(&conn, deadline, || {
            let mut stmt = conn.prepare(&format!(
                "SELECT m.id, fts.rank
                 FROM memories_fts fts
                 JOIN memories m ON m.rowid = fts.rowid
                 WHERE memories_fts MATCH ? AND {}
                 ORDER BY fts.rank LIMIT ?",
                predicate.clause
            ))?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    let id: String = row.get(0)?;
                    let rank: f64 = row.get::<_, Option<f64>>(1)?.unwrap_or(-10.0);
                    Ok((id, rank))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            // FTS rank is negative, smaller is better; squash into [0, 1].
            Ok(rows
                .into_iter()
                .map(|(id, rank)| (id, ((10.0 + rank) / 9.0).clamp(0.0, 1.0)))
                .collect())
        })
    }

    /// Per-collection counts plus the vector total.
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT collection, COUNT(*) FROM memories GROUP BY collection")?;
        let collections = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;

        let total_vectors = match &self.backend {
            VectorBackend::Integrated => {
                conn.query_row("SELECT COUNT(*) FROM memories_vec", [], |row| row.get(0))?
            }
            VectorBackend::Matrix(index) => index.read().size() as i64,
        };

        Ok(StoreStats {
            collections,
            total_vectors,
            backend: self.backend_name(),
            db_path: self.db_path.clone(),
        })
    }

    /// Copy the database to `dest` (or a timestamped sibling) through the
    /// online backup API, so a WAL checkpoint is not required first.
    pub fn backup(&self, dest: Option<&Path>) -> Result<PathBuf> {
        let dest = match dest {
            Some(path) => path.to_path_buf(),
            None => {
                let stamp = jiff::Timestamp::now().strftime("%Y%m%d-%H%M%S");
                let mut name = self.db_path.as_os_str().to_owned();
                name.push(format!(".backup-{stamp}"));
                PathBuf::from(name)
            }
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = self.conn.lock();
        let mut dst = Connection::open(&dest)?;
        let backup = rusqlite::backup::Backup::new(&conn, &mut dst)?;
        backup.run_to_completion(128, std::time::Duration::from_millis(5), None)?;
        info!(dest = %dest.display(), "Backup created");
        Ok(dest)
    }

    /// Dump every record (without vectors) to a JSON file.
    pub fn export_json(&self, dest: Option<&Path>) -> Result<PathBuf> {
        let dest = match dest {
            Some(path) => path.to_path_buf(),
            None => {
                let stamp = jiff::Timestamp::now().strftime("%Y%m%d-%H%M%S");
                let mut name = self.db_path.as_os_str().to_owned();
                name.push(format!(".export-{stamp}.json"));
                PathBuf::from(name)
            }
        };
        let records = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT id, text, timestamp, source, session_id, importance, tags, collection
                 FROM memories ORDER BY timestamp ASC",
            )?;
            stmt.query_map([], record_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        let file = std::fs::File::create(&dest)?;
        serde_json::to_writer_pretty(file, &records)
            .map_err(|e| EngramError::Storage(format!("export failed: {e}")))?;
        info!(dest = %dest.display(), count = records.len(), "Exported records");
        Ok(dest)
    }

    /// Records eligible for compaction: older than the cutoff, at or below
    /// the importance ceiling, and not already summaries or protected.
    pub fn compaction_candidates(
        &self,
        cutoff_timestamp: i64,
        max_importance: f64,
    ) -> Result<Vec<Record>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, text, timestamp, source, session_id, importance, tags, collection
             FROM memories
             WHERE timestamp < ?1
               AND importance <= ?2
               AND (tags IS NULL OR tags NOT LIKE '%compacted%')
               AND (tags IS NULL OR tags NOT LIKE '%summary%')
               AND (tags IS NULL OR tags NOT LIKE '%protected%')
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt
            .query_map(params![cutoff_timestamp, max_importance], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Replace a group of records with a summary record in one transaction.
    pub fn swap_for_summary(
        &self,
        summary: &Record,
        summary_embedding: &[f32],
        member_ids: &[String],
    ) -> Result<()> {
        if summary_embedding.len() != self.dim {
            return Err(EngramError::Embedding(format!(
                "vector dimension {} does not match database dimension {}",
                summary_embedding.len(),
                self.dim
            )));
        }
        let blob: &[u8] = bytemuck::cast_slice(summary_embedding);

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO memories
                 (id, text, timestamp, source, session_id, importance, tags, collection, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                summary.id,
                summary.text,
                summary.timestamp,
                summary.source,
                summary.session_id,
                summary.importance,
                summary.tags.join(","),
                summary.collection,
                blob,
            ],
        )?;
        if self.fts_available {
            tx.execute(
                "INSERT INTO memories_fts (rowid, text) VALUES (last_insert_rowid(), ?1)",
                params![summary.text],
            )?;
        }
        if matches!(self.backend, VectorBackend::Integrated) {
            tx.execute(
                "INSERT INTO memories_vec (id, embedding) VALUES (?1, ?2)",
                params![summary.id, blob],
            )?;
        }
        for id in member_ids {
            tx.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
            if matches!(self.backend, VectorBackend::Integrated) {
                tx.execute("DELETE FROM memories_vec WHERE id = ?1", params![id])?;
            }
        }
        tx.commit()?;
        drop(conn);

        if let VectorBackend::Matrix(index) = &self.backend {
            let mut index = index.write();
            index.add(&summary.id, summary_embedding)?;
            for id in member_ids {
                index.remove(id);
            }
        }
        Ok(())
    }

    /// Age-bucketed counts with mean importance, for the compaction report.
    pub fn age_distribution(&self, now: i64) -> Result<HashMap<String, (i64, f64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT CASE
                 WHEN timestamp > ?1 THEN 'last_7d'
                 WHEN timestamp > ?2 THEN 'last_30d'
                 WHEN timestamp > ?3 THEN 'last_90d'
                 ELSE 'older'
             END AS age_bucket,
             COUNT(*), AVG(importance)
             FROM memories GROUP BY age_bucket",
        )?;
        let rows = stmt
            .query_map(
                params![now - 7 * 86_400, now - 30 * 86_400, now - 90 * 86_400],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        (row.get::<_, i64>(1)?, row.get::<_, Option<f64>>(2)?.unwrap_or(0.0)),
                    ))
                },
            )?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(rows)
    }

    /// Total record count and distinct source count.
    pub fn totals(&self) -> Result<(i64, i64)> {
        let conn = self.conn.lock();
        let totals = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT source) FROM memories",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(totals)
    }
}

/// Integrated KNN against the `vec0` table, post-filtered by the predicate
/// through the join. Distance is cosine, so `sim = 1 - distance`.
fn knn_integrated(
    conn: &Connection,
    query: &[f32],
    k: usize,
    predicate: &Predicate,
) -> Result<Vec<(String, f64)>> {
    let mut values = vec![
        SqlValue::Blob(bytemuck::cast_slice(query).to_vec()),
        SqlValue::Int(k as i64),
    ];
    values.extend(predicate.values.iter().cloned());

    let mut stmt = conn.prepare(&format!(
        "SELECT v.id, v.distance
         FROM memories_vec v
         JOIN memories m ON m.id = v.id
         WHERE v.embedding MATCH ? AND k = ? AND {}
         ORDER BY v.distance",
        predicate.clause
    ))?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows
        .into_iter()
        .map(|(id, distance)| (id, 1.0 - distance))
        .collect())
}

/// Run `f` with a progress handler that interrupts the connection once the
/// deadline passes; an error surfacing after expiry becomes `QueryTimeout`.
fn with_deadline<T>(
    conn: &Connection,
    deadline: Option<&Deadline>,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let Some(deadline) = deadline else {
        return f();
    };
    deadline.check()?;
    let at = deadline.at;
    conn.progress_handler(1_000, Some(move || Instant::now() >= at));
    let result = f();
    conn.progress_handler(0, None::<fn() -> bool>);
    match result {
        Err(_) if deadline.expired() => Err(EngramError::QueryTimeout {
            timeout_ms: deadline.timeout_ms,
        }),
        other => other,
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let tags: Option<String> = row.get(6)?;
    Ok(Record {
        id: row.get(0)?,
        text: row.get(1)?,
        timestamp: row.get(2)?,
        source: row.get(3)?,
        session_id: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        importance: row.get::<_, Option<f64>>(5)?.unwrap_or(0.5),
        tags: split_tags(tags.as_deref()),
        collection: row
            .get::<_, Option<String>>(7)?
            .unwrap_or_else(|| "knowledge".to_string()),
        embedding: None,
    })
}

/// Split the comma-joined tag column, dropping empty segments.
pub fn split_tags(column: Option<&str>) -> Vec<String> {
    column
        .unwrap_or("")
        .split(',')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
