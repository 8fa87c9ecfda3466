use rusqlite::{Connection, params};
use tracing::info;

use crate::error::{EngramError, Result};

/// Forward migrations, applied in ascending order. Each runs in its own
/// transaction; the recorded version only advances on commit.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS memories (
         id TEXT PRIMARY KEY,
         text TEXT NOT NULL,
         timestamp INTEGER NOT NULL,
         source TEXT NOT NULL,
         session_id TEXT,
         importance REAL DEFAULT 0.5,
         tags TEXT,
         collection TEXT DEFAULT 'knowledge',
         embedding BLOB
     );
     CREATE INDEX IF NOT EXISTS idx_collection ON memories(collection);
     CREATE INDEX IF NOT EXISTS idx_timestamp ON memories(timestamp);",
)];

/// Ensure the `schema_version` table exists and apply every missing
/// migration.
///
/// A migration failure rolls back its transaction and aborts the open with
/// a typed error; no partial version is ever recorded. Re-running against
/// an up-to-date database is a no-op.
pub fn apply_migrations(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
             version INTEGER PRIMARY KEY,
             applied_at TIMESTAMP NOT NULL
         )",
        [],
    )?;

    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    for (version, ddl) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(ddl).map_err(|e| {
            EngramError::Storage(format!("migration {version} failed: {e}"))
        })?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )?;
        tx.commit()?;
        info!(version, "Applied schema migration");
    }

    Ok(())
}

/// Current schema version, 0 for a fresh database.
pub fn schema_version(conn: &Connection) -> Result<i64> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_create_the_memories_table() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master
                 WHERE type = 'table' AND name IN ('memories', 'schema_version')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();
        let version_once = schema_version(&conn).unwrap();
        apply_migrations(&mut conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), version_once);

        // No duplicate version rows either.
        let rows: i64 = conn
            .query_row("SELECT count(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, version_once);
    }

    #[test]
    fn version_advances_monotonically() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(schema_version(&conn).unwrap_or(0), 0);
        apply_migrations(&mut conn).unwrap();
        assert!(schema_version(&conn).unwrap() >= 1);
    }

    #[test]
    fn applied_at_is_recorded() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();
        let applied_at: String = conn
            .query_row(
                "SELECT applied_at FROM schema_version WHERE version = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(!applied_at.is_empty());
    }
}
