//! SQLite schema DDL for the content-cache index and the checkpoint store.
//!
//! Statements use `CREATE … IF NOT EXISTS` so they are safe to replay on an
//! already-initialised database.

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::{ConvertError, ConvertResult};

/// Current schema version of both databases.
pub const SCHEMA_VERSION: i32 = 1;

pub const CACHE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS cache_entries (
        version_key TEXT PRIMARY KEY,
        digest TEXT NOT NULL,
        size INTEGER NOT NULL,
        md5 TEXT NOT NULL,
        fetched_at INTEGER NOT NULL,
        verified INTEGER NOT NULL DEFAULT 0
    );",
    "CREATE INDEX IF NOT EXISTS idx_cache_entries_digest ON cache_entries(digest);",
];

pub const CHECKPOINT_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS processed_events (
        event_id TEXT PRIMARY KEY,
        ts INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS branches (
        name TEXT PRIMARY KEY,
        parent TEXT,
        depth INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        state TEXT NOT NULL,
        materialized_at INTEGER,
        orphan INTEGER NOT NULL DEFAULT 0,
        last_version TEXT,
        last_timestamp INTEGER,
        last_revision INTEGER
    );",
    "CREATE TABLE IF NOT EXISTS branch_elements (
        branch TEXT NOT NULL,
        element TEXT NOT NULL,
        PRIMARY KEY(branch, element)
    );",
    "CREATE TABLE IF NOT EXISTS pending_links (
        event_id TEXT PRIMARY KEY,
        payload_json TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS tree_nodes (
        path TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        version TEXT
    );",
    "CREATE INDEX IF NOT EXISTS idx_processed_events_ts ON processed_events(ts);",
];

/// Tables that must be present for a checkpoint file to be readable.
pub const CHECKPOINT_TABLES: &[&str] = &[
    "meta",
    "processed_events",
    "branches",
    "branch_elements",
    "pending_links",
    "tree_nodes",
];

/// Create every table and record the schema version.  A database written by
/// a newer schema is refused.
pub fn init_schema(conn: &Connection, statements: &[&str]) -> ConvertResult<()> {
    for stmt in statements {
        conn.execute_batch(stmt)?;
    }
    match get_schema_version(conn)? {
        Some(version) if version > SCHEMA_VERSION => Err(ConvertError::Config(format!(
            "database schema version {version} is newer than supported {SCHEMA_VERSION}"
        ))),
        Some(_) => Ok(()),
        None => set_meta(conn, "schema_version", &SCHEMA_VERSION.to_string()),
    }
}

pub fn get_schema_version(conn: &Connection) -> ConvertResult<Option<i32>> {
    Ok(get_meta(conn, "schema_version")?.and_then(|v| v.parse::<i32>().ok()))
}

pub fn get_meta(conn: &Connection, key: &str) -> ConvertResult<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1;",
            params![key],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?;
    Ok(value.flatten())
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> ConvertResult<()> {
    conn.execute(
        "INSERT INTO meta(key, value) VALUES(?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        params![key, value],
    )?;
    Ok(())
}

/// Names of the user tables present in the database.
pub fn table_names(conn: &Connection) -> ConvertResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table';")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_versioned() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, CHECKPOINT_SCHEMA).unwrap();
        init_schema(&conn, CHECKPOINT_SCHEMA).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
        let tables = table_names(&conn).unwrap();
        for table in CHECKPOINT_TABLES {
            assert!(tables.iter().any(|t| t == table), "missing {table}");
        }
    }

    #[test]
    fn newer_schema_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, CACHE_SCHEMA).unwrap();
        set_meta(&conn, "schema_version", "99").unwrap();
        assert!(matches!(
            init_schema(&conn, CACHE_SCHEMA),
            Err(ConvertError::Config(_))
        ));
    }

    #[test]
    fn meta_upserts() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, CACHE_SCHEMA).unwrap();
        set_meta(&conn, "k", "1").unwrap();
        set_meta(&conn, "k", "2").unwrap();
        assert_eq!(get_meta(&conn, "k").unwrap().as_deref(), Some("2"));
        assert_eq!(get_meta(&conn, "missing").unwrap(), None);
    }
}
