//! SQLite helpers shared by the content cache and the checkpoint store.

pub mod schema;

use std::path::Path;

use rusqlite::Connection;

use crate::errors::ConvertResult;

/// Open (creating if needed) a database with WAL journaling.  `durable`
/// selects `synchronous = FULL` for stores whose commits must survive a
/// power loss.
pub fn connect(path: &Path, durable: bool) -> ConvertResult<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    if durable {
        conn.execute_batch("PRAGMA synchronous = FULL;")?;
    } else {
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
    }
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

/// Result of `PRAGMA quick_check`; `true` when the database is intact.
pub fn quick_check(conn: &Connection) -> ConvertResult<bool> {
    let result: String = conn.query_row("PRAGMA quick_check;", [], |row| row.get(0))?;
    Ok(result.eq_ignore_ascii_case("ok"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_creates_parent_dirs_and_passes_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.sqlite");
        let conn = connect(&path, true).unwrap();
        assert!(path.exists());
        assert!(quick_check(&conn).unwrap());
    }
}
