//! Durable conversion checkpoint backed by SQLite.
//!
//! Each save is one transaction, so a later `load` sees either the previous
//! or the new checkpoint, never a mix.  A missing file means "no checkpoint";
//! a file that exists but cannot be read back is `CheckpointCorruption`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use tracing::{debug, info};

use crate::errors::{ConvertError, ConvertResult};
use crate::models::{NodeKind, PendingSymlink, Timestamp};
use crate::store::{self, schema};
use crate::topology::{Branch, BranchState};
use crate::tree::{TreeChange, TreeEntry, TreeState};

/// Progress at a revision boundary.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    /// Number of the last assembled revision.
    pub last_revision: u64,
    /// Dump stream length after `last_revision`.
    pub dump_offset: u64,
    /// Start of the next unprocessed group.
    pub watermark: Option<Timestamp>,
    pub containers_created: bool,
    /// Events at or after the watermark that are already accounted for.
    pub processed: BTreeMap<String, Timestamp>,
    pub branches: Vec<Branch>,
    pub pending_links: Vec<PendingSymlink>,
}

/// A loaded checkpoint with the target tree it describes.
#[derive(Debug)]
pub struct Restored {
    pub checkpoint: Checkpoint,
    pub tree: TreeState,
}

fn corrupt(what: impl std::fmt::Display) -> ConvertError {
    ConvertError::CheckpointCorruption(what.to_string())
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

pub struct CheckpointStore {
    path: PathBuf,
    conn: Option<Connection>,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn writer(&mut self) -> ConvertResult<&mut Connection> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                let conn = store::connect(&self.path, true)?;
                schema::init_schema(&conn, schema::CHECKPOINT_SCHEMA)?;
                conn
            }
        };
        Ok(self.conn.insert(conn))
    }

    // -----------------------------------------------------------------------
    // Load
    // -----------------------------------------------------------------------

    pub fn load(&self) -> ConvertResult<Option<Restored>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|e| corrupt(format!("{}: {e}", self.path.display())))?;
        let restored = read_checkpoint(&conn).map_err(|e| match e {
            ConvertError::Sqlite(inner) => corrupt(inner),
            other => other,
        })?;
        info!(
            path = %self.path.display(),
            last_revision = restored.checkpoint.last_revision,
            tree_nodes = restored.tree.len(),
            "checkpoint loaded"
        );
        Ok(Some(restored))
    }

    // -----------------------------------------------------------------------
    // Save
    // -----------------------------------------------------------------------

    /// Persist `checkpoint` together with the tree changes and branch
    /// elements recorded since the previous save.
    pub fn save(
        &mut self,
        checkpoint: &Checkpoint,
        tree_changes: &[TreeChange],
        new_elements: &[(String, String)],
    ) -> ConvertResult<()> {
        let conn = self.writer()?;
        let tx = conn.transaction()?;

        let meta = [
            ("last_revision", checkpoint.last_revision.to_string()),
            ("dump_offset", checkpoint.dump_offset.to_string()),
            (
                "watermark",
                checkpoint
                    .watermark
                    .map(|ts| ts.unix().to_string())
                    .unwrap_or_default(),
            ),
            (
                "containers_created",
                u8::from(checkpoint.containers_created).to_string(),
            ),
            ("updated_at", now_unix().to_string()),
        ];
        for (key, value) in &meta {
            schema::set_meta(&tx, key, value)?;
        }

        tx.execute("DELETE FROM processed_events;", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO processed_events(event_id, ts) VALUES (?1, ?2);")?;
            for (id, ts) in &checkpoint.processed {
                stmt.execute(params![id, ts.unix()])?;
            }
        }

        tx.execute("DELETE FROM branches;", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO branches(name, parent, depth, created_at, state, materialized_at,
                     orphan, last_version, last_timestamp, last_revision)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
            )?;
            for b in &checkpoint.branches {
                stmt.execute(params![
                    b.name,
                    b.parent,
                    b.depth as i64,
                    b.created_at.unix(),
                    b.state.as_str(),
                    b.materialized_at.map(|r| r as i64),
                    b.orphan as i64,
                    b.last_version,
                    b.last_timestamp.map(Timestamp::unix),
                    b.last_revision.map(|r| r as i64),
                ])?;
            }
        }
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO branch_elements(branch, element) VALUES (?1, ?2);",
            )?;
            for (branch, element) in new_elements {
                stmt.execute(params![branch, element])?;
            }
        }

        tx.execute("DELETE FROM pending_links;", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO pending_links(event_id, payload_json) VALUES (?1, ?2);")?;
            for link in &checkpoint.pending_links {
                stmt.execute(params![link.event_id, serde_json::to_string(link)?])?;
            }
        }

        for change in tree_changes {
            apply_tree_change(&tx, change)?;
        }

        tx.commit()?;
        debug!(
            last_revision = checkpoint.last_revision,
            dump_offset = checkpoint.dump_offset,
            tree_changes = tree_changes.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Remove the checkpoint file and its WAL side files.
    pub fn clear(&mut self) -> ConvertResult<()> {
        self.conn = None;
        for suffix in ["", "-wal", "-shm"] {
            let mut name = self.path.clone().into_os_string();
            name.push(suffix);
            match std::fs::remove_file(PathBuf::from(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(path = %self.path.display(), "checkpoint cleared");
        Ok(())
    }
}

const SUBTREE: &str = "path = ?1 OR substr(path, 1, length(?1) + 1) = ?1 || '/'";

fn apply_tree_change(conn: &Connection, change: &TreeChange) -> ConvertResult<()> {
    match change {
        TreeChange::Put { path, entry } => {
            conn.execute(
                "INSERT OR REPLACE INTO tree_nodes(path, kind, version) VALUES (?1, ?2, ?3);",
                params![path, entry.kind.as_str(), entry.version],
            )?;
        }
        TreeChange::Remove { path } => {
            conn.execute(
                &format!("DELETE FROM tree_nodes WHERE {SUBTREE};"),
                params![path],
            )?;
        }
        TreeChange::Copy { from, to } => {
            conn.execute(
                &format!("DELETE FROM tree_nodes WHERE {SUBTREE};"),
                params![to],
            )?;
            conn.execute(
                &format!(
                    "INSERT INTO tree_nodes(path, kind, version)
                     SELECT ?2 || substr(path, length(?1) + 1), kind, version
                     FROM tree_nodes WHERE {SUBTREE};"
                ),
                params![from, to],
            )?;
        }
    }
    Ok(())
}

fn parse_meta<T: std::str::FromStr>(conn: &Connection, key: &str) -> ConvertResult<T> {
    let value = schema::get_meta(conn, key)?.ok_or_else(|| corrupt(format!("missing {key}")))?;
    value
        .parse::<T>()
        .map_err(|_| corrupt(format!("bad {key} value {value:?}")))
}

fn parse_kind(text: &str) -> ConvertResult<NodeKind> {
    match text {
        "file" => Ok(NodeKind::File),
        "dir" => Ok(NodeKind::Dir),
        other => Err(corrupt(format!("bad node kind {other:?}"))),
    }
}

fn read_checkpoint(conn: &Connection) -> ConvertResult<Restored> {
    if !store::quick_check(conn)? {
        return Err(corrupt("integrity check failed"));
    }
    let tables: BTreeSet<String> = schema::table_names(conn)?.into_iter().collect();
    if let Some(missing) = schema::CHECKPOINT_TABLES
        .iter()
        .find(|t| !tables.contains(**t))
    {
        return Err(corrupt(format!("table {missing} is missing")));
    }
    if let Some(version) = schema::get_schema_version(conn)? {
        if version > schema::SCHEMA_VERSION {
            return Err(corrupt(format!("schema version {version} is not supported")));
        }
    }

    let last_revision: u64 = parse_meta(conn, "last_revision")?;
    let dump_offset: u64 = parse_meta(conn, "dump_offset")?;
    let containers_created = parse_meta::<u8>(conn, "containers_created")? != 0;
    let watermark = match schema::get_meta(conn, "watermark")? {
        Some(text) if !text.is_empty() => Some(Timestamp::from_unix(
            text.parse::<i64>()
                .map_err(|_| corrupt(format!("bad watermark {text:?}")))?,
        )),
        _ => None,
    };

    let processed = {
        let mut stmt = conn.prepare("SELECT event_id, ts FROM processed_events;")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, Timestamp::from_unix(row.get(1)?)))
        })?;
        rows.collect::<Result<BTreeMap<_, _>, _>>()?
    };

    let mut elements: HashMap<String, BTreeSet<String>> = HashMap::new();
    {
        let mut stmt = conn.prepare("SELECT branch, element FROM branch_elements;")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (branch, element) = row?;
            elements.entry(branch).or_default().insert(element);
        }
    }

    let mut branches = Vec::new();
    {
        let mut stmt = conn.prepare(
            "SELECT name, parent, depth, created_at, state, materialized_at, orphan,
                    last_version, last_timestamp, last_revision
             FROM branches ORDER BY depth, created_at, name;",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let state_text: String = row.get(4)?;
            let state = BranchState::parse(&state_text)
                .ok_or_else(|| corrupt(format!("branch {name} has state {state_text:?}")))?;
            branches.push(Branch {
                elements: elements.remove(&name).unwrap_or_default(),
                parent: row.get(1)?,
                depth: row.get::<_, i64>(2)?.max(0) as usize,
                created_at: Timestamp::from_unix(row.get(3)?),
                state,
                materialized_at: row.get::<_, Option<i64>>(5)?.map(|r| r.max(0) as u64),
                orphan: row.get::<_, i64>(6)? != 0,
                last_version: row.get(7)?,
                last_timestamp: row.get::<_, Option<i64>>(8)?.map(Timestamp::from_unix),
                last_revision: row.get::<_, Option<i64>>(9)?.map(|r| r.max(0) as u64),
                name,
            });
        }
    }

    let pending_links = {
        let mut stmt = conn.prepare("SELECT payload_json FROM pending_links ORDER BY rowid;")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut links = Vec::new();
        for payload in rows {
            let payload = payload?;
            let link: PendingSymlink = serde_json::from_str(&payload)
                .map_err(|e| corrupt(format!("pending link payload: {e}")))?;
            links.push(link);
        }
        links
    };

    let nodes = {
        let mut stmt = conn.prepare("SELECT path, kind, version FROM tree_nodes;")?;
        let mut rows = stmt.query([])?;
        let mut nodes = Vec::new();
        while let Some(row) = rows.next()? {
            let kind: String = row.get(1)?;
            nodes.push((
                row.get::<_, String>(0)?,
                TreeEntry {
                    kind: parse_kind(&kind)?,
                    version: row.get(2)?,
                },
            ));
        }
        nodes
    };

    Ok(Restored {
        checkpoint: Checkpoint {
            last_revision,
            dump_offset,
            watermark,
            containers_created,
            processed,
            branches,
            pending_links,
        },
        tree: TreeState::from_nodes(nodes),
    })
}
