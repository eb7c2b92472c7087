//! SQLite-backed stores
//!
//! The global store file is shipped verbatim to the remote alongside the
//! blobs, so it runs with a rollback journal: a committed transaction is
//! fully contained in the main database file. The local store never leaves
//! the working copy and uses WAL.

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

use crate::error::{AvcError, Result};
use crate::object::{ChangeType, Commit, CommitChange, CommitId, StagedChange};
use crate::store::{GlobalStore, LocalStore, HEAD_REF, MAIN_REF};

const GLOBAL_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS commits (
        id VARCHAR PRIMARY KEY NOT NULL,
        parent_id VARCHAR
    );
    CREATE INDEX IF NOT EXISTS commits_parent_idx ON commits (parent_id);
    CREATE TABLE IF NOT EXISTS commit_changes (
        commit_id VARCHAR NOT NULL,
        batch_id INTEGER NOT NULL,
        path VARCHAR NOT NULL,
        type VARCHAR NOT NULL,
        start_offset INTEGER NOT NULL,
        num_bytes INTEGER NOT NULL,
        blob_name VARCHAR NOT NULL,
        blob_offset INTEGER NOT NULL,
        FOREIGN KEY (commit_id) REFERENCES commits (id),
        PRIMARY KEY (commit_id, batch_id, path)
    );
    CREATE TABLE IF NOT EXISTS remote_refs (
        name VARCHAR PRIMARY KEY NOT NULL,
        commit_id VARCHAR
    );
";

const LOCAL_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS staged_changes (
        path VARCHAR PRIMARY KEY NOT NULL,
        type VARCHAR NOT NULL,
        start_offset INTEGER NOT NULL,
        num_bytes INTEGER NOT NULL,
        backing_path VARCHAR NOT NULL,
        backing_offset INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS local_refs (
        name VARCHAR PRIMARY KEY NOT NULL,
        commit_id VARCHAR
    );
";

fn parse_type(idx: usize, s: String) -> rusqlite::Result<ChangeType> {
    s.parse::<ChangeType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_change(row: &Row<'_>) -> rusqlite::Result<CommitChange> {
    let commit_id: String = row.get(0)?;
    let batch_id: i64 = row.get(1)?;
    let start_offset: i64 = row.get(4)?;
    let num_bytes: i64 = row.get(5)?;
    let blob_offset: i64 = row.get(7)?;
    Ok(CommitChange {
        commit_id: CommitId::new(commit_id),
        batch_id: batch_id as u64,
        path: row.get(2)?,
        change_type: parse_type(3, row.get(3)?)?,
        start_offset: start_offset as u64,
        num_bytes: num_bytes as u64,
        blob_name: row.get(6)?,
        blob_offset: blob_offset as u64,
    })
}

fn row_to_staged(row: &Row<'_>) -> rusqlite::Result<StagedChange> {
    let start_offset: i64 = row.get(2)?;
    let num_bytes: i64 = row.get(3)?;
    let backing_offset: i64 = row.get(5)?;
    Ok(StagedChange {
        path: row.get(0)?,
        change_type: parse_type(1, row.get(1)?)?,
        start_offset: start_offset as u64,
        num_bytes: num_bytes as u64,
        backing_path: row.get(4)?,
        backing_offset: backing_offset as u64,
    })
}

const CHANGE_COLUMNS: &str =
    "commit_id, batch_id, path, type, start_offset, num_bytes, blob_name, blob_offset";

const STAGED_COLUMNS: &str = "path, type, start_offset, num_bytes, backing_path, backing_offset";

/// Shared store: `commits`, `commit_changes`, `remote_refs`
pub struct SqliteGlobalStore {
    conn: Connection,
}

impl SqliteGlobalStore {
    /// Open (creating if needed) the global store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "DELETE")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(GLOBAL_SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO remote_refs (name, commit_id) VALUES (?1, NULL)",
            params![MAIN_REF],
        )?;
        Ok(Self { conn })
    }
}

impl GlobalStore for SqliteGlobalStore {
    fn main_ref(&self) -> Result<Option<CommitId>> {
        let id: Option<String> = self.conn.query_row(
            "SELECT commit_id FROM remote_refs WHERE name = ?1",
            params![MAIN_REF],
            |r| r.get(0),
        )?;
        Ok(id.map(CommitId::new))
    }

    fn commit(&self, id: &CommitId) -> Result<Option<Commit>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, parent_id FROM commits WHERE id = ?1",
                params![id.as_str()],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(id, parent)| Commit::new(CommitId::new(id), parent.map(CommitId::new))))
    }

    fn latest_change(&self, commit: &CommitId, path: &str) -> Result<Option<CommitChange>> {
        let sql = format!(
            "SELECT {} FROM commit_changes WHERE commit_id = ?1 AND path = ?2 \
             ORDER BY batch_id DESC LIMIT 1",
            CHANGE_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![commit.as_str(), path], row_to_change)
            .optional()?)
    }

    fn changes(&self, commit: &CommitId) -> Result<Vec<CommitChange>> {
        let sql = format!(
            "SELECT {} FROM commit_changes WHERE commit_id = ?1 ORDER BY batch_id, path",
            CHANGE_COLUMNS
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let changes = stmt
            .query_map(params![commit.as_str()], row_to_change)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(changes)
    }

    fn record_commit(&mut self, commit: &Commit, changes: &[CommitChange]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO commits (id, parent_id) VALUES (?1, ?2)",
            params![commit.id.as_str(), commit.parent_id.as_ref().map(|p| p.as_str())],
        )?;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT INTO commit_changes ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                CHANGE_COLUMNS
            ))?;
            for c in changes {
                stmt.execute(params![
                    c.commit_id.as_str(),
                    c.batch_id as i64,
                    c.path,
                    c.change_type.as_str(),
                    c.start_offset as i64,
                    c.num_bytes as i64,
                    c.blob_name,
                    c.blob_offset as i64,
                ])?;
            }
        }
        tx.execute(
            "UPDATE remote_refs SET commit_id = ?1 WHERE name = ?2",
            params![commit.id.as_str(), MAIN_REF],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn remove_commit(&mut self, id: &CommitId, new_main: Option<&CommitId>) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE remote_refs SET commit_id = ?1 WHERE name = ?2",
            params![new_main.map(|m| m.as_str()), MAIN_REF],
        )?;
        tx.execute(
            "DELETE FROM commit_changes WHERE commit_id = ?1",
            params![id.as_str()],
        )?;
        let removed = tx.execute("DELETE FROM commits WHERE id = ?1", params![id.as_str()])?;
        if removed != 1 {
            return Err(AvcError::NotFound(id.clone()));
        }
        tx.commit()?;
        Ok(())
    }
}

/// Private store: `staged_changes`, `local_refs`
pub struct SqliteLocalStore {
    conn: Connection,
}

impl SqliteLocalStore {
    /// Open (creating if needed) the local store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(LOCAL_SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO local_refs (name, commit_id) VALUES (?1, NULL)",
            params![HEAD_REF],
        )?;
        Ok(Self { conn })
    }
}

impl LocalStore for SqliteLocalStore {
    fn head_ref(&self) -> Result<Option<CommitId>> {
        let id: Option<String> = self.conn.query_row(
            "SELECT commit_id FROM local_refs WHERE name = ?1",
            params![HEAD_REF],
            |r| r.get(0),
        )?;
        Ok(id.map(CommitId::new))
    }

    fn set_head(&mut self, head: Option<&CommitId>) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE local_refs SET commit_id = ?1 WHERE name = ?2",
            params![head.map(|h| h.as_str()), HEAD_REF],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn staged(&self, path: &str) -> Result<Option<StagedChange>> {
        let sql = format!("SELECT {} FROM staged_changes WHERE path = ?1", STAGED_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![path], row_to_staged)
            .optional()?)
    }

    fn staged_changes(&self) -> Result<Vec<StagedChange>> {
        let sql = format!("SELECT {} FROM staged_changes ORDER BY rowid", STAGED_COLUMNS);
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map([], row_to_staged)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn put_staged(&mut self, change: &StagedChange) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO staged_changes ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(path) DO UPDATE SET num_bytes = excluded.num_bytes",
                STAGED_COLUMNS
            ),
            params![
                change.path,
                change.change_type.as_str(),
                change.start_offset as i64,
                change.num_bytes as i64,
                change.backing_path,
                change.backing_offset as i64,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn clear_staged(&mut self) -> Result<()> {
        self.conn.execute("DELETE FROM staged_changes", [])?;
        Ok(())
    }

    fn complete_commit(&mut self, head: &CommitId) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE local_refs SET commit_id = ?1 WHERE name = ?2",
            params![head.as_str(), HEAD_REF],
        )?;
        tx.execute("DELETE FROM staged_changes", [])?;
        tx.commit()?;
        Ok(())
    }
}
