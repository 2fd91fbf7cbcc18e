//! File-backed store: one SQLite database file per engine name, or one
//! temporary file per private core.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension};

use crate::capability::StorageStrategy;
use crate::error::Result;
use crate::storage::traits::LocalStore;

const META_TABLE: &str = "_less_shapes_meta";

pub struct FileStore {
    path: PathBuf,
    conn: Connection,
    /// Delete the database files when the store is dropped.
    temporary: bool,
}

impl FileStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = open_connection(&path)?;
        tracing::debug!(path = %path.display(), "opened file-backed store");
        Ok(Self {
            path,
            conn,
            temporary: false,
        })
    }

    /// Like `open`, but the database is removed again when the store drops.
    /// Used for cores that belong to a single client.
    pub fn open_temporary(path: impl Into<PathBuf>) -> Result<Self> {
        let mut store = Self::open(path)?;
        store.temporary = true;
        Ok(store)
    }

    /// Close the connection and delete the database with its WAL files,
    /// leaving an in-memory placeholder connection behind.
    fn close_and_remove(&mut self) -> Result<()> {
        let old = std::mem::replace(&mut self.conn, Connection::open_in_memory()?);
        if let Err((_, e)) = old.close() {
            tracing::warn!(error = %e, "closing database before removal failed");
        }
        let mut wal = self.path.clone().into_os_string();
        wal.push("-wal");
        let mut shm = self.path.clone().into_os_string();
        shm.push("-shm");
        remove_if_exists(&self.path)?;
        remove_if_exists(Path::new(&wal))?;
        remove_if_exists(Path::new(&shm))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    // journal_mode returns a row, so it cannot go through execute_batch.
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.execute_batch(&format!(
        "PRAGMA foreign_keys = ON;
         CREATE TABLE IF NOT EXISTS {META_TABLE} (key TEXT PRIMARY KEY, value TEXT NOT NULL);"
    ))?;
    Ok(conn)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl LocalStore for FileStore {
    fn strategy(&self) -> StorageStrategy {
        StorageStrategy::FileBacked
    }

    fn connection(&self) -> &Connection {
        &self.conn
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                &format!("SELECT value FROM {META_TABLE} WHERE key = ?1"),
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            &format!("INSERT OR REPLACE INTO {META_TABLE} (key, value) VALUES (?1, ?2)"),
            [key, value],
        )?;
        Ok(())
    }

    fn remove_meta(&self, key: &str) -> Result<()> {
        self.conn
            .execute(&format!("DELETE FROM {META_TABLE} WHERE key = ?1"), [key])?;
        Ok(())
    }

    fn wipe(&mut self) -> Result<()> {
        self.close_and_remove()?;
        self.conn = open_connection(&self.path)?;
        tracing::info!(path = %self.path.display(), "database wiped");
        Ok(())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if !self.temporary {
            return;
        }
        match self.close_and_remove() {
            Ok(()) => tracing::debug!(path = %self.path.display(), "removed private database"),
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "could not remove private database"),
        }
    }
}
