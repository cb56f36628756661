//! SQLite-backed record store.
//!
//! # Responsibility
//! - Map `RecordStore` calls to statements on the `preferences` table.
//! - Drive atomic units with explicit `BEGIN IMMEDIATE`/`COMMIT`/`ROLLBACK`.
//!
//! # Invariants
//! - `unit_open` mirrors whether this connection holds an open transaction.
//! - Upserts use `INSERT OR REPLACE` on the primary key.

use super::{RecordStore, StoreBackend, StoredRecord};
use crate::db::{open_db, DbError, DbResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::time::Duration;

/// File-backed SQLite backend. Every handle is an independent connection.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteBackend {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
        }
    }
}

impl StoreBackend for SqliteBackend {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    fn open_or_create(&self) -> DbResult<Box<dyn RecordStore>> {
        let conn = open_db(&self.path, self.busy_timeout)?;
        Ok(Box::new(SqliteRecordStore::new(conn)))
    }
}

/// `RecordStore` over one migrated SQLite connection.
pub struct SqliteRecordStore {
    conn: Connection,
    unit_open: bool,
}

impl SqliteRecordStore {
    /// Wraps a connection returned by `open_db`/`open_db_in_memory`.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            unit_open: false,
        }
    }
}

impl RecordStore for SqliteRecordStore {
    fn read(&self, id: i64) -> DbResult<Option<StoredRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, counter FROM preferences WHERE id = ?1;",
                [id],
                |row| {
                    Ok(StoredRecord {
                        id: row.get("id")?,
                        counter: row.get("counter")?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn upsert(&mut self, record: &StoredRecord) -> DbResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO preferences (id, counter) VALUES (?1, ?2);",
            params![record.id, record.counter],
        )?;
        Ok(())
    }

    fn begin_unit(&mut self) -> DbResult<()> {
        if self.unit_open {
            return Err(DbError::UnitAlreadyOpen);
        }
        self.conn.execute_batch("BEGIN IMMEDIATE;")?;
        self.unit_open = true;
        Ok(())
    }

    fn commit_unit(&mut self) -> DbResult<()> {
        if !self.unit_open {
            return Err(DbError::NoOpenUnit);
        }
        // A failed COMMIT (e.g. SQLITE_BUSY) keeps the transaction open, so the
        // caller still owes a rollback.
        self.conn.execute_batch("COMMIT;")?;
        self.unit_open = false;
        Ok(())
    }

    fn rollback_unit(&mut self) -> DbResult<()> {
        if !self.unit_open {
            return Err(DbError::NoOpenUnit);
        }
        if self.conn.is_autocommit() {
            // SQLite already rolled the transaction back on its own.
            self.unit_open = false;
            return Ok(());
        }
        let result = self.conn.execute_batch("ROLLBACK;");
        self.unit_open = !self.conn.is_autocommit();
        result.map_err(DbError::from)
    }

    fn in_unit(&self) -> bool {
        self.unit_open
    }
}
