//! Process-local record store with the same unit semantics as SQLite.
//!
//! # Responsibility
//! - Back repositories that do not need durability (CLI without `--db`,
//!   tests).
//!
//! # Invariants
//! - All handles from one `MemoryBackend` share committed state.
//! - Unit writes stay private to the handle until `commit_unit`.

use super::{RecordStore, StoreBackend, StoredRecord};
use crate::db::{DbError, DbResult};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

type Rows = BTreeMap<i64, StoredRecord>;

/// In-memory backend; cloning shares the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    committed: Arc<Mutex<Rows>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a concrete handle, for callers that need the unboxed type.
    pub fn open_handle(&self) -> MemoryRecordStore {
        MemoryRecordStore {
            committed: Arc::clone(&self.committed),
            pending: None,
        }
    }
}

impl StoreBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn open_or_create(&self) -> DbResult<Box<dyn RecordStore>> {
        Ok(Box::new(self.open_handle()))
    }
}

/// Handle over shared in-memory rows.
#[derive(Debug)]
pub struct MemoryRecordStore {
    committed: Arc<Mutex<Rows>>,
    pending: Option<Rows>,
}

impl MemoryRecordStore {
    fn lock_committed(&self) -> DbResult<MutexGuard<'_, Rows>> {
        self.committed
            .lock()
            .map_err(|_| DbError::Unavailable("memory store mutex poisoned".to_string()))
    }
}

impl RecordStore for MemoryRecordStore {
    fn read(&self, id: i64) -> DbResult<Option<StoredRecord>> {
        if let Some(pending) = &self.pending {
            return Ok(pending.get(&id).copied());
        }
        Ok(self.lock_committed()?.get(&id).copied())
    }

    fn upsert(&mut self, record: &StoredRecord) -> DbResult<()> {
        if record.counter < 0 {
            return Err(DbError::InvalidData(format!(
                "counter must be non-negative, got {}",
                record.counter
            )));
        }
        match self.pending.as_mut() {
            Some(pending) => {
                pending.insert(record.id, *record);
            }
            None => {
                self.lock_committed()?.insert(record.id, *record);
            }
        }
        Ok(())
    }

    fn begin_unit(&mut self) -> DbResult<()> {
        if self.pending.is_some() {
            return Err(DbError::UnitAlreadyOpen);
        }
        let snapshot = self.lock_committed()?.clone();
        self.pending = Some(snapshot);
        Ok(())
    }

    fn commit_unit(&mut self) -> DbResult<()> {
        let Some(pending) = self.pending.take() else {
            return Err(DbError::NoOpenUnit);
        };
        match self.committed.lock() {
            Ok(mut committed) => {
                *committed = pending;
                Ok(())
            }
            Err(_) => {
                self.pending = Some(pending);
                Err(DbError::Unavailable(
                    "memory store mutex poisoned".to_string(),
                ))
            }
        }
    }

    fn rollback_unit(&mut self) -> DbResult<()> {
        match self.pending.take() {
            Some(_) => Ok(()),
            None => Err(DbError::NoOpenUnit),
        }
    }

    fn in_unit(&self) -> bool {
        self.pending.is_some()
    }
}
