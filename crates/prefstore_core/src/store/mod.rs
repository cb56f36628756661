//! Durable record store contracts and implementations.
//!
//! # Responsibility
//! - Define the minimal storage surface the repository needs: keyed read,
//!   upsert, and explicit atomic units.
//! - Keep SQL and in-memory details behind one object-safe trait.
//!
//! # Invariants
//! - A store handle has at most one open unit; nested `begin_unit` fails fast
//!   with `DbError::UnitAlreadyOpen` instead of blocking.
//! - Reads outside a unit observe committed data only.
//! - `upsert` never produces two rows for the same key.

use crate::db::{DbError, DbResult};
use crate::model::preferences::PreferencesValue;

mod memory;
mod sqlite;

pub use memory::{MemoryBackend, MemoryRecordStore};
pub use sqlite::{SqliteBackend, SqliteRecordStore};

/// Fixed primary key of the single preferences row.
pub const PREFERENCES_KEY: i64 = 1;

/// Raw persisted row shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: i64,
    pub counter: i64,
}

impl StoredRecord {
    pub fn from_value(id: i64, value: &PreferencesValue) -> Self {
        Self {
            id,
            counter: i64::from(value.counter),
        }
    }

    /// Converts the raw row into a domain snapshot.
    ///
    /// # Errors
    /// - Returns `DbError::InvalidData` when `counter` does not fit the domain
    ///   range. Invalid rows are reported, never clamped.
    pub fn to_value(&self) -> DbResult<PreferencesValue> {
        let counter = u32::try_from(self.counter).map_err(|_| {
            DbError::InvalidData(format!(
                "invalid counter value `{}` in preferences.counter for id {}",
                self.counter, self.id
            ))
        })?;
        Ok(PreferencesValue::new(counter))
    }
}

/// Handle to a durable record store.
///
/// Handles are owned by exactly one thread at a time; the repository keeps
/// one handle for the writer and one per reader slot.
pub trait RecordStore: Send {
    fn read(&self, id: i64) -> DbResult<Option<StoredRecord>>;
    fn upsert(&mut self, record: &StoredRecord) -> DbResult<()>;
    fn begin_unit(&mut self) -> DbResult<()>;
    fn commit_unit(&mut self) -> DbResult<()>;
    fn rollback_unit(&mut self) -> DbResult<()>;
    fn in_unit(&self) -> bool;
}

/// Factory for store handles sharing the same underlying data.
pub trait StoreBackend: Send + Sync {
    /// Short label used in log lines (`sqlite`, `memory`, ...).
    fn kind(&self) -> &'static str;

    /// Opens a new handle, creating the schema/storage when absent.
    fn open_or_create(&self) -> DbResult<Box<dyn RecordStore>>;
}

/// Reads the preferences row through `store`, mapping a missing row to the
/// default snapshot.
pub fn read_preferences(store: &dyn RecordStore, id: i64) -> DbResult<PreferencesValue> {
    match store.read(id)? {
        Some(record) => record.to_value(),
        None => Ok(PreferencesValue::DEFAULT),
    }
}
