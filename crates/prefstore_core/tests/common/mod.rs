#![allow(dead_code)]

use prefstore_core::db::{DbError, DbResult};
use prefstore_core::store::MemoryRecordStore;
use prefstore_core::{
    ExclusiveRepository, MemoryBackend, RecordStore, StoreBackend, StoreConfig, StoredRecord,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub async fn open_memory_repo() -> ExclusiveRepository {
    ExclusiveRepository::open(&StoreConfig::default())
        .await
        .unwrap()
}

pub async fn open_file_repo(dir: &Path) -> ExclusiveRepository {
    ExclusiveRepository::open(&StoreConfig::with_database(dir.join("prefs.db")))
        .await
        .unwrap()
}

/// Switches shared by every handle of a `FaultyBackend`.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    reads: Arc<AtomicBool>,
    commits: Arc<AtomicBool>,
}

impl Faults {
    pub fn fail_reads(&self, enabled: bool) {
        self.reads.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_commits(&self, enabled: bool) {
        self.commits.store(enabled, Ordering::SeqCst);
    }
}

/// Memory backend whose handles fail on demand.
pub struct FaultyBackend {
    inner: MemoryBackend,
    faults: Faults,
}

impl FaultyBackend {
    pub fn new() -> (Arc<Self>, Faults) {
        let faults = Faults::default();
        let backend = Arc::new(Self {
            inner: MemoryBackend::new(),
            faults: faults.clone(),
        });
        (backend, faults)
    }
}

impl StoreBackend for FaultyBackend {
    fn kind(&self) -> &'static str {
        "faulty"
    }

    fn open_or_create(&self) -> DbResult<Box<dyn RecordStore>> {
        Ok(Box::new(FaultyStore {
            inner: self.inner.open_handle(),
            faults: self.faults.clone(),
        }))
    }
}

struct FaultyStore {
    inner: MemoryRecordStore,
    faults: Faults,
}

impl RecordStore for FaultyStore {
    fn read(&self, id: i64) -> DbResult<Option<StoredRecord>> {
        if self.faults.reads.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("injected read failure".to_string()));
        }
        self.inner.read(id)
    }

    fn upsert(&mut self, record: &StoredRecord) -> DbResult<()> {
        self.inner.upsert(record)
    }

    fn begin_unit(&mut self) -> DbResult<()> {
        self.inner.begin_unit()
    }

    fn commit_unit(&mut self) -> DbResult<()> {
        if self.faults.commits.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("injected commit failure".to_string()));
        }
        self.inner.commit_unit()
    }

    fn rollback_unit(&mut self) -> DbResult<()> {
        self.inner.rollback_unit()
    }

    fn in_unit(&self) -> bool {
        self.inner.in_unit()
    }
}

pub async fn open_faulty_repo() -> (ExclusiveRepository, Faults) {
    let (backend, faults) = FaultyBackend::new();
    let repo = ExclusiveRepository::open_with_backend(backend, 2)
        .await
        .unwrap();
    (repo, faults)
}
