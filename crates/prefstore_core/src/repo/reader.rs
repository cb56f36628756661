//! Round-robin pool of reader handles served on the blocking thread pool.

use super::{RepoError, RepoResult};
use crate::db::DbError;
use crate::model::preferences::PreferencesValue;
use crate::store::{read_preferences, RecordStore};
use log::{debug, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task;

pub(super) struct ReadPool {
    slots: Arc<Vec<Mutex<Box<dyn RecordStore>>>>,
    cursor: AtomicUsize,
    key: i64,
}

impl ReadPool {
    /// `stores` must not be empty.
    pub(super) fn new(stores: Vec<Box<dyn RecordStore>>, key: i64) -> Self {
        debug_assert!(!stores.is_empty(), "read pool needs at least one handle");
        Self {
            slots: Arc::new(stores.into_iter().map(Mutex::new).collect()),
            cursor: AtomicUsize::new(0),
            key,
        }
    }

    pub(super) async fn read(&self) -> RepoResult<PreferencesValue> {
        let slots = Arc::clone(&self.slots);
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % slots.len();
        let key = self.key;
        let started_at = Instant::now();

        let joined = task::spawn_blocking(move || {
            let slot = slots[index]
                .lock()
                .map_err(|_| DbError::Unavailable("read connection mutex poisoned".to_string()))?;
            read_preferences(&**slot, key)
        })
        .await;

        let result = match joined {
            Ok(result) => result,
            Err(err) => Err(DbError::Unavailable(format!("read task failed: {err}"))),
        };
        match result {
            Ok(value) => {
                debug!(
                    "event=repo_read module=repo status=ok slot={} duration_ms={}",
                    index,
                    started_at.elapsed().as_millis()
                );
                Ok(value)
            }
            Err(err) => {
                warn!(
                    "event=repo_read module=repo status=error slot={} duration_ms={} error_code=read_failed error={}",
                    index,
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(RepoError::StoreUnavailable(err))
            }
        }
    }
}
