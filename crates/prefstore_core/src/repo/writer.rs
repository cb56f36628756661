//! Dedicated writer thread executing atomic units in submission order.

use super::{PreferencesOps, RepoError, RepoResult};
use crate::db::{DbError, DbResult};
use crate::feed::{ChangeFeed, FeedError};
use crate::model::preferences::PreferencesValue;
use crate::store::{read_preferences, RecordStore, StoredRecord};
use log::{debug, error, info, warn};
use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

const WRITER_THREAD_NAME: &str = "prefstore-writer";

thread_local! {
    static UNIT_OPEN: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is executing a transaction body.
pub(super) fn unit_open_on_current_thread() -> bool {
    UNIT_OPEN.with(Cell::get)
}

struct UnitFlag;

impl UnitFlag {
    fn raise() -> Self {
        UNIT_OPEN.with(|open| open.set(true));
        Self
    }
}

impl Drop for UnitFlag {
    fn drop(&mut self) {
        UNIT_OPEN.with(|open| open.set(false));
    }
}

pub(super) type JobSender = mpsc::UnboundedSender<Box<dyn WriteJob>>;
type JobReceiver = mpsc::UnboundedReceiver<Box<dyn WriteJob>>;

pub(super) trait WriteJob: Send {
    fn execute(self: Box<Self>, writer: &mut Writer, unit_id: u64);
}

/// One queued unit: a body plus the channel its caller is waiting on.
pub(super) struct UnitJob<T, F> {
    label: &'static str,
    body: F,
    reply: oneshot::Sender<RepoResult<T>>,
}

impl<T, F> UnitJob<T, F> {
    pub(super) fn new(label: &'static str, body: F, reply: oneshot::Sender<RepoResult<T>>) -> Self {
        Self { label, body, reply }
    }
}

impl<T, F> WriteJob for UnitJob<T, F>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn PreferencesOps) -> RepoResult<T> + Send + 'static,
{
    fn execute(self: Box<Self>, writer: &mut Writer, unit_id: u64) {
        let UnitJob { label, body, reply } = *self;
        let outcome = writer.run_unit(unit_id, label, body, &|| reply.is_closed());
        if reply.send(outcome).is_err() {
            debug!("event=unit_reply module=repo status=dropped unit_id={unit_id} op={label}");
        }
    }
}

/// State owned by the writer thread.
pub(super) struct Writer {
    store: Box<dyn RecordStore>,
    feed: Arc<ChangeFeed>,
    key: i64,
}

impl Writer {
    pub(super) fn new(store: Box<dyn RecordStore>, feed: Arc<ChangeFeed>, key: i64) -> Self {
        Self { store, feed, key }
    }

    fn run_unit<T, F>(
        &mut self,
        unit_id: u64,
        label: &'static str,
        body: F,
        caller_gone: &dyn Fn() -> bool,
    ) -> RepoResult<T>
    where
        F: FnOnce(&mut dyn PreferencesOps) -> RepoResult<T>,
    {
        let started_at = Instant::now();
        if caller_gone() {
            info!("event=unit_skip module=repo status=cancelled unit_id={unit_id} op={label}");
            return Err(RepoError::Cancelled);
        }

        if let Err(err) = self.store.begin_unit() {
            error!(
                "event=unit_begin module=repo status=error unit_id={} op={} error_code=unit_begin_failed error={}",
                unit_id, label, err
            );
            return Err(RepoError::StoreUnavailable(err));
        }

        let outcome = {
            let _flag = UnitFlag::raise();
            let mut ops = UnitOps {
                store: self.store.as_mut(),
                key: self.key,
                caller_gone,
            };
            match panic::catch_unwind(AssertUnwindSafe(|| body(&mut ops))) {
                Ok(result) => result,
                Err(payload) => Err(RepoError::body_failed(format!(
                    "transaction body panicked: {}",
                    panic_message(payload.as_ref())
                ))),
            }
        };

        let outcome = match outcome {
            Ok(_) if caller_gone() => Err(RepoError::Cancelled),
            other => other,
        };

        match outcome {
            Ok(output) => match self.store.commit_unit() {
                Ok(()) => {
                    info!(
                        "event=unit_commit module=repo status=ok unit_id={} op={} duration_ms={}",
                        unit_id,
                        label,
                        started_at.elapsed().as_millis()
                    );
                    self.publish_committed(unit_id);
                    Ok(output)
                }
                Err(err) => {
                    error!(
                        "event=unit_commit module=repo status=error unit_id={} op={} duration_ms={} error_code=unit_commit_failed error={}",
                        unit_id,
                        label,
                        started_at.elapsed().as_millis(),
                        err
                    );
                    self.rollback(unit_id, label);
                    Err(RepoError::StoreUnavailable(err))
                }
            },
            Err(err) => {
                self.rollback(unit_id, label);
                let status = if matches!(err, RepoError::Cancelled) {
                    "cancelled"
                } else {
                    "rolled_back"
                };
                warn!(
                    "event=unit_abort module=repo status={} unit_id={} op={} duration_ms={} error_code={} error={}",
                    status,
                    unit_id,
                    label,
                    started_at.elapsed().as_millis(),
                    err.code(),
                    err
                );
                Err(err)
            }
        }
    }

    fn rollback(&mut self, unit_id: u64, label: &'static str) {
        if !self.store.in_unit() {
            return;
        }
        if let Err(err) = self.store.rollback_unit() {
            error!(
                "event=unit_rollback module=repo status=error unit_id={} op={} error_code=unit_rollback_failed error={}",
                unit_id, label, err
            );
        }
    }

    /// Re-reads the committed record and pushes it to subscribers.
    fn publish_committed(&self, unit_id: u64) {
        match read_preferences(self.store.as_ref(), self.key) {
            Ok(value) => {
                if self.feed.publish_committed(value) {
                    debug!(
                        "event=feed_publish module=repo status=ok unit_id={} counter={}",
                        unit_id, value.counter
                    );
                }
            }
            Err(err) => {
                warn!(
                    "event=feed_publish module=repo status=error unit_id={} error_code=reread_failed error={}",
                    unit_id, err
                );
                self.feed.publish_error(FeedError::new(err.to_string()));
            }
        }
    }
}

struct UnitOps<'a> {
    store: &'a mut dyn RecordStore,
    key: i64,
    caller_gone: &'a dyn Fn() -> bool,
}

impl PreferencesOps for UnitOps<'_> {
    fn load(&mut self) -> RepoResult<PreferencesValue> {
        Ok(read_preferences(&*self.store, self.key)?)
    }

    fn save(&mut self, value: PreferencesValue) -> RepoResult<()> {
        self.store
            .upsert(&StoredRecord::from_value(self.key, &value))?;
        Ok(())
    }

    fn clear(&mut self) -> RepoResult<()> {
        self.save(PreferencesValue::DEFAULT)
    }

    fn ensure_active(&self) -> RepoResult<()> {
        if (self.caller_gone)() {
            return Err(RepoError::Cancelled);
        }
        Ok(())
    }
}

/// Starts the writer thread; it exits once every `JobSender` is dropped.
pub(super) fn spawn_writer(writer: Writer, receiver: JobReceiver) -> DbResult<()> {
    thread::Builder::new()
        .name(WRITER_THREAD_NAME.to_string())
        .spawn(move || writer_loop(writer, receiver))
        .map_err(|err| DbError::Unavailable(format!("failed to spawn writer thread: {err}")))?;
    Ok(())
}

fn writer_loop(mut writer: Writer, mut receiver: JobReceiver) {
    info!("event=writer_start module=repo status=ok thread={WRITER_THREAD_NAME}");
    let mut unit_id: u64 = 0;
    while let Some(job) = receiver.blocking_recv() {
        unit_id += 1;
        job.execute(&mut writer, unit_id);
    }
    info!("event=writer_stop module=repo status=ok units={unit_id}");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
