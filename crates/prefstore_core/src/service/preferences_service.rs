//! Preferences controller service.
//!
//! # Responsibility
//! - Expose get/set/reset, the two-phase stage/commit flow, and the
//!   one-phase transactional increment.
//! - Mirror the repository change stream into a `current` value channel.
//!
//! # Invariants
//! - Failures are logged and returned; the service never panics on them
//!   and the observer task keeps the last good value on stream errors.
//! - The staged value is memory-only and never persisted implicitly.

use crate::model::preferences::PreferencesValue;
use crate::repo::{PreferencesOps, PreferencesRepository, PreferencesStream, RepoError, RepoResult};
use futures::StreamExt;
use log::{error, info, warn};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Granularity of the in-transaction pause; bounds how long a cancelled
/// caller keeps the writer busy.
const PAUSE_SLICE: Duration = Duration::from_millis(25);

/// Use-case service over any `PreferencesRepository`.
pub struct PreferencesService<R: PreferencesRepository> {
    repo: R,
    current: watch::Receiver<PreferencesValue>,
    staged: watch::Sender<PreferencesValue>,
    observer: JoinHandle<()>,
}

impl<R: PreferencesRepository> Drop for PreferencesService<R> {
    fn drop(&mut self) {
        self.observer.abort();
    }
}

impl<R: PreferencesRepository> PreferencesService<R> {
    /// Creates the service and starts mirroring `repo.load()`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(repo: R) -> Self {
        let (current_tx, current) = watch::channel(PreferencesValue::DEFAULT);
        let (staged, _) = watch::channel(PreferencesValue::DEFAULT);
        let observer = tokio::spawn(observe_changes(repo.load(), current_tx));
        Self {
            repo,
            current,
            staged,
            observer,
        }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Latest committed value as seen by the change stream.
    pub fn current(&self) -> watch::Receiver<PreferencesValue> {
        self.current.clone()
    }

    /// Locally staged next value.
    pub fn staged(&self) -> watch::Receiver<PreferencesValue> {
        self.staged.subscribe()
    }

    /// Reads the committed value once.
    pub async fn get_current(&self) -> RepoResult<PreferencesValue> {
        let result = self.repo.load_once().await;
        match &result {
            Ok(value) => info!(
                "event=get_current module=service status=ok counter={}",
                value.counter
            ),
            Err(err) => log_failure("get_current", err),
        }
        result
    }

    pub async fn set_counter(&self, counter: u32) -> RepoResult<()> {
        let result = self.repo.save(PreferencesValue::new(counter)).await;
        report("set_counter", &result);
        result
    }

    /// Resets the stored record to the default value.
    pub async fn reset(&self) -> RepoResult<()> {
        let result = self.repo.clear().await;
        report("reset", &result);
        result
    }

    /// Stage step of the two-phase flow: reads, increments locally, and
    /// publishes the candidate on `staged()`. Nothing is persisted.
    pub async fn stage_increment(&self) -> RepoResult<PreferencesValue> {
        let result = self.load_incremented().await;
        match &result {
            Ok(next) => {
                self.staged.send_replace(*next);
                info!(
                    "event=stage_increment module=service status=ok staged={}",
                    next.counter
                );
            }
            Err(err) => log_failure("stage_increment", err),
        }
        result
    }

    async fn load_incremented(&self) -> RepoResult<PreferencesValue> {
        let current = self.repo.load_once().await?;
        Ok(current.incremented()?)
    }

    /// Commit step of the two-phase flow: saves the staged value as-is.
    ///
    /// Another writer may have committed in between; this flow does not
    /// detect that, unlike `increment_in_transaction`.
    pub async fn commit_staged(&self) -> RepoResult<PreferencesValue> {
        let staged = *self.staged.borrow();
        let result = self.repo.save(staged).await.map(|()| staged);
        report("commit_staged", &result);
        result
    }

    /// Reads, waits `delay`, and writes `counter + 1` inside one atomic unit.
    ///
    /// `delay` widens the window between read and write; concurrent calls
    /// still never lose an update. Dropping the returned future rolls the
    /// unit back.
    pub async fn increment_in_transaction(&self, delay: Duration) -> RepoResult<PreferencesValue> {
        let started_at = Instant::now();
        let result = self
            .repo
            .transaction(move |ops| {
                let current = ops.load()?;
                let next = current.incremented()?;
                info!(
                    "event=increment_in_transaction module=service status=staged current={} next={}",
                    current.counter, next.counter
                );
                pause(ops, delay)?;
                ops.save(next)?;
                Ok(next)
            })
            .await;
        match &result {
            Ok(next) => info!(
                "event=increment_in_transaction module=service status=ok counter={} duration_ms={}",
                next.counter,
                started_at.elapsed().as_millis()
            ),
            Err(err) => log_failure("increment_in_transaction", err),
        }
        result
    }
}

/// Sleeps for `delay` on the writer thread, giving up early once the
/// caller is gone.
fn pause(ops: &mut dyn PreferencesOps, delay: Duration) -> RepoResult<()> {
    let deadline = Instant::now() + delay;
    loop {
        ops.ensure_active()?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        thread::sleep(remaining.min(PAUSE_SLICE));
    }
}

async fn observe_changes(
    mut changes: PreferencesStream,
    current: watch::Sender<PreferencesValue>,
) {
    while let Some(item) = changes.next().await {
        match item {
            Ok(value) => {
                current.send_replace(value);
            }
            Err(err) => warn!(
                "event=observe_changes module=service status=error error_code=stream_error error={}",
                err
            ),
        }
    }
    info!("event=observe_changes module=service status=closed");
}

fn report<T>(command: &'static str, result: &RepoResult<T>) {
    match result {
        Ok(_) => info!("event={command} module=service status=ok"),
        Err(err) => log_failure(command, err),
    }
}

fn log_failure(command: &'static str, err: &RepoError) {
    error!(
        "event={} module=service status=error error_code={} error={}",
        command,
        err.code(),
        err
    );
}
