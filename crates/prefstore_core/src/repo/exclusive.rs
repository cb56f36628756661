//! Exclusive-mode repository: one writer thread, pooled readers, one feed.
//!
//! # Responsibility
//! - Open the writer and reader handles and seed the change feed.
//! - Queue every write as a unit job and await its result.
//! - Serve reads from the pool and feed their results to subscribers.
//!
//! # Invariants
//! - Handles are cheap clones of one shared state; the writer thread stops
//!   when the last handle is dropped, which also ends open streams.
//! - The writer publishes a committed value before replying, so a caller
//!   that awaited a write observes it in any later `load()`.

use super::reader::ReadPool;
use super::writer::{spawn_writer, unit_open_on_current_thread, JobSender, UnitJob, Writer};
use super::{PreferencesOps, PreferencesRepository, PreferencesStream, RepoError, RepoResult};
use crate::config::StoreConfig;
use crate::db::DbError;
use crate::feed::{ChangeFeed, FeedError};
use crate::model::preferences::PreferencesValue;
use crate::store::{read_preferences, MemoryBackend, SqliteBackend, StoreBackend, PREFERENCES_KEY};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use log::{error, info, warn};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task;

/// `PreferencesRepository` serializing all writes through one thread.
#[derive(Clone)]
pub struct ExclusiveRepository {
    shared: Arc<Shared>,
}

struct Shared {
    jobs: JobSender,
    feed: Arc<ChangeFeed>,
    readers: ReadPool,
    backend_kind: &'static str,
}

impl ExclusiveRepository {
    /// Opens the backend selected by `config`.
    ///
    /// `database_path = None` opens a fresh in-memory store.
    pub async fn open(config: &StoreConfig) -> RepoResult<Self> {
        let backend: Arc<dyn StoreBackend> = match &config.database_path {
            Some(path) => Arc::new(SqliteBackend::new(path.clone(), config.busy_timeout())),
            None => Arc::new(MemoryBackend::new()),
        };
        Self::open_with_backend(backend, config.read_pool_size).await
    }

    /// Opens a repository over any backend.
    ///
    /// Store handles are opened on the blocking pool; the caller's task is
    /// only suspended.
    pub async fn open_with_backend(
        backend: Arc<dyn StoreBackend>,
        read_pool_size: usize,
    ) -> RepoResult<Self> {
        task::spawn_blocking(move || open_blocking(backend.as_ref(), read_pool_size))
            .await
            .map_err(|err| {
                RepoError::StoreUnavailable(DbError::Unavailable(format!(
                    "open task failed: {err}"
                )))
            })?
    }

    /// Last value known to the change feed, without touching the store.
    pub fn latest(&self) -> PreferencesValue {
        self.shared.feed.latest()
    }

    pub fn backend_kind(&self) -> &'static str {
        self.shared.backend_kind
    }

    async fn submit<T, F>(&self, label: &'static str, body: F) -> RepoResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn PreferencesOps) -> RepoResult<T> + Send + 'static,
    {
        ensure_outside_unit(label)?;
        let (reply, response) = oneshot::channel();
        self.shared
            .jobs
            .send(Box::new(UnitJob::new(label, body, reply)))
            .map_err(|_| RepoError::WriterStopped)?;
        response.await.map_err(|_| RepoError::WriterStopped)?
    }
}

impl Shared {
    /// Reads through the pool and forwards the outcome to the feed.
    async fn refresh(&self) -> RepoResult<PreferencesValue> {
        let generation = self.feed.generation();
        match self.readers.read().await {
            Ok(value) => {
                self.feed.publish_observed(generation, value);
                Ok(value)
            }
            Err(err) => {
                self.feed.publish_error(FeedError::new(err.to_string()));
                Err(err)
            }
        }
    }
}

fn ensure_outside_unit(label: &'static str) -> RepoResult<()> {
    if unit_open_on_current_thread() {
        warn!(
            "event=unit_submit module=repo status=rejected op={label} error_code=nested_transaction"
        );
        return Err(RepoError::NestedTransaction);
    }
    Ok(())
}

fn open_blocking(backend: &dyn StoreBackend, read_pool_size: usize) -> RepoResult<ExclusiveRepository> {
    let started_at = Instant::now();
    let backend_kind = backend.kind();
    info!(
        "event=repo_open module=repo status=start backend={} read_pool_size={}",
        backend_kind, read_pool_size
    );

    let result = build_repository(backend, read_pool_size);
    match &result {
        Ok(repo) => info!(
            "event=repo_open module=repo status=ok backend={} duration_ms={} counter={}",
            backend_kind,
            started_at.elapsed().as_millis(),
            repo.latest().counter
        ),
        Err(err) => error!(
            "event=repo_open module=repo status=error backend={} duration_ms={} error_code={} error={}",
            backend_kind,
            started_at.elapsed().as_millis(),
            err.code(),
            err
        ),
    }
    result
}

fn build_repository(
    backend: &dyn StoreBackend,
    read_pool_size: usize,
) -> RepoResult<ExclusiveRepository> {
    let writer_store = backend.open_or_create()?;
    let initial = read_preferences(writer_store.as_ref(), PREFERENCES_KEY)?;

    let reader_count = read_pool_size.max(1);
    let mut readers = Vec::with_capacity(reader_count);
    for _ in 0..reader_count {
        readers.push(backend.open_or_create()?);
    }

    let feed = Arc::new(ChangeFeed::new(initial));
    let (jobs, receiver) = mpsc::unbounded_channel();
    spawn_writer(
        Writer::new(writer_store, Arc::clone(&feed), PREFERENCES_KEY),
        receiver,
    )?;

    Ok(ExclusiveRepository {
        shared: Arc::new(Shared {
            jobs,
            feed,
            readers: ReadPool::new(readers, PREFERENCES_KEY),
            backend_kind: backend.kind(),
        }),
    })
}

#[async_trait]
impl PreferencesRepository for ExclusiveRepository {
    fn load(&self) -> PreferencesStream {
        let subscription = self.shared.feed.subscribe();
        let refresh: Option<Weak<Shared>> = Some(Arc::downgrade(&self.shared));

        stream::unfold(
            (subscription, refresh),
            |(mut subscription, refresh)| async move {
                if let Some(shared) = refresh.and_then(|weak| weak.upgrade()) {
                    if let Err(err) = shared.refresh().await {
                        warn!(
                            "event=repo_load module=repo status=error error_code={} error={}",
                            err.code(),
                            err
                        );
                    }
                }
                let item = subscription.next().await?;
                Some((item, (subscription, None)))
            },
        )
        .boxed()
    }

    async fn load_once(&self) -> RepoResult<PreferencesValue> {
        ensure_outside_unit("load_once")?;
        self.shared.refresh().await
    }

    async fn save(&self, value: PreferencesValue) -> RepoResult<()> {
        self.submit("save", move |ops| ops.save(value)).await
    }

    async fn clear(&self) -> RepoResult<()> {
        self.submit("clear", |ops| ops.clear()).await
    }

    async fn transaction<T, F>(&self, body: F) -> RepoResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn PreferencesOps) -> RepoResult<T> + Send + 'static,
    {
        self.submit("transaction", body).await
    }
}
