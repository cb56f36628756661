//! Repository layer contracts and the exclusive single-writer implementation.
//!
//! # Responsibility
//! - Define the caller-facing `PreferencesRepository` contract and the
//!   restricted `PreferencesOps` capability handed to transaction bodies.
//! - Map store, body, and panic failures into `RepoError` at one boundary.
//!
//! # Invariants
//! - All writes execute on one dedicated writer thread, in submission order.
//! - A transaction body cannot open a second unit: the capability has no
//!   `transaction`, and repository calls made while a unit is open on the
//!   current thread fail with `RepoError::NestedTransaction`.
//! - A failed, panicking, or abandoned unit is rolled back before the
//!   result is reported.

use crate::db::DbError;
use crate::feed::FeedResult;
use crate::model::preferences::{PreferencesValue, ValueError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::error::Error;
use std::fmt::{Display, Formatter};

mod exclusive;
mod reader;
mod writer;

pub use exclusive::ExclusiveRepository;

pub type RepoResult<T> = Result<T, RepoError>;

/// Change stream returned by `PreferencesRepository::load`.
pub type PreferencesStream = BoxStream<'static, FeedResult<PreferencesValue>>;

/// Failure reported at the repository boundary.
#[derive(Debug)]
pub enum RepoError {
    /// The store could not be opened, read, written, or committed.
    StoreUnavailable(DbError),
    /// A repository call was issued from inside a running transaction body.
    NestedTransaction,
    /// The transaction body returned an error or panicked.
    BodyFailed(Box<dyn Error + Send + Sync>),
    Value(ValueError),
    /// The caller stopped waiting; the unit was rolled back.
    Cancelled,
    /// The writer thread is gone; no further writes can be served.
    WriterStopped,
}

impl RepoError {
    /// Wraps a caller-defined failure raised inside a transaction body.
    pub fn body_failed(cause: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self::BodyFailed(cause.into())
    }

    /// Stable code used in log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::NestedTransaction => "nested_transaction",
            Self::BodyFailed(_) => "body_failed",
            Self::Value(_) => "invalid_value",
            Self::Cancelled => "cancelled",
            Self::WriterStopped => "writer_stopped",
        }
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StoreUnavailable(err) => write!(f, "store unavailable: {err}"),
            Self::NestedTransaction => write!(f, "nested transaction unsupported"),
            Self::BodyFailed(err) => write!(f, "transaction body failed: {err}"),
            Self::Value(err) => write!(f, "{err}"),
            Self::Cancelled => write!(f, "transaction cancelled by caller"),
            Self::WriterStopped => write!(f, "preferences writer has stopped"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::StoreUnavailable(err) => Some(err),
            Self::BodyFailed(err) => Some(err.as_ref()),
            Self::Value(err) => Some(err),
            Self::NestedTransaction | Self::Cancelled | Self::WriterStopped => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::StoreUnavailable(value)
    }
}

impl From<ValueError> for RepoError {
    fn from(value: ValueError) -> Self {
        Self::Value(value)
    }
}

/// Basic operations available inside a transaction body.
///
/// Calls run synchronously on the writer thread against the open unit, so
/// `load` observes the body's own uncommitted writes.
pub trait PreferencesOps {
    fn load(&mut self) -> RepoResult<PreferencesValue>;
    fn save(&mut self, value: PreferencesValue) -> RepoResult<()>;
    fn clear(&mut self) -> RepoResult<()>;

    /// Returns `Err(RepoError::Cancelled)` once the caller has stopped
    /// waiting. Long-running bodies should call this between steps.
    fn ensure_active(&self) -> RepoResult<()>;
}

/// Caller-facing preferences repository.
#[async_trait]
pub trait PreferencesRepository: Send + Sync {
    /// Returns a stream starting with the current persisted value, followed
    /// by every distinct committed change. Read failures are `Err` items and
    /// do not end the stream.
    fn load(&self) -> PreferencesStream;

    /// Reads the latest committed value once.
    async fn load_once(&self) -> RepoResult<PreferencesValue>;

    /// Atomically upserts the stored record.
    async fn save(&self, value: PreferencesValue) -> RepoResult<()>;

    /// Atomically resets the stored record to `PreferencesValue::DEFAULT`.
    async fn clear(&self) -> RepoResult<()>;

    /// Runs `body` inside one atomic unit and returns its output.
    ///
    /// The unit commits only when `body` returns `Ok` and the caller is
    /// still waiting; otherwise it is rolled back and the stored record is
    /// left exactly as before.
    async fn transaction<T, F>(&self, body: F) -> RepoResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn PreferencesOps) -> RepoResult<T> + Send + 'static;
}
