//! Core of the preference store.
//! This crate owns every access to the persisted preferences record.

pub mod config;
pub mod db;
pub mod feed;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod store;

pub use config::{ConfigError, StoreConfig};
pub use feed::{ChangeFeed, FeedError, FeedResult, Subscription};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::preferences::{PreferencesValue, ValueError};
pub use repo::{
    ExclusiveRepository, PreferencesOps, PreferencesRepository, PreferencesStream, RepoError,
    RepoResult,
};
pub use service::preferences_service::PreferencesService;
pub use store::{
    MemoryBackend, RecordStore, SqliteBackend, StoreBackend, StoredRecord, PREFERENCES_KEY,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
