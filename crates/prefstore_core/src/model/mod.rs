//! Domain model for persisted preferences.
//!
//! # Responsibility
//! - Define the immutable preference snapshot shared by every layer.
//! - Keep default values in one place.
//!
//! # Invariants
//! - Snapshots are values: changes produce new instances, never mutate.
//! - A missing persisted row is equivalent to `PreferencesValue::default()`.

pub mod preferences;
