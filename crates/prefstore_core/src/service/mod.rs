//! Controller-level use cases built on the repository contract.
//!
//! # Responsibility
//! - Turn UI-style commands into repository calls.
//! - Hold transient controller state (the staged value).
//! - Keep callers decoupled from storage and threading details.

pub mod preferences_service;
