//! Preferences snapshot model.
//!
//! # Responsibility
//! - Define the value observed by readers and written by the repository.
//! - Provide pure derivation helpers (`incremented`).
//!
//! # Invariants
//! - `counter` is non-negative by construction.
//! - Equality is structural and drives change-stream deduplication.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Immutable preferences snapshot.
///
/// Fields not present in storage fall back to `Default`, so a fresh
/// database and an explicit reset are indistinguishable to readers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PreferencesValue {
    /// Monotonic demo counter; `0` when nothing has been stored yet.
    pub counter: u32,
}

impl PreferencesValue {
    /// Default snapshot used for missing rows and `clear()`.
    pub const DEFAULT: Self = Self { counter: 0 };

    pub fn new(counter: u32) -> Self {
        Self { counter }
    }

    /// Returns a new snapshot with `counter + 1`.
    ///
    /// # Errors
    /// - Returns `ValueError::CounterOverflow` when `counter == u32::MAX`.
    pub fn incremented(&self) -> Result<Self, ValueError> {
        let counter = self
            .counter
            .checked_add(1)
            .ok_or(ValueError::CounterOverflow {
                current: self.counter,
            })?;
        Ok(Self { counter })
    }

    pub fn is_default(&self) -> bool {
        *self == Self::DEFAULT
    }
}

/// Errors raised when deriving a new snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueError {
    CounterOverflow { current: u32 },
}

impl Display for ValueError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CounterOverflow { current } => {
                write!(f, "counter {current} cannot be incremented without overflow")
            }
        }
    }
}

impl Error for ValueError {}

#[cfg(test)]
mod tests {
    use super::{PreferencesValue, ValueError};

    #[test]
    fn default_counter_is_zero() {
        assert_eq!(PreferencesValue::default(), PreferencesValue::DEFAULT);
        assert!(PreferencesValue::default().is_default());
        assert!(!PreferencesValue::new(3).is_default());
    }

    #[test]
    fn incremented_returns_new_value_and_keeps_original() {
        let original = PreferencesValue::new(41);
        let next = original.incremented().unwrap();

        assert_eq!(next.counter, 42);
        assert_eq!(original.counter, 41);
    }

    #[test]
    fn incremented_rejects_overflow() {
        let err = PreferencesValue::new(u32::MAX).incremented().unwrap_err();
        assert_eq!(err, ValueError::CounterOverflow { current: u32::MAX });
    }

    #[test]
    fn serde_shape_is_flat_counter_object() {
        let json = serde_json::to_string(&PreferencesValue::new(7)).unwrap();
        assert_eq!(json, r#"{"counter":7}"#);

        let parsed: PreferencesValue = serde_json::from_str(r#"{"counter":12}"#).unwrap();
        assert_eq!(parsed, PreferencesValue::new(12));
    }
}
