//! Abstract persistence for feature flags.
//!
//! Flags are persisted one record per flag under the key
//! `feature_flags:<name>`, JSON-encoded. The store behind that interface is
//! pluggable (a key-value cache in production); an in-memory implementation
//! ships for defaults and tests.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

use super::FeatureFlag;

/// Key prefix for persisted flag records.
pub const FLAG_KEY_PREFIX: &str = "feature_flags:";

/// Errors from the flag store.
///
/// Callers of the flag manager never see these: persistence failures are
/// logged and swallowed, the in-memory map stays authoritative.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store rejected or failed the operation.
    #[error("flag store backend error: {0}")]
    Backend(String),

    /// A persisted record could not be decoded.
    #[error("failed to decode flag record: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Narrow persistence interface for flag records.
pub trait FlagStore: Send + Sync {
    /// Load every persisted flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable or a record cannot be
    /// decoded.
    fn load_all(&self) -> Result<Vec<FeatureFlag>, StoreError>;

    /// Persist one flag, overwriting any existing record.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the write.
    fn save(&self, flag: &FeatureFlag) -> Result<(), StoreError>;

    /// Delete one flag record. Deleting an absent record is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the delete.
    fn delete(&self, name: &str) -> Result<(), StoreError>;
}

/// In-memory flag store.
#[derive(Debug, Default)]
pub struct MemoryFlagStore {
    records: Mutex<HashMap<String, String>>,
}

impl MemoryFlagStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FlagStore for MemoryFlagStore {
    fn load_all(&self) -> Result<Vec<FeatureFlag>, StoreError> {
        self.lock()
            .values()
            .map(|raw| serde_json::from_str(raw).map_err(StoreError::from))
            .collect()
    }

    fn save(&self, flag: &FeatureFlag) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(flag)?;
        self.lock()
            .insert(format!("{FLAG_KEY_PREFIX}{}", flag.name), encoded);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.lock().remove(&format!("{FLAG_KEY_PREFIX}{name}"));
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Store that fails every operation, for exercising the
    /// logged-and-swallowed failure mode.
    #[derive(Debug, Default)]
    pub struct FailingFlagStore;

    impl FlagStore for FailingFlagStore {
        fn load_all(&self) -> Result<Vec<FeatureFlag>, StoreError> {
            Err(StoreError::Backend("cache unreachable".to_string()))
        }

        fn save(&self, _flag: &FeatureFlag) -> Result<(), StoreError> {
            Err(StoreError::Backend("cache unreachable".to_string()))
        }

        fn delete(&self, _name: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("cache unreachable".to_string()))
        }
    }
}
