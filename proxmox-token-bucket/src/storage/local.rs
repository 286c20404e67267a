use std::cell::Cell;

use super::{check_timestamp, TimestampStorage};
use crate::StorageError;

/// Process local storage for a single bucket.
///
/// Holds one timestamp in ordinary memory without any locking, the key is
/// ignored. The storage is `Send` but not `Sync`; wrap the bucket into a
/// `Mutex` to share it between threads.
#[derive(Debug, Default)]
pub struct LocalStorage {
    timestamp: Cell<Option<f64>>,
}

impl LocalStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimestampStorage for LocalStorage {
    fn bootstrap(&self, key: &str, timestamp: f64) -> Result<bool, StorageError> {
        if self.timestamp.get().is_some() {
            return Ok(false);
        }
        self.timestamp.set(Some(check_timestamp(key, timestamp)?));
        Ok(true)
    }

    fn read_timestamp(&self, key: &str) -> Result<f64, StorageError> {
        match self.timestamp.get() {
            Some(timestamp) => check_timestamp(key, timestamp),
            None => Err(StorageError::NotBootstrapped(key.to_string())),
        }
    }

    fn compare_and_swap_timestamp(
        &self,
        key: &str,
        expected: f64,
        new: f64,
    ) -> Result<bool, StorageError> {
        let current = self
            .timestamp
            .get()
            .ok_or_else(|| StorageError::NotBootstrapped(key.to_string()))?;

        if current.to_bits() != expected.to_bits() {
            return Ok(false);
        }

        self.timestamp.set(Some(check_timestamp(key, new)?));
        Ok(true)
    }
}
