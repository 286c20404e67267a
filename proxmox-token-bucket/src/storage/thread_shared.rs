use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use super::{check_timestamp, TimestampStorage};
use crate::StorageError;

/// Keyed timestamps shared between threads of one process.
///
/// Cloning the storage yields another handle to the same timestamps. Each
/// timestamp is an `AtomicU64` holding the bits of the `f64` value and is
/// updated with `compare_exchange`; the lock only protects the key lookup.
#[derive(Clone, Debug, Default)]
pub struct ThreadSharedStorage {
    cells: Arc<RwLock<HashMap<String, Arc<AtomicU64>>>>,
}

impl ThreadSharedStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: &str) -> Result<Arc<AtomicU64>, StorageError> {
        let cells = self.cells.read().map_err(|_| StorageError::Poisoned)?;
        cells
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotBootstrapped(key.to_string()))
    }
}

impl TimestampStorage for ThreadSharedStorage {
    fn bootstrap(&self, key: &str, timestamp: f64) -> Result<bool, StorageError> {
        let timestamp = check_timestamp(key, timestamp)?;
        let mut cells = self.cells.write().map_err(|_| StorageError::Poisoned)?;
        if cells.contains_key(key) {
            return Ok(false);
        }
        cells.insert(
            key.to_string(),
            Arc::new(AtomicU64::new(timestamp.to_bits())),
        );
        Ok(true)
    }

    fn read_timestamp(&self, key: &str) -> Result<f64, StorageError> {
        let bits = self.cell(key)?.load(Ordering::Acquire);
        check_timestamp(key, f64::from_bits(bits))
    }

    fn compare_and_swap_timestamp(
        &self,
        key: &str,
        expected: f64,
        new: f64,
    ) -> Result<bool, StorageError> {
        let new = check_timestamp(key, new)?;
        Ok(self
            .cell(key)?
            .compare_exchange(
                expected.to_bits(),
                new.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok())
    }

    fn is_shared(&self) -> bool {
        true
    }
}
