//! Storage backends for the reference timestamp of a token bucket.

use crate::StorageError;

mod local;
pub use local::LocalStorage;

mod thread_shared;
pub use thread_shared::ThreadSharedStorage;

#[cfg(feature = "shared-memory")]
mod shared_memory;
#[cfg(feature = "shared-memory")]
pub use shared_memory::{SharedMemoryStorage, SHARED_KEY_MAX_LEN, SHARED_SLOTS};

/// Where the reference timestamp of a token bucket lives.
///
/// Timestamps are identified by a key, so several buckets can share one
/// storage. Updates go through [`compare_and_swap_timestamp`], which must
/// only write if the stored value is still the `expected` one, so
/// concurrent consumers cannot both decrement from the same stale value.
///
/// [`compare_and_swap_timestamp`]: TimestampStorage::compare_and_swap_timestamp
pub trait TimestampStorage {
    /// Store `timestamp` for `key` unless the key already has a value.
    ///
    /// Returns `true` if the value was stored.
    fn bootstrap(&self, key: &str, timestamp: f64) -> Result<bool, StorageError>;

    /// Read the timestamp stored for `key`.
    fn read_timestamp(&self, key: &str) -> Result<f64, StorageError>;

    /// Replace the timestamp for `key` with `new` if it still is `expected`.
    ///
    /// Values are compared bit by bit. Returns `false` if another writer
    /// changed the value in the meantime.
    fn compare_and_swap_timestamp(
        &self,
        key: &str,
        expected: f64,
        new: f64,
    ) -> Result<bool, StorageError>;

    /// Whether other buckets (threads or processes) may see the timestamps.
    fn is_shared(&self) -> bool {
        false
    }
}

impl<T: TimestampStorage + ?Sized> TimestampStorage for &T {
    fn bootstrap(&self, key: &str, timestamp: f64) -> Result<bool, StorageError> {
        (**self).bootstrap(key, timestamp)
    }

    fn read_timestamp(&self, key: &str) -> Result<f64, StorageError> {
        (**self).read_timestamp(key)
    }

    fn compare_and_swap_timestamp(
        &self,
        key: &str,
        expected: f64,
        new: f64,
    ) -> Result<bool, StorageError> {
        (**self).compare_and_swap_timestamp(key, expected, new)
    }

    fn is_shared(&self) -> bool {
        (**self).is_shared()
    }
}

/// Reject values which cannot be a timestamp (NaN, infinities).
fn check_timestamp(key: &str, value: f64) -> Result<f64, StorageError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(StorageError::Malformed {
            key: key.to_string(),
            value,
        })
    }
}
