use thiserror::Error;

/// Failures of a [`TimestampStorage`](crate::TimestampStorage) backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("no timestamp stored for key '{0}'")]
    NotBootstrapped(String),
    #[error("malformed timestamp for key '{key}' ({value})")]
    Malformed { key: String, value: f64 },
    #[error("storage unavailable - {0}")]
    Unavailable(String),
    #[error("invalid storage key '{key}' - {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[error("no free slot left to store key '{0}'")]
    TableFull(String),
    #[error("token bucket lock poisoned")]
    Poisoned,
}

/// Errors returned by token bucket operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad capacity, rate or initial token values.
    #[error("invalid configuration - {0}")]
    InvalidConfiguration(String),
    /// A single request asked for more tokens than the bucket can ever hold.
    #[error("requested {requested} tokens, but bucket capacity is {capacity}")]
    CapacityExceeded { requested: u64, capacity: u64 },
    #[error("token storage failed - {0}")]
    Storage(#[from] StorageError),
    #[error("failed to read clock - {0}")]
    Clock(#[from] nix::errno::Errno),
    /// A blocked consume was aborted by its caller, no tokens were taken.
    #[error("waiting for tokens aborted")]
    Aborted,
}
