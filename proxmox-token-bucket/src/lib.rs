//! Token bucket with lazy, timestamp based refill.
//!
//! A [`TokenBucket`] does not store a token counter. It stores a single
//! *reference timestamp*, the virtual point in time at which the bucket
//! would have been empty, and derives the available tokens from the time
//! elapsed since then. Refilling therefore needs no background timer, and
//! repeated updates cannot accumulate rounding drift.
//!
//! The timestamp lives in a [`TimestampStorage`]. [`LocalStorage`] keeps it
//! in ordinary memory for a single session, [`ThreadSharedStorage`] shares
//! keyed timestamps between threads, and `SharedMemoryStorage` (feature
//! `shared-memory`) shares them between processes. Shared updates always use
//! compare-and-swap, so concurrent consumers cannot grant the same tokens
//! twice.
//!
//! ```no_run
//! use proxmox_token_bucket::{Rate, TokenBucket};
//!
//! # fn main() -> Result<(), proxmox_token_bucket::Error> {
//! // 1024 tokens per second, burst of 4096, starting full
//! let bucket = TokenBucket::with_rate(4096, Rate::per_second(1024)?)?.with_initial_tokens(4096)?;
//! bucket.consume(4096)?; // returns instantly
//! bucket.consume(512)?; // blocks for about half a second
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod bucket;
pub use bucket::{TokenBucket, TokenBucketConfig, DEFAULT_KEY};

mod clock;
pub use clock::{Clock, ManualClock, MonotonicClock};

mod consumer;
pub use consumer::{BlockingConsumer, TokenConsumer, MIN_SLEEP};

mod error;
pub use error::{Error, StorageError};

mod rate;
pub use rate::{Rate, TimeUnit};

pub mod storage;
pub use storage::{LocalStorage, ThreadSharedStorage, TimestampStorage};

#[cfg(feature = "shared-memory")]
pub use storage::SharedMemoryStorage;
