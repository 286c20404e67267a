//! Bandwidth throttling for byte streams.
//!
//! The [`BandwidthThrottle`] facade builds a [`TokenBucket`] with one token
//! per byte from user friendly parameters and wraps a stream into a
//! [`ThrottledStream`] (blocking `std::io`) or, with the `tokio` feature, a
//! [`RateLimitedStream`] (async).
//!
//! ```no_run
//! use std::io::Write;
//!
//! use proxmox_bandwidth_throttle::{BandwidthThrottle, ByteUnit};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut throttle = BandwidthThrottle::new();
//! throttle.set_rate(100, ByteUnit::Kibibytes)?; // 100 KiB/s
//!
//! let mut out = throttle.throttle(std::io::stdout())?;
//! out.write_all(&[0u8; 1024 * 1024])?; // takes about ten seconds
//! # Ok(())
//! # }
//! ```
//!
//! Reading and writing through one throttled stream share the same bucket,
//! so both directions together stay within the rate. Use dedicated
//! throttles and streams if that is not wanted.
//!
//! [`TokenBucket`]: proxmox_token_bucket::TokenBucket

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod config;
pub use config::{ThrottleConfig, ThrottleMode};

mod stream;
pub use stream::ThrottledStream;

#[cfg(feature = "tokio")]
mod async_stream;
#[cfg(feature = "tokio")]
pub use async_stream::RateLimitedStream;

mod throttle;
pub use throttle::{BandwidthThrottle, DEFAULT_THROTTLE_KEY};

mod unit;
pub use unit::ByteUnit;

pub use proxmox_human_byte::HumanByte;

pub use proxmox_token_bucket::Error;
