use std::time::Duration;

use crate::consumer::wait_for_tokens;
use crate::{Clock, Error, LocalStorage, MonotonicClock, Rate, TimestampStorage, TokenConsumer};

/// Storage key used by buckets which do not need a specific one.
pub const DEFAULT_KEY: &str = "default";

// absorbs float rounding when subtracting two large timestamps
const ROUNDING_SLACK: f64 = 1e-6;

/// Parameters of a [`TokenBucket`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TokenBucketConfig {
    /// Maximum number of tokens the bucket holds (burst size).
    pub capacity: u64,
    /// Refill rate.
    pub rate: Rate,
    /// Tokens available right after creation.
    pub initial_tokens: u64,
}

impl TokenBucketConfig {
    /// Bucket configuration starting with an empty bucket.
    pub fn new(capacity: u64, rate: Rate) -> Self {
        Self {
            capacity,
            rate,
            initial_tokens: 0,
        }
    }

    pub fn initial_tokens(mut self, tokens: u64) -> Self {
        self.initial_tokens = tokens;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.capacity == 0 {
            return Err(Error::InvalidConfiguration(
                "capacity must be greater than zero".to_string(),
            ));
        }
        if self.initial_tokens > self.capacity {
            return Err(Error::InvalidConfiguration(format!(
                "initial tokens ({}) exceed capacity ({})",
                self.initial_tokens, self.capacity
            )));
        }
        Ok(())
    }
}

/// Token bucket with lazy refill.
///
/// Instead of a token counter the bucket keeps a reference timestamp in its
/// [`TimestampStorage`]. The available tokens are
/// `floor((now - timestamp) / micros_per_token)`, clamped to
/// `[0, capacity]`, and consuming tokens moves the timestamp forward.
///
/// All methods take `&self`, the state is only ever changed through the
/// storage's compare-and-swap. The default [`LocalStorage`] is not `Sync`,
/// use a `Mutex<TokenBucket>` or a shared storage to use one limit from
/// several threads.
pub struct TokenBucket<S = LocalStorage, C = MonotonicClock> {
    capacity: u64,
    rate: Rate,
    micros_per_token: f64,
    key: String,
    storage: S,
    clock: C,
}

impl TokenBucket {
    /// Creates a process local bucket producing one token every
    /// `refill_micros` microseconds.
    pub fn new(capacity: u64, refill_micros: u64, initial_tokens: u64) -> Result<Self, Error> {
        let rate = Rate::from_refill_micros(refill_micros)?;
        Self::with_storage(
            TokenBucketConfig::new(capacity, rate).initial_tokens(initial_tokens),
            DEFAULT_KEY,
            LocalStorage::new(),
            MonotonicClock,
        )
    }

    /// Creates an initially empty, process local bucket.
    pub fn with_rate(capacity: u64, rate: Rate) -> Result<Self, Error> {
        Self::with_storage(
            TokenBucketConfig::new(capacity, rate),
            DEFAULT_KEY,
            LocalStorage::new(),
            MonotonicClock,
        )
    }
}

impl<S: TimestampStorage, C: Clock> TokenBucket<S, C> {
    /// Creates a bucket keeping its state under `key` in `storage`.
    ///
    /// The initial tokens are only applied if the storage does not know the
    /// key yet, joining an existing shared limit keeps its current state.
    pub fn with_storage(
        config: TokenBucketConfig,
        key: impl Into<String>,
        storage: S,
        clock: C,
    ) -> Result<Self, Error> {
        config.validate()?;

        let bucket = Self {
            capacity: config.capacity,
            rate: config.rate,
            micros_per_token: config.rate.micros_per_token(),
            key: key.into(),
            storage,
            clock,
        };

        let timestamp = bucket.timestamp_for(config.initial_tokens, bucket.clock.now_micros()?);
        if bucket.storage.bootstrap(&bucket.key, timestamp)? && bucket.storage.is_shared() {
            log::info!(
                "bootstrapped shared token bucket '{}' with {} tokens",
                bucket.key,
                config.initial_tokens
            );
        }

        Ok(bucket)
    }

    /// Sets the available tokens, see [`set_tokens`](Self::set_tokens).
    pub fn with_initial_tokens(self, tokens: u64) -> Result<Self, Error> {
        if tokens > self.capacity {
            return Err(Error::InvalidConfiguration(format!(
                "initial tokens ({}) exceed capacity ({})",
                tokens, self.capacity
            )));
        }
        self.set_tokens(tokens)?;
        Ok(self)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn rate(&self) -> Rate {
        self.rate
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    fn timestamp_for(&self, tokens: u64, now: f64) -> f64 {
        now - tokens as f64 * self.micros_per_token
    }

    fn tokens_at(&self, timestamp: f64, now: f64) -> u64 {
        let elapsed = now - timestamp;
        if elapsed.is_nan() || elapsed <= 0.0 {
            return 0;
        }
        let tokens = (elapsed / self.micros_per_token + ROUNDING_SLACK).floor();
        if tokens >= self.capacity as f64 {
            self.capacity
        } else {
            tokens as u64
        }
    }

    /// Currently available tokens. Only reads the clock and the storage.
    pub fn available_tokens(&self) -> Result<u64, Error> {
        let timestamp = self.storage.read_timestamp(&self.key)?;
        Ok(self.tokens_at(timestamp, self.clock.now_micros()?))
    }

    /// Rebase the reference timestamp so that exactly `tokens` are available
    /// now. Values above the capacity are clamped by the next read.
    pub fn set_tokens(&self, tokens: u64) -> Result<(), Error> {
        loop {
            let current = self.storage.read_timestamp(&self.key)?;
            let timestamp = self.timestamp_for(tokens, self.clock.now_micros()?);
            if self
                .storage
                .compare_and_swap_timestamp(&self.key, current, timestamp)?
            {
                return Ok(());
            }
            log::debug!("token bucket '{}' changed concurrently, retrying", self.key);
        }
    }

    /// Take `tokens` if they are available right now.
    ///
    /// Returns `None` when the tokens were taken. Otherwise nothing is
    /// changed and the estimated time until enough tokens accumulate is
    /// returned.
    pub fn try_consume(&self, tokens: u64) -> Result<Option<Duration>, Error> {
        if tokens > self.capacity {
            return Err(Error::CapacityExceeded {
                requested: tokens,
                capacity: self.capacity,
            });
        }
        if tokens == 0 {
            return Ok(None);
        }

        loop {
            let timestamp = self.storage.read_timestamp(&self.key)?;
            let now = self.clock.now_micros()?;
            let available = self.tokens_at(timestamp, now);

            if available < tokens {
                let deficit_micros = (tokens - available) as f64 * self.micros_per_token;
                return Ok(Some(Duration::from_micros(deficit_micros.ceil() as u64)));
            }

            let new_timestamp = self.timestamp_for(available - tokens, now);
            if self
                .storage
                .compare_and_swap_timestamp(&self.key, timestamp, new_timestamp)?
            {
                return Ok(None);
            }
            log::debug!("token bucket '{}' changed concurrently, retrying", self.key);
        }
    }

    /// Take `tokens`, sleeping until enough of them are available.
    ///
    /// Fails with [`Error::CapacityExceeded`] without blocking if `tokens`
    /// exceeds the capacity. Tokens are only taken once the wait is over.
    pub fn consume(&self, tokens: u64) -> Result<(), Error> {
        wait_for_tokens(self, tokens, None)
    }
}

impl<S: TimestampStorage, C: Clock> TokenConsumer for TokenBucket<S, C> {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn try_consume(&self, tokens: u64) -> Result<Option<Duration>, Error> {
        TokenBucket::try_consume(self, tokens)
    }

    fn pause(&self, duration: Duration) {
        self.clock.sleep(duration);
    }
}
