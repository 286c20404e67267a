use proxmox_token_bucket::{
    Clock, Error, LocalStorage, MonotonicClock, Rate, TimestampStorage, TokenBucket,
    TokenBucketConfig,
};

use crate::unit::human_bytes;
use crate::{ByteUnit, ThrottleConfig, ThrottleMode, ThrottledStream};

/// Storage key used unless another one is configured.
pub const DEFAULT_THROTTLE_KEY: &str = "bandwidth-throttle";

/// Builds byte based token buckets and throttled streams.
///
/// One token is one byte. The burst capacity defaults to one second worth
/// of data, the bucket starts empty unless an initial burst is set.
///
/// By default every throttled stream gets its own [`LocalStorage`]. Use
/// [`with_storage`](Self::with_storage) with a shared storage and clone the
/// builder to make several streams (or processes) share one limit.
#[derive(Clone, Debug)]
pub struct BandwidthThrottle<S = LocalStorage, C = MonotonicClock> {
    rate: Option<u64>,
    burst: Option<u64>,
    initial_burst: u64,
    mode: ThrottleMode,
    key: String,
    storage: S,
    clock: C,
}

fn nonzero(bytes: u64, what: &str) -> Result<u64, Error> {
    if bytes == 0 {
        return Err(Error::InvalidConfiguration(format!(
            "{what} must be greater than zero"
        )));
    }
    Ok(bytes)
}

impl Default for BandwidthThrottle {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthThrottle {
    pub fn new() -> Self {
        Self {
            rate: None,
            burst: None,
            initial_burst: 0,
            mode: ThrottleMode::default(),
            key: DEFAULT_THROTTLE_KEY.to_string(),
            storage: LocalStorage::new(),
            clock: MonotonicClock,
        }
    }

    /// Creates a process local throttle from `config`.
    pub fn from_config(config: &ThrottleConfig) -> Result<Self, Error> {
        Self::new().configure(config)
    }
}

impl<S, C> BandwidthThrottle<S, C> {
    /// Limit the throughput to `amount` units per second.
    pub fn set_rate(&mut self, amount: u64, unit: ByteUnit) -> Result<(), Error> {
        self.rate = Some(nonzero(unit.to_bytes(amount)?, "rate")?);
        Ok(())
    }

    /// Maximum amount which can pass at once after an idle period.
    pub fn set_burst_capacity(&mut self, amount: u64, unit: ByteUnit) -> Result<(), Error> {
        self.burst = Some(nonzero(unit.to_bytes(amount)?, "burst capacity")?);
        Ok(())
    }

    /// Amount which can pass instantly right after the throttle was attached.
    pub fn set_initial_burst(&mut self, amount: u64, unit: ByteUnit) -> Result<(), Error> {
        self.initial_burst = unit.to_bytes(amount)?;
        Ok(())
    }

    pub fn set_mode(&mut self, mode: ThrottleMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> ThrottleMode {
        self.mode
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Keep the bucket state under `key` in `storage`.
    pub fn with_storage<T: TimestampStorage>(
        self,
        key: impl Into<String>,
        storage: T,
    ) -> BandwidthThrottle<T, C> {
        BandwidthThrottle {
            rate: self.rate,
            burst: self.burst,
            initial_burst: self.initial_burst,
            mode: self.mode,
            key: key.into(),
            storage,
            clock: self.clock,
        }
    }

    /// Use another time source, mostly useful for tests.
    pub fn with_clock<T: Clock>(self, clock: T) -> BandwidthThrottle<S, T> {
        BandwidthThrottle {
            rate: self.rate,
            burst: self.burst,
            initial_burst: self.initial_burst,
            mode: self.mode,
            key: self.key,
            storage: self.storage,
            clock,
        }
    }

    /// Apply all settings of `config`. The key is only changed if the
    /// config contains one.
    pub fn configure(mut self, config: &ThrottleConfig) -> Result<Self, Error> {
        self.set_rate(human_bytes(&config.rate)?, ByteUnit::Bytes)?;
        if let Some(burst) = &config.burst {
            self.set_burst_capacity(human_bytes(burst)?, ByteUnit::Bytes)?;
        }
        if let Some(initial) = &config.initial_burst {
            self.set_initial_burst(human_bytes(initial)?, ByteUnit::Bytes)?;
        }
        self.set_mode(config.mode);
        if let Some(key) = &config.key {
            self.key = key.clone();
        }
        Ok(self)
    }

    /// The bucket parameters, validated.
    pub fn bucket_config(&self) -> Result<TokenBucketConfig, Error> {
        let rate = self.rate.ok_or_else(|| {
            Error::InvalidConfiguration("no bandwidth rate configured".to_string())
        })?;

        let config = TokenBucketConfig::new(self.burst.unwrap_or(rate), Rate::per_second(rate)?)
            .initial_tokens(self.initial_burst);
        config.validate()?;

        Ok(config)
    }
}

impl<S: TimestampStorage, C: Clock> BandwidthThrottle<S, C> {
    pub fn build_bucket(self) -> Result<TokenBucket<S, C>, Error> {
        let config = self.bucket_config()?;

        log::debug!(
            "throttling '{}' to {} bytes/s (burst {}, mode {})",
            self.key,
            config.rate.tokens(),
            config.capacity,
            self.mode,
        );

        TokenBucket::with_storage(config, self.key, self.storage, self.clock)
    }

    /// Wrap a blocking stream.
    pub fn throttle<T>(self, stream: T) -> Result<ThrottledStream<T, TokenBucket<S, C>>, Error> {
        let mode = self.mode;
        Ok(ThrottledStream::new(stream, self.build_bucket()?, mode))
    }

    /// Wrap an async stream.
    #[cfg(feature = "tokio")]
    pub fn throttle_async<T>(
        self,
        stream: T,
    ) -> Result<crate::RateLimitedStream<T, TokenBucket<S, C>>, Error> {
        let mode = self.mode;
        Ok(crate::RateLimitedStream::new(stream, self.build_bucket()?, mode))
    }
}
