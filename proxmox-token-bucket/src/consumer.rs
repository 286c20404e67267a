use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{Clock, Error, StorageError, TimestampStorage, TokenBucket};

/// Shortest sleep of a blocking consumer.
///
/// Waiting for fewer microseconds would mostly burn CPU time in syscalls,
/// so the actual delay may overshoot the computed deficit by up to this.
pub const MIN_SLEEP: Duration = Duration::from_millis(1);

/// Something tokens can be taken from.
pub trait TokenConsumer {
    /// Maximum number of tokens a single request may ask for.
    fn capacity(&self) -> u64;

    /// Take `tokens` if available, otherwise return the estimated wait time
    /// without changing any state.
    fn try_consume(&self, tokens: u64) -> Result<Option<Duration>, Error>;

    /// Sleep for `duration` according to the consumer's clock.
    fn pause(&self, duration: Duration);

    /// Take `tokens`, sleeping until enough of them are available.
    fn consume(&self, tokens: u64) -> Result<(), Error> {
        wait_for_tokens(self, tokens, None)
    }
}

pub(crate) fn wait_for_tokens<T: TokenConsumer + ?Sized>(
    consumer: &T,
    tokens: u64,
    abort: Option<&AtomicBool>,
) -> Result<(), Error> {
    let capacity = consumer.capacity();
    if tokens > capacity {
        return Err(Error::CapacityExceeded {
            requested: tokens,
            capacity,
        });
    }

    let aborted = || abort.is_some_and(|flag| flag.load(Ordering::Acquire));

    loop {
        let wait = match consumer.try_consume(tokens)? {
            None => return Ok(()),
            Some(wait) => wait.max(MIN_SLEEP),
        };

        if aborted() {
            return Err(Error::Aborted);
        }

        if wait >= Duration::from_secs(1) {
            log::debug!("waiting {:?} for {} tokens", wait, tokens);
        }
        consumer.pause(wait);

        if aborted() {
            return Err(Error::Aborted);
        }
    }
}

/// Blocking consumer used by stream adapters.
///
/// Sleeps until the requested tokens are available. Storage failures are
/// logged and returned, they are never retried: a broken shared backend
/// does not heal in the middle of a transfer.
pub struct BlockingConsumer<T = TokenBucket> {
    consumer: T,
    abort: Option<Arc<AtomicBool>>,
}

impl<T: TokenConsumer> BlockingConsumer<T> {
    pub fn new(consumer: T) -> Self {
        Self {
            consumer,
            abort: None,
        }
    }

    /// Like [`new`](Self::new), but waiting stops with [`Error::Aborted`]
    /// once `abort` is set. An aborted call does not take any tokens.
    pub fn with_abort(consumer: T, abort: Arc<AtomicBool>) -> Self {
        Self {
            consumer,
            abort: Some(abort),
        }
    }

    pub fn inner(&self) -> &T {
        &self.consumer
    }

    pub fn into_inner(self) -> T {
        self.consumer
    }

    pub fn consume(&self, tokens: u64) -> Result<(), Error> {
        wait_for_tokens(&self.consumer, tokens, self.abort.as_deref()).inspect_err(|err| {
            if let Error::Storage(err) = err {
                log::warn!("throttling failed, giving up - {err}");
            }
        })
    }
}

impl<T: TokenConsumer> TokenConsumer for BlockingConsumer<T> {
    fn capacity(&self) -> u64 {
        self.consumer.capacity()
    }

    fn try_consume(&self, tokens: u64) -> Result<Option<Duration>, Error> {
        self.consumer.try_consume(tokens)
    }

    fn pause(&self, duration: Duration) {
        self.consumer.pause(duration)
    }

    fn consume(&self, tokens: u64) -> Result<(), Error> {
        BlockingConsumer::consume(self, tokens)
    }
}

/// Serializes access to one bucket from several threads. The lock is not
/// held while sleeping.
impl<S: TimestampStorage + Send, C: Clock + Clone> TokenConsumer for Mutex<TokenBucket<S, C>> {
    fn capacity(&self) -> u64 {
        // the capacity never changes, a poisoned lock does not matter
        match self.lock() {
            Ok(bucket) => bucket.capacity(),
            Err(poisoned) => poisoned.into_inner().capacity(),
        }
    }

    fn try_consume(&self, tokens: u64) -> Result<Option<Duration>, Error> {
        self.lock()
            .map_err(|_| StorageError::Poisoned)?
            .try_consume(tokens)
    }

    fn pause(&self, duration: Duration) {
        let clock = match self.lock() {
            Ok(bucket) => bucket.clock().clone(),
            Err(poisoned) => poisoned.into_inner().clock().clone(),
        };
        clock.sleep(duration);
    }
}

impl<T: TokenConsumer + ?Sized> TokenConsumer for Arc<T> {
    fn capacity(&self) -> u64 {
        (**self).capacity()
    }

    fn try_consume(&self, tokens: u64) -> Result<Option<Duration>, Error> {
        (**self).try_consume(tokens)
    }

    fn pause(&self, duration: Duration) {
        (**self).pause(duration)
    }

    fn consume(&self, tokens: u64) -> Result<(), Error> {
        (**self).consume(tokens)
    }
}
