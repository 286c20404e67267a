use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use proxmox_token_bucket::{BlockingConsumer, Error, TokenBucket, TokenConsumer};

use crate::ThrottleMode;

pub(crate) fn into_io_error(err: Error) -> io::Error {
    match err {
        Error::InvalidConfiguration(_) | Error::CapacityExceeded { .. } => {
            io::Error::new(ErrorKind::InvalidInput, err)
        }
        Error::Storage(_) | Error::Clock(_) | Error::Aborted => io::Error::other(err),
    }
}

pub(crate) fn chunk_limit(capacity: u64) -> usize {
    usize::try_from(capacity).unwrap_or(usize::MAX)
}

/// A blocking, rate limited stream.
///
/// Writes are split into chunks of at most the bucket capacity, each chunk
/// waits for its tokens and is then passed to the inner stream unmodified.
/// Reads are limited to the bucket capacity and pay for the bytes actually
/// read.
///
/// If throttling fails after some data was already transferred, the
/// transferred amount is reported first and the error is returned by the
/// next call, so no data gets lost silently.
pub struct ThrottledStream<S, C = TokenBucket> {
    consumer: BlockingConsumer<C>,
    mode: ThrottleMode,
    pending_read_error: Option<io::Error>,
    stream: S,
}

impl<S, C: TokenConsumer> ThrottledStream<S, C> {
    pub fn new(stream: S, consumer: C, mode: ThrottleMode) -> Self {
        Self::with_consumer(stream, BlockingConsumer::new(consumer), mode)
    }

    /// Creates a stream whose waits stop once `abort` is set. Operations
    /// waiting at that time fail and do not take any tokens.
    pub fn with_abort(stream: S, consumer: C, mode: ThrottleMode, abort: Arc<AtomicBool>) -> Self {
        Self::with_consumer(stream, BlockingConsumer::with_abort(consumer, abort), mode)
    }

    fn with_consumer(stream: S, consumer: BlockingConsumer<C>, mode: ThrottleMode) -> Self {
        Self {
            consumer,
            mode,
            pending_read_error: None,
            stream,
        }
    }

    pub fn mode(&self) -> ThrottleMode {
        self.mode
    }

    pub fn consumer(&self) -> &C {
        self.consumer.inner()
    }

    pub fn inner(&self) -> &S {
        &self.stream
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Removes the throttle, returning the inner stream.
    pub fn unthrottle(self) -> S {
        self.stream
    }
}

impl<S: Write, C: TokenConsumer> ThrottledStream<S, C> {
    /// Write the whole chunk, returning how much was written before an error.
    fn write_chunk(&mut self, chunk: &[u8]) -> (usize, Option<io::Error>) {
        let mut offset = 0;
        while offset < chunk.len() {
            match self.stream.write(&chunk[offset..]) {
                Ok(0) => return (offset, Some(ErrorKind::WriteZero.into())),
                Ok(count) => offset += count,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return (offset, Some(err)),
            }
        }
        (offset, None)
    }
}

impl<S: Write, C: TokenConsumer> Write for ThrottledStream<S, C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.mode.throttles_write() || buf.is_empty() {
            return self.stream.write(buf);
        }

        let mut written = 0;
        for chunk in buf.chunks(chunk_limit(self.consumer.capacity())) {
            if let Err(err) = self.consumer.consume(chunk.len() as u64) {
                if written > 0 {
                    // the error shows up again on the next write
                    return Ok(written);
                }
                return Err(into_io_error(err));
            }

            let (count, err) = self.write_chunk(chunk);
            written += count;
            if let Some(err) = err {
                if written > 0 {
                    return Ok(written);
                }
                return Err(err);
            }
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl<S: Read, C: TokenConsumer> Read for ThrottledStream<S, C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(err) = self.pending_read_error.take() {
            return Err(err);
        }

        if !self.mode.throttles_read() {
            return self.stream.read(buf);
        }

        let limit = buf.len().min(chunk_limit(self.consumer.capacity()));
        let count = self.stream.read(&mut buf[..limit])?;

        if count > 0 {
            if let Err(err) = self.consumer.consume(count as u64) {
                // hand out what was read, fail on the next call
                self.pending_read_error = Some(into_io_error(err));
            }
        }

        Ok(count)
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;
    use std::time::Duration;

    use proxmox_token_bucket::{
        LocalStorage, ManualClock, Rate, StorageError, TimestampStorage, TokenBucketConfig,
        DEFAULT_KEY,
    };

    use super::*;

    fn bucket(
        capacity: u64,
        initial_tokens: u64,
    ) -> (TokenBucket<LocalStorage, ManualClock>, ManualClock) {
        let clock = ManualClock::new(1_417_011_228_000_000.0);
        let config = TokenBucketConfig::new(capacity, Rate::per_second(1).unwrap())
            .initial_tokens(initial_tokens);
        let bucket =
            TokenBucket::with_storage(config, DEFAULT_KEY, LocalStorage::new(), clock.clone())
                .unwrap();
        (bucket, clock)
    }

    #[test]
    fn test_write_conserves_content() {
        let cases: &[&[&str]] = &[
            &["a"],
            &["a", "b"],
            &["ab"],
            &["ab", "c"],
            &["123456789", "0"],
            &["123456789", "0a"],
            &["1234567890", "ab"],
            &["1234567890a"],
            &["1234567890a", "b"],
        ];

        for writes in cases {
            let (bucket, _clock) = bucket(10, 0);
            let mut stream = ThrottledStream::new(Vec::new(), bucket, ThrottleMode::Write);
            for write in writes.iter() {
                stream.write_all(write.as_bytes()).unwrap();
            }
            assert_eq!(stream.unthrottle(), writes.concat().into_bytes());
        }
    }

    #[test]
    fn test_write_shapes_traffic() {
        let cases: &[(u64, &[usize])] = &[
            (1, &[1]),
            (2, &[2]),
            (10, &[10]),
            (11, &[11]),
            (20, &[20]),
            (2, &[1, 1]),
            (10, &[1, 9]),
            (11, &[2, 9]),
            (12, &[2, 10]),
            (22, &[2, 20]),
            (20, &[10, 10]),
            (42, &[21, 21]),
            (512, &[512]),
            (1024, &[1024]),
        ];

        for (expected_secs, writes) in cases {
            let (bucket, clock) = bucket(10, 0);
            let mut stream = ThrottledStream::new(std::io::sink(), bucket, ThrottleMode::Both);
            for len in writes.iter() {
                stream.write_all(&vec![b' '; *len]).unwrap();
            }
            assert_eq!(
                clock.slept(),
                Duration::from_secs(*expected_secs),
                "writes {writes:?}"
            );
        }
    }

    #[test]
    fn test_initial_burst_passes_instantly() {
        let (bucket, clock) = bucket(10, 10);
        let mut stream = ThrottledStream::new(Vec::new(), bucket, ThrottleMode::Write);

        let data: Vec<u8> = (0..20).collect();
        stream.write_all(&data).unwrap();

        // first 10 bytes instantly, the other 10 at one byte per second
        assert_eq!(clock.slept(), Duration::from_secs(10));
        assert_eq!(stream.unthrottle(), data);
    }

    #[test]
    fn test_read_is_throttled() {
        let (bucket, clock) = bucket(4, 0);
        let mut stream =
            ThrottledStream::new(Cursor::new(b"0123456789".to_vec()), bucket, ThrottleMode::Read);

        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"0123");

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"456789");

        assert_eq!(clock.slept(), Duration::from_secs(10));
    }

    #[test]
    fn test_unthrottled_direction_passes_through() {
        let (bucket, clock) = bucket(4, 0);
        let mut stream = ThrottledStream::new(Cursor::new(Vec::new()), bucket, ThrottleMode::Read);

        stream.write_all(b"no throttling here").unwrap();
        assert_eq!(clock.slept(), Duration::ZERO);
        assert_eq!(stream.unthrottle().into_inner(), b"no throttling here");
    }

    struct FailingStorage;

    impl TimestampStorage for FailingStorage {
        fn bootstrap(&self, _key: &str, _timestamp: f64) -> Result<bool, StorageError> {
            Ok(true)
        }

        fn read_timestamp(&self, _key: &str) -> Result<f64, StorageError> {
            Err(StorageError::Unavailable("gone".to_string()))
        }

        fn compare_and_swap_timestamp(
            &self,
            _key: &str,
            _expected: f64,
            _new: f64,
        ) -> Result<bool, StorageError> {
            Err(StorageError::Unavailable("gone".to_string()))
        }
    }

    #[test]
    fn test_storage_failure_fails_the_write() {
        let clock = ManualClock::default();
        let config = TokenBucketConfig::new(10, Rate::per_second(1).unwrap());
        let bucket = TokenBucket::with_storage(config, DEFAULT_KEY, FailingStorage, clock).unwrap();

        let mut stream = ThrottledStream::new(Vec::new(), bucket, ThrottleMode::Both);
        let err = stream.write_all(b"data").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert!(stream.inner().is_empty());
    }

    #[test]
    fn test_abort_stops_waiting_writer() {
        let (bucket, clock) = bucket(10, 5);
        let abort = Arc::new(AtomicBool::new(true));
        let mut stream =
            ThrottledStream::with_abort(Vec::new(), bucket, ThrottleMode::Write, abort);

        // available tokens are still handed out
        stream.write_all(b"01234").unwrap();

        let err = stream.write(b"56789").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert_eq!(clock.slept(), Duration::ZERO);
        assert_eq!(stream.unthrottle(), b"01234");
    }
}
