use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

use proxmox_token_bucket::{TokenBucket, TokenConsumer, MIN_SLEEP};

use crate::stream::{chunk_limit, into_io_error};
use crate::ThrottleMode;

/// Tokens owed for already transferred data, and the timer to wait for them.
#[derive(Default)]
struct Pacer {
    delay: Option<Pin<Box<Sleep>>>,
    debt: u64,
}

impl Pacer {
    /// Pay the debt, sleeping (asynchronously) until the tokens are there.
    fn poll_settle<C: TokenConsumer>(
        &mut self,
        consumer: &C,
        ctx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if let Some(delay) = self.delay.as_mut() {
                ready!(delay.as_mut().poll(ctx));
                self.delay = None;
            }

            if self.debt == 0 {
                return Poll::Ready(Ok(()));
            }

            match consumer.try_consume(self.debt) {
                Ok(None) => self.debt = 0,
                Ok(Some(wait)) => {
                    self.delay = Some(Box::pin(tokio::time::sleep(wait.max(MIN_SLEEP))));
                }
                Err(err) => {
                    log::warn!("throttling failed, giving up - {err}");
                    return Poll::Ready(Err(into_io_error(err)));
                }
            }
        }
    }
}

/// An async rate limited stream.
///
/// Other than [`ThrottledStream`](crate::ThrottledStream) this never blocks
/// the executor. Every read or write is limited to the bucket capacity and
/// its tokens are charged once it completed, the next operation in the
/// same direction (or a flush) waits until they are paid.
pub struct RateLimitedStream<S, C = TokenBucket> {
    consumer: C,
    mode: ThrottleMode,
    read_pacer: Pacer,
    write_pacer: Pacer,
    read_buffer: Vec<u8>,
    stream: S,
}

impl<S, C: TokenConsumer> RateLimitedStream<S, C> {
    pub fn new(stream: S, consumer: C, mode: ThrottleMode) -> Self {
        Self {
            consumer,
            mode,
            read_pacer: Pacer::default(),
            write_pacer: Pacer::default(),
            read_buffer: Vec::new(),
            stream,
        }
    }

    pub fn mode(&self) -> ThrottleMode {
        self.mode
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    pub fn inner(&self) -> &S {
        &self.stream
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Removes the throttle, returning the inner stream. Unpaid tokens are
    /// forgotten.
    pub fn unthrottle(self) -> S {
        self.stream
    }
}

impl<S: AsyncWrite + Unpin, C: TokenConsumer + Unpin> AsyncWrite for RateLimitedStream<S, C> {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = self.get_mut();

        if !this.mode.throttles_write() {
            return Pin::new(&mut this.stream).poll_write(ctx, buf);
        }

        ready!(this.write_pacer.poll_settle(&this.consumer, ctx))?;

        let limit = buf.len().min(chunk_limit(this.consumer.capacity()));
        let count = ready!(Pin::new(&mut this.stream).poll_write(ctx, &buf[..limit]))?;
        this.write_pacer.debt = count as u64;

        Poll::Ready(Ok(count))
    }

    fn poll_flush(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        ready!(this.write_pacer.poll_settle(&this.consumer, ctx))?;
        Pin::new(&mut this.stream).poll_flush(ctx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        ready!(this.write_pacer.poll_settle(&this.consumer, ctx))?;
        Pin::new(&mut this.stream).poll_shutdown(ctx)
    }
}

impl<S: AsyncRead + Unpin, C: TokenConsumer + Unpin> AsyncRead for RateLimitedStream<S, C> {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();

        if !this.mode.throttles_read() {
            return Pin::new(&mut this.stream).poll_read(ctx, buf);
        }

        ready!(this.read_pacer.poll_settle(&this.consumer, ctx))?;

        let limit = chunk_limit(this.consumer.capacity());
        let count = if buf.remaining() <= limit {
            let before = buf.filled().len();
            ready!(Pin::new(&mut this.stream).poll_read(ctx, buf))?;
            buf.filled().len().saturating_sub(before)
        } else {
            // read into our own buffer so the caller's is never overfilled
            this.read_buffer.resize(limit, 0);
            let mut limited = ReadBuf::new(&mut this.read_buffer);
            ready!(Pin::new(&mut this.stream).poll_read(ctx, &mut limited))?;
            buf.put_slice(limited.filled());
            limited.filled().len()
        };
        this.read_pacer.debt = count as u64;

        Poll::Ready(Ok(()))
    }
}
