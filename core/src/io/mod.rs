//! Connection I/O: the read/write traits a transport implements, frame buffering on top of
//! them, and timeout helpers.

use crate::runtime::AsyncIO;
use pin_project_lite::pin_project;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use std::{fmt, io};

mod buf_io;
pub use buf_io::{AsyncRead, AsyncWrite, DEFAULT_BUF_SIZE, FrameReader, FrameWriter};

pin_project! {
    /// Race `future` against `cancel`, resolving to `Err(())` when `cancel` wins.
    ///
    /// `cancel` is usually a timer or the recv of a close channel.
    pub struct Cancellable<F, C> {
        #[pin]
        future: F,
        #[pin]
        cancel: C,
    }
}

impl<F: Future, C: Future> Cancellable<F, C> {
    #[inline]
    pub fn new(future: F, cancel: C) -> Self {
        Self { future, cancel }
    }
}

impl<F: Future, C: Future> Future for Cancellable<F, C> {
    type Output = Result<F::Output, ()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(v) = this.future.poll(cx) {
            return Poll::Ready(Ok(v));
        }
        this.cancel.poll(cx).map(|_| Err(()))
    }
}

/// Wait at most `d` for `f`. A zero `d` waits forever.
#[inline]
pub async fn with_timeout<IO: AsyncIO, T>(
    d: Duration, f: impl Future<Output = T> + Send,
) -> Result<T, ()> {
    if d.is_zero() { Ok(f.await) } else { IO::timeout(d, f).await }
}

/// [with_timeout] for I/O, running out of time is `TimedOut`.
#[inline]
pub async fn io_timeout<IO: AsyncIO, T>(
    d: Duration, f: impl Future<Output = io::Result<T>> + Send,
) -> io::Result<T> {
    match with_timeout::<IO, _>(d, f).await {
        Ok(r) => r,
        Err(()) => Err(io::ErrorKind::TimedOut.into()),
    }
}

/// Accept side of a transport.
pub trait AsyncListener: fmt::Debug + Send + Sized + 'static {
    /// An accepted stream, turned into a connection by the server transport
    type Conn: Send + 'static;

    fn bind(addr: &str) -> io::Result<Self>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Conn, SocketAddr)>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::future::{pending, ready};

    #[test]
    fn test_cancellable() {
        assert_eq!(block_on(Cancellable::new(ready(1), pending::<()>())), Ok(1));
        assert_eq!(block_on(Cancellable::new(pending::<i32>(), ready(()))), Err(()));
        // both ready, the future wins
        assert_eq!(block_on(Cancellable::new(ready(2), ready(()))), Ok(2));
    }
}
