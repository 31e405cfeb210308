//! Runtime seam.
//!
//! nrpc never names an executor. Timers, readiness of non-blocking sockets and task
//! spawning go through [AsyncIO], `nrpc-tokio` provides the tokio flavor.

use crate::io::Cancellable;
use std::future::Future;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::ops::Deref;
use std::os::fd::{AsFd, AsRawFd};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Anything the reactor can wait on.
pub trait RawSocket: AsRawFd + AsFd + Send + Sync + 'static {}

impl<T: AsRawFd + AsFd + Send + Sync + 'static> RawSocket for T {}

/// Readiness a socket is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Listeners only need to know about incoming connections
    Read,
    ReadWrite,
}

/// A non-blocking socket registered with the reactor.
///
/// `op` runs the plain std call. On `WouldBlock` the runtime parks until the socket is ready
/// again and retries, so `op` may run several times.
pub trait Watched<T: RawSocket>: Deref<Target = T> + Send + Sync + 'static {
    fn read_with<R>(
        &self, op: impl FnMut(&T) -> io::Result<R> + Send,
    ) -> impl Future<Output = io::Result<R>> + Send;

    fn write_with<R>(
        &self, op: impl FnMut(&T) -> io::Result<R> + Send,
    ) -> impl Future<Output = io::Result<R>> + Send;
}

/// What client and server need from an async runtime.
pub trait AsyncIO: Send + Sync + 'static {
    type Ticker: Ticker;

    type Socket<T: RawSocket>: Watched<T>;

    fn sleep(d: Duration) -> impl Future<Output = ()> + Send;

    /// First tick fires one `period` from now.
    fn ticker(period: Duration) -> Self::Ticker;

    /// `Err(())` once `d` passes before `f` completes.
    #[inline]
    fn timeout<F>(d: Duration, f: F) -> impl Future<Output = Result<F::Output, ()>> + Send
    where
        F: Future + Send,
    {
        Cancellable::new(f, Self::sleep(d))
    }

    /// Connect, and hand back the stream set to non-blocking and registered.
    fn connect_tcp(
        addr: &SocketAddr, timeout: Duration,
    ) -> impl Future<Output = io::Result<Self::Socket<TcpStream>>> + Send;

    /// `fd` must already be non-blocking.
    fn watch<T: RawSocket>(fd: T, interest: Interest) -> io::Result<Self::Socket<T>>;

    /// Run `f` in the background. Usable from threads outside the runtime as well.
    fn spawn_detach<F, R>(&self, f: F)
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static;
}

/// Periodic timer
pub trait Ticker: Unpin + Send {
    fn poll_tick(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Instant>;

    #[inline]
    fn next_tick(&mut self) -> impl Future<Output = Instant> + Send
    where
        Self: Sized,
    {
        std::future::poll_fn(move |cx| Pin::new(&mut *self).poll_tick(cx))
    }
}
