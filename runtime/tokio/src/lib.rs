#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! # nrpc-tokio
//!
//! Runs nrpc on tokio. [TokioRT] is the [AsyncIO] to plug into client and server facts,
//! [ClientDefault] and [ServerDefault] are the facts already bound to it.
//!
//! ```ignore
//! let facts = nrpc_tokio::client_facts::<JsonCodec>(ClientConfig::default());
//! let client = RpcClient::<_, TcpClient<TokioRT>>::new(facts, "127.0.0.1:9000");
//! ```

use nrpc_core::Codec;
use nrpc_core::io::io_timeout;
use nrpc_core::runtime::{AsyncIO, Interest, RawSocket, Ticker, Watched};
use nrpc_core::{ClientConfig, ServerConfig};
use std::future::Future;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::unix::AsyncFd;
use tokio::runtime::Handle;

/// tokio flavor of [AsyncIO].
///
/// Holds a runtime handle, so background tasks can be spawned from any thread.
#[derive(Clone)]
pub struct TokioRT(Handle);

impl TokioRT {
    #[inline]
    pub fn new(handle: Handle) -> Self {
        Self(handle)
    }

    /// Panics outside of a tokio runtime, like [Handle::current].
    #[inline]
    pub fn current() -> Self {
        Self(Handle::current())
    }
}

impl AsyncIO for TokioRT {
    type Ticker = TokioTicker;

    type Socket<T: RawSocket> = TokioSocket<T>;

    #[inline(always)]
    fn sleep(d: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(d)
    }

    #[inline]
    fn ticker(period: Duration) -> TokioTicker {
        let first = tokio::time::Instant::now() + period;
        TokioTicker(tokio::time::interval_at(first, period))
    }

    async fn connect_tcp(addr: &SocketAddr, timeout: Duration) -> io::Result<TokioSocket<TcpStream>> {
        let stream = io_timeout::<Self, _>(timeout, tokio::net::TcpStream::connect(*addr)).await?;
        // stays non-blocking
        let stream = stream.into_std()?;
        Self::watch(stream, Interest::ReadWrite)
    }

    fn watch<T: RawSocket>(fd: T, interest: Interest) -> io::Result<TokioSocket<T>> {
        use tokio::io::Interest as I;
        let interest = match interest {
            Interest::Read => I::READABLE,
            Interest::ReadWrite => I::READABLE | I::WRITABLE,
        };
        Ok(TokioSocket(AsyncFd::with_interest(fd, interest)?))
    }

    #[inline]
    fn spawn_detach<F, R>(&self, f: F)
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        self.0.spawn(f);
    }
}

pub struct TokioTicker(tokio::time::Interval);

impl Ticker for TokioTicker {
    #[inline]
    fn poll_tick(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Instant> {
        self.get_mut().0.poll_tick(cx).map(|t| t.into_std())
    }
}

/// A socket registered with the tokio reactor
pub struct TokioSocket<T: RawSocket>(AsyncFd<T>);

impl<T: RawSocket> Watched<T> for TokioSocket<T> {
    #[inline]
    async fn read_with<R>(&self, op: impl FnMut(&T) -> io::Result<R> + Send) -> io::Result<R> {
        self.0.async_io(tokio::io::Interest::READABLE, op).await
    }

    #[inline]
    async fn write_with<R>(&self, op: impl FnMut(&T) -> io::Result<R> + Send) -> io::Result<R> {
        self.0.async_io(tokio::io::Interest::WRITABLE, op).await
    }
}

impl<T: RawSocket> Deref for TokioSocket<T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        self.0.get_ref()
    }
}

pub type ClientDefault<C> = nrpc_stream::client::ClientDefault<TokioRT, C>;
pub type ServerDefault<C> = nrpc_stream::server::ServerDefault<TokioRT, C>;

/// Client facts on the current runtime.
#[inline]
pub fn client_facts<C: Codec>(config: ClientConfig) -> Arc<ClientDefault<C>> {
    ClientDefault::<C>::new(config, TokioRT::current())
}

/// Server facts on the current runtime.
#[inline]
pub fn server_facts<C: Codec>(config: ServerConfig) -> Arc<ServerDefault<C>> {
    ServerDefault::<C>::new(config, TokioRT::current())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
    }

    #[test]
    fn test_timer() {
        rt().block_on(async {
            let start = Instant::now();
            TokioRT::sleep(Duration::from_millis(20)).await;
            assert!(start.elapsed() >= Duration::from_millis(20));
            let r = TokioRT::timeout(Duration::from_millis(10), std::future::pending::<()>()).await;
            assert!(r.is_err());
            let r = TokioRT::timeout(Duration::from_millis(100), async { 1 }).await;
            assert_eq!(r, Ok(1));

            let start = Instant::now();
            let mut ticker = TokioRT::ticker(Duration::from_millis(10));
            let t1 = ticker.next_tick().await;
            assert!(t1 >= start + Duration::from_millis(10));
            let t2 = ticker.next_tick().await;
            assert!(t2 > t1);
        });
    }

    #[test]
    fn test_spawn_detach() {
        let rt = rt();
        let io = TokioRT::new(rt.handle().clone());
        let (tx, rx) = std::sync::mpsc::channel();
        io.spawn_detach(async move {
            let _ = tx.send(7);
        });
        rt.block_on(TokioRT::sleep(Duration::from_millis(10)));
        assert_eq!(rx.recv().unwrap(), 7);
    }

    #[test]
    fn test_connect_timeout() {
        rt().block_on(async {
            // nothing listens on a freshly released port
            let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
            let r = TokioRT::connect_tcp(&port, Duration::from_secs(1)).await;
            assert!(r.is_err());
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let sock = TokioRT::connect_tcp(&l.local_addr().unwrap(), Duration::from_secs(1))
                .await
                .expect("connect");
            assert_eq!(sock.peer_addr().unwrap(), l.local_addr().unwrap());
        });
    }
}
