//! The module contains traits and types of the client-side
//!
//! [RpcClient] owns one connection ([stream::ClientStream]) at a time and offers the call styles:
//!
//! - async [RpcClient::call] and blocking [RpcClient::call_blocking]
//! - streaming [RpcClient::streaming], with chunk callbacks run on a [ChunkExecutor]
//! - lazy [ChunkedCompletion], the request goes out on first await
//! - fire-and-forget [RpcClient::notify]
//!
//! [ProxyInstance] wraps the client for one service interface.

pub use nrpc_core::ClientConfig;

mod call;
pub use call::RpcClient;
mod chunk;
pub use chunk::{
    CallbackResult, ChunkCallback, ChunkExecutor, ChunkedCompletion, CompleteCallback,
    StreamRequest, StreamingCall,
};
pub(crate) use chunk::StreamState;
pub mod heartbeat;
mod proxy;
pub use proxy::ProxyInstance;
pub mod slot;
pub mod stream;
pub mod table;

use captains_log::filter::LogFilter;
use nrpc_core::{
    Codec,
    error::RpcIntErr,
    io::{AsyncRead, AsyncWrite},
    runtime::AsyncIO,
};
use std::future::Future;
use std::sync::Arc;
use std::{fmt, io};

/// A trait implemented by the user for the client-side, to define the customizable plugin.
///
/// [ClientDefault] covers the common case.
pub trait ClientFacts: Send + Sync + Sized + 'static {
    /// Define the adaptor of async runtime
    type IO: AsyncIO;

    /// Payload codec, also used as the [DataCodec](crate::data::DataCodec)
    type Codec: Codec;

    /// You should keep ClientConfig inside, get_config() will return the reference.
    fn get_config(&self) -> &ClientConfig;

    /// Construct a [captains_log::filter::LogFilter] to oganize log of a client
    fn new_logger(&self) -> Arc<LogFilter>;

    /// Define how the async runtime spawn a task
    fn spawn_detach<F, R>(&self, f: F)
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static;
}

/// This trait is for client-side transport layer protocol.
///
/// The implementation can be found on `nrpc-tcp`.
///
/// NOTE: we use IO in generic param instead of ClientFacts to break cycle dep.
pub trait ClientTransport<IO: AsyncIO>: fmt::Debug + Send + Sized + 'static {
    type Reader: AsyncRead + fmt::Debug + 'static;
    type Writer: AsyncWrite + fmt::Debug + 'static;

    /// How to establish an async connection, bounded by `config.connect_timeout`.
    fn connect(
        addr: &str, config: &ClientConfig,
    ) -> impl Future<Output = Result<Self, RpcIntErr>> + Send;

    fn local_addr(&self) -> String;

    fn peer_addr(&self) -> String;

    /// Split into halves owned by the reader and writer coroutines
    fn split(self) -> (Self::Reader, Self::Writer);

    /// Shutdown the write direction of the connection
    fn shutdown_write(writer: &mut Self::Writer) -> impl Future<Output = io::Result<()>> + Send;
}

/// An example ClientFacts for general use
pub struct ClientDefault<IO: AsyncIO, C: Codec> {
    pub logger: Arc<LogFilter>,
    config: ClientConfig,
    rt: IO,
    _phan: std::marker::PhantomData<fn(&C)>,
}

impl<IO: AsyncIO, C: Codec> ClientDefault<IO, C> {
    pub fn new(config: ClientConfig, rt: IO) -> Arc<Self> {
        Arc::new(Self { logger: Arc::new(LogFilter::new()), config, rt, _phan: Default::default() })
    }

    #[inline]
    pub fn set_log_level(&self, level: log::Level) {
        self.logger.set_level(level);
    }
}

impl<IO: AsyncIO, C: Codec> std::ops::Deref for ClientDefault<IO, C> {
    type Target = IO;
    fn deref(&self) -> &Self::Target {
        &self.rt
    }
}

impl<IO: AsyncIO, C: Codec> ClientFacts for ClientDefault<IO, C> {
    type IO = IO;
    type Codec = C;

    #[inline]
    fn new_logger(&self) -> Arc<LogFilter> {
        self.logger.clone()
    }

    #[inline]
    fn get_config(&self) -> &ClientConfig {
        &self.config
    }

    #[inline]
    fn spawn_detach<F, R>(&self, f: F)
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        self.rt.spawn_detach(f);
    }
}
