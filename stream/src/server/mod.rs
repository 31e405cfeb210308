//! This module contains traits and types of the server-side
//!
//! [RpcServer] accepts connections with a [ServerTransport]. Every connection runs a reader
//! and a writer coroutine, each request is handed to the [ServiceDispatcher] on its own task,
//! and responses go back to the writer through [RespNoti].

pub use nrpc_core::ServerConfig;

pub mod builtin;
mod dispatch;
pub use dispatch::ServiceDispatcher;
mod server;
pub use server::RpcServer;
mod service;
pub use service::{ACK_LINGER_MAX, AckTracker, ChunkProgress, ChunkSender, RpcService, ServiceDef};

use crate::proto::Packet;
use captains_log::filter::LogFilter;
use crossfire::MTx;
use nrpc_core::{
    Codec,
    io::{AsyncListener, AsyncRead, AsyncWrite},
    runtime::AsyncIO,
};
use std::future::Future;
use std::sync::Arc;
use std::{fmt, io};

/// A trait implemented by the user for the server-side, to define the customizable plugin.
pub trait ServerFacts: Sync + Send + 'static + Sized {
    /// Define the adaptor of async runtime
    type IO: AsyncIO;

    /// Payload codec of request arguments and return values
    type Codec: Codec;

    /// You should keep ServerConfig inside ServerFacts, get_config() will return the reference.
    fn get_config(&self) -> &ServerConfig;

    /// Construct a [captains_log::filter::LogFilter] to oganize log of the server
    fn new_logger(&self) -> Arc<LogFilter>;

    /// Define how the async runtime spawn a task
    ///
    /// You may spawn with globally runtime, or to a owned runtime executor
    fn spawn_detach<F, R>(&self, f: F)
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static;
}

/// This trait is for server-side transport layer protocol.
///
/// The implementation can be found on `nrpc-tcp`.
pub trait ServerTransport<IO: AsyncIO>: Send + Sized + 'static + fmt::Debug {
    type Listener: AsyncListener;
    type Reader: AsyncRead + fmt::Debug + 'static;
    type Writer: AsyncWrite + fmt::Debug + 'static;

    /// Wrap an accepted stream.
    fn new_conn(
        stream: <Self::Listener as AsyncListener>::Conn, config: &ServerConfig,
    ) -> io::Result<Self>;

    fn peer_addr(&self) -> String;

    /// Split into halves owned by the reader and writer coroutines
    fn split(self) -> (Self::Reader, Self::Writer);

    /// Shutdown the write direction of the connection
    fn shutdown_write(writer: &mut Self::Writer) -> impl Future<Output = io::Result<()>> + Send;
}

/// Hands packets to the connection writer.
///
/// The writer exits once every clone is dropped.
#[derive(Clone)]
pub struct RespNoti(pub(crate) MTx<Packet>);

impl RespNoti {
    #[inline]
    pub fn new(tx: MTx<Packet>) -> Self {
        Self(tx)
    }

    /// Err when the writer has exited.
    #[inline]
    pub fn send(&self, packet: Packet) -> Result<(), ()> {
        self.0.send(packet).map_err(|_| ())
    }
}

impl fmt::Debug for RespNoti {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RespNoti")
    }
}

/// An example ServerFacts for general use
pub struct ServerDefault<IO: AsyncIO, C: Codec> {
    pub logger: Arc<LogFilter>,
    config: ServerConfig,
    rt: IO,
    _phan: std::marker::PhantomData<fn(&C)>,
}

impl<IO: AsyncIO, C: Codec> ServerDefault<IO, C> {
    pub fn new(config: ServerConfig, rt: IO) -> Arc<Self> {
        Arc::new(Self { logger: Arc::new(LogFilter::new()), config, rt, _phan: Default::default() })
    }

    #[inline]
    pub fn set_log_level(&self, level: log::Level) {
        self.logger.set_level(level);
    }
}

impl<IO: AsyncIO, C: Codec> std::ops::Deref for ServerDefault<IO, C> {
    type Target = IO;
    fn deref(&self) -> &Self::Target {
        &self.rt
    }
}

impl<IO: AsyncIO, C: Codec> ServerFacts for ServerDefault<IO, C> {
    type IO = IO;
    type Codec = C;

    #[inline]
    fn get_config(&self) -> &ServerConfig {
        &self.config
    }

    #[inline]
    fn new_logger(&self) -> Arc<LogFilter> {
        self.logger.clone()
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
