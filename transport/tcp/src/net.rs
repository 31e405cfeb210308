//! Non-blocking TCP streams watched by the [AsyncIO] reactor.
//!
//! Reader and writer halves share one registered socket through an `Arc`, a read and a write
//! may wait on it at the same time.

use nrpc_core::error::RpcIntErr;
use nrpc_core::io::{AsyncListener, AsyncRead, AsyncWrite};
use nrpc_core::runtime::{AsyncIO, Interest, Watched};
use nrpc_core::{ClientConfig, ServerConfig};
use nrpc_stream::client::ClientTransport;
use nrpc_stream::server::ServerTransport;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::{fmt, io};

/// Parse `ip:port`, or resolve `host:port` taking the first address.
pub fn resolve_addr(addr: &str) -> io::Result<SocketAddr> {
    if let Ok(a) = addr.parse::<SocketAddr>() {
        return Ok(a);
    }
    match addr.to_socket_addrs()?.next() {
        Some(a) => Ok(a),
        None => Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("addr {:?} resolved to nothing", addr),
        )),
    }
}

struct TcpConn<IO: AsyncIO> {
    fd: Arc<IO::Socket<TcpStream>>,
    local: String,
    peer: String,
}

impl<IO: AsyncIO> TcpConn<IO> {
    fn new(fd: IO::Socket<TcpStream>) -> Self {
        let local = fd.local_addr().map(|a| a.to_string()).unwrap_or_default();
        let peer = fd.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        Self { fd: Arc::new(fd), local, peer }
    }

    fn split(self) -> (TcpReader<IO>, TcpWriter<IO>) {
        let tag = format!("{}->{}", self.local, self.peer);
        (
            TcpReader { fd: self.fd.clone(), tag: tag.clone() },
            TcpWriter { fd: self.fd, tag },
        )
    }
}

impl<IO: AsyncIO> fmt::Debug for TcpConn<IO> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}->{}", self.local, self.peer)
    }
}

/// Read half of a tcp connection
pub struct TcpReader<IO: AsyncIO> {
    fd: Arc<IO::Socket<TcpStream>>,
    tag: String,
}

impl<IO: AsyncIO> AsyncRead for TcpReader<IO> {
    #[inline]
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.fd.read_with(|mut stream| stream.read(buf)).await
    }
}

impl<IO: AsyncIO> fmt::Debug for TcpReader<IO> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "reader {}", self.tag)
    }
}

/// Write half of a tcp connection
pub struct TcpWriter<IO: AsyncIO> {
    fd: Arc<IO::Socket<TcpStream>>,
    tag: String,
}

impl<IO: AsyncIO> TcpWriter<IO> {
    /// Peer still reads until it sees EOF
    async fn shutdown(&mut self) -> io::Result<()> {
        self.fd.write_with(|stream| stream.shutdown(Shutdown::Write)).await
    }
}

impl<IO: AsyncIO> AsyncWrite for TcpWriter<IO> {
    #[inline]
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.fd.write_with(|mut stream| stream.write(buf)).await
    }
}

impl<IO: AsyncIO> fmt::Debug for TcpWriter<IO> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "writer {}", self.tag)
    }
}

/// Client side tcp connection
pub struct TcpClient<IO: AsyncIO>(TcpConn<IO>);

impl<IO: AsyncIO> fmt::Debug for TcpClient<IO> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tcp client {:?}", self.0)
    }
}

impl<IO: AsyncIO> ClientTransport<IO> for TcpClient<IO> {
    type Reader = TcpReader<IO>;
    type Writer = TcpWriter<IO>;

    async fn connect(addr: &str, config: &ClientConfig) -> Result<Self, RpcIntErr> {
        let sock_addr = match resolve_addr(addr) {
            Ok(a) => a,
            Err(e) => {
                error!("cannot parse addr {}: {}", addr, e);
                return Err(RpcIntErr::Unreachable);
            }
        };
        match IO::connect_tcp(&sock_addr, config.connect_timeout).await {
            Ok(fd) => {
                if let Err(e) = fd.set_nodelay(true) {
                    debug!("set_nodelay on {} err: {}", addr, e);
                }
                Ok(Self(TcpConn::new(fd)))
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                warn!("connect {} timeout", addr);
                Err(RpcIntErr::Timeout)
            }
            Err(e) => {
                warn!("cannot connect addr {}: {}", addr, e);
                Err(RpcIntErr::Unreachable)
            }
        }
    }

    #[inline]
    fn local_addr(&self) -> String {
        self.0.local.clone()
    }

    #[inline]
    fn peer_addr(&self) -> String {
        self.0.peer.clone()
    }

    #[inline]
    fn split(self) -> (TcpReader<IO>, TcpWriter<IO>) {
        self.0.split()
    }

    #[inline]
    async fn shutdown_write(writer: &mut TcpWriter<IO>) -> io::Result<()> {
        writer.shutdown().await
    }
}

/// Server side tcp connection, one per accepted stream
pub struct TcpServer<IO: AsyncIO>(TcpConn<IO>);

impl<IO: AsyncIO> fmt::Debug for TcpServer<IO> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tcp server conn {:?}", self.0)
    }
}

impl<IO: AsyncIO> ServerTransport<IO> for TcpServer<IO> {
    type Listener = TcpListener<IO>;
    type Reader = TcpReader<IO>;
    type Writer = TcpWriter<IO>;

    fn new_conn(stream: IO::Socket<TcpStream>, _config: &ServerConfig) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self(TcpConn::new(stream)))
    }

    #[inline]
    fn peer_addr(&self) -> String {
        self.0.peer.clone()
    }

    #[inline]
    fn split(self) -> (TcpReader<IO>, TcpWriter<IO>) {
        self.0.split()
    }

    #[inline]
    async fn shutdown_write(writer: &mut TcpWriter<IO>) -> io::Result<()> {
        writer.shutdown().await
    }
}

/// Non-blocking tcp listener
pub struct TcpListener<IO: AsyncIO>(IO::Socket<std::net::TcpListener>);

impl<IO: AsyncIO> AsyncListener for TcpListener<IO> {
    type Conn = IO::Socket<TcpStream>;

    fn bind(addr: &str) -> io::Result<Self> {
        let sock_addr = resolve_addr(addr).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("addr {:?} invalid: {}", addr, e))
        })?;
        let l = std::net::TcpListener::bind(sock_addr)?;
        l.set_nonblocking(true)?;
        Ok(Self(IO::watch(l, Interest::Read)?))
    }

    async fn accept(&mut self) -> io::Result<(IO::Socket<TcpStream>, SocketAddr)> {
        let (stream, peer) = self.0.read_with(|l| l.accept()).await?;
        stream.set_nonblocking(true)?;
        Ok((IO::watch(stream, Interest::ReadWrite)?, peer))
    }

    #[inline]
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }
}

impl<IO: AsyncIO> fmt::Debug for TcpListener<IO> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0.local_addr() {
            Ok(addr) => write!(f, "listener {}", addr),
            Err(_) => write!(f, "tcp listener unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_addr() {
        let a = resolve_addr("127.0.0.1:18555").expect("parse");
        assert_eq!(a.port(), 18555);
        assert!(a.ip().is_loopback());
        let a = resolve_addr("localhost:18556").expect("resolve");
        assert_eq!(a.port(), 18556);
        assert!(resolve_addr("127.0.0.1").is_err());
        assert!(resolve_addr("no port here").is_err());
    }
}
