#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! # nrpc-tcp
//!
//! TCP transport for [`nrpc-stream`](nrpc_stream), used for both client and server.
//!
//! - [TcpClient] implements [ClientTransport](nrpc_stream::client::ClientTransport)
//! - [TcpServer] implements [ServerTransport](nrpc_stream::server::ServerTransport)
//! - [TcpListener] implements [AsyncListener](nrpc_core::io::AsyncListener)

#[macro_use]
extern crate log;
pub mod net;
pub use net::{TcpClient, TcpListener, TcpReader, TcpServer, TcpWriter};
