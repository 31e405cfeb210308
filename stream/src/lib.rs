#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! # nrpc-stream
//!
//! The NRPC protocol engine: wire framing, client-side correlation and streaming, server-side
//! service dispatch.
//!
//! ## Components
//!
//! - [`nrpc`]: facade crate with default type aliases.
//! - [`nrpc-codec`]: payload codecs, json by default, `msgpack` as a feature.
//! - [`nrpc-tokio`]: runtime adapter for `tokio`.
//! - [`nrpc-tcp`]: TCP transport.
//!
//! ## Modules
//!
//! - [proto]: packets and the [proto::WireCodec]
//! - [client]: [client::RpcClient], streaming calls and the heartbeat scheduler
//! - [server]: [server::RpcServer] and the [server::ServiceDispatcher]
//! - [registry]: method metadata shared by both sides
//! - [data]: payload conversion with [data::DataCodec]
//! - [context]: per-call state and observers

#[macro_use]
extern crate captains_log;

pub mod client;
pub mod context;
pub mod data;
pub mod proto;
pub mod registry;
pub mod server;
pub use nrpc_core::error;
pub use nrpc_core::{ClientConfig, ServerConfig};
