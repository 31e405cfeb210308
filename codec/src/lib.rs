#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! # nrpc-codec
//!
//! This crate provides [nrpc_core::Codec] implementations for the payload of nrpc packets.
//!
//! - [JsonCodec]: the default, payload is a UTF-8 JSON document.
//! - `MsgpCodec`: with feature `msgpack`.

pub use nrpc_core::Codec;
mod json;
pub use json::*;
#[cfg(feature = "msgpack")]
mod msgpack;
#[cfg(feature = "msgpack")]
pub use msgpack::*;
