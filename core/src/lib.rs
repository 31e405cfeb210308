//! # nrpc-core
//!
//! Common types and traits shared by the nrpc crates: configuration, error types, the payload
//! [Codec] interface, the async runtime abstraction and a small object recycler.

mod codec;
pub use codec::Codec;
mod config;
pub use config::*;
pub mod error;
pub mod io;
pub mod pool;
pub mod runtime;
