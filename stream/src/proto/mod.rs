//! NRPC wire protocol: the packet model and its binary framing.

mod codec;
pub use codec::*;
mod packet;
pub use packet::*;
