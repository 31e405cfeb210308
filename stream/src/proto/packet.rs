use std::fmt;
use std::ops::{Deref, DerefMut};

/// Wire value of the `packet-type` byte
pub mod packet_type {
    /// Generic probe packet, answered with a bare PONG
    pub const PING: u8 = 0;
    pub const CLIENT_REQUEST: u8 = 1;
    pub const RESPONSE_LAST: u8 = 2;
    pub const RESPONSE_CHUNK: u8 = 5;
    pub const RESPONSE_CHUNK_ACK: u8 = 6;
}

/// Response status codes
pub mod status {
    pub const OK: u16 = 200;
    pub const NO_CONTENT: u16 = 204;
    pub const NO_SUCH_METHOD: u16 = 404;
    pub const NO_SUCH_SERVICE: u16 = 406;
    pub const SERVER_ERROR: u16 = 500;

    #[inline]
    pub fn is_error(status: u16) -> bool {
        status >= 400
    }
}

/// Tags whether response data needs a decode step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Encode {
    /// Raw bytes, passed through untouched
    #[default]
    Binary = 0,
    /// Serialized by the DataCodec
    Json = 1,
}

impl Encode {
    /// Unknown values are treated as binary.
    #[inline]
    pub fn from_u8(v: u8) -> Self {
        if v == Encode::Json as u8 { Encode::Json } else { Encode::Binary }
    }
}

#[derive(Clone, PartialEq, Eq, Default)]
pub struct RequestPacket {
    pub request_id: i32,
    pub ack: bool,
    pub service_name: String,
    pub method_name: String,
    /// Kept for diagnostics, not part of the frame
    pub version: Option<String>,
    pub data: Vec<u8>,
}

impl RequestPacket {
    #[inline]
    pub fn new(service_name: &str, method_name: &str, data: Vec<u8>) -> Self {
        Self {
            request_id: 0,
            ack: true,
            service_name: service_name.to_string(),
            method_name: method_name.to_string(),
            version: None,
            data,
        }
    }

    /// "service.method", used in logs and timeout messages
    #[inline]
    pub fn describe(&self) -> String {
        format!("{}.{}", self.service_name, self.method_name)
    }
}

impl fmt::Debug for RequestPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "req(id={} {}.{} ack={} data={}B)",
            self.request_id,
            self.service_name,
            self.method_name,
            self.ack,
            self.data.len()
        )
    }
}

/// Longest response message a frame can carry, in bytes
pub const MAX_MESSAGE_LEN: usize = u8::MAX as usize;

/// Cut `msg` down to [MAX_MESSAGE_LEN] bytes on a char boundary.
pub fn clamp_message(mut msg: String) -> String {
    if msg.len() > MAX_MESSAGE_LEN {
        let mut end = MAX_MESSAGE_LEN;
        while !msg.is_char_boundary(end) {
            end -= 1;
        }
        msg.truncate(end);
    }
    msg
}

#[derive(Clone, PartialEq, Eq, Default)]
pub struct ResponsePacket {
    pub request_id: i32,
    pub ack: bool,
    pub status: u16,
    pub message: String,
    pub encode: Encode,
    pub data: Vec<u8>,
}

impl ResponsePacket {
    /// `message` is clamped to [MAX_MESSAGE_LEN].
    #[inline]
    pub fn new(request_id: i32, status: u16, message: impl Into<String>) -> Self {
        Self {
            request_id,
            ack: false,
            status,
            message: clamp_message(message.into()),
            encode: Encode::Binary,
            data: Vec::new(),
        }
    }

    #[inline]
    pub fn ok(request_id: i32, encode: Encode, data: Vec<u8>) -> Self {
        Self { request_id, ack: false, status: status::OK, message: "ok".to_string(), encode, data }
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        status::is_error(self.status)
    }
}

impl fmt::Debug for ResponsePacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "resp(id={} status={} msg={:?} {:?} data={}B)",
            self.request_id,
            self.status,
            self.message,
            self.encode,
            self.data.len()
        )
    }
}

/// One part of a streamed response, precedes the terminal response of the same request.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct ResponseChunkPacket {
    pub resp: ResponsePacket,
    pub chunk_id: i32,
}

impl Deref for ResponseChunkPacket {
    type Target = ResponsePacket;

    #[inline(always)]
    fn deref(&self) -> &ResponsePacket {
        &self.resp
    }
}

impl DerefMut for ResponseChunkPacket {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut ResponsePacket {
        &mut self.resp
    }
}

#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct ResponseChunkAckPacket {
    pub resp: ResponsePacket,
    pub ack_chunk_id: i32,
}

impl ResponseChunkAckPacket {
    #[inline]
    pub fn new(request_id: i32, ack_chunk_id: i32) -> Self {
        Self { resp: ResponsePacket::new(request_id, status::OK, ""), ack_chunk_id }
    }
}

impl Deref for ResponseChunkAckPacket {
    type Target = ResponsePacket;

    #[inline(always)]
    fn deref(&self) -> &ResponsePacket {
        &self.resp
    }
}

/// Any packet type we don't model, including ping/pong probes.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct GenericPacket {
    pub packet_type: u8,
    pub ack: bool,
    pub data: Vec<u8>,
}

impl GenericPacket {
    #[inline]
    pub fn ping() -> Self {
        Self { packet_type: packet_type::PING, ack: true, data: Vec::new() }
    }

    #[inline]
    pub fn pong() -> Self {
        Self { packet_type: packet_type::PING, ack: false, data: Vec::new() }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Packet {
    Request(RequestPacket),
    ResponseLast(ResponsePacket),
    Chunk(ResponseChunkPacket),
    ChunkAck(ResponseChunkAckPacket),
    Generic(GenericPacket),
}

impl Packet {
    #[inline]
    pub fn packet_type(&self) -> u8 {
        match self {
            Self::Request(_) => packet_type::CLIENT_REQUEST,
            Self::ResponseLast(_) => packet_type::RESPONSE_LAST,
            Self::Chunk(_) => packet_type::RESPONSE_CHUNK,
            Self::ChunkAck(_) => packet_type::RESPONSE_CHUNK_ACK,
            Self::Generic(p) => p.packet_type,
        }
    }

    #[inline]
    pub fn ack(&self) -> bool {
        match self {
            Self::Request(p) => p.ack,
            Self::ResponseLast(p) => p.ack,
            Self::Chunk(p) => p.ack,
            Self::ChunkAck(p) => p.ack,
            Self::Generic(p) => p.ack,
        }
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        match self {
            Self::Request(p) => &p.data,
            Self::ResponseLast(p) => &p.data,
            Self::Chunk(p) => &p.data,
            Self::ChunkAck(p) => &p.data,
            Self::Generic(p) => &p.data,
        }
    }

    /// Request id, None for generic packets
    #[inline]
    pub fn request_id(&self) -> Option<i32> {
        match self {
            Self::Request(p) => Some(p.request_id),
            Self::ResponseLast(p) => Some(p.request_id),
            Self::Chunk(p) => Some(p.request_id),
            Self::ChunkAck(p) => Some(p.request_id),
            Self::Generic(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_message() {
        assert_eq!(clamp_message("short".to_string()), "short");
        let resp = ResponsePacket::new(1, status::SERVER_ERROR, "x".repeat(300));
        assert_eq!(resp.message.len(), MAX_MESSAGE_LEN);
        // 3-byte chars, 255 is a boundary, 256 is not
        let msg = clamp_message("中".repeat(100));
        assert_eq!(msg.len(), 255);
        let msg = clamp_message(format!("a{}", "中".repeat(100)));
        assert_eq!(msg.len(), 253);
        assert!(msg.ends_with('中'));
    }
}
