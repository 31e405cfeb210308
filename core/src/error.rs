use std::fmt;
use std::io;
use std::time::Duration;

pub const RPC_ERR_PREFIX: &'static str = "rpc_";

/// "rpc_" prefix is reserved for internal error
///
/// NOTE Retriable error: RpcIntErr as u8 < RpcIntErr::Method
#[derive(
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    PartialEq,
    PartialOrd,
    Clone,
    Copy,
    thiserror::Error,
)]
#[repr(u8)]
pub enum RpcIntErr {
    /// Ping or connect error
    #[strum(serialize = "rpc_unreachable")]
    Unreachable = 0,
    /// IO error
    #[strum(serialize = "rpc_io_err")]
    IO = 1,
    /// Call timeout
    #[strum(serialize = "rpc_timeout")]
    Timeout = 2,
    /// Method not found
    #[strum(serialize = "rpc_method_notfound")]
    Method = 3,
    /// service notfound
    #[strum(serialize = "rpc_service_notfound")]
    Service = 4,
    /// Encode Error
    #[strum(serialize = "rpc_encode")]
    Encode = 5,
    /// Decode Error
    #[strum(serialize = "rpc_decode")]
    Decode = 6,
    /// Internal error
    #[strum(serialize = "rpc_internal_err")]
    Internal = 7,
    /// The caller gave up on the call
    #[strum(serialize = "rpc_cancelled")]
    Cancelled = 8,
}

// The default Debug derive just ignore strum customized string, by strum only have a Display derive
impl fmt::Debug for RpcIntErr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<io::Error> for RpcIntErr {
    #[inline(always)]
    fn from(_e: io::Error) -> Self {
        Self::IO
    }
}

/// Malformed or oversized frame on the wire.
///
/// Any of these is fatal for the connection it was read from.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("bad magic {0:?}")]
    BadMagic(Vec<u8>),
    #[error("header length {0} too short")]
    HeaderTooShort(usize),
    #[error("frame length {len} exceeds limit {max}")]
    TooLarge { len: usize, max: usize },
    #[error("truncated {field}: need {need} bytes, {left} left")]
    Truncated { field: &'static str, need: usize, left: usize },
    #[error("{field} length {len} exceeds 255")]
    FieldTooLong { field: &'static str, len: usize },
    #[error("{field} is not valid utf-8")]
    InvalidUtf8 { field: &'static str },
    #[error("{0} trailing bytes after packet body")]
    Trailing(usize),
    #[error("status {0} out of range")]
    BadStatus(u32),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// True when the peer simply went away rather than sending garbage.
    #[inline]
    pub fn is_eof(&self) -> bool {
        if let Self::Io(e) = self {
            return e.kind() == io::ErrorKind::UnexpectedEof;
        }
        false
    }
}

/// Error returned to the caller of a remote call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// Malformed frame or payload on the connection.
    #[error("framing: {0}")]
    Framing(String),
    /// No active connection, or the connection was lost before the response.
    #[error("connect: {0}")]
    Connect(String),
    /// Writing the request failed.
    #[error("write: {0}")]
    Write(String),
    #[error("timeout after {elapsed:?}: {request}")]
    Timeout { elapsed: Duration, request: String },
    /// The server answered with a status other than 200/204.
    #[error("status {status}: {message}")]
    Response { status: u16, message: String },
    #[error("decode: {0}")]
    Decode(String),
    #[error("encode: {0}")]
    Encode(String),
    #[error("{0}")]
    Rpc(RpcIntErr),
}

impl RpcError {
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Rpc(RpcIntErr::Timeout))
    }

    /// Connection-level failures, after which the channel should be rebuilt.
    #[inline]
    pub fn is_connect(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Write(_) | Self::Framing(_) | Self::Rpc(RpcIntErr::Unreachable)
        )
    }

    #[inline]
    pub fn status(&self) -> Option<u16> {
        if let Self::Response { status, .. } = self { Some(*status) } else { None }
    }
}

impl From<RpcIntErr> for RpcError {
    #[inline]
    fn from(e: RpcIntErr) -> Self {
        Self::Rpc(e)
    }
}

impl From<FrameError> for RpcError {
    #[inline]
    fn from(e: FrameError) -> Self {
        Self::Framing(e.to_string())
    }
}

impl PartialEq<RpcIntErr> for RpcError {
    #[inline]
    fn eq(&self, other: &RpcIntErr) -> bool {
        if let Self::Rpc(r) = self {
            return r == other;
        }
        false
    }
}

/// Rejected service or interface definition, reported when building a method registry.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("interface {0} declares no methods")]
    NoMethods(String),
    #[error("interface {interface} has duplicate method name {name}")]
    DuplicateMethod { interface: String, name: String },
    #[error("name {0:?} is empty or longer than 255 bytes")]
    InvalidName(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_internal_error() {
        println!("{}", RpcIntErr::Internal);
        println!("{:?}", RpcIntErr::Internal);
        let s = RpcIntErr::Timeout.as_ref();
        let e = RpcIntErr::from_str(s).expect("parse");
        assert_eq!(e, RpcIntErr::Timeout);
        assert!(RpcIntErr::from_str("timeoutss").is_err());
        assert!(RpcIntErr::Timeout < RpcIntErr::Method);
        assert!(RpcIntErr::IO < RpcIntErr::Method);
        assert!(RpcIntErr::Unreachable < RpcIntErr::Method);
        assert!(RpcIntErr::Cancelled.as_ref().starts_with(RPC_ERR_PREFIX));
    }

    #[test]
    fn test_rpc_error_kind() {
        let e = RpcError::Timeout {
            elapsed: Duration::from_millis(100),
            request: "/helloService.sayHello".to_string(),
        };
        assert!(e.is_timeout());
        assert!(!e.is_connect());
        println!("err {:?} {}", e, e);

        let e: RpcError = FrameError::BadMagic(b"HTTP".to_vec()).into();
        assert!(e.is_connect());

        let e = RpcError::Response { status: 404, message: "no such method".to_string() };
        assert_eq!(e.status(), Some(404));
        assert_eq!(e.to_string(), "status 404: no such method");

        let e: RpcError = RpcIntErr::Cancelled.into();
        assert!(e == RpcIntErr::Cancelled);
    }

    #[test]
    fn test_frame_error_eof() {
        let e = FrameError::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(e.is_eof());
        assert!(!FrameError::Trailing(1).is_eof());
    }
}
