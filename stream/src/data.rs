//! Payload conversion between call arguments / return values and packet data.

use crate::proto::{Encode, ResponsePacket};
use crate::registry::{RpcMethod, ServiceError};
use nrpc_core::{Codec, error::RpcError};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

/// Return value of a remote method.
///
/// `Bytes` travels as-is with encode=BINARY, `Value` is serialized by the [DataCodec].
#[derive(Debug, Clone, PartialEq)]
pub enum RpcValue {
    Bytes(Vec<u8>),
    Value(Value),
}

impl RpcValue {
    #[inline]
    pub fn null() -> Self {
        Self::Value(Value::Null)
    }

    #[inline]
    pub fn from_serialize<T: Serialize>(v: &T) -> Result<Self, ServiceError> {
        Ok(Self::Value(serde_json::to_value(v)?))
    }

    /// Convert into a typed value, raw bytes read as an array of numbers.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        let v = match self {
            Self::Value(v) => v,
            Self::Bytes(b) => Value::from(b),
        };
        serde_json::from_value(v).map_err(|e| RpcError::Decode(e.to_string()))
    }

    #[inline]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        if let Self::Bytes(b) = self { Some(b) } else { None }
    }

    #[inline]
    pub fn as_value(&self) -> Option<&Value> {
        if let Self::Value(v) = self { Some(v) } else { None }
    }
}

impl From<Value> for RpcValue {
    #[inline]
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

impl From<Vec<u8>> for RpcValue {
    #[inline]
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<String> for RpcValue {
    #[inline]
    fn from(s: String) -> Self {
        Self::Value(Value::String(s))
    }
}

impl From<&str> for RpcValue {
    #[inline]
    fn from(s: &str) -> Self {
        Self::Value(Value::String(s.to_string()))
    }
}

/// Encoding of request arguments and response values.
///
/// Request arguments go out as a parameter-name -> value map.
pub trait DataCodec: Send + Sync + 'static {
    fn encode_request_data(&self, args: &[Value], method: &RpcMethod) -> Result<Vec<u8>, RpcError>;

    /// Decoded arguments in declared parameter order, missing ones are null.
    fn decode_request_data(
        &self, data: &[u8], method: &RpcMethod,
    ) -> Result<Vec<Value>, ServiceError>;

    fn encode_response_data(&self, value: &Value) -> Result<Vec<u8>, ServiceError>;

    fn decode_response_data(&self, data: &[u8]) -> Result<Value, RpcError>;

    /// Turn a successful return value into a 200 response.
    fn build_response(
        &self, request_id: i32, value: RpcValue,
    ) -> Result<ResponsePacket, ServiceError> {
        match value {
            RpcValue::Bytes(b) => Ok(ResponsePacket::ok(request_id, Encode::Binary, b)),
            RpcValue::Value(v) => {
                Ok(ResponsePacket::ok(request_id, Encode::Json, self.encode_response_data(&v)?))
            }
        }
    }

    /// Interpret the payload of a successful response according to its encode tag.
    fn read_response(&self, resp: ResponsePacket) -> Result<RpcValue, RpcError> {
        match resp.encode {
            Encode::Binary => Ok(RpcValue::Bytes(resp.data)),
            Encode::Json if resp.data.is_empty() => Ok(RpcValue::null()),
            Encode::Json => Ok(RpcValue::Value(self.decode_response_data(&resp.data)?)),
        }
    }
}

impl<C: Codec> DataCodec for C {
    fn encode_request_data(&self, args: &[Value], method: &RpcMethod) -> Result<Vec<u8>, RpcError> {
        if args.len() > method.param_names.len() {
            return Err(RpcError::Encode(format!(
                "{} takes {} arguments, got {}",
                method.name,
                method.param_names.len(),
                args.len()
            )));
        }
        let mut map = Map::with_capacity(args.len());
        for (name, v) in method.param_names.iter().zip(args) {
            map.insert(name.clone(), v.clone());
        }
        self.encode(&map).map_err(|_| RpcError::Encode(format!("{} arguments", method.name)))
    }

    fn decode_request_data(
        &self, data: &[u8], method: &RpcMethod,
    ) -> Result<Vec<Value>, ServiceError> {
        let params = &method.param_names;
        if data.is_empty() {
            return Ok(vec![Value::Null; params.len()]);
        }
        let v: Value = self
            .decode(data)
            .map_err(|_| ServiceError(format!("cannot decode arguments of {}", method.name)))?;
        match v {
            Value::Object(mut map) => {
                Ok(params.iter().map(|p| map.remove(p).unwrap_or(Value::Null)).collect())
            }
            Value::Array(mut list) => {
                list.resize(params.len(), Value::Null);
                Ok(list)
            }
            other if params.len() == 1 => Ok(vec![other]),
            _ => Err(ServiceError(format!("arguments of {} must be a map", method.name))),
        }
    }

    #[inline]
    fn encode_response_data(&self, value: &Value) -> Result<Vec<u8>, ServiceError> {
        self.encode(value).map_err(|_| ServiceError::new("cannot encode result"))
    }

    #[inline]
    fn decode_response_data(&self, data: &[u8]) -> Result<Value, RpcError> {
        self.decode(data).map_err(|_| RpcError::Decode(format!("{} response", C::NAME)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nrpc_codec::JsonCodec;
    use serde_json::json;

    #[test]
    fn test_request_args() {
        let codec = JsonCodec::default();
        let m = RpcMethod::declare("put", &["group", "key", "data"]);
        let data =
            codec.encode_request_data(&[json!("g"), json!("k")], &m).expect("encode");
        let v: Value = serde_json::from_slice(&data).expect("json");
        assert_eq!(v, json!({"group": "g", "key": "k"}));
        let args = codec.decode_request_data(&data, &m).expect("decode");
        assert_eq!(args, vec![json!("g"), json!("k"), Value::Null]);

        assert!(codec.encode_request_data(&[json!(1), json!(2), json!(3), json!(4)], &m).is_err());

        // positional form
        let args = codec.decode_request_data(br#"["a"]"#, &m).expect("decode");
        assert_eq!(args.len(), 3);
        assert_eq!(args[0], json!("a"));
        assert_eq!(codec.decode_request_data(b"", &m).expect("decode"), vec![Value::Null; 3]);
        assert!(codec.decode_request_data(b"42", &m).is_err());
        assert!(codec.decode_request_data(b"{", &m).is_err());
    }

    #[test]
    fn test_response() {
        let codec = JsonCodec::default();
        let resp = codec.build_response(5, RpcValue::from("hi! world")).expect("build");
        assert_eq!(resp.encode, Encode::Json);
        assert_eq!(resp.status, 200);
        assert_eq!(resp.message, "ok");
        let v = codec.read_response(resp).expect("read");
        assert_eq!(v.decode::<String>().expect("string"), "hi! world");

        let resp = codec.build_response(5, RpcValue::Bytes(b"pong".to_vec())).expect("build");
        assert_eq!(resp.encode, Encode::Binary);
        assert_eq!(resp.data, b"pong");
        let v = codec.read_response(resp).expect("read");
        assert_eq!(v.as_bytes(), Some(&b"pong"[..]));
        assert_eq!(v.decode::<Vec<u8>>().expect("bytes"), b"pong".to_vec());
    }
}
