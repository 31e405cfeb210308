use crate::Codec;
use serde::{Deserialize, Serialize};

#[derive(Default)]
pub struct JsonCodec();

impl Codec for JsonCodec {
    const NAME: &'static str = "json";

    #[inline(always)]
    fn encode<T: Serialize>(&self, task: &T) -> Result<Vec<u8>, ()> {
        match serde_json::to_vec(task) {
            Ok(buf) => return Ok(buf),
            Err(e) => {
                log::error!("json encode error: {:?}", e);
                return Err(());
            }
        }
    }

    fn encode_into<T: Serialize>(&self, task: &T, buf: &mut Vec<u8>) -> Result<usize, ()> {
        let pre_len = buf.len();
        if let Err(e) = serde_json::to_writer(&mut *buf, task) {
            log::error!("json encode error: {:?}", e);
            buf.truncate(pre_len);
            return Err(());
        }
        Ok(buf.len() - pre_len)
    }

    #[inline(always)]
    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()> {
        match serde_json::from_slice::<T>(buf) {
            Err(e) => {
                log::warn!("json decode error: {:?}", e);
                return Err(());
            }
            Ok(s) => return Ok(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_json() {
        let codec = JsonCodec::default();
        let mut args = BTreeMap::new();
        args.insert("name", "world");
        let mut buf = b"prefix".to_vec();
        let n = codec.encode_into(&args, &mut buf).expect("encode");
        assert_eq!(&buf[6..], br#"{"name":"world"}"#);
        assert_eq!(n, buf.len() - 6);
        let decoded: BTreeMap<String, String> = codec.decode(&buf[6..]).expect("decode");
        assert_eq!(decoded.get("name").map(|s| s.as_str()), Some("world"));
        assert!(codec.decode::<BTreeMap<String, String>>(b"{broken").is_err());
    }
}
