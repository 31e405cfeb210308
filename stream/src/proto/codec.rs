use super::packet::*;
use bytes::{Buf, BufMut, BytesMut};
use nrpc_core::error::FrameError;
use nrpc_core::io::{AsyncRead, FrameReader};

pub const MAGIC: [u8; 4] = *b"NRPC";

/// magic + 4 reserved bytes
pub const HEADER: [u8; 8] = [b'N', b'R', b'P', b'C', 0, 0, 0, 0];

/// Bytes after the header: packet-type, ack-flag, total-length
const FIXED_AFTER_HEADER: usize = 1 + 1 + 4;

/// Frame layout, all integers big-endian:
///
/// | 1B         | header-len B      | 1B   | 1B  | 4B            |
/// | header-len | "NRPC" + reserved | type | ack | total-length  |
///
/// total-length covers the body, which depends on the type:
///
/// - request: `[4B id][1B svc-len][svc][1B method-len][method][4B data-len][data]`
/// - response: `[4B id][4B status][1B encode][1B msg-len][msg][4B data-len][data]`
/// - chunk / chunk-ack: response layout followed by `[4B chunk-id]`
/// - anything else: `[4B data-len][data]`
#[derive(Debug, Clone, Copy)]
pub struct WireCodec {
    max_frame_len: usize,
}

/// Fixed part of a frame
#[derive(Debug, Clone, Copy, PartialEq)]
struct Prefix {
    len: usize,
    packet_type: u8,
    ack: bool,
    total: usize,
}

/// Whether the buffer starts like an NRPC frame, for protocol sniffing.
///
/// Needs at least the header-length byte and the magic.
#[inline]
pub fn looks_like_nrpc(buf: &[u8]) -> bool {
    buf.len() > MAGIC.len() && buf[0] as usize >= MAGIC.len() && buf[1..1 + MAGIC.len()] == MAGIC
}

impl WireCodec {
    #[inline]
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    #[inline]
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Append the frame of `packet` to `buf`, return the frame size.
    ///
    /// On error nothing is left appended.
    pub fn encode(&self, packet: &Packet, buf: &mut Vec<u8>) -> Result<usize, FrameError> {
        let start = buf.len();
        match self.encode_frame(packet, buf) {
            Ok(()) => Ok(buf.len() - start),
            Err(e) => {
                buf.truncate(start);
                Err(e)
            }
        }
    }

    fn encode_frame(&self, packet: &Packet, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        buf.put_u8(HEADER.len() as u8);
        buf.put_slice(&HEADER);
        buf.put_u8(packet.packet_type());
        buf.put_u8(packet.ack() as u8);
        let len_pos = reserve_u32(buf);
        match packet {
            Packet::Request(p) => {
                buf.put_i32(p.request_id);
                put_short_str(buf, "service_name", &p.service_name)?;
                put_short_str(buf, "method_name", &p.method_name)?;
                put_data(buf, &p.data);
            }
            Packet::ResponseLast(p) => put_response(buf, p)?,
            Packet::Chunk(p) => {
                put_response(buf, &p.resp)?;
                buf.put_i32(p.chunk_id);
            }
            Packet::ChunkAck(p) => {
                put_response(buf, &p.resp)?;
                buf.put_i32(p.ack_chunk_id);
            }
            Packet::Generic(p) => put_data(buf, &p.data),
        }
        let total = buf.len() - len_pos - 4;
        if total > self.max_frame_len {
            return Err(FrameError::TooLarge { len: total, max: self.max_frame_len });
        }
        patch_u32(buf, len_pos, total as u32);
        Ok(())
    }

    /// Parse the fixed prefix, None if more bytes are needed.
    fn parse_prefix(&self, buf: &[u8]) -> Result<Option<Prefix>, FrameError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let header_len = buf[0] as usize;
        if header_len < MAGIC.len() {
            return Err(FrameError::HeaderTooShort(header_len));
        }
        // fail fast on foreign protocols before the whole prefix arrives
        let magic_end = (1 + MAGIC.len()).min(buf.len());
        if buf[1..magic_end] != MAGIC[..magic_end - 1] {
            return Err(FrameError::BadMagic(buf[1..magic_end].to_vec()));
        }
        let len = 1 + header_len + FIXED_AFTER_HEADER;
        if buf.len() < len {
            return Ok(None);
        }
        let mut fixed = &buf[1 + header_len..len];
        let packet_type = fixed.get_u8();
        let ack = fixed.get_u8() != 0;
        let total = fixed.get_u32() as usize;
        if total > self.max_frame_len {
            return Err(FrameError::TooLarge { len: total, max: self.max_frame_len });
        }
        Ok(Some(Prefix { len, packet_type, ack, total }))
    }

    /// Split one complete frame off `src` and decode it.
    ///
    /// Returns Ok(None) until the whole frame is buffered; partial frames stay in `src`.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Packet>, FrameError> {
        let Some(prefix) = self.parse_prefix(src)? else {
            return Ok(None);
        };
        let frame_len = prefix.len + prefix.total;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }
        let frame = src.split_to(frame_len);
        decode_body(prefix.packet_type, prefix.ack, &frame[prefix.len..]).map(Some)
    }

    /// Decode exactly one frame from a complete slice.
    pub fn decode_slice(&self, buf: &[u8]) -> Result<Packet, FrameError> {
        match self.parse_prefix(buf)? {
            None => {
                Err(FrameError::Truncated { field: "prefix", need: HEADER.len() + 7, left: buf.len() })
            }
            Some(prefix) => {
                let frame_len = prefix.len + prefix.total;
                if buf.len() < frame_len {
                    return Err(FrameError::Truncated {
                        field: "frame",
                        need: prefix.total,
                        left: buf.len() - prefix.len,
                    });
                }
                if buf.len() > frame_len {
                    return Err(FrameError::Trailing(buf.len() - frame_len));
                }
                decode_body(prefix.packet_type, prefix.ack, &buf[prefix.len..])
            }
        }
    }

    /// Wait for the first byte of the next frame, it stays buffered.
    ///
    /// Split from [Self::read_rest] so the caller can wait on an idle connection with a
    /// different timeout than the one for the rest of the frame.
    #[inline]
    pub async fn read_head<R: AsyncRead>(&self, reader: &mut FrameReader<R>) -> Result<(), FrameError> {
        reader.fill(1).await?;
        Ok(())
    }

    /// Read the rest of the frame started by [Self::read_head], and decode it in place.
    pub async fn read_rest<R: AsyncRead>(&self, reader: &mut FrameReader<R>) -> Result<Packet, FrameError> {
        // a foreign protocol fails on the magic, before its made-up length is waited for
        let prefix = match self.parse_prefix(reader.fill(1 + MAGIC.len()).await?)? {
            Some(prefix) => prefix,
            None => {
                let prefix_len = 1 + reader.buffered()[0] as usize + FIXED_AFTER_HEADER;
                match self.parse_prefix(reader.fill(prefix_len).await?)? {
                    Some(prefix) => prefix,
                    None => {
                        return Err(FrameError::Truncated {
                            field: "prefix",
                            need: prefix_len,
                            left: reader.buffered().len(),
                        });
                    }
                }
            }
        };
        let frame_len = prefix.len + prefix.total;
        let buf = reader.fill(frame_len).await?;
        let packet = decode_body(prefix.packet_type, prefix.ack, &buf[prefix.len..frame_len]);
        reader.consume(frame_len);
        packet
    }

    #[inline]
    pub async fn read_packet<R: AsyncRead>(&self, reader: &mut FrameReader<R>) -> Result<Packet, FrameError> {
        self.read_head(reader).await?;
        self.read_rest(reader).await
    }
}

/// Incremental decoder for a byte stream arriving in arbitrary pieces.
pub struct FrameDecoder {
    codec: WireCodec,
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self { codec: WireCodec::new(max_frame_len), buf: BytesMut::with_capacity(4096) }
    }

    #[inline]
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete packet. After an error the stream is unusable.
    #[inline]
    pub fn next_packet(&mut self) -> Result<Option<Packet>, FrameError> {
        self.codec.decode(&mut self.buf)
    }

    /// Bytes buffered but not yet part of a complete frame
    #[inline]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[inline]
fn reserve_u32(buf: &mut Vec<u8>) -> usize {
    let pos = buf.len();
    buf.put_u32(0);
    pos
}

#[inline]
fn patch_u32(buf: &mut Vec<u8>, pos: usize, v: u32) {
    buf[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
}

#[inline]
fn put_short_str(buf: &mut Vec<u8>, field: &'static str, s: &str) -> Result<(), FrameError> {
    if s.len() > u8::MAX as usize {
        return Err(FrameError::FieldTooLong { field, len: s.len() });
    }
    buf.put_u8(s.len() as u8);
    buf.put_slice(s.as_bytes());
    Ok(())
}

#[inline]
fn put_data(buf: &mut Vec<u8>, data: &[u8]) {
    let pos = reserve_u32(buf);
    buf.put_slice(data);
    let len = buf.len() - pos - 4;
    patch_u32(buf, pos, len as u32);
}

fn put_response(buf: &mut Vec<u8>, p: &ResponsePacket) -> Result<(), FrameError> {
    buf.put_i32(p.request_id);
    buf.put_u32(p.status as u32);
    buf.put_u8(p.encode as u8);
    put_short_str(buf, "message", &p.message)?;
    put_data(buf, &p.data);
    Ok(())
}

struct BodyReader<'a> {
    buf: &'a [u8],
}

impl<'a> BodyReader<'a> {
    #[inline]
    fn need(&self, field: &'static str, n: usize) -> Result<(), FrameError> {
        if self.buf.len() < n {
            return Err(FrameError::Truncated { field, need: n, left: self.buf.len() });
        }
        Ok(())
    }

    #[inline]
    fn get_u8(&mut self, field: &'static str) -> Result<u8, FrameError> {
        self.need(field, 1)?;
        Ok(self.buf.get_u8())
    }

    #[inline]
    fn get_i32(&mut self, field: &'static str) -> Result<i32, FrameError> {
        self.need(field, 4)?;
        Ok(self.buf.get_i32())
    }

    #[inline]
    fn get_u32(&mut self, field: &'static str) -> Result<u32, FrameError> {
        self.need(field, 4)?;
        Ok(self.buf.get_u32())
    }

    #[inline]
    fn take(&mut self, field: &'static str, n: usize) -> Result<&'a [u8], FrameError> {
        self.need(field, n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn get_short_str(&mut self, field: &'static str) -> Result<String, FrameError> {
        let len = self.get_u8(field)? as usize;
        let raw = self.take(field, len)?;
        match std::str::from_utf8(raw) {
            Ok(s) => Ok(s.to_string()),
            Err(_) => Err(FrameError::InvalidUtf8 { field }),
        }
    }

    fn get_data(&mut self) -> Result<Vec<u8>, FrameError> {
        let len = self.get_u32("data-len")? as usize;
        Ok(self.take("data", len)?.to_vec())
    }

    fn get_response(&mut self, ack: bool) -> Result<ResponsePacket, FrameError> {
        let request_id = self.get_i32("request-id")?;
        let status = self.get_u32("status")?;
        if status > u16::MAX as u32 {
            return Err(FrameError::BadStatus(status));
        }
        let encode = Encode::from_u8(self.get_u8("encode")?);
        let message = self.get_short_str("message")?;
        let data = self.get_data()?;
        Ok(ResponsePacket { request_id, ack, status: status as u16, message, encode, data })
    }

    #[inline]
    fn finish(self) -> Result<(), FrameError> {
        if !self.buf.is_empty() {
            return Err(FrameError::Trailing(self.buf.len()));
        }
        Ok(())
    }
}

fn decode_body(packet_type: u8, ack: bool, body: &[u8]) -> Result<Packet, FrameError> {
    let mut r = BodyReader { buf: body };
    let packet = match packet_type {
        packet_type::CLIENT_REQUEST => {
            let request_id = r.get_i32("request-id")?;
            let service_name = r.get_short_str("service_name")?;
            let method_name = r.get_short_str("method_name")?;
            let data = r.get_data()?;
            Packet::Request(RequestPacket {
                request_id,
                ack,
                service_name,
                method_name,
                version: None,
                data,
            })
        }
        packet_type::RESPONSE_LAST => Packet::ResponseLast(r.get_response(ack)?),
        packet_type::RESPONSE_CHUNK => {
            let resp = r.get_response(ack)?;
            let chunk_id = r.get_i32("chunk-id")?;
            Packet::Chunk(ResponseChunkPacket { resp, chunk_id })
        }
        packet_type::RESPONSE_CHUNK_ACK => {
            let resp = r.get_response(ack)?;
            let ack_chunk_id = r.get_i32("ack-chunk-id")?;
            Packet::ChunkAck(ResponseChunkAckPacket { resp, ack_chunk_id })
        }
        _ => Packet::Generic(GenericPacket { packet_type, ack, data: r.get_data()? }),
    };
    r.finish()?;
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nrpc_core::DEFAULT_MAX_FRAME_LEN;

    fn codec() -> WireCodec {
        WireCodec::new(DEFAULT_MAX_FRAME_LEN)
    }

    fn hello_request() -> Packet {
        let mut req = RequestPacket::new("/helloService", "sayHello", br#"{"name":"world"}"#.to_vec());
        req.request_id = 7;
        Packet::Request(req)
    }

    #[test]
    fn test_request_layout() {
        let mut buf = Vec::new();
        let n = codec().encode(&hello_request(), &mut buf).expect("encode");
        assert_eq!(n, buf.len());
        assert_eq!(buf[0], 8);
        assert_eq!(&buf[1..9], b"NRPC\0\0\0\0");
        assert_eq!(buf[9], packet_type::CLIENT_REQUEST);
        assert_eq!(buf[10], 1);
        let total = u32::from_be_bytes([buf[11], buf[12], buf[13], buf[14]]) as usize;
        assert_eq!(total, buf.len() - 15);
        // request id
        assert_eq!(&buf[15..19], &7i32.to_be_bytes());
        assert_eq!(buf[19] as usize, "/helloService".len());
        assert!(looks_like_nrpc(&buf));
        assert!(!looks_like_nrpc(b"GET / HTTP/1.1\r\n"));
        assert!(!looks_like_nrpc(&buf[..3]));
    }

    #[test]
    fn test_packet_variants() {
        let mut resp = ResponsePacket::ok(3, Encode::Json, br#""hi! world""#.to_vec());
        resp.ack = true;
        let mut chunk = ResponseChunkPacket { resp: resp.clone(), chunk_id: 2 };
        chunk.encode = Encode::Binary;
        let packets = vec![
            hello_request(),
            Packet::ResponseLast(resp),
            Packet::ResponseLast(ResponsePacket::new(4, status::NO_SUCH_SERVICE, "not found service [/x]")),
            Packet::Chunk(chunk),
            Packet::ChunkAck(ResponseChunkAckPacket::new(3, 2)),
            Packet::Generic(GenericPacket::ping()),
            Packet::Generic(GenericPacket { packet_type: 42, ack: false, data: vec![1, 2, 3] }),
        ];
        let codec = codec();
        for p in packets {
            let mut buf = Vec::new();
            codec.encode(&p, &mut buf).expect("encode");
            let decoded = codec.decode_slice(&buf).expect("decode");
            assert_eq!(decoded, p);
        }
    }

    #[test]
    fn test_field_too_long() {
        let codec = codec();
        let mut buf = b"keep".to_vec();
        let req = RequestPacket::new(&"s".repeat(256), "m", Vec::new());
        match codec.encode(&Packet::Request(req), &mut buf) {
            Err(FrameError::FieldTooLong { field, len }) => {
                assert_eq!(field, "service_name");
                assert_eq!(len, 256);
            }
            r => panic!("unexpected {:?}", r),
        }
        // nothing appended on failure
        assert_eq!(buf, b"keep");
        let mut resp = ResponsePacket::new(1, 500, "boom");
        resp.message = "e".repeat(300);
        assert!(codec.encode(&Packet::ResponseLast(resp), &mut buf).is_err());
        let req = RequestPacket::new(&"s".repeat(255), "m", Vec::new());
        assert!(codec.encode(&Packet::Request(req), &mut buf).is_ok());
    }

    #[test]
    fn test_max_frame() {
        let small = WireCodec::new(64);
        let req = RequestPacket::new("/svc", "m", vec![0u8; 100]);
        let mut buf = Vec::new();
        assert!(matches!(
            small.encode(&Packet::Request(req), &mut buf),
            Err(FrameError::TooLarge { .. })
        ));
        assert!(buf.is_empty());

        // declared length beyond the limit is rejected before the body arrives
        let mut big = Vec::new();
        codec().encode(&Packet::Request(RequestPacket::new("/svc", "m", vec![0u8; 100])), &mut big).expect("encode");
        let mut src = BytesMut::from(&big[..15]);
        assert!(matches!(small.decode(&mut src), Err(FrameError::TooLarge { .. })));
    }

    #[test]
    fn test_partial_frames() {
        let codec = codec();
        let mut stream = Vec::new();
        let p1 = hello_request();
        let p2 = Packet::ResponseLast(ResponsePacket::ok(7, Encode::Binary, b"pong".to_vec()));
        codec.encode(&p1, &mut stream).expect("encode");
        codec.encode(&p2, &mut stream).expect("encode");

        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
        let mut got = Vec::new();
        for b in stream.chunks(3) {
            decoder.feed(b);
            while let Some(p) = decoder.next_packet().expect("decode") {
                got.push(p);
            }
        }
        assert_eq!(got, vec![p1, p2]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_malformed() {
        let codec = codec();
        let mut src = BytesMut::from(&b"\x08HTTP\0\0\0\0"[..]);
        assert!(matches!(codec.decode(&mut src), Err(FrameError::BadMagic(_))));

        let mut src = BytesMut::from(&b"\x02NR"[..]);
        assert!(matches!(codec.decode(&mut src), Err(FrameError::HeaderTooShort(2))));

        // data-len claims more than the frame holds
        let mut buf = Vec::new();
        codec.encode(&Packet::Generic(GenericPacket::ping()), &mut buf).expect("encode");
        let n = buf.len();
        buf[n - 1] = 9;
        assert!(matches!(codec.decode_slice(&buf), Err(FrameError::Truncated { .. })));

        // total-length larger than the body
        let mut buf = Vec::new();
        codec.encode(&hello_request(), &mut buf).expect("encode");
        buf.push(0);
        let total = (buf.len() - 15) as u32;
        buf[11..15].copy_from_slice(&total.to_be_bytes());
        assert!(matches!(codec.decode_slice(&buf), Err(FrameError::Trailing(1))));
    }

    #[test]
    fn test_read_packet() {
        let codec = codec();
        let mut wire = Vec::new();
        codec.encode(&hello_request(), &mut wire).expect("encode");
        codec.encode(&Packet::Generic(GenericPacket::pong()), &mut wire).expect("encode");

        struct SliceReader(Vec<u8>);
        impl AsyncRead for SliceReader {
            async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                let n = buf.len().min(self.0.len());
                buf[..n].copy_from_slice(&self.0[..n]);
                self.0.drain(..n);
                Ok(n)
            }
        }
        futures::executor::block_on(async {
            let mut reader = FrameReader::new(SliceReader(wire), 16);
            let p = codec.read_packet(&mut reader).await.expect("read");
            assert_eq!(p, hello_request());
            let p = codec.read_packet(&mut reader).await.expect("read");
            assert_eq!(p, Packet::Generic(GenericPacket::pong()));
            let e = codec.read_packet(&mut reader).await.unwrap_err();
            assert!(e.is_eof());

            // fails on the magic, does not wait for 255 header bytes
            let mut reader = FrameReader::new(SliceReader(b"\xffHTTP".to_vec()), 0);
            let e = codec.read_packet(&mut reader).await.unwrap_err();
            assert!(matches!(e, FrameError::BadMagic(_)), "{:?}", e);
        });
    }
}
