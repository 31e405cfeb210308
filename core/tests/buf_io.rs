use nrpc_core::io::*;
use rand::Rng;
use std::io;
use std::sync::{Arc, Mutex};

/// Hands out the payload in pieces of random size, like a socket under load.
struct SlicedReader {
    data: Vec<u8>,
    pos: usize,
}

impl AsyncRead for SlicedReader {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let left = self.data.len() - self.pos;
        if left == 0 || buf.is_empty() {
            return Ok(0);
        }
        let n = rand::thread_rng().gen_range(1..=left.min(buf.len()));
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Takes at most 3 bytes per write.
#[derive(Clone, Default)]
struct RecordingWriter {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl AsyncWrite for RecordingWriter {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = buf.len().min(3);
        self.writes.lock().unwrap().push(buf[..n].to_vec());
        Ok(n)
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_frame_reader_fill() {
    futures::executor::block_on(async {
        for buf_size in [1usize, 7, 64, 4096] {
            let data = payload(1000);
            let mut reader = FrameReader::new(SlicedReader { data: data.clone(), pos: 0 }, buf_size);
            let head = reader.fill(13).await.expect("fill head");
            assert!(head.len() >= 13);
            assert_eq!(&head[..13], &data[..13]);
            reader.consume(13);
            // larger than the buffer
            let rest = reader.fill(987).await.expect("fill rest");
            assert_eq!(rest, &data[13..]);
            reader.consume(987);
            assert!(reader.buffered().is_empty());
            let e = reader.fill(1).await.unwrap_err();
            assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);
        }
    });
}

#[test]
fn test_frame_reader_keeps_read_ahead() {
    futures::executor::block_on(async {
        let data = payload(100);
        let mut reader = FrameReader::new(SlicedReader { data: data.clone(), pos: 0 }, 0);
        let mut offset = 0;
        for n in [10usize, 1, 39, 50] {
            let got = reader.fill(n).await.expect("fill");
            assert_eq!(&got[..n], &data[offset..offset + n]);
            reader.consume(n);
            offset += n;
        }
        assert!(reader.fill(1).await.is_err());
    });
}

#[test]
fn test_frame_writer_flush() {
    futures::executor::block_on(async {
        let sink = RecordingWriter::default();
        let mut writer = FrameWriter::new(sink.clone(), 16);
        writer.append(b"NRPC");
        writer.buf_mut().extend_from_slice(b"frame");
        assert_eq!(writer.pending(), 9);
        assert!(!writer.is_full());
        assert!(sink.writes.lock().unwrap().is_empty());
        writer.flush().await.expect("flush");
        assert_eq!(sink.writes.lock().unwrap().concat(), b"NRPCframe".to_vec());
        assert_eq!(writer.pending(), 0);

        writer.append(&payload(40));
        assert!(writer.is_full());
        writer.flush().await.expect("flush");
        let writes = sink.writes.lock().unwrap();
        assert_eq!(writes.concat()[9..], payload(40)[..]);
        // nothing left after an empty flush
        drop(writes);
        writer.flush().await.expect("flush");
    });
}
