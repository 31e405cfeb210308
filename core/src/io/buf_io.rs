use std::future::Future;
use std::{fmt, io};

/// Read half of a transport
pub trait AsyncRead: Send {
    /// Ok(0) means EOF
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

/// Write half of a transport
pub trait AsyncWrite: Send {
    /// Returns how many bytes were taken
    fn write(&mut self, buf: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Keep writing until `buf` is gone. A write taking nothing is `WriteZero`.
    fn write_all<'a>(&'a mut self, buf: &'a [u8]) -> impl Future<Output = io::Result<()>> + Send + 'a {
        async move {
            let mut done = 0;
            while done < buf.len() {
                match self.write(&buf[done..]).await {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => done += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
    }
}

/// Buffer size used when the config gives 0
pub const DEFAULT_BUF_SIZE: usize = 8 * 1024;

#[inline]
fn buf_size_or_default(size: usize) -> usize {
    if size == 0 { DEFAULT_BUF_SIZE } else { size }
}

/// Read-ahead buffer for frame parsing.
///
/// [FrameReader::fill] reads until enough bytes are buffered, the parser looks at them in
/// place and [FrameReader::consume]s the frame. Whatever came in past the frame stays for
/// the next one. A frame larger than the buffer grows it, and the buffer shrinks back once
/// drained.
pub struct FrameReader<T: AsyncRead> {
    inner: T,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    size: usize,
}

impl<T: AsyncRead> FrameReader<T> {
    pub fn new(inner: T, buf_size: usize) -> Self {
        let size = buf_size_or_default(buf_size);
        Self { inner, buf: vec![0; size], start: 0, end: 0, size }
    }

    /// Bytes read but not consumed
    #[inline(always)]
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Read until at least `n` bytes are buffered, return all of them.
    ///
    /// EOF before that is `UnexpectedEof`.
    pub async fn fill(&mut self, n: usize) -> io::Result<&[u8]> {
        if self.end - self.start < n {
            if self.buf.len() - self.start < n {
                self.buf.copy_within(self.start..self.end, 0);
                self.end -= self.start;
                self.start = 0;
                if self.buf.len() < n {
                    self.buf.resize(n, 0);
                }
            }
            while self.end - self.start < n {
                match self.inner.read(&mut self.buf[self.end..]).await {
                    Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(m) => self.end += m,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(&self.buf[self.start..self.end])
    }

    /// Drop `n` parsed bytes from the front.
    pub fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
            if self.buf.len() > self.size {
                self.buf.truncate(self.size);
                self.buf.shrink_to_fit();
            }
        }
    }

    #[inline(always)]
    pub fn get_inner(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: AsyncRead + fmt::Debug> fmt::Debug for FrameReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} buffered={}", self.inner, self.end - self.start)
    }
}

/// Frames are encoded straight into [FrameWriter::buf_mut] and go out together on
/// [FrameWriter::flush].
pub struct FrameWriter<T: AsyncWrite> {
    inner: T,
    buf: Vec<u8>,
    size: usize,
}

impl<T: AsyncWrite> FrameWriter<T> {
    pub fn new(inner: T, buf_size: usize) -> Self {
        let size = buf_size_or_default(buf_size);
        Self { inner, buf: Vec::with_capacity(size), size }
    }

    #[inline(always)]
    pub fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    #[inline]
    pub fn append(&mut self, frame: &[u8]) {
        self.buf.extend_from_slice(frame);
    }

    #[inline(always)]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pending data reached the buffer size, flush before taking more.
    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.size
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.inner.write_all(&self.buf).await?;
        self.buf.clear();
        if self.buf.capacity() > self.size * 4 {
            self.buf.shrink_to(self.size);
        }
        Ok(())
    }

    #[inline(always)]
    pub fn get_inner(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: AsyncWrite + fmt::Debug> fmt::Debug for FrameWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} pending={}", self.inner, self.buf.len())
    }
}
