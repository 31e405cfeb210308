//! [ClientStream] represents a client-side connection.
//!
//! Callers encode their frame on their own thread and push it through a lock-free channel to the
//! writer coroutine, which batches writes before flushing. The reader coroutine decodes frames
//! and resolves pending calls from the [CorrelationTable]; it never runs user code, chunk
//! callbacks go to the call's executor.
//!
//! When the connection breaks every pending call fails at once, with a write error if the
//! writer saw the failure, or a connect error otherwise.

use super::table::*;
use super::*;
use crate::proto::*;
use crossfire::*;
use nrpc_core::error::{FrameError, RpcError};
use nrpc_core::io::{Cancellable, FrameReader, FrameWriter, with_timeout};
use nrpc_core::pool::{Pooled, Recycler};
use nrpc_core::runtime::Ticker;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub(crate) enum WriteCmd {
    Frame(Pooled<Vec<u8>>),
    /// Flush what's queued, then shutdown the write direction
    Close,
}

/// Called once when the connection breaks on its own, not on close().
pub type BrokenHook = Box<dyn Fn(&RpcError) + Send + Sync>;

/// Connection state shared by callers, the reader/writer coroutines and streaming calls.
pub struct ConnShared {
    pub conn_id: String,
    pub generation: u64,
    pub table: CorrelationTable,
    pub(crate) codec: WireCodec,
    local_addr: String,
    peer_addr: String,
    req_id: AtomicI32,
    write_tx: MTx<WriteCmd>,
    closed: AtomicBool,
    opened_at: Instant,
    last_pong_ms: AtomicU64,
    buf_pool: Arc<Recycler<Vec<u8>>>,
    on_broken: Option<BrokenHook>,
    pub(crate) logger: Arc<LogFilter>,
}

impl fmt::Debug for ConnShared {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "conn {}({}->{})", self.conn_id, self.local_addr, self.peer_addr)
    }
}

impl ConnShared {
    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Next request id, starts from 1 on every connection.
    #[inline(always)]
    pub fn next_id(&self) -> i32 {
        self.req_id.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    #[inline]
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Encode `packet` and queue it for the writer.
    pub fn send(&self, packet: &Packet) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Connect(format!("{:?} is closed", self)));
        }
        let mut buf = self.buf_pool.get();
        if let Err(e) = self.codec.encode(packet, &mut buf) {
            logger_warn!(self.logger, "{:?} encode {:?} err: {}", self, packet, e);
            return Err(e.into());
        }
        if self.write_tx.send(WriteCmd::Frame(buf)).is_err() {
            return Err(RpcError::Connect(format!("{:?} writer exited", self)));
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn send_chunk_ack(&self, request_id: i32, chunk_id: i32) -> bool {
        let ack = Packet::ChunkAck(ResponseChunkAckPacket::new(request_id, chunk_id));
        match self.send(&ack) {
            Ok(()) => {
                logger_trace!(self.logger, "{:?} ack chunk {} of {}", self, chunk_id, request_id);
                true
            }
            Err(e) => {
                logger_debug!(self.logger, "{:?} ack chunk {} of {} err: {}", self, chunk_id, request_id, e);
                false
            }
        }
    }

    /// Time since the last PONG, or since connected.
    #[inline]
    pub fn since_last_pong(&self) -> Duration {
        let last = Duration::from_millis(self.last_pong_ms.load(Ordering::Relaxed));
        self.opened_at.elapsed().saturating_sub(last)
    }

    fn on_packet(self: &Arc<Self>, packet: Packet) {
        match packet {
            Packet::ResponseLast(resp) => match self.table.resolve(resp.request_id) {
                Some(pc) => {
                    logger_trace!(self.logger, "{:?} recv {:?}", self, resp);
                    pc.complete(Ok(resp));
                }
                None => {
                    logger_debug!(
                        self.logger,
                        "{:?} discard response {:?}, call already gone",
                        self,
                        resp
                    );
                }
            },
            Packet::Chunk(chunk) => match self.table.get(chunk.request_id) {
                Some(CallSink::Stream(state)) => state.on_chunk(self, chunk),
                _ => {
                    // nobody consumes chunks of this call
                    self.send_chunk_ack(chunk.request_id, chunk.chunk_id);
                }
            },
            Packet::Generic(g) => {
                if g.ack {
                    let _ = self.send(&Packet::Generic(GenericPacket::pong()));
                } else {
                    let ms = self.opened_at.elapsed().as_millis() as u64;
                    self.last_pong_ms.store(ms, Ordering::Relaxed);
                }
            }
            Packet::Request(_) | Packet::ChunkAck(_) => {
                logger_warn!(self.logger, "{:?} unexpected {:?} from server", self, packet);
            }
        }
    }

    /// Mark closed and fail every pending call.
    fn shutdown(&self, reason: impl Fn() -> RpcError) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let pending = self.table.drain();
        if !pending.is_empty() {
            logger_debug!(self.logger, "{:?} fail {} pending calls: {}", self, pending.len(), reason());
        }
        for pc in pending {
            pc.complete(Err(reason()));
        }
        true
    }

    fn broken(&self, err: RpcError) {
        let msg = err.to_string();
        let is_write = matches!(err, RpcError::Write(_));
        let first = self.shutdown(|| {
            if is_write { RpcError::Write(msg.clone()) } else { RpcError::Connect(msg.clone()) }
        });
        if first {
            if let Some(hook) = self.on_broken.as_ref() {
                hook(&err);
            }
        }
    }
}

pub struct ClientStream<F: ClientFacts, P: ClientTransport<F::IO>> {
    shared: Arc<ConnShared>,
    close_tx: Mutex<Option<MTx<()>>>,
    _phan: std::marker::PhantomData<fn(&F, &P)>,
}

impl<F: ClientFacts, P: ClientTransport<F::IO>> ClientStream<F, P> {
    /// Make a connection to the server and start its coroutines.
    pub async fn connect(
        facts: &Arc<F>, addr: &str, generation: u64, buf_pool: Arc<Recycler<Vec<u8>>>,
        on_broken: Option<BrokenHook>,
    ) -> Result<Self, RpcError> {
        let config = facts.get_config();
        let logger = facts.new_logger();
        let conn = match P::connect(addr, config).await {
            Ok(c) => c,
            Err(e) => {
                logger_warn!(logger, "connect {} err: {}", addr, e);
                return Err(RpcError::Connect(format!("{}: {}", addr, e)));
            }
        };
        let (local_addr, peer_addr) = (conn.local_addr(), conn.peer_addr());
        let (reader, writer) = conn.split();
        let (write_tx, write_rx) = mpsc::unbounded_async::<WriteCmd>();
        let (close_tx, close_rx) = mpsc::unbounded_async::<()>();
        let shared = Arc::new(ConnShared {
            conn_id: format!("{}#{}", addr, generation),
            generation,
            table: CorrelationTable::new(),
            codec: WireCodec::new(config.max_frame_len),
            local_addr,
            peer_addr,
            req_id: AtomicI32::new(1),
            write_tx,
            closed: AtomicBool::new(false),
            opened_at: Instant::now(),
            last_pong_ms: AtomicU64::new(0),
            buf_pool,
            on_broken,
            logger,
        });
        logger_debug!(shared.logger, "{:?} connected", shared);
        let buf_size = config.stream_buf_size;
        let write_timeout = config.write_timeout;
        let _shared = shared.clone();
        let reader = FrameReader::new(reader, buf_size);
        facts.spawn_detach(async move { Self::read_loop(_shared, reader, close_rx).await });
        let _shared = shared.clone();
        let writer = FrameWriter::new(writer, buf_size);
        facts.spawn_detach(async move {
            Self::write_loop(_shared, writer, write_rx, write_timeout).await
        });
        let _shared = shared.clone();
        facts.spawn_detach(async move { Self::sweep_loop(_shared).await });
        Ok(Self { shared, close_tx: Mutex::new(Some(close_tx)), _phan: Default::default() })
    }

    #[inline(always)]
    pub fn shared(&self) -> &Arc<ConnShared> {
        &self.shared
    }

    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Send a connection-level probe, the server answers with PONG.
    #[inline]
    pub fn ping(&self) -> Result<(), RpcError> {
        self.shared.send(&Packet::Generic(GenericPacket::ping()))
    }

    /// Fail pending calls, flush queued frames and close the connection.
    pub fn close(&self) {
        if let Ok(mut guard) = self.close_tx.lock() {
            if guard.take().is_none() {
                return;
            }
        }
        logger_debug!(self.shared.logger, "{:?} closing", self.shared);
        let _ = self.shared.write_tx.send(WriteCmd::Close);
        self.shared.shutdown(|| RpcError::Connect("connection closed".to_string()));
    }

    async fn read_loop(
        shared: Arc<ConnShared>, mut reader: FrameReader<P::Reader>, close_rx: AsyncRx<()>,
    ) {
        let reason = loop {
            let r = Cancellable::new(shared.codec.read_packet(&mut reader), close_rx.recv())
                .await;
            match r {
                Err(()) => break None,
                Ok(Ok(packet)) => shared.on_packet(packet),
                Ok(Err(FrameError::Io(e))) => {
                    logger_debug!(shared.logger, "{:?} read err: {}", shared, e);
                    break Some(RpcError::Connect(format!("read: {}", e)));
                }
                Ok(Err(e)) => {
                    logger_warn!(shared.logger, "{:?} protocol err: {}", shared, e);
                    break Some(RpcError::Framing(e.to_string()));
                }
            }
        };
        logger_trace!(shared.logger, "{:?} reader exits", shared);
        match reason {
            Some(e) => shared.broken(e),
            None => {
                shared.shutdown(|| RpcError::Connect("connection closed".to_string()));
            }
        }
        // let the writer go in case nobody calls close()
        let _ = shared.write_tx.send(WriteCmd::Close);
    }

    async fn write_loop(
        shared: Arc<ConnShared>, mut writer: FrameWriter<P::Writer>, write_rx: AsyncRx<WriteCmd>,
        write_timeout: Duration,
    ) {
        let err = loop {
            let Ok(cmd) = write_rx.recv().await else { break None };
            let mut next = Some(cmd);
            let mut close = false;
            // batch whatever is queued before one flush
            while let Some(cmd) = next.take() {
                match cmd {
                    WriteCmd::Frame(buf) => writer.append(&buf),
                    WriteCmd::Close => {
                        close = true;
                        break;
                    }
                }
                if writer.is_full() {
                    break;
                }
                next = write_rx.try_recv().ok();
            }
            match with_timeout::<F::IO, _>(write_timeout, writer.flush()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => break Some(e),
                Err(()) => break Some(io::ErrorKind::TimedOut.into()),
            }
            if close {
                break None;
            }
        };
        match err {
            Some(e) => {
                logger_warn!(shared.logger, "{:?} write err: {}", shared, e);
                shared.broken(RpcError::Write(e.to_string()));
            }
            None => {
                let _ = P::shutdown_write(writer.get_inner()).await;
                logger_trace!(shared.logger, "{:?} writer exits", shared);
            }
        }
    }

    /// Catch calls whose waiter went away without evicting, like a dropped future.
    async fn sweep_loop(shared: Arc<ConnShared>) {
        let mut tick = F::IO::ticker(Duration::from_secs(1));
        loop {
            tick.next_tick().await;
            if shared.is_closed() {
                return;
            }
            for pc in shared.table.evict_expired(Instant::now()) {
                logger_debug!(shared.logger, "{:?} {:?} expired", shared, pc);
                let e = pc.timeout_error();
                pc.complete(Err(e));
            }
        }
    }
}

impl<F: ClientFacts, P: ClientTransport<F::IO>> Drop for ClientStream<F, P> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<F: ClientFacts, P: ClientTransport<F::IO>> fmt::Debug for ClientStream<F, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.shared.fmt(f)
    }
}
