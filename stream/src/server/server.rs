use super::service::{AckTracker, ChunkSender, RpcService};
use super::*;
use crate::data::DataCodec;
use crate::proto::*;
use crossfire::*;
use futures::future::{AbortHandle, Abortable};
use nrpc_core::error::{ConfigError, FrameError};
use nrpc_core::io::{Cancellable, FrameReader, FrameWriter, with_timeout};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// An RpcServer that listen, accept, and server connections, according to ServerFacts interface.
///
/// The built-in command and db services are registered on creation.
pub struct RpcServer<F>
where
    F: ServerFacts,
{
    listeners_abort: Vec<(AbortHandle, String)>,
    logger: Arc<LogFilter>,
    facts: Arc<F>,
    dispatcher: Arc<ServiceDispatcher>,
    conn_ref_count: Arc<()>,
    server_close_tx: Mutex<Option<MTx<()>>>,
    server_close_rx: MAsyncRx<()>,
}

impl<F> RpcServer<F>
where
    F: ServerFacts,
{
    pub fn new(facts: Arc<F>) -> Self {
        let (tx, rx) = mpmc::unbounded_async();
        let logger = facts.new_logger();
        let codec: Arc<dyn DataCodec> = Arc::new(F::Codec::default());
        let dispatcher = Arc::new(ServiceDispatcher::new(codec, logger.clone()));
        builtin::register(&dispatcher);
        Self {
            listeners_abort: Vec::new(),
            logger,
            facts,
            dispatcher,
            conn_ref_count: Arc::new(()),
            server_close_tx: Mutex::new(Some(tx)),
            server_close_rx: rx,
        }
    }

    #[inline]
    pub fn dispatcher(&self) -> &Arc<ServiceDispatcher> {
        &self.dispatcher
    }

    /// See [ServiceDispatcher::add_instance]
    #[inline]
    pub fn add_instance<S: RpcService>(&self, svc: Arc<S>) -> Result<String, ConfigError> {
        self.dispatcher.add_instance(svc)
    }

    #[inline]
    pub fn add_instance_named<S: RpcService>(&self, svc: Arc<S>, name: &str) -> Result<(), ConfigError> {
        self.dispatcher.add_instance_named(svc, name)
    }

    /// Bind and start accepting, return the local address.
    pub fn listen<T: ServerTransport<F::IO>>(&mut self, addr: &str) -> io::Result<String> {
        match <T::Listener as AsyncListener>::bind(addr) {
            Err(e) => {
                logger_error!(self.logger, "bind addr {:?} err: {}", addr, e);
                Err(e)
            }
            Ok(mut listener) => {
                let local_addr = listener.local_addr()?.to_string();
                let (abort_handle, abort_registration) = AbortHandle::new_pair();
                let facts = self.facts.clone();
                let dispatcher = self.dispatcher.clone();
                let conn_ref_count = self.conn_ref_count.clone();
                let listener_info = format!("listener {:?}", local_addr);
                let server_close_rx = self.server_close_rx.clone();
                let logger = self.logger.clone();
                logger_debug!(self.logger, "listening on {:?}", listener);
                let abrt = Abortable::new(
                    async move {
                        loop {
                            match listener.accept().await {
                                Err(e) => {
                                    logger_warn!(logger, "{:?} accept error: {}", listener, e);
                                    return;
                                }
                                Ok((stream, peer)) => {
                                    match T::new_conn(stream, facts.get_config()) {
                                        Ok(conn) => Self::server_conn::<T>(
                                            conn,
                                            &facts,
                                            &dispatcher,
                                            server_close_rx.clone(),
                                            conn_ref_count.clone(),
                                        ),
                                        Err(e) => {
                                            logger_warn!(logger, "setup conn from {} err: {}", peer, e);
                                        }
                                    }
                                }
                            }
                        }
                    },
                    abort_registration,
                );
                self.facts.spawn_detach(abrt);
                self.listeners_abort.push((abort_handle, listener_info));
                Ok(local_addr)
            }
        }
    }

    fn server_conn<T: ServerTransport<F::IO>>(
        conn: T, facts: &Arc<F>, dispatcher: &Arc<ServiceDispatcher>, server_close_rx: MAsyncRx<()>,
        conn_ref: Arc<()>,
    ) {
        let config = facts.get_config();
        let peer = conn.peer_addr();
        let codec = WireCodec::new(config.max_frame_len);
        let (reader, writer) = conn.split();
        let (done_tx, done_rx) = mpsc::unbounded_async::<Packet>();
        let logger = facts.new_logger();
        logger_debug!(logger, "conn {} accepted", peer);

        struct Reader<F: ServerFacts, R: AsyncRead> {
            peer: String,
            reader: FrameReader<R>,
            codec: WireCodec,
            noti: RespNoti,
            facts: Arc<F>,
            dispatcher: Arc<ServiceDispatcher>,
            tracker: Arc<AckTracker>,
            server_close_rx: MAsyncRx<()>,
            logger: Arc<LogFilter>,
            _conn_ref: Arc<()>,
        }

        impl<F: ServerFacts, R: AsyncRead> Reader<F, R> {
            async fn run(mut self) {
                let (idle_timeout, read_timeout) = {
                    let config = self.facts.get_config();
                    (config.idle_timeout, config.read_timeout)
                };
                loop {
                    let head = Cancellable::new(
                        self.codec.read_head(&mut self.reader),
                        self.server_close_rx.recv(),
                    );
                    match with_timeout::<F::IO, _>(idle_timeout, head).await {
                        Err(()) => {
                            logger_debug!(self.logger, "conn {} idle, close", self.peer);
                            return;
                        }
                        Ok(Err(())) => {
                            logger_debug!(self.logger, "conn {} close by server", self.peer);
                            return;
                        }
                        Ok(Ok(Err(e))) => {
                            self.log_read_err(&e);
                            return;
                        }
                        Ok(Ok(Ok(()))) => {}
                    }
                    let rest = self.codec.read_rest(&mut self.reader);
                    match with_timeout::<F::IO, _>(read_timeout, rest).await {
                        Err(()) => {
                            logger_warn!(self.logger, "conn {} read timeout", self.peer);
                            return;
                        }
                        Ok(Err(e)) => {
                            self.log_read_err(&e);
                            return;
                        }
                        Ok(Ok(packet)) => {
                            if self.on_packet(packet).is_err() {
                                logger_warn!(self.logger, "conn {} reader abort due to writer has err", self.peer);
                                return;
                            }
                        }
                    }
                }
            }

            fn log_read_err(&self, e: &FrameError) {
                if e.is_eof() {
                    logger_debug!(self.logger, "conn {} closed by peer", self.peer);
                } else if let FrameError::Io(e) = e {
                    logger_debug!(self.logger, "conn {} read err: {}", self.peer, e);
                } else {
                    logger_warn!(self.logger, "conn {} protocol err: {}", self.peer, e);
                }
            }

            fn on_packet(&self, packet: Packet) -> Result<(), ()> {
                match packet {
                    Packet::Request(req) => {
                        logger_trace!(self.logger, "conn {} recv {:?}", self.peer, req);
                        let id = req.request_id;
                        let chunks = if req.ack {
                            ChunkSender::new(
                                id,
                                self.noti.clone(),
                                self.dispatcher.codec().clone(),
                                self.tracker.clone(),
                            )
                        } else {
                            ChunkSender::detached(id)
                        };
                        let (noti, dispatcher, tracker) =
                            (self.noti.clone(), self.dispatcher.clone(), self.tracker.clone());
                        self.facts.spawn_detach(async move {
                            if let Some(resp) = dispatcher.dispatch(req, chunks).await {
                                let _ = noti.send(Packet::ResponseLast(resp));
                            }
                            tracker.finish(id);
                        });
                        Ok(())
                    }
                    Packet::ChunkAck(ack) => {
                        if !self.tracker.on_ack(ack.request_id) {
                            logger_trace!(self.logger, "conn {} stray ack {:?}", self.peer, ack);
                        }
                        Ok(())
                    }
                    Packet::Generic(g) if g.ack => self.noti.send(Packet::Generic(GenericPacket::pong())),
                    other => {
                        logger_debug!(self.logger, "conn {} ignore {:?}", self.peer, other);
                        Ok(())
                    }
                }
            }
        }

        let reader = Reader::<F, T::Reader> {
            peer: peer.clone(),
            reader: FrameReader::new(reader, config.stream_buf_size),
            codec,
            noti: RespNoti(done_tx),
            facts: facts.clone(),
            dispatcher: dispatcher.clone(),
            tracker: Arc::new(AckTracker::default()),
            server_close_rx,
            logger: logger.clone(),
            _conn_ref: conn_ref.clone(),
        };
        facts.spawn_detach(async move { reader.run().await });

        struct Writer<F: ServerFacts, T: ServerTransport<F::IO>> {
            peer: String,
            writer: FrameWriter<T::Writer>,
            codec: WireCodec,
            done_rx: AsyncRx<Packet>,
            write_timeout: Duration,
            logger: Arc<LogFilter>,
            _conn_ref: Arc<()>,
            _phan: std::marker::PhantomData<fn(&F)>,
        }

        impl<F: ServerFacts, T: ServerTransport<F::IO>> Writer<F, T> {
            async fn run(mut self) -> Result<(), io::Error> {
                while let Ok(packet) = self.done_rx.recv().await {
                    self.encode(&packet);
                    // batch what is queued, up to the buffer size
                    while !self.writer.is_full() {
                        let Ok(packet) = self.done_rx.try_recv() else { break };
                        self.encode(&packet);
                    }
                    match with_timeout::<F::IO, _>(self.write_timeout, self.writer.flush()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            logger_warn!(self.logger, "conn {} write err: {}", self.peer, e);
                            return Err(e);
                        }
                        Err(()) => {
                            logger_warn!(self.logger, "conn {} write timeout", self.peer);
                            return Err(io::ErrorKind::TimedOut.into());
                        }
                    }
                }
                logger_trace!(self.logger, "conn {} writer exits", self.peer);
                let _ = T::shutdown_write(self.writer.get_inner()).await;
                Ok(())
            }

            /// A terminal response that fails to encode is replaced by a bare 500, so the
            /// caller still gets an outcome.
            fn encode(&mut self, packet: &Packet) {
                logger_trace!(self.logger, "conn {} write {:?}", self.peer, packet);
                let buf = self.writer.buf_mut();
                let Err(e) = self.codec.encode(packet, buf) else {
                    return;
                };
                logger_error!(self.logger, "conn {} encode {:?} err: {}", self.peer, packet, e);
                if let Packet::ResponseLast(resp) = packet {
                    let fallback = ResponsePacket::new(
                        resp.request_id,
                        status::SERVER_ERROR,
                        format!("response encode err: {}", e),
                    );
                    if let Err(e) = self.codec.encode(&Packet::ResponseLast(fallback), buf) {
                        logger_error!(self.logger, "conn {} encode fallback err: {}", self.peer, e);
                    }
                }
            }
        }

        let writer = Writer::<F, T> {
            peer,
            writer: FrameWriter::new(writer, config.stream_buf_size),
            codec,
            done_rx,
            write_timeout: config.write_timeout,
            logger,
            _conn_ref: conn_ref,
            _phan: Default::default(),
        };
        facts.spawn_detach(async move { writer.run().await });
    }

    #[inline]
    pub fn get_alive_conn(&self) -> usize {
        // Reader and writer of one connection both hold a reference
        (Arc::strong_count(&self.conn_ref_count) - 1).div_ceil(2)
    }

    /// Gracefully close the server
    ///
    /// Steps:
    /// - listeners coroutine is abort
    /// - drop the close channel to notify connection read coroutines.
    /// - the writer coroutines will exit after all the reference of RespNoti channel drop to 0
    /// - wait for connection coroutines to exit with a timeout defined by
    /// ServerConfig.server_close_wait
    pub async fn close(&mut self) {
        for h in &self.listeners_abort {
            h.0.abort();
            logger_info!(self.logger, "{} has closed", h.1);
        }
        self.listeners_abort.clear();
        if let Ok(mut guard) = self.server_close_tx.lock() {
            let _ = guard.take();
        }

        let mut exists_count = self.get_alive_conn();
        let start_ts = Instant::now();
        let config = self.facts.get_config();
        while exists_count > 0 {
            <F::IO as AsyncIO>::sleep(Duration::from_millis(100)).await;
            exists_count = self.get_alive_conn();
            if Instant::now().duration_since(start_ts) > config.server_close_wait {
                logger_warn!(
                    self.logger,
                    "closed as wait too long for all conn closed voluntarily({} conn left)",
                    exists_count,
                );
                break;
            }
        }
        logger_info!(self.logger, "server closed with alive conn {}", exists_count);
    }
}
