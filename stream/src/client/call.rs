use super::chunk::{StreamOptions, StreamState};
use super::slot::{ResponseSlot, SlotFuture};
use super::stream::{BrokenHook, ClientStream, ConnShared};
use super::table::{CallResult, CallSink, PendingCall};
use super::*;
use crate::context::{RpcContext, RpcObserver, RpcState};
use crate::data::{DataCodec, RpcValue};
use crate::proto::*;
use crate::registry::{RpcInterface, RpcMethod};
use crate::server::builtin;
use arc_swap::{ArcSwap, ArcSwapOption};
use nrpc_core::error::{ConfigError, RpcError};
use nrpc_core::pool::{Pooled, Recycler};
use serde_json::Value;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

static CLIENT_ID: AtomicU64 = AtomicU64::new(1);

type ReconnectHook = Arc<dyn Fn(u64) + Send + Sync>;

/// A client bound to one server address, owning at most one live connection.
///
/// Cheap to clone, all clones share the connection.
pub struct RpcClient<F: ClientFacts, P: ClientTransport<F::IO>> {
    inner: Arc<ClientInner<F, P>>,
}

impl<F: ClientFacts, P: ClientTransport<F::IO>> Clone for RpcClient<F, P> {
    #[inline]
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

struct ClientInner<F: ClientFacts, P: ClientTransport<F::IO>> {
    id: u64,
    facts: Arc<F>,
    addr: String,
    codec: Arc<F::Codec>,
    conn: ArcSwapOption<ClientStream<F, P>>,
    generation: AtomicU64,
    reconnecting: AtomicBool,
    closed: AtomicBool,
    observers: ArcSwap<Vec<Arc<dyn RpcObserver>>>,
    on_reconnect: Mutex<Option<ReconnectHook>>,
    buf_pool: Arc<Recycler<Vec<u8>>>,
    ctx_pool: Arc<Recycler<RpcContext>>,
    logger: Arc<LogFilter>,
}

/// A call that has been written, waiting for its terminal response.
struct InFlight {
    shared: Arc<ConnShared>,
    ctx: Pooled<RpcContext>,
    observers: Arc<Vec<Arc<dyn RpcObserver>>>,
    slot: Arc<ResponseSlot<CallResult>>,
}

impl<F: ClientFacts, P: ClientTransport<F::IO>> RpcClient<F, P> {
    /// Create a client, no connection is made until [Self::connect].
    pub fn new(facts: Arc<F>, addr: &str) -> Self {
        let logger = facts.new_logger();
        let inner = ClientInner {
            id: CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            addr: addr.to_string(),
            codec: Arc::new(F::Codec::default()),
            conn: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            observers: ArcSwap::from_pointee(Vec::new()),
            on_reconnect: Mutex::new(None),
            buf_pool: Recycler::new(256, || Vec::with_capacity(256)),
            ctx_pool: Recycler::new(256, RpcContext::default),
            facts,
            logger,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Process-unique id of this client
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[inline]
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    #[inline]
    pub fn get_config(&self) -> &ClientConfig {
        self.inner.facts.get_config()
    }

    /// Bumped on every successful or attempted (re)connect
    #[inline]
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether there's a connection that accepts requests.
    pub fn is_active(&self) -> bool {
        match self.inner.conn.load().as_ref() {
            Some(conn) => !conn.is_closed(),
            None => false,
        }
    }

    /// Open a new connection, replacing the current one if any.
    pub async fn connect(&self) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Connect(format!("client {} closed", self.inner.addr)));
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let stream = ClientStream::<F, P>::connect(
            &self.inner.facts,
            &self.inner.addr,
            generation,
            self.inner.buf_pool.clone(),
            Some(self.broken_hook(generation)),
        )
        .await?;
        if let Some(old) = self.inner.conn.swap(Some(Arc::new(stream))) {
            old.close();
        }
        Ok(())
    }

    /// Drop the current connection and connect again.
    ///
    /// Concurrent reconnects collapse into one, the others return a connect error.
    pub async fn reconnect(&self) -> Result<(), RpcError> {
        if self.inner.reconnecting.swap(true, Ordering::AcqRel) {
            return Err(RpcError::Connect(format!("{} reconnect in progress", self.inner.addr)));
        }
        if let Some(old) = self.inner.conn.swap(None) {
            old.close();
        }
        let r = self.connect().await;
        self.inner.reconnecting.store(false, Ordering::Release);
        match &r {
            Ok(()) => {
                let generation = self.generation();
                logger_info!(self.inner.logger, "{} reconnected, generation {}", self.inner.addr, generation);
                let hook = self.inner.on_reconnect.lock().ok().and_then(|g| g.as_ref().cloned());
                if let Some(hook) = hook {
                    hook(generation);
                }
            }
            Err(e) => {
                logger_warn!(self.inner.logger, "{} reconnect failed: {}", self.inner.addr, e);
            }
        }
        r
    }

    /// Called with the new generation after every successful [Self::reconnect].
    pub fn set_on_reconnect_success<H>(&self, hook: H)
    where
        H: Fn(u64) + Send + Sync + 'static,
    {
        if let Ok(mut g) = self.inner.on_reconnect.lock() {
            g.replace(Arc::new(hook));
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn RpcObserver>) {
        self.inner.observers.rcu(|list| {
            let mut list = Vec::clone(list);
            list.push(observer.clone());
            list
        });
    }

    /// Close the connection and refuse further calls. Pending calls fail with a connect error.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(conn) = self.inner.conn.swap(None) {
            conn.close();
        }
        logger_debug!(self.inner.logger, "client {} closed", self.inner.addr);
    }

    /// Connection-level probe, answered by the server transport without dispatch.
    pub fn ping_conn(&self) -> Result<(), RpcError> {
        self.current()?.ping()
    }

    /// Call the built-in command service, bounded by the heartbeat interval.
    pub async fn ping(&self) -> Result<(), RpcError> {
        let method = RpcMethod::declare(builtin::PING, &[]);
        let timeout = self.get_config().heartbeat_interval;
        self.invoke_timeout(builtin::COMMAND_SERVICE, &method, &[], timeout).await.map(|_| ())
    }

    /// Proxy for a declared interface, the service name derived from the interface name.
    pub fn new_instance(&self, interface: &RpcInterface) -> Result<ProxyInstance<F, P>, ConfigError> {
        ProxyInstance::new(self.clone(), interface)
    }

    pub async fn invoke(
        &self, service: &str, method: &RpcMethod, args: &[Value],
    ) -> Result<RpcValue, RpcError> {
        self.invoke_timeout(service, method, args, self.get_config().call_timeout).await
    }

    pub async fn invoke_timeout(
        &self, service: &str, method: &RpcMethod, args: &[Value], timeout: Duration,
    ) -> Result<RpcValue, RpcError> {
        let call = self.start_call(service, method, args, timeout)?;
        let id = call.ctx.request_id;
        let res = match F::IO::timeout(timeout, SlotFuture(call.slot.clone())).await {
            Ok(r) => r,
            Err(()) => match call.shared.table.evict_on_timeout(id) {
                Some(pc) => Err(pc.timeout_error()),
                // the response won the race, it's in the slot or about to be
                None => SlotFuture(call.slot.clone()).await,
            },
        };
        self.finish_call(call, res)
    }

    /// Same as [Self::invoke], blocking the current thread.
    ///
    /// Spins `spin_count` times before parking. Do not call from a runtime worker.
    pub fn invoke_blocking(
        &self, service: &str, method: &RpcMethod, args: &[Value],
    ) -> Result<RpcValue, RpcError> {
        let config = self.get_config();
        let timeout = config.call_timeout;
        let call = self.start_call(service, method, args, timeout)?;
        let id = call.ctx.request_id;
        let res = match call.slot.wait(config.spin_count, Some(timeout)) {
            Some(r) => r,
            None => match call.shared.table.evict_on_timeout(id) {
                Some(pc) => Err(pc.timeout_error()),
                None => call.slot.wait(0, None).unwrap_or_else(|| Err(RpcIntErr::Internal.into())),
            },
        };
        self.finish_call(call, res)
    }

    /// Fire-and-forget, the server sends nothing back.
    pub fn notify(&self, service: &str, method: &RpcMethod, args: &[Value]) -> Result<(), RpcError> {
        let (conn, mut ctx, req) = self.prepare(service, method, args, false)?;
        let observers = self.inner.observers.load_full();
        ctx.transition(RpcState::WriteIng, &observers);
        conn.shared().send(&Packet::Request(req))?;
        ctx.transition(RpcState::WriteFinish, &observers);
        Ok(())
    }

    /// Build a streaming call, sent by [StreamRequest::send] or lazily via
    /// [StreamRequest::lazy].
    pub fn invoke_streaming(&self, service: &str, method: &RpcMethod, args: Vec<Value>) -> StreamRequest {
        let client = self.clone();
        let service = service.to_string();
        let method = method.clone();
        StreamRequest {
            callbacks: Vec::new(),
            on_complete: None,
            timeout: None,
            executor: None,
            starter: Box::new(move |opts| client.start_stream(&service, &method, &args, opts)),
        }
    }

    #[inline]
    fn current(&self) -> Result<Arc<ClientStream<F, P>>, RpcError> {
        match self.inner.conn.load_full() {
            Some(conn) if !conn.is_closed() => Ok(conn),
            _ => Err(RpcError::Connect(format!("{} not connected", self.inner.addr))),
        }
    }

    fn prepare(
        &self, service: &str, method: &RpcMethod, args: &[Value], ack: bool,
    ) -> Result<(Arc<ClientStream<F, P>>, Pooled<RpcContext>, RequestPacket), RpcError> {
        let conn = self.current()?;
        let data = self.inner.codec.encode_request_data(args, method)?;
        let shared = conn.shared();
        let mut req = RequestPacket::new(service, &method.name, data);
        req.request_id = shared.next_id();
        req.ack = ack;
        let mut ctx = self.inner.ctx_pool.get();
        ctx.request_id = req.request_id;
        ctx.service.push_str(service);
        ctx.method.push_str(&method.name);
        ctx.local_addr.push_str(shared.local_addr());
        ctx.remote_addr.push_str(shared.peer_addr());
        ctx.args.extend_from_slice(args);
        Ok((conn, ctx, req))
    }

    fn start_call(
        &self, service: &str, method: &RpcMethod, args: &[Value], timeout: Duration,
    ) -> Result<InFlight, RpcError> {
        let (conn, mut ctx, req) = self.prepare(service, method, args, true)?;
        let shared = conn.shared().clone();
        let observers = self.inner.observers.load_full();
        let slot = ResponseSlot::new();
        let id = req.request_id;
        ctx.transition(RpcState::WriteIng, &observers);
        let pc = PendingCall::new(req.describe(), timeout, CallSink::Slot(slot.clone()));
        if let Err((e, _)) = shared.table.register(id, pc) {
            logger_error!(self.inner.logger, "{:?} {}", shared, e);
            return Err(RpcError::Connect(e.to_string()));
        }
        logger_trace!(self.inner.logger, "{:?} send {:?}", shared, req);
        if let Err(e) = shared.send(&Packet::Request(req)) {
            shared.table.resolve(id);
            return Err(e);
        }
        ctx.transition(RpcState::WriteFinish, &observers);
        ctx.transition(RpcState::ReadIng, &observers);
        Ok(InFlight { shared, ctx, observers, slot })
    }

    fn finish_call(&self, mut call: InFlight, res: CallResult) -> Result<RpcValue, RpcError> {
        let res = match res {
            Ok(resp) if resp.is_error() => {
                Err(RpcError::Response { status: resp.status, message: resp.message })
            }
            Ok(resp) => self.inner.codec.read_response(resp),
            Err(e) => Err(e),
        };
        let next = match &res {
            Ok(v) => {
                call.ctx.result = Some(v.clone());
                RpcState::ReadFinish
            }
            Err(e) => {
                call.ctx.error = Some(e.to_string());
                if e.is_timeout() {
                    logger_debug!(self.inner.logger, "{:?} {:?}: {}", call.shared, call.ctx, e);
                    RpcState::Timeout
                } else {
                    RpcState::ReadFinish
                }
            }
        };
        call.ctx.transition(next, &call.observers);
        res
    }

    fn start_stream(
        &self, service: &str, method: &RpcMethod, args: &[Value], opts: StreamOptions,
    ) -> Result<StreamingCall, RpcError> {
        let (conn, ctx, req) = self.prepare(service, method, args, true)?;
        let shared = conn.shared().clone();
        let id = req.request_id;
        let timeout = opts.timeout.unwrap_or(self.get_config().call_timeout);
        let codec: Arc<dyn DataCodec> = self.inner.codec.clone();
        let state = StreamState::new(
            ctx,
            opts.callbacks,
            opts.on_complete,
            opts.executor,
            codec,
            self.inner.observers.load_full(),
            self.inner.logger.clone(),
        );
        state.transition(RpcState::WriteIng);
        let pc = PendingCall::new(req.describe(), timeout, CallSink::Stream(state.clone()));
        if let Err((e, _)) = shared.table.register(id, pc) {
            logger_error!(self.inner.logger, "{:?} {}", shared, e);
            return Err(RpcError::Connect(e.to_string()));
        }
        if let Err(e) = shared.send(&Packet::Request(req)) {
            shared.table.resolve(id);
            return Err(e);
        }
        state.transition(RpcState::WriteFinish);
        state.transition(RpcState::ReadIng);
        let _shared = shared.clone();
        self.inner.facts.spawn_detach(async move {
            F::IO::sleep(timeout).await;
            if let Some(pc) = _shared.table.evict_on_timeout(id) {
                let e = pc.timeout_error();
                pc.complete(Err(e));
            }
        });
        Ok(StreamingCall::new(state, shared))
    }

    /// Reconnect in background when the writer of `generation` fails.
    fn broken_hook(&self, generation: u64) -> BrokenHook {
        let weak = Arc::downgrade(&self.inner);
        Box::new(move |e: &RpcError| {
            let Some(inner) = weak.upgrade() else { return };
            let client = RpcClient { inner };
            if !matches!(e, RpcError::Write(_))
                || !client.get_config().auto_reconnect
                || client.is_closed()
                || client.generation() != generation
            {
                return;
            }
            logger_info!(client.inner.logger, "{} write failed, reconnecting", client.inner.addr);
            let _client = client.clone();
            client.inner.facts.spawn_detach(async move {
                let _ = _client.reconnect().await;
            });
        })
    }
}

impl<F: ClientFacts, P: ClientTransport<F::IO>> fmt::Debug for RpcClient<F, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "client#{}({})", self.inner.id, self.inner.addr)
    }
}
