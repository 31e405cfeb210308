use super::RespNoti;
use crate::data::{DataCodec, RpcValue};
use crate::proto::{Packet, ResponseChunkPacket};
use crate::registry::{
    CallArgs, Invoker, MethodRegistry, NamingStrategy, RpcMethod, ServiceError,
};
use dashmap::DashMap;
use futures::future::BoxFuture;
use nrpc_core::error::ConfigError;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};

/// A service implementation registered on the server.
///
/// Methods are declared explicitly with their parameter names:
///
/// ```ignore
/// impl RpcService for HelloService {
///     fn definition(self: Arc<Self>) -> ServiceDef {
///         ServiceDef::new("HelloService").method("sayHello", &["name"], move |args| {
///             let svc = self.clone();
///             async move { Ok(svc.say_hello(&args.arg::<String>(0)?).into()) }
///         })
///     }
/// }
/// ```
pub trait RpcService: Send + Sync + 'static {
    fn definition(self: Arc<Self>) -> ServiceDef;
}

/// Interface name plus methods with their handlers.
pub struct ServiceDef {
    interface: String,
    naming: NamingStrategy,
    methods: Vec<RpcMethod>,
}

impl ServiceDef {
    pub fn new(interface: &str) -> Self {
        Self { interface: interface.to_string(), naming: NamingStrategy::AsIs, methods: Vec::new() }
    }

    /// Rewrite method names on registration
    #[inline]
    pub fn naming(mut self, naming: NamingStrategy) -> Self {
        self.naming = naming;
        self
    }

    pub fn method<H, Fut>(mut self, name: &str, params: &[&str], handler: H) -> Self
    where
        H: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RpcValue, ServiceError>> + Send + 'static,
    {
        let invoker: Invoker =
            Arc::new(move |args| -> BoxFuture<'static, _> { Box::pin(handler(args)) });
        let mut m = RpcMethod::declare(name, params);
        m.invoker = Some(invoker);
        self.methods.push(m);
        self
    }

    #[inline]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn into_registry(self) -> Result<MethodRegistry, ConfigError> {
        MethodRegistry::build(&self.interface, self.methods, self.naming)
    }
}

impl fmt::Debug for ServiceDef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{:?}", self.interface, self.methods)
    }
}

/// Chunks emitted for one request and acks seen for them.
#[derive(Default, Debug)]
pub struct ChunkProgress {
    sent: AtomicUsize,
    acked: AtomicUsize,
    finished: AtomicBool,
}

impl ChunkProgress {
    #[inline]
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Acquire)
    }

    #[inline]
    pub fn acked(&self) -> usize {
        self.acked.load(Ordering::Acquire)
    }

    #[inline]
    fn settled(&self) -> bool {
        self.finished.load(Ordering::Acquire) && self.acked() >= self.sent()
    }
}

/// Finished streams still waiting for acks, per connection. Past this the oldest is dropped.
pub const ACK_LINGER_MAX: usize = 64;

/// Per-connection table of streaming requests awaiting chunk acks.
///
/// Acks only feed counters, nothing waits on them. An entry goes away once its response is
/// finished and every sent chunk is acked. A client that stops acking (a cancelled call)
/// leaves finished entries behind, at most [ACK_LINGER_MAX] of them are kept.
#[derive(Default)]
pub struct AckTracker {
    streams: DashMap<i32, Arc<ChunkProgress>>,
    lingering: Mutex<VecDeque<i32>>,
}

impl AckTracker {
    fn progress(&self, request_id: i32) -> Arc<ChunkProgress> {
        self.streams.entry(request_id).or_default().clone()
    }

    /// Returns false for a request with no chunk outstanding.
    pub fn on_ack(&self, request_id: i32) -> bool {
        let Some(p) = self.streams.get(&request_id).map(|p| p.clone()) else {
            return false;
        };
        p.acked.fetch_add(1, Ordering::AcqRel);
        if p.settled() {
            self.streams.remove(&request_id);
        }
        true
    }

    /// The terminal response of `request_id` is out.
    pub fn finish(&self, request_id: i32) {
        let Some(p) = self.streams.get(&request_id).map(|p| p.clone()) else {
            return;
        };
        p.finished.store(true, Ordering::Release);
        if p.settled() {
            self.streams.remove(&request_id);
            return;
        }
        let evicted = {
            let mut q = match self.lingering.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            q.push_back(request_id);
            if q.len() > ACK_LINGER_MAX { q.pop_front() } else { None }
        };
        if let Some(id) = evicted {
            self.streams.remove_if(&id, |_, p| p.finished.load(Ordering::Acquire));
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.streams.len()
    }
}

/// Emits response chunks ahead of the terminal response of one request.
///
/// A fire-and-forget request gets a detached sender, which drops every chunk.
#[derive(Clone)]
pub struct ChunkSender {
    request_id: i32,
    noti: Option<RespNoti>,
    codec: Option<Arc<dyn DataCodec>>,
    tracker: Option<Arc<AckTracker>>,
    next_chunk: Arc<AtomicI32>,
    progress: Arc<OnceLock<Arc<ChunkProgress>>>,
}

impl ChunkSender {
    pub(crate) fn new(
        request_id: i32, noti: RespNoti, codec: Arc<dyn DataCodec>, tracker: Arc<AckTracker>,
    ) -> Self {
        Self {
            request_id,
            noti: Some(noti),
            codec: Some(codec),
            tracker: Some(tracker),
            next_chunk: Arc::new(AtomicI32::new(0)),
            progress: Arc::new(OnceLock::new()),
        }
    }

    pub fn detached(request_id: i32) -> Self {
        Self {
            request_id,
            noti: None,
            codec: None,
            tracker: None,
            next_chunk: Arc::new(AtomicI32::new(0)),
            progress: Arc::new(OnceLock::new()),
        }
    }

    #[inline]
    pub fn is_detached(&self) -> bool {
        self.noti.is_none()
    }

    /// Counters of this request, shared with the connection's ack tracker.
    pub fn progress(&self) -> Arc<ChunkProgress> {
        self.progress
            .get_or_init(|| match self.tracker.as_ref() {
                Some(t) => t.progress(self.request_id),
                None => Arc::new(ChunkProgress::default()),
            })
            .clone()
    }

    /// Send one chunk, return its chunk id.
    pub fn send(&self, value: RpcValue) -> Result<i32, ServiceError> {
        let chunk_id = self.next_chunk.fetch_add(1, Ordering::Relaxed);
        let (Some(noti), Some(codec)) = (self.noti.as_ref(), self.codec.as_ref()) else {
            return Ok(chunk_id);
        };
        let progress = self.progress();
        let resp = codec.build_response(self.request_id, value)?;
        progress.sent.fetch_add(1, Ordering::AcqRel);
        if noti.send(Packet::Chunk(ResponseChunkPacket { resp, chunk_id })).is_err() {
            progress.sent.fetch_sub(1, Ordering::AcqRel);
            return Err(ServiceError::new("connection closed"));
        }
        Ok(chunk_id)
    }

    #[inline]
    pub fn acked(&self) -> usize {
        self.progress.get().map(|p| p.acked()).unwrap_or(0)
    }
}

impl fmt::Debug for ChunkSender {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "chunks(id={} next={})", self.request_id, self.next_chunk.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossfire::*;
    use nrpc_codec::JsonCodec;

    #[test]
    fn test_chunk_sender() {
        let (tx, rx) = mpsc::unbounded_blocking::<Packet>();
        let tracker = Arc::new(AckTracker::default());
        let chunks = ChunkSender::new(7, RespNoti::new(tx), Arc::new(JsonCodec::default()), tracker.clone());
        assert_eq!(chunks.send(RpcValue::from("a")).expect("send"), 0);
        assert_eq!(chunks.send(RpcValue::Bytes(b"b".to_vec())).expect("send"), 1);
        for expect in 0..2 {
            match rx.recv().expect("recv") {
                Packet::Chunk(c) => {
                    assert_eq!(c.request_id, 7);
                    assert_eq!(c.chunk_id, expect);
                }
                p => panic!("unexpected {:?}", p),
            }
        }
        let progress = chunks.progress();
        assert_eq!(progress.sent(), 2);
        assert!(tracker.on_ack(7));
        tracker.finish(7);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.on_ack(7));
        // settled
        assert_eq!(tracker.len(), 0);
        assert_eq!(chunks.acked(), 2);
        assert!(!tracker.on_ack(7));
    }

    #[test]
    fn test_unacked_streams_bounded() {
        let tracker = AckTracker::default();
        let total = ACK_LINGER_MAX as i32 + 10;
        for id in 0..total {
            tracker.progress(id).sent.fetch_add(2, Ordering::AcqRel);
            tracker.finish(id);
        }
        assert_eq!(tracker.len(), ACK_LINGER_MAX);
        // the oldest were dropped
        assert!(!tracker.on_ack(0));
        assert!(!tracker.on_ack(9));
        let last = total - 1;
        assert!(tracker.on_ack(last));
        assert!(tracker.on_ack(last));
        assert_eq!(tracker.len(), ACK_LINGER_MAX - 1);

        // a live stream is never dropped for lingering ones
        tracker.progress(1000).sent.fetch_add(1, Ordering::AcqRel);
        for id in 2000..2000 + total {
            tracker.progress(id).sent.fetch_add(1, Ordering::AcqRel);
            tracker.finish(id);
        }
        assert!(tracker.on_ack(1000));
    }

    #[test]
    fn test_detached() {
        let chunks = ChunkSender::detached(1);
        assert!(chunks.is_detached());
        assert_eq!(chunks.send(RpcValue::null()).expect("send"), 0);
        assert_eq!(chunks.acked(), 0);
    }

    #[test]
    fn test_service_def() {
        let def = ServiceDef::new("HelloService")
            .naming(NamingStrategy::LowerCamel)
            .method("SayHello", &["name"], |args| async move {
                let name: String = args.arg(0)?;
                Ok(RpcValue::from(format!("hi! {}", name)))
            });
        assert_eq!(def.interface(), "HelloService");
        let reg = def.into_registry().expect("registry");
        let m = reg.get("sayHello").expect("method");
        assert!(m.invoker.is_some());
        assert_eq!(m.param_names, vec!["name".to_string()]);
        assert!(ServiceDef::new("Empty").into_registry().is_err());
    }
}
