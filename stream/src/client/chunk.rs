//! Streamed responses on the client side.
//!
//! Chunks arrive on the connection reader, which only queues them to a [ChunkExecutor]. The
//! executor runs the registered callbacks in arrival order and then acknowledges the chunk,
//! exactly once per chunk, whether or not a callback failed. The terminal response is queued
//! behind the chunks of the same call, so `on_complete` always runs last.

use super::slot::ResponseSlot;
use super::stream::ConnShared;
use super::table::CallResult;
use crate::context::{RpcContext, RpcObserver, RpcState};
use crate::data::{DataCodec, RpcValue};
use crate::proto::ResponseChunkPacket;
use captains_log::filter::LogFilter;
use crossfire::*;
use nrpc_core::error::{RpcError, RpcIntErr};
use nrpc_core::pool::Pooled;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;
use std::{fmt, io};

pub type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Invoked for every chunk of a streaming call, on the chunk executor.
pub type ChunkCallback = Box<dyn Fn(&ResponseChunkPacket) -> CallbackResult + Send + Sync>;

/// Invoked once with the outcome of a streaming call, after its last chunk callback.
pub type CompleteCallback = Box<dyn FnOnce(&Result<RpcValue, RpcError>) + Send>;

type Job = Box<dyn FnOnce() + Send>;

/// A single thread running jobs in FIFO order.
///
/// Panics inside a job are caught and logged, the thread keeps going.
#[derive(Clone)]
pub struct ChunkExecutor {
    tx: Option<MTx<Job>>,
}

impl ChunkExecutor {
    /// Spawn a dedicated thread. The thread exits after every clone is dropped.
    pub fn new(name: &str) -> io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_blocking::<Job>();
        std::thread::Builder::new().name(name.to_string()).spawn(move || {
            while let Ok(job) = rx.recv() {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    log::error!("chunk executor job panicked");
                }
            }
        })?;
        Ok(Self { tx: Some(tx) })
    }

    /// Run jobs on the calling thread, which for chunks is the connection reader.
    ///
    /// Only suitable for callbacks that never block.
    #[inline]
    pub fn inline() -> Self {
        Self { tx: None }
    }

    /// The process-wide executor used when a call does not name one.
    pub fn shared() -> Self {
        static SHARED: OnceLock<ChunkExecutor> = OnceLock::new();
        SHARED
            .get_or_init(|| match Self::new("nrpc-chunk") {
                Ok(exec) => exec,
                Err(e) => {
                    log::error!("cannot spawn chunk executor thread: {}, run inline", e);
                    Self::inline()
                }
            })
            .clone()
    }

    pub fn execute(&self, job: Job) {
        let job = match self.tx.as_ref() {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                Err(SendError(job)) => job,
            },
            None => job,
        };
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            log::error!("chunk executor job panicked");
        }
    }
}

impl fmt::Debug for ChunkExecutor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.tx.is_some() { write!(f, "ChunkExecutor(thread)") } else { write!(f, "ChunkExecutor(inline)") }
    }
}

/// Shared by the pending-call table entry and the [StreamingCall] handle.
pub(crate) struct StreamState {
    request_id: i32,
    request: String,
    callbacks: Vec<ChunkCallback>,
    on_complete: Mutex<Option<CompleteCallback>>,
    slot: Arc<ResponseSlot<Result<RpcValue, RpcError>>>,
    cancelled: AtomicBool,
    finished: AtomicBool,
    acks_sent: AtomicUsize,
    executor: ChunkExecutor,
    codec: Arc<dyn DataCodec>,
    ctx: Mutex<Pooled<RpcContext>>,
    observers: Arc<Vec<Arc<dyn RpcObserver>>>,
    logger: Arc<LogFilter>,
}

impl StreamState {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ctx: Pooled<RpcContext>, callbacks: Vec<ChunkCallback>, on_complete: Option<CompleteCallback>,
        executor: ChunkExecutor, codec: Arc<dyn DataCodec>,
        observers: Arc<Vec<Arc<dyn RpcObserver>>>, logger: Arc<LogFilter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            request_id: ctx.request_id,
            request: ctx.describe(),
            callbacks,
            on_complete: Mutex::new(on_complete),
            slot: ResponseSlot::new(),
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            acks_sent: AtomicUsize::new(0),
            executor,
            codec,
            ctx: Mutex::new(ctx),
            observers,
            logger,
        })
    }

    #[inline]
    fn lock_ctx(&self) -> MutexGuard<'_, Pooled<RpcContext>> {
        match self.ctx.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[inline]
    pub(crate) fn transition(&self, next: RpcState) -> bool {
        self.lock_ctx().transition(next, &self.observers)
    }

    #[inline]
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Called on the connection reader, must not block.
    pub(crate) fn on_chunk(self: &Arc<Self>, conn: &Arc<ConnShared>, chunk: ResponseChunkPacket) {
        if self.is_cancelled() {
            return;
        }
        let (state, conn) = (self.clone(), conn.clone());
        self.executor.execute(Box::new(move || state.run_chunk(&conn, chunk)));
    }

    fn run_chunk(&self, conn: &ConnShared, chunk: ResponseChunkPacket) {
        if self.is_cancelled() {
            return;
        }
        logger_trace!(self.logger, "{} chunk {}", self.request, chunk.chunk_id);
        for (i, cb) in self.callbacks.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| cb(&chunk))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    logger_warn!(
                        self.logger,
                        "{} chunk {} callback #{} err: {}",
                        self.request,
                        chunk.chunk_id,
                        i,
                        e
                    );
                }
                Err(_) => {
                    logger_warn!(
                        self.logger,
                        "{} chunk {} callback #{} panicked",
                        self.request,
                        chunk.chunk_id,
                        i
                    );
                }
            }
        }
        if !self.is_cancelled() && conn.send_chunk_ack(self.request_id, chunk.chunk_id) {
            self.acks_sent.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Terminal outcome from the table entry, queued behind pending chunks.
    pub(crate) fn complete(self: &Arc<Self>, result: CallResult) {
        let state = self.clone();
        self.executor.execute(Box::new(move || state.finish(result)));
    }

    fn finish(&self, result: CallResult) {
        if self.finished.swap(true, Ordering::AcqRel) {
            logger_trace!(self.logger, "{} already finished, drop {:?}", self.request, result.as_ref().err());
            return;
        }
        let result = match result {
            Ok(resp) if resp.is_error() => {
                Err(RpcError::Response { status: resp.status, message: resp.message })
            }
            Ok(resp) => self.codec.read_response(resp),
            Err(e) => Err(e),
        };
        {
            let mut ctx = self.lock_ctx();
            match &result {
                Ok(v) => ctx.result = Some(v.clone()),
                Err(e) => ctx.error = Some(e.to_string()),
            }
            let next = match &result {
                Err(e) if e.is_timeout() => RpcState::Timeout,
                _ => RpcState::ReadFinish,
            };
            ctx.transition(next, &self.observers);
        }
        let on_complete = match self.on_complete.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(cb) = on_complete {
            if catch_unwind(AssertUnwindSafe(|| cb(&result))).is_err() {
                logger_warn!(self.logger, "{} on_complete panicked", self.request);
            }
        }
        logger_debug!(self.logger, "{} stream done: {:?}", self.request, result.as_ref().err());
        self.slot.complete(result);
    }
}

/// Handle of an in-flight streaming call.
///
/// The result can be taken once, by [StreamingCall::wait] or by awaiting.
#[derive(Clone)]
pub struct StreamingCall {
    state: Arc<StreamState>,
    conn: Arc<ConnShared>,
}

impl StreamingCall {
    #[inline]
    pub(crate) fn new(state: Arc<StreamState>, conn: Arc<ConnShared>) -> Self {
        Self { state, conn }
    }

    #[inline]
    pub fn request_id(&self) -> i32 {
        self.state.request_id
    }

    /// Stop delivering chunks, no further callbacks or acks. The call completes with
    /// [RpcIntErr::Cancelled] unless it already finished.
    ///
    /// The table entry stays until the terminal response or the deadline, so chunks still
    /// in flight are recognized and left unacknowledged.
    pub fn cancel(&self) {
        if self.state.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.conn.table.get(self.state.request_id).is_some() {
            logger_debug!(self.state.logger, "{} cancelled", self.state.request);
            self.state.complete(Err(RpcIntErr::Cancelled.into()));
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.state.slot.is_done()
    }

    /// Number of chunk acks written so far
    #[inline]
    pub fn acks_sent(&self) -> usize {
        self.state.acks_sent.load(Ordering::Acquire)
    }

    /// Block the current thread until the call finishes.
    #[inline]
    pub fn wait(&self) -> Result<RpcValue, RpcError> {
        self.state.slot.wait(0, None).unwrap_or_else(|| Err(RpcIntErr::Internal.into()))
    }

    /// Block at most `timeout`. The call keeps running if the wait gives up.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<RpcValue, RpcError> {
        match self.state.slot.wait(0, Some(timeout)) {
            Some(r) => r,
            None if self.is_done() => Err(RpcIntErr::Internal.into()),
            None => Err(RpcError::Timeout { elapsed: timeout, request: self.state.request.clone() }),
        }
    }
}

impl Future for StreamingCall {
    type Output = Result<RpcValue, RpcError>;

    #[inline]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.state.slot.poll_result(cx)
    }
}

impl fmt::Debug for StreamingCall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "stream(id={} {})", self.state.request_id, self.state.request)
    }
}

/// Builder of a streaming call, see [RpcClient::invoke_streaming](super::RpcClient::invoke_streaming).
pub struct StreamRequest {
    pub(crate) callbacks: Vec<ChunkCallback>,
    pub(crate) on_complete: Option<CompleteCallback>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) executor: Option<ChunkExecutor>,
    pub(crate) starter: Box<dyn FnOnce(StreamOptions) -> Result<StreamingCall, RpcError> + Send>,
}

/// What a [StreamRequest] collected, handed to the client on send.
pub(crate) struct StreamOptions {
    pub callbacks: Vec<ChunkCallback>,
    pub on_complete: Option<CompleteCallback>,
    pub timeout: Option<Duration>,
    pub executor: ChunkExecutor,
}

impl StreamRequest {
    /// Add a chunk callback, callbacks run in the order they were added.
    pub fn on_chunk<C>(mut self, cb: C) -> Self
    where
        C: Fn(&ResponseChunkPacket) -> CallbackResult + Send + Sync + 'static,
    {
        self.callbacks.push(Box::new(cb));
        self
    }

    pub fn on_complete<C>(mut self, cb: C) -> Self
    where
        C: FnOnce(&Result<RpcValue, RpcError>) + Send + 'static,
    {
        self.on_complete = Some(Box::new(cb));
        self
    }

    /// Bound on the whole call, the client's call_timeout by default.
    #[inline]
    pub fn timeout(mut self, d: Duration) -> Self {
        self.timeout = Some(d);
        self
    }

    /// Run callbacks on `exec` instead of [ChunkExecutor::shared].
    #[inline]
    pub fn executor(mut self, exec: ChunkExecutor) -> Self {
        self.executor = Some(exec);
        self
    }

    /// Send the request now.
    pub fn send(self) -> Result<StreamingCall, RpcError> {
        let opts = StreamOptions {
            callbacks: self.callbacks,
            on_complete: self.on_complete,
            timeout: self.timeout,
            executor: self.executor.unwrap_or_else(ChunkExecutor::shared),
        };
        (self.starter)(opts)
    }

    /// Defer sending until the completion is first awaited or started.
    #[inline]
    pub fn lazy(self) -> ChunkedCompletion {
        ChunkedCompletion::new(self)
    }
}

enum LazyState {
    Idle(Option<StreamRequest>),
    Started(StreamingCall),
    /// Every waiter gets a copy of the send error
    Failed(RpcError),
}

/// A streaming call that is only sent by the first [ChunkedCompletion::start], await, or
/// combinator.
pub struct ChunkedCompletion {
    started: AtomicBool,
    state: Mutex<LazyState>,
}

impl ChunkedCompletion {
    fn new(req: StreamRequest) -> Self {
        Self { started: AtomicBool::new(false), state: Mutex::new(LazyState::Idle(Some(req))) }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, LazyState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Issue the request. Returns false if it was already started.
    ///
    /// The request is sent under the state lock, so a concurrent waiter never sees a started
    /// call that is still idle.
    pub fn start(&self) -> bool {
        if self.started.load(Ordering::Acquire) {
            return false;
        }
        let mut state = self.lock();
        let LazyState::Idle(req) = &mut *state else {
            return false;
        };
        let Some(req) = req.take() else {
            return false;
        };
        self.started.store(true, Ordering::Release);
        *state = match req.send() {
            Ok(call) => LazyState::Started(call),
            Err(e) => LazyState::Failed(e),
        };
        true
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// The underlying call, once started and sent successfully.
    pub fn call(&self) -> Option<StreamingCall> {
        if let LazyState::Started(call) = &*self.lock() { Some(call.clone()) } else { None }
    }

    fn failure(&self) -> Option<RpcError> {
        if let LazyState::Failed(e) = &*self.lock() { Some(e.clone()) } else { None }
    }

    /// Start if needed and block until the call finishes.
    pub fn wait_blocking(&self, timeout: Option<Duration>) -> Result<RpcValue, RpcError> {
        self.start();
        if let Some(e) = self.failure() {
            return Err(e);
        }
        match (self.call(), timeout) {
            (Some(call), Some(d)) => call.wait_timeout(d),
            (Some(call), None) => call.wait(),
            (None, _) => Err(RpcIntErr::Internal.into()),
        }
    }

    pub async fn map<T, M>(self, f: M) -> Result<T, RpcError>
    where
        M: FnOnce(RpcValue) -> T,
    {
        self.await.map(f)
    }

    pub async fn then<T, M>(self, f: M) -> Result<T, RpcError>
    where
        M: FnOnce(RpcValue) -> Result<T, RpcError>,
    {
        f(self.await?)
    }
}

impl Future for ChunkedCompletion {
    type Output = Result<RpcValue, RpcError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.start();
        let mut state = self.lock();
        match &mut *state {
            LazyState::Started(call) => Pin::new(call).poll(cx),
            LazyState::Failed(e) => Poll::Ready(Err(e.clone())),
            // start() leaves Idle under the same lock
            LazyState::Idle(_) => Poll::Ready(Err(RpcIntErr::Internal.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    #[test]
    fn test_executor_fifo_and_panic() {
        let exec = ChunkExecutor::new("test-chunk").expect("spawn");
        let (tx, rx) = std_mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            exec.execute(Box::new(move || {
                if i == 3 {
                    panic!("callback failure");
                }
                tx.send(i).expect("send");
            }));
        }
        drop(tx);
        let got: Vec<i32> = rx.iter().collect();
        assert_eq!(got, vec![0, 1, 2, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_executor_inline() {
        let exec = ChunkExecutor::inline();
        let hit = Arc::new(AtomicUsize::new(0));
        let _hit = hit.clone();
        exec.execute(Box::new(move || {
            _hit.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hit.load(Ordering::SeqCst), 1);
        exec.execute(Box::new(|| panic!("swallowed")));
    }

    #[test]
    fn test_lazy_start_once() {
        let starts = Arc::new(AtomicUsize::new(0));
        let _starts = starts.clone();
        let req = StreamRequest {
            callbacks: Vec::new(),
            on_complete: None,
            timeout: None,
            executor: Some(ChunkExecutor::inline()),
            starter: Box::new(move |_opts| {
                _starts.fetch_add(1, Ordering::SeqCst);
                Err(RpcError::Connect("not connected".to_string()))
            }),
        };
        let lazy = req.lazy();
        assert!(!lazy.is_started());
        assert_eq!(starts.load(Ordering::SeqCst), 0);
        assert!(lazy.start());
        assert!(!lazy.start());
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        let r = futures::executor::block_on(lazy);
        assert!(r.unwrap_err().is_connect());
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lazy_start_race() {
        for _ in 0..100 {
            let starts = Arc::new(AtomicUsize::new(0));
            let _starts = starts.clone();
            let req = StreamRequest {
                callbacks: Vec::new(),
                on_complete: None,
                timeout: None,
                executor: Some(ChunkExecutor::inline()),
                starter: Box::new(move |_opts| {
                    _starts.fetch_add(1, Ordering::SeqCst);
                    // a slow send widens the window for the other thread
                    std::thread::sleep(Duration::from_millis(2));
                    Err(RpcError::Connect("not connected".to_string()))
                }),
            };
            let lazy = Arc::new(req.lazy());
            let barrier = Arc::new(std::sync::Barrier::new(2));
            let ths: Vec<_> = (0..2)
                .map(|_| {
                    let (lazy, barrier) = (lazy.clone(), barrier.clone());
                    std::thread::spawn(move || {
                        barrier.wait();
                        lazy.wait_blocking(Some(Duration::from_secs(1)))
                    })
                })
                .collect();
            for th in ths {
                // the waiter losing the race must not see the call still idle
                let r = th.join().expect("join");
                assert!(matches!(r, Err(ref e) if e.is_connect()), "{:?}", r);
            }
            assert_eq!(starts.load(Ordering::SeqCst), 1);
        }
    }
}
