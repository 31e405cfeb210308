//! Periodic liveness checks and reconnection for many clients on a shared worker pool.
//!
//! Every interval the ticker pushes the registered targets that are not already being checked
//! onto a queue, least-checked first. A fixed number of workers drain the queue and ping.
//!
//! Per check:
//! - ping ok: reset the timeout counter
//! - timeout: ping again right away, up to `max_timeout_retry` times, then reconnect
//! - connection error: reconnect now
//! - anything else: log and wait for the next tick
//!
//! With `auto_reconnect` off in the scheduler's config, a check that would reconnect only
//! logs the failure.

use super::*;
use crossfire::*;
use dashmap::DashMap;
use futures::future::BoxFuture;
use nrpc_core::error::RpcError;
use nrpc_core::runtime::Ticker;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Something the scheduler can ping and reconnect, implemented by [RpcClient].
pub trait HeartbeatTarget: Send + Sync + 'static {
    /// Unique key, registering the same id again replaces the previous task
    fn id(&self) -> u64;

    fn name(&self) -> String;

    fn ping(&self) -> BoxFuture<'_, Result<(), RpcError>>;

    /// Expected to run the reconnect callback itself on success
    fn reconnect(&self) -> BoxFuture<'_, Result<(), RpcError>>;
}

impl<F: ClientFacts, P: ClientTransport<F::IO>> HeartbeatTarget for RpcClient<F, P> {
    #[inline]
    fn id(&self) -> u64 {
        RpcClient::id(self)
    }

    #[inline]
    fn name(&self) -> String {
        format!("{:?}", self)
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), RpcError>> {
        Box::pin(RpcClient::ping(self))
    }

    fn reconnect(&self) -> BoxFuture<'_, Result<(), RpcError>> {
        Box::pin(RpcClient::reconnect(self))
    }
}

struct HeartbeatTask {
    target: Arc<dyn HeartbeatTarget>,
    cancelled: AtomicBool,
    running: AtomicBool,
    check_count: AtomicU64,
}

struct SchedInner<F: ClientFacts> {
    facts: Arc<F>,
    tasks: DashMap<u64, Arc<HeartbeatTask>>,
    closed: AtomicBool,
    logger: Arc<LogFilter>,
}

pub struct HeartbeatScheduler<F: ClientFacts> {
    inner: Arc<SchedInner<F>>,
}

impl<F: ClientFacts> HeartbeatScheduler<F> {
    /// Start the ticker and `pool_size` workers, ticking at `heartbeat_interval` of the config.
    pub fn new(facts: Arc<F>, pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        let logger = facts.new_logger();
        let inner = Arc::new(SchedInner { facts, tasks: DashMap::new(), closed: AtomicBool::new(false), logger });
        let (work_tx, work_rx) = mpmc::bounded_async::<Arc<HeartbeatTask>>(pool_size * 2);
        for _ in 0..pool_size {
            let (_inner, _rx) = (inner.clone(), work_rx.clone());
            inner.facts.spawn_detach(async move { Self::worker(_inner, _rx).await });
        }
        let _inner = inner.clone();
        inner.facts.spawn_detach(async move { Self::ticker(_inner, work_tx).await });
        Self { inner }
    }

    /// Check `target` every interval, cancelling a previous task of the same id.
    pub fn register(&self, target: Arc<dyn HeartbeatTarget>) {
        let id = target.id();
        let name = target.name();
        let task = Arc::new(HeartbeatTask {
            target,
            cancelled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            check_count: AtomicU64::new(0),
        });
        if let Some(old) = self.inner.tasks.insert(id, task) {
            old.cancelled.store(true, Ordering::Release);
            logger_debug!(self.inner.logger, "heartbeat of {} replaced", name);
        } else {
            logger_debug!(self.inner.logger, "heartbeat of {} registered", name);
        }
    }

    pub fn unregister(&self, id: u64) -> bool {
        match self.inner.tasks.remove(&id) {
            Some((_, task)) => {
                task.cancelled.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Number of checks started for `id`
    pub fn check_count(&self, id: u64) -> Option<u64> {
        self.inner.tasks.get(&id).map(|t| t.check_count.load(Ordering::Acquire))
    }

    /// Stop ticking, the workers exit once the queue is drained.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for t in self.inner.tasks.iter() {
            t.cancelled.store(true, Ordering::Release);
        }
        self.inner.tasks.clear();
    }

    async fn ticker(inner: Arc<SchedInner<F>>, work_tx: MAsyncTx<Arc<HeartbeatTask>>) {
        let mut tick = F::IO::ticker(inner.facts.get_config().heartbeat_interval);
        loop {
            tick.next_tick().await;
            if inner.closed.load(Ordering::Acquire) {
                break;
            }
            let mut due: Vec<Arc<HeartbeatTask>> = inner
                .tasks
                .iter()
                .filter(|t| !t.cancelled.load(Ordering::Acquire))
                .filter(|t| {
                    t.running.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
                })
                .map(|t| t.value().clone())
                .collect();
            due.sort_by_key(|t| t.check_count.load(Ordering::Acquire));
            for task in due {
                if work_tx.send(task).await.is_err() {
                    return;
                }
            }
        }
        logger_trace!(inner.logger, "heartbeat ticker exits");
    }

    async fn worker(inner: Arc<SchedInner<F>>, work_rx: MAsyncRx<Arc<HeartbeatTask>>) {
        let max_retry = inner.facts.get_config().max_timeout_retry;
        while let Ok(task) = work_rx.recv().await {
            if !task.cancelled.load(Ordering::Acquire) {
                task.check_count.fetch_add(1, Ordering::AcqRel);
                Self::check(&inner, &task, max_retry).await;
            }
            task.running.store(false, Ordering::Release);
        }
    }

    async fn check(inner: &SchedInner<F>, task: &HeartbeatTask, max_retry: usize) {
        let target = &task.target;
        let mut timeouts = 0;
        loop {
            match target.ping().await {
                Ok(()) => return,
                Err(e) if e.is_timeout() => {
                    timeouts += 1;
                    if timeouts > max_retry {
                        logger_warn!(
                            inner.logger,
                            "heartbeat of {} timed out {} times, reconnect",
                            target.name(),
                            timeouts
                        );
                        break;
                    }
                    logger_debug!(inner.logger, "heartbeat of {} timeout, retry {}", target.name(), timeouts);
                }
                Err(e) if e.is_connect() => {
                    logger_warn!(inner.logger, "heartbeat of {}: {}, reconnect", target.name(), e);
                    break;
                }
                Err(e) => {
                    logger_warn!(inner.logger, "heartbeat of {}: {}", target.name(), e);
                    return;
                }
            }
            if task.cancelled.load(Ordering::Acquire) {
                return;
            }
        }
        if !inner.facts.get_config().auto_reconnect {
            logger_debug!(inner.logger, "heartbeat of {} failed, auto_reconnect is off", target.name());
            return;
        }
        match target.reconnect().await {
            Ok(()) => logger_info!(inner.logger, "heartbeat reconnected {}", target.name()),
            Err(e) => logger_warn!(inner.logger, "heartbeat reconnect {} failed: {}", target.name(), e),
        }
    }
}

impl<F: ClientFacts> Drop for HeartbeatScheduler<F> {
    fn drop(&mut self) {
        self.close();
    }
}
