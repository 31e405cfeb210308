//! request-id -> pending call map of one connection.
//!
//! Every removal goes through a per-key atomic remove, so a response, a timeout and a
//! connection teardown racing on the same id complete the call exactly once.

use super::chunk::StreamState;
use super::slot::ResponseSlot;
use crate::proto::ResponsePacket;
use dashmap::DashMap;
use nrpc_core::error::RpcError;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type CallResult = Result<ResponsePacket, RpcError>;

/// Where the terminal response of a call goes.
#[derive(Clone)]
pub enum CallSink {
    /// A caller waiting on a slot, blocking or async
    Slot(Arc<ResponseSlot<CallResult>>),
    /// A streaming call, chunks and completion dispatched to its executor
    Stream(Arc<StreamState>),
}

pub struct PendingCall {
    /// "service.method", for timeout messages
    pub request: String,
    pub start: Instant,
    pub deadline: Instant,
    pub sink: CallSink,
}

impl PendingCall {
    #[inline]
    pub fn new(request: String, timeout: Duration, sink: CallSink) -> Self {
        let start = Instant::now();
        let deadline = start.checked_add(timeout).unwrap_or(start + Duration::from_secs(86400));
        Self { request, start, deadline, sink }
    }

    /// Hand the outcome to the waiter.
    pub fn complete(self, result: CallResult) {
        match self.sink {
            CallSink::Slot(slot) => {
                slot.complete(result);
            }
            CallSink::Stream(state) => state.complete(result),
        }
    }

    #[inline]
    pub fn timeout_error(&self) -> RpcError {
        RpcError::Timeout { elapsed: self.start.elapsed(), request: self.request.clone() }
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "pending({} {:?})", self.request, self.start.elapsed())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("duplicate request id {0}")]
pub struct DuplicateRequestId(pub i32);

#[derive(Default)]
pub struct CorrelationTable {
    calls: DashMap<i32, PendingCall>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give the call back on error so the caller can fail it.
    pub fn register(&self, id: i32, pc: PendingCall) -> Result<(), (DuplicateRequestId, PendingCall)> {
        use dashmap::mapref::entry::Entry;
        match self.calls.entry(id) {
            Entry::Occupied(_) => Err((DuplicateRequestId(id), pc)),
            Entry::Vacant(v) => {
                v.insert(pc);
                Ok(())
            }
        }
    }

    /// Remove the entry for an arrived response. None when already evicted.
    #[inline]
    pub fn resolve(&self, id: i32) -> Option<PendingCall> {
        self.calls.remove(&id).map(|(_, pc)| pc)
    }

    /// Remove the entry on timeout. None when the response won the race.
    #[inline]
    pub fn evict_on_timeout(&self, id: i32) -> Option<PendingCall> {
        self.calls.remove(&id).map(|(_, pc)| pc)
    }

    /// Sink of a live entry, for chunk delivery
    #[inline]
    pub fn get(&self, id: i32) -> Option<CallSink> {
        self.calls.get(&id).map(|pc| pc.sink.clone())
    }

    /// Remove every entry whose deadline has passed.
    pub fn evict_expired(&self, now: Instant) -> Vec<PendingCall> {
        let expired: Vec<i32> =
            self.calls.iter().filter(|e| e.deadline <= now).map(|e| *e.key()).collect();
        expired.into_iter().filter_map(|id| self.evict_on_timeout(id)).collect()
    }

    /// Remove everything, on connection loss.
    pub fn drain(&self) -> Vec<PendingCall> {
        let ids: Vec<i32> = self.calls.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter_map(|id| self.calls.remove(&id).map(|(_, pc)| pc)).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nrpc_core::error::RpcIntErr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    fn pending(timeout: Duration) -> (PendingCall, Arc<ResponseSlot<CallResult>>) {
        let slot = ResponseSlot::new();
        (PendingCall::new("/svc.m".to_string(), timeout, CallSink::Slot(slot.clone())), slot)
    }

    #[test]
    fn test_register_resolve() {
        let table = CorrelationTable::new();
        let (pc, slot) = pending(Duration::from_secs(1));
        table.register(1, pc).expect("register");
        let (pc2, _) = pending(Duration::from_secs(1));
        let (e, _) = table.register(1, pc2).unwrap_err();
        assert_eq!(e.0, 1);
        assert!(table.get(1).is_some());
        let pc = table.resolve(1).expect("resolve");
        pc.complete(Ok(ResponsePacket::ok(1, Default::default(), vec![])));
        assert!(slot.is_done());
        assert!(table.resolve(1).is_none());
        assert!(table.evict_on_timeout(1).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_evict_expired_and_drain() {
        let table = CorrelationTable::new();
        let (pc, _) = pending(Duration::from_millis(0));
        table.register(1, pc).expect("register");
        let (pc, _) = pending(Duration::from_secs(60));
        table.register(2, pc).expect("register");
        let expired = table.evict_expired(Instant::now());
        assert_eq!(expired.len(), 1);
        assert!(expired[0].timeout_error().is_timeout());
        assert_eq!(table.len(), 1);
        let rest = table.drain();
        assert_eq!(rest.len(), 1);
        for pc in rest {
            pc.complete(Err(RpcIntErr::IO.into()));
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_exactly_once_race() {
        let table = Arc::new(CorrelationTable::new());
        for round in 0..200 {
            let (pc, _) = pending(Duration::from_secs(1));
            table.register(round, pc).expect("register");
            let wins = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(Barrier::new(2));
            let mut ths = Vec::new();
            for resolver in [true, false] {
                let (table, wins, barrier) = (table.clone(), wins.clone(), barrier.clone());
                ths.push(std::thread::spawn(move || {
                    barrier.wait();
                    let r = if resolver {
                        table.resolve(round)
                    } else {
                        table.evict_on_timeout(round)
                    };
                    if r.is_some() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                }));
            }
            for th in ths {
                th.join().unwrap();
            }
            assert_eq!(wins.load(Ordering::SeqCst), 1);
        }
        assert!(table.is_empty());
    }
}
