//! Per-call state on the client side.

use crate::data::RpcValue;
use nrpc_core::pool::Recycle;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Life cycle of one call, only moves forward.
///
/// `Init -> WriteIng -> WriteFinish -> ReadIng -> ReadFinish`, or `Timeout` from
/// `WriteFinish` / `ReadIng`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum RpcState {
    #[default]
    Init = 0,
    WriteIng = 1,
    WriteFinish = 2,
    ReadIng = 3,
    ReadFinish = 4,
    Timeout = 5,
}

impl RpcState {
    #[inline]
    pub fn can_move_to(self, next: RpcState) -> bool {
        use RpcState::*;
        matches!(
            (self, next),
            (Init, WriteIng)
                | (WriteIng, WriteFinish)
                | (WriteFinish, ReadIng)
                | (ReadIng, ReadFinish)
                | (WriteFinish, Timeout)
                | (ReadIng, Timeout)
        )
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, RpcState::ReadFinish | RpcState::Timeout)
    }
}

/// Hook notified on every state transition of a client call.
///
/// Called synchronously by the thread making the transition, for a streaming call that may
/// be the chunk executor.
pub trait RpcObserver: Send + Sync + 'static {
    fn on_state_change(&self, ctx: &RpcContext, prev: RpcState);
}

/// Transient state of one call, pooled and reset after completion.
#[derive(Default)]
pub struct RpcContext {
    pub request_id: i32,
    pub service: String,
    pub method: String,
    pub local_addr: String,
    pub remote_addr: String,
    state: RpcState,
    pub start: Option<Instant>,
    pub end: Option<Instant>,
    pub args: Vec<Value>,
    pub result: Option<RpcValue>,
    pub error: Option<String>,
}

impl RpcContext {
    #[inline]
    pub fn state(&self) -> RpcState {
        self.state
    }

    /// Move to `next` and notify observers. Illegal moves are ignored and return false.
    pub fn transition(&mut self, next: RpcState, observers: &[Arc<dyn RpcObserver>]) -> bool {
        if !self.state.can_move_to(next) {
            return false;
        }
        let prev = self.state;
        self.state = next;
        match next {
            RpcState::WriteIng => self.start = Some(Instant::now()),
            RpcState::ReadFinish | RpcState::Timeout => self.end = Some(Instant::now()),
            _ => {}
        }
        for o in observers {
            o.on_state_change(self, prev);
        }
        true
    }

    /// "service.method"
    #[inline]
    pub fn describe(&self) -> String {
        format!("{}.{}", self.service, self.method)
    }
}

impl Recycle for RpcContext {
    fn reset(&mut self) {
        self.request_id = 0;
        self.service.clear();
        self.method.clear();
        self.local_addr.clear();
        self.remote_addr.clear();
        self.state = RpcState::Init;
        self.start = None;
        self.end = None;
        self.args.clear();
        self.result = None;
        self.error = None;
    }
}

impl fmt::Debug for RpcContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ctx(id={} {}.{} {:?} -> {})",
            self.request_id, self.service, self.method, self.state, self.remote_addr
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(RpcState, RpcState)>>);

    impl RpcObserver for Recorder {
        fn on_state_change(&self, ctx: &RpcContext, prev: RpcState) {
            self.0.lock().unwrap().push((prev, ctx.state()));
        }
    }

    #[test]
    fn test_state_machine() {
        let rec = Arc::new(Recorder::default());
        let observers: Vec<Arc<dyn RpcObserver>> = vec![rec.clone()];
        let mut ctx = RpcContext::default();
        assert!(!ctx.transition(RpcState::ReadIng, &observers));
        assert!(ctx.transition(RpcState::WriteIng, &observers));
        assert!(ctx.transition(RpcState::WriteFinish, &observers));
        assert!(ctx.transition(RpcState::ReadIng, &observers));
        assert!(ctx.transition(RpcState::Timeout, &observers));
        // no way back, no second terminal state
        assert!(!ctx.transition(RpcState::ReadFinish, &observers));
        assert!(!ctx.transition(RpcState::WriteIng, &observers));
        assert!(ctx.state().is_terminal());
        assert!(ctx.start.is_some() && ctx.end.is_some());
        assert_eq!(rec.0.lock().unwrap().len(), 4);

        ctx.service.push_str("/helloService");
        ctx.reset();
        assert_eq!(ctx.state(), RpcState::Init);
        assert!(ctx.service.is_empty() && ctx.start.is_none());
    }
}
