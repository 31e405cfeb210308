//! The service the tests talk to.

use crate::{AsyncIO, RT};
use nrpc_stream::data::RpcValue;
use nrpc_stream::registry::{CallArgs, RpcInterface, ServiceError};
use nrpc_stream::server::{ChunkProgress, RpcService, ServiceDef};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const HELLO: &str = "HelloService";

/// `/helloService`
///
/// - `sayHello(name)` -> `"hi! {name}"`
/// - `slowHello(name, delayMillis)`, same reply after sleeping
/// - `countdown(n)` streams `n` chunks, then returns `"done"`
/// - `slowCountdown(n, delayMillis)`, countdown after sleeping
/// - `record(msg)` counts calls, meant for fire-and-forget
/// - `failWith(msg)` counts calls and fails with `msg`
/// - `blob(size)` returns `size` raw bytes
#[derive(Default)]
pub struct HelloService {
    recorded: AtomicUsize,
    failed: AtomicUsize,
    streams: Mutex<Vec<Arc<ChunkProgress>>>,
}

impl HelloService {
    #[inline]
    pub fn recorded(&self) -> usize {
        self.recorded.load(Ordering::Acquire)
    }

    #[inline]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Acquire)
    }

    /// Ack counters of every countdown served, in arrival order.
    pub fn streams(&self) -> Vec<Arc<ChunkProgress>> {
        match self.streams.lock() {
            Ok(g) => g.clone(),
            Err(_) => Vec::new(),
        }
    }
}

impl HelloService {
    fn countdown(&self, args: &CallArgs, n: usize) -> Result<RpcValue, ServiceError> {
        if let Ok(mut g) = self.streams.lock() {
            g.push(args.chunks.progress());
        }
        for i in 0..n {
            args.chunks.send(RpcValue::from(format!("chunk {}", i)))?;
        }
        Ok(RpcValue::from("done"))
    }
}

impl RpcService for HelloService {
    fn definition(self: Arc<Self>) -> ServiceDef {
        let (s1, s2, s3, s4) = (self.clone(), self.clone(), self.clone(), self);
        ServiceDef::new(HELLO)
            .method("sayHello", &["name"], |args| async move {
                let name: String = args.arg(0)?;
                Ok(RpcValue::from(format!("hi! {}", name)))
            })
            .method("slowHello", &["name", "delayMillis"], |args| async move {
                let name: String = args.arg(0)?;
                let delay: u64 = args.arg(1)?;
                RT::sleep(Duration::from_millis(delay)).await;
                Ok(RpcValue::from(format!("hi! {}", name)))
            })
            .method("countdown", &["n"], move |args| {
                let s = s1.clone();
                async move {
                    let n: usize = args.arg(0)?;
                    s.countdown(&args, n)
                }
            })
            .method("slowCountdown", &["n", "delayMillis"], move |args| {
                let s = s2.clone();
                async move {
                    let n: usize = args.arg(0)?;
                    let delay: u64 = args.arg(1)?;
                    RT::sleep(Duration::from_millis(delay)).await;
                    s.countdown(&args, n)
                }
            })
            .method("record", &["msg"], move |args| {
                let s = s3.clone();
                async move {
                    let msg: String = args.arg(0)?;
                    debug!("record {}", msg);
                    s.recorded.fetch_add(1, Ordering::AcqRel);
                    Ok(RpcValue::null())
                }
            })
            .method("failWith", &["msg"], move |args| {
                let s = s4.clone();
                async move {
                    let msg: String = args.arg(0)?;
                    s.failed.fetch_add(1, Ordering::AcqRel);
                    Err(ServiceError::new(msg))
                }
            })
            .method("blob", &["size"], |args| async move {
                let size: usize = args.arg(0)?;
                Ok(RpcValue::Bytes(vec![b'b'; size]))
            })
    }
}

/// Client-side declaration of [HelloService]
pub fn hello_interface() -> RpcInterface {
    RpcInterface::new(HELLO)
        .method("sayHello", &["name"])
        .method("slowHello", &["name", "delayMillis"])
        .method("countdown", &["n"])
        .method("slowCountdown", &["n", "delayMillis"])
        .method("record", &["msg"])
        .method("failWith", &["msg"])
        .method("blob", &["size"])
}
