use crate::client::*;
use crate::server::*;
use crate::service::hello_interface;
use crate::*;
use futures::future::BoxFuture;
use nrpc_core::error::RpcError;
use nrpc_stream::client::ClientConfig;
use nrpc_stream::client::heartbeat::{HeartbeatScheduler, HeartbeatTarget};
use nrpc_tokio::ClientDefault;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Ping always fails with `err`
struct FailingTarget {
    id: u64,
    err: fn() -> RpcError,
    pings: AtomicUsize,
    reconnects: AtomicUsize,
}

impl FailingTarget {
    fn new(id: u64, err: fn() -> RpcError) -> Arc<Self> {
        Arc::new(Self { id, err, pings: AtomicUsize::new(0), reconnects: AtomicUsize::new(0) })
    }
}

impl HeartbeatTarget for FailingTarget {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> String {
        format!("failing#{}", self.id)
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), RpcError>> {
        self.pings.fetch_add(1, Ordering::AcqRel);
        let e = (self.err)();
        Box::pin(async move { Err(e) })
    }

    fn reconnect(&self) -> BoxFuture<'_, Result<(), RpcError>> {
        self.reconnects.fetch_add(1, Ordering::AcqRel);
        Box::pin(async { Ok(()) })
    }
}

fn hb_config() -> ClientConfig {
    ClientConfig {
        heartbeat_interval: Duration::from_millis(50),
        max_timeout_retry: 2,
        ..Default::default()
    }
}

async fn wait_until(f: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while !f() {
        if start.elapsed() > Duration::from_secs(3) {
            return false;
        }
        RT::sleep(Duration::from_millis(10)).await;
    }
    true
}

#[logfn]
#[rstest]
fn test_heartbeat_retry_then_reconnect(runner: TestRunner) {
    runner.block_on(async move {
        let facts = ClientDefault::<Codec>::new(hb_config(), RT::current());
        let scheduler = HeartbeatScheduler::new(facts, 2);
        let timeout = FailingTarget::new(1001, || RpcError::Timeout {
            elapsed: Duration::from_millis(50),
            request: "/_command.ping".to_string(),
        });
        let refused = FailingTarget::new(1002, || RpcError::Connect("refused".to_string()));
        scheduler.register(timeout.clone());
        scheduler.register(refused.clone());
        assert_eq!(scheduler.len(), 2);

        assert!(wait_until(|| timeout.reconnects.load(Ordering::Acquire) >= 1).await);
        // the first reconnect comes after max_timeout_retry retries
        assert!(timeout.pings.load(Ordering::Acquire) >= 3);
        assert!(wait_until(|| refused.reconnects.load(Ordering::Acquire) >= 1).await);
        assert!(scheduler.check_count(1001).unwrap_or(0) >= 1);

        assert!(scheduler.unregister(1002));
        assert!(!scheduler.unregister(1002));
        assert_eq!(scheduler.len(), 1);
        scheduler.close();
        assert_eq!(scheduler.len(), 0);
    });
}

#[logfn]
#[rstest]
fn test_heartbeat_without_auto_reconnect(runner: TestRunner) {
    runner.block_on(async move {
        let config = ClientConfig { auto_reconnect: false, ..hb_config() };
        let facts = ClientDefault::<Codec>::new(config, RT::current());
        let scheduler = HeartbeatScheduler::new(facts, 1);
        let refused = FailingTarget::new(1003, || RpcError::Connect("refused".to_string()));
        scheduler.register(refused.clone());
        // several checks fail, none of them reconnects
        assert!(wait_until(|| scheduler.check_count(1003).unwrap_or(0) >= 3).await);
        assert!(refused.pings.load(Ordering::Acquire) >= 3);
        assert_eq!(refused.reconnects.load(Ordering::Acquire), 0);
        scheduler.close();
    });
}

#[logfn]
#[rstest]
fn test_heartbeat_live_client(runner: TestRunner) {
    runner.block_on(async move {
        let (mut server, addr, _svc) = init_server(server_config()).expect("listen");
        let client = init_client(hb_config(), &addr).await.expect("connect");
        let facts = ClientDefault::<Codec>::new(hb_config(), RT::current());
        let scheduler = HeartbeatScheduler::new(facts, 1);
        scheduler.register(Arc::new(client.clone()));
        let id = client.id();
        assert!(wait_until(|| scheduler.check_count(id).unwrap_or(0) >= 3).await);
        // healthy pings never reconnect
        assert_eq!(client.generation(), 1);
        assert!(client.is_active());
        scheduler.close();
        client.close();
        server.close().await;
    });
}

#[logfn]
#[rstest]
fn test_reconnect(runner: TestRunner) {
    runner.block_on(async move {
        let (mut server, addr, _svc) = init_server(server_config()).expect("listen");
        let client = init_client(ClientConfig::default(), &addr).await.expect("connect");
        let reconnected = Arc::new(AtomicU64::new(0));
        let _reconnected = reconnected.clone();
        client.set_on_reconnect_success(move |generation| {
            _reconnected.store(generation, Ordering::Release);
        });
        assert_eq!(client.generation(), 1);
        client.reconnect().await.expect("reconnect");
        assert_eq!(client.generation(), 2);
        assert_eq!(reconnected.load(Ordering::Acquire), 2);
        let hello = client.new_instance(&hello_interface()).expect("proxy");
        let s: String = hello.call("sayHello", &[json!("back")]).await.expect("call");
        assert_eq!(s, "hi! back");
        client.close();
        assert!(client.reconnect().await.is_err());
        server.close().await;
    });
}
