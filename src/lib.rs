#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! # nrpc
//!
//! A bidirectional binary RPC framework over TCP.
//!
//! This crate glues the workspace together with defaults: the tokio runtime ([TokioRT]),
//! the TCP transport, and the JSON payload codec. Everything underneath is re-exported, so
//! a custom runtime or transport only needs the member crates.
//!
//! ## Components
//!
//! - [`nrpc-core`](nrpc_core): config, errors, the runtime and I/O traits
//! - [`nrpc-codec`](nrpc_codec): payload codecs, json by default, msgpack with the
//!   `msgpack` feature
//! - [`nrpc-stream`](nrpc_stream): wire protocol, client and server engine
//! - [`nrpc-tokio`](nrpc_tokio): tokio adapter
//! - [`nrpc-tcp`](nrpc_tcp): tcp transport
//!
//! ## Example
//!
//! ```ignore
//! use nrpc::prelude::*;
//!
//! let (server, addr) = nrpc::serve::<JsonCodec>("127.0.0.1:0", ServerConfig::default())?;
//! server.add_instance(Arc::new(HelloService))?;
//!
//! let client = nrpc::connect::<JsonCodec>(&addr, ClientConfig::default()).await?;
//! let hello = client.new_instance(&RpcInterface::new("HelloService").method("sayHello", &["name"]))?;
//! let s: String = hello.call("sayHello", &[json!("world")]).await?;
//! ```

pub use nrpc_codec as codec;
pub use nrpc_core::{ClientConfig, Codec, ServerConfig, error, io, pool, runtime};
pub use nrpc_stream::{client, context, data, proto, registry, server};
pub use nrpc_tcp::{TcpClient, TcpServer};
pub use nrpc_tokio::TokioRT;

use nrpc_codec::JsonCodec;
use nrpc_core::error::RpcError;
use nrpc_stream::client::RpcClient;
use nrpc_stream::server::RpcServer;

/// Client over tcp on the tokio runtime
pub type Client<C = JsonCodec> = RpcClient<nrpc_tokio::ClientDefault<C>, TcpClient<TokioRT>>;

/// Server over tcp on the tokio runtime
pub type Server<C = JsonCodec> = RpcServer<nrpc_tokio::ServerDefault<C>>;

/// Connect a [Client] to `addr`. Must be called within a tokio runtime.
pub async fn connect<C: Codec>(addr: &str, config: ClientConfig) -> Result<Client<C>, RpcError> {
    let client = RpcClient::new(nrpc_tokio::client_facts::<C>(config), addr);
    client.connect().await?;
    Ok(client)
}

/// Start a [Server] listening on `addr`, return it with the bound address.
///
/// Must be called within a tokio runtime.
pub fn serve<C: Codec>(addr: &str, config: ServerConfig) -> std::io::Result<(Server<C>, String)> {
    let mut server = RpcServer::new(nrpc_tokio::server_facts::<C>(config));
    let local = server.listen::<TcpServer<TokioRT>>(addr)?;
    log::info!("nrpc server listening on {}", local);
    Ok((server, local))
}

pub mod prelude {
    pub use crate::{Client, Server};
    pub use nrpc_codec::JsonCodec;
    #[cfg(feature = "msgpack")]
    pub use nrpc_codec::MsgpCodec;
    pub use nrpc_core::error::{RpcError, RpcIntErr};
    pub use nrpc_core::{ClientConfig, ServerConfig};
    pub use nrpc_stream::client::{ChunkExecutor, ProxyInstance, StreamingCall};
    pub use nrpc_stream::data::RpcValue;
    pub use nrpc_stream::registry::{CallArgs, RpcInterface, RpcMethod, ServiceError};
    pub use nrpc_stream::server::{RpcService, ServiceDef};
    pub use serde_json::{Value, json};
    pub use std::sync::Arc;
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use super::*;

    struct HelloService;

    impl RpcService for HelloService {
        fn definition(self: Arc<Self>) -> ServiceDef {
            ServiceDef::new("HelloService").method("sayHello", &["name"], |args| async move {
                let name: String = args.arg(0)?;
                Ok(RpcValue::from(format!("hi! {}", name)))
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_say_hello() {
        let (mut server, addr) = serve::<JsonCodec>("127.0.0.1:0", ServerConfig::default()).expect("serve");
        assert_eq!(server.add_instance(Arc::new(HelloService)).expect("add"), "/helloService");
        let client = connect::<JsonCodec>(&addr, ClientConfig::default()).await.expect("connect");
        let iface = RpcInterface::new("HelloService").method("sayHello", &["name"]);
        let hello = client.new_instance(&iface).expect("proxy");
        let s: String = hello.call("sayHello", &[json!("world")]).await.expect("call");
        assert_eq!(s, "hi! world");
        client.close();
        server.close().await;
    }

    #[test]
    fn test_config_from_json() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"call_timeout": {"secs": 3, "nanos": 0}, "auto_reconnect": false}"#,
        )
        .expect("parse");
        assert_eq!(config.call_timeout, std::time::Duration::from_secs(3));
        assert!(!config.auto_reconnect);
        assert_eq!(config.max_timeout_retry, ClientConfig::default().max_timeout_retry);
    }
}
