use crate::service::HelloService;
use crate::{Codec, RT};
use nrpc_stream::server::{RpcServer, ServerConfig};
use nrpc_tcp::TcpServer;
use nrpc_tokio::ServerDefault;
use std::io;
use std::sync::Arc;
use std::time::Duration;

pub type TestServer = RpcServer<ServerDefault<Codec>>;

pub fn server_config() -> ServerConfig {
    ServerConfig { server_close_wait: Duration::from_secs(3), ..Default::default() }
}

/// Listen on a random local port with [HelloService] registered.
pub fn init_server(config: ServerConfig) -> io::Result<(TestServer, String, Arc<HelloService>)> {
    let facts = ServerDefault::<Codec>::new(config, RT::current());
    let mut server = RpcServer::new(facts);
    let svc = Arc::new(HelloService::default());
    server
        .add_instance(svc.clone())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    let addr = server.listen::<TcpServer<RT>>("127.0.0.1:0")?;
    Ok((server, addr, svc))
}
