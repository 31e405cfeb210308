use crate::{Codec, RT};
use nrpc_core::error::RpcError;
use nrpc_stream::client::{ClientConfig, RpcClient};
use nrpc_tcp::TcpClient;
use nrpc_tokio::ClientDefault;

pub type TestClient = RpcClient<ClientDefault<Codec>, TcpClient<RT>>;

/// Create and connect a client to `addr`.
pub async fn init_client(config: ClientConfig, addr: &str) -> Result<TestClient, RpcError> {
    let facts = ClientDefault::<Codec>::new(config, RT::current());
    let client = RpcClient::new(facts, addr);
    client.connect().await?;
    Ok(client)
}
