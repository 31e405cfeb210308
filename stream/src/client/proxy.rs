use super::*;
use crate::data::RpcValue;
use crate::registry::{MethodRegistry, NamingStrategy, RpcInterface, RpcMethod, service_name_of};
use nrpc_core::error::{ConfigError, RpcError};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Client-side view of one remote service.
///
/// Methods are looked up in the declared interface before anything is sent, an undeclared
/// name fails locally with [RpcIntErr::Method].
pub struct ProxyInstance<F: ClientFacts, P: ClientTransport<F::IO>> {
    client: RpcClient<F, P>,
    service: String,
    methods: MethodRegistry,
}

impl<F: ClientFacts, P: ClientTransport<F::IO>> Clone for ProxyInstance<F, P> {
    fn clone(&self) -> Self {
        Self { client: self.client.clone(), service: self.service.clone(), methods: self.methods.clone() }
    }
}

impl<F: ClientFacts, P: ClientTransport<F::IO>> ProxyInstance<F, P> {
    pub fn new(client: RpcClient<F, P>, interface: &RpcInterface) -> Result<Self, ConfigError> {
        Self::with_name(client, interface, &service_name_of(&interface.name))
    }

    /// Bind to a service registered under an explicit name.
    pub fn with_name(
        client: RpcClient<F, P>, interface: &RpcInterface, service: &str,
    ) -> Result<Self, ConfigError> {
        if service.is_empty() || service.len() > u8::MAX as usize {
            return Err(ConfigError::InvalidName(service.to_string()));
        }
        let methods = MethodRegistry::from_interface(interface, NamingStrategy::AsIs)?;
        Ok(Self { client, service: service.to_string(), methods })
    }

    #[inline]
    pub fn service_name(&self) -> &str {
        &self.service
    }

    #[inline]
    pub fn client(&self) -> &RpcClient<F, P> {
        &self.client
    }

    #[inline]
    fn method(&self, name: &str) -> Result<&RpcMethod, RpcError> {
        match self.methods.get(name) {
            Some(m) => Ok(m.as_ref()),
            None => Err(RpcIntErr::Method.into()),
        }
    }

    pub async fn invoke(&self, method: &str, args: &[Value]) -> Result<RpcValue, RpcError> {
        let m = self.method(method)?;
        self.client.invoke(&self.service, m, args).await
    }

    /// Invoke and convert the result into `T`.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, args: &[Value]) -> Result<T, RpcError> {
        self.invoke(method, args).await?.decode()
    }

    pub fn invoke_blocking(&self, method: &str, args: &[Value]) -> Result<RpcValue, RpcError> {
        let m = self.method(method)?;
        self.client.invoke_blocking(&self.service, m, args)
    }

    pub fn notify(&self, method: &str, args: &[Value]) -> Result<(), RpcError> {
        let m = self.method(method)?;
        self.client.notify(&self.service, m, args)
    }

    pub fn streaming(&self, method: &str, args: Vec<Value>) -> Result<StreamRequest, RpcError> {
        let m = self.method(method)?;
        Ok(self.client.invoke_streaming(&self.service, m, args))
    }

    /// Streaming call sent on first await.
    #[inline]
    pub fn chunked(&self, method: &str, args: Vec<Value>) -> Result<ChunkedCompletion, RpcError> {
        Ok(self.streaming(method, args)?.lazy())
    }
}

impl<F: ClientFacts, P: ClientTransport<F::IO>> fmt::Debug for ProxyInstance<F, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{:?}", self.service, self.client)
    }
}
