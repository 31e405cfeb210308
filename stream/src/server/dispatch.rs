use super::service::{ChunkSender, RpcService, ServiceDef};
use crate::data::DataCodec;
use crate::proto::{RequestPacket, ResponsePacket, status};
use crate::registry::{CallArgs, MethodRegistry, service_name_of};
use captains_log::filter::LogFilter;
use dashmap::DashMap;
use futures::FutureExt;
use nrpc_core::error::ConfigError;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// service name -> methods of the registered instance.
///
/// Shared by every connection of a server.
pub struct ServiceDispatcher {
    codec: Arc<dyn DataCodec>,
    services: DashMap<String, Arc<MethodRegistry>>,
    logger: Arc<LogFilter>,
}

impl ServiceDispatcher {
    pub fn new(codec: Arc<dyn DataCodec>, logger: Arc<LogFilter>) -> Self {
        Self { codec, services: DashMap::new(), logger }
    }

    #[inline]
    pub fn codec(&self) -> &Arc<dyn DataCodec> {
        &self.codec
    }

    /// Register under the name derived from the interface: `HelloService` -> `/helloService`.
    pub fn add_instance<S: RpcService>(&self, svc: Arc<S>) -> Result<String, ConfigError> {
        let def = svc.definition();
        let name = service_name_of(def.interface());
        self.add_definition(&name, def)?;
        Ok(name)
    }

    pub fn add_instance_named<S: RpcService>(&self, svc: Arc<S>, name: &str) -> Result<(), ConfigError> {
        self.add_definition(name, svc.definition())
    }

    /// Registering a name again replaces the previous service.
    pub fn add_definition(&self, name: &str, def: ServiceDef) -> Result<(), ConfigError> {
        if name.is_empty() || name.len() > u8::MAX as usize {
            return Err(ConfigError::InvalidName(name.to_string()));
        }
        let registry = def.into_registry()?;
        logger_debug!(self.logger, "register service {} {:?}", name, registry);
        if self.services.insert(name.to_string(), Arc::new(registry)).is_some() {
            logger_warn!(self.logger, "service {} registered again, replaced", name);
        }
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        self.services.remove(name).is_some()
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    /// Handle one request. None when the request asked for no response.
    pub async fn dispatch(&self, req: RequestPacket, chunks: ChunkSender) -> Option<ResponsePacket> {
        let ack = req.ack;
        let request_id = req.request_id;
        let desc = req.describe();
        let resp = self.invoke(req, chunks).await;
        if resp.is_error() {
            logger_debug!(
                self.logger,
                "{} id={} failed {}: {}",
                desc,
                request_id,
                resp.status,
                resp.message
            );
        }
        if ack { Some(resp) } else { None }
    }

    async fn invoke(&self, req: RequestPacket, chunks: ChunkSender) -> ResponsePacket {
        let id = req.request_id;
        let Some(registry) = self.services.get(&req.service_name).map(|r| r.clone()) else {
            return ResponsePacket::new(
                id,
                status::NO_SUCH_SERVICE,
                format!("not found service [{}]", req.service_name),
            );
        };
        let Some(method) = registry.get(&req.method_name).cloned() else {
            return ResponsePacket::new(
                id,
                status::NO_SUCH_METHOD,
                format!("not found method [{}]", req.method_name),
            );
        };
        let Some(invoker) = method.invoker.clone() else {
            return ResponsePacket::new(
                id,
                status::NO_SUCH_METHOD,
                format!("not found method [{}]", req.method_name),
            );
        };
        let args = match self.codec.decode_request_data(&req.data, &method) {
            Ok(args) => args,
            Err(e) => return ResponsePacket::new(id, status::SERVER_ERROR, e.0),
        };
        let desc = req.describe();
        let call = CallArgs { request_id: id, service: req.service_name, method, args, chunks };
        logger_trace!(self.logger, "invoke {:?}", call);
        match AssertUnwindSafe(invoker(call)).catch_unwind().await {
            Ok(Ok(value)) => match self.codec.build_response(id, value) {
                Ok(resp) => resp,
                Err(e) => ResponsePacket::new(id, status::SERVER_ERROR, e.0),
            },
            Ok(Err(e)) => ResponsePacket::new(id, status::SERVER_ERROR, e.to_string()),
            Err(_) => {
                logger_error!(self.logger, "{} id={} panicked", desc, id);
                ResponsePacket::new(id, status::SERVER_ERROR, "internal error")
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::RpcValue;
    use crate::registry::ServiceError;
    use futures::executor::block_on;
    use nrpc_codec::JsonCodec;

    struct Echo;

    impl RpcService for Echo {
        fn definition(self: Arc<Self>) -> ServiceDef {
            ServiceDef::new("EchoService")
                .method("echo", &["msg"], |args| async move {
                    let msg: String = args.arg(0)?;
                    Ok(RpcValue::from(msg))
                })
                .method("fail", &[], |_| async { Err::<RpcValue, _>(ServiceError::new("boom")) })
                .method("crash", &[], |_| async {
                    if true {
                        panic!("crash");
                    }
                    Ok(RpcValue::null())
                })
        }
    }

    fn dispatcher() -> ServiceDispatcher {
        let d = ServiceDispatcher::new(Arc::new(JsonCodec::default()), Arc::new(LogFilter::new()));
        assert_eq!(d.add_instance(Arc::new(Echo)).expect("add"), "/echoService");
        d
    }

    fn request(svc: &str, method: &str, data: &[u8]) -> RequestPacket {
        let mut req = RequestPacket::new(svc, method, data.to_vec());
        req.request_id = 3;
        req
    }

    #[test]
    fn test_dispatch_status() {
        let d = dispatcher();
        let resp = block_on(d.dispatch(request("/echoService", "echo", br#"{"msg":"hi"}"#), ChunkSender::detached(3)))
            .expect("resp");
        assert_eq!(resp.status, status::OK);
        assert_eq!(resp.request_id, 3);
        assert_eq!(resp.data, br#""hi""#);

        let resp = block_on(d.dispatch(request("/nope", "echo", b""), ChunkSender::detached(3))).expect("resp");
        assert_eq!(resp.status, status::NO_SUCH_SERVICE);
        assert_eq!(resp.message, "not found service [/nope]");

        let resp =
            block_on(d.dispatch(request("/echoService", "nope", b""), ChunkSender::detached(3))).expect("resp");
        assert_eq!(resp.status, status::NO_SUCH_METHOD);
        assert_eq!(resp.message, "not found method [nope]");

        let resp =
            block_on(d.dispatch(request("/echoService", "fail", b""), ChunkSender::detached(3))).expect("resp");
        assert_eq!(resp.status, status::SERVER_ERROR);
        assert_eq!(resp.message, "boom");
        assert!(resp.data.is_empty());

        let resp =
            block_on(d.dispatch(request("/echoService", "crash", b""), ChunkSender::detached(3))).expect("resp");
        assert_eq!(resp.status, status::SERVER_ERROR);
        // a service name near the wire limit still fits the response message
        let name = format!("/{}", "s".repeat(250));
        let resp = block_on(d.dispatch(request(&name, "echo", b""), ChunkSender::detached(3))).expect("resp");
        assert_eq!(resp.status, status::NO_SUCH_SERVICE);
        assert_eq!(resp.message.len(), 255);
        assert!(resp.message.starts_with("not found service [/sss"));
    }

    #[test]
    fn test_no_ack() {
        let d = dispatcher();
        let mut req = request("/nope", "echo", b"");
        req.ack = false;
        assert!(block_on(d.dispatch(req, ChunkSender::detached(3))).is_none());
        for method in ["echo", "fail", "crash"] {
            let mut req = request("/echoService", method, br#"{"msg":"hi"}"#);
            req.ack = false;
            assert!(block_on(d.dispatch(req, ChunkSender::detached(3))).is_none(), "{}", method);
        }
    }

    #[test]
    fn test_register_again() {
        let d = dispatcher();
        d.add_instance_named(Arc::new(Echo), "/echoService").expect("replace");
        assert_eq!(d.service_names(), vec!["/echoService".to_string()]);
        assert!(d.add_instance_named(Arc::new(Echo), "").is_err());
        assert!(d.remove("/echoService"));
        assert!(!d.contains("/echoService"));
    }
}
