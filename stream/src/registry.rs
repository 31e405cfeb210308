//! Method metadata and the per-interface lookup table.
//!
//! Services and client proxies declare their methods explicitly: exposed name plus the ordered
//! parameter names used to build the request payload. The server side also carries an invoker.

use crate::data::RpcValue;
use futures::future::BoxFuture;
use nrpc_core::error::ConfigError;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Server side handler of one method.
///
/// Receives decoded arguments in parameter order.
pub type Invoker =
    Arc<dyn Fn(CallArgs) -> BoxFuture<'static, Result<RpcValue, ServiceError>> + Send + Sync>;

/// An invocation failure, turned into a 500 response by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceError(pub String);

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ServiceError {}

impl ServiceError {
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<String> for ServiceError {
    #[inline]
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ServiceError {
    #[inline]
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    #[inline]
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

/// How declared method names are exposed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamingStrategy {
    #[default]
    AsIs,
    /// `say_hello` / `SayHello` -> `sayHello`
    LowerCamel,
    /// `sayHello` -> `say_hello`
    SnakeCase,
}

impl NamingStrategy {
    pub fn apply(&self, name: &str) -> String {
        match self {
            Self::AsIs => name.to_string(),
            Self::LowerCamel => lower_camel(name),
            Self::SnakeCase => snake_case(name),
        }
    }
}

/// `HelloService` -> `helloService`, `hello_service` -> `helloService`
pub fn lower_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for c in name.chars() {
        if c == '_' || c == '-' {
            upper_next = !out.is_empty();
            continue;
        }
        if out.is_empty() {
            out.extend(c.to_lowercase());
        } else if upper_next {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        upper_next = false;
    }
    out
}

pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else if c == '-' {
            out.push('_');
        } else {
            out.push(c);
        }
    }
    out
}

/// Service name derived from an interface name: `HelloService` -> `/helloService`
#[inline]
pub fn service_name_of(interface: &str) -> String {
    format!("/{}", lower_camel(interface))
}

/// Immutable metadata of one remote method.
#[derive(Clone)]
pub struct RpcMethod {
    pub name: String,
    pub param_names: Vec<String>,
    pub invoker: Option<Invoker>,
}

impl RpcMethod {
    /// Client side declaration, without invoker
    pub fn declare(name: &str, params: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            param_names: params.iter().map(|p| p.to_string()).collect(),
            invoker: None,
        }
    }
}

impl fmt::Debug for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}({})", self.name, self.param_names.join(", "))
    }
}

/// Declared methods of one interface, the client-side view of a service.
#[derive(Debug, Clone)]
pub struct RpcInterface {
    pub name: String,
    pub methods: Vec<RpcMethod>,
}

impl RpcInterface {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), methods: Vec::new() }
    }

    pub fn method(mut self, name: &str, params: &[&str]) -> Self {
        self.methods.push(RpcMethod::declare(name, params));
        self
    }
}

/// name -> method table of one interface
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: FxHashMap<String, Arc<RpcMethod>>,
}

impl MethodRegistry {
    /// Build the lookup table, names rewritten by `naming`.
    ///
    /// Zero methods or two methods with the same exposed name are rejected.
    pub fn build(
        interface: &str, methods: Vec<RpcMethod>, naming: NamingStrategy,
    ) -> Result<Self, ConfigError> {
        if methods.is_empty() {
            return Err(ConfigError::NoMethods(interface.to_string()));
        }
        let mut map = FxHashMap::default();
        for mut m in methods {
            m.name = naming.apply(&m.name);
            if m.name.is_empty() || m.name.len() > u8::MAX as usize {
                return Err(ConfigError::InvalidName(m.name));
            }
            if map.contains_key(&m.name) {
                return Err(ConfigError::DuplicateMethod {
                    interface: interface.to_string(),
                    name: m.name,
                });
            }
            map.insert(m.name.clone(), Arc::new(m));
        }
        Ok(Self { methods: map })
    }

    #[inline]
    pub fn from_interface(
        interface: &RpcInterface, naming: NamingStrategy,
    ) -> Result<Self, ConfigError> {
        Self::build(&interface.name, interface.methods.clone(), naming)
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&Arc<RpcMethod>> {
        self.methods.get(name)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(|k| k.as_str())
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.methods.values()).finish()
    }
}

/// Arguments handed to an invoker, in declared parameter order.
pub struct CallArgs {
    pub request_id: i32,
    pub service: String,
    pub method: Arc<RpcMethod>,
    pub args: Vec<Value>,
    /// Emit streamed chunks before the terminal response.
    pub chunks: crate::server::ChunkSender,
}

impl CallArgs {
    /// Deserialize the argument at `idx`, a missing argument reads as null.
    pub fn arg<T: serde::de::DeserializeOwned>(&self, idx: usize) -> Result<T, ServiceError> {
        let v = self.args.get(idx).cloned().unwrap_or(Value::Null);
        serde_json::from_value(v).map_err(|e| {
            let name = self.method.param_names.get(idx).map(|s| s.as_str()).unwrap_or("?");
            ServiceError(format!("bad argument {}: {}", name, e))
        })
    }

    pub fn arg_named<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T, ServiceError> {
        match self.method.param_names.iter().position(|p| p == name) {
            Some(idx) => self.arg(idx),
            None => Err(ServiceError(format!("no parameter {}", name))),
        }
    }
}

impl fmt::Debug for CallArgs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:?} id={}", self.service, self.method, self.request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("HelloService", NamingStrategy::AsIs, "HelloService")]
    #[case("HelloService", NamingStrategy::LowerCamel, "helloService")]
    #[case("say_hello", NamingStrategy::LowerCamel, "sayHello")]
    #[case("sayHello", NamingStrategy::SnakeCase, "say_hello")]
    #[case("RemoveBatch", NamingStrategy::SnakeCase, "remove_batch")]
    fn test_naming(#[case] name: &str, #[case] naming: NamingStrategy, #[case] expect: &str) {
        assert_eq!(naming.apply(name), expect);
    }

    #[test]
    fn test_service_name() {
        assert_eq!(service_name_of("HelloService"), "/helloService");
        assert_eq!(service_name_of("DbService"), "/dbService");
    }

    #[test]
    fn test_build() {
        let iface = RpcInterface::new("HelloService")
            .method("sayHello", &["name"])
            .method("count", &[]);
        let reg = MethodRegistry::from_interface(&iface, NamingStrategy::AsIs).expect("build");
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.get("sayHello").expect("method").param_names, vec!["name".to_string()]);
        assert!(reg.get("say_hello").is_none());

        let reg = MethodRegistry::from_interface(&iface, NamingStrategy::SnakeCase).expect("build");
        assert!(reg.get("say_hello").is_some());
    }

    #[test]
    fn test_build_errors() {
        let empty = RpcInterface::new("Empty");
        assert_eq!(
            MethodRegistry::from_interface(&empty, NamingStrategy::AsIs).unwrap_err(),
            ConfigError::NoMethods("Empty".to_string())
        );
        // distinct declared names collide after the naming strategy
        let dup = RpcInterface::new("Dup").method("say_hello", &[]).method("sayHello", &["a"]);
        assert!(MethodRegistry::from_interface(&dup, NamingStrategy::AsIs).is_ok());
        assert_eq!(
            MethodRegistry::from_interface(&dup, NamingStrategy::LowerCamel).unwrap_err(),
            ConfigError::DuplicateMethod { interface: "Dup".to_string(), name: "sayHello".to_string() }
        );
    }
}
