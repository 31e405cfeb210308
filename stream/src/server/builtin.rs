//! Services registered on every server.
//!
//! - `/_command`: `ping() -> b"pong"`, used by the client heartbeat
//! - `/_db`: a namespaced in-memory key-value store with optional expiry

use super::dispatch::ServiceDispatcher;
use super::service::{RpcService, ServiceDef};
use crate::data::RpcValue;
use dashmap::DashMap;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const COMMAND_SERVICE: &str = "/_command";
pub const DB_SERVICE: &str = "/_db";
pub const PING: &str = "ping";

pub(crate) fn register(dispatcher: &ServiceDispatcher) {
    for (name, def) in [
        (COMMAND_SERVICE, Arc::new(CommandService).definition()),
        (DB_SERVICE, Arc::new(DbService::default()).definition()),
    ] {
        if let Err(e) = dispatcher.add_definition(name, def) {
            log::error!("register {} err: {}", name, e);
        }
    }
}

pub struct CommandService;

impl RpcService for CommandService {
    fn definition(self: Arc<Self>) -> ServiceDef {
        ServiceDef::new("_command")
            .method(PING, &[], |_| async { Ok(RpcValue::Bytes(b"pong".to_vec())) })
    }
}

struct Entry {
    data: Value,
    expire_at: Option<Instant>,
}

impl Entry {
    #[inline]
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expire_at, Some(t) if t <= now)
    }
}

/// group -> key -> value, expired entries are dropped on access.
#[derive(Default)]
pub struct KvStore {
    groups: DashMap<String, FxHashMap<String, Entry>>,
}

impl KvStore {
    pub fn get(&self, group: &str, key: &str) -> Option<Value> {
        let mut g = self.groups.get_mut(group)?;
        if g.get(key)?.is_expired(Instant::now()) {
            g.remove(key);
            return None;
        }
        g.get(key).map(|e| e.data.clone())
    }

    /// `ttl` of None keeps the value until removed.
    pub fn put(&self, group: &str, key: &str, data: Value, ttl: Option<Duration>) {
        let expire_at = ttl.and_then(|d| Instant::now().checked_add(d));
        self.groups.entry(group.to_string()).or_default().insert(key.to_string(), Entry { data, expire_at });
    }

    pub fn remove(&self, group: &str, key: &str) -> bool {
        let Some(mut g) = self.groups.get_mut(group) else { return false };
        let now = Instant::now();
        matches!(g.remove(key), Some(e) if !e.is_expired(now))
    }

    /// Number of live keys removed
    pub fn remove_batch(&self, group: &str, keys: &[String]) -> usize {
        let Some(mut g) = self.groups.get_mut(group) else { return 0 };
        let now = Instant::now();
        keys.iter().filter(|k| matches!(g.remove(k.as_str()), Some(e) if !e.is_expired(now))).count()
    }

    /// Move the value of `old` to `new`, overwriting `new`. False when `old` is absent.
    pub fn change_key(&self, group: &str, old: &str, new: &str) -> bool {
        let Some(mut g) = self.groups.get_mut(group) else { return false };
        let now = Instant::now();
        match g.remove(old) {
            Some(e) if !e.is_expired(now) => {
                g.insert(new.to_string(), e);
                true
            }
            _ => false,
        }
    }

    pub fn count(&self, group: &str) -> usize {
        let Some(mut g) = self.groups.get_mut(group) else { return 0 };
        let now = Instant::now();
        g.retain(|_, e| !e.is_expired(now));
        g.len()
    }
}

#[derive(Default)]
pub struct DbService {
    store: KvStore,
}

impl DbService {
    #[inline]
    pub fn store(&self) -> &KvStore {
        &self.store
    }
}

impl RpcService for DbService {
    fn definition(self: Arc<Self>) -> ServiceDef {
        let (s1, s2, s3, s4, s5, s6) =
            (self.clone(), self.clone(), self.clone(), self.clone(), self.clone(), self);
        ServiceDef::new("_db")
            .method("get", &["group", "key"], move |args| {
                let s = s1.clone();
                async move {
                    let (group, key): (String, String) = (args.arg(0)?, args.arg(1)?);
                    Ok(RpcValue::Value(s.store.get(&group, &key).unwrap_or(Value::Null)))
                }
            })
            .method("put", &["group", "key", "data", "expireMillis"], move |args| {
                let s = s2.clone();
                async move {
                    let (group, key): (String, String) = (args.arg(0)?, args.arg(1)?);
                    let data: Value = args.arg(2)?;
                    let expire: Option<u64> = args.arg(3)?;
                    let ttl = expire.filter(|ms| *ms > 0).map(Duration::from_millis);
                    s.store.put(&group, &key, data, ttl);
                    Ok(RpcValue::Value(Value::Bool(true)))
                }
            })
            .method("remove", &["group", "key"], move |args| {
                let s = s3.clone();
                async move {
                    let (group, key): (String, String) = (args.arg(0)?, args.arg(1)?);
                    Ok(RpcValue::Value(Value::Bool(s.store.remove(&group, &key))))
                }
            })
            .method("removeBatch", &["group", "keys"], move |args| {
                let s = s4.clone();
                async move {
                    let (group, keys): (String, Vec<String>) = (args.arg(0)?, args.arg(1)?);
                    Ok(RpcValue::Value(Value::from(s.store.remove_batch(&group, &keys))))
                }
            })
            .method("changeKey", &["group", "oldKey", "newKey"], move |args| {
                let s = s5.clone();
                async move {
                    let group: String = args.arg(0)?;
                    let (old, new): (String, String) = (args.arg(1)?, args.arg(2)?);
                    Ok(RpcValue::Value(Value::Bool(s.store.change_key(&group, &old, &new))))
                }
            })
            .method("count", &["group"], move |args| {
                let s = s6.clone();
                async move {
                    let group: String = args.arg(0)?;
                    Ok(RpcValue::Value(Value::from(s.store.count(&group))))
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kv_store() {
        let store = KvStore::default();
        assert_eq!(store.get("g", "k"), None);
        store.put("g", "k", json!({"a": 1}), None);
        store.put("g", "tmp", json!(1), Some(Duration::from_millis(1)));
        store.put("other", "k", json!("x"), None);
        assert_eq!(store.get("g", "k"), Some(json!({"a": 1})));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.get("g", "tmp"), None);
        assert_eq!(store.count("g"), 1);

        assert!(store.change_key("g", "k", "k2"));
        assert!(!store.change_key("g", "k", "k3"));
        assert_eq!(store.get("g", "k2"), Some(json!({"a": 1})));

        store.put("g", "k3", json!(3), None);
        let removed = store.remove_batch("g", &["k2".to_string(), "k3".to_string(), "nope".to_string()]);
        assert_eq!(removed, 2);
        assert_eq!(store.count("g"), 0);
        assert!(store.remove("other", "k"));
        assert!(!store.remove("other", "k"));
        assert_eq!(store.count("missing"), 0);
    }
}
