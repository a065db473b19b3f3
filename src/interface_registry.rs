//! InterfaceRegistry — key -> `List[{value, meta, ts}]` multi-store.
//!
//! Grounded on `core_runtime/interface_registry.py`. The kernel does not fix
//! the vocabulary of keys ("tool", "prompt", "ai_client", ...); packs and the
//! kernel itself register whatever they provide under whatever key they
//! choose. Multiple registrations under the same key are kept (newest last);
//! readers pick first/last/all. Thread-safe, observable, and enforces the
//! protected-key ACL described in spec section on interface resolution.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLog, Severity};
use crate::error::{Error, Result};
use crate::paths::PathResolver;

/// Keys reserved for kernel-level extension points. Registering under one of
/// these without `meta._system = true` produces a warning, escalated to a
/// hard error when `block_protected_keys` is set.
const PROTECTED_KEYS: &[&str] = &[
    "io.http.server",
    "flow.hooks.before_step",
    "flow.hooks.after_step",
    "flow.error_handler",
];
const PROTECTED_PREFIXES: &[&str] = &["flow.construct.", "kernel:"];

fn is_protected_key(key: &str) -> bool {
    PROTECTED_KEYS.contains(&key) || PROTECTED_PREFIXES.iter().any(|p| key.starts_with(p))
}

fn is_system(meta: &Map<String, Value>) -> bool {
    meta.get("_system").and_then(Value::as_bool).unwrap_or(false)
}

fn source_pack_id(meta: &Map<String, Value>) -> String {
    meta.get("_source_pack_id")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

/// A value registered under a key: ordinary data, or a handler callable.
#[derive(Clone)]
pub enum RegisteredValue {
    Data(Value),
    Handler(HandlerFn),
}

pub type HandlerFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

impl RegisteredValue {
    pub fn as_data(&self) -> Option<&Value> {
        match self {
            RegisteredValue::Data(v) => Some(v),
            RegisteredValue::Handler(_) => None,
        }
    }

    pub fn as_handler(&self) -> Option<&HandlerFn> {
        match self {
            RegisteredValue::Handler(h) => Some(h),
            RegisteredValue::Data(_) => None,
        }
    }
}

impl std::fmt::Debug for RegisteredValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisteredValue::Data(v) => write!(f, "Data({v})"),
            RegisteredValue::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: RegisteredValue,
    meta: Map<String, Value>,
    ts: DateTime<Utc>,
}

impl Entry {
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.meta
            .get("_expires_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(exp) => now <= exp,
            None => true,
        }
    }
}

/// How [`InterfaceRegistry::get`] should pick among multiple registrations
/// under the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetStrategy {
    First,
    Last,
}

type ObserverCallback = Arc<dyn Fn(&str, Option<&RegisteredValue>, &RegisteredValue) + Send + Sync>;

struct Observer {
    id: String,
    callback: ObserverCallback,
}

/// A listing entry returned by [`InterfaceRegistry::list`] with metadata.
#[derive(Debug, Clone)]
pub struct ListedKey {
    pub count: usize,
    pub last_ts: Option<DateTime<Utc>>,
    pub last_meta: Option<Map<String, Value>>,
}

/// Guard returned by [`InterfaceRegistry::temporary_override`]; restores the
/// key's prior registrations when dropped.
pub struct TemporaryOverrideGuard<'a> {
    registry: &'a InterfaceRegistry,
    key: String,
    original_count: usize,
}

impl Drop for TemporaryOverrideGuard<'_> {
    fn drop(&mut self) {
        let mut store = self.registry.store.write();
        if let Some(entries) = store.get_mut(&self.key) {
            if entries.len() > self.original_count {
                entries.truncate(self.original_count);
            }
            if entries.is_empty() {
                store.remove(&self.key);
            }
        }
    }
}

/// Thread-safe, observable registration box.
pub struct InterfaceRegistry {
    store: RwLock<HashMap<String, Vec<Entry>>>,
    observers: RwLock<HashMap<String, Vec<Observer>>>,
    audit: AuditLog,
    block_protected_keys: bool,
}

impl InterfaceRegistry {
    pub fn new(resolver: &PathResolver, block_protected_keys: bool) -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
            observers: RwLock::new(HashMap::new()),
            audit: AuditLog::new(resolver.audit_dir()),
            block_protected_keys,
        }
    }

    fn check_protected_key(&self, key: &str, meta: &Map<String, Value>) -> Result<bool> {
        if !is_protected_key(key) || is_system(meta) {
            return Ok(false);
        }
        let source = source_pack_id(meta);
        if self.block_protected_keys {
            tracing::error!(target: "audit", key, source_pack_id = %source, "blocked registration to protected key without _system flag");
            let _ = self.audit.record(
                &AuditEntry::new("interface_registry.protected_key_blocked", &source, false, format!("blocked registration to '{key}'"))
                    .with_severity(Severity::Security)
                    .with_detail(serde_json::json!({"key": key})),
            );
            return Err(Error::Authorization(format!("registration to protected key '{key}' requires _system=true in meta")));
        }
        Ok(true)
    }

    fn emit_protected_key_warning(&self, key: &str, meta: &Map<String, Value>) {
        let source = source_pack_id(meta);
        tracing::warn!(target: "audit", key, source_pack_id = %source, "registration to protected key without _system flag; will be blocked in a future version");
        let _ = self.audit.record(
            &AuditEntry::new("interface_registry.protected_key_warning", &source, true, format!("unprotected registration to '{key}'"))
                .with_severity(Severity::Warning)
                .with_detail(serde_json::json!({"key": key})),
        );
    }

    /// Register `value` under `key`. Fails only if `key` is protected,
    /// `meta._system` is not set, and `block_protected_keys` is on.
    pub fn register(&self, key: &str, value: RegisteredValue, meta: Option<Map<String, Value>>) -> Result<()> {
        let meta = meta.unwrap_or_default();
        let should_warn = self.check_protected_key(key, &meta)?;

        let entry = Entry { value: value.clone(), meta: meta.clone(), ts: Utc::now() };
        let old = {
            let mut store = self.store.write();
            let items = store.entry(key.to_string()).or_default();
            let old = items.last().map(|e| e.value.clone());
            items.push(entry);
            old
        };

        self.notify_observers(key, old.as_ref(), &value);
        if should_warn {
            self.emit_protected_key_warning(key, &meta);
        }
        Ok(())
    }

    /// Register `value` under `key` only if no valid (non-expired)
    /// registration already exists. `ttl` expires the new entry after the
    /// given duration, allowing a later call to overwrite it.
    pub fn register_if_absent(
        &self,
        key: &str,
        value: RegisteredValue,
        meta: Option<Map<String, Value>>,
        ttl: Option<chrono::Duration>,
    ) -> Result<bool> {
        let mut meta = meta.unwrap_or_default();
        let should_warn = self.check_protected_key(key, &meta)?;

        {
            let mut store = self.store.write();
            let now = Utc::now();
            let has_valid = store.get(key).is_some_and(|items| items.iter().any(|e| e.is_valid(now)));
            if has_valid {
                return Ok(false);
            }
            if let Some(ttl) = ttl {
                if ttl > chrono::Duration::zero() {
                    let expires_at = now + ttl;
                    meta.insert("_expires_at".to_string(), Value::String(expires_at.to_rfc3339()));
                    meta.insert("_ttl".to_string(), Value::from(ttl.num_seconds()));
                }
            }
            let entry = Entry { value: value.clone(), meta: meta.clone(), ts: now };
            store.entry(key.to_string()).or_default().push(entry);
        }

        self.notify_observers(key, None, &value);
        if should_warn {
            self.emit_protected_key_warning(key, &meta);
        }
        Ok(true)
    }

    /// Register a handler with schema metadata attached.
    pub fn register_handler(
        &self,
        key: &str,
        handler: HandlerFn,
        input_schema: Option<Value>,
        output_schema: Option<Value>,
        source_code: Option<String>,
        meta: Option<Map<String, Value>>,
    ) -> Result<()> {
        let mut meta = meta.unwrap_or_default();
        meta.insert("_input_schema".to_string(), input_schema.unwrap_or(Value::Null));
        meta.insert("_output_schema".to_string(), output_schema.unwrap_or(Value::Null));
        meta.insert("_source_code".to_string(), source_code.map(Value::String).unwrap_or(Value::Null));
        meta.insert("_is_handler".to_string(), Value::Bool(true));
        self.register(key, RegisteredValue::Handler(handler), Some(meta))
    }

    /// Get the last-registered value under `key`, or `None`.
    pub fn get(&self, key: &str) -> Option<RegisteredValue> {
        self.get_with(key, GetStrategy::Last)
    }

    pub fn get_with(&self, key: &str, strategy: GetStrategy) -> Option<RegisteredValue> {
        let store = self.store.read();
        let items = store.get(key)?;
        match strategy {
            GetStrategy::First => items.first(),
            GetStrategy::Last => items.last(),
        }
        .map(|e| e.value.clone())
    }

    /// Every value registered under `key`, oldest first. Empty (not `None`)
    /// when the key has no registrations.
    pub fn get_all(&self, key: &str) -> Vec<RegisteredValue> {
        self.store.read().get(key).map(|items| items.iter().map(|e| e.value.clone()).collect()).unwrap_or_default()
    }

    /// Value registered under `key` by `owner_pack`, matched against the
    /// entry's `owner_pack`/`pack_id`/`source`/`_source_pack_id`/`registered_by`
    /// meta fields. Falls back to the last registration if no owner matches.
    pub fn get_by_owner(&self, key: &str, owner_pack: &str) -> Option<RegisteredValue> {
        let store = self.store.read();
        let items = store.get(key)?;
        for entry in items.iter().rev() {
            let owner = ["owner_pack", "pack_id", "source", "_source_pack_id", "registered_by"]
                .iter()
                .find_map(|field| entry.meta.get(*field).and_then(Value::as_str));
            if owner == Some(owner_pack) {
                return Some(entry.value.clone());
            }
        }
        items.last().map(|e| e.value.clone())
    }

    pub fn get_schema(&self, key: &str) -> (Option<Value>, Option<Value>) {
        let store = self.store.read();
        match store.get(key).and_then(|items| items.last()) {
            Some(entry) => (entry.meta.get("_input_schema").cloned(), entry.meta.get("_output_schema").cloned()),
            None => (None, None),
        }
    }

    pub fn get_source(&self, key: &str) -> Option<String> {
        let store = self.store.read();
        store
            .get(key)
            .and_then(|items| items.last())
            .and_then(|entry| entry.meta.get("_source_code"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Observe changes to an exact key or a `*` glob pattern. Returns an
    /// observer id usable with [`Self::unobserve`].
    pub fn observe(&self, key_or_pattern: &str, callback: ObserverCallback, immediate: bool) -> String {
        let observer_id = format!("obs_{}", &Uuid::new_v4().simple().to_string()[..8]);
        let current = if immediate {
            self.store.read().get(key_or_pattern).and_then(|items| items.last()).map(|e| e.value.clone())
        } else {
            None
        };
        self.observers
            .write()
            .entry(key_or_pattern.to_string())
            .or_default()
            .push(Observer { id: observer_id.clone(), callback: callback.clone() });

        if let Some(value) = current {
            callback(key_or_pattern, None, &value);
        }
        observer_id
    }

    pub fn unobserve(&self, observer_id: &str) -> bool {
        let mut observers = self.observers.write();
        let mut found = false;
        observers.retain(|_, list| {
            let before = list.len();
            list.retain(|o| o.id != observer_id);
            found |= list.len() != before;
            !list.is_empty()
        });
        found
    }

    pub fn unobserve_all(&self, pattern: Option<&str>) -> usize {
        let mut observers = self.observers.write();
        match pattern {
            None => {
                let count = observers.values().map(Vec::len).sum();
                observers.clear();
                count
            }
            Some(pattern) => observers.remove(pattern).map(|v| v.len()).unwrap_or(0),
        }
    }

    fn notify_observers(&self, key: &str, old: Option<&RegisteredValue>, new: &RegisteredValue) {
        let to_notify: Vec<ObserverCallback> = {
            let observers = self.observers.read();
            observers
                .iter()
                .filter(|(pattern, _)| key_matches(key, pattern))
                .flat_map(|(_, list)| list.iter().map(|o| o.callback.clone()))
                .collect()
        };
        for callback in to_notify {
            callback(key, old, new);
        }
    }

    /// Temporarily register `value` under `key`; the prior registrations
    /// reappear when the returned guard is dropped.
    pub fn temporary_override(&self, key: &str, value: RegisteredValue, meta: Option<Map<String, Value>>) -> Result<TemporaryOverrideGuard<'_>> {
        let original_count = self.store.read().get(key).map(Vec::len).unwrap_or(0);
        self.register(key, value, meta)?;
        Ok(TemporaryOverrideGuard { registry: self, key: key.to_string(), original_count })
    }

    /// Registration counts (optionally with last-entry metadata), filtered
    /// by key prefix.
    pub fn list(&self, prefix: Option<&str>, include_meta: bool) -> HashMap<String, ListedKey> {
        let store = self.store.read();
        store
            .iter()
            .filter(|(k, _)| match prefix {
                Some(p) => k.starts_with(p),
                None => true,
            })
            .map(|(k, items)| {
                let listed = if include_meta {
                    let last = items.last();
                    ListedKey { count: items.len(), last_ts: last.map(|e| e.ts), last_meta: last.map(|e| e.meta.clone()) }
                } else {
                    ListedKey { count: items.len(), last_ts: None, last_meta: None }
                };
                (k.clone(), listed)
            })
            .collect()
    }

    /// Remove registrations under `key`. With no predicate, removes all of
    /// them and returns the count removed.
    pub fn unregister(&self, key: &str, predicate: Option<&dyn Fn(&RegisteredValue, &Map<String, Value>) -> bool>) -> usize {
        let mut store = self.store.write();
        let Some(items) = store.remove(key) else {
            return 0;
        };
        let Some(predicate) = predicate else {
            return items.len();
        };
        let mut kept = Vec::with_capacity(items.len());
        let mut removed = 0;
        for entry in items {
            if predicate(&entry.value, &entry.meta) {
                removed += 1;
            } else {
                kept.push(entry);
            }
        }
        if !kept.is_empty() {
            store.insert(key.to_string(), kept);
        }
        removed
    }
}

fn key_matches(key: &str, pattern: &str) -> bool {
    if pattern == key {
        return true;
    }
    pattern.contains('*') && crate::modifier::glob_match(pattern, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry(dir: &std::path::Path) -> InterfaceRegistry {
        let resolver = PathResolver::new(dir);
        InterfaceRegistry::new(&resolver, false)
    }

    #[test]
    fn multiple_registrations_kept_newest_last() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.register("tool.echo", RegisteredValue::Data(serde_json::json!("v1")), None).unwrap();
        reg.register("tool.echo", RegisteredValue::Data(serde_json::json!("v2")), None).unwrap();

        assert_eq!(reg.get_with("tool.echo", GetStrategy::First).unwrap().as_data().unwrap(), "v1");
        assert_eq!(reg.get("tool.echo").unwrap().as_data().unwrap(), "v2");
        assert_eq!(reg.get_all("tool.echo").len(), 2);
    }

    #[test]
    fn get_all_on_missing_key_is_empty_not_none() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        assert!(reg.get_all("nothing.here").is_empty());
        assert!(reg.get("nothing.here").is_none());
    }

    #[test]
    fn protected_key_without_system_flag_warns_but_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let result = reg.register("kernel:boot", RegisteredValue::Data(serde_json::json!(1)), None);
        assert!(result.is_ok());
    }

    #[test]
    fn protected_key_blocked_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        let reg = InterfaceRegistry::new(&resolver, true);
        let result = reg.register("kernel:boot", RegisteredValue::Data(serde_json::json!(1)), None);
        assert!(result.is_err());
    }

    #[test]
    fn protected_key_with_system_flag_is_allowed_even_when_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        let reg = InterfaceRegistry::new(&resolver, true);
        let mut meta = Map::new();
        meta.insert("_system".to_string(), Value::Bool(true));
        assert!(reg.register("kernel:boot", RegisteredValue::Data(serde_json::json!(1)), Some(meta)).is_ok());
    }

    #[test]
    fn register_if_absent_respects_ttl_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        assert!(reg.register_if_absent("lock.x", RegisteredValue::Data(serde_json::json!(true)), None, Some(chrono::Duration::seconds(-1))).unwrap());
        // Already-expired entry should not block a second registration.
        assert!(reg.register_if_absent("lock.x", RegisteredValue::Data(serde_json::json!(true)), None, None).unwrap());
        assert!(!reg.register_if_absent("lock.x", RegisteredValue::Data(serde_json::json!(true)), None, None).unwrap());
    }

    #[test]
    fn observe_receives_notifications_matching_wildcard() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        reg.observe(
            "tool.*",
            Arc::new(move |_k, _old, _new| {
                counted.fetch_add(1, Ordering::SeqCst);
            }),
            false,
        );
        reg.register("tool.echo", RegisteredValue::Data(serde_json::json!(1)), None).unwrap();
        reg.register("other.thing", RegisteredValue::Data(serde_json::json!(1)), None).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn temporary_override_restores_prior_value_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.register("flag.x", RegisteredValue::Data(serde_json::json!("base")), None).unwrap();
        {
            let _guard = reg.temporary_override("flag.x", RegisteredValue::Data(serde_json::json!("override")), None).unwrap();
            assert_eq!(reg.get("flag.x").unwrap().as_data().unwrap(), "override");
        }
        assert_eq!(reg.get("flag.x").unwrap().as_data().unwrap(), "base");
    }

    #[test]
    fn unregister_all_and_by_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.register("a", RegisteredValue::Data(serde_json::json!(1)), None).unwrap();
        reg.register("a", RegisteredValue::Data(serde_json::json!(2)), None).unwrap();
        let removed = reg.unregister("a", Some(&|v, _m| v.as_data().and_then(Value::as_i64) == Some(1)));
        assert_eq!(removed, 1);
        assert_eq!(reg.get_all("a").len(), 1);
    }
}
