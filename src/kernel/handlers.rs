//! Built-in `kernel:*` handlers — the small set of interpreter-level
//! utilities the kernel itself owns, as opposed to the flow-level
//! application handlers a pack registers.
//!
//! Grounded on the `kernel:ctx.*`, `kernel:ir.*`, `kernel:emit`, and
//! `kernel:noop` entries of `core_runtime/kernel_handlers_system.py`'s
//! dispatch table. The remaining `kernel:*` entries in that table
//! (`mounts.init`, `registry.load`, `approval.scan`, `container.*`, ...)
//! are startup-sequencing handlers for flow-level application concerns this
//! kernel does not implement — see the crate's non-goals — and are not
//! reproduced here; only the handlers below have no dependency on that
//! out-of-scope machinery.
//!
//! Every handler here follows the same signature as a pack-registered
//! handler (`Fn(Value) -> Result<Value>`, called with `{"args", "ctx"}` and
//! returning `{"output": ...}` so [`super::executor`]'s envelope unwrap
//! applies uniformly regardless of where a handler came from.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::event_bus::EventBus;
use crate::interface_registry::{GetStrategy, HandlerFn, InterfaceRegistry, RegisteredValue};

fn args_of(payload: &Value) -> &Value {
    payload.get("args").unwrap_or(&Value::Null)
}

fn ctx_of(payload: &Value) -> &Value {
    payload.get("ctx").unwrap_or(&Value::Null)
}

fn missing_arg(name: &str) -> Error {
    Error::Validation(format!("missing '{name}' argument"))
}

fn h_noop(_payload: Value) -> Result<Value> {
    Ok(serde_json::json!({"output": Value::Null}))
}

fn h_ctx_get(payload: Value) -> Result<Value> {
    let key = args_of(&payload).get("key").and_then(Value::as_str).ok_or_else(|| missing_arg("key"))?;
    let default = args_of(&payload).get("default").cloned().unwrap_or(Value::Null);
    let value = ctx_of(&payload).get(key).cloned().unwrap_or(default);
    Ok(serde_json::json!({"output": value}))
}

fn h_emit(event_bus: Arc<EventBus>) -> HandlerFn {
    Arc::new(move |payload: Value| {
        if let Some(event) = args_of(&payload).get("event").and_then(Value::as_str) {
            event_bus.publish(event, &serde_json::json!({"ts": chrono::Utc::now().to_rfc3339()}));
        }
        Ok(serde_json::json!({"output": Value::Null}))
    })
}

fn h_ir_get(registry: Arc<InterfaceRegistry>) -> HandlerFn {
    Arc::new(move |payload: Value| {
        let key = args_of(&payload).get("key").and_then(Value::as_str).ok_or_else(|| missing_arg("key"))?.to_string();
        let strategy = match args_of(&payload).get("strategy").and_then(Value::as_str) {
            Some("first") => GetStrategy::First,
            _ => GetStrategy::Last,
        };
        let value = registry.get_with(&key, strategy).and_then(|v| v.as_data().cloned());
        Ok(serde_json::json!({"output": value, "found": value.is_some()}))
    })
}

fn h_ir_register(registry: Arc<InterfaceRegistry>) -> HandlerFn {
    Arc::new(move |payload: Value| {
        let key = args_of(&payload).get("key").and_then(Value::as_str).ok_or_else(|| missing_arg("key"))?.to_string();
        let value = args_of(&payload).get("value").cloned().unwrap_or(Value::Null);
        let meta = args_of(&payload).get("meta").and_then(Value::as_object).cloned();
        registry.register(&key, RegisteredValue::Data(value), meta)?;
        Ok(serde_json::json!({"output": Value::Null}))
    })
}

fn h_ir_call(registry: Arc<InterfaceRegistry>) -> HandlerFn {
    Arc::new(move |payload: Value| {
        let key = args_of(&payload).get("key").and_then(Value::as_str).ok_or_else(|| missing_arg("key"))?.to_string();
        let strategy = match args_of(&payload).get("strategy").and_then(Value::as_str) {
            Some("first") => GetStrategy::First,
            _ => GetStrategy::Last,
        };
        let Some(registered) = registry.get_with(&key, strategy) else {
            return Ok(serde_json::json!({"_kernel_step_status": "skipped", "reason": "not_found", "output": Value::Null}));
        };
        let Some(handler) = registered.as_handler() else {
            return Ok(serde_json::json!({"_kernel_step_status": "skipped", "reason": "not_callable", "output": Value::Null}));
        };
        let call_args = args_of(&payload).get("call_args").cloned().unwrap_or(Value::Null);
        let result = handler(call_args)?;
        Ok(serde_json::json!({"output": result}))
    })
}

/// Build the kernel's built-in `kernel:*` handler dispatch table, keyed
/// without the `kernel:` prefix (the executor strips it before lookup).
pub fn builtin_handlers(registry: Arc<InterfaceRegistry>, event_bus: Arc<EventBus>) -> HashMap<String, HandlerFn> {
    let mut table: HashMap<String, HandlerFn> = HashMap::new();
    table.insert("noop".to_string(), Arc::new(h_noop));
    table.insert("ctx.get".to_string(), Arc::new(h_ctx_get));
    table.insert(
        "ctx.set".to_string(),
        Arc::new(|payload: Value| {
            let key = args_of(&payload).get("key").and_then(Value::as_str).ok_or_else(|| missing_arg("key"))?.to_string();
            let value = args_of(&payload).get("value").cloned().unwrap_or(Value::Null);
            Ok(serde_json::json!({"output": Value::Null, "_ctx_set": {"key": key, "value": value}}))
        }),
    );
    table.insert(
        "ctx.copy".to_string(),
        Arc::new(|payload: Value| {
            let from_key = args_of(&payload).get("from_key").and_then(Value::as_str).ok_or_else(|| missing_arg("from_key"))?;
            let to_key = args_of(&payload).get("to_key").and_then(Value::as_str).ok_or_else(|| missing_arg("to_key"))?.to_string();
            let value = ctx_of(&payload).get(from_key).cloned().unwrap_or(Value::Null);
            Ok(serde_json::json!({"output": Value::Null, "_ctx_set": {"key": to_key, "value": value}}))
        }),
    );
    table.insert("emit".to_string(), h_emit(event_bus));
    table.insert("ir.get".to_string(), h_ir_get(registry.clone()));
    table.insert("ir.register".to_string(), h_ir_register(registry.clone()));
    table.insert("ir.call".to_string(), h_ir_call(registry));
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::PathResolver;

    fn registry(dir: &std::path::Path) -> Arc<InterfaceRegistry> {
        Arc::new(InterfaceRegistry::new(&PathResolver::new(dir), false))
    }

    #[test]
    fn ctx_get_falls_back_to_default_when_key_absent() {
        let result = h_ctx_get(serde_json::json!({"args": {"key": "missing", "default": "fallback"}, "ctx": {}})).unwrap();
        assert_eq!(result["output"], "fallback");
    }

    #[test]
    fn ir_get_reports_found_false_for_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let handler = h_ir_get(registry(dir.path()));
        let result = handler(serde_json::json!({"args": {"key": "nothing.here"}})).unwrap();
        assert_eq!(result["found"], false);
    }

    #[test]
    fn ir_register_then_ir_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let register = h_ir_register(reg.clone());
        register(serde_json::json!({"args": {"key": "tool.thing", "value": 42}})).unwrap();

        let get = h_ir_get(reg);
        let result = get(serde_json::json!({"args": {"key": "tool.thing"}})).unwrap();
        assert_eq!(result["output"], 42);
        assert_eq!(result["found"], true);
    }

    #[test]
    fn ir_call_on_missing_key_is_skipped_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let handler = h_ir_call(registry(dir.path()));
        let result = handler(serde_json::json!({"args": {"key": "does.not.exist"}})).unwrap();
        assert_eq!(result["_kernel_step_status"], "skipped");
    }
}
