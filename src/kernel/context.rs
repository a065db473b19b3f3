//! Execution context assembly for a running flow step.
//!
//! Grounded on `core_runtime/kernel_context_builder.py`: the full context a
//! handler sees is a `serde_json::Map` layered from the flow's `defaults`,
//! the step's own `input`, resolved `$flow.`/`$ctx.`/`$env.` variables, and a
//! handful of well-known bookkeeping fields (`phase`, `ts`, `ids`,
//! `_source_component`). When [`KernelConfig::safe_context`] is set the
//! context handed to a step is passed through
//! [`crate::sandbox::secure_executor::sanitize_context`] first, the same
//! allowlist the Docker sandbox boundary uses — packs that opt into strict
//! mode get the same treatment as a containerized process even when their
//! step runs in-process.

use serde_json::{Map, Value};

use crate::config::KernelConfig;
use crate::sandbox::secure_executor::sanitize_context;

/// Identifiers threaded through a single flow run.
#[derive(Debug, Clone, Default)]
pub struct RunIds {
    pub flow_id: String,
    pub run_id: String,
    pub chat_id: Option<String>,
}

/// Builds the per-step execution context handed to handlers.
pub struct ContextBuilder<'a> {
    config: &'a KernelConfig,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(config: &'a KernelConfig) -> Self {
        Self { config }
    }

    /// Layer `defaults`, `variables` (already-resolved `$flow`/`$ctx`/`$env`
    /// substitutions), and `step_input` into one context object, then stamp
    /// bookkeeping fields. Later layers win on key collision.
    pub fn build(
        &self,
        phase: &str,
        ids: &RunIds,
        source_component: Option<&str>,
        defaults: &Map<String, Value>,
        variables: &Map<String, Value>,
        step_input: &Value,
    ) -> Value {
        let mut out = defaults.clone();
        for (k, v) in variables {
            out.insert(k.clone(), v.clone());
        }
        if let Value::Object(input_map) = step_input {
            for (k, v) in input_map {
                out.insert(k.clone(), v.clone());
            }
        } else if !step_input.is_null() {
            out.insert("payload".to_string(), step_input.clone());
        }

        out.insert("phase".to_string(), Value::String(phase.to_string()));
        out.insert("ts".to_string(), Value::String(chrono::Utc::now().to_rfc3339()));
        out.insert(
            "ids".to_string(),
            serde_json::json!({"flow_id": ids.flow_id, "run_id": ids.run_id}),
        );
        if let Some(chat_id) = &ids.chat_id {
            out.insert("chat_id".to_string(), Value::String(chat_id.clone()));
        }
        if let Some(src) = source_component {
            out.insert("_source_component".to_string(), Value::String(src.to_string()));
        }

        let context = Value::Object(out);
        if self.config.safe_context {
            sanitize_context(&context)
        } else {
            context
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids() -> RunIds {
        RunIds { flow_id: "f1".to_string(), run_id: "r1".to_string(), chat_id: Some("c1".to_string()) }
    }

    #[test]
    fn layers_apply_in_priority_order() {
        let config = KernelConfig::for_testing();
        let builder = ContextBuilder::new(&config);
        let defaults = json!({"a": 1, "b": 1}).as_object().unwrap().clone();
        let variables = json!({"b": 2, "c": 2}).as_object().unwrap().clone();
        let input = json!({"c": 3});

        let ctx = builder.build("runtime_boot", &ids(), None, &defaults, &variables, &input);
        assert_eq!(ctx["a"], 1);
        assert_eq!(ctx["b"], 2);
        assert_eq!(ctx["c"], 3);
        assert_eq!(ctx["phase"], "runtime_boot");
        assert_eq!(ctx["chat_id"], "c1");
    }

    #[test]
    fn safe_context_strips_unlisted_keys() {
        let mut config = KernelConfig::for_testing();
        config.safe_context = true;
        let builder = ContextBuilder::new(&config);
        let defaults = Map::new();
        let variables = json!({"di_container": "leaked"}).as_object().unwrap().clone();
        let ctx = builder.build("setup", &ids(), None, &defaults, &variables, &Value::Null);

        assert!(ctx.get("di_container").is_none());
        assert!(ctx.get("phase").is_some());
    }

    #[test]
    fn non_object_input_lands_under_payload() {
        let config = KernelConfig::for_testing();
        let builder = ContextBuilder::new(&config);
        let ctx = builder.build("setup", &ids(), None, &Map::new(), &Map::new(), &json!("raw string"));
        assert_eq!(ctx["payload"], "raw string");
    }
}
