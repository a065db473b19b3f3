//! FlowExecutor — the per-step interpreter that walks a [`FlowDefinition`]'s
//! sorted step list.
//!
//! Grounded on `core_runtime/kernel_flow_execution.py::_execute_steps_async`
//! and friends, adapted to this port's synchronous
//! [`crate::interface_registry::HandlerFn`] (`Fn(Value) -> Result<Value>`,
//! not a coroutine) and its hard rejection of the legacy sub-flow
//! file-fallback path. Depth/cycle limits, condition evaluation, and the
//! envelope/abort-signal conventions below are carried over exactly.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::flow::definition::{FlowDefinition, FlowStep};
use crate::interface_registry::{GetStrategy, HandlerFn, InterfaceRegistry, RegisteredValue};

use super::variables::VariableResolver;

/// Mirrors `MAX_FLOW_CHAIN_DEPTH` in `kernel_flow_execution.py`: the
/// longest chain of `flow`-type steps a single top-level `execute` call may
/// traverse before it is treated as a runaway recursion.
pub const MAX_FLOW_CHAIN_DEPTH: usize = 10;

/// Bound on nested object/array descent when normalizing a step's assigned
/// output; matches the source's defensive recursion guard around
/// vocabulary normalization.
const MAX_OUTPUT_NORMALIZE_DEPTH: usize = 5;

/// A resolver for `python_file_call` steps, injected by the kernel so this
/// module stays decoupled from the sandbox's Docker specifics. Returns the
/// file's output value.
pub type PythonFileRunner = Arc<dyn Fn(&FlowStep, &Value) -> Result<Value> + Send + Sync>;

/// What action a failed step's error handler prescribes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorAction {
    Abort,
    Retry,
    Continue,
}

impl ErrorAction {
    fn from_str(s: &str) -> Self {
        match s {
            "retry" => ErrorAction::Retry,
            "continue" => ErrorAction::Continue,
            _ => ErrorAction::Abort,
        }
    }
}

/// The outcome of running one flow to completion (or abort/timeout).
#[derive(Debug, Clone)]
pub struct FlowRunOutcome {
    pub ctx: Value,
    pub aborted: bool,
    pub abort_reason: Option<String>,
}

/// Interprets a [`FlowDefinition`]'s steps against a mutable JSON context.
pub struct FlowExecutor {
    registry: Arc<InterfaceRegistry>,
    kernel_handlers: Arc<std::collections::HashMap<String, HandlerFn>>,
    python_file_runner: Option<PythonFileRunner>,
}

impl FlowExecutor {
    pub fn new(
        registry: Arc<InterfaceRegistry>,
        kernel_handlers: Arc<std::collections::HashMap<String, HandlerFn>>,
        python_file_runner: Option<PythonFileRunner>,
    ) -> Self {
        Self { registry, kernel_handlers, python_file_runner }
    }

    /// Run `flow` starting from `ctx`, with `call_stack` carrying the
    /// chain of flow ids already entered (for depth/cycle checks on any
    /// `flow`-type steps this run encounters).
    pub fn execute(&self, flow: &FlowDefinition, mut ctx: Value, call_stack: &[String]) -> Result<FlowRunOutcome> {
        if call_stack.len() > MAX_FLOW_CHAIN_DEPTH {
            return Err(Error::Resource(format!("flow chain exceeded max depth {MAX_FLOW_CHAIN_DEPTH}")));
        }
        if call_stack.iter().filter(|id| id.as_str() == flow.flow_id).count() > 1 {
            return Err(Error::Resource(format!("cycle detected re-entering flow '{}'", flow.flow_id)));
        }

        let fail_soft = flow.defaults.get("fail_soft").and_then(Value::as_bool).unwrap_or(true);
        let mut completed: HashSet<String> = HashSet::new();
        let mut aborted = false;
        let mut abort_reason = None;

        for step in &flow.steps {
            if !self.depends_on_satisfied(step, &completed) {
                if fail_soft {
                    continue;
                }
                return Err(Error::Validation(format!("step '{}' depends on an unmet dependency", step.id)));
            }

            if let Some(cond) = &step.when {
                if !eval_condition(cond, &ctx) {
                    continue;
                }
            }

            if self.run_hooks("flow.hooks.before_step", step, &mut ctx)? {
                aborted = true;
                abort_reason = ctx.get("_flow_control_abort_reason").and_then(Value::as_str).map(str::to_string);
                break;
            }

            match self.execute_step(step, &ctx, call_stack) {
                Ok(output) => {
                    self.apply_output(step, &mut ctx, output)?;
                    completed.insert(step.id.clone());
                }
                Err(err) => match self.error_action_for(step) {
                    ErrorAction::Continue => {
                        completed.insert(step.id.clone());
                    }
                    ErrorAction::Retry => match self.execute_step(step, &ctx, call_stack) {
                        Ok(output) => {
                            self.apply_output(step, &mut ctx, output)?;
                            completed.insert(step.id.clone());
                        }
                        Err(err) => return Err(err),
                    },
                    ErrorAction::Abort => return Err(err),
                },
            }

            if ctx.get("_flow_control_abort").and_then(Value::as_bool) == Some(true) {
                aborted = true;
                abort_reason = ctx.get("_flow_control_abort_reason").and_then(Value::as_str).map(str::to_string);
                break;
            }

            if self.run_hooks("flow.hooks.after_step", step, &mut ctx)? {
                aborted = true;
                abort_reason = ctx.get("_flow_control_abort_reason").and_then(Value::as_str).map(str::to_string);
                break;
            }
        }

        Ok(FlowRunOutcome { ctx, aborted, abort_reason })
    }

    fn depends_on_satisfied(&self, step: &FlowStep, completed: &HashSet<String>) -> bool {
        step.depends_on.iter().all(|dep| completed.contains(dep))
    }

    /// Invoke every hook registered under `key`, in registration order.
    /// Returns `true` if a hook signalled abort via `{"_abort": true}` (or
    /// `{"__flow_control": "abort"}`, the same envelope a handler step can
    /// return), stamping `_flow_control_abort[_reason]` into `ctx` first.
    fn run_hooks(&self, key: &str, step: &FlowStep, ctx: &mut Value) -> Result<bool> {
        for hook in self.registry.get_all(key) {
            let Some(handler) = hook.as_handler() else { continue };
            let payload = serde_json::json!({"step_id": step.id, "ctx": ctx.clone()});
            let result = handler(payload)?;
            if let Some(true) = result.get("_skip").and_then(Value::as_bool) {
                break;
            }
            let abort = result.get("_abort").and_then(Value::as_bool) == Some(true)
                || result.get("__flow_control").and_then(Value::as_str) == Some("abort");
            if abort {
                if let Value::Object(map) = ctx {
                    map.insert("_flow_control_abort".to_string(), Value::Bool(true));
                    let reason = result.get("_abort_reason").or_else(|| result.get("reason")).cloned().unwrap_or(Value::Null);
                    map.insert("_flow_control_abort_reason".to_string(), reason);
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Decide what a failed step's error handler prescribes. Consults the
    /// step's own `on_error.action` first, then the
    /// `flow.error_handler` registry entry, defaulting to abort.
    fn error_action_for(&self, step: &FlowStep) -> ErrorAction {
        if let Some(action) = step.raw.get("on_error").and_then(|v| v.get("action")).and_then(Value::as_str) {
            return ErrorAction::from_str(action);
        }
        if let Some(data) = self.registry.get("flow.error_handler").and_then(|v| v.as_data().cloned()) {
            if let Some(action) = data.get("action").and_then(Value::as_str) {
                return ErrorAction::from_str(action);
            }
        }
        ErrorAction::Abort
    }

    fn execute_step(&self, step: &FlowStep, ctx: &Value, call_stack: &[String]) -> Result<Value> {
        let resolver = VariableResolver::new(ctx);
        let resolved_input = resolver.resolve(&step.input);

        match step.step_type.as_str() {
            "handler" => self.execute_handler_step(step, &resolved_input, ctx),
            "python_file_call" => self.execute_python_file_step(step, &resolved_input),
            "flow" => self.execute_sub_flow_step(step, ctx, call_stack),
            other => self.execute_construct_step(other, step, &resolved_input, ctx),
        }
    }

    fn resolve_handler(&self, name: &str) -> Option<HandlerFn> {
        if let Some(rest) = name.strip_prefix("kernel:") {
            return self.kernel_handlers.get(rest).or_else(|| self.kernel_handlers.get(name)).cloned();
        }
        self.registry.get_with(name, GetStrategy::Last).and_then(|v| v.as_handler().cloned())
    }

    fn execute_handler_step(&self, step: &FlowStep, resolved_input: &Value, ctx: &Value) -> Result<Value> {
        let handler_name = step
            .raw
            .get("handler")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation(format!("step '{}': handler step missing 'handler'", step.id)))?;
        let handler = self
            .resolve_handler(handler_name)
            .ok_or_else(|| Error::Validation(format!("step '{}': no handler registered for '{handler_name}'", step.id)))?;

        let payload = serde_json::json!({"args": resolved_input, "ctx": ctx});
        let result = handler(payload)?;
        Ok(unwrap_envelope(result))
    }

    fn execute_python_file_step(&self, step: &FlowStep, resolved_input: &Value) -> Result<Value> {
        let runner = self
            .python_file_runner
            .as_ref()
            .ok_or_else(|| Error::Sandbox(format!("step '{}': no python_file_call runner configured", step.id)))?;
        runner(step, resolved_input)
    }

    fn execute_sub_flow_step(&self, step: &FlowStep, ctx: &Value, call_stack: &[String]) -> Result<Value> {
        let flow_name = step
            .raw
            .get("flow")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation(format!("step '{}': flow step missing 'flow'", step.id)))?;
        let registered = self
            .registry
            .get_with(&format!("flow.{flow_name}"), GetStrategy::Last)
            .and_then(|v| v.as_data().cloned())
            .ok_or_else(|| Error::Validation(format!("step '{}': sub-flow '{flow_name}' not found", step.id)))?;
        let child_flow: FlowDefinition = serde_json::from_value(registered)
            .map_err(|e| Error::Validation(format!("step '{}': sub-flow '{flow_name}' is not a valid flow: {e}", step.id)))?;

        let mut child_stack = call_stack.to_vec();
        child_stack.push(flow_name.to_string());

        let outcome = self.execute(&child_flow, ctx.clone(), &child_stack)?;
        let child_ctx = outcome.ctx;
        Ok(child_ctx
            .get("output")
            .or_else(|| child_ctx.get("result"))
            .cloned()
            .unwrap_or(child_ctx))
    }

    fn execute_construct_step(&self, step_type: &str, step: &FlowStep, resolved_input: &Value, ctx: &Value) -> Result<Value> {
        let key = format!("flow.construct.{step_type}");
        let handler = self
            .registry
            .get_with(&key, GetStrategy::Last)
            .and_then(|v| v.as_handler().cloned())
            .ok_or_else(|| Error::Validation(format!("step '{}': no construct registered for type '{step_type}'", step.id)))?;
        let payload = serde_json::json!({"args": resolved_input, "ctx": ctx, "step": step.raw});
        let result = handler(payload)?;
        Ok(unwrap_envelope(result))
    }

    fn apply_output(&self, step: &FlowStep, ctx: &mut Value, output: Value) -> Result<()> {
        if let Some(name) = &step.output {
            let normalized = normalize_depth(&output, 0);
            if let Value::Object(map) = ctx {
                map.insert(name.clone(), normalized);
            }
        }
        Ok(())
    }
}

impl FlowExecutor {
    /// Public wrapper so callers (the scheduler, sub-flow lookups outside
    /// this module) can ask what a step's error handler would do without
    /// duplicating the resolution logic.
    pub fn error_action_for_step(&self, step: &FlowStep) -> &'static str {
        match self.error_action_for(step) {
            ErrorAction::Abort => "abort",
            ErrorAction::Retry => "retry",
            ErrorAction::Continue => "continue",
        }
    }
}

/// Cap recursion when copying a step's output value; past the limit the
/// remaining structure is returned as-is rather than walked further.
fn normalize_depth(value: &Value, depth: usize) -> Value {
    if depth >= MAX_OUTPUT_NORMALIZE_DEPTH {
        return value.clone();
    }
    match value {
        Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), normalize_depth(v, depth + 1))).collect()),
        Value::Array(items) => Value::Array(items.iter().map(|v| normalize_depth(v, depth + 1)).collect()),
        other => other.clone(),
    }
}

/// A handler/construct result of the shape `{"output": ...}` unwraps to its
/// inner value; anything else is returned whole. Matches
/// `_execute_handler_step_async`'s `result.get("output")` convention.
fn unwrap_envelope(result: Value) -> Value {
    match &result {
        Value::Object(map) if map.contains_key("output") && !map.contains_key("__flow_control") => {
            map.get("output").cloned().unwrap_or(Value::Null)
        }
        _ => result,
    }
}

/// Evaluate a `when` clause of the form `<var> == <literal>` or
/// `<var> != <literal>`. Grounded on `_eval_condition`'s regex-based
/// first-operator split: the left side is resolved as a `$flow`/`$ctx`/
/// `$env` variable (or looked up directly against `ctx` if it has no `$`
/// prefix), the right side is parsed as a bool, integer, or literal string.
fn eval_condition(cond: &str, ctx: &Value) -> bool {
    let Some((left, op, right)) = split_condition(cond) else {
        return true;
    };
    let resolver = VariableResolver::new(ctx);
    let left_value = if left.starts_with('$') {
        resolver.resolve(&Value::String(left.to_string()))
    } else {
        ctx.get(left).cloned().unwrap_or(Value::String(left.to_string()))
    };
    let right_value = parse_literal(right);

    let equal = values_equal(&left_value, &right_value);
    if op == "==" {
        equal
    } else {
        !equal
    }
}

fn split_condition(cond: &str) -> Option<(&str, &str, &str)> {
    for op in ["==", "!="] {
        if let Some(idx) = cond.find(op) {
            let left = cond[..idx].trim();
            let right = cond[idx + op.len()..].trim();
            if !left.is_empty() {
                return Some((left, op, right));
            }
        }
    }
    None
}

fn parse_literal(s: &str) -> Value {
    let s = s.trim();
    match s {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" | "none" => Value::Null,
        _ => {
            if let Ok(i) = s.parse::<i64>() {
                Value::from(i)
            } else if let Ok(f) = s.parse::<f64>() {
                Value::from(f)
            } else {
                Value::String(s.trim_matches(|c| c == '\'' || c == '"').to_string())
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    // A resolved value that stayed a string (e.g. "5") still compares equal
    // to a numeric/bool literal, matching the source's type-coercing compare.
    match (a, b) {
        (Value::String(s), other) | (other, Value::String(s)) => parse_literal(s) == *other,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::PathResolver;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    fn registry(dir: &std::path::Path) -> Arc<InterfaceRegistry> {
        Arc::new(InterfaceRegistry::new(&PathResolver::new(dir), false))
    }

    fn flow_with_steps(steps: Vec<FlowStep>) -> FlowDefinition {
        FlowDefinition {
            flow_id: "f".to_string(),
            inputs: Default::default(),
            outputs: Default::default(),
            phases: vec!["p".to_string()],
            defaults: json!({"fail_soft": true}).as_object().unwrap().clone(),
            steps,
            source_file: None,
            source: None,
            source_pack_id: None,
        }
    }

    fn step(id: &str, step_type: &str, raw: Value) -> FlowStep {
        FlowStep {
            id: id.to_string(),
            phase: "p".to_string(),
            priority: 100,
            step_type: step_type.to_string(),
            when: None,
            input: Value::Null,
            output: None,
            depends_on: Vec::new(),
            principal_id: None,
            owner_pack: None,
            file: None,
            timeout_seconds: 60.0,
            raw,
        }
    }

    #[test]
    fn executes_handler_step_and_assigns_output() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry
            .register_handler("tool.echo", Arc::new(|payload: Value| Ok(json!({"output": payload["args"]}))), None, None, None, None)
            .unwrap();

        let mut s = step("s1", "handler", json!({"handler": "tool.echo"}));
        s.input = json!("hello");
        s.output = Some("greeting".to_string());

        let executor = FlowExecutor::new(registry, Arc::new(StdHashMap::new()), None);
        let flow = flow_with_steps(vec![s]);
        let outcome = executor.execute(&flow, json!({}), &[]).unwrap();
        assert_eq!(outcome.ctx["greeting"], "hello");
        assert!(!outcome.aborted);
    }

    #[test]
    fn when_clause_skips_step() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.register_handler("tool.noop", Arc::new(|_| Ok(json!({"output": "ran"}))), None, None, None, None).unwrap();

        let mut s = step("s1", "handler", json!({"handler": "tool.noop"}));
        s.when = Some("enabled == true".to_string());
        s.output = Some("ran_flag".to_string());

        let executor = FlowExecutor::new(registry, Arc::new(StdHashMap::new()), None);
        let flow = flow_with_steps(vec![s]);
        let outcome = executor.execute(&flow, json!({"enabled": false}), &[]).unwrap();
        assert!(outcome.ctx.get("ran_flag").is_none());
    }

    #[test]
    fn missing_dependency_is_skipped_under_fail_soft() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.register_handler("tool.noop", Arc::new(|_| Ok(json!({"output": "ran"}))), None, None, None, None).unwrap();

        let mut s = step("s1", "handler", json!({"handler": "tool.noop"}));
        s.depends_on = vec!["never-ran".to_string()];
        s.output = Some("ran_flag".to_string());

        let executor = FlowExecutor::new(registry, Arc::new(StdHashMap::new()), None);
        let flow = flow_with_steps(vec![s]);
        let outcome = executor.execute(&flow, json!({}), &[]).unwrap();
        assert!(outcome.ctx.get("ran_flag").is_none());
    }

    #[test]
    fn handler_abort_signal_stops_remaining_steps() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry
            .register_handler("tool.abort", Arc::new(|_| Ok(json!({"__flow_control": "abort", "reason": "stop"}))), None, None, None, None)
            .unwrap();
        registry.register_handler("tool.never", Arc::new(|_| Ok(json!({"output": "should not run"}))), None, None, None, None).unwrap();

        let s1 = step("s1", "handler", json!({"handler": "tool.abort"}));
        let mut s2 = step("s2", "handler", json!({"handler": "tool.never"}));
        s2.output = Some("never".to_string());

        let executor = FlowExecutor::new(registry, Arc::new(StdHashMap::new()), None);
        let flow = flow_with_steps(vec![s1, s2]);
        let outcome = executor.execute(&flow, json!({}), &[]).unwrap();
        assert!(outcome.aborted);
        assert_eq!(outcome.abort_reason.as_deref(), Some("stop"));
        assert!(outcome.ctx.get("never").is_none());
    }

    #[test]
    fn sub_flow_cycle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let executor = FlowExecutor::new(registry, Arc::new(StdHashMap::new()), None);
        let flow = flow_with_steps(vec![]);
        // A top-level call seeds the stack with its own flow_id (see
        // KernelCore::run_flow), so "f" appearing once is a normal first
        // entry. A genuine cycle is "f" already present before this call
        // re-enters it, i.e. two occurrences on the incoming stack.
        let err = executor.execute(&flow, json!({}), &["f".to_string(), "f".to_string()]).unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }

    #[test]
    fn kernel_prefixed_handler_dispatches_through_the_builtin_table() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let mut kernel_handlers: StdHashMap<String, HandlerFn> = StdHashMap::new();
        kernel_handlers.insert("noop".to_string(), Arc::new(|_| Ok(json!({"output": "builtin"}))));

        let mut s = step("s1", "handler", json!({"handler": "kernel:noop"}));
        s.output = Some("result".to_string());

        let executor = FlowExecutor::new(registry, Arc::new(kernel_handlers), None);
        let flow = flow_with_steps(vec![s]);
        let outcome = executor.execute(&flow, json!({}), &[]).unwrap();
        assert_eq!(outcome.ctx["result"], "builtin");
    }

    #[test]
    fn condition_handles_numeric_and_string_literals() {
        assert!(eval_condition("count == 5", &json!({"count": 5})));
        assert!(!eval_condition("count == 5", &json!({"count": 6})));
        assert!(eval_condition("name != 'bob'", &json!({"name": "alice"})));
    }
}
