//! FlowComposer and the function-alias registry it uses for late-bound step
//! targeting.
//!
//! Grounded on `core_runtime/flow_composer.py` and
//! `core_runtime/function_alias.py`. The file-based precedence, conflict
//! detection, and insertion algorithm already live in
//! [`crate::modifier::FlowModifierApplier`]; `FlowComposer` is the thin layer
//! on top of it that:
//!
//! - collects *dynamically* registered modifiers — ones an ecosystem
//!   component pushed into [`crate::interface_registry::InterfaceRegistry`]
//!   at runtime under the `flow.modifier` key, rather than shipping a
//!   `*.modifier.yaml` file — and
//! - resolves a modifier's target by function/handler name (with alias
//!   resolution) into a concrete `target_step_id` before handing the
//!   modifier to the applier.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::flow::FlowDefinition;
use crate::modifier::FlowModifierDef;

/// Canonical-name <-> alias mapping. No name is hardcoded by the kernel;
/// ecosystem components register their own synonyms (e.g. `ai_client`,
/// `ai_provider`, `llm` as aliases of the canonical `ai`).
#[derive(Debug, Default)]
pub struct FunctionAliasRegistry {
    inner: RwLock<AliasTables>,
}

#[derive(Debug, Default)]
struct AliasTables {
    canonical_to_aliases: std::collections::HashMap<String, HashSet<String>>,
    alias_to_canonical: std::collections::HashMap<String, String>,
}

impl FunctionAliasRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `canonical` together with its aliases. `canonical` is always
    /// included among its own aliases. Any alias previously owned by a
    /// different canonical is moved over.
    pub fn register_aliases(&self, canonical: &str, aliases: &[String]) {
        let mut tables = self.inner.write();
        reassign(&mut tables, canonical, canonical);
        tables.canonical_to_aliases.entry(canonical.to_string()).or_default().insert(canonical.to_string());
        for alias in aliases {
            reassign(&mut tables, alias, canonical);
            tables.canonical_to_aliases.entry(canonical.to_string()).or_default().insert(alias.clone());
            tables.alias_to_canonical.insert(alias.clone(), canonical.to_string());
        }
        tables.alias_to_canonical.insert(canonical.to_string(), canonical.to_string());
    }

    /// Register a single alias of `canonical`.
    pub fn add_alias(&self, canonical: &str, alias: &str) {
        self.register_aliases(canonical, std::slice::from_ref(&alias.to_string()));
    }

    /// Resolve `name` to its canonical form, or return it unchanged if it is
    /// not a known alias.
    pub fn resolve(&self, name: &str) -> String {
        let tables = self.inner.read();
        tables.alias_to_canonical.get(name).cloned().unwrap_or_else(|| name.to_string())
    }

    /// Every name (including `canonical` itself) registered under
    /// `canonical`, sorted. `[canonical]` if nothing is registered.
    pub fn find_all(&self, canonical: &str) -> Vec<String> {
        let tables = self.inner.read();
        match tables.canonical_to_aliases.get(canonical) {
            Some(set) => {
                let mut v: Vec<String> = set.iter().cloned().collect();
                v.sort();
                v
            }
            None => vec![canonical.to_string()],
        }
    }

    pub fn is_alias_of(&self, name: &str, canonical: &str) -> bool {
        self.inner.read().alias_to_canonical.get(name).is_some_and(|c| c == canonical)
    }

    pub fn get_canonical(&self, name: &str) -> Option<String> {
        self.inner.read().alias_to_canonical.get(name).cloned()
    }

    pub fn list_all_canonicals(&self) -> Vec<String> {
        let mut v: Vec<String> = self.inner.read().canonical_to_aliases.keys().cloned().collect();
        v.sort();
        v
    }

    /// Remove a single alias. The canonical name itself cannot be removed
    /// this way — use [`Self::remove_canonical`].
    pub fn remove_alias(&self, alias: &str) -> bool {
        let mut tables = self.inner.write();
        let Some(canonical) = tables.alias_to_canonical.get(alias).cloned() else {
            return false;
        };
        if alias == canonical {
            return false;
        }
        tables.alias_to_canonical.remove(alias);
        if let Some(set) = tables.canonical_to_aliases.get_mut(&canonical) {
            set.remove(alias);
        }
        true
    }

    /// Remove a canonical name and every alias registered under it.
    pub fn remove_canonical(&self, canonical: &str) -> bool {
        let mut tables = self.inner.write();
        let Some(aliases) = tables.canonical_to_aliases.remove(canonical) else {
            return false;
        };
        for alias in aliases {
            tables.alias_to_canonical.remove(&alias);
        }
        true
    }

    pub fn clear(&self) {
        let mut tables = self.inner.write();
        tables.canonical_to_aliases.clear();
        tables.alias_to_canonical.clear();
    }
}

fn reassign(tables: &mut AliasTables, name: &str, new_canonical: &str) {
    if let Some(old_canonical) = tables.alias_to_canonical.get(name).cloned() {
        if old_canonical != new_canonical {
            if let Some(set) = tables.canonical_to_aliases.get_mut(&old_canonical) {
                set.remove(name);
            }
        }
    }
}

/// How a dynamically registered modifier names the step it targets. Exactly
/// one field is normally set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepTarget {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub handler: Option<String>,
}

/// Record of a modifier that was actually applied, kept for introspection
/// (`GET /composer/applied` style endpoints, diagnostics).
#[derive(Debug, Clone)]
pub struct AppliedModifier {
    pub modifier_id: String,
    pub applied_at: DateTime<Utc>,
    pub source_component: Option<String>,
}

/// Resolves dynamically registered modifier targets against a flow's steps
/// and tracks which modifiers actually landed. The insertion/conflict
/// machinery itself is [`crate::modifier::FlowModifierApplier`]'s.
pub struct FlowComposer {
    alias_registry: FunctionAliasRegistry,
    applied: RwLock<Vec<AppliedModifier>>,
}

impl Default for FlowComposer {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowComposer {
    pub fn new() -> Self {
        Self { alias_registry: FunctionAliasRegistry::new(), applied: RwLock::new(Vec::new()) }
    }

    pub fn with_alias_registry(alias_registry: FunctionAliasRegistry) -> Self {
        Self { alias_registry, applied: RwLock::new(Vec::new()) }
    }

    pub fn alias_registry(&self) -> &FunctionAliasRegistry {
        &self.alias_registry
    }

    /// Resolve `target` to a concrete step id in `flow`, preferring an exact
    /// id match, then alias-aware function/handler matching. `None` if
    /// nothing matches.
    pub fn resolve_target_step_id(&self, flow: &FlowDefinition, target: &StepTarget) -> Option<String> {
        if let Some(id) = &target.id {
            if flow.step(id).is_some() {
                return Some(id.clone());
            }
        }

        if let Some(function) = &target.function {
            let aliases = self.alias_registry.find_all(function);
            for step in &flow.steps {
                let step_function = step.step_type.split('.').next().unwrap_or("");
                let run_handler = step.raw.get("handler").and_then(|v| v.as_str()).unwrap_or("");
                let run_function = run_handler.split('.').next().unwrap_or("");
                if aliases.iter().any(|a| a == run_function || a == step_function || a == step.step_type.as_str()) {
                    return Some(step.id.clone());
                }
            }
        }

        if let Some(handler) = &target.handler {
            for step in &flow.steps {
                let step_handler = step.raw.get("handler").and_then(|v| v.as_str());
                if step_handler == Some(handler.as_str()) {
                    return Some(step.id.clone());
                }
            }
        }

        None
    }

    /// Record that `modifier_id` was applied, for later introspection via
    /// [`Self::applied_modifiers`].
    pub fn record_applied(&self, modifier_id: &str, source_component: Option<String>) {
        self.applied.write().push(AppliedModifier { modifier_id: modifier_id.to_string(), applied_at: Utc::now(), source_component });
    }

    pub fn applied_modifiers(&self) -> Vec<AppliedModifier> {
        self.applied.read().clone()
    }

    pub fn clear_applied(&self) {
        self.applied.write().clear();
    }
}

/// Parse a raw `flow.modifier` registration (as deposited in
/// [`crate::interface_registry::InterfaceRegistry`] by an ecosystem
/// component) into a [`FlowModifierDef`], resolving a `target.function`/
/// `target.handler` spec into `target_step_id` against `flow` first.
pub fn resolve_dynamic_modifier(composer: &FlowComposer, flow: &FlowDefinition, mut def: FlowModifierDef, target: Option<&StepTarget>) -> FlowModifierDef {
    if def.target_step_id.is_none() {
        if let Some(target) = target {
            def.target_step_id = composer.resolve_target_step_id(flow, target);
        }
    }
    def
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowStep;

    fn step(id: &str, step_type: &str, handler: Option<&str>) -> FlowStep {
        FlowStep {
            id: id.to_string(),
            phase: "main".to_string(),
            priority: 100,
            step_type: step_type.to_string(),
            when: None,
            input: serde_json::Value::Null,
            output: None,
            depends_on: Vec::new(),
            principal_id: None,
            owner_pack: None,
            file: None,
            timeout_seconds: 60.0,
            raw: handler.map(|h| serde_json::json!({"handler": h})).unwrap_or(serde_json::Value::Null),
        }
    }

    fn flow(steps: Vec<FlowStep>) -> FlowDefinition {
        FlowDefinition {
            flow_id: "f".to_string(),
            inputs: Default::default(),
            outputs: Default::default(),
            phases: vec!["main".to_string()],
            defaults: Default::default(),
            steps,
            source_file: None,
            source: None,
            source_pack_id: None,
        }
    }

    #[test]
    fn register_aliases_includes_canonical_and_resolves_back() {
        let registry = FunctionAliasRegistry::new();
        registry.register_aliases("ai", &["ai_client".to_string(), "llm".to_string()]);
        assert_eq!(registry.resolve("ai_client"), "ai");
        assert_eq!(registry.resolve("llm"), "ai");
        assert_eq!(registry.resolve("unregistered"), "unregistered");
        assert_eq!(registry.find_all("ai"), vec!["ai".to_string(), "ai_client".to_string(), "llm".to_string()]);
    }

    #[test]
    fn reregistering_alias_under_new_canonical_moves_it() {
        let registry = FunctionAliasRegistry::new();
        registry.register_aliases("ai", &["shared".to_string()]);
        registry.register_aliases("tool", &["shared".to_string()]);
        assert_eq!(registry.resolve("shared"), "tool");
        assert!(!registry.find_all("ai").contains(&"shared".to_string()));
    }

    #[test]
    fn remove_canonical_cannot_be_undone_by_remove_alias() {
        let registry = FunctionAliasRegistry::new();
        registry.register_aliases("ai", &["llm".to_string()]);
        assert!(!registry.remove_alias("ai"));
        assert!(registry.remove_canonical("ai"));
        assert_eq!(registry.resolve("llm"), "llm");
    }

    #[test]
    fn resolve_target_step_id_matches_by_exact_id() {
        let composer = FlowComposer::new();
        let f = flow(vec![step("s1", "handler", None)]);
        let target = StepTarget { id: Some("s1".to_string()), function: None, handler: None };
        assert_eq!(composer.resolve_target_step_id(&f, &target), Some("s1".to_string()));
    }

    #[test]
    fn resolve_target_step_id_matches_by_function_alias() {
        let composer = FlowComposer::new();
        composer.alias_registry().register_aliases("ai", &["ai_client".to_string()]);
        let f = flow(vec![step("s1", "handler", Some("ai_client.generate"))]);
        let target = StepTarget { id: None, function: Some("ai".to_string()), handler: None };
        assert_eq!(composer.resolve_target_step_id(&f, &target), Some("s1".to_string()));
    }

    #[test]
    fn resolve_target_step_id_matches_by_handler_name() {
        let composer = FlowComposer::new();
        let f = flow(vec![step("s1", "handler", Some("ai.generate"))]);
        let target = StepTarget { id: None, function: None, handler: Some("ai.generate".to_string()) };
        assert_eq!(composer.resolve_target_step_id(&f, &target), Some("s1".to_string()));
    }

    #[test]
    fn unmatched_target_returns_none() {
        let composer = FlowComposer::new();
        let f = flow(vec![step("s1", "handler", Some("ai.generate"))]);
        let target = StepTarget { id: None, function: Some("nothing".to_string()), handler: None };
        assert_eq!(composer.resolve_target_step_id(&f, &target), None);
    }
}
