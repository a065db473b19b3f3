//! FlowModifierApplier — applies a sorted list of [`FlowModifierDef`]s to a
//! [`FlowDefinition`], producing a new, never-resorted step list plus a
//! diagnostic report of what applied, what was skipped, and why.
//!
//! Grounded on `core_runtime/flow_modifier.py::FlowModifierApplier`.

use std::collections::{HashMap, HashSet};

use crate::flow::definition::{FlowDefinition, FlowStep};

use super::definition::{ConflictSeverity, FlowModifierDef, ModifierAction, ModifierApplyResult, ModifierConflict};

const FIRST: &str = "__first__";
const LAST: &str = "__last__";

/// Checks whether a modifier's `requires` clause is currently satisfied.
/// Implemented by `InterfaceRegistry` in the full kernel; a plain set-backed
/// implementation is provided below for tests and dry runs with no
/// registry wired up.
pub trait AvailabilityChecker {
    fn has_interface(&self, name: &str) -> bool;
    fn has_capability(&self, name: &str) -> bool;
}

#[derive(Default)]
pub struct StaticAvailability {
    pub interfaces: HashSet<String>,
    pub capabilities: HashSet<String>,
}

impl AvailabilityChecker for StaticAvailability {
    fn has_interface(&self, name: &str) -> bool {
        self.interfaces.contains(name)
    }
    fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains(name)
    }
}

pub struct FlowModifierApplier<'a> {
    availability: &'a dyn AvailabilityChecker,
}

impl<'a> FlowModifierApplier<'a> {
    pub fn new(availability: &'a dyn AvailabilityChecker) -> Self {
        Self { availability }
    }

    fn check_requires(&self, modifier: &FlowModifierDef) -> Result<(), String> {
        for iface in &modifier.requires.interfaces {
            if !self.availability.has_interface(iface) {
                return Err(format!("interface '{iface}' not available"));
            }
        }
        for cap in &modifier.requires.capabilities {
            if !self.availability.has_capability(cap) {
                return Err(format!("capability '{cap}' not available"));
            }
        }
        Ok(())
    }

    /// Apply `modifiers` (already sorted by `(phase, priority, modifier_id)`
    /// per [`super::loader::FlowModifierLoader::modifiers_for_flow`]) to
    /// `flow`, returning the new flow and every per-modifier apply result.
    pub fn apply(&self, flow: &FlowDefinition, modifiers: &[FlowModifierDef]) -> (FlowDefinition, Vec<ModifierApplyResult>, Vec<ModifierConflict>) {
        let (steps, results, conflicts) = self.apply_inner(flow, modifiers);
        let mut new_flow = flow.clone();
        new_flow.steps = steps;
        (new_flow, results, conflicts)
    }

    /// Same as [`Self::apply`] but never mutates: returns only the report.
    pub fn dry_run_report(&self, flow: &FlowDefinition, modifiers: &[FlowModifierDef]) -> Vec<ModifierApplyResult> {
        let (_, results, _) = self.apply_inner(flow, modifiers);
        results
    }

    fn apply_inner(&self, flow: &FlowDefinition, modifiers: &[FlowModifierDef]) -> (Vec<FlowStep>, Vec<ModifierApplyResult>, Vec<ModifierConflict>) {
        let mut steps = flow.steps.clone();
        let mut results = Vec::new();

        let mut inject_before: HashMap<String, Vec<&FlowModifierDef>> = HashMap::new();
        let mut inject_after: HashMap<String, Vec<&FlowModifierDef>> = HashMap::new();
        let mut append: HashMap<String, Vec<&FlowModifierDef>> = HashMap::new();
        let mut other: Vec<&FlowModifierDef> = Vec::new();
        let mut resolved_phase: HashMap<&str, String> = HashMap::new();

        for modifier in modifiers {
            if let Err(reason) = self.check_requires(modifier) {
                results.push(skip(modifier, format!("requires_not_satisfied: {reason}")));
                continue;
            }

            let phase = if flow.phases.iter().any(|p| p == &modifier.phase) {
                modifier.phase.clone()
            } else if modifier.action == ModifierAction::Append {
                let Some(last) = flow.phases.last() else {
                    results.push(skip(modifier, format!("phase_not_found: {}", modifier.phase)));
                    continue;
                };
                tracing::info!(modifier_id = %modifier.modifier_id, phase = %modifier.phase, fallback = %last, "append modifier phase not found; falling back to last phase");
                last.clone()
            } else {
                results.push(skip(modifier, format!("phase_not_found: {}", modifier.phase)));
                continue;
            };
            resolved_phase.insert(modifier.modifier_id.as_str(), phase.clone());

            match modifier.action {
                ModifierAction::InjectBefore => inject_before.entry(modifier.target_step_id.clone().unwrap_or_default()).or_default().push(modifier),
                ModifierAction::InjectAfter => inject_after.entry(modifier.target_step_id.clone().unwrap_or_default()).or_default().push(modifier),
                ModifierAction::Append => append.entry(phase).or_default().push(modifier),
                ModifierAction::Replace | ModifierAction::Remove => other.push(modifier),
            }
        }

        let sort_key = |m: &&FlowModifierDef| (m.priority, m.step_id_hint().to_string(), m.modifier_id.clone());
        for group in inject_before.values_mut() {
            group.sort_by_key(sort_key);
        }
        for group in inject_after.values_mut() {
            group.sort_by_key(sort_key);
        }
        for group in append.values_mut() {
            group.sort_by_key(sort_key);
        }

        let conflicts = detect_conflicts(modifiers, &results);

        // 1. replace/remove. Each modifier's target is located once against
        // the flow's original step list — "the applier walks to [it]
        // separately" — so a replace and a remove racing for the same step
        // both report success regardless of which one a naive single-pass
        // mutation would have let clobber the other's target. Replace wins
        // the slot: if a step is targeted by both a replace and a remove,
        // the replacement step survives into the output and the remove is
        // absorbed (it still "succeeded" in that it found its target).
        let mut replace_by_index: HashMap<usize, &FlowModifierDef> = HashMap::new();
        let mut remove_indices: HashSet<usize> = HashSet::new();
        for modifier in &other {
            let target = modifier.target_step_id.as_deref().unwrap_or_default();
            match find_index(&steps, target) {
                Some(idx) => {
                    results.push(success(modifier));
                    match modifier.action {
                        ModifierAction::Replace => {
                            replace_by_index.insert(idx, modifier);
                        }
                        ModifierAction::Remove => {
                            remove_indices.insert(idx);
                        }
                        _ => unreachable!(),
                    }
                }
                None => results.push(skip(modifier, format!("target_step_not_found: {target}"))),
            }
        }
        steps = steps
            .into_iter()
            .enumerate()
            .filter_map(|(idx, step)| {
                if let Some(modifier) = replace_by_index.get(&idx) {
                    Some(step_from_def(modifier, resolved_phase.get(modifier.modifier_id.as_str()).cloned().unwrap_or_else(|| modifier.phase.clone())))
                } else if remove_indices.contains(&idx) {
                    None
                } else {
                    Some(step)
                }
            })
            .collect();

        // 2. inject_before groups.
        for (target, group) in &inject_before {
            let Some(idx) = resolve_target_index(&steps, target) else {
                for modifier in group {
                    results.push(skip(modifier, format!("target_step_not_found: {target}")));
                }
                continue;
            };
            for (i, modifier) in group.iter().enumerate() {
                let phase = resolved_phase.get(modifier.modifier_id.as_str()).cloned().unwrap_or_else(|| modifier.phase.clone());
                steps.insert(idx + i, step_from_def(modifier, phase));
                results.push(success(modifier));
            }
        }

        // 3. inject_after groups.
        for (target, group) in &inject_after {
            let Some(idx) = resolve_target_index(&steps, target) else {
                for modifier in group {
                    results.push(skip(modifier, format!("target_step_not_found: {target}")));
                }
                continue;
            };
            let insert_at = idx + 1;
            for (i, modifier) in group.iter().enumerate() {
                let phase = resolved_phase.get(modifier.modifier_id.as_str()).cloned().unwrap_or_else(|| modifier.phase.clone());
                steps.insert(insert_at + i, step_from_def(modifier, phase));
                results.push(success(modifier));
            }
        }

        // 4. append groups: insert just before the first step of the next phase.
        for (phase, group) in &append {
            let phase_order: HashMap<&str, usize> = flow.phases.iter().enumerate().map(|(i, p)| (p.as_str(), i)).collect();
            let target_order = phase_order.get(phase.as_str()).copied().unwrap_or(usize::MAX);
            for modifier in group {
                let insert_at = steps
                    .iter()
                    .position(|s| phase_order.get(s.phase.as_str()).copied().unwrap_or(usize::MAX) > target_order)
                    .unwrap_or(steps.len());
                steps.insert(insert_at, step_from_def(modifier, phase.clone()));
                results.push(success(modifier));
            }
        }

        (steps, results, conflicts)
    }
}

fn find_index(steps: &[FlowStep], id: &str) -> Option<usize> {
    steps.iter().position(|s| s.id == id)
}

fn resolve_target_index(steps: &[FlowStep], target: &str) -> Option<usize> {
    match target {
        FIRST => (!steps.is_empty()).then_some(0),
        LAST => (!steps.is_empty()).then(|| steps.len() - 1),
        _ => find_index(steps, target),
    }
}

fn step_from_def(modifier: &FlowModifierDef, phase: String) -> FlowStep {
    let step = modifier.step.clone().unwrap_or(serde_json::Value::Null);
    let id = step.get("id").and_then(|v| v.as_str()).map(str::to_string).unwrap_or_else(|| format!("modifier_{}", modifier.modifier_id));
    let step_type = step.get("type").and_then(|v| v.as_str()).unwrap_or("handler").to_string();
    FlowStep {
        id,
        phase,
        priority: step.get("priority").and_then(|v| v.as_i64()).unwrap_or(100),
        step_type,
        when: step.get("when").and_then(|v| v.as_str()).map(str::to_string),
        input: step.get("input").cloned().unwrap_or(serde_json::Value::Null),
        output: step.get("output").and_then(|v| v.as_str()).map(str::to_string),
        depends_on: step.get("depends_on").and_then(|v| v.as_array()).map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect()).unwrap_or_default(),
        principal_id: step.get("principal_id").and_then(|v| v.as_str()).map(str::to_string),
        owner_pack: step.get("owner_pack").and_then(|v| v.as_str()).map(str::to_string),
        file: step.get("file").and_then(|v| v.as_str()).map(str::to_string),
        timeout_seconds: step.get("timeout_seconds").and_then(|v| v.as_f64()).unwrap_or(60.0),
        raw: step,
    }
}

fn success(modifier: &FlowModifierDef) -> ModifierApplyResult {
    tracing::warn!(
        modifier_id = %modifier.modifier_id,
        pack = %modifier.source_pack_id.as_deref().unwrap_or("unknown"),
        target_flow = %modifier.target_flow_id,
        action = %modifier.action.as_str(),
        "pack is modifying flow"
    );
    if modifier.requires.interfaces.is_empty() && modifier.requires.capabilities.is_empty() {
        tracing::warn!(modifier_id = %modifier.modifier_id, "modifier has no 'requires' conditions; applies unconditionally");
    }
    ModifierApplyResult {
        success: true,
        modifier_id: modifier.modifier_id.clone(),
        action: modifier.action,
        target_flow_id: modifier.target_flow_id.clone(),
        target_step_id: modifier.target_step_id.clone(),
        skipped_reason: None,
    }
}

fn skip(modifier: &FlowModifierDef, reason: String) -> ModifierApplyResult {
    ModifierApplyResult {
        success: false,
        modifier_id: modifier.modifier_id.clone(),
        action: modifier.action,
        target_flow_id: modifier.target_flow_id.clone(),
        target_step_id: modifier.target_step_id.clone(),
        skipped_reason: Some(reason),
    }
}

fn detect_conflicts(modifiers: &[FlowModifierDef], results: &[ModifierApplyResult]) -> Vec<ModifierConflict> {
    let skipped: HashSet<&str> = results.iter().filter(|r| r.skipped_reason.is_some()).map(|r| r.modifier_id.as_str()).collect();
    let active: Vec<&FlowModifierDef> = modifiers.iter().filter(|m| !skipped.contains(m.modifier_id.as_str())).collect();
    let active_ids: HashSet<&str> = active.iter().map(|m| m.modifier_id.as_str()).collect();

    let mut conflicts = Vec::new();
    let mut by_target: HashMap<&str, Vec<&FlowModifierDef>> = HashMap::new();
    for m in &active {
        if let Some(tsid) = &m.target_step_id {
            by_target.entry(tsid.as_str()).or_default().push(m);
        }
    }
    for (tsid, group) in &by_target {
        if group.len() < 2 {
            continue;
        }
        let has_remove = group.iter().any(|m| m.action == ModifierAction::Remove);
        let has_mutating = group.iter().any(|m| matches!(m.action, ModifierAction::Replace | ModifierAction::InjectBefore | ModifierAction::InjectAfter));
        let severity = if has_remove && has_mutating { ConflictSeverity::Severe } else { ConflictSeverity::Info };
        let ids: Vec<String> = group.iter().map(|m| m.modifier_id.clone()).collect();
        if severity == ConflictSeverity::Severe {
            tracing::warn!(target_step_id = %tsid, modifiers = ?ids, "severe conflict: remove and inject/replace on same step");
        } else {
            tracing::warn!(target_step_id = %tsid, modifiers = ?ids, "multiple modifiers target the same step");
        }
        conflicts.push(ModifierConflict { target_step_id: tsid.to_string(), modifier_ids: ids, severity });
    }

    for m in &active {
        for cid in &m.conflicts_with {
            if active_ids.contains(cid.as_str()) {
                tracing::warn!(modifier_id = %m.modifier_id, conflicts_with = %cid, "declared conflict: both modifiers are active");
                conflicts.push(ModifierConflict {
                    target_step_id: m.target_step_id.clone().unwrap_or_default(),
                    modifier_ids: vec![m.modifier_id.clone(), cid.clone()],
                    severity: ConflictSeverity::Declared,
                });
            }
        }
        for cid in &m.compatible_with {
            if !active_ids.contains(cid.as_str()) {
                tracing::warn!(modifier_id = %m.modifier_id, compatible_with = %cid, "declared compatible_with modifier is not active");
                conflicts.push(ModifierConflict {
                    target_step_id: m.target_step_id.clone().unwrap_or_default(),
                    modifier_ids: vec![m.modifier_id.clone(), cid.clone()],
                    severity: ConflictSeverity::Compatibility,
                });
            }
        }
    }

    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modifier::definition::ModifierRequires;

    fn flow() -> FlowDefinition {
        FlowDefinition {
            flow_id: "f".to_string(),
            inputs: Default::default(),
            outputs: Default::default(),
            phases: vec!["a".to_string()],
            defaults: Default::default(),
            steps: vec![step("s1", "a", 100), step("s2", "a", 100)],
            source_file: None,
            source: None,
            source_pack_id: None,
        }
    }

    fn step(id: &str, phase: &str, priority: i64) -> FlowStep {
        FlowStep {
            id: id.to_string(),
            phase: phase.to_string(),
            priority,
            step_type: "handler".to_string(),
            when: None,
            input: serde_json::Value::Null,
            output: None,
            depends_on: vec![],
            principal_id: None,
            owner_pack: None,
            file: None,
            timeout_seconds: 60.0,
            raw: serde_json::Value::Null,
        }
    }

    fn modifier(id: &str, action: ModifierAction, target: Option<&str>, step_id: &str, priority: i64) -> FlowModifierDef {
        FlowModifierDef {
            modifier_id: id.to_string(),
            target_flow_id: "f".to_string(),
            phase: "a".to_string(),
            priority,
            action,
            target_step_id: target.map(str::to_string),
            step: Some(serde_json::json!({"id": step_id, "type": "handler"})),
            requires: ModifierRequires::default(),
            conflicts_with: vec![],
            compatible_with: vec![],
            source_file: None,
            source_pack_id: Some("p1".to_string()),
        }
    }

    #[test]
    fn inject_before_layering_matches_scenario() {
        let avail = StaticAvailability::default();
        let applier = FlowModifierApplier::new(&avail);
        let m1 = modifier("M1", ModifierAction::InjectBefore, Some("s2"), "x", 50);
        let m2 = modifier("M2", ModifierAction::InjectBefore, Some("s2"), "y", 100);
        let (new_flow, results, _) = applier.apply(&flow(), &[m1, m2]);
        let ids: Vec<&str> = new_flow.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "x", "y", "s2"]);
        assert!(results.iter().all(|r| r.success));
    }

    #[test]
    fn remove_then_replace_conflict_reports_severe_but_replace_wins() {
        let avail = StaticAvailability::default();
        let applier = FlowModifierApplier::new(&avail);
        let m3 = modifier("M3", ModifierAction::Remove, Some("s2"), "", 100);
        let m4 = modifier("M4", ModifierAction::Replace, Some("s2"), "z", 100);
        let (new_flow, results, conflicts) = applier.apply(&flow(), &[m3, m4]);
        let ids: Vec<&str> = new_flow.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "z"]);
        assert!(results.iter().all(|r| r.success));
        assert!(conflicts.iter().any(|c| c.severity == ConflictSeverity::Severe));
    }

    #[test]
    fn missing_requires_skips_modifier() {
        let avail = StaticAvailability::default();
        let applier = FlowModifierApplier::new(&avail);
        let mut m = modifier("M1", ModifierAction::Append, None, "x", 100);
        m.requires.capabilities.push("docker.run".to_string());
        let (new_flow, results, _) = applier.apply(&flow(), &[m]);
        assert_eq!(new_flow.steps.len(), 2);
        assert!(!results[0].success);
        assert!(results[0].skipped_reason.as_ref().unwrap().contains("requires_not_satisfied"));
    }

    #[test]
    fn append_falls_back_to_last_phase_when_missing() {
        let avail = StaticAvailability::default();
        let applier = FlowModifierApplier::new(&avail);
        let mut m = modifier("M1", ModifierAction::Append, None, "x", 100);
        m.phase = "does_not_exist".to_string();
        let (new_flow, results, _) = applier.apply(&flow(), &[m]);
        assert!(results[0].success);
        assert_eq!(new_flow.steps.last().unwrap().id, "x");
    }

    #[test]
    fn non_append_unknown_phase_is_skipped() {
        let avail = StaticAvailability::default();
        let applier = FlowModifierApplier::new(&avail);
        let mut m = modifier("M1", ModifierAction::Replace, Some("s1"), "x", 100);
        m.phase = "does_not_exist".to_string();
        let (_, results, _) = applier.apply(&flow(), &[m]);
        assert!(!results[0].success);
        assert_eq!(results[0].skipped_reason.as_deref(), Some("phase_not_found: does_not_exist"));
    }
}
