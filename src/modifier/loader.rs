//! FlowModifierLoader — discovers and validates `*.modifier.yaml` files in
//! precedence order: shared (unconditional) > pack-provided (approval
//! gated) > legacy ecosystem-wide (deprecated, env-gated).
//!
//! Grounded on `core_runtime/flow_modifier.py::FlowModifierLoader`.

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::RwLock;

use crate::approval::ApprovalManager;
use crate::config::KernelConfig;
use crate::grants::network::NetworkGrantManager;
use crate::paths::PathResolver;

use super::definition::{FlowModifierDef, ModifierAction, ModifierRequires, ModifierSkipRecord};

const LOCAL_PACK_ID: &str = "local_pack";
const MAX_YAML_DEPTH: usize = 20;
const MAX_YAML_NODES: usize = 10_000;

#[derive(Debug, Clone)]
pub struct ModifierLoadError {
    pub file: std::path::PathBuf,
    pub error: String,
}

#[derive(Default)]
pub struct ModifierLoadReport {
    pub errors: Vec<ModifierLoadError>,
    pub skipped: Vec<ModifierSkipRecord>,
}

pub struct FlowModifierLoader<'a> {
    resolver: PathResolver,
    config: KernelConfig,
    approval: Option<&'a ApprovalManager>,
    network: Option<&'a NetworkGrantManager>,
    modifiers: RwLock<BTreeMap<String, FlowModifierDef>>,
}

impl<'a> FlowModifierLoader<'a> {
    pub fn new(resolver: PathResolver, config: KernelConfig) -> Self {
        Self {
            resolver,
            config,
            approval: None,
            network: None,
            modifiers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Wire the approval manager that gates pack-provided and legacy
    /// modifier directories, and the network grant manager that gets
    /// disabled on a hash-mismatch detection.
    pub fn with_managers(mut self, approval: &'a ApprovalManager, network: &'a NetworkGrantManager) -> Self {
        self.approval = Some(approval);
        self.network = Some(network);
        self
    }

    pub fn load_all(&self) -> ModifierLoadReport {
        let mut loaded = BTreeMap::new();
        let mut report = ModifierLoadReport::default();

        self.load_directory(&self.resolver.shared_modifiers_dir(), None, &mut loaded, &mut report);

        for pack_id in self.resolver.discover_pack_ids() {
            let (approved, reason) = self.check_pack_approval(&pack_id);
            let dir = self.resolver.pack_modifiers_dir(&pack_id);
            if !approved {
                self.record_skips(&dir, Some(&pack_id), reason.as_deref().unwrap_or("not_approved"), &mut report);
                continue;
            }
            self.load_directory(&dir, Some(&pack_id), &mut loaded, &mut report);
        }

        if self.config.local_pack_mode_require_approval {
            let (approved, reason) = self.check_pack_approval(LOCAL_PACK_ID);
            let dir = self.resolver.ecosystem_modifiers_dir();
            if !approved {
                self.record_skips(&dir, Some(LOCAL_PACK_ID), reason.as_deref().unwrap_or("not_approved"), &mut report);
            } else {
                tracing::warn!(
                    "legacy ecosystem/flows/modifiers/ directory is deprecated; use user_data/shared/flows/modifiers/ instead"
                );
                self.load_directory(&dir, Some(LOCAL_PACK_ID), &mut loaded, &mut report);
            }
        }

        *self.modifiers.write() = loaded;
        report
    }

    fn check_pack_approval(&self, pack_id: &str) -> (bool, Option<String>) {
        let Some(approval) = self.approval else {
            return (true, None);
        };
        if approval.is_approved(pack_id) {
            return (true, None);
        }
        match approval.state(pack_id) {
            Some(crate::approval::ApprovalState::Modified) => {
                if let Some(network) = self.network {
                    network.mark_disabled(pack_id);
                }
                (false, Some("hash_mismatch".to_string()))
            }
            Some(_) => (false, Some("not_approved".to_string())),
            None => (false, Some("unknown_pack".to_string())),
        }
    }

    fn record_skips(&self, dir: &Path, pack_id: Option<&str>, reason: &str, report: &mut ModifierLoadReport) {
        for file in discover_modifier_files(dir) {
            report.skipped.push(ModifierSkipRecord {
                file,
                pack_id: pack_id.map(str::to_string),
                reason: reason.to_string(),
            });
        }
    }

    fn load_directory(&self, dir: &Path, pack_id: Option<&str>, loaded: &mut BTreeMap<String, FlowModifierDef>, report: &mut ModifierLoadReport) {
        for file in discover_modifier_files(dir) {
            match load_modifier_file(&file, pack_id, self.config.max_modifier_file_bytes) {
                Ok(def) => {
                    if loaded.contains_key(&def.modifier_id) {
                        report.errors.push(ModifierLoadError {
                            file: file.clone(),
                            error: format!("duplicate modifier_id: {}", def.modifier_id),
                        });
                        continue;
                    }
                    if def.target_flow_id == "*" && !self.wildcard_allowed(pack_id) {
                        report.skipped.push(ModifierSkipRecord {
                            file,
                            pack_id: pack_id.map(str::to_string),
                            reason: "wildcard_modifier_not_allowed".to_string(),
                        });
                        continue;
                    }
                    if def.target_flow_id == "*" {
                        tracing::warn!(modifier_id = %def.modifier_id, "modifier targets ALL flows (target_flow_id='*')");
                    }
                    loaded.insert(def.modifier_id.clone(), def);
                }
                Err(error) => report.errors.push(ModifierLoadError { file, error }),
            }
        }
    }

    fn wildcard_allowed(&self, pack_id: Option<&str>) -> bool {
        if self.config.allow_wildcard_modifiers {
            return true;
        }
        let Some(pack_id) = pack_id else { return false };
        let manifest = self.resolver.pack_manifest_file(pack_id);
        let Ok(raw) = std::fs::read_to_string(manifest) else {
            return false;
        };
        serde_json::from_str::<serde_json::Value>(&raw)
            .ok()
            .and_then(|v| v.get("allow_wildcard_modifiers").and_then(|b| b.as_bool()))
            .unwrap_or(false)
    }

    pub fn get(&self, modifier_id: &str) -> Option<FlowModifierDef> {
        self.modifiers.read().get(modifier_id).cloned()
    }

    pub fn all(&self) -> BTreeMap<String, FlowModifierDef> {
        self.modifiers.read().clone()
    }

    /// Modifiers matching `flow_id`, sorted by `(phase, priority, modifier_id)`.
    pub fn modifiers_for_flow(&self, flow_id: &str) -> Vec<FlowModifierDef> {
        let mut matches: Vec<FlowModifierDef> = self
            .modifiers
            .read()
            .values()
            .filter(|m| glob_match(&m.target_flow_id, flow_id))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.phase.cmp(&b.phase).then(a.priority.cmp(&b.priority)).then(a.modifier_id.cmp(&b.modifier_id)));
        matches
    }
}

fn discover_modifier_files(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files: Vec<std::path::PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.ends_with(".modifier.yaml")))
        .collect();
    files.sort();
    files
}

fn load_modifier_file(path: &Path, pack_id: Option<&str>, max_bytes: u64) -> Result<FlowModifierDef, String> {
    let metadata = std::fs::metadata(path).map_err(|e| format!("file read error: {e}"))?;
    if metadata.len() > max_bytes {
        return Err(format!("modifier file exceeds {max_bytes} byte cap"));
    }
    let raw = std::fs::read_to_string(path).map_err(|e| format!("file read error: {e}"))?;
    let value: serde_json::Value = serde_yml::from_str(&raw).map_err(|e| format!("YAML parse error: {e}"))?;

    let mut node_count = 0usize;
    let depth = yaml_shape(&value, 0, &mut node_count);
    if depth > MAX_YAML_DEPTH {
        return Err(format!("modifier YAML exceeds max depth {MAX_YAML_DEPTH}"));
    }
    if node_count > MAX_YAML_NODES {
        return Err(format!("modifier YAML exceeds max node count {MAX_YAML_NODES}"));
    }

    let serde_json::Value::Object(obj) = &value else {
        return Err("modifier file must be a YAML object".to_string());
    };

    let modifier_id = obj
        .get("modifier_id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or("missing or invalid 'modifier_id'")?
        .to_string();
    let target_flow_id = obj
        .get("target_flow_id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or("missing or invalid 'target_flow_id'")?
        .to_string();
    let phase = obj
        .get("phase")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or("missing or invalid 'phase'")?
        .to_string();
    let action_str = obj.get("action").and_then(|v| v.as_str()).ok_or("missing or invalid 'action'")?;
    let action = ModifierAction::parse(action_str)?;

    let target_step_id = obj.get("target_step_id").and_then(|v| v.as_str()).map(str::to_string);
    if matches!(action, ModifierAction::InjectBefore | ModifierAction::InjectAfter | ModifierAction::Replace | ModifierAction::Remove) && target_step_id.is_none() {
        return Err(format!("'target_step_id' is required for action '{}'", action.as_str()));
    }

    let step = obj.get("step").cloned();
    if matches!(action, ModifierAction::InjectBefore | ModifierAction::InjectAfter | ModifierAction::Append | ModifierAction::Replace) {
        let Some(step_val) = &step else {
            return Err(format!("'step' is required for action '{}'", action.as_str()));
        };
        if step_val.get("id").is_none() {
            return Err("'step.id' is required".to_string());
        }
        if step_val.get("type").is_none() {
            return Err("'step.type' is required".to_string());
        }
    }

    let priority = match obj.get("priority") {
        Some(v) if v.is_i64() || v.is_u64() || v.is_f64() => v.as_i64().unwrap_or(v.as_f64().unwrap_or(100.0) as i64),
        _ => 100,
    };

    let requires = match obj.get("requires") {
        Some(serde_json::Value::Object(r)) => ModifierRequires {
            interfaces: r.get("interfaces").and_then(|v| v.as_array()).map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect()).unwrap_or_default(),
            capabilities: r.get("capabilities").and_then(|v| v.as_array()).map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect()).unwrap_or_default(),
        },
        _ => ModifierRequires::default(),
    };

    let conflicts_with = obj.get("conflicts_with").and_then(|v| v.as_array()).map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect()).unwrap_or_default();
    let compatible_with = obj.get("compatible_with").and_then(|v| v.as_array()).map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect()).unwrap_or_default();

    Ok(FlowModifierDef {
        modifier_id,
        target_flow_id,
        phase,
        priority,
        action,
        target_step_id,
        step,
        requires,
        conflicts_with,
        compatible_with,
        source_file: Some(path.to_path_buf()),
        source_pack_id: pack_id.map(str::to_string),
    })
}

fn yaml_shape(value: &serde_json::Value, depth: usize, node_count: &mut usize) -> usize {
    *node_count += 1;
    match value {
        serde_json::Value::Object(map) => map.values().map(|v| yaml_shape(v, depth + 1, node_count)).max().unwrap_or(depth),
        serde_json::Value::Array(arr) => arr.iter().map(|v| yaml_shape(v, depth + 1, node_count)).max().unwrap_or(depth),
        _ => depth,
    }
}

/// Minimal shell-style glob matching `*` (any run of characters) and `?`
/// (any single character); sufficient for `target_flow_id` patterns
/// including the universal wildcard `"*"`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains(['*', '?']) {
        return pattern == text;
    }
    glob_match_bytes(pattern.as_bytes(), text.as_bytes())
}

fn glob_match_bytes(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => glob_match_bytes(&pattern[1..], text) || (!text.is_empty() && glob_match_bytes(pattern, &text[1..])),
        (Some(b'?'), Some(_)) => glob_match_bytes(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match_bytes(&pattern[1..], &text[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_wildcard_and_exact() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("startup", "startup"));
        assert!(!glob_match("startup", "shutdown"));
        assert!(glob_match("start*", "startup"));
        assert!(glob_match("st?rtup", "startup"));
    }

    fn write_modifier(dir: &Path, name: &str, body: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn shared_modifiers_load_unconditionally() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        write_modifier(
            &resolver.shared_modifiers_dir(),
            "a.modifier.yaml",
            "modifier_id: m1\ntarget_flow_id: startup\nphase: early\npriority: 10\naction: append\nstep: {id: s1, type: handler}\n",
        );
        let loader = FlowModifierLoader::new(resolver, KernelConfig::for_testing());
        let report = loader.load_all();
        assert!(report.errors.is_empty());
        assert!(loader.get("m1").is_some());
    }

    #[test]
    fn wildcard_target_rejected_without_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        write_modifier(
            &resolver.shared_modifiers_dir(),
            "a.modifier.yaml",
            "modifier_id: m1\ntarget_flow_id: \"*\"\nphase: early\npriority: 10\naction: append\nstep: {id: s1, type: handler}\n",
        );
        let loader = FlowModifierLoader::new(resolver, KernelConfig::for_testing());
        let report = loader.load_all();
        assert!(loader.get("m1").is_none());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].reason, "wildcard_modifier_not_allowed");
    }

    #[test]
    fn wildcard_target_allowed_via_env_flag() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        write_modifier(
            &resolver.shared_modifiers_dir(),
            "a.modifier.yaml",
            "modifier_id: m1\ntarget_flow_id: \"*\"\nphase: early\npriority: 10\naction: append\nstep: {id: s1, type: handler}\n",
        );
        let mut cfg = KernelConfig::for_testing();
        cfg.allow_wildcard_modifiers = true;
        let loader = FlowModifierLoader::new(resolver, cfg);
        let report = loader.load_all();
        assert!(report.errors.is_empty());
        assert!(loader.get("m1").is_some());
    }
}
