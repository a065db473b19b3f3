//! FlowModifierDef and the small supporting types shared by the modifier
//! loader and applier.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifierAction {
    InjectBefore,
    InjectAfter,
    Append,
    Replace,
    Remove,
}

impl ModifierAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ModifierAction::InjectBefore => "inject_before",
            ModifierAction::InjectAfter => "inject_after",
            ModifierAction::Append => "append",
            ModifierAction::Replace => "replace",
            ModifierAction::Remove => "remove",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "inject_before" => Some(ModifierAction::InjectBefore),
            "inject_after" => Some(ModifierAction::InjectAfter),
            "append" => Some(ModifierAction::Append),
            "replace" => Some(ModifierAction::Replace),
            "remove" => Some(ModifierAction::Remove),
            _ => None,
        }
    }

    pub(super) fn parse(s: &str) -> Result<Self, String> {
        Self::from_str(s).ok_or_else(|| format!("invalid 'action': must be one of inject_before, inject_after, append, replace, remove (got '{s}')"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModifierRequires {
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// A single declarative flow transform, as loaded from a `*.modifier.yaml`
/// file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowModifierDef {
    pub modifier_id: String,
    pub target_flow_id: String,
    pub phase: String,
    pub priority: i64,
    pub action: ModifierAction,
    #[serde(default)]
    pub target_step_id: Option<String>,
    #[serde(default)]
    pub step: Option<serde_json::Value>,
    #[serde(default)]
    pub requires: ModifierRequires,
    #[serde(default)]
    pub conflicts_with: Vec<String>,
    #[serde(default)]
    pub compatible_with: Vec<String>,
    #[serde(skip)]
    pub source_file: Option<PathBuf>,
    #[serde(default)]
    pub source_pack_id: Option<String>,
}

impl FlowModifierDef {
    pub fn step_id_hint(&self) -> &str {
        self.step
            .as_ref()
            .and_then(|s| s.get("id"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone)]
pub struct ModifierApplyResult {
    pub success: bool,
    pub modifier_id: String,
    pub action: ModifierAction,
    pub target_flow_id: String,
    pub target_step_id: Option<String>,
    pub skipped_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModifierSkipRecord {
    pub file: PathBuf,
    pub pack_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictSeverity {
    Severe,
    Declared,
    Compatibility,
    Info,
}

#[derive(Debug, Clone)]
pub struct ModifierConflict {
    pub target_step_id: String,
    pub modifier_ids: Vec<String>,
    pub severity: ConflictSeverity,
}
