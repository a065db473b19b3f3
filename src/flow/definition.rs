//! Normalized flow step/definition types, shared by the loader, modifier
//! applier, and executor.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where a flow definition was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowSource {
    Official,
    Ecosystem,
}

/// One step in a flow's normalized step list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStep {
    pub id: String,
    pub phase: String,
    pub priority: i64,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub principal_id: Option<String>,
    #[serde(default)]
    pub owner_pack: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: f64,
    /// The raw YAML-derived value, retained for handlers that need fields
    /// this normalized view does not surface.
    #[serde(default)]
    pub raw: serde_json::Value,
}

fn default_timeout() -> f64 {
    60.0
}

/// A fully loaded, validated flow. Steps are always stored in the
/// deterministic `(phase_index, priority, id)` order established by
/// [`crate::flow::loader::sort_steps`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub flow_id: String,
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub outputs: serde_json::Map<String, serde_json::Value>,
    pub phases: Vec<String>,
    #[serde(default)]
    pub defaults: serde_json::Map<String, serde_json::Value>,
    pub steps: Vec<FlowStep>,
    #[serde(skip)]
    pub source_file: Option<PathBuf>,
    #[serde(skip)]
    pub source: Option<FlowSource>,
    #[serde(default)]
    pub source_pack_id: Option<String>,
}

impl FlowDefinition {
    pub fn step(&self, id: &str) -> Option<&FlowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn phase_index(&self, phase: &str) -> Option<usize> {
        self.phases.iter().position(|p| p == phase)
    }
}
