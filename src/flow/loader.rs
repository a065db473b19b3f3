//! FlowLoader — reads `*.flow.yaml` from the official `flows/` tree and the
//! ecosystem-wide `ecosystem/flows/` tree, normalizes and validates them,
//! and produces the deterministic step ordering every downstream consumer
//! relies on.
//!
//! Grounded on `core_runtime/flow_loader.py`. The legacy `flow/` directory
//! fallback from that source is deliberately not carried forward (see
//! `PathResolver::legacy_flow_dir`): its presence is a hard validation
//! error rather than a silent read.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::paths::PathResolver;

use super::definition::{FlowDefinition, FlowSource, FlowStep};

#[derive(Debug, Clone)]
pub struct FlowLoadError {
    pub file: PathBuf,
    pub errors: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FlowLoadReport {
    pub errors: Vec<FlowLoadError>,
    pub warnings: Vec<String>,
}

/// Holds the last successful load's results; reloading is always a full
/// replace, never an incremental merge.
pub struct FlowLoader {
    resolver: PathResolver,
    flows: RwLock<BTreeMap<String, FlowDefinition>>,
}

impl FlowLoader {
    pub fn new(resolver: PathResolver) -> Self {
        Self {
            resolver,
            flows: RwLock::new(BTreeMap::new()),
        }
    }

    /// Load every flow from both trees. Returns the accumulated load
    /// report (errors are per-file and non-fatal to the overall load,
    /// except the legacy-directory check which fails the whole call).
    pub fn load_all(&self) -> Result<FlowLoadReport> {
        if self.resolver.legacy_flow_dir().is_dir() {
            return Err(Error::Validation(format!(
                "legacy flow directory '{}' is no longer supported; move its contents to 'flows/'",
                self.resolver.legacy_flow_dir().display()
            )));
        }

        let mut loaded: BTreeMap<String, FlowDefinition> = BTreeMap::new();
        let mut report = FlowLoadReport::default();

        self.load_directory(&self.resolver.official_flows_dir(), FlowSource::Official, &mut loaded, &mut report);
        self.load_directory(&self.resolver.ecosystem_flows_dir(), FlowSource::Ecosystem, &mut loaded, &mut report);

        *self.flows.write() = loaded;
        Ok(report)
    }

    fn load_directory(&self, dir: &Path, source: FlowSource, loaded: &mut BTreeMap<String, FlowDefinition>, report: &mut FlowLoadReport) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.ends_with(".flow.yaml")))
            .collect();
        files.sort();

        for file in files {
            match load_flow_file(&file, source) {
                Ok((def, warnings)) => {
                    report.warnings.extend(warnings);
                    if let Some(existing) = loaded.get(&def.flow_id) {
                        if existing.source == Some(FlowSource::Official) && source == FlowSource::Ecosystem {
                            report.errors.push(FlowLoadError {
                                file: file.clone(),
                                errors: vec![format!("cannot override official flow '{}' from ecosystem", def.flow_id)],
                            });
                            continue;
                        }
                    }
                    loaded.insert(def.flow_id.clone(), def);
                }
                Err(errors) => report.errors.push(FlowLoadError { file, errors }),
            }
        }
    }

    pub fn get(&self, flow_id: &str) -> Option<FlowDefinition> {
        self.flows.read().get(flow_id).cloned()
    }

    pub fn all(&self) -> BTreeMap<String, FlowDefinition> {
        self.flows.read().clone()
    }
}

fn load_flow_file(path: &Path, source: FlowSource) -> std::result::Result<(FlowDefinition, Vec<String>), Vec<String>> {
    let raw = std::fs::read_to_string(path).map_err(|e| vec![format!("file read error: {e}")])?;
    let value: serde_json::Value = serde_yml::from_str(&raw).map_err(|e| vec![format!("YAML parse error: {e}")])?;

    let serde_json::Value::Object(map) = value else {
        return Err(vec!["flow file must be a YAML object".to_string()]);
    };

    let flow_id = map
        .get("flow_id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| vec!["missing or invalid 'flow_id'".to_string()])?
        .to_string();

    let inputs = match map.get("inputs") {
        Some(serde_json::Value::Object(o)) => o.clone(),
        None => serde_json::Map::new(),
        Some(_) => return Err(vec!["'inputs' must be an object".to_string()]),
    };
    let outputs = match map.get("outputs") {
        Some(serde_json::Value::Object(o)) => o.clone(),
        None => serde_json::Map::new(),
        Some(_) => return Err(vec!["'outputs' must be an object".to_string()]),
    };

    let phases: Vec<String> = match map.get("phases") {
        Some(serde_json::Value::Array(arr)) if !arr.is_empty() => {
            let mut out = Vec::with_capacity(arr.len());
            for (i, v) in arr.iter().enumerate() {
                match v.as_str() {
                    Some(s) => out.push(s.to_string()),
                    None => return Err(vec![format!("phases[{i}] must be a string")]),
                }
            }
            out
        }
        _ => return Err(vec!["'phases' must be a non-empty array".to_string()]),
    };

    let mut defaults = match map.get("defaults") {
        Some(serde_json::Value::Object(o)) => o.clone(),
        _ => serde_json::Map::new(),
    };
    defaults.entry("fail_soft".to_string()).or_insert(serde_json::Value::Bool(true));
    defaults
        .entry("on_missing_step".to_string())
        .or_insert(serde_json::Value::String("skip".to_string()));

    let raw_steps = match map.get("steps") {
        Some(serde_json::Value::Array(arr)) => arr.clone(),
        None => Vec::new(),
        Some(_) => return Err(vec!["'steps' must be an array".to_string()]),
    };

    let (mut steps, errors, warnings) = parse_steps(&raw_steps, &phases);
    if !errors.is_empty() {
        return Err(errors);
    }

    sort_steps(&mut steps, &phases);

    let def = FlowDefinition {
        flow_id,
        inputs,
        outputs,
        phases,
        defaults,
        steps,
        source_file: Some(path.to_path_buf()),
        source: Some(source),
        source_pack_id: None,
    };
    Ok((def, warnings))
}

fn parse_steps(raw_steps: &[serde_json::Value], phases: &[String]) -> (Vec<FlowStep>, Vec<String>, Vec<String>) {
    let mut steps = Vec::new();
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut seen_ids = std::collections::HashSet::new();

    for (i, raw) in raw_steps.iter().enumerate() {
        let serde_json::Value::Object(obj) = raw else {
            errors.push(format!("steps[{i}] must be an object"));
            continue;
        };

        let Some(id) = obj.get("id").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) else {
            errors.push(format!("steps[{i}]: missing or invalid 'id'"));
            continue;
        };
        if !seen_ids.insert(id.to_string()) {
            errors.push(format!("steps[{i}]: duplicate id '{id}'"));
            continue;
        }

        let Some(phase) = obj.get("phase").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) else {
            errors.push(format!("steps[{i}] ({id}): missing or invalid 'phase'"));
            continue;
        };
        if !phases.iter().any(|p| p == phase) {
            errors.push(format!("steps[{i}] ({id}): phase '{phase}' not in phases list"));
            continue;
        }

        let Some(step_type) = obj.get("type").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) else {
            errors.push(format!("steps[{i}] ({id}): missing or invalid 'type'"));
            continue;
        };

        let priority = match obj.get("priority") {
            Some(v) if v.is_i64() || v.is_u64() || v.is_f64() => v.as_i64().unwrap_or(v.as_f64().unwrap_or(100.0) as i64),
            Some(_) => {
                warnings.push(format!("steps[{i}] ({id}): invalid priority, using 100"));
                100
            }
            None => 100,
        };

        let when = match obj.get("when") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            None | Some(serde_json::Value::Null) => None,
            Some(_) => {
                warnings.push(format!("steps[{i}] ({id}): 'when' must be a string"));
                None
            }
        };

        let output = match obj.get("output") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            None | Some(serde_json::Value::Null) => None,
            Some(_) => {
                warnings.push(format!("steps[{i}] ({id}): 'output' must be a string"));
                None
            }
        };

        let depends_on = match obj.get("depends_on") {
            Some(serde_json::Value::Array(arr)) => arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
            _ => Vec::new(),
        };

        let principal_id = obj.get("principal_id").and_then(|v| v.as_str()).map(str::to_string);
        let owner_pack = obj.get("owner_pack").and_then(|v| v.as_str()).map(str::to_string);
        let file = obj.get("file").and_then(|v| v.as_str()).map(str::to_string);
        let timeout_seconds = obj.get("timeout_seconds").and_then(|v| v.as_f64()).unwrap_or(60.0);

        if step_type == "python_file_call" && file.is_none() {
            errors.push(format!("steps[{i}] ({id}): python_file_call requires 'file'"));
            continue;
        }

        steps.push(FlowStep {
            id: id.to_string(),
            phase: phase.to_string(),
            priority,
            step_type: step_type.to_string(),
            when,
            input: obj.get("input").cloned().unwrap_or(serde_json::Value::Null),
            output,
            depends_on,
            principal_id,
            owner_pack,
            file,
            timeout_seconds,
            raw: raw.clone(),
        });
    }

    (steps, errors, warnings)
}

/// Sort steps by `(phase_index, priority, id)`. Unknown phases (should not
/// occur after validation) sort last.
pub fn sort_steps(steps: &mut [FlowStep], phases: &[String]) {
    let phase_order: BTreeMap<&str, usize> = phases.iter().enumerate().map(|(i, p)| (p.as_str(), i)).collect();
    steps.sort_by(|a, b| {
        let pa = phase_order.get(a.phase.as_str()).copied().unwrap_or(usize::MAX);
        let pb = phase_order.get(b.phase.as_str()).copied().unwrap_or(usize::MAX);
        pa.cmp(&pb).then(a.priority.cmp(&b.priority)).then(a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_flow(dir: &Path, name: &str, body: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn loads_and_sorts_steps_deterministically() {
        let dir = tempfile::tempdir().unwrap();
        write_flow(
            &dir.path().join("flows"),
            "00_startup.flow.yaml",
            r#"
flow_id: startup
phases: [early, late]
steps:
  - {id: b, phase: late, priority: 10, type: handler}
  - {id: a, phase: early, priority: 50, type: handler}
  - {id: c, phase: early, priority: 10, type: handler}
"#,
        );
        let resolver = PathResolver::new(dir.path());
        let loader = FlowLoader::new(resolver);
        let report = loader.load_all().unwrap();
        assert!(report.errors.is_empty());
        let flow = loader.get("startup").unwrap();
        let ids: Vec<&str> = flow.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn ecosystem_cannot_override_official_flow_id() {
        let dir = tempfile::tempdir().unwrap();
        write_flow(&dir.path().join("flows"), "a.flow.yaml", "flow_id: shared\nphases: [p]\nsteps: []\n");
        write_flow(&dir.path().join("ecosystem/flows"), "b.flow.yaml", "flow_id: shared\nphases: [p]\nsteps: []\n");
        let resolver = PathResolver::new(dir.path());
        let loader = FlowLoader::new(resolver);
        let report = loader.load_all().unwrap();
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].errors[0].contains("cannot override official flow"));
    }

    #[test]
    fn duplicate_step_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_flow(
            &dir.path().join("flows"),
            "a.flow.yaml",
            "flow_id: f\nphases: [p]\nsteps:\n  - {id: x, phase: p, type: handler}\n  - {id: x, phase: p, type: handler}\n",
        );
        let resolver = PathResolver::new(dir.path());
        let loader = FlowLoader::new(resolver);
        let report = loader.load_all().unwrap();
        assert_eq!(report.errors.len(), 1);
        assert!(loader.get("f").is_none());
    }

    #[test]
    fn legacy_flow_dir_presence_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("flow")).unwrap();
        let resolver = PathResolver::new(dir.path());
        let loader = FlowLoader::new(resolver);
        let err = loader.load_all().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
