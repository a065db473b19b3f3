//! ComponentLifecycleExecutor — invokes each pack's `dependency ->
//! setup -> runtime_boot` scripts, one phase at a time, across every
//! installed pack's components, fail-soft.
//!
//! Grounded on `core_runtime/component_lifecycle.py::run_phase`: a
//! deterministic `(pack_id, type, id, version)` component order, a fixed
//! `{dependency_manager.py, setup.py, runtime_boot.py}` filename per phase
//! (skipped when absent, not an error), and a component whose phase script
//! raises is disabled for the remainder of the process (not the whole
//! pack) rather than aborting the run. Unlike the source, which `exec`s the
//! file in-process, phase scripts here run through the same sandboxed
//! execution path as a `python_file_call` flow step — this kernel never
//! imports pack code directly.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::install_journal::{InstallJournal, JournalEntry, JournalPaths};
use crate::registry::{Component, PackRegistry};

/// Lifecycle phases run in this fixed order; each maps to a well-known
/// filename under the component's directory.
pub const PHASES: [&str; 3] = ["dependency", "setup", "runtime_boot"];

fn phase_filename(phase: &str) -> &'static str {
    match phase {
        "dependency" => "dependency_manager.py",
        "setup" => "setup.py",
        _ => "runtime_boot.py",
    }
}

/// Runs one component's phase script, returning `Ok(())` on success
/// (including "script not found", which the caller checks for separately)
/// and `Err` if the script ran and failed. Injected so this module stays
/// decoupled from the sandbox's Docker specifics.
pub type ComponentPhaseRunner = Arc<dyn Fn(&Component, &str, &Path) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Outcome of a single `run_phase` call.
#[derive(Debug, Clone, Default)]
pub struct PhaseReport {
    pub phase: String,
    pub ran: Vec<String>,
    pub skipped: Vec<String>,
    pub newly_disabled: Vec<String>,
}

/// Executes lifecycle phase scripts across every component of every
/// registered pack, tracking components disabled at runtime by a phase
/// failure (this set does not persist across process restarts; it is not
/// the same as an operator's persistent `disabled_packs` configuration).
pub struct ComponentLifecycleExecutor {
    install_journal: Arc<InstallJournal>,
    disabled_runtime: std::sync::Mutex<HashSet<String>>,
}

impl ComponentLifecycleExecutor {
    pub fn new(install_journal: Arc<InstallJournal>) -> Self {
        Self { install_journal, disabled_runtime: std::sync::Mutex::new(HashSet::new()) }
    }

    pub fn is_disabled(&self, full_id: &str) -> bool {
        self.disabled_runtime.lock().unwrap_or_else(|p| p.into_inner()).contains(full_id)
    }

    /// Run `phase` (one of [`PHASES`]) for every non-disabled component in
    /// `registry`, in deterministic order, via `runner`.
    pub async fn run_phase(&self, phase: &str, registry: &PackRegistry, runner: &ComponentPhaseRunner) -> PhaseReport {
        let mut report = PhaseReport { phase: phase.to_string(), ..Default::default() };
        let filename = phase_filename(phase);

        let mut components: Vec<&Component> = registry.all().flat_map(|p| p.components.iter()).collect();
        components.sort_by(|a, b| (a.pack_id.as_str(), a.r#type.as_str(), a.id.as_str(), a.version.as_str()).cmp(&(b.pack_id.as_str(), b.r#type.as_str(), b.id.as_str(), b.version.as_str())));

        for component in components {
            let full_id = component.full_id();
            if self.is_disabled(&full_id) {
                report.skipped.push(full_id);
                continue;
            }

            let script = component.path.join(filename);
            if !script.is_file() {
                continue;
            }

            report.ran.push(full_id.clone());
            let outcome = runner(component, phase, &script).await;
            match outcome {
                Ok(()) => {
                    self.journal(phase, &full_id, &script, true, None);
                }
                Err(error) => {
                    self.disabled_runtime.lock().unwrap_or_else(|p| p.into_inner()).insert(full_id.clone());
                    report.newly_disabled.push(full_id.clone());
                    tracing::warn!(component = %full_id, phase = %phase, %error, "lifecycle phase failed; disabling component for this process");
                    self.journal(phase, &full_id, &script, false, Some(error.sanitize()));
                }
            }
        }

        report
    }

    fn journal(&self, phase: &str, full_id: &str, script: &Path, success: bool, error: Option<String>) {
        let entry = JournalEntry {
            ts: chrono_now(),
            event: format!("{phase}_run"),
            scope: "component".to_string(),
            reference: full_id.to_string(),
            result: if success { "success".to_string() } else { "failed".to_string() },
            paths: JournalPaths::default(),
            meta: serde_json::json!({"file": script.display().to_string()}),
            error: error.map(|m| serde_json::json!({"message": m})),
        };
        let _ = self.install_journal.append(&entry);
    }
}

fn chrono_now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::PathResolver;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry_with_component(dir: &Path, pack_id: &str, comp_type: &str, comp_id: &str, script_name: &str) -> PackRegistry {
        let resolver = PathResolver::new(dir);
        let pack_dir = resolver.pack_dir(pack_id);
        std::fs::create_dir_all(&pack_dir).unwrap();
        std::fs::write(
            pack_dir.join("ecosystem.json"),
            format!(r#"{{"pack_id": "{pack_id}", "pack_identity": "test:{pack_id}", "version": "1.0.0"}}"#),
        )
        .unwrap();

        let comp_dir = resolver.pack_components_dir(pack_id).join(format!("{comp_type}_{comp_id}"));
        std::fs::create_dir_all(&comp_dir).unwrap();
        std::fs::write(comp_dir.join(script_name), "").unwrap();
        std::fs::write(
            comp_dir.join("manifest.json"),
            format!(r#"{{"type": "{comp_type}", "id": "{comp_id}", "version": "1.0.0"}}"#),
        )
        .unwrap();

        let mut registry = PackRegistry::new();
        registry.scan(&resolver).unwrap();
        registry
    }

    #[tokio::test]
    async fn runs_present_script_and_skips_absent_one() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_component(dir.path(), "p1", "tool", "x", "setup.py");
        let resolver = PathResolver::new(dir.path());
        let journal = Arc::new(InstallJournal::new(resolver));
        let executor = ComponentLifecycleExecutor::new(journal);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let runner: ComponentPhaseRunner = Arc::new(move |_c, _phase, _script| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        });

        let report = executor.run_phase("setup", &registry, &runner).await;
        assert_eq!(report.ran.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let report2 = executor.run_phase("dependency", &registry, &runner).await;
        assert!(report2.ran.is_empty());
    }

    #[tokio::test]
    async fn failing_phase_disables_component_for_later_phases() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_component(dir.path(), "p1", "tool", "x", "setup.py");
        std::fs::write(
            PathResolver::new(dir.path()).pack_components_dir("p1").join("tool_x").join("runtime_boot.py"),
            "",
        )
        .unwrap();
        let resolver = PathResolver::new(dir.path());
        let journal = Arc::new(InstallJournal::new(resolver));
        let executor = ComponentLifecycleExecutor::new(journal);

        let runner: ComponentPhaseRunner = Arc::new(|_c, _phase, _script| Box::pin(async { Err(crate::error::Error::Internal("boom".to_string())) }));
        let report = executor.run_phase("setup", &registry, &runner).await;
        assert_eq!(report.newly_disabled.len(), 1);

        let report2 = executor.run_phase("runtime_boot", &registry, &runner).await;
        assert_eq!(report2.skipped.len(), 1);
        assert!(report2.ran.is_empty());
    }
}
