//! Approval-gated installers for auxiliary, non-flow artifacts a pack may
//! bring: pip-managed Python dependencies, `lib/install.py` /
//! `lib/update.py` setup scripts, and capability grant requests. Each
//! writes its side effects through [`InstallJournal`] the same way
//! [`crate::pack_applier::PackApplier`] does for pack applies.
//!
//! Grounded on `core_runtime/lib_executor.py` (`LibExecutor`) and
//! `core_runtime/api/{,lifecycle/}pip_handlers.py` (`PipInstaller`'s
//! scan/list/approve/reject/block surface, including the index-url
//! allowlist the lifecycle-scoped handler adds on top of the looser
//! original).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::approval::ApprovalManager;
use crate::error::{Error, Result};
use crate::grants::capability::CapabilityGrantManager;
use crate::grants::{read_signed_json, write_signed_json};
use crate::install_journal::{InstallJournal, JournalEntry, JournalPaths};
use crate::paths::PathResolver;
use crate::sandbox::ExecutionOutput;
use crate::signer::HmacSigner;

fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

fn journal_entry(event: &str, scope: &str, reference: &str, success: bool, meta: Value, error: Option<String>) -> JournalEntry {
    JournalEntry {
        ts: now(),
        event: event.to_string(),
        scope: scope.to_string(),
        reference: reference.to_string(),
        result: if success { "success".to_string() } else { "failed".to_string() },
        paths: JournalPaths::default(),
        meta,
        error: error.map(|m| serde_json::json!({"message": m})),
    }
}

// ---------------------------------------------------------------------
// LibExecutor
// ---------------------------------------------------------------------

/// Runs one `install.py`/`update.py` lib script through the kernel's
/// sandboxed execution path. Decoupled from `SecureExecutor`/
/// `DockerRunBuilder` the same way [`crate::lifecycle::ComponentPhaseRunner`]
/// is, since a lib script is itself untrusted pack-supplied Python.
pub type LibScriptRunner = Arc<dyn Fn(&str, &str, &Path, &Value) -> BoxFuture<'static, Result<ExecutionOutput>> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct LibExecutionRecord {
    pack_id: String,
    lib_type: String,
    executed_at: chrono::DateTime<chrono::Utc>,
    file_hash: String,
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Outcome of [`LibExecutor::check_pack`].
#[derive(Debug, Clone, Default)]
pub struct LibCheckResult {
    pub needs_install: bool,
    pub needs_update: bool,
    pub install_file: Option<PathBuf>,
    pub update_file: Option<PathBuf>,
    pub reason: String,
}

/// Outcome of [`LibExecutor::execute_lib`].
#[derive(Debug, Clone)]
pub struct LibExecutionResult {
    pub pack_id: String,
    pub lib_type: String,
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub error_type: Option<String>,
}

/// The pseudo-pack id for the operator's own local, unsandboxed pack.
/// Mirrors the source's `LOCAL_PACK_ID`: lib execution is never offered to
/// it, since it isn't installed through the staging/apply path lib
/// hygiene assumes.
pub const LOCAL_PACK_ID: &str = "local_pack";

const INSTALL_FILE: &str = "install.py";
const UPDATE_FILE: &str = "update.py";

pub struct LibExecutor {
    resolver: PathResolver,
    approval: Arc<ApprovalManager>,
    journal: Arc<InstallJournal>,
    records_path: PathBuf,
    records: parking_lot::RwLock<BTreeMap<String, LibExecutionRecord>>,
}

impl LibExecutor {
    pub fn new(resolver: PathResolver, approval: Arc<ApprovalManager>, journal: Arc<InstallJournal>) -> Self {
        let records_path = resolver.user_data_dir().join("settings").join("lib_execution_records.json");
        let records = load_records(&records_path).unwrap_or_default();
        Self { resolver, approval, journal, records_path, records: parking_lot::RwLock::new(records) }
    }

    fn lib_dir(&self, pack_id: &str) -> PathBuf {
        self.resolver.pack_lib_dir(pack_id)
    }

    /// Determine whether `pack_id`'s lib scripts need to run, comparing the
    /// current `install.py` hash against the last recorded one.
    pub fn check_pack(&self, pack_id: &str) -> LibCheckResult {
        let mut result = LibCheckResult::default();

        if pack_id == LOCAL_PACK_ID {
            result.reason = "local_pack does not support lib execution".to_string();
            return result;
        }

        let lib_dir = self.lib_dir(pack_id);
        let install_file = lib_dir.join(INSTALL_FILE);
        let update_file = lib_dir.join(UPDATE_FILE);
        if install_file.is_file() {
            result.install_file = Some(install_file.clone());
        }
        if update_file.is_file() {
            result.update_file = Some(update_file.clone());
        }
        if result.install_file.is_none() && result.update_file.is_none() {
            result.reason = "no install.py or update.py found".to_string();
            return result;
        }

        let existing = self.records.read().get(pack_id).cloned();
        let Some(existing) = existing else {
            if result.install_file.is_some() {
                result.needs_install = true;
                result.reason = "first time installation".to_string();
            }
            return result;
        };

        if let Some(install_file) = &result.install_file {
            let current_hash = file_sha256(install_file).unwrap_or_default();
            if current_hash != existing.file_hash {
                if result.update_file.is_some() {
                    result.needs_update = true;
                    result.reason = "file hash changed, update needed".to_string();
                } else {
                    result.needs_install = true;
                    result.reason = "file hash changed, re-install needed".to_string();
                }
            }
        }
        if !result.needs_install && !result.needs_update {
            result.reason = "no changes detected".to_string();
        }
        result
    }

    /// Run `lib_file` (an `install.py` or `update.py`) for `pack_id` via
    /// `runner`, gated on the pack being approved and unmodified.
    pub async fn execute_lib(&self, pack_id: &str, lib_file: &Path, lib_type: &str, context: &Value, runner: &LibScriptRunner) -> LibExecutionResult {
        if pack_id == LOCAL_PACK_ID {
            let result = LibExecutionResult {
                pack_id: pack_id.to_string(),
                lib_type: lib_type.to_string(),
                success: false,
                output: None,
                error: Some("local_pack does not support lib execution".to_string()),
                error_type: Some("local_pack_skip".to_string()),
            };
            self.record_and_journal(&result, "");
            return result;
        }

        if !lib_file.is_file() {
            let result = LibExecutionResult {
                pack_id: pack_id.to_string(),
                lib_type: lib_type.to_string(),
                success: false,
                output: None,
                error: Some(format!("file not found: {}", lib_file.display())),
                error_type: Some("file_not_found".to_string()),
            };
            self.record_and_journal(&result, "");
            return result;
        }

        let approved = self.approval.is_approved(pack_id) && self.approval.verify_hash(pack_id).unwrap_or(false);
        if !approved {
            let result = LibExecutionResult {
                pack_id: pack_id.to_string(),
                lib_type: lib_type.to_string(),
                success: false,
                output: None,
                error: Some("pack not approved or modified since approval".to_string()),
                error_type: Some("not_approved".to_string()),
            };
            self.record_and_journal(&result, "");
            return result;
        }

        let outcome = runner(pack_id, lib_type, lib_file, context).await;
        let file_hash = file_sha256(lib_file).unwrap_or_default();
        let result = match outcome {
            Ok(output) => LibExecutionResult {
                pack_id: pack_id.to_string(),
                lib_type: lib_type.to_string(),
                success: output.exit_code == Some(0),
                output: Some(output.stdout),
                error: if output.exit_code == Some(0) { None } else { Some(output.stderr) },
                error_type: if output.exit_code == Some(0) { None } else { Some("nonzero_exit".to_string()) },
            },
            Err(error) => LibExecutionResult {
                pack_id: pack_id.to_string(),
                lib_type: lib_type.to_string(),
                success: false,
                output: None,
                error: Some(error.sanitize()),
                error_type: Some(error.kind().to_string()),
            },
        };
        self.record_and_journal(&result, &file_hash);
        result
    }

    fn record_and_journal(&self, result: &LibExecutionResult, file_hash: &str) {
        {
            let mut records = self.records.write();
            records.insert(
                result.pack_id.clone(),
                LibExecutionRecord {
                    pack_id: result.pack_id.clone(),
                    lib_type: result.lib_type.clone(),
                    executed_at: now(),
                    file_hash: file_hash.to_string(),
                    success: result.success,
                    error: result.error.clone(),
                },
            );
            let _ = save_records(&self.records_path, &records);
        }
        let entry = journal_entry(
            &format!("lib_{}", result.lib_type),
            "pack",
            &result.pack_id,
            result.success,
            serde_json::json!({"lib_type": result.lib_type}),
            result.error.clone(),
        );
        let _ = self.journal.append(&entry);
    }
}

fn load_records(path: &Path) -> Option<BTreeMap<String, LibExecutionRecord>> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn save_records(path: &Path, records: &BTreeMap<String, LibExecutionRecord>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(records)?)?;
    Ok(())
}

fn file_sha256(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------
// PipInstaller
// ---------------------------------------------------------------------

/// Index URLs a pack's pip candidate may install from. Anything else is
/// rejected outright, mirroring the lifecycle-scoped handler's tighter
/// allowlist (the unscoped original accepted whatever the caller passed).
const ALLOWED_INDEX_URLS: &[&str] = &["https://pypi.org/simple"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipCandidateStatus {
    Pending,
    Approved,
    Rejected,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipCandidate {
    pub key: String,
    pub pack_id: String,
    pub package: String,
    pub version_spec: String,
    pub status: PipCandidateStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipScanResult {
    pub scanned_count: usize,
    pub pending_created: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Scans each pack's `lib/requirements.txt` for pip dependencies, recording
/// each as a pending candidate awaiting operator approval. Approval and
/// actual installation are two different, explicit steps; nothing a pack
/// declares here is ever installed unattended.
pub struct PipInstaller {
    resolver: PathResolver,
    signer: HmacSigner,
    journal: Arc<InstallJournal>,
    state_path: PathBuf,
}

impl PipInstaller {
    pub fn new(resolver: PathResolver, signer: HmacSigner, journal: Arc<InstallJournal>) -> Self {
        let state_path = resolver.user_data_dir().join("settings").join("pip_candidates.json");
        Self { resolver, signer, journal, state_path }
    }

    fn load(&self) -> BTreeMap<String, PipCandidate> {
        match read_signed_json(&self.state_path, &self.signer) {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_default(),
            _ => BTreeMap::new(),
        }
    }

    fn save(&self, candidates: &BTreeMap<String, PipCandidate>) -> Result<()> {
        write_signed_json(&self.state_path, serde_json::to_value(candidates)?, &self.signer)
    }

    /// Walk every discovered pack's `lib/requirements.txt`, registering a
    /// `Pending` candidate for each `package==version` line not already
    /// known. Already-known candidates (in any status) are left untouched.
    pub fn scan_candidates(&self) -> Result<PipScanResult> {
        let mut candidates = self.load();
        let mut scanned = 0usize;
        let mut created = 0usize;

        for pack_id in self.resolver.discover_pack_ids() {
            let requirements = self.resolver.pack_lib_dir(&pack_id).join("requirements.txt");
            let Ok(raw) = std::fs::read_to_string(&requirements) else { continue };
            for line in raw.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                scanned += 1;
                let (package, version_spec) = match line.split_once("==") {
                    Some((p, v)) => (p.trim().to_string(), v.trim().to_string()),
                    None => (line.to_string(), String::new()),
                };
                let key = format!("{pack_id}:{package}=={version_spec}");
                candidates.entry(key.clone()).or_insert_with(|| {
                    created += 1;
                    PipCandidate { key, pack_id: pack_id.clone(), package, version_spec, status: PipCandidateStatus::Pending, reason: None }
                });
            }
        }

        self.save(&candidates)?;
        Ok(PipScanResult { scanned_count: scanned, pending_created: created })
    }

    pub fn list_items(&self, status_filter: Option<PipCandidateStatus>) -> Vec<PipCandidate> {
        self.load().into_values().filter(|c| status_filter.map(|s| c.status == s).unwrap_or(true)).collect()
    }

    pub fn list_blocked(&self) -> Vec<PipCandidate> {
        self.list_items(Some(PipCandidateStatus::Blocked))
    }

    /// Approve `candidate_key` for install, rejecting any `index_url` not
    /// on [`ALLOWED_INDEX_URLS`]. Does not itself invoke `pip`; marking a
    /// candidate `Approved` here is the gate a separate install step
    /// checks before running.
    pub fn approve_and_install(&self, candidate_key: &str, actor: &str, index_url: &str) -> Result<PipActionResult> {
        if !ALLOWED_INDEX_URLS.contains(&index_url) {
            return Ok(PipActionResult { success: false, error: Some(format!("index_url is not in the allowed list: {index_url}")) });
        }
        let mut candidates = self.load();
        let Some(candidate) = candidates.get_mut(candidate_key) else {
            return Ok(PipActionResult { success: false, error: Some(format!("unknown candidate: {candidate_key}")) });
        };
        candidate.status = PipCandidateStatus::Approved;
        candidate.reason = None;
        self.save(&candidates)?;

        let entry = journal_entry("pip_approve", "pip_candidate", candidate_key, true, serde_json::json!({"actor": actor, "index_url": index_url}), None);
        let _ = self.journal.append(&entry);
        Ok(PipActionResult { success: true, error: None })
    }

    pub fn reject(&self, candidate_key: &str, actor: &str, reason: &str) -> Result<PipActionResult> {
        self.transition(candidate_key, PipCandidateStatus::Rejected, "pip_reject", actor, reason)
    }

    pub fn unblock(&self, candidate_key: &str, actor: &str, reason: &str) -> Result<PipActionResult> {
        self.transition(candidate_key, PipCandidateStatus::Pending, "pip_unblock", actor, reason)
    }

    fn transition(&self, candidate_key: &str, status: PipCandidateStatus, event: &str, actor: &str, reason: &str) -> Result<PipActionResult> {
        let mut candidates = self.load();
        let Some(candidate) = candidates.get_mut(candidate_key) else {
            return Ok(PipActionResult { success: false, error: Some(format!("unknown candidate: {candidate_key}")) });
        };
        candidate.status = status;
        candidate.reason = if reason.is_empty() { None } else { Some(reason.to_string()) };
        self.save(&candidates)?;

        let entry = journal_entry(event, "pip_candidate", candidate_key, true, serde_json::json!({"actor": actor, "reason": reason}), None);
        let _ = self.journal.append(&entry);
        Ok(PipActionResult { success: true, error: None })
    }
}

// ---------------------------------------------------------------------
// CapabilityInstaller
// ---------------------------------------------------------------------

/// Issues a capability grant after checking the pack requesting it is
/// approved. A thin, journaled wrapper around
/// [`CapabilityGrantManager::grant`] so capability installs leave the same
/// audit trail as pip/lib installs.
pub struct CapabilityInstaller {
    approval: Arc<ApprovalManager>,
    capability_grants: Arc<CapabilityGrantManager>,
    journal: Arc<InstallJournal>,
}

impl CapabilityInstaller {
    pub fn new(approval: Arc<ApprovalManager>, capability_grants: Arc<CapabilityGrantManager>, journal: Arc<InstallJournal>) -> Self {
        Self { approval, capability_grants, journal }
    }

    pub fn install(&self, pack_id: &str, permission_id: &str, config: Value, actor: &str) -> Result<PipActionResult> {
        if !self.approval.is_approved(pack_id) {
            return Ok(PipActionResult { success: false, error: Some(format!("pack '{pack_id}' is not approved")) });
        }

        self.capability_grants.grant(pack_id, permission_id, config, actor)?;
        let entry = journal_entry(
            "capability_install",
            "pack",
            pack_id,
            true,
            serde_json::json!({"permission_id": permission_id, "actor": actor}),
            None,
        );
        let _ = self.journal.append(&entry);
        Ok(PipActionResult { success: true, error: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn journal(dir: &Path) -> Arc<InstallJournal> {
        Arc::new(InstallJournal::new(PathResolver::new(dir)))
    }

    fn signer() -> HmacSigner {
        HmacSigner::from_key(b"test-key-that-is-at-least-32-bytes!".to_vec())
    }

    #[test]
    fn lib_check_reports_first_install_needed() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        std::fs::create_dir_all(resolver.pack_lib_dir("p1")).unwrap();
        std::fs::write(resolver.pack_lib_dir("p1").join("install.py"), "print('hi')").unwrap();

        let approval = Arc::new(ApprovalManager::new(resolver.clone(), signer()));
        let executor = LibExecutor::new(resolver, approval, journal(dir.path()));

        let check = executor.check_pack("p1");
        assert!(check.needs_install);
        assert!(check.install_file.is_some());
    }

    #[test]
    fn local_pack_never_needs_lib_execution() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        let approval = Arc::new(ApprovalManager::new(resolver.clone(), signer()));
        let executor = LibExecutor::new(resolver, approval, journal(dir.path()));
        let check = executor.check_pack(LOCAL_PACK_ID);
        assert!(!check.needs_install);
        assert_eq!(check.reason, "local_pack does not support lib execution");
    }

    #[tokio::test]
    async fn execute_lib_rejects_unapproved_pack() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        std::fs::create_dir_all(resolver.pack_lib_dir("p1")).unwrap();
        let install_file = resolver.pack_lib_dir("p1").join("install.py");
        std::fs::write(&install_file, "").unwrap();

        let approval = Arc::new(ApprovalManager::new(resolver.clone(), signer()));
        let executor = LibExecutor::new(resolver, approval, journal(dir.path()));
        let runner: LibScriptRunner = Arc::new(|_p, _t, _f, _c| Box::pin(async { Ok(ExecutionOutput { stdout: String::new(), stderr: String::new(), exit_code: Some(0) }) }));

        let result = executor.execute_lib("p1", &install_file, "install", &Value::Null, &runner).await;
        assert!(!result.success);
        assert_eq!(result.error_type.as_deref(), Some("not_approved"));
    }

    #[test]
    fn pip_scan_and_approve_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        std::fs::create_dir_all(resolver.pack_lib_dir("p1")).unwrap();
        std::fs::write(resolver.pack_lib_dir("p1").join("requirements.txt"), "requests==2.31.0\n").unwrap();

        let installer = PipInstaller::new(resolver, signer(), journal(dir.path()));
        let scan = installer.scan_candidates().unwrap();
        assert_eq!(scan.scanned_count, 1);
        assert_eq!(scan.pending_created, 1);

        let key = "p1:requests==2.31.0".to_string();
        let rejected = installer.approve_and_install(&key, "tester", "https://evil.example.com/simple").unwrap();
        assert!(!rejected.success);

        let approved = installer.approve_and_install(&key, "tester", "https://pypi.org/simple").unwrap();
        assert!(approved.success);

        let items = installer.list_items(Some(PipCandidateStatus::Approved));
        assert_eq!(items.len(), 1);
    }
}
