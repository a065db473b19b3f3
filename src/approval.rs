//! ApprovalManager — the pack lifecycle state machine.
//!
//! Grounded on `core_runtime/approval_manager.py`: packs start `Installed`
//! once scanned, become `Pending` when they first request permissions,
//! `Approved` once an operator captures their file-hash manifest,
//! `Modified` the instant any hash diverges, or `Blocked` on rejection.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::paths::PathResolver;
use crate::signer::HmacSigner;

/// Pack lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApprovalState {
    Installed,
    Pending,
    Approved,
    Running,
    Modified,
    Blocked,
    Error,
}

/// Persisted approval record for a single pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackApproval {
    pub pack_id: String,
    pub state: ApprovalState,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub approved_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub file_hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub permissions_requested: Vec<String>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

impl PackApproval {
    fn new(pack_id: &str) -> Self {
        Self {
            pack_id: pack_id.to_string(),
            state: ApprovalState::Installed,
            created_at: chrono::Utc::now(),
            approved_at: None,
            file_hashes: BTreeMap::new(),
            permissions_requested: Vec::new(),
            rejection_reason: None,
        }
    }
}

/// Manages pack lifecycle transitions and signed persistence of approval
/// records under `<permissions_dir>/<pack_id>.grants.json`.
pub struct ApprovalManager {
    resolver: PathResolver,
    signer: HmacSigner,
    records: parking_lot::RwLock<BTreeMap<String, PackApproval>>,
}

const EXCLUDED_DIR_NAMES: &[&str] = &["__pycache__", ".git"];

impl ApprovalManager {
    pub fn new(resolver: PathResolver, signer: HmacSigner) -> Self {
        Self {
            resolver,
            signer,
            records: parking_lot::RwLock::new(BTreeMap::new()),
        }
    }

    fn record_path(&self, pack_id: &str) -> PathBuf {
        self.resolver.permissions_dir().join(format!("{pack_id}.grants.json"))
    }

    /// Discover packs under the ecosystem root; newly seen packs enter
    /// `Installed` and persist an empty record. Already-known packs are
    /// untouched.
    pub fn scan(&self) -> Result<Vec<String>> {
        let ids = self.resolver.discover_pack_ids();
        let mut records = self.records.write();
        for pack_id in &ids {
            if records.contains_key(pack_id) {
                continue;
            }
            let loaded = self.load_record(pack_id);
            let record = match loaded {
                Ok(Some(r)) => r,
                Ok(None) => PackApproval::new(pack_id),
                Err(_) => {
                    // Signature verification failed: conservative MODIFIED.
                    let mut r = PackApproval::new(pack_id);
                    r.state = ApprovalState::Modified;
                    r
                }
            };
            self.persist(&record)?;
            records.insert(pack_id.clone(), record);
        }
        Ok(ids)
    }

    fn load_record(&self, pack_id: &str) -> Result<Option<PackApproval>> {
        let path = self.record_path(pack_id);
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return Ok(None);
        };
        let envelope: serde_json::Value = serde_json::from_str(&raw)?;
        let unsealed = self.signer.unseal(envelope)?;
        let record: PackApproval = serde_json::from_value(unsealed)?;
        Ok(Some(record))
    }

    fn persist(&self, record: &PackApproval) -> Result<()> {
        std::fs::create_dir_all(self.resolver.permissions_dir())?;
        let value = serde_json::to_value(record)?;
        let sealed = self.signer.seal(value)?;
        std::fs::write(self.record_path(&record.pack_id), serde_json::to_string_pretty(&sealed)?)?;
        Ok(())
    }

    /// Recompute all file hashes, transition to `Approved`, and persist a
    /// signed record.
    pub fn approve(&self, pack_id: &str) -> Result<()> {
        let root = self.resolver.pack_effective_root(pack_id);
        let file_hashes = hash_tree(&root)?;

        let mut records = self.records.write();
        let record = records.entry(pack_id.to_string()).or_insert_with(|| PackApproval::new(pack_id));
        record.state = ApprovalState::Approved;
        record.approved_at = Some(chrono::Utc::now());
        record.file_hashes = file_hashes;
        record.rejection_reason = None;
        self.persist(record)?;
        Ok(())
    }

    /// Transition a pack to `Blocked` with a recorded reason.
    pub fn reject(&self, pack_id: &str, reason: impl Into<String>) -> Result<()> {
        let mut records = self.records.write();
        let record = records.entry(pack_id.to_string()).or_insert_with(|| PackApproval::new(pack_id));
        record.state = ApprovalState::Blocked;
        record.rejection_reason = Some(reason.into());
        self.persist(record)?;
        Ok(())
    }

    /// Idempotently transition a pack to `Modified`. Safe to call from any
    /// hash-mismatch observer.
    pub fn mark_modified(&self, pack_id: &str) -> Result<()> {
        let mut records = self.records.write();
        let record = records.entry(pack_id.to_string()).or_insert_with(|| PackApproval::new(pack_id));
        if record.state != ApprovalState::Modified {
            record.state = ApprovalState::Modified;
            self.persist(record)?;
        }
        Ok(())
    }

    /// Recompute hashes and compare to the stored manifest. Any divergence
    /// (new, missing, or changed file) returns `false`.
    pub fn verify_hash(&self, pack_id: &str) -> Result<bool> {
        let records = self.records.read();
        let Some(record) = records.get(pack_id) else {
            return Ok(false);
        };
        let root = self.resolver.pack_effective_root(pack_id);
        let current = hash_tree(&root)?;
        Ok(current == record.file_hashes)
    }

    pub fn state(&self, pack_id: &str) -> Option<ApprovalState> {
        self.records.read().get(pack_id).map(|r| r.state)
    }

    pub fn is_approved(&self, pack_id: &str) -> bool {
        matches!(self.state(pack_id), Some(ApprovalState::Approved) | Some(ApprovalState::Running))
    }
}

/// SHA-256 every file under `root`, streamed in 8 KiB chunks, keyed by
/// forward-slash-normalized relative path.
fn hash_tree(root: &Path) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    if !root.is_dir() {
        return Ok(out);
    }
    for entry in walkdir::WalkDir::new(root).into_iter().filter_entry(|e| {
        let name = e.file_name().to_string_lossy();
        !EXCLUDED_DIR_NAMES.contains(&name.as_ref())
    }) {
        let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().map(|e| e == "pyc").unwrap_or(false) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::Internal(e.to_string()))?
            .to_string_lossy()
            .replace('\\', "/");
        let hash = hash_file(entry.path())?;
        out.insert(rel, hash);
    }
    Ok(out)
}

fn hash_file(path: &Path) -> Result<String> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(dir: &std::path::Path) -> ApprovalManager {
        let resolver = PathResolver::new(dir);
        let signer = HmacSigner::from_key(b"test-key-that-is-at-least-32-bytes!".to_vec());
        ApprovalManager::new(resolver, signer)
    }

    fn write_pack(dir: &std::path::Path, pack_id: &str) {
        let pack_dir = dir.join("ecosystem").join(pack_id);
        std::fs::create_dir_all(&pack_dir).unwrap();
        std::fs::write(
            pack_dir.join("ecosystem.json"),
            serde_json::json!({"pack_id": pack_id, "pack_identity": "test:p1", "version": "1"}).to_string(),
        )
        .unwrap();
    }

    #[test]
    fn scan_registers_installed_packs() {
        let dir = tempfile::tempdir().unwrap();
        write_pack(dir.path(), "p1");
        let mgr = setup(dir.path());

        let ids = mgr.scan().unwrap();
        assert_eq!(ids, vec!["p1".to_string()]);
        assert_eq!(mgr.state("p1"), Some(ApprovalState::Installed));
    }

    #[test]
    fn approve_then_modify_scenario() {
        let dir = tempfile::tempdir().unwrap();
        write_pack(dir.path(), "p1");
        let mgr = setup(dir.path());
        mgr.scan().unwrap();
        mgr.approve("p1").unwrap();
        assert_eq!(mgr.state("p1"), Some(ApprovalState::Approved));
        assert!(mgr.verify_hash("p1").unwrap());

        // Touch a file inside the pack.
        std::fs::write(dir.path().join("ecosystem/p1/ecosystem.json"), "{\"pack_id\":\"p1\",\"pack_identity\":\"test:p1\",\"version\":\"2\"}").unwrap();

        assert!(!mgr.verify_hash("p1").unwrap());
    }

    #[test]
    fn reject_sets_blocked_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        write_pack(dir.path(), "p1");
        let mgr = setup(dir.path());
        mgr.scan().unwrap();
        mgr.reject("p1", "suspicious code").unwrap();
        assert_eq!(mgr.state("p1"), Some(ApprovalState::Blocked));
    }

    #[test]
    fn mark_modified_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_pack(dir.path(), "p1");
        let mgr = setup(dir.path());
        mgr.scan().unwrap();
        mgr.mark_modified("p1").unwrap();
        mgr.mark_modified("p1").unwrap();
        assert_eq!(mgr.state("p1"), Some(ApprovalState::Modified));
    }

    #[test]
    fn tampered_signature_forces_modified_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        write_pack(dir.path(), "p1");
        {
            let mgr = setup(dir.path());
            mgr.scan().unwrap();
            mgr.approve("p1").unwrap();
        }
        // Corrupt the persisted grant file.
        let path = dir.path().join("user_data/permissions/p1.grants.json");
        let mut value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        value["state"] = serde_json::Value::String("APPROVED".to_string());
        value["_hmac_signature"] = serde_json::Value::String("0".repeat(64));
        std::fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();

        let mgr2 = setup(dir.path());
        // Force reload by constructing a fresh manager and scanning again;
        // scan() only loads unseen packs so start from an empty state.
        let ids = mgr2.scan().unwrap();
        assert_eq!(ids, vec!["p1".to_string()]);
        assert_eq!(mgr2.state("p1"), Some(ApprovalState::Modified));
    }
}
