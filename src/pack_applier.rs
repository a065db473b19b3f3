//! PackApplier — moves a pack out of staging into the ecosystem tree.
//!
//! Grounded on `core_runtime/pack_applier.py`: a staged payload is copied
//! from `<staging>/<staging_id>/payload/<top-dir>` to
//! `<ecosystem>/<pack_id>`, timestamp-backing up whatever was there first.
//! A pack that already exists under that id is only overwritten if its
//! `ecosystem.json` `pack_id` agrees with the incoming payload's — this is
//! the identity-hijack guard: a malicious pack cannot claim another pack's
//! directory by reusing its id. Multi-pack staging applies each detected
//! pack independently; one pack's failure does not roll back packs already
//! applied earlier in the same call.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::approval::ApprovalManager;
use crate::audit::{AuditEntry, AuditLog};
use crate::error::{Error, Result};
use crate::paths::PathResolver;

#[derive(Debug, Deserialize)]
struct StagingMeta {
    #[serde(default)]
    detected_pack_ids: Vec<String>,
    #[serde(default)]
    is_multi_pack: bool,
}

/// One pack's apply failure inside a (possibly multi-pack) staging run.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyError {
    pub pack_id: String,
    pub error: String,
}

/// Outcome of [`PackApplier::apply`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyResult {
    pub success: bool,
    pub applied_pack_ids: Vec<String>,
    pub backup_paths: BTreeMap<String, String>,
    pub error: Option<String>,
    pub errors: Vec<ApplyError>,
}

impl ApplyResult {
    fn failed(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()), ..Default::default() }
    }
}

/// Applies staged pack payloads into the ecosystem tree. Only the
/// `replace` apply mode is supported; anything else is rejected up front.
pub struct PackApplier {
    resolver: PathResolver,
    approval: Arc<ApprovalManager>,
    audit: AuditLog,
}

impl PackApplier {
    pub fn new(resolver: PathResolver, approval: Arc<ApprovalManager>, audit_dir: &Path) -> Self {
        let audit = AuditLog::new(audit_dir.to_path_buf());
        Self { resolver, approval, audit }
    }

    /// Apply the payload staged under `<pack_staging_dir>/<staging_id>`.
    pub fn apply(&self, staging_id: &str, actor: &str) -> Result<ApplyResult> {
        let staging_dir = self.resolver.pack_staging_dir(staging_id);
        if !staging_dir.is_dir() {
            return Ok(ApplyResult::failed(format!("staging not found: {staging_id}")));
        }

        let meta_path = staging_dir.join("meta.json");
        let meta: StagingMeta = match std::fs::read_to_string(&meta_path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(m) => m,
                Err(e) => return Ok(ApplyResult::failed(format!("failed to read meta.json: {e}"))),
            },
            Err(_) => return Ok(ApplyResult::failed("meta.json not found in staging")),
        };

        let payload_dir = staging_dir.join("payload");
        if !payload_dir.is_dir() {
            return Ok(ApplyResult::failed("payload directory not found"));
        }

        let top_dirs: Vec<PathBuf> = std::fs::read_dir(&payload_dir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        if top_dirs.len() != 1 {
            return Ok(ApplyResult::failed(format!("expected 1 top-level dir in payload, found {}", top_dirs.len())));
        }
        let top_dir = &top_dirs[0];

        self.audit("pack_apply_started", true, &format!("staging_id={staging_id} actor={actor} multi={}", meta.is_multi_pack));

        let mut result = ApplyResult { success: true, ..Default::default() };

        if meta.is_multi_pack {
            let packs_dir = top_dir.join("packs");
            if !packs_dir.is_dir() {
                return Ok(ApplyResult::failed("multi-pack but no packs/ directory"));
            }
            for pack_id in &meta.detected_pack_ids {
                let pack_src = packs_dir.join(pack_id);
                if !pack_src.is_dir() {
                    result.errors.push(ApplyError { pack_id: pack_id.clone(), error: format!("pack directory not found: {pack_id}") });
                    continue;
                }
                match self.apply_single_pack(pack_id, &pack_src) {
                    Ok(backup) => {
                        result.applied_pack_ids.push(pack_id.clone());
                        if let Some(b) = backup {
                            result.backup_paths.insert(pack_id.clone(), b.display().to_string());
                        }
                    }
                    Err(e) => result.errors.push(ApplyError { pack_id: pack_id.clone(), error: e.sanitize() }),
                }
            }
        } else {
            let pack_id = meta
                .detected_pack_ids
                .first()
                .cloned()
                .or_else(|| top_dir.file_name().map(|n| n.to_string_lossy().into_owned()))
                .ok_or_else(|| Error::Validation("could not determine pack id".to_string()))?;
            match self.apply_single_pack(&pack_id, top_dir) {
                Ok(backup) => {
                    result.applied_pack_ids.push(pack_id.clone());
                    if let Some(b) = backup {
                        result.backup_paths.insert(pack_id.clone(), b.display().to_string());
                    }
                }
                Err(e) => {
                    result.success = false;
                    result.error = Some(e.sanitize());
                    result.errors.push(ApplyError { pack_id, error: e.sanitize() });
                }
            }
        }

        if !result.errors.is_empty() && result.applied_pack_ids.is_empty() {
            result.success = false;
            if result.error.is_none() {
                result.error = Some("all packs failed to apply".to_string());
            }
        }

        self.audit(
            if result.success { "pack_apply_completed" } else { "pack_apply_failed" },
            result.success,
            &format!("staging_id={staging_id} applied={:?} errors={}", result.applied_pack_ids, result.errors.len()),
        );
        Ok(result)
    }

    fn apply_single_pack(&self, pack_id: &str, pack_src: &Path) -> Result<Option<PathBuf>> {
        let dest = self.resolver.pack_dir(pack_id);
        let mut backup_path = None;

        if dest.is_dir() {
            self.check_pack_identity(pack_src, &dest)?;
            backup_path = Some(self.create_backup(pack_id, &dest)?);
            std::fs::remove_dir_all(&dest)?;
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        copy_dir_recursive(pack_src, &dest)?;

        if let Err(error) = self.approval.mark_modified(pack_id) {
            tracing::warn!(pack_id, %error, "failed to mark pack modified after apply");
        }

        Ok(backup_path)
    }

    fn check_pack_identity(&self, new_pack_dir: &Path, existing_pack_dir: &Path) -> Result<()> {
        let new_id = read_pack_id(new_pack_dir);
        let existing_id = read_pack_id(existing_pack_dir);

        let Some(new_id) = new_id else {
            return Err(Error::Validation("new pack has no ecosystem.json or it is unreadable".to_string()));
        };
        let Some(existing_id) = existing_id else {
            return Ok(());
        };
        if new_id != existing_id {
            return Err(Error::Validation(format!("pack_identity mismatch: existing='{existing_id}', new='{new_id}'")));
        }
        Ok(())
    }

    fn create_backup(&self, pack_id: &str, pack_dir: &Path) -> Result<PathBuf> {
        let ts = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        let backup_dir = self.resolver.pack_backups_dir(pack_id).join(ts.to_string());
        if let Some(parent) = backup_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        copy_dir_recursive(pack_dir, &backup_dir)?;
        Ok(backup_dir)
    }

    fn audit(&self, event: &str, success: bool, reason: &str) {
        let entry = AuditEntry::new(event, "system", success, reason);
        let _ = self.audit.record(&entry);
    }
}

fn read_pack_id(pack_dir: &Path) -> Option<String> {
    let manifest = pack_dir.join("ecosystem.json");
    let raw = std::fs::read_to_string(manifest).ok()?;
    let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
    value.get("pack_id").and_then(|v| v.as_str()).map(str::to_string)
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let rel = entry.path().strip_prefix(src).map_err(|e| Error::Internal(e.to_string()))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::HmacSigner;

    fn applier(dir: &Path) -> PackApplier {
        let resolver = PathResolver::new(dir);
        let signer = HmacSigner::from_key(b"test-key-that-is-at-least-32-bytes!".to_vec());
        let approval = Arc::new(ApprovalManager::new(resolver.clone(), signer));
        PackApplier::new(resolver, approval, &dir.join("audit"))
    }

    fn stage_single_pack(dir: &Path, staging_id: &str, pack_id: &str) {
        let staging = dir.join("user_data").join("pack_staging").join(staging_id);
        let top = staging.join("payload").join(pack_id);
        std::fs::create_dir_all(&top).unwrap();
        std::fs::write(top.join("ecosystem.json"), format!(r#"{{"pack_id": "{pack_id}", "pack_identity": "test:{pack_id}", "version": "1.0.0"}}"#)).unwrap();
        std::fs::write(
            staging.join("meta.json"),
            serde_json::json!({"detected_pack_ids": [pack_id], "is_multi_pack": false}).to_string(),
        )
        .unwrap();
    }

    #[test]
    fn applies_a_fresh_pack() {
        let dir = tempfile::tempdir().unwrap();
        stage_single_pack(dir.path(), "stg1", "p1");
        let applier = applier(dir.path());

        let result = applier.apply("stg1", "tester").unwrap();
        assert!(result.success, "{result:?}");
        assert_eq!(result.applied_pack_ids, vec!["p1".to_string()]);
        assert!(PathResolver::new(dir.path()).pack_dir("p1").join("ecosystem.json").is_file());
    }

    #[test]
    fn rejects_identity_mismatch_on_existing_pack() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        let existing = resolver.pack_dir("p1");
        std::fs::create_dir_all(&existing).unwrap();
        std::fs::write(existing.join("ecosystem.json"), r#"{"pack_id": "other", "pack_identity": "x", "version": "1.0.0"}"#).unwrap();

        stage_single_pack(dir.path(), "stg1", "p1");
        let applier = applier(dir.path());
        let result = applier.apply("stg1", "tester").unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("pack_identity mismatch"));
    }

    #[test]
    fn missing_staging_is_reported_not_erred() {
        let dir = tempfile::tempdir().unwrap();
        let applier = applier(dir.path());
        let result = applier.apply("nope", "tester").unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("staging not found"));
    }
}
