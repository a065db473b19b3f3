//! HostPrivilegeGrantManager — authorizes escapes from the sandboxed
//! Docker baseline (e.g. host networking, extra bind mounts, privileged
//! devices). These are the highest-risk grants in the kernel and are never
//! implied by a capability grant alone.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::audit::{AuditEntry, AuditLog, Severity};
use crate::error::Result;
use crate::paths::PathResolver;
use crate::signer::HmacSigner;

use super::{read_signed_json, safe_id, write_signed_json};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostPrivilegeGrant {
    pub principal_id: String,
    pub enabled: bool,
    pub privileges: Vec<String>,
    pub granted_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub granted_by: String,
    #[serde(default)]
    pub notes: String,
}

pub struct HostPrivilegeGrantManager {
    dir: PathBuf,
    signer: HmacSigner,
    audit: AuditLog,
    grants: RwLock<HashMap<String, HostPrivilegeGrant>>,
    disabled_packs: RwLock<HashSet<String>>,
}

impl HostPrivilegeGrantManager {
    pub fn new(resolver: &PathResolver, signer: HmacSigner) -> Self {
        Self {
            dir: resolver.permissions_dir().join("host_privilege"),
            signer,
            audit: AuditLog::new(resolver.audit_dir()),
            grants: RwLock::new(HashMap::new()),
            disabled_packs: RwLock::new(HashSet::new()),
        }
    }

    fn path(&self, principal_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", safe_id(principal_id)))
    }

    pub fn grant(&self, principal_id: &str, privileges: Vec<String>, granted_by: &str) -> Result<()> {
        let now = chrono::Utc::now();
        let grant = HostPrivilegeGrant {
            principal_id: principal_id.to_string(),
            enabled: true,
            privileges,
            granted_at: now,
            updated_at: now,
            granted_by: granted_by.to_string(),
            notes: String::new(),
        };
        write_signed_json(&self.path(principal_id), serde_json::to_value(&grant)?, &self.signer)?;
        self.grants.write().insert(principal_id.to_string(), grant);
        Ok(())
    }

    pub fn revoke(&self, principal_id: &str) -> Result<()> {
        let mut grants = self.grants.write();
        if let Some(grant) = grants.get_mut(principal_id) {
            grant.enabled = false;
            grant.updated_at = chrono::Utc::now();
            write_signed_json(&self.path(principal_id), serde_json::to_value(&*grant)?, &self.signer)?;
        }
        Ok(())
    }

    pub fn mark_disabled(&self, principal_id: &str) {
        self.disabled_packs.write().insert(principal_id.to_string());
    }

    pub fn clear_disabled(&self, principal_id: &str) {
        self.disabled_packs.write().remove(principal_id);
    }

    fn load(&self, principal_id: &str) -> Option<HostPrivilegeGrant> {
        if let Some(g) = self.grants.read().get(principal_id) {
            return Some(g.clone());
        }
        match read_signed_json(&self.path(principal_id), &self.signer) {
            Ok(Some(v)) => serde_json::from_value(v).ok(),
            _ => None,
        }
    }

    /// Check whether `principal_id` holds `privilege` (e.g. `"host_network"`,
    /// `"privileged_device:/dev/kvm"`). Every call is audited, and denial is
    /// the fail-closed default.
    pub fn check_access(&self, principal_id: &str, privilege: &str) -> bool {
        let allowed = !self.disabled_packs.read().contains(principal_id)
            && self
                .load(principal_id)
                .map(|g| g.enabled && g.privileges.iter().any(|p| p == privilege))
                .unwrap_or(false);
        let entry = AuditEntry::new("host_privilege.check_access", principal_id, allowed, if allowed { "granted" } else { "denied" })
            .with_severity(if allowed { Severity::Info } else { Severity::Security })
            .with_detail(serde_json::json!({"privilege": privilege}));
        let _ = self.audit.record(&entry);
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_restricts_to_named_privileges() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        let signer = HmacSigner::from_key(b"test-key-that-is-at-least-32-bytes!".to_vec());
        let mgr = HostPrivilegeGrantManager::new(&resolver, signer);

        mgr.grant("pack-a", vec!["host_network".to_string()], "operator").unwrap();
        assert!(mgr.check_access("pack-a", "host_network"));
        assert!(!mgr.check_access("pack-a", "privileged_device"));
    }

    #[test]
    fn revoke_denies_even_previously_granted_privilege() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        let signer = HmacSigner::from_key(b"test-key-that-is-at-least-32-bytes!".to_vec());
        let mgr = HostPrivilegeGrantManager::new(&resolver, signer);

        mgr.grant("pack-a", vec!["host_network".to_string()], "operator").unwrap();
        mgr.revoke("pack-a").unwrap();
        assert!(!mgr.check_access("pack-a", "host_network"));
    }

    #[test]
    fn no_grant_is_denied_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        let signer = HmacSigner::from_key(b"test-key-that-is-at-least-32-bytes!".to_vec());
        let mgr = HostPrivilegeGrantManager::new(&resolver, signer);
        assert!(!mgr.check_access("unknown", "host_network"));
    }
}
