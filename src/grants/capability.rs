//! CapabilityGrantManager — authorizes named capabilities (e.g.
//! `docker.run`, `flow.run`) with an optional per-grant config blob.

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
pub struct CapabilityGrant {
    pub principal_id: String,
    pub enabled: bool,
    pub permission_id: String,
    #[serde(default)]
    pub config: serde_json::Value,
    pub granted_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub granted_by: String,
}

pub struct CapabilityGrantManager {
    dir: PathBuf,
    signer: HmacSigner,
    audit: AuditLog,
    grants: RwLock<HashMap<(String, String), CapabilityGrant>>,
    disabled_packs: RwLock<HashSet<String>>,
}

impl CapabilityGrantManager {
    pub fn new(resolver: &PathResolver, signer: HmacSigner) -> Self {
        Self {
            dir: resolver.permissions_dir().join("capability"),
            signer,
            audit: AuditLog::new(resolver.audit_dir()),
            grants: RwLock::new(HashMap::new()),
            disabled_packs: RwLock::new(HashSet::new()),
        }
    }

    fn path(&self, principal_id: &str, permission_id: &str) -> PathBuf {
        self.dir.join(format!("{}__{}.json", safe_id(principal_id), safe_id(permission_id)))
    }

    pub fn grant(&self, principal_id: &str, permission_id: &str, config: serde_json::Value, granted_by: &str) -> Result<()> {
        let now = chrono::Utc::now();
        let grant = CapabilityGrant {
            principal_id: principal_id.to_string(),
            enabled: true,
            permission_id: permission_id.to_string(),
            config,
            granted_at: now,
            updated_at: now,
            granted_by: granted_by.to_string(),
        };
        write_signed_json(&self.path(principal_id, permission_id), serde_json::to_value(&grant)?, &self.signer)?;
        self.grants.write().insert((principal_id.to_string(), permission_id.to_string()), grant);
        Ok(())
    }

    pub fn mark_disabled(&self, principal_id: &str) {
        self.disabled_packs.write().insert(principal_id.to_string());
    }

    pub fn clear_disabled(&self, principal_id: &str) {
        self.disabled_packs.write().remove(principal_id);
    }

    fn load(&self, principal_id: &str, permission_id: &str) -> Option<CapabilityGrant> {
        let key = (principal_id.to_string(), permission_id.to_string());
        if let Some(g) = self.grants.read().get(&key) {
            return Some(g.clone());
        }
        match read_signed_json(&self.path(principal_id, permission_id), &self.signer) {
            Ok(Some(v)) => serde_json::from_value(v).ok(),
            _ => None,
        }
    }

    /// Check whether `principal_id` holds `permission_id`, returning the
    /// grant's config blob if so.
    pub fn check_access(&self, principal_id: &str, permission_id: &str) -> Option<serde_json::Value> {
        let grant = if self.disabled_packs.read().contains(principal_id) {
            None
        } else {
            self.load(principal_id, permission_id).filter(|g| g.enabled)
        };
        let allowed = grant.is_some();
        let entry = AuditEntry::new("capability.check_access", principal_id, allowed, if allowed { "granted" } else { "denied" })
            .with_severity(if allowed { Severity::Info } else { Severity::Security })
            .with_detail(serde_json::json!({"permission_id": permission_id}));
        let _ = self.audit.record(&entry);
        grant.map(|g| g.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_carries_config_through_check() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        let signer = HmacSigner::from_key(b"test-key-that-is-at-least-32-bytes!".to_vec());
        let mgr = CapabilityGrantManager::new(&resolver, signer);

        mgr.grant("pack-a", "docker.run", serde_json::json!({"max_containers": 2}), "operator").unwrap();
        let config = mgr.check_access("pack-a", "docker.run").unwrap();
        assert_eq!(config["max_containers"], 2);
        assert!(mgr.check_access("pack-a", "flow.run").is_none());
    }
}
