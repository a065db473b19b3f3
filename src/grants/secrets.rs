//! SecretsGrantManager — authorizes which secret key names a principal may
//! read via the capability proxy's `secrets.read`.

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
pub struct SecretGrant {
    pub principal_id: String,
    pub enabled: bool,
    pub allowed_keys: Vec<String>,
    pub granted_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub granted_by: String,
    #[serde(default)]
    pub notes: String,
}

pub struct SecretsGrantManager {
    dir: PathBuf,
    signer: HmacSigner,
    audit: AuditLog,
    grants: RwLock<HashMap<String, SecretGrant>>,
    disabled_packs: RwLock<HashSet<String>>,
}

impl SecretsGrantManager {
    pub fn new(resolver: &PathResolver, signer: HmacSigner) -> Self {
        Self {
            dir: resolver.secrets_grants_dir(),
            signer,
            audit: AuditLog::new(resolver.audit_dir()),
            grants: RwLock::new(HashMap::new()),
            disabled_packs: RwLock::new(HashSet::new()),
        }
    }

    fn path(&self, principal_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", safe_id(principal_id)))
    }

    pub fn grant(&self, principal_id: &str, allowed_keys: Vec<String>, granted_by: &str) -> Result<()> {
        let now = chrono::Utc::now();
        let grant = SecretGrant {
            principal_id: principal_id.to_string(),
            enabled: true,
            allowed_keys,
            granted_at: now,
            updated_at: now,
            granted_by: granted_by.to_string(),
            notes: String::new(),
        };
        write_signed_json(&self.path(principal_id), serde_json::to_value(&grant)?, &self.signer)?;
        self.grants.write().insert(principal_id.to_string(), grant);
        Ok(())
    }

    pub fn mark_disabled(&self, principal_id: &str) {
        self.disabled_packs.write().insert(principal_id.to_string());
    }

    pub fn clear_disabled(&self, principal_id: &str) {
        self.disabled_packs.write().remove(principal_id);
    }

    fn load(&self, principal_id: &str) -> Option<SecretGrant> {
        if let Some(g) = self.grants.read().get(principal_id) {
            return Some(g.clone());
        }
        match read_signed_json(&self.path(principal_id), &self.signer) {
            Ok(Some(v)) => serde_json::from_value(v).ok(),
            _ => None,
        }
    }

    /// Check whether `principal_id` may read `key`.
    pub fn check_access(&self, principal_id: &str, key: &str) -> bool {
        let allowed = !self.disabled_packs.read().contains(principal_id)
            && self
                .load(principal_id)
                .map(|g| g.enabled && g.allowed_keys.iter().any(|k| k == key))
                .unwrap_or(false);
        let entry = AuditEntry::new("secrets.check_access", principal_id, allowed, if allowed { "granted" } else { "denied" })
            .with_severity(if allowed { Severity::Info } else { Severity::Security })
            .with_detail(serde_json::json!({"key": key}));
        let _ = self.audit.record(&entry);
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_restricts_to_named_keys() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        let signer = HmacSigner::from_key(b"test-key-that-is-at-least-32-bytes!".to_vec());
        let mgr = SecretsGrantManager::new(&resolver, signer);

        mgr.grant("pack-a", vec!["API_KEY".to_string()], "operator").unwrap();
        assert!(mgr.check_access("pack-a", "API_KEY"));
        assert!(!mgr.check_access("pack-a", "OTHER_KEY"));
    }

    #[test]
    fn disabled_pack_denied_even_with_valid_grant() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        let signer = HmacSigner::from_key(b"test-key-that-is-at-least-32-bytes!".to_vec());
        let mgr = SecretsGrantManager::new(&resolver, signer);
        mgr.grant("pack-a", vec!["API_KEY".to_string()], "operator").unwrap();
        mgr.mark_disabled("pack-a");
        assert!(!mgr.check_access("pack-a", "API_KEY"));
    }
}
