//! NetworkGrantManager — per-pack egress authorization.
//!
//! Grounded on `core_runtime/network_grant_manager.py`. Domain matching
//! rules (spec section 4.2):
//! - Exact match, case-insensitive.
//! - `*.example.com` matches `example.com` and any subdomain.
//! - A bare `example.com` entry implicitly matches itself and subdomains.
//! - Ports: an allow-list of ints; `0` means "all ports".

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
pub struct NetworkGrant {
    pub principal_id: String,
    pub enabled: bool,
    pub allowed_domains: Vec<String>,
    pub allowed_ports: Vec<u16>,
    pub granted_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default = "default_granted_by")]
    pub granted_by: String,
    #[serde(default)]
    pub notes: String,
}

fn default_granted_by() -> String {
    "system".to_string()
}

#[derive(Debug, Clone)]
pub struct NetworkCheckResult {
    pub allowed: bool,
    pub reason: String,
}

/// Manages network egress grants, one signed JSON file per principal under
/// `user_data/permissions/network/<safe_id>.json`.
pub struct NetworkGrantManager {
    dir: PathBuf,
    signer: HmacSigner,
    audit: AuditLog,
    grants: RwLock<HashMap<String, NetworkGrant>>,
    disabled_packs: RwLock<HashSet<String>>,
}

impl NetworkGrantManager {
    pub fn new(resolver: &PathResolver, signer: HmacSigner) -> Self {
        Self {
            dir: resolver.network_grants_dir(),
            signer,
            audit: AuditLog::new(resolver.audit_dir()),
            grants: RwLock::new(HashMap::new()),
            disabled_packs: RwLock::new(HashSet::new()),
        }
    }

    fn path(&self, principal_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", safe_id(principal_id)))
    }

    /// Grant (or replace) network access for a principal.
    pub fn grant(&self, principal_id: &str, allowed_domains: Vec<String>, allowed_ports: Vec<u16>, granted_by: &str) -> Result<()> {
        let now = chrono::Utc::now();
        let grant = NetworkGrant {
            principal_id: principal_id.to_string(),
            enabled: true,
            allowed_domains,
            allowed_ports,
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

    fn load(&self, principal_id: &str) -> Option<NetworkGrant> {
        if let Some(g) = self.grants.read().get(principal_id) {
            return Some(g.clone());
        }
        match read_signed_json(&self.path(principal_id), &self.signer) {
            Ok(Some(value)) => serde_json::from_value(value).ok(),
            Ok(None) => None,
            Err(_) => {
                tracing::warn!(target: "audit", principal = %principal_id, "network grant signature verification failed");
                None
            }
        }
    }

    /// Disable every grant belonging to `principal_id` until re-approval.
    /// Called when `ApprovalManager::mark_modified` fires.
    pub fn mark_disabled(&self, principal_id: &str) {
        self.disabled_packs.write().insert(principal_id.to_string());
    }

    pub fn clear_disabled(&self, principal_id: &str) {
        self.disabled_packs.write().remove(principal_id);
    }

    /// Check whether `principal_id` may reach `domain:port`. Every call
    /// produces an audit entry regardless of outcome.
    pub fn check_access(&self, principal_id: &str, domain: &str, port: u16) -> NetworkCheckResult {
        let result = self.check_access_inner(principal_id, domain, port);
        let entry = AuditEntry::new("network.check_access", principal_id, result.allowed, result.reason.clone())
            .with_severity(if result.allowed { Severity::Info } else { Severity::Security })
            .with_detail(serde_json::json!({"domain": domain, "port": port}));
        let _ = self.audit.record(&entry);
        result
    }

    fn check_access_inner(&self, principal_id: &str, domain: &str, port: u16) -> NetworkCheckResult {
        if self.disabled_packs.read().contains(principal_id) {
            return NetworkCheckResult {
                allowed: false,
                reason: "Pack is disabled due to modification".to_string(),
            };
        }
        let Some(grant) = self.load(principal_id) else {
            return NetworkCheckResult {
                allowed: false,
                reason: "grant not found".to_string(),
            };
        };
        if !grant.enabled {
            return NetworkCheckResult {
                allowed: false,
                reason: "grant revoked".to_string(),
            };
        }
        if !domain_allowed(&grant.allowed_domains, domain) {
            return NetworkCheckResult {
                allowed: false,
                reason: format!("domain '{domain}' not in allowed list"),
            };
        }
        if !port_allowed(&grant.allowed_ports, port) {
            return NetworkCheckResult {
                allowed: false,
                reason: format!("port {port} not in allowed list"),
            };
        }
        NetworkCheckResult {
            allowed: true,
            reason: "granted".to_string(),
        }
    }
}

fn domain_allowed(allowed: &[String], domain: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    allowed.iter().any(|pattern| {
        let pattern = pattern.to_ascii_lowercase();
        if let Some(suffix) = pattern.strip_prefix("*.") {
            domain == suffix || domain.ends_with(&format!(".{suffix}"))
        } else {
            domain == pattern || domain.ends_with(&format!(".{pattern}"))
        }
    })
}

fn port_allowed(allowed: &[u16], port: u16) -> bool {
    allowed.iter().any(|&p| p == 0 || p == port)
}
