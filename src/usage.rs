//! CapabilityUsageStore — per-`(principal, permission, scope)` usage
//! counters with daily windows and expiry, consumed atomically.
//!
//! Grounded on spec section 4.3. Records persist as signed JSON at
//! `user_data/permissions/capability_usage/<safe_id(principal)>.json`,
//! written via temp-file + rename for atomicity (contrast with the grant
//! managers in `grants/`, which accept last-writer-wins).

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::audit::{AuditEntry, AuditLog, Severity};
use crate::error::Result;
use crate::grants::safe_id;
use crate::paths::PathResolver;
use crate::signer::HmacSigner;

/// Usage counters for one `(principal, permission, scope_key)` triple.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageRecord {
    pub used_count: u64,
    pub last_used_ts: Option<chrono::DateTime<chrono::Utc>>,
    /// Keyed by `YYYY-MM-DD` in UTC.
    #[serde(default)]
    pub daily_counts: BTreeMap<String, u64>,
}

/// All usage records belonging to one principal, as persisted on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PrincipalUsageFile {
    /// Keyed by `"{permission_id}\u{0}{scope_key}"`.
    records: BTreeMap<String, UsageRecord>,
}

fn record_key(permission_id: &str, scope_key: &str) -> String {
    format!("{permission_id}\u{0}{scope_key}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Expired,
    MaxCountExceeded,
    MaxDailyExceeded,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::Expired => "expired",
            DenyReason::MaxCountExceeded => "max_count_exceeded",
            DenyReason::MaxDailyExceeded => "max_daily_exceeded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumeResult {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
    pub used_count: u64,
    pub used_today: u64,
}

/// Manages usage records for every principal, one signed JSON file each,
/// guarded by a reentrant-style lock per principal so concurrent consumes
/// for distinct principals never contend.
pub struct CapabilityUsageStore {
    dir: PathBuf,
    signer: HmacSigner,
    audit: AuditLog,
    files: Mutex<HashMap<String, Mutex<PrincipalUsageFile>>>,
}

impl CapabilityUsageStore {
    pub fn new(resolver: &PathResolver, signer: HmacSigner) -> Self {
        Self {
            dir: resolver.capability_usage_dir(),
            signer,
            audit: AuditLog::new(resolver.audit_dir()),
            files: Mutex::new(HashMap::new()),
        }
    }

    fn path(&self, principal_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", safe_id(principal_id)))
    }

    /// Load a principal's usage file from disk, verifying its HMAC
    /// signature. On tamper, logs a security event and returns an empty
    /// file rather than reusing the corrupted counters (spec's documented
    /// fail-open-on-tamper choice; see the stricter alternative noted in
    /// [`DenyReason`]'s module docs).
    fn load_from_disk(&self, principal_id: &str) -> PrincipalUsageFile {
        let path = self.path(principal_id);
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return PrincipalUsageFile::default();
        };
        let parsed: Result<serde_json::Value> = serde_json::from_str(&raw).map_err(Into::into);
        let unsealed = parsed.and_then(|envelope| self.signer.unseal(envelope));
        match unsealed {
            Ok(value) => serde_json::from_value(value).unwrap_or_default(),
            Err(_) => {
                let entry = AuditEntry::new("usage.tamper_detected", principal_id, false, "usage record signature verification failed; resetting in-memory cache")
                    .with_severity(Severity::Security);
                let _ = self.audit.record(&entry);
                PrincipalUsageFile::default()
            }
        }
    }

    fn persist(&self, principal_id: &str, file: &PrincipalUsageFile) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let value = serde_json::to_value(file)?;
        let sealed = self.signer.seal(value)?;
        let path = self.path(principal_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&sealed)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn principal_lock(&self, principal_id: &str, files: &mut HashMap<String, Mutex<PrincipalUsageFile>>) {
        files
            .entry(principal_id.to_string())
            .or_insert_with(|| Mutex::new(self.load_from_disk(principal_id)));
    }

    /// Atomically check quota and, if allowed, consume one unit.
    ///
    /// `max_count == 0` means "no global cap"; `max_daily == 0` means "no
    /// daily cap". `expires_at`, if set and in the past, always denies.
    pub fn check_and_consume(
        &self,
        principal_id: &str,
        permission_id: &str,
        scope_key: &str,
        max_count: u64,
        max_daily: u64,
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> ConsumeResult {
        let mut outer = self.files.lock();
        self.principal_lock(principal_id, &mut outer);
        let file_lock = outer.get(principal_id).expect("just inserted");
        let mut file = file_lock.lock();

        let now = chrono::Utc::now();
        let today = now.format("%Y-%m-%d").to_string();
        let key = record_key(permission_id, scope_key);
        let record = file.records.entry(key).or_default();
        let used_today = *record.daily_counts.get(&today).unwrap_or(&0);

        let result = if expires_at.is_some_and(|exp| now > exp) {
            ConsumeResult {
                allowed: false,
                reason: Some(DenyReason::Expired),
                used_count: record.used_count,
                used_today,
            }
        } else if max_count > 0 && record.used_count >= max_count {
            ConsumeResult {
                allowed: false,
                reason: Some(DenyReason::MaxCountExceeded),
                used_count: record.used_count,
                used_today,
            }
        } else if max_daily > 0 && used_today >= max_daily {
            ConsumeResult {
                allowed: false,
                reason: Some(DenyReason::MaxDailyExceeded),
                used_count: record.used_count,
                used_today,
            }
        } else {
            record.used_count += 1;
            record.last_used_ts = Some(now);
            *record.daily_counts.entry(today).or_insert(0) += 1;
            ConsumeResult {
                allowed: true,
                reason: None,
                used_count: record.used_count,
                used_today: used_today + 1,
            }
        };

        let entry = AuditEntry::new("usage.check_and_consume", principal_id, result.allowed, result.reason.map(DenyReason::as_str).unwrap_or("consumed"))
            .with_severity(if result.allowed { Severity::Info } else { Severity::Warning })
            .with_detail(serde_json::json!({"permission_id": permission_id, "scope_key": scope_key}));
        let _ = self.audit.record(&entry);

        if result.allowed {
            let file_clone = file.clone_for_persist();
            drop(file);
            let _ = self.persist(principal_id, &file_clone);
        }
        result
    }
}

impl PrincipalUsageFile {
    fn clone_for_persist(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn store(dir: &std::path::Path) -> CapabilityUsageStore {
        let resolver = PathResolver::new(dir);
        let signer = HmacSigner::from_key(b"test-key-that-is-at-least-32-bytes!".to_vec());
        CapabilityUsageStore::new(&resolver, signer)
    }

    #[test]
    fn max_count_caps_total_consumption() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        for _ in 0..3 {
            let r = s.check_and_consume("p", "docker.run", "default", 3, 0, None);
            assert!(r.allowed);
        }
        let denied = s.check_and_consume("p", "docker.run", "default", 3, 0, None);
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(DenyReason::MaxCountExceeded));
    }

    #[test]
    fn concurrent_consumes_yield_exactly_max_count_successes() {
        let dir = tempfile::tempdir().unwrap();
        let s = Arc::new(store(dir.path()));
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let s = Arc::clone(&s);
                thread::spawn(move || s.check_and_consume("p", "docker.run", "default", 3, 0, None).allowed)
            })
            .collect();
        let successes = handles.into_iter().map(|h| h.join().unwrap()).filter(|&ok| ok).count();
        assert_eq!(successes, 3);
    }

    #[test]
    fn expired_grant_is_always_denied() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let past = chrono::Utc::now() - chrono::Duration::seconds(10);
        let r = s.check_and_consume("p", "docker.run", "default", 0, 0, Some(past));
        assert!(!r.allowed);
        assert_eq!(r.reason, Some(DenyReason::Expired));
    }

    #[test]
    fn daily_cap_resets_conceptually_per_day_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let r1 = s.check_and_consume("p", "docker.run", "default", 0, 1, None);
        assert!(r1.allowed);
        let r2 = s.check_and_consume("p", "docker.run", "default", 0, 1, None);
        assert!(!r2.allowed);
        assert_eq!(r2.reason, Some(DenyReason::MaxDailyExceeded));
    }

    #[test]
    fn tampered_file_resets_to_empty_and_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let s = store(dir.path());
            s.check_and_consume("p", "docker.run", "default", 1, 0, None);
            s.path("p")
        };
        let mut value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        value["_hmac_signature"] = serde_json::Value::String("0".repeat(64));
        std::fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();

        let s2 = store(dir.path());
        let r = s2.check_and_consume("p", "docker.run", "default", 1, 0, None);
        assert!(r.allowed);
    }
}
