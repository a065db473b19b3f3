//! Append-only, structured audit logging.
//!
//! Every grant check, state transition, and sandbox denial produces an
//! [`AuditEntry`]. Entries are appended as JSON Lines to
//! `user_data/settings/audit/permissions_YYYY-MM-DD.jsonl`, one file per UTC
//! day, mirroring the teacher's `AuditLogEntry` shape
//! (`dashflow-wasm-executor::audit`).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Severity of an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Security,
}

/// A single audit log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: Severity,
    pub principal_id: String,
    pub allowed: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null", default)]
    pub detail: serde_json::Value,
}

impl AuditEntry {
    pub fn new(event_type: impl Into<String>, principal_id: impl Into<String>, allowed: bool, reason: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.into(),
            severity: if allowed { Severity::Info } else { Severity::Warning },
            principal_id: principal_id.into(),
            allowed,
            reason: reason.into(),
            detail: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Append-only audit sink rooted at `user_data/settings/audit/`.
pub struct AuditLog {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl AuditLog {
    /// Create an audit log writing into `dir` (typically
    /// `<root>/user_data/settings/audit`).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    fn path_for(&self, ts: DateTime<Utc>) -> PathBuf {
        self.dir.join(format!("permissions_{}.jsonl", ts.format("%Y-%m-%d")))
    }

    /// Append an entry, creating the day's file and parent directories as
    /// needed.
    pub fn record(&self, entry: &AuditEntry) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(entry.timestamp);
        let line = serde_json::to_string(entry)?;
        append_line(&path, &line)?;
        match entry.severity {
            Severity::Security | Severity::Warning => tracing::warn!(
                target: "audit",
                event = %entry.event_type,
                principal = %entry.principal_id,
                allowed = entry.allowed,
                "{}", entry.reason
            ),
            Severity::Info => tracing::info!(
                target: "audit",
                event = %entry.event_type,
                principal = %entry.principal_id,
                allowed = entry.allowed,
                "{}", entry.reason
            ),
        }
        Ok(())
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{line}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        let entry = AuditEntry::new("network.check_access", "pack-a", false, "no grant")
            .with_severity(Severity::Security);
        log.record(&entry).unwrap();
        log.record(&entry).unwrap();

        let path = log.path_for(entry.timestamp);
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        let parsed: AuditEntry = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.principal_id, "pack-a");
        assert!(!parsed.allowed);
    }
}
