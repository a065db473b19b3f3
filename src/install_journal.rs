//! InstallJournal — append-only record of filesystem side effects caused
//! by installs, component phase runs, and lib execution, plus a safety-first
//! uninstall planner.
//!
//! Grounded on `core_runtime/install_journal.py`. The source's `uninstall()`
//! resolves allowed/protected roots through a `mount_manager` collaborator
//! that is out of this kernel's scope; this port takes the same fallback
//! path the source uses when that collaborator is unavailable — allowed
//! roots default to `user_data/{settings,cache}`, protected roots to
//! `user_data/{chats,shared}` — driven directly off [`PathResolver`] instead
//! of a mount manager.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::paths::PathResolver;

/// Paths a journal entry recorded as created or modified.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JournalPaths {
    #[serde(default)]
    pub created: Vec<String>,
    #[serde(default)]
    pub modified: Vec<String>,
}

/// One append-only journal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub ts: DateTime<Utc>,
    pub event: String,
    pub scope: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub result: String,
    #[serde(default)]
    pub paths: JournalPaths,
    #[serde(default)]
    pub meta: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// A planned uninstall action for a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UninstallDecision {
    Delete,
    Skip { reason: &'static str },
}

#[derive(Debug, Clone)]
pub struct UninstallPlanEntry {
    pub path: PathBuf,
    pub decision: UninstallDecision,
}

/// Append-only journal rooted at `user_data/settings/ecosystem/install_journal/`.
pub struct InstallJournal {
    dir: PathBuf,
    resolver: PathResolver,
    lock: Mutex<()>,
}

const FILE_PREFIX: &str = "install_journal";

impl InstallJournal {
    pub fn new(resolver: PathResolver) -> Self {
        let dir = resolver.install_journal_dir();
        Self { dir, resolver, lock: Mutex::new(()) }
    }

    fn path_for(&self, ts: DateTime<Utc>) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}_{}.jsonl", ts.format("%Y-%m-%d")))
    }

    /// Append `entry`, creating the journal directory if needed.
    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        std::fs::create_dir_all(&self.dir)?;
        let line = serde_json::to_string(entry)?;
        let path = self.path_for(entry.ts);
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }

    /// Read every journal entry across all dated files, in file order then
    /// append order within each file. Corrupted lines are skipped.
    pub fn read_all(&self) -> Result<Vec<JournalEntry>> {
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.dir) else { return Ok(out) };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
            .collect();
        files.sort();
        for file in files {
            let Ok(contents) = std::fs::read_to_string(&file) else { continue };
            for line in contents.lines() {
                if let Ok(entry) = serde_json::from_str::<JournalEntry>(line) {
                    out.push(entry);
                }
            }
        }
        Ok(out)
    }

    fn allowed_roots(&self) -> Vec<PathBuf> {
        let base = self.resolver.user_data_dir();
        vec![base.join("settings"), base.join("cache")]
    }

    fn protected_roots(&self) -> Vec<PathBuf> {
        let base = self.resolver.user_data_dir();
        vec![base.join("chats"), base.join("shared")]
    }

    /// Build an uninstall plan from every `paths.created` entry across the
    /// journal: protected roots are always skipped, a path strictly inside
    /// an allowed root (but not the root itself) is marked for deletion,
    /// everything else is skipped as outside the allowed roots. When
    /// `dry_run` is false, deletions are actually performed.
    pub fn uninstall(&self, dry_run: bool) -> Result<Vec<UninstallPlanEntry>> {
        let allowed = self.allowed_roots();
        let protected = self.protected_roots();

        let mut seen = std::collections::BTreeSet::new();
        for entry in self.read_all()? {
            for p in entry.paths.created {
                seen.insert(p);
            }
        }

        let mut plan = Vec::with_capacity(seen.len());
        for raw in seen {
            let path = PathBuf::from(&raw);
            let decision = decide_path(&path, &allowed, &protected);
            if !dry_run && decision == UninstallDecision::Delete {
                if path.is_dir() {
                    let _ = std::fs::remove_dir_all(&path);
                } else {
                    let _ = std::fs::remove_file(&path);
                }
            }
            plan.push(UninstallPlanEntry { path, decision });
        }
        Ok(plan)
    }
}

fn decide_path(path: &Path, allowed: &[PathBuf], protected: &[PathBuf]) -> UninstallDecision {
    for root in protected {
        if path.starts_with(root) {
            return UninstallDecision::Skip { reason: "protected_root" };
        }
    }
    for root in allowed {
        if path.starts_with(root) && path != root {
            return UninstallDecision::Delete;
        }
    }
    UninstallDecision::Skip { reason: "outside_allowed_roots" }
}

impl PartialEq for UninstallDecision {
    fn eq(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (UninstallDecision::Delete, UninstallDecision::Delete)
                | (UninstallDecision::Skip { .. }, UninstallDecision::Skip { .. })
        )
    }
}
impl Eq for UninstallDecision {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn journal() -> (tempfile::TempDir, InstallJournal) {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        (dir, InstallJournal::new(resolver))
    }

    #[test]
    fn append_then_read_all_round_trips() {
        let (_dir, journal) = journal();
        let entry = JournalEntry {
            ts: Utc::now(),
            event: "install_run".to_string(),
            scope: "component".to_string(),
            reference: "pack-a:tool:x".to_string(),
            result: "success".to_string(),
            paths: JournalPaths { created: vec!["a".to_string()], modified: vec![] },
            meta: json!({}),
            error: None,
        };
        journal.append(&entry).unwrap();
        let all = journal.read_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].reference, "pack-a:tool:x");
    }

    #[test]
    fn uninstall_plan_skips_protected_and_outside_paths() {
        let (dir, journal) = journal();
        let user_data = dir.path().join("user_data");
        let settings_file = user_data.join("settings").join("created_thing");
        let chats_file = user_data.join("chats").join("precious");
        std::fs::create_dir_all(settings_file.parent().unwrap()).unwrap();
        std::fs::create_dir_all(chats_file.parent().unwrap()).unwrap();
        std::fs::write(&settings_file, "x").unwrap();
        std::fs::write(&chats_file, "x").unwrap();

        let entry = JournalEntry {
            ts: Utc::now(),
            event: "install_run".to_string(),
            scope: "pack".to_string(),
            reference: "pack-a".to_string(),
            result: "success".to_string(),
            paths: JournalPaths {
                created: vec![
                    settings_file.to_string_lossy().to_string(),
                    chats_file.to_string_lossy().to_string(),
                    "/outside/root".to_string(),
                ],
                modified: vec![],
            },
            meta: json!({}),
            error: None,
        };
        journal.append(&entry).unwrap();

        let plan = journal.uninstall(true).unwrap();
        let decisions: std::collections::HashMap<_, _> =
            plan.iter().map(|e| (e.path.clone(), e.decision.clone())).collect();
        assert_eq!(decisions[&settings_file], UninstallDecision::Delete);
        assert!(matches!(decisions[&chats_file], UninstallDecision::Skip { .. }));
        assert!(settings_file.exists(), "dry run must not delete");
    }

    #[test]
    fn uninstall_non_dry_run_deletes_allowed_paths() {
        let (dir, journal) = journal();
        let target = dir.path().join("user_data").join("cache").join("blob");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, "x").unwrap();

        let entry = JournalEntry {
            ts: Utc::now(),
            event: "install_run".to_string(),
            scope: "pack".to_string(),
            reference: "pack-a".to_string(),
            result: "success".to_string(),
            paths: JournalPaths { created: vec![target.to_string_lossy().to_string()], modified: vec![] },
            meta: json!({}),
            error: None,
        };
        journal.append(&entry).unwrap();
        journal.uninstall(false).unwrap();
        assert!(!target.exists());
    }
}
