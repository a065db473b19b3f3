//! PathResolver — canonicalizes ecosystem/pack/shared directories.
//!
//! Dependency-free leaf module: every other manager consults this instead of
//! hard-coding path fragments. Grounded on `core_runtime/paths.py`'s
//! discovery order (flat layout first, then the legacy `packs/`
//! subdirectory for compatibility) and the candidate resolution between
//! `ecosystem/<pack>/backend/...` and `ecosystem/<pack>/...`.

use std::path::{Path, PathBuf};

/// Resolves canonical filesystem locations under a kernel install root.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    /// Create a resolver rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ecosystem_dir(&self) -> PathBuf {
        self.root.join("ecosystem")
    }

    pub fn official_flows_dir(&self) -> PathBuf {
        self.root.join("flows")
    }

    /// Legacy flow directory layout. Its mere presence is an error per the
    /// port's redesign decision (spec section 9) — only `flows/` is
    /// supported going forward.
    pub fn legacy_flow_dir(&self) -> PathBuf {
        self.root.join("flow")
    }

    pub fn ecosystem_flows_dir(&self) -> PathBuf {
        self.ecosystem_dir().join("flows")
    }

    pub fn ecosystem_modifiers_dir(&self) -> PathBuf {
        self.ecosystem_flows_dir().join("modifiers")
    }

    pub fn user_data_dir(&self) -> PathBuf {
        self.root.join("user_data")
    }

    pub fn permissions_dir(&self) -> PathBuf {
        self.user_data_dir().join("permissions")
    }

    pub fn secret_key_file(&self) -> PathBuf {
        self.permissions_dir().join(".secret_key")
    }

    pub fn network_grants_dir(&self) -> PathBuf {
        self.permissions_dir().join("network")
    }

    pub fn secrets_grants_dir(&self) -> PathBuf {
        self.permissions_dir().join("secrets")
    }

    pub fn capability_usage_dir(&self) -> PathBuf {
        self.permissions_dir().join("capability_usage")
    }

    pub fn shared_modifiers_dir(&self) -> PathBuf {
        self.user_data_dir().join("shared").join("flows").join("modifiers")
    }

    pub fn pack_staging_dir(&self, pack_id: &str) -> PathBuf {
        self.user_data_dir().join("pack_staging").join(pack_id)
    }

    pub fn pack_backups_dir(&self, pack_id: &str) -> PathBuf {
        self.user_data_dir().join("pack_backups").join(pack_id)
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.user_data_dir().join("settings").join("audit")
    }

    pub fn install_journal_dir(&self) -> PathBuf {
        self.user_data_dir()
            .join("settings")
            .join("ecosystem")
            .join("install_journal")
    }

    pub fn pack_dir(&self, pack_id: &str) -> PathBuf {
        self.ecosystem_dir().join(pack_id)
    }

    /// Resolve the effective root of a pack's tree: prefer `<pack>/backend`
    /// if it contains `ecosystem.json`, else the flat `<pack>/` layout.
    pub fn pack_effective_root(&self, pack_id: &str) -> PathBuf {
        let base = self.pack_dir(pack_id);
        let backend = base.join("backend");
        if backend.join("ecosystem.json").is_file() {
            backend
        } else {
            base
        }
    }

    pub fn pack_manifest_file(&self, pack_id: &str) -> PathBuf {
        self.pack_effective_root(pack_id).join("ecosystem.json")
    }

    pub fn pack_components_dir(&self, pack_id: &str) -> PathBuf {
        self.pack_effective_root(pack_id).join("components")
    }

    pub fn pack_addons_dir(&self, pack_id: &str) -> PathBuf {
        self.pack_effective_root(pack_id).join("addons")
    }

    pub fn pack_flows_dir(&self, pack_id: &str) -> PathBuf {
        self.pack_effective_root(pack_id).join("flows")
    }

    pub fn pack_modifiers_dir(&self, pack_id: &str) -> PathBuf {
        self.pack_flows_dir(pack_id).join("modifiers")
    }

    pub fn pack_lib_dir(&self, pack_id: &str) -> PathBuf {
        self.pack_effective_root(pack_id).join("lib")
    }

    /// List pack ids discovered under `ecosystem/`, excluding a legacy
    /// `packs/` compatibility alias if present. Directory names only; no
    /// manifest validation happens here (see `PackRegistry::scan`).
    pub fn discover_pack_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        let eco = self.ecosystem_dir();
        if let Ok(entries) = std::fs::read_dir(&eco) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if name == "flows" || name == "packs" {
                    continue;
                }
                ids.push(name);
            }
        }
        // Legacy compatibility: ecosystem/packs/<id>
        let legacy = eco.join("packs");
        if let Ok(entries) = std::fs::read_dir(&legacy) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if !ids.contains(&name) {
                    ids.push(name);
                }
            }
        }
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_backend_subdir_when_manifest_present() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        let backend = resolver.pack_dir("p1").join("backend");
        std::fs::create_dir_all(&backend).unwrap();
        std::fs::write(backend.join("ecosystem.json"), "{}").unwrap();

        assert_eq!(resolver.pack_effective_root("p1"), backend);
    }

    #[test]
    fn falls_back_to_flat_layout() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        let flat = resolver.pack_dir("p1");
        std::fs::create_dir_all(&flat).unwrap();
        std::fs::write(flat.join("ecosystem.json"), "{}").unwrap();

        assert_eq!(resolver.pack_effective_root("p1"), flat);
    }

    #[test]
    fn discover_pack_ids_skips_flows_and_packs_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path());
        std::fs::create_dir_all(resolver.pack_dir("p1")).unwrap();
        std::fs::create_dir_all(resolver.pack_dir("p2")).unwrap();
        std::fs::create_dir_all(resolver.ecosystem_flows_dir()).unwrap();
        std::fs::create_dir_all(resolver.ecosystem_dir().join("packs").join("legacy1")).unwrap();

        let ids = resolver.discover_pack_ids();
        assert_eq!(ids, vec!["legacy1".to_string(), "p1".to_string(), "p2".to_string()]);
    }
}
