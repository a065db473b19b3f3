//! PackRegistry — scans the ecosystem tree, parses manifests, and indexes
//! components/addons by type, UUID, and full id.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::{generate_component_uuid, generate_pack_uuid};
use crate::paths::PathResolver;

/// Parsed `ecosystem.json` manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcosystemManifest {
    pub pack_id: String,
    pub pack_identity: String,
    pub version: String,
    #[serde(default)]
    pub pack_uuid: Option<Uuid>,
    #[serde(default)]
    pub vocabulary: Vocabulary,
    #[serde(default)]
    pub allow_wildcard_modifiers: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Vocabulary {
    #[serde(default)]
    pub types: Vec<String>,
}

/// A component discovered inside a pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub r#type: String,
    pub id: String,
    pub version: String,
    pub uuid: Uuid,
    pub manifest: serde_json::Value,
    pub path: PathBuf,
    pub pack_id: String,
}

impl Component {
    pub fn full_id(&self) -> String {
        format!("{}:{}:{}", self.pack_id, self.r#type, self.id)
    }
}

/// A fully scanned pack: identity plus its indexed components/addons.
#[derive(Debug, Clone)]
pub struct Pack {
    pub pack_id: String,
    pub manifest: EcosystemManifest,
    pub pack_uuid: Uuid,
    pub root: PathBuf,
    pub components: Vec<Component>,
}

/// In-memory index of scanned packs. Rebuilt wholesale on every reload —
/// never mutated incrementally.
#[derive(Debug, Default)]
pub struct PackRegistry {
    packs: HashMap<String, Pack>,
    component_index: HashMap<Uuid, (String, usize)>,
    full_id_index: HashMap<String, (String, usize)>,
}

impl PackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan the ecosystem tree rooted at `resolver`, returning the set of
    /// pack ids discovered. Replaces the in-memory index entirely.
    pub fn scan(&mut self, resolver: &PathResolver) -> Result<Vec<String>> {
        let mut packs = HashMap::new();
        let mut component_index = HashMap::new();
        let mut full_id_index = HashMap::new();

        let ids = resolver.discover_pack_ids();
        for pack_id in &ids {
            let manifest_path = resolver.pack_manifest_file(pack_id);
            let Ok(raw) = std::fs::read_to_string(&manifest_path) else {
                continue;
            };
            let manifest: EcosystemManifest = match serde_json::from_str(&raw) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if manifest.pack_id != *pack_id {
                tracing::warn!(pack_id = %pack_id, manifest_pack_id = %manifest.pack_id, "pack_id mismatch between directory name and manifest");
            }
            let pack_uuid = manifest
                .pack_uuid
                .unwrap_or(generate_pack_uuid(&manifest.pack_identity)?);

            let components = scan_components(resolver, pack_id, pack_uuid)?;
            for (idx, c) in components.iter().enumerate() {
                component_index.insert(c.uuid, (pack_id.clone(), idx));
                full_id_index.insert(c.full_id(), (pack_id.clone(), idx));
            }

            packs.insert(
                pack_id.clone(),
                Pack {
                    pack_id: pack_id.clone(),
                    manifest,
                    pack_uuid,
                    root: resolver.pack_effective_root(pack_id),
                    components,
                },
            );
        }

        self.packs = packs;
        self.component_index = component_index;
        self.full_id_index = full_id_index;
        Ok(ids)
    }

    pub fn get(&self, pack_id: &str) -> Option<&Pack> {
        self.packs.get(pack_id)
    }

    pub fn all(&self) -> impl Iterator<Item = &Pack> {
        self.packs.values()
    }

    pub fn component_by_uuid(&self, uuid: Uuid) -> Option<&Component> {
        let (pack_id, idx) = self.component_index.get(&uuid)?;
        self.packs.get(pack_id)?.components.get(*idx)
    }

    pub fn component_by_full_id(&self, full_id: &str) -> Option<&Component> {
        let (pack_id, idx) = self.full_id_index.get(full_id)?;
        self.packs.get(pack_id)?.components.get(*idx)
    }

    pub fn components_by_type<'a>(&'a self, component_type: &'a str) -> impl Iterator<Item = &'a Component> + 'a {
        self.packs
            .values()
            .flat_map(|p| p.components.iter())
            .filter(move |c| c.r#type == component_type)
    }
}

fn scan_components(resolver: &PathResolver, pack_id: &str, pack_uuid: Uuid) -> Result<Vec<Component>> {
    let dir = resolver.pack_components_dir(pack_id);
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Ok(out);
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let manifest_path = path.join("manifest.json");
        let Ok(raw) = std::fs::read_to_string(&manifest_path) else {
            continue;
        };
        let manifest: serde_json::Value = serde_json::from_str(&raw)?;
        let component_type = manifest
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Validation(format!("component manifest at {path:?} missing 'type'")))?
            .to_string();
        let id = manifest
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_else(|| entry.file_name().to_str().unwrap_or("unknown"))
            .to_string();
        let version = manifest
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("0.0.0")
            .to_string();
        let uuid = generate_component_uuid(pack_uuid, &component_type, &id)?;

        out.push(Component {
            r#type: component_type,
            id,
            version,
            uuid,
            manifest,
            path,
            pack_id: pack_id.to_string(),
        });
    }
    out.sort_by(|a, b| a.full_id().cmp(&b.full_id()));
    Ok(out)
}
