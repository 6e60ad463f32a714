//! Project associations: a directory-scoped default profile per
//! provider, resolved by walking from a working directory up to the
//! filesystem root and taking the first (longest-prefix) match.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CaamError, StorageError};
use crate::provider::Provider;
use crate::util::atomic_write;

pub const DEFAULT_SENTINEL: &str = "<default>";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ProjectAssociations {
    /// `directory -> provider -> profile`.
    associations: BTreeMap<String, BTreeMap<String, String>>,
}

/// The outcome of resolving a working directory: which profile was
/// picked per provider, and which directory's association picked it
/// (or the `<default>` sentinel if nothing matched).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolved {
    pub profiles: BTreeMap<Provider, String>,
    pub sources: BTreeMap<Provider, String>,
}

pub struct ProjectStore {
    path: PathBuf,
}

fn normalize(dir: &Path) -> String {
    dir.to_string_lossy().trim_end_matches('/').to_string()
}

impl ProjectStore {
    pub fn open(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> Result<ProjectAssociations, CaamError> {
        if !self.path.exists() {
            return Ok(ProjectAssociations::default());
        }
        let raw = fs::read_to_string(&self.path).map_err(|e| CaamError::Storage(StorageError::Io(e)))?;
        if raw.trim().is_empty() {
            return Ok(ProjectAssociations::default());
        }
        serde_json::from_str(&raw)
            .map_err(|e| CaamError::Storage(StorageError::Corrupted(self.path.clone(), e.to_string())))
    }

    fn save(&self, data: &ProjectAssociations) -> Result<(), CaamError> {
        let body = serde_json::to_vec_pretty(data)
            .map_err(|e| CaamError::Other(anyhow::anyhow!("encoding project associations: {e}")))?;
        atomic_write(&self.path, &body, 0o600).map_err(|e| CaamError::Storage(StorageError::Io(e)))
    }

    /// Associate `directory` with `profile` for `provider`, overwriting
    /// any existing association for that (directory, provider) pair.
    pub fn set(&self, directory: &Path, provider: Provider, profile: &str) -> Result<(), CaamError> {
        let mut data = self.load()?;
        data.associations
            .entry(normalize(directory))
            .or_default()
            .insert(provider.as_str().to_string(), profile.to_string());
        self.save(&data)
    }

    /// Remove `provider`'s association for `directory`, if any. Drops
    /// the directory entry entirely once it has no providers left.
    pub fn unset(&self, directory: &Path, provider: Provider) -> Result<(), CaamError> {
        let mut data = self.load()?;
        let key = normalize(directory);
        if let Some(entry) = data.associations.get_mut(&key) {
            entry.remove(provider.as_str());
            if entry.is_empty() {
                data.associations.remove(&key);
            }
        }
        self.save(&data)
    }

    pub fn list(&self) -> Result<BTreeMap<String, BTreeMap<String, String>>, CaamError> {
        Ok(self.load()?.associations)
    }

    /// Walk `cwd` and its ancestors toward the root; the first
    /// directory that has an association for a given provider wins for
    /// that provider. Providers matched nowhere on the path resolve to
    /// the `<default>` sentinel source with no profile entry.
    pub fn resolve(&self, cwd: &Path) -> Result<Resolved, CaamError> {
        let data = self.load()?;
        let mut resolved = Resolved::default();
        let mut remaining: Vec<Provider> = Provider::ALL.to_vec();

        for ancestor in cwd.ancestors() {
            if remaining.is_empty() {
                break;
            }
            let key = normalize(ancestor);
            let Some(entry) = data.associations.get(&key) else {
                continue;
            };
            let mut matched = Vec::new();
            for provider in &remaining {
                if let Some(profile) = entry.get(provider.as_str()) {
                    resolved.profiles.insert(*provider, profile.clone());
                    resolved.sources.insert(*provider, key.clone());
                    matched.push(*provider);
                }
            }
            remaining.retain(|p| !matched.contains(p));
        }

        for provider in remaining {
            resolved.sources.insert(provider, DEFAULT_SENTINEL.to_string());
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prefers_the_closest_matching_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::open(dir.path().join("projects.json"));

        let root = dir.path().join("workspace");
        let nested = root.join("service-a");
        fs::create_dir_all(&nested).unwrap();

        store.set(&root, Provider::Codex, "work").unwrap();
        store.set(&nested, Provider::Codex, "service-a-bot").unwrap();

        let resolved = store.resolve(&nested).unwrap();
        assert_eq!(resolved.profiles.get(&Provider::Codex), Some(&"service-a-bot".to_string()));
        assert_eq!(resolved.sources.get(&Provider::Codex), Some(&normalize(&nested)));
    }

    #[test]
    fn resolve_falls_back_to_ancestor_when_nested_has_no_association() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::open(dir.path().join("projects.json"));

        let root = dir.path().join("workspace");
        let nested = root.join("service-b");
        fs::create_dir_all(&nested).unwrap();

        store.set(&root, Provider::Claude, "personal").unwrap();

        let resolved = store.resolve(&nested).unwrap();
        assert_eq!(resolved.profiles.get(&Provider::Claude), Some(&"personal".to_string()));
        assert_eq!(resolved.sources.get(&Provider::Claude), Some(&normalize(&root)));
    }

    #[test]
    fn resolve_uses_default_sentinel_when_nothing_matches() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::open(dir.path().join("projects.json"));
        let cwd = dir.path().join("untouched");
        fs::create_dir_all(&cwd).unwrap();

        let resolved = store.resolve(&cwd).unwrap();
        assert!(resolved.profiles.is_empty());
        assert_eq!(resolved.sources.get(&Provider::Gemini), Some(&DEFAULT_SENTINEL.to_string()));
    }

    #[test]
    fn unset_removes_association_and_empty_directory_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::open(dir.path().join("projects.json"));
        let project = dir.path().join("proj");
        fs::create_dir_all(&project).unwrap();

        store.set(&project, Provider::Codex, "alice").unwrap();
        store.unset(&project, Provider::Codex).unwrap();

        let listed = store.list().unwrap();
        assert!(listed.is_empty());
    }

    #[test]
    fn associations_persist_across_store_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("projects.json");
        let project = dir.path().join("proj");
        fs::create_dir_all(&project).unwrap();

        ProjectStore::open(path.clone()).set(&project, Provider::Gemini, "x").unwrap();
        let reopened = ProjectStore::open(path);
        let resolved = reopened.resolve(&project).unwrap();
        assert_eq!(resolved.profiles.get(&Provider::Gemini), Some(&"x".to_string()));
    }
}
