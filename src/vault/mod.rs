//! The vault: on-disk layout and the atomic live/snapshot swap
//! protocol (`Backup`, `Restore`, `ActiveProfile`, `Delete`, `List`).

pub mod metadata;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CaamError, StorageError, VaultSwapError};
use crate::provider::{EntryKind, Provider};
use crate::util::atomic_write;

pub use metadata::Profile;

/// Records which `AuthFileSet` entries were absent from the live files
/// at backup time, so `Restore` knows to unlink rather than write.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotMeta {
    absent: Vec<String>,
}

impl SnapshotMeta {
    fn path(snapshot_dir: &Path) -> PathBuf {
        snapshot_dir.join("meta.json")
    }

    fn load(snapshot_dir: &Path) -> SnapshotMeta {
        std::fs::read_to_string(Self::path(snapshot_dir))
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn save(&self, snapshot_dir: &Path) -> Result<(), CaamError> {
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| CaamError::Other(anyhow::anyhow!("encoding snapshot meta: {e}")))?;
        atomic_write(&Self::path(snapshot_dir), &body, 0o600)
            .map_err(|e| CaamError::Storage(StorageError::Io(e)))
    }
}

fn rel_key(rel: &Path) -> String {
    rel.to_string_lossy().replace('\\', "/")
}

/// Result of [`Vault::verify`]: whether a single profile's snapshot
/// still matches the live files, and which tracked paths drifted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileVerification {
    pub matches: bool,
    pub drifted_paths: Vec<String>,
}

/// Owns the vault root directory and a process-wide per-profile mutex
/// table. Disjoint (provider, profile) pairs may proceed concurrently;
/// operations on the same pair are totally ordered.
pub struct Vault {
    root: PathBuf,
    home: PathBuf,
    locks: Mutex<HashMap<(Provider, String), Arc<Mutex<()>>>>,
}

impl Vault {
    pub fn new(root: PathBuf, home: PathBuf) -> Self {
        Self {
            root,
            home,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, provider: Provider, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry((provider, name.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn provider_dir(&self, provider: Provider) -> PathBuf {
        self.root.join(provider.as_str())
    }

    pub fn profile_path(&self, provider: Provider, name: &str) -> PathBuf {
        self.provider_dir(provider).join(name)
    }

    /// Enumerate non-system profile names under `<vault>/<provider>`.
    pub fn list(&self, provider: Provider) -> Vec<String> {
        metadata::list_profiles(&self.provider_dir(provider))
    }

    /// Snapshot the live `AuthFileSet` into `<vault>/<provider>/<name>/…`.
    /// Missing live files are skipped and recorded in `meta.json`.
    pub fn backup(&self, provider: Provider, name: &str) -> Result<(), CaamError> {
        if !metadata::is_valid_profile_name(name) {
            return Err(CaamError::Other(anyhow::anyhow!("invalid profile name: {name}")));
        }
        let lock = self.lock_for(provider, name);
        let _guard = lock.lock().unwrap();

        let snapshot_dir = self.profile_path(provider, name);
        std::fs::create_dir_all(&snapshot_dir).map_err(|e| CaamError::Storage(StorageError::Io(e)))?;

        let set = provider.auth_file_set();
        let mut absent = Vec::new();
        for entry in &set.entries {
            let live = self.home.join(&entry.relative_path);
            let dest = snapshot_dir.join(&entry.relative_path);
            if !live.exists() {
                absent.push(rel_key(&entry.relative_path));
                continue;
            }
            match entry.kind {
                EntryKind::File => {
                    let bytes = std::fs::read(&live).map_err(|e| CaamError::Storage(StorageError::Io(e)))?;
                    atomic_write(&dest, &bytes, 0o600).map_err(|e| CaamError::Storage(StorageError::Io(e)))?;
                }
                EntryKind::Dir => {
                    copy_dir_recursive(&live, &dest).map_err(|e| CaamError::Storage(StorageError::Io(e)))?;
                }
            }
        }

        SnapshotMeta { absent }.save(&snapshot_dir)?;
        Ok(())
    }

    /// Inverse swap: restore `name`'s snapshot into the live
    /// `AuthFileSet`. Transactional: on any failure, the staging
    /// directory's contents are rolled forward back into place so the
    /// live files end up exactly where they started.
    pub fn restore(&self, provider: Provider, name: &str) -> Result<(), CaamError> {
        let lock = self.lock_for(provider, name);
        let _guard = lock.lock().unwrap();

        let snapshot_dir = self.profile_path(provider, name);
        if !snapshot_dir.exists() {
            return Err(CaamError::Storage(StorageError::NotFound(snapshot_dir)));
        }
        let meta = SnapshotMeta::load(&snapshot_dir);
        let set = provider.auth_file_set();

        let txn_id = uuid::Uuid::new_v4().to_string();
        let staging_dir = self.root.join(provider.as_str()).join("staging").join(&txn_id);
        std::fs::create_dir_all(&staging_dir).map_err(|e| CaamError::Storage(StorageError::Io(e)))?;

        // Step 1: move every currently-present live file into staging.
        let mut staged: Vec<StagedEntry> = Vec::new();
        for entry in &set.entries {
            let live = self.home.join(&entry.relative_path);
            let staged_path = staging_dir.join(&entry.relative_path);
            if live.exists() {
                if let Some(parent) = staged_path.parent() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        roll_back(&staged);
                        let _ = std::fs::remove_dir_all(&staging_dir);
                        return Err(swap_err(live, e.to_string(), true));
                    }
                }
                if let Err(e) = rename_or_copy(&live, &staged_path) {
                    roll_back(&staged);
                    let _ = std::fs::remove_dir_all(&staging_dir);
                    return Err(swap_err(live, e.to_string(), true));
                }
                staged.push(StagedEntry { live, staged_path, existed: true });
            } else {
                staged.push(StagedEntry { live, staged_path, existed: false });
            }
        }

        // Step 2: write the new snapshot's contents into the now-empty
        // live paths.
        for entry in &set.entries {
            let live = self.home.join(&entry.relative_path);
            let snap_path = snapshot_dir.join(&entry.relative_path);
            if meta.absent.contains(&rel_key(&entry.relative_path)) || !snap_path.exists() {
                continue;
            }
            let result = match entry.kind {
                EntryKind::File => std::fs::read(&snap_path)
                    .and_then(|bytes| atomic_write(&live, &bytes, 0o600)),
                EntryKind::Dir => copy_dir_recursive(&snap_path, &live),
            };
            if let Err(e) = result {
                roll_back(&staged);
                let _ = std::fs::remove_dir_all(&staging_dir);
                return Err(swap_err(live, e.to_string(), true));
            }
        }

        // Commit.
        let _ = std::fs::remove_dir_all(&staging_dir);
        Ok(())
    }

    /// Identify which snapshot, if any, is byte-identical to the live
    /// files (SHA-256 of every present path). Ties resolve to the
    /// lexicographically smallest profile name.
    pub fn active_profile(&self, provider: Provider) -> Option<String> {
        let set = provider.auth_file_set();
        let live_hashes: HashMap<String, Option<String>> = set
            .entries
            .iter()
            .map(|e| {
                let live = self.home.join(&e.relative_path);
                (rel_key(&e.relative_path), hash_path(&live))
            })
            .collect();

        let mut names = self.list(provider);
        names.sort();
        for name in names {
            let snapshot_dir = self.profile_path(provider, &name);
            let meta = SnapshotMeta::load(&snapshot_dir);
            let mut matches = true;
            for entry in &set.entries {
                let key = rel_key(&entry.relative_path);
                let expect_absent = meta.absent.contains(&key);
                let snap_path = snapshot_dir.join(&entry.relative_path);
                let snap_hash = if expect_absent { None } else { hash_path(&snap_path) };
                if live_hashes.get(&key).cloned().flatten() != snap_hash {
                    matches = false;
                    break;
                }
            }
            if matches {
                return Some(name);
            }
        }
        None
    }

    /// Recompute the `ActiveProfile` SHA-256 comparison for a single
    /// named profile, on demand, without performing a swap. Reports
    /// which tracked paths (if any) differ between the live files and
    /// the stored snapshot.
    pub fn verify(&self, provider: Provider, name: &str) -> Result<ProfileVerification, CaamError> {
        let snapshot_dir = self.profile_path(provider, name);
        if !snapshot_dir.exists() {
            return Err(CaamError::Storage(StorageError::NotFound(snapshot_dir)));
        }
        let meta = SnapshotMeta::load(&snapshot_dir);
        let set = provider.auth_file_set();
        let mut drifted_paths = Vec::new();
        for entry in &set.entries {
            let key = rel_key(&entry.relative_path);
            let live_hash = hash_path(&self.home.join(&entry.relative_path));
            let expect_absent = meta.absent.contains(&key);
            let snap_hash = if expect_absent { None } else { hash_path(&snapshot_dir.join(&entry.relative_path)) };
            if live_hash != snap_hash {
                drifted_paths.push(key);
            }
        }
        Ok(ProfileVerification { matches: drifted_paths.is_empty(), drifted_paths })
    }

    /// Remove a profile's snapshot directory. Refuses system profiles
    /// and profiles currently locked by a live process.
    pub fn delete(&self, provider: Provider, name: &str) -> Result<(), CaamError> {
        if name.starts_with('_') {
            return Err(CaamError::Other(anyhow::anyhow!(
                "refusing to delete system profile {name}"
            )));
        }
        let lock = self.lock_for(provider, name);
        let _guard = lock.lock().unwrap();

        let snapshot_dir = self.profile_path(provider, name);
        let profile = Profile::load(provider, name, snapshot_dir.clone())?;
        if profile.is_locked() {
            return Err(CaamError::Storage(StorageError::Locked(snapshot_dir)));
        }
        if !snapshot_dir.exists() {
            return Err(CaamError::Storage(StorageError::NotFound(snapshot_dir)));
        }
        std::fs::remove_dir_all(&snapshot_dir).map_err(|e| CaamError::Storage(StorageError::Io(e)))
    }
}

struct StagedEntry {
    live: PathBuf,
    staged_path: PathBuf,
    existed: bool,
}

fn swap_err(path: PathBuf, cause: String, rolled_back: bool) -> CaamError {
    CaamError::VaultSwap(VaultSwapError { path, cause, rolled_back })
}

fn roll_back(staged: &[StagedEntry]) {
    for entry in staged.iter().rev() {
        if entry.existed {
            let _ = std::fs::remove_file(&entry.live);
            let _ = std::fs::remove_dir_all(&entry.live);
            let _ = rename_or_copy(&entry.staged_path, &entry.live);
        } else {
            let _ = std::fs::remove_file(&entry.live);
            let _ = std::fs::remove_dir_all(&entry.live);
        }
    }
}

fn rename_or_copy(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        // Cross-device rename: fall back to copy+remove.
        Err(_) => {
            if from.is_dir() {
                copy_dir_recursive(from, to)?;
                std::fs::remove_dir_all(from)
            } else {
                std::fs::copy(from, to)?;
                std::fs::remove_file(from)
            }
        }
    }
}

fn copy_dir_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&src, &dst)?;
        } else {
            let bytes = std::fs::read(&src)?;
            atomic_write(&dst, &bytes, 0o600)?;
        }
    }
    Ok(())
}

fn hash_path(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Some(hex::encode(hasher.finalize()))
}
