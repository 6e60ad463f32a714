//! Profile metadata store: `profile.json` and the advisory `profile.lock`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CaamError, StorageError};
use crate::identity::Identity;
use crate::provider::Provider;
use crate::signal::is_process_alive;
use crate::util::atomic_write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Oauth,
    Apikey,
    Unknown,
}

impl Default for AuthMode {
    fn default() -> Self {
        AuthMode::Unknown
    }
}

/// A named snapshot's metadata record. Distinct from the snapshot
/// itself: this can exist without a snapshot (a stub profile) but is
/// only "live" once the snapshot directory has files in it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    #[serde(skip)]
    pub provider: Provider,
    #[serde(skip)]
    pub name: String,
    #[serde(skip)]
    pub base_path: PathBuf,

    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub auth_mode: AuthMode,
    pub account_label: Option<String>,
    pub identity: Option<Identity>,
    pub browser_command: Option<String>,
    pub browser_profile_dir: Option<String>,
    pub browser_profile_name: Option<String>,
    pub description: Option<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            provider: Provider::Codex,
            name: String::new(),
            base_path: PathBuf::new(),
            created_at: Utc::now(),
            last_used_at: None,
            auth_mode: AuthMode::Unknown,
            account_label: None,
            identity: None,
            browser_command: None,
            browser_profile_dir: None,
            browser_profile_name: None,
            description: None,
        }
    }
}

impl Profile {
    pub fn new(provider: Provider, name: impl Into<String>, base_path: PathBuf) -> Self {
        Self {
            provider,
            name: name.into(),
            base_path,
            ..Default::default()
        }
    }

    fn metadata_file(&self) -> PathBuf {
        self.base_path.join("profile.json")
    }

    fn lock_file(&self) -> PathBuf {
        self.base_path.join("profile.lock")
    }

    /// Load a profile's metadata record from its snapshot directory. A
    /// missing `profile.json` yields a fresh default record rather than
    /// an error — stub profiles are allowed.
    pub fn load(provider: Provider, name: &str, base_path: PathBuf) -> Result<Self, CaamError> {
        let metadata_path = base_path.join("profile.json");
        if !metadata_path.exists() {
            return Ok(Profile::new(provider, name, base_path));
        }
        let raw = fs::read_to_string(&metadata_path)
            .map_err(|e| CaamError::Storage(StorageError::Io(e)))?;
        let mut profile: Profile = serde_json::from_str(&raw).map_err(|e| {
            CaamError::Storage(StorageError::Corrupted(metadata_path.clone(), e.to_string()))
        })?;
        profile.provider = provider;
        profile.name = name.to_string();
        profile.base_path = base_path;
        Ok(profile)
    }

    /// Persist the metadata record atomically (temp+fsync+rename).
    pub fn save(&self) -> Result<(), CaamError> {
        fs::create_dir_all(&self.base_path).map_err(|e| CaamError::Storage(StorageError::Io(e)))?;
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| CaamError::Other(anyhow::anyhow!("encoding profile metadata: {e}")))?;
        atomic_write(&self.metadata_file(), &body, 0o600)
            .map_err(|e| CaamError::Storage(StorageError::Io(e)))?;
        Ok(())
    }

    /// Acquire an advisory lock for this profile, created exclusively
    /// (`O_CREAT|O_EXCL`) and containing the caller's PID. A lock held
    /// by a dead process is treated as stale and reclaimed.
    pub fn lock_with_cleanup(&self) -> Result<ProfileLock, CaamError> {
        use std::io::Write;

        let lock_path = self.lock_file();
        if let Ok(existing) = fs::read_to_string(&lock_path) {
            if let Ok(pid) = existing.trim().parse::<i32>() {
                if is_process_alive(pid) {
                    return Err(CaamError::Concurrency(
                        crate::error::ConcurrencyError::LockContention(
                            self.base_path.display().to_string(),
                        ),
                    ));
                }
            }
            // Stale lock: remove before attempting exclusive create.
            let _ = fs::remove_file(&lock_path);
        }

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    CaamError::Concurrency(crate::error::ConcurrencyError::LockContention(
                        self.base_path.display().to_string(),
                    ))
                } else {
                    CaamError::Storage(StorageError::Io(e))
                }
            })?;
        let pid = std::process::id();
        write!(file, "{pid}").map_err(|e| CaamError::Storage(StorageError::Io(e)))?;

        Ok(ProfileLock {
            path: lock_path,
            acquired_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        })
    }

    /// Whether this profile is currently locked by a live process.
    /// Readers tolerate a missing lock file as unlocked.
    pub fn is_locked(&self) -> bool {
        match fs::read_to_string(self.lock_file()) {
            Ok(contents) => contents
                .trim()
                .parse::<i32>()
                .map(is_process_alive)
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// An acquired advisory lock; dropping it releases the lock file.
pub struct ProfileLock {
    path: PathBuf,
    pub acquired_at: u64,
}

impl ProfileLock {
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ProfileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// List the non-system profile directory names under `<vault>/<provider>`.
/// System profiles (prefixed `_`, e.g. `_original`) are hidden.
pub fn list_profiles(provider_dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let Ok(entries) = fs::read_dir(provider_dir) else {
        return names;
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name == "staging" || name.starts_with('_') {
                continue;
            }
            if is_valid_profile_name(name) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    names
}

/// Profile names are restricted to `[A-Za-z0-9._-]`, and must not be
/// `.` or `..` (which would escape the vault via path traversal).
pub fn is_valid_profile_name(name: &str) -> bool {
    if name.is_empty() || name == "." || name == ".." {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_name_validation_rejects_traversal() {
        assert!(is_valid_profile_name("alice"));
        assert!(is_valid_profile_name("alice@example.com".replace('@', "_").as_str()));
        assert!(!is_valid_profile_name(".."));
        assert!(!is_valid_profile_name("."));
        assert!(!is_valid_profile_name(""));
        assert!(!is_valid_profile_name("a/b"));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("claude").join("alice");
        let mut profile = Profile::new(Provider::Claude, "alice", base.clone());
        profile.description = Some("test account".into());
        profile.save().unwrap();

        let loaded = Profile::load(Provider::Claude, "alice", base).unwrap();
        assert_eq!(loaded.description.as_deref(), Some("test account"));
        assert_eq!(loaded.name, "alice");
    }

    #[test]
    fn loading_missing_metadata_yields_stub_profile() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("codex").join("bob");
        fs::create_dir_all(&base).unwrap();
        let profile = Profile::load(Provider::Codex, "bob", base).unwrap();
        assert_eq!(profile.name, "bob");
        assert!(profile.description.is_none());
    }

    #[test]
    fn lock_with_cleanup_rejects_concurrent_holder() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("codex").join("carol");
        fs::create_dir_all(&base).unwrap();
        let profile = Profile::new(Provider::Codex, "carol", base);

        let lock = profile.lock_with_cleanup().unwrap();
        assert!(profile.is_locked());
        let err = profile.lock_with_cleanup();
        assert!(err.is_err());
        lock.release();
        assert!(!profile.is_locked());
    }

    #[test]
    fn stale_lock_from_dead_pid_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("codex").join("dave");
        fs::create_dir_all(&base).unwrap();
        // PID 999999 is extremely unlikely to be alive in any test sandbox.
        fs::write(base.join("profile.lock"), "999999").unwrap();
        let profile = Profile::new(Provider::Codex, "dave", base);
        assert!(!profile.is_locked());
        let lock = profile.lock_with_cleanup();
        assert!(lock.is_ok());
    }

    #[test]
    fn list_profiles_hides_system_and_staging_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("alice")).unwrap();
        fs::create_dir_all(dir.path().join("_original")).unwrap();
        fs::create_dir_all(dir.path().join("staging")).unwrap();
        let names = list_profiles(dir.path());
        assert_eq!(names, vec!["alice".to_string()]);
    }
}
