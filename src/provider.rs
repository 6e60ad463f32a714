//! Provider identifiers and their static `AuthFileSet` definitions.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A coding-agent CLI this crate manages credentials for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Codex,
    Gemini,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Claude, Provider::Codex, Provider::Gemini];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Codex => "codex",
            Provider::Gemini => "gemini",
        }
    }

    pub fn parse(s: &str) -> Option<Provider> {
        match s.to_ascii_lowercase().as_str() {
            "claude" => Some(Provider::Claude),
            "codex" => Some(Provider::Codex),
            "gemini" => Some(Provider::Gemini),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::parse(s).ok_or_else(|| format!("unknown provider: {s}"))
    }
}

/// What kind of filesystem entry an `AuthFileSetEntry` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// One path in a provider's `AuthFileSet`.
#[derive(Debug, Clone)]
pub struct AuthFileSetEntry {
    /// Path relative to the user's home directory.
    pub relative_path: PathBuf,
    pub kind: EntryKind,
    /// Whether the snapshot must carry this entry for the profile to be
    /// considered complete. Missing live files are always tolerated on
    /// swap; this only affects validation warnings.
    pub required_in_snapshot: bool,
}

/// The static, ordered set of live paths that make up a provider's
/// credentials. Missing live files are allowed on swap; the snapshot
/// records every present live path.
#[derive(Debug, Clone)]
pub struct AuthFileSet {
    pub entries: Vec<AuthFileSetEntry>,
}

fn home_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|b| b.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Provider {
    /// The static `AuthFileSet` for this provider, resolved against the
    /// caller's home directory.
    pub fn auth_file_set(self) -> AuthFileSet {
        let entries = match self {
            Provider::Codex => vec![AuthFileSetEntry {
                relative_path: PathBuf::from(".codex/auth.json"),
                kind: EntryKind::File,
                required_in_snapshot: true,
            }],
            Provider::Claude => vec![
                AuthFileSetEntry {
                    relative_path: PathBuf::from(".claude/.credentials.json"),
                    kind: EntryKind::File,
                    required_in_snapshot: true,
                },
                AuthFileSetEntry {
                    relative_path: PathBuf::from(".claude.json"),
                    kind: EntryKind::File,
                    required_in_snapshot: false,
                },
                AuthFileSetEntry {
                    relative_path: PathBuf::from(".claude/config"),
                    kind: EntryKind::Dir,
                    required_in_snapshot: false,
                },
            ],
            Provider::Gemini => vec![
                AuthFileSetEntry {
                    relative_path: PathBuf::from(".gemini/settings.json"),
                    kind: EntryKind::File,
                    required_in_snapshot: true,
                },
                AuthFileSetEntry {
                    relative_path: PathBuf::from(".gemini/oauth_creds.json"),
                    kind: EntryKind::File,
                    required_in_snapshot: true,
                },
            ],
        };
        AuthFileSet { entries }
    }

    /// Relative path (under the live home / a vault snapshot) of the
    /// file carrying the OAuth token payload the refresh adapters and
    /// the daemon's refresh scan operate on.
    pub fn primary_credential_path(self) -> PathBuf {
        match self {
            Provider::Codex => PathBuf::from(".codex/auth.json"),
            Provider::Claude => PathBuf::from(".claude/.credentials.json"),
            Provider::Gemini => PathBuf::from(".gemini/oauth_creds.json"),
        }
    }
}

impl AuthFileSet {
    /// Resolve every entry's absolute live path under `home`.
    pub fn live_paths(&self, home: &Path) -> Vec<PathBuf> {
        self.entries
            .iter()
            .map(|e| home.join(&e.relative_path))
            .collect()
    }
}

/// The live home directory used to resolve `AuthFileSet` entries. A
/// thin wrapper so tests can redirect it without touching the real
/// home directory.
#[derive(Debug, Clone)]
pub struct HomeDir(pub PathBuf);

impl Default for HomeDir {
    fn default() -> Self {
        HomeDir(home_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_round_trips_through_string() {
        for p in Provider::ALL {
            assert_eq!(Provider::parse(p.as_str()), Some(p));
        }
        assert_eq!(Provider::parse("CODEX"), Some(Provider::Codex));
        assert_eq!(Provider::parse("bogus"), None);
    }

    #[test]
    fn each_provider_has_a_non_empty_auth_file_set() {
        for p in Provider::ALL {
            let set = p.auth_file_set();
            assert!(!set.entries.is_empty());
        }
    }

    #[test]
    fn primary_credential_path_is_one_of_the_auth_file_set_entries() {
        for p in Provider::ALL {
            let set = p.auth_file_set();
            let primary = p.primary_credential_path();
            assert!(set.entries.iter().any(|e| e.relative_path == primary));
        }
    }

    #[test]
    fn live_paths_resolve_relative_to_home() {
        let home = PathBuf::from("/home/u");
        let set = Provider::Codex.auth_file_set();
        let paths = set.live_paths(&home);
        assert_eq!(paths, vec![PathBuf::from("/home/u/.codex/auth.json")]);
    }
}
