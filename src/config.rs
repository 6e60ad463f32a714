//! Runtime configuration: load order, defaults, and environment overrides.
//!
//! Mirrors the load-then-override shape used across the rest of the
//! crate's persistence layer: decode TOML with `#[serde(default)]`
//! everywhere so a partial or missing file behaves like all-defaults,
//! then apply environment variables on top.

use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::provider::Provider;

fn default_refresh_interval_secs() -> u64 {
    300
}

fn default_refresh_threshold_secs() -> u64 {
    1800
}

fn default_backup_interval_secs() -> u64 {
    24 * 3600
}

fn default_keep_last() -> usize {
    7
}

fn default_max_concurrent_refreshes() -> usize {
    3
}

fn default_algorithm() -> String {
    "smart".to_string()
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_health_half_life_secs() -> u64 {
    3600
}

/// Weights for the pool's scoring formula
/// `score = alpha*health - beta*penalty - gamma*recency - delta*cooldown`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PoolWeights {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub delta: f64,
}

impl Default for PoolWeights {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            gamma: 0.5,
            delta: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PoolConfig {
    pub algorithm: String,
    pub weights: PoolWeights,
    pub max_concurrent_refreshes: usize,
    pub cooldown_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            weights: PoolWeights::default(),
            max_concurrent_refreshes: default_max_concurrent_refreshes(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DaemonConfig {
    pub refresh_interval_secs: u64,
    pub refresh_threshold_secs: u64,
    pub pid_file_enabled: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            refresh_threshold_secs: default_refresh_threshold_secs(),
            pid_file_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BackupConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub keep_last: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_backup_interval_secs(),
            keep_last: default_keep_last(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct WatcherConfig {
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

/// Per-provider rate-limit/session-id detection patterns. Kept as
/// configuration rather than code per the spec's open-question
/// resolution: these regexes are brittle and provider-output changes
/// without a crate release.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DetectorPatterns {
    pub rate_limit: Vec<String>,
    pub session_id: Vec<String>,
    pub login_success: Vec<String>,
}

impl DetectorPatterns {
    fn defaults_for(provider: Provider) -> Self {
        match provider {
            Provider::Claude => Self {
                rate_limit: vec![
                    r"(?i)rate limit".to_string(),
                    r"(?i)usage limit reached".to_string(),
                ],
                session_id: vec![],
                login_success: vec![r"(?i)login successful".to_string()],
            },
            Provider::Codex => Self {
                rate_limit: vec![r"(?i)rate limit".to_string(), r"(?i)429".to_string()],
                session_id: vec![r"codex resume ([0-9a-fA-F-]{36})".to_string()],
                login_success: vec![r"(?i)successfully logged in".to_string()],
            },
            Provider::Gemini => Self {
                rate_limit: vec![
                    r"(?i)quota exceeded".to_string(),
                    r"(?i)resource exhausted".to_string(),
                ],
                session_id: vec![],
                login_success: vec![r"(?i)login successful".to_string()],
            },
        }
    }
}

impl Default for DetectorPatterns {
    fn default() -> Self {
        Self {
            rate_limit: vec![],
            session_id: vec![],
            login_success: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ProviderConfig {
    pub token_endpoint_allowlist: Vec<String>,
    pub patterns: DetectorPatterns,
}

impl ProviderConfig {
    fn defaults_for(provider: Provider) -> Self {
        let allowlist = match provider {
            Provider::Claude => vec!["anthropic.com".to_string()],
            Provider::Codex => vec!["openai.com".to_string()],
            Provider::Gemini => vec!["googleapis.com".to_string(), "google.com".to_string()],
        };
        Self {
            token_endpoint_allowlist: allowlist,
            patterns: DetectorPatterns::defaults_for(provider),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            token_endpoint_allowlist: vec![],
            patterns: DetectorPatterns::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ProvidersConfig {
    pub claude: ProviderConfig,
    pub codex: ProviderConfig,
    pub gemini: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            claude: ProviderConfig::defaults_for(Provider::Claude),
            codex: ProviderConfig::defaults_for(Provider::Codex),
            gemini: ProviderConfig::defaults_for(Provider::Gemini),
        }
    }
}

impl ProvidersConfig {
    pub fn get(&self, provider: Provider) -> &ProviderConfig {
        match provider {
            Provider::Claude => &self.claude,
            Provider::Codex => &self.codex,
            Provider::Gemini => &self.gemini,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    /// Vault root directory. Defaults to `<data_home>/caam/vault`.
    pub vault_dir: PathBuf,
    pub pool: PoolConfig,
    pub daemon: DaemonConfig,
    pub backup: BackupConfig,
    pub watcher: WatcherConfig,
    pub providers: ProvidersConfig,
    pub health_half_life_secs: u64,

    /// Computed at load time, never read from the TOML file.
    #[serde(skip)]
    pub config_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vault_dir: default_data_home().join("caam").join("vault"),
            pool: PoolConfig::default(),
            daemon: DaemonConfig::default(),
            backup: BackupConfig::default(),
            watcher: WatcherConfig::default(),
            providers: ProvidersConfig::default(),
            health_half_life_secs: default_health_half_life_secs(),
            config_path: default_config_path(),
        }
    }
}

fn default_data_home() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg);
        }
    }
    directories::BaseDirs::new()
        .map(|b| b.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn caam_home() -> PathBuf {
    if let Ok(home) = std::env::var("CAAM_HOME") {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    default_data_home().join("caam")
}

fn default_config_path() -> PathBuf {
    caam_home().join("config.toml")
}

/// Path of the daemon's PID file: `<CAAM_HOME>/caam.pid`.
pub fn pid_file_path() -> PathBuf {
    caam_home().join("caam.pid")
}

/// Path of the daemon's append-only log file for SIGUSR1 stats dumps.
pub fn daemon_log_path() -> PathBuf {
    caam_home().join("caam.log")
}

impl Config {
    /// Load from `path` (defaulting to the standard location), falling
    /// back to built-in defaults when the file does not exist.
    pub fn load_or_init(path: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = path
            .map(PathBuf::from)
            .unwrap_or_else(default_config_path);

        let mut config = if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str(&raw)?
        } else {
            Config::default()
        };
        config.config_path = config_path;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment-variable overrides on top of whatever was
    /// loaded from disk. `CAAM_HOME`/`XDG_DATA_HOME` only affect the
    /// computed defaults (vault_dir, config/pid/log paths); they do
    /// not override an explicit `vault_dir` set in the config file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("CAAM_VAULT_DIR") {
            if !dir.is_empty() {
                self.vault_dir = PathBuf::from(dir);
            }
        }
    }

    /// Whether accessibility hints request reduced motion/color in the
    /// TUI. The core only normalises these; the TUI consumes them.
    pub fn reduced_motion() -> bool {
        std::env::vars()
            .any(|(k, v)| k.ends_with("_REDUCED_MOTION") && v == "1")
    }

    pub fn no_color() -> bool {
        std::env::var("NO_COLOR").map(|v| !v.is_empty()).unwrap_or(false)
    }
}
