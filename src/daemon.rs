//! Background daemon: a refresh-scan loop and a backup-scheduler loop,
//! wired to Unix signals (`SIGHUP` reload, `SIGUSR1` stats dump,
//! `SIGTERM`/`SIGINT` graceful shutdown) and a PID file.
//!
//! Grounded in `pool.rs`'s single-flight/semaphore gating for
//! serializing concurrent refreshes, and `activity.rs`'s
//! channel-plus-ticker shape for the two independent timer loops.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::activity::{ActivityEvent, ActivityLog};
use crate::bundle::{self, ExportOptions};
use crate::config::Config;
use crate::error::{CaamError, StorageError};
use crate::health::HealthStore;
use crate::pool::AuthPool;
use crate::provider::Provider;
use crate::refresh::claude::ClaudeRefresher;
use crate::refresh::codex::CodexRefresher;
use crate::refresh::gemini::GeminiRefresher;
use crate::refresh::{http_client, update_auth_file, Refresher};
use crate::signal;
use crate::util::atomic_write;
use crate::vault::Vault;
use crate::watcher::VaultWatcher;

fn refresher_for(provider: Provider) -> Box<dyn Refresher> {
    match provider {
        Provider::Claude => Box::new(ClaudeRefresher::default()),
        Provider::Codex => Box::new(CodexRefresher::default()),
        Provider::Gemini => Box::new(GeminiRefresher::default()),
    }
}

/// Persisted state for the backup scheduler, written next to the
/// config file so `caam daemon status` can report it without the
/// daemon running.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupState {
    pub last_backup: Option<DateTime<Utc>>,
    pub last_backup_path: Option<PathBuf>,
    pub backup_count: u64,
    pub last_error: Option<String>,
}

impl BackupState {
    fn path(caam_home: &Path) -> PathBuf {
        caam_home.join("backup_state.json")
    }

    pub fn load(caam_home: &Path) -> Self {
        std::fs::read_to_string(Self::path(caam_home))
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn save(&self, caam_home: &Path) -> Result<(), CaamError> {
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| CaamError::Other(anyhow::anyhow!("encoding backup state: {e}")))?;
        atomic_write(&Self::path(caam_home), &body, 0o600).map_err(|e| CaamError::Storage(StorageError::Io(e)))
    }
}

/// Extract a `refresh_token` from a provider's credential JSON,
/// regardless of which key style (`snake_case`, `camelCase`, or
/// Claude's nested `claudeAiOauth`) the file uses.
fn extract_refresh_token(raw: &Value) -> Option<String> {
    if let Some(oauth) = raw.get("claudeAiOauth") {
        if let Some(t) = oauth.get("refreshToken").and_then(Value::as_str) {
            return Some(t.to_string());
        }
    }
    raw.get("refresh_token")
        .or_else(|| raw.get("refreshToken"))
        .and_then(Value::as_str)
        .map(String::from)
}

/// Refresh one profile's token in place in its vault snapshot, then,
/// if that profile is the one currently live, push the refreshed
/// credential back out through the vault's normal swap path so the
/// running child sees it too.
async fn refresh_one(
    vault: &Vault,
    provider: Provider,
    name: &str,
    refresher: &dyn Refresher,
    client: &reqwest::Client,
    allowlist: &[String],
) -> Result<Option<DateTime<Utc>>, CaamError> {
    let credential_path = vault.profile_path(provider, name).join(provider.primary_credential_path());
    let raw_text = std::fs::read_to_string(&credential_path).map_err(|e| CaamError::Storage(StorageError::Io(e)))?;
    let raw: Value = serde_json::from_str(&raw_text)
        .map_err(|e| CaamError::Storage(StorageError::Corrupted(credential_path.clone(), e.to_string())))?;

    let Some(refresh_token) = extract_refresh_token(&raw) else {
        return Err(CaamError::Refresh(crate::error::RefreshError::Decode(
            "credential file has no refresh token".to_string(),
        )));
    };

    let response = refresher.refresh(client, &refresh_token, allowlist).await?;
    update_auth_file(&credential_path, &response)?;

    if vault.active_profile(provider).as_deref() == Some(name) {
        vault.restore(provider, name)?;
    }

    Ok(response.expires_at)
}

/// One pass over every provider's profiles: refresh whichever ones are
/// within `threshold` of expiry (or have no known expiry at all),
/// serialized per-profile and capped pool-wide by the pool's
/// concurrent-refresh semaphore.
pub async fn refresh_scan(
    vault: &Vault,
    health: &HealthStore,
    pool: &AuthPool,
    config: &Config,
    activity: &ActivityLog,
    threshold: Duration,
) {
    let client = http_client();
    let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::seconds(1800));

    for provider in Provider::ALL {
        let refresher = refresher_for(provider);
        let allowlist = config.providers.get(provider).token_endpoint_allowlist.clone();

        for name in vault.list(provider) {
            let due = match health.get_profile(provider, &name) {
                Some(record) => record
                    .token_expires_at
                    .map(|expires_at| expires_at - Utc::now() <= threshold)
                    .unwrap_or(true),
                None => true,
            };
            if !due {
                continue;
            }

            let _permit = pool.acquire_refresh_permit().await;
            let outcome = pool
                .single_flight(provider, &name, || refresh_one(vault, provider, &name, refresher.as_ref(), &client, &allowlist))
                .await;

            match outcome {
                Ok(expires_at) => {
                    let _ = health.record_refresh(provider, &name, expires_at);
                    activity.record(ActivityEvent::now(provider, name.clone(), "refresh", true));
                }
                Err(CaamError::Refresh(crate::error::RefreshError::Unsupported(_))) => {
                    // Claude's refresh is permanently disabled; not a failure.
                }
                Err(e) => {
                    let _ = health.record_error(provider, &name, "refresh");
                    activity.record(ActivityEvent::now(provider, name.clone(), "refresh", false).with_detail(e.to_string()));
                    tracing::warn!(provider = %provider, profile = %name, error = %e, "refresh failed");
                }
            }
        }
    }
}

fn rotate_backups(backup_dir: &Path, keep_last: usize) {
    let Ok(entries) = std::fs::read_dir(backup_dir) else {
        return;
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "zip").unwrap_or(false))
        .collect();
    // Filenames carry a sortable `YYYY-MM-DD_HHMM` timestamp, so
    // lexicographic order is chronological order.
    files.sort();
    if files.len() > keep_last {
        for old in &files[..files.len() - keep_last] {
            let _ = std::fs::remove_file(old);
        }
    }
}

/// Run one backup: export every provider into a timestamped zip under
/// `<caam_home>/backups/`, update and persist `BackupState`, and
/// rotate old backups down to `config.backup.keep_last`.
pub fn run_backup_once(vault: &Vault, caam_home: &Path, keep_last: usize) -> BackupState {
    let mut state = BackupState::load(caam_home);
    let backup_dir = caam_home.join("backups");
    if let Err(e) = std::fs::create_dir_all(&backup_dir) {
        state.last_error = Some(e.to_string());
        let _ = state.save(caam_home);
        return state;
    }

    match bundle::export(vault, &backup_dir, &ExportOptions::default()) {
        Ok((_manifest, Some(path))) => {
            state.last_backup = Some(Utc::now());
            state.last_backup_path = Some(path);
            state.backup_count += 1;
            state.last_error = None;
            rotate_backups(&backup_dir, keep_last);
        }
        Ok((_manifest, None)) => {
            state.last_error = Some("export produced no archive (dry_run set?)".to_string());
        }
        Err(e) => {
            state.last_error = Some(e.to_string());
        }
    }
    let _ = state.save(caam_home);
    state
}

/// Shared handles the daemon's loop needs. Constructed by the CLI
/// entry point once at startup.
pub struct DaemonContext {
    pub vault: Arc<Vault>,
    pub health: Arc<HealthStore>,
    pub pool: Arc<AuthPool>,
    pub activity: ActivityLog,
    pub watcher: VaultWatcher,
    pub config: Config,
    pub caam_home: PathBuf,
}

/// Run until a shutdown signal arrives (or `force_iterations` rounds
/// complete, for tests). Drains the activity log and closes the
/// watcher before returning.
pub async fn run(mut ctx: DaemonContext, pid_path: Option<PathBuf>, force: bool) -> Result<(), CaamError> {
    if let Some(pid_path) = &pid_path {
        if let Some(holder) = signal::pid_file_conflicts(pid_path) {
            if !force {
                return Err(CaamError::Other(anyhow::anyhow!(
                    "daemon already running with pid {holder} (use --force to override)"
                )));
            }
        }
        signal::write_pid_file(pid_path, std::process::id())?;
    }

    let mut handler = signal::install_signal_handler()?;

    let mut refresh_ticker = interval(Duration::from_secs(ctx.config.daemon.refresh_interval_secs.max(1)));
    refresh_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut backup_ticker = interval(Duration::from_secs(ctx.config.backup.interval_secs.max(1)));
    backup_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let threshold = Duration::from_secs(ctx.config.daemon.refresh_threshold_secs);

    loop {
        tokio::select! {
            _ = refresh_ticker.tick() => {
                refresh_scan(&ctx.vault, &ctx.health, &ctx.pool, &ctx.config, &ctx.activity, threshold).await;
            }
            _ = backup_ticker.tick(), if ctx.config.backup.enabled => {
                let vault = ctx.vault.clone();
                let caam_home = ctx.caam_home.clone();
                let keep_last = ctx.config.backup.keep_last;
                let state = tokio::task::spawn_blocking(move || run_backup_once(&vault, &caam_home, keep_last)).await;
                if let Ok(state) = state {
                    if let Some(err) = &state.last_error {
                        tracing::warn!(error = %err, "scheduled backup failed");
                    }
                }
            }
            Some(event) = ctx.watcher.events().recv() => {
                tracing::debug!(?event, "vault change observed");
            }
            Some(()) = handler.reload.recv() => {
                match Config::load_or_init(Some(&ctx.config.config_path.clone())) {
                    Ok(mut reloaded) => {
                        reloaded.apply_env_overrides();
                        ctx.config = reloaded;
                        tracing::info!("configuration reloaded");
                    }
                    Err(e) => tracing::error!(error = %e, "failed to reload configuration"),
                }
            }
            Some(()) = handler.dump_stats.recv() => {
                for provider in Provider::ALL {
                    for score in ctx.pool.stats(provider) {
                        tracing::info!(provider = %provider, profile = %score.name, status = ?score.status, score = score.score, "stats");
                    }
                }
            }
            Some(()) = handler.shutdown.recv() => break,
        }
    }

    ctx.watcher.close();
    ctx.activity.shutdown().await;
    if let Some(pid_path) = &pid_path {
        signal::remove_pid_file(pid_path);
    }
    Ok(())
}
