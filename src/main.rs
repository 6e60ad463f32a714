#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::too_many_arguments,
    clippy::too_many_lines,
    clippy::cast_possible_truncation,
    clippy::similar_names
)]

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, shells};

use caam::activity::ActivityLog;
use caam::bundle::{self, ExportOptions, ImportMode};
use caam::config::Config;
use caam::daemon::{self, DaemonContext};
use caam::error::{CaamError, RefreshError};
#[cfg(not(unix))]
use caam::error::PlatformError;
use caam::health::HealthStore;
use caam::pool::AuthPool;
use caam::projects::ProjectStore;
use caam::provider::{HomeDir, Provider};
use caam::pty::{PtyRunner, RunnerEvent, RunnerOptions, RunnerState};
use caam::signal;
use caam::vault::Vault;
use caam::watcher::VaultWatcher;
use caam::{BundleCommands, DaemonCommands, PoolCommands, ProjectCommands, VaultCommands};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// Credential-lifecycle manager for claude, codex and gemini.
#[derive(Parser, Debug)]
#[command(name = "caam")]
#[command(version)]
#[command(about = "Vault, rotate, refresh and back up coding-agent CLI credentials", long_about = None)]
struct Cli {
    /// Path to a config.toml; defaults to the standard data directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Profile storage: list, backup, restore, delete, show the active one.
    Vault {
        #[command(subcommand)]
        action: VaultCommands,
    },
    /// Rotation scoring and manual cooldowns.
    Pool {
        #[command(subcommand)]
        action: PoolCommands,
    },
    /// Portable export/import of a vault.
    Bundle {
        #[command(subcommand)]
        action: BundleCommands,
    },
    /// Directory-scoped default profiles.
    Project {
        #[command(subcommand)]
        action: ProjectCommands,
    },
    /// The background refresh/backup scheduler.
    Daemon {
        #[command(subcommand)]
        action: DaemonCommands,
    },
    /// Run a coding-agent CLI under the smart PTY runner, handing off to
    /// a backup profile automatically when it reports a rate limit.
    Run {
        provider: String,
        profile: String,
        program: String,
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
        /// Command line to inject once a backup profile is swapped in,
        /// before the session is declared ready again.
        #[arg(long)]
        login_command: Option<String>,
        #[arg(long, default_value_t = 120)]
        login_timeout_secs: u64,
    },
    /// Aggregate activity-log counts since a point in the past.
    Activity {
        #[arg(long)]
        provider: Option<String>,
        #[arg(long, default_value_t = 24)]
        since_hours: i64,
    },
    /// Watch the vault and print profile events until interrupted.
    Watch,
    /// Generate shell completion scripts.
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

fn write_shell_completion(shell: CompletionShell, writer: &mut dyn std::io::Write) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, name, writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, name, writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, name, writer),
        CompletionShell::PowerShell => generate(shells::PowerShell, &mut cmd, name, writer),
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, name, writer),
    }
}

fn parse_provider(s: &str) -> anyhow::Result<Provider> {
    Provider::parse(s).ok_or_else(|| anyhow::anyhow!("unknown provider: {s} (expected claude, codex or gemini)"))
}

fn parse_providers(list: &[String]) -> anyhow::Result<Option<Vec<Provider>>> {
    if list.is_empty() {
        return Ok(None);
    }
    let mut out = Vec::with_capacity(list.len());
    for s in list {
        out.push(parse_provider(s)?);
    }
    Ok(Some(out))
}

fn caam_home_from(config: &Config) -> PathBuf {
    config
        .config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Shared handles almost every command needs: the vault, health store
/// and pool, constructed once per invocation.
struct Handles {
    vault: Arc<Vault>,
    health: Arc<HealthStore>,
    pool: Arc<AuthPool>,
    caam_home: PathBuf,
}

fn open_handles(config: &Config) -> anyhow::Result<Handles> {
    let caam_home = caam_home_from(config);
    let home = HomeDir::default().0;
    let vault = Arc::new(Vault::new(config.vault_dir.clone(), home));
    let health = Arc::new(HealthStore::open(&config.vault_dir, config.health_half_life_secs)?);
    let pool = Arc::new(AuthPool::new(
        vault.clone(),
        health.clone(),
        config.pool.clone(),
        config.health_half_life_secs,
    ));
    Ok(Handles { vault, health, pool, caam_home })
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    let Some(caam_err) = err.downcast_ref::<CaamError>() else {
        return 2;
    };
    match caam_err {
        CaamError::Refresh(RefreshError::Network(_) | RefreshError::HttpStatus(_) | RefreshError::Timeout) => 3,
        _ => 2,
    }
}

fn main() -> ExitCode {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        write_shell_completion(shell, &mut std::io::stdout());
        return ExitCode::SUCCESS;
    }

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("caam: failed to start async runtime: {e}");
            return ExitCode::from(2);
        }
    };

    match rt.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("caam: error: {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load_or_init(cli.config.as_deref())?;

    match cli.command {
        Commands::Completions { .. } => unreachable!("handled before config load"),
        Commands::Vault { action } => run_vault(&config, action).await,
        Commands::Pool { action } => run_pool(&config, action).await,
        Commands::Bundle { action } => run_bundle(&config, action).await,
        Commands::Project { action } => run_project(&config, action).await,
        Commands::Daemon { action } => run_daemon(config, action).await,
        Commands::Run { provider, profile, program, args, login_command, login_timeout_secs } => {
            run_pty(&config, &provider, &profile, &program, &args, login_command, login_timeout_secs).await
        }
        Commands::Activity { provider, since_hours } => run_activity(&config, provider, since_hours).await,
        Commands::Watch => run_watch(&config).await,
    }
}

async fn run_vault(config: &Config, action: VaultCommands) -> anyhow::Result<()> {
    let handles = open_handles(config)?;
    match action {
        VaultCommands::List { provider } => {
            let provider = parse_provider(&provider)?;
            let active = handles.vault.active_profile(provider);
            for name in handles.vault.list(provider) {
                let marker = if active.as_deref() == Some(name.as_str()) { "*" } else { " " };
                println!("{marker} {name}");
            }
        }
        VaultCommands::Backup { provider, name } => {
            let provider = parse_provider(&provider)?;
            handles.vault.backup(provider, &name)?;
            println!("backed up {provider} live credentials into profile {name:?}");
        }
        VaultCommands::Restore { provider, name } => {
            let provider = parse_provider(&provider)?;
            handles.vault.restore(provider, &name)?;
            println!("restored {provider} profile {name:?} onto the live files");
        }
        VaultCommands::Delete { provider, name } => {
            let provider = parse_provider(&provider)?;
            handles.vault.delete(provider, &name)?;
            println!("deleted {provider} profile {name:?}");
        }
        VaultCommands::Active { provider } => {
            let provider = parse_provider(&provider)?;
            match handles.vault.active_profile(provider) {
                Some(name) => println!("{name}"),
                None => println!("(none)"),
            }
        }
        VaultCommands::Verify { provider, name } => {
            let provider = parse_provider(&provider)?;
            let result = handles.vault.verify(provider, &name)?;
            if result.matches {
                println!("{provider} profile {name:?} matches the live files");
            } else {
                println!("{provider} profile {name:?} has drifted:");
                for path in &result.drifted_paths {
                    println!("  {path}");
                }
            }
        }
    }
    Ok(())
}

async fn run_pool(config: &Config, action: PoolCommands) -> anyhow::Result<()> {
    let handles = open_handles(config)?;
    match action {
        PoolCommands::Stats { provider } => {
            let provider = parse_provider(&provider)?;
            for score in handles.pool.stats(provider) {
                println!(
                    "{:<24} score={:>7.3} status={:?} cooling_down={}",
                    score.name, score.score, score.status, score.cooling_down
                );
            }
        }
        PoolCommands::Next { provider } => {
            let provider = parse_provider(&provider)?;
            match handles.pool.next(provider, None) {
                Some(name) => println!("{name}"),
                None => println!("(no backup profile available)"),
            }
        }
        PoolCommands::Cooldown { provider, name, seconds } => {
            let provider = parse_provider(&provider)?;
            handles.pool.mark_cooling_down(provider, &name, chrono::Duration::seconds(seconds as i64))?;
            println!("{provider} profile {name:?} cooling down for {seconds}s");
        }
    }
    Ok(())
}

async fn run_bundle(config: &Config, action: BundleCommands) -> anyhow::Result<()> {
    let handles = open_handles(config)?;
    match action {
        BundleCommands::Export { dest_dir, providers, password, dry_run } => {
            let providers = parse_providers(&providers)?;
            let password = if password {
                Some(dialoguer::Password::new().with_prompt("bundle password").interact()?)
            } else {
                None
            };
            let opts = ExportOptions {
                providers,
                dry_run,
                password,
                ..ExportOptions::default()
            };
            let (manifest, path) = bundle::export(&handles.vault, Path::new(&dest_dir), &opts)?;
            println!("exported {} profiles", manifest.contents.vault.total_profiles);
            if let Some(path) = path {
                println!("wrote {}", path.display());
            } else {
                println!("dry run: no archive written");
            }
        }
        BundleCommands::Import { bundle_path, password, mode, providers } => {
            let providers = parse_providers(&providers)?;
            let mode = match mode.as_str() {
                "replace" => ImportMode::Replace,
                "merge" => ImportMode::Merge,
                "smart" => ImportMode::Smart,
                other => anyhow::bail!("unknown import mode: {other} (expected replace, merge or smart)"),
            };
            let password = if password {
                Some(dialoguer::Password::new().with_prompt("bundle password").interact()?)
            } else {
                None
            };
            let summary = bundle::import(&handles.vault, Path::new(&bundle_path), password.as_deref(), mode, providers.as_deref())?;
            println!(
                "imported {} profiles, merged {}, skipped {}",
                summary.imported.len(),
                summary.merged.len(),
                summary.skipped.len()
            );
        }
    }
    Ok(())
}

async fn run_project(config: &Config, action: ProjectCommands) -> anyhow::Result<()> {
    let caam_home = caam_home_from(config);
    let store = ProjectStore::open(caam_home.join("projects.json"));
    match action {
        ProjectCommands::Set { directory, provider, profile } => {
            let provider = parse_provider(&provider)?;
            store.set(Path::new(&directory), provider, &profile)?;
            println!("{directory} -> {provider}: {profile}");
        }
        ProjectCommands::Unset { directory, provider } => {
            let provider = parse_provider(&provider)?;
            store.unset(Path::new(&directory), provider)?;
            println!("removed {provider} association for {directory}");
        }
        ProjectCommands::List => {
            for (dir, providers) in store.list()? {
                for (provider, profile) in providers {
                    println!("{dir}\t{provider}\t{profile}");
                }
            }
        }
        ProjectCommands::Resolve { directory } => {
            let resolved = store.resolve(Path::new(&directory))?;
            for provider in Provider::ALL {
                let profile = resolved.profiles.get(&provider).map(String::as_str).unwrap_or("(none)");
                let source = resolved.sources.get(&provider).map(String::as_str).unwrap_or("(none)");
                println!("{provider}\t{profile}\tvia {source}");
            }
        }
    }
    Ok(())
}

async fn run_daemon(config: Config, action: DaemonCommands) -> anyhow::Result<()> {
    match action {
        DaemonCommands::Start { pid_file, force } => {
            let handles = open_handles(&config)?;
            let activity = ActivityLog::open(handles.caam_home.join("activity.db"))?;
            let watcher = VaultWatcher::start(config.vault_dir.clone(), Duration::from_millis(config.watcher.debounce_ms))?;
            let pid_path = (pid_file || config.daemon.pid_file_enabled).then(caam::config::pid_file_path);
            let ctx = DaemonContext {
                vault: handles.vault,
                health: handles.health,
                pool: handles.pool,
                activity,
                watcher,
                config,
                caam_home: handles.caam_home,
            };
            daemon::run(ctx, pid_path, force).await?;
        }
        DaemonCommands::Status => {
            let pid_path = caam::config::pid_file_path();
            match signal::read_pid_file(&pid_path) {
                Some(pid) if signal::is_process_alive(pid as i32) => println!("running (pid {pid})"),
                Some(pid) => println!("stale pid file (pid {pid} not alive)"),
                None => println!("not running"),
            }
        }
        DaemonCommands::Stop => {
            let pid_path = caam::config::pid_file_path();
            let Some(pid) = signal::read_pid_file(&pid_path) else {
                println!("not running");
                return Ok(());
            };
            #[cfg(unix)]
            {
                if signal::is_process_alive(pid as i32) {
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                    println!("sent SIGTERM to pid {pid}");
                } else {
                    println!("stale pid file (pid {pid} not alive)");
                }
            }
            #[cfg(not(unix))]
            {
                return Err(CaamError::Platform(PlatformError::NotSupported("stopping the daemon by signal".to_string())).into());
            }
        }
    }
    Ok(())
}

async fn run_pty(
    config: &Config,
    provider: &str,
    profile: &str,
    program: &str,
    args: &[String],
    login_command: Option<String>,
    login_timeout_secs: u64,
) -> anyhow::Result<()> {
    let provider = parse_provider(provider)?;
    let handles = open_handles(config)?;

    let opts = RunnerOptions {
        login_timeout: Duration::from_secs(login_timeout_secs),
        ..RunnerOptions::default()
    };
    let patterns = config.providers.get(provider).patterns.clone();
    let runner = PtyRunner::spawn(provider, profile, program, args, &patterns, &opts)?;

    let mut stdout_rx = runner.take_output();
    let stdout_task = stdout_rx.take().map(|mut rx| {
        tokio::spawn(async move {
            let mut stdout = std::io::stdout();
            while let Some(chunk) = rx.recv().await {
                let _ = stdout.write_all(&chunk);
                let _ = stdout.flush();
            }
        })
    });

    loop {
        if runner.state() == RunnerState::Running {
            if let Some(RunnerEvent::RateLimited(line)) = runner.poll_event() {
                tracing::info!(%line, "rate limit detected, handing off to backup profile");
                match runner.handle_rate_limit(&handles.pool, &handles.vault, login_command.as_deref(), &opts) {
                    Ok(RunnerState::Running) => tracing::info!(profile = %runner.active_profile(), "handoff complete"),
                    Ok(state) => tracing::warn!(?state, "handoff did not complete cleanly"),
                    Err(e) => tracing::error!(error = %e, "handoff failed"),
                }
            }
        }
        if matches!(runner.state(), RunnerState::ManualMode | RunnerState::HandoffFailed) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let status = tokio::task::spawn_blocking(move || runner.wait()).await??;
    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if !status.success() {
        anyhow::bail!("child exited with status {status:?}");
    }
    Ok(())
}

async fn run_activity(config: &Config, provider: Option<String>, since_hours: i64) -> anyhow::Result<()> {
    let caam_home = caam_home_from(config);
    let provider = provider.map(|p| parse_provider(&p)).transpose()?;
    let since = chrono::Utc::now() - chrono::Duration::hours(since_hours);
    let summaries = ActivityLog::report(caam_home.join("activity.db"), provider, since).await?;
    for s in summaries {
        println!("{}\t{}\t{}\tcount={}\tsuccess={}", s.provider, s.profile, s.kind, s.count, s.success_count);
    }
    Ok(())
}

async fn run_watch(config: &Config) -> anyhow::Result<()> {
    let mut watcher = VaultWatcher::start(config.vault_dir.clone(), Duration::from_millis(config.watcher.debounce_ms))?;
    println!("watching {} (Ctrl-C to stop)", config.vault_dir.display());
    loop {
        tokio::select! {
            Some(event) = watcher.events().recv() => {
                println!("{event:?}");
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }
    watcher.close();
    Ok(())
}
