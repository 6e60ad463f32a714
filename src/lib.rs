#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::too_many_arguments,
    clippy::too_many_lines,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::similar_names,
    clippy::struct_excessive_bools,
    clippy::multiple_crate_versions,
    dead_code
)]

//! Credential-lifecycle manager for coding-agent CLIs (claude, codex,
//! gemini): a vault of per-profile auth-file snapshots, a watcher that
//! reacts to the provider CLIs' own writes, token-refresh adapters, a
//! health-scored rotation pool, a PTY runner that detects rate limits
//! and hands off to a backup profile mid-session, a background daemon
//! that keeps tokens fresh and takes periodic backups, and a bundle
//! codec for moving a vault between machines.

pub mod activity;
pub mod bundle;
pub mod config;
pub mod daemon;
pub mod error;
pub mod health;
pub mod identity;
pub mod pool;
pub mod projects;
pub mod provider;
pub mod pty;
pub mod refresh;
pub mod signal;
pub mod util;
pub mod vault;
pub mod watcher;

pub use config::Config;

use clap::Subcommand;
use serde::{Deserialize, Serialize};

/// `caam vault <action>` — profile storage, backup/restore/delete.
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum VaultCommands {
    /// List the profiles stored for a provider, marking the active one.
    List { provider: String },
    /// Snapshot a provider's current live auth files into the vault
    /// under `name`, creating or overwriting that profile.
    Backup { provider: String, name: String },
    /// Swap a stored profile back onto the provider's live auth files.
    ///
    /// The profile currently matching the live files is left alone;
    /// `restore` only ever touches the live side, never the vault.
    Restore { provider: String, name: String },
    /// Delete a stored profile. Refuses to delete the active profile.
    Delete { provider: String, name: String },
    /// Print the name of the profile currently matching the live files,
    /// if any.
    Active { provider: String },
    /// Recompute the `ActiveProfile` SHA-256 comparison for a single
    /// profile on demand, surfacing drift without performing a swap.
    Verify { provider: String, name: String },
}

/// `caam pool <action>` — rotation scoring and manual cooldowns.
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PoolCommands {
    /// Show every profile's computed score, health status, and whether
    /// it is currently cooling down, best score first.
    Stats { provider: String },
    /// Pick the next profile the rotator would hand a session to.
    Next { provider: String },
    /// Force a profile into cooldown for `seconds`, keeping the rotator
    /// away from it even if its score would otherwise win.
    Cooldown { provider: String, name: String, seconds: u64 },
}

/// `caam bundle <action>` — portable export/import of a vault.
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BundleCommands {
    /// Write a manifest-checksummed zip of the vault (optionally
    /// password-encrypted) to `dest_dir`.
    Export {
        dest_dir: String,
        /// Restrict the export to these providers (comma-separated).
        /// Every provider is included when omitted.
        #[arg(long, value_delimiter = ',')]
        providers: Vec<String>,
        /// Prompt for a password and encrypt the archive with it.
        #[arg(long)]
        password: bool,
        /// Compute the manifest without writing an archive.
        #[arg(long)]
        dry_run: bool,
    },
    /// Verify and import a bundle produced by `export`.
    Import {
        bundle_path: String,
        /// Prompt for the decryption password if the bundle is
        /// encrypted.
        #[arg(long)]
        password: bool,
        /// One of `replace`, `merge`, `smart` (default).
        #[arg(long, default_value = "smart")]
        mode: String,
        #[arg(long, value_delimiter = ',')]
        providers: Vec<String>,
    },
}

/// `caam project <action>` — directory-scoped default profiles.
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProjectCommands {
    /// Associate a directory with a profile for a provider.
    Set { directory: String, provider: String, profile: String },
    /// Remove a directory's association for a provider.
    Unset { directory: String, provider: String },
    /// List every stored directory association.
    List,
    /// Resolve which profile each provider would use from `directory`,
    /// walking up to the filesystem root.
    Resolve { directory: String },
}

/// `caam daemon <action>` — the background refresh/backup scheduler.
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DaemonCommands {
    /// Run the scheduler in the foreground until a shutdown signal
    /// arrives (SIGTERM/SIGINT); SIGHUP reloads config, SIGUSR1 dumps
    /// pool stats to the log.
    Start {
        /// Write a pid file and refuse to start if a live daemon
        /// already holds it, unless `--force`.
        #[arg(long)]
        pid_file: bool,
        #[arg(long)]
        force: bool,
    },
    /// Report whether a daemon is running, per its pid file.
    Status,
    /// Stop a running daemon by sending it SIGTERM, per its pid file.
    Stop,
}
