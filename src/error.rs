//! Typed error taxonomy shared across every subsystem.
//!
//! Each subsystem gets its own enum so callers can match on the kind of
//! failure instead of parsing strings. [`CaamError`] composes them for
//! code paths (the CLI, the daemon loop) that need one return type.

use std::path::PathBuf;

use thiserror::Error;

/// Failures touching the vault's on-disk storage (not the swap protocol
/// itself — see [`VaultSwapError`]).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(PathBuf),
    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),
    #[error("locked: {0}")]
    Locked(PathBuf),
    #[error("corrupted: {0}: {reason}", reason = .1)]
    Corrupted(PathBuf, String),
    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A failure during a vault swap (`Backup`/`Restore`). Carries whether the
/// transactional staging rollback succeeded, so callers know if the live
/// files are still consistent.
#[derive(Debug, Error)]
#[error("vault swap failed at {path}: {cause}{}", if *.rolled_back { " (rolled back)" } else { " (NOT rolled back)" })]
pub struct VaultSwapError {
    pub path: PathBuf,
    pub cause: String,
    pub rolled_back: bool,
}

/// Errors from a provider's token-refresh adapter.
#[derive(Debug, Error)]
pub enum RefreshError {
    /// The provider does not support refresh (Claude, by design). Wraps the
    /// provider name so callers can log which provider was skipped.
    #[error("token refresh unsupported for provider {0}")]
    Unsupported(String),
    #[error("refresh endpoint rejected: {0} is not allowlisted")]
    EndpointNotAllowed(String),
    #[error("missing refresh configuration: {0}")]
    MissingConfig(String),
    #[error("refresh endpoint returned HTTP {0}")]
    HttpStatus(u16),
    #[error("failed to decode refresh response: {0}")]
    Decode(String),
    #[error("network error during refresh: {0}")]
    Network(String),
    #[error("refresh timed out")]
    Timeout,
}

/// Errors from the bundle exporter/importer.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("checksum mismatch for {file}: expected {expected_sha}, got {got_sha}")]
    Verification {
        file: String,
        expected_sha: String,
        got_sha: String,
    },
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("decryption failed: {0}")]
    Decryption(String),
    #[error("password required to decrypt bundle")]
    MissingPassword,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
}

/// Errors arising from contention over shared, lockable state.
#[derive(Debug, Error)]
pub enum ConcurrencyError {
    #[error("lock contention on {0}")]
    LockContention(String),
    #[error("operation cancelled")]
    ContextCancelled,
    #[error("shutting down")]
    Shutdown,
}

/// Errors for operations unsupported on the current platform.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("{0} is not supported on this platform")]
    NotSupported(String),
}

/// Top-level error type composing every subsystem's taxonomy, used at
/// API boundaries (CLI commands, daemon loop) that need a single return
/// type while still preserving the underlying typed error for logging.
#[derive(Debug, Error)]
pub enum CaamError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    VaultSwap(#[from] VaultSwapError),
    #[error(transparent)]
    Refresh(#[from] RefreshError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CaamError>;
