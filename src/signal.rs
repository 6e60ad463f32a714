//! PID file lifecycle and Unix signal routing for the daemon.

use std::path::{Path, PathBuf};

use crate::error::{CaamError, StorageError};
use crate::util::{atomic_write, create_dir_with_mode};

/// Write `"<pid>\n"` atomically to `path`, creating parent directories
/// with mode 0700 first.
pub fn write_pid_file(path: &Path, pid: u32) -> Result<(), CaamError> {
    if let Some(parent) = path.parent() {
        create_dir_with_mode(parent, 0o700).map_err(|e| CaamError::Storage(StorageError::Io(e)))?;
    }
    atomic_write(path, format!("{pid}\n").as_bytes(), 0o600)
        .map_err(|e| CaamError::Storage(StorageError::Io(e)))?;
    Ok(())
}

/// Parse a PID file's contents. Rejects `0`, negative numbers, and
/// non-numeric content.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    let raw = std::fs::read_to_string(path).ok()?;
    let pid: i64 = raw.trim().parse().ok()?;
    if pid <= 0 {
        None
    } else {
        u32::try_from(pid).ok()
    }
}

/// Idempotent: a missing PID file is success.
pub fn remove_pid_file(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Decide whether startup should refuse to take over an existing PID
/// file: it refuses only when the recorded PID is alive and belongs to
/// a different process than the caller.
pub fn pid_file_conflicts(path: &Path) -> Option<u32> {
    let existing = read_pid_file(path)?;
    if existing == std::process::id() {
        return None;
    }
    if is_process_alive(existing as i32) {
        Some(existing)
    } else {
        None
    }
}

/// Non-positive PIDs are never alive. Otherwise send signal 0: success
/// or `EPERM` (a process we don't own) both mean "alive"; anything
/// else means "not alive".
#[cfg(unix)]
pub fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: sending signal 0 performs no action beyond existence/permission
    // checks on the target PID; it cannot affect the target process.
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    let errno = std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(0);
    errno == libc::EPERM
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: i32) -> bool {
    false
}

/// Outcomes routed by the daemon's Unix signal handler. `Reload`,
/// `DumpStats`, and `Shutdown` each have a dedicated capacity-1
/// channel; a signal arriving while the previous one of the same kind
/// is unconsumed is simply dropped (the daemon will handle the next
/// tick's stale request the same as a fresh one for Reload/DumpStats,
/// and repeated Shutdown requests are idempotent by nature).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Reload,
    DumpStats,
    Shutdown,
}

/// Holds the receiving ends of the daemon's signal channels. A `None`
/// handler (e.g. on a platform without Unix signals) makes every
/// accessor act as if no signal ever arrives.
pub struct SignalHandler {
    pub reload: tokio::sync::mpsc::Receiver<()>,
    pub dump_stats: tokio::sync::mpsc::Receiver<()>,
    pub shutdown: tokio::sync::mpsc::Receiver<()>,
}

#[cfg(unix)]
pub fn install_signal_handler() -> anyhow::Result<SignalHandler> {
    use tokio::signal::unix::{signal, SignalKind as UnixSignalKind};

    let (reload_tx, reload_rx) = tokio::sync::mpsc::channel(1);
    let (dump_tx, dump_rx) = tokio::sync::mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel(1);

    let mut hangup = signal(UnixSignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            let _ = reload_tx.try_send(());
        }
    });

    let mut user1 = signal(UnixSignalKind::user_defined1())?;
    tokio::spawn(async move {
        while user1.recv().await.is_some() {
            let _ = dump_tx.try_send(());
        }
    });

    let mut term = signal(UnixSignalKind::terminate())?;
    let mut interrupt = signal(UnixSignalKind::interrupt())?;
    let shutdown_tx2 = shutdown_tx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                s = term.recv() => { if s.is_none() { break; } let _ = shutdown_tx.try_send(()); }
                s = interrupt.recv() => { if s.is_none() { break; } let _ = shutdown_tx2.try_send(()); }
            }
        }
    });

    Ok(SignalHandler {
        reload: reload_rx,
        dump_stats: dump_rx,
        shutdown: shutdown_rx,
    })
}

pub fn default_pid_path() -> PathBuf {
    crate::config::pid_file_path()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caam.pid");
        write_pid_file(&path, 4242).unwrap();
        assert_eq!(read_pid_file(&path), Some(4242));
    }

    #[test]
    fn read_pid_file_rejects_invalid_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caam.pid");
        std::fs::write(&path, "0").unwrap();
        assert_eq!(read_pid_file(&path), None);
        std::fs::write(&path, "-5").unwrap();
        assert_eq!(read_pid_file(&path), None);
        std::fs::write(&path, "not-a-number").unwrap();
        assert_eq!(read_pid_file(&path), None);
    }

    #[test]
    fn remove_pid_file_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.pid");
        assert!(remove_pid_file(&path).is_ok());
        assert!(remove_pid_file(&path).is_ok());
    }

    #[test]
    fn is_process_alive_rejects_non_positive() {
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(-1));
    }

    #[test]
    fn is_process_alive_true_for_self() {
        assert!(is_process_alive(std::process::id() as i32));
    }

    #[test]
    fn pid_file_conflict_detection_ignores_self_and_dead_pids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caam.pid");
        write_pid_file(&path, std::process::id()).unwrap();
        assert!(pid_file_conflicts(&path).is_none());

        write_pid_file(&path, 999999).unwrap();
        assert!(pid_file_conflicts(&path).is_none());
    }
}
