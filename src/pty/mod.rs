//! Smart PTY runner: spawns a coding-agent CLI under a pseudo-terminal,
//! tees its output to line-buffered detectors, and drives a handoff
//! state machine when a provider reports it is rate-limited.
//!
//! The child is paused with `SIGSTOP` while its auth profile is swapped
//! underneath it, then resumed with `SIGCONT` once the replacement
//! credential is live — the child never sees the filesystem move.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::mpsc;

use crate::config::DetectorPatterns;
use crate::error::{CaamError, ConcurrencyError, PlatformError};
use crate::pool::AuthPool;
use crate::provider::Provider;
use crate::vault::Vault;

/// Where the runner currently sits in the handoff state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Running,
    RateLimited,
    SelectingBackup,
    SwappingAuth,
    LoggingIn,
    LoginComplete,
    HandoffFailed,
    ManualMode,
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Extra environment variables, applied after the provider's own
    /// and winning any collision with both inherited and provider env.
    pub env: HashMap<String, String>,
    pub work_dir: Option<PathBuf>,
    /// How long to wait for a login-success marker after injecting the
    /// provider's login command during `LoggingIn`.
    pub login_timeout: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            env: HashMap::new(),
            work_dir: None,
            login_timeout: Duration::from_secs(120),
        }
    }
}

/// A line matched a rate-limit or login-success pattern, or carried a
/// session id the caller may want to persist.
#[derive(Debug, Clone)]
enum DetectorEvent {
    RateLimited(String),
    LoginSuccess(String),
    SessionId(String),
}

/// Public mirror of [`DetectorEvent`] surfaced to callers driving the
/// runner's main loop, so they can notice a rate limit and call
/// [`PtyRunner::handle_rate_limit`] without reaching into internals.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    RateLimited(String),
    LoginSuccess(String),
    SessionId(String),
}

struct LineDetectors {
    rate_limit: Vec<Regex>,
    login_success: Vec<Regex>,
    session_id: Vec<Regex>,
}

impl LineDetectors {
    fn compile(patterns: &DetectorPatterns) -> Self {
        let compile_all = |pats: &[String]| -> Vec<Regex> {
            pats.iter()
                .filter_map(|p| match Regex::new(p) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        tracing::warn!(pattern = %p, error = %e, "skipping invalid detector pattern");
                        None
                    }
                })
                .collect()
        };
        Self {
            rate_limit: compile_all(&patterns.rate_limit),
            login_success: compile_all(&patterns.login_success),
            session_id: compile_all(&patterns.session_id),
        }
    }

    fn classify(&self, line: &str) -> Option<DetectorEvent> {
        if self.rate_limit.iter().any(|re| re.is_match(line)) {
            return Some(DetectorEvent::RateLimited(line.to_string()));
        }
        if self.login_success.iter().any(|re| re.is_match(line)) {
            return Some(DetectorEvent::LoginSuccess(line.to_string()));
        }
        for re in &self.session_id {
            if let Some(caps) = re.captures(line) {
                if let Some(m) = caps.get(1).or_else(|| caps.get(0)) {
                    return Some(DetectorEvent::SessionId(m.as_str().to_string()));
                }
            }
        }
        None
    }
}

/// Splits a byte stream into lines for detection while also forwarding
/// the raw bytes untouched to a passthrough channel.
struct LineTee {
    raw_tx: mpsc::UnboundedSender<Vec<u8>>,
    detectors: LineDetectors,
    event_tx: mpsc::UnboundedSender<DetectorEvent>,
    buffer: Vec<u8>,
}

impl LineTee {
    fn feed(&mut self, chunk: &[u8]) {
        let _ = self.raw_tx.send(chunk.to_vec());
        self.buffer.extend_from_slice(chunk);
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.dispatch(&line);
        }
    }

    fn dispatch(&self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let trimmed = text.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return;
        }
        if let Some(event) = self.detectors.classify(trimmed) {
            let _ = self.event_tx.send(event);
        }
    }

    fn flush_final(&mut self) {
        if !self.buffer.is_empty() {
            let remaining = std::mem::take(&mut self.buffer);
            self.dispatch(&remaining);
        }
    }
}

fn spawn_reader_thread(mut reader: Box<dyn Read + Send>, mut tee: LineTee) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => tee.feed(&buf[..n]),
            }
        }
        tee.flush_final();
    })
}

/// Compose the child's environment per `os.Environ() ∪ provider.Env(profile)
/// ∪ opts.Env`, later sources winning on key collision. None of the three
/// providers currently need process-env credentials (they read from the
/// vault-managed files directly), so `provider_env` is empty today but the
/// merge order is still honored for providers that grow one.
fn compose_env(provider_env: &HashMap<String, String>, opts_env: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut merged: HashMap<String, String> = std::env::vars().collect();
    merged.extend(provider_env.clone());
    merged.extend(opts_env.clone());
    merged.into_iter().collect()
}

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

    pub struct PtyRunner {
        provider: Provider,
        profile: Mutex<String>,
        state: Mutex<RunnerState>,
        closed: AtomicBool,
        pid: Option<u32>,
        writer: Mutex<Box<dyn Write + Send>>,
        child: Mutex<Box<dyn Child + Send>>,
        #[allow(dead_code)]
        master: Box<dyn MasterPty + Send>,
        reader_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
        output_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
        event_rx: Mutex<Option<mpsc::UnboundedReceiver<DetectorEvent>>>,
    }

    impl PtyRunner {
        pub fn spawn(
            provider: Provider,
            profile: &str,
            program: &str,
            args: &[String],
            patterns: &DetectorPatterns,
            opts: &RunnerOptions,
        ) -> Result<Self, CaamError> {
            let pty_system = native_pty_system();
            let pair = pty_system
                .openpty(PtySize { rows: 24, cols: 80, pixel_width: 0, pixel_height: 0 })
                .map_err(|e| CaamError::Other(anyhow::anyhow!("allocating pty: {e}")))?;

            let mut cmd = CommandBuilder::new(program);
            cmd.args(args);
            for (k, v) in compose_env(&HashMap::new(), &opts.env) {
                cmd.env(k, v);
            }
            if let Some(dir) = &opts.work_dir {
                cmd.cwd(dir);
            }

            let child = pair
                .slave
                .spawn_command(cmd)
                .map_err(|e| CaamError::Other(anyhow::anyhow!("spawning child under pty: {e}")))?;
            let pid = child.process_id();
            drop(pair.slave);

            let reader = pair
                .master
                .try_clone_reader()
                .map_err(|e| CaamError::Other(anyhow::anyhow!("cloning pty reader: {e}")))?;
            let writer = pair
                .master
                .take_writer()
                .map_err(|e| CaamError::Other(anyhow::anyhow!("taking pty writer: {e}")))?;

            let (raw_tx, raw_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let tee = LineTee {
                raw_tx,
                detectors: LineDetectors::compile(patterns),
                event_tx,
                buffer: Vec::new(),
            };
            let reader_handle = spawn_reader_thread(reader, tee);

            Ok(Self {
                provider,
                profile: Mutex::new(profile.to_string()),
                state: Mutex::new(RunnerState::Running),
                closed: AtomicBool::new(false),
                pid,
                writer: Mutex::new(writer),
                child: Mutex::new(child),
                master: pair.master,
                reader_handle: Mutex::new(Some(reader_handle)),
                output_rx: Mutex::new(Some(raw_rx)),
                event_rx: Mutex::new(Some(event_rx)),
            })
        }

        pub fn state(&self) -> RunnerState {
            *self.state.lock().unwrap()
        }

        pub fn active_profile(&self) -> String {
            self.profile.lock().unwrap().clone()
        }

        fn ensure_open(&self) -> Result<(), CaamError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(CaamError::Concurrency(ConcurrencyError::Shutdown));
            }
            Ok(())
        }

        /// Take ownership of the raw output channel. Returns `None` if
        /// already taken by an earlier call.
        pub fn take_output(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
            self.output_rx.lock().unwrap().take()
        }

        /// Non-blocking poll for the next detector event, if any is
        /// queued. Callers drive their own loop with this while the
        /// runner is `Running`, then stop polling once they hand off
        /// to [`Self::handle_rate_limit`] (which takes over consuming
        /// the same channel for its login-success wait).
        pub fn poll_event(&self) -> Option<RunnerEvent> {
            let mut guard = self.event_rx.lock().unwrap();
            let rx = guard.as_mut()?;
            match rx.try_recv() {
                Ok(DetectorEvent::RateLimited(line)) => Some(RunnerEvent::RateLimited(line)),
                Ok(DetectorEvent::LoginSuccess(line)) => Some(RunnerEvent::LoginSuccess(line)),
                Ok(DetectorEvent::SessionId(id)) => Some(RunnerEvent::SessionId(id)),
                Err(_) => None,
            }
        }

        fn send_signal(&self, sig: libc::c_int) {
            if let Some(pid) = self.pid {
                unsafe {
                    libc::kill(pid as libc::pid_t, sig);
                }
            }
        }

        fn set_state(&self, state: RunnerState) {
            *self.state.lock().unwrap() = state;
        }

        /// Drive the handoff state machine once a rate-limit line has
        /// been observed: pause the child, rotate to the pool's next
        /// profile, swap the vault's live credential under it, resume,
        /// and (if a login command is given) wait for a login-success
        /// marker before declaring the handoff complete.
        pub fn handle_rate_limit(
            &self,
            pool: &AuthPool,
            vault: &Vault,
            login_command: Option<&str>,
            opts: &RunnerOptions,
        ) -> Result<RunnerState, CaamError> {
            self.ensure_open()?;
            self.set_state(RunnerState::RateLimited);

            self.set_state(RunnerState::SelectingBackup);
            let current = self.active_profile();
            let Some(next) = pool.next(self.provider, Some(current.as_str())) else {
                // No backup to rotate to; surface for manual intervention
                // rather than pointlessly "swapping" a profile onto itself.
                self.set_state(RunnerState::ManualMode);
                return Ok(RunnerState::ManualMode);
            };

            self.set_state(RunnerState::SwappingAuth);
            self.send_signal(libc::SIGSTOP);
            let swap_result = vault.restore(self.provider, &next);
            self.send_signal(libc::SIGCONT);

            if let Err(e) = swap_result {
                self.set_state(RunnerState::HandoffFailed);
                return Err(e);
            }
            *self.profile.lock().unwrap() = next;

            let Some(login_command) = login_command else {
                self.set_state(RunnerState::LoginComplete);
                self.set_state(RunnerState::Running);
                return Ok(RunnerState::Running);
            };

            self.set_state(RunnerState::LoggingIn);
            self.write_line(login_command)?;
            match self.wait_for_login_success(opts.login_timeout) {
                Some(()) => {
                    self.set_state(RunnerState::LoginComplete);
                    self.set_state(RunnerState::Running);
                    Ok(RunnerState::Running)
                }
                None => {
                    self.set_state(RunnerState::HandoffFailed);
                    Ok(RunnerState::HandoffFailed)
                }
            }
        }

        fn wait_for_login_success(&self, timeout: Duration) -> Option<()> {
            let deadline = Instant::now() + timeout;
            let mut guard = self.event_rx.lock().unwrap();
            let rx = guard.as_mut()?;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return None;
                }
                match rx.try_recv() {
                    Ok(DetectorEvent::LoginSuccess(_)) => return Some(()),
                    Ok(_) => continue,
                    Err(mpsc::error::TryRecvError::Empty) => {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    Err(mpsc::error::TryRecvError::Disconnected) => return None,
                }
            }
        }

        pub fn write_line(&self, line: &str) -> Result<(), CaamError> {
            self.ensure_open()?;
            let mut writer = self.writer.lock().unwrap();
            writer
                .write_all(line.as_bytes())
                .and_then(|_| writer.write_all(b"\n"))
                .and_then(|_| writer.flush())
                .map_err(|e| CaamError::Other(anyhow::anyhow!("writing to pty: {e}")))
        }

        pub fn wait(&self) -> Result<portable_pty::ExitStatus, CaamError> {
            self.ensure_open()?;
            self.child
                .lock()
                .unwrap()
                .wait()
                .map_err(|e| CaamError::Other(anyhow::anyhow!("waiting on pty child: {e}")))
        }

        /// Idempotent: terminates the child (if still running) and
        /// marks the runner closed. Further operations return
        /// `ConcurrencyError::Shutdown`.
        pub fn close(&self) -> Result<(), CaamError> {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            {
                let mut child = self.child.lock().unwrap();
                let _ = child.kill();
            }
            if let Some(handle) = self.reader_handle.lock().unwrap().take() {
                let _ = handle.join();
            }
            Ok(())
        }
    }

    impl Drop for PtyRunner {
        fn drop(&mut self) {
            let _ = self.close();
        }
    }
}

#[cfg(unix)]
pub use unix_impl::PtyRunner;

#[cfg(not(unix))]
pub struct PtyRunner;

#[cfg(not(unix))]
impl PtyRunner {
    pub fn spawn(
        _provider: Provider,
        _profile: &str,
        _program: &str,
        _args: &[String],
        _patterns: &DetectorPatterns,
        _opts: &RunnerOptions,
    ) -> Result<Self, CaamError> {
        Err(CaamError::Platform(PlatformError::NotSupported(
            "pty runner requires a unix platform".to_string(),
        )))
    }

    pub fn state(&self) -> RunnerState {
        RunnerState::ManualMode
    }

    pub fn close(&self) -> Result<(), CaamError> {
        Ok(())
    }

    pub fn poll_event(&self) -> Option<RunnerEvent> {
        None
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::health::HealthStore;
    use std::sync::Arc;

    fn patterns() -> DetectorPatterns {
        DetectorPatterns {
            rate_limit: vec![r"(?i)rate limit".to_string()],
            session_id: vec![],
            login_success: vec![r"(?i)login successful".to_string()],
        }
    }

    fn setup_vault_and_pool(dir: &std::path::Path) -> (Arc<Vault>, Arc<AuthPool>) {
        let home = dir.join("home");
        std::fs::create_dir_all(home.join(".codex")).unwrap();
        std::fs::write(home.join(".codex/auth.json"), br#"{"active":"alice"}"#).unwrap();
        let vault = Arc::new(Vault::new(dir.join("vault"), home.clone()));
        vault.backup(Provider::Codex, "alice").unwrap();

        std::fs::write(home.join(".codex/auth.json"), br#"{"active":"bob"}"#).unwrap();
        vault.backup(Provider::Codex, "bob").unwrap();

        let health = Arc::new(HealthStore::open(&dir.join("vault"), 3600).unwrap());
        let pool = Arc::new(AuthPool::new(vault.clone(), health, crate::config::PoolConfig::default(), 3600));
        (vault, pool)
    }

    #[test]
    fn spawn_runs_a_trivial_command_and_reports_running() {
        let dir = tempfile::tempdir().unwrap();
        let (vault, _pool) = setup_vault_and_pool(dir.path());
        vault.restore(Provider::Codex, "alice").unwrap();

        let runner = PtyRunner::spawn(
            Provider::Codex,
            "alice",
            "/bin/echo",
            &["hello".to_string()],
            &patterns(),
            &RunnerOptions::default(),
        )
        .unwrap();

        assert_eq!(runner.state(), RunnerState::Running);
        let _ = runner.wait();
        runner.close().unwrap();
    }

    #[test]
    fn poll_event_surfaces_a_rate_limited_line() {
        let dir = tempfile::tempdir().unwrap();
        let (vault, _pool) = setup_vault_and_pool(dir.path());
        vault.restore(Provider::Codex, "alice").unwrap();

        let runner = PtyRunner::spawn(
            Provider::Codex,
            "alice",
            "/bin/echo",
            &["you have hit a rate limit".to_string()],
            &patterns(),
            &RunnerOptions::default(),
        )
        .unwrap();
        let _ = runner.wait();

        let mut seen = None;
        for _ in 0..100 {
            if let Some(event) = runner.poll_event() {
                seen = Some(event);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        match seen {
            Some(RunnerEvent::RateLimited(line)) => assert!(line.contains("rate limit")),
            other => panic!("expected a RateLimited event, got {other:?}"),
        }
        runner.close().unwrap();
    }

    #[test]
    fn handle_rate_limit_swaps_to_the_pools_next_profile() {
        let dir = tempfile::tempdir().unwrap();
        let (vault, pool) = setup_vault_and_pool(dir.path());
        vault.restore(Provider::Codex, "alice").unwrap();

        let runner = PtyRunner::spawn(
            Provider::Codex,
            "alice",
            "/bin/cat",
            &[],
            &patterns(),
            &RunnerOptions::default(),
        )
        .unwrap();

        let outcome = runner.handle_rate_limit(&pool, &vault, None, &RunnerOptions::default()).unwrap();
        assert_eq!(outcome, RunnerState::Running);
        assert_eq!(runner.active_profile(), "bob");
        assert_eq!(vault.active_profile(Provider::Codex).as_deref(), Some("bob"));

        runner.close().unwrap();
    }

    #[test]
    fn close_is_idempotent_and_further_writes_report_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (vault, _pool) = setup_vault_and_pool(dir.path());
        vault.restore(Provider::Codex, "alice").unwrap();

        let runner = PtyRunner::spawn(
            Provider::Codex,
            "alice",
            "/bin/cat",
            &[],
            &patterns(),
            &RunnerOptions::default(),
        )
        .unwrap();

        runner.close().unwrap();
        runner.close().unwrap();

        let err = runner.write_line("hello").unwrap_err();
        assert!(matches!(err, CaamError::Concurrency(ConcurrencyError::Shutdown)));
    }

    #[test]
    fn manual_mode_when_pool_has_no_backup_profile() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        std::fs::create_dir_all(home.join(".codex")).unwrap();
        std::fs::write(home.join(".codex/auth.json"), b"{}").unwrap();
        let vault = Arc::new(Vault::new(dir.path().join("vault"), home));
        vault.backup(Provider::Codex, "solo").unwrap();
        vault.restore(Provider::Codex, "solo").unwrap();
        let health = Arc::new(HealthStore::open(&dir.path().join("vault"), 3600).unwrap());
        let pool = AuthPool::new(vault.clone(), health, crate::config::PoolConfig::default(), 3600);

        let runner = PtyRunner::spawn(
            Provider::Codex,
            "solo",
            "/bin/cat",
            &[],
            &patterns(),
            &RunnerOptions::default(),
        )
        .unwrap();

        let outcome = runner.handle_rate_limit(&pool, &vault, None, &RunnerOptions::default()).unwrap();
        assert_eq!(outcome, RunnerState::ManualMode);
        runner.close().unwrap();
    }
}
