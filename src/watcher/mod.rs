//! Filesystem watcher: turns raw OS notifications about the vault into
//! coalesced, profile-level `Added`/`Modified`/`Deleted` events.
//!
//! Grounded in the debounced-channel-fan-out pattern of a notify-based
//! auth-directory watcher; generalised here to run over all three
//! providers at once and to synthesise bootstrap events for
//! directories that appear fully populated in one OS notification.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcherTrait};
use tokio::sync::mpsc;

use crate::provider::Provider;

const IGNORED_NAMES: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini"];
const CLEANUP_EVERY: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileEvent {
    Added { provider: Provider, profile: String },
    Modified { provider: Provider, profile: String },
    Deleted { provider: Provider, profile: String },
}

/// Classify a raw filesystem path (relative to the vault root) into a
/// profile-level event, or `None` if it should be ignored.
///
/// Rules: fewer than 2 path segments are ignored; exactly 2 segments
/// (a profile directory itself) map directory create/remove to
/// Added/Deleted and anything else to Modified; 3+ segments (files
/// inside a profile) always map to Modified. Paths containing a
/// `.git` component, or whose final component is in the ignore set,
/// are dropped.
fn classify(vault_root: &Path, path: &Path, is_create: bool, is_remove: bool) -> Option<(Provider, String, EventShape)> {
    let rel = path.strip_prefix(vault_root).ok()?;
    let components: Vec<_> = rel.components().map(|c| c.as_os_str().to_string_lossy().to_string()).collect();

    if components.iter().any(|c| c == ".git") {
        return None;
    }
    if let Some(last) = components.last() {
        if IGNORED_NAMES.contains(&last.as_str()) {
            return None;
        }
    }
    if components.len() < 2 {
        return None;
    }

    let provider = Provider::parse(&components[0])?;
    let profile = components[1].clone();
    if profile == "staging" || profile.starts_with('_') {
        return None;
    }

    let shape = if components.len() == 2 {
        if is_create {
            EventShape::Added
        } else if is_remove {
            EventShape::Deleted
        } else {
            EventShape::Modified
        }
    } else {
        EventShape::Modified
    };

    Some((provider, profile, shape))
}

#[derive(Debug, Clone, Copy)]
enum EventShape {
    Added,
    Modified,
    Deleted,
}

/// First call with a key returns `true` (emit) and records the time;
/// calls within `delay` of the last emitted timestamp for the same key
/// return `false`. An empty key always bypasses debouncing.
struct Debouncer {
    delay: Duration,
    last_emitted: HashMap<String, Instant>,
    calls: u64,
}

impl Debouncer {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_emitted: HashMap::new(),
            calls: 0,
        }
    }

    fn should_emit(&mut self, key: &str) -> bool {
        self.calls += 1;
        if self.calls % CLEANUP_EVERY == 0 {
            let delay = self.delay;
            let now = Instant::now();
            self.last_emitted.retain(|_, t| now.duration_since(*t) < delay * 4);
        }
        if key.is_empty() {
            return true;
        }
        let now = Instant::now();
        match self.last_emitted.get(key) {
            Some(last) if now.duration_since(*last) < self.delay => false,
            _ => {
                self.last_emitted.insert(key.to_string(), now);
                true
            }
        }
    }
}

pub struct VaultWatcher {
    _inner: RecommendedWatcher,
    events_rx: Option<mpsc::Receiver<ProfileEvent>>,
    errors_rx: Option<mpsc::Receiver<String>>,
    closed: Arc<Mutex<bool>>,
}

impl VaultWatcher {
    /// Start watching `vault_root`. Synthesises `Added` events for
    /// any provider/profile directories already present, since a
    /// single watch setup can't distinguish "already there" from
    /// "just appeared in one atomic directory replace" any other way.
    pub fn start(vault_root: PathBuf, debounce: Duration) -> notify::Result<Self> {
        let (events_tx, events_rx) = mpsc::channel(100);
        let (errors_tx, errors_rx) = mpsc::channel(10);
        let debouncer = Arc::new(Mutex::new(Debouncer::new(debounce)));
        let closed = Arc::new(Mutex::new(false));

        let root_for_handler = vault_root.clone();
        let debouncer_for_handler = debouncer.clone();
        let events_tx_for_handler = events_tx.clone();
        let errors_tx_for_handler = errors_tx.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    handle_event(&root_for_handler, &event, &debouncer_for_handler, &events_tx_for_handler);
                }
                Err(e) => {
                    let _ = errors_tx_for_handler.try_send(e.to_string());
                }
            }
        })?;

        if vault_root.exists() {
            watcher.watch(&vault_root, RecursiveMode::Recursive)?;
        }

        bootstrap_existing(&vault_root, &events_tx);

        Ok(Self {
            _inner: watcher,
            events_rx: Some(events_rx),
            errors_rx: Some(errors_rx),
            closed,
        })
    }

    pub fn events(&mut self) -> &mut mpsc::Receiver<ProfileEvent> {
        self.events_rx.as_mut().expect("events channel taken")
    }

    pub fn errors(&mut self) -> &mut mpsc::Receiver<String> {
        self.errors_rx.as_mut().expect("errors channel taken")
    }

    /// Idempotent close: subsequent calls are no-ops.
    pub fn close(&mut self) {
        let mut closed = self.closed.lock().unwrap();
        if *closed {
            return;
        }
        *closed = true;
        self.events_rx = None;
        self.errors_rx = None;
    }
}

fn handle_event(
    vault_root: &Path,
    event: &Event,
    debouncer: &Arc<Mutex<Debouncer>>,
    events_tx: &mpsc::Sender<ProfileEvent>,
) {
    let is_create = matches!(event.kind, EventKind::Create(_));
    let is_remove = matches!(event.kind, EventKind::Remove(_));

    for path in &event.paths {
        // Symlinked directories are never recursed into; notify itself
        // won't report inside them since we never registered a watch
        // there, so no extra check is needed beyond skipping symlinks
        // as the event subject itself.
        if path.is_symlink() && path.is_dir() {
            continue;
        }

        // A provider directory appearing in one shot (mkdir, or an
        // atomic rename of a whole tree into place) needs the same
        // per-child bootstrap treatment as a provider directory that
        // already existed at watcher startup: a recursive watcher only
        // reports the outermost create, never one event per child.
        if is_create && path.is_dir() {
            if let Some(provider) = provider_dir_name(vault_root, path) {
                bootstrap_provider_dir(path, provider, events_tx);
                continue;
            }
        }

        let Some((provider, profile, shape)) = classify(vault_root, path, is_create, is_remove) else {
            continue;
        };

        let profile_event = match shape {
            EventShape::Added => ProfileEvent::Added { provider, profile: profile.clone() },
            EventShape::Deleted => ProfileEvent::Deleted { provider, profile: profile.clone() },
            EventShape::Modified => ProfileEvent::Modified { provider, profile: profile.clone() },
        };

        let debounce_key = match shape {
            EventShape::Modified => format!("{}/{}", provider.as_str(), profile),
            _ => String::new(),
        };

        let emit = debouncer.lock().unwrap().should_emit(&debounce_key);
        if emit {
            let _ = events_tx.try_send(profile_event);
        }
    }
}

fn bootstrap_existing(vault_root: &Path, events_tx: &mpsc::Sender<ProfileEvent>) {
    for provider in Provider::ALL {
        bootstrap_provider_dir(&vault_root.join(provider.as_str()), provider, events_tx);
    }
}

/// If `path` is exactly `<vault_root>/<provider>`, return the parsed
/// provider. Used to detect a provider directory materialising in a
/// single filesystem operation while the watcher is already running.
fn provider_dir_name(vault_root: &Path, path: &Path) -> Option<Provider> {
    let rel = path.strip_prefix(vault_root).ok()?;
    let mut components = rel.components();
    let only = components.next()?;
    if components.next().is_some() {
        return None;
    }
    Provider::parse(&only.as_os_str().to_string_lossy())
}

/// Emit one `Added` event per non-system profile directory already
/// present under a provider directory. Used both at watcher startup
/// and when a provider directory appears fully populated at runtime
/// (mkdir with existing children, or an atomic tree replace).
fn bootstrap_provider_dir(provider_dir: &Path, provider: Provider, events_tx: &mpsc::Sender<ProfileEvent>) {
    let Ok(entries) = std::fs::read_dir(provider_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else { continue };
        if !file_type.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(String::from) else { continue };
        if name == "staging" || name.starts_with('_') {
            continue;
        }
        let _ = events_tx.try_send(ProfileEvent::Added { provider, profile: name });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_ignores_shallow_paths() {
        let root = Path::new("/vault");
        assert!(classify(root, Path::new("/vault/codex"), true, false).is_none());
        assert!(classify(root, Path::new("/vault"), true, false).is_none());
    }

    #[test]
    fn classify_profile_dir_create_is_added() {
        let root = Path::new("/vault");
        let (p, name, shape) = classify(root, Path::new("/vault/codex/alice"), true, false).unwrap();
        assert_eq!(p, Provider::Codex);
        assert_eq!(name, "alice");
        assert!(matches!(shape, EventShape::Added));
    }

    #[test]
    fn classify_nested_file_is_modified() {
        let root = Path::new("/vault");
        let (_, _, shape) = classify(root, Path::new("/vault/codex/alice/auth.json"), false, false).unwrap();
        assert!(matches!(shape, EventShape::Modified));
    }

    #[test]
    fn classify_ignores_dotfiles_and_git() {
        let root = Path::new("/vault");
        assert!(classify(root, Path::new("/vault/codex/.DS_Store"), false, false).is_none());
        assert!(classify(root, Path::new("/vault/codex/alice/.git/HEAD"), false, false).is_none());
    }

    #[test]
    fn classify_ignores_staging_and_system_profiles() {
        let root = Path::new("/vault");
        assert!(classify(root, Path::new("/vault/codex/staging/txn/auth.json"), false, false).is_none());
        assert!(classify(root, Path::new("/vault/codex/_original/auth.json"), false, false).is_none());
    }

    #[test]
    fn debouncer_coalesces_burst_within_delay() {
        let mut d = Debouncer::new(Duration::from_millis(100));
        assert!(d.should_emit("codex/alice"));
        assert!(!d.should_emit("codex/alice"));
        assert!(!d.should_emit("codex/alice"));
    }

    #[test]
    fn debouncer_empty_key_always_emits() {
        let mut d = Debouncer::new(Duration::from_millis(100));
        assert!(d.should_emit(""));
        assert!(d.should_emit(""));
    }

    #[test]
    fn debouncer_separate_keys_are_independent() {
        let mut d = Debouncer::new(Duration::from_millis(100));
        assert!(d.should_emit("codex/alice"));
        assert!(d.should_emit("codex/bob"));
    }

    #[test]
    fn provider_dir_name_matches_exactly_two_path_segments() {
        let root = Path::new("/vault");
        assert_eq!(provider_dir_name(root, Path::new("/vault/codex")), Some(Provider::Codex));
        assert_eq!(provider_dir_name(root, Path::new("/vault/codex/alice")), None);
        assert_eq!(provider_dir_name(root, Path::new("/vault/not-a-provider")), None);
    }

    #[test]
    fn handle_event_bootstraps_a_provider_dir_that_appears_already_populated() {
        // Simulates a provider directory materialising in one filesystem
        // operation (mkdir with children already in place, or an atomic
        // tree replace) while the watcher is already running: a single
        // `Create` event for the provider directory itself, with no
        // separate event per child, must still synthesize one `Added`
        // per pre-existing profile.
        let dir = tempfile::tempdir().unwrap();
        let vault_root = dir.path().join("vault");
        let provider_dir = vault_root.join("codex");
        std::fs::create_dir_all(provider_dir.join("alice")).unwrap();
        std::fs::create_dir_all(provider_dir.join("bob")).unwrap();
        std::fs::create_dir_all(provider_dir.join("staging")).unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(10);
        let debouncer = Arc::new(Mutex::new(Debouncer::new(Duration::from_millis(100))));
        let event = Event::new(EventKind::Create(notify::event::CreateKind::Folder))
            .add_path(provider_dir.clone());

        handle_event(&vault_root, &event, &debouncer, &events_tx);

        let mut seen = Vec::new();
        while let Ok(ev) = events_rx.try_recv() {
            seen.push(ev);
        }
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&ProfileEvent::Added { provider: Provider::Codex, profile: "alice".to_string() }));
        assert!(seen.contains(&ProfileEvent::Added { provider: Provider::Codex, profile: "bob".to_string() }));
    }
}
