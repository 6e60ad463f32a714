//! Auth pool and rotator: picks which profile a caller should use next,
//! scoring candidates by health/penalty/recency/cooldown, and gates
//! concurrent refreshes behind a semaphore plus a per-profile
//! single-flight lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::config::PoolConfig;
use crate::health::{HealthRecord, HealthStatus, HealthStore};
use crate::provider::Provider;
use crate::vault::Vault;

#[derive(Debug, Clone)]
pub struct ProfileScore {
    pub name: String,
    pub status: HealthStatus,
    pub score: f64,
    pub cooling_down: bool,
}

struct InflightMap {
    map: Mutex<HashMap<(Provider, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl InflightMap {
    fn new() -> Self {
        Self { map: Mutex::new(HashMap::new()) }
    }

    fn entry(&self, provider: Provider, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.map.lock();
        map.entry((provider, name.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Rotates across a provider's profiles, combining health data with a
/// configurable scoring algorithm. Concurrency across the whole pool
/// is capped by a semaphore; concurrency on a single `(provider, name)`
/// pair is serialized via single-flight.
pub struct AuthPool {
    vault: Arc<Vault>,
    health: Arc<HealthStore>,
    config: PoolConfig,
    health_half_life_secs: u64,
    semaphore: Semaphore,
    inflight: InflightMap,
    round_robin_cursor: Mutex<HashMap<Provider, usize>>,
}

impl AuthPool {
    pub fn new(
        vault: Arc<Vault>,
        health: Arc<HealthStore>,
        config: PoolConfig,
        health_half_life_secs: u64,
    ) -> Self {
        let permits = config.max_concurrent_refreshes.max(1);
        Self {
            vault,
            health,
            semaphore: Semaphore::new(permits),
            config,
            health_half_life_secs,
            inflight: InflightMap::new(),
            round_robin_cursor: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a permit against the pool-wide concurrent-refresh cap.
    pub async fn acquire_refresh_permit(&self) -> SemaphorePermit<'_> {
        self.semaphore
            .acquire()
            .await
            .expect("semaphore is never closed")
    }

    /// Serialize concurrent callers against the same `(provider, name)`
    /// pair so at most one refresh for a given profile runs at a time.
    pub async fn single_flight<F, Fut, T>(&self, provider: Provider, name: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let lock = self.inflight.entry(provider, name);
        let _guard = lock.lock().await;
        f().await
    }

    fn recency_weight(record: Option<&HealthRecord>) -> f64 {
        match record.and_then(|r| r.last_refresh_at) {
            None => 1.0,
            Some(last) => {
                let secs = (Utc::now() - last).num_seconds().max(0) as f64;
                // Profiles refreshed very recently score slightly lower so
                // the rotator spreads load instead of hammering one profile.
                (1.0 / (1.0 + secs / 3600.0)).min(1.0)
            }
        }
    }

    fn health_weight(status: HealthStatus) -> f64 {
        match status {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Warning => 0.5,
            HealthStatus::Unknown => 0.75,
            HealthStatus::Critical => 0.0,
        }
    }

    fn score_profile(&self, provider: Provider, name: &str) -> ProfileScore {
        let record = self.health.get_profile(provider, name);
        let status = HealthStore::calculate_status(record.as_ref(), self.health_half_life_secs);
        let now = Utc::now();
        let penalty = record
            .as_ref()
            .map(|r| r.current_penalty(now, self.health_half_life_secs))
            .unwrap_or(0.0);
        let cooling_down = record
            .as_ref()
            .and_then(|r| r.cooldown_until)
            .map(|until| until > now)
            .unwrap_or(false);
        let w = &self.config.weights;
        let score = w.alpha * Self::health_weight(status)
            - w.beta * penalty
            - w.gamma * (1.0 - Self::recency_weight(record.as_ref()))
            - w.delta * if cooling_down { 1.0 } else { 0.0 };
        ProfileScore { name: name.to_string(), status, score, cooling_down }
    }

    /// All profiles for `provider` with their computed scores, best first.
    pub fn stats(&self, provider: Provider) -> Vec<ProfileScore> {
        let names = self.vault.list(provider);
        let mut scores: Vec<ProfileScore> = names.iter().map(|n| self.score_profile(provider, n)).collect();
        scores.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scores
    }

    /// Pick the next profile to use for `provider`, per the configured
    /// algorithm, optionally excluding `exclude` (the profile a caller
    /// is currently on and wants to rotate away from). Profiles
    /// currently in cooldown are skipped unless every remaining
    /// profile is cooling down, in which case the least-bad one is
    /// still returned (callers must still handle a failed refresh).
    pub fn next(&self, provider: Provider, exclude: Option<&str>) -> Option<String> {
        let names: Vec<String> =
            self.vault.list(provider).into_iter().filter(|n| Some(n.as_str()) != exclude).collect();
        if names.is_empty() {
            return None;
        }

        match self.config.algorithm.as_str() {
            "round_robin" => {
                let mut cursor = self.round_robin_cursor.lock();
                let idx = cursor.entry(provider).or_insert(0);
                let chosen = names[*idx % names.len()].clone();
                *idx = (*idx + 1) % names.len();
                Some(chosen)
            }
            "random" => {
                use rand::seq::IndexedRandom;
                let mut rng = rand::rng();
                names.choose(&mut rng).cloned()
            }
            _ => {
                let mut scores: Vec<ProfileScore> =
                    names.iter().map(|n| self.score_profile(provider, n)).collect();
                scores.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
                if scores.is_empty() {
                    return None;
                }
                if let Some(best) = scores.iter().find(|s| !s.cooling_down) {
                    return Some(best.name.clone());
                }
                scores.into_iter().next().map(|s| s.name)
            }
        }
    }

    pub fn mark_cooling_down(
        &self,
        provider: Provider,
        name: &str,
        duration: chrono::Duration,
    ) -> crate::error::Result<()> {
        self.health.mark_cooling_down(provider, name, duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    fn setup() -> (tempfile::TempDir, Arc<Vault>, Arc<HealthStore>) {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        std::fs::create_dir_all(&home).unwrap();
        std::fs::create_dir_all(home.join(".codex")).unwrap();
        std::fs::write(home.join(".codex/auth.json"), b"{}").unwrap();
        let vault = Arc::new(Vault::new(dir.path().join("vault"), home));
        vault.backup(Provider::Codex, "alice").unwrap();
        vault.backup(Provider::Codex, "bob").unwrap();
        let health = Arc::new(HealthStore::open(&dir.path().join("vault"), 3600).unwrap());
        (dir, vault, health)
    }

    #[test]
    fn next_returns_none_for_empty_provider() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(Vault::new(dir.path().join("vault"), dir.path().join("home")));
        let health = Arc::new(HealthStore::open(&dir.path().join("vault"), 3600).unwrap());
        let pool = AuthPool::new(vault, health, PoolConfig::default(), 3600);
        assert_eq!(pool.next(Provider::Gemini, None), None);
    }

    #[test]
    fn round_robin_cycles_through_profiles() {
        let (_dir, vault, health) = setup();
        let mut config = PoolConfig::default();
        config.algorithm = "round_robin".to_string();
        let pool = AuthPool::new(vault, health, config, 3600);
        let first = pool.next(Provider::Codex, None).unwrap();
        let second = pool.next(Provider::Codex, None).unwrap();
        assert_ne!(first, second);
        let third = pool.next(Provider::Codex, None).unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn smart_algorithm_avoids_cooling_down_profile() {
        let (_dir, vault, health) = setup();
        health.mark_cooling_down(Provider::Codex, "alice", chrono::Duration::minutes(5)).unwrap();
        let pool = AuthPool::new(vault, health, PoolConfig::default(), 3600);
        let chosen = pool.next(Provider::Codex, None).unwrap();
        assert_eq!(chosen, "bob");
    }

    #[test]
    fn smart_algorithm_excludes_the_current_profile_even_with_no_health_history() {
        // Regression: with no health record for either profile, both
        // score identically, so without exclusion the alphabetically
        // first profile ("alice") always wins, even when it's the
        // caller's own current profile.
        let (_dir, vault, health) = setup();
        let pool = AuthPool::new(vault, health, PoolConfig::default(), 3600);
        let chosen = pool.next(Provider::Codex, Some("alice")).unwrap();
        assert_eq!(chosen, "bob");
    }

    #[test]
    fn next_returns_none_when_excluding_the_only_profile() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        std::fs::create_dir_all(home.join(".codex")).unwrap();
        std::fs::write(home.join(".codex/auth.json"), b"{}").unwrap();
        let vault = Arc::new(Vault::new(dir.path().join("vault"), home));
        vault.backup(Provider::Codex, "alice").unwrap();
        let health = Arc::new(HealthStore::open(&dir.path().join("vault"), 3600).unwrap());
        let pool = AuthPool::new(vault, health, PoolConfig::default(), 3600);
        assert_eq!(pool.next(Provider::Codex, Some("alice")), None);
    }

    #[tokio::test]
    async fn single_flight_serializes_same_profile() {
        let (_dir, vault, health) = setup();
        let pool = Arc::new(AuthPool::new(vault, health, PoolConfig::default(), 3600));
        let order = Arc::new(Mutex::new(Vec::new()));

        let p1 = pool.clone();
        let o1 = order.clone();
        let h1 = tokio::spawn(async move {
            p1.single_flight(Provider::Codex, "alice", || async {
                o1.lock().push(1);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                o1.lock().push(2);
            })
            .await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let p2 = pool.clone();
        let o2 = order.clone();
        let h2 = tokio::spawn(async move {
            p2.single_flight(Provider::Codex, "alice", || async {
                o2.lock().push(3);
            })
            .await;
        });

        h1.await.unwrap();
        h2.await.unwrap();
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn stats_sorts_best_score_first() {
        let (_dir, vault, health) = setup();
        health.record_error(Provider::Codex, "alice", "auth").unwrap();
        let pool = AuthPool::new(vault, health, PoolConfig::default(), 3600);
        let stats = pool.stats(Provider::Codex);
        assert_eq!(stats.len(), 2);
        assert!(stats[0].score >= stats[1].score);
    }
}
