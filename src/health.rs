//! Health store: token TTL, decayed error counts, and penalty scoring
//! that the pool uses to classify and rank profiles.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{CaamError, StorageError};
use crate::provider::Provider;
use crate::util::atomic_write;

const BUCKET_SECONDS: i64 = 360; // 6 minutes
const BUCKET_COUNT: i64 = 10; // 10 * 6min = 1h

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub token_expires_at: Option<DateTime<Utc>>,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub penalty: f64,
    pub penalty_updated_at: DateTime<Utc>,
    pub cooldown_until: Option<DateTime<Utc>>,
    /// `(bucket_index, count)` pairs; only non-empty recent buckets are kept.
    error_buckets: Vec<(i64, u32)>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            token_expires_at: None,
            last_refresh_at: None,
            last_error_at: None,
            penalty: 0.0,
            penalty_updated_at: Utc::now(),
            cooldown_until: None,
            error_buckets: Vec::new(),
        }
    }
}

impl HealthRecord {
    /// Sum of error-bucket counts within the trailing hour, as of `now`.
    pub fn error_count_1h(&self, now: DateTime<Utc>) -> u32 {
        let current_bucket = now.timestamp() / BUCKET_SECONDS;
        self.error_buckets
            .iter()
            .filter(|(idx, _)| current_bucket - idx < BUCKET_COUNT && *idx <= current_bucket)
            .map(|(_, count)| count)
            .sum()
    }

    /// Current penalty after applying exponential decay since it was
    /// last updated, with the given half-life.
    pub fn current_penalty(&self, now: DateTime<Utc>, half_life_secs: u64) -> f64 {
        if half_life_secs == 0 {
            return self.penalty;
        }
        let elapsed = (now - self.penalty_updated_at).num_seconds().max(0) as f64;
        let decay = 0.5_f64.powf(elapsed / half_life_secs as f64);
        self.penalty * decay
    }

    fn record_error_bucket(&mut self, now: DateTime<Utc>) {
        let bucket = now.timestamp() / BUCKET_SECONDS;
        self.error_buckets.retain(|(idx, _)| bucket - idx < BUCKET_COUNT);
        if let Some(entry) = self.error_buckets.iter_mut().find(|(idx, _)| *idx == bucket) {
            entry.1 += 1;
        } else {
            self.error_buckets.push((bucket, 1));
        }
    }
}

fn class_weight(class: &str) -> f64 {
    match class {
        "network" => 0.5,
        "rate_limit" => 2.0,
        "auth" => 3.0,
        _ => 1.0,
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HealthFile {
    records: HashMap<String, HealthRecord>,
}

fn key(provider: Provider, name: &str) -> String {
    format!("{}/{}", provider.as_str(), name)
}

pub struct HealthStore {
    path: PathBuf,
    half_life_secs: u64,
    inner: Arc<RwLock<HealthFile>>,
}

impl HealthStore {
    pub fn open(vault_dir: &Path, half_life_secs: u64) -> Result<Self, CaamError> {
        let path = vault_dir.join("health.json");
        let inner = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|e| CaamError::Storage(StorageError::Io(e)))?;
            serde_json::from_str(&raw)
                .map_err(|e| CaamError::Storage(StorageError::Corrupted(path.clone(), e.to_string())))?
        } else {
            HealthFile::default()
        };
        Ok(Self {
            path,
            half_life_secs,
            inner: Arc::new(RwLock::new(inner)),
        })
    }

    fn persist(&self) -> Result<(), CaamError> {
        let inner = self.inner.read();
        let body = serde_json::to_vec_pretty(&*inner)
            .map_err(|e| CaamError::Other(anyhow::anyhow!("encoding health store: {e}")))?;
        atomic_write(&self.path, &body, 0o600).map_err(|e| CaamError::Storage(StorageError::Io(e)))
    }

    pub fn get_profile(&self, provider: Provider, name: &str) -> Option<HealthRecord> {
        self.inner.read().records.get(&key(provider, name)).cloned()
    }

    pub fn record_refresh(
        &self,
        provider: Provider,
        name: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), CaamError> {
        let now = Utc::now();
        {
            let mut inner = self.inner.write();
            let record = inner.records.entry(key(provider, name)).or_default();
            record.token_expires_at = expires_at;
            record.last_refresh_at = Some(now);
            record.last_error_at = None;
            record.penalty = record.current_penalty(now, self.half_life_secs) * 0.5;
            record.penalty_updated_at = now;
        }
        self.persist()
    }

    pub fn record_error(&self, provider: Provider, name: &str, class: &str) -> Result<(), CaamError> {
        let now = Utc::now();
        {
            let mut inner = self.inner.write();
            let record = inner.records.entry(key(provider, name)).or_default();
            let decayed = record.current_penalty(now, self.half_life_secs);
            record.penalty = decayed + class_weight(class);
            record.penalty_updated_at = now;
            record.last_error_at = Some(now);
            record.record_error_bucket(now);
            if record.penalty >= 5.0 {
                record.cooldown_until = Some(now + chrono::Duration::seconds(300));
            }
        }
        self.persist()
    }

    pub fn mark_cooling_down(
        &self,
        provider: Provider,
        name: &str,
        duration: chrono::Duration,
    ) -> Result<(), CaamError> {
        {
            let mut inner = self.inner.write();
            let record = inner.records.entry(key(provider, name)).or_default();
            record.cooldown_until = Some(Utc::now() + duration);
        }
        self.persist()
    }

    /// Classify a record's health: `warning` if TTL <= 1h; `critical`
    /// if expired, penalty is high, or 3+ errors in the last hour;
    /// `unknown` when there is no record at all; `healthy` otherwise.
    pub fn calculate_status(record: Option<&HealthRecord>, half_life_secs: u64) -> HealthStatus {
        let Some(record) = record else {
            return HealthStatus::Unknown;
        };
        let now = Utc::now();
        let penalty = record.current_penalty(now, half_life_secs);
        let errors = record.error_count_1h(now);

        if let Some(expires_at) = record.token_expires_at {
            if expires_at <= now {
                return HealthStatus::Critical;
            }
        }
        if penalty >= 5.0 || errors >= 3 {
            return HealthStatus::Critical;
        }
        if let Some(expires_at) = record.token_expires_at {
            if expires_at - now <= chrono::Duration::hours(1) {
                return HealthStatus::Warning;
            }
        }
        HealthStatus::Healthy
    }
}
