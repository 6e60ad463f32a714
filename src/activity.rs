//! Activity log: an append-only record of pool/refresh/watcher events,
//! persisted to a small SQLite database. Writers never block on disk —
//! events go through a bounded channel to a single writer task that
//! batches commits every second.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

use crate::error::{CaamError, StorageError};
use crate::provider::Provider;

const CHANNEL_CAPACITY: usize = 1024;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS activity (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    provider  TEXT NOT NULL,
    profile   TEXT NOT NULL,
    kind      TEXT NOT NULL,
    detail    TEXT,
    success   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_activity_timestamp ON activity(timestamp);
CREATE INDEX IF NOT EXISTS idx_activity_provider_profile ON activity(provider, profile);
";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub timestamp: DateTime<Utc>,
    pub provider: Provider,
    pub profile: String,
    pub kind: String,
    pub detail: Option<String>,
    pub success: bool,
}

impl ActivityEvent {
    pub fn now(provider: Provider, profile: impl Into<String>, kind: impl Into<String>, success: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            provider,
            profile: profile.into(),
            kind: kind.into(),
            detail: None,
            success,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub provider: Provider,
    pub profile: String,
    pub kind: String,
    pub count: u64,
    pub success_count: u64,
}

/// A running writer task plus the sender callers use to submit events.
pub struct ActivityLog {
    sender: mpsc::Sender<ActivityEvent>,
    writer: Option<tokio::task::JoinHandle<()>>,
}

impl ActivityLog {
    pub fn open(db_path: PathBuf) -> Result<Self, CaamError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CaamError::Storage(StorageError::Io(e)))?;
        }
        let conn = Connection::open(&db_path)
            .map_err(|e| CaamError::Other(anyhow::anyhow!("opening activity db: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| CaamError::Other(anyhow::anyhow!("initializing activity schema: {e}")))?;

        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let conn = Arc::new(Mutex::new(conn));
        let writer = tokio::spawn(run_writer(conn, receiver));
        Ok(Self { sender, writer: Some(writer) })
    }

    /// In-memory database, for tests that don't want a temp file.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, CaamError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CaamError::Other(anyhow::anyhow!("opening in-memory activity db: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| CaamError::Other(anyhow::anyhow!("initializing activity schema: {e}")))?;
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let conn = Arc::new(Mutex::new(conn));
        let writer = tokio::spawn(run_writer(conn, receiver));
        Ok(Self { sender, writer: Some(writer) })
    }

    /// Submit an event without blocking. If the writer's buffer is
    /// full the event is dropped and a warning logged — activity
    /// logging is best-effort, never a backpressure source for the
    /// pool or daemon.
    pub fn record(&self, event: ActivityEvent) {
        if let Err(e) = self.sender.try_send(event) {
            tracing::warn!(error = %e, "activity log buffer full, dropping event");
        }
    }

    /// Flush any buffered events and wait for the writer task to exit.
    pub async fn shutdown(mut self) {
        let (closed_tx, _closed_rx) = mpsc::channel(1);
        let sender = std::mem::replace(&mut self.sender, closed_tx);
        drop(sender);
        if let Some(handle) = self.writer.take() {
            let _ = handle.await;
        }
    }

    /// Aggregate event counts since `since`, optionally filtered to one
    /// provider, grouped by `(provider, profile, kind)`.
    pub async fn report(
        db_path: PathBuf,
        provider: Option<Provider>,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActivitySummary>, CaamError> {
        tokio::task::spawn_blocking(move || query_report(&db_path, provider, since))
            .await
            .map_err(|e| CaamError::Other(anyhow::anyhow!("activity report task panicked: {e}")))?
    }
}

async fn run_writer(conn: Arc<Mutex<Connection>>, mut receiver: mpsc::Receiver<ActivityEvent>) {
    let mut ticker = interval(FLUSH_INTERVAL);
    let mut batch: Vec<ActivityEvent> = Vec::new();
    loop {
        tokio::select! {
            maybe_event = receiver.recv() => {
                match maybe_event {
                    Some(event) => batch.push(event),
                    None => {
                        flush(&conn, std::mem::take(&mut batch)).await;
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(&conn, std::mem::take(&mut batch)).await;
                }
            }
        }
    }
}

async fn flush(conn: &Arc<Mutex<Connection>>, batch: Vec<ActivityEvent>) {
    if batch.is_empty() {
        return;
    }
    let conn = conn.clone();
    let outcome = tokio::task::spawn_blocking(move || write_batch(&conn, &batch)).await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "failed to write activity batch"),
        Err(e) => tracing::error!(error = %e, "activity writer blocking task panicked"),
    }
}

fn write_batch(conn: &Arc<Mutex<Connection>>, batch: &[ActivityEvent]) -> Result<(), String> {
    let mut guard = conn.lock();
    let tx = guard.transaction().map_err(|e| e.to_string())?;
    for event in batch {
        tx.execute(
            "INSERT INTO activity (timestamp, provider, profile, kind, detail, success)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.timestamp.to_rfc3339(),
                event.provider.as_str(),
                event.profile,
                event.kind,
                event.detail,
                event.success as i64,
            ],
        )
        .map_err(|e| e.to_string())?;
    }
    tx.commit().map_err(|e| e.to_string())
}

fn query_report(
    db_path: &Path,
    provider: Option<Provider>,
    since: DateTime<Utc>,
) -> Result<Vec<ActivitySummary>, CaamError> {
    let conn = Connection::open(db_path)
        .map_err(|e| CaamError::Other(anyhow::anyhow!("opening activity db: {e}")))?;

    let sql = "SELECT provider, profile, kind,
                      COUNT(*) as count,
                      SUM(success) as success_count
               FROM activity
               WHERE timestamp >= ?1 AND (?2 IS NULL OR provider = ?2)
               GROUP BY provider, profile, kind
               ORDER BY provider, profile, kind";
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| CaamError::Other(anyhow::anyhow!("preparing activity report query: {e}")))?;

    let provider_filter = provider.map(|p| p.as_str().to_string());
    let rows = stmt
        .query_map(params![since.to_rfc3339(), provider_filter], |row| {
            let provider_str: String = row.get(0)?;
            Ok(ActivitySummary {
                provider: Provider::parse(&provider_str).unwrap_or(Provider::Codex),
                profile: row.get(1)?,
                kind: row.get(2)?,
                count: row.get::<_, i64>(3)? as u64,
                success_count: row.get::<_, i64>(4)? as u64,
            })
        })
        .map_err(|e| CaamError::Other(anyhow::anyhow!("querying activity report: {e}")))?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| CaamError::Other(anyhow::anyhow!("reading activity row: {e}")))?);
    }
    Ok(out)
}
