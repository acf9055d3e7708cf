//! Engine state snapshotting (spec §4.9).
//!
//! Startup recovery (spec §4.7) can always rebuild engine state from the
//! `Store` by scanning every active job and dependency edge, but on a large
//! backlog that scan is the dominant cost of a restart. A periodic
//! [`EngineSnapshot`] written by [`SnapshotScheduler`] lets recovery seed the
//! graph and queue from a single file and fall back to the full Store scan
//! only for whatever changed since the snapshot was taken.
//!
//! A snapshot is an optimization, never a source of truth: if it is missing,
//! corrupt, or stale, recovery must still succeed from the Store alone.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::model::{Dependency, Job, Worker};
use scheduler_core::store::Store;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("failed to read/write snapshot file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to (de)serialize snapshot: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store read failed while building snapshot: {0}")]
    Store(#[from] scheduler_core::error::StoreError),
}

/// A point-in-time capture of every active job, dependency edge and worker.
/// Leases and history are deliberately excluded — they reconcile against the
/// Store's lease table and history log on recovery regardless of snapshot age.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub taken_at: DateTime<Utc>,
    pub jobs: Vec<Job>,
    pub dependencies: Vec<Dependency>,
    pub workers: Vec<Worker>,
}

impl EngineSnapshot {
    /// Build a snapshot by scanning the Store's active records. Workers are
    /// included wholesale since the registry is always small relative to the
    /// job backlog.
    pub async fn capture<S: Store>(store: &S, now: DateTime<Utc>) -> Result<Self, SnapshotError> {
        let jobs = store.list_active_jobs().await?;
        let dependencies = store.list_all_dependencies().await?;
        let workers = store.list_workers().await?;
        Ok(Self {
            taken_at: now,
            jobs,
            dependencies,
            workers,
        })
    }

    /// Discards `jobs` and converts the dependency/worker portion into a
    /// [`scheduler_core::RecoverySeed`].
    ///
    /// Job status is intentionally never seeded from a snapshot: a stale
    /// snapshot must never resurrect a job into a status it has since moved
    /// away from, so [`scheduler_core::SchedulerCore::recover_seeded`] always
    /// re-reads job state fresh from the Store regardless of whether a seed
    /// is supplied. Only the dependency graph and worker table — the
    /// expensive, lower-risk part of recovery — are short-circuited by the
    /// snapshot.
    pub fn into_recovery_seed(self) -> scheduler_core::RecoverySeed {
        scheduler_core::RecoverySeed {
            dependencies: self.dependencies,
            workers: self.workers,
        }
    }
}

/// Loads the most recent snapshot from `sink` and converts it into a
/// [`scheduler_core::RecoverySeed`], rejecting it as stale if it's older than
/// `max_age`. A missing, unreadable, or stale snapshot yields `Ok(None)`,
/// telling the caller to fall back to a full Store scan in
/// [`scheduler_core::SchedulerCore::recover`] — a snapshot is always
/// advisory, never required for correctness.
pub async fn load_recovery_seed<K: SnapshotStore>(
    sink: &K,
    now: DateTime<Utc>,
    max_age: Duration,
) -> Result<Option<scheduler_core::RecoverySeed>, SnapshotError> {
    let Some(snapshot) = sink.load().await? else {
        return Ok(None);
    };
    let age = now.signed_duration_since(snapshot.taken_at);
    if age < chrono::Duration::zero() || age > chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX) {
        tracing::warn!(taken_at = %snapshot.taken_at, "discarding stale snapshot, falling back to full store scan");
        return Ok(None);
    }
    Ok(Some(snapshot.into_recovery_seed()))
}

/// Durable destination for engine snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &EngineSnapshot) -> Result<(), SnapshotError>;

    /// The most recent successfully-saved snapshot, if any.
    async fn load(&self) -> Result<Option<EngineSnapshot>, SnapshotError>;
}

/// Writes snapshots as JSON to a single file on local disk, via a
/// write-to-temp-then-rename so a crash mid-write never leaves a half-written
/// file in the load path. Keeps the timestamps of the last few snapshots it
/// wrote for diagnostics (`recent_writes`) without needing a full history log.
pub struct FileSnapshotStore {
    path: PathBuf,
    recent_writes: tokio::sync::Mutex<SmallVec<[DateTime<Utc>; 4]>>,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            recent_writes: tokio::sync::Mutex::new(SmallVec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn recent_write_timestamps(&self) -> Vec<DateTime<Utc>> {
        self.recent_writes.lock().await.to_vec()
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: &EngineSnapshot) -> Result<(), SnapshotError> {
        let bytes = serde_json::to_vec(snapshot)?;
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;

        let mut recent = self.recent_writes.lock().await;
        if recent.len() == recent.capacity() {
            recent.remove(0);
        }
        recent.push(snapshot.taken_at);
        Ok(())
    }

    async fn load(&self) -> Result<Option<EngineSnapshot>, SnapshotError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory `SnapshotStore`, used in tests and by embedders that don't want
/// a filesystem dependency.
#[derive(Default)]
pub struct MemorySnapshotStore {
    slot: tokio::sync::Mutex<Option<EngineSnapshot>>,
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &EngineSnapshot) -> Result<(), SnapshotError> {
        *self.slot.lock().await = Some(snapshot.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<EngineSnapshot>, SnapshotError> {
        Ok(self.slot.lock().await.clone())
    }
}

/// Periodically captures and saves a snapshot. A failed capture or save is
/// logged and retried on the next tick rather than treated as fatal — the
/// engine keeps running on the Store alone in the meantime.
pub struct SnapshotScheduler<S: Store, K: SnapshotStore> {
    store: Arc<S>,
    sink: Arc<K>,
    interval: Duration,
}

impl<S: Store, K: SnapshotStore> SnapshotScheduler<S, K> {
    pub fn new(store: Arc<S>, sink: Arc<K>, interval: Duration) -> Self {
        Self { store, sink, interval }
    }

    pub async fn snapshot_once(&self, now: DateTime<Utc>) -> Result<(), SnapshotError> {
        let snapshot = EngineSnapshot::capture(self.store.as_ref(), now).await?;
        self.sink.save(&snapshot).await
    }

    pub async fn run(&self, cancel: tokio_util::sync::CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            if let Err(err) = self.snapshot_once(Utc::now()).await {
                tracing::warn!(error = %err, "snapshot cycle failed, will retry next tick");
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_core::model::{JobStatus, PriorityBand};
    use std::collections::HashSet;

    fn sample_job() -> Job {
        Job::new(
            "send-email",
            serde_json::json!({}),
            PriorityBand::Normal,
            HashSet::new(),
            3,
            None,
            None,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn file_store_round_trips_a_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("engine.snapshot"));

        assert!(store.load().await.unwrap().is_none());

        let snapshot = EngineSnapshot {
            taken_at: Utc::now(),
            jobs: vec![sample_job()],
            dependencies: vec![],
            workers: vec![],
        };
        store.save(&snapshot).await.unwrap();

        let loaded = store.load().await.unwrap().expect("snapshot should exist");
        assert_eq!(loaded.jobs.len(), 1);
        assert_eq!(loaded.jobs[0].status, JobStatus::Pending);
        assert_eq!(store.recent_write_timestamps().await.len(), 1);
    }

    #[tokio::test]
    async fn memory_store_round_trips_a_snapshot() {
        let store = MemorySnapshotStore::default();
        assert!(store.load().await.unwrap().is_none());

        let snapshot = EngineSnapshot {
            taken_at: Utc::now(),
            jobs: vec![sample_job()],
            dependencies: vec![],
            workers: vec![],
        };
        store.save(&snapshot).await.unwrap();
        assert_eq!(store.load().await.unwrap().unwrap().jobs.len(), 1);
    }

    fn sample_worker() -> Worker {
        Worker::from_spec(
            scheduler_core::model::WorkerSpec {
                id: "w1".to_string(),
                locator: "locator:w1".to_string(),
                capabilities: HashSet::new(),
                max_slots: 2,
                reserved_high_priority_slots: 0,
                load_factor: 1.0,
                priority_threshold: PriorityBand::Low,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn load_recovery_seed_converts_a_fresh_snapshot() {
        let store = MemorySnapshotStore::default();
        let taken_at = Utc::now();
        store
            .save(&EngineSnapshot {
                taken_at,
                jobs: vec![sample_job()],
                dependencies: vec![],
                workers: vec![sample_worker()],
            })
            .await
            .unwrap();

        let seed = load_recovery_seed(&store, taken_at + chrono::Duration::seconds(1), Duration::from_secs(60))
            .await
            .unwrap()
            .expect("fresh snapshot should yield a seed");
        assert_eq!(seed.workers.len(), 1);
        assert!(seed.dependencies.is_empty());
    }

    #[tokio::test]
    async fn load_recovery_seed_discards_a_stale_snapshot() {
        let store = MemorySnapshotStore::default();
        let taken_at = Utc::now();
        store
            .save(&EngineSnapshot {
                taken_at,
                jobs: vec![],
                dependencies: vec![],
                workers: vec![sample_worker()],
            })
            .await
            .unwrap();

        let seed = load_recovery_seed(&store, taken_at + chrono::Duration::hours(1), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(seed.is_none());
    }

    #[tokio::test]
    async fn load_recovery_seed_is_none_when_nothing_was_ever_saved() {
        let store = MemorySnapshotStore::default();
        let seed = load_recovery_seed(&store, Utc::now(), Duration::from_secs(60)).await.unwrap();
        assert!(seed.is_none());
    }
}
