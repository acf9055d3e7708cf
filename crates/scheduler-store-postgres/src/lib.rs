//! PostgreSQL implementation of the scheduler engine's storage boundary.
//!
//! # Features
//!
//! - `FOR UPDATE SKIP LOCKED` free of contention on the hot dispatch path
//!   (only [`scheduler_core::store::Store::issue_lease`] touches a row lock,
//!   and only for the single row being leased)
//! - CAS status transitions enforced by a `WHERE status = $expected` clause
//! - Idempotent lease completion keyed by `(lease_id, outcome_kind)`
//!
//! # Database schema
//!
//! ```sql
//! CREATE TYPE job_status AS ENUM ('pending', 'ready', 'running', 'completed', 'failed', 'cancelled', 'dead_lettered');
//! CREATE TYPE priority_band AS ENUM ('high', 'normal', 'low');
//! CREATE TYPE dependency_kind AS ENUM ('must_complete', 'must_succeed', 'must_start', 'soft');
//! CREATE TYPE worker_status AS ENUM ('active', 'draining', 'unreachable', 'dead');
//!
//! CREATE TABLE jobs (
//!     id UUID PRIMARY KEY,
//!     name TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!     status job_status NOT NULL,
//!     priority priority_band NOT NULL,
//!     capabilities JSONB NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     scheduled_at TIMESTAMPTZ,
//!     attempt_count INTEGER NOT NULL,
//!     max_attempts INTEGER NOT NULL,
//!     estimated_duration_secs BIGINT,
//!     last_error TEXT,
//!     version BIGINT NOT NULL DEFAULT 0
//! );
//! CREATE INDEX idx_jobs_active ON jobs (status) WHERE status NOT IN ('completed', 'cancelled', 'dead_lettered');
//!
//! CREATE TABLE dependencies (
//!     parent UUID NOT NULL REFERENCES jobs(id),
//!     child UUID NOT NULL REFERENCES jobs(id),
//!     kind dependency_kind NOT NULL,
//!     PRIMARY KEY (parent, child)
//! );
//!
//! CREATE TABLE workers (
//!     id TEXT PRIMARY KEY,
//!     locator TEXT NOT NULL,
//!     capabilities JSONB NOT NULL,
//!     max_slots INTEGER NOT NULL,
//!     reserved_high_priority_slots INTEGER NOT NULL,
//!     load_factor DOUBLE PRECISION NOT NULL,
//!     priority_threshold priority_band NOT NULL,
//!     status worker_status NOT NULL,
//!     last_heartbeat TIMESTAMPTZ NOT NULL,
//!     epoch BIGINT NOT NULL,
//!     lifetime_assigned BIGINT NOT NULL DEFAULT 0,
//!     lifetime_succeeded BIGINT NOT NULL DEFAULT 0,
//!     lifetime_failed BIGINT NOT NULL DEFAULT 0,
//!     avg_execution_secs DOUBLE PRECISION NOT NULL DEFAULT 1.0
//! );
//!
//! CREATE TABLE leases (
//!     id UUID PRIMARY KEY,
//!     job_id UUID NOT NULL REFERENCES jobs(id),
//!     worker_id TEXT NOT NULL REFERENCES workers(id),
//!     issued_at TIMESTAMPTZ NOT NULL,
//!     deadline TIMESTAMPTZ NOT NULL,
//!     attempt INTEGER NOT NULL,
//!     completed_outcome_kind TEXT
//! );
//! CREATE INDEX idx_leases_active ON leases (deadline) WHERE completed_outcome_kind IS NULL;
//!
//! CREATE TABLE dead_letters (
//!     job_id UUID PRIMARY KEY REFERENCES jobs(id),
//!     final_error TEXT NOT NULL,
//!     attempt_history JSONB NOT NULL,
//!     payload JSONB NOT NULL,
//!     dead_lettered_at TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE TABLE history (
//!     sequence BIGSERIAL PRIMARY KEY,
//!     timestamp TIMESTAMPTZ NOT NULL,
//!     actor TEXT NOT NULL,
//!     job_id UUID,
//!     worker_id TEXT,
//!     event_kind TEXT NOT NULL,
//!     details JSONB NOT NULL,
//!     relayed BOOLEAN NOT NULL DEFAULT FALSE
//! );
//! CREATE INDEX idx_history_unrelayed ON history (sequence) WHERE NOT relayed;
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use scheduler_store_postgres::PgStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/scheduler").await?;
//! let store = PgStore::new(pool);
//! let core = scheduler_core::SchedulerCore::new(Arc::new(store), clock, observer, config)?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::error::{StoreError, StoreResult};
use scheduler_core::model::{
    Dependency, DependencyKind, DlqEntry, HistoryEntry, Job, JobId, JobStatus, Lease, LeaseId,
    Outcome, PriorityBand, Worker, WorkerId, WorkerSpec, WorkerStatus,
};
use scheduler_core::store::{DependencyDirection, Store};
use sqlx::{PgPool, Row};

fn map_sqlx_err(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => StoreError::Duplicate,
        other => StoreError::Unavailable(other.to_string()),
    }
}

fn job_status_str(s: JobStatus) -> &'static str {
    match s {
        JobStatus::Pending => "pending",
        JobStatus::Ready => "ready",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
        JobStatus::DeadLettered => "dead_lettered",
    }
}

fn job_status_from_str(s: &str) -> StoreResult<JobStatus> {
    Ok(match s {
        "pending" => JobStatus::Pending,
        "ready" => JobStatus::Ready,
        "running" => JobStatus::Running,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        "dead_lettered" => JobStatus::DeadLettered,
        other => return Err(StoreError::Unavailable(format!("unknown job status {other}"))),
    })
}

fn priority_str(p: PriorityBand) -> &'static str {
    match p {
        PriorityBand::High => "high",
        PriorityBand::Normal => "normal",
        PriorityBand::Low => "low",
    }
}

fn priority_from_str(s: &str) -> StoreResult<PriorityBand> {
    Ok(match s {
        "high" => PriorityBand::High,
        "normal" => PriorityBand::Normal,
        "low" => PriorityBand::Low,
        other => return Err(StoreError::Unavailable(format!("unknown priority band {other}"))),
    })
}

fn dependency_kind_str(k: DependencyKind) -> &'static str {
    match k {
        DependencyKind::MustComplete => "must_complete",
        DependencyKind::MustSucceed => "must_succeed",
        DependencyKind::MustStart => "must_start",
        DependencyKind::Soft => "soft",
    }
}

fn dependency_kind_from_str(s: &str) -> StoreResult<DependencyKind> {
    Ok(match s {
        "must_complete" => DependencyKind::MustComplete,
        "must_succeed" => DependencyKind::MustSucceed,
        "must_start" => DependencyKind::MustStart,
        "soft" => DependencyKind::Soft,
        other => return Err(StoreError::Unavailable(format!("unknown dependency kind {other}"))),
    })
}

fn worker_status_str(s: WorkerStatus) -> &'static str {
    match s {
        WorkerStatus::Active => "active",
        WorkerStatus::Draining => "draining",
        WorkerStatus::Unreachable => "unreachable",
        WorkerStatus::Dead => "dead",
    }
}

fn worker_status_from_str(s: &str) -> StoreResult<WorkerStatus> {
    Ok(match s {
        "active" => WorkerStatus::Active,
        "draining" => WorkerStatus::Draining,
        "unreachable" => WorkerStatus::Unreachable,
        "dead" => WorkerStatus::Dead,
        other => return Err(StoreError::Unavailable(format!("unknown worker status {other}"))),
    })
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<Job> {
    let capabilities: serde_json::Value = row.try_get("capabilities").map_err(map_sqlx_err)?;
    Ok(Job {
        id: row.try_get("id").map_err(map_sqlx_err)?,
        name: row.try_get("name").map_err(map_sqlx_err)?,
        payload: row.try_get("payload").map_err(map_sqlx_err)?,
        status: job_status_from_str(row.try_get::<String, _>("status").map_err(map_sqlx_err)?.as_str())?,
        priority: priority_from_str(row.try_get::<String, _>("priority").map_err(map_sqlx_err)?.as_str())?,
        capabilities: serde_json::from_value(capabilities).unwrap_or_default(),
        created_at: row.try_get("created_at").map_err(map_sqlx_err)?,
        scheduled_at: row.try_get("scheduled_at").map_err(map_sqlx_err)?,
        attempt_count: row.try_get::<i32, _>("attempt_count").map_err(map_sqlx_err)? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts").map_err(map_sqlx_err)? as u32,
        estimated_duration_secs: row.try_get("estimated_duration_secs").map_err(map_sqlx_err)?,
        last_error: row.try_get("last_error").map_err(map_sqlx_err)?,
        version: row.try_get("version").map_err(map_sqlx_err)?,
    })
}

fn worker_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<Worker> {
    let capabilities: serde_json::Value = row.try_get("capabilities").map_err(map_sqlx_err)?;
    Ok(Worker {
        id: row.try_get("id").map_err(map_sqlx_err)?,
        locator: row.try_get("locator").map_err(map_sqlx_err)?,
        capabilities: serde_json::from_value(capabilities).unwrap_or_default(),
        max_slots: row.try_get::<i32, _>("max_slots").map_err(map_sqlx_err)? as u32,
        reserved_high_priority_slots: row
            .try_get::<i32, _>("reserved_high_priority_slots")
            .map_err(map_sqlx_err)? as u32,
        load_factor: row.try_get("load_factor").map_err(map_sqlx_err)?,
        priority_threshold: priority_from_str(
            row.try_get::<String, _>("priority_threshold").map_err(map_sqlx_err)?.as_str(),
        )?,
        status: worker_status_from_str(row.try_get::<String, _>("status").map_err(map_sqlx_err)?.as_str())?,
        assigned_jobs: Default::default(),
        last_heartbeat: row.try_get("last_heartbeat").map_err(map_sqlx_err)?,
        epoch: row.try_get::<i64, _>("epoch").map_err(map_sqlx_err)? as u64,
        lifetime_assigned: row.try_get::<i64, _>("lifetime_assigned").map_err(map_sqlx_err)? as u64,
        lifetime_succeeded: row.try_get::<i64, _>("lifetime_succeeded").map_err(map_sqlx_err)? as u64,
        lifetime_failed: row.try_get::<i64, _>("lifetime_failed").map_err(map_sqlx_err)? as u64,
        avg_execution_secs: row.try_get("avg_execution_secs").map_err(map_sqlx_err)?,
    })
}

/// PostgreSQL-backed [`Store`]. Every method opens at most one transaction;
/// callers needing a wider atomic unit (e.g. `SchedulerCore::submit_job`'s
/// all-or-nothing admission) compose several `Store` calls and roll back via
/// compensating actions rather than a shared transaction handle, since the
/// `Store` trait is the engine's only storage seam.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn put_job(&self, job: &Job) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, name, payload, status, priority, capabilities, created_at,
                scheduled_at, attempt_count, max_attempts, estimated_duration_secs,
                last_error, version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(&job.payload)
        .bind(job_status_str(job.status))
        .bind(priority_str(job.priority))
        .bind(serde_json::to_value(&job.capabilities).unwrap_or(serde_json::Value::Null))
        .bind(job.created_at)
        .bind(job.scheduled_at)
        .bind(job.attempt_count as i32)
        .bind(job.max_attempts as i32)
        .bind(job.estimated_duration_secs)
        .bind(&job.last_error)
        .bind(job.version)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> StoreResult<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        job_from_row(&row)
    }

    async fn list_active_jobs(&self) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status NOT IN ('completed', 'cancelled', 'dead_lettered')",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn update_job_status(&self, id: JobId, expected: JobStatus, new: JobStatus) -> StoreResult<()> {
        let result = sqlx::query("UPDATE jobs SET status = $1, version = version + 1 WHERE id = $2 AND status = $3")
            .bind(job_status_str(new))
            .bind(id)
            .bind(job_status_str(expected))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict);
        }
        Ok(())
    }

    async fn add_dependency(&self, dep: Dependency) -> StoreResult<()> {
        sqlx::query("INSERT INTO dependencies (parent, child, kind) VALUES ($1, $2, $3)")
            .bind(dep.parent)
            .bind(dep.child)
            .bind(dependency_kind_str(dep.kind))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn remove_dependency(&self, parent: JobId, child: JobId) -> StoreResult<()> {
        sqlx::query("DELETE FROM dependencies WHERE parent = $1 AND child = $2")
            .bind(parent)
            .bind(child)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn list_dependencies(&self, job_id: JobId, direction: DependencyDirection) -> StoreResult<Vec<Dependency>> {
        let query = match direction {
            DependencyDirection::Children => "SELECT parent, child, kind FROM dependencies WHERE parent = $1",
            DependencyDirection::Parents => "SELECT parent, child, kind FROM dependencies WHERE child = $1",
        };
        let rows = sqlx::query(query)
            .bind(job_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.iter()
            .map(|row| {
                Ok(Dependency {
                    parent: row.try_get("parent").map_err(map_sqlx_err)?,
                    child: row.try_get("child").map_err(map_sqlx_err)?,
                    kind: dependency_kind_from_str(row.try_get::<String, _>("kind").map_err(map_sqlx_err)?.as_str())?,
                })
            })
            .collect()
    }

    async fn list_all_dependencies(&self) -> StoreResult<Vec<Dependency>> {
        let rows = sqlx::query("SELECT parent, child, kind FROM dependencies")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.iter()
            .map(|row| {
                Ok(Dependency {
                    parent: row.try_get("parent").map_err(map_sqlx_err)?,
                    child: row.try_get("child").map_err(map_sqlx_err)?,
                    kind: dependency_kind_from_str(row.try_get::<String, _>("kind").map_err(map_sqlx_err)?.as_str())?,
                })
            })
            .collect()
    }

    async fn put_worker(&self, spec: WorkerSpec, now: DateTime<Utc>) -> StoreResult<Worker> {
        let row = sqlx::query(
            r#"
            INSERT INTO workers (
                id, locator, capabilities, max_slots, reserved_high_priority_slots,
                load_factor, priority_threshold, status, last_heartbeat, epoch
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, 'active', $8, 0)
            ON CONFLICT (id) DO UPDATE SET
                locator = EXCLUDED.locator,
                capabilities = EXCLUDED.capabilities,
                max_slots = EXCLUDED.max_slots,
                reserved_high_priority_slots = EXCLUDED.reserved_high_priority_slots,
                load_factor = EXCLUDED.load_factor,
                priority_threshold = EXCLUDED.priority_threshold,
                status = 'active',
                last_heartbeat = EXCLUDED.last_heartbeat,
                epoch = workers.epoch + 1
            RETURNING *
            "#,
        )
        .bind(&spec.id)
        .bind(&spec.locator)
        .bind(serde_json::to_value(&spec.capabilities).unwrap_or(serde_json::Value::Null))
        .bind(spec.max_slots as i32)
        .bind(spec.reserved_high_priority_slots as i32)
        .bind(spec.load_factor)
        .bind(priority_str(spec.priority_threshold))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        worker_from_row(&row)
    }

    async fn get_worker(&self, id: &WorkerId) -> StoreResult<Worker> {
        let row = sqlx::query("SELECT * FROM workers WHERE id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        worker_from_row(&row)
    }

    async fn list_workers(&self) -> StoreResult<Vec<Worker>> {
        let rows = sqlx::query("SELECT * FROM workers")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.iter().map(worker_from_row).collect()
    }

    async fn update_worker_heartbeat(&self, id: &WorkerId, now: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query("UPDATE workers SET last_heartbeat = $1 WHERE id = $2")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_worker_status(&self, id: &WorkerId, expected: WorkerStatus, new: WorkerStatus) -> StoreResult<()> {
        let result = sqlx::query("UPDATE workers SET status = $1 WHERE id = $2 AND status = $3")
            .bind(worker_status_str(new))
            .bind(id)
            .bind(worker_status_str(expected))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict);
        }
        Ok(())
    }

    async fn issue_lease(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        attempt: u32,
        issued_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> StoreResult<Lease> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let updated = sqlx::query(
            "UPDATE jobs SET status = 'running', attempt_count = $1, version = version + 1 WHERE id = $2 AND status = 'ready'",
        )
        .bind(attempt as i32)
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Conflict);
        }

        let lease_id = uuid::Uuid::new_v4();
        sqlx::query(
            "INSERT INTO leases (id, job_id, worker_id, issued_at, deadline, attempt) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(lease_id)
        .bind(job_id)
        .bind(worker_id)
        .bind(issued_at)
        .bind(deadline)
        .bind(attempt as i32)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;

        Ok(Lease {
            id: lease_id,
            job_id,
            worker_id: worker_id.clone(),
            issued_at,
            deadline,
            attempt,
        })
    }

    async fn get_active_lease(&self, job_id: JobId) -> StoreResult<Option<Lease>> {
        let row = sqlx::query(
            "SELECT * FROM leases WHERE job_id = $1 AND completed_outcome_kind IS NULL ORDER BY issued_at DESC LIMIT 1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        row.map(|row| {
            Ok(Lease {
                id: row.try_get("id").map_err(map_sqlx_err)?,
                job_id: row.try_get("job_id").map_err(map_sqlx_err)?,
                worker_id: row.try_get("worker_id").map_err(map_sqlx_err)?,
                issued_at: row.try_get("issued_at").map_err(map_sqlx_err)?,
                deadline: row.try_get("deadline").map_err(map_sqlx_err)?,
                attempt: row.try_get::<i32, _>("attempt").map_err(map_sqlx_err)? as u32,
            })
        })
        .transpose()
    }

    async fn list_active_leases(&self) -> StoreResult<Vec<Lease>> {
        let rows = sqlx::query("SELECT * FROM leases WHERE completed_outcome_kind IS NULL")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.iter()
            .map(|row| {
                Ok(Lease {
                    id: row.try_get("id").map_err(map_sqlx_err)?,
                    job_id: row.try_get("job_id").map_err(map_sqlx_err)?,
                    worker_id: row.try_get("worker_id").map_err(map_sqlx_err)?,
                    issued_at: row.try_get("issued_at").map_err(map_sqlx_err)?,
                    deadline: row.try_get("deadline").map_err(map_sqlx_err)?,
                    attempt: row.try_get::<i32, _>("attempt").map_err(map_sqlx_err)? as u32,
                })
            })
            .collect()
    }

    async fn complete_lease(&self, lease_id: LeaseId, outcome: Outcome) -> StoreResult<Job> {
        let (outcome_kind, terminal, error) = match &outcome {
            Outcome::Completed => ("completed", JobStatus::Completed, None),
            Outcome::Cancelled => ("cancelled", JobStatus::Cancelled, None),
            Outcome::Failed { error, .. } => ("failed", JobStatus::Failed, Some(error.clone())),
        };

        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let lease_row = sqlx::query("SELECT job_id, completed_outcome_kind FROM leases WHERE id = $1 FOR UPDATE")
            .bind(lease_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_err)?
            .ok_or(StoreError::NotFound)?;

        let job_id: JobId = lease_row.try_get("job_id").map_err(map_sqlx_err)?;
        let already: Option<String> = lease_row.try_get("completed_outcome_kind").map_err(map_sqlx_err)?;
        if already.as_deref() == Some(outcome_kind) {
            let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
                .bind(job_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
            return job_from_row(&row);
        }

        sqlx::query("UPDATE leases SET completed_outcome_kind = $1 WHERE id = $2")
            .bind(outcome_kind)
            .bind(lease_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

        // Retry dispositions are recorded separately by `SchedulerCore`'s
        // failure handler (it needs the attempt/backoff decision); this
        // store call only ever records a terminal status here.
        sqlx::query("UPDATE jobs SET status = $1, last_error = COALESCE($2, last_error), version = version + 1 WHERE id = $3")
            .bind(job_status_str(terminal))
            .bind(error)
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        let job = job_from_row(&row)?;

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(job)
    }

    async fn append_history(&self, entry: HistoryEntry) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO history (timestamp, actor, job_id, worker_id, event_kind, details) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(entry.timestamp)
        .bind(&entry.actor)
        .bind(entry.job_id)
        .bind(&entry.worker_id)
        .bind(&entry.event_kind)
        .bind(&entry.details)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn unrelayed_history(&self, limit: usize) -> StoreResult<Vec<(u64, HistoryEntry)>> {
        let rows = sqlx::query("SELECT * FROM history WHERE NOT relayed ORDER BY sequence ASC LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.iter()
            .map(|row| {
                let sequence: i64 = row.try_get("sequence").map_err(map_sqlx_err)?;
                Ok((
                    sequence as u64,
                    HistoryEntry {
                        timestamp: row.try_get("timestamp").map_err(map_sqlx_err)?,
                        actor: row.try_get("actor").map_err(map_sqlx_err)?,
                        job_id: row.try_get("job_id").map_err(map_sqlx_err)?,
                        worker_id: row.try_get("worker_id").map_err(map_sqlx_err)?,
                        event_kind: row.try_get("event_kind").map_err(map_sqlx_err)?,
                        details: row.try_get("details").map_err(map_sqlx_err)?,
                    },
                ))
            })
            .collect()
    }

    async fn mark_history_relayed(&self, sequence: u64) -> StoreResult<()> {
        sqlx::query("UPDATE history SET relayed = TRUE WHERE sequence = $1")
            .bind(sequence as i64)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn put_dlq(&self, entry: DlqEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters (job_id, final_error, attempt_history, payload, dead_lettered_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (job_id) DO UPDATE SET
                final_error = EXCLUDED.final_error,
                attempt_history = EXCLUDED.attempt_history,
                dead_lettered_at = EXCLUDED.dead_lettered_at
            "#,
        )
        .bind(entry.job_id)
        .bind(&entry.final_error)
        .bind(serde_json::to_value(&entry.attempt_history).unwrap_or(serde_json::Value::Null))
        .bind(&entry.payload)
        .bind(entry.dead_lettered_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn list_dlq(&self, offset: usize, limit: usize) -> StoreResult<Vec<DlqEntry>> {
        let rows = sqlx::query("SELECT * FROM dead_letters ORDER BY dead_lettered_at DESC OFFSET $1 LIMIT $2")
            .bind(offset as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.iter().map(dlq_from_row).collect()
    }

    async fn get_dlq(&self, job_id: JobId) -> StoreResult<DlqEntry> {
        let row = sqlx::query("SELECT * FROM dead_letters WHERE job_id = $1")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        dlq_from_row(&row)
    }

    async fn remove_dlq(&self, job_id: JobId) -> StoreResult<()> {
        sqlx::query("DELETE FROM dead_letters WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }
}

fn dlq_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<DlqEntry> {
    let history: serde_json::Value = row.try_get("attempt_history").map_err(map_sqlx_err)?;
    Ok(DlqEntry {
        job_id: row.try_get("job_id").map_err(map_sqlx_err)?,
        final_error: row.try_get("final_error").map_err(map_sqlx_err)?,
        attempt_history: serde_json::from_value(history).unwrap_or_default(),
        payload: row.try_get("payload").map_err(map_sqlx_err)?,
        dead_lettered_at: row.try_get("dead_lettered_at").map_err(map_sqlx_err)?,
    })
}
