//! Durable queue for mailbox sync work.
//!
//! Every job belongs to one tenant. Push notifications carry an idempotency
//! key so repeated deliveries for the same cursor collapse onto one row.

use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::{Connection, Row, params};
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::db::{
    Database, DbError, is_unique_violation, now_rfc3339, parse_optional_rfc3339, parse_rfc3339,
    to_rfc3339,
};
use crate::jobs::{JOB_TYPE_MAILBOX_SYNC, SyncJobPayload, sync_idempotency_key};

const JOB_COLUMNS: &str = "id, type, tenant_id, payload_json, priority, state, attempts, max_attempts, not_before, idempotency_key, last_error, heartbeat_at, created_at, updated_at, finished_at";

/// Attempts before a retryable failure becomes final.
pub const MAX_ATTEMPTS: i64 = 5;

const RETRY_CAP_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobState {
    fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub tenant_id: String,
    pub payload: Value,
    pub priority: i64,
    pub state: JobState,
    pub attempts: i64,
    pub max_attempts: i64,
    pub not_before: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    pub last_error: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn sync_payload(&self) -> Result<SyncJobPayload, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("payload json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("job is not running: {0}")]
    NotRunning(String),
    #[error("invalid job state value {0}")]
    InvalidState(String),
    #[error("invalid timestamp: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("retry delay out of range")]
    DelayOutOfRange,
    #[error("sync for {key} is already queued as {existing_job_id:?}")]
    DuplicateIdempotency {
        key: String,
        existing_job_id: Option<String>,
    },
}

#[derive(Clone)]
pub struct JobQueue {
    db: Database,
}

impl JobQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Queues a sync pass. A payload naming a history cursor is keyed by
    /// tenant and cursor, so a second push for it is rejected as a duplicate.
    pub async fn enqueue_sync(
        &self,
        payload: &SyncJobPayload,
        priority: i64,
    ) -> Result<String, QueueError> {
        let key = payload
            .history_id
            .as_deref()
            .map(|cursor| sync_idempotency_key(&payload.tenant_id, cursor));
        self.insert(
            JOB_TYPE_MAILBOX_SYNC,
            &payload.tenant_id,
            serde_json::to_value(payload)?,
            key,
            priority,
        )
        .await
    }

    pub(crate) async fn insert(
        &self,
        job_type: &str,
        tenant_id: &str,
        payload: Value,
        idempotency_key: Option<String>,
        priority: i64,
    ) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let inserted = conn
            .execute(
                "INSERT INTO jobs (id, type, tenant_id, payload_json, priority, state, max_attempts, idempotency_key, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6, ?7, ?8, ?8)",
                params![
                    id.clone(),
                    job_type,
                    tenant_id,
                    serde_json::to_string(&payload)?,
                    priority,
                    MAX_ATTEMPTS,
                    idempotency_key.clone(),
                    now
                ],
            )
            .await;

        match (inserted, idempotency_key) {
            (Ok(_), _) => {
                debug!(job_id = %id, tenant_id, job_type, "job queued");
                Ok(id)
            }
            (Err(err), Some(key)) if is_unique_violation(&err) => {
                let existing_job_id = job_id_for_key(&conn, &key).await.ok().flatten();
                Err(QueueError::DuplicateIdempotency {
                    key,
                    existing_job_id,
                })
            }
            (Err(err), _) => Err(err.into()),
        }
    }

    /// Moves the most urgent ready job to `running` and counts the attempt.
    pub async fn claim_next(&self) -> Result<Option<Job>, QueueError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE jobs
                     SET state = 'running', attempts = attempts + 1, heartbeat_at = ?1, updated_at = ?1
                     WHERE id = (
                         SELECT id FROM jobs
                         WHERE state = 'queued' AND (not_before IS NULL OR not_before <= ?1)
                         ORDER BY priority DESC, created_at
                         LIMIT 1
                     )
                     RETURNING {JOB_COLUMNS}"
                ),
                params![now],
            )
            .await?;
        rows.next().await?.map(row_to_job).transpose()
    }

    pub async fn heartbeat(&self, job_id: &str) -> Result<(), QueueError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE jobs SET heartbeat_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND state = 'running'
                 RETURNING id",
                params![job_id, now_rfc3339()],
            )
            .await?;
        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(QueueError::NotRunning(job_id.to_string())),
        }
    }

    pub async fn complete(&self, job_id: &str) -> Result<(), QueueError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE jobs
                 SET state = 'completed', last_error = NULL, finished_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND state = 'running'
                 RETURNING id",
                params![job_id, now_rfc3339()],
            )
            .await?;
        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(self.not_running(job_id).await),
        }
    }

    /// Records a failed attempt. Retryable failures go back to `queued` behind
    /// a jittered backoff until the attempts run out.
    pub async fn fail(&self, job_id: &str, error: &str, retryable: bool) -> Result<(), QueueError> {
        let job = self.fetch_job(job_id).await?;
        let now = now_rfc3339();
        let (state, not_before, finished_at) = if retryable && job.attempts < job.max_attempts {
            let delay = chrono::Duration::from_std(retry_delay(job.attempts))
                .map_err(|_| QueueError::DelayOutOfRange)?;
            (JobState::Queued, Some(to_rfc3339(Utc::now() + delay)), None)
        } else {
            (JobState::Failed, None, Some(now.clone()))
        };

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE jobs
                 SET state = ?2, not_before = ?3, last_error = ?4, finished_at = ?5, updated_at = ?6
                 WHERE id = ?1 AND state = 'running'
                 RETURNING id",
                params![job_id, state.as_str(), not_before, error, finished_at, now],
            )
            .await?;
        match rows.next().await? {
            Some(_) => {
                debug!(job_id, tenant_id = %job.tenant_id, state = state.as_str(), "job attempt failed");
                Ok(())
            }
            None => Err(self.not_running(job_id).await),
        }
    }

    pub async fn fetch_job(&self, job_id: &str) -> Result<Job, QueueError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![job_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => row_to_job(row),
            None => Err(QueueError::JobNotFound(job_id.to_string())),
        }
    }

    async fn not_running(&self, job_id: &str) -> QueueError {
        match self.fetch_job(job_id).await {
            Ok(_) => QueueError::NotRunning(job_id.to_string()),
            Err(err) => err,
        }
    }
}

/// Handle given to executors for the job being run.
#[derive(Clone)]
pub struct JobContext {
    queue: JobQueue,
    job: Job,
}

impl JobContext {
    pub fn new(queue: JobQueue, job: Job) -> Self {
        Self { queue, job }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// True when a retryable failure of this attempt would not be retried.
    pub fn is_final_attempt(&self) -> bool {
        self.job.attempts >= self.job.max_attempts
    }

    pub async fn heartbeat(&self) -> Result<(), QueueError> {
        self.queue.heartbeat(&self.job.id).await
    }
}

fn row_to_job(row: Row) -> Result<Job, QueueError> {
    let payload_json: String = row.get(3)?;
    let state: String = row.get(5)?;
    let not_before: Option<String> = row.get(8)?;
    let heartbeat_at: Option<String> = row.get(11)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;
    let finished_at: Option<String> = row.get(14)?;

    Ok(Job {
        id: row.get(0)?,
        job_type: row.get(1)?,
        tenant_id: row.get(2)?,
        payload: serde_json::from_str(&payload_json)?,
        priority: row.get(4)?,
        state: JobState::from_str(&state).ok_or(QueueError::InvalidState(state))?,
        attempts: row.get(6)?,
        max_attempts: row.get(7)?,
        not_before: parse_optional_rfc3339(not_before)?,
        idempotency_key: row.get(9)?,
        last_error: row.get(10)?,
        heartbeat_at: parse_optional_rfc3339(heartbeat_at)?,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
        finished_at: parse_optional_rfc3339(finished_at)?,
    })
}

/// 2^attempts seconds, capped at five minutes, scaled by 0.75..=1.25.
fn retry_delay(attempts: i64) -> Duration {
    let exponent = attempts.clamp(1, 16) as u32;
    let base = 2_u64.pow(exponent).min(RETRY_CAP_SECS);
    let jitter: f64 = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_secs_f64(base as f64 * jitter)
}

async fn job_id_for_key(conn: &Connection, key: &str) -> Result<Option<String>, libsql::Error> {
    let mut rows = conn
        .query("SELECT id FROM jobs WHERE idempotency_key = ?1", params![key])
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}
