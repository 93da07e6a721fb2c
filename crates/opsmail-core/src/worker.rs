use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::queue::{Job, JobContext, JobQueue, QueueError};

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            JobError::Retryable(msg) | JobError::Fatal(msg) => msg,
        }
    }
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: Job, ctx: JobContext) -> Result<(), JobError>;
}

/// Claims and runs jobs one at a time until `shutdown` fires.
pub async fn run_worker<E: JobExecutor>(
    queue: JobQueue,
    executor: E,
    config: WorkerConfig,
    shutdown: CancellationToken,
) {
    let executor = Arc::new(executor);
    info!("job worker started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match queue.claim_next().await {
            Ok(Some(job)) => {
                let span = info_span!(
                    "job",
                    job_id = %job.id,
                    job_type = %job.job_type,
                    tenant_id = %job.tenant_id
                );
                handle_job(
                    queue.clone(),
                    executor.clone(),
                    config,
                    shutdown.clone(),
                    job,
                )
                .instrument(span)
                .await
            }
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(config.poll_interval) => {}
                }
            }
            Err(err) => {
                error!(error = %err, "failed to claim next job");
                sleep(config.poll_interval).await;
            }
        }
    }
    info!("job worker stopped");
}

async fn handle_job<E: JobExecutor>(
    queue: JobQueue,
    executor: Arc<E>,
    config: WorkerConfig,
    shutdown: CancellationToken,
    job: Job,
) {
    info!(attempt = job.attempts, "processing job");
    let heartbeat_cancel = shutdown.child_token();
    let heartbeat_queue = queue.clone();
    let job_id = job.id.clone();
    let heartbeat_interval = config.heartbeat_interval;

    let heartbeat_task = tokio::spawn({
        let heartbeat_cancel = heartbeat_cancel.clone();
        async move {
            loop {
                tokio::select! {
                    _ = heartbeat_cancel.cancelled() => break,
                    _ = sleep(heartbeat_interval) => {
                        if let Err(err) = heartbeat_queue.heartbeat(&job_id).await {
                            warn!(job_id = %job_id, error = %err, "heartbeat failed");
                        }
                    }
                }
            }
        }
    });

    let ctx = JobContext::new(queue.clone(), job.clone());
    let result = AssertUnwindSafe(executor.execute(job.clone(), ctx))
        .catch_unwind()
        .await;

    let finalize = match result {
        Ok(Ok(())) => FinalizeAction::Complete,
        Ok(Err(job_err)) => FinalizeAction::Fail {
            message: job_err.message().to_string(),
            retry: job_err.is_retryable(),
        },
        Err(panic) => {
            let err_msg = if let Some(msg) = panic.downcast_ref::<&str>() {
                msg.to_string()
            } else if let Some(msg) = panic.downcast_ref::<String>() {
                msg.clone()
            } else {
                "worker panic".to_string()
            };
            warn!("job panicked: {err_msg}");
            FinalizeAction::Fail {
                message: err_msg,
                retry: true,
            }
        }
    };

    if let Err(err) = finalize_job(
        &queue,
        &job,
        finalize,
        &heartbeat_cancel,
        heartbeat_interval,
        &shutdown,
    )
    .await
    {
        error!(error = %err, "failed to persist job outcome");
    }

    heartbeat_cancel.cancel();
    let _ = heartbeat_task.await;
}

enum FinalizeAction {
    Complete,
    Fail { message: String, retry: bool },
}

fn finalize_backoff(heartbeat_interval: Duration) -> Duration {
    (heartbeat_interval / 2).clamp(Duration::from_millis(10), Duration::from_secs(5))
}

async fn finalize_job(
    queue: &JobQueue,
    job: &Job,
    action: FinalizeAction,
    heartbeat_cancel: &CancellationToken,
    heartbeat_interval: Duration,
    shutdown: &CancellationToken,
) -> Result<(), QueueError> {
    let mut attempt: u32 = 0;

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

        let outcome = match &action {
            FinalizeAction::Complete => queue.complete(&job.id).await,
            FinalizeAction::Fail { message, retry } => queue.fail(&job.id, message, *retry).await,
        };

        match outcome {
            Ok(()) => {
                match &action {
                    FinalizeAction::Complete => info!("job completed"),
                    FinalizeAction::Fail { retry: true, message } => {
                        warn!(error = %message, "job failed and may retry")
                    }
                    FinalizeAction::Fail { retry: false, message } => {
                        warn!(error = %message, "job failed permanently")
                    }
                }
                return Ok(());
            }
            Err(QueueError::NotRunning(_)) => {
                info!("job already moved out of running state");
                return Ok(());
            }
            Err(err) => {
                attempt = attempt.saturating_add(1);
                warn!(attempt, error = %err, "failed to persist job outcome; retrying");

                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = sleep(finalize_backoff(heartbeat_interval)) => {},
                    _ = heartbeat_cancel.cancelled() => return Err(err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::SyncJobPayload;
    use crate::queue::JobState;
    use crate::test_support::setup_db;
    use tempfile::TempDir;
    use tokio::time::timeout;

    async fn setup_queue() -> (JobQueue, TempDir) {
        let (db, dir) = setup_db().await;
        (JobQueue::new(db), dir)
    }

    async fn queue_sync(queue: &JobQueue) -> String {
        queue
            .enqueue_sync(&SyncJobPayload::new("t1", "test"), 0)
            .await
            .expect("enqueue")
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(5),
            heartbeat_interval: Duration::from_millis(10),
        }
    }

    async fn wait_for<F>(queue: &JobQueue, job_id: &str, done: F)
    where
        F: Fn(&Job) -> bool,
    {
        timeout(Duration::from_secs(2), async {
            loop {
                let job = queue.fetch_job(job_id).await.expect("fetch");
                if done(&job) {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job should settle within timeout");
    }

    struct CompletingExecutor;

    #[async_trait]
    impl JobExecutor for CompletingExecutor {
        async fn execute(&self, _job: Job, ctx: JobContext) -> Result<(), JobError> {
            ctx.heartbeat()
                .await
                .map_err(|err| JobError::Fatal(err.to_string()))
        }
    }

    #[tokio::test]
    async fn worker_completes_job() {
        let (queue, _dir) = setup_queue().await;
        let job_id = queue_sync(&queue).await;

        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            queue.clone(),
            CompletingExecutor,
            fast_config(),
            shutdown.clone(),
        ));

        wait_for(&queue, &job_id, |job| job.state == JobState::Completed).await;
        shutdown.cancel();
        let _ = worker.await;

        let job = queue.fetch_job(&job_id).await.expect("fetch final");
        assert!(job.last_error.is_none());
        assert!(job.finished_at.is_some());
    }

    struct RetryExecutor;

    #[async_trait]
    impl JobExecutor for RetryExecutor {
        async fn execute(&self, job: Job, _ctx: JobContext) -> Result<(), JobError> {
            Err(JobError::Retryable(format!("retry {}", job.id)))
        }
    }

    #[tokio::test]
    async fn worker_retries_on_retryable_error() {
        let (queue, _dir) = setup_queue().await;
        let job_id = queue_sync(&queue).await;

        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            queue.clone(),
            RetryExecutor,
            fast_config(),
            shutdown.clone(),
        ));

        wait_for(&queue, &job_id, |job| {
            job.state == JobState::Queued && job.last_error.is_some()
        })
        .await;
        shutdown.cancel();
        let _ = worker.await;

        let job = queue.fetch_job(&job_id).await.expect("fetch final");
        assert!(job.last_error.unwrap_or_default().contains("retry"));
        assert!(job.not_before.is_some());
    }

    struct FatalExecutor;

    #[async_trait]
    impl JobExecutor for FatalExecutor {
        async fn execute(&self, job: Job, _ctx: JobContext) -> Result<(), JobError> {
            Err(JobError::Fatal(format!("fatal {}", job.id)))
        }
    }

    #[tokio::test]
    async fn worker_marks_fatal_as_failed() {
        let (queue, _dir) = setup_queue().await;
        let job_id = queue_sync(&queue).await;

        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            queue.clone(),
            FatalExecutor,
            fast_config(),
            shutdown.clone(),
        ));

        wait_for(&queue, &job_id, |job| job.state == JobState::Failed).await;
        shutdown.cancel();
        let _ = worker.await;

        let job = queue.fetch_job(&job_id).await.expect("fetch final");
        assert!(job.not_before.is_none());
        assert!(job.last_error.unwrap_or_default().contains("fatal"));
    }

    struct PanicExecutor;

    #[async_trait]
    impl JobExecutor for PanicExecutor {
        async fn execute(&self, _job: Job, _ctx: JobContext) -> Result<(), JobError> {
            panic!("panic in executor");
        }
    }

    #[tokio::test]
    async fn worker_marks_panic_as_retryable_failure() {
        let (queue, _dir) = setup_queue().await;
        let job_id = queue_sync(&queue).await;

        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            queue.clone(),
            PanicExecutor,
            fast_config(),
            shutdown.clone(),
        ));

        wait_for(&queue, &job_id, |job| {
            job.state == JobState::Queued && job.last_error.is_some()
        })
        .await;
        shutdown.cancel();
        let _ = worker.await;

        let job = queue.fetch_job(&job_id).await.expect("fetch final");
        assert!(job.last_error.unwrap_or_default().contains("panic"));
    }

    #[test]
    fn finalize_backoff_is_clamped() {
        assert_eq!(
            finalize_backoff(Duration::from_millis(4)),
            Duration::from_millis(10)
        );
        assert_eq!(
            finalize_backoff(Duration::from_secs(60)),
            Duration::from_secs(5)
        );
        assert_eq!(
            finalize_backoff(Duration::from_secs(2)),
            Duration::from_secs(1)
        );
    }
}
