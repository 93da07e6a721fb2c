use async_trait::async_trait;

use crate::mailbox::MailboxSyncEngine;
use crate::worker::{JobError, JobExecutor};
use crate::{Job, JobContext};

mod mailbox_sync;

pub use mailbox_sync::{SyncJobPayload, sync_idempotency_key};

pub const JOB_TYPE_MAILBOX_SYNC: &str = mailbox_sync::JOB_TYPE;

/// Routes claimed jobs to their handlers by type.
#[derive(Clone)]
pub struct JobDispatcher {
    pub sync: MailboxSyncEngine,
}

impl JobDispatcher {
    pub fn new(sync: MailboxSyncEngine) -> Self {
        Self { sync }
    }
}

#[async_trait]
impl JobExecutor for JobDispatcher {
    async fn execute(&self, job: Job, ctx: JobContext) -> Result<(), JobError> {
        match job.job_type.as_str() {
            JOB_TYPE_MAILBOX_SYNC => mailbox_sync::handle_mailbox_sync(self, job, &ctx).await,
            other => Err(JobError::Fatal(format!("unknown job type: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::SyncOptions;
    use crate::mailbox::session::tests::connector;
    use crate::notifications::NotificationRepository;
    use crate::queue::JobQueue;
    use crate::test_support::setup_db;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn unknown_job_type_is_fatal() {
        let (db, _dir) = setup_db().await;
        let queue = JobQueue::new(db.clone());
        let job_id = queue
            .insert("unknown.job", "t1", json!({}), None, 0)
            .await
            .expect("enqueue");
        let job = queue.fetch_job(&job_id).await.expect("fetch job");

        let engine = MailboxSyncEngine::new(
            db.clone(),
            connector(db.clone(), "http://127.0.0.1:9"),
            Arc::new(NotificationRepository::new(db)),
            SyncOptions::default(),
        );
        let dispatcher = JobDispatcher::new(engine);
        let ctx = JobContext::new(queue.clone(), job.clone());

        match dispatcher.execute(job, ctx).await {
            Err(JobError::Fatal(msg)) => assert!(msg.contains("unknown job type")),
            other => panic!("expected fatal error, got {other:?}"),
        }
    }
}
