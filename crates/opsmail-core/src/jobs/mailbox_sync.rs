use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::gmail::ErrorClass;
use crate::jobs::JobDispatcher;
use crate::mailbox::SyncError;
use crate::{Job, JobContext, JobError};

pub const JOB_TYPE: &str = "mailbox.sync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJobPayload {
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
    #[serde(default)]
    pub reason: String,
}

impl SyncJobPayload {
    pub fn new(tenant_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            history_id: None,
            reason: reason.into(),
        }
    }
}

/// Push notifications for the same cursor collapse onto one job.
pub fn sync_idempotency_key(tenant_id: &str, history_id: &str) -> String {
    format!("{JOB_TYPE}:{tenant_id}:{history_id}")
}

pub async fn handle_mailbox_sync(
    dispatcher: &JobDispatcher,
    job: Job,
    ctx: &JobContext,
) -> Result<(), JobError> {
    let payload = job
        .sync_payload()
        .map_err(|err| JobError::Fatal(format!("invalid {JOB_TYPE} payload: {err}")))?;

    match dispatcher.sync.sync(&payload.tenant_id).await {
        Ok(report) => {
            info!(
                tenant_id = %payload.tenant_id,
                reason = %payload.reason,
                ingested = report.messages_ingested,
                "mailbox sync job finished"
            );
            Ok(())
        }
        Err(err) => {
            let mapped = map_sync_error(&err);
            if mapped.is_retryable() && ctx.is_final_attempt() {
                warn!(tenant_id = %payload.tenant_id, error = %err, "sync retries exhausted");
                dispatcher
                    .sync
                    .mark_error(&payload.tenant_id, &err.to_string())
                    .await;
            }
            Err(mapped)
        }
    }
}

pub(crate) fn map_sync_error(err: &SyncError) -> JobError {
    let message = format!("mailbox sync: {err}");
    if err.is_transient() {
        return JobError::Retryable(message);
    }
    match err {
        SyncError::Provider(provider) => match provider.classify() {
            ErrorClass::Transient => JobError::Retryable(message),
            ErrorClass::Auth | ErrorClass::NotFound | ErrorClass::Permanent => {
                JobError::Fatal(message)
            }
        },
        // Passes are idempotent, so storage errors are retried.
        SyncError::Integration(_)
        | SyncError::Tenant(_)
        | SyncError::Contact(_)
        | SyncError::Message(_) => JobError::Retryable(message),
        SyncError::NotConnected(_) | SyncError::Session(_) | SyncError::Timeout(_) => {
            JobError::Fatal(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::GmailClientError;
    use crate::integrations::SyncState;
    use crate::mailbox::session::tests::{connect_mailbox, connector};
    use crate::mailbox::{MailboxSyncEngine, SyncOptions};
    use crate::notifications::NotificationRepository;
    use crate::queue::JobQueue;
    use crate::test_support::{insert_tenant, setup_db};
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn payload_accepts_missing_optional_fields() {
        let payload: SyncJobPayload =
            serde_json::from_value(serde_json::json!({"tenant_id": "t1"})).expect("payload");
        assert_eq!(payload.tenant_id, "t1");
        assert_eq!(payload.history_id, None);
        assert_eq!(sync_idempotency_key("t1", "77"), "mailbox.sync:t1:77");
    }

    #[test]
    fn timeouts_retry_and_disconnects_do_not() {
        assert!(map_sync_error(&SyncError::Timeout(Duration::from_secs(1))).is_retryable());
        assert!(!map_sync_error(&SyncError::NotConnected("t1".into())).is_retryable());
        let auth = SyncError::Provider(GmailClientError::AuthExpired("revoked".into()));
        assert!(!map_sync_error(&auth).is_retryable());
    }

    #[tokio::test]
    async fn transient_failure_marks_error_only_on_final_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/profile"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (db, _dir) = setup_db().await;
        insert_tenant(&db, "t1", None).await;
        let connector = connector(db.clone(), &server.uri());
        connect_mailbox(&connector, "t1", "shop@acme.test").await;
        let engine = MailboxSyncEngine::new(
            db.clone(),
            connector.clone(),
            Arc::new(NotificationRepository::new(db.clone())),
            SyncOptions::default(),
        );
        let dispatcher = JobDispatcher::new(engine);

        let queue = JobQueue::new(db.clone());
        let job_id = queue
            .enqueue_sync(&SyncJobPayload::new("t1", "test"), 0)
            .await
            .expect("enqueue");
        let mut job = queue.fetch_job(&job_id).await.expect("job");

        job.attempts = 1;
        let ctx = JobContext::new(queue.clone(), job.clone());
        let err = handle_mailbox_sync(&dispatcher, job.clone(), &ctx)
            .await
            .expect_err("503");
        assert!(err.is_retryable());
        let state = connector.integrations().get_by_tenant("t1").await.expect("integration").state;
        assert_eq!(state.sync_state, SyncState::Uninitialized);
        assert_eq!(state.sync_error, None);

        job.attempts = job.max_attempts;
        let ctx = JobContext::new(queue.clone(), job.clone());
        handle_mailbox_sync(&dispatcher, job, &ctx)
            .await
            .expect_err("503");
        let state = connector.integrations().get_by_tenant("t1").await.expect("integration").state;
        assert_eq!(state.sync_state, SyncState::Error);
        assert!(state.sync_error.is_some());
    }
}
