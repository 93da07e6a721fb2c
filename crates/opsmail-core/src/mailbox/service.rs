//! Tenant-facing mailbox operations: connecting, status, manual sync, staff
//! replies and push notifications.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::session::{MailboxConnector, SessionError};
use super::sync::{MailboxSyncEngine, SyncError};
use crate::access::Actor;
use crate::automation::{
    AutomationDispatcher, DeliveryError, DispatchError, OutboundEmail, TriggerEvent,
};
use crate::contacts::{ContactError, ContactRepository};
use crate::conversations::{Conversation, ConversationError, ConversationRepository};
use crate::db::Database;
use crate::gmail::mime_builder::{
    EmailAddress, MimeAttachment, dedup_message_ids, reply_subject, text_to_html,
};
use crate::gmail::{ConnectState, GmailClientError, OAuthError};
use crate::integrations::{IntegrationError, MailboxIntegration, StoredCredential, SyncState};
use crate::jobs::SyncJobPayload;
use crate::messages::{ConversationMessage, MessageError, MessageRepository, NewMessage};
use crate::queue::{JobQueue, QueueError};
use crate::tenants::{TenantError, TenantRepository};
use crate::vault::VaultError;

pub const USER_DISCONNECT_REASON: &str = "disconnected by user";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxStatus {
    pub connected: bool,
    pub email: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub sync_state: SyncState,
    pub error: Option<String>,
    pub watch_expiration: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl MailboxStatus {
    fn disconnected() -> Self {
        Self {
            connected: false,
            email: None,
            last_sync: None,
            sync_state: SyncState::Uninitialized,
            error: None,
            watch_expiration: None,
            reason: None,
        }
    }

    fn from_integration(integration: &MailboxIntegration) -> Self {
        let state = &integration.state;
        Self {
            connected: integration.is_connected(),
            email: integration.email.clone(),
            last_sync: state.last_sync_at,
            sync_state: state.sync_state,
            error: state.sync_error.clone(),
            watch_expiration: state.watch_expiration,
            reason: state.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackOutcome {
    pub tenant_id: String,
    pub return_to: Option<String>,
    pub status: MailboxStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentDownload {
    pub data: Vec<u8>,
    pub size: i64,
}

/// Pub/Sub push body.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub data: String,
    #[serde(default, alias = "message_id")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxNotification {
    pub email_address: String,
    #[serde(deserialize_with = "history_id_text")]
    pub history_id: String,
}

/// The provider sends the history id as a number; tests and replays send text.
fn history_id_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Number(n) => n.to_string(),
        Raw::Text(s) => s,
    })
}

impl PushEnvelope {
    pub fn notification(&self) -> Result<MailboxNotification, MailboxServiceError> {
        let raw = self.message.data.trim();
        let decoded = STANDARD
            .decode(raw)
            .or_else(|_| URL_SAFE.decode(raw))
            .or_else(|_| URL_SAFE_NO_PAD.decode(raw))
            .map_err(|err| MailboxServiceError::Validation(format!("push data: {err}")))?;
        serde_json::from_slice(&decoded)
            .map_err(|err| MailboxServiceError::Validation(format!("push payload: {err}")))
    }
}

#[derive(Debug, Error)]
pub enum MailboxServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("mailbox is not connected for tenant {0}")]
    NotConnected(String),
    #[error("mailbox authorization expired: {0}")]
    AuthExpired(String),
    #[error("stored credential is unusable: {0}")]
    Decryption(String),
    #[error("oauth error: {0}")]
    OAuth(#[from] OAuthError),
    #[error("provider error: {0}")]
    Provider(#[from] GmailClientError),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Integration(#[from] IntegrationError),
    #[error(transparent)]
    Sync(SyncError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Tenant(#[from] TenantError),
    #[error(transparent)]
    Contact(#[from] ContactError),
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error(transparent)]
    Message(#[from] MessageError),
}

impl From<SessionError> for MailboxServiceError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotConnected(tenant_id) => MailboxServiceError::NotConnected(tenant_id),
            SessionError::AuthExpired(reason) => MailboxServiceError::AuthExpired(reason),
            SessionError::Decryption(err) => MailboxServiceError::Decryption(err.to_string()),
            SessionError::Integration(err) => MailboxServiceError::Integration(err),
        }
    }
}

impl From<SyncError> for MailboxServiceError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::NotConnected(tenant_id) => MailboxServiceError::NotConnected(tenant_id),
            SyncError::Provider(GmailClientError::AuthExpired(reason)) => {
                MailboxServiceError::AuthExpired(reason)
            }
            other => MailboxServiceError::Sync(other),
        }
    }
}

impl MailboxServiceError {
    pub fn is_not_found(&self) -> bool {
        match self {
            MailboxServiceError::Provider(err) => err.is_not_found(),
            MailboxServiceError::Tenant(TenantError::NotFound(_))
            | MailboxServiceError::Conversation(ConversationError::NotFound(_))
            | MailboxServiceError::Contact(ContactError::NotFound(_)) => true,
            MailboxServiceError::Dispatch(err) => err.is_not_found(),
            _ => false,
        }
    }
}

#[derive(Clone)]
pub struct MailboxService {
    connector: MailboxConnector,
    engine: MailboxSyncEngine,
    dispatcher: AutomationDispatcher,
    queue: JobQueue,
    tenants: TenantRepository,
    contacts: ContactRepository,
    conversations: ConversationRepository,
    messages: MessageRepository,
}

impl MailboxService {
    pub fn new(
        db: Database,
        engine: MailboxSyncEngine,
        dispatcher: AutomationDispatcher,
    ) -> Self {
        Self {
            connector: engine.connector().clone(),
            engine,
            dispatcher,
            queue: JobQueue::new(db.clone()),
            tenants: TenantRepository::new(db.clone()),
            contacts: ContactRepository::new(db.clone()),
            conversations: ConversationRepository::new(db.clone()),
            messages: MessageRepository::new(db),
        }
    }

    pub fn dispatcher(&self) -> &AutomationDispatcher {
        &self.dispatcher
    }

    /// Consent URL for the tenant; `return_to` comes back through the callback.
    pub async fn connect(
        &self,
        tenant_id: &str,
        return_to: Option<String>,
    ) -> Result<String, MailboxServiceError> {
        self.tenants.get(tenant_id).await?;
        let state = ConnectState {
            tenant_id: tenant_id.to_string(),
            return_to,
        };
        Ok(self.connector.oauth_app().authorization_url(&state)?)
    }

    #[instrument(skip(self, code, state))]
    pub async fn handle_callback(
        &self,
        code: &str,
        state: &str,
    ) -> Result<CallbackOutcome, MailboxServiceError> {
        let state = ConnectState::parse(state)
            .map_err(|err| MailboxServiceError::Validation(format!("invalid state: {err}")))?;
        let tenant_id = state.tenant_id.as_str();
        self.tenants.get(tenant_id).await?;

        let tokens = match self
            .connector
            .oauth_app()
            .exchange_code(self.connector.http(), code)
            .await
        {
            Ok(tokens) => tokens,
            Err(OAuthError::MissingRefreshToken) => {
                return Err(MailboxServiceError::Validation(
                    "provider did not grant offline access; remove the app from the account and connect again".into(),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        let profile = self.connector.detached_client(tokens.clone()).get_profile().await?;
        let sealed = StoredCredential::seal(self.connector.vault(), &tokens)?;
        let mut integration = self
            .connector
            .integrations()
            .upsert_connected(tenant_id, &profile.email_address, &sealed)
            .await?;
        info!(tenant_id, email = %profile.email_address, "mailbox connected");

        match self.register_watch(tenant_id).await {
            Ok(Some(updated)) => integration = updated,
            Ok(None) => {}
            Err(err) => warn!(tenant_id, error = %err, "watch registration failed"),
        }

        self.queue
            .enqueue_sync(&SyncJobPayload::new(tenant_id, "connected"), 10)
            .await?;

        Ok(CallbackOutcome {
            tenant_id: state.tenant_id.clone(),
            return_to: state.return_to.clone(),
            status: MailboxStatus::from_integration(&integration),
        })
    }

    async fn register_watch(
        &self,
        tenant_id: &str,
    ) -> Result<Option<MailboxIntegration>, MailboxServiceError> {
        let topic = self.connector.google().pubsub_topic.clone();
        if topic.trim().is_empty() {
            debug!(tenant_id, "no push topic configured, skipping watch");
            return Ok(None);
        }
        let session = self.connector.open(tenant_id).await?;
        let watch = session.client.watch(&topic).await?;
        let expiration = watch
            .expiration
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis);
        let updated = self
            .connector
            .integrations()
            .update_state(tenant_id, |state| state.watch_expiration = expiration)
            .await?;
        Ok(Some(updated))
    }

    pub async fn disconnect(&self, tenant_id: &str) -> Result<MailboxStatus, MailboxServiceError> {
        match self.connector.open(tenant_id).await {
            Ok(session) => {
                if let Err(err) = session.client.stop().await {
                    debug!(tenant_id, error = %err, "stopping watch failed");
                }
            }
            Err(err) => debug!(tenant_id, error = %err, "no usable session to stop watch"),
        }

        if self
            .connector
            .integrations()
            .find_by_tenant(tenant_id)
            .await?
            .is_none()
        {
            return Ok(MailboxStatus::disconnected());
        }
        let integration = self
            .connector
            .integrations()
            .disconnect(tenant_id, USER_DISCONNECT_REASON)
            .await?;
        info!(tenant_id, "mailbox disconnected");
        Ok(MailboxStatus::from_integration(&integration))
    }

    pub async fn status(&self, tenant_id: &str) -> Result<MailboxStatus, MailboxServiceError> {
        Ok(self
            .connector
            .integrations()
            .find_by_tenant(tenant_id)
            .await?
            .map(|integration| MailboxStatus::from_integration(&integration))
            .unwrap_or_else(MailboxStatus::disconnected))
    }

    /// Runs one pass inline and reports the resulting status.
    pub async fn sync_now(&self, tenant_id: &str) -> Result<MailboxStatus, MailboxServiceError> {
        self.engine.sync(tenant_id).await?;
        self.status(tenant_id).await
    }

    /// Sends a staff reply on the conversation's thread and pauses automation
    /// for it. Nothing is recorded unless a channel accepted the message.
    #[instrument(skip(self, body, attachments), fields(actor = %actor))]
    pub async fn send_reply(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        body: &str,
        attachments: Vec<MimeAttachment>,
        actor: &Actor,
    ) -> Result<ConversationMessage, MailboxServiceError> {
        if body.trim().is_empty() {
            return Err(MailboxServiceError::Validation("reply body is required".into()));
        }
        let tenant = self.tenants.get(tenant_id).await?;
        let conversation = self.conversations.get(tenant_id, conversation_id).await?;
        let contact = self.contacts.get(tenant_id, &conversation.contact_id).await?;
        let Some(recipient) = contact.email.as_deref().filter(|e| !e.trim().is_empty()) else {
            return Err(MailboxServiceError::Validation(
                "contact has no email address".into(),
            ));
        };

        let previous = self
            .messages
            .latest_with_rfc_id(tenant_id, conversation_id)
            .await?;
        let mut email = OutboundEmail::new(
            EmailAddress::new(Some(contact.name.clone()), recipient),
            reply_subject_for(&conversation, &tenant.name),
            text_to_html(body),
        );
        email.text = Some(body.to_string());
        email.attachments = attachments;
        email.thread_id = conversation.external_thread_id.clone();
        email.sender_name = Some(tenant.name.clone());
        if let Some(previous) = &previous {
            email.in_reply_to = previous.rfc_message_id.clone();
            let mut references = previous.references.clone();
            references.extend(previous.rfc_message_id.clone());
            email.references = dedup_message_ids(references);
        }
        email.validate()?;

        let delivered = self.dispatcher.router().deliver(tenant_id, &email).await?;

        let mut message = NewMessage::outbound(tenant_id, conversation_id, body);
        message.subject = Some(email.subject.clone());
        message.to = vec![recipient.to_ascii_lowercase()];
        message.external_message_id = delivered.sent.provider_message_id.clone();
        message.in_reply_to = email.in_reply_to.clone();
        message.references = email.references.clone();
        message.attachments = Vec::new();
        message.sent_by = Some(actor.user_id.clone());
        message.paused_by = Some(actor.user_id.clone());
        let stored = self
            .messages
            .insert_and_touch(&message)
            .await?
            .ok_or_else(|| {
                MailboxServiceError::Validation("reply was already recorded".into())
            })?;
        info!(tenant_id, conversation_id, channel = delivered.channel.as_str(), "reply sent");

        // Automation is already paused by the insert above; the trigger only
        // adds the audit entry.
        let event = TriggerEvent::StaffReplied {
            conversation_id: conversation_id.to_string(),
            paused_by: actor.user_id.clone(),
        };
        if let Err(err) = self.dispatcher.fire(tenant_id, &event).await {
            warn!(tenant_id, conversation_id, error = %err, "could not log pause after reply");
        }
        Ok(stored)
    }

    pub async fn resume(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        actor: &Actor,
    ) -> Result<Conversation, MailboxServiceError> {
        Ok(self
            .dispatcher
            .resume(tenant_id, conversation_id, actor)
            .await?)
    }

    pub async fn download_attachment(
        &self,
        tenant_id: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<AttachmentDownload, MailboxServiceError> {
        let session = self.connector.open(tenant_id).await?;
        let body = session.client.get_attachment(message_id, attachment_id).await?;
        let data = URL_SAFE_NO_PAD
            .decode(body.data.trim_end_matches('='))
            .map_err(|err| MailboxServiceError::Validation(format!("attachment data: {err}")))?;
        Ok(AttachmentDownload {
            size: if body.size > 0 { body.size } else { data.len() as i64 },
            data,
        })
    }

    /// Queues a sync for the mailbox named in a push notification. Returns the
    /// job id, or `None` when the push was dropped or collapsed.
    pub async fn enqueue_push(
        &self,
        envelope: &PushEnvelope,
    ) -> Result<Option<String>, MailboxServiceError> {
        let notification = envelope.notification()?;
        let Some(integration) = self
            .connector
            .integrations()
            .find_by_email(&notification.email_address)
            .await?
        else {
            info!(email = %notification.email_address, "push for unknown mailbox dropped");
            return Ok(None);
        };
        if !integration.is_connected() {
            debug!(tenant_id = %integration.tenant_id, "push for disconnected mailbox dropped");
            return Ok(None);
        }

        let payload = SyncJobPayload {
            tenant_id: integration.tenant_id.clone(),
            history_id: Some(notification.history_id.clone()),
            reason: "push".to_string(),
        };
        match self.queue.enqueue_sync(&payload, 0).await {
            Ok(job_id) => Ok(Some(job_id)),
            Err(QueueError::DuplicateIdempotency { key, .. }) => {
                debug!(%key, "duplicate push collapsed");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn reply_subject_for(conversation: &Conversation, business_name: &str) -> String {
    match (&conversation.external_thread_id, conversation.subject.as_deref()) {
        (Some(_), Some(subject)) if !subject.trim().is_empty() => reply_subject(subject),
        _ => format!("Message from {business_name}"),
    }
}
