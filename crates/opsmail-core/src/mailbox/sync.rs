use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::session::{MailboxConnector, MailboxSession, SessionError, unusable_integration};
use crate::automation::{AutomationDispatcher, DispatchError, TriggerEvent};
use crate::config::MailboxConfig;
use crate::contacts::{ContactError, ContactRepository, ContactSource, display_name_for};
use crate::conversations::{DEFAULT_SUBJECT, ThreadKey};
use crate::db::Database;
use crate::gmail::mime_builder::html_to_text;
use crate::gmail::{ErrorClass, GmailClientError, Message, ParsedMessage, parse_message};
use crate::integrations::{IntegrationError, IntegrationRepository, IntegrationState, SyncState};
use crate::messages::{Direction, MessageError, MessageRepository, NewMessage};
use crate::notifications::{NewNotification, NotificationSink};
use crate::tenants::{Tenant, TenantError, TenantRepository};

/// Actor recorded when a reply sent from the mailbox itself pauses automation.
pub const MAILBOX_REPLY_ACTOR: &str = "mailbox";

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub initial_sync_days: i64,
    pub sync_timeout: Duration,
    pub pause_on_mailbox_reply: bool,
}

impl SyncOptions {
    pub fn from_config(config: &MailboxConfig) -> Self {
        Self {
            initial_sync_days: config.initial_sync_days,
            sync_timeout: Duration::from_secs(config.sync_timeout_secs),
            pause_on_mailbox_reply: config.pause_on_mailbox_reply,
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_config(&MailboxConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Initial,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub mode: SyncMode,
    pub threads_examined: u32,
    pub threads_discarded: u32,
    pub messages_ingested: u32,
    pub messages_skipped: u32,
    pub history_id: Option<String>,
}

impl SyncReport {
    fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            threads_examined: 0,
            threads_discarded: 0,
            messages_ingested: 0,
            messages_skipped: 0,
            history_id: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("mailbox is not connected for tenant {0}")]
    NotConnected(String),
    #[error(transparent)]
    Session(SessionError),
    #[error("provider error: {0}")]
    Provider(#[from] GmailClientError),
    #[error(transparent)]
    Integration(#[from] IntegrationError),
    #[error(transparent)]
    Tenant(#[from] TenantError),
    #[error(transparent)]
    Contact(#[from] ContactError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("sync pass exceeded {0:?}")]
    Timeout(Duration),
}

impl From<SessionError> for SyncError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotConnected(tenant_id) => SyncError::NotConnected(tenant_id),
            SessionError::AuthExpired(reason) => {
                SyncError::Provider(GmailClientError::AuthExpired(reason))
            }
            SessionError::Integration(err) => SyncError::Integration(err),
            other => SyncError::Session(other),
        }
    }
}

impl SyncError {
    /// Worth retrying later with the previous state left in place.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Timeout(_) => true,
            SyncError::Provider(err) => err.classify() == ErrorClass::Transient,
            SyncError::Integration(IntegrationError::Conflict(_)) => true,
            _ => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            SyncError::Provider(GmailClientError::AuthExpired(_))
                | SyncError::Session(SessionError::Decryption(_))
                | SyncError::NotConnected(_)
        )
    }
}

/// Per-pass context shared by every reconciliation step.
struct Pass<'a> {
    session: &'a MailboxSession,
    tenant: &'a Tenant,
    own_address: String,
}

/// Mirrors a tenant mailbox into contacts, conversations and messages.
#[derive(Clone)]
pub struct MailboxSyncEngine {
    connector: MailboxConnector,
    tenants: TenantRepository,
    contacts: ContactRepository,
    messages: MessageRepository,
    notifications: Arc<dyn NotificationSink>,
    dispatcher: Option<AutomationDispatcher>,
    options: SyncOptions,
}

impl MailboxSyncEngine {
    pub fn new(
        db: Database,
        connector: MailboxConnector,
        notifications: Arc<dyn NotificationSink>,
        options: SyncOptions,
    ) -> Self {
        Self {
            connector,
            tenants: TenantRepository::new(db.clone()),
            contacts: ContactRepository::new(db.clone()),
            messages: MessageRepository::new(db),
            notifications,
            dispatcher: None,
            options,
        }
    }

    /// Needed only when outbound mailbox replies pause automation.
    pub fn with_dispatcher(mut self, dispatcher: AutomationDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn connector(&self) -> &MailboxConnector {
        &self.connector
    }

    fn integrations(&self) -> &IntegrationRepository {
        self.connector.integrations()
    }

    /// One bounded pass. Transient failures restore the previous state so a
    /// retry starts from the same cursor; other failures are recorded on the
    /// integration.
    #[instrument(skip(self))]
    pub async fn sync(&self, tenant_id: &str) -> Result<SyncReport, SyncError> {
        let integration = match self.integrations().find_by_tenant(tenant_id).await? {
            Some(integration) if integration.is_connected() => integration,
            Some(integration) => return Err(unusable_integration(&integration).into()),
            None => return Err(SyncError::NotConnected(tenant_id.to_string())),
        };
        let previous = integration.state.clone();
        let integration = self
            .integrations()
            .update_state(tenant_id, |state| {
                state.sync_state = SyncState::Syncing;
            })
            .await?;

        let outcome = match tokio::time::timeout(
            self.options.sync_timeout,
            self.run_pass(integration),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(SyncError::Timeout(self.options.sync_timeout)),
        };

        match outcome {
            Ok(report) => {
                let cursor = report.history_id.clone();
                self.integrations()
                    .update_state(tenant_id, |state| {
                        state.sync_state = SyncState::Idle;
                        state.sync_error = None;
                        state.last_sync_at = Some(Utc::now());
                        if let Some(cursor) = cursor.as_deref() {
                            state.history_id =
                                Some(later_cursor(state.history_id.as_deref(), cursor));
                        }
                    })
                    .await?;
                info!(
                    tenant_id,
                    mode = ?report.mode,
                    ingested = report.messages_ingested,
                    skipped = report.messages_skipped,
                    "mailbox sync complete"
                );
                Ok(report)
            }
            Err(err) if err.is_transient() => {
                warn!(tenant_id, error = %err, "transient sync failure, state restored");
                self.restore(tenant_id, &previous).await;
                Err(err)
            }
            Err(err) => {
                warn!(tenant_id, error = %err, "mailbox sync failed");
                self.mark_error(tenant_id, &err.to_string()).await;
                Err(err)
            }
        }
    }

    /// Records a failure for operators. Used directly by the job layer once
    /// retries are exhausted.
    pub async fn mark_error(&self, tenant_id: &str, message: &str) {
        let result = self
            .integrations()
            .update_state(tenant_id, |state| {
                state.sync_state = SyncState::Error;
                state.sync_error = Some(message.to_string());
            })
            .await;
        if let Err(err) = result {
            warn!(tenant_id, error = %err, "could not record sync error");
        }
    }

    async fn restore(&self, tenant_id: &str, previous: &IntegrationState) {
        let result = self
            .integrations()
            .update_state(tenant_id, |state| {
                state.sync_state = previous.sync_state;
                state.sync_error = previous.sync_error.clone();
            })
            .await;
        if let Err(err) = result {
            warn!(tenant_id, error = %err, "could not restore sync state");
        }
    }

    async fn run_pass(
        &self,
        integration: crate::integrations::MailboxIntegration,
    ) -> Result<SyncReport, SyncError> {
        let tenant = self.tenants.get(&integration.tenant_id).await?;
        let session = self.connector.session_for(integration).await?;
        let pass = Pass {
            own_address: session.address(),
            session: &session,
            tenant: &tenant,
        };

        match session.integration.state.history_id.clone() {
            None => self.initial_sync(&pass).await,
            Some(cursor) => match self.incremental_sync(&pass, &cursor).await {
                Err(SyncError::Provider(GmailClientError::InvalidCursor(_))) => {
                    info!(tenant_id = %tenant.id, cursor = %cursor, "history cursor expired, running initial sync");
                    self.initial_sync(&pass).await
                }
                other => other,
            },
        }
    }

    async fn initial_sync(&self, pass: &Pass<'_>) -> Result<SyncReport, SyncError> {
        let client = &pass.session.client;
        let mut report = SyncReport::new(SyncMode::Initial);
        // Captured first so that mail arriving during the pass is replayed by
        // the next incremental pass.
        let profile = client.get_profile().await?;

        let after = (Utc::now() - chrono::Duration::days(self.options.initial_sync_days)).timestamp();
        let query = format!("(in:inbox OR in:sent) after:{after}");
        let mut page_token: Option<String> = None;
        loop {
            let page = client
                .list_threads(Some(&query), page_token.as_deref(), Some(100))
                .await?;
            for stub in &page.threads {
                report.threads_examined += 1;
                let thread = match client.get_thread(&stub.id).await {
                    Ok(thread) => thread,
                    Err(err) if err.is_not_found() => {
                        debug!(thread_id = %stub.id, "thread vanished before fetch");
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                };
                self.reconcile_thread(pass, &thread.id, &thread.messages, None, &mut report)
                    .await?;
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        report.history_id = Some(profile.history_id);
        Ok(report)
    }

    async fn incremental_sync(
        &self,
        pass: &Pass<'_>,
        cursor: &str,
    ) -> Result<SyncReport, SyncError> {
        let client = &pass.session.client;
        let tenant_id = pass.tenant.id.as_str();
        let mut report = SyncReport::new(SyncMode::Incremental);
        let mut latest: Option<String> = None;
        let mut page_token: Option<String> = None;

        loop {
            let page = client.list_history(cursor, page_token.as_deref()).await?;
            if page.history_id.is_some() {
                latest = page.history_id.clone();
            }

            for record in &page.history {
                for change in &record.messages_added {
                    let added = &change.message;
                    if self
                        .messages
                        .exists_by_external_id(tenant_id, &added.id)
                        .await?
                    {
                        report.messages_skipped += 1;
                        continue;
                    }

                    let thread_id = match &added.thread_id {
                        Some(thread_id) => thread_id.clone(),
                        None => match client.get_message(&added.id).await {
                            Ok(message) => message.thread_id.unwrap_or(message.id),
                            Err(err) if err.is_not_found() => continue,
                            Err(err) => return Err(err.into()),
                        },
                    };
                    let thread = match client.get_thread(&thread_id).await {
                        Ok(thread) => thread,
                        Err(err) if err.is_not_found() => {
                            debug!(message_id = %added.id, "added message deleted since");
                            continue;
                        }
                        Err(err) => return Err(err.into()),
                    };
                    report.threads_examined += 1;
                    self.reconcile_thread(
                        pass,
                        &thread.id,
                        &thread.messages,
                        Some(&added.id),
                        &mut report,
                    )
                    .await?;
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        report.history_id = Some(latest.unwrap_or_else(|| cursor.to_string()));
        Ok(report)
    }

    /// Maps a provider thread onto one contact and conversation, then ingests
    /// its messages. Threads with no external participant are internal and
    /// dropped. `added` names the message a history record reported, the only
    /// one that may pause automation.
    async fn reconcile_thread(
        &self,
        pass: &Pass<'_>,
        thread_id: &str,
        messages: &[Message],
        added: Option<&str>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let tenant_id = pass.tenant.id.as_str();
        let parsed: Vec<ParsedMessage> = messages.iter().map(parse_message).collect();

        let mut contact_address = None;
        let mut participants: Vec<String> = Vec::new();
        for recipient in parsed.iter().flat_map(ParsedMessage::participants) {
            if recipient.email == pass.own_address {
                continue;
            }
            if !participants.contains(&recipient.email) {
                participants.push(recipient.email.clone());
            }
            if contact_address.is_none() {
                contact_address = Some(recipient);
            }
        }
        let Some(contact_address) = contact_address else {
            debug!(tenant_id, thread_id, "thread has no external participant");
            report.threads_discarded += 1;
            return Ok(());
        };

        let (contact, created) = self
            .contacts
            .find_or_create_by_email(
                tenant_id,
                &contact_address.email,
                &display_name_for(contact_address.name.as_deref(), &contact_address.email),
                ContactSource::MailboxImport,
            )
            .await?;
        if created {
            debug!(tenant_id, contact_id = %contact.id, "contact imported from mailbox");
        }

        let thread = ThreadKey {
            tenant_id,
            contact_id: &contact.id,
            thread_id,
            subject: parsed.iter().find_map(|p| p.subject.as_deref()),
            participants: &participants,
        };
        for (message, parsed) in messages.iter().zip(parsed.iter()) {
            let pauses = added == Some(message.id.as_str());
            self.ingest(pass, &thread, message, parsed, pauses, report)
                .await?;
        }
        Ok(())
    }

    async fn ingest(
        &self,
        pass: &Pass<'_>,
        thread: &ThreadKey<'_>,
        message: &Message,
        parsed: &ParsedMessage,
        may_pause: bool,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let tenant_id = pass.tenant.id.as_str();
        if self
            .messages
            .exists_by_external_id(tenant_id, &message.id)
            .await?
        {
            report.messages_skipped += 1;
            return Ok(());
        }

        let from_email = parsed.from_email.as_deref().map(str::to_ascii_lowercase);
        let direction = if from_email.as_deref() == Some(pass.own_address.as_str()) {
            Direction::Outbound
        } else {
            Direction::Inbound
        };
        let sent_at = parsed.sent_at.unwrap_or_else(Utc::now);
        let unread = direction == Direction::Inbound && parsed.is_unread();
        let pauses = direction == Direction::Outbound && may_pause && self.options.pause_on_mailbox_reply;

        let new = NewMessage {
            tenant_id: tenant_id.to_string(),
            conversation_id: String::new(),
            direction,
            channel: "email".to_string(),
            content: message_content(parsed, message.snippet.as_deref()),
            subject: parsed.subject.clone(),
            from_email: from_email.clone(),
            to: parsed.to.iter().map(|r| r.email.to_ascii_lowercase()).collect(),
            external_message_id: Some(message.id.clone()),
            rfc_message_id: parsed.message_id.clone(),
            in_reply_to: parsed.in_reply_to.clone(),
            references: parsed.references.clone(),
            attachments: parsed.attachments.clone(),
            labels: parsed.labels.clone(),
            automated: false,
            sent_by: None,
            sent_at,
            read_at: (!unread).then_some(sent_at),
            paused_by: pauses.then(|| MAILBOX_REPLY_ACTOR.to_string()),
        };

        let Some((conversation, stored)) = self.messages.insert_into_thread(thread, &new).await?
        else {
            report.messages_skipped += 1;
            return Ok(());
        };
        report.messages_ingested += 1;

        if unread {
            let sender = match (&parsed.from_name, &from_email) {
                (Some(name), Some(email)) => format!("{name} <{email}>"),
                (None, Some(email)) => email.clone(),
                (Some(name), None) => name.clone(),
                (None, None) => "unknown sender".to_string(),
            };
            let notification = NewNotification {
                tenant_id: tenant_id.to_string(),
                user_id: pass.tenant.owner_user_id.clone(),
                kind: "message".to_string(),
                title: "New Email".to_string(),
                body: format!(
                    "From: {sender}\nSubject: {}",
                    parsed.subject.as_deref().unwrap_or(DEFAULT_SUBJECT)
                ),
                link: Some(format!("/conversations/{}", conversation.id)),
            };
            if let Err(err) = self.notifications.notify(notification).await {
                warn!(tenant_id, message_id = %stored.id, error = %err, "inbound notification failed");
            }
        }

        if pauses {
            self.log_mailbox_reply_pause(tenant_id, &conversation.id).await;
        }
        Ok(())
    }

    /// The pause itself was written with the message; this records it in the
    /// automation log.
    async fn log_mailbox_reply_pause(&self, tenant_id: &str, conversation_id: &str) {
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };
        let event = TriggerEvent::StaffReplied {
            conversation_id: conversation_id.to_string(),
            paused_by: MAILBOX_REPLY_ACTOR.to_string(),
        };
        let result: Result<_, DispatchError> = dispatcher.fire(tenant_id, &event).await;
        if let Err(err) = result {
            warn!(tenant_id, conversation_id, error = %err, "could not log pause after mailbox reply");
        }
    }
}

/// Plain body, else the HTML body as text, else the provider snippet.
fn message_content(parsed: &ParsedMessage, snippet: Option<&str>) -> String {
    if let Some(plain) = parsed.body_plain.as_deref().filter(|b| !b.trim().is_empty()) {
        return plain.to_string();
    }
    if let Some(html) = parsed.body_html.as_deref().filter(|b| !b.trim().is_empty()) {
        return html_to_text(html);
    }
    snippet.unwrap_or_default().to_string()
}

/// History ids only grow; a stale writer must not move the cursor back.
fn later_cursor(current: Option<&str>, candidate: &str) -> String {
    match (current.and_then(|c| c.parse::<u64>().ok()), candidate.parse::<u64>()) {
        (Some(current), Ok(next)) if current > next => current.to_string(),
        _ => candidate.to_string(),
    }
}
