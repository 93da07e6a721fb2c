use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::delivery::{DeliveryRouter, OutboundEmail};
use super::log::{AutomationLogEntry, AutomationLogRepository, LogError, LogFilter, LogStats, NewLogEntry};
use super::settings::{AutomationRuleStore, SettingsError};
use super::templates::{
    TemplateError, TemplateVars, default_template, render, render_html, wrap_html,
};
use super::TriggerKind;
use crate::access::Actor;
use crate::bookings::{Booking, BookingError, BookingRepository};
use crate::config::AppLinksConfig;
use crate::contacts::{Contact, ContactError, ContactRepository};
use crate::conversations::{Conversation, ConversationError, ConversationRepository};
use crate::db::Database;
use crate::gmail::mime_builder::{EmailAddress, html_to_text};
use crate::inventory::{InventoryError, InventoryItem, InventoryRepository};
use crate::messages::{MessageError, MessageRepository, NewMessage};
use crate::tenants::{Tenant, TenantError, TenantRepository};

pub const DEFAULT_LOCATION: &str = "TBD";
pub const DEFAULT_FORM_NAME: &str = "Intake Form";

/// One automation occurrence. Each variant names the records it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "trigger",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum TriggerEvent {
    NewContact { contact_id: String },
    BookingCreated { booking_id: String },
    BookingReminder { booking_id: String },
    FormPending { booking_id: String },
    InventoryLow { item_id: String },
    StaffReplied { conversation_id: String, paused_by: String },
}

impl TriggerEvent {
    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerEvent::NewContact { .. } => TriggerKind::NewContact,
            TriggerEvent::BookingCreated { .. } => TriggerKind::BookingCreated,
            TriggerEvent::BookingReminder { .. } => TriggerKind::BookingReminder,
            TriggerEvent::FormPending { .. } => TriggerKind::FormPending,
            TriggerEvent::InventoryLow { .. } => TriggerKind::InventoryLow,
            TriggerEvent::StaffReplied { .. } => TriggerKind::StaffReplied,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    Paused,
    NoRecipient,
    AlreadyAlerted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResult {
    pub trigger: TriggerKind,
    pub success: bool,
    /// `mailbox`, `fallback`, `system` for pauses, or `none` when nothing went out.
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_id: Option<String>,
}

impl DispatchResult {
    fn skipped(trigger: TriggerKind, reason: SkipReason) -> Self {
        Self {
            trigger,
            success: false,
            channel: "none".into(),
            reason: Some(reason),
            error: None,
            log_id: None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.reason.is_some()
    }

    /// A send was attempted and every channel failed.
    pub fn is_failure(&self) -> bool {
        !self.success && self.reason.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationStats {
    #[serde(flatten)]
    pub logs: LogStats,
    pub paused_conversations: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryUpdate {
    pub item: InventoryItem,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<DispatchResult>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Tenant(#[from] TenantError),
    #[error(transparent)]
    Contact(#[from] ContactError),
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Booking(#[from] BookingError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("only the tenant owner may {0}")]
    Forbidden(&'static str),
}

impl DispatchError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DispatchError::Tenant(TenantError::NotFound(_))
                | DispatchError::Contact(ContactError::NotFound(_))
                | DispatchError::Conversation(ConversationError::NotFound(_))
                | DispatchError::Booking(BookingError::NotFound(_))
                | DispatchError::Inventory(InventoryError::NotFound(_))
        )
    }
}

/// Where a resolved event leads.
enum Plan {
    Send(SendPlan),
    Pause {
        conversation: Conversation,
        paused_by: String,
    },
}

struct SendPlan {
    tenant: Tenant,
    recipient: Option<EmailAddress>,
    vars: TemplateVars,
    /// Contact whose conversations gate the send; absent for system triggers.
    contact_id: Option<String>,
    conversation_id: Option<String>,
    booking_id: Option<String>,
    inventory_item_id: Option<String>,
}

#[derive(Clone)]
pub struct AutomationDispatcher {
    tenants: TenantRepository,
    contacts: ContactRepository,
    conversations: ConversationRepository,
    messages: MessageRepository,
    bookings: BookingRepository,
    inventory: InventoryRepository,
    rules: AutomationRuleStore,
    logs: AutomationLogRepository,
    router: DeliveryRouter,
    client_url: String,
}

impl AutomationDispatcher {
    pub fn new(db: Database, router: DeliveryRouter, links: &AppLinksConfig) -> Self {
        Self {
            tenants: TenantRepository::new(db.clone()),
            contacts: ContactRepository::new(db.clone()),
            conversations: ConversationRepository::new(db.clone()),
            messages: MessageRepository::new(db.clone()),
            bookings: BookingRepository::new(db.clone()),
            inventory: InventoryRepository::new(db.clone()),
            rules: AutomationRuleStore::new(db.clone()),
            logs: AutomationLogRepository::new(db),
            router,
            client_url: links.client_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn rules(&self) -> &AutomationRuleStore {
        &self.rules
    }

    pub fn router(&self) -> &DeliveryRouter {
        &self.router
    }

    /// Runs one trigger to completion. Skips are results, not errors; only
    /// storage failures surface as `Err`.
    #[instrument(skip(self), fields(trigger = %event.kind()))]
    pub async fn fire(
        &self,
        tenant_id: &str,
        event: &TriggerEvent,
    ) -> Result<DispatchResult, DispatchError> {
        let kind = event.kind();
        let rule = self.rules.rule(tenant_id, kind).await?;
        if !rule.enabled {
            return Ok(DispatchResult::skipped(kind, SkipReason::Disabled));
        }

        match self.resolve(tenant_id, event).await? {
            Plan::Pause {
                conversation,
                paused_by,
            } => self.pause(kind, conversation, &paused_by).await,
            Plan::Send(plan) => {
                if !kind.is_system() {
                    if let Some(contact_id) = plan.contact_id.as_deref() {
                        if self
                            .conversations
                            .any_paused_for_contact(tenant_id, contact_id)
                            .await?
                        {
                            return Ok(DispatchResult::skipped(kind, SkipReason::Paused));
                        }
                    }
                }
                if plan.recipient.is_none() {
                    return Ok(DispatchResult::skipped(kind, SkipReason::NoRecipient));
                }
                let claimed_item = plan.inventory_item_id.clone();
                if let Some(item_id) = claimed_item.as_deref() {
                    if !self.inventory.claim_alert(tenant_id, item_id).await? {
                        return Ok(DispatchResult::skipped(kind, SkipReason::AlreadyAlerted));
                    }
                }

                let result = self.send(kind, &rule.subject, &rule.body, plan).await?;
                if let Some(item_id) = claimed_item.as_deref() {
                    if result.is_failure() {
                        self.inventory.release_alert(tenant_id, item_id).await?;
                    }
                }
                Ok(result)
            }
        }
    }

    /// Persists a new quantity and alerts when it crosses into low stock.
    pub async fn record_inventory_level(
        &self,
        tenant_id: &str,
        item_id: &str,
        quantity: i64,
    ) -> Result<InventoryUpdate, DispatchError> {
        let item = self
            .inventory
            .set_quantity(tenant_id, item_id, quantity)
            .await?;
        let alert = if item.is_low() && !item.alert_sent {
            Some(
                self.fire(
                    tenant_id,
                    &TriggerEvent::InventoryLow {
                        item_id: item.id.clone(),
                    },
                )
                .await?,
            )
        } else {
            None
        };
        let item = self.inventory.get(tenant_id, item_id).await?;
        Ok(InventoryUpdate { item, alert })
    }

    /// Lifts a staff-reply pause. Owner only.
    pub async fn resume(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        actor: &Actor,
    ) -> Result<Conversation, DispatchError> {
        if !actor.is_owner() {
            return Err(DispatchError::Forbidden("resume automation"));
        }
        let conversation = self.conversations.resume(tenant_id, conversation_id).await?;
        info!(tenant_id, conversation_id, actor = %actor, "automation resumed");
        Ok(conversation)
    }

    pub async fn stats(&self, tenant_id: &str) -> Result<AutomationStats, DispatchError> {
        Ok(AutomationStats {
            logs: self.logs.stats(tenant_id).await?,
            paused_conversations: self.conversations.count_paused(tenant_id).await?,
        })
    }

    pub async fn logs(
        &self,
        tenant_id: &str,
        filter: &LogFilter,
    ) -> Result<Vec<AutomationLogEntry>, DispatchError> {
        Ok(self.logs.list(tenant_id, filter).await?)
    }

    pub async fn prune_logs(&self, older_than: DateTime<Utc>) -> Result<u64, DispatchError> {
        Ok(self.logs.prune(older_than).await?)
    }

    async fn resolve(&self, tenant_id: &str, event: &TriggerEvent) -> Result<Plan, DispatchError> {
        let plan = match event {
            TriggerEvent::StaffReplied {
                conversation_id,
                paused_by,
            } => {
                return Ok(Plan::Pause {
                    conversation: self.conversations.get(tenant_id, conversation_id).await?,
                    paused_by: paused_by.clone(),
                });
            }
            TriggerEvent::NewContact { contact_id } => {
                let tenant = self.tenants.get(tenant_id).await?;
                let contact = self.contacts.get(tenant_id, contact_id).await?;
                let conversation = match self
                    .conversations
                    .latest_for_contact(tenant_id, contact_id)
                    .await?
                {
                    Some(conversation) => conversation,
                    None => {
                        self.conversations
                            .create_open(tenant_id, contact_id, "email")
                            .await?
                    }
                };
                let vars = contact_vars(&tenant, &contact);
                contact_plan(tenant, &contact, Some(conversation.id), None, vars)
            }
            TriggerEvent::BookingCreated { booking_id }
            | TriggerEvent::BookingReminder { booking_id }
            | TriggerEvent::FormPending { booking_id } => {
                let tenant = self.tenants.get(tenant_id).await?;
                let booking = self.bookings.get(tenant_id, booking_id).await?;
                let contact = self.contacts.get(tenant_id, &booking.contact_id).await?;
                let conversation = self
                    .conversations
                    .latest_for_contact(tenant_id, &contact.id)
                    .await?;
                let mut vars = contact_vars(&tenant, &contact);
                vars.extend(booking_vars(&booking));
                if matches!(event, TriggerEvent::FormPending { .. }) {
                    vars.extend(form_vars(&booking, &self.client_url));
                }
                contact_plan(
                    tenant,
                    &contact,
                    conversation.map(|c| c.id),
                    Some(booking.id),
                    vars,
                )
            }
            TriggerEvent::InventoryLow { item_id } => {
                let tenant = self.tenants.get(tenant_id).await?;
                let item = self.inventory.get(tenant_id, item_id).await?;
                let mut vars = TemplateVars::new();
                vars.insert("businessName".into(), tenant.name.clone());
                vars.insert("itemName".into(), item.name.clone());
                vars.insert("currentStock".into(), item.quantity.to_string());
                vars.insert("threshold".into(), item.threshold.to_string());
                let recipient = tenant
                    .owner_email
                    .as_deref()
                    .filter(|email| !email.trim().is_empty())
                    .map(EmailAddress::from);
                SendPlan {
                    tenant,
                    recipient,
                    vars,
                    contact_id: None,
                    conversation_id: None,
                    booking_id: None,
                    inventory_item_id: Some(item.id),
                }
            }
        };
        Ok(Plan::Send(plan))
    }

    async fn pause(
        &self,
        kind: TriggerKind,
        conversation: Conversation,
        paused_by: &str,
    ) -> Result<DispatchResult, DispatchError> {
        let paused = self
            .conversations
            .pause(&conversation.tenant_id, &conversation.id, paused_by)
            .await?;
        let entry = self
            .logs
            .append(&NewLogEntry {
                tenant_id: paused.tenant_id.clone(),
                trigger: kind,
                contact_id: Some(paused.contact_id.clone()),
                conversation_id: Some(paused.id.clone()),
                booking_id: None,
                inventory_item_id: None,
                channel: "system".into(),
                success: true,
                error: None,
                metadata: json!({ "pausedBy": paused_by }),
            })
            .await?;
        info!(tenant_id = %paused.tenant_id, conversation_id = %paused.id, "automation paused after staff reply");
        Ok(DispatchResult {
            trigger: kind,
            success: true,
            channel: "system".into(),
            reason: None,
            error: None,
            log_id: Some(entry.id),
        })
    }

    async fn send(
        &self,
        kind: TriggerKind,
        subject_template: &str,
        body_template: &str,
        plan: SendPlan,
    ) -> Result<DispatchResult, DispatchError> {
        let Some(recipient) = plan.recipient.clone() else {
            return Ok(DispatchResult::skipped(kind, SkipReason::NoRecipient));
        };
        let (subject, body) = match render_pair(subject_template, body_template, &plan.vars) {
            Ok(rendered) => rendered,
            Err(err) => {
                warn!(
                    tenant_id = %plan.tenant.id,
                    trigger = kind.as_str(),
                    error = %err,
                    "stored template failed to render, using the default"
                );
                match default_template(kind) {
                    Some(fallback) => render_pair(fallback.subject, fallback.body, &plan.vars)?,
                    None => return Err(err.into()),
                }
            }
        };
        let mut email = OutboundEmail::new(
            recipient.clone(),
            subject.clone(),
            wrap_html(&body, &plan.tenant.name),
        );
        email.text = Some(html_to_text(&body));
        email.sender_name = Some(plan.tenant.name.clone());

        let outcome = self.router.deliver(&plan.tenant.id, &email).await;
        let (channel, error, metadata) = match &outcome {
            Ok(delivered) => (
                delivered.channel.as_str().to_string(),
                None,
                json!({
                    "to": recipient.email,
                    "subject": subject,
                    "providerMessageId": delivered.sent.provider_message_id,
                    "mailboxError": delivered.mailbox_error,
                }),
            ),
            Err(err) => (
                "none".to_string(),
                Some(err.to_string()),
                json!({ "to": recipient.email, "subject": subject }),
            ),
        };

        let entry = self
            .logs
            .append(&NewLogEntry {
                tenant_id: plan.tenant.id.clone(),
                trigger: kind,
                contact_id: plan.contact_id.clone(),
                conversation_id: plan.conversation_id.clone(),
                booking_id: plan.booking_id.clone(),
                inventory_item_id: plan.inventory_item_id.clone(),
                channel: channel.clone(),
                success: outcome.is_ok(),
                error: error.clone(),
                metadata,
            })
            .await?;

        match outcome {
            Ok(delivered) => {
                info!(tenant_id = %plan.tenant.id, channel = %channel, "automation delivered");
                if let Some(conversation_id) = &plan.conversation_id {
                    let mut message = NewMessage::outbound(
                        plan.tenant.id.clone(),
                        conversation_id.clone(),
                        email.plain_text(),
                    );
                    message.subject = Some(subject);
                    message.to = vec![recipient.email];
                    message.automated = true;
                    message.external_message_id = delivered.sent.provider_message_id;
                    if let Err(err) = self.messages.insert_and_touch(&message).await {
                        warn!(error = %err, conversation_id, "failed to record automated message");
                    }
                }
                Ok(DispatchResult {
                    trigger: kind,
                    success: true,
                    channel,
                    reason: None,
                    error: None,
                    log_id: Some(entry.id),
                })
            }
            Err(err) => {
                warn!(tenant_id = %plan.tenant.id, error = %err, "automation delivery failed");
                Ok(DispatchResult {
                    trigger: kind,
                    success: false,
                    channel,
                    reason: None,
                    error,
                    log_id: Some(entry.id),
                })
            }
        }
    }
}

fn contact_plan(
    tenant: Tenant,
    contact: &Contact,
    conversation_id: Option<String>,
    booking_id: Option<String>,
    vars: TemplateVars,
) -> SendPlan {
    let recipient = contact
        .email
        .as_deref()
        .filter(|email| !email.trim().is_empty())
        .map(|email| EmailAddress::new(Some(contact.name.clone()), email));
    SendPlan {
        tenant,
        recipient,
        vars,
        contact_id: Some(contact.id.clone()),
        conversation_id,
        booking_id,
        inventory_item_id: None,
    }
}

fn render_pair(
    subject: &str,
    body: &str,
    vars: &TemplateVars,
) -> Result<(String, String), TemplateError> {
    Ok((render(subject, vars)?, render_html(body, vars)?))
}

fn contact_vars(tenant: &Tenant, contact: &Contact) -> TemplateVars {
    TemplateVars::from([
        ("contactName".to_string(), contact.name.clone()),
        ("businessName".to_string(), tenant.name.clone()),
    ])
}

fn booking_vars(booking: &Booking) -> TemplateVars {
    TemplateVars::from([
        ("serviceType".to_string(), booking.service_name.clone()),
        (
            "date".to_string(),
            booking.scheduled_at.format("%A, %B %-d, %Y").to_string(),
        ),
        (
            "timeSlot".to_string(),
            booking.scheduled_at.format("%-I:%M %p").to_string(),
        ),
        ("duration".to_string(), booking.duration_minutes.to_string()),
        (
            "location".to_string(),
            booking
                .location
                .clone()
                .filter(|l| !l.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
        ),
    ])
}

fn form_vars(booking: &Booking, client_url: &str) -> TemplateVars {
    let form_id = booking.form_id.as_deref().unwrap_or(booking.id.as_str());
    TemplateVars::from([
        (
            "formName".to_string(),
            booking
                .form_name
                .clone()
                .unwrap_or_else(|| DEFAULT_FORM_NAME.to_string()),
        ),
        (
            "formLink".to_string(),
            format!("{client_url}/form/{form_id}?booking={}", booking.id),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Role;
    use crate::automation::delivery::tests::RecordingSender;
    use crate::automation::delivery::MailSender;
    use crate::automation::settings::RuleUpdate;
    use crate::bookings::tests::new_booking;
    use crate::contacts::ContactSource;
    use crate::mailbox::session::tests::{connect_mailbox, connector};
    use crate::test_support::{insert_tenant, setup_db};
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        dispatcher: AutomationDispatcher,
        fallback: Arc<RecordingSender>,
        db: Database,
        _dir: tempfile::TempDir,
    }

    async fn fixture_with(fallback: RecordingSender, base: &str) -> Fixture {
        let (db, dir) = setup_db().await;
        insert_tenant(&db, "t1", Some("owner@acme.test")).await;
        let fallback = Arc::new(fallback);
        let router = DeliveryRouter::new(
            connector(db.clone(), base),
            Some(fallback.clone() as Arc<dyn MailSender>),
            std::time::Duration::from_secs(2),
        );
        let dispatcher = AutomationDispatcher::new(
            db.clone(),
            router,
            &AppLinksConfig {
                client_url: "https://app.acme.test/".into(),
            },
        );
        Fixture {
            dispatcher,
            fallback,
            db,
            _dir: dir,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(RecordingSender::default(), "http://127.0.0.1:9").await
    }

    async fn contact(db: &Database, email: Option<&str>) -> Contact {
        ContactRepository::new(db.clone())
            .create("t1", "Jane Doe", email, None, ContactSource::Manual)
            .await
            .expect("contact")
    }

    async fn all_logs(dispatcher: &AutomationDispatcher) -> Vec<AutomationLogEntry> {
        dispatcher
            .logs("t1", &LogFilter::default())
            .await
            .expect("logs")
    }

    #[tokio::test]
    async fn new_contact_opens_conversation_and_records_send() {
        let fx = fixture().await;
        let jane = contact(&fx.db, Some("jane@example.com")).await;

        let result = fx
            .dispatcher
            .fire(
                "t1",
                &TriggerEvent::NewContact {
                    contact_id: jane.id.clone(),
                },
            )
            .await
            .expect("fire");
        assert!(result.success);
        assert_eq!(result.channel, "fallback");

        let sent = fx.fallback.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Welcome to Acme Studio!");
        assert!(sent[0].html.contains("Hi Jane Doe"));

        let conversation = ConversationRepository::new(fx.db.clone())
            .latest_for_contact("t1", &jane.id)
            .await
            .expect("query")
            .expect("conversation");
        let messages = MessageRepository::new(fx.db.clone())
            .list_for_conversation("t1", &conversation.id)
            .await
            .expect("messages");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].automated);

        let logs = all_logs(&fx.dispatcher).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].channel, "fallback");
        assert_eq!(logs[0].conversation_id.as_deref(), Some(conversation.id.as_str()));
    }

    #[tokio::test]
    async fn broken_stored_template_falls_back_to_default() {
        let fx = fixture().await;
        let jane = contact(&fx.db, Some("jane@example.com")).await;
        let conn = fx.db.connection().await.expect("conn");
        conn.execute(
            "INSERT INTO automation_settings (tenant_id, rules_json, created_at, updated_at)
             VALUES ('t1', ?1, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            libsql::params![r#"{"NEW_CONTACT":{"subject":"Hi {{ nickname }}"}}"#],
        )
        .await
        .expect("store rule");

        let result = fx
            .dispatcher
            .fire(
                "t1",
                &TriggerEvent::NewContact {
                    contact_id: jane.id.clone(),
                },
            )
            .await
            .expect("fire");
        assert!(result.success);
        let sent = fx.fallback.sent.lock().await;
        assert_eq!(sent[0].subject, "Welcome to Acme Studio!");
        assert!(sent[0].html.contains("Hi Jane Doe"));
    }

    #[tokio::test]
    async fn disabled_trigger_skips_without_logging() {
        let fx = fixture().await;
        let jane = contact(&fx.db, Some("jane@example.com")).await;
        let booking = BookingRepository::new(fx.db.clone())
            .create(&new_booking("t1", &jane.id, Utc::now() + Duration::days(2)))
            .await
            .expect("booking");
        fx.dispatcher
            .rules()
            .update(
                "t1",
                BTreeMap::from([(
                    TriggerKind::BookingCreated,
                    RuleUpdate {
                        enabled: Some(false),
                        ..RuleUpdate::default()
                    },
                )]),
            )
            .await
            .expect("disable");

        let result = fx
            .dispatcher
            .fire(
                "t1",
                &TriggerEvent::BookingCreated {
                    booking_id: booking.id,
                },
            )
            .await
            .expect("fire");
        assert_eq!(result.reason, Some(SkipReason::Disabled));
        assert!(all_logs(&fx.dispatcher).await.is_empty());
        assert!(fx.fallback.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn staff_reply_pauses_until_owner_resumes() {
        let fx = fixture().await;
        let jane = contact(&fx.db, Some("jane@example.com")).await;
        let conversations = ConversationRepository::new(fx.db.clone());
        let conversation = conversations
            .create_open("t1", &jane.id, "email")
            .await
            .expect("conversation");
        let booking = BookingRepository::new(fx.db.clone())
            .create(&new_booking("t1", &jane.id, Utc::now() + Duration::hours(24)))
            .await
            .expect("booking");

        let paused = fx
            .dispatcher
            .fire(
                "t1",
                &TriggerEvent::StaffReplied {
                    conversation_id: conversation.id.clone(),
                    paused_by: "staff-1".into(),
                },
            )
            .await
            .expect("pause");
        assert!(paused.success);
        assert_eq!(paused.channel, "system");

        let reminder = TriggerEvent::BookingReminder {
            booking_id: booking.id.clone(),
        };
        let result = fx.dispatcher.fire("t1", &reminder).await.expect("fire");
        assert_eq!(result.reason, Some(SkipReason::Paused));

        let staff = Actor::new("staff-1", Role::Staff);
        assert!(matches!(
            fx.dispatcher.resume("t1", &conversation.id, &staff).await,
            Err(DispatchError::Forbidden(_))
        ));
        assert!(
            conversations
                .get("t1", &conversation.id)
                .await
                .expect("get")
                .automation_paused
        );

        let owner = Actor::new("owner-t1", Role::Owner);
        let resumed = fx
            .dispatcher
            .resume("t1", &conversation.id, &owner)
            .await
            .expect("resume");
        assert!(!resumed.automation_paused);
        assert_eq!(resumed.paused_by, None);

        let result = fx.dispatcher.fire("t1", &reminder).await.expect("fire");
        assert!(result.success);
        let sent = fx.fallback.sent.lock().await;
        assert!(sent[0].subject.starts_with("Reminder: Your appointment tomorrow at"));
        assert!(sent[0].html.contains("<strong>Location:</strong> TBD"));
    }

    #[tokio::test]
    async fn contact_without_email_has_no_recipient() {
        let fx = fixture().await;
        let walk_in = contact(&fx.db, None).await;

        let result = fx
            .dispatcher
            .fire(
                "t1",
                &TriggerEvent::NewContact {
                    contact_id: walk_in.id,
                },
            )
            .await
            .expect("fire");
        assert_eq!(result.reason, Some(SkipReason::NoRecipient));
        assert!(all_logs(&fx.dispatcher).await.is_empty());
    }

    #[tokio::test]
    async fn inventory_alerts_once_per_crossing() {
        let fx = fixture().await;
        let item = InventoryRepository::new(fx.db.clone())
            .create("t1", "Gloves", Some("box"), 10, 5)
            .await
            .expect("item");

        let mut fired = 0;
        for quantity in [10, 10, 4, 4, 4, 12, 3] {
            let update = fx
                .dispatcher
                .record_inventory_level("t1", &item.id, quantity)
                .await
                .expect("update");
            if update.alert.as_ref().is_some_and(|a| a.success) {
                fired += 1;
            }
        }
        assert_eq!(fired, 2);

        let sent = fx.fallback.sent.lock().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].to.email, "owner@acme.test");
        assert_eq!(sent[0].subject, "Low Stock Alert - Gloves");
        assert_eq!(all_logs(&fx.dispatcher).await.len(), 2);

        let repeat = fx
            .dispatcher
            .fire(
                "t1",
                &TriggerEvent::InventoryLow {
                    item_id: item.id.clone(),
                },
            )
            .await
            .expect("fire");
        assert_eq!(repeat.reason, Some(SkipReason::AlreadyAlerted));
    }

    #[tokio::test]
    async fn failed_inventory_alert_releases_claim() {
        let fx = fixture_with(RecordingSender::failing("relay down"), "http://127.0.0.1:9").await;
        let inventory = InventoryRepository::new(fx.db.clone());
        let item = inventory
            .create("t1", "Towels", None, 10, 5)
            .await
            .expect("item");

        let update = fx
            .dispatcher
            .record_inventory_level("t1", &item.id, 2)
            .await
            .expect("update");
        let alert = update.alert.expect("alert attempted");
        assert!(alert.is_failure());
        assert!(alert.error.as_deref().is_some_and(|e| e.contains("relay down")));
        assert!(!update.item.alert_sent);

        let logs = all_logs(&fx.dispatcher).await;
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].success);
        assert_eq!(logs[0].channel, "none");
    }

    #[tokio::test]
    async fn mailbox_failure_with_fallback_logs_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/gmail/v1/users/me/messages/send"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let fx = fixture_with(RecordingSender::default(), &server.uri()).await;
        connect_mailbox(&connector(fx.db.clone(), &server.uri()), "t1", "shop@acme.test").await;
        let jane = contact(&fx.db, Some("jane@example.com")).await;

        let result = fx
            .dispatcher
            .fire(
                "t1",
                &TriggerEvent::NewContact {
                    contact_id: jane.id,
                },
            )
            .await
            .expect("fire");
        assert!(result.success);
        assert_eq!(result.channel, "fallback");

        let logs = all_logs(&fx.dispatcher).await;
        assert_eq!(logs.len(), 1);
        assert!(logs[0].success);
        assert_eq!(logs[0].channel, "fallback");
        assert!(logs[0].metadata["mailboxError"].is_string());
    }

    #[test]
    fn booking_variables_default_location_and_build_form_link() {
        let booking = Booking {
            id: "b1".into(),
            tenant_id: "t1".into(),
            contact_id: "c1".into(),
            service_name: "Massage".into(),
            duration_minutes: 60,
            location: None,
            scheduled_at: Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap(),
            status: "confirmed".into(),
            forms_status: "sent".into(),
            form_name: None,
            form_id: Some("f9".into()),
            reminder_sent: false,
            form_reminder_sent: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let vars = booking_vars(&booking);
        assert_eq!(vars["location"], "TBD");
        assert_eq!(vars["date"], "Monday, January 15, 2024");
        assert_eq!(vars["timeSlot"], "2:30 PM");
        let form = form_vars(&booking, "https://app.acme.test");
        assert_eq!(form["formLink"], "https://app.acme.test/form/f9?booking=b1");
        assert_eq!(form["formName"], DEFAULT_FORM_NAME);
    }

    #[test]
    fn events_deserialize_from_tagged_json() {
        let event: TriggerEvent = serde_json::from_value(json!({
            "trigger": "BOOKING_CREATED",
            "bookingId": "b1"
        }))
        .expect("event");
        assert_eq!(
            event,
            TriggerEvent::BookingCreated {
                booking_id: "b1".into()
            }
        );
        assert_eq!(event.kind(), TriggerKind::BookingCreated);
    }
}
