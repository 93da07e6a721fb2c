use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{FallbackConfig, FallbackTransport, SmtpTls};
use crate::gmail::GmailClientError;
use crate::gmail::mime_builder::{
    EmailAddress, MailEnvelope, MimeAttachment, check_attachment_sizes, html_to_text,
};
use crate::mailbox::session::{MailboxConnector, MailboxSession, SessionError};

/// Channel that carried a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Mailbox,
    Fallback,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Mailbox => "mailbox",
            Channel::Fallback => "fallback",
        }
    }
}

/// A rendered message bound for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: EmailAddress,
    pub subject: String,
    pub html: String,
    /// Plain alternative; derived from `html` when absent.
    pub text: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub attachments: Vec<MimeAttachment>,
    pub thread_id: Option<String>,
    pub sender_name: Option<String>,
}

impl OutboundEmail {
    pub fn new(to: EmailAddress, subject: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            to,
            subject: subject.into(),
            html: html.into(),
            text: None,
            in_reply_to: None,
            references: Vec::new(),
            attachments: Vec::new(),
            thread_id: None,
            sender_name: None,
        }
    }

    pub fn plain_text(&self) -> String {
        self.text
            .clone()
            .unwrap_or_else(|| html_to_text(&self.html))
    }

    pub fn validate(&self) -> Result<(), DeliveryError> {
        if self.to.email.trim().is_empty() {
            return Err(DeliveryError::Validation("recipient is required".into()));
        }
        if self.html.trim().is_empty() && self.text.as_deref().is_none_or(|t| t.trim().is_empty()) {
            return Err(DeliveryError::Validation("message body is empty".into()));
        }
        check_attachment_sizes(&self.attachments).map_err(|err| match err {
            crate::gmail::mime_builder::MimeBuildError::AttachmentTooLarge { filename, size } => {
                DeliveryError::AttachmentTooLarge { filename, size }
            }
            other => DeliveryError::Validation(other.to_string()),
        })
    }

    pub fn envelope(&self, from: EmailAddress) -> MailEnvelope {
        let mut envelope = MailEnvelope::new(from, self.to.clone(), self.subject.clone())
            .with_html(self.html.clone())
            .with_threading(self.in_reply_to.clone(), self.references.clone());
        if let Some(text) = &self.text {
            envelope.body_text = Some(text.clone());
        }
        envelope.attachments = self.attachments.clone();
        envelope
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SentMail {
    pub provider_message_id: Option<String>,
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub channel: Channel,
    pub sent: SentMail,
    /// Why the mailbox was skipped when the fallback carried the message.
    pub mailbox_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("{0} is not configured")]
    NotConfigured(String),
    #[error("mailbox authorization expired: {0}")]
    AuthExpired(String),
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    #[error("attachment {filename} is {size} bytes, too large to send")]
    AttachmentTooLarge { filename: String, size: usize },
    #[error("invalid message: {0}")]
    Validation(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("smtp error: {0}")]
    Transport(String),
    #[error("{}", describe_failure(.mailbox, .fallback))]
    AllChannelsFailed {
        mailbox: Option<String>,
        fallback: String,
    },
}

impl DeliveryError {
    /// Problems with the message itself; no channel can succeed.
    pub fn is_invalid_message(&self) -> bool {
        matches!(
            self,
            DeliveryError::Validation(_) | DeliveryError::AttachmentTooLarge { .. }
        )
    }
}

fn describe_failure(mailbox: &Option<String>, fallback: &str) -> String {
    match mailbox {
        Some(mailbox) => format!("mailbox failed: {mailbox}; fallback failed: {fallback}"),
        None => format!("fallback failed: {fallback}"),
    }
}

impl From<GmailClientError> for DeliveryError {
    fn from(err: GmailClientError) -> Self {
        match err {
            GmailClientError::AuthExpired(reason) => DeliveryError::AuthExpired(reason),
            GmailClientError::AttachmentTooLarge { filename, size } => {
                DeliveryError::AttachmentTooLarge { filename, size }
            }
            GmailClientError::Validation(reason) => DeliveryError::Validation(reason),
            other => DeliveryError::Provider(other.to_string()),
        }
    }
}

/// A channel able to carry an [`OutboundEmail`] without tenant context.
#[async_trait]
pub trait MailSender: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, email: &OutboundEmail) -> Result<SentMail, DeliveryError>;
}

/// Sends through a connected mailbox session, from the mailbox address.
pub async fn send_via_session(
    session: &MailboxSession,
    email: &OutboundEmail,
) -> Result<SentMail, DeliveryError> {
    let from = EmailAddress {
        email: session.address(),
        name: email.sender_name.clone(),
    };
    let envelope = email.envelope(from);
    let sent = session
        .client
        .send_message(&envelope, email.thread_id.as_deref())
        .await?;
    Ok(SentMail {
        provider_message_id: Some(sent.id),
        thread_id: sent.thread_id,
    })
}

pub struct SmtpSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_address: Address,
    from_name: String,
}

impl SmtpSender {
    pub fn from_config(config: &FallbackConfig) -> Result<Self, DeliveryError> {
        let host = config
            .smtp_host
            .as_deref()
            .filter(|host| !host.trim().is_empty())
            .ok_or_else(|| DeliveryError::NotConfigured("fallback.smtp_host".into()))?;
        let from = config
            .from_email
            .as_deref()
            .or(config.smtp_username.as_deref())
            .filter(|from| !from.trim().is_empty())
            .ok_or_else(|| DeliveryError::NotConfigured("fallback.from_email".into()))?;
        let from_address: Address = from
            .parse()
            .map_err(|err| DeliveryError::Validation(format!("invalid from address: {err}")))?;

        let builder = match config.smtp_tls {
            SmtpTls::Implicit => AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|err| DeliveryError::Transport(err.to_string()))?,
            SmtpTls::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|err| DeliveryError::Transport(err.to_string()))?,
            SmtpTls::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
        };
        let mut builder = builder
            .port(config.smtp_port)
            .timeout(Some(Duration::from_secs(config.timeout_secs)));
        if let (Some(username), Some(password)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from_address,
            from_name: config.from_name.clone(),
        })
    }

    fn build_message(&self, email: &OutboundEmail) -> Result<Message, DeliveryError> {
        let invalid = |err: &dyn std::fmt::Display| DeliveryError::Validation(err.to_string());
        let from = Mailbox::new(
            Some(
                email
                    .sender_name
                    .clone()
                    .unwrap_or_else(|| self.from_name.clone()),
            ),
            self.from_address.clone(),
        );
        let to = Mailbox::new(
            email.to.name.clone(),
            email.to.email.parse::<Address>().map_err(|err| invalid(&err))?,
        );

        let mut builder = Message::builder().from(from).to(to).subject(&email.subject);
        if let Some(id) = &email.in_reply_to {
            builder = builder.in_reply_to(format!("<{id}>"));
        }
        if !email.references.is_empty() {
            let references = email
                .references
                .iter()
                .map(|id| format!("<{id}>"))
                .collect::<Vec<_>>()
                .join(" ");
            builder = builder.references(references);
        }

        let alternative = MultiPart::alternative_plain_html(email.plain_text(), email.html.clone());
        let message = if email.attachments.is_empty() {
            builder.multipart(alternative)
        } else {
            let mut mixed = MultiPart::mixed().multipart(alternative);
            for attachment in &email.attachments {
                let content_type = match ContentType::parse(&attachment.content_type) {
                    Ok(content_type) => content_type,
                    Err(_) => ContentType::parse("application/octet-stream")
                        .map_err(|err| invalid(&err))?,
                };
                mixed = mixed.singlepart(
                    Attachment::new(attachment.filename.clone())
                        .body(attachment.data.clone(), content_type),
                );
            }
            builder.multipart(mixed)
        };
        message.map_err(|err| invalid(&err))
    }
}

#[async_trait]
impl MailSender for SmtpSender {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SentMail, DeliveryError> {
        let message = self.build_message(email)?;
        self.transport
            .send(message)
            .await
            .map_err(|err| DeliveryError::Transport(err.to_string()))?;
        Ok(SentMail::default())
    }
}

/// The operator's own connected mailbox, used as a shared fallback.
pub struct SystemMailboxSender {
    connector: MailboxConnector,
    tenant_id: String,
}

impl SystemMailboxSender {
    /// Checks once that the configured tenant has a usable mailbox.
    pub async fn resolve(
        connector: MailboxConnector,
        tenant_id: &str,
    ) -> Result<Self, SessionError> {
        let session = connector.open(tenant_id).await?;
        info!(tenant_id, address = %session.address(), "system mailbox resolved");
        Ok(Self {
            connector,
            tenant_id: tenant_id.to_string(),
        })
    }
}

#[async_trait]
impl MailSender for SystemMailboxSender {
    fn name(&self) -> &'static str {
        "system_mailbox"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SentMail, DeliveryError> {
        let session = self.connector.open(&self.tenant_id).await.map_err(|err| match err {
            SessionError::NotConnected(_) => DeliveryError::NotConfigured("system mailbox".into()),
            SessionError::AuthExpired(reason) => DeliveryError::AuthExpired(reason),
            other => DeliveryError::Provider(other.to_string()),
        })?;
        send_via_session(&session, email).await
    }
}

/// Picks the fallback named by config. `system` is the already resolved
/// system mailbox, if any.
pub fn fallback_from_config(
    config: &FallbackConfig,
    system: Option<SystemMailboxSender>,
) -> Result<Option<Arc<dyn MailSender>>, DeliveryError> {
    match config.transport {
        FallbackTransport::Disabled => Ok(None),
        FallbackTransport::Smtp => {
            if config.smtp_host.as_deref().is_none_or(|h| h.trim().is_empty()) {
                warn!("smtp fallback selected without a host, fallback disabled");
                return Ok(None);
            }
            Ok(Some(Arc::new(SmtpSender::from_config(config)?)))
        }
        FallbackTransport::SystemMailbox => match system {
            Some(system) => Ok(Some(Arc::new(system))),
            None => {
                warn!("system mailbox fallback selected but none resolved, fallback disabled");
                Ok(None)
            }
        },
    }
}

/// Tries the tenant's mailbox, then the fallback exactly once.
#[derive(Clone)]
pub struct DeliveryRouter {
    connector: MailboxConnector,
    fallback: Option<Arc<dyn MailSender>>,
    attempt_timeout: Duration,
}

impl DeliveryRouter {
    pub fn new(
        connector: MailboxConnector,
        fallback: Option<Arc<dyn MailSender>>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            fallback,
            attempt_timeout,
        }
    }

    pub fn connector(&self) -> &MailboxConnector {
        &self.connector
    }

    pub async fn deliver(
        &self,
        tenant_id: &str,
        email: &OutboundEmail,
    ) -> Result<Delivered, DeliveryError> {
        email.validate()?;

        let mailbox_error = match self.connector.open(tenant_id).await {
            Ok(session) => {
                match self.bounded(send_via_session(&session, email)).await {
                    Ok(sent) => {
                        debug!(tenant_id, "delivered through tenant mailbox");
                        return Ok(Delivered {
                            channel: Channel::Mailbox,
                            sent,
                            mailbox_error: None,
                        });
                    }
                    Err(err) if err.is_invalid_message() => return Err(err),
                    Err(err) => {
                        warn!(tenant_id, error = %err, "mailbox send failed, trying fallback");
                        Some(err.to_string())
                    }
                }
            }
            Err(SessionError::NotConnected(_)) => None,
            Err(err) => {
                warn!(tenant_id, error = %err, "mailbox unavailable, trying fallback");
                Some(err.to_string())
            }
        };

        let Some(fallback) = &self.fallback else {
            return Err(DeliveryError::AllChannelsFailed {
                mailbox: mailbox_error,
                fallback: "no fallback channel configured".into(),
            });
        };

        match self.bounded(fallback.send(email)).await {
            Ok(sent) => {
                debug!(tenant_id, sender = fallback.name(), "delivered through fallback");
                Ok(Delivered {
                    channel: Channel::Fallback,
                    sent,
                    mailbox_error,
                })
            }
            Err(err) => Err(DeliveryError::AllChannelsFailed {
                mailbox: mailbox_error,
                fallback: err.to_string(),
            }),
        }
    }

    async fn bounded<F>(&self, attempt: F) -> Result<SentMail, DeliveryError>
    where
        F: std::future::Future<Output = Result<SentMail, DeliveryError>>,
    {
        tokio::time::timeout(self.attempt_timeout, attempt)
            .await
            .map_err(|_| DeliveryError::Timeout(self.attempt_timeout))?
    }
}
