use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use mail_builder::MessageBuilder;
use mail_builder::headers::address::Address;
use mail_builder::headers::message_id::MessageId;
use thiserror::Error;

/// Per-attachment ceiling enforced before anything leaves the process.
pub const MAX_ATTACHMENT_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    pub email: String,
    pub name: Option<String>,
}

impl EmailAddress {
    pub fn new(name: Option<impl Into<String>>, email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: name.map(|n| n.into()),
        }
    }
}

impl From<&str> for EmailAddress {
    fn from(email: &str) -> Self {
        Self {
            email: email.to_string(),
            name: None,
        }
    }
}

impl From<String> for EmailAddress {
    fn from(email: String) -> Self {
        Self { email, name: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Outbound message handed to a delivery channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailEnvelope {
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub attachments: Vec<MimeAttachment>,
}

impl MailEnvelope {
    pub fn new(from: EmailAddress, to: EmailAddress, subject: impl Into<String>) -> Self {
        Self {
            from,
            to: vec![to],
            cc: Vec::new(),
            subject: subject.into(),
            body_text: None,
            body_html: None,
            in_reply_to: None,
            references: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        let html = html.into();
        self.body_text = Some(html_to_text(&html));
        self.body_html = Some(html);
        self
    }

    pub fn with_threading(mut self, in_reply_to: Option<String>, references: Vec<String>) -> Self {
        self.in_reply_to = in_reply_to;
        self.references = references;
        self
    }

    /// Checks that run before any side effect.
    pub fn validate(&self) -> Result<(), MimeBuildError> {
        if self.to.is_empty() && self.cc.is_empty() {
            return Err(MimeBuildError::MissingRecipients);
        }
        let has_body = [&self.body_text, &self.body_html]
            .into_iter()
            .flatten()
            .any(|body| !body.trim().is_empty());
        if !has_body && self.attachments.is_empty() {
            return Err(MimeBuildError::MissingBody);
        }
        check_attachment_sizes(&self.attachments)
    }

    /// Build the RFC 5322 message as a string.
    pub fn to_rfc822(&self) -> Result<String, MimeBuildError> {
        self.validate()?;

        let mut builder = MessageBuilder::new()
            .from(to_header_address(&self.from))
            .subject(self.subject.as_str());

        if !self.to.is_empty() {
            builder = builder.to(address_list(&self.to));
        }
        if !self.cc.is_empty() {
            builder = builder.cc(address_list(&self.cc));
        }
        if let Some(body) = self.body_text.as_ref() {
            builder = builder.text_body(body.as_str());
        }
        if let Some(body) = self.body_html.as_ref() {
            builder = builder.html_body(body.as_str());
        }

        let in_reply_to = self
            .in_reply_to
            .as_deref()
            .and_then(normalize_message_id);
        let references = combined_references(&self.references, in_reply_to.as_deref());
        if let Some(parent) = in_reply_to {
            builder = builder.in_reply_to(MessageId::new(parent));
        }
        if !references.is_empty() {
            builder = builder.references(MessageId::from(references));
        }

        for attachment in &self.attachments {
            let content_type = if attachment.content_type.is_empty() {
                "application/octet-stream".to_string()
            } else {
                attachment.content_type.clone()
            };
            builder = builder.attachment(
                content_type,
                attachment.filename.clone(),
                attachment.data.clone(),
            );
        }

        builder.write_to_string().map_err(MimeBuildError::Io)
    }

    /// Build the message and return it base64url encoded for the Gmail API.
    pub fn to_base64_url(&self) -> Result<String, MimeBuildError> {
        let raw = self.to_rfc822()?;
        Ok(URL_SAFE_NO_PAD.encode(raw.as_bytes()))
    }
}

#[derive(Debug, Error)]
pub enum MimeBuildError {
    #[error("at least one recipient is required")]
    MissingRecipients,
    #[error("a body or attachment is required")]
    MissingBody,
    #[error("attachment {filename} is {size} bytes, limit is {MAX_ATTACHMENT_BYTES}")]
    AttachmentTooLarge { filename: String, size: usize },
    #[error("failed to build message: {0}")]
    Io(#[from] std::io::Error),
}

pub fn check_attachment_sizes(attachments: &[MimeAttachment]) -> Result<(), MimeBuildError> {
    match attachments
        .iter()
        .find(|attachment| attachment.data.len() > MAX_ATTACHMENT_BYTES)
    {
        Some(attachment) => Err(MimeBuildError::AttachmentTooLarge {
            filename: attachment.filename.clone(),
            size: attachment.data.len(),
        }),
        None => Ok(()),
    }
}

fn to_header_address(addr: &EmailAddress) -> Address<'static> {
    Address::new_address(addr.name.clone(), addr.email.clone())
}

fn address_list(addrs: &[EmailAddress]) -> Address<'static> {
    let list: Vec<Address<'static>> = addrs.iter().map(to_header_address).collect();
    Address::new_list(list)
}

/// Strip whitespace and angle brackets; `None` when nothing is left.
pub fn normalize_message_id(id: &str) -> Option<String> {
    let trimmed = id.trim().trim_matches('<').trim_matches('>');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Normalized, first-occurrence-wins list of message ids.
pub fn dedup_message_ids(ids: Vec<String>) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for id in ids {
        if let Some(normalized) = normalize_message_id(&id) {
            if !seen.contains(&normalized) {
                seen.push(normalized);
            }
        }
    }
    seen
}

fn combined_references(existing: &[String], in_reply_to: Option<&str>) -> Vec<String> {
    let mut all_ids: Vec<String> = existing.to_vec();
    if let Some(reply) = in_reply_to {
        all_ids.push(reply.to_string());
    }
    dedup_message_ids(all_ids)
}

/// Escape a plain reply and keep its line breaks in the HTML part.
pub fn text_to_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace("\r\n", "\n")
        .replace('\n', "<br>")
}

pub fn html_to_text(html: &str) -> String {
    let mut cursor = std::io::Cursor::new(html.as_bytes());
    html2text::from_read(&mut cursor, 80).trim().to_string()
}

pub fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed
        .get(..3)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("re:"))
    {
        trimmed.to_string()
    } else {
        format!("Re: {trimmed}")
    }
}
