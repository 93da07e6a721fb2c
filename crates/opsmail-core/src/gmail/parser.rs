use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::gmail::mime_builder::normalize_message_id;
use crate::gmail::types::{Message, MessagePart};

pub const UNREAD_LABEL: &str = "UNREAD";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    pub name: Option<String>,
}

/// Attachment metadata; the body is fetched on demand by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    pub filename: String,
    pub mime_type: String,
    pub size: i64,
    pub attachment_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub to: Vec<Recipient>,
    pub cc: Vec<Recipient>,
    pub subject: Option<String>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub body_plain: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
    pub labels: Vec<String>,
}

impl ParsedMessage {
    pub fn is_unread(&self) -> bool {
        self.labels.iter().any(|label| label == UNREAD_LABEL)
    }

    /// Every address on the From, To and Cc lines, lowercased, first occurrence kept.
    pub fn participants(&self) -> Vec<Recipient> {
        let mut seen: Vec<Recipient> = Vec::new();
        let from = self.from_email.as_ref().map(|email| Recipient {
            email: email.clone(),
            name: self.from_name.clone(),
        });
        for recipient in from.iter().chain(self.to.iter()).chain(self.cc.iter()) {
            let email = recipient.email.trim().to_ascii_lowercase();
            if email.is_empty() || seen.iter().any(|existing| existing.email == email) {
                continue;
            }
            seen.push(Recipient {
                email,
                name: recipient.name.clone(),
            });
        }
        seen
    }
}

pub fn parse_message(message: &Message) -> ParsedMessage {
    let payload = message.payload.as_ref();

    let from = header_value(payload, "From").and_then(parse_single_recipient);
    let to = header_value(payload, "To")
        .map(parse_recipient_list)
        .unwrap_or_default();
    let cc = header_value(payload, "Cc")
        .map(parse_recipient_list)
        .unwrap_or_default();
    let subject = header_value(payload, "Subject");
    let message_id = header_value(payload, "Message-ID").and_then(|id| normalize_message_id(&id));
    let in_reply_to =
        header_value(payload, "In-Reply-To").and_then(|id| normalize_message_id(&id));
    let references = header_value(payload, "References")
        .map(|value| {
            value
                .split_whitespace()
                .filter_map(normalize_message_id)
                .collect()
        })
        .unwrap_or_default();
    let sent_at = message
        .internal_date
        .as_deref()
        .and_then(parse_internal_date)
        .or_else(|| {
            header_value(payload, "Date").and_then(|value| {
                DateTime::parse_from_rfc2822(value.trim())
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            })
        });

    let mut body_plain = None;
    let mut body_html = None;
    let mut attachments = Vec::new();
    if let Some(part) = payload {
        walk_parts(part, &mut body_plain, &mut body_html, &mut attachments, 0);
    }

    ParsedMessage {
        from_email: from.as_ref().map(|r| r.email.clone()),
        from_name: from.and_then(|r| r.name),
        to,
        cc,
        subject,
        message_id,
        in_reply_to,
        references,
        sent_at,
        body_plain,
        body_html,
        attachments,
        labels: message.label_ids.clone(),
    }
}

fn parse_internal_date(value: &str) -> Option<DateTime<Utc>> {
    let millis: i64 = value.parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

fn header_value(payload: Option<&MessagePart>, name: &str) -> Option<String> {
    payload.and_then(|p| {
        p.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    })
}

fn parse_single_recipient(value: String) -> Option<Recipient> {
    parse_recipient(value.trim())
}

fn parse_recipient_list(value: String) -> Vec<Recipient> {
    split_addresses(&value)
        .into_iter()
        .filter_map(|s| parse_recipient(s.trim()))
        .collect()
}

pub fn parse_recipient(input: &str) -> Option<Recipient> {
    if input.is_empty() {
        return None;
    }

    if let (Some(start), Some(end)) = (input.find('<'), input.rfind('>')) {
        if start < end {
            let email = input[start + 1..end].trim();
            if email.is_empty() {
                return None;
            }
            let name_raw = input[..start].trim();
            let name = (!name_raw.is_empty()).then(|| strip_quotes(name_raw));
            return Some(Recipient {
                email: email.to_string(),
                name,
            });
        }
    }

    let trimmed = input.trim().trim_matches('<').trim_matches('>');
    if trimmed.is_empty() {
        None
    } else {
        Some(Recipient {
            email: trimmed.to_string(),
            name: None,
        })
    }
}

fn strip_quotes(input: &str) -> String {
    let stripped = input
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(input);
    stripped.replace("\\\"", "\"")
}

/// Comma split that ignores commas inside quoted display names.
fn split_addresses(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for ch in input.chars() {
        match ch {
            '"' if !escaped => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
        escaped = ch == '\\' && !escaped;
    }

    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }

    parts
}

const MAX_MIME_DEPTH: usize = 50;

fn walk_parts(
    part: &MessagePart,
    body_plain: &mut Option<String>,
    body_html: &mut Option<String>,
    attachments: &mut Vec<AttachmentMeta>,
    depth: usize,
) {
    if depth > MAX_MIME_DEPTH {
        return;
    }

    let mime = part.mime_type.as_deref().unwrap_or_default();
    let filename = part.filename.as_deref().unwrap_or_default();

    if let Some(body) = part.body.as_ref() {
        if let (false, Some(attachment_id)) = (filename.is_empty(), body.attachment_id.as_ref()) {
            attachments.push(AttachmentMeta {
                filename: filename.to_string(),
                mime_type: if mime.is_empty() {
                    "application/octet-stream".to_string()
                } else {
                    mime.to_string()
                },
                size: body.size,
                attachment_id: attachment_id.clone(),
            });
        } else if let Some(data) = body.data.as_ref() {
            let slot = if mime.eq_ignore_ascii_case("text/plain") {
                Some(&mut *body_plain)
            } else if mime.eq_ignore_ascii_case("text/html") {
                Some(&mut *body_html)
            } else {
                None
            };
            if let Some(slot) = slot.filter(|slot| slot.is_none() && filename.is_empty()) {
                *slot = decode_text(data);
            }
        }
    }

    for child in &part.parts {
        walk_parts(child, body_plain, body_html, attachments, depth + 1);
    }
}

/// Provider bodies are base64url; some producers pad or use the standard alphabet.
pub fn decode_body_bytes(data: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(data)
        .or_else(|_| URL_SAFE.decode(data))
        .or_else(|_| STANDARD.decode(data))
        .ok()
}

fn decode_text(data: &str) -> Option<String> {
    decode_body_bytes(data).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::types::{Header, MessagePartBody};
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn make_part(mime: &str, text: &str) -> MessagePart {
        MessagePart {
            part_id: None,
            mime_type: Some(mime.to_string()),
            filename: None,
            headers: vec![],
            body: Some(MessagePartBody {
                size: text.len() as i64,
                data: Some(URL_SAFE_NO_PAD.encode(text.as_bytes())),
                attachment_id: None,
            }),
            parts: vec![],
        }
    }

    fn make_message(part: MessagePart, headers: Vec<Header>) -> Message {
        Message {
            id: "msg".into(),
            thread_id: Some("t1".into()),
            label_ids: vec![],
            snippet: None,
            history_id: None,
            internal_date: None,
            payload: Some(MessagePart { headers, ..part }),
            size_estimate: None,
        }
    }

    #[test]
    fn parses_single_part_plain_text() {
        let headers = vec![
            Header {
                name: "From".into(),
                value: "Alice <alice@example.com>".into(),
            },
            Header {
                name: "To".into(),
                value: "Bob <bob@example.com>".into(),
            },
            Header {
                name: "Subject".into(),
                value: "Hello".into(),
            },
        ];
        let message = make_message(make_part("text/plain", "Hello world"), headers);
        let parsed = parse_message(&message);

        assert_eq!(parsed.from_email.as_deref(), Some("alice@example.com"));
        assert_eq!(parsed.from_name.as_deref(), Some("Alice"));
        assert_eq!(parsed.to.len(), 1);
        assert_eq!(parsed.subject.as_deref(), Some("Hello"));
        assert_eq!(parsed.body_plain.as_deref(), Some("Hello world"));
        assert!(parsed.body_html.is_none());
    }

    #[test]
    fn parses_multipart_alternative() {
        let plain = make_part("text/plain", "Plain body");
        let html = make_part("text/html", "<p>HTML</p>");
        let payload = MessagePart {
            part_id: None,
            mime_type: Some("multipart/alternative".into()),
            filename: None,
            headers: vec![Header {
                name: "To".into(),
                value: "Bob <bob@example.com>".into(),
            }],
            body: None,
            parts: vec![plain.clone(), html.clone()],
        };

        let headers = vec![Header {
            name: "From".into(),
            value: "Alice <alice@example.com>".into(),
        }];
        let message = make_message(payload, headers);
        let parsed = parse_message(&message);

        assert_eq!(parsed.body_plain.as_deref(), Some("Plain body"));
        assert_eq!(parsed.body_html.as_deref(), Some("<p>HTML</p>"));
    }

    #[test]
    fn parses_nested_multipart_mixed_with_alternative() {
        let plain = make_part("text/plain", "Nested plain");
        let html = make_part("text/html", "<p>Nested html</p>");
        let alternative = MessagePart {
            part_id: None,
            mime_type: Some("multipart/alternative".into()),
            filename: None,
            headers: vec![],
            body: None,
            parts: vec![plain, html],
        };

        let mixed = MessagePart {
            part_id: None,
            mime_type: Some("multipart/mixed".into()),
            filename: None,
            headers: vec![Header {
                name: "To".into(),
                value: "bob@example.com".into(),
            }],
            body: None,
            parts: vec![alternative],
        };

        let message = make_message(
            mixed,
            vec![Header {
                name: "From".into(),
                value: "<sender@example.com>".into(),
            }],
        );
        let parsed = parse_message(&message);

        assert_eq!(parsed.from_email.as_deref(), Some("sender@example.com"));
        assert!(parsed.from_name.is_none());
        assert_eq!(parsed.body_plain.as_deref(), Some("Nested plain"));
        assert_eq!(parsed.body_html.as_deref(), Some("<p>Nested html</p>"));
    }

    #[test]
    fn parses_multiple_recipients_and_preserves_names() {
        let headers = vec![
            Header {
                name: "To".into(),
                value: "Bob <bob@example.com>, \"Carol, Sr.\" <carol@example.com>".into(),
            },
            Header {
                name: "Cc".into(),
                value: "dave@example.com".into(),
            },
        ];
        let message = make_message(make_part("text/plain", "body"), headers);
        let parsed = parse_message(&message);

        assert_eq!(parsed.to.len(), 2);
        assert_eq!(parsed.to[0].name.as_deref(), Some("Bob"));
        assert_eq!(parsed.to[1].name.as_deref(), Some("Carol, Sr."));
        assert_eq!(parsed.cc[0].email, "dave@example.com");
    }

    #[test]
    fn decodes_base64url_body() {
        let data = URL_SAFE_NO_PAD.encode("hello-base64url".as_bytes());
        let part = MessagePart {
            part_id: None,
            mime_type: Some("text/plain".into()),
            filename: None,
            headers: vec![],
            body: Some(crate::gmail::types::MessagePartBody {
                size: 0,
                data: Some(data),
                attachment_id: None,
            }),
            parts: vec![],
        };

        let message = make_message(part, vec![]);
        let parsed = parse_message(&message);
        assert_eq!(parsed.body_plain.as_deref(), Some("hello-base64url"));
    }

    #[test]
    fn handles_escaped_quotes_in_names() {
        let headers = vec![Header {
            name: "To".into(),
            value: r#""John \"Jr.\" Doe" <john@example.com>, "Plain Name" <plain@example.com>"#
                .into(),
        }];
        let message = make_message(make_part("text/plain", "body"), headers);
        let parsed = parse_message(&message);

        assert_eq!(parsed.to.len(), 2);
        assert_eq!(parsed.to[0].email, "john@example.com");
        assert_eq!(parsed.to[0].name.as_deref(), Some("John \"Jr.\" Doe"));
        assert_eq!(parsed.to[1].email, "plain@example.com");
        assert_eq!(parsed.to[1].name.as_deref(), Some("Plain Name"));
    }

    #[test]
    fn depth_limit_prevents_stack_overflow() {
        fn make_deeply_nested(depth: usize) -> MessagePart {
            if depth == 0 {
                make_part("text/plain", "deep content")
            } else {
                MessagePart {
                    part_id: None,
                    mime_type: Some("multipart/mixed".into()),
                    filename: None,
                    headers: vec![],
                    body: None,
                    parts: vec![make_deeply_nested(depth - 1)],
                }
            }
        }

        let deep_message = make_message(make_deeply_nested(60), vec![]);
        let parsed = parse_message(&deep_message);

        assert!(parsed.body_plain.is_none());
    }

    #[test]
    fn extracts_threading_headers_and_date() {
        let headers = vec![
            Header {
                name: "Message-ID".into(),
                value: "<reply-2@mail.example.com>".into(),
            },
            Header {
                name: "In-Reply-To".into(),
                value: "<reply-1@mail.example.com>".into(),
            },
            Header {
                name: "References".into(),
                value: "<root@mail.example.com>\r\n <reply-1@mail.example.com>".into(),
            },
            Header {
                name: "Date".into(),
                value: "Tue, 1 Jul 2025 10:52:37 +0200".into(),
            },
        ];
        let parsed = parse_message(&make_message(make_part("text/plain", "hi"), headers));

        assert_eq!(parsed.message_id.as_deref(), Some("reply-2@mail.example.com"));
        assert_eq!(parsed.in_reply_to.as_deref(), Some("reply-1@mail.example.com"));
        assert_eq!(
            parsed.references,
            vec!["root@mail.example.com", "reply-1@mail.example.com"]
        );
        let sent_at = parsed.sent_at.expect("date parsed");
        assert_eq!(sent_at.to_rfc3339(), "2025-07-01T08:52:37+00:00");
    }

    #[test]
    fn internal_date_wins_over_header() {
        let mut message = make_message(
            make_part("text/plain", "hi"),
            vec![Header {
                name: "Date".into(),
                value: "Tue, 1 Jul 2025 10:52:37 +0200".into(),
            }],
        );
        message.internal_date = Some("1700000000000".into());
        let parsed = parse_message(&message);
        assert_eq!(parsed.sent_at.map(|d| d.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn collects_attachment_metadata_without_bodies() {
        let attachment = MessagePart {
            part_id: Some("2".into()),
            mime_type: Some("application/pdf".into()),
            filename: Some("invoice.pdf".into()),
            headers: vec![],
            body: Some(MessagePartBody {
                size: 2048,
                data: None,
                attachment_id: Some("att-1".into()),
            }),
            parts: vec![],
        };
        let mixed = MessagePart {
            part_id: None,
            mime_type: Some("multipart/mixed".into()),
            filename: None,
            headers: vec![],
            body: None,
            parts: vec![make_part("text/plain", "see attached"), attachment],
        };
        let parsed = parse_message(&make_message(mixed, vec![]));

        assert_eq!(parsed.body_plain.as_deref(), Some("see attached"));
        assert_eq!(
            parsed.attachments,
            vec![AttachmentMeta {
                filename: "invoice.pdf".into(),
                mime_type: "application/pdf".into(),
                size: 2048,
                attachment_id: "att-1".into(),
            }]
        );
    }

    #[test]
    fn participants_are_lowercased_and_unique() {
        let headers = vec![
            Header {
                name: "From".into(),
                value: "Jane <Jane@Example.com>".into(),
            },
            Header {
                name: "To".into(),
                value: "owner@acme.test, jane@example.com".into(),
            },
            Header {
                name: "Cc".into(),
                value: "OWNER@acme.test".into(),
            },
        ];
        let parsed = parse_message(&make_message(make_part("text/plain", "x"), headers));
        let emails: Vec<_> = parsed.participants().into_iter().map(|r| r.email).collect();
        assert_eq!(emails, vec!["jane@example.com", "owner@acme.test"]);
    }

    #[test]
    fn unread_follows_label() {
        let mut message = make_message(make_part("text/plain", "x"), vec![]);
        assert!(!parse_message(&message).is_unread());
        message.label_ids = vec!["INBOX".into(), UNREAD_LABEL.into()];
        assert!(parse_message(&message).is_unread());
    }
}
