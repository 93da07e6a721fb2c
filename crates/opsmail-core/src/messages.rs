use chrono::{DateTime, Utc};
use libsql::{Connection, Row, params};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::conversations::{Conversation, ConversationError, ThreadKey, upsert_thread};
use crate::db::{Database, DbError, now_rfc3339, parse_optional_rfc3339, parse_rfc3339, to_rfc3339};
use crate::gmail::parser::AttachmentMeta;

const MESSAGE_COLUMNS: &str = "id, tenant_id, conversation_id, direction, channel, content, subject, from_email, to_json, external_message_id, rfc_message_id, in_reply_to, references_json, attachments_json, labels_json, automated, sent_by, sent_at, read_at, created_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: String,
    pub tenant_id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub channel: String,
    pub content: String,
    pub subject: Option<String>,
    pub from_email: Option<String>,
    pub to: Vec<String>,
    pub external_message_id: Option<String>,
    pub rfc_message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub attachments: Vec<AttachmentMeta>,
    pub labels: Vec<String>,
    pub automated: bool,
    pub sent_by: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub tenant_id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub channel: String,
    pub content: String,
    pub subject: Option<String>,
    pub from_email: Option<String>,
    pub to: Vec<String>,
    pub external_message_id: Option<String>,
    pub rfc_message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub attachments: Vec<AttachmentMeta>,
    pub labels: Vec<String>,
    pub automated: bool,
    pub sent_by: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    /// Pauses the conversation's automation in the same write, recording
    /// this actor.
    pub paused_by: Option<String>,
}

impl NewMessage {
    /// Outbound email with no provider metadata yet.
    pub fn outbound(
        tenant_id: impl Into<String>,
        conversation_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            tenant_id: tenant_id.into(),
            conversation_id: conversation_id.into(),
            direction: Direction::Outbound,
            channel: "email".to_string(),
            content: content.into(),
            subject: None,
            from_email: None,
            to: Vec::new(),
            external_message_id: None,
            rfc_message_id: None,
            in_reply_to: None,
            references: Vec::new(),
            attachments: Vec::new(),
            labels: Vec::new(),
            automated: false,
            sent_by: None,
            sent_at: now,
            read_at: Some(now),
            paused_by: None,
        }
    }

    fn counts_as_unread(&self) -> bool {
        self.direction == Direction::Inbound && self.read_at.is_none()
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("invalid direction value {0}")]
    InvalidDirection(String),
}

#[derive(Clone)]
pub struct MessageRepository {
    db: Database,
}

impl MessageRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn exists_by_external_id(
        &self,
        tenant_id: &str,
        external_message_id: &str,
    ) -> Result<bool, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT 1 FROM messages WHERE tenant_id = ?1 AND external_message_id = ?2 LIMIT 1",
                params![tenant_id, external_message_id],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Inserts the message and updates its conversation in one transaction.
    /// Returns `None` when the external id was already ingested.
    pub async fn insert_and_touch(
        &self,
        message: &NewMessage,
    ) -> Result<Option<ConversationMessage>, MessageError> {
        let conn = self.db.connection().await?;
        let tx = conn.transaction().await?;
        match insert_in(&tx, &message.conversation_id, message).await {
            Ok(Some(stored)) => {
                tx.commit().await?;
                Ok(Some(stored))
            }
            Ok(None) => {
                tx.rollback().await?;
                Ok(None)
            }
            Err(err) => {
                tx.rollback().await?;
                Err(err)
            }
        }
    }

    /// Files the message under the thread's conversation, creating it in the
    /// same transaction, so no conversation is left without its first
    /// message. `message.conversation_id` is ignored. Returns `None` when the
    /// external id was already ingested.
    pub async fn insert_into_thread(
        &self,
        thread: &ThreadKey<'_>,
        message: &NewMessage,
    ) -> Result<Option<(Conversation, ConversationMessage)>, MessageError> {
        let conn = self.db.connection().await?;
        let tx = conn.transaction().await?;
        let outcome = match upsert_thread(&tx, thread).await {
            Ok(conversation) => insert_in(&tx, &conversation.id, message)
                .await
                .map(|stored| stored.map(|stored| (conversation, stored))),
            Err(err) => Err(err.into()),
        };
        match outcome {
            Ok(Some(filed)) => {
                tx.commit().await?;
                Ok(Some(filed))
            }
            Ok(None) => {
                tx.rollback().await?;
                Ok(None)
            }
            Err(err) => {
                tx.rollback().await?;
                Err(err)
            }
        }
    }

    /// Most recent message carrying an RFC Message-ID, used to thread replies.
    pub async fn latest_with_rfc_id(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationMessage>, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE tenant_id = ?1 AND conversation_id = ?2 AND rfc_message_id IS NOT NULL
                     ORDER BY sent_at DESC
                     LIMIT 1"
                ),
                params![tenant_id, conversation_id],
            )
            .await?;
        rows.next().await?.map(row_to_message).transpose()
    }

    pub async fn list_for_conversation(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<ConversationMessage>, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE tenant_id = ?1 AND conversation_id = ?2
                     ORDER BY sent_at, created_at"
                ),
                params![tenant_id, conversation_id],
            )
            .await?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await? {
            messages.push(row_to_message(row)?);
        }
        Ok(messages)
    }
}

/// Inserts and touches the conversation on an open transaction. The caller
/// commits or rolls back.
async fn insert_in(
    conn: &Connection,
    conversation_id: &str,
    message: &NewMessage,
) -> Result<Option<ConversationMessage>, MessageError> {
    let now = now_rfc3339();
    let sent_at = to_rfc3339(message.sent_at);
    let unread_increment: i64 = if message.counts_as_unread() { 1 } else { 0 };

    let mut rows = conn
        .query(
            &format!(
                "INSERT INTO messages ({MESSAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
                 ON CONFLICT(tenant_id, external_message_id) DO NOTHING
                 RETURNING {MESSAGE_COLUMNS}"
            ),
            params![
                Uuid::new_v4().to_string(),
                message.tenant_id.as_str(),
                conversation_id,
                message.direction.as_str(),
                message.channel.as_str(),
                message.content.as_str(),
                message.subject.clone(),
                message.from_email.clone(),
                serde_json::to_string(&message.to)?,
                message.external_message_id.clone(),
                message.rfc_message_id.clone(),
                message.in_reply_to.clone(),
                serde_json::to_string(&message.references)?,
                serde_json::to_string(&message.attachments)?,
                serde_json::to_string(&message.labels)?,
                message.automated as i64,
                message.sent_by.clone(),
                sent_at.clone(),
                message.read_at.map(to_rfc3339),
                now.clone()
            ],
        )
        .await?;
    let Some(row) = rows.next().await? else {
        return Ok(None);
    };
    let stored = row_to_message(row)?;

    let mut touched = conn
        .query(
            "UPDATE conversations
             SET status = 'open',
                 last_message_at = CASE
                     WHEN last_message_at IS NULL OR last_message_at < ?2 THEN ?2
                     ELSE last_message_at
                 END,
                 unread_count = unread_count + ?3,
                 automation_paused = CASE WHEN ?6 IS NULL THEN automation_paused ELSE 1 END,
                 paused_at = CASE WHEN ?6 IS NULL THEN paused_at ELSE ?4 END,
                 paused_by = COALESCE(?6, paused_by),
                 updated_at = ?4
             WHERE id = ?1 AND tenant_id = ?5
             RETURNING id",
            params![
                conversation_id,
                sent_at,
                unread_increment,
                now,
                message.tenant_id.as_str(),
                message.paused_by.clone()
            ],
        )
        .await?;
    if touched.next().await?.is_none() {
        return Err(MessageError::ConversationNotFound(
            conversation_id.to_string(),
        ));
    }
    Ok(Some(stored))
}

fn row_to_message(row: Row) -> Result<ConversationMessage, MessageError> {
    let direction: String = row.get(3)?;
    let to_json: String = row.get(8)?;
    let references_json: String = row.get(12)?;
    let attachments_json: String = row.get(13)?;
    let labels_json: String = row.get(14)?;
    let automated: i64 = row.get(15)?;
    let sent_at: String = row.get(17)?;
    let read_at: Option<String> = row.get(18)?;
    let created_at: String = row.get(19)?;

    Ok(ConversationMessage {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        conversation_id: row.get(2)?,
        direction: Direction::from_str(&direction)
            .ok_or(MessageError::InvalidDirection(direction))?,
        channel: row.get(4)?,
        content: row.get(5)?,
        subject: row.get(6)?,
        from_email: row.get(7)?,
        to: serde_json::from_str(&to_json)?,
        external_message_id: row.get(9)?,
        rfc_message_id: row.get(10)?,
        in_reply_to: row.get(11)?,
        references: serde_json::from_str(&references_json)?,
        attachments: serde_json::from_str(&attachments_json)?,
        labels: serde_json::from_str(&labels_json)?,
        automated: automated != 0,
        sent_by: row.get(16)?,
        sent_at: parse_rfc3339(&sent_at)?,
        read_at: parse_optional_rfc3339(read_at)?,
        created_at: parse_rfc3339(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts::{ContactRepository, ContactSource};
    use crate::conversations::ConversationRepository;
    use crate::test_support::{insert_tenant, setup_db};
    use chrono::Duration;

    struct Fixture {
        db: Database,
        messages: MessageRepository,
        conversations: ConversationRepository,
        contact_id: String,
        conversation_id: String,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let (db, dir) = setup_db().await;
        insert_tenant(&db, "t1", None).await;
        let (contact, _) = ContactRepository::new(db.clone())
            .find_or_create_by_email("t1", "jane@example.com", "Jane", ContactSource::Manual)
            .await
            .expect("contact");
        let conversations = ConversationRepository::new(db.clone());
        let conversation = conversations
            .find_or_create_for_thread("t1", &contact.id, "thread-1", Some("Hi"), &[])
            .await
            .expect("conversation");
        Fixture {
            messages: MessageRepository::new(db.clone()),
            db,
            conversations,
            contact_id: contact.id,
            conversation_id: conversation.id,
            _dir: dir,
        }
    }

    fn inbound(conversation_id: &str, external_id: &str) -> NewMessage {
        NewMessage {
            direction: Direction::Inbound,
            external_message_id: Some(external_id.to_string()),
            rfc_message_id: Some(format!("{external_id}@mail.example.com")),
            from_email: Some("jane@example.com".into()),
            read_at: None,
            attachments: vec![AttachmentMeta {
                filename: "a.pdf".into(),
                mime_type: "application/pdf".into(),
                size: 10,
                attachment_id: "att".into(),
            }],
            ..NewMessage::outbound("t1", conversation_id, "hello")
        }
    }

    #[tokio::test]
    async fn reingesting_same_external_id_is_a_noop() {
        let fx = fixture().await;
        let message = inbound(&fx.conversation_id, "gm-1");

        let first = fx
            .messages
            .insert_and_touch(&message)
            .await
            .expect("insert")
            .expect("stored");
        let second = fx.messages.insert_and_touch(&message).await.expect("dup");

        assert!(second.is_none());
        assert!(fx
            .messages
            .exists_by_external_id("t1", "gm-1")
            .await
            .expect("exists"));
        let all = fx
            .messages
            .list_for_conversation("t1", &fx.conversation_id)
            .await
            .expect("list");
        assert_eq!(all, vec![first]);

        let conversation = fx
            .conversations
            .get("t1", &fx.conversation_id)
            .await
            .expect("conversation");
        assert_eq!(conversation.unread_count, 1);
        assert_eq!(all[0].attachments[0].filename, "a.pdf");
    }

    #[tokio::test]
    async fn touch_keeps_latest_activity_and_skips_unread_for_outbound() {
        let fx = fixture().await;
        let mut newer = inbound(&fx.conversation_id, "gm-new");
        newer.sent_at = Utc::now();
        let mut older = inbound(&fx.conversation_id, "gm-old");
        older.sent_at = Utc::now() - Duration::days(2);
        older.read_at = Some(Utc::now());

        fx.messages.insert_and_touch(&newer).await.expect("newer");
        fx.messages.insert_and_touch(&older).await.expect("older");
        let reply = NewMessage::outbound("t1", &fx.conversation_id, "thanks");
        fx.messages.insert_and_touch(&reply).await.expect("reply");

        let conversation = fx
            .conversations
            .get("t1", &fx.conversation_id)
            .await
            .expect("conversation");
        assert_eq!(conversation.unread_count, 1);
        let last = conversation.last_message_at.expect("activity");
        assert!(last >= newer.sent_at - Duration::milliseconds(1));

        let latest = fx
            .messages
            .latest_with_rfc_id("t1", &fx.conversation_id)
            .await
            .expect("query")
            .expect("threaded message");
        assert_eq!(latest.external_message_id.as_deref(), Some("gm-new"));
    }

    #[tokio::test]
    async fn insert_into_unknown_conversation_rolls_back() {
        let fx = fixture().await;
        let err = fx
            .messages
            .insert_and_touch(&inbound("missing", "gm-x"))
            .await
            .expect_err("foreign key or missing conversation");
        assert!(matches!(
            err,
            MessageError::Sql(_) | MessageError::ConversationNotFound(_)
        ));
        assert!(!fx
            .messages
            .exists_by_external_id("t1", "gm-x")
            .await
            .expect("exists"));
    }

    #[tokio::test]
    async fn paused_reply_pauses_in_the_same_write() {
        let fx = fixture().await;
        let mut reply = NewMessage::outbound("t1", &fx.conversation_id, "on it");
        reply.sent_by = Some("user-3".into());
        reply.paused_by = Some("user-3".into());
        fx.messages.insert_and_touch(&reply).await.expect("reply");

        let conversation = fx
            .conversations
            .get("t1", &fx.conversation_id)
            .await
            .expect("conversation");
        assert!(conversation.automation_paused);
        assert_eq!(conversation.paused_by.as_deref(), Some("user-3"));
        assert!(conversation.paused_at.is_some());

        // Plain messages leave an existing pause alone.
        fx.messages
            .insert_and_touch(&inbound(&fx.conversation_id, "gm-after"))
            .await
            .expect("inbound");
        let conversation = fx
            .conversations
            .get("t1", &fx.conversation_id)
            .await
            .expect("conversation");
        assert!(conversation.automation_paused);
        assert_eq!(conversation.paused_by.as_deref(), Some("user-3"));
    }

    #[tokio::test]
    async fn thread_insert_creates_conversation_with_its_message() {
        let fx = fixture().await;
        let participants = vec!["jane@example.com".to_string()];
        let thread = ThreadKey {
            tenant_id: "t1",
            contact_id: &fx.contact_id,
            thread_id: "thread-2",
            subject: Some("Parking"),
            participants: &participants,
        };

        let (conversation, stored) = fx
            .messages
            .insert_into_thread(&thread, &inbound("", "gm-t2"))
            .await
            .expect("insert")
            .expect("stored");
        assert_eq!(stored.conversation_id, conversation.id);
        assert_eq!(conversation.subject.as_deref(), Some("Parking"));

        let again = fx
            .messages
            .insert_into_thread(&thread, &inbound("", "gm-t2"))
            .await
            .expect("dup");
        assert!(again.is_none());
        let conversation = fx
            .conversations
            .get("t1", &conversation.id)
            .await
            .expect("conversation");
        assert_eq!(conversation.unread_count, 1);
    }

    #[tokio::test]
    async fn failed_thread_insert_leaves_no_conversation() {
        let fx = fixture().await;
        let conn = fx.db.connection().await.expect("conn");
        conn.execute(
            "CREATE TRIGGER reject_messages BEFORE INSERT ON messages
             BEGIN SELECT RAISE(ABORT, 'disk full'); END",
            (),
        )
        .await
        .expect("trigger");

        let thread = ThreadKey {
            tenant_id: "t1",
            contact_id: &fx.contact_id,
            thread_id: "thread-3",
            subject: None,
            participants: &[],
        };
        fx.messages
            .insert_into_thread(&thread, &inbound("", "gm-t3"))
            .await
            .expect_err("insert rejected");

        let conversations = fx.conversations.list_for_tenant("t1").await.expect("list");
        assert_eq!(conversations.len(), 1, "only the fixture conversation exists");
        assert_eq!(conversations[0].id, fx.conversation_id);
    }
}
