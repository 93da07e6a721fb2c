use chrono::{DateTime, Utc};
use libsql::{Connection, Row, params};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339, parse_optional_rfc3339, parse_rfc3339};

const CONVERSATION_COLUMNS: &str = "id, tenant_id, contact_id, channel, status, external_thread_id, subject, participants_json, automation_paused, paused_at, paused_by, unread_count, last_message_at, created_at, updated_at";

pub const DEFAULT_SUBJECT: &str = "(No Subject)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Open,
    Resolved,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Open => "open",
            ConversationStatus::Resolved => "resolved",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "open" => Some(ConversationStatus::Open),
            "resolved" => Some(ConversationStatus::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub tenant_id: String,
    pub contact_id: String,
    pub channel: String,
    pub status: ConversationStatus,
    pub external_thread_id: Option<String>,
    pub subject: Option<String>,
    pub participants: Vec<String>,
    pub automation_paused: bool,
    pub paused_at: Option<DateTime<Utc>>,
    pub paused_by: Option<String>,
    pub unread_count: i64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The provider thread a conversation mirrors, seen from one contact.
#[derive(Debug, Clone, Copy)]
pub struct ThreadKey<'a> {
    pub tenant_id: &'a str,
    pub contact_id: &'a str,
    pub thread_id: &'a str,
    pub subject: Option<&'a str>,
    pub participants: &'a [String],
}

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("conversation not found: {0}")]
    NotFound(String),
    #[error("invalid conversation status {0}")]
    InvalidStatus(String),
}

#[derive(Clone)]
pub struct ConversationRepository {
    db: Database,
}

impl ConversationRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// At most one conversation exists per (tenant, contact, thread).
    pub async fn find_or_create_for_thread(
        &self,
        tenant_id: &str,
        contact_id: &str,
        thread_id: &str,
        subject: Option<&str>,
        participants: &[String],
    ) -> Result<Conversation, ConversationError> {
        let conn = self.db.connection().await?;
        upsert_thread(
            &conn,
            &ThreadKey {
                tenant_id,
                contact_id,
                thread_id,
                subject,
                participants,
            },
        )
        .await
    }

    /// A thread-less conversation, used when automation targets a contact
    /// that has never exchanged mail.
    pub async fn create_open(
        &self,
        tenant_id: &str,
        contact_id: &str,
        channel: &str,
    ) -> Result<Conversation, ConversationError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO conversations (id, tenant_id, contact_id, channel, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 'open', ?5, ?5)
                     RETURNING {CONVERSATION_COLUMNS}"
                ),
                params![Uuid::new_v4().to_string(), tenant_id, contact_id, channel, now],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| ConversationError::NotFound("insert failed".into()))?;
        row_to_conversation(row)
    }

    pub async fn get(&self, tenant_id: &str, id: &str) -> Result<Conversation, ConversationError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE tenant_id = ?1 AND id = ?2"
                ),
                params![tenant_id, id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_conversation(row),
            None => Err(ConversationError::NotFound(id.to_string())),
        }
    }

    pub async fn latest_for_contact(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Option<Conversation>, ConversationError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE tenant_id = ?1 AND contact_id = ?2
                     ORDER BY COALESCE(last_message_at, created_at) DESC
                     LIMIT 1"
                ),
                params![tenant_id, contact_id],
            )
            .await?;

        rows.next().await?.map(row_to_conversation).transpose()
    }

    /// True when any conversation with the contact is paused.
    pub async fn any_paused_for_contact(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<bool, ConversationError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT EXISTS(
                     SELECT 1 FROM conversations
                     WHERE tenant_id = ?1 AND contact_id = ?2 AND automation_paused = 1
                 )",
                params![tenant_id, contact_id],
            )
            .await?;
        let paused: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(paused != 0)
    }

    pub async fn pause(
        &self,
        tenant_id: &str,
        id: &str,
        paused_by: &str,
    ) -> Result<Conversation, ConversationError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE conversations
                     SET automation_paused = 1, paused_at = ?3, paused_by = ?4, updated_at = ?3
                     WHERE tenant_id = ?1 AND id = ?2
                     RETURNING {CONVERSATION_COLUMNS}"
                ),
                params![tenant_id, id, now, paused_by],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_conversation(row),
            None => Err(ConversationError::NotFound(id.to_string())),
        }
    }

    pub async fn resume(&self, tenant_id: &str, id: &str) -> Result<Conversation, ConversationError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE conversations
                     SET automation_paused = 0, paused_at = NULL, paused_by = NULL, updated_at = ?3
                     WHERE tenant_id = ?1 AND id = ?2
                     RETURNING {CONVERSATION_COLUMNS}"
                ),
                params![tenant_id, id, now],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_conversation(row),
            None => Err(ConversationError::NotFound(id.to_string())),
        }
    }

    pub async fn count_paused(&self, tenant_id: &str) -> Result<i64, ConversationError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM conversations WHERE tenant_id = ?1 AND automation_paused = 1",
                params![tenant_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    pub async fn list_for_tenant(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<Conversation>, ConversationError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE tenant_id = ?1
                     ORDER BY created_at"
                ),
                params![tenant_id],
            )
            .await?;

        let mut conversations = Vec::new();
        while let Some(row) = rows.next().await? {
            conversations.push(row_to_conversation(row)?);
        }
        Ok(conversations)
    }
}

/// Finds or creates the thread's conversation on `conn`, which may be an open
/// transaction.
pub(crate) async fn upsert_thread(
    conn: &Connection,
    key: &ThreadKey<'_>,
) -> Result<Conversation, ConversationError> {
    let subject = key
        .subject
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SUBJECT);
    let now = now_rfc3339();
    let mut rows = conn
        .query(
            &format!(
                "INSERT INTO conversations (id, tenant_id, contact_id, channel, status, external_thread_id, subject, participants_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'email', 'open', ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(tenant_id, contact_id, external_thread_id) DO NOTHING
                 RETURNING {CONVERSATION_COLUMNS}"
            ),
            params![
                Uuid::new_v4().to_string(),
                key.tenant_id,
                key.contact_id,
                key.thread_id,
                subject,
                serde_json::to_string(key.participants)?,
                now
            ],
        )
        .await?;

    if let Some(row) = rows.next().await? {
        return row_to_conversation(row);
    }

    let mut rows = conn
        .query(
            &format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE tenant_id = ?1 AND contact_id = ?2 AND external_thread_id = ?3"
            ),
            params![key.tenant_id, key.contact_id, key.thread_id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => row_to_conversation(row),
        None => Err(ConversationError::NotFound(key.thread_id.to_string())),
    }
}

fn row_to_conversation(row: Row) -> Result<Conversation, ConversationError> {
    let status: String = row.get(4)?;
    let participants_json: String = row.get(7)?;
    let paused: i64 = row.get(8)?;
    let paused_at: Option<String> = row.get(9)?;
    let last_message_at: Option<String> = row.get(12)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;

    Ok(Conversation {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        contact_id: row.get(2)?,
        channel: row.get(3)?,
        status: ConversationStatus::from_str(&status)
            .ok_or(ConversationError::InvalidStatus(status))?,
        external_thread_id: row.get(5)?,
        subject: row.get(6)?,
        participants: serde_json::from_str(&participants_json)?,
        automation_paused: paused != 0,
        paused_at: parse_optional_rfc3339(paused_at)?,
        paused_by: row.get(10)?,
        unread_count: row.get(11)?,
        last_message_at: parse_optional_rfc3339(last_message_at)?,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts::{ContactRepository, ContactSource};
    use crate::test_support::{insert_tenant, setup_db};

    async fn setup() -> (ConversationRepository, String, tempfile::TempDir) {
        let (db, dir) = setup_db().await;
        insert_tenant(&db, "t1", None).await;
        let (contact, _) = ContactRepository::new(db.clone())
            .find_or_create_by_email("t1", "jane@example.com", "Jane", ContactSource::Manual)
            .await
            .expect("contact");
        (ConversationRepository::new(db), contact.id, dir)
    }

    #[tokio::test]
    async fn one_conversation_per_thread() {
        let (repo, contact_id, _dir) = setup().await;
        let participants = vec!["jane@example.com".to_string()];

        let first = repo
            .find_or_create_for_thread("t1", &contact_id, "thread-1", None, &participants)
            .await
            .expect("create");
        let again = repo
            .find_or_create_for_thread("t1", &contact_id, "thread-1", Some("Other"), &participants)
            .await
            .expect("find");

        assert_eq!(first.id, again.id);
        assert_eq!(again.subject.as_deref(), Some(DEFAULT_SUBJECT));
        assert_eq!(again.participants, participants);
        assert_eq!(repo.list_for_tenant("t1").await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn pause_and_resume_track_actor() {
        let (repo, contact_id, _dir) = setup().await;
        let conversation = repo
            .create_open("t1", &contact_id, "email")
            .await
            .expect("create");
        assert!(!repo
            .any_paused_for_contact("t1", &contact_id)
            .await
            .expect("paused?"));

        let paused = repo
            .pause("t1", &conversation.id, "user-7")
            .await
            .expect("pause");
        assert!(paused.automation_paused);
        assert_eq!(paused.paused_by.as_deref(), Some("user-7"));
        assert!(paused.paused_at.is_some());
        assert!(repo
            .any_paused_for_contact("t1", &contact_id)
            .await
            .expect("paused?"));
        assert_eq!(repo.count_paused("t1").await.expect("count"), 1);

        let resumed = repo.resume("t1", &conversation.id).await.expect("resume");
        assert!(!resumed.automation_paused);
        assert!(resumed.paused_at.is_none());
        assert!(resumed.paused_by.is_none());
        assert_eq!(repo.count_paused("t1").await.expect("count"), 0);
    }

    #[tokio::test]
    async fn latest_for_contact_prefers_recent_activity() {
        let (repo, contact_id, _dir) = setup().await;
        assert!(repo
            .latest_for_contact("t1", &contact_id)
            .await
            .expect("none")
            .is_none());

        let older = repo
            .find_or_create_for_thread("t1", &contact_id, "a", Some("A"), &[])
            .await
            .expect("a");
        let newer = repo
            .find_or_create_for_thread("t1", &contact_id, "b", Some("B"), &[])
            .await
            .expect("b");
        let conn = repo.db.connection().await.expect("conn");
        conn.execute(
            "UPDATE conversations SET last_message_at = '2030-01-01T00:00:00.000Z' WHERE id = ?1",
            params![older.id.as_str()],
        )
        .await
        .expect("touch");

        let latest = repo
            .latest_for_contact("t1", &contact_id)
            .await
            .expect("query")
            .expect("conversation");
        assert_eq!(latest.id, older.id);
        assert_ne!(latest.id, newer.id);
    }

    #[tokio::test]
    async fn pause_unknown_conversation_is_not_found() {
        let (repo, _contact_id, _dir) = setup().await;
        assert!(matches!(
            repo.pause("t1", "missing", "user").await,
            Err(ConversationError::NotFound(_))
        ));
    }
}
