use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339, parse_rfc3339};

const NOTIFICATION_COLUMNS: &str = "id, tenant_id, user_id, kind, title, body, link, read, created_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub tenant_id: String,
    pub user_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("notification insert returned no row")]
    NotFound,
}

/// Receives internal events raised by mailbox sync.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: NewNotification) -> Result<(), NotificationError>;
}

#[derive(Clone)]
pub struct NotificationRepository {
    db: Database,
}

impl NotificationRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        notification: &NewNotification,
    ) -> Result<Notification, NotificationError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO notifications (id, tenant_id, user_id, kind, title, body, link, read, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)
                     RETURNING {NOTIFICATION_COLUMNS}"
                ),
                params![
                    Uuid::new_v4().to_string(),
                    notification.tenant_id.as_str(),
                    notification.user_id.as_str(),
                    notification.kind.as_str(),
                    notification.title.as_str(),
                    notification.body.as_str(),
                    notification.link.clone(),
                    now_rfc3339()
                ],
            )
            .await?;

        let row = rows.next().await?.ok_or(NotificationError::NotFound)?;
        row_to_notification(row)
    }

    pub async fn list_for_user(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Vec<Notification>, NotificationError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                     WHERE tenant_id = ?1 AND user_id = ?2
                     ORDER BY created_at DESC"
                ),
                params![tenant_id, user_id],
            )
            .await?;

        let mut notifications = Vec::new();
        while let Some(row) = rows.next().await? {
            notifications.push(row_to_notification(row)?);
        }
        Ok(notifications)
    }
}

#[async_trait]
impl NotificationSink for NotificationRepository {
    async fn notify(&self, notification: NewNotification) -> Result<(), NotificationError> {
        self.create(&notification).await.map(|_| ())
    }
}

fn row_to_notification(row: Row) -> Result<Notification, NotificationError> {
    let read: i64 = row.get(7)?;
    let created_at: String = row.get(8)?;
    Ok(Notification {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        kind: row.get(3)?,
        title: row.get(4)?,
        body: row.get(5)?,
        link: row.get(6)?,
        read: read != 0,
        created_at: parse_rfc3339(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{insert_tenant, setup_db};

    #[tokio::test]
    async fn sink_writes_unread_notification_for_user() {
        let (db, _dir) = setup_db().await;
        insert_tenant(&db, "t1", None).await;
        let repo = NotificationRepository::new(db);

        repo.notify(NewNotification {
            tenant_id: "t1".into(),
            user_id: "owner-t1".into(),
            kind: "message".into(),
            title: "New Email".into(),
            body: "From: Jane\nSubject: Hi".into(),
            link: None,
        })
        .await
        .expect("notify");

        let listed = repo.list_for_user("t1", "owner-t1").await.expect("list");
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].read);
        assert_eq!(listed[0].title, "New Email");
        assert!(repo.list_for_user("t1", "someone-else").await.expect("list").is_empty());
    }
}
