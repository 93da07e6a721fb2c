use chrono::{DateTime, Utc};
use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339, parse_rfc3339};

const CONTACT_COLUMNS: &str = "id, tenant_id, name, email, phone, source, created_at, updated_at";

/// Where a contact was first referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactSource {
    FormSubmission,
    Booking,
    Manual,
    MailboxImport,
}

impl ContactSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactSource::FormSubmission => "form_submission",
            ContactSource::Booking => "booking",
            ContactSource::Manual => "manual",
            ContactSource::MailboxImport => "mailbox_import",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "form_submission" => Some(ContactSource::FormSubmission),
            "booking" => Some(ContactSource::Booking),
            "manual" => Some(ContactSource::Manual),
            "mailbox_import" => Some(ContactSource::MailboxImport),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub source: ContactSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ContactError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("contact not found: {0}")]
    NotFound(String),
    #[error("invalid contact source {0}")]
    InvalidSource(String),
}

#[derive(Clone)]
pub struct ContactRepository {
    db: Database,
}

impl ContactRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the tenant's contact for `email`, creating it on first reference.
    /// The boolean is true when this call created the row.
    pub async fn find_or_create_by_email(
        &self,
        tenant_id: &str,
        email: &str,
        name: &str,
        source: ContactSource,
    ) -> Result<(Contact, bool), ContactError> {
        let email = email.trim().to_ascii_lowercase();
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO contacts (id, tenant_id, name, email, phone, source, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6, ?6)
                     ON CONFLICT(tenant_id, email) DO NOTHING
                     RETURNING {CONTACT_COLUMNS}"
                ),
                params![
                    Uuid::new_v4().to_string(),
                    tenant_id,
                    name,
                    email.as_str(),
                    source.as_str(),
                    now
                ],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            return Ok((row_to_contact(row)?, true));
        }

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CONTACT_COLUMNS} FROM contacts WHERE tenant_id = ?1 AND email = ?2"
                ),
                params![tenant_id, email.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok((row_to_contact(row)?, false)),
            None => Err(ContactError::NotFound(email)),
        }
    }

    pub async fn create(
        &self,
        tenant_id: &str,
        name: &str,
        email: Option<&str>,
        phone: Option<&str>,
        source: ContactSource,
    ) -> Result<Contact, ContactError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO contacts (id, tenant_id, name, email, phone, source, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                     RETURNING {CONTACT_COLUMNS}"
                ),
                params![
                    Uuid::new_v4().to_string(),
                    tenant_id,
                    name,
                    email.map(|e| e.trim().to_ascii_lowercase()),
                    phone,
                    source.as_str(),
                    now
                ],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| ContactError::NotFound("insert failed".into()))?;
        row_to_contact(row)
    }

    pub async fn get(&self, tenant_id: &str, id: &str) -> Result<Contact, ContactError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE tenant_id = ?1 AND id = ?2"),
                params![tenant_id, id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_contact(row),
            None => Err(ContactError::NotFound(id.to_string())),
        }
    }
}

/// Display name, or the local part of the address when there is none.
pub fn display_name_for(name: Option<&str>, email: &str) -> String {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => name.to_string(),
        None => email.split('@').next().unwrap_or(email).to_string(),
    }
}

fn row_to_contact(row: Row) -> Result<Contact, ContactError> {
    let source: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(Contact {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        source: ContactSource::from_str(&source).ok_or(ContactError::InvalidSource(source))?,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{insert_tenant, setup_db};

    #[tokio::test]
    async fn find_or_create_never_duplicates_by_email() {
        let (db, _dir) = setup_db().await;
        insert_tenant(&db, "t1", None).await;
        let repo = ContactRepository::new(db);

        let (first, created) = repo
            .find_or_create_by_email("t1", "Jane@Example.com", "Jane", ContactSource::MailboxImport)
            .await
            .expect("create");
        assert!(created);
        assert_eq!(first.email.as_deref(), Some("jane@example.com"));
        assert_eq!(first.source, ContactSource::MailboxImport);

        let (second, created) = repo
            .find_or_create_by_email("t1", "jane@example.com ", "Other", ContactSource::Booking)
            .await
            .expect("find");
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.name, "Jane");
    }

    #[tokio::test]
    async fn contacts_are_scoped_by_tenant() {
        let (db, _dir) = setup_db().await;
        insert_tenant(&db, "t1", None).await;
        insert_tenant(&db, "t2", None).await;
        let repo = ContactRepository::new(db);

        let (a, _) = repo
            .find_or_create_by_email("t1", "jane@example.com", "Jane", ContactSource::Manual)
            .await
            .expect("t1");
        let (b, created) = repo
            .find_or_create_by_email("t2", "jane@example.com", "Jane", ContactSource::Manual)
            .await
            .expect("t2");
        assert!(created);
        assert_ne!(a.id, b.id);
        assert!(matches!(
            repo.get("t2", &a.id).await,
            Err(ContactError::NotFound(_))
        ));
    }

    #[test]
    fn display_name_falls_back_to_local_part() {
        assert_eq!(display_name_for(Some(" Jane "), "jane@example.com"), "Jane");
        assert_eq!(display_name_for(Some(""), "jane.doe@example.com"), "jane.doe");
        assert_eq!(display_name_for(None, "bob@example.com"), "bob");
    }
}
