use chrono::{DateTime, Utc};
use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339, parse_rfc3339};

const TENANT_COLUMNS: &str = "id, name, owner_user_id, owner_email, created_at, updated_at";

/// The business record; only the owner fields matter here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub owner_user_id: String,
    pub owner_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("tenant not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct TenantRepository {
    db: Database,
}

impl TenantRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        name: impl Into<String>,
        owner_user_id: impl Into<String>,
        owner_email: Option<String>,
    ) -> Result<Tenant, TenantError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO tenants (id, name, owner_user_id, owner_email, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                     RETURNING {TENANT_COLUMNS}"
                ),
                params![id, name.into(), owner_user_id.into(), owner_email, now],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| TenantError::NotFound("insert failed".into()))?;
        row_to_tenant(row)
    }

    pub async fn get(&self, id: &str) -> Result<Tenant, TenantError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_tenant(row),
            None => Err(TenantError::NotFound(id.to_string())),
        }
    }
}

fn row_to_tenant(row: Row) -> Result<Tenant, TenantError> {
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        owner_user_id: row.get(2)?,
        owner_email: row.get(3)?,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_db;

    #[tokio::test]
    async fn create_and_fetch_tenant() {
        let (db, _dir) = setup_db().await;
        let repo = TenantRepository::new(db);

        let tenant = repo
            .create("Acme Studio", "user-1", Some("owner@acme.test".into()))
            .await
            .expect("create");
        let fetched = repo.get(&tenant.id).await.expect("get");

        assert_eq!(fetched, tenant);
        assert_eq!(fetched.owner_email.as_deref(), Some("owner@acme.test"));
        assert!(matches!(
            repo.get("missing").await,
            Err(TenantError::NotFound(_))
        ));
    }
}
