use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339, parse_rfc3339};
use crate::gmail::oauth::{OAuthTokens, TokenStore};
use crate::vault::{CredentialVault, VaultError};

const INTEGRATION_COLUMNS: &str =
    "id, tenant_id, provider, email, credential_json, state_json, created_at, updated_at";
const MAX_STATE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    #[default]
    Disconnected,
}

/// `uninitialized -> syncing -> idle`, with `error` reachable from any state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Uninitialized,
    Syncing,
    Idle,
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Uninitialized => "uninitialized",
            SyncState::Syncing => "syncing",
            SyncState::Idle => "idle",
            SyncState::Error => "error",
        }
    }
}

/// Both secrets are vault ciphertexts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredCredential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl StoredCredential {
    pub fn seal(vault: &CredentialVault, tokens: &OAuthTokens) -> Result<Self, VaultError> {
        Ok(Self {
            access_token: vault.encrypt(&tokens.access_token)?,
            refresh_token: vault.encrypt(&tokens.refresh_token)?,
            expires_at: tokens.expires_at,
        })
    }

    pub fn open(&self, vault: &CredentialVault) -> Result<OAuthTokens, VaultError> {
        Ok(OAuthTokens {
            access_token: vault.decrypt(&self.access_token)?,
            refresh_token: vault.decrypt(&self.refresh_token)?,
            expires_at: self.expires_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct IntegrationState {
    pub connection: ConnectionStatus,
    pub reason: Option<String>,
    /// `None` means the next pass must be an initial sync.
    pub history_id: Option<String>,
    pub sync_state: SyncState,
    pub sync_error: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub watch_expiration: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxIntegration {
    pub id: String,
    pub tenant_id: String,
    pub provider: String,
    pub email: Option<String>,
    pub credential: Option<StoredCredential>,
    pub state: IntegrationState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MailboxIntegration {
    pub fn is_connected(&self) -> bool {
        self.state.connection == ConnectionStatus::Connected && self.credential.is_some()
    }
}

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error("mailbox integration not found for tenant {0}")]
    NotFound(String),
    #[error("concurrent state update for tenant {0}")]
    Conflict(String),
}

#[derive(Clone)]
pub struct IntegrationRepository {
    db: Database,
}

impl IntegrationRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Stores a fresh grant. The cursor is reset so the next pass is an initial sync.
    pub async fn upsert_connected(
        &self,
        tenant_id: &str,
        email: &str,
        credential: &StoredCredential,
    ) -> Result<MailboxIntegration, IntegrationError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let credential_json = serde_json::to_string(credential)?;
        let state = IntegrationState {
            connection: ConnectionStatus::Connected,
            ..IntegrationState::default()
        };
        let state_json = serde_json::to_string(&state)?;

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO mailbox_integrations (id, tenant_id, provider, email, credential_json, state_json, created_at, updated_at)
                     VALUES (?1, ?2, 'gmail', ?3, ?4, ?5, ?6, ?6)
                     ON CONFLICT(tenant_id) DO UPDATE SET
                         email = excluded.email,
                         credential_json = excluded.credential_json,
                         state_json = excluded.state_json,
                         updated_at = excluded.updated_at
                     RETURNING {INTEGRATION_COLUMNS}"
                ),
                params![
                    id,
                    tenant_id,
                    email.to_ascii_lowercase(),
                    credential_json,
                    state_json,
                    now
                ],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| IntegrationError::NotFound(tenant_id.to_string()))?;
        row_to_integration(row)
    }

    pub async fn find_by_tenant(
        &self,
        tenant_id: &str,
    ) -> Result<Option<MailboxIntegration>, IntegrationError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {INTEGRATION_COLUMNS} FROM mailbox_integrations WHERE tenant_id = ?1"
                ),
                params![tenant_id],
            )
            .await?;

        rows.next().await?.map(row_to_integration).transpose()
    }

    pub async fn get_by_tenant(
        &self,
        tenant_id: &str,
    ) -> Result<MailboxIntegration, IntegrationError> {
        self.find_by_tenant(tenant_id)
            .await?
            .ok_or_else(|| IntegrationError::NotFound(tenant_id.to_string()))
    }

    /// Resolves a push notification's mailbox address.
    pub async fn find_by_email(
        &self,
        email: &str,
    ) -> Result<Option<MailboxIntegration>, IntegrationError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {INTEGRATION_COLUMNS} FROM mailbox_integrations
                     WHERE email = ?1
                     ORDER BY updated_at DESC
                     LIMIT 1"
                ),
                params![email.trim().to_ascii_lowercase()],
            )
            .await?;

        rows.next().await?.map(row_to_integration).transpose()
    }

    pub async fn update_credential(
        &self,
        tenant_id: &str,
        credential: &StoredCredential,
    ) -> Result<(), IntegrationError> {
        let now = now_rfc3339();
        let credential_json = serde_json::to_string(credential)?;
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE mailbox_integrations
                 SET credential_json = ?1, updated_at = ?2
                 WHERE tenant_id = ?3 AND credential_json IS NOT NULL
                 RETURNING id",
                params![credential_json, now, tenant_id],
            )
            .await?;

        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(IntegrationError::NotFound(tenant_id.to_string())),
        }
    }

    /// Read-modify-write of the state document, retried when another writer
    /// changed it between the read and the update.
    pub async fn update_state<F>(
        &self,
        tenant_id: &str,
        mutate: F,
    ) -> Result<MailboxIntegration, IntegrationError>
    where
        F: Fn(&mut IntegrationState),
    {
        for _ in 0..MAX_STATE_ATTEMPTS {
            let conn = self.db.connection().await?;
            let mut rows = conn
                .query(
                    "SELECT state_json FROM mailbox_integrations WHERE tenant_id = ?1",
                    params![tenant_id],
                )
                .await?;
            let expected_json: String = match rows.next().await? {
                Some(row) => row.get(0)?,
                None => return Err(IntegrationError::NotFound(tenant_id.to_string())),
            };
            let mut next: IntegrationState = serde_json::from_str(&expected_json)?;
            mutate(&mut next);
            let next_json = serde_json::to_string(&next)?;

            let mut rows = conn
                .query(
                    &format!(
                        "UPDATE mailbox_integrations
                         SET state_json = ?1, updated_at = ?2
                         WHERE tenant_id = ?3 AND state_json = ?4
                         RETURNING {INTEGRATION_COLUMNS}"
                    ),
                    params![next_json, now_rfc3339(), tenant_id, expected_json],
                )
                .await?;

            if let Some(row) = rows.next().await? {
                return row_to_integration(row);
            }
            warn!(tenant_id, "integration state changed concurrently, retrying");
        }
        Err(IntegrationError::Conflict(tenant_id.to_string()))
    }

    /// Drops the credential and cursor; the tenant must authorize again.
    pub async fn disconnect(
        &self,
        tenant_id: &str,
        reason: &str,
    ) -> Result<MailboxIntegration, IntegrationError> {
        let current = self.get_by_tenant(tenant_id).await?;
        let state = IntegrationState {
            connection: ConnectionStatus::Disconnected,
            reason: Some(reason.to_string()),
            history_id: None,
            sync_state: SyncState::Uninitialized,
            sync_error: None,
            last_sync_at: current.state.last_sync_at,
            watch_expiration: None,
        };
        let state_json = serde_json::to_string(&state)?;

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE mailbox_integrations
                     SET credential_json = NULL, state_json = ?1, updated_at = ?2
                     WHERE tenant_id = ?3
                     RETURNING {INTEGRATION_COLUMNS}"
                ),
                params![state_json, now_rfc3339(), tenant_id],
            )
            .await?;

        info!(tenant_id, reason, "mailbox integration disconnected");
        match rows.next().await? {
            Some(row) => row_to_integration(row),
            None => Err(IntegrationError::NotFound(tenant_id.to_string())),
        }
    }
}

fn row_to_integration(row: Row) -> Result<MailboxIntegration, IntegrationError> {
    let credential_json: Option<String> = row.get(4)?;
    let state_json: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;

    Ok(MailboxIntegration {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        provider: row.get(2)?,
        email: row.get(3)?,
        credential: credential_json
            .map(|json| serde_json::from_str(&json))
            .transpose()?,
        state: serde_json::from_str(&state_json)?,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}

/// Persists refreshed tokens for one tenant and records revocation.
#[derive(Clone)]
pub struct IntegrationTokenStore {
    repo: IntegrationRepository,
    vault: Arc<CredentialVault>,
    tenant_id: String,
}

impl IntegrationTokenStore {
    pub fn new(
        repo: IntegrationRepository,
        vault: Arc<CredentialVault>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            vault,
            tenant_id: tenant_id.into(),
        }
    }
}

#[async_trait]
impl TokenStore for IntegrationTokenStore {
    type Error = IntegrationError;

    async fn save_tokens(&self, tokens: &OAuthTokens) -> Result<(), Self::Error> {
        let sealed = StoredCredential::seal(&self.vault, tokens)?;
        self.repo.update_credential(&self.tenant_id, &sealed).await
    }

    async fn mark_revoked(&self, reason: &str) -> Result<(), Self::Error> {
        self.repo.disconnect(&self.tenant_id, reason).await?;
        Ok(())
    }
}
