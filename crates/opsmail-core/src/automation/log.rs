use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::TriggerKind;
use crate::db::{Database, DbError, parse_rfc3339, to_rfc3339};

const LOG_COLUMNS: &str = "id, tenant_id, trigger_kind, contact_id, conversation_id, booking_id, inventory_item_id, channel, success, error, metadata_json, fired_at";
pub const DEFAULT_LOG_LIMIT: u32 = 100;
pub const MAX_LOG_LIMIT: u32 = 500;

/// One fire attempt. Rows are append-only.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutomationLogEntry {
    pub id: String,
    pub tenant_id: String,
    pub trigger: TriggerKind,
    pub contact_id: Option<String>,
    pub conversation_id: Option<String>,
    pub booking_id: Option<String>,
    pub inventory_item_id: Option<String>,
    pub channel: String,
    pub success: bool,
    pub error: Option<String>,
    pub metadata: Value,
    pub fired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub tenant_id: String,
    pub trigger: TriggerKind,
    pub contact_id: Option<String>,
    pub conversation_id: Option<String>,
    pub booking_id: Option<String>,
    pub inventory_item_id: Option<String>,
    pub channel: String,
    pub success: bool,
    pub error: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct LogFilter {
    #[serde(default)]
    pub trigger: Option<TriggerKind>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl LogFilter {
    fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_LOG_LIMIT)
            .clamp(1, MAX_LOG_LIMIT)
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerCounts {
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogStats {
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    pub by_trigger: BTreeMap<TriggerKind, TriggerCounts>,
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("unknown trigger kind {0}")]
    UnknownTrigger(String),
    #[error("log insert returned no row")]
    InsertFailed,
}

#[derive(Clone)]
pub struct AutomationLogRepository {
    db: Database,
}

impl AutomationLogRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn append(&self, entry: &NewLogEntry) -> Result<AutomationLogEntry, LogError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO automation_logs ({LOG_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     RETURNING {LOG_COLUMNS}"
                ),
                params![
                    Uuid::new_v4().to_string(),
                    entry.tenant_id.as_str(),
                    entry.trigger.as_str(),
                    entry.contact_id.clone(),
                    entry.conversation_id.clone(),
                    entry.booking_id.clone(),
                    entry.inventory_item_id.clone(),
                    entry.channel.as_str(),
                    entry.success as i64,
                    entry.error.clone(),
                    serde_json::to_string(&entry.metadata)?,
                    to_rfc3339(Utc::now())
                ],
            )
            .await?;
        let row = rows.next().await?.ok_or(LogError::InsertFailed)?;
        row_to_entry(row)
    }

    /// Newest first.
    pub async fn list(
        &self,
        tenant_id: &str,
        filter: &LogFilter,
    ) -> Result<Vec<AutomationLogEntry>, LogError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM automation_logs
                     WHERE tenant_id = ?1
                       AND (?2 IS NULL OR trigger_kind = ?2)
                       AND (?3 IS NULL OR success = ?3)
                       AND (?4 IS NULL OR fired_at >= ?4)
                       AND (?5 IS NULL OR fired_at <= ?5)
                     ORDER BY fired_at DESC
                     LIMIT ?6"
                ),
                params![
                    tenant_id,
                    filter.trigger.map(|t| t.as_str()),
                    filter.success.map(i64::from),
                    filter.from.map(to_rfc3339),
                    filter.to.map(to_rfc3339),
                    filter.effective_limit() as i64
                ],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(row_to_entry(row)?);
        }
        Ok(entries)
    }

    pub async fn stats(&self, tenant_id: &str) -> Result<LogStats, LogError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT trigger_kind, COUNT(*), COALESCE(SUM(success), 0)
                 FROM automation_logs WHERE tenant_id = ?1
                 GROUP BY trigger_kind",
                params![tenant_id],
            )
            .await?;

        let mut stats = LogStats::default();
        while let Some(row) = rows.next().await? {
            let trigger: String = row.get(0)?;
            let total: i64 = row.get(1)?;
            let successful: i64 = row.get(2)?;
            let trigger = TriggerKind::from_str(&trigger).ok_or(LogError::UnknownTrigger(trigger))?;
            stats.total += total;
            stats.successful += successful;
            stats.failed += total - successful;
            stats.by_trigger.insert(
                trigger,
                TriggerCounts {
                    total,
                    successful,
                    failed: total - successful,
                },
            );
        }
        Ok(stats)
    }

    /// Deletes entries fired before `older_than` across all tenants.
    pub async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64, LogError> {
        let conn = self.db.connection().await?;
        let deleted = conn
            .execute(
                "DELETE FROM automation_logs WHERE fired_at < ?1",
                params![to_rfc3339(older_than)],
            )
            .await?;
        Ok(deleted)
    }
}

fn row_to_entry(row: Row) -> Result<AutomationLogEntry, LogError> {
    let trigger: String = row.get(2)?;
    let success: i64 = row.get(8)?;
    let metadata_json: String = row.get(10)?;
    let fired_at: String = row.get(11)?;
    Ok(AutomationLogEntry {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        trigger: TriggerKind::from_str(&trigger).ok_or(LogError::UnknownTrigger(trigger))?,
        contact_id: row.get(3)?,
        conversation_id: row.get(4)?,
        booking_id: row.get(5)?,
        inventory_item_id: row.get(6)?,
        channel: row.get(7)?,
        success: success != 0,
        error: row.get(9)?,
        metadata: serde_json::from_str(&metadata_json)?,
        fired_at: parse_rfc3339(&fired_at)?,
    })
}
