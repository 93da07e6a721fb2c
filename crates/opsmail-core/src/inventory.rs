use chrono::{DateTime, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339, parse_rfc3339};

const INVENTORY_COLUMNS: &str =
    "id, tenant_id, name, unit, quantity, threshold, alert_sent, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub unit: Option<String>,
    pub quantity: i64,
    pub threshold: i64,
    pub alert_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InventoryItem {
    pub fn is_low(&self) -> bool {
        self.quantity <= self.threshold
    }
}

/// Stock level update. Older clients send `stock`; it maps onto the one
/// authoritative `quantity`.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct InventoryLevel {
    #[serde(alias = "stock")]
    pub quantity: i64,
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("inventory item not found: {0}")]
    NotFound(String),
    #[error("quantity must not be negative, got {0}")]
    NegativeQuantity(i64),
}

#[derive(Clone)]
pub struct InventoryRepository {
    db: Database,
}

impl InventoryRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        tenant_id: &str,
        name: &str,
        unit: Option<&str>,
        quantity: i64,
        threshold: i64,
    ) -> Result<InventoryItem, InventoryError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO inventory_items (id, tenant_id, name, unit, quantity, threshold, alert_sent, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)
                     RETURNING {INVENTORY_COLUMNS}"
                ),
                params![
                    Uuid::new_v4().to_string(),
                    tenant_id,
                    name,
                    unit,
                    quantity,
                    threshold,
                    now
                ],
            )
            .await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| InventoryError::NotFound("insert failed".into()))?;
        row_to_item(row)
    }

    pub async fn get(&self, tenant_id: &str, id: &str) -> Result<InventoryItem, InventoryError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {INVENTORY_COLUMNS} FROM inventory_items WHERE tenant_id = ?1 AND id = ?2"
                ),
                params![tenant_id, id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => row_to_item(row),
            None => Err(InventoryError::NotFound(id.to_string())),
        }
    }

    /// Writes the new quantity. Rising above the threshold clears `alert_sent`
    /// so the next crossing alerts again.
    pub async fn set_quantity(
        &self,
        tenant_id: &str,
        id: &str,
        quantity: i64,
    ) -> Result<InventoryItem, InventoryError> {
        if quantity < 0 {
            return Err(InventoryError::NegativeQuantity(quantity));
        }
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE inventory_items
                     SET quantity = ?3,
                         alert_sent = CASE WHEN ?3 > threshold THEN 0 ELSE alert_sent END,
                         updated_at = ?4
                     WHERE tenant_id = ?1 AND id = ?2
                     RETURNING {INVENTORY_COLUMNS}"
                ),
                params![tenant_id, id, quantity, now_rfc3339()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => row_to_item(row),
            None => Err(InventoryError::NotFound(id.to_string())),
        }
    }

    /// Atomically marks a low item as alerted. False when the item is not low
    /// or was already claimed.
    pub async fn claim_alert(&self, tenant_id: &str, id: &str) -> Result<bool, InventoryError> {
        let conn = self.db.connection().await?;
        let changed = conn
            .execute(
                "UPDATE inventory_items SET alert_sent = 1, updated_at = ?3
                 WHERE tenant_id = ?1 AND id = ?2 AND alert_sent = 0 AND quantity <= threshold",
                params![tenant_id, id, now_rfc3339()],
            )
            .await?;
        Ok(changed == 1)
    }

    pub async fn release_alert(&self, tenant_id: &str, id: &str) -> Result<(), InventoryError> {
        let conn = self.db.connection().await?;
        conn.execute(
            "UPDATE inventory_items SET alert_sent = 0, updated_at = ?3
             WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, id, now_rfc3339()],
        )
        .await?;
        Ok(())
    }

    /// Low items across all tenants that have not alerted yet.
    pub async fn items_needing_alert(&self) -> Result<Vec<InventoryItem>, InventoryError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {INVENTORY_COLUMNS} FROM inventory_items
                     WHERE alert_sent = 0 AND quantity <= threshold
                     ORDER BY tenant_id, name"
                ),
                (),
            )
            .await?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(row_to_item(row)?);
        }
        Ok(items)
    }
}

fn row_to_item(row: Row) -> Result<InventoryItem, InventoryError> {
    let alert_sent: i64 = row.get(6)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(InventoryItem {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        unit: row.get(3)?,
        quantity: row.get(4)?,
        threshold: row.get(5)?,
        alert_sent: alert_sent != 0,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}
