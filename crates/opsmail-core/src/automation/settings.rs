use std::collections::BTreeMap;

use libsql::params;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::TriggerKind;
use super::templates::{default_template, validate};
use crate::db::{Database, DbError, now_rfc3339};

/// Tenant overrides as persisted; absent fields fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
struct StoredRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<String>,
}

/// A trigger's effective configuration with defaults filled in.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRule {
    pub trigger: TriggerKind,
    pub enabled: bool,
    pub subject: String,
    pub body: String,
    pub custom_subject: bool,
    pub custom_body: bool,
}

impl AutomationRule {
    fn resolve(trigger: TriggerKind, stored: Option<&StoredRule>) -> Self {
        let defaults = default_template(trigger);
        let custom = |value: Option<&String>| {
            value
                .map(String::as_str)
                .filter(|value| !value.trim().is_empty())
                .map(str::to_string)
        };
        let subject = stored.and_then(|rule| custom(rule.subject.as_ref()));
        let body = stored.and_then(|rule| custom(rule.body.as_ref()));

        Self {
            trigger,
            enabled: !trigger.is_configurable()
                || stored.and_then(|rule| rule.enabled).unwrap_or(true),
            custom_subject: subject.is_some(),
            custom_body: body.is_some(),
            subject: subject
                .or_else(|| defaults.map(|d| d.subject.to_string()))
                .unwrap_or_default(),
            body: body
                .or_else(|| defaults.map(|d| d.body.to_string()))
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AutomationSettings {
    pub tenant_id: String,
    pub rules: Vec<AutomationRule>,
}

impl AutomationSettings {
    pub fn rule(&self, trigger: TriggerKind) -> Option<&AutomationRule> {
        self.rules.iter().find(|rule| rule.trigger == trigger)
    }
}

/// Partial update for one trigger. An empty subject or body restores the default.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct RuleUpdate {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("trigger {0} cannot be configured")]
    NotConfigurable(TriggerKind),
    #[error("{field} template for {trigger} is invalid: {message}")]
    InvalidTemplate {
        trigger: TriggerKind,
        field: &'static str,
        message: String,
    },
}

#[derive(Clone)]
pub struct AutomationRuleStore {
    db: Database,
}

impl AutomationRuleStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, tenant_id: &str) -> Result<AutomationSettings, SettingsError> {
        let conn = self.db.connection().await?;
        let stored = load_rules(&conn, tenant_id).await?;
        Ok(resolve_all(tenant_id, &stored))
    }

    pub async fn rule(
        &self,
        tenant_id: &str,
        trigger: TriggerKind,
    ) -> Result<AutomationRule, SettingsError> {
        let conn = self.db.connection().await?;
        let stored = load_rules(&conn, tenant_id).await?;
        Ok(AutomationRule::resolve(trigger, stored.get(&trigger)))
    }

    /// Merges the given triggers into the stored rules; others are untouched.
    pub async fn update(
        &self,
        tenant_id: &str,
        updates: BTreeMap<TriggerKind, RuleUpdate>,
    ) -> Result<AutomationSettings, SettingsError> {
        if let Some(kind) = updates.keys().find(|kind| !kind.is_configurable()) {
            return Err(SettingsError::NotConfigurable(*kind));
        }
        for (trigger, update) in &updates {
            check_template(*trigger, "subject", update.subject.as_deref())?;
            check_template(*trigger, "body", update.body.as_deref())?;
        }

        let conn = self.db.connection().await?;
        let tx = conn.transaction().await?;
        let mut stored = load_rules(&tx, tenant_id).await?;
        for (trigger, update) in updates {
            let rule = stored.entry(trigger).or_default();
            if let Some(enabled) = update.enabled {
                rule.enabled = Some(enabled);
            }
            if let Some(subject) = update.subject {
                rule.subject = Some(subject).filter(|s| !s.trim().is_empty());
            }
            if let Some(body) = update.body {
                rule.body = Some(body).filter(|b| !b.trim().is_empty());
            }
        }

        let now = now_rfc3339();
        tx.execute(
            "INSERT INTO automation_settings (tenant_id, rules_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(tenant_id) DO UPDATE SET rules_json = excluded.rules_json, updated_at = excluded.updated_at",
            params![tenant_id, serde_json::to_string(&stored)?, now],
        )
        .await?;
        tx.commit().await?;

        Ok(resolve_all(tenant_id, &stored))
    }
}

fn check_template(
    trigger: TriggerKind,
    field: &'static str,
    template: Option<&str>,
) -> Result<(), SettingsError> {
    match template {
        Some(template) if !template.trim().is_empty() => {
            validate(template).map_err(|err| SettingsError::InvalidTemplate {
                trigger,
                field,
                message: err.to_string(),
            })
        }
        _ => Ok(()),
    }
}

async fn load_rules(
    conn: &libsql::Connection,
    tenant_id: &str,
) -> Result<BTreeMap<TriggerKind, StoredRule>, SettingsError> {
    let mut rows = conn
        .query(
            "SELECT rules_json FROM automation_settings WHERE tenant_id = ?1",
            params![tenant_id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => {
            let json: String = row.get(0)?;
            Ok(serde_json::from_str(&json)?)
        }
        None => Ok(BTreeMap::new()),
    }
}

fn resolve_all(tenant_id: &str, stored: &BTreeMap<TriggerKind, StoredRule>) -> AutomationSettings {
    AutomationSettings {
        tenant_id: tenant_id.to_string(),
        rules: TriggerKind::ALL
            .into_iter()
            .map(|trigger| AutomationRule::resolve(trigger, stored.get(&trigger)))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{insert_tenant, setup_db};

    #[tokio::test]
    async fn absent_settings_resolve_to_enabled_defaults() {
        let (db, _dir) = setup_db().await;
        insert_tenant(&db, "t1", None).await;
        let store = AutomationRuleStore::new(db);

        let settings = store.get("t1").await.expect("settings");
        assert_eq!(settings.rules.len(), TriggerKind::ALL.len());
        let welcome = settings.rule(TriggerKind::NewContact).expect("rule");
        assert!(welcome.enabled);
        assert!(!welcome.custom_subject);
        assert_eq!(welcome.subject, "Welcome to {{businessName}}!");
        let staff = settings.rule(TriggerKind::StaffReplied).expect("rule");
        assert!(staff.enabled);
        assert!(staff.body.is_empty());
    }

    #[tokio::test]
    async fn update_merges_and_blank_fields_fall_back() {
        let (db, _dir) = setup_db().await;
        insert_tenant(&db, "t1", None).await;
        let store = AutomationRuleStore::new(db);

        store
            .update(
                "t1",
                BTreeMap::from([
                    (
                        TriggerKind::BookingCreated,
                        RuleUpdate {
                            enabled: Some(false),
                            ..RuleUpdate::default()
                        },
                    ),
                    (
                        TriggerKind::NewContact,
                        RuleUpdate {
                            enabled: None,
                            subject: Some("Hello from {{businessName}}".into()),
                            body: Some("<p>Hey {{contactName}}</p>".into()),
                        },
                    ),
                ]),
            )
            .await
            .expect("first update");

        let settings = store
            .update(
                "t1",
                BTreeMap::from([(
                    TriggerKind::NewContact,
                    RuleUpdate {
                        subject: Some("   ".into()),
                        ..RuleUpdate::default()
                    },
                )]),
            )
            .await
            .expect("second update");

        let booking = settings.rule(TriggerKind::BookingCreated).expect("booking");
        assert!(!booking.enabled);
        let welcome = settings.rule(TriggerKind::NewContact).expect("welcome");
        assert!(welcome.enabled);
        assert!(!welcome.custom_subject);
        assert_eq!(welcome.subject, "Welcome to {{businessName}}!");
        assert!(welcome.custom_body);
        assert_eq!(welcome.body, "<p>Hey {{contactName}}</p>");

        let reminder = store
            .rule("t1", TriggerKind::BookingReminder)
            .await
            .expect("reminder");
        assert!(reminder.enabled);
    }

    #[tokio::test]
    async fn staff_reply_cannot_be_configured() {
        let (db, _dir) = setup_db().await;
        insert_tenant(&db, "t1", None).await;
        let store = AutomationRuleStore::new(db);

        let err = store
            .update(
                "t1",
                BTreeMap::from([(
                    TriggerKind::StaffReplied,
                    RuleUpdate {
                        enabled: Some(false),
                        ..RuleUpdate::default()
                    },
                )]),
            )
            .await
            .expect_err("not configurable");
        assert!(matches!(err, SettingsError::NotConfigurable(TriggerKind::StaffReplied)));
    }

    #[tokio::test]
    async fn invalid_template_is_rejected_and_nothing_is_stored() {
        let (db, _dir) = setup_db().await;
        insert_tenant(&db, "t1", None).await;
        let store = AutomationRuleStore::new(db);

        let err = store
            .update(
                "t1",
                BTreeMap::from([
                    (
                        TriggerKind::NewContact,
                        RuleUpdate {
                            subject: Some("Hello {{ contactName }}".into()),
                            ..RuleUpdate::default()
                        },
                    ),
                    (
                        TriggerKind::BookingCreated,
                        RuleUpdate {
                            body: Some("<p>See you {{ nickname }}</p>".into()),
                            ..RuleUpdate::default()
                        },
                    ),
                ]),
            )
            .await
            .expect_err("unknown placeholder");
        assert!(
            matches!(
                err,
                SettingsError::InvalidTemplate {
                    trigger: TriggerKind::BookingCreated,
                    field: "body",
                    ..
                }
            ),
            "{err:?}"
        );

        let settings = store.get("t1").await.expect("get");
        let welcome = settings.rule(TriggerKind::NewContact).expect("rule");
        assert!(!welcome.custom_subject);
    }
}
