//! Rule-driven outbound communication: per-tenant rules, rendering, channel
//! selection with fallback, and the audit log.

pub mod delivery;
pub mod dispatcher;
pub mod log;
pub mod settings;
pub mod templates;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use delivery::{
    Channel, Delivered, DeliveryError, DeliveryRouter, MailSender, OutboundEmail, SentMail,
    SmtpSender, SystemMailboxSender, fallback_from_config, send_via_session,
};
pub use dispatcher::{
    AutomationDispatcher, AutomationStats, DispatchError, DispatchResult, InventoryUpdate, SkipReason,
    TriggerEvent,
};
pub use log::{AutomationLogEntry, AutomationLogRepository, LogError, LogFilter, NewLogEntry};
pub use settings::{AutomationRule, AutomationRuleStore, AutomationSettings, RuleUpdate, SettingsError};
pub use templates::{
    PLACEHOLDERS, TemplateError, TemplateVars, default_template, render, render_html, validate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    NewContact,
    BookingCreated,
    BookingReminder,
    FormPending,
    InventoryLow,
    StaffReplied,
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 6] = [
        TriggerKind::NewContact,
        TriggerKind::BookingCreated,
        TriggerKind::BookingReminder,
        TriggerKind::FormPending,
        TriggerKind::InventoryLow,
        TriggerKind::StaffReplied,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::NewContact => "NEW_CONTACT",
            TriggerKind::BookingCreated => "BOOKING_CREATED",
            TriggerKind::BookingReminder => "BOOKING_REMINDER",
            TriggerKind::FormPending => "FORM_PENDING",
            TriggerKind::InventoryLow => "INVENTORY_LOW",
            TriggerKind::StaffReplied => "STAFF_REPLIED",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        TriggerKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
    }

    /// Tenant-wide triggers ignore conversation pauses.
    pub fn is_system(&self) -> bool {
        matches!(self, TriggerKind::InventoryLow | TriggerKind::StaffReplied)
    }

    /// Whether tenants may disable or retemplate this trigger.
    pub fn is_configurable(&self) -> bool {
        !matches!(self, TriggerKind::StaffReplied)
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_names_round_trip_through_serde_and_str() {
        for kind in TriggerKind::ALL {
            let json = serde_json::to_string(&kind).expect("serialize");
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(TriggerKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(TriggerKind::from_str("new_contact"), None);
    }

    #[test]
    fn system_triggers() {
        assert!(TriggerKind::InventoryLow.is_system());
        assert!(TriggerKind::StaffReplied.is_system());
        assert!(!TriggerKind::BookingReminder.is_system());
        assert!(TriggerKind::InventoryLow.is_configurable());
        assert!(!TriggerKind::StaffReplied.is_configurable());
    }
}
