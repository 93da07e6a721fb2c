pub mod access;
pub mod automation;
pub mod bookings;
pub mod config;
pub mod contacts;
pub mod conversations;
pub mod db;
pub mod gmail;
pub mod integrations;
pub mod inventory;
pub mod jobs;
pub mod mailbox;
pub mod messages;
pub mod migrations;
pub mod notifications;
pub mod queue;
pub mod scheduler;
pub mod telemetry;
pub mod tenants;
pub mod vault;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use access::{Actor, Role};
pub use automation::{AutomationDispatcher, DeliveryRouter, TriggerEvent, TriggerKind};
pub use config::Config;
pub use db::Database;
pub use jobs::JobDispatcher;
pub use mailbox::{MailboxConnector, MailboxService, MailboxSyncEngine};
pub use queue::{Job, JobContext, JobQueue, JobState};
pub use scheduler::{ScanReport, Scheduler};
pub use telemetry::{TelemetryError, TelemetryGuard, init_telemetry};
pub use vault::CredentialVault;
pub use worker::{JobError, JobExecutor, WorkerConfig, run_worker};
