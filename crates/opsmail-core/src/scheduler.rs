//! Periodic scans that feed time-based triggers into the dispatcher.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::automation::{AutomationDispatcher, DispatchResult, SkipReason, TriggerEvent};
use crate::bookings::{BookingError, BookingRepository};
use crate::config::SchedulerConfig;
use crate::db::Database;
use crate::inventory::{InventoryError, InventoryRepository};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub examined: u32,
    pub fired: u32,
    pub failed: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error(transparent)]
    Booking(#[from] BookingError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Dispatch(#[from] crate::automation::DispatchError),
}

#[derive(Clone)]
pub struct Scheduler {
    dispatcher: AutomationDispatcher,
    bookings: BookingRepository,
    inventory: InventoryRepository,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(db: Database, dispatcher: AutomationDispatcher, config: SchedulerConfig) -> Self {
        Self {
            dispatcher,
            bookings: BookingRepository::new(db.clone()),
            inventory: InventoryRepository::new(db),
            config,
        }
    }

    /// Spawns the four scan loops. Each stops when `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        if !self.config.enabled {
            info!("scheduler disabled");
            return Vec::new();
        }
        let every = |secs: u64| Duration::from_secs(secs.max(1));
        let config = self.config.clone();
        vec![
            self.spawn_loop(
                "reminders",
                every(config.reminder_interval_secs),
                &shutdown,
                |s| async move { s.scan_reminders(Utc::now()).await },
            ),
            self.spawn_loop(
                "form_nudges",
                every(config.form_nudge_interval_secs),
                &shutdown,
                |s| async move { s.scan_form_nudges(Utc::now()).await },
            ),
            self.spawn_loop(
                "inventory",
                every(config.inventory_interval_secs),
                &shutdown,
                |s| async move { s.scan_inventory().await },
            ),
            self.spawn_loop(
                "log_prune",
                every(config.log_prune_interval_secs),
                &shutdown,
                |s| async move { s.prune_logs(Utc::now()).await },
            ),
        ]
    }

    fn spawn_loop<F, Fut>(
        &self,
        name: &'static str,
        period: Duration,
        shutdown: &CancellationToken,
        scan: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Scheduler) -> Fut + Send + 'static,
        Fut: Future<Output = Result<ScanReport, ScanError>> + Send + 'static,
    {
        let scheduler = self.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(
            async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    match scan(scheduler.clone()).await {
                        Ok(report) if report.examined > 0 => info!(
                            examined = report.examined,
                            fired = report.fired,
                            failed = report.failed,
                            "scan finished"
                        ),
                        Ok(_) => debug!("scan found nothing"),
                        Err(err) => warn!(error = %err, "scan failed"),
                    }
                }
                debug!("scan loop stopped");
            }
            .instrument(info_span!("scheduler", scan = name)),
        )
    }

    /// Reminders for bookings starting in `[now+24h, now+25h)`.
    pub async fn scan_reminders(&self, now: DateTime<Utc>) -> Result<ScanReport, ScanError> {
        let due = self
            .bookings
            .due_for_reminder(now + chrono::Duration::hours(24), now + chrono::Duration::hours(25))
            .await?;
        let mut report = ScanReport::default();
        for booking in due {
            report.examined += 1;
            match self.bookings.claim_reminder(&booking.id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!(booking_id = %booking.id, error = %err, "could not claim reminder");
                    report.failed += 1;
                    continue;
                }
            }
            let event = TriggerEvent::BookingReminder {
                booking_id: booking.id.clone(),
            };
            if self.fire_counted(&booking.tenant_id, &event, &mut report).await {
                continue;
            }
            if let Err(err) = self.bookings.release_reminder(&booking.id).await {
                warn!(booking_id = %booking.id, error = %err, "could not release reminder claim");
            }
        }
        Ok(report)
    }

    /// Nudges for intake forms sent more than a day ago and still open.
    pub async fn scan_form_nudges(&self, now: DateTime<Utc>) -> Result<ScanReport, ScanError> {
        let pending = self
            .bookings
            .forms_pending(now - chrono::Duration::hours(24))
            .await?;
        let mut report = ScanReport::default();
        for booking in pending {
            report.examined += 1;
            match self.bookings.claim_form_reminder(&booking.id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!(booking_id = %booking.id, error = %err, "could not claim form nudge");
                    report.failed += 1;
                    continue;
                }
            }
            let event = TriggerEvent::FormPending {
                booking_id: booking.id.clone(),
            };
            if self.fire_counted(&booking.tenant_id, &event, &mut report).await {
                continue;
            }
            if let Err(err) = self.bookings.release_form_reminder(&booking.id).await {
                warn!(booking_id = %booking.id, error = %err, "could not release form claim");
            }
        }
        Ok(report)
    }

    /// Low-stock alerts; the dispatcher claims each item's alert flag.
    pub async fn scan_inventory(&self) -> Result<ScanReport, ScanError> {
        let items = self.inventory.items_needing_alert().await?;
        let mut report = ScanReport::default();
        for item in items {
            report.examined += 1;
            let event = TriggerEvent::InventoryLow {
                item_id: item.id.clone(),
            };
            self.fire_counted(&item.tenant_id, &event, &mut report).await;
        }
        Ok(report)
    }

    pub async fn prune_logs(&self, now: DateTime<Utc>) -> Result<ScanReport, ScanError> {
        let cutoff = now - chrono::Duration::days(self.config.log_retention_days);
        let deleted = self.dispatcher.prune_logs(cutoff).await?;
        Ok(ScanReport {
            examined: u32::try_from(deleted).unwrap_or(u32::MAX),
            fired: 0,
            failed: 0,
        })
    }

    /// Fires one event and tallies it. False when the claim should be released
    /// so a later scan retries.
    async fn fire_counted(
        &self,
        tenant_id: &str,
        event: &TriggerEvent,
        report: &mut ScanReport,
    ) -> bool {
        match self.dispatcher.fire(tenant_id, event).await {
            Ok(result) => tally(&result, report),
            Err(err) => {
                warn!(tenant_id, trigger = event.kind().as_str(), error = %err, "trigger failed");
                report.failed += 1;
                false
            }
        }
    }
}

fn tally(result: &DispatchResult, report: &mut ScanReport) -> bool {
    if result.success {
        report.fired += 1;
        return true;
    }
    match result.reason {
        // Already handled elsewhere or intentionally suppressed.
        Some(SkipReason::AlreadyAlerted)
        | Some(SkipReason::Disabled)
        | Some(SkipReason::Paused)
        | Some(SkipReason::NoRecipient) => true,
        None => {
            report.failed += 1;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::delivery::tests::RecordingSender;
    use crate::automation::{DeliveryRouter, MailSender, RuleUpdate, TriggerKind};
    use crate::bookings::tests::new_booking;
    use crate::config::AppLinksConfig;
    use crate::contacts::{ContactRepository, ContactSource};
    use crate::mailbox::session::tests::connector;
    use crate::test_support::{insert_tenant, setup_db};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct Fixture {
        scheduler: Scheduler,
        fallback: Arc<RecordingSender>,
        db: Database,
        _dir: tempfile::TempDir,
    }

    async fn fixture(fallback: RecordingSender) -> Fixture {
        let (db, dir) = setup_db().await;
        insert_tenant(&db, "t1", Some("owner@acme.test")).await;
        let fallback = Arc::new(fallback);
        let router = DeliveryRouter::new(
            connector(db.clone(), "http://127.0.0.1:9"),
            Some(fallback.clone() as Arc<dyn MailSender>),
            Duration::from_secs(2),
        );
        let dispatcher = AutomationDispatcher::new(db.clone(), router, &AppLinksConfig::default());
        Fixture {
            scheduler: Scheduler::new(db.clone(), dispatcher, SchedulerConfig::default()),
            fallback,
            db,
            _dir: dir,
        }
    }

    async fn jane(db: &Database) -> String {
        let (contact, _) = ContactRepository::new(db.clone())
            .find_or_create_by_email("t1", "jane@example.com", "Jane", ContactSource::Booking)
            .await
            .expect("contact");
        contact.id
    }

    #[tokio::test]
    async fn reminders_fire_once_for_bookings_a_day_out() {
        let fx = fixture(RecordingSender::default()).await;
        let contact_id = jane(&fx.db).await;
        let bookings = BookingRepository::new(fx.db.clone());
        let now = Utc::now();
        bookings
            .create(&new_booking("t1", &contact_id, now + chrono::Duration::minutes(24 * 60 + 30)))
            .await
            .expect("in window");
        bookings
            .create(&new_booking("t1", &contact_id, now + chrono::Duration::hours(30)))
            .await
            .expect("outside window");

        let first = fx.scheduler.scan_reminders(now).await.expect("scan");
        assert_eq!(first, ScanReport { examined: 1, fired: 1, failed: 0 });
        let second = fx.scheduler.scan_reminders(now).await.expect("scan");
        assert_eq!(second.examined, 0);
        assert_eq!(fx.fallback.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_reminder_is_released_for_the_next_scan() {
        let fx = fixture(RecordingSender::failing("smtp down")).await;
        let contact_id = jane(&fx.db).await;
        let now = Utc::now();
        BookingRepository::new(fx.db.clone())
            .create(&new_booking("t1", &contact_id, now + chrono::Duration::minutes(24 * 60 + 10)))
            .await
            .expect("booking");

        let first = fx.scheduler.scan_reminders(now).await.expect("scan");
        assert_eq!(first.failed, 1);
        let second = fx.scheduler.scan_reminders(now).await.expect("scan");
        assert_eq!(second.examined, 1);
    }

    #[tokio::test]
    async fn one_failed_claim_does_not_stop_the_batch() {
        let fx = fixture(RecordingSender::default()).await;
        let contact_id = jane(&fx.db).await;
        let bookings = BookingRepository::new(fx.db.clone());
        let now = Utc::now();
        let stuck = bookings
            .create(&new_booking("t1", &contact_id, now + chrono::Duration::minutes(24 * 60 + 5)))
            .await
            .expect("first booking");
        bookings
            .create(&new_booking("t1", &contact_id, now + chrono::Duration::minutes(24 * 60 + 40)))
            .await
            .expect("second booking");
        let conn = fx.db.connection().await.expect("conn");
        conn.execute(
            &format!(
                "CREATE TRIGGER stuck_booking BEFORE UPDATE ON bookings
                 WHEN OLD.id = '{}'
                 BEGIN SELECT RAISE(ABORT, 'database is locked'); END",
                stuck.id
            ),
            (),
        )
        .await
        .expect("trigger");

        let report = fx.scheduler.scan_reminders(now).await.expect("scan");
        assert_eq!(report, ScanReport { examined: 2, fired: 1, failed: 1 });
        assert_eq!(fx.fallback.sent.lock().await.len(), 1);

        // The stuck booking stays unclaimed and is picked up once the lock clears.
        conn.execute("DROP TRIGGER stuck_booking", ())
            .await
            .expect("drop trigger");
        let retry = fx.scheduler.scan_reminders(now).await.expect("scan");
        assert_eq!(retry, ScanReport { examined: 1, fired: 1, failed: 0 });
    }

    #[tokio::test]
    async fn form_nudges_wait_a_day_after_sending() {
        let fx = fixture(RecordingSender::default()).await;
        let contact_id = jane(&fx.db).await;
        let mut booking = new_booking("t1", &contact_id, Utc::now() + chrono::Duration::days(3));
        booking.forms_status = "sent".into();
        booking.form_name = Some("Consent Form".into());
        BookingRepository::new(fx.db.clone())
            .create(&booking)
            .await
            .expect("booking");

        let early = fx.scheduler.scan_form_nudges(Utc::now()).await.expect("scan");
        assert_eq!(early.examined, 0);

        let later = Utc::now() + chrono::Duration::hours(25);
        let report = fx.scheduler.scan_form_nudges(later).await.expect("scan");
        assert_eq!(report.fired, 1);
        let sent = fx.fallback.sent.lock().await;
        assert!(sent[0].html.contains("Consent Form"));
    }

    #[tokio::test]
    async fn inventory_scan_alerts_each_low_item_once() {
        let fx = fixture(RecordingSender::default()).await;
        let inventory = InventoryRepository::new(fx.db.clone());
        inventory
            .create("t1", "Towels", Some("pcs"), 2, 5)
            .await
            .expect("low item");
        inventory
            .create("t1", "Shampoo", None, 20, 5)
            .await
            .expect("stocked item");

        let first = fx.scheduler.scan_inventory().await.expect("scan");
        assert_eq!(first, ScanReport { examined: 1, fired: 1, failed: 0 });
        let second = fx.scheduler.scan_inventory().await.expect("scan");
        assert_eq!(second.examined, 0);
        assert_eq!(fx.fallback.sent.lock().await[0].to.email, "owner@acme.test");
    }

    #[tokio::test]
    async fn disabled_reminders_keep_their_claim() {
        let fx = fixture(RecordingSender::default()).await;
        fx.scheduler
            .dispatcher
            .rules()
            .update(
                "t1",
                BTreeMap::from([(
                    TriggerKind::BookingReminder,
                    RuleUpdate {
                        enabled: Some(false),
                        ..RuleUpdate::default()
                    },
                )]),
            )
            .await
            .expect("disable");
        let contact_id = jane(&fx.db).await;
        let now = Utc::now();
        BookingRepository::new(fx.db.clone())
            .create(&new_booking("t1", &contact_id, now + chrono::Duration::minutes(24 * 60 + 5)))
            .await
            .expect("booking");

        let report = fx.scheduler.scan_reminders(now).await.expect("scan");
        assert_eq!(report, ScanReport { examined: 1, fired: 0, failed: 0 });
        assert_eq!(fx.scheduler.scan_reminders(now).await.expect("scan").examined, 0);
        assert!(fx.fallback.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn spawned_loops_stop_on_cancel() {
        let fx = fixture(RecordingSender::default()).await;
        let shutdown = CancellationToken::new();
        let handles = fx.scheduler.clone().spawn(shutdown.clone());
        assert_eq!(handles.len(), 4);
        shutdown.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("loop stopped")
                .expect("join");
        }
    }
}
