use chrono::{DateTime, Utc};
use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339, parse_rfc3339, to_rfc3339};

const BOOKING_COLUMNS: &str = "id, tenant_id, contact_id, service_name, duration_minutes, location, scheduled_at, status, forms_status, form_name, form_id, reminder_sent, form_reminder_sent, created_at, updated_at";

/// The slice of a booking the automation subsystem reads or flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: String,
    pub tenant_id: String,
    pub contact_id: String,
    pub service_name: String,
    pub duration_minutes: i64,
    pub location: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub status: String,
    pub forms_status: String,
    pub form_name: Option<String>,
    pub form_id: Option<String>,
    pub reminder_sent: bool,
    pub form_reminder_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub tenant_id: String,
    pub contact_id: String,
    pub service_name: String,
    pub duration_minutes: i64,
    pub location: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub status: String,
    pub forms_status: String,
    pub form_name: Option<String>,
    pub form_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("booking not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct BookingRepository {
    db: Database,
}

impl BookingRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, booking: &NewBooking) -> Result<Booking, BookingError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO bookings (id, tenant_id, contact_id, service_name, duration_minutes, location, scheduled_at, status, forms_status, form_name, form_id, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
                     RETURNING {BOOKING_COLUMNS}"
                ),
                params![
                    Uuid::new_v4().to_string(),
                    booking.tenant_id.as_str(),
                    booking.contact_id.as_str(),
                    booking.service_name.as_str(),
                    booking.duration_minutes,
                    booking.location.clone(),
                    to_rfc3339(booking.scheduled_at),
                    booking.status.as_str(),
                    booking.forms_status.as_str(),
                    booking.form_name.clone(),
                    booking.form_id.clone(),
                    now
                ],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| BookingError::NotFound("insert failed".into()))?;
        row_to_booking(row)
    }

    pub async fn get(&self, tenant_id: &str, id: &str) -> Result<Booking, BookingError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE tenant_id = ?1 AND id = ?2"),
                params![tenant_id, id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => row_to_booking(row),
            None => Err(BookingError::NotFound(id.to_string())),
        }
    }

    /// Active bookings scheduled in `[start, end)` that have not been reminded.
    pub async fn due_for_reminder(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Booking>, BookingError> {
        self.select_many(
            &format!(
                "SELECT {BOOKING_COLUMNS} FROM bookings
                 WHERE status IN ('pending', 'confirmed')
                   AND reminder_sent = 0
                   AND scheduled_at >= ?1 AND scheduled_at < ?2
                 ORDER BY scheduled_at"
            ),
            params![to_rfc3339(start), to_rfc3339(end)],
        )
        .await
    }

    /// Sets `reminder_sent`; false when another scan already claimed it.
    pub async fn claim_reminder(&self, id: &str) -> Result<bool, BookingError> {
        self.flip_flag(
            "UPDATE bookings SET reminder_sent = 1, updated_at = ?2
             WHERE id = ?1 AND reminder_sent = 0",
            id,
        )
        .await
    }

    pub async fn release_reminder(&self, id: &str) -> Result<bool, BookingError> {
        self.flip_flag(
            "UPDATE bookings SET reminder_sent = 0, updated_at = ?2
             WHERE id = ?1 AND reminder_sent = 1",
            id,
        )
        .await
    }

    /// Bookings whose forms went out before `created_before` and are still unsubmitted.
    pub async fn forms_pending(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Booking>, BookingError> {
        self.select_many(
            &format!(
                "SELECT {BOOKING_COLUMNS} FROM bookings
                 WHERE forms_status = 'sent'
                   AND form_reminder_sent = 0
                   AND created_at < ?1
                 ORDER BY created_at"
            ),
            params![to_rfc3339(created_before)],
        )
        .await
    }

    pub async fn claim_form_reminder(&self, id: &str) -> Result<bool, BookingError> {
        self.flip_flag(
            "UPDATE bookings SET form_reminder_sent = 1, updated_at = ?2
             WHERE id = ?1 AND form_reminder_sent = 0",
            id,
        )
        .await
    }

    pub async fn release_form_reminder(&self, id: &str) -> Result<bool, BookingError> {
        self.flip_flag(
            "UPDATE bookings SET form_reminder_sent = 0, updated_at = ?2
             WHERE id = ?1 AND form_reminder_sent = 1",
            id,
        )
        .await
    }

    async fn flip_flag(&self, sql: &str, id: &str) -> Result<bool, BookingError> {
        let conn = self.db.connection().await?;
        let changed = conn.execute(sql, params![id, now_rfc3339()]).await?;
        Ok(changed == 1)
    }

    async fn select_many(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Booking>, BookingError> {
        let conn = self.db.connection().await?;
        let mut rows = conn.query(sql, params).await?;
        let mut bookings = Vec::new();
        while let Some(row) = rows.next().await? {
            bookings.push(row_to_booking(row)?);
        }
        Ok(bookings)
    }
}

fn row_to_booking(row: Row) -> Result<Booking, BookingError> {
    let scheduled_at: String = row.get(6)?;
    let reminder_sent: i64 = row.get(11)?;
    let form_reminder_sent: i64 = row.get(12)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;
    Ok(Booking {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        contact_id: row.get(2)?,
        service_name: row.get(3)?,
        duration_minutes: row.get(4)?,
        location: row.get(5)?,
        scheduled_at: parse_rfc3339(&scheduled_at)?,
        status: row.get(7)?,
        forms_status: row.get(8)?,
        form_name: row.get(9)?,
        form_id: row.get(10)?,
        reminder_sent: reminder_sent != 0,
        form_reminder_sent: form_reminder_sent != 0,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}
