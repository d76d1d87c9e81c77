use std::{collections::BTreeSet, str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::domain::calendar::SlotTime;
use crate::domain::{
    Booking, BookingId, BookingRepository, BookingRequest, BookingStatus, ClientId,
    DataAccessError,
};

use super::RowConvertError;

const DATE_FORMAT: &str = "%Y-%m-%d";

const SELECT_BOOKING: &str = "SELECT id, owner_id, client_name, client_phone, service, resource, \
     date, time, status, reminded, created_at FROM bookings";

/// SQLite の予約ストア
///
/// アクティブな枠の一意性は部分ユニークインデックスで保証する。
#[derive(Clone, Debug)]
pub struct SqliteBookingRepository {
    pool: SqlitePool,
}

impl SqliteBookingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, DataAccessError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;
        tracing::info!(url, "booking database connected");
        Ok(Self { pool })
    }

    pub async fn init(&self) -> Result<(), DataAccessError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bookings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id INTEGER NOT NULL,
                client_name TEXT NOT NULL,
                client_phone TEXT NOT NULL,
                service TEXT NOT NULL,
                resource TEXT NOT NULL,
                date TEXT NOT NULL,
                time TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                reminded INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_bookings_active_slot \
             ON bookings (resource, date, time) WHERE status = 'active'",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_bookings_owner ON bookings (owner_id, status)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_bookings_pending ON bookings (status, reminded)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: i64,
    owner_id: i64,
    client_name: String,
    client_phone: String,
    service: String,
    resource: String,
    date: String,
    time: String,
    status: String,
    reminded: bool,
    created_at: String,
}

impl TryFrom<BookingRow> for Booking {
    type Error = RowConvertError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        let date = NaiveDate::parse_from_str(&row.date, DATE_FORMAT)
            .map_err(|e| RowConvertError(format!("date {:?}: {}", row.date, e)))?;
        let time = SlotTime::from_str(&row.time)
            .map_err(|e| RowConvertError(format!("time {:?}: {}", row.time, e)))?;
        let status = BookingStatus::from_str(&row.status)
            .map_err(|e| RowConvertError(format!("status {:?}: {}", row.status, e)))?;
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| RowConvertError(format!("created_at {:?}: {}", row.created_at, e)))?
            .with_timezone(&Utc);
        let request = BookingRequest {
            owner_id: ClientId::from(row.owner_id),
            client_name: row.client_name,
            client_phone: row.client_phone,
            service: row.service,
            resource: row.resource,
            date,
            time,
        };
        Ok(Booking::restore(
            BookingId::from(row.id),
            request,
            status,
            row.reminded,
            created_at,
        ))
    }
}

fn into_bookings(rows: Vec<BookingRow>) -> Result<Vec<Booking>, DataAccessError> {
    rows.into_iter()
        .map(|row| Booking::try_from(row).map_err(DataAccessError::from))
        .collect()
}

#[async_trait]
impl BookingRepository for SqliteBookingRepository {
    async fn insert(&self, request: BookingRequest) -> Result<Booking, DataAccessError> {
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO bookings \
             (owner_id, client_name, client_phone, service, resource, date, time, status, reminded, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 'active', 0, ?)",
        )
        .bind(*request.owner_id)
        .bind(&request.client_name)
        .bind(&request.client_phone)
        .bind(&request.service)
        .bind(&request.resource)
        .bind(request.date.format(DATE_FORMAT).to_string())
        .bind(request.time.to_string())
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        let id = BookingId::from(result.last_insert_rowid());
        Ok(Booking::create(id, request, created_at))
    }

    async fn active_times(
        &self,
        resource: &str,
        date: NaiveDate,
    ) -> Result<BTreeSet<SlotTime>, DataAccessError> {
        let times = sqlx::query_scalar::<_, String>(
            "SELECT time FROM bookings WHERE resource = ? AND date = ? AND status = 'active'",
        )
        .bind(resource)
        .bind(date.format(DATE_FORMAT).to_string())
        .fetch_all(&self.pool)
        .await?;
        times
            .iter()
            .map(|time| {
                SlotTime::from_str(time).map_err(|e| {
                    DataAccessError::from(RowConvertError(format!("time {:?}: {}", time, e)))
                })
            })
            .collect()
    }

    async fn active_bookings_for_owner(
        &self,
        owner_id: ClientId,
    ) -> Result<Vec<Booking>, DataAccessError> {
        let rows = sqlx::query_as::<_, BookingRow>(&format!(
            "{} WHERE owner_id = ? AND status = 'active' ORDER BY date, time, id",
            SELECT_BOOKING
        ))
        .bind(*owner_id)
        .fetch_all(&self.pool)
        .await?;
        into_bookings(rows)
    }

    async fn pending_reminders(&self) -> Result<Vec<Booking>, DataAccessError> {
        let rows = sqlx::query_as::<_, BookingRow>(&format!(
            "{} WHERE status = 'active' AND reminded = 0 ORDER BY date, time, id",
            SELECT_BOOKING
        ))
        .fetch_all(&self.pool)
        .await?;
        into_bookings(rows)
    }

    async fn mark_reminded(&self, id: BookingId) -> Result<bool, DataAccessError> {
        let result = sqlx::query("UPDATE bookings SET reminded = 1 WHERE id = ? AND reminded = 0")
            .bind(*id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_status(
        &self,
        id: BookingId,
        status: BookingStatus,
    ) -> Result<bool, DataAccessError> {
        if status == BookingStatus::Active {
            return Ok(false);
        }
        let result = sqlx::query("UPDATE bookings SET status = ? WHERE id = ? AND status = 'active'")
            .bind(status.as_str())
            .bind(*id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_active_by_id_and_owner(
        &self,
        id: BookingId,
        owner_id: ClientId,
    ) -> Result<Option<Booking>, DataAccessError> {
        let row = sqlx::query_as::<_, BookingRow>(&format!(
            "{} WHERE id = ? AND owner_id = ? AND status = 'active'",
            SELECT_BOOKING
        ))
        .bind(*id)
        .bind(*owner_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Booking::try_from)
            .transpose()
            .map_err(DataAccessError::from)
    }
}
