pub mod memory;
pub mod sqlite;

use std::{fmt::Display, sync::Arc};

use crate::domain::{BookingRepository, DataAccessError};

pub use self::memory::InMemoryBookingRepository;
pub use self::sqlite::SqliteBookingRepository;

impl From<sqlx::Error> for DataAccessError {
    fn from(value: sqlx::Error) -> Self {
        match value {
            sqlx::Error::Database(ref error) if error.is_unique_violation() => {
                Self::Conflict(error.message().to_owned())
            }
            sqlx::Error::Configuration(_)
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::ConnectionError(Box::new(value)),
            sqlx::Error::RowNotFound
            | sqlx::Error::TypeNotFound { .. }
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_) => Self::ReadError(Box::new(value)),
            sqlx::Error::Database(_) => Self::WriteError(Box::new(value)),
            _ => Self::QueryError(Box::new(value)),
        }
    }
}

/// 保存済みの値を復元できなかった
#[derive(Debug)]
pub struct RowConvertError(String);

impl std::error::Error for RowConvertError {}

impl Display for RowConvertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failed to convert row: {}", self.0)
    }
}

impl From<RowConvertError> for DataAccessError {
    fn from(value: RowConvertError) -> Self {
        DataAccessError::ClientSideError(Box::new(value))
    }
}

/// `database.url` に応じたストアを開く
pub async fn open_repository(url: &str) -> Result<Arc<dyn BookingRepository>, DataAccessError> {
    if url == "memory" {
        tracing::warn!("bookings are kept in memory and will not survive a restart");
        return Ok(Arc::new(InMemoryBookingRepository::new()));
    }
    let repository = SqliteBookingRepository::connect(url).await?;
    repository.init().await?;
    Ok(Arc::new(repository))
}
