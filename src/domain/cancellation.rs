use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::domain::calendar::OperatingCalendar;
use crate::domain::{
    Booking, BookingId, BookingRepository, BookingStatus, ClientId, DataAccessError, Entity,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DenyReason {
    /// 依頼者のアクティブな予約が見つからない
    NotFound,
    /// 予約時刻まで最低キャンセル期限を切っている
    TooLate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled(Booking),
    Denied(DenyReason),
}

/// キャンセルの可否判定と実行
pub struct CancellationPolicy {
    repository: Arc<dyn BookingRepository>,
    calendar: Arc<OperatingCalendar>,
    minimum_lead: Duration,
}

impl CancellationPolicy {
    pub fn new(
        repository: Arc<dyn BookingRepository>,
        calendar: Arc<OperatingCalendar>,
        minimum_lead_minutes: u32,
    ) -> Self {
        Self {
            repository,
            calendar,
            minimum_lead: Duration::minutes(i64::from(minimum_lead_minutes)),
        }
    }

    pub async fn cancel(
        &self,
        id: BookingId,
        requester: ClientId,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, DataAccessError> {
        let Some(mut booking) = self
            .repository
            .find_active_by_id_and_owner(id, requester)
            .await?
        else {
            return Ok(CancelOutcome::Denied(DenyReason::NotFound));
        };

        let lead = self
            .calendar
            .appointment_at(booking.date(), booking.time())
            .signed_duration_since(now);
        if lead < self.minimum_lead {
            tracing::info!(%id, %requester, minutes = lead.num_minutes(), "cancellation too late");
            return Ok(CancelOutcome::Denied(DenyReason::TooLate));
        }

        // 同時に別の依頼でキャンセルされていれば、もうアクティブではない
        if !self.repository.set_status(id, BookingStatus::Cancelled).await? {
            return Ok(CancelOutcome::Denied(DenyReason::NotFound));
        }
        if let Err(error) = booking.cancel() {
            tracing::warn!(%id, %error, "booking snapshot out of date");
        }
        tracing::info!(entity = Booking::ENTITY_NAME, id = %booking.id(), %requester, "booking cancelled");
        Ok(CancelOutcome::Cancelled(booking))
    }
}
