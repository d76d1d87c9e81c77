use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::Mutex;

use crate::domain::calendar::SlotTime;
use crate::domain::{
    Booking, BookingId, BookingRepository, BookingRequest, BookingStatus, ClientId,
    DataAccessError, Entity,
};

/// プロセス内の予約ストア
///
/// アクティブな枠の一意性はロック内で検査する。
#[derive(Default)]
pub struct InMemoryBookingRepository {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    last_id: i64,
    bookings: BTreeMap<BookingId, Booking>,
}

impl InMemoryBookingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 全予約（キャンセル済みを含む）
    pub async fn all(&self) -> Vec<Booking> {
        self.state.lock().await.bookings.values().cloned().collect()
    }
}

#[async_trait]
impl BookingRepository for InMemoryBookingRepository {
    async fn insert(&self, request: BookingRequest) -> Result<Booking, DataAccessError> {
        let mut state = self.state.lock().await;
        let key = request.slot_key();
        if state
            .bookings
            .values()
            .any(|booking| booking.is_active() && booking.slot_key() == key)
        {
            return Err(DataAccessError::Conflict(format!("slot {} is taken", key)));
        }
        state.last_id += 1;
        let booking = Booking::create(BookingId::from(state.last_id), request, Utc::now());
        state.bookings.insert(booking.id(), booking.clone());
        Ok(booking)
    }

    async fn active_times(
        &self,
        resource: &str,
        date: NaiveDate,
    ) -> Result<BTreeSet<SlotTime>, DataAccessError> {
        let state = self.state.lock().await;
        Ok(state
            .bookings
            .values()
            .filter(|b| b.is_active() && b.resource() == resource && b.date() == date)
            .map(Booking::time)
            .collect())
    }

    async fn active_bookings_for_owner(
        &self,
        owner_id: ClientId,
    ) -> Result<Vec<Booking>, DataAccessError> {
        let state = self.state.lock().await;
        let mut bookings: Vec<Booking> = state
            .bookings
            .values()
            .filter(|b| b.is_active() && b.owner_id() == owner_id)
            .cloned()
            .collect();
        bookings.sort_by_key(|b| (b.date(), b.time(), b.id()));
        Ok(bookings)
    }

    async fn pending_reminders(&self) -> Result<Vec<Booking>, DataAccessError> {
        let state = self.state.lock().await;
        Ok(state
            .bookings
            .values()
            .filter(|b| b.is_active() && !b.reminded())
            .cloned()
            .collect())
    }

    async fn mark_reminded(&self, id: BookingId) -> Result<bool, DataAccessError> {
        let mut state = self.state.lock().await;
        Ok(match state.bookings.get_mut(&id) {
            Some(booking) => booking.mark_reminded().is_ok(),
            None => false,
        })
    }

    async fn set_status(
        &self,
        id: BookingId,
        status: BookingStatus,
    ) -> Result<bool, DataAccessError> {
        let mut state = self.state.lock().await;
        let Some(booking) = state.bookings.get_mut(&id) else {
            return Ok(false);
        };
        Ok(match status {
            BookingStatus::Cancelled => booking.cancel().is_ok(),
            BookingStatus::Active => false,
        })
    }

    async fn find_active_by_id_and_owner(
        &self,
        id: BookingId,
        owner_id: ClientId,
    ) -> Result<Option<Booking>, DataAccessError> {
        let state = self.state.lock().await;
        Ok(state
            .bookings
            .get(&id)
            .filter(|b| b.is_active() && b.owner_id() == owner_id)
            .cloned())
    }
}
