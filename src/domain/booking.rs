use std::{collections::BTreeSet, fmt, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use derive_more::{Deref, Display, Error, From};
use serde::{Deserialize, Serialize};

use crate::domain::calendar::SlotTime;
use crate::domain::{Aggregation, ClientId, DataAccessError, Entity, Event, Id};

/// 予約ストア
///
/// `insert` はアクティブな `(resource, date, time)` の重複を
/// `DataAccessError::Conflict` で拒否しなければならない。
#[async_trait]
pub trait BookingRepository: Send + Sync {
    /// 予約を登録し、採番済みの予約を返す
    async fn insert(&self, request: BookingRequest) -> Result<Booking, DataAccessError>;
    /// リソース・日付ごとのアクティブな時刻
    async fn active_times(
        &self,
        resource: &str,
        date: NaiveDate,
    ) -> Result<BTreeSet<SlotTime>, DataAccessError>;
    /// 利用者のアクティブな予約を `(date, time)` 順で返す
    async fn active_bookings_for_owner(
        &self,
        owner_id: ClientId,
    ) -> Result<Vec<Booking>, DataAccessError>;
    /// アクティブかつリマインド未送信の予約
    async fn pending_reminders(&self) -> Result<Vec<Booking>, DataAccessError>;
    /// リマインド送信済みにする。既に送信済みなら `false`
    async fn mark_reminded(&self, id: BookingId) -> Result<bool, DataAccessError>;
    /// ステータスを変更する。遷移できなければ `false`
    async fn set_status(&self, id: BookingId, status: BookingStatus)
        -> Result<bool, DataAccessError>;
    async fn find_active_by_id_and_owner(
        &self,
        id: BookingId,
        owner_id: ClientId,
    ) -> Result<Option<Booking>, DataAccessError>;
}

/// 予約ID
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Deref,
    Default,
)]
pub struct BookingId(i64);

impl Id for BookingId {
    type Inner = i64;
}

impl FromStr for BookingId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().trim_start_matches('#').parse::<i64>().map(BookingId)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    #[default]
    Active,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Active => "active",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = BookingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(BookingStatus::Active),
            "cancelled" => Ok(BookingStatus::Cancelled),
            _ => Err(BookingError::UnknownStatus),
        }
    }
}

/// 一意に決まる枠 `(resource, date, time)`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub resource: String,
    pub date: NaiveDate,
    pub time: SlotTime,
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.resource, self.date, self.time)
    }
}

/// 受付で集めた、確定前の予約内容
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub owner_id: ClientId,
    pub client_name: String,
    pub client_phone: String,
    pub service: String,
    pub resource: String,
    pub date: NaiveDate,
    pub time: SlotTime,
}

impl BookingRequest {
    pub fn slot_key(&self) -> SlotKey {
        SlotKey {
            resource: self.resource.clone(),
            date: self.date,
            time: self.time,
        }
    }
}

/// 予約イベント
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingEvent {
    /// 予約がキャンセルされた
    BookingCancelled { id: BookingId },
    /// リマインドが送信された
    ReminderSent { id: BookingId },
}

impl Event for BookingEvent {
    type Id = BookingId;
}

/// 予約エンティティ
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    id: BookingId,
    owner_id: ClientId,
    client_name: String,
    client_phone: String,
    service: String,
    resource: String,
    date: NaiveDate,
    time: SlotTime,
    status: BookingStatus,
    reminded: bool,
    created_at: DateTime<Utc>,
}

impl Booking {
    /// 新規予約はアクティブかつリマインド未送信で始まる
    pub fn create(id: BookingId, request: BookingRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            owner_id: request.owner_id,
            client_name: request.client_name,
            client_phone: request.client_phone,
            service: request.service,
            resource: request.resource,
            date: request.date,
            time: request.time,
            status: BookingStatus::Active,
            reminded: false,
            created_at,
        }
    }

    /// 保存済みの状態から復元する
    pub fn restore(
        id: BookingId,
        request: BookingRequest,
        status: BookingStatus,
        reminded: bool,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status,
            reminded,
            ..Self::create(id, request, created_at)
        }
    }

    pub fn cancel(&mut self) -> Result<(), BookingError> {
        self.transition(BookingEvent::BookingCancelled { id: self.id })
    }

    pub fn mark_reminded(&mut self) -> Result<(), BookingError> {
        self.transition(BookingEvent::ReminderSent { id: self.id })
    }

    pub fn owner_id(&self) -> ClientId {
        self.owner_id
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn client_phone(&self) -> &str {
        &self.client_phone
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn time(&self) -> SlotTime {
        self.time
    }

    pub fn status(&self) -> BookingStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == BookingStatus::Active
    }

    pub fn reminded(&self) -> bool {
        self.reminded
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn slot_key(&self) -> SlotKey {
        SlotKey {
            resource: self.resource.clone(),
            date: self.date,
            time: self.time,
        }
    }

    fn validate_id(&self, id: &BookingId) -> Result<(), BookingError> {
        if self.id != *id {
            return Err(BookingError::MismatchedId);
        }
        Ok(())
    }
}

impl Entity for Booking {
    type Id = BookingId;

    const ENTITY_NAME: &'static str = "booking";

    fn id(&self) -> Self::Id {
        self.id
    }
}

impl Aggregation for Booking {
    type Event = BookingEvent;
    type Error = BookingError;

    fn validate(&self, event: &Self::Event) -> Result<(), Self::Error> {
        match event {
            BookingEvent::BookingCancelled { id } => {
                self.validate_id(id)?;
                if !self.is_active() {
                    return Err(BookingError::AlreadyCancelled);
                }
            }
            BookingEvent::ReminderSent { id } => {
                self.validate_id(id)?;
                if self.reminded {
                    return Err(BookingError::AlreadyReminded);
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            BookingEvent::BookingCancelled { .. } => self.status = BookingStatus::Cancelled,
            BookingEvent::ReminderSent { .. } => self.reminded = true,
        }
    }
}

/// 予約エラー
#[derive(Error, Display, Debug, PartialEq, Eq)]
pub enum BookingError {
    /// IDが一致しません
    #[display(fmt = "ID does not match")]
    MismatchedId,
    /// キャンセル済みの予約は元に戻せません
    #[display(fmt = "Booking is already cancelled")]
    AlreadyCancelled,
    /// リマインドは一度しか送信できません
    #[display(fmt = "Reminder has already been sent")]
    AlreadyReminded,
    #[display(fmt = "Unknown booking status")]
    UnknownStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::request;

    fn booking() -> Booking {
        Booking::create(
            BookingId(7),
            request(1, "Jamshed", "2024-06-10", "10:00"),
            Utc::now(),
        )
    }

    #[test]
    fn test_create_starts_active_and_unreminded() {
        let booking = booking();
        assert_eq!(booking.id(), BookingId(7));
        assert_eq!(booking.status(), BookingStatus::Active);
        assert!(!booking.reminded());
        assert_eq!(booking.slot_key().to_string(), "Jamshed 2024-06-10 10:00");
    }

    #[test]
    fn test_cancel_is_one_way() {
        let mut booking = booking();
        assert_eq!(booking.cancel(), Ok(()));
        assert_eq!(booking.status(), BookingStatus::Cancelled);
        assert_eq!(booking.cancel(), Err(BookingError::AlreadyCancelled));
        assert_eq!(booking.status(), BookingStatus::Cancelled);
    }

    #[test]
    fn test_reminder_is_sent_once() {
        let mut booking = booking();
        assert_eq!(booking.mark_reminded(), Ok(()));
        assert_eq!(booking.mark_reminded(), Err(BookingError::AlreadyReminded));
        assert!(booking.reminded());
    }

    #[test]
    fn test_event_for_other_booking_is_rejected() {
        let booking = booking();
        assert_eq!(
            booking.validate(&BookingEvent::BookingCancelled { id: BookingId(8) }),
            Err(BookingError::MismatchedId)
        );
    }

    #[test]
    fn test_booking_id_from_str() {
        assert_eq!("#12".parse::<BookingId>(), Ok(BookingId(12)));
        assert_eq!(" 3 ".parse::<BookingId>(), Ok(BookingId(3)));
        assert!("abc".parse::<BookingId>().is_err());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        assert_eq!("cancelled".parse::<BookingStatus>(), Ok(BookingStatus::Cancelled));
        assert_eq!(BookingStatus::Active.to_string(), "active");
        assert_eq!(
            "done".parse::<BookingStatus>(),
            Err(BookingError::UnknownStatus)
        );
    }
}
