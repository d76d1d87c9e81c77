use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use tokio::sync::Mutex;

use crate::domain::calendar::{OperatingCalendar, SlotTime};
use crate::domain::notify::{Notifier, Outbound, TransportError};
use crate::domain::{
    Booking, BookingId, BookingRepository, BookingRequest, BookingStatus, ClientId,
    DataAccessError,
};
use crate::SlotbookConfig;

pub const RESOURCES: [&str; 2] = ["Jamshed", "Zarshed"];
pub const SERVICES: [&str; 2] = ["Fade", "Ukladka"];

/// 09:00〜21:00、30分刻み、当日の締切15分
pub fn calendar() -> OperatingCalendar {
    OperatingCalendar::new(chrono_tz::Asia::Tashkent, slot("09:00"), slot("21:00"), 30, 15, 7)
}

/// `calendar()` と同じ営業条件の設定
pub fn config() -> SlotbookConfig {
    SlotbookConfig::from_toml(
        r#"
        [logger]
        level = "DEBUG"

        [database]
        url = "memory"

        [calendar]
        timezone = "Asia/Tashkent"
        opening = "09:00"
        closing = "21:00"
        slot_minutes = 30
        lead_buffer_minutes = 15

        [policy]
        cancellation_lead_minutes = 60
        reminder_lookahead_minutes = 30

        [catalog]
        resources = ["Jamshed", "Zarshed"]
        services = ["Fade", "Ukladka"]

        [dialogue]
        confirm = "Confirm"
        decline = "Decline"
        contact = "Call us at +998 90 000 00 00"

        [admin]
        recipients = [900]
        "#,
    )
    .unwrap()
}

pub fn slot(label: &str) -> SlotTime {
    label.parse().unwrap()
}

pub fn date(iso: &str) -> NaiveDate {
    NaiveDate::parse_from_str(iso, "%Y-%m-%d").unwrap()
}

/// 営業タイムゾーンの現地時刻 `YYYY-MM-DD HH:MM`
pub fn local(calendar: &OperatingCalendar, at: &str) -> DateTime<Utc> {
    let naive = NaiveDateTime::parse_from_str(at, "%Y-%m-%d %H:%M").unwrap();
    calendar
        .timezone()
        .from_local_datetime(&naive)
        .single()
        .unwrap()
        .with_timezone(&Utc)
}

pub fn request(owner: i64, resource: &str, day: &str, time: &str) -> BookingRequest {
    BookingRequest {
        owner_id: ClientId::from(owner),
        client_name: "Ali".to_owned(),
        client_phone: "+998901234567".to_owned(),
        service: SERVICES[0].to_owned(),
        resource: resource.to_owned(),
        date: date(day),
        time: slot(time),
    }
}

/// 送信内容を記録する。`failing` の宛先には失敗を返す
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(ClientId, Outbound)>>,
    failing: HashSet<ClientId>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_for(recipients: &[i64]) -> Arc<Self> {
        Arc::new(Self {
            failing: recipients.iter().copied().map(ClientId::from).collect(),
            ..Self::default()
        })
    }

    pub async fn sent(&self) -> Vec<(ClientId, Outbound)> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_to(&self, recipient: i64) -> Vec<Outbound> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(to, _)| *to == ClientId::from(recipient))
            .map(|(_, message)| message.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, recipient: ClientId, message: Outbound) -> Result<(), TransportError> {
        self.sent.lock().await.push((recipient, message));
        if self.failing.contains(&recipient) {
            return Err(TransportError::new("recipient unreachable"));
        }
        Ok(())
    }
}

/// 障害中のストア。`reads_succeed` なら読み取りだけは空の結果を返す
pub struct FailingRepository {
    reads_succeed: bool,
}

impl FailingRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            reads_succeed: false,
        })
    }

    pub fn writes_only() -> Arc<Self> {
        Arc::new(Self {
            reads_succeed: true,
        })
    }

    fn read<T: Default>(&self) -> Result<T, DataAccessError> {
        if self.reads_succeed {
            Ok(T::default())
        } else {
            Err(unavailable())
        }
    }
}

fn unavailable() -> DataAccessError {
    DataAccessError::QueryError("booking store unavailable".into())
}

#[async_trait]
impl BookingRepository for FailingRepository {
    async fn insert(&self, _request: BookingRequest) -> Result<Booking, DataAccessError> {
        Err(unavailable())
    }

    async fn active_times(
        &self,
        _resource: &str,
        _date: NaiveDate,
    ) -> Result<BTreeSet<SlotTime>, DataAccessError> {
        self.read()
    }

    async fn active_bookings_for_owner(
        &self,
        _owner_id: ClientId,
    ) -> Result<Vec<Booking>, DataAccessError> {
        self.read()
    }

    async fn pending_reminders(&self) -> Result<Vec<Booking>, DataAccessError> {
        self.read()
    }

    async fn mark_reminded(&self, _id: BookingId) -> Result<bool, DataAccessError> {
        Err(unavailable())
    }

    async fn set_status(
        &self,
        _id: BookingId,
        _status: BookingStatus,
    ) -> Result<bool, DataAccessError> {
        Err(unavailable())
    }

    async fn find_active_by_id_and_owner(
        &self,
        _id: BookingId,
        _owner_id: ClientId,
    ) -> Result<Option<Booking>, DataAccessError> {
        self.read()
    }
}
