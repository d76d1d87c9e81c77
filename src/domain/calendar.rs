//! 営業カレンダーと予約枠の計算
//!
//! 日付と時刻はすべて営業タイムゾーンの現地時刻として扱う。

use std::{collections::BTreeSet, fmt, str::FromStr};

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, ParseError, TimeZone, Utc};
use chrono_tz::Tz;
use serde_with::{DeserializeFromStr, SerializeDisplay};

const TIME_LABEL: &str = "%H:%M";
const DATE_LABEL: &str = "%d %b (%a)";

/// 予約枠の時刻ラベル (`HH:MM`)
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    SerializeDisplay,
    DeserializeFromStr,
)]
pub struct SlotTime(NaiveTime);

impl SlotTime {
    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self)
    }

    pub fn naive(&self) -> NaiveTime {
        self.0
    }
}

impl From<NaiveTime> for SlotTime {
    fn from(value: NaiveTime) -> Self {
        Self(value)
    }
}

impl FromStr for SlotTime {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveTime::parse_from_str(s.trim(), TIME_LABEL).map(Self)
    }
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIME_LABEL))
    }
}

/// 日付の選択肢
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DateOption {
    pub label: String,
    pub date: NaiveDate,
}

/// 営業時間・枠の粒度などの固定パラメータ
#[derive(Clone, Debug)]
pub struct OperatingCalendar {
    timezone: Tz,
    opening: SlotTime,
    closing: SlotTime,
    slot: Duration,
    lead_buffer: Duration,
    horizon_days: u32,
}

impl OperatingCalendar {
    pub fn new(
        timezone: Tz,
        opening: SlotTime,
        closing: SlotTime,
        slot_minutes: u32,
        lead_buffer_minutes: u32,
        horizon_days: u32,
    ) -> Self {
        Self {
            timezone,
            opening,
            closing,
            slot: Duration::minutes(i64::from(slot_minutes.max(1))),
            lead_buffer: Duration::minutes(i64::from(lead_buffer_minutes)),
            horizon_days,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn local(&self, now: DateTime<Utc>) -> DateTime<Tz> {
        now.with_timezone(&self.timezone)
    }

    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        self.local(now).date_naive()
    }

    /// 開店から閉店まで（両端を含む）の全枠
    pub fn grid(&self) -> Vec<SlotTime> {
        let mut slots = Vec::new();
        let mut cursor = self.opening.naive();
        while cursor <= self.closing.naive() {
            slots.push(SlotTime(cursor));
            let (next, wrapped) = cursor.overflowing_add_signed(self.slot);
            if wrapped != 0 {
                break;
            }
            cursor = next;
        }
        slots
    }

    pub fn on_grid(&self, time: SlotTime) -> bool {
        self.grid().contains(&time)
    }

    /// 予約の開始日時（営業タイムゾーン）
    ///
    /// 夏時間の切り替えで存在しない現地時刻は、直後の有効な時刻に寄せる。
    pub fn appointment_at(&self, date: NaiveDate, time: SlotTime) -> DateTime<Tz> {
        let naive = NaiveDateTime::new(date, time.naive());
        self.timezone
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| {
                self.timezone
                    .from_local_datetime(&(naive + Duration::hours(1)))
                    .earliest()
            })
            .unwrap_or_else(|| self.timezone.from_utc_datetime(&naive))
    }

    /// 当日の枠がまだ提示できるか（開始が `now + lead_buffer` より後）
    pub fn is_offerable(&self, date: NaiveDate, time: SlotTime, now: DateTime<Utc>) -> bool {
        let local_now = self.local(now);
        if date < local_now.date_naive() {
            return false;
        }
        if date > local_now.date_naive() {
            return true;
        }
        self.appointment_at(date, time) > local_now + self.lead_buffer
    }

    /// リソース・日付ごとの予約可能な枠を昇順で返す
    pub fn available_slots(
        &self,
        date: NaiveDate,
        taken: &BTreeSet<SlotTime>,
        now: DateTime<Utc>,
    ) -> Vec<SlotTime> {
        self.grid()
            .into_iter()
            .filter(|time| !taken.contains(time))
            .filter(|time| self.is_offerable(date, *time, now))
            .collect()
    }

    /// 今日から `horizon_days` 日分の日付。閉店時刻を過ぎていれば今日は除く
    pub fn date_options(&self, now: DateTime<Utc>) -> Vec<DateOption> {
        let local_now = self.local(now);
        let today = local_now.date_naive();
        let closed_today = local_now.time() >= self.closing.naive();
        today
            .iter_days()
            .take(self.horizon_days as usize)
            .filter(|date| !(closed_today && *date == today))
            .map(|date| DateOption {
                label: date.format(DATE_LABEL).to_string(),
                date,
            })
            .collect()
    }

    pub fn date_for_label(&self, label: &str, now: DateTime<Utc>) -> Option<NaiveDate> {
        let label = label.trim();
        self.date_options(now)
            .into_iter()
            .find(|option| option.label == label)
            .map(|option| option.date)
    }
}
