use chrono_tz::Tz;
use config::{Config, ConfigError, FileFormat};
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};

use crate::domain::calendar::{OperatingCalendar, SlotTime};
use crate::domain::ClientId;

pub mod desk;
pub mod domain;
pub mod infrastructure;

#[cfg(test)]
pub(crate) mod testing;

#[derive(Clone, Debug, Deserialize)]
pub struct SlotbookConfig {
    pub logger: Logger,
    pub database: Database,
    pub calendar: Calendar,
    pub policy: Policy,
    pub catalog: Catalog,
    #[serde(default)]
    pub dialogue: Dialogue,
    #[serde(default)]
    pub admin: Admin,
}

impl SlotbookConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(config::File::with_name("slotbook.toml"))
            .add_source(config::Environment::with_prefix("SLOTBOOK").separator("__"))
            .build()?
            .try_deserialize::<SlotbookConfig>()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(config::File::from_str(source, FileFormat::Toml))
            .build()?
            .try_deserialize::<SlotbookConfig>()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| Err(ConfigError::Message(message.to_owned()));
        if self.calendar.slot_minutes == 0 {
            return invalid("calendar.slot_minutes must be positive");
        }
        if self.calendar.opening > self.calendar.closing {
            return invalid("calendar.opening must not be after calendar.closing");
        }
        if self.calendar.date_horizon_days == 0 {
            return invalid("calendar.date_horizon_days must be positive");
        }
        if self.policy.reminder_interval_seconds == 0 {
            return invalid("policy.reminder_interval_seconds must be positive");
        }
        if self.catalog.resources.is_empty() {
            return invalid("catalog.resources must not be empty");
        }
        if self.catalog.services.is_empty() {
            return invalid("catalog.services must not be empty");
        }
        if self.dialogue.confirm.trim() == self.dialogue.decline.trim() {
            return invalid("dialogue.confirm and dialogue.decline must differ");
        }
        Ok(())
    }

    pub fn operating_calendar(&self) -> OperatingCalendar {
        OperatingCalendar::new(
            self.calendar.timezone,
            self.calendar.opening,
            self.calendar.closing,
            self.calendar.slot_minutes,
            self.calendar.lead_buffer_minutes,
            self.calendar.date_horizon_days,
        )
    }

    pub fn admin_recipients(&self) -> Vec<ClientId> {
        self.admin.recipients.iter().copied().map(ClientId::from).collect()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Database {
    /// `memory` keeps bookings in process, anything else is a SQLite URL
    pub url: String,
}

/// 営業カレンダー
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Calendar {
    #[serde_as(as = "DisplayFromStr")]
    pub timezone: Tz,
    pub opening: SlotTime,
    pub closing: SlotTime,
    pub slot_minutes: u32,
    #[serde(default)]
    pub lead_buffer_minutes: u32,
    #[serde(default = "default_horizon")]
    pub date_horizon_days: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Policy {
    pub cancellation_lead_minutes: u32,
    pub reminder_lookahead_minutes: u32,
    #[serde(default = "default_reminder_interval")]
    pub reminder_interval_seconds: u64,
    #[serde(default = "default_session_idle")]
    pub session_idle_minutes: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Catalog {
    pub resources: Vec<String>,
    pub services: Vec<String>,
}

/// 対話で使う固定の文言
#[derive(Clone, Debug, Deserialize)]
pub struct Dialogue {
    pub confirm: String,
    pub decline: String,
    #[serde(default)]
    pub contact: Option<String>,
}

impl Default for Dialogue {
    fn default() -> Self {
        Self {
            confirm: "Confirm".to_owned(),
            decline: "Decline".to_owned(),
            contact: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Admin {
    #[serde(default)]
    pub recipients: Vec<i64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Logger {
    pub level: Level,
}

#[derive(Clone, Debug, Deserialize)]
pub enum Level {
    TRACE,
    DEBUG,
    INFO,
    WARN,
    ERROR,
}

impl From<&Level> for tracing::Level {
    fn from(value: &Level) -> Self {
        match value {
            Level::TRACE => tracing::Level::TRACE,
            Level::DEBUG => tracing::Level::DEBUG,
            Level::INFO => tracing::Level::INFO,
            Level::WARN => tracing::Level::WARN,
            Level::ERROR => tracing::Level::ERROR,
        }
    }
}

fn default_horizon() -> u32 {
    7
}

fn default_reminder_interval() -> u64 {
    60
}

fn default_session_idle() -> u64 {
    30
}
