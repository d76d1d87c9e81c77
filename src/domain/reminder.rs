//! 予約前リマインド
//!
//! 一定周期でリマインド未送信の予約を走査し、先読み窓に入った予約へ一度だけ送信する。
//! 送信を試みた直後に送信済みとするため、送信に失敗した予約も再送しない（最大一回）。

use std::{sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Duration, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::domain::calendar::OperatingCalendar;
use crate::domain::notify::{AdminChannel, Notifier, Outbound};
use crate::domain::{Booking, BookingRepository, DataAccessError, Entity};

/// 一回の走査結果
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// 送信を試みた予約数
    pub dispatched: usize,
    /// 利用者への送信に失敗した予約数
    pub failed: usize,
    /// 窓を過ぎてしまい送信を見送った予約数
    pub forgone: usize,
}

pub struct ReminderScheduler {
    repository: Arc<dyn BookingRepository>,
    notifier: Arc<dyn Notifier>,
    admin: AdminChannel,
    calendar: Arc<OperatingCalendar>,
    lookahead: Duration,
    period: StdDuration,
}

impl ReminderScheduler {
    pub fn new(
        repository: Arc<dyn BookingRepository>,
        notifier: Arc<dyn Notifier>,
        admin: AdminChannel,
        calendar: Arc<OperatingCalendar>,
        lookahead_minutes: u32,
        period: StdDuration,
    ) -> Self {
        Self {
            repository,
            notifier,
            admin,
            calendar,
            lookahead: Duration::minutes(i64::from(lookahead_minutes)),
            period,
        }
    }

    /// `shutdown` されるまで周期的に走査する。走査中に次の周期が来ても重ねずに遅らせる
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(period = ?self.period, "reminder scheduler started");
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            match self.tick(Utc::now()).await {
                Ok(report) if report != TickReport::default() => {
                    tracing::info!(?report, "reminder tick finished");
                }
                Ok(_) => {}
                Err(error) => tracing::error!(%error, "reminder tick failed"),
            }
        }
        tracing::info!("reminder scheduler stopped");
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, DataAccessError> {
        let mut report = TickReport::default();
        for booking in self.repository.pending_reminders().await? {
            let lead = self
                .calendar
                .appointment_at(booking.date(), booking.time())
                .signed_duration_since(now);
            if lead <= Duration::zero() {
                tracing::debug!(id = %booking.id(), "appointment passed without reminder");
                self.mark(&booking).await;
                report.forgone += 1;
                continue;
            }
            if lead > self.lookahead {
                continue;
            }

            report.dispatched += 1;
            if let Err(error) = self
                .notifier
                .send(booking.owner_id(), reminder_for(&booking))
                .await
            {
                report.failed += 1;
                tracing::error!(id = %booking.id(), owner = %booking.owner_id(), %error, "reminder delivery failed");
            }
            self.admin.broadcast(admin_reminder_for(&booking)).await;
            self.mark(&booking).await;
        }
        Ok(report)
    }

    async fn mark(&self, booking: &Booking) {
        match self.repository.mark_reminded(booking.id()).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(id = %booking.id(), "reminder flag was already set"),
            Err(error) => tracing::error!(id = %booking.id(), %error, "failed to mark reminder"),
        }
    }
}

fn reminder_for(booking: &Booking) -> Outbound {
    Outbound::notice(
        "Reminder",
        vec![
            ("Today at", booking.time().to_string()),
            ("Specialist", booking.resource().to_owned()),
            ("Service", booking.service().to_owned()),
        ],
    )
}

fn admin_reminder_for(booking: &Booking) -> Outbound {
    Outbound::notice(
        "Upcoming appointment",
        vec![
            ("Booking", format!("#{}", booking.id())),
            ("Client", booking.client_name().to_owned()),
            ("Phone", booking.client_phone().to_owned()),
            ("Specialist", booking.resource().to_owned()),
            ("Time", format!("{} {}", booking.date(), booking.time())),
        ],
    )
}
