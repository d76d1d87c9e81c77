//! 受付窓口
//!
//! メッセージ基盤から届いたコマンドと入力を、利用者ごとのセッションに振り分ける。

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};

use crate::domain::calendar::OperatingCalendar;
use crate::domain::cancellation::{CancelOutcome, CancellationPolicy, DenyReason};
use crate::domain::intake::{Input, IntakeMachine};
use crate::domain::notify::{AdminChannel, Notifier, Outbound};
use crate::domain::reminder::ReminderScheduler;
use crate::domain::reservation::ReservationCoordinator;
use crate::domain::session::{Session, SessionRegistry, SessionSlot};
use crate::domain::{Booking, BookingId, BookingRepository, ClientId, DataAccessError, Entity};
use crate::SlotbookConfig;

const GREETING: &str = "Welcome! Use /book to make an appointment, /mybookings to see your bookings \
and /cancelbooking to cancel one. /cancel stops the current dialogue.";
const NO_SESSION: &str = "Use /book to make an appointment.";
const NO_BOOKINGS: &str = "You have no upcoming bookings.";
const CANCEL_PROMPT: &str = "Send the number of the booking to cancel.";
const ABORTED: &str = "The current dialogue was cancelled.";
const NOTHING_TO_ABORT: &str = "There is nothing to cancel.";
const NOT_FOUND: &str = "Booking not found.";
const NO_CONTACT: &str = "Contact information is not available.";
const FAILURE: &str = "Something went wrong. Please try again later.";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Start,
    Book,
    MyBookings,
    CancelBooking,
    Cancel,
    Contact,
}

/// メッセージ基盤から届くイベント
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Contact { phone: String },
    Command(Command),
}

pub struct BookingDesk {
    sessions: Arc<SessionRegistry>,
    intake: IntakeMachine,
    cancellation: CancellationPolicy,
    repository: Arc<dyn BookingRepository>,
    calendar: Arc<OperatingCalendar>,
    admin: AdminChannel,
    contact: Option<String>,
    cancellation_lead_minutes: u32,
}

impl BookingDesk {
    pub fn new(
        config: &SlotbookConfig,
        repository: Arc<dyn BookingRepository>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let calendar = Arc::new(config.operating_calendar());
        let admin = AdminChannel::new(notifier, config.admin_recipients());
        let coordinator = Arc::new(ReservationCoordinator::new(
            repository.clone(),
            calendar.clone(),
        ));
        Self {
            sessions: Arc::new(SessionRegistry::new()),
            intake: IntakeMachine::new(
                calendar.clone(),
                config.catalog.clone(),
                config.dialogue.clone(),
                repository.clone(),
                coordinator,
                admin.clone(),
            ),
            cancellation: CancellationPolicy::new(
                repository.clone(),
                calendar.clone(),
                config.policy.cancellation_lead_minutes,
            ),
            repository,
            calendar,
            admin,
            contact: config.dialogue.contact.clone(),
            cancellation_lead_minutes: config.policy.cancellation_lead_minutes,
        }
    }

    pub fn sessions(&self) -> Arc<SessionRegistry> {
        self.sessions.clone()
    }

    /// 窓口と同じストア・通知先を使うリマインダー
    pub fn reminder_scheduler(
        &self,
        config: &SlotbookConfig,
        notifier: Arc<dyn Notifier>,
    ) -> ReminderScheduler {
        ReminderScheduler::new(
            self.repository.clone(),
            notifier,
            self.admin.clone(),
            self.calendar.clone(),
            config.policy.reminder_lookahead_minutes,
            Duration::from_secs(config.policy.reminder_interval_seconds),
        )
    }

    pub async fn handle(
        &self,
        client: ClientId,
        inbound: Inbound,
        now: DateTime<Utc>,
    ) -> Vec<Outbound> {
        let mut slot = self.sessions.lock(client).await;
        match inbound {
            Inbound::Command(command) => self.command(&mut slot, client, command, now).await,
            Inbound::Text(text) => self.input(&mut slot, client, Input::Text(text), now).await,
            Inbound::Contact { phone } => {
                self.input(&mut slot, client, Input::Contact(phone), now).await
            }
        }
    }

    async fn command(
        &self,
        slot: &mut SessionSlot,
        client: ClientId,
        command: Command,
        now: DateTime<Utc>,
    ) -> Vec<Outbound> {
        tracing::debug!(%client, ?command, "command received");
        match command {
            Command::Start => vec![Outbound::text(GREETING)],
            Command::Book => {
                let (session, replies) = self.intake.start();
                if slot.replace(Session::Intake(session)).is_some() {
                    tracing::debug!(%client, "previous session replaced");
                }
                replies
            }
            Command::MyBookings => match self.upcoming(client, now).await {
                Ok(bookings) if bookings.is_empty() => vec![Outbound::text(NO_BOOKINGS)],
                Ok(bookings) => vec![listing(&bookings)],
                Err(error) => store_failure(client, error),
            },
            Command::CancelBooking => match self.upcoming(client, now).await {
                Ok(bookings) if bookings.is_empty() => {
                    slot.take();
                    vec![Outbound::text(NO_BOOKINGS)]
                }
                Ok(bookings) => {
                    slot.replace(Session::Cancellation);
                    let options = bookings
                        .iter()
                        .map(|booking| format!("#{}", booking.id()))
                        .collect();
                    vec![listing(&bookings), Outbound::prompt(CANCEL_PROMPT, options)]
                }
                Err(error) => store_failure(client, error),
            },
            Command::Cancel => match slot.take() {
                Some(_) => vec![Outbound::text(ABORTED)],
                None => vec![Outbound::text(NOTHING_TO_ABORT)],
            },
            Command::Contact => vec![Outbound::text(
                self.contact.as_deref().unwrap_or(NO_CONTACT),
            )],
        }
    }

    async fn input(
        &self,
        slot: &mut SessionSlot,
        client: ClientId,
        input: Input,
        now: DateTime<Utc>,
    ) -> Vec<Outbound> {
        match slot.get_mut() {
            None => vec![Outbound::text(NO_SESSION)],
            Some(Session::Intake(session)) => {
                let transition = self.intake.advance(session, client, input, now).await;
                if let Some(outcome) = &transition.outcome {
                    tracing::debug!(%client, ?outcome, "intake finished");
                    slot.take();
                }
                transition.replies
            }
            Some(Session::Cancellation) => {
                let id = match &input {
                    Input::Text(text) => text.parse::<BookingId>().ok(),
                    Input::Contact(_) => None,
                };
                let Some(id) = id else {
                    return vec![Outbound::text(CANCEL_PROMPT)];
                };
                slot.take();
                self.cancel(id, client, now).await
            }
        }
    }

    async fn cancel(&self, id: BookingId, client: ClientId, now: DateTime<Utc>) -> Vec<Outbound> {
        match self.cancellation.cancel(id, client, now).await {
            Ok(CancelOutcome::Cancelled(booking)) => {
                self.admin.spawn_broadcast(Outbound::notice(
                    "Booking cancelled by client",
                    vec![
                        ("Booking", format!("#{}", booking.id())),
                        ("Client", booking.client_name().to_owned()),
                        ("Specialist", booking.resource().to_owned()),
                        ("Time", format!("{} {}", booking.date(), booking.time())),
                    ],
                ));
                vec![Outbound::notice(
                    "Booking cancelled",
                    vec![
                        ("Booking", format!("#{}", booking.id())),
                        ("Date", booking.date().to_string()),
                        ("Time", booking.time().to_string()),
                    ],
                )]
            }
            Ok(CancelOutcome::Denied(DenyReason::NotFound)) => vec![Outbound::text(NOT_FOUND)],
            Ok(CancelOutcome::Denied(DenyReason::TooLate)) => vec![Outbound::text(format!(
                "Bookings can only be cancelled at least {} minutes in advance.",
                self.cancellation_lead_minutes
            ))],
            Err(error) => store_failure(client, error),
        }
    }

    /// 予約時刻がまだ来ていないアクティブな予約
    async fn upcoming(
        &self,
        client: ClientId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Booking>, DataAccessError> {
        let bookings = self.repository.active_bookings_for_owner(client).await?;
        Ok(bookings
            .into_iter()
            .filter(|booking| self.calendar.appointment_at(booking.date(), booking.time()) > now)
            .collect())
    }
}

fn listing(bookings: &[Booking]) -> Outbound {
    Outbound::Notice {
        title: "Your bookings".to_owned(),
        fields: bookings
            .iter()
            .map(|booking| {
                (
                    format!("#{}", booking.id()),
                    format!(
                        "{} {}, {}, {}",
                        booking.date(),
                        booking.time(),
                        booking.resource(),
                        booking.service()
                    ),
                )
            })
            .collect(),
    }
}

fn store_failure(client: ClientId, error: DataAccessError) -> Vec<Outbound> {
    tracing::error!(%client, %error, "booking store failure");
    vec![Outbound::text(FAILURE)]
}
