//! 予約受付の対話
//!
//! 名前、電話番号、サービス、担当者、日付、時刻の順に一項目ずつ受け取り、最後に確認をとる。
//! 受け付けられない入力には同じ問いかけを返し、段階は進めない。

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};

use crate::domain::calendar::{OperatingCalendar, SlotTime};
use crate::domain::notify::{AdminChannel, Outbound};
use crate::domain::reservation::{CommitOutcome, ReservationCoordinator};
use crate::domain::{Booking, BookingRepository, BookingRequest, ClientId, DataAccessError, Entity};
use crate::{Catalog, Dialogue};

const NAME_PROMPT: &str = "Please enter your name.";
const PHONE_PROMPT: &str = "Share your contact or type your phone number.";
const SERVICE_PROMPT: &str = "Choose a service.";
const RESOURCE_PROMPT: &str = "Choose a specialist.";
const DATE_PROMPT: &str = "Choose a date.";
const TIME_PROMPT: &str = "Choose a time.";
const CONFIRM_PROMPT: &str = "Confirm the booking?";
const NO_AVAILABILITY: &str = "There are no free slots on that date. Please choose another date.";
const NO_DATES: &str = "There are no dates open for booking right now.";
const SLOT_GONE: &str = "Sorry, that time is no longer available. Please choose again.";
const DECLINED: &str = "Booking cancelled.";
const FAILURE: &str = "Something went wrong. Please try again later.";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IntakeStep {
    #[default]
    CollectName,
    CollectPhone,
    CollectService,
    CollectResource,
    CollectDate,
    CollectTime,
    AwaitConfirmation,
    Committed,
    Aborted,
}

impl IntakeStep {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IntakeStep::Committed | IntakeStep::Aborted)
    }
}

/// 利用者からの入力
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    Text(String),
    /// 連絡先の共有（電話番号）
    Contact(String),
}

impl Input {
    fn text(&self) -> Option<&str> {
        match self {
            Input::Text(text) => Some(text.trim()),
            Input::Contact(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IntakeOutcome {
    Committed(Booking),
    Aborted,
}

/// 一回の入力に対する応答
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transition {
    pub replies: Vec<Outbound>,
    /// 終端に達したときだけ `Some`
    pub outcome: Option<IntakeOutcome>,
}

impl Transition {
    fn reply(message: Outbound) -> Self {
        Self {
            replies: vec![message],
            outcome: None,
        }
    }
}

/// 受付途中の入力内容
#[derive(Clone, Debug, Default)]
pub struct IntakeSession {
    step: IntakeStep,
    name: String,
    phone: String,
    service: String,
    resource: String,
    date: Option<NaiveDate>,
    offered_slots: Vec<SlotTime>,
    time: Option<SlotTime>,
}

impl IntakeSession {
    pub fn step(&self) -> IntakeStep {
        self.step
    }

    fn request(&self, owner_id: ClientId) -> Option<BookingRequest> {
        Some(BookingRequest {
            owner_id,
            client_name: self.name.clone(),
            client_phone: self.phone.clone(),
            service: self.service.clone(),
            resource: self.resource.clone(),
            date: self.date?,
            time: self.time?,
        })
    }
}

pub struct IntakeMachine {
    calendar: Arc<OperatingCalendar>,
    catalog: Catalog,
    dialogue: Dialogue,
    repository: Arc<dyn BookingRepository>,
    coordinator: Arc<ReservationCoordinator>,
    admin: AdminChannel,
}

impl IntakeMachine {
    pub fn new(
        calendar: Arc<OperatingCalendar>,
        catalog: Catalog,
        dialogue: Dialogue,
        repository: Arc<dyn BookingRepository>,
        coordinator: Arc<ReservationCoordinator>,
        admin: AdminChannel,
    ) -> Self {
        Self {
            calendar,
            catalog,
            dialogue,
            repository,
            coordinator,
            admin,
        }
    }

    pub fn start(&self) -> (IntakeSession, Vec<Outbound>) {
        (IntakeSession::default(), vec![Outbound::text(NAME_PROMPT)])
    }

    pub async fn advance(
        &self,
        session: &mut IntakeSession,
        owner: ClientId,
        input: Input,
        now: DateTime<Utc>,
    ) -> Transition {
        match session.step {
            IntakeStep::CollectName => match input.text() {
                Some(name) if !name.is_empty() => {
                    session.name = name.to_owned();
                    session.step = IntakeStep::CollectPhone;
                    Transition::reply(phone_prompt())
                }
                _ => Transition::reply(Outbound::text(NAME_PROMPT)),
            },
            IntakeStep::CollectPhone => {
                let phone = match &input {
                    Input::Contact(phone) | Input::Text(phone) => phone.trim(),
                };
                if phone.is_empty() {
                    return Transition::reply(phone_prompt());
                }
                session.phone = phone.to_owned();
                session.step = IntakeStep::CollectService;
                Transition::reply(choices(SERVICE_PROMPT, &self.catalog.services))
            }
            IntakeStep::CollectService => match find_label(&self.catalog.services, &input) {
                Some(service) => {
                    session.service = service;
                    session.step = IntakeStep::CollectResource;
                    Transition::reply(choices(RESOURCE_PROMPT, &self.catalog.resources))
                }
                None => Transition::reply(choices(SERVICE_PROMPT, &self.catalog.services)),
            },
            IntakeStep::CollectResource => match find_label(&self.catalog.resources, &input) {
                Some(resource) => {
                    session.resource = resource;
                    self.enter_date(session, Vec::new(), now)
                }
                None => Transition::reply(choices(RESOURCE_PROMPT, &self.catalog.resources)),
            },
            IntakeStep::CollectDate => self.collect_date(session, input, now).await,
            IntakeStep::CollectTime => {
                // 提示したラベルと完全一致したものだけ受け付ける
                let chosen = input.text().and_then(|label| {
                    session
                        .offered_slots
                        .iter()
                        .copied()
                        .find(|time| time.to_string() == label)
                });
                let Some(time) = chosen else {
                    return Transition::reply(time_prompt(&session.offered_slots));
                };
                session.time = Some(time);
                session.step = IntakeStep::AwaitConfirmation;
                Transition {
                    replies: vec![summary(session, time), self.confirm_prompt()],
                    outcome: None,
                }
            }
            IntakeStep::AwaitConfirmation => match input.text() {
                Some(token) if token == self.dialogue.confirm.trim() => {
                    self.confirm(session, owner, now).await
                }
                Some(token) if token == self.dialogue.decline.trim() => {
                    session.step = IntakeStep::Aborted;
                    Transition {
                        replies: vec![Outbound::text(DECLINED)],
                        outcome: Some(IntakeOutcome::Aborted),
                    }
                }
                _ => Transition::reply(self.confirm_prompt()),
            },
            IntakeStep::Committed | IntakeStep::Aborted => Transition::default(),
        }
    }

    async fn collect_date(
        &self,
        session: &mut IntakeSession,
        input: Input,
        now: DateTime<Utc>,
    ) -> Transition {
        let Some(date) = input
            .text()
            .and_then(|label| self.calendar.date_for_label(label, now))
        else {
            return self.enter_date(session, Vec::new(), now);
        };

        let taken = match self.repository.active_times(&session.resource, date).await {
            Ok(taken) => taken,
            Err(error) => return abort_on_store_failure(session, error),
        };
        let slots = self.calendar.available_slots(date, &taken, now);
        if slots.is_empty() {
            tracing::debug!(resource = %session.resource, %date, "no availability");
            return self.enter_date(session, vec![Outbound::text(NO_AVAILABILITY)], now);
        }

        session.date = Some(date);
        session.offered_slots = slots;
        session.step = IntakeStep::CollectTime;
        Transition::reply(time_prompt(&session.offered_slots))
    }

    async fn confirm(
        &self,
        session: &mut IntakeSession,
        owner: ClientId,
        now: DateTime<Utc>,
    ) -> Transition {
        let Some(request) = session.request(owner) else {
            tracing::warn!(%owner, "confirmation reached without date or time");
            session.step = IntakeStep::Aborted;
            return Transition {
                replies: vec![Outbound::text(FAILURE)],
                outcome: Some(IntakeOutcome::Aborted),
            };
        };

        match self.coordinator.commit(request, now).await {
            Ok(CommitOutcome::Committed(booking)) => {
                session.step = IntakeStep::Committed;
                self.admin.spawn_broadcast(admin_notice(&booking));
                Transition {
                    replies: vec![confirmation(&booking)],
                    outcome: Some(IntakeOutcome::Committed(booking)),
                }
            }
            Ok(CommitOutcome::Rejected(reason)) => {
                tracing::info!(%owner, ?reason, "returning to date selection");
                session.date = None;
                session.time = None;
                session.offered_slots.clear();
                self.enter_date(session, vec![Outbound::text(SLOT_GONE)], now)
            }
            Err(error) => abort_on_store_failure(session, error),
        }
    }

    /// 日付選択に移る。選べる日付がなければ受付を打ち切る
    fn enter_date(
        &self,
        session: &mut IntakeSession,
        mut replies: Vec<Outbound>,
        now: DateTime<Utc>,
    ) -> Transition {
        let labels: Vec<String> = self
            .calendar
            .date_options(now)
            .into_iter()
            .map(|option| option.label)
            .collect();
        if labels.is_empty() {
            session.step = IntakeStep::Aborted;
            replies.push(Outbound::text(NO_DATES));
            return Transition {
                replies,
                outcome: Some(IntakeOutcome::Aborted),
            };
        }
        session.step = IntakeStep::CollectDate;
        replies.push(Outbound::prompt(DATE_PROMPT, labels));
        Transition {
            replies,
            outcome: None,
        }
    }

    fn confirm_prompt(&self) -> Outbound {
        Outbound::prompt(
            CONFIRM_PROMPT,
            vec![self.dialogue.confirm.clone(), self.dialogue.decline.clone()],
        )
    }
}

fn abort_on_store_failure(session: &mut IntakeSession, error: DataAccessError) -> Transition {
    tracing::error!(%error, step = ?session.step, "booking store failure during intake");
    session.step = IntakeStep::Aborted;
    Transition {
        replies: vec![Outbound::text(FAILURE)],
        outcome: Some(IntakeOutcome::Aborted),
    }
}

fn find_label(catalog: &[String], input: &Input) -> Option<String> {
    let text = input.text()?;
    catalog.iter().find(|label| label.as_str() == text).cloned()
}

fn phone_prompt() -> Outbound {
    Outbound::Prompt {
        text: PHONE_PROMPT.to_owned(),
        options: Vec::new(),
        request_contact: true,
    }
}

fn choices(text: &str, labels: &[String]) -> Outbound {
    Outbound::prompt(text, labels.to_vec())
}

fn time_prompt(slots: &[SlotTime]) -> Outbound {
    Outbound::prompt(TIME_PROMPT, slots.iter().map(SlotTime::to_string).collect())
}

fn summary(session: &IntakeSession, time: SlotTime) -> Outbound {
    Outbound::notice(
        "Your booking",
        vec![
            ("Name", session.name.clone()),
            ("Phone", session.phone.clone()),
            ("Service", session.service.clone()),
            ("Specialist", session.resource.clone()),
            (
                "Date",
                session.date.map(|date| date.to_string()).unwrap_or_default(),
            ),
            ("Time", time.to_string()),
        ],
    )
}

fn confirmation(booking: &Booking) -> Outbound {
    Outbound::notice(
        "Booking confirmed",
        vec![
            ("Booking", format!("#{}", booking.id())),
            ("Service", booking.service().to_owned()),
            ("Specialist", booking.resource().to_owned()),
            ("Date", booking.date().to_string()),
            ("Time", booking.time().to_string()),
        ],
    )
}

fn admin_notice(booking: &Booking) -> Outbound {
    Outbound::notice(
        "New booking",
        vec![
            ("Booking", format!("#{}", booking.id())),
            ("Client", booking.client_name().to_owned()),
            ("Phone", booking.client_phone().to_owned()),
            ("Service", booking.service().to_owned()),
            ("Specialist", booking.resource().to_owned()),
            ("Date", booking.date().to_string()),
            ("Time", booking.time().to_string()),
        ],
    )
}
