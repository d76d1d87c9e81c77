use std::{error::Error, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use slotbook::{
    desk::{self, BookingDesk, Inbound},
    domain::{
        notify::{Notifier, Outbound, TransportError},
        ClientId,
    },
    infrastructure::open_repository,
    SlotbookConfig,
};
use teloxide::{
    prelude::*,
    types::{ButtonRequest, KeyboardButton, KeyboardMarkup, KeyboardRemove, ParseMode, ReplyMarkup},
    utils::{command::BotCommands, html},
    RequestError,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

/// セッション掃除の周期
const SWEEP_PERIOD: Duration = Duration::from_secs(60);

#[derive(BotCommands, Clone, Copy)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
enum Command {
    #[command(description = "show the welcome message")]
    Start,
    #[command(description = "book an appointment")]
    Book,
    #[command(description = "list your upcoming bookings")]
    MyBookings,
    #[command(description = "cancel a booking")]
    CancelBooking,
    #[command(description = "stop the current dialogue")]
    Cancel,
    #[command(description = "contact the administrator")]
    Contact,
}

impl From<Command> for desk::Command {
    fn from(value: Command) -> Self {
        match value {
            Command::Start => desk::Command::Start,
            Command::Book => desk::Command::Book,
            Command::MyBookings => desk::Command::MyBookings,
            Command::CancelBooking => desk::Command::CancelBooking,
            Command::Cancel => desk::Command::Cancel,
            Command::Contact => desk::Command::Contact,
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    match SlotbookConfig::load() {
        Ok(config) => {
            tracing_subscriber::fmt()
                .with_max_level(Level::from(&config.logger.level))
                .init();
            if let Err(error) = run(config).await {
                error!("application error: {}", error);
            }
        }
        Err(error) => {
            tracing_subscriber::fmt::init();
            error!("failed to load configuration: {}", error)
        }
    }
}

async fn run(config: SlotbookConfig) -> Result<(), Box<dyn Error + Send + Sync>> {
    let repository = open_repository(&config.database.url).await?;
    let bot = Bot::from_env();
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier { bot: bot.clone() });
    let desk = Arc::new(BookingDesk::new(&config, repository, notifier.clone()));

    bot.set_my_commands(Command::bot_commands()).await?;

    let shutdown = CancellationToken::new();
    let scheduler = tokio::spawn(
        desk.reminder_scheduler(&config, notifier)
            .run(shutdown.clone()),
    );
    let sweeper = tokio::spawn(desk.sessions().run_eviction(
        Duration::from_secs(config.policy.session_idle_minutes * 60),
        SWEEP_PERIOD,
        shutdown.clone(),
    ));

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .filter_command::<Command>()
                .endpoint(command_handler),
        )
        .branch(Update::filter_message().endpoint(message_handler));

    info!("bot started");
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![desk])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    shutdown.cancel();
    let (scheduler, sweeper) = tokio::join!(scheduler, sweeper);
    scheduler?;
    sweeper?;
    info!("bot stopped");
    Ok(())
}

async fn command_handler(
    bot: Bot,
    msg: Message,
    cmd: Command,
    desk: Arc<BookingDesk>,
) -> HandlerResult {
    let replies = desk
        .handle(client_of(&msg), Inbound::Command(cmd.into()), Utc::now())
        .await;
    respond(&bot, msg.chat.id, replies).await
}

async fn message_handler(bot: Bot, msg: Message, desk: Arc<BookingDesk>) -> HandlerResult {
    let inbound = if let Some(contact) = msg.contact() {
        Inbound::Contact {
            phone: contact.phone_number.clone(),
        }
    } else if let Some(text) = msg.text() {
        Inbound::Text(text.to_owned())
    } else {
        return Ok(());
    };
    let replies = desk.handle(client_of(&msg), inbound, Utc::now()).await;
    respond(&bot, msg.chat.id, replies).await
}

fn client_of(msg: &Message) -> ClientId {
    ClientId::from(msg.chat.id.0)
}

async fn respond(bot: &Bot, chat: ChatId, replies: Vec<Outbound>) -> HandlerResult {
    for reply in replies {
        deliver(bot, chat, reply).await?;
    }
    Ok(())
}

/// 選択肢は一行に一つのボタンで並べる
async fn deliver(bot: &Bot, chat: ChatId, message: Outbound) -> Result<(), RequestError> {
    match message {
        Outbound::Prompt {
            text,
            options,
            request_contact,
        } => {
            let mut rows: Vec<Vec<KeyboardButton>> = options
                .into_iter()
                .map(|option| vec![KeyboardButton::new(option)])
                .collect();
            if request_contact {
                rows.push(vec![
                    KeyboardButton::new("Share contact").request(ButtonRequest::Contact)
                ]);
            }
            let markup = if rows.is_empty() {
                ReplyMarkup::KeyboardRemove(KeyboardRemove::new())
            } else {
                ReplyMarkup::Keyboard(
                    KeyboardMarkup::new(rows)
                        .resize_keyboard()
                        .one_time_keyboard(),
                )
            };
            bot.send_message(chat, text).reply_markup(markup).await?;
        }
        Outbound::Text(text) => {
            bot.send_message(chat, text)
                .reply_markup(ReplyMarkup::KeyboardRemove(KeyboardRemove::new()))
                .await?;
        }
        Outbound::Notice { title, fields } => {
            bot.send_message(chat, render_notice(&title, &fields))
                .parse_mode(ParseMode::Html)
                .reply_markup(ReplyMarkup::KeyboardRemove(KeyboardRemove::new()))
                .await?;
        }
    }
    Ok(())
}

fn render_notice(title: &str, fields: &[(String, String)]) -> String {
    let mut lines = vec![html::bold(&html::escape(title))];
    lines.extend(
        fields
            .iter()
            .map(|(label, value)| format!("{}: {}", html::escape(label), html::escape(value))),
    );
    lines.join("\n")
}

struct TelegramNotifier {
    bot: Bot,
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, recipient: ClientId, message: Outbound) -> Result<(), TransportError> {
        deliver(&self.bot, ChatId(*recipient), message)
            .await
            .map_err(TransportError::new)
    }
}
