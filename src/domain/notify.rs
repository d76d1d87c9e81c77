use std::{error::Error, sync::Arc};

use async_trait::async_trait;
use derive_more::Display;

use crate::domain::ClientId;

/// 利用者へ送るメッセージ
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// 選択肢付きの問いかけ
    Prompt {
        text: String,
        options: Vec<String>,
        request_contact: bool,
    },
    Text(String),
    /// 見出しと項目からなる整形済みのお知らせ
    Notice {
        title: String,
        fields: Vec<(String, String)>,
    },
}

impl Outbound {
    pub fn prompt(text: impl Into<String>, options: Vec<String>) -> Self {
        Outbound::Prompt {
            text: text.into(),
            options,
            request_contact: false,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Outbound::Text(text.into())
    }

    pub fn notice(title: impl Into<String>, fields: Vec<(&str, String)>) -> Self {
        Outbound::Notice {
            title: title.into(),
            fields: fields
                .into_iter()
                .map(|(label, value)| (label.to_owned(), value))
                .collect(),
        }
    }
}

/// 送信失敗
#[derive(Debug, Display)]
#[display(fmt = "Transport failure: {}", _0)]
pub struct TransportError(Box<dyn Error + Send + Sync>);

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.0.as_ref())
    }
}

impl TransportError {
    pub fn new(error: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self(error.into())
    }
}

/// メッセージ送信の窓口
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: ClientId, message: Outbound) -> Result<(), TransportError>;
}

/// 管理者への通知
#[derive(Clone)]
pub struct AdminChannel {
    notifier: Arc<dyn Notifier>,
    recipients: Arc<[ClientId]>,
}

impl AdminChannel {
    pub fn new(notifier: Arc<dyn Notifier>, recipients: Vec<ClientId>) -> Self {
        Self {
            notifier,
            recipients: recipients.into(),
        }
    }

    /// 全管理者へ送信する。失敗はログに残して続行し、失敗件数を返す
    pub async fn broadcast(&self, message: Outbound) -> usize {
        let mut failures = 0;
        for recipient in self.recipients.iter().copied() {
            if let Err(error) = self.notifier.send(recipient, message.clone()).await {
                failures += 1;
                tracing::error!(%recipient, %error, "admin notification failed");
            }
        }
        failures
    }

    /// 呼び出し元を待たせずに送信する
    pub fn spawn_broadcast(&self, message: Outbound) {
        if self.recipients.is_empty() {
            return;
        }
        let channel = self.clone();
        tokio::spawn(async move {
            channel.broadcast(message).await;
        });
    }
}
