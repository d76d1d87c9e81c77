pub mod booking;
pub mod calendar;
pub mod cancellation;
pub mod intake;
pub mod notify;
pub mod reminder;
pub mod reservation;
pub mod session;

use derive_more::{Deref, Display, From};
use serde::{Deserialize, Serialize};
use std::{
    error::Error,
    fmt::{Debug, Display as FmtDisplay},
    ops::Deref as OpsDeref,
    str::FromStr,
};
use thiserror::Error;

pub use self::booking::*;

pub trait Id:
    Copy
    + Eq
    + OpsDeref<Target = Self::Inner>
    + From<Self::Inner>
    + FmtDisplay
    + Debug
    + Serialize
    + for<'de> Deserialize<'de>
{
    type Inner: FromStr;
}

pub trait Event: Clone + Eq + Debug + Serialize + for<'a> Deserialize<'a> {
    type Id;
}

pub trait Entity {
    type Id: Id;

    const ENTITY_NAME: &'static str;

    fn id(&self) -> Self::Id;
}

/// 状態遷移をイベントとして検証・適用するエンティティ
pub trait Aggregation: Entity {
    type Event: Event<Id = Self::Id>;
    type Error: Error;

    fn validate(&self, event: &Self::Event) -> Result<(), Self::Error>;
    fn apply(&mut self, event: Self::Event);

    /// 検証に通ったイベントだけを適用する
    fn transition(&mut self, event: Self::Event) -> Result<(), Self::Error> {
        self.validate(&event)?;
        self.apply(event);
        Ok(())
    }
}

/// 利用者（メッセージ送信元）のID
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
pub struct ClientId(i64);

impl Id for ClientId {
    type Inner = i64;
}

#[derive(Error, Debug)]
pub enum DataAccessError {
    #[error("Database connection error: {0}")]
    ConnectionError(Box<dyn Error + Send + Sync>),
    #[error("Database query error: {0}")]
    QueryError(Box<dyn Error + Send + Sync>),
    #[error("Data read error: {0}")]
    ReadError(Box<dyn Error + Send + Sync>),
    #[error("Data write error: {0}")]
    WriteError(Box<dyn Error + Send + Sync>),
    #[error("Client side error: {0}")]
    ClientSideError(Box<dyn Error + Send + Sync>),
    #[error("Uniqueness conflict: {0}")]
    Conflict(String),
}
