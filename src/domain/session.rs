//! 利用者ごとの対話セッション
//!
//! 同じ利用者の入力はセッション単位のロックで一つずつ処理し、別の利用者とは並行に進める。

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use tokio::{
    sync::{Mutex, OwnedMutexGuard},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::domain::intake::IntakeSession;
use crate::domain::ClientId;

#[derive(Clone, Debug)]
pub enum Session {
    Intake(IntakeSession),
    /// キャンセルする予約番号の入力待ち
    Cancellation,
}

struct Entry {
    session: Option<Session>,
    touched: Instant,
}

/// ロック中のセッション。解放するまで同じ利用者の他の入力は待たされる
pub struct SessionSlot(OwnedMutexGuard<Entry>);

impl SessionSlot {
    pub fn get_mut(&mut self) -> Option<&mut Session> {
        self.0.session.as_mut()
    }

    pub fn replace(&mut self, session: Session) -> Option<Session> {
        self.0.session.replace(session)
    }

    pub fn take(&mut self) -> Option<Session> {
        self.0.session.take()
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    entries: StdMutex<HashMap<ClientId, Arc<Mutex<Entry>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, client: ClientId) -> SessionSlot {
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries
                .entry(client)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Entry {
                        session: None,
                        touched: Instant::now(),
                    }))
                })
                .clone()
        };
        let mut guard = entry.lock_owned().await;
        guard.touched = Instant::now();
        SessionSlot(guard)
    }

    /// `idle` より長く触れられていないセッションを破棄し、破棄した件数を返す
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|client, entry| {
            // 誰かが参照しているものは使用中
            if Arc::strong_count(entry) > 1 {
                return true;
            }
            let Ok(entry) = entry.try_lock() else {
                return true;
            };
            let expired = entry.session.is_none() || entry.touched.elapsed() > idle;
            if expired && entry.session.is_some() {
                tracing::debug!(%client, "idle session evicted");
            }
            !expired
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `shutdown` されるまで周期的に古いセッションを片付ける
    pub async fn run_eviction(
        self: Arc<Self>,
        idle: Duration,
        period: Duration,
        shutdown: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            let evicted = self.evict_idle(idle);
            if evicted > 0 {
                tracing::debug!(evicted, remaining = self.len(), "session sweep finished");
            }
        }
    }
}
