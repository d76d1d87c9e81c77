use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::calendar::OperatingCalendar;
use crate::domain::{Booking, BookingRepository, BookingRequest, DataAccessError, Entity, SlotKey};

/// 確定を拒否した理由
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// 他の利用者が先に確定した
    SlotTaken,
    /// 枠が営業時間外か、当日の締切を過ぎた
    SlotExpired,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(Booking),
    Rejected(RejectReason),
}

/// 予約の確定
///
/// 同じ枠への確定は枠ごとのロックで直列化し、ストアの一意制約を最後の防壁とする。
pub struct ReservationCoordinator {
    repository: Arc<dyn BookingRepository>,
    calendar: Arc<OperatingCalendar>,
    locks: SlotLocks,
}

impl ReservationCoordinator {
    pub fn new(repository: Arc<dyn BookingRepository>, calendar: Arc<OperatingCalendar>) -> Self {
        Self {
            repository,
            calendar,
            locks: SlotLocks::default(),
        }
    }

    pub async fn commit(
        &self,
        request: BookingRequest,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, DataAccessError> {
        let key = request.slot_key();
        if !self.calendar.on_grid(request.time)
            || !self.calendar.is_offerable(request.date, request.time, now)
        {
            tracing::info!(slot = %key, "commit rejected: slot no longer offerable");
            return Ok(CommitOutcome::Rejected(RejectReason::SlotExpired));
        }

        let _guard = self.locks.acquire(&key).await;
        let taken = self
            .repository
            .active_times(&request.resource, request.date)
            .await?;
        if taken.contains(&request.time) {
            tracing::info!(slot = %key, "commit rejected: slot taken");
            return Ok(CommitOutcome::Rejected(RejectReason::SlotTaken));
        }

        match self.repository.insert(request).await {
            Ok(booking) => {
                tracing::info!(
                    entity = Booking::ENTITY_NAME,
                    id = %booking.id(),
                    owner = %booking.owner_id(),
                    slot = %key,
                    "booking committed"
                );
                Ok(CommitOutcome::Committed(booking))
            }
            Err(DataAccessError::Conflict(reason)) => {
                tracing::info!(slot = %key, %reason, "commit rejected by store constraint");
                Ok(CommitOutcome::Rejected(RejectReason::SlotTaken))
            }
            Err(error) => Err(error),
        }
    }
}

/// 枠ごとの非同期ロック
#[derive(Default)]
struct SlotLocks {
    locks: StdMutex<HashMap<SlotKey, Arc<Mutex<()>>>>,
}

impl SlotLocks {
    async fn acquire(&self, key: &SlotKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // 誰も保持していないロックは片付ける
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use crate::domain::calendar::SlotTime;
    use crate::domain::{BookingId, BookingStatus, ClientId};
    use crate::infrastructure::InMemoryBookingRepository;
    use crate::testing::{calendar, local, request};

    /// 占有状況の読み取りが常に空を返す（古いレプリカを読む別プロセス相当）
    struct StaleReads(InMemoryBookingRepository);

    #[async_trait]
    impl BookingRepository for StaleReads {
        async fn insert(&self, request: BookingRequest) -> Result<Booking, DataAccessError> {
            self.0.insert(request).await
        }

        async fn active_times(
            &self,
            _resource: &str,
            _date: NaiveDate,
        ) -> Result<BTreeSet<SlotTime>, DataAccessError> {
            Ok(BTreeSet::new())
        }

        async fn active_bookings_for_owner(
            &self,
            owner_id: ClientId,
        ) -> Result<Vec<Booking>, DataAccessError> {
            self.0.active_bookings_for_owner(owner_id).await
        }

        async fn pending_reminders(&self) -> Result<Vec<Booking>, DataAccessError> {
            self.0.pending_reminders().await
        }

        async fn mark_reminded(&self, id: BookingId) -> Result<bool, DataAccessError> {
            self.0.mark_reminded(id).await
        }

        async fn set_status(
            &self,
            id: BookingId,
            status: BookingStatus,
        ) -> Result<bool, DataAccessError> {
            self.0.set_status(id, status).await
        }

        async fn find_active_by_id_and_owner(
            &self,
            id: BookingId,
            owner_id: ClientId,
        ) -> Result<Option<Booking>, DataAccessError> {
            self.0.find_active_by_id_and_owner(id, owner_id).await
        }
    }

    fn coordinator() -> (Arc<InMemoryBookingRepository>, ReservationCoordinator) {
        let repo = Arc::new(InMemoryBookingRepository::new());
        let coordinator = ReservationCoordinator::new(repo.clone(), Arc::new(calendar()));
        (repo, coordinator)
    }

    #[tokio::test]
    async fn test_commit_writes_active_booking() {
        let (repo, coordinator) = coordinator();
        let now = local(&calendar(), "2024-06-10 08:00");
        let outcome = coordinator
            .commit(request(1, "Jamshed", "2024-06-10", "11:00"), now)
            .await
            .unwrap();
        let CommitOutcome::Committed(booking) = outcome else {
            panic!("expected commit, got {:?}", outcome);
        };
        assert!(booking.is_active());
        assert!(!booking.reminded());
        assert_eq!(repo.all().await, vec![booking]);
    }

    #[tokio::test]
    async fn test_taken_slot_is_rejected_without_write() {
        let (repo, coordinator) = coordinator();
        let now = local(&calendar(), "2024-06-10 08:00");
        coordinator
            .commit(request(1, "Jamshed", "2024-06-10", "11:00"), now)
            .await
            .unwrap();
        let outcome = coordinator
            .commit(request(2, "Jamshed", "2024-06-10", "11:00"), now)
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Rejected(RejectReason::SlotTaken));
        assert_eq!(repo.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_or_off_grid_slot_is_rejected() {
        let (repo, coordinator) = coordinator();
        let now = local(&calendar(), "2024-06-10 10:50");
        let late = coordinator
            .commit(request(1, "Jamshed", "2024-06-10", "11:00"), now)
            .await
            .unwrap();
        assert_eq!(late, CommitOutcome::Rejected(RejectReason::SlotExpired));
        let off_grid = coordinator
            .commit(request(1, "Jamshed", "2024-06-11", "11:10"), now)
            .await
            .unwrap();
        assert_eq!(off_grid, CommitOutcome::Rejected(RejectReason::SlotExpired));
        assert!(repo.all().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_commits_yield_single_booking() {
        let (repo, coordinator) = coordinator();
        let coordinator = Arc::new(coordinator);
        let now = local(&calendar(), "2024-06-10 08:00");

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .commit(request(1, "Jamshed", "2024-06-10", "11:00"), now)
                    .await
            })
        };
        let second = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .commit(request(2, "Jamshed", "2024-06-10", "11:00"), now)
                    .await
            })
        };
        let (first, second) = tokio::join!(first, second);
        let outcomes = [first.unwrap().unwrap(), second.unwrap().unwrap()];

        let committed = outcomes
            .iter()
            .filter(|o| matches!(o, CommitOutcome::Committed(_)))
            .count();
        let rejected = outcomes
            .iter()
            .filter(|o| **o == CommitOutcome::Rejected(RejectReason::SlotTaken))
            .count();
        assert_eq!((committed, rejected), (1, 1));
        assert_eq!(repo.all().await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_separate_coordinators_share_store_guard() {
        let repo = Arc::new(InMemoryBookingRepository::new());
        let first = ReservationCoordinator::new(repo.clone(), Arc::new(calendar()));
        let second = ReservationCoordinator::new(repo.clone(), Arc::new(calendar()));
        let now = local(&calendar(), "2024-06-10 08:00");

        let (a, b) = tokio::join!(
            first.commit(request(1, "Jamshed", "2024-06-10", "11:00"), now),
            second.commit(request(2, "Jamshed", "2024-06-10", "11:00"), now),
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        let committed = outcomes
            .iter()
            .filter(|o| matches!(o, CommitOutcome::Committed(_)))
            .count();
        let rejected = outcomes
            .iter()
            .filter(|o| **o == CommitOutcome::Rejected(RejectReason::SlotTaken))
            .count();
        assert_eq!((committed, rejected), (1, 1));
        assert_eq!(repo.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_store_conflict_is_slot_taken() {
        let repo = Arc::new(StaleReads(InMemoryBookingRepository::new()));
        let coordinator = ReservationCoordinator::new(repo.clone(), Arc::new(calendar()));
        let now = local(&calendar(), "2024-06-10 08:00");

        let first = coordinator
            .commit(request(1, "Jamshed", "2024-06-10", "11:00"), now)
            .await
            .unwrap();
        assert!(matches!(first, CommitOutcome::Committed(_)));

        // 再検査をすり抜けても、ストアの一意制約で拒否される
        let second = coordinator
            .commit(request(2, "Jamshed", "2024-06-10", "11:00"), now)
            .await
            .unwrap();
        assert_eq!(second, CommitOutcome::Rejected(RejectReason::SlotTaken));
        assert_eq!(repo.0.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_locks_are_released() {
        let (_, coordinator) = coordinator();
        let now = local(&calendar(), "2024-06-10 08:00");
        for time in ["11:00", "11:30", "12:00"] {
            coordinator
                .commit(request(1, "Jamshed", "2024-06-10", time), now)
                .await
                .unwrap();
        }
        let _guard = coordinator
            .locks
            .acquire(&request(1, "Jamshed", "2024-06-10", "12:30").slot_key())
            .await;
        assert_eq!(coordinator.locks.locks.lock().unwrap().len(), 1);
    }
}
