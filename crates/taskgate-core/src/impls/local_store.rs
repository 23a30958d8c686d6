//! In-process state store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;

use crate::domain::{TaskState, state_key};
use crate::error::BackendError;
use crate::ports::{Clock, StateStore, SystemClock, cas_condition, ttl_seconds};

/// One persisted state with its expiry instant.
#[derive(Debug, Clone, Copy)]
struct Record {
    state: TaskState,
    expires_at: DateTime<Utc>,
}

/// `StateStore` for single-process deployments.
///
/// Design:
/// - One mutex guards the whole map; every operation, CAS included, is a
///   single critical section with no await inside.
/// - Expired records are evicted lazily, on the read that notices them.
pub struct LocalStateStore<C = SystemClock> {
    records: Mutex<HashMap<String, Record>>,
    clock: C,
}

impl LocalStateStore<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for LocalStateStore<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> LocalStateStore<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of records that have not expired yet.
    pub async fn live_records(&self) -> usize {
        let now = self.clock.now();
        let records = self.records.lock().await;
        records.values().filter(|r| r.expires_at > now).count()
    }

    fn read(records: &mut HashMap<String, Record>, full_key: &str, now: DateTime<Utc>) -> Option<TaskState> {
        let record = records.get(full_key)?;
        if now >= record.expires_at {
            records.remove(full_key);
            return None;
        }
        Some(record.state)
    }

    fn write(&self, records: &mut HashMap<String, Record>, full_key: String, state: TaskState, ttl: Duration) {
        let secs = i64::try_from(ttl_seconds(ttl)).unwrap_or(i64::MAX);
        let ttl = TimeDelta::try_seconds(secs).unwrap_or(TimeDelta::MAX);
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        records.insert(full_key, Record { state, expires_at });
    }
}

#[async_trait]
impl<C: Clock> StateStore for LocalStateStore<C> {
    async fn get_task_state(&self, key: &str) -> Result<Option<TaskState>, BackendError> {
        let now = self.clock.now();
        let mut records = self.records.lock().await;
        Ok(Self::read(&mut records, &state_key(key), now))
    }

    async fn set_task_state(
        &self,
        key: &str,
        state: TaskState,
        ttl: Duration,
    ) -> Result<(), BackendError> {
        let mut records = self.records.lock().await;
        self.write(&mut records, state_key(key), state, ttl);
        Ok(())
    }

    async fn compare_and_set_state(
        &self,
        key: &str,
        new_state: TaskState,
        expected: TaskState,
        negate: bool,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let full_key = state_key(key);
        let now = self.clock.now();
        let mut records = self.records.lock().await;

        let current = Self::read(&mut records, &full_key, now);
        if !cas_condition(current, expected, negate) {
            return Ok(false);
        }
        self.write(&mut records, full_key, new_state, ttl);
        Ok(true)
    }

    async fn delete_task_state(&self, key: &str) -> Result<(), BackendError> {
        self.records.lock().await.remove(&state_key(key));
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.records.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ManualClock;
    use rstest::rstest;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(60);

    fn store() -> (LocalStateStore<ManualClock>, ManualClock) {
        let clock = ManualClock::default();
        (LocalStateStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn set_then_get() {
        let (store, _) = store();
        assert_eq!(store.get_task_state("k").await.unwrap(), None);

        store.set_task_state("k", TaskState::Finished, TTL).await.unwrap();
        assert_eq!(
            store.get_task_state("k").await.unwrap(),
            Some(TaskState::Finished)
        );
    }

    #[tokio::test]
    async fn set_replaces_and_resets_ttl() {
        let (store, clock) = store();
        store.set_task_state("k", TaskState::Running, Duration::from_secs(10)).await.unwrap();
        clock.advance(Duration::from_secs(8));
        store.set_task_state("k", TaskState::Stopped, Duration::from_secs(10)).await.unwrap();
        clock.advance(Duration::from_secs(8));

        assert_eq!(
            store.get_task_state("k").await.unwrap(),
            Some(TaskState::Stopped)
        );
    }

    #[tokio::test]
    async fn running_record_expires_and_frees_the_slot() {
        let (store, clock) = store();
        let acquired = store
            .set_if_not_equal("k", TaskState::Running, TaskState::Running, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(acquired);
        assert_eq!(
            store.get_task_state("k").await.unwrap(),
            Some(TaskState::Running)
        );

        let blocked = store
            .set_if_not_equal("k", TaskState::Running, TaskState::Running, TTL)
            .await
            .unwrap();
        assert!(!blocked);

        clock.advance(Duration::from_millis(1001));
        assert_eq!(store.get_task_state("k").await.unwrap(), None);
        assert_eq!(store.live_records().await, 0);

        let reacquired = store
            .set_if_not_equal("k", TaskState::Running, TaskState::Running, TTL)
            .await
            .unwrap();
        assert!(reacquired);
    }

    #[rstest]
    #[case::past_chrono_range(Duration::from_secs(10_000_000_000_000_000))]
    #[case::max(Duration::MAX)]
    #[tokio::test]
    async fn oversized_ttl_saturates_instead_of_panicking(#[case] ttl: Duration) {
        let (store, clock) = store();
        store.set_task_state("k", TaskState::Running, ttl).await.unwrap();
        let claimed = store
            .set_if_not_equal("j", TaskState::Running, TaskState::Running, ttl)
            .await
            .unwrap();
        assert!(claimed);

        clock.advance(Duration::from_secs(365 * 24 * 60 * 60));
        assert_eq!(
            store.get_task_state("k").await.unwrap(),
            Some(TaskState::Running)
        );
        assert_eq!(store.live_records().await, 2);
    }

    #[tokio::test]
    async fn delete_bypasses_ttl() {
        let (store, _) = store();
        store.set_task_state("k", TaskState::Error, TTL).await.unwrap();
        store.delete_task_state("k").await.unwrap();
        assert_eq!(store.get_task_state("k").await.unwrap(), None);

        // deleting an absent key is fine
        store.delete_task_state("k").await.unwrap();
    }

    #[tokio::test]
    async fn close_clears_and_is_idempotent() {
        let (store, _) = store();
        store.set_task_state("a", TaskState::Running, TTL).await.unwrap();
        store.set_task_state("b", TaskState::Finished, TTL).await.unwrap();

        store.close().await.unwrap();
        store.close().await.unwrap();
        assert_eq!(store.live_records().await, 0);
    }

    #[rstest]
    #[tokio::test]
    async fn cas_mutates_iff_negate_xor_match(
        #[values(
            None,
            Some(TaskState::Idle),
            Some(TaskState::Running),
            Some(TaskState::Stopped),
            Some(TaskState::Finished),
            Some(TaskState::Error)
        )]
        current: Option<TaskState>,
        #[values(
            TaskState::Idle,
            TaskState::Running,
            TaskState::Stopped,
            TaskState::Finished,
            TaskState::Error
        )]
        expected: TaskState,
        #[values(false, true)] negate: bool,
    ) {
        let (store, _) = store();
        if let Some(state) = current {
            store.set_task_state("k", state, TTL).await.unwrap();
        }
        let new_state = if current == Some(TaskState::Stopped) {
            TaskState::Finished
        } else {
            TaskState::Stopped
        };

        let applied = store
            .compare_and_set_state("k", new_state, expected, negate, TTL)
            .await
            .unwrap();

        let should_apply = negate != (current == Some(expected));
        assert_eq!(applied, should_apply);
        let after = store.get_task_state("k").await.unwrap();
        if should_apply {
            assert_eq!(after, Some(new_state));
        } else {
            assert_eq!(after, current);
        }
    }

    #[tokio::test]
    async fn concurrent_cas_admits_exactly_one() {
        let store = Arc::new(LocalStateStore::new());
        let mut joins = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            joins.push(tokio::spawn(async move {
                store
                    .compare_and_set_state("k", TaskState::Running, TaskState::Running, true, TTL)
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for join in joins {
            if join.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
