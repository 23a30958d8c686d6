//! StateStore port - タスク状態の正本
//!
//! 1 キーにつき 1 つの `TaskState` を TTL 付きで保持し、
//! 原子的な compare-and-set を提供します。
//!
//! # 実装
//! - `LocalStateStore`: 単一プロセス用（Mutex で CAS を 1 クリティカルセクションに）
//! - `RedisStateStore`: 複数プロセス用（Lua スクリプトでサーバー側 CAS）

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::TaskState;
use crate::error::BackendError;

/// Persistence for per-key task states.
///
/// Contract shared by every implementation:
/// - A record past its TTL reads as absent.
/// - `compare_and_set_state` is the only way a key may enter `Running`.
/// - Backend failures surface as `BackendError`; nothing is retried here.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current state of `key`, or `None` if absent or expired.
    async fn get_task_state(&self, key: &str) -> Result<Option<TaskState>, BackendError>;

    /// Unconditional write; replaces any record and resets its TTL.
    async fn set_task_state(
        &self,
        key: &str,
        state: TaskState,
        ttl: Duration,
    ) -> Result<(), BackendError>;

    /// Atomically write `new_state` iff `(current == expected) != negate`.
    ///
    /// An absent record never equals `expected`, so
    /// `(Running, expected = Running, negate = true)` reads as
    /// "start only if not already running".
    async fn compare_and_set_state(
        &self,
        key: &str,
        new_state: TaskState,
        expected: TaskState,
        negate: bool,
        ttl: Duration,
    ) -> Result<bool, BackendError>;

    /// Remove the record immediately, bypassing its TTL.
    async fn delete_task_state(&self, key: &str) -> Result<(), BackendError>;

    /// Release held connections. Calling it twice is harmless.
    async fn close(&self) -> Result<(), BackendError>;

    async fn set_if_equal(
        &self,
        key: &str,
        new_state: TaskState,
        expected: TaskState,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        self.compare_and_set_state(key, new_state, expected, false, ttl)
            .await
    }

    async fn set_if_not_equal(
        &self,
        key: &str,
        new_state: TaskState,
        unexpected: TaskState,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        self.compare_and_set_state(key, new_state, unexpected, true, ttl)
            .await
    }
}

/// Whole seconds a TTL is persisted with: rounded up, never below one.
///
/// Both backends store TTLs at this granularity so they expire identically.
pub fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl
        .as_secs()
        .saturating_add(u64::from(ttl.subsec_nanos() > 0));
    secs.max(1)
}

/// CAS decision shared by the in-process store and the Lua script.
pub fn cas_condition(current: Option<TaskState>, expected: TaskState, negate: bool) -> bool {
    let matched = current == Some(expected);
    matched != negate
}
