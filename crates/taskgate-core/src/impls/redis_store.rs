//! Redis-backed state store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fred::clients::Client;
use fred::interfaces::{ClientLike, KeysInterface, LuaInterface};
use fred::types::Expiration;
use tracing::debug;

use crate::domain::{TaskState, state_key};
use crate::error::BackendError;
use crate::impls::redis_connect;
use crate::ports::{StateStore, ttl_seconds};

/// Server-side CAS. `false` (missing key) never equals the expected name,
/// which is what lets an absent record pass a negated check.
///
/// KEYS[1] = state key
/// ARGV    = new state, expected state, negate ("1"/"0"), ttl seconds
const CAS_SCRIPT: &str = r#"
local current = redis.call('get', KEYS[1])
local matched = (current == ARGV[2])
local condition_met = matched
if ARGV[3] == '1' then
    condition_met = not matched
end
if condition_met then
    redis.call('set', KEYS[1], ARGV[1], 'ex', ARGV[4])
    return 1
end
return 0
"#;

/// `StateStore` shared by every process pointed at the same Redis.
///
/// One record per key: `state:<task key>` -> state name, with a native TTL.
/// The CAS runs as a Lua script so the read-compare-write is one server-side
/// step; there is no client-side GET-then-SET path.
pub struct RedisStateStore {
    client: Client,
    closed: AtomicBool,
}

impl RedisStateStore {
    /// Connect to `url`. Failing to reach the server is an error, not a
    /// degraded mode.
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let client = redis_connect(url).await?;
        Ok(Self::from_client(client))
    }

    /// Wrap an already-connected client.
    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn get_task_state(&self, key: &str) -> Result<Option<TaskState>, BackendError> {
        self.ensure_open()?;
        let value: Option<String> = self
            .client
            .get(state_key(key))
            .await
            .map_err(BackendError::command)?;
        value.map(|v| v.parse()).transpose()
    }

    async fn set_task_state(
        &self,
        key: &str,
        state: TaskState,
        ttl: Duration,
    ) -> Result<(), BackendError> {
        self.ensure_open()?;
        let ttl = ttl_seconds(ttl).min(i64::MAX as u64) as i64;
        self.client
            .set::<(), _, _>(
                state_key(key),
                state.as_str(),
                Some(Expiration::EX(ttl)),
                None,
                false,
            )
            .await
            .map_err(BackendError::command)
    }

    async fn compare_and_set_state(
        &self,
        key: &str,
        new_state: TaskState,
        expected: TaskState,
        negate: bool,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        self.ensure_open()?;
        let args = vec![
            new_state.as_str().to_string(),
            expected.as_str().to_string(),
            if negate { "1" } else { "0" }.to_string(),
            ttl_seconds(ttl).to_string(),
        ];
        let applied: i64 = self
            .client
            .eval(CAS_SCRIPT, vec![state_key(key)], args)
            .await
            .map_err(BackendError::command)?;
        debug!(key, %new_state, %expected, negate, applied, "compare-and-set");
        Ok(applied == 1)
    }

    async fn delete_task_state(&self, key: &str) -> Result<(), BackendError> {
        self.ensure_open()?;
        self.client
            .del::<i64, _>(state_key(key))
            .await
            .map_err(BackendError::command)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.client.quit().await.map_err(BackendError::command)
    }
}
