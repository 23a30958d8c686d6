//! CoordinatorBuilder - コーディネーターの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - TTL の整合性は build() 時に検証
//! - Redis に接続できなければ from_config() がエラーを返す（縮退運転しない）

use std::sync::Arc;

use tracing::{info, warn};

use crate::app::InterruptCoordinator;
use crate::config::{BackendConfig, ConfigError, CoordinatorConfig, InterruptConfig};
use crate::error::BackendError;
use crate::impls::{LocalSignalChannel, LocalStateStore, RedisSignalChannel, RedisStateStore};
use crate::ports::{SignalChannel, StateStore};

/// BuildError はコーディネーター構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("a state store and a signal channel must be provided together")]
    PartialBackend,
}

/// Wires a store, a channel and settings into an `InterruptCoordinator`.
///
/// # 使用例
/// ```ignore
/// let coordinator = CoordinatorBuilder::new()
///     .store(Arc::new(LocalStateStore::new()))
///     .channel(Arc::new(LocalSignalChannel::new()))
///     .running_ttl(Duration::from_secs(600))
///     .build()?;
/// ```
#[derive(Default)]
pub struct CoordinatorBuilder {
    store: Option<Arc<dyn StateStore>>,
    channel: Option<Arc<dyn SignalChannel>>,
    config: CoordinatorConfig,
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect the backend named by `config`, then build.
    pub async fn from_config(config: &InterruptConfig) -> Result<InterruptCoordinator, BuildError> {
        config.validate()?;
        let builder = Self::new().config(config.coordinator_config());

        let builder = match &config.backend {
            BackendConfig::Local => {
                info!("no shared backend configured, using the in-process backend");
                builder
            }
            BackendConfig::Redis { url } => {
                info!("using the Redis backend for distributed interrupts");
                let store = RedisStateStore::connect(url).await?;
                let channel = connect_or_release(&store, RedisSignalChannel::connect(url)).await?;
                builder.store(Arc::new(store)).channel(Arc::new(channel))
            }
        };
        builder.build()
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn channel(mut self, channel: Arc<dyn SignalChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn running_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.config.running_ttl = ttl;
        self
    }

    pub fn finished_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.config.finished_ttl = ttl;
        self
    }

    pub fn channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.channel_prefix = prefix.into();
        self
    }

    /// # 検証
    /// - TTL: どちらも 0 より大きく、finished_ttl < running_ttl
    /// - store と channel は両方指定か、両方省略（省略時はプロセス内実装）
    pub fn build(self) -> Result<InterruptCoordinator, BuildError> {
        self.config.validate()?;
        let (store, channel): (Arc<dyn StateStore>, Arc<dyn SignalChannel>) =
            match (self.store, self.channel) {
                (Some(store), Some(channel)) => (store, channel),
                (None, None) => (
                    Arc::new(LocalStateStore::new()),
                    Arc::new(LocalSignalChannel::new()),
                ),
                _ => return Err(BuildError::PartialBackend),
            };
        Ok(InterruptCoordinator::new(store, channel, self.config))
    }
}

/// Await the channel connection; if it fails, close the already-open store
/// so its connection is not leaked.
async fn connect_or_release<C>(
    store: &dyn StateStore,
    channel: impl Future<Output = Result<C, BackendError>>,
) -> Result<C, BackendError> {
    match channel.await {
        Ok(channel) => Ok(channel),
        Err(err) => {
            if let Err(close_err) = store.close().await {
                warn!(error = %close_err, "failed to close the state store after a channel error");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn build_defaults_to_local_backend() {
        let coordinator = CoordinatorBuilder::new().build().unwrap();
        assert_eq!(coordinator.config(), &CoordinatorConfig::default());
    }

    #[test]
    fn build_rejects_half_a_backend() {
        let result = CoordinatorBuilder::new()
            .store(Arc::new(LocalStateStore::new()))
            .build();
        assert!(matches!(result, Err(BuildError::PartialBackend)));
    }

    #[test]
    fn build_rejects_inverted_ttls() {
        let result = CoordinatorBuilder::new()
            .running_ttl(Duration::from_secs(10))
            .finished_ttl(Duration::from_secs(20))
            .build();
        assert!(matches!(
            result,
            Err(BuildError::Config(ConfigError::FinishedTtlNotShorter { .. }))
        ));
    }

    #[test]
    fn settings_are_applied() {
        let coordinator = CoordinatorBuilder::new()
            .store(Arc::new(LocalStateStore::new()))
            .channel(Arc::new(LocalSignalChannel::new()))
            .running_ttl(Duration::from_secs(120))
            .finished_ttl(Duration::from_secs(30))
            .channel_prefix("interrupt:")
            .build()
            .unwrap();
        let config = coordinator.config();
        assert_eq!(config.running_ttl, Duration::from_secs(120));
        assert_eq!(config.finished_ttl, Duration::from_secs(30));
        assert_eq!(config.channel_prefix, "interrupt:");
    }

    #[tokio::test]
    async fn from_config_local() {
        let coordinator = CoordinatorBuilder::from_config(&InterruptConfig::default())
            .await
            .unwrap();
        coordinator.stop("u", "s").await.unwrap();
    }

    #[tokio::test]
    async fn failed_channel_connect_closes_the_store() {
        let store = LocalStateStore::new();
        store
            .set_task_state("k", crate::domain::TaskState::Running, Duration::from_secs(60))
            .await
            .unwrap();

        let result = connect_or_release(&store, async {
            Err::<LocalSignalChannel, _>(BackendError::Connect("connection refused".into()))
        })
        .await;

        assert!(matches!(result, Err(BackendError::Connect(_))));
        assert_eq!(store.live_records().await, 0);
    }

    #[tokio::test]
    async fn successful_channel_connect_keeps_the_store_open() {
        let store = LocalStateStore::new();
        store
            .set_task_state("k", crate::domain::TaskState::Running, Duration::from_secs(60))
            .await
            .unwrap();

        let channel = connect_or_release(&store, async { Ok(LocalSignalChannel::new()) }).await;

        assert!(channel.is_ok());
        assert_eq!(store.live_records().await, 1);
    }

    #[tokio::test]
    async fn from_config_fails_on_unreachable_redis() {
        let config = InterruptConfig {
            backend: BackendConfig::Redis {
                url: "redis://127.0.0.1:1".into(),
            },
            ..InterruptConfig::default()
        };
        let result = CoordinatorBuilder::from_config(&config).await;
        assert!(matches!(result, Err(BuildError::Backend(BackendError::Connect(_)))));
    }
}
