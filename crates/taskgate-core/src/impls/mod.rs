//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **LocalStateStore / LocalSignalChannel**: 単一プロセス用
//! - **RedisStateStore / RedisSignalChannel**: 複数プロセスで共有する本番用

pub mod local_channel;
pub mod local_store;
pub mod redis_channel;
pub mod redis_store;

pub use self::local_channel::LocalSignalChannel;
pub use self::local_store::LocalStateStore;
pub use self::redis_channel::RedisSignalChannel;
pub use self::redis_store::RedisStateStore;

use fred::clients::Client;
use fred::interfaces::ClientLike;
use fred::types::Builder;
use fred::types::config::Config;

use crate::error::BackendError;

/// Build a client for `url` and wait until it is connected.
pub async fn redis_connect(url: &str) -> Result<Client, BackendError> {
    let config = Config::from_url(url).map_err(|e| BackendError::Connect(e.to_string()))?;
    let client = Builder::from_config(config)
        .build()
        .map_err(|e| BackendError::Connect(e.to_string()))?;
    client
        .init()
        .await
        .map_err(|e| BackendError::Connect(e.to_string()))?;
    Ok(client)
}
