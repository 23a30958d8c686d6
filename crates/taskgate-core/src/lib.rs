//! taskgate-core
//!
//! Distributed interrupt coordination for long-running streamed tasks.
//!
//! # モジュール構成
//! - **domain**: TaskKey, TaskState, InterruptSignal
//! - **ports**: StateStore, SignalChannel, Clock
//! - **impls**: プロセス内実装と Redis 実装
//! - **app**: InterruptCoordinator, TaskStream, CoordinatorBuilder
//! - **config**: InterruptConfig（TOML）
//! - **error**: InterruptError, BackendError

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;

pub use app::{ActiveTask, BuildError, CoordinatorBuilder, InterruptCoordinator, TaskStream};
pub use config::{BackendConfig, ConfigError, CoordinatorConfig, InterruptConfig};
pub use domain::{InterruptSignal, TaskKey, TaskState};
pub use error::{BackendError, BoxError, InterruptError};
