//! App - アプリケーション層
//!
//! ports を組み合わせて中断可能なストリーム実行を提供する。
//!
//! # 主要コンポーネント
//! - **CoordinatorBuilder**: 構築とワイヤリング
//! - **InterruptCoordinator**: run_and_stream / stop
//! - **TaskStream**: 呼び出し側が消費するストリーム

pub mod builder;
pub mod coordinator;
pub mod stream;

pub use self::builder::{BuildError, CoordinatorBuilder};
pub use self::coordinator::{ActiveTask, InterruptCoordinator};
pub use self::stream::TaskStream;
