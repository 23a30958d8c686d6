//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。コーディネーターはこの trait だけに依存し、
//! プロセス内実装と Redis 実装はコンストラクタ注入で差し替える。

pub mod clock;
pub mod signal_channel;
pub mod state_store;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::signal_channel::{SignalChannel, SignalFrame, Subscription};
pub use self::state_store::{StateStore, cas_condition, ttl_seconds};
