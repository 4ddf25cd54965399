// 核心数据结构、时钟、队列与同步

pub mod types;
pub mod clock;
pub mod config;
pub mod error;
pub mod queue;
pub mod sync;

pub use types::*;
pub use clock::*;
pub use config::EngineConfig;
pub use error::*;
pub use queue::{BoundedQueue, PopError, PushOutcome, QueueMode};
pub use sync::{SyncDecision, Synchronizer};

use std::{process, thread};

/// 日志前缀：进程与线程信息
pub fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}
