//! myy_engine：本地媒体播放引擎。
//!
//! 解封装、解码、音画同步和输出各自运行在独立线程上，通过有界队列连接；
//! `PlaybackManager` 是唯一的控制入口。

pub mod core;
pub mod player;
pub mod store;

pub use crate::core::{EngineConfig, ErrorKind, MediaInfo, PlaybackState, PlayerError, Result};
pub use crate::player::{PlaybackManager, PlayerEvent};
pub use crate::store::{MemoryPositionStore, PositionStore, SqlitePositionStore};
