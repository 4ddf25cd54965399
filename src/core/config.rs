use crate::core::error::ConfigError;
use crate::core::queue::QueueMode;
use crate::core::types::AudioFormat;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 队列缓冲策略：容量按"缓冲多少秒媒体"换算
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub mode: QueueMode,
    pub packet_seconds: f64,
    pub frame_seconds: f64,
    pub min_items: usize,
    pub max_items: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mode: QueueMode::Backpressure,
            packet_seconds: 2.0,
            frame_seconds: 0.5,
            min_items: 4,
            max_items: 512,
        }
    }
}

/// 音画同步阈值
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// |delta| 不超过该值视为同步（毫秒）
    pub sync_threshold_ms: i64,
    /// 单次等待上限，保证 pause/seek 响应及时
    pub max_wait_ms: i64,
    /// 连续丢帧超过该数量触发粗同步
    pub max_consecutive_drops: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_threshold_ms: 40,
            max_wait_ms: 50,
            max_consecutive_drops: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub volume: f32,
    pub muted: bool,
    /// 输出设备缓冲上限（毫秒）
    pub sink_buffer_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            volume: 1.0,
            muted: false,
            sink_buffer_ms: 200,
        }
    }
}

impl AudioConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }
}

/// 解码器重建预算：窗口内重建次数超限即视为致命错误
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub max_resets: u32,
    pub reset_window_ms: u64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_resets: 3,
            reset_window_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 所有阻塞等待的轮询间隔
    pub poll_interval_ms: u64,
    pub seek_ack_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            seek_ack_timeout_ms: 2000,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn seek_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.seek_ack_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// 打开时从历史记录恢复位置
    pub resume_from_history: bool,
    /// 帧率未知时逐帧步进使用的帧率
    pub frame_step_fallback_fps: f64,
    /// 播放速度（0.25 ~ 4.0）
    pub speed: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            resume_from_history: true,
            frame_step_fallback_fps: 30.0,
            speed: 1.0,
        }
    }
}

/// 引擎配置（JSON）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queues: QueueConfig,
    pub sync: SyncConfig,
    pub audio: AudioConfig,
    pub decoder: DecoderConfig,
    pub worker: WorkerConfig,
    pub playback: PlaybackConfig,
    pub database_path: Option<PathBuf>,
}

impl EngineConfig {
    /// 读取配置，文件不存在时返回默认值
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("配置文件不存在，使用默认配置: {}", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join("none.json")).unwrap();
        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.queues.mode, QueueMode::Backpressure);
    }

    #[test]
    fn saves_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.json");
        let mut config = EngineConfig::default();
        config.sync.max_consecutive_drops = 2;
        config.database_path = Some(dir.path().join("history.db"));
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.sync.max_consecutive_drops, 2);
        assert_eq!(loaded.database_path, config.database_path);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{ "queues": { "mode": "drop" }, "audio": { "volume": 0.5 } }"#).unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.queues.mode, QueueMode::Drop);
        assert_eq!(config.queues.packet_seconds, 2.0);
        assert_eq!(config.audio.volume, 0.5);
        assert_eq!(config.audio.channels, 2);
    }

    #[test]
    fn playback_speed_defaults_to_normal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speed.json");
        std::fs::write(&path, r#"{ "playback": { "speed": 1.5 } }"#).unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.playback.speed, 1.5);
        assert!(config.playback.resume_from_history);
        assert_eq!(EngineConfig::default().playback.speed, 1.0);
    }
}
