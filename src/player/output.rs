use crate::core::{AudioFormat, SinkError};
use crate::player::audio_output::AudioSink;
use crate::player::video_output::VideoSink;
use std::time::Duration;

/// 输出后端：协商音频格式并创建音视频输出
pub trait OutputBackend: Send + Sync {
    /// 返回设备实际支持的格式（可能与请求不同）
    fn audio_format(&self, requested: AudioFormat) -> Result<AudioFormat, SinkError>;

    fn open_audio(&self, format: AudioFormat, buffer: Duration)
        -> Result<Box<dyn AudioSink>, SinkError>;

    fn open_video(&self) -> Result<Box<dyn VideoSink>, SinkError>;
}
