use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// 媒体源
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSource {
    pub path: PathBuf,
}

impl MediaSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 书签/历史使用的媒体标识
    pub fn media_id(&self) -> String {
        std::fs::canonicalize(&self.path)
            .unwrap_or_else(|_| self.path.clone())
            .to_string_lossy()
            .into_owned()
    }

    pub fn as_str(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// 媒体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 有理数时间基（PTS 单位 -> 秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const MILLIS: Rational = Rational { num: 1, den: 1000 };

    pub fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    /// 时间基单位 -> 毫秒
    pub fn to_millis(&self, ts: i64) -> i64 {
        (ts as f64 * self.as_f64() * 1000.0).round() as i64
    }

    /// 毫秒 -> 时间基单位
    pub fn from_millis(&self, ms: i64) -> i64 {
        let tb = self.as_f64();
        if tb == 0.0 {
            0
        } else {
            (ms as f64 / 1000.0 / tb).round() as i64
        }
    }
}

/// 时间轴起点（毫秒）：各流起始时间中最早的一个，未知的忽略，全部未知时为 0
///
/// 所有流减去同一个起点，音视频的相对位置保持不变。
pub fn timeline_origin_ms(starts: impl IntoIterator<Item = (Rational, Option<i64>)>) -> i64 {
    starts
        .into_iter()
        .filter_map(|(time_base, start)| start.map(|ts| time_base.to_millis(ts)))
        .min()
        .unwrap_or(0)
}

/// 流描述（打开后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub id: usize,
    pub kind: MediaKind,
    pub codec: String,
    pub time_base: Rational,
    /// 视频帧率
    pub frame_rate: Option<f64>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl StreamDescriptor {
    /// 视频单帧时长（毫秒），未知时为 None
    pub fn frame_duration_ms(&self) -> Option<i64> {
        self.frame_rate
            .filter(|fps| *fps > 0.0)
            .map(|fps| (1000.0 / fps).round() as i64)
    }
}

/// 压缩数据包（PTS/DTS/时长使用流时间基）
#[derive(Debug, Clone)]
pub struct Packet {
    pub stream_id: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    RGBA,
    RGB,
    YUV420P,
    NV12,
}

/// 音频输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// 视频帧数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoFrame {
    pub pts: i64,           // 显示时间戳（毫秒）
    pub duration: i64,      // 帧持续时间（毫秒）
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,      // CPU 内存数据
}

/// 音频帧数据（交错 f32）
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pts: i64,           // 显示时间戳（毫秒）
    pub duration: i64,      // 毫秒
    pub sample_rate: u32,
    pub channels: u16,
    pub data: Vec<f32>,
}

impl AudioFrame {
    /// 每声道采样数
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.data.len() / self.channels as usize
        }
    }
}

/// 解码后的帧
#[derive(Debug, Clone)]
pub enum Frame {
    Audio(AudioFrame),
    Video(VideoFrame),
}

impl Frame {
    pub fn pts(&self) -> i64 {
        match self {
            Frame::Audio(f) => f.pts,
            Frame::Video(f) => f.pts,
        }
    }

    pub fn duration(&self) -> i64 {
        match self {
            Frame::Audio(f) => f.duration,
            Frame::Video(f) => f.duration,
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            Frame::Audio(_) => MediaKind::Audio,
            Frame::Video(_) => MediaKind::Video,
        }
    }
}

/// 队列中的数据：正常数据或流结束标记
#[derive(Debug, Clone)]
pub enum StreamItem<T> {
    Data(T),
    EndOfStream,
}

/// 致命错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    OpenFailed,
    DemuxFailed,
    DecodeFailed,
    SinkError,
}

/// 出错的流水线环节
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Open,
    Demux,
    Decode(MediaKind),
    AudioSink,
    VideoSink,
}

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Opening,
    Ready,
    Playing,
    Paused,
    Seeking,
    Stopped,
    Error(ErrorKind),
}

impl PlaybackState {
    /// 会话是否处于可操作的活动状态
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PlaybackState::Ready
                | PlaybackState::Playing
                | PlaybackState::Paused
                | PlaybackState::Seeking
        )
    }
}

/// 媒体信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub media_id: String,
    pub duration: Option<i64>,  // 总时长（毫秒）
    pub streams: Vec<StreamDescriptor>,
}

impl MediaInfo {
    pub fn stream(&self, kind: MediaKind) -> Option<&StreamDescriptor> {
        self.streams.iter().find(|s| s.kind == kind)
    }
}

/// 缓冲/呈现统计（用于监控和调试）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaybackStats {
    pub video_packets: usize,
    pub audio_packets: usize,
    pub video_frames: usize,
    pub audio_frames: usize,
    pub presented_video: u64,
    pub presented_audio: u64,
    pub dropped_video: u64,
    pub resyncs: u64,
    pub average_drift_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rational_converts_between_units() {
        let tb = Rational::new(1, 90_000);
        assert_eq!(tb.to_millis(90_000), 1000);
        assert_eq!(tb.from_millis(500), 45_000);
        assert_eq!(Rational::new(1, 0).to_millis(10), 0);
    }

    #[test]
    fn origin_is_earliest_known_stream_start() {
        let video = Rational::new(1, 90_000);
        let audio = Rational::new(1, 48_000);
        assert_eq!(
            timeline_origin_ms([(video, Some(126_000)), (audio, Some(67_680))]),
            1400
        );
        assert_eq!(timeline_origin_ms([(video, None), (audio, Some(48_000))]), 1000);
        assert_eq!(timeline_origin_ms([(video, None)]), 0);
        // 起点之后的时间戳换算为相对毫秒
        let origin = timeline_origin_ms([(video, Some(126_000))]);
        assert_eq!(video.to_millis(216_000) - origin, 1000);
    }

    #[test]
    fn frame_duration_from_rate() {
        let desc = StreamDescriptor {
            id: 0,
            kind: MediaKind::Video,
            codec: "h264".into(),
            time_base: Rational::MILLIS,
            frame_rate: Some(25.0),
            sample_rate: None,
            channels: None,
            width: Some(16),
            height: Some(16),
        };
        assert_eq!(desc.frame_duration_ms(), Some(40));
    }
}
