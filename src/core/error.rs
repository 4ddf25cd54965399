use crate::core::types::PlaybackState;
use thiserror::Error;

/// 打开媒体失败（仅影响本次 open，可换源重试）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OpenError {
    #[error("无法读取媒体源: {0}")]
    Unreadable(String),

    #[error("不支持的容器格式: {0}")]
    Unsupported(String),

    #[error("没有可解码的音视频流")]
    NoDecodableStreams,
}

/// 解封装错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DemuxError {
    /// 损坏的包头，跳过即可
    #[error("损坏的数据包: {0}")]
    Corrupt(String),

    /// I/O 失败，致命
    #[error("读取失败: {0}")]
    Io(String),
}

impl DemuxError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DemuxError::Io(_))
    }
}

/// 解码错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// 单个包损坏，记录后跳过
    #[error("损坏的数据包: {0}")]
    Corrupt(String),

    /// 解码器内部状态损坏，需要重建解码器
    #[error("解码器状态损坏: {0}")]
    State(String),

    #[error("不支持的编码: {0}")]
    Unsupported(String),
}

/// 输出设备错误（致命）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("输出设备不可用: {0}")]
    Unavailable(String),

    #[error("输出设备已断开: {0}")]
    Disconnected(String),
}

/// Seek 错误（越界目标会被钳制，不会走到这里）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SeekError {
    #[error("媒体源不支持 seek")]
    NotSeekable,

    #[error("seek 失败: {0}")]
    Backend(String),

    #[error("seek 确认超时")]
    Timeout,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite 错误: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("存储错误: {0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("配置文件读写失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("配置文件格式错误: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("无法打开文件: {0}")]
    Open(#[from] OpenError),

    #[error("解封装错误: {0}")]
    Demux(#[from] DemuxError),

    #[error("解码错误: {0}")]
    Decode(#[from] DecodeError),

    #[error("音视频输出错误: {0}")]
    Sink(#[from] SinkError),

    #[error("跳转错误: {0}")]
    Seek(#[from] SeekError),

    #[error("存储错误: {0}")]
    Store(#[from] StoreError),

    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    #[error("当前状态 {state:?} 不允许执行 {op}")]
    InvalidState { op: &'static str, state: PlaybackState },

    #[error("没有视频帧可供截图")]
    NoVideoFrame,

    #[error("图片编码失败: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("其他错误: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, PlayerError>;
