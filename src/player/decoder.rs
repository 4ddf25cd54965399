use crate::core::{AudioFormat, DecodeError, Frame, Packet};

/// 创建解码器时的输出要求
#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderOptions {
    /// 音频解码器的目标格式（与输出设备协商后的结果）
    pub audio_target: Option<AudioFormat>,
}

/// 解码器工厂：解码器状态损坏时用于关闭并重新打开
pub trait DecoderFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Decoder>, DecodeError>;
}

/// 单流解码器
///
/// 参考帧/预读状态属于解码器实例本身，`flush` 后必须完全清空。
pub trait Decoder: Send {
    /// 一个包可能产出 0、1 或多帧
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Frame>, DecodeError>;

    /// 丢弃内部参考帧和预读状态（seek 后必须调用）
    fn flush(&mut self);

    /// 流结束时取出缓冲中的剩余帧
    fn drain(&mut self) -> Result<Vec<Frame>, DecodeError>;

    fn description(&self) -> String;
}
