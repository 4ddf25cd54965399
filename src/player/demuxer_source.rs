use crate::core::{DemuxError, MediaSource, OpenError, Packet, SeekError, StreamDescriptor};
use crate::player::decoder::{DecoderFactory, DecoderOptions};

/// 媒体后端：探测并打开容器
pub trait MediaBackend: Send + Sync {
    fn open(&self, source: &MediaSource) -> Result<Box<dyn DemuxerSource>, OpenError>;

    fn name(&self) -> &'static str;
}

/// Demuxer 数据源抽象接口
///
/// 不同的媒体后端（FFmpeg、合成测试源等）实现这个接口，
/// 播放流水线只依赖这里的契约。
pub trait DemuxerSource: Send {
    /// 打开后的流描述（不可变）
    fn streams(&self) -> &[StreamDescriptor];

    /// 读取下一个媒体包
    ///
    /// 返回：
    /// - Ok(Some(packet)): 成功读取一个包
    /// - Ok(None): 到达文件末尾
    /// - Err(DemuxError::Corrupt): 损坏的包，调用方跳过后继续读取
    /// - Err(DemuxError::Io): 致命读取错误
    fn read_packet(&mut self) -> Result<Option<Packet>, DemuxError>;

    /// 定位到目标时间（毫秒）之前最近的关键帧，返回实际位置
    fn seek(&mut self, target_ms: i64) -> Result<i64, SeekError>;

    /// 总时长（毫秒）
    fn duration_ms(&self) -> Option<i64>;

    /// 为指定流创建解码器工厂（解码器可能需要多次重建）
    fn decoder_factory(
        &self,
        stream_id: usize,
        options: &DecoderOptions,
    ) -> Result<Box<dyn DecoderFactory>, OpenError>;

    /// 是否支持 seek
    fn is_seekable(&self) -> bool {
        true
    }

    /// 获取描述信息（用于调试）
    fn description(&self) -> String;
}
