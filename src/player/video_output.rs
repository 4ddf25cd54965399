use crate::core::{SinkError, VideoFrame};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 视频输出表面
pub trait VideoSink: Send {
    /// 立即显示一帧
    fn present(&mut self, frame: &Arc<VideoFrame>) -> Result<(), SinkError>;

    /// 显示刷新间隔（垂直同步提示），未知时为 None
    fn refresh_interval(&self) -> Option<Duration> {
        None
    }
}

/// 最新帧槽：呈现线程写入，界面层按自己的节奏读取
#[derive(Clone, Default)]
pub struct SharedFrameSlot {
    inner: Arc<Mutex<Option<Arc<VideoFrame>>>>,
    generation: Arc<AtomicU64>,
}

impl SharedFrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, frame: Arc<VideoFrame>) {
        *self.inner.lock() = Some(frame);
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub fn latest(&self) -> Option<Arc<VideoFrame>> {
        self.inner.lock().clone()
    }

    /// 每写入一帧递增，界面层据此判断是否需要重绘
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// 把帧写进共享槽的视频输出
pub struct SlotVideoSink {
    slot: SharedFrameSlot,
    refresh: Option<Duration>,
}

impl SlotVideoSink {
    pub fn new(slot: SharedFrameSlot) -> Self {
        Self {
            slot,
            refresh: Some(Duration::from_micros(16_667)),
        }
    }
}

impl VideoSink for SlotVideoSink {
    fn present(&mut self, frame: &Arc<VideoFrame>) -> Result<(), SinkError> {
        self.slot.store(frame.clone());
        Ok(())
    }

    fn refresh_interval(&self) -> Option<Duration> {
        self.refresh
    }
}
