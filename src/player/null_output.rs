//! 无设备输出：音频按墙钟速度"播放"，视频只记录呈现时间。
//!
//! 用于无头运行和测试。`SinkRecorder` 可以观察呈现结果，也可以注入设备故障。

use crate::core::{log_ctx, AudioFormat, SinkError, VideoFrame};
use crate::player::audio_output::AudioSink;
use crate::player::output::OutputBackend;
use crate::player::video_output::VideoSink;
use log::info;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 一次视频呈现记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentedFrame {
    pub pts: i64,
    pub at: Instant,
}

#[derive(Default)]
struct RecorderInner {
    presented: Mutex<Vec<PresentedFrame>>,
    audio_written: AtomicU64,
    audio_opened: AtomicU64,
    fail_audio: AtomicBool,
    fail_video: AtomicBool,
}

/// 观察/控制无设备输出
#[derive(Clone, Default)]
pub struct SinkRecorder {
    inner: Arc<RecorderInner>,
}

impl SinkRecorder {
    pub fn presented_video(&self) -> Vec<PresentedFrame> {
        self.inner.presented.lock().clone()
    }

    pub fn presented_count(&self) -> usize {
        self.inner.presented.lock().len()
    }

    /// 写入音频输出的采样帧总数
    pub fn audio_frames_written(&self) -> u64 {
        self.inner.audio_written.load(Ordering::Acquire)
    }

    pub fn audio_sinks_opened(&self) -> u64 {
        self.inner.audio_opened.load(Ordering::Acquire)
    }

    /// 之后的音频写入全部失败（模拟设备拔出）
    pub fn fail_audio(&self) {
        self.inner.fail_audio.store(true, Ordering::Release);
    }

    pub fn fail_video(&self) {
        self.inner.fail_video.store(true, Ordering::Release);
    }

    pub fn clear_presented(&self) {
        self.inner.presented.lock().clear();
    }
}

/// 按墙钟消耗采样的音频输出
pub struct NullAudioSink {
    format: AudioFormat,
    capacity_frames: u64,
    written: u64,
    played: f64,
    running_since: Option<Instant>,
    recorder: SinkRecorder,
}

impl NullAudioSink {
    pub fn new(format: AudioFormat, buffer: Duration, recorder: SinkRecorder) -> Self {
        let capacity_frames = (buffer.as_secs_f64() * format.sample_rate as f64).ceil() as u64;
        Self {
            format,
            capacity_frames: capacity_frames.max(1),
            written: 0,
            played: 0.0,
            running_since: Some(Instant::now()),
            recorder,
        }
    }

    /// 按流逝时间推进播放位置，缓冲耗尽时停在已写入的末尾
    fn advance(&mut self) {
        if let Some(since) = self.running_since {
            let now = Instant::now();
            let elapsed = now.saturating_duration_since(since).as_secs_f64();
            self.played = (self.played + elapsed * self.format.sample_rate as f64)
                .min(self.written as f64);
            self.running_since = Some(now);
        }
    }

    fn check_failure(&self) -> Result<(), SinkError> {
        if self.recorder.inner.fail_audio.load(Ordering::Acquire) {
            Err(SinkError::Disconnected("模拟音频设备断开".into()))
        } else {
            Ok(())
        }
    }
}

impl AudioSink for NullAudioSink {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn write(&mut self, samples: &[f32], timeout: Duration) -> Result<usize, SinkError> {
        let channels = self.format.channels.max(1) as usize;
        let deadline = Instant::now() + timeout;
        loop {
            self.check_failure()?;
            self.advance();
            let queued = self.written - self.played as u64;
            let room = self.capacity_frames.saturating_sub(queued) as usize;
            let accepted = room.min(samples.len() / channels);
            if accepted > 0 {
                self.written += accepted as u64;
                self.recorder
                    .inner
                    .audio_written
                    .fetch_add(accepted as u64, Ordering::AcqRel);
                return Ok(accepted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            thread::sleep((deadline - now).min(Duration::from_millis(2)));
        }
    }

    fn played_frames(&mut self) -> u64 {
        self.advance();
        self.played as u64
    }

    fn pause(&mut self) {
        self.advance();
        self.running_since = None;
    }

    fn resume(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    fn clear(&mut self) {
        self.advance();
        self.written = self.played as u64;
        self.played = self.written as f64;
    }
}

/// 只记录呈现时间的视频输出
pub struct NullVideoSink {
    recorder: SinkRecorder,
}

impl VideoSink for NullVideoSink {
    fn present(&mut self, frame: &Arc<VideoFrame>) -> Result<(), SinkError> {
        if self.recorder.inner.fail_video.load(Ordering::Acquire) {
            return Err(SinkError::Disconnected("模拟视频输出断开".into()));
        }
        self.recorder.inner.presented.lock().push(PresentedFrame {
            pts: frame.pts,
            at: Instant::now(),
        });
        Ok(())
    }
}

/// 无设备输出后端
#[derive(Clone, Default)]
pub struct NullOutput {
    recorder: SinkRecorder,
}

impl NullOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorder(&self) -> SinkRecorder {
        self.recorder.clone()
    }
}

impl OutputBackend for NullOutput {
    fn audio_format(&self, requested: AudioFormat) -> Result<AudioFormat, SinkError> {
        Ok(requested)
    }

    fn open_audio(
        &self,
        format: AudioFormat,
        buffer: Duration,
    ) -> Result<Box<dyn AudioSink>, SinkError> {
        self.recorder.inner.audio_opened.fetch_add(1, Ordering::AcqRel);
        info!(
            "{} 🔈 打开无设备音频输出: {} Hz, {} 声道",
            log_ctx(),
            format.sample_rate,
            format.channels
        );
        Ok(Box::new(NullAudioSink::new(format, buffer, self.recorder.clone())))
    }

    fn open_video(&self) -> Result<Box<dyn VideoSink>, SinkError> {
        Ok(Box::new(NullVideoSink {
            recorder: self.recorder.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> NullAudioSink {
        NullAudioSink::new(
            AudioFormat {
                sample_rate: 1000,
                channels: 1,
            },
            Duration::from_millis(100),
            SinkRecorder::default(),
        )
    }

    #[test]
    fn accepts_up_to_buffer_capacity() {
        let mut sink = sink();
        sink.pause();
        let accepted = sink.write(&[0.0; 500], Duration::ZERO).unwrap();
        assert_eq!(accepted, 100);
        assert_eq!(sink.write(&[0.0; 10], Duration::ZERO).unwrap(), 0);
    }

    #[test]
    fn plays_in_real_time_and_stops_while_paused() {
        let mut sink = sink();
        sink.write(&[0.0; 100], Duration::ZERO).unwrap();
        thread::sleep(Duration::from_millis(30));
        let played = sink.played_frames();
        assert!(played >= 25, "played {}", played);
        sink.pause();
        let frozen = sink.played_frames();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(sink.played_frames(), frozen);
    }

    #[test]
    fn clear_discards_unplayed() {
        let mut sink = sink();
        sink.pause();
        sink.write(&[0.0; 80], Duration::ZERO).unwrap();
        sink.clear();
        assert_eq!(sink.write(&[0.0; 100], Duration::ZERO).unwrap(), 100);
    }

    #[test]
    fn injected_failure_surfaces_on_write() {
        let recorder = SinkRecorder::default();
        let output = NullOutput { recorder: recorder.clone() };
        let format = AudioFormat {
            sample_rate: 48000,
            channels: 2,
        };
        let mut sink = output.open_audio(format, Duration::from_millis(50)).unwrap();
        recorder.fail_audio();
        assert!(sink.write(&[0.0; 4], Duration::ZERO).is_err());
    }
}
