use crate::core::{AudioFormat, SinkError};
use std::time::Duration;

/// 音频输出设备
///
/// `write` 接收交错 f32 采样，返回实际接受的采样帧数（每声道采样数），
/// 设备缓冲已满时最多阻塞 timeout。`played_frames` 是设备真正播放出去的帧数，
/// 音频主时钟就是根据它推算的。
pub trait AudioSink: Send {
    fn format(&self) -> AudioFormat;

    fn write(&mut self, samples: &[f32], timeout: Duration) -> Result<usize, SinkError>;

    /// 自打开以来实际播放的采样帧数（clear 丢弃的不计入）
    fn played_frames(&mut self) -> u64;

    fn pause(&mut self);

    fn resume(&mut self);

    /// 丢弃尚未播放的缓冲（seek 时使用）
    fn clear(&mut self);
}

#[cfg(feature = "audio-device")]
pub use device::{CpalAudioSink, CpalOutput};

#[cfg(feature = "audio-device")]
mod device {
    use super::AudioSink;
    use crate::core::{log_ctx, AudioFormat, SinkError};
    use crate::player::output::OutputBackend;
    use crate::player::video_output::{SharedFrameSlot, SlotVideoSink, VideoSink};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Device, Stream, StreamConfig, SupportedStreamConfigRange};
    use crossbeam::queue::SegQueue;
    use log::{debug, error, info, warn};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    /// 常见的回退配置
    const FALLBACK_CONFIGS: [(u32, u16); 6] = [
        (48000, 2), // 最常见
        (44100, 2), // CD 音质
        (48000, 1),
        (44100, 1),
        (22050, 1),
        (22050, 2),
    ];

    fn default_device() -> Result<Device, SinkError> {
        let host = cpal::default_host();
        host.default_output_device()
            .ok_or_else(|| SinkError::Unavailable("无法找到音频输出设备".to_string()))
    }

    fn is_config_compatible(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
        let rate_in_range = config.sample_rate.0 >= supported.min_sample_rate().0
            && config.sample_rate.0 <= supported.max_sample_rate().0;
        rate_in_range && config.channels == supported.channels()
    }

    fn stream_config(format: AudioFormat) -> StreamConfig {
        StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        }
    }

    /// 选出设备支持的配置：优先请求的格式，不支持时依次尝试回退配置
    fn negotiate(device: &Device, requested: AudioFormat) -> Result<AudioFormat, SinkError> {
        let supported: Vec<SupportedStreamConfigRange> = device
            .supported_output_configs()
            .map_err(|e| SinkError::Unavailable(format!("无法获取支持的音频配置: {}", e)))?
            .collect();

        let fits = |format: AudioFormat| {
            let config = stream_config(format);
            supported.iter().any(|s| is_config_compatible(&config, s))
        };

        if fits(requested) {
            return Ok(requested);
        }
        warn!(
            "⚠️  音频设备不支持 {} Hz, {} 声道配置，回退到标准配置",
            requested.sample_rate, requested.channels
        );
        FALLBACK_CONFIGS
            .iter()
            .map(|&(sample_rate, channels)| AudioFormat {
                sample_rate,
                channels,
            })
            .find(|format| fits(*format))
            .map(|format| {
                info!(
                    "✅ 使用回退配置: {} Hz, {} 声道",
                    format.sample_rate, format.channels
                );
                format
            })
            .ok_or_else(|| {
                SinkError::Unavailable(format!(
                    "音频设备不支持任何标准配置 (原请求: {} Hz, {} 声道)",
                    requested.sample_rate, requested.channels
                ))
            })
    }

    /// cpal 音频输出
    pub struct CpalAudioSink {
        format: AudioFormat,
        stream: Stream,
        buffer: Arc<SegQueue<f32>>,
        played_samples: Arc<AtomicU64>,
        failure: Arc<Mutex<Option<String>>>,
        capacity_samples: usize,
    }

    // cpal::Stream 本身不是 Send；创建后只由音频呈现线程独占使用
    unsafe impl Send for CpalAudioSink {}

    impl CpalAudioSink {
        pub fn open(format: AudioFormat, buffer: Duration) -> Result<Self, SinkError> {
            info!(
                "{} 初始化音频输出: {} Hz, {} 声道",
                log_ctx(),
                format.sample_rate,
                format.channels
            );
            let device = default_device()?;
            debug!("使用音频设备: {}", device.name().unwrap_or_default());

            let samples = Arc::new(SegQueue::new());
            let played_samples = Arc::new(AtomicU64::new(0));
            let failure = Arc::new(Mutex::new(None));

            let stream = {
                let samples = samples.clone();
                let played_samples = played_samples.clone();
                let failure = failure.clone();
                device
                    .build_output_stream(
                        &stream_config(format),
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            let mut consumed = 0u64;
                            for sample in data.iter_mut() {
                                if let Some(value) = samples.pop() {
                                    *sample = value;
                                    consumed += 1;
                                } else {
                                    *sample = 0.0;
                                }
                            }
                            played_samples.fetch_add(consumed, Ordering::Release);
                        },
                        move |err| {
                            error!("音频流错误: {}", err);
                            *failure.lock() = Some(err.to_string());
                        },
                        None,
                    )
                    .map_err(|e| SinkError::Unavailable(format!("创建音频流失败: {}", e)))?
            };
            stream
                .play()
                .map_err(|e| SinkError::Unavailable(format!("启动音频流失败: {}", e)))?;
            info!("{} 音频输出已启动", log_ctx());

            let capacity_samples = (buffer.as_secs_f64() * format.sample_rate as f64).ceil()
                as usize
                * format.channels as usize;
            Ok(Self {
                format,
                stream,
                buffer: samples,
                played_samples,
                failure,
                capacity_samples: capacity_samples.max(format.channels as usize),
            })
        }

        fn check_failure(&self) -> Result<(), SinkError> {
            match self.failure.lock().as_ref() {
                Some(msg) => Err(SinkError::Disconnected(msg.clone())),
                None => Ok(()),
            }
        }
    }

    impl AudioSink for CpalAudioSink {
        fn format(&self) -> AudioFormat {
            self.format
        }

        fn write(&mut self, samples: &[f32], timeout: Duration) -> Result<usize, SinkError> {
            let channels = self.format.channels.max(1) as usize;
            let deadline = Instant::now() + timeout;
            loop {
                self.check_failure()?;
                let room = self.capacity_samples.saturating_sub(self.buffer.len());
                let accepted = room.min(samples.len()) / channels * channels;
                if accepted > 0 {
                    for sample in &samples[..accepted] {
                        self.buffer.push(*sample);
                    }
                    return Ok(accepted / channels);
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(0);
                }
                thread::sleep((deadline - now).min(Duration::from_millis(2)));
            }
        }

        fn played_frames(&mut self) -> u64 {
            self.played_samples.load(Ordering::Acquire) / self.format.channels.max(1) as u64
        }

        fn pause(&mut self) {
            if let Err(e) = self.stream.pause() {
                warn!("{} ⚠️ 暂停音频流失败: {}", log_ctx(), e);
            }
        }

        fn resume(&mut self) {
            if let Err(e) = self.stream.play() {
                warn!("{} ⚠️ 恢复音频流失败: {}", log_ctx(), e);
            }
        }

        fn clear(&mut self) {
            while self.buffer.pop().is_some() {}
        }
    }

    impl Drop for CpalAudioSink {
        fn drop(&mut self) {
            let _ = self.stream.pause();
            info!("{} 音频输出已停止", log_ctx());
        }
    }

    /// 系统默认音频设备 + 共享帧槽的视频输出
    #[derive(Default)]
    pub struct CpalOutput {
        slot: SharedFrameSlot,
    }

    impl CpalOutput {
        pub fn new() -> Self {
            Self::default()
        }

        /// 界面层从这里取最新的视频帧
        pub fn frame_slot(&self) -> SharedFrameSlot {
            self.slot.clone()
        }
    }

    impl OutputBackend for CpalOutput {
        fn audio_format(&self, requested: AudioFormat) -> Result<AudioFormat, SinkError> {
            negotiate(&default_device()?, requested)
        }

        fn open_audio(
            &self,
            format: AudioFormat,
            buffer: Duration,
        ) -> Result<Box<dyn AudioSink>, SinkError> {
            Ok(Box::new(CpalAudioSink::open(format, buffer)?))
        }

        fn open_video(&self) -> Result<Box<dyn VideoSink>, SinkError> {
            Ok(Box::new(SlotVideoSink::new(self.slot.clone())))
        }
    }
}
