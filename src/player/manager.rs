use crate::core::config::EngineConfig;
use crate::core::queue::capacity_for;
use crate::core::{
    log_ctx, AudioFormat, BoundedQueue, ClockMaster, ErrorKind, MediaInfo, MediaKind,
    MediaSource, OpenError, PixelFormat, PlaybackState, PlaybackStats, PlayerError, Result,
    Stage, StreamDescriptor,
};
use crate::player::audio_output::AudioSink;
use crate::player::decoder::{Decoder, DecoderFactory, DecoderOptions};
use crate::player::decoder_thread::{DecoderThread, FrameQueue};
use crate::player::demuxer_source::{DemuxerSource, MediaBackend};
use crate::player::demuxer_thread::{DemuxerThread, PacketQueue, PacketRoutes};
use crate::player::events::PlayerEvent;
use crate::player::output::OutputBackend;
use crate::player::presenter::PresenterThread;
use crate::player::session::SessionShared;
use crate::player::video_output::VideoSink;
use crate::store::PositionStore;
use crossbeam_channel::Receiver;
use image::{DynamicImage, RgbImage, RgbaImage};
use log::{debug, error, info, warn};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// 估算音频包时长用的每包采样数
const AUDIO_PACKET_FRAMES_ESTIMATE: i64 = 1024;
/// 未知帧率时估算视频队列容量用的帧时长
const DEFAULT_FRAME_MS: i64 = 40;
/// 距离结尾不足该时长的历史位置不恢复
const RESUME_TAIL_MS: i64 = 1000;
/// 播放速度范围和步进
const MIN_SPEED: f64 = 0.25;
const MAX_SPEED: f64 = 4.0;
const SPEED_STEP: f64 = 0.25;

/// 非正数或非有限值按正常速度处理，其余钳制到可用范围
fn normalize_speed(speed: f64) -> f64 {
    if speed.is_finite() && speed > 0.0 {
        speed.clamp(MIN_SPEED, MAX_SPEED)
    } else {
        1.0
    }
}

/// 逐帧步进方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirection {
    Forward,
    Backward,
}

/// 一条被选中的流：描述 + 解码器工厂（解码器损坏或重播时重建）
struct SelectedStream {
    descriptor: StreamDescriptor,
    factory: Arc<dyn DecoderFactory>,
}

/// 一条流在流水线中的两级队列
struct StreamPipe {
    kind: MediaKind,
    packets: Arc<PacketQueue>,
    frames: Arc<FrameQueue>,
}

/// 正在运行的工作线程组
struct Pipeline {
    pipes: Vec<StreamPipe>,
    demuxer: DemuxerThread,
    decoders: Vec<DecoderThread>,
    presenters: Vec<PresenterThread>,
}

impl Pipeline {
    fn kinds(&self) -> Vec<MediaKind> {
        self.pipes.iter().map(|p| p.kind).collect()
    }

    fn flush_to(&self, serial: u64) -> usize {
        self.pipes
            .iter()
            .map(|p| p.packets.flush_to(serial) + p.frames.flush_to(serial))
            .sum()
    }

    fn queue_lengths(&self, kind: MediaKind) -> (usize, usize) {
        self.pipes
            .iter()
            .find(|p| p.kind == kind)
            .map(|p| (p.packets.len(), p.frames.len()))
            .unwrap_or((0, 0))
    }

    /// 停止所有线程并取回数据源（调用方已经 halt）
    fn shutdown(mut self) -> Option<Box<dyn DemuxerSource>> {
        for pipe in &self.pipes {
            pipe.packets.close();
            pipe.frames.close();
        }
        for presenter in &mut self.presenters {
            presenter.join();
        }
        for decoder in &mut self.decoders {
            decoder.join();
        }
        let source = self.demuxer.stop();
        info!(
            "{} ✅ 流水线已停止（{} 个解码线程，{} 个呈现线程）",
            log_ctx(),
            self.decoders.len(),
            self.presenters.len()
        );
        source
    }
}

/// 一个已打开的媒体
struct PlaybackSession {
    source: MediaSource,
    media_id: String,
    info: MediaInfo,
    streams: Vec<SelectedStream>,
    audio_format: Option<AudioFormat>,
    pipeline: Option<Pipeline>,
    /// 停止后保留的数据源，重播时复用
    parked: Option<Box<dyn DemuxerSource>>,
    stopped_position: f64,
}

impl PlaybackSession {
    fn stream(&self, kind: MediaKind) -> Option<&SelectedStream> {
        self.streams.iter().find(|s| s.descriptor.kind == kind)
    }

    fn duration_ms(&self) -> Option<i64> {
        self.info.duration
    }
}

/// 播放管理器 - 整体控制播放流程
///
/// 所有控制操作都在调用线程上同步完成；工作线程只通过 `SessionShared`
/// 回报致命错误和流结束。
pub struct PlaybackManager {
    config: EngineConfig,
    backend: Arc<dyn MediaBackend>,
    output: Arc<dyn OutputBackend>,
    store: Option<Arc<dyn PositionStore>>,
    shared: Arc<SessionShared>,
    session: Option<PlaybackSession>,
}

impl PlaybackManager {
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn MediaBackend>,
        output: Arc<dyn OutputBackend>,
        store: Option<Arc<dyn PositionStore>>,
    ) -> Self {
        info!(
            "{} 🎮 创建播放管理器 (媒体后端: {})",
            log_ctx(),
            backend.name()
        );
        let shared = Arc::new(SessionShared::new(
            config.sync.clone(),
            config.audio.volume,
            config.audio.muted,
        ));
        Self {
            config,
            backend,
            output,
            store,
            shared,
            session: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 订阅引擎事件
    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        self.shared.events.subscribe()
    }

    pub fn current_state(&self) -> PlaybackState {
        self.shared.state()
    }

    /// 当前播放位置（秒）
    pub fn current_position(&self) -> f64 {
        let Some(session) = self.session.as_ref() else {
            return 0.0;
        };
        match self.shared.state() {
            PlaybackState::Idle | PlaybackState::Opening => 0.0,
            PlaybackState::Stopped => session.stopped_position,
            _ => {
                let now = self.shared.clock.now().max(0);
                let now = match session.duration_ms() {
                    Some(duration) => now.min(duration),
                    None => now,
                };
                now as f64 / 1000.0
            }
        }
    }

    pub fn media_info(&self) -> Option<MediaInfo> {
        self.session.as_ref().map(|s| s.info.clone())
    }

    /// 打开媒体文件
    ///
    /// 已有会话时先停止并关闭。成功后进入 Ready，解封装和解码线程已经开始预读；
    /// 失败时进入 Error(OpenFailed) 并发送一次 Fatal 事件。
    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<MediaInfo> {
        let source = MediaSource::new(path.as_ref());
        info!("{} 📂 打开媒体: {}", log_ctx(), source.as_str());

        self.discard_session();
        self.shared.rearm();
        self.shared.clear_media();
        self.shared.clock.stop();
        self.shared.set_state(PlaybackState::Opening);

        match self.open_session(source) {
            Ok(session) => {
                let info = session.info.clone();
                self.session = Some(session);
                // 预读阶段可能已经出错
                if !self
                    .shared
                    .transition(PlaybackState::Opening, PlaybackState::Ready)
                {
                    return Err(PlayerError::InvalidState {
                        op: "open",
                        state: self.shared.state(),
                    });
                }
                info!("{} ✅ 媒体已就绪: {:?}", log_ctx(), info);
                Ok(info)
            }
            Err(e) => {
                self.shared
                    .fail(ErrorKind::OpenFailed, Stage::Open, e.to_string());
                Err(e)
            }
        }
    }

    fn open_session(&mut self, source: MediaSource) -> Result<PlaybackSession> {
        let mut demuxer = self.backend.open(&source)?;
        let media_id = source.media_id();
        let all_streams = demuxer.streams().to_vec();
        let duration = demuxer.duration_ms();
        info!(
            "{} 📋 {}: {} 条流, 时长 {:?}ms",
            log_ctx(),
            demuxer.description(),
            all_streams.len(),
            duration
        );

        // ========== 协商音频输出格式 ==========
        // 设备不可用时继续播放视频
        let has_audio = all_streams.iter().any(|s| s.kind == MediaKind::Audio);
        let audio_format = if has_audio {
            match self.output.audio_format(self.config.audio.format()) {
                Ok(format) => {
                    info!(
                        "{} 🔊 音频输出格式: {} Hz, {} 声道",
                        log_ctx(),
                        format.sample_rate,
                        format.channels
                    );
                    Some(format)
                }
                Err(e) => {
                    warn!("{} ⚠️ 音频输出不可用，禁用音频: {}", log_ctx(), e);
                    None
                }
            }
        } else {
            None
        };
        let options = DecoderOptions {
            audio_target: audio_format,
        };

        // ========== 选流并创建解码器 ==========
        let mut streams = Vec::new();
        let mut decoders: Vec<Box<dyn Decoder>> = Vec::new();
        for kind in [MediaKind::Video, MediaKind::Audio] {
            if kind == MediaKind::Audio && audio_format.is_none() {
                continue;
            }
            let Some(descriptor) = all_streams.iter().find(|s| s.kind == kind) else {
                continue;
            };
            let factory: Arc<dyn DecoderFactory> =
                match demuxer.decoder_factory(descriptor.id, &options) {
                    Ok(factory) => Arc::from(factory),
                    Err(e) => {
                        warn!("{} ⚠️ 无法为{}流创建解码器: {}", log_ctx(), kind, e);
                        continue;
                    }
                };
            match factory.create() {
                Ok(decoder) => {
                    info!("{} 🎞️ {}解码器: {}", log_ctx(), kind, decoder.description());
                    decoders.push(decoder);
                    streams.push(SelectedStream {
                        descriptor: descriptor.clone(),
                        factory,
                    });
                }
                Err(e) => warn!("{} ⚠️ {}解码器打开失败: {}", log_ctx(), kind, e),
            }
        }
        if streams.is_empty() {
            return Err(OpenError::NoDecodableStreams.into());
        }
        let audio_format = audio_format.filter(|_| {
            streams
                .iter()
                .any(|s| s.descriptor.kind == MediaKind::Audio)
        });

        // ========== 从历史位置恢复 ==========
        let serial = self.shared.signal.serial();
        if let Some(target) = self.resume_target(&media_id, duration) {
            match demuxer.seek(target) {
                Ok(actual) => {
                    info!(
                        "{} ⏩ 恢复上次播放位置: {}ms (关键帧 {}ms)",
                        log_ctx(),
                        target,
                        actual
                    );
                    self.shared.install_seek_filter(serial, target);
                    self.shared.clock.set_time(target);
                }
                Err(e) => warn!("{} ⚠️ 恢复播放位置失败，从头播放: {}", log_ctx(), e),
            }
        }

        // 变速时音频不写设备，改由墙钟做主时钟
        self.config.playback.speed = normalize_speed(self.config.playback.speed);
        self.shared.clock.set_rate(self.config.playback.speed);
        self.shared.clock.set_master(
            if audio_format.is_some() && self.shared.clock.is_normal_rate() {
                ClockMaster::Audio
            } else {
                ClockMaster::Wall
            },
        );

        let mut session = PlaybackSession {
            source,
            media_id: media_id.clone(),
            info: MediaInfo {
                media_id,
                duration,
                streams: all_streams,
            },
            streams,
            audio_format,
            pipeline: None,
            parked: None,
            stopped_position: 0.0,
        };
        let pipeline = self.spawn_pipeline(&session, demuxer, decoders);
        session.pipeline = Some(pipeline);
        Ok(session)
    }

    /// 需要恢复的历史位置（毫秒）
    fn resume_target(&self, media_id: &str, duration: Option<i64>) -> Option<i64> {
        if !self.config.playback.resume_from_history {
            return None;
        }
        let store = self.store.as_ref()?;
        let seconds = match store.load_position(media_id) {
            Ok(position) => position?,
            Err(e) => {
                warn!("{} ⚠️ 读取播放历史失败: {}", log_ctx(), e);
                return None;
            }
        };
        let target = (seconds * 1000.0).round() as i64;
        if target <= 0 {
            return None;
        }
        if let Some(duration) = duration {
            if target >= duration - RESUME_TAIL_MS {
                debug!("{} 历史位置接近结尾，从头播放", log_ctx());
                return None;
            }
        }
        Some(target)
    }

    /// 启动解封装和解码线程（呈现线程在 play 时启动）
    fn spawn_pipeline(
        &self,
        session: &PlaybackSession,
        source: Box<dyn DemuxerSource>,
        decoders: Vec<Box<dyn Decoder>>,
    ) -> Pipeline {
        let queues = &self.config.queues;
        let poll = self.config.worker.poll_interval();
        let mut pipes = Vec::new();
        let mut routes = PacketRoutes::new();
        let mut decoder_threads = Vec::new();

        for (stream, decoder) in session.streams.iter().zip(decoders) {
            let kind = stream.descriptor.kind;
            let item_ms = match kind {
                MediaKind::Video => stream
                    .descriptor
                    .frame_duration_ms()
                    .unwrap_or(DEFAULT_FRAME_MS),
                MediaKind::Audio => {
                    let rate = stream.descriptor.sample_rate.unwrap_or(48000).max(1) as i64;
                    (AUDIO_PACKET_FRAMES_ESTIMATE * 1000 / rate).max(1)
                }
            };
            let packets = Arc::new(BoundedQueue::new(
                format!("{}-packets", kind),
                capacity_for(queues.packet_seconds, item_ms, queues.min_items, queues.max_items),
                queues.mode,
            ));
            let frames = Arc::new(BoundedQueue::new(
                format!("{}-frames", kind),
                capacity_for(queues.frame_seconds, item_ms, queues.min_items, queues.max_items),
                queues.mode,
            ));
            debug!(
                "{} 📐 {}队列容量: 包 {}, 帧 {}",
                log_ctx(),
                kind,
                packets.capacity(),
                frames.capacity()
            );
            routes.insert(stream.descriptor.id, (kind, packets.clone()));
            decoder_threads.push(DecoderThread::start(
                kind,
                decoder,
                stream.factory.clone(),
                packets.clone(),
                frames.clone(),
                self.shared.clone(),
                &self.config.decoder,
                poll,
            ));
            pipes.push(StreamPipe {
                kind,
                packets,
                frames,
            });
        }

        let demuxer = DemuxerThread::start(source, routes, self.shared.clone(), poll);
        let pipeline = Pipeline {
            pipes,
            demuxer,
            decoders: decoder_threads,
            presenters: Vec::new(),
        };
        self.shared
            .expect_streams(self.shared.signal.serial(), pipeline.kinds());
        pipeline
    }

    /// 开始/继续播放
    pub fn play(&mut self) -> Result<()> {
        let state = self.shared.state();
        match state {
            PlaybackState::Playing => return Ok(()),
            PlaybackState::Ready | PlaybackState::Paused => {}
            PlaybackState::Stopped => self.restart()?,
            other => {
                return Err(PlayerError::InvalidState {
                    op: "play",
                    state: other,
                })
            }
        }

        // 播完后再次播放：从头开始
        if self.shared.state() == PlaybackState::Paused && self.shared.media_finished() {
            info!("{} 🔁 已播放到结尾，从头开始", log_ctx());
            self.seek(0.0)?;
        }

        self.start_presenters()?;

        let from = self.shared.state();
        if !self.shared.transition(from, PlaybackState::Playing) {
            return Err(PlayerError::InvalidState {
                op: "play",
                state: self.shared.state(),
            });
        }
        self.shared.resume();
        info!(
            "{} ▶️ 开始播放 @ {:.3}s",
            log_ctx(),
            self.shared.clock.now_seconds()
        );
        Ok(())
    }

    /// Stopped 之后从头重建流水线
    fn restart(&mut self) -> Result<()> {
        let session = self.session.as_mut().ok_or(PlayerError::InvalidState {
            op: "play",
            state: PlaybackState::Stopped,
        })?;
        info!("{} 🔁 从头重新播放: {}", log_ctx(), session.source.as_str());

        let source = match session.parked.take() {
            Some(mut source) if source.is_seekable() => match source.seek(0) {
                Ok(_) => source,
                Err(e) => {
                    warn!("{} ⚠️ 回到开头失败，重新打开: {}", log_ctx(), e);
                    self.backend.open(&session.source)?
                }
            },
            _ => self.backend.open(&session.source)?,
        };
        let mut decoders = Vec::with_capacity(session.streams.len());
        for stream in &session.streams {
            decoders.push(stream.factory.create()?);
        }

        self.shared.rearm();
        self.shared.clock.stop();
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        let pipeline = self.spawn_pipeline(&session, source, decoders);
        session.pipeline = Some(pipeline);
        session.stopped_position = 0.0;
        self.session = Some(session);
        self.shared
            .transition(PlaybackState::Stopped, PlaybackState::Ready);
        Ok(())
    }

    /// 打开输出设备并启动呈现线程（每条流水线只启动一次）
    fn start_presenters(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let Some(pipeline) = session.pipeline.as_mut() else {
            return Ok(());
        };
        if !pipeline.presenters.is_empty() {
            return Ok(());
        }

        // 先打开全部设备，再启动线程
        let buffer = Duration::from_millis(self.config.audio.sink_buffer_ms);
        let mut audio_sink: Option<Box<dyn AudioSink>> = None;
        let mut video_sink: Option<Box<dyn VideoSink>> = None;
        for pipe in &pipeline.pipes {
            let opened = match pipe.kind {
                MediaKind::Audio => {
                    let format = session.audio_format.unwrap_or(self.config.audio.format());
                    self.output
                        .open_audio(format, buffer)
                        .map(|sink| audio_sink = Some(sink))
                        .map_err(|e| (Stage::AudioSink, e))
                }
                MediaKind::Video => self
                    .output
                    .open_video()
                    .map(|sink| video_sink = Some(sink))
                    .map_err(|e| (Stage::VideoSink, e)),
            };
            if let Err((stage, e)) = opened {
                error!("{} ❌ 打开输出设备失败: {}", log_ctx(), e);
                self.shared
                    .fail(ErrorKind::SinkError, stage, e.to_string());
                return Err(e.into());
            }
        }

        let poll = self.config.worker.poll_interval();
        for pipe in &pipeline.pipes {
            let presenter = match pipe.kind {
                MediaKind::Audio => audio_sink.take().map(|sink| {
                    PresenterThread::spawn_audio(sink, pipe.frames.clone(), self.shared.clone(), poll)
                }),
                MediaKind::Video => video_sink.take().map(|sink| {
                    PresenterThread::spawn_video(sink, pipe.frames.clone(), self.shared.clone(), poll)
                }),
            };
            pipeline.presenters.extend(presenter);
        }
        Ok(())
    }

    /// 暂停：输出停止消费，时钟冻结，解封装/解码继续预读到队列满
    pub fn pause(&mut self) -> Result<()> {
        match self.shared.state() {
            PlaybackState::Paused => return Ok(()),
            PlaybackState::Playing => {}
            other => {
                return Err(PlayerError::InvalidState {
                    op: "pause",
                    state: other,
                })
            }
        }
        self.shared.freeze();
        if !self
            .shared
            .transition(PlaybackState::Playing, PlaybackState::Paused)
        {
            // 期间已播完（同样进入 Paused）或已出错
            let state = self.shared.state();
            if state != PlaybackState::Paused {
                return Err(PlayerError::InvalidState { op: "pause", state });
            }
        }
        let position = self.current_position();
        info!("{} ⏸️ 暂停 @ {:.3}s", log_ctx(), position);
        self.persist_position(position);
        Ok(())
    }

    /// 跳转到指定位置（秒），超出范围的目标会被钳制
    ///
    /// 返回时旧位置的数据已全部作废：队列已 flush，解封装线程已确认新位置，
    /// 时钟已设到目标。播放中 seek 时时钟停在目标处，等新位置的第一帧输出后再走；
    /// 暂停中 seek 会呈现一帧预览。
    pub fn seek(&mut self, seconds: f64) -> Result<()> {
        let prior = self.shared.state();
        if !matches!(
            prior,
            PlaybackState::Ready | PlaybackState::Playing | PlaybackState::Paused
        ) {
            return Err(PlayerError::InvalidState {
                op: "seek",
                state: prior,
            });
        }
        let Some(session) = self.session.as_ref() else {
            return Err(PlayerError::InvalidState {
                op: "seek",
                state: prior,
            });
        };
        let Some(pipeline) = session.pipeline.as_ref() else {
            return Err(PlayerError::InvalidState {
                op: "seek",
                state: prior,
            });
        };

        let requested = if seconds.is_finite() {
            (seconds * 1000.0).round() as i64
        } else {
            0
        };
        let target_ms = match session.duration_ms() {
            Some(duration) => requested.clamp(0, duration.max(0)),
            None => requested.max(0),
        };
        info!("{} 🎯 Seek 到: {}ms", log_ctx(), target_ms);

        if !self.shared.transition(prior, PlaybackState::Seeking) {
            return Err(PlayerError::InvalidState {
                op: "seek",
                state: self.shared.state(),
            });
        }
        let previous_ms = self.shared.clock.now();

        // ========== 步骤1: 新序号 + 清空所有队列 ==========
        // 播放中 seek：时钟冻结在目标位置，直到新位置的第一帧输出
        let hold = (prior == PlaybackState::Playing).then(|| {
            if pipeline.kinds().contains(&MediaKind::Video) {
                MediaKind::Video
            } else {
                MediaKind::Audio
            }
        });
        let serial = self.shared.begin_serial(hold);
        let dropped = pipeline.flush_to(serial);
        debug!(
            "{} 🧹 Seek 清空队列: {} 项 (serial={})",
            log_ctx(),
            dropped,
            serial
        );

        // ========== 步骤2: 帧过滤和流结束跟踪切换到新序号 ==========
        self.shared.install_seek_filter(serial, target_ms);
        self.shared.expect_streams(serial, pipeline.kinds());
        self.shared.clock.set_time(target_ms);

        // ========== 步骤3: 解封装线程定位并确认 ==========
        let result = pipeline
            .demuxer
            .seek(target_ms, serial, self.config.worker.seek_ack_timeout());
        self.shared.sync.lock().reset();

        if let Err(e) = &result {
            // 解封装线程从原位置继续读取
            error!("{} ❌ Seek 失败: {}", log_ctx(), e);
            self.shared.install_seek_filter(serial, previous_ms);
            self.shared.clock.set_time(previous_ms);
            self.shared.release_hold(serial);
        } else if prior == PlaybackState::Paused {
            self.shared.signal.request_preview(serial);
        }

        if !self.shared.transition(PlaybackState::Seeking, prior) {
            return Err(PlayerError::InvalidState {
                op: "seek",
                state: self.shared.state(),
            });
        }
        result?;
        let position = target_ms as f64 / 1000.0;
        self.shared
            .events
            .emit(PlayerEvent::SeekCompleted { position });
        info!("{} ✅ Seek 完成: {:.3}s", log_ctx(), position);
        Ok(())
    }

    /// 相对当前位置跳转（秒，可为负）
    pub fn seek_relative(&mut self, delta_seconds: f64) -> Result<()> {
        let target = self.current_position() + delta_seconds;
        self.seek(target)
    }

    /// 逐帧步进：暂停并前进/后退一个视频帧
    pub fn frame_step(&mut self, direction: StepDirection) -> Result<()> {
        if self.shared.state() == PlaybackState::Playing {
            self.pause()?;
        }
        let step_ms = self
            .session
            .as_ref()
            .and_then(|s| s.stream(MediaKind::Video))
            .and_then(|s| s.descriptor.frame_duration_ms())
            .unwrap_or_else(|| {
                let fps = self.config.playback.frame_step_fallback_fps;
                if fps > 0.0 {
                    (1000.0 / fps).round() as i64
                } else {
                    DEFAULT_FRAME_MS
                }
            });
        let now = self.shared.clock.now();
        let target = match direction {
            StepDirection::Forward => now + step_ms,
            StepDirection::Backward => (now - step_ms).max(0),
        };
        debug!("{} ⏭️ 逐帧步进 {:?}: {}ms -> {}ms", log_ctx(), direction, now, target);
        self.seek(target as f64 / 1000.0)
    }

    /// 停止：工作线程全部退出、输出设备释放，保留媒体描述和数据源
    pub fn stop(&mut self) -> Result<()> {
        let state = self.shared.state();
        match state {
            PlaybackState::Stopped => return Ok(()),
            PlaybackState::Ready | PlaybackState::Playing | PlaybackState::Paused => {}
            other => return Err(PlayerError::InvalidState { op: "stop", state: other }),
        }
        info!("{} ⏹️ 停止播放", log_ctx());
        let position = self.current_position();
        self.teardown();
        self.persist_position(position);
        self.shared.clock.stop();
        if let Some(session) = self.session.as_mut() {
            session.stopped_position = position;
        }
        self.shared.set_state(PlaybackState::Stopped);
        Ok(())
    }

    /// 关闭当前媒体，回到 Idle（出错后只能重新 open）
    pub fn close(&mut self) -> Result<()> {
        let state = self.shared.state();
        match state {
            PlaybackState::Idle => return Ok(()),
            PlaybackState::Error(_) => {
                return Err(PlayerError::InvalidState { op: "close", state })
            }
            PlaybackState::Stopped => {}
            _ => self.stop()?,
        }
        if let Some(session) = self.session.take() {
            info!("{} 📕 关闭媒体: {}", log_ctx(), session.source.as_str());
        }
        self.shared.clear_media();
        self.shared.clock.stop();
        self.shared.set_state(PlaybackState::Idle);
        Ok(())
    }

    /// 停止当前流水线并把数据源停放到会话中
    fn teardown(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        self.shared.signal.halt();
        if let Some(pipeline) = session.pipeline.take() {
            session.parked = pipeline.shutdown();
        }
    }

    /// open 之前丢弃旧会话（活动状态下先保存位置）
    fn discard_session(&mut self) {
        if self.session.is_none() {
            return;
        }
        let state = self.shared.state();
        if state.is_active() {
            let position = self.current_position();
            self.persist_position(position);
        }
        self.teardown();
        self.session = None;
    }

    fn persist_position(&self, seconds: f64) {
        let (Some(store), Some(session)) = (self.store.as_ref(), self.session.as_ref()) else {
            return;
        };
        match store.save_position(&session.media_id, seconds) {
            Ok(()) => debug!("{} 💾 保存播放位置: {:.3}s", log_ctx(), seconds),
            Err(e) => warn!("{} ⚠️ 保存播放位置失败: {}", log_ctx(), e),
        }
    }

    pub fn volume(&self) -> f32 {
        self.shared.volume()
    }

    /// 设置音量（0.0 ~ 1.0）
    pub fn set_volume(&mut self, volume: f32) {
        self.shared.set_volume(volume);
        self.config.audio.volume = self.shared.volume();
    }

    pub fn is_muted(&self) -> bool {
        self.shared.is_muted()
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.shared.set_muted(muted);
        self.config.audio.muted = muted;
    }

    pub fn playback_speed(&self) -> f64 {
        self.config.playback.speed
    }

    /// 设置播放速度（0.25 ~ 4.0，非正数恢复 1.0）
    ///
    /// 没有时间伸缩：速度不为 1.0 时音频静音，主时钟切换到墙钟。
    pub fn set_playback_speed(&mut self, speed: f64) {
        let speed = normalize_speed(speed);
        self.config.playback.speed = speed;
        self.shared.clock.set_rate(speed);
        let has_audio = self
            .session
            .as_ref()
            .is_some_and(|s| s.audio_format.is_some());
        self.shared
            .clock
            .set_master(if has_audio && self.shared.clock.is_normal_rate() {
                ClockMaster::Audio
            } else {
                ClockMaster::Wall
            });
        info!("{} ⏩ 播放速度: {:.2}x", log_ctx(), speed);
    }

    pub fn faster(&mut self) {
        self.set_playback_speed(self.config.playback.speed + SPEED_STEP);
    }

    pub fn slower(&mut self) {
        self.set_playback_speed(self.config.playback.speed - SPEED_STEP);
    }

    pub fn normal_speed(&mut self) {
        self.set_playback_speed(1.0);
    }

    /// 把最近呈现的视频帧保存为图片
    pub fn screenshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let frame = self.shared.last_video().ok_or(PlayerError::NoVideoFrame)?;
        let rgb = match frame.format {
            PixelFormat::RGBA => RgbaImage::from_raw(frame.width, frame.height, frame.data.clone())
                .map(|image| DynamicImage::ImageRgba8(image).to_rgb8()),
            PixelFormat::RGB => RgbImage::from_raw(frame.width, frame.height, frame.data.clone()),
            other => {
                return Err(PlayerError::Other(format!(
                    "截图不支持的像素格式: {:?}",
                    other
                )))
            }
        }
        .ok_or_else(|| PlayerError::Other("视频帧数据不完整".into()))?;

        // 格式由扩展名决定（png/ppm/...）
        let path = path.as_ref();
        rgb.save(path)?;
        info!(
            "{} 📸 截图已保存: {} ({}x{}, PTS={}ms)",
            log_ctx(),
            path.display(),
            frame.width,
            frame.height,
            frame.pts
        );
        Ok(())
    }

    /// 缓冲与呈现统计
    pub fn stats(&self) -> PlaybackStats {
        let pipeline = self.session.as_ref().and_then(|s| s.pipeline.as_ref());
        let (video_packets, video_frames) = pipeline
            .map(|p| p.queue_lengths(MediaKind::Video))
            .unwrap_or((0, 0));
        let (audio_packets, audio_frames) = pipeline
            .map(|p| p.queue_lengths(MediaKind::Audio))
            .unwrap_or((0, 0));
        let counters = &self.shared.counters;
        let sync = self.shared.sync.lock();
        let sync_stats = sync.stats();
        PlaybackStats {
            video_packets,
            audio_packets,
            video_frames,
            audio_frames,
            presented_video: counters.video_frames.load(Ordering::Relaxed),
            presented_audio: counters.audio_frames.load(Ordering::Relaxed),
            dropped_video: counters.dropped_video.load(Ordering::Relaxed),
            resyncs: sync_stats.resyncs,
            average_drift_ms: sync.average_drift_ms(),
        }
    }
}

impl Drop for PlaybackManager {
    fn drop(&mut self) {
        if self.session.is_some() {
            info!("{} 🧹 PlaybackManager 被 drop，停止所有线程", log_ctx());
            self.discard_session();
        }
    }
}
