//! 呈现线程：把解码好的帧按主时钟送到输出设备。
//!
//! 音频呈现线程同时负责推算音频主时钟：记录每段写入设备的采样对应的 PTS，
//! 再用设备实际播放的帧数换算出"此刻正在播放的 PTS"。

use crate::core::{
    log_ctx, AudioFrame, ClockMaster, ErrorKind, Frame, MediaKind, PopError, SinkError, Stage,
    StreamItem, SyncDecision, VideoFrame,
};
use crate::player::audio_output::AudioSink;
use crate::player::decoder_thread::FrameQueue;
use crate::player::session::SessionShared;
use crate::player::video_output::VideoSink;
use log::{debug, error, info};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 呈现线程句柄
pub struct PresenterThread {
    kind: MediaKind,
    handle: Option<JoinHandle<()>>,
}

impl PresenterThread {
    pub fn spawn_audio(
        sink: Box<dyn AudioSink>,
        frames: Arc<FrameQueue>,
        shared: Arc<SessionShared>,
        poll_interval: Duration,
    ) -> Self {
        let presenter = AudioPresenter {
            serial: shared.signal.serial(),
            sink,
            frames,
            shared,
            poll_interval,
            base_played: 0,
            written: 0,
            timeline: VecDeque::new(),
            pending: None,
            end_of_stream: false,
            finished_reported: false,
            sink_paused: false,
            scaled: false,
            scratch: Vec::new(),
        };
        Self::spawn(MediaKind::Audio, move || presenter.run())
    }

    pub fn spawn_video(
        sink: Box<dyn VideoSink>,
        frames: Arc<FrameQueue>,
        shared: Arc<SessionShared>,
        poll_interval: Duration,
    ) -> Self {
        let presenter = VideoPresenter {
            serial: shared.signal.serial(),
            sink,
            frames,
            shared,
            poll_interval,
            pending: None,
            last_pts: None,
            end_of_stream: false,
            finished_reported: false,
            presented: 0,
        };
        Self::spawn(MediaKind::Video, move || presenter.run())
    }

    fn spawn(kind: MediaKind, body: impl FnOnce() + Send + 'static) -> Self {
        let handle = thread::Builder::new()
            .name(format!("{}-presenter", kind))
            .spawn(body)
            .ok();
        if handle.is_none() {
            error!("{} ❌ 无法创建{}呈现线程", log_ctx(), kind);
        }
        Self { kind, handle }
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("{} ❌ {}呈现线程 panic", log_ctx(), self.kind);
            }
        }
    }
}

impl Drop for PresenterThread {
    fn drop(&mut self) {
        self.join();
    }
}

/// 写入设备的一段连续采样
#[derive(Debug, Clone, Copy)]
struct Segment {
    start: u64,
    frames: u64,
    pts_us: i64,
    rate: u32,
}

struct AudioPresenter {
    sink: Box<dyn AudioSink>,
    frames: Arc<FrameQueue>,
    shared: Arc<SessionShared>,
    poll_interval: Duration,
    serial: u64,
    /// 上次 clear 时设备的 played_frames
    base_played: u64,
    /// 上次 clear 以来写入的帧数
    written: u64,
    timeline: VecDeque<Segment>,
    /// 正在写入的帧和已写入的采样帧偏移
    pending: Option<(AudioFrame, usize)>,
    end_of_stream: bool,
    finished_reported: bool,
    sink_paused: bool,
    /// 非正常速度：不写设备，按时钟静默消费
    scaled: bool,
    scratch: Vec<f32>,
}

impl AudioPresenter {
    fn run(mut self) {
        info!("{} 🔊 音频呈现线程启动: {:?}", log_ctx(), self.sink.format());
        loop {
            if self.shared.signal.is_halted() {
                break;
            }
            let current = self.shared.signal.serial();
            if current > self.serial {
                self.reset_to(current);
            }
            if self.shared.signal.is_paused() {
                if !self.sink_paused {
                    self.sink.pause();
                    self.sink_paused = true;
                }
                thread::sleep(self.poll_interval);
                continue;
            }
            if self.sink_paused {
                self.sink.resume();
                self.sink_paused = false;
            }
            if self.pending.is_some()
                && self.shared.hold_releaser(self.serial) == Some(MediaKind::Video)
            {
                // 等视频先输出新位置的第一帧
                thread::sleep(self.poll_interval);
                continue;
            }
            let scaled = !self.shared.clock.is_normal_rate();
            if scaled != self.scaled {
                debug!("{} 🔇 音频输出{}", log_ctx(), if scaled { "静音（变速）" } else { "恢复" });
                self.clear_output();
                self.scaled = scaled;
            }

            self.publish_clock();

            if self.pending.is_none() {
                if self.end_of_stream && !self.finished_reported && self.drained() {
                    self.finished_reported = true;
                    self.release_hold();
                    self.shared.stream_finished(MediaKind::Audio, self.serial);
                }
                match self.frames.wait_and_pop_stamped(self.poll_interval) {
                    Ok((serial, item)) => self.accept(serial, item),
                    Err(PopError::Timeout) | Err(PopError::Flushed) => {}
                    Err(PopError::Closed) => break,
                }
                continue;
            }
            if self.scaled {
                self.skip_pending();
                continue;
            }

            match self.write_pending() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    self.shared
                        .fail(ErrorKind::SinkError, Stage::AudioSink, e.to_string());
                    break;
                }
            }
        }
        info!("{} 🛑 音频呈现线程退出", log_ctx());
    }

    /// seek 之后：丢弃设备中尚未播放的旧位置采样
    fn reset_to(&mut self, serial: u64) {
        debug!("{} 🧹 音频呈现切换 serial {} -> {}", log_ctx(), self.serial, serial);
        self.clear_output();
        self.pending = None;
        self.end_of_stream = false;
        self.finished_reported = false;
        self.serial = serial;
    }

    fn clear_output(&mut self) {
        self.sink.clear();
        self.base_played = self.sink.played_frames();
        self.written = 0;
        self.timeline.clear();
    }

    /// 由音频负责放行时，解除 seek 后的时钟冻结
    fn release_hold(&self) {
        if self.shared.hold_releaser(self.serial) == Some(MediaKind::Audio) {
            self.shared.release_hold(self.serial);
        }
    }

    fn accept(&mut self, serial: u64, item: StreamItem<Frame>) {
        if serial < self.serial {
            return;
        }
        if serial > self.serial {
            self.reset_to(serial);
        }
        match item {
            StreamItem::Data(Frame::Audio(frame)) => self.pending = Some((frame, 0)),
            StreamItem::Data(Frame::Video(_)) => {}
            StreamItem::EndOfStream => self.end_of_stream = true,
        }
    }

    /// 写入当前帧的剩余部分；返回 Ok(false) 表示流水线已停止
    fn write_pending(&mut self) -> Result<bool, SinkError> {
        let Some((frame, offset)) = self.pending.as_ref() else {
            return Ok(true);
        };
        let channels = frame.channels.max(1) as usize;
        let rate = frame.sample_rate.max(1);
        let offset = *offset;
        let remaining = &frame.data[(offset * channels).min(frame.data.len())..];
        let gain = self.shared.gain();

        self.scratch.clear();
        self.scratch.extend(remaining.iter().map(|s| s * gain));

        let sink = &mut self.sink;
        let scratch = &self.scratch;
        let poll = self.poll_interval;
        let accepted = match self.shared.present(|| sink.write(scratch, poll)) {
            Some(result) => result?,
            None => return Ok(false),
        };

        if accepted > 0 {
            self.release_hold();
            let pts_us = frame.pts * 1000 + (offset as i64 * 1_000_000) / rate as i64;
            self.timeline.push_back(Segment {
                start: self.written,
                frames: accepted as u64,
                pts_us,
                rate,
            });
            self.written += accepted as u64;
            self.shared
                .counters
                .audio_frames
                .fetch_add(accepted as u64, Ordering::Relaxed);
        }

        let total = frame.frames();
        let next_offset = offset + accepted;
        if next_offset >= total {
            self.pending = None;
            self.shared.sync.lock().note_presented();
        } else if let Some((_, offset)) = self.pending.as_mut() {
            *offset = next_offset;
        }
        Ok(true)
    }

    /// 变速时跟着时钟丢弃已过期的音频帧
    fn skip_pending(&mut self) {
        let Some((frame, _)) = self.pending.as_ref() else {
            return;
        };
        let ahead = frame.pts + frame.duration - self.shared.clock.now();
        if ahead > 0 && self.shared.hold_releaser(self.serial) != Some(MediaKind::Audio) {
            thread::sleep(Duration::from_millis(ahead as u64).min(self.poll_interval));
            return;
        }
        self.pending = None;
        self.release_hold();
        self.shared.sync.lock().note_presented();
    }

    fn played_since_reset(&mut self) -> u64 {
        self.sink.played_frames().saturating_sub(self.base_played)
    }

    fn drained(&mut self) -> bool {
        self.played_since_reset() >= self.written
    }

    /// 用设备实际播放位置校准主时钟
    fn publish_clock(&mut self) {
        if self.shared.clock.master() != ClockMaster::Audio || self.timeline.is_empty() {
            return;
        }
        let played = self.played_since_reset();
        if played >= self.written {
            // 设备缓冲已空（音频先于视频结束或欠载），由墙钟继续外推
            return;
        }
        while self.timeline.len() > 1 {
            let front = self.timeline[0];
            if front.start + front.frames <= played {
                self.timeline.pop_front();
            } else {
                break;
            }
        }
        let Some(segment) = self.timeline.front() else {
            return;
        };
        let within = played.saturating_sub(segment.start).min(segment.frames);
        let pts_us = segment.pts_us + (within as i64 * 1_000_000) / segment.rate as i64;
        self.shared.clock.anchor(pts_us / 1000);
    }
}

struct VideoPresenter {
    sink: Box<dyn VideoSink>,
    frames: Arc<FrameQueue>,
    shared: Arc<SessionShared>,
    poll_interval: Duration,
    serial: u64,
    pending: Option<Arc<VideoFrame>>,
    /// 当前序号下最后呈现的 PTS（保证单调）
    last_pts: Option<i64>,
    end_of_stream: bool,
    finished_reported: bool,
    presented: u64,
}

impl VideoPresenter {
    fn run(mut self) {
        info!(
            "{} 🖥️ 视频呈现线程启动 (刷新间隔 {:?})",
            log_ctx(),
            self.sink.refresh_interval()
        );
        loop {
            if self.shared.signal.is_halted() {
                break;
            }
            let current = self.shared.signal.serial();
            if current > self.serial {
                self.reset_to(current);
            }

            let Some(frame) = self.pending.clone() else {
                if self.end_of_stream && !self.finished_reported {
                    self.finished_reported = true;
                    self.shared.release_hold(self.serial);
                    self.shared.stream_finished(MediaKind::Video, self.serial);
                }
                match self.frames.wait_and_pop_stamped(self.poll_interval) {
                    Ok((serial, item)) => self.accept(serial, item),
                    Err(PopError::Timeout) | Err(PopError::Flushed) => {}
                    Err(PopError::Closed) => break,
                }
                continue;
            };

            if self.shared.signal.is_paused() {
                // 暂停时 seek：呈现一帧预览
                if self.shared.signal.take_preview(self.serial) {
                    if !self.present(frame) {
                        break;
                    }
                } else {
                    thread::sleep(self.poll_interval);
                }
                continue;
            }

            if self.shared.hold_releaser(self.serial) == Some(MediaKind::Video) {
                // seek 后的第一帧：立即输出，时钟从这里开始走
                if !self.present(frame) {
                    break;
                }
                self.shared.release_hold(self.serial);
                continue;
            }

            if let Some(last) = self.last_pts {
                if frame.pts < last {
                    debug!(
                        "{} 🗑️ 丢弃乱序视频帧: PTS={}ms < {}ms",
                        log_ctx(),
                        frame.pts,
                        last
                    );
                    self.discard();
                    continue;
                }
            }

            let now = self.shared.clock.now();
            let decision = self.shared.sync.lock().decide(MediaKind::Video, frame.pts, now);
            match decision {
                SyncDecision::Wait(delay) => self.wait(delay),
                SyncDecision::Present | SyncDecision::Resync => {
                    if !self.present(frame) {
                        break;
                    }
                }
                SyncDecision::Drop => self.discard(),
            }
        }
        info!(
            "{} 🛑 视频呈现线程退出（呈现 {} 帧）",
            log_ctx(),
            self.presented
        );
    }

    fn reset_to(&mut self, serial: u64) {
        debug!("{} 🧹 视频呈现切换 serial {} -> {}", log_ctx(), self.serial, serial);
        self.serial = serial;
        self.pending = None;
        self.last_pts = None;
        self.end_of_stream = false;
        self.finished_reported = false;
    }

    fn accept(&mut self, serial: u64, item: StreamItem<Frame>) {
        if serial < self.serial {
            return;
        }
        if serial > self.serial {
            self.reset_to(serial);
        }
        match item {
            StreamItem::Data(Frame::Video(frame)) => self.pending = Some(Arc::new(frame)),
            StreamItem::Data(Frame::Audio(_)) => {}
            StreamItem::EndOfStream => self.end_of_stream = true,
        }
    }

    /// 分段等待，期间响应 seek/pause/stop
    fn wait(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        loop {
            let signal = &self.shared.signal;
            if signal.is_halted() || signal.is_paused() || signal.serial() != self.serial {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep((deadline - now).min(self.poll_interval));
        }
    }

    fn discard(&mut self) {
        self.pending = None;
        self.shared.counters.dropped_video.fetch_add(1, Ordering::Relaxed);
        self.shared.sync.lock().note_dropped();
    }

    /// 呈现一帧；返回 false 表示线程应退出
    fn present(&mut self, frame: Arc<VideoFrame>) -> bool {
        self.pending = None;
        let sink = &mut self.sink;
        let signal = &self.shared.signal;
        let serial = self.serial;
        // 闸门内核对序号：seek 一旦开始，旧位置的帧不会再输出
        let presented = self
            .shared
            .present(|| (signal.serial() == serial).then(|| sink.present(&frame)));
        match presented {
            None => false,
            Some(None) => {
                debug!("{} 🗑️ 丢弃旧序号视频帧: PTS={}ms", log_ctx(), frame.pts);
                true
            }
            Some(Some(Err(e))) => {
                self.shared
                    .fail(ErrorKind::SinkError, Stage::VideoSink, e.to_string());
                false
            }
            Some(Some(Ok(()))) => {
                self.presented += 1;
                if self.presented <= 5 || self.presented % 100 == 0 {
                    debug!(
                        "{} 🖼️ 呈现视频帧 #{} PTS={}ms 时钟={}ms",
                        log_ctx(),
                        self.presented,
                        frame.pts,
                        self.shared.clock.now()
                    );
                }
                self.last_pts = Some(frame.pts);
                self.shared.counters.video_frames.fetch_add(1, Ordering::Relaxed);
                self.shared.sync.lock().note_presented();
                self.shared.store_last_video(frame);
                true
            }
        }
    }
}
