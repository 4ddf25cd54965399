//! 一次播放会话中各工作线程共享的状态。
//!
//! 控制器、解封装线程、解码线程和呈现线程都持有同一个 `SessionShared`。
//! 状态变更、致命错误和流结束都在这里汇总，保证每次失败只上报一次。

use crate::core::config::SyncConfig;
use crate::core::{
    log_ctx, AudioFrame, ErrorKind, Frame, MediaKind, PlaybackClock, PlaybackState, Stage,
    Synchronizer, VideoFrame,
};
use crate::player::events::{EventBus, PlayerEvent};
use log::{debug, error, info};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// 工作线程的运行信号
///
/// `serial` 是当前 flush 序号：控制器每次 seek 都会递增，
/// 工作线程据此识别并丢弃旧数据。
#[derive(Default)]
pub struct PipelineSignal {
    halted: AtomicBool,
    paused: AtomicBool,
    serial: AtomicU64,
    /// 暂停状态下允许呈现一帧预览的序号（0 表示无）
    preview: AtomicU64,
}

impl PipelineSignal {
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    /// 递增序号并返回新值
    pub fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn request_preview(&self, serial: u64) {
        self.preview.store(serial, Ordering::Release);
    }

    /// 取走预览许可（仅当序号匹配时）
    pub fn take_preview(&self, serial: u64) -> bool {
        serial != 0
            && self
                .preview
                .compare_exchange(serial, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// 新流水线启动前复位（序号保持递增）
    fn rearm(&self) {
        self.halted.store(false, Ordering::Release);
        self.paused.store(true, Ordering::Release);
        self.preview.store(0, Ordering::Release);
    }
}

/// seek 后的帧过滤：同序号下结束时间不晚于目标位置的帧全部丢弃
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekFilter {
    pub serial: u64,
    pub target_ms: i64,
}

impl SeekFilter {
    /// 返回应该保留的帧；跨越目标位置的音频帧会截掉目标之前的部分
    pub fn apply(&self, serial: u64, frame: Frame) -> Option<Frame> {
        if serial != self.serial {
            return Some(frame);
        }
        let end = frame.pts() + frame.duration().max(1);
        if end <= self.target_ms {
            return None;
        }
        match frame {
            Frame::Audio(audio) if audio.pts < self.target_ms => {
                Some(Frame::Audio(trim_audio_front(audio, self.target_ms)))
            }
            other => Some(other),
        }
    }
}

fn trim_audio_front(mut frame: AudioFrame, target_ms: i64) -> AudioFrame {
    let channels = frame.channels.max(1) as usize;
    let skip_ms = target_ms - frame.pts;
    let skip = ((skip_ms as f64 * frame.sample_rate as f64 / 1000.0).round() as usize)
        .min(frame.frames());
    frame.data.drain(..skip * channels);
    frame.pts = target_ms;
    frame.duration = (frame.duration - skip_ms).max(0);
    frame
}

/// 呈现计数
#[derive(Default)]
pub struct PresentCounters {
    pub video_frames: AtomicU64,
    pub audio_frames: AtomicU64,
    pub dropped_video: AtomicU64,
}

pub struct SessionShared {
    state: Mutex<PlaybackState>,
    pub events: EventBus,
    pub signal: PipelineSignal,
    pub clock: PlaybackClock,
    pub sync: Mutex<Synchronizer>,
    seek_filter: Mutex<Option<SeekFilter>>,
    /// 当前序号下尚未播完的流
    pending_streams: Mutex<(u64, HashSet<MediaKind>)>,
    last_video: Mutex<Option<Arc<VideoFrame>>>,
    /// 呈现与致命错误互斥：失败上报之后不会再有帧被呈现
    present_gate: Mutex<()>,
    /// 播放中 seek 后冻结时钟，直到指定流呈现出新序号的第一帧：(序号, 放行的流)
    seek_hold: Mutex<Option<(u64, MediaKind)>>,
    volume_bits: AtomicU32,
    muted: AtomicBool,
    pub counters: PresentCounters,
}

impl SessionShared {
    pub fn new(sync: SyncConfig, volume: f32, muted: bool) -> Self {
        Self {
            state: Mutex::new(PlaybackState::Idle),
            events: EventBus::new(),
            signal: PipelineSignal::default(),
            clock: PlaybackClock::new(),
            sync: Mutex::new(Synchronizer::new(sync)),
            seek_filter: Mutex::new(None),
            pending_streams: Mutex::new((0, HashSet::new())),
            last_video: Mutex::new(None),
            present_gate: Mutex::new(()),
            seek_hold: Mutex::new(None),
            volume_bits: AtomicU32::new(volume.clamp(0.0, 1.0).to_bits()),
            muted: AtomicBool::new(muted),
            counters: PresentCounters::default(),
        }
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.lock()
    }

    /// 切换状态并广播 StateChanged，返回旧状态
    pub fn set_state(&self, next: PlaybackState) -> PlaybackState {
        let mut state = self.state.lock();
        let previous = *state;
        if previous != next {
            *state = next;
            info!("{} 🔄 状态变化: {:?} -> {:?}", log_ctx(), previous, next);
            self.events.emit(PlayerEvent::StateChanged {
                from: previous,
                to: next,
            });
        }
        previous
    }

    /// 仅当当前状态为 from 时切换（工作线程可能已经改写了状态）
    pub fn transition(&self, from: PlaybackState, to: PlaybackState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        if from != to {
            *state = to;
            info!("{} 🔄 状态变化: {:?} -> {:?}", log_ctx(), from, to);
            self.events.emit(PlayerEvent::StateChanged { from, to });
        }
        true
    }

    /// 上报致命错误
    ///
    /// 只有第一次调用生效：停止所有工作线程、冻结时钟、进入 Error 状态并发送一次 Fatal 事件。
    /// 非活动状态（已停止/已出错）下的失败被忽略。
    pub fn fail(&self, kind: ErrorKind, stage: Stage, message: impl Into<String>) -> bool {
        let message = message.into();
        let mut state = self.state.lock();
        if !state.is_active() && *state != PlaybackState::Opening {
            return false;
        }
        {
            let _gate = self.present_gate.lock();
            self.signal.halt();
        }
        self.clock.pause();
        let previous = *state;
        *state = PlaybackState::Error(kind);
        error!(
            "{} ❌ 致命错误 [{:?} @ {:?}]: {}",
            log_ctx(),
            kind,
            stage,
            message
        );
        self.events.emit(PlayerEvent::StateChanged {
            from: previous,
            to: PlaybackState::Error(kind),
        });
        self.events.emit(PlayerEvent::Fatal {
            kind,
            stage,
            message,
        });
        true
    }

    /// 在呈现闸门内执行输出；流水线已停止时返回 None
    pub fn present<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let _gate = self.present_gate.lock();
        if self.signal.is_halted() {
            None
        } else {
            Some(f())
        }
    }

    /// 进入新序号并设置（或清除）时钟冻结
    ///
    /// 序号在呈现闸门内递增：返回之后不会再有旧序号的帧被呈现。
    pub fn begin_serial(&self, hold: Option<MediaKind>) -> u64 {
        let _gate = self.present_gate.lock();
        let mut held = self.seek_hold.lock();
        let serial = self.signal.next_serial();
        *held = hold.map(|kind| (serial, kind));
        if held.is_some() {
            self.clock.pause();
        }
        serial
    }

    /// 当前冻结时钟、等待放行的流（仅当序号匹配时）
    pub fn hold_releaser(&self, serial: u64) -> Option<MediaKind> {
        match *self.seek_hold.lock() {
            Some((held, kind)) if held == serial => Some(kind),
            _ => None,
        }
    }

    /// 新序号的第一帧已输出：解除冻结，未暂停时时钟从目标位置开始走
    pub fn release_hold(&self, serial: u64) {
        let mut held = self.seek_hold.lock();
        if !matches!(*held, Some((s, _)) if s == serial) {
            return;
        }
        *held = None;
        if !self.signal.is_paused() && !self.signal.is_halted() && self.signal.serial() == serial {
            debug!("{} ⏱️ 新位置首帧已输出，时钟继续 (serial={})", log_ctx(), serial);
            self.clock.play();
        }
    }

    /// 暂停输出并冻结时钟
    pub fn freeze(&self) {
        let _held = self.seek_hold.lock();
        self.signal.set_paused(true);
        self.clock.pause();
    }

    /// 恢复输出；seek 冻结尚未解除时时钟等待首帧
    pub fn resume(&self) {
        let held = self.seek_hold.lock();
        self.signal.set_paused(false);
        let waiting = matches!(*held, Some((s, _)) if s == self.signal.serial());
        if !waiting {
            self.clock.play();
        }
    }

    /// 新会话/新流水线开始前的复位
    pub fn rearm(&self) {
        self.signal.rearm();
        self.sync.lock().reset();
        *self.seek_filter.lock() = None;
        *self.seek_hold.lock() = None;
    }

    /// 会话结束时清理帧缓存
    pub fn clear_media(&self) {
        *self.last_video.lock() = None;
        *self.seek_filter.lock() = None;
        *self.seek_hold.lock() = None;
        self.pending_streams.lock().1.clear();
        self.counters.video_frames.store(0, Ordering::Relaxed);
        self.counters.audio_frames.store(0, Ordering::Relaxed);
        self.counters.dropped_video.store(0, Ordering::Relaxed);
    }

    pub fn install_seek_filter(&self, serial: u64, target_ms: i64) {
        *self.seek_filter.lock() = Some(SeekFilter { serial, target_ms });
    }

    pub fn seek_filter(&self) -> Option<SeekFilter> {
        *self.seek_filter.lock()
    }

    /// 记录当前序号下需要播完的流
    pub fn expect_streams(&self, serial: u64, kinds: impl IntoIterator<Item = MediaKind>) {
        *self.pending_streams.lock() = (serial, kinds.into_iter().collect());
    }

    /// 当前序号下所有流是否都已播完
    pub fn media_finished(&self) -> bool {
        let pending = self.pending_streams.lock();
        pending.0 == self.signal.serial() && pending.1.is_empty()
    }

    /// 呈现线程回报某条流已播完；全部播完时转入 Paused 并广播 EndOfMedia
    pub fn stream_finished(&self, kind: MediaKind, serial: u64) {
        let all_done = {
            let mut pending = self.pending_streams.lock();
            if pending.0 != serial || !pending.1.remove(&kind) {
                return;
            }
            info!("{} 🏁 {} 流播放完毕 (serial={})", log_ctx(), kind, serial);
            pending.1.is_empty()
        };
        if !all_done {
            return;
        }
        let mut state = self.state.lock();
        if *state != PlaybackState::Playing || self.signal.serial() != serial {
            return;
        }
        self.signal.set_paused(true);
        self.clock.pause();
        *state = PlaybackState::Paused;
        info!("{} 🏁 媒体播放结束，进入 Paused", log_ctx());
        self.events.emit(PlayerEvent::StateChanged {
            from: PlaybackState::Playing,
            to: PlaybackState::Paused,
        });
        self.events.emit(PlayerEvent::EndOfMedia);
    }

    pub fn store_last_video(&self, frame: Arc<VideoFrame>) {
        *self.last_video.lock() = Some(frame);
    }

    pub fn last_video(&self) -> Option<Arc<VideoFrame>> {
        self.last_video.lock().clone()
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume_bits
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    /// 输出增益（静音时为 0）
    pub fn gain(&self) -> f32 {
        if self.is_muted() {
            0.0
        } else {
            self.volume()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> SessionShared {
        SessionShared::new(SyncConfig::default(), 1.0, false)
    }

    fn audio(pts: i64, frames: usize) -> Frame {
        Frame::Audio(AudioFrame {
            pts,
            duration: frames as i64 * 1000 / 1000,
            sample_rate: 1000,
            channels: 2,
            data: vec![0.5; frames * 2],
        })
    }

    #[test]
    fn fatal_is_reported_once() {
        let shared = shared();
        let events = shared.events.subscribe();
        shared.set_state(PlaybackState::Playing);
        assert!(shared.fail(ErrorKind::SinkError, Stage::AudioSink, "gone"));
        assert!(!shared.fail(ErrorKind::DecodeFailed, Stage::Decode(MediaKind::Video), "late"));
        assert_eq!(shared.state(), PlaybackState::Error(ErrorKind::SinkError));
        assert!(shared.signal.is_halted());

        let fatals = events
            .try_iter()
            .filter(|e| matches!(e, PlayerEvent::Fatal { .. }))
            .count();
        assert_eq!(fatals, 1);
        assert!(shared.present(|| ()).is_none());
    }

    #[test]
    fn seek_filter_drops_frames_before_target_and_trims_audio() {
        let filter = SeekFilter {
            serial: 2,
            target_ms: 1000,
        };
        assert!(filter.apply(2, audio(0, 500)).is_none());
        let kept = filter.apply(2, audio(900, 200)).unwrap();
        match kept {
            Frame::Audio(a) => {
                assert_eq!(a.pts, 1000);
                assert_eq!(a.frames(), 100);
                assert_eq!(a.duration, 100);
            }
            Frame::Video(_) => unreachable!(),
        }
        // 其他序号不受影响
        assert!(filter.apply(1, audio(0, 10)).is_some());
    }

    #[test]
    fn end_of_media_after_all_streams_finish() {
        let shared = shared();
        shared.set_state(PlaybackState::Playing);
        let events = shared.events.subscribe();
        shared.expect_streams(0, [MediaKind::Audio, MediaKind::Video]);

        shared.stream_finished(MediaKind::Video, 0);
        assert_eq!(shared.state(), PlaybackState::Playing);
        // 旧序号的回报被忽略
        shared.stream_finished(MediaKind::Audio, 7);
        assert_eq!(shared.state(), PlaybackState::Playing);

        assert!(!shared.media_finished());
        shared.stream_finished(MediaKind::Audio, 0);
        assert_eq!(shared.state(), PlaybackState::Paused);
        assert!(shared.media_finished());
        assert!(events.try_iter().any(|e| e == PlayerEvent::EndOfMedia));
    }

    #[test]
    fn transition_requires_expected_state() {
        let shared = shared();
        shared.set_state(PlaybackState::Playing);
        shared.fail(ErrorKind::DemuxFailed, Stage::Demux, "io");
        assert!(!shared.transition(PlaybackState::Playing, PlaybackState::Paused));
        assert_eq!(shared.state(), PlaybackState::Error(ErrorKind::DemuxFailed));
        assert!(shared.transition(
            PlaybackState::Error(ErrorKind::DemuxFailed),
            PlaybackState::Opening
        ));
    }

    #[test]
    fn preview_permit_is_single_use() {
        let signal = PipelineSignal::default();
        let serial = signal.next_serial();
        signal.request_preview(serial);
        assert!(!signal.take_preview(serial + 1));
        assert!(signal.take_preview(serial));
        assert!(!signal.take_preview(serial));
    }

    #[test]
    fn seek_hold_freezes_clock_until_first_frame() {
        let shared = shared();
        shared.clock.set_time(500);
        shared.resume();
        let serial = shared.begin_serial(Some(MediaKind::Video));
        shared.clock.set_time(3900);
        assert!(shared.clock.is_paused());
        assert_eq!(shared.hold_releaser(serial), Some(MediaKind::Video));
        assert_eq!(shared.hold_releaser(serial - 1), None);

        std::thread::sleep(std::time::Duration::from_millis(30));
        assert_eq!(shared.clock.now(), 3900);

        // 旧序号的放行无效
        shared.release_hold(serial - 1);
        assert!(shared.clock.is_paused());
        shared.release_hold(serial);
        assert!(!shared.clock.is_paused());
        assert_eq!(shared.hold_releaser(serial), None);
    }

    #[test]
    fn resume_waits_for_pending_seek_hold() {
        let shared = shared();
        shared.resume();
        let serial = shared.begin_serial(Some(MediaKind::Audio));
        shared.freeze();
        shared.resume();
        assert!(shared.clock.is_paused());

        // 暂停期间放行：时钟保持冻结，直到下一次 resume
        shared.freeze();
        shared.release_hold(serial);
        assert!(shared.clock.is_paused());
        shared.resume();
        assert!(!shared.clock.is_paused());
    }

    #[test]
    fn begin_serial_without_hold_clears_stale_hold() {
        let shared = shared();
        let first = shared.begin_serial(Some(MediaKind::Video));
        let second = shared.begin_serial(None);
        assert_eq!(second, first + 1);
        assert_eq!(shared.hold_releaser(first), None);
        assert_eq!(shared.hold_releaser(second), None);
    }

    #[test]
    fn mute_zeroes_gain() {
        let shared = shared();
        shared.set_volume(1.7);
        assert_eq!(shared.volume(), 1.0);
        shared.set_muted(true);
        assert_eq!(shared.gain(), 0.0);
    }
}
