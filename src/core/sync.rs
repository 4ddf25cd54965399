//! 音画同步：按主时钟决定每一帧是等待、立即呈现还是丢弃。

use crate::core::config::SyncConfig;
use crate::core::types::MediaKind;
use log::{debug, warn};
use std::collections::VecDeque;
use std::time::Duration;

/// 最近多少次 delta 用于估算漂移
const DRIFT_HISTORY: usize = 32;

/// 单帧同步决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// 帧来早了，等待后重新判断
    Wait(Duration),
    /// 立即呈现
    Present,
    /// 帧已过期，丢弃
    Drop,
    /// 连续丢帧超过上限：计数器对齐主时钟，呈现该帧
    Resync,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncStats {
    pub presented: u64,
    pub dropped: u64,
    pub resyncs: u64,
}

pub struct Synchronizer {
    config: SyncConfig,
    consecutive_drops: u32,
    deltas: VecDeque<i64>,
    stats: SyncStats,
}

impl Synchronizer {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            consecutive_drops: 0,
            deltas: VecDeque::with_capacity(DRIFT_HISTORY),
            stats: SyncStats::default(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// 根据帧 PTS 和主时钟当前值（毫秒）给出决策
    pub fn decide(&mut self, kind: MediaKind, pts_ms: i64, master_now_ms: i64) -> SyncDecision {
        // 音频就是主时钟，从不丢弃；细微漂移由输出端补静音/截断处理
        if kind == MediaKind::Audio {
            return SyncDecision::Present;
        }

        let delta = pts_ms - master_now_ms;
        let threshold = self.config.sync_threshold_ms;

        if delta > threshold {
            let wait = delta.min(self.config.max_wait_ms).max(1);
            return SyncDecision::Wait(Duration::from_millis(wait as u64));
        }

        self.record_delta(delta);

        if delta >= -threshold {
            self.consecutive_drops = 0;
            return SyncDecision::Present;
        }

        self.consecutive_drops += 1;
        if self.consecutive_drops > self.config.max_consecutive_drops {
            warn!(
                "🔁 连续丢弃 {} 帧（delta={}ms），执行粗同步",
                self.consecutive_drops, delta
            );
            self.consecutive_drops = 0;
            self.deltas.clear();
            self.stats.resyncs += 1;
            return SyncDecision::Resync;
        }

        debug!("🗑️ 丢弃过期视频帧: PTS={}ms, delta={}ms", pts_ms, delta);
        SyncDecision::Drop
    }

    /// 呈现方回报实际结果，用于统计
    pub fn note_presented(&mut self) {
        self.stats.presented += 1;
    }

    pub fn note_dropped(&mut self) {
        self.stats.dropped += 1;
    }

    fn record_delta(&mut self, delta: i64) {
        if self.deltas.len() == DRIFT_HISTORY {
            self.deltas.pop_front();
        }
        self.deltas.push_back(delta);
    }

    /// 视频相对主时钟的平均偏差（负数表示视频落后）
    pub fn average_drift_ms(&self) -> f64 {
        if self.deltas.is_empty() {
            0.0
        } else {
            self.deltas.iter().sum::<i64>() as f64 / self.deltas.len() as f64
        }
    }

    pub fn consecutive_drops(&self) -> u32 {
        self.consecutive_drops
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// seek 后重置：清空 delta 历史和丢帧计数
    pub fn reset(&mut self) {
        self.consecutive_drops = 0;
        self.deltas.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync() -> Synchronizer {
        Synchronizer::new(SyncConfig {
            sync_threshold_ms: 40,
            max_wait_ms: 50,
            max_consecutive_drops: 3,
        })
    }

    #[test]
    fn early_frame_waits_with_cap() {
        let mut s = sync();
        assert_eq!(
            s.decide(MediaKind::Video, 1000, 900),
            SyncDecision::Wait(Duration::from_millis(50))
        );
        assert_eq!(
            s.decide(MediaKind::Video, 1000, 955),
            SyncDecision::Wait(Duration::from_millis(45))
        );
    }

    #[test]
    fn frame_within_threshold_is_presented() {
        let mut s = sync();
        assert_eq!(s.decide(MediaKind::Video, 1000, 1040), SyncDecision::Present);
        assert_eq!(s.decide(MediaKind::Video, 1000, 960), SyncDecision::Present);
    }

    #[test]
    fn audio_is_never_dropped() {
        let mut s = sync();
        for lag in [0, 500, 10_000] {
            assert_eq!(s.decide(MediaKind::Audio, 0, lag), SyncDecision::Present);
        }
        assert_eq!(s.consecutive_drops(), 0);
    }

    #[test]
    fn lagging_frames_drop_then_resync_once() {
        let mut s = sync();
        let mut decisions = Vec::new();
        for i in 0..5 {
            decisions.push(s.decide(MediaKind::Video, i * 40, 10_000));
        }
        assert_eq!(
            decisions,
            vec![
                SyncDecision::Drop,
                SyncDecision::Drop,
                SyncDecision::Drop,
                SyncDecision::Resync,
                SyncDecision::Drop,
            ]
        );
        assert_eq!(s.stats().resyncs, 1);
    }

    #[test]
    fn in_sync_frame_resets_drop_counter() {
        let mut s = sync();
        s.decide(MediaKind::Video, 0, 1000);
        s.decide(MediaKind::Video, 0, 1000);
        assert_eq!(s.consecutive_drops(), 2);
        s.decide(MediaKind::Video, 1000, 1000);
        assert_eq!(s.consecutive_drops(), 0);
    }

    #[test]
    fn reset_clears_history() {
        let mut s = sync();
        s.decide(MediaKind::Video, 0, 1000);
        assert!(s.average_drift_ms() < 0.0);
        s.reset();
        assert_eq!(s.average_drift_ms(), 0.0);
        assert_eq!(s.consecutive_drops(), 0);
    }
}
