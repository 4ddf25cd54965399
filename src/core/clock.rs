use crossbeam::atomic::AtomicCell;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// 主时钟来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockMaster {
    /// 音频输出的实际播放位置
    Audio,
    /// 内部墙钟
    Wall,
}

/// 正常速度（千分比）
const NORMAL_RATE: u32 = 1000;

/// 时钟锚点：base_us 在 at 时刻成立，之后按墙钟 × 速率外推
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Anchor {
    base_us: i64,
    at: Instant,
    paused: bool,
    epoch: u64,           // 每次 set_time/stop 递增
    rate_permille: u32,
}

impl Anchor {
    fn now_us(&self, now: Instant) -> i64 {
        if self.paused {
            self.base_us
        } else {
            let elapsed = now.saturating_duration_since(self.at).as_micros() as i64;
            self.base_us + elapsed * self.rate_permille as i64 / NORMAL_RATE as i64
        }
    }
}

/// 速度换算成千分比；非正数或非有限值按正常速度处理
fn rate_permille(speed: f64) -> u32 {
    if speed.is_finite() && speed > 0.0 {
        ((speed * NORMAL_RATE as f64).round() as u32).max(1)
    } else {
        NORMAL_RATE
    }
}

/// 播放时钟 - 用于音视频同步
///
/// 所有修改都是对单个锚点的原子替换，读路径不加锁。
/// 读取结果单调不减（同一 epoch 内），只有 seek(`set_time`) 和 `stop` 会让时间回退。
#[derive(Clone)]
pub struct PlaybackClock {
    anchor: Arc<AtomicCell<Anchor>>,
    high_water: Arc<AtomicCell<(u64, i64)>>,  // (epoch, 已报告的最大值 us)
    master: Arc<AtomicU8>,
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            anchor: Arc::new(AtomicCell::new(Anchor {
                base_us: 0,
                at: Instant::now(),
                paused: true,
                epoch: 0,
                rate_permille: NORMAL_RATE,
            })),
            high_water: Arc::new(AtomicCell::new((0, 0))),
            master: Arc::new(AtomicU8::new(ClockMaster::Wall as u8)),
        }
    }

    /// 获取当前播放时间（毫秒）
    pub fn now(&self) -> i64 {
        self.now_us() / 1000
    }

    /// 获取当前播放时间（秒）
    pub fn now_seconds(&self) -> f64 {
        self.now_us() as f64 / 1_000_000.0
    }

    fn now_us(&self) -> i64 {
        let anchor = self.anchor.load();
        let computed = anchor.now_us(Instant::now());
        let mut current = self.high_water.load();
        loop {
            if current.0 > anchor.epoch {
                // 读到旧锚点，时钟已被重置
                return computed;
            }
            let next = if current.0 < anchor.epoch {
                (anchor.epoch, computed)
            } else {
                (anchor.epoch, current.1.max(computed))
            };
            if next == current {
                return next.1;
            }
            match self.high_water.compare_exchange(current, next) {
                Ok(_) => return next.1,
                Err(actual) => current = actual,
            }
        }
    }

    fn update(&self, f: impl Fn(Anchor, Instant) -> Anchor) {
        let mut current = self.anchor.load();
        loop {
            let next = f(current, Instant::now());
            match self.anchor.compare_exchange(current, next) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// 设置播放位置（seek 时使用，允许回退）
    pub fn set_time(&self, pts_ms: i64) {
        self.update(|a, now| Anchor {
            base_us: pts_ms * 1000,
            at: now,
            epoch: a.epoch + 1,
            ..a
        });
        let epoch = self.anchor.load().epoch;
        self.high_water.store((epoch, pts_ms * 1000));
    }

    /// 音频输出回报实际播放位置（暂停时忽略）
    pub fn anchor(&self, pts_ms: i64) {
        self.update(|a, now| {
            if a.paused {
                a
            } else {
                Anchor {
                    base_us: pts_ms * 1000,
                    at: now,
                    ..a
                }
            }
        });
    }

    /// 开始播放
    pub fn play(&self) {
        self.update(|a, now| {
            if a.paused {
                Anchor {
                    at: now,
                    paused: false,
                    ..a
                }
            } else {
                a
            }
        });
    }

    /// 暂停播放
    pub fn pause(&self) {
        // 先取单调值，保证暂停后的读数不小于暂停前
        let frozen = self.now_us();
        self.update(|a, _| {
            if a.paused {
                a
            } else {
                Anchor {
                    base_us: frozen,
                    paused: true,
                    ..a
                }
            }
        });
    }

    /// 停止：回到 0 并暂停
    pub fn stop(&self) {
        self.update(|a, now| Anchor {
            base_us: 0,
            at: now,
            paused: true,
            epoch: a.epoch + 1,
            ..a
        });
        let epoch = self.anchor.load().epoch;
        self.high_water.store((epoch, 0));
    }

    /// 设置播放速度（1.0 为正常速度），从当前读数处重新外推
    pub fn set_rate(&self, speed: f64) {
        let rate = rate_permille(speed);
        // 先取单调值，换速不会让读数回退
        let current = self.now_us();
        self.update(|a, now| {
            if a.rate_permille == rate {
                a
            } else if a.paused {
                Anchor {
                    rate_permille: rate,
                    ..a
                }
            } else {
                Anchor {
                    base_us: current.max(a.now_us(now)),
                    at: now,
                    rate_permille: rate,
                    ..a
                }
            }
        });
    }

    /// 当前播放速度
    pub fn rate(&self) -> f64 {
        self.anchor.load().rate_permille as f64 / NORMAL_RATE as f64
    }

    /// 是否按正常速度运行
    pub fn is_normal_rate(&self) -> bool {
        self.anchor.load().rate_permille == NORMAL_RATE
    }

    /// 是否暂停
    pub fn is_paused(&self) -> bool {
        self.anchor.load().paused
    }

    pub fn master(&self) -> ClockMaster {
        if self.master.load(Ordering::Acquire) == ClockMaster::Audio as u8 {
            ClockMaster::Audio
        } else {
            ClockMaster::Wall
        }
    }

    pub fn set_master(&self, master: ClockMaster) {
        self.master.store(master as u8, Ordering::Release);
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn advances_when_running() {
        let clock = PlaybackClock::new();
        clock.play();
        thread::sleep(Duration::from_millis(50));
        assert!(clock.now() >= 40, "clock at {}", clock.now());
    }

    #[test]
    fn pauses_and_resumes() {
        let clock = PlaybackClock::new();
        clock.play();
        thread::sleep(Duration::from_millis(20));
        clock.pause();
        let paused = clock.now();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(paused, clock.now());
        clock.play();
        thread::sleep(Duration::from_millis(20));
        assert!(clock.now() > paused);
    }

    #[test]
    fn reads_never_go_backwards_on_late_anchor() {
        let clock = PlaybackClock::new();
        clock.set_time(1000);
        clock.play();
        thread::sleep(Duration::from_millis(30));
        let before = clock.now();
        clock.anchor(900);
        assert!(clock.now() >= before);
    }

    #[test]
    fn set_time_moves_backwards() {
        let clock = PlaybackClock::new();
        clock.set_time(5000);
        assert_eq!(clock.now(), 5000);
        clock.set_time(1000);
        assert_eq!(clock.now(), 1000);
        clock.stop();
        assert_eq!(clock.now(), 0);
        assert!(clock.is_paused());
    }

    #[test]
    fn rate_scales_elapsed_time() {
        let clock = PlaybackClock::new();
        clock.set_rate(2.0);
        clock.play();
        thread::sleep(Duration::from_millis(100));
        let fast = clock.now();
        assert!(fast >= 190, "clock at {}", fast);

        clock.set_time(0);
        clock.set_rate(0.5);
        thread::sleep(Duration::from_millis(100));
        let slow = clock.now();
        assert!((45..100).contains(&slow), "clock at {}", slow);
    }

    #[test]
    fn rate_change_keeps_reading_continuous() {
        let clock = PlaybackClock::new();
        clock.set_time(1000);
        clock.play();
        thread::sleep(Duration::from_millis(30));
        let before = clock.now();
        clock.set_rate(0.25);
        assert!(clock.now() >= before);
        assert!(clock.now() < before + 20);
    }

    #[test]
    fn invalid_rate_falls_back_to_normal() {
        let clock = PlaybackClock::new();
        clock.set_rate(1.5);
        assert_eq!(clock.rate(), 1.5);
        clock.set_rate(0.0);
        assert_eq!(clock.rate(), 1.0);
        clock.set_rate(-2.0);
        assert!(clock.is_normal_rate());
        clock.set_rate(f64::NAN);
        assert_eq!(clock.rate(), 1.0);
    }

    #[test]
    fn rate_survives_pause_and_seek() {
        let clock = PlaybackClock::new();
        clock.set_rate(2.0);
        clock.set_time(500);
        assert_eq!(clock.now(), 500);
        clock.stop();
        assert_eq!(clock.rate(), 2.0);
    }

    #[test]
    fn anchor_ignored_while_paused() {
        let clock = PlaybackClock::new();
        clock.set_time(2000);
        clock.anchor(7000);
        assert_eq!(clock.now(), 2000);
    }
}
