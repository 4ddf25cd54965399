use crate::core::config::DecoderConfig;
use crate::core::{
    log_ctx, BoundedQueue, DecodeError, ErrorKind, Frame, MediaKind, PopError, PushOutcome,
    Stage, StreamItem,
};
use crate::player::decoder::{Decoder, DecoderFactory};
use crate::player::demuxer_thread::PacketQueue;
use crate::player::session::SessionShared;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub type FrameQueue = BoundedQueue<StreamItem<Frame>>;

/// 解码器重建预算：时间窗口内最多重建 max_resets 次
pub struct ResetBudget {
    max_resets: u32,
    window: Duration,
    history: VecDeque<Instant>,
}

impl ResetBudget {
    pub fn new(config: &DecoderConfig) -> Self {
        Self {
            max_resets: config.max_resets,
            window: Duration::from_millis(config.reset_window_ms),
            history: VecDeque::new(),
        }
    }

    /// 申请一次重建，超出预算返回 false
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        while let Some(front) = self.history.front() {
            if now.saturating_duration_since(*front) > self.window {
                self.history.pop_front();
            } else {
                break;
            }
        }
        if self.history.len() as u32 >= self.max_resets {
            return false;
        }
        self.history.push_back(now);
        true
    }
}

/// 解码线程句柄
pub struct DecoderThread {
    kind: MediaKind,
    handle: Option<JoinHandle<()>>,
}

struct DecodeWorker {
    kind: MediaKind,
    decoder: Box<dyn Decoder>,
    factory: Arc<dyn DecoderFactory>,
    packets: Arc<PacketQueue>,
    frames: Arc<FrameQueue>,
    shared: Arc<SessionShared>,
    budget: ResetBudget,
    poll_interval: Duration,
    serial: u64,
    decoded: usize,
    corrupt: usize,
}

enum Flow {
    Continue,
    Exit,
}

impl DecoderThread {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        kind: MediaKind,
        decoder: Box<dyn Decoder>,
        factory: Arc<dyn DecoderFactory>,
        packets: Arc<PacketQueue>,
        frames: Arc<FrameQueue>,
        shared: Arc<SessionShared>,
        config: &DecoderConfig,
        poll_interval: Duration,
    ) -> Self {
        let serial = shared.signal.serial();
        let worker = DecodeWorker {
            kind,
            decoder,
            factory,
            packets,
            frames,
            shared,
            budget: ResetBudget::new(config),
            poll_interval,
            serial,
            decoded: 0,
            corrupt: 0,
        };
        let handle = thread::Builder::new()
            .name(format!("{}-decoder", kind))
            .spawn(move || worker.run())
            .ok();
        if handle.is_none() {
            error!("{} ❌ 无法创建{}解码线程", log_ctx(), kind);
        }
        Self { kind, handle }
    }

    /// 等待线程退出（调用方需要先 close 队列）
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("{} ❌ {}解码线程 panic", log_ctx(), self.kind);
            }
        }
    }
}

impl Drop for DecoderThread {
    fn drop(&mut self) {
        self.join();
    }
}

impl DecodeWorker {
    fn run(mut self) {
        info!(
            "{} 🎞️ {}解码线程启动: {}",
            log_ctx(),
            self.kind,
            self.decoder.description()
        );
        loop {
            if self.shared.signal.is_halted() {
                break;
            }
            match self.packets.wait_and_pop_stamped(self.poll_interval) {
                Ok((serial, item)) => {
                    if serial < self.serial {
                        continue;
                    }
                    if serial > self.serial {
                        // seek 之后的第一个包：参考帧和预读状态全部作废
                        self.decoder.flush();
                        info!(
                            "{} 🧹 {}解码器已 flush (serial {} -> {})",
                            log_ctx(),
                            self.kind,
                            self.serial,
                            serial
                        );
                        self.serial = serial;
                    }
                    let flow = match item {
                        StreamItem::Data(packet) => match self.decoder.decode(&packet) {
                            Ok(frames) => self.forward(frames),
                            Err(e) => self.on_decode_error(e),
                        },
                        StreamItem::EndOfStream => self.finish_stream(),
                    };
                    if let Flow::Exit = flow {
                        break;
                    }
                }
                Err(PopError::Timeout) | Err(PopError::Flushed) => continue,
                Err(PopError::Closed) => break,
            }
        }
        info!(
            "{} 🛑 {}解码线程退出（解码 {} 帧，跳过 {} 个损坏包）",
            log_ctx(),
            self.kind,
            self.decoded,
            self.corrupt
        );
    }

    fn forward(&mut self, frames: Vec<Frame>) -> Flow {
        let filter = self.shared.seek_filter();
        for frame in frames {
            let frame = match filter {
                Some(filter) => match filter.apply(self.serial, frame) {
                    Some(frame) => frame,
                    None => continue,
                },
                None => frame,
            };
            self.decoded += 1;
            if self.decoded <= 5 || self.decoded % 100 == 0 {
                debug!(
                    "{} 🖼️ {}帧 #{} PTS={}ms",
                    log_ctx(),
                    self.kind,
                    self.decoded,
                    frame.pts()
                );
            }
            match self.frames.push_stamped(self.serial, StreamItem::Data(frame)) {
                PushOutcome::Queued | PushOutcome::Full => {}
                // 本批剩余帧都属于旧位置
                PushOutcome::Flushed | PushOutcome::Stale => return Flow::Continue,
                PushOutcome::Closed => return Flow::Exit,
            }
        }
        Flow::Continue
    }

    fn on_decode_error(&mut self, error: DecodeError) -> Flow {
        match error {
            DecodeError::Corrupt(msg) | DecodeError::Unsupported(msg) => {
                self.corrupt += 1;
                warn!("{} ⚠️ {}解码跳过损坏包: {}", log_ctx(), self.kind, msg);
                Flow::Continue
            }
            DecodeError::State(msg) => {
                if !self.budget.try_acquire(Instant::now()) {
                    self.shared.fail(
                        ErrorKind::DecodeFailed,
                        Stage::Decode(self.kind),
                        format!("解码器重建次数超限: {}", msg),
                    );
                    return Flow::Exit;
                }
                warn!("{} 🔧 {}解码器状态损坏，重建: {}", log_ctx(), self.kind, msg);
                match self.factory.create() {
                    Ok(decoder) => {
                        self.decoder = decoder;
                        Flow::Continue
                    }
                    Err(e) => {
                        self.shared.fail(
                            ErrorKind::DecodeFailed,
                            Stage::Decode(self.kind),
                            format!("解码器重建失败: {}", e),
                        );
                        Flow::Exit
                    }
                }
            }
        }
    }

    fn finish_stream(&mut self) -> Flow {
        match self.decoder.drain() {
            Ok(frames) => {
                if let Flow::Exit = self.forward(frames) {
                    return Flow::Exit;
                }
            }
            Err(e) => warn!("{} ⚠️ {}解码器 drain 失败: {}", log_ctx(), self.kind, e),
        }
        info!("{} 📄 {}解码完毕 (serial={})", log_ctx(), self.kind, self.serial);
        loop {
            match self.frames.push_stamped(self.serial, StreamItem::EndOfStream) {
                PushOutcome::Full => {
                    if self.shared.signal.is_halted() {
                        return Flow::Exit;
                    }
                    thread::sleep(self.poll_interval);
                }
                PushOutcome::Closed => return Flow::Exit,
                _ => return Flow::Continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_refills_after_window() {
        let mut budget = ResetBudget::new(&DecoderConfig {
            max_resets: 2,
            reset_window_ms: 100,
        });
        let start = Instant::now();
        assert!(budget.try_acquire(start));
        assert!(budget.try_acquire(start + Duration::from_millis(10)));
        assert!(!budget.try_acquire(start + Duration::from_millis(20)));
        assert!(budget.try_acquire(start + Duration::from_millis(150)));
    }
}
