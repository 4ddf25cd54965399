use crate::core::{
    log_ctx, BoundedQueue, ErrorKind, MediaKind, Packet, PushOutcome, SeekError,
    Stage, StreamItem,
};
use crate::player::demuxer_source::DemuxerSource;
use crate::player::session::SessionShared;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub type PacketQueue = BoundedQueue<StreamItem<Packet>>;

/// 包路由：流 id -> (类型, 包队列)
pub type PacketRoutes = HashMap<usize, (MediaKind, Arc<PacketQueue>)>;

/// Demuxer 线程命令
pub enum DemuxerCommand {
    /// 定位后以新序号继续读取，结果通过 ack 回传
    Seek {
        target_ms: i64,
        serial: u64,
        ack: Sender<Result<i64, SeekError>>,
    },
    Stop,
}

/// 推送结果对读循环的影响
enum Routed {
    Continue,
    Exit,
}

/// Demuxer 线程管理器
///
/// 线程独占 `DemuxerSource`，退出时把它交还给调用方（停止后可以从头重播）。
pub struct DemuxerThread {
    thread_handle: Option<JoinHandle<Box<dyn DemuxerSource>>>,
    command_tx: Sender<DemuxerCommand>,
}

impl DemuxerThread {
    /// 启动 Demuxer 线程，读到的包按流 id 分发到对应队列
    pub fn start(
        demuxer_source: Box<dyn DemuxerSource>,
        routes: PacketRoutes,
        shared: Arc<SessionShared>,
        poll_interval: Duration,
    ) -> Self {
        let (command_tx, command_rx) = unbounded::<DemuxerCommand>();
        let thread_handle = thread::Builder::new()
            .name("demuxer".into())
            .spawn(move || Self::demux_loop(demuxer_source, command_rx, routes, shared, poll_interval))
            .ok();
        if thread_handle.is_none() {
            error!("{} ❌ 无法创建 Demuxer 线程", log_ctx());
        }
        Self {
            thread_handle,
            command_tx,
        }
    }

    /// Demuxer 循环（在独立线程中运行）
    ///
    /// - 每读一个包之前先处理所有待处理命令，保证 Seek/Stop 及时响应
    /// - Backpressure 队列满时 push 阻塞，形成自然背压；flush/close 会立即唤醒
    /// - 到达 EOF 后向每个队列推送结束标记，然后只等待命令
    fn demux_loop(
        mut demuxer: Box<dyn DemuxerSource>,
        command_rx: Receiver<DemuxerCommand>,
        routes: PacketRoutes,
        shared: Arc<SessionShared>,
        poll_interval: Duration,
    ) -> Box<dyn DemuxerSource> {
        info!("{} 🎬 Demuxer 线程启动: {}", log_ctx(), demuxer.description());

        let mut serial = shared.signal.serial();
        let mut at_eof = false;
        let mut packet_count: usize = 0;
        let mut video_packet_count: usize = 0;
        let mut audio_packet_count: usize = 0;
        let mut corrupt_count: usize = 0;

        const LOG_FIRST_N: usize = 5;

        'outer: loop {
            // 优先处理所有命令；EOF 后阻塞等待命令，避免空转
            loop {
                let cmd = if at_eof {
                    match command_rx.recv_timeout(poll_interval) {
                        Ok(cmd) => cmd,
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => break 'outer,
                    }
                } else {
                    match command_rx.try_recv() {
                        Ok(cmd) => cmd,
                        Err(_) => break,
                    }
                };
                match cmd {
                    DemuxerCommand::Seek {
                        target_ms,
                        serial: next_serial,
                        ack,
                    } => {
                        info!(
                            "{} ⏩ Demuxer 线程收到 Seek 命令: {}ms (serial={})",
                            log_ctx(),
                            target_ms,
                            next_serial
                        );
                        let result = if demuxer.is_seekable() {
                            demuxer.seek(target_ms)
                        } else {
                            Err(SeekError::NotSeekable)
                        };
                        match &result {
                            Ok(actual) => info!(
                                "{} 🧹 Seek 成功: 目标 {}ms, 实际关键帧 {}ms",
                                log_ctx(),
                                target_ms,
                                actual
                            ),
                            Err(e) => error!("{} ❌ Seek 失败: {}", log_ctx(), e),
                        }
                        // 无论成功与否都切换到新序号，旧序号的数据已被控制器清空
                        serial = next_serial;
                        at_eof = false;
                        let _ = ack.send(result);
                    }
                    DemuxerCommand::Stop => {
                        info!("{} ⏹ Demuxer 线程收到停止命令", log_ctx());
                        break 'outer;
                    }
                }
            }

            if shared.signal.is_halted() {
                break;
            }
            if at_eof {
                continue;
            }

            match demuxer.read_packet() {
                Ok(Some(packet)) => {
                    let Some((kind, queue)) = routes.get(&packet.stream_id) else {
                        // 未选中的流
                        continue;
                    };
                    packet_count += 1;
                    let count = match kind {
                        MediaKind::Video => {
                            video_packet_count += 1;
                            video_packet_count
                        }
                        MediaKind::Audio => {
                            audio_packet_count += 1;
                            audio_packet_count
                        }
                    };
                    if count <= LOG_FIRST_N || count % 100 == 0 {
                        info!(
                            "{} 📦 Demuxer 读取{}包 #{}（total packets {}）",
                            log_ctx(),
                            kind,
                            count,
                            packet_count
                        );
                    }
                    if let Routed::Exit = Self::route(queue, serial, StreamItem::Data(packet)) {
                        break;
                    }
                }
                Ok(None) => {
                    info!(
                        "{} 📄 Demuxer 到达文件末尾，等待命令（Seek/Stop）...",
                        log_ctx()
                    );
                    at_eof = true;
                    for (kind, queue) in routes.values() {
                        if let Routed::Exit =
                            Self::push_end_of_stream(queue, serial, &shared, poll_interval)
                        {
                            debug!("{} {} 队列已关闭，未推送结束标记", log_ctx(), kind);
                        }
                    }
                }
                Err(e) if e.is_fatal() => {
                    shared.fail(ErrorKind::DemuxFailed, Stage::Demux, e.to_string());
                    break;
                }
                Err(e) => {
                    corrupt_count += 1;
                    warn!("{} ⚠️ 跳过损坏的数据包 #{}: {}", log_ctx(), corrupt_count, e);
                }
            }
        }

        info!(
            "{} 🛑 Demuxer 线程退出（共读取 {} 个包：{} 视频，{} 音频，跳过 {} 个损坏包）",
            log_ctx(),
            packet_count,
            video_packet_count,
            audio_packet_count,
            corrupt_count
        );
        demuxer
    }

    fn route(queue: &PacketQueue, serial: u64, item: StreamItem<Packet>) -> Routed {
        match queue.push_stamped(serial, item) {
            PushOutcome::Queued => Routed::Continue,
            PushOutcome::Flushed | PushOutcome::Stale => {
                // seek 正在进行，旧位置的包直接丢弃
                Routed::Continue
            }
            PushOutcome::Full => {
                debug!("{} 🗑️ {} 已满，丢弃数据包", log_ctx(), queue.name());
                Routed::Continue
            }
            PushOutcome::Closed => Routed::Exit,
        }
    }

    /// 结束标记不能丢：Drop 模式下队列满时重试
    fn push_end_of_stream(
        queue: &PacketQueue,
        serial: u64,
        shared: &SessionShared,
        poll_interval: Duration,
    ) -> Routed {
        loop {
            match queue.push_stamped(serial, StreamItem::EndOfStream) {
                PushOutcome::Full => {
                    if shared.signal.is_halted() {
                        return Routed::Exit;
                    }
                    thread::sleep(poll_interval);
                }
                PushOutcome::Closed => return Routed::Exit,
                _ => return Routed::Continue,
            }
        }
    }

    /// 发送 Seek 命令并等待线程确认
    pub fn seek(&self, target_ms: i64, serial: u64, timeout: Duration) -> Result<i64, SeekError> {
        let (ack_tx, ack_rx) = bounded(1);
        self.command_tx
            .send(DemuxerCommand::Seek {
                target_ms,
                serial,
                ack: ack_tx,
            })
            .map_err(|e| SeekError::Backend(format!("发送 Seek 命令失败: {}", e)))?;
        match ack_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(SeekError::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                Err(SeekError::Backend("Demuxer 线程已退出".into()))
            }
        }
    }

    /// 停止线程并取回数据源
    ///
    /// 调用方需要先 close 包队列，保证阻塞中的 push 能够返回。
    pub fn stop(&mut self) -> Option<Box<dyn DemuxerSource>> {
        info!("{} 🛑 DemuxerThread::stop() called", log_ctx());
        let _ = self.command_tx.send(DemuxerCommand::Stop);
        let handle = self.thread_handle.take()?;
        match handle.join() {
            Ok(source) => Some(source),
            Err(_) => {
                error!("{} ❌ Demuxer 线程 panic", log_ctx());
                None
            }
        }
    }
}

impl Drop for DemuxerThread {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            warn!(
                "{} ⚠ DemuxerThread 被 drop，但可能未调用 stop()，正在尝试优雅停止",
                log_ctx()
            );
            self.stop();
        }
    }
}
