//! 有界队列：解封装 → 解码 → 呈现 各环节之间的缓冲。
//!
//! 每个元素都带有写入时的 flush 序号（serial）。控制器每次 flush 都会抬高
//! 队列的序号，之后旧序号的元素一律丢弃，阻塞中的生产者/消费者会立即被唤醒。

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 队列满时的行为
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// 阻塞生产者（本地文件默认）
    Backpressure,
    /// 直接丢弃（尽力而为的实时源）
    Drop,
}

impl Default for QueueMode {
    fn default() -> Self {
        QueueMode::Backpressure
    }
}

/// push 结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Drop 模式下队列已满
    Full,
    /// 等待期间队列被 flush，元素已丢弃
    Flushed,
    /// 元素序号早于队列当前序号
    Stale,
    Closed,
}

/// 阻塞 pop 的失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    Timeout,
    Flushed,
    Closed,
}

struct QueueState<T> {
    items: VecDeque<(u64, T)>,
    serial: u64,
    flush_epoch: u64,
    closed: bool,
}

pub struct BoundedQueue<T> {
    name: String,
    capacity: usize,
    mode: QueueMode,
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: impl Into<String>, capacity: usize, mode: QueueMode) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            mode,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                serial: 0,
                flush_epoch: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn serial(&self) -> u64 {
        self.state.lock().serial
    }

    /// 以当前序号入队，成功入队返回 true
    pub fn push(&self, item: T) -> bool {
        let serial = self.serial();
        self.push_stamped(serial, item) == PushOutcome::Queued
    }

    /// 以指定序号入队。Backpressure 模式下队满会阻塞，直到有空位、flush 或 close。
    pub fn push_stamped(&self, serial: u64, item: T) -> PushOutcome {
        let mut state = self.state.lock();
        let epoch = state.flush_epoch;
        loop {
            if state.closed {
                return PushOutcome::Closed;
            }
            if state.flush_epoch != epoch {
                return PushOutcome::Flushed;
            }
            if serial < state.serial {
                return PushOutcome::Stale;
            }
            if state.items.len() < self.capacity {
                state.items.push_back((serial, item));
                drop(state);
                self.not_empty.notify_one();
                return PushOutcome::Queued;
            }
            match self.mode {
                QueueMode::Drop => return PushOutcome::Full,
                QueueMode::Backpressure => self.not_full.wait(&mut state),
            }
        }
    }

    /// 非阻塞取出
    pub fn pop(&self) -> Option<T> {
        self.pop_stamped().map(|(_, item)| item)
    }

    pub fn pop_stamped(&self) -> Option<(u64, T)> {
        let mut state = self.state.lock();
        let item = state.items.pop_front();
        if item.is_some() {
            drop(state);
            self.not_full.notify_one();
        }
        item
    }

    /// 阻塞取出，最多等待 timeout
    pub fn wait_and_pop(&self, timeout: Duration) -> Result<T, PopError> {
        self.wait_and_pop_stamped(timeout).map(|(_, item)| item)
    }

    pub fn wait_and_pop_stamped(&self, timeout: Duration) -> Result<(u64, T), PopError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        let epoch = state.flush_epoch;
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Ok(item);
            }
            if state.closed {
                return Err(PopError::Closed);
            }
            if state.flush_epoch != epoch {
                return Err(PopError::Flushed);
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Ok(item);
                }
                return Err(PopError::Timeout);
            }
        }
    }

    /// 清空并把序号 +1，返回新序号
    pub fn flush(&self) -> u64 {
        let serial = self.serial() + 1;
        self.flush_to(serial);
        serial
    }

    /// 清空并把序号抬到 serial（不会回退），唤醒所有等待者
    pub fn flush_to(&self, serial: u64) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            let discarded = state.items.len();
            state.items.clear();
            state.serial = state.serial.max(serial);
            state.flush_epoch += 1;
            discarded
        };
        self.not_empty.notify_all();
        self.not_full.notify_all();
        discarded
    }

    /// 关闭队列：生产者立即返回 Closed，消费者取完剩余元素后返回 Closed
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

/// 根据目标缓冲时长估算容量
pub fn capacity_for(seconds: f64, item_duration_ms: i64, min_items: usize, max_items: usize) -> usize {
    let wanted = if item_duration_ms > 0 {
        (seconds * 1000.0 / item_duration_ms as f64).ceil() as usize
    } else {
        max_items
    };
    wanted.clamp(min_items.max(1), max_items.max(min_items.max(1)))
}
