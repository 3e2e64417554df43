//! # Endpoint：总线的设备入口
//!
//! ## 核心意图（Why）
//! - 端点是客户端打开的设备节点，持有成员连接集合与一个共享的就绪等待条件；
//! - 任意成员连接入队后都会唤醒在该端点上阻塞读取的线程。
//!
//! ## 行为契约（What）
//! - 端点以 `Arc` 共享：命名空间的 minor 表、连接各持有一份，总线只持有 `Weak`；
//! - `disconnect` 只做标记与唤醒，成员连接仍需各自关闭；
//! - 成员集合锁位于锁序中的“端点锁”一级：可以在持有命名空间锁时获取，反之不允许。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::bus::Bus;
use super::subsystem::DeviceId;

/// 端点级就绪等待条件。
///
/// # 教案式说明
/// - **意图 (Why)**：阻塞读取需要在“队列非空”或“端点断开”时被唤醒，而不丢失唤醒；
/// - **契约 (What)**：读取方在尝试出队 *之前* 记录 [`generation`](ReadyWait::generation)，
///   出队失败后调用 [`wait_past`](ReadyWait::wait_past)；任何 `notify` 都会推进代数，
///   因此两步之间发生的入队不会被错过。
#[derive(Debug, Default)]
pub struct ReadyWait {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl ReadyWait {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// 等待代数离开 `observed`；超过 `deadline` 仍未变化时返回 `false`。
    pub fn wait_past(&self, observed: u64, deadline: Option<Instant>) -> bool {
        let mut generation = self.generation.lock();
        while *generation == observed {
            match deadline {
                None => self.cond.wait(&mut generation),
                Some(at) => {
                    if self.cond.wait_until(&mut generation, at).timed_out() {
                        return *generation != observed;
                    }
                }
            }
        }
        true
    }
}

#[derive(Debug)]
pub struct Endpoint {
    name: String,
    device: DeviceId,
    mode: u32,
    bus: Arc<Bus>,
    disconnected: AtomicBool,
    members: Mutex<BTreeSet<u64>>,
    wait: Arc<ReadyWait>,
}

impl Endpoint {
    pub(crate) fn new(name: String, device: DeviceId, mode: u32, bus: Arc<Bus>) -> Self {
        Self {
            name,
            device,
            mode,
            bus,
            disconnected: AtomicBool::new(false),
            members: Mutex::new(BTreeSet::new()),
            wait: Arc::new(ReadyWait::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// 标记断开并唤醒全部阻塞读取方。重复调用无副作用。
    pub fn disconnect(&self) {
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            self.wait.notify();
        }
    }

    pub(crate) fn wait(&self) -> &Arc<ReadyWait> {
        &self.wait
    }

    pub(crate) fn join(&self, id: u64) -> bool {
        self.members.lock().insert(id)
    }

    pub(crate) fn leave(&self, id: u64) -> bool {
        self.members.lock().remove(&id)
    }

    /// 成员连接 id 的快照，按 id 升序。
    pub fn connection_ids(&self) -> Vec<u64> {
        self.members.lock().iter().copied().collect()
    }

    pub fn has_member(&self, id: u64) -> bool {
        self.members.lock().contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_past_returns_immediately_after_missed_notify() {
        let wait = ReadyWait::new();
        let observed = wait.generation();
        wait.notify();
        assert!(wait.wait_past(observed, None), "已发生的唤醒不得丢失");
    }

    #[test]
    fn wait_past_times_out_without_notify() {
        let wait = ReadyWait::new();
        let observed = wait.generation();
        let deadline = Instant::now() + Duration::from_millis(10);
        assert!(!wait.wait_past(observed, Some(deadline)));
    }

    #[test]
    fn notify_from_other_thread_wakes_waiter() {
        let wait = Arc::new(ReadyWait::new());
        let observed = wait.generation();
        let waker = Arc::clone(&wait);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            waker.notify();
        });
        assert!(wait.wait_past(observed, Some(Instant::now() + Duration::from_secs(5))));
        handle.join().unwrap();
    }
}
