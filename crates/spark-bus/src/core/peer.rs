//! # Peer：端点连接在总线上的可寻址部分
//!
//! ## 核心意图（Why）
//! - 总线 id 表中登记的是 [`Peer`]，而不是完整的连接句柄：发送方只需要找到目标队列，
//!   不需要触碰目标连接的命名空间或端点引用；
//! - 队列、超时扫描定时器与激活标记都挂在这里，所有条目状态跃迁都在 `queue` 锁内完成。
//!
//! ## 行为契约（What）
//! - `enqueue`：持队列锁追加并按截止时间收紧定时器，释放锁后唤醒端点等待方；
//! - `scan_timeouts`：持队列锁回收过期条目并重排定时器，释放锁后再向各发送方投递超时通知，
//!   因此任何时刻最多持有一个连接的队列锁；
//! - `drain`：关闭队列并释放全部条目，之后的入队一律失败。
//!
//! ## 风险提示（Trade-offs）
//! - 定时器回调只持有 `Weak<Peer>`；若回调期间最后一个强引用在工作线程上释放，
//!   定时器的 `shutdown` 会跳过对自身的 join。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::bus::Bus;
use super::endpoint::ReadyWait;
use super::message::{Envelope, KERNEL_ID};
use super::queue::{MessageQueue, TimeoutNotice};
use super::timer::DeadlineTimer;
use crate::error::{BusError, Result};
use crate::time::Clock;

/// 一次超时扫描的摘要。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScanReport {
    /// 本次回收的过期条目，按队列顺序。
    pub expired: Vec<TimeoutNotice>,
    /// 成功投递到发送方队列的超时通知数。
    pub notified: usize,
    /// 定时器重排后的到期时间；`None` 表示已保持未武装。
    pub next_deadline: Option<Instant>,
}

pub struct Peer {
    id: u64,
    bus: Weak<Bus>,
    active: AtomicBool,
    starter: AtomicBool,
    queue: Mutex<MessageQueue>,
    timer: DeadlineTimer,
    wait: Arc<ReadyWait>,
    clock: Arc<dyn Clock>,
}

impl Peer {
    pub(crate) fn new(
        id: u64,
        bus: Weak<Bus>,
        wait: Arc<ReadyWait>,
        clock: Arc<dyn Clock>,
        max_pending: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            bus,
            active: AtomicBool::new(false),
            starter: AtomicBool::new(false),
            queue: Mutex::new(MessageQueue::new(id, max_pending)),
            timer: DeadlineTimer::new(Arc::clone(&clock)),
            wait,
            clock,
        })
    }

    /// 启动未武装的扫描定时器。
    pub(crate) fn start_timer(self: &Arc<Self>, thread_name: String) -> Result<()> {
        let weak = Arc::downgrade(self);
        self.timer.start(thread_name, move || {
            if let Some(peer) = weak.upgrade() {
                peer.scan_timeouts();
            }
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_starter(&self) -> bool {
        self.starter.load(Ordering::Acquire)
    }

    /// 一次性激活。
    pub(crate) fn activate(&self, starter: bool) -> Result<u64> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BusError::Busy { id: self.id })?;
        self.starter.store(starter, Ordering::Release);
        Ok(self.id)
    }

    pub fn enqueue(&self, envelope: Arc<Envelope>) -> Result<()> {
        let cookie = envelope.cookie();
        let deadline = envelope.deadline();
        {
            let mut queue = self.queue.lock();
            queue.push(envelope)?;
            if let Some(at) = deadline {
                self.timer.arm_no_later_than(at);
            }
        }
        self.wait.notify();
        debug!(conn_id = self.id, cookie, has_deadline = deadline.is_some(), "message enqueued");
        Ok(())
    }

    pub fn dequeue(&self) -> Option<Arc<Envelope>> {
        self.queue.lock().pop_front()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn timer_expires(&self) -> Option<Instant> {
        self.timer.expires()
    }

    pub fn timer_fired(&self) -> u64 {
        self.timer.fired()
    }

    /// 回收过期条目并重排定时器。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：`now` 在进入队列锁之前一次性读取；截止时间 `<= now` 的条目被移除，
    ///   其信封引用随移除释放；幸存条目中最早的截止时间成为定时器的新到期时间，
    ///   不存在则定时器保持未武装；
    /// - **执行 (How)**：超时通知在释放本连接队列锁之后投递；源 id 为 0 的条目不会收到通知。
    pub fn scan_timeouts(&self) -> ScanReport {
        let now = self.clock.now();
        let outcome = {
            let mut queue = self.queue.lock();
            let outcome = queue.reap_expired(now);
            match outcome.next_deadline {
                Some(at) => self.timer.arm_at(at),
                None => self.timer.disarm(),
            }
            outcome
        };

        let mut notified = 0;
        for notice in &outcome.expired {
            warn!(
                conn_id = self.id,
                sender = notice.sender,
                cookie = notice.cookie,
                "message expired before delivery"
            );
            if self.notify_sender(*notice) {
                notified += 1;
            }
        }
        if !outcome.expired.is_empty() || outcome.next_deadline.is_some() {
            debug!(
                conn_id = self.id,
                expired = outcome.expired.len(),
                next_deadline = ?outcome.next_deadline,
                "timeout scan finished"
            );
        }

        ScanReport {
            expired: outcome.expired,
            notified,
            next_deadline: outcome.next_deadline,
        }
    }

    fn notify_sender(&self, notice: TimeoutNotice) -> bool {
        if notice.sender == KERNEL_ID {
            return false;
        }
        let Some(sender) = self.bus.upgrade().and_then(|bus| bus.connection(notice.sender)) else {
            return false;
        };
        match sender.enqueue(Envelope::reply_timeout(notice.sender, notice.cookie).into_shared()) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    conn_id = self.id,
                    sender = notice.sender,
                    code = err.code(),
                    "timeout notification dropped"
                );
                false
            }
        }
    }

    /// 取消并等待定时器退出。
    pub(crate) fn stop_timer(&self) {
        self.timer.shutdown();
    }

    /// 关闭队列并释放全部条目，返回被丢弃的条目数。
    pub(crate) fn drain(&self) -> usize {
        self.queue.lock().close()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .field("pending", &self.pending())
            .field("timer", &self.timer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{Destination, Payload};
    use crate::time::MockClock;
    use std::time::Duration;

    fn detached_peer(clock: &MockClock) -> Arc<Peer> {
        Peer::new(
            5,
            Weak::new(),
            Arc::new(ReadyWait::new()),
            Arc::new(clock.clone()),
            8,
        )
    }

    #[test]
    fn activation_happens_once() {
        let peer = detached_peer(&MockClock::new());
        assert_eq!(peer.activate(true), Ok(5));
        assert!(peer.is_starter());
        assert_eq!(peer.activate(false), Err(BusError::Busy { id: 5 }));
        assert!(peer.is_starter(), "失败的激活不得改写 starter 标记");
    }

    #[test]
    fn enqueue_tightens_timer_and_scan_rearms() {
        let clock = MockClock::new();
        let peer = detached_peer(&clock);
        let base = clock.now();
        let late = Envelope::data(9, Destination::Id(5), 1, &b"late"[..])
            .with_deadline(base + Duration::from_millis(200));
        let early = Envelope::data(9, Destination::Id(5), 2, &b"early"[..])
            .with_deadline(base + Duration::from_millis(100));
        peer.enqueue(late.into_shared()).unwrap();
        peer.enqueue(early.into_shared()).unwrap();
        assert_eq!(peer.timer_expires(), Some(base + Duration::from_millis(100)));

        clock.advance(Duration::from_millis(120));
        let report = peer.scan_timeouts();
        assert_eq!(report.expired, vec![TimeoutNotice { sender: 9, cookie: 2 }]);
        assert_eq!(report.notified, 0, "没有总线时通知无处投递");
        assert_eq!(report.next_deadline, Some(base + Duration::from_millis(200)));
        assert_eq!(peer.timer_expires(), Some(base + Duration::from_millis(200)));
        assert_eq!(peer.pending(), 1);
    }

    #[test]
    fn drain_releases_and_refuses_later_enqueue() {
        let peer = detached_peer(&MockClock::new());
        let shared = Envelope::data(1, Destination::Id(5), 3, &b"x"[..]).into_shared();
        peer.enqueue(Arc::clone(&shared)).unwrap();
        assert_eq!(peer.drain(), 1);
        assert_eq!(Arc::strong_count(&shared), 1);
        let again = Envelope::new(1, Destination::Id(5), 4, Payload::Data(Default::default()));
        assert!(matches!(
            peer.enqueue(again.into_shared()),
            Err(BusError::NotFound { .. })
        ));
    }
}
