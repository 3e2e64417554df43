use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// 时钟推进通知的接收方。
///
/// # 契约说明（What）
/// - 虚拟时钟每次推进后调用 [`ClockListener::clock_advanced`]；
/// - 实现必须非阻塞，且不得在回调中再次推进时钟。
pub trait ClockListener: Send + Sync {
    /// 时钟已推进，接收方应重新评估自己的截止时间。
    fn clock_advanced(&self);
}

/// 抽象可注入的单调时钟。
///
/// # 设计背景（Why）
/// - 消息截止时间与超时扫描全部依赖时间源；若直接调用系统时钟，扫描器行为无法在测试中复现。
///
/// # 接口约束（What）
/// - `now`：返回当前单调时间点，实现者必须保证单调不减；
/// - `subscribe`：登记推进通知。真实时钟随物理时间流逝，无需通知，因此默认实现为空；
///   虚拟时钟需要在 `advance` 时唤醒登记的定时器。
///
/// # 使用指引（How）
/// - 通过 `Arc<dyn Clock>` 注入 [`crate::Subsystem`]；
/// - 测试中注入 [`MockClock`] 并调用 `advance` 推进时间。
pub trait Clock: Send + Sync + 'static {
    /// 返回当前的单调时间点。
    fn now(&self) -> Instant;

    /// 登记推进通知；接收方以 `Weak` 持有，释放后自动失效。
    fn subscribe(&self, listener: Weak<dyn ClockListener>) {
        let _ = listener;
    }
}

/// 基于 [`Instant::now`] 的系统时钟。
#[derive(Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 虚拟时钟：通过手动推进时间在测试中复现确定性的扫描序列。
///
/// # 行为概览（How）
/// - 内部维护 `elapsed`（自构造起的偏移量）与订阅者列表；
/// - `advance` 增加偏移量，随后按登记顺序通知仍然存活的订阅者；
/// - 已释放的订阅者在下一次推进时被剔除。
///
/// # 契约说明（What）
/// - `advance` 可以多次调用，偏移量单调增加；
/// - 通知在释放内部锁之后发出，订阅者可以在回调中读取 `now`。
#[derive(Clone)]
pub struct MockClock {
    inner: Arc<MockClockInner>,
}

impl std::fmt::Debug for MockClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MockClock")
            .field("origin", &state.origin)
            .field("elapsed", &state.elapsed)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

impl MockClock {
    /// 创建起始时间为当前系统时间的虚拟时钟。
    pub fn new() -> Self {
        Self::with_start(Instant::now())
    }

    /// 以指定起始时间构造虚拟时钟，便于在测试中固定初始偏移。
    pub fn with_start(origin: Instant) -> Self {
        Self {
            inner: Arc::new(MockClockInner {
                state: Mutex::new(ClockState {
                    origin,
                    elapsed: Duration::ZERO,
                    listeners: Vec::new(),
                }),
            }),
        }
    }

    /// 手动推进虚拟时钟，并通知所有存活的订阅者。
    pub fn advance(&self, delta: Duration) {
        if delta.is_zero() {
            return;
        }

        let mut to_notify = Vec::new();
        {
            let mut guard = self.inner.state.lock();
            guard.elapsed = guard.elapsed.saturating_add(delta);
            guard.listeners.retain(|listener| match listener.upgrade() {
                Some(live) => {
                    to_notify.push(live);
                    true
                }
                None => false,
            });
        }

        for listener in to_notify {
            listener.clock_advanced();
        }
    }

    /// 返回自起始时间以来的虚拟时间偏移。
    pub fn elapsed(&self) -> Duration {
        self.inner.state.lock().elapsed
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        let guard = self.inner.state.lock();
        guard.origin + guard.elapsed
    }

    fn subscribe(&self, listener: Weak<dyn ClockListener>) {
        self.inner.state.lock().listeners.push(listener);
    }
}

struct MockClockInner {
    state: Mutex<ClockState>,
}

struct ClockState {
    origin: Instant,
    elapsed: Duration,
    listeners: Vec<Weak<dyn ClockListener>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl ClockListener for Counter {
        fn clock_advanced(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn advance_moves_now_and_notifies_live_listeners() {
        let clock = MockClock::new();
        let start = clock.now();
        let live = Arc::new(Counter(AtomicUsize::new(0)));
        let weak: Weak<dyn ClockListener> = Arc::downgrade(&live) as Weak<dyn ClockListener>;
        clock.subscribe(weak);

        clock.advance(Duration::from_millis(10));
        assert_eq!(clock.now() - start, Duration::from_millis(10));
        assert_eq!(live.0.load(Ordering::SeqCst), 1);

        clock.advance(Duration::ZERO);
        assert_eq!(live.0.load(Ordering::SeqCst), 1, "零推进不应触发通知");
    }

    #[test]
    fn dropped_listeners_are_pruned() {
        let clock = MockClock::new();
        {
            let gone = Arc::new(Counter(AtomicUsize::new(0)));
            clock.subscribe(Arc::downgrade(&gone) as Weak<dyn ClockListener>);
        }
        clock.advance(Duration::from_millis(1));
        assert_eq!(clock.inner.state.lock().listeners.len(), 0);
    }
}
