//! # DeadlineTimer：可取消、可重排的延迟任务
//!
//! ## 核心意图（Why）
//! - 每个端点连接拥有一个超时扫描定时器；定时器到期后在后台线程执行扫描回调，
//!   回调从不在命令调用的线程内联执行；
//! - 关闭连接时必须先 [`shutdown`](DeadlineTimer::shutdown) 定时器：标记停止、唤醒并 join
//!   工作线程，之后才允许拆除队列，消除“定时器触发”与“连接关闭”之间的竞态。
//!
//! ## 行为契约（What）
//! - 初始为未武装（disarmed）；
//! - `arm_at`：将到期时间精确设为给定时刻（覆盖旧值）；
//! - `arm_no_later_than`：仅当未武装或新时刻更早时才更新，入队路径使用；
//! - `disarm`：取消到期时间；
//! - 每次触发前工作线程先把到期时间清空，因此回调若不重新武装，定时器即保持未武装。
//!
//! ## 并发约束
//! - 状态锁是锁序中的叶子：持有队列锁时可以武装定时器，反之不允许；
//! - 回调执行期间不持有状态锁。

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::warn;

use crate::error::{BusError, Result};
use crate::time::{Clock, ClockListener};

pub struct DeadlineTimer {
    shared: Arc<TimerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
    clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct TimerState {
    expires: Option<Instant>,
    shutdown: bool,
    fired: u64,
}

impl ClockListener for TimerShared {
    fn clock_advanced(&self) {
        // 持锁通知，避免工作线程读取 `now` 与进入等待之间丢失唤醒。
        let _guard = self.state.lock();
        self.wake.notify_all();
    }
}

impl DeadlineTimer {
    /// 创建未启动、未武装的定时器。
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                state: Mutex::new(TimerState::default()),
                wake: Condvar::new(),
                clock,
            }),
            worker: Mutex::new(None),
        }
    }

    /// 启动工作线程。线程创建失败映射为 *out-of-memory*。
    pub fn start<F>(&self, thread_name: String, callback: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || run(shared, callback))
            .map_err(|err| BusError::OutOfMemory {
                detail: format!("cannot spawn timer thread: {err}"),
            })?;

        let listener: Weak<dyn ClockListener> =
            Arc::downgrade(&self.shared) as Weak<dyn ClockListener>;
        self.shared.clock.subscribe(listener);
        *worker = Some(handle);
        Ok(())
    }

    /// 关闭后的武装请求被忽略。
    pub fn arm_at(&self, at: Instant) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        state.expires = Some(at);
        self.shared.wake.notify_all();
    }

    pub fn arm_no_later_than(&self, at: Instant) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        if state.expires.is_none_or(|current| at < current) {
            state.expires = Some(at);
            self.shared.wake.notify_all();
        }
    }

    pub fn disarm(&self) {
        self.shared.state.lock().expires = None;
    }

    /// 当前到期时间；`None` 表示未武装。
    pub fn expires(&self) -> Option<Instant> {
        self.shared.state.lock().expires
    }

    /// 已触发回调的次数。
    pub fn fired(&self) -> u64 {
        self.shared.state.lock().fired
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// 停止定时器并等待工作线程退出（cancel-and-wait）。
    ///
    /// - 幂等；
    /// - 若在工作线程自身内调用（回调中释放了最后一个连接引用），只标记停止，不 join 自己。
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.expires = None;
            self.shared.wake.notify_all();
        }

        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("deadline timer worker panicked before shutdown");
        }
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DeadlineTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("DeadlineTimer")
            .field("expires", &state.expires)
            .field("shutdown", &state.shutdown)
            .field("fired", &state.fired)
            .finish()
    }
}

fn run<F>(shared: Arc<TimerShared>, mut callback: F)
where
    F: FnMut(),
{
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        match state.expires {
            None => shared.wake.wait(&mut state),
            Some(at) => {
                let now = shared.clock.now();
                if at <= now {
                    state.expires = None;
                    state.fired += 1;
                    MutexGuard::unlocked(&mut state, &mut callback);
                } else {
                    shared.wake.wait_for(&mut state, at - now);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::MockClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn wait_until(mut predicate: impl FnMut() -> bool) -> bool {
        let give_up = Instant::now() + Duration::from_secs(5);
        while Instant::now() < give_up {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        predicate()
    }

    #[test]
    fn fires_once_when_mock_clock_passes_deadline() {
        let clock = MockClock::new();
        let timer = DeadlineTimer::new(Arc::new(clock.clone()));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        timer
            .start("timer-test".into(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        timer.arm_at(clock.now() + Duration::from_millis(100));
        clock.advance(Duration::from_millis(50));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 0, "未到期不得触发");

        clock.advance(Duration::from_millis(60));
        assert!(wait_until(|| hits.load(Ordering::SeqCst) == 1));
        assert_eq!(timer.expires(), None, "触发后保持未武装");
        timer.shutdown();
        assert_eq!(timer.fired(), 1);
    }

    #[test]
    fn arm_no_later_than_keeps_the_earliest() {
        let clock = MockClock::new();
        let timer = DeadlineTimer::new(Arc::new(clock.clone()));
        let base = clock.now();
        timer.arm_no_later_than(base + Duration::from_millis(30));
        timer.arm_no_later_than(base + Duration::from_millis(50));
        assert_eq!(timer.expires(), Some(base + Duration::from_millis(30)));
        timer.arm_no_later_than(base + Duration::from_millis(10));
        assert_eq!(timer.expires(), Some(base + Duration::from_millis(10)));
        timer.disarm();
        assert_eq!(timer.expires(), None);
    }

    #[test]
    fn shutdown_joins_and_is_idempotent() {
        let clock = MockClock::new();
        let timer = DeadlineTimer::new(Arc::new(clock.clone()));
        timer.start("timer-shutdown".into(), || {}).unwrap();
        timer.arm_at(clock.now() + Duration::from_secs(3600));
        timer.shutdown();
        timer.shutdown();
        assert!(timer.is_shut_down());
        assert_eq!(timer.expires(), None);

        timer.arm_at(clock.now());
        assert_eq!(timer.expires(), None, "关闭后不再接受武装");
    }
}
