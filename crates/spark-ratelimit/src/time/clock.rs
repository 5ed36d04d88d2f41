use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::{Duration, Instant};

/// `Sleep` 为时钟接口返回的统一延迟 Future 类型。
///
/// # 契约说明（What）
/// - Future 完成时表示指定的持续时间已经过去，且只完成一次；
/// - 必须满足 `Send + 'static`，以便与取消信号在任意执行器上竞速；
/// - 被提前 Drop 时不得产生任何副作用（限流器在取消获胜后会直接丢弃它）。
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// 抽象可注入的时钟，实现统一的“获取当前时间”与“等待指定时间”能力。
///
/// # 设计背景（Why）
/// - 限流器的补充与等待均依赖时间来源；通过 trait 注入，生产环境使用真实时间，测试中使用可控的虚拟时间；
/// - 时钟随限流器实例一起传递，不存在进程级可替换的全局时钟，测试之间互不干扰。
///
/// # 接口约束（What）
/// - `now`：返回当前单调时间点，多次调用不得回退；
/// - `sleep`：返回一个在给定持续时间后完成的 Future；
/// - 调用方不得假设任何实时性保证，限流器每次醒来都会重新读取 `now` 计算实际经过的时长。
pub trait Clock: Send + Sync + 'static {
    /// 返回当前的单调时间点。
    fn now(&self) -> Instant;

    /// 返回一个在指定持续时间后完成的睡眠 Future。
    fn sleep(&self, duration: Duration) -> Sleep;
}

/// 基于标准库线程实现的系统时钟。
///
/// # 契约说明（What）
/// - `now` 直接返回 [`Instant::now`]；
/// - `sleep` 启动后台线程执行阻塞睡眠，完成后唤醒 Future；
/// - 限流器的轮询间隔为 `window / capacity`，在该节律下为每次等待启动一个辅助线程的开销可以接受；
///   高频低延迟场景可启用 `runtime-tokio` 改用 [`TokioClock`]。
#[derive(Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(ThreadSleep::new(duration))
    }
}

/// 线程驱动的睡眠 Future。
///
/// 构造时立即启动后台线程，线程以 `park_timeout` 分段等待到期；到期后标记完成并唤醒最近登记的 waker。
/// Future 在等待途中被丢弃时会标记 `abandoned` 并 `unpark` 后台线程，线程随即退出，不会为已被取消的等待滞留。
struct ThreadSleep {
    state: Arc<ThreadSleepState>,
    worker: thread::Thread,
}

impl ThreadSleep {
    fn new(duration: Duration) -> Self {
        let (state, worker) = ThreadSleepState::spawn(duration);
        Self { state, worker }
    }
}

impl Future for ThreadSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.state.is_completed() {
            return Poll::Ready(());
        }
        self.state.register_waker(cx.waker());
        // 登记后复查，避免后台线程恰好在登记前完成导致丢失唤醒。
        if self.state.is_completed() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl Drop for ThreadSleep {
    fn drop(&mut self) {
        if !self.state.is_completed() {
            self.state.abandoned.store(true, Ordering::Release);
            self.worker.unpark();
        }
    }
}

struct ThreadSleepState {
    completed: AtomicBool,
    abandoned: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl ThreadSleepState {
    fn spawn(duration: Duration) -> (Arc<Self>, thread::Thread) {
        let state = Arc::new(Self {
            completed: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
            waker: Mutex::new(None),
        });
        let thread_state = Arc::clone(&state);
        let handle = thread::spawn(move || {
            // 超出 `Instant` 表示范围的时长视为永不到期，只能由丢弃 Future 结束。
            let deadline = Instant::now().checked_add(duration);
            loop {
                if thread_state.abandoned.load(Ordering::Acquire) {
                    return;
                }
                match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        // park 可能被伪唤醒，循环复查放弃标记与到期时间。
                        thread::park_timeout(deadline - now);
                    }
                    None => thread::park(),
                }
            }
            thread_state.finish();
        });
        (state, handle.thread().clone())
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    fn register_waker(&self, waker: &Waker) {
        let mut slot = lock(&self.waker);
        if !slot.as_ref().is_some_and(|existing| existing.will_wake(waker)) {
            *slot = Some(waker.clone());
        }
    }

    fn finish(&self) {
        self.completed.store(true, Ordering::Release);
        let maybe_waker = lock(&self.waker).take();
        if let Some(waker) = maybe_waker {
            waker.wake();
        }
    }
}

/// 基于 Tokio 定时器的时钟实现。
///
/// `sleep` 返回的 Future 必须在 Tokio 运行时（启用 `time` 驱动）内轮询。
#[cfg(feature = "runtime-tokio")]
#[derive(Clone, Debug, Default)]
pub struct TokioClock;

#[cfg(feature = "runtime-tokio")]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// 虚拟时钟：通过手动推进时间在测试中复现确定性的补充与唤醒序列。
///
/// # 行为概览（How）
/// - 内部维护 `elapsed`（自构造起的偏移量）与待触发的睡眠列表；
/// - `advance` 增加偏移量并按登记顺序唤醒到期的睡眠 Future；
/// - 记录 `now`/`sleep` 的调用次数，测试据此断言限流器是否进入了阻塞等待；
/// - 自动推进模式下，`sleep(d)` 立即把虚拟时间推进 `d` 并完成，适合同步阻塞调用的测试。
///
/// # 契约说明（What）
/// - 克隆体共享同一份虚拟时间与调用计数；
/// - `sleep` 返回的 Future 在未到期前返回 `Poll::Pending`；
/// - 若 Future 被提前 Drop，将从调度队列中移除。
#[derive(Clone, Debug)]
pub struct MockClock {
    inner: Arc<MockClockInner>,
}

impl MockClock {
    /// 创建起始时间为当前系统时间的虚拟时钟。
    pub fn new() -> Self {
        Self::with_start(Instant::now())
    }

    /// 以指定起始时间构造虚拟时钟，便于在测试中固定初始偏移。
    pub fn with_start(origin: Instant) -> Self {
        Self::build(origin, false)
    }

    /// 构造自动推进的虚拟时钟：每次 `sleep(d)` 都会把虚拟时间推进 `d` 并立即完成。
    pub fn auto_advance() -> Self {
        Self::build(Instant::now(), true)
    }

    fn build(origin: Instant, auto_advance: bool) -> Self {
        let state = ClockState {
            origin,
            elapsed: Duration::ZERO,
            sleepers: Vec::new(),
            next_id: 0,
        };
        Self {
            inner: Arc::new(MockClockInner {
                state: Mutex::new(state),
                auto_advance,
                now_calls: AtomicUsize::new(0),
                sleep_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// 手动推进虚拟时钟。
    ///
    /// # 契约说明（What）
    /// - 偏移量单调增加，`delta` 为零时不做任何事；
    /// - 函数返回前，所有到期的睡眠 Future 已被唤醒；
    /// - 唤醒顺序按照睡眠登记顺序稳定排序。
    pub fn advance(&self, delta: Duration) {
        if delta.is_zero() {
            return;
        }

        let mut to_wake = Vec::new();
        let mut guard = self.inner.lock_state();
        guard.elapsed = guard.elapsed.saturating_add(delta);
        let elapsed = guard.elapsed;
        guard.sleepers.retain(|entry| {
            if entry.cancelled.load(Ordering::SeqCst) {
                return false;
            }
            if elapsed >= entry.deadline {
                entry.completed.store(true, Ordering::SeqCst);
                if let Some(waker) = entry.take_waker() {
                    to_wake.push(waker);
                }
                false
            } else {
                true
            }
        });
        drop(guard);

        for waker in to_wake {
            waker.wake();
        }
    }

    /// 返回自起始时间以来的虚拟时间偏移。
    pub fn elapsed(&self) -> Duration {
        self.inner.lock_state().elapsed
    }

    /// 当前仍在等待的睡眠 Future 数量。
    pub fn pending_sleepers(&self) -> usize {
        self.inner.lock_state().sleepers.len()
    }

    pub fn now_calls(&self) -> usize {
        self.inner.now_calls.load(Ordering::SeqCst)
    }

    pub fn sleep_calls(&self) -> usize {
        self.inner.sleep_calls.load(Ordering::SeqCst)
    }

    /// 自构造或上次 [`reset_calls`](Self::reset_calls) 以来是否读取过 `now`。
    pub fn now_called(&self) -> bool {
        self.now_calls() > 0
    }

    /// 自构造或上次 [`reset_calls`](Self::reset_calls) 以来是否发起过 `sleep`，即调用方是否进入了阻塞等待。
    pub fn sleep_called(&self) -> bool {
        self.sleep_calls() > 0
    }

    /// 清零调用计数，不影响虚拟时间与待触发的睡眠。
    pub fn reset_calls(&self) {
        self.inner.now_calls.store(0, Ordering::SeqCst);
        self.inner.sleep_calls.store(0, Ordering::SeqCst);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.inner.now_calls.fetch_add(1, Ordering::SeqCst);
        let guard = self.inner.lock_state();
        guard.origin + guard.elapsed
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        self.inner.sleep_calls.fetch_add(1, Ordering::SeqCst);
        let state = {
            let mut guard = self.inner.lock_state();
            let deadline = guard.elapsed.saturating_add(duration);
            let id = guard.next_id;
            guard.next_id += 1;
            let state = Arc::new(SleepState::new(id, deadline));
            guard.sleepers.push(Arc::clone(&state));
            state
        };

        if self.inner.auto_advance {
            self.advance(duration);
        }

        Box::pin(MockSleep {
            inner: Arc::clone(&self.inner),
            state,
        })
    }
}

#[derive(Debug)]
struct MockClockInner {
    state: Mutex<ClockState>,
    auto_advance: bool,
    now_calls: AtomicUsize,
    sleep_calls: AtomicUsize,
}

impl MockClockInner {
    fn lock_state(&self) -> MutexGuard<'_, ClockState> {
        lock(&self.state)
    }
}

#[derive(Debug)]
struct ClockState {
    origin: Instant,
    elapsed: Duration,
    sleepers: Vec<Arc<SleepState>>,
    next_id: usize,
}

#[derive(Debug)]
struct SleepState {
    id: usize,
    deadline: Duration,
    waker: Mutex<Option<Waker>>,
    completed: AtomicBool,
    cancelled: AtomicBool,
}

impl SleepState {
    fn new(id: usize, deadline: Duration) -> Self {
        Self {
            id,
            deadline,
            waker: Mutex::new(None),
            completed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    fn take_waker(&self) -> Option<Waker> {
        lock(&self.waker).take()
    }

    fn store_waker(&self, waker: &Waker) {
        let mut guard = lock(&self.waker);
        if guard
            .as_ref()
            .is_some_and(|existing| existing.will_wake(waker))
        {
            return;
        }
        *guard = Some(waker.clone());
    }
}

struct MockSleep {
    inner: Arc<MockClockInner>,
    state: Arc<SleepState>,
}

impl Future for MockSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.state.completed.load(Ordering::SeqCst) {
            return Poll::Ready(());
        }

        let elapsed = self.inner.lock_state().elapsed;
        if elapsed >= self.state.deadline {
            self.state.completed.store(true, Ordering::SeqCst);
            return Poll::Ready(());
        }

        self.state.store_waker(cx.waker());
        Poll::Pending
    }
}

impl Drop for MockSleep {
    fn drop(&mut self) {
        if !self.state.completed.load(Ordering::SeqCst) {
            self.state.cancelled.store(true, Ordering::SeqCst);
            self.state.take_waker();
            let id = self.state.id;
            self.inner.lock_state().sleepers.retain(|entry| entry.id != id);
        }
    }
}

/// 时钟内部的临界区只做赋值与列表维护，不会留下半更新状态，因此中毒后直接沿用内部数据。
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
