//! 取消信号：调用方交给 [`Limiter::acquire`](crate::Limiter::acquire) 的可中断契约。
//!
//! 信号只在阻塞等待阶段被观测；已经进入补充/扣减临界区的尝试总会先完成，再轮到取消生效。

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

// 启用 `--cfg spark_loom` 时切换到 Loom 提供的同步原语，使模型检查能够穷举取消与等待的交错。
#[cfg(not(any(loom, spark_loom)))]
use std::sync::{Mutex, MutexGuard};
#[cfg(not(any(loom, spark_loom)))]
use std::sync::atomic::{AtomicU8, Ordering};
#[cfg(any(loom, spark_loom))]
use loom::sync::{Mutex, MutexGuard};
#[cfg(any(loom, spark_loom))]
use loom::sync::atomic::{AtomicU8, Ordering};

use crate::time::Clock;

const LIVE: u8 = 0;

/// 取消原因，原样透传到 [`LimiterError::Cancelled`](crate::LimiterError::Cancelled)。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum CancelReason {
    /// 调用方显式取消。
    Cancelled = 1,
    /// 信号携带的截止时间已过。
    DeadlineExceeded = 2,
}

impl CancelReason {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Cancelled),
            2 => Some(Self::DeadlineExceeded),
            _ => None,
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("operation cancelled"),
            Self::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

/// 取消原语，统一表达“阻塞获取可被外部打断”的契约。
///
/// # 逻辑解析（How）
/// - 内部以原子字节记录取消原因，`0` 表示仍然有效；首次写入成功的原因即最终原因；
/// - 等待者通过 [`Cancellation::cancelled`] 登记 waker，取消时统一唤醒，Future 被丢弃时自动注销；
/// - 可选的截止时间不会自行触发：由持有时钟的一方（限流器）调用 [`Cancellation::expire_if_due`] 落地为取消。
///
/// # 契约说明（What）
/// - 克隆体与 [`child`](Self::child) 共享同一取消状态与截止时间；
/// - `cancel` 在首次成功设置时返回 `true`，重复调用返回 `false`；
/// - 取消只影响观测它的调用方自己的等待循环，从不触碰限流器的共享状态。
#[derive(Clone, Debug)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
    deadline: Option<Instant>,
}

#[derive(Debug)]
struct CancellationState {
    reason: AtomicU8,
    waiters: Mutex<Waiters>,
}

#[derive(Debug, Default)]
struct Waiters {
    next_id: u64,
    entries: Vec<(u64, Waker)>,
}

impl CancellationState {
    fn lock_waiters(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reason(&self) -> Option<CancelReason> {
        CancelReason::from_code(self.reason.load(Ordering::Acquire))
    }
}

impl Cancellation {
    /// 创建处于“未取消”状态、没有截止时间的取消令牌。
    pub fn new() -> Self {
        Self::build(None)
    }

    /// 创建在 `deadline` 之后视为 [`CancelReason::DeadlineExceeded`] 的取消令牌。
    ///
    /// `deadline` 必须来自与限流器相同的时钟，否则比较没有意义。
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::build(Some(deadline))
    }

    /// 以 `clock.now() + timeout` 作为截止时间构造令牌。
    pub fn with_timeout(clock: &dyn Clock, timeout: Duration) -> Self {
        Self::with_deadline(clock.now() + timeout)
    }

    fn build(deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(CancellationState {
                reason: AtomicU8::new(LIVE),
                waiters: Mutex::new(Waiters::default()),
            }),
            deadline,
        }
    }

    /// 查询当前是否已被标记取消。
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// 返回已经生效的取消原因。
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.reason()
    }

    /// 令牌携带的截止时间，由构造时决定。
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 以 [`CancelReason::Cancelled`] 取消令牌。
    pub fn cancel(&self) -> bool {
        self.cancel_with(CancelReason::Cancelled)
    }

    /// 以指定原因取消令牌并唤醒所有等待者。
    ///
    /// 返回值为 `true` 表示本次调用首次触发取消；之后的调用不会改写原因。
    pub fn cancel_with(&self, reason: CancelReason) -> bool {
        let fired = self
            .inner
            .reason
            .compare_exchange(LIVE, reason as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if fired {
            let wakers = std::mem::take(&mut self.inner.lock_waiters().entries);
            for (_, waker) in wakers {
                waker.wake();
            }
        }
        fired
    }

    /// 若截止时间已过则以 [`CancelReason::DeadlineExceeded`] 触发取消，返回令牌此刻是否已取消。
    pub fn expire_if_due(&self, now: Instant) -> bool {
        if let Some(deadline) = self.deadline
            && now >= deadline
        {
            self.cancel_with(CancelReason::DeadlineExceeded);
        }
        self.is_cancelled()
    }

    /// 距截止时间的剩余时长；没有截止时间时返回 `None`，已过期时返回零。
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// 派生共享同一取消状态的子令牌。
    pub fn child(&self) -> Self {
        self.clone()
    }

    /// 返回在令牌取消时完成的 Future，输出取消原因。
    pub fn cancelled(&self) -> Cancelled<'_> {
        Cancelled {
            state: &self.inner,
            slot: None,
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// [`Cancellation::cancelled`] 返回的 Future。
#[must_use = "futures do nothing unless polled"]
#[derive(Debug)]
pub struct Cancelled<'a> {
    state: &'a CancellationState,
    slot: Option<u64>,
}

impl Future for Cancelled<'_> {
    type Output = CancelReason;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(reason) = self.state.reason() {
            return Poll::Ready(reason);
        }

        let state = self.state;
        let mut waiters = state.lock_waiters();
        // `cancel_with` 先写原因再获取该锁，因此持锁复查后不会漏掉唤醒。
        if let Some(reason) = state.reason() {
            return Poll::Ready(reason);
        }
        match self.slot {
            Some(id) => {
                if let Some((_, waker)) = waiters.entries.iter_mut().find(|(slot, _)| *slot == id) {
                    if !waker.will_wake(cx.waker()) {
                        *waker = cx.waker().clone();
                    }
                } else {
                    waiters.entries.push((id, cx.waker().clone()));
                }
            }
            None => {
                let id = waiters.next_id;
                waiters.next_id += 1;
                waiters.entries.push((id, cx.waker().clone()));
                drop(waiters);
                self.slot = Some(id);
            }
        }
        Poll::Pending
    }
}

impl Drop for Cancelled<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.slot {
            self.state
                .lock_waiters()
                .entries
                .retain(|(slot, _)| *slot != id);
        }
    }
}
