//! 令牌桶限流器：刷新-扣减的临界区与阻塞获取循环。
//!
//! # 结构概览（What）
//! - [`Limiter`]：持有不可变的 `capacity`/`window` 与受互斥锁保护的桶状态；
//! - [`Limiter::acquire`]：先尝试一次原子的“补充并取走”，失败后在取消信号与一个轮询间隔之间竞速，循环直至成功或取消；
//! - [`Limiter::try_acquire`]：仅执行一次尝试，从不阻塞。
//!
//! # 补充语义（How）
//! - 每次尝试都以 `elapsed * capacity / window` 的整数部分补充令牌并截断到 `capacity`；
//! - 小数余量在每次尝试时都会被丢弃，不跨调用累积。高频小间隔的调用因此可能比一次性大跨度计算少补充令牌，
//!   这是既有的精度取舍，调用方依赖的正是这一行为。

use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

#[cfg(not(any(loom, spark_loom)))]
use std::sync::{Mutex, MutexGuard};
#[cfg(any(loom, spark_loom))]
use loom::sync::{Mutex, MutexGuard};

use futures_util::future::{Either, select};

use crate::cancel::{CancelReason, Cancellation};
use crate::config::LimiterConfig;
use crate::error::{ConfigError, LimiterError};
use crate::time::{Clock, SystemClock};

/// 轮询间隔下限：`window` 小于 `capacity` 纳秒时避免零时长等待造成忙等。
const MIN_POLL_INTERVAL: Duration = Duration::from_nanos(1);

/// 并发安全的令牌桶限流器。
///
/// # 教案式说明
/// - **意图 (Why)**：在单进程内为一类受限资源发放“执行一次工作”的许可，容量内的突发立即放行，超出后按
///   `capacity / window` 的平均速率放行；
/// - **契约 (What)**：
///   - 构造时桶为满，`last_refill` 取构造时刻的时钟读数；
///   - 任意时刻 `0 <= tokens <= capacity`，每次成功获取恰好扣减 1；
///   - 多个调用方可共享同一实例（通常经由 `Arc<Limiter>`），阻塞中的调用方之间不保证先后顺序；
/// - **执行逻辑 (How)**：唯一的临界区是“读时钟、补充、扣减”三步，持锁期间既不等待也不观测取消；
///   等待阶段不持有任何锁，因此一个阻塞中的调用方不会阻止其他调用方尝试。
/// - **风险提示 (Trade-offs)**：等待间隔按均匀补充假设取 `window / capacity`，并非精确计算下一枚令牌的到达时刻，
///   刚补出的令牌最多晚一个轮询间隔才被等待者取走；换来的是 O(1) 状态且无需为每个等待者调度精确唤醒。
pub struct Limiter {
    capacity: u32,
    window: Duration,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    last_refill: Instant,
    tokens: u32,
}

impl Limiter {
    /// 使用系统时钟构造限流器：`window` 时长内最多放行 `capacity` 次工作。
    ///
    /// 例如 `Limiter::new(10, Duration::from_secs(60))` 允许每分钟 10 次，且构造后可立即连续取走 10 个令牌。
    pub fn new(capacity: u32, window: Duration) -> Result<Self, ConfigError> {
        Self::with_clock(capacity, window, Arc::new(SystemClock))
    }

    /// 以注入的时钟构造限流器。
    ///
    /// # 错误
    /// - `capacity == 0` 返回 [`ConfigError::ZeroCapacity`]；
    /// - `window` 为零返回 [`ConfigError::ZeroWindow`]。
    pub fn with_clock(
        capacity: u32,
        window: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let config = LimiterConfig::new(capacity, window)?;
        Ok(Self::build(&config, clock))
    }

    /// 由已解析的配置构造使用系统时钟的限流器。
    pub fn from_config(config: &LimiterConfig) -> Result<Self, ConfigError> {
        Self::from_config_with_clock(config, Arc::new(SystemClock))
    }

    /// 由已解析的配置与注入的时钟构造限流器。
    pub fn from_config_with_clock(
        config: &LimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config, clock))
    }

    fn build(config: &LimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = config.capacity;
        let window = config.window;
        let poll_interval = (window / capacity).max(MIN_POLL_INTERVAL);
        let bucket = Bucket {
            last_refill: clock.now(),
            tokens: capacity,
        };
        tracing::debug!(
            target: "spark_ratelimit",
            capacity,
            window_ms = window.as_millis() as u64,
            poll_interval_us = poll_interval.as_micros() as u64,
            "token bucket limiter created"
        );
        Self {
            capacity,
            window,
            poll_interval,
            clock,
            bucket: Mutex::new(bucket),
        }
    }

    /// 桶的最大令牌数，构造后不可变。
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// 从空桶补满 `capacity` 个令牌所需的时长。
    pub fn window(&self) -> Duration {
        self.window
    }

    /// 桶为空时两次尝试之间的等待时长，即 `window / capacity`。
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// 申请一个令牌，必要时等待。
    ///
    /// # 契约说明（What）
    /// - 有令牌可用时立即返回 `Ok(())`，不检查取消信号、不发起任何等待；
    /// - 桶为空时在 `cancellation` 触发与一个 [`poll_interval`](Self::poll_interval) 之间竞速，
    ///   间隔先到则重试，取消先到则返回 [`LimiterError::Cancelled`] 并携带原因；
    /// - 信号携带截止时间时，截止时间按注入时钟判定，且单次等待不会越过截止时间；
    /// - 除取消外没有其他失败路径，也没有独立于取消信号的超时。
    pub async fn acquire(&self, cancellation: &Cancellation) -> Result<(), LimiterError> {
        loop {
            if self.try_acquire() {
                return Ok(());
            }

            let now = self.clock.now();
            if cancellation.expire_if_due(now) {
                return Err(self.cancelled(cancellation));
            }
            let wait = match cancellation.remaining(now) {
                Some(remaining) => self.poll_interval.min(remaining),
                None => self.poll_interval,
            };

            tracing::debug!(
                target: "spark_ratelimit",
                wait_us = wait.as_micros() as u64,
                "token bucket empty, waiting"
            );
            // 取消分支放在前面：二者同时就绪时优先报告取消。
            match select(cancellation.cancelled(), self.clock.sleep(wait)).await {
                Either::Left((reason, _)) => {
                    tracing::debug!(target: "spark_ratelimit", %reason, "acquire cancelled");
                    return Err(LimiterError::Cancelled { reason });
                }
                Either::Right(((), _)) => {}
            }
        }
    }

    /// [`acquire`](Self::acquire) 的同步版本，在当前线程上阻塞直至取得令牌或被取消。
    ///
    /// 不要在异步执行器的工作线程上调用，否则会阻塞该线程上的其他任务。
    pub fn acquire_blocking(&self, cancellation: &Cancellation) -> Result<(), LimiterError> {
        futures::executor::block_on(self.acquire(cancellation))
    }

    /// 执行一次原子的“补充并取走”，成功返回 `true`，从不阻塞。
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.lock_bucket();
        self.refill(&mut bucket);
        if bucket.tokens == 0 {
            return false;
        }
        bucket.tokens -= 1;
        tracing::trace!(
            target: "spark_ratelimit",
            remaining = bucket.tokens,
            "token granted"
        );
        true
    }

    /// 执行一次补充记账（不取走令牌）并返回当前可用令牌数。
    ///
    /// 与 [`try_acquire`](Self::try_acquire) 一样会推进 `last_refill`，因此同样会丢弃小数余量。
    pub fn available(&self) -> u32 {
        let mut bucket = self.lock_bucket();
        self.refill(&mut bucket);
        bucket.tokens
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if now > bucket.last_refill {
            bucket.last_refill = now;
        }

        let accrued = elapsed.as_nanos() * u128::from(self.capacity) / self.window.as_nanos();
        let refilled = (u128::from(bucket.tokens) + accrued).min(u128::from(self.capacity));
        // 截断到 capacity 之后必然落在 u32 范围内。
        bucket.tokens = refilled as u32;
        if accrued > 0 {
            tracing::trace!(
                target: "spark_ratelimit",
                accrued = accrued.min(u128::from(u32::MAX)) as u64,
                tokens = bucket.tokens,
                "token bucket refilled"
            );
        }
    }

    fn cancelled(&self, cancellation: &Cancellation) -> LimiterError {
        // `expire_if_due` 返回 true 时原因必然已经写入。
        let reason = cancellation
            .reason()
            .unwrap_or(CancelReason::Cancelled);
        tracing::debug!(target: "spark_ratelimit", %reason, "acquire cancelled");
        LimiterError::Cancelled { reason }
    }

    fn lock_bucket(&self) -> MutexGuard<'_, Bucket> {
        // 临界区内没有可能 panic 的中间状态，中毒后直接沿用桶数据。
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("capacity", &self.capacity)
            .field("window", &self.window)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
