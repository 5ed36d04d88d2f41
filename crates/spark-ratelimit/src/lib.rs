//! spark-ratelimit: 单进程内并发安全的令牌桶限流器。
//!
//! # 教案式概览
//! - **意图（Why）**：调用方在执行一次受限工作前申请许可；容量内立即放行，否则阻塞到令牌补出或调用方取消。
//! - **结构（How）**：[`time`] 提供可注入的时钟抽象，[`cancel`] 提供可等待的取消信号，[`limiter`] 实现令牌桶状态机与
//!   获取循环，[`config`] 与 [`error`] 承载构造参数与错误域。
//! - **契约（What）**：限流器只依赖注入的 [`Clock`] 的 `now`/`sleep` 能力，不持久化状态，不做跨进程协调，
//!   也不对阻塞中的调用方排队。
//!
//! ```
//! use std::time::Duration;
//! use spark_ratelimit::{Cancellation, Limiter};
//!
//! let limiter = Limiter::new(10, Duration::from_secs(60)).unwrap();
//! let cancellation = Cancellation::new();
//! limiter.acquire_blocking(&cancellation).unwrap();
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod limiter;
pub mod time;

pub use cancel::{CancelReason, Cancellation, Cancelled};
pub use config::LimiterConfig;
pub use error::{ConfigError, LimiterError};
pub use limiter::Limiter;
pub use time::{Clock, MockClock, Sleep, SystemClock};
