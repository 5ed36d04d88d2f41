//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 限流器对外只暴露一种运行期错误：等待被取消；容量耗尽、读时钟等情况都在内部吸收为继续等待；
//! - 非法参数在构造期即被拒绝，避免在补充计算中出现除零或永久为零的补充速率。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，与 `std::error::Error` 生态兼容；
//! - 取消错误原样携带取消原因，调用方可区分显式取消与截止时间到期。

use thiserror::Error;

use crate::cancel::CancelReason;

/// [`Limiter::acquire`](crate::Limiter::acquire) 的错误域。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum LimiterError {
    /// 在取得令牌之前，调用方提供的取消信号已经触发。
    ///
    /// 返回该错误时限流器的共享状态未被本次调用修改为不一致形态，也没有发放任何令牌。
    #[error("acquire cancelled: {reason}")]
    Cancelled { reason: CancelReason },
}

impl LimiterError {
    /// 返回触发本次错误的取消原因。
    pub fn reason(&self) -> CancelReason {
        match self {
            Self::Cancelled { reason } => *reason,
        }
    }
}

/// 构造或解析限流器配置时的错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 容量必须至少为 1。
    #[error("limiter capacity must be at least 1")]
    ZeroCapacity,

    /// 补满窗口必须为正时长。
    #[error("limiter window must be a positive duration")]
    ZeroWindow,

    /// TOML 配置无法解析。
    #[error("invalid limiter configuration: {0}")]
    Parse(#[from] toml::de::Error),
}
