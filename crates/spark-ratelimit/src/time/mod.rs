//! 时间抽象模块：限流器只通过 [`Clock`] 读取时间与等待，不直接触碰系统时钟。
//!
//! # 模块定位（Why）
//! - 令牌补充完全由“距上次记账经过的时长”驱动，若直接读取系统时钟，容量耗尽后的阻塞路径将无法在测试中复现；
//! - `Clock` trait 统一 `now` 与 `sleep` 两个原语，生产环境与测试环境之间只需替换注入的实现。
//!
//! # 结构概览（What）
//! - [`clock::Clock`]：核心时钟 trait；
//! - [`clock::SystemClock`]：基于标准库线程的生产实现，也是所有默认构造函数使用的时钟；
//! - [`clock::TokioClock`]：启用 `runtime-tokio` 时可用的 Tokio 实现；
//! - [`clock::MockClock`]：可手动推进并记录调用轨迹的虚拟时钟。

pub mod clock;

#[cfg(feature = "runtime-tokio")]
pub use clock::TokioClock;
pub use clock::{Clock, MockClock, Sleep, SystemClock};
