//! 限流器配置：容量与补满窗口的声明式描述。
//!
//! # 使用指引（How）
//! - 代码内直接构造：[`LimiterConfig::new`]；
//! - 由宿主从 TOML 片段解析：[`LimiterConfig::from_toml_str`]，窗口以毫秒书写：
//!
//! ```toml
//! capacity = 5
//! window_ms = 60000
//! ```
//!
//! 本 crate 不读取环境变量或配置文件，配置的来源完全由宿主决定。

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

/// 令牌桶参数：`window` 时长内补满 `capacity` 个令牌。
///
/// # 契约说明（What）
/// - `capacity >= 1`，`window > 0`，经由 [`validate`](Self::validate) 校验；
/// - 构造完成后两者均不可变，限流器只读取一次。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimiterConfig {
    pub capacity: u32,
    #[serde(rename = "window_ms", deserialize_with = "deserialize_millis")]
    pub window: Duration,
}

impl LimiterConfig {
    /// 构造并校验配置。
    pub fn new(capacity: u32, window: Duration) -> Result<Self, ConfigError> {
        let config = Self { capacity, window };
        config.validate()?;
        Ok(config)
    }

    /// 解析 TOML 片段并校验。
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// 拒绝会导致除零或补充速率恒为零的参数。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.window.is_zero() {
            return Err(ConfigError::ZeroWindow);
        }
        Ok(())
    }
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
