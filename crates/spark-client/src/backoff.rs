//! 子连接重连退避。
//!
//! # 教案级说明
//!
//! ## 意图（Why）
//! - 所有地址同时失败时，客户端不能对后端形成重连风暴；
//! - 只有建连阶段会重试，因此退避只属于子连接，不属于调用。
//!
//! ## 逻辑（How）
//! - 第 `n` 次失败后的基准等待为 `min(base_delay * multiplier^n, max_delay)`；
//! - 在基准之上叠加 `±jitter` 的确定性抖动：种子来自子连接编号与尝试次数，
//!   同一输入总能复现同一等待，测试无需注入随机源；
//! - 连接存活超过 `min_stable_duration` 后，尝试计数归零。
//!
//! ## 契约（What）
//! - 未抖动的序列随尝试次数单调不减，并在 `max_delay` 处封顶；
//! - 抖动后的等待落在 `[base * (1 - jitter), min(base * (1 + jitter), max_delay)]` 内。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::millis;
use crate::error::ClientError;

/// 退避参数。
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    pub multiplier: f64,
    /// 抖动比例，取值 `[0, 1)`。
    pub jitter: f64,
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    /// 连接存活达到该时长后重置退避。
    #[serde(rename = "min_stable_duration_ms", with = "millis")]
    pub min_stable_duration: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 1.6,
            jitter: 0.2,
            max_delay: Duration::from_secs(120),
            min_stable_duration: Duration::from_secs(10),
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.base_delay.is_zero() {
            return Err(ClientError::invalid_config("backoff.base_delay_ms must be positive"));
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(ClientError::invalid_config("backoff.multiplier must be >= 1.0"));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ClientError::invalid_config("backoff.jitter must be within [0, 1)"));
        }
        if self.max_delay < self.base_delay {
            return Err(ClientError::invalid_config(
                "backoff.max_delay_ms must not be smaller than base_delay_ms",
            ));
        }
        Ok(())
    }

    /// 第 `attempt` 次失败（从 0 计）对应的未抖动等待。
    pub fn unjittered(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let ceiling = self.max_delay.as_secs_f64();
        // 指数上限避免 powi 溢出为 inf 后再做 min。
        let exponent = attempt.min(1_000) as i32;
        let scaled = base * self.multiplier.powi(exponent);
        Duration::from_secs_f64(scaled.min(ceiling))
    }

    /// 第 `attempt` 次失败对应的带抖动等待，`seed` 区分不同子连接。
    pub fn delay(&self, attempt: u32, seed: u64) -> Duration {
        let unjittered = self.unjittered(attempt);
        if self.jitter == 0.0 {
            return unjittered;
        }
        let factor = jitter_factor(seed ^ u64::from(attempt).rotate_left(32), self.jitter);
        let jittered = unjittered.as_secs_f64() * factor;
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }
}

/// 单个子连接的退避进度。
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    seed: u64,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig, seed: u64) -> Self {
        Self {
            config,
            seed,
            attempt: 0,
        }
    }

    /// 已经消耗的失败次数。
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// 当前尝试的等待，不推进计数。
    pub fn current(&self) -> Duration {
        self.config.delay(self.attempt, self.seed)
    }

    /// 取出下一次等待并推进计数。
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current();
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// 连接存活 `lived` 后调用：达到稳定阈值时重置。
    ///
    /// 返回是否发生了重置。
    pub fn observe_connection(&mut self, lived: Duration) -> bool {
        if lived >= self.config.min_stable_duration {
            self.reset();
            true
        } else {
            false
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

/// 将种子映射到 `[1 - range, 1 + range]`。
fn jitter_factor(seed: u64, range: f64) -> f64 {
    let mixed = mix64(seed);
    let mantissa = (mixed >> 11) as f64;
    let unit = mantissa / ((1u64 << 53) as f64);
    1.0 + (unit * 2.0 - 1.0) * range
}

#[inline]
pub(crate) fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D049BB133111EB);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_caps_at_ceiling() {
        let config = BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        };
        assert_eq!(config.unjittered(0), Duration::from_secs(1));
        assert_eq!(config.unjittered(1), Duration::from_secs_f64(1.6));
        assert_eq!(config.unjittered(50), Duration::from_secs(120));
        assert_eq!(config.unjittered(u32::MAX), Duration::from_secs(120));
    }

    #[test]
    fn stable_connection_resets_progress() {
        let mut backoff = Backoff::new(BackoffConfig::default(), 7);
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
        assert!(!backoff.observe_connection(Duration::from_secs(1)));
        assert_eq!(backoff.attempt(), 2);
        assert!(backoff.observe_connection(Duration::from_secs(10)));
        assert_eq!(backoff.attempt(), 0);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let bad = BackoffConfig {
            multiplier: 0.5,
            ..BackoffConfig::default()
        };
        assert_eq!(bad.validate().unwrap_err().code(), "spark.client.config.invalid");
        let bad = BackoffConfig {
            jitter: 1.0,
            ..BackoffConfig::default()
        };
        assert!(bad.validate().is_err());
        assert!(BackoffConfig::default().validate().is_ok());
    }
}
