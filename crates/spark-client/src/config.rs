//! 客户端配置。
//!
//! # 教案式说明
//! - **意图 (Why)**：所有超时、窗口、退避参数集中在一处，既能在代码里以构建器方式覆盖，
//!   也能从 TOML 文件整体加载；
//! - **契约 (What)**：时长统一以 `*_ms` 整数表达；缺省字段取默认值；未知字段视为错误；
//!   [`ClientConfig::validate`] 在 ClientConn 创建前执行，失败返回 `InvalidConfig`；
//! - **风险 (Trade-offs)**：配置只在创建时读取一次，不支持热更新。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;
use crate::error::ClientError;
use crate::target::DEFAULT_SCHEME;

/// 传输层参数。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// 建连（含握手）的最小超时；实际超时取它与当前退避中的较大者。
    #[serde(rename = "min_connect_timeout_ms", with = "millis")]
    pub min_connect_timeout: Duration,
    /// 每个流初始的收发窗口。
    pub initial_stream_window: u32,
    /// 连接级初始收发窗口。
    pub initial_connection_window: u32,
    pub max_frame_size: u32,
    /// 保活 PING 间隔；`None` 表示关闭保活。
    #[serde(rename = "keepalive_time_ms", with = "opt_millis")]
    pub keepalive_time: Option<Duration>,
    #[serde(rename = "keepalive_timeout_ms", with = "millis")]
    pub keepalive_timeout: Duration,
    /// 没有活跃流时是否仍发送保活。
    pub keepalive_without_calls: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            min_connect_timeout: Duration::from_secs(20),
            initial_stream_window: 64 * 1024,
            initial_connection_window: 1024 * 1024,
            max_frame_size: 16 * 1024,
            keepalive_time: None,
            keepalive_timeout: Duration::from_secs(20),
            keepalive_without_calls: false,
        }
    }
}

/// 名称解析参数。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverConfig {
    /// 两次 `resolve_now` 之间的最小间隔，间隔内的重复请求被合并。
    #[serde(rename = "min_resolve_interval_ms", with = "millis")]
    pub min_resolve_interval: Duration,
    /// DNS 周期性刷新间隔；`None` 表示只在请求时刷新。
    #[serde(rename = "dns_refresh_interval_ms", with = "opt_millis")]
    pub dns_refresh_interval: Option<Duration>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            min_resolve_interval: Duration::from_secs(30),
            dns_refresh_interval: None,
        }
    }
}

/// ClientConn 的完整配置。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub default_scheme: String,
    /// 未在解析结果中声明配置时使用的负载均衡策略。
    pub default_balancer: String,
    /// 关闭时等待在途流自然结束的宽限期，超时后强制关闭传输。
    #[serde(rename = "close_grace_period_ms", with = "millis")]
    pub close_grace_period: Duration,
    pub backoff: BackoffConfig,
    pub transport: TransportConfig,
    pub resolver: ResolverConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_scheme: DEFAULT_SCHEME.to_owned(),
            default_balancer: crate::balancer::pick_first::NAME.to_owned(),
            close_grace_period: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
            transport: TransportConfig::default(),
            resolver: ResolverConfig::default(),
        }
    }
}

/// 帧长上限的协议边界：16 KiB 至 16 MiB - 1。
const MIN_FRAME_SIZE: u32 = 16 * 1024;
const MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

impl ClientConfig {
    /// 从 TOML 文本加载并校验。
    pub fn from_toml_str(raw: &str) -> Result<Self, ClientError> {
        let config: ClientConfig =
            toml::from_str(raw).map_err(|err| ClientError::invalid_config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.default_scheme.is_empty() {
            return Err(ClientError::invalid_config("default_scheme must not be empty"));
        }
        if self.default_balancer.is_empty() {
            return Err(ClientError::invalid_config("default_balancer must not be empty"));
        }
        self.backoff.validate()?;

        let transport = &self.transport;
        if transport.initial_stream_window == 0 || transport.initial_connection_window == 0 {
            return Err(ClientError::invalid_config("flow-control windows must be positive"));
        }
        if transport.initial_stream_window > i32::MAX as u32
            || transport.initial_connection_window > i32::MAX as u32
        {
            return Err(ClientError::invalid_config("flow-control windows must fit in 31 bits"));
        }
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&transport.max_frame_size) {
            return Err(ClientError::invalid_config(format!(
                "transport.max_frame_size must be within [{MIN_FRAME_SIZE}, {MAX_FRAME_SIZE}]"
            )));
        }
        if transport.min_connect_timeout.is_zero() {
            return Err(ClientError::invalid_config(
                "transport.min_connect_timeout_ms must be positive",
            ));
        }
        if transport.keepalive_time.is_some_and(|interval| interval.is_zero()) {
            return Err(ClientError::invalid_config("transport.keepalive_time_ms must be positive"));
        }
        if transport.keepalive_timeout.is_zero() {
            return Err(ClientError::invalid_config(
                "transport.keepalive_timeout_ms must be positive",
            ));
        }
        if self
            .resolver
            .dns_refresh_interval
            .is_some_and(|interval| interval.is_zero())
        {
            return Err(ClientError::invalid_config(
                "resolver.dns_refresh_interval_ms must be positive",
            ));
        }
        Ok(())
    }
}

/// `Duration` 与毫秒整数之间的 serde 适配。
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// 可选时长的毫秒适配。
pub(crate) mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => {
                serializer.serialize_some(&u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|value| value.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_partial_toml_over_defaults() {
        let raw = r#"
            default_scheme = "static"
            close_grace_period_ms = 250

            [backoff]
            base_delay_ms = 100
            max_delay_ms = 2000

            [transport]
            keepalive_time_ms = 30000
            initial_stream_window = 32768
        "#;
        let config = ClientConfig::from_toml_str(raw).expect("合法配置应能加载");
        assert_eq!(config.default_scheme, "static");
        assert_eq!(config.close_grace_period, Duration::from_millis(250));
        assert_eq!(config.backoff.base_delay, Duration::from_millis(100));
        assert_eq!(config.backoff.multiplier, 1.6);
        assert_eq!(config.transport.keepalive_time, Some(Duration::from_secs(30)));
        assert_eq!(config.transport.initial_stream_window, 32 * 1024);
        assert_eq!(config.transport.max_frame_size, 16 * 1024);
        assert_eq!(config.resolver, ResolverConfig::default());
    }

    #[test]
    fn rejects_unknown_fields_and_bad_values() {
        let err = ClientConfig::from_toml_str("unknown = 1").unwrap_err();
        assert_eq!(err.code(), "spark.client.config.invalid");

        let err = ClientConfig::from_toml_str("[transport]\nmax_frame_size = 10").unwrap_err();
        assert!(err.to_string().contains("max_frame_size"), "{err}");
    }
}
