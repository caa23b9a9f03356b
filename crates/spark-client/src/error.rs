//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为解析器、负载均衡、子连接、传输与调用路径提供统一的错误语义；
//! - 每个变体都映射到稳定错误码（`spark.client.*`）与 [`ErrorCategory`]，便于日志检索与告警聚合。
//!
//! ## 设计要求（What）
//! - 错误需要在多个调用之间共享（同一个 Picker 可能把同一失败原因交给成百上千个调用），
//!   因此 [`ClientError`] 实现 `Clone + Eq`，底层 IO 错误只保留可读描述；
//! - 分类遵循五类故障域：解析、建连、传输致命、调用级、配置，以及生命周期（连接已关闭）。
//!
//! ## 约定（How）
//! - 低层从不重试调用；唯一的重试发生在子连接建连阶段；
//! - 调用因所有地址失败而无法推进时，只会看到一个聚合后的 [`ClientError::Unavailable`]，
//!   其 `last_error` 保留最近一次的具体原因。

use std::fmt;

use thiserror::Error;

/// 错误所属的故障域。
///
/// - `Resolution`：名称无法解析；
/// - `Connection`：单个地址建连/握手失败，只影响对应子连接；
/// - `TransportFatal`：协议违例或不可恢复的 IO，迫使传输上的所有流失败；
/// - `Call`：截止、取消或对端终态，只影响单个调用；
/// - `Configuration`：目标串或配置非法；
/// - `Lifecycle`：客户端连接已关闭。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Resolution,
    Connection,
    TransportFatal,
    Call,
    Configuration,
    Lifecycle,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorCategory::Resolution => "resolution",
            ErrorCategory::Connection => "connection",
            ErrorCategory::TransportFatal => "transport_fatal",
            ErrorCategory::Call => "call",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Lifecycle => "lifecycle",
        };
        f.write_str(label)
    }
}

/// 客户端连接编排核心的错误域。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - 所有变体均为 `Send + Sync + 'static` 且可克隆，可安全地嵌入不可变的 Picker；
///   - [`ClientError::code`] 返回稳定错误码，[`ClientError::category`] 返回故障域；
///   - [`ClientError::is_retriable`] 标记“换一个 Picker 再试可能成功”的情形（例如传输正在排空）。
/// - **执行逻辑 (How)**：IO 相关的失败在边界处被转换为字符串描述，避免 `io::Error` 不可克隆的问题。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClientError {
    /// 目标串无法解析为 `scheme://authority/endpoint`。
    #[error("invalid target `{target}`: {reason}")]
    InvalidTarget { target: String, reason: String },

    /// 没有为目标 scheme 注册解析器。
    #[error("no resolver registered for scheme `{scheme}`")]
    UnknownScheme { scheme: String },

    /// 名称解析失败。
    #[error("name resolution failed: {detail}")]
    Resolution { detail: String },

    /// 配置（客户端配置或逐调用的负载均衡配置）非法。
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },

    /// 单个地址建连或握手失败。
    #[error("connection to `{address}` failed: {detail}")]
    Connection { address: String, detail: String },

    /// 建连或握手超过了连接超时。
    #[error("connection to `{address}` timed out")]
    ConnectTimeout { address: String },

    /// 传输正在排空或已关闭，拒绝新建流；流从未被对端处理，可安全地改用其它连接。
    #[error("transport is going away")]
    GoingAway,

    /// 传输遇到不可恢复的 IO 故障或保活超时。
    #[error("transport failed: {detail}")]
    TransportFatal { detail: String },

    /// 对端违反了帧协议或流量控制约束。
    #[error("protocol violation: {detail}")]
    Protocol { detail: String },

    /// 所有已知地址都无法使用。
    #[error("unavailable: {detail}")]
    Unavailable {
        detail: String,
        last_error: Option<Box<ClientError>>,
    },

    /// 调用参数无法编码（方法名或消息超出帧格式的上限），请求从未发出。
    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: String },

    /// 调用截止时间已到。
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// 调用被显式取消。
    #[error("call cancelled")]
    Cancelled,

    /// 对端以非零状态结束了调用。
    #[error("call terminated by peer with status {code}: {message}")]
    Status { code: u32, message: String },

    /// 对端重置了流。
    #[error("stream reset by peer with code {code}")]
    StreamReset { code: u32 },

    /// 客户端连接已关闭，不再接受任何操作。
    #[error("client connection closed")]
    Closed,
}

impl ClientError {
    /// 构造携带最近失败原因的 `Unavailable`。
    pub fn unavailable(detail: impl Into<String>, last_error: Option<ClientError>) -> Self {
        ClientError::Unavailable {
            detail: detail.into(),
            last_error: last_error.map(Box::new),
        }
    }

    /// 构造解析失败。
    pub fn resolution(detail: impl Into<String>) -> Self {
        ClientError::Resolution {
            detail: detail.into(),
        }
    }

    /// 构造配置非法错误。
    pub fn invalid_config(detail: impl Into<String>) -> Self {
        ClientError::InvalidConfig {
            detail: detail.into(),
        }
    }

    /// 构造协议违例。
    pub fn protocol(detail: impl Into<String>) -> Self {
        ClientError::Protocol {
            detail: detail.into(),
        }
    }

    /// 构造调用参数非法错误。
    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        ClientError::InvalidArgument {
            detail: detail.into(),
        }
    }

    /// 构造传输致命错误。
    pub fn transport_fatal(detail: impl Into<String>) -> Self {
        ClientError::TransportFatal {
            detail: detail.into(),
        }
    }

    /// 构造建连失败。
    pub fn connection(address: impl Into<String>, detail: impl Into<String>) -> Self {
        ClientError::Connection {
            address: address.into(),
            detail: detail.into(),
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            ClientError::InvalidTarget { .. } => "spark.client.target.invalid",
            ClientError::UnknownScheme { .. } => "spark.client.resolver.unknown_scheme",
            ClientError::Resolution { .. } => "spark.client.resolver.failed",
            ClientError::InvalidConfig { .. } => "spark.client.config.invalid",
            ClientError::Connection { .. } => "spark.client.subconn.connect_failed",
            ClientError::ConnectTimeout { .. } => "spark.client.subconn.connect_timeout",
            ClientError::GoingAway => "spark.client.transport.going_away",
            ClientError::TransportFatal { .. } => "spark.client.transport.fatal",
            ClientError::Protocol { .. } => "spark.client.transport.protocol",
            ClientError::Unavailable { .. } => "spark.client.call.unavailable",
            ClientError::InvalidArgument { .. } => "spark.client.call.invalid_argument",
            ClientError::DeadlineExceeded => "spark.client.call.deadline_exceeded",
            ClientError::Cancelled => "spark.client.call.cancelled",
            ClientError::Status { .. } => "spark.client.call.status",
            ClientError::StreamReset { .. } => "spark.client.call.reset",
            ClientError::Closed => "spark.client.conn.closed",
        }
    }

    /// 故障域分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            ClientError::InvalidTarget { .. }
            | ClientError::UnknownScheme { .. }
            | ClientError::InvalidConfig { .. } => ErrorCategory::Configuration,
            ClientError::Resolution { .. } => ErrorCategory::Resolution,
            ClientError::Connection { .. } | ClientError::ConnectTimeout { .. } => {
                ErrorCategory::Connection
            }
            ClientError::TransportFatal { .. } | ClientError::Protocol { .. } => {
                ErrorCategory::TransportFatal
            }
            ClientError::GoingAway
            | ClientError::Unavailable { .. }
            | ClientError::InvalidArgument { .. }
            | ClientError::DeadlineExceeded
            | ClientError::Cancelled
            | ClientError::Status { .. }
            | ClientError::StreamReset { .. } => ErrorCategory::Call,
            ClientError::Closed => ErrorCategory::Lifecycle,
        }
    }

    /// 是否可以在新的 Picker 上重新挑选连接后继续尝试。
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ClientError::GoingAway
                | ClientError::Connection { .. }
                | ClientError::ConnectTimeout { .. }
                | ClientError::TransportFatal { .. }
        )
    }

    /// 若为 `Unavailable`，返回聚合前的最近一次失败原因。
    pub fn last_error(&self) -> Option<&ClientError> {
        match self {
            ClientError::Unavailable { last_error, .. } => last_error.as_deref(),
            _ => None,
        }
    }
}

/// 本 crate 通用的 `Result` 别名。
pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_namespaced() {
        let samples = [
            ClientError::GoingAway,
            ClientError::Closed,
            ClientError::DeadlineExceeded,
            ClientError::resolution("nxdomain"),
            ClientError::unavailable("no backends", None),
        ];
        for err in samples {
            assert!(err.code().starts_with("spark.client."), "{}", err.code());
        }
    }

    #[test]
    fn unavailable_keeps_last_cause() {
        let cause = ClientError::connection("10.0.0.1:80", "connection refused");
        let err = ClientError::unavailable("all addresses failing", Some(cause.clone()));
        assert_eq!(err.last_error(), Some(&cause));
        assert_eq!(err.category(), ErrorCategory::Call);
        assert_eq!(cause.category(), ErrorCategory::Connection);
    }

    #[test]
    fn invalid_argument_is_call_scoped() {
        let err = ClientError::invalid_argument("method name exceeds the frame limit");
        assert_eq!(err.code(), "spark.client.call.invalid_argument");
        assert_eq!(err.category(), ErrorCategory::Call, "参数错误只影响单个调用");
        assert!(!err.is_retriable(), "换一个连接也无法编码同样的参数");
    }
}
