//! 传输构造接口：建立字节流与安全握手。
//!
//! 连接编排核心不关心字节流的来源。TCP、Unix 域套接字或内存管道都通过 [`Connector`] 注入，
//! 凭据插件通过 [`ChannelCredentials`] 在字节流之上完成握手后再交给多路复用传输。

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::address::Address;
use crate::error::ClientError;

/// 可被多路复用传输驱动的双向字节流。
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// 类型擦除后的字节流。
pub type BoxedIo = Box<dyn AsyncIo>;

/// 单次建连的参数。
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    /// 握手使用的权威名。
    pub authority: String,
    /// 本次尝试剩余的超时预算。
    pub timeout: Duration,
}

/// 把地址变成字节流。
///
/// # 契约说明（What）
/// - 每次调用都是一次独立的尝试，失败以 [`ClientError::Connection`] 返回；
/// - 实现不需要自行处理超时，子连接会以 `max(min_connect_timeout, 当前退避)` 包裹整次建连；
/// - 实现不得重试，重试节奏由子连接的退避统一掌控。
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        address: &Address,
        options: &ConnectOptions,
    ) -> Result<BoxedIo, ClientError>;
}

/// 信道凭据的握手钩子。
#[async_trait]
pub trait ChannelCredentials: Send + Sync + 'static {
    /// 安全级别的描述，用于日志与诊断。
    fn security_protocol(&self) -> &'static str;

    async fn handshake(&self, authority: &str, io: BoxedIo) -> Result<BoxedIo, ClientError>;
}

/// 不做任何握手的明文凭据。
#[derive(Clone, Copy, Debug, Default)]
pub struct InsecureCredentials;

#[async_trait]
impl ChannelCredentials for InsecureCredentials {
    fn security_protocol(&self) -> &'static str {
        "insecure"
    }

    async fn handshake(&self, _authority: &str, io: BoxedIo) -> Result<BoxedIo, ClientError> {
        Ok(io)
    }
}
