use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use spark_client::transport::{BoxedIo, ConnectOptions, Connector};
use spark_client::{Address, ClientError};
use tokio::net::TcpStream;

use crate::error::{CONFIGURE, CONNECT, RESOLVE, is_transient, map_io_error, operation_error};

/// TCP 套接字级配置项。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把每条连接都要落地的内核选项集中在一处，避免调用方直接操作 `socket2`；
/// - 多路复用传输依赖小帧低延迟，默认开启 `TCP_NODELAY`。
///
/// ## 契约说明（What）
/// - `nodelay`：默认 `true`；
/// - `keepalive`：`Some(idle)` 时开启 `SO_KEEPALIVE` 并设置空闲探测时间，默认关闭，
///   应用层 PING 保活由传输配置控制；
/// - `linger`：`Some(dur)` 时关闭阶段在 `dur` 后仍未发完即发送 RST，`None` 遵循内核默认。
///
/// ## 风险（Trade-offs）
/// - 选项落地失败视为建连失败，连接会被丢弃并交给子连接退避重试。
#[derive(Clone, Debug)]
pub struct TcpSocketConfig {
    nodelay: bool,
    keepalive: Option<Duration>,
    linger: Option<Duration>,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpSocketConfig {
    pub const fn new() -> Self {
        Self {
            nodelay: true,
            keepalive: None,
            linger: None,
        }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_keepalive(mut self, idle: Option<Duration>) -> Self {
        self.keepalive = idle;
        self
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        let sock = SockRef::from(stream);
        if let Some(idle) = self.keepalive {
            sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
        }
        sock.set_linger(self.linger)
    }
}

/// 基于 Tokio 的 TCP 建连器。
#[derive(Clone, Debug, Default)]
pub struct TcpConnector {
    config: TcpSocketConfig,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: TcpSocketConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TcpSocketConfig {
        &self.config
    }

    async fn resolve(addr: &str) -> Result<Vec<SocketAddr>, ClientError> {
        let resolved: Vec<SocketAddr> = tokio::net::lookup_host(addr)
            .await
            .map_err(|err| map_io_error(RESOLVE, addr, &err))?
            .collect();
        if resolved.is_empty() {
            return Err(operation_error(RESOLVE, addr, "name resolved to no addresses"));
        }
        Ok(resolved)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        address: &Address,
        options: &ConnectOptions,
    ) -> Result<BoxedIo, ClientError> {
        let addr = address.addr();
        let candidates = Self::resolve(addr).await?;

        let mut last_error = None;
        for candidate in candidates {
            match TcpStream::connect(candidate).await {
                Ok(stream) => {
                    self.config
                        .apply(&stream)
                        .map_err(|err| map_io_error(CONFIGURE, addr, &err))?;
                    tracing::debug!(
                        address = addr,
                        peer = %candidate,
                        authority = %options.authority,
                        "tcp connection established"
                    );
                    return Ok(Box::new(stream));
                }
                Err(err) => {
                    tracing::debug!(
                        address = addr,
                        peer = %candidate,
                        error = %err,
                        transient = is_transient(&err),
                        "tcp connect attempt failed"
                    );
                    last_error = Some(err);
                }
            }
        }
        Err(match last_error {
            Some(err) => map_io_error(CONNECT, addr, &err),
            None => operation_error(CONNECT, addr, "no candidate address"),
        })
    }
}
