#![doc = r#"
# spark-transport-tcp

## 设计动机（Why）
- **定位**：为 `spark-client` 提供基于 Tokio 的 TCP [`Connector`](spark_client::Connector)，
  把 `host:port` 地址变成可被多路复用传输驱动的字节流；
- **架构角色**：连接编排核心只依赖 `Connector` 契约，TCP 细节（名字查询、套接字选项）
  全部封装在这里，测试可以替换为内存实现。

## 核心契约（What）
- **输入条件**：调用方必须在 Tokio 运行时中使用；地址为 `host:port` 或 `ip:port`；
- **输出保障**：失败统一映射为 [`ClientError::Connection`](spark_client::ClientError::Connection)，
  详情中携带稳定的 `spark.transport.tcp.*` 操作码；
- **不做的事**：不重试、不自行计时，重试节奏与建连超时由子连接统一掌控。

## 实现策略（How）
- 先以 `tokio::net::lookup_host` 展开地址，再按顺序逐个尝试，返回第一个成功的连接；
- 建连成功后通过 `socket2::SockRef` 落地 `TCP_NODELAY`、`SO_KEEPALIVE` 与 `SO_LINGER`。

## 风险与考量（Trade-offs）
- 逐个尝试解析结果意味着首个地址不可达时整次建连耗时叠加，外层超时会截断剩余尝试；
- `SO_LINGER` 在不同平台精度不同（Linux 取整到秒）。
"#]

mod connector;
mod error;

pub use connector::{TcpConnector, TcpSocketConfig};
