#![doc = r#"
# spark-client

## 设计动机（Why）
- **一条逻辑连接**：面向命名服务保持一条长期可用的逻辑连接，后端地址集合动态变化时
  调用方无感知；
- **少量物理连接承载大量调用**：调用以流的形式多路复用在每个地址的一条传输上；
- **热路径无全局锁**：调用只读取原子发布的 Picker 快照，控制面全部串行化到一个控制任务。

## 核心契约（What）
- [`resolver`]：把 [`Target`] 变成持续更新的地址集合，内置 `passthrough`、`static`、`dns`
  与手动解析器；
- [`balancer`]：把地址集合变成子连接集合、把子连接状态变成 [`balancer::Picker`]，
  内置 `pick_first` 与 `round_robin`；
- [`subconn`]：单地址连通性状态机，负责建连、退避与排空；
- [`transport`]：字节流上的多路复用传输，支持流控、GOAWAY 排空与保活；
- [`ClientConn`]：编排上述组件，提供 [`ClientConn::new_stream`] 与 [`ClientConn::unary`]。

## 实现策略（How）
- 解析器、子连接与 Picker 都只向控制队列投递事件，不互相回调；
- Picker 以 `ArcSwap` 快照发布，同时推进 `watch` 代数唤醒等待中的调用；
- 所有挂起点同时受调用截止与取消约束。

## 风险与注意（Trade-offs）
- 必须在 Tokio 运行时内创建与使用 [`ClientConn`]；
- 库本身不安装任何 `tracing` 订阅者，日志由应用决定如何收集；
- [`test_stubs`] 仅供测试，不适合生产使用。
"#]

pub mod address;
pub mod backoff;
pub mod balancer;
mod call;
pub mod clientconn;
pub mod config;
pub mod connectivity;
pub mod contract;
pub mod diagnostics;
pub mod error;
pub mod resolver;
pub mod subconn;
pub mod target;
pub mod test_stubs;
pub mod transport;

pub use address::{Address, Attributes};
pub use backoff::{Backoff, BackoffConfig};
pub use clientconn::{ClientConn, ClientConnBuilder};
pub use config::{ClientConfig, ResolverConfig, TransportConfig};
pub use connectivity::{ConnectivityState, StateAggregator};
pub use contract::{CallOptions, Cancellation, Deadline};
pub use diagnostics::{Diagnostics, SubConnDiagnostics};
pub use error::{ClientError, ErrorCategory, Result};
pub use resolver::ResolverState;
pub use subconn::{SubConn, SubConnId, SubConnState};
pub use target::Target;
pub use transport::{ClientStream, Connector};
