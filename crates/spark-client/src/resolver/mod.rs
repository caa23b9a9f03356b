//! 名称解析：把逻辑目标变成持续更新的地址集合。
//!
//! # 教案级说明
//!
//! ## 意图（Why）
//! - 后端集合是动态的，解析器以推送方式向 ClientConn 提交完整的 [`ResolverState`]；
//! - 解析器与负载均衡策略之间没有直接引用，所有交互经由 ClientConn 的控制队列串行化。
//!
//! ## 契约（What）
//! - 每次提交的状态整体替换上一次，地址有序且去重；
//! - “空地址列表”与“解析失败”是两种不同的信号：前者经 [`ResolverHandle::update_state`] 提交，
//!   后者经 [`ResolverHandle::report_error`] 提交，持续失败时绝不能伪装成空列表；
//! - [`Resolver::resolve_now`] 只是建议，实现按最小间隔限流并合并重复请求；
//! - [`Resolver::close`] 之后不得再提交任何状态。
//!
//! ## 内置实现
//! - `passthrough`：endpoint 原样作为唯一地址；
//! - `static`：逗号分隔的地址列表；
//! - `dns`：主机名查询，支持周期刷新与失败退避；
//! - [`ManualResolverBuilder`]：由应用或测试驱动。

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::address::Address;
use crate::backoff::BackoffConfig;
use crate::clientconn::{ControlEvent, EventSender};
use crate::error::ClientError;
use crate::target::Target;

mod dns;
mod manual;
mod passthrough;

pub use dns::{DnsResolverBuilder, HostLookup, TokioHostLookup};
pub use manual::{ManualResolver, ManualResolverBuilder};
pub use passthrough::{PassthroughResolverBuilder, StaticResolverBuilder};

/// 解析器的一次完整输出。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolverState {
    addresses: Vec<Address>,
    config: Option<String>,
    note: Option<String>,
}

impl ResolverState {
    /// 以地址列表构造，重复地址只保留第一次出现。
    pub fn new(addresses: impl IntoIterator<Item = Address>) -> Self {
        let mut seen = HashSet::new();
        let addresses = addresses
            .into_iter()
            .filter(|address| seen.insert(address.clone()))
            .collect();
        Self {
            addresses,
            config: None,
            note: None,
        }
    }

    /// 附带负载均衡配置（不透明 JSON 文本，由策略解析）。
    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = Some(config.into());
        self
    }

    /// 附带解析说明，仅用于日志与诊断。
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn config(&self) -> Option<&str> {
        self.config.as_deref()
    }

    pub fn note(&self) -> Option<&str> {
        self.note.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// 构建解析器时的参数。
#[derive(Clone, Debug)]
pub struct BuildOptions {
    pub min_resolve_interval: Duration,
    pub dns_refresh_interval: Option<Duration>,
    /// 解析失败后的重试节奏。
    pub backoff: BackoffConfig,
}

impl Default for BuildOptions {
    fn default() -> Self {
        let resolver = crate::config::ResolverConfig::default();
        Self {
            min_resolve_interval: resolver.min_resolve_interval,
            dns_refresh_interval: resolver.dns_refresh_interval,
            backoff: BackoffConfig::default(),
        }
    }
}

/// 解析器工厂，按 scheme 注册。
pub trait ResolverBuilder: Send + Sync + 'static {
    fn scheme(&self) -> &str;

    /// 创建解析器。实现可以立即通过 `handle` 提交首个状态，也可以在后台任务中异步提交。
    fn build(
        &self,
        target: &Target,
        handle: ResolverHandle,
        options: &BuildOptions,
    ) -> Result<Box<dyn Resolver>, ClientError>;
}

/// 运行中的解析器。
pub trait Resolver: Send + 'static {
    /// 请求尽快重新解析。
    fn resolve_now(&self);

    /// 停止解析并释放资源。
    fn close(&self);
}

/// 解析器向 ClientConn 提交结果的句柄。
///
/// 句柄只能投递事件，不能访问负载均衡策略或子连接。
#[derive(Clone)]
pub struct ResolverHandle {
    events: EventSender,
}

impl fmt::Debug for ResolverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverHandle")
            .field("closed", &self.events.is_closed())
            .finish()
    }
}

impl ResolverHandle {
    pub(crate) fn new(events: EventSender) -> Self {
        Self { events }
    }

    /// 提交新状态并等待负载均衡策略的裁决。
    ///
    /// 返回 `InvalidConfig` 表示状态携带的配置被拒绝（此时旧状态继续生效），
    /// 返回 `Closed` 表示 ClientConn 已关闭，解析器应停止工作。
    pub async fn update_state(&self, state: ResolverState) -> Result<(), ClientError> {
        let (reply, verdict) = oneshot::channel();
        self.events
            .send(ControlEvent::ResolverUpdate {
                state,
                reply: Some(reply),
            })
            .map_err(|_| ClientError::Closed)?;
        verdict.await.unwrap_or(Err(ClientError::Closed))
    }

    /// 提交新状态但不等待裁决。
    pub fn send_state(&self, state: ResolverState) -> Result<(), ClientError> {
        self.events
            .send(ControlEvent::ResolverUpdate { state, reply: None })
            .map_err(|_| ClientError::Closed)
    }

    /// 报告解析失败。
    pub fn report_error(&self, err: ClientError) -> Result<(), ClientError> {
        self.events
            .send(ControlEvent::ResolverError(err))
            .map_err(|_| ClientError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// scheme 到解析器工厂的映射。
#[derive(Clone)]
pub struct ResolverRegistry {
    builders: HashMap<String, Arc<dyn ResolverBuilder>>,
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<&str> = self.builders.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        f.debug_struct("ResolverRegistry")
            .field("schemes", &schemes)
            .finish()
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ResolverRegistry {
    /// 空注册表。
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// 预置 `passthrough`、`static` 与 `dns`。
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PassthroughResolverBuilder));
        registry.register(Arc::new(StaticResolverBuilder));
        registry.register(Arc::new(DnsResolverBuilder::default()));
        registry
    }

    /// 注册工厂，同名 scheme 被覆盖。
    pub fn register(&mut self, builder: Arc<dyn ResolverBuilder>) {
        self.builders
            .insert(builder.scheme().to_ascii_lowercase(), builder);
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.builders.get(scheme).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_deduplicates_preserving_order() {
        let state = ResolverState::new(
            ["b:1", "a:1", "b:1", "c:1", "a:1"]
                .into_iter()
                .map(Address::from),
        );
        let addrs: Vec<&str> = state.addresses().iter().map(Address::addr).collect();
        assert_eq!(addrs, ["b:1", "a:1", "c:1"]);
    }

    #[test]
    fn registry_has_builtin_schemes() {
        let registry = ResolverRegistry::default();
        for scheme in ["passthrough", "static", "dns"] {
            assert!(registry.get(scheme).is_some(), "缺少内置 scheme {scheme}");
        }
        assert!(registry.get("consul").is_none());
    }
}
