//! ClientConn：把解析器、负载均衡策略与子连接编排成一条逻辑连接。
//!
//! # 教案级说明
//!
//! ## 意图（Why）
//! - 三个状态机（名称解析、负载均衡、单地址连通性）彼此耦合，若以回调互相调用，
//!   重入与锁顺序问题会在高并发下暴露；
//! - 因此所有控制面输入都被序列化到同一条事件队列，由唯一的控制任务按到达顺序处理；
//! - 调用路径只读取原子发布的 Picker 快照，热路径上没有任何全局锁。
//!
//! ## 逻辑（How）
//! - [`ControlEvent`] 承载解析结果、解析错误、子连接状态、退出空闲、重新解析与关闭；
//! - 策略通过 [`crate::balancer::BalancerHandle`] 回到 [`ConnShared`]，后者只提供
//!   创建/移除子连接、发布 Picker、请求重新解析四种能力；
//! - Picker 以 `ArcSwap<PickerSnapshot>` 发布，同时推进 `watch` 中的代数，
//!   等待中的调用据此被唤醒。
//!
//! ## 契约（What）
//! - 发布的代数严格递增，快照发布后不再修改；
//! - 关闭不可逆：停止解析器、关闭策略（全部子连接 Shutdown）、发布关闭 Picker、
//!   清空事件队列，此后所有操作返回 [`ClientError::Closed`]；
//! - 最后一个 [`ClientConn`] 句柄被丢弃时自动触发关闭。
//!
//! ## 风险（Trade-offs）
//! - 事件队列无界：解析器或子连接不会因为控制任务繁忙而阻塞，代价是极端情况下的内存占用；
//!   事件规模与地址数成正比，实际可控。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use crate::address::Address;
use crate::balancer::{
    BalancerBuilder, BalancerHandle, BalancerRegistry, DeferPicker, Picker, PickerSnapshot,
};
use crate::config::ClientConfig;
use crate::connectivity::ConnectivityState;
use crate::contract::{Deadline, guard};
use crate::diagnostics::{Diagnostics, SubConnDiagnostics};
use crate::error::ClientError;
use crate::resolver::{BuildOptions, ResolverBuilder, ResolverHandle, ResolverRegistry, ResolverState};
use crate::subconn::{SubConn, SubConnContext, SubConnId, SubConnState};
use crate::target::Target;
use crate::transport::{ChannelCredentials, Connector, InsecureCredentials};

mod worker;

use worker::Worker;

/// 控制任务处理的事件。
#[derive(Debug)]
pub(crate) enum ControlEvent {
    ResolverUpdate {
        state: ResolverState,
        reply: Option<oneshot::Sender<Result<(), ClientError>>>,
    },
    ResolverError(ClientError),
    SubConnState {
        id: SubConnId,
        update: SubConnState,
    },
    ExitIdle,
    ResolveNow,
    Close,
}

pub(crate) type EventSender = mpsc::UnboundedSender<ControlEvent>;

/// 控制任务、策略句柄与调用路径共享的状态。
pub(crate) struct ConnShared {
    target: Target,
    config: ClientConfig,
    picker: ArcSwap<PickerSnapshot>,
    generation: AtomicU64,
    picker_tx: watch::Sender<u64>,
    state_tx: watch::Sender<ConnectivityState>,
    events: EventSender,
    closed: AtomicBool,
    subconns: Mutex<HashMap<SubConnId, SubConn>>,
    next_subconn: AtomicU64,
    subconn_context: Arc<SubConnContext>,
    terminated: watch::Sender<bool>,
}

impl ConnShared {
    fn new(
        target: Target,
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn ChannelCredentials>,
        events: EventSender,
    ) -> Self {
        let subconn_context = Arc::new(SubConnContext {
            connector,
            credentials,
            transport: config.transport.clone(),
            backoff: config.backoff,
            authority: target.dial_authority().to_owned(),
            close_grace_period: config.close_grace_period,
            events: events.clone(),
        });
        let initial = PickerSnapshot::new(0, ConnectivityState::Idle, Arc::new(DeferPicker));
        Self {
            target,
            config,
            picker: ArcSwap::from_pointee(initial),
            generation: AtomicU64::new(0),
            picker_tx: watch::Sender::new(0),
            state_tx: watch::Sender::new(ConnectivityState::Idle),
            events,
            closed: AtomicBool::new(false),
            subconns: Mutex::new(HashMap::new()),
            next_subconn: AtomicU64::new(1),
            subconn_context,
            terminated: watch::Sender::new(false),
        }
    }

    pub(crate) fn target(&self) -> &Target {
        &self.target
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn event_sender(&self) -> EventSender {
        self.events.clone()
    }

    pub(crate) fn new_subconn(&self, address: Address) -> Result<SubConn, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let id = SubConnId::new(self.next_subconn.fetch_add(1, Ordering::Relaxed));
        let subconn = SubConn::spawn(id, address, Arc::clone(&self.subconn_context));
        tracing::debug!(target_uri = %self.target, subconn = %id, address = %subconn.address(), "subconn created");
        self.subconns.lock().insert(id, subconn.clone());
        Ok(subconn)
    }

    pub(crate) fn remove_subconn(&self, subconn: &SubConn) {
        if self.subconns.lock().remove(&subconn.id()).is_some() {
            tracing::debug!(subconn = %subconn.id(), address = %subconn.address(), "subconn removed");
        }
        subconn.shutdown();
    }

    pub(crate) fn lookup_subconn(&self, id: SubConnId) -> Option<SubConn> {
        self.subconns.lock().get(&id).cloned()
    }

    /// 移除并返回全部子连接。
    pub(crate) fn take_subconns(&self) -> Vec<SubConn> {
        self.subconns.lock().drain().map(|(_, subconn)| subconn).collect()
    }

    pub(crate) fn request_resolve_now(&self) {
        let _ = self.events.send(ControlEvent::ResolveNow);
    }

    /// 策略发布新状态与 Picker；关闭后忽略。
    pub(crate) fn publish(&self, state: ConnectivityState, picker: Arc<dyn Picker>) {
        if self.is_closed() {
            tracing::trace!(%state, "ignoring picker published after close");
            return;
        }
        self.install(state, picker);
    }

    /// 无条件安装快照：先替换快照，再推进代数，保证被唤醒的调用一定能读到新快照。
    fn install(&self, state: ConnectivityState, picker: Arc<dyn Picker>) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.picker
            .store(Arc::new(PickerSnapshot::new(generation, state, picker)));
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        self.picker_tx.send_replace(generation);
        tracing::debug!(target_uri = %self.target, generation, %state, "picker published");
    }

    pub(crate) fn snapshot(&self) -> Arc<PickerSnapshot> {
        self.picker.load_full()
    }

    pub(crate) fn subscribe_generations(&self) -> watch::Receiver<u64> {
        self.picker_tx.subscribe()
    }

    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn mark_terminated(&self) {
        self.terminated.send_replace(true);
    }
}

/// 逻辑连接的句柄，克隆廉价。
///
/// 最后一个句柄被丢弃时自动关闭；需要等待关闭完成时调用 [`ClientConn::close`]。
#[derive(Clone)]
pub struct ClientConn {
    pub(crate) inner: Arc<ClientConnInner>,
}

pub(crate) struct ClientConnInner {
    pub(crate) shared: Arc<ConnShared>,
}

impl Drop for ClientConnInner {
    fn drop(&mut self) {
        if !self.shared.is_closed() {
            let _ = self.shared.events.send(ControlEvent::Close);
        }
    }
}

impl fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = &self.inner.shared;
        f.debug_struct("ClientConn")
            .field("target", &shared.target.to_string())
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

impl ClientConn {
    pub fn builder(target: impl Into<String>) -> ClientConnBuilder {
        ClientConnBuilder::new(target)
    }

    pub fn target(&self) -> &Target {
        &self.inner.shared.target
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.shared.config
    }

    /// 当前聚合连通性状态。
    pub fn state(&self) -> ConnectivityState {
        *self.inner.shared.state_tx.borrow()
    }

    /// 等待状态离开 `source`；截止前发生变化返回 `true`。
    pub async fn wait_for_state_change(
        &self,
        source: ConnectivityState,
        deadline: Deadline,
    ) -> bool {
        let mut states = self.inner.shared.state_tx.subscribe();
        if *states.borrow_and_update() != source {
            return true;
        }
        let changed = guard(deadline, None, states.wait_for(|state| *state != source)).await;
        matches!(changed, Ok(Ok(_)))
    }

    /// 请求退出空闲并开始建连。
    pub fn connect(&self) {
        if !self.is_closed() {
            let _ = self.inner.shared.events.send(ControlEvent::ExitIdle);
        }
    }

    /// 当前发布的 Picker 快照。
    pub fn picker_snapshot(&self) -> Arc<PickerSnapshot> {
        self.inner.shared.snapshot()
    }

    /// 当前 Picker 代数。
    pub fn generation(&self) -> u64 {
        self.inner.shared.snapshot().generation()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.is_closed()
    }

    /// 关闭连接并等待控制任务退出；重复调用安全。
    ///
    /// 在途调用不会被立即打断：子连接先排空传输，`close_grace_period` 结束后才强制关闭。
    pub async fn close(&self) {
        let shared = &self.inner.shared;
        let _ = shared.events.send(ControlEvent::Close);
        let mut terminated = shared.terminated.subscribe();
        let _ = terminated.wait_for(|done| *done).await;
    }

    /// 诊断快照。
    pub fn diagnostics(&self) -> Diagnostics {
        let shared = &self.inner.shared;
        let mut subconns: Vec<SubConnDiagnostics> = shared
            .subconns
            .lock()
            .values()
            .map(SubConnDiagnostics::from_subconn)
            .collect();
        subconns.sort_by_key(|entry| entry.id);
        let snapshot = shared.snapshot();
        Diagnostics {
            target: shared.target.to_string(),
            state: snapshot.state(),
            generation: snapshot.generation(),
            subconns,
        }
    }
}

/// [`ClientConn`] 构建器。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `connector` 必填，缺失时返回 `InvalidConfig`；
///   - 显式设置的解析器工厂优先，否则按目标 scheme 在注册表中查找，找不到返回 `UnknownScheme`；
///   - 显式设置的策略工厂优先，否则按 `default_balancer` 在注册表中查找；
///   - 必须在 Tokio 运行时内调用 [`ClientConnBuilder::build`]。
pub struct ClientConnBuilder {
    target: String,
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    credentials: Arc<dyn ChannelCredentials>,
    resolver: Option<Arc<dyn ResolverBuilder>>,
    resolvers: ResolverRegistry,
    balancer: Option<Arc<dyn BalancerBuilder>>,
    balancers: BalancerRegistry,
}

impl fmt::Debug for ClientConnBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnBuilder")
            .field("target", &self.target)
            .field("config", &self.config)
            .field("has_connector", &self.connector.is_some())
            .finish_non_exhaustive()
    }
}

impl ClientConnBuilder {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            config: ClientConfig::default(),
            connector: None,
            credentials: Arc::new(InsecureCredentials),
            resolver: None,
            resolvers: ResolverRegistry::with_defaults(),
            balancer: None,
            balancers: BalancerRegistry::with_defaults(),
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn ChannelCredentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// 指定解析器工厂，忽略目标 scheme。
    pub fn resolver(mut self, builder: Arc<dyn ResolverBuilder>) -> Self {
        self.resolver = Some(builder);
        self
    }

    pub fn resolver_registry(mut self, registry: ResolverRegistry) -> Self {
        self.resolvers = registry;
        self
    }

    /// 指定负载均衡策略工厂，忽略 `default_balancer`。
    pub fn balancer(mut self, builder: Arc<dyn BalancerBuilder>) -> Self {
        self.balancer = Some(builder);
        self
    }

    pub fn balancer_registry(mut self, registry: BalancerRegistry) -> Self {
        self.balancers = registry;
        self
    }

    pub fn build(self) -> Result<ClientConn, ClientError> {
        self.config.validate()?;
        let target = Target::parse_with_default(&self.target, &self.config.default_scheme)?;
        let connector = self
            .connector
            .ok_or_else(|| ClientError::invalid_config("no connector configured"))?;
        let resolver_builder = match self.resolver {
            Some(builder) => builder,
            None => self
                .resolvers
                .get(target.scheme())
                .ok_or_else(|| ClientError::UnknownScheme {
                    scheme: target.scheme().to_owned(),
                })?,
        };
        let balancer_builder = match self.balancer {
            Some(builder) => builder,
            None => self
                .balancers
                .get(&self.config.default_balancer)
                .ok_or_else(|| {
                    ClientError::invalid_config(format!(
                        "unknown balancer policy `{}`",
                        self.config.default_balancer
                    ))
                })?,
        };

        let options = BuildOptions {
            min_resolve_interval: self.config.resolver.min_resolve_interval,
            dns_refresh_interval: self.config.resolver.dns_refresh_interval,
            backoff: self.config.backoff,
        };
        let (events, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(ConnShared::new(
            target,
            self.config,
            connector,
            self.credentials,
            events.clone(),
        ));

        let balancer = balancer_builder.build(BalancerHandle::new(Arc::clone(&shared)));
        let resolver = match resolver_builder.build(
            shared.target(),
            ResolverHandle::new(events),
            &options,
        ) {
            Ok(resolver) => resolver,
            Err(err) => {
                shared.mark_closed();
                return Err(err);
            }
        };
        tracing::debug!(
            target_uri = %shared.target(),
            resolver = resolver_builder.scheme(),
            balancer = balancer_builder.name(),
            "client connection created"
        );

        let worker = Worker::new(Arc::clone(&shared), balancer, resolver, receiver);
        tokio::spawn(worker.run());
        Ok(ClientConn {
            inner: Arc::new(ClientConnInner { shared }),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;
    use crate::balancer::PickFirstBuilder;
    use crate::resolver::ManualResolverBuilder;
    use crate::test_stubs::MockConnector;

    #[tokio::test]
    #[traced_test]
    async fn lifecycle_is_logged_with_structured_fields() {
        let connector = MockConnector::new();
        connector.refuse("10.0.0.9:80");
        let resolver = ManualResolverBuilder::new("manual")
            .with_initial_state(ResolverState::new([Address::from("10.0.0.9:80")]));
        let conn = ClientConn::builder("manual:///svc")
            .connector(Arc::new(connector.clone()))
            .resolver(Arc::new(resolver))
            .balancer(Arc::new(PickFirstBuilder))
            .build()
            .expect("构建失败");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while conn.state() != ConnectivityState::TransientFailure {
            assert!(tokio::time::Instant::now() < deadline, "未进入 TransientFailure");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        conn.close().await;

        assert!(logs_contain("client connection created"));
        assert!(logs_contain("subconn created"));
        assert!(logs_contain("picker published"));
        assert!(logs_contain("TRANSIENT_FAILURE"));
        assert!(logs_contain("client connection closed"));
    }

    #[tokio::test]
    async fn failed_resolver_build_leaves_nothing_running() {
        let err = ClientConn::builder("static:///")
            .connector(Arc::new(MockConnector::new()))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), "spark.client.target.invalid");
    }
}
