//! `round_robin`：对每个地址保持一条连接，调用在 Ready 的连接之间轮转。
//!
//! # 教案式说明
//! - **逻辑 (How)**：
//!   1. 每次解析结果到达时调和子连接集合，新地址立即建连；
//!   2. 子连接回到 Idle（对端排空或干净断开）时立即重连；进入 TransientFailure 时请求重新解析；
//!   3. 每次状态变化后用聚合器计算整体状态：Ready 时发布按权重展开的轮询 Picker，
//!      Connecting/Idle 时让调用等待，TransientFailure 时携带最近一次失败原因。
//! - **契约 (What)**：配置必须是空对象；聚合规则可通过 [`RoundRobinBuilder::with_aggregator`] 替换；
//!   只有聚合状态、Ready 集合或对外报告的失败原因变化时才发布新 Picker。

use std::fmt;
use std::sync::Arc;

use crate::balancer::base::no_backends;
use crate::balancer::{
    Balancer, BalancerBuilder, BalancerHandle, DeferPicker, ErrorPicker, Picker, RoundRobinPicker,
    SubConnSet, parse_config_object,
};
use crate::connectivity::{ConnectivityState, DefaultAggregator, StateAggregator};
use crate::error::ClientError;
use crate::resolver::ResolverState;
use crate::subconn::{SubConn, SubConnId, SubConnState};

pub const NAME: &str = "round_robin";

#[derive(Clone)]
pub struct RoundRobinBuilder {
    aggregator: Arc<dyn StateAggregator>,
}

impl fmt::Debug for RoundRobinBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundRobinBuilder").finish_non_exhaustive()
    }
}

impl Default for RoundRobinBuilder {
    fn default() -> Self {
        Self {
            aggregator: Arc::new(DefaultAggregator),
        }
    }
}

impl RoundRobinBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 替换状态聚合规则。
    pub fn with_aggregator(aggregator: Arc<dyn StateAggregator>) -> Self {
        Self { aggregator }
    }
}

impl BalancerBuilder for RoundRobinBuilder {
    fn name(&self) -> &str {
        NAME
    }

    fn build(&self, handle: BalancerHandle) -> Box<dyn Balancer> {
        Box::new(RoundRobin {
            handle,
            aggregator: Arc::clone(&self.aggregator),
            subconns: SubConnSet::new(),
            published: None,
        })
    }
}

/// 决定 Picker 行为的全部输入；相同则无需重新发布。
#[derive(Debug, PartialEq, Eq)]
struct PickerKey {
    state: ConnectivityState,
    ready: Vec<SubConnId>,
    error: Option<ClientError>,
}

struct RoundRobin {
    handle: BalancerHandle,
    aggregator: Arc<dyn StateAggregator>,
    subconns: SubConnSet,
    published: Option<PickerKey>,
}

impl RoundRobin {
    /// 发布 Picker；返回 `false` 表示与上次发布相同而被跳过。
    fn publish(&mut self, key: PickerKey, picker: impl FnOnce() -> Arc<dyn Picker>) -> bool {
        if self.published.as_ref() == Some(&key) {
            return false;
        }
        self.handle.update_state(key.state, picker());
        self.published = Some(key);
        true
    }

    fn publish_failure(&mut self, error: ClientError) -> bool {
        let key = PickerKey {
            state: ConnectivityState::TransientFailure,
            ready: Vec::new(),
            error: Some(error.clone()),
        };
        self.publish(key, || Arc::new(ErrorPicker::transient(error)))
    }

    fn regenerate(&mut self) {
        let state = self.aggregator.aggregate(&self.subconns.states());
        match state {
            ConnectivityState::Ready => {
                let ready = self.subconns.ready();
                let key = PickerKey {
                    state,
                    ready: ready.iter().map(SubConn::id).collect(),
                    error: None,
                };
                if self.publish(key, || Arc::new(RoundRobinPicker::weighted(&ready))) {
                    tracing::trace!(ready = ready.len(), "round_robin published picker");
                }
            }
            ConnectivityState::TransientFailure => {
                let err = ClientError::unavailable(
                    "all subconnections failing",
                    self.subconns.last_error().cloned(),
                );
                self.publish_failure(err);
            }
            _ => {
                let key = PickerKey {
                    state,
                    ready: Vec::new(),
                    error: None,
                };
                self.publish(key, || Arc::new(DeferPicker));
            }
        }
    }
}

impl Balancer for RoundRobin {
    fn update_resolver_state(&mut self, state: &ResolverState) -> Result<(), ClientError> {
        parse_config_object(state.config(), NAME, &[])?;

        if state.is_empty() {
            self.subconns.remove_all(&self.handle);
            if self.publish_failure(no_backends()) {
                self.handle.resolve_now();
            }
            return Ok(());
        }

        let added = self.subconns.reconcile(&self.handle, state.addresses())?;
        for subconn in &added {
            subconn.connect();
        }
        self.regenerate();
        Ok(())
    }

    fn resolver_error(&mut self, error: ClientError) {
        if self.subconns.is_empty() {
            self.publish_failure(error);
        }
    }

    fn update_subconn_state(&mut self, subconn: &SubConn, update: &SubConnState) {
        if !self.subconns.update(subconn, update) {
            return;
        }
        match update.state {
            ConnectivityState::Idle => subconn.connect(),
            ConnectivityState::TransientFailure => self.handle.resolve_now(),
            _ => {}
        }
        self.regenerate();
    }

    fn exit_idle(&mut self) {
        for subconn in self.subconns.with_state(ConnectivityState::Idle) {
            subconn.connect();
        }
    }

    fn close(&mut self) {
        self.subconns.remove_all(&self.handle);
    }
}
