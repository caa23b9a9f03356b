//! 负载均衡：把地址集合变成子连接集合，再把子连接状态变成 Picker。
//!
//! # 教案级说明
//!
//! ## 意图（Why）
//! - 策略是插件：核心只规定生命周期回调与能力句柄，不规定权重算法；
//! - 策略只在 ClientConn 的控制线程上被调用（`&mut self`），因此内部不需要任何锁。
//!
//! ## 契约（What）
//! - [`Balancer::update_resolver_state`]：调和子连接集合（新增、优雅移除、保留不变），
//!   重复提交相同状态是幂等的；仅当配置非法时失败，且失败不产生任何副作用；
//! - [`Balancer::resolver_error`]：没有子连接时发布携带该错误的失败 Picker，
//!   已有子连接时继续使用旧地址；
//! - [`Balancer::update_subconn_state`]：重新聚合状态并发布新 Picker；
//! - 策略通过 [`BalancerHandle`] 创建/移除子连接、发布 Picker、请求重新解析，
//!   它无法触碰解析器或 ClientConn 的其它部分。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::address::Address;
use crate::clientconn::ConnShared;
use crate::connectivity::ConnectivityState;
use crate::error::ClientError;
use crate::resolver::ResolverState;
use crate::subconn::{SubConn, SubConnState};

mod base;
pub mod pick_first;
pub mod picker;
pub mod round_robin;

pub use base::SubConnSet;
pub use pick_first::PickFirstBuilder;
pub use picker::{
    DeferPicker, ErrorPicker, IdlePicker, PickInfo, PickResult, Picker, PickerSnapshot,
    RoundRobinPicker, SinglePicker,
};
pub use round_robin::RoundRobinBuilder;

/// 负载均衡策略。
pub trait Balancer: Send + 'static {
    fn update_resolver_state(&mut self, state: &ResolverState) -> Result<(), ClientError>;

    fn resolver_error(&mut self, error: ClientError);

    fn update_subconn_state(&mut self, subconn: &SubConn, update: &SubConnState);

    /// 处于 Idle 时开始建连。
    fn exit_idle(&mut self);

    /// 释放全部子连接。
    fn close(&mut self);
}

/// 策略工厂。
pub trait BalancerBuilder: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn build(&self, handle: BalancerHandle) -> Box<dyn Balancer>;
}

/// 策略可以使用的全部能力。
#[derive(Clone)]
pub struct BalancerHandle {
    shared: Arc<ConnShared>,
}

impl fmt::Debug for BalancerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BalancerHandle")
            .field("target", &self.shared.target().to_string())
            .finish()
    }
}

impl BalancerHandle {
    pub(crate) fn new(shared: Arc<ConnShared>) -> Self {
        Self { shared }
    }

    /// 为地址创建处于 Idle 的子连接；ClientConn 关闭后返回 `Closed`。
    pub fn new_subconn(&self, address: Address) -> Result<SubConn, ClientError> {
        self.shared.new_subconn(address)
    }

    /// 优雅移除子连接：在途流继续完成，之后进入 Shutdown。
    pub fn remove_subconn(&self, subconn: &SubConn) {
        self.shared.remove_subconn(subconn);
    }

    /// 发布新的聚合状态与 Picker。
    pub fn update_state(&self, state: ConnectivityState, picker: Arc<dyn Picker>) {
        self.shared.publish(state, picker);
    }

    /// 请求解析器尽快重新解析。
    pub fn resolve_now(&self) {
        self.shared.request_resolve_now();
    }

    /// Idle 状态下使用的 Picker：首次挑选时触发退出空闲。
    pub fn idle_picker(&self) -> Arc<dyn Picker> {
        Arc::new(IdlePicker::new(self.shared.event_sender()))
    }
}

/// 名称到策略工厂的映射。
#[derive(Clone)]
pub struct BalancerRegistry {
    builders: HashMap<String, Arc<dyn BalancerBuilder>>,
}

impl fmt::Debug for BalancerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.builders.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("BalancerRegistry")
            .field("policies", &names)
            .finish()
    }
}

impl Default for BalancerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl BalancerRegistry {
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// 预置 `pick_first` 与 `round_robin`。
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PickFirstBuilder));
        registry.register(Arc::new(RoundRobinBuilder::default()));
        registry
    }

    pub fn register(&mut self, builder: Arc<dyn BalancerBuilder>) {
        self.builders.insert(builder.name().to_owned(), builder);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BalancerBuilder>> {
        self.builders.get(name).cloned()
    }
}

/// 解析策略配置：必须是 JSON 对象，且只包含 `allowed` 中的键。
pub(crate) fn parse_config_object(
    raw: Option<&str>,
    policy: &str,
    allowed: &[&str],
) -> Result<serde_json::Map<String, serde_json::Value>, ClientError> {
    let Some(raw) = raw else {
        return Ok(serde_json::Map::new());
    };
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|err| ClientError::invalid_config(format!("{policy} config: {err}")))?;
    let serde_json::Value::Object(object) = value else {
        return Err(ClientError::invalid_config(format!(
            "{policy} config must be a JSON object"
        )));
    };
    if let Some(unknown) = object.keys().find(|key| !allowed.contains(&key.as_str())) {
        return Err(ClientError::invalid_config(format!(
            "{policy} config has unknown field `{unknown}`"
        )));
    }
    Ok(object)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_must_be_object_with_known_keys() {
        assert!(parse_config_object(None, "p", &[]).unwrap().is_empty());
        assert!(parse_config_object(Some("{}"), "p", &[]).is_ok());
        assert!(parse_config_object(Some(r#"{"a": 1}"#), "p", &["a"]).is_ok());

        for raw in ["[]", "1", "not json", r#"{"b": 1}"#] {
            let err = parse_config_object(Some(raw), "p", &["a"]).unwrap_err();
            assert_eq!(err.code(), "spark.client.config.invalid", "{raw}");
        }
    }
}
