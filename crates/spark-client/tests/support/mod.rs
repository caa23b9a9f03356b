//! 集成测试共用的构造器与等待工具。

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use spark_client::balancer::{BalancerBuilder, PickInfo, PickResult};
use spark_client::resolver::{ManualResolver, ManualResolverBuilder};
use spark_client::test_stubs::MockConnector;
use spark_client::{Address, BackoffConfig, ClientConfig, ClientConn, ResolverState};

/// 等待条件成立，超时则带着描述失败。
pub async fn eventually(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "等待超时：{what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn state(addrs: &[&str]) -> ResolverState {
    ResolverState::new(addrs.iter().copied().map(Address::from))
}

/// 退避短、无抖动的配置，让重连在毫秒级完成。
pub fn fast_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.backoff = BackoffConfig {
        base_delay: Duration::from_millis(20),
        multiplier: 1.6,
        jitter: 0.0,
        max_delay: Duration::from_millis(200),
        min_stable_duration: Duration::from_secs(10),
    };
    config.transport.min_connect_timeout = Duration::from_secs(1);
    config.close_grace_period = Duration::from_millis(500);
    config
}

pub struct Harness {
    pub conn: ClientConn,
    pub connector: MockConnector,
    pub resolver: ManualResolver,
}

/// 以手动解析器与内存连接器构建 ClientConn；`initial` 为空时不提交初始状态。
pub fn harness(
    connector: MockConnector,
    balancer: Arc<dyn BalancerBuilder>,
    initial: Option<ResolverState>,
) -> Harness {
    harness_with_config(connector, balancer, initial, fast_config())
}

pub fn harness_with_config(
    connector: MockConnector,
    balancer: Arc<dyn BalancerBuilder>,
    initial: Option<ResolverState>,
    config: ClientConfig,
) -> Harness {
    let mut builder = ManualResolverBuilder::new("manual");
    if let Some(initial) = initial {
        builder = builder.with_initial_state(initial);
    }
    let resolver = builder.resolver();
    let conn = ClientConn::builder("manual:///echo.service")
        .config(config)
        .connector(Arc::new(connector.clone()))
        .resolver(Arc::new(builder))
        .balancer(balancer)
        .build()
        .expect("构建 ClientConn 失败");
    Harness {
        conn,
        connector,
        resolver,
    }
}

/// 当前快照挑中的地址；非 Complete 时返回 `None`。
pub fn picked_address(conn: &ClientConn) -> Option<String> {
    match conn.picker_snapshot().pick(&PickInfo { method: "/echo" }) {
        PickResult::Complete(subconn) => Some(subconn.address().addr().to_owned()),
        _ => None,
    }
}

/// 存活子连接的地址集合（排序后）。
pub fn live_addresses(conn: &ClientConn) -> Vec<String> {
    let mut addrs: Vec<String> = conn
        .diagnostics()
        .subconns
        .iter()
        .map(|entry| entry.address.addr().to_owned())
        .collect();
    addrs.sort();
    addrs
}
