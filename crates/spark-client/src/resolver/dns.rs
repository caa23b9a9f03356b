//! `dns:///host:port` 解析器。
//!
//! # 教案式说明
//! - **逻辑 (How)**：后台任务循环执行查询。成功后等待 `resolve_now` 或周期刷新；
//!   失败后按退避重试，并通过 `report_error` 报告，不提交空列表；
//!   两次查询之间至少间隔 `min_resolve_interval`，间隔内的重复请求合并为一次；
//! - **契约 (What)**：endpoint 为 IP 字面量时直接提交结果，不启动后台任务；
//!   查询成功但没有记录时提交空状态（附带说明），交由负载均衡策略处理。

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::address::Address;
use crate::backoff::Backoff;
use crate::contract::Cancellation;
use crate::error::ClientError;
use crate::resolver::{BuildOptions, Resolver, ResolverBuilder, ResolverHandle, ResolverState};
use crate::target::Target;

/// 未写端口时使用的默认端口。
pub const DEFAULT_PORT: u16 = 443;

/// 主机名查询接口，便于在测试中替换系统解析。
#[async_trait]
pub trait HostLookup: Send + Sync + 'static {
    async fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// 基于 `tokio::net::lookup_host` 的系统查询。
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioHostLookup;

#[async_trait]
impl HostLookup for TokioHostLookup {
    async fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

#[derive(Clone)]
pub struct DnsResolverBuilder {
    lookup: Arc<dyn HostLookup>,
    default_port: u16,
}

impl Default for DnsResolverBuilder {
    fn default() -> Self {
        Self::new(Arc::new(TokioHostLookup))
    }
}

impl DnsResolverBuilder {
    pub fn new(lookup: Arc<dyn HostLookup>) -> Self {
        Self {
            lookup,
            default_port: DEFAULT_PORT,
        }
    }

    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }
}

impl ResolverBuilder for DnsResolverBuilder {
    fn scheme(&self) -> &str {
        "dns"
    }

    fn build(
        &self,
        target: &Target,
        handle: ResolverHandle,
        options: &BuildOptions,
    ) -> Result<Box<dyn Resolver>, ClientError> {
        let (host, port) = split_host_port(target.endpoint(), self.default_port).ok_or_else(|| {
            ClientError::InvalidTarget {
                target: target.to_string(),
                reason: "dns endpoint must be `host` or `host:port`".to_owned(),
            }
        })?;

        let (trigger, requests) = mpsc::channel(1);
        let shared = Arc::new(DnsShared {
            trigger,
            shutdown: Cancellation::new(),
        });

        if let Ok(ip) = host.parse::<IpAddr>() {
            let address = Address::new(SocketAddr::new(ip, port).to_string());
            handle.send_state(ResolverState::new([address]))?;
            return Ok(Box::new(DnsResolver { shared }));
        }

        let task = DnsTask {
            host,
            port,
            lookup: Arc::clone(&self.lookup),
            handle,
            options: options.clone(),
            shared: Arc::clone(&shared),
            requests,
        };
        tokio::spawn(task.run());
        Ok(Box::new(DnsResolver { shared }))
    }
}

struct DnsShared {
    /// 容量为 1：已有待处理的请求时，新的请求被合并。
    trigger: mpsc::Sender<()>,
    shutdown: Cancellation,
}

struct DnsResolver {
    shared: Arc<DnsShared>,
}

impl Resolver for DnsResolver {
    fn resolve_now(&self) {
        let _ = self.shared.trigger.try_send(());
    }

    fn close(&self) {
        self.shared.shutdown.cancel();
    }
}

struct DnsTask {
    host: String,
    port: u16,
    lookup: Arc<dyn HostLookup>,
    handle: ResolverHandle,
    options: BuildOptions,
    shared: Arc<DnsShared>,
    requests: mpsc::Receiver<()>,
}

impl DnsTask {
    async fn run(mut self) {
        let mut backoff = Backoff::new(self.options.backoff, 0);
        let mut last_resolution: Option<Instant> = None;
        let shared = Arc::clone(&self.shared);
        let shutdown = &shared.shutdown;

        loop {
            if let Some(last) = last_resolution {
                let earliest = last + self.options.min_resolve_interval;
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep_until(earliest) => {}
                }
            }
            last_resolution = Some(Instant::now());
            // 本次查询覆盖此前积累的全部请求。
            while self.requests.try_recv().is_ok() {}

            let lookup = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                result = self.lookup.lookup(&self.host, self.port) => result,
            };

            match lookup {
                Ok(addrs) => {
                    backoff.reset();
                    let mut state =
                        ResolverState::new(addrs.iter().map(|addr| Address::new(addr.to_string())));
                    if state.is_empty() {
                        state = state.with_note(format!("no records for {}", self.host));
                    }
                    tracing::debug!(
                        host = %self.host,
                        addresses = state.addresses().len(),
                        "dns resolution completed"
                    );
                    if let Err(err) = self.handle.update_state(state).await {
                        if err == ClientError::Closed {
                            return;
                        }
                        tracing::debug!(host = %self.host, error = %err, "resolver state rejected");
                    }

                    let refresh_interval = self.options.dns_refresh_interval;
                    let refresh = async {
                        match refresh_interval {
                            Some(interval) => tokio::time::sleep(interval).await,
                            None => std::future::pending::<()>().await,
                        }
                    };
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return,
                        _ = self.requests.recv() => {}
                        _ = refresh => {}
                    }
                }
                Err(err) => {
                    let detail = format!("lookup of `{}` failed: {err}", self.host);
                    tracing::debug!(host = %self.host, error = %err, "dns resolution failed");
                    if self
                        .handle
                        .report_error(ClientError::resolution(detail))
                        .is_err()
                    {
                        return;
                    }
                    let delay = backoff.next_delay();
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    // 重试不受最小间隔约束。
                    last_resolution = None;
                }
            }
        }
    }
}

/// 拆分 `host[:port]`，支持 `[v6]:port` 与裸 IPv6 字面量。
fn split_host_port(endpoint: &str, default_port: u16) -> Option<(String, u16)> {
    if endpoint.is_empty() {
        return None;
    }
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return Some((addr.ip().to_string(), addr.port()));
    }
    if let Ok(ip) = endpoint.parse::<IpAddr>() {
        return Some((ip.to_string(), default_port));
    }
    if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if tail.is_empty() => default_port,
            None => return None,
        };
        return Some((host.to_owned(), port));
    }
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            Some((host.to_owned(), port.parse().ok()?))
        }
        Some(_) => None,
        None => Some((endpoint.to_owned(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::backoff::BackoffConfig;
    use crate::clientconn::ControlEvent;

    /// 按脚本依次返回结果的查询；脚本用完后总是返回一个固定地址。
    #[derive(Default)]
    struct ScriptedLookup {
        script: Mutex<VecDeque<io::Result<Vec<SocketAddr>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedLookup {
        fn new(script: impl IntoIterator<Item = io::Result<Vec<SocketAddr>>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().collect()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HostLookup for ScriptedLookup {
        async fn lookup(&self, _host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(vec![SocketAddr::from(([10, 0, 0, 1], port))]))
        }
    }

    enum Seen {
        State(ResolverState),
        Error(ClientError),
    }

    struct Running {
        resolver: Box<dyn Resolver>,
        events: tokio::sync::mpsc::UnboundedReceiver<ControlEvent>,
    }

    impl Running {
        fn start(endpoint: &str, lookup: Arc<ScriptedLookup>, options: BuildOptions) -> Self {
            let (events_tx, events) = tokio::sync::mpsc::unbounded_channel();
            let target = Target::parse_with_default(&format!("dns:///{endpoint}"), "dns")
                .expect("目标串非法");
            let resolver = DnsResolverBuilder::new(lookup)
                .build(&target, ResolverHandle::new(events_tx), &options)
                .expect("构建解析器失败");
            Self { resolver, events }
        }

        /// 取下一条解析结果，并替 ClientConn 回复裁决。
        async fn next(&mut self) -> Seen {
            let event = tokio::time::timeout(Duration::from_secs(2), self.events.recv())
                .await
                .expect("等待解析结果超时")
                .expect("事件通道已关闭");
            match event {
                ControlEvent::ResolverUpdate { state, reply } => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(()));
                    }
                    Seen::State(state)
                }
                ControlEvent::ResolverError(err) => Seen::Error(err),
                other => panic!("解析器不应投递 {other:?}"),
            }
        }

        async fn next_state(&mut self) -> ResolverState {
            match self.next().await {
                Seen::State(state) => state,
                Seen::Error(err) => panic!("期望解析结果，得到错误 {err}"),
            }
        }

        /// `window` 内没有任何新事件。
        async fn quiet(&mut self, window: Duration) -> bool {
            tokio::time::timeout(window, self.events.recv()).await.is_err()
        }
    }

    fn options(min_resolve_interval: Duration, dns_refresh_interval: Option<Duration>) -> BuildOptions {
        BuildOptions {
            min_resolve_interval,
            dns_refresh_interval,
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(20),
                multiplier: 1.6,
                jitter: 0.0,
                max_delay: Duration::from_millis(100),
                min_stable_duration: Duration::from_secs(10),
            },
        }
    }

    fn record(last_octet: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last_octet], 50051))
    }

    #[tokio::test]
    async fn resolve_now_is_rate_limited_and_coalesced() {
        let lookup = ScriptedLookup::new([]);
        let mut running = Running::start(
            "svc.test:50051",
            Arc::clone(&lookup),
            options(Duration::from_millis(300), None),
        );
        let first = running.next_state().await;
        assert_eq!(first.addresses().len(), 1);
        assert_eq!(lookup.calls(), 1);

        for _ in 0..5 {
            running.resolver.resolve_now();
        }
        assert!(
            running.quiet(Duration::from_millis(150)).await,
            "最小间隔内不应再次查询"
        );
        assert_eq!(lookup.calls(), 1);

        running.next_state().await;
        assert_eq!(lookup.calls(), 2);
        assert!(
            running.quiet(Duration::from_millis(600)).await,
            "一串 resolve_now 只应触发一次查询"
        );
        assert_eq!(lookup.calls(), 2, "重复请求应被合并");
        running.resolver.close();
    }

    #[tokio::test]
    async fn lookup_error_is_reported_instead_of_an_empty_state() {
        let lookup = ScriptedLookup::new([
            Err(io::Error::new(io::ErrorKind::NotFound, "nxdomain")),
            Ok(vec![record(7)]),
        ]);
        let mut running = Running::start(
            "svc.test:50051",
            Arc::clone(&lookup),
            options(Duration::from_millis(10), None),
        );

        match running.next().await {
            Seen::Error(err) => {
                assert_eq!(err.code(), "spark.client.resolver.failed");
                assert!(err.to_string().contains("svc.test"), "{err}");
            }
            Seen::State(state) => panic!("查询失败时不应提交状态：{:?}", state.addresses()),
        }
        // 按退避重试，成功后提交真实结果。
        let state = running.next_state().await;
        assert_eq!(state.addresses(), [Address::new(record(7).to_string())]);
        assert_eq!(lookup.calls(), 2);
        running.resolver.close();
    }

    #[tokio::test]
    async fn zero_records_produce_an_empty_state_with_a_note() {
        let lookup = ScriptedLookup::new([Ok(Vec::new())]);
        let mut running = Running::start(
            "svc.test:50051",
            lookup,
            options(Duration::from_millis(10), None),
        );
        let state = running.next_state().await;
        assert!(state.is_empty());
        assert!(
            state.note().is_some_and(|note| note.contains("no records")),
            "空结果应附带说明：{:?}",
            state.note()
        );
        running.resolver.close();
    }

    #[tokio::test]
    async fn periodic_refresh_repeats_lookups() {
        let lookup = ScriptedLookup::new([Ok(vec![record(1)]), Ok(vec![record(2)])]);
        let mut running = Running::start(
            "svc.test:50051",
            Arc::clone(&lookup),
            options(Duration::from_millis(10), Some(Duration::from_millis(50))),
        );
        let first = running.next_state().await;
        let second = running.next_state().await;
        let third = running.next_state().await;
        assert_eq!(first.addresses(), [Address::new(record(1).to_string())]);
        assert_eq!(second.addresses(), [Address::new(record(2).to_string())]);
        assert_eq!(third.addresses().len(), 1);
        assert!(lookup.calls() >= 3);
        running.resolver.close();
    }

    #[tokio::test]
    async fn close_stops_the_background_task() {
        let lookup = ScriptedLookup::new([]);
        let mut running = Running::start(
            "svc.test:50051",
            Arc::clone(&lookup),
            options(Duration::from_millis(10), Some(Duration::from_millis(20))),
        );
        running.next_state().await;
        running.resolver.close();

        // 任务退出后释放句柄，事件通道随之关闭。
        let drained = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(event) = running.events.recv().await {
                if let ControlEvent::ResolverUpdate { reply: Some(reply), .. } = event {
                    let _ = reply.send(Ok(()));
                }
            }
        })
        .await;
        assert!(drained.is_ok(), "关闭后后台任务仍在运行");
        let calls = lookup.calls();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(lookup.calls(), calls);
    }

    #[tokio::test]
    async fn ip_literal_skips_lookup() {
        let lookup = ScriptedLookup::new([]);
        let mut running = Running::start(
            "10.1.2.3:8080",
            Arc::clone(&lookup),
            options(Duration::from_millis(10), None),
        );
        let state = running.next_state().await;
        assert_eq!(state.addresses(), [Address::new("10.1.2.3:8080")]);
        assert_eq!(lookup.calls(), 0);
    }

    #[test]
    fn splits_host_and_port() {
        assert_eq!(
            split_host_port("example.org:8080", 443),
            Some(("example.org".to_owned(), 8080))
        );
        assert_eq!(split_host_port("example.org", 443), Some(("example.org".to_owned(), 443)));
        assert_eq!(split_host_port("[::1]:50051", 443), Some(("::1".to_owned(), 50051)));
        assert_eq!(split_host_port("::1", 443), Some(("::1".to_owned(), 443)));
        assert_eq!(split_host_port("host:abc", 443), None);
        assert_eq!(split_host_port("", 443), None);
    }
}
