//! 子连接：单个地址上的连接状态机。
//!
//! # 教案级说明
//!
//! ## 意图（Why）
//! - 负载均衡策略只决定“连哪些地址”，真正的建连、重连、退避与传输生命周期由子连接驱动；
//! - 每个子连接由一个独立的 Tokio 任务推进，状态变化以事件形式投递到 ClientConn 的控制队列，
//!   从不重入地回调策略。
//!
//! ## 状态迁移（How）
//! ```text
//! Idle ──connect──▶ Connecting ──握手成功──▶ Ready
//!   ▲                 │   ▲                    │
//!   │            失败/超时 退避结束           对端排空/干净断开 ⇒ Idle
//!   │                 ▼   │                   致命错误 ⇒ TransientFailure
//!   └──────────── TransientFailure ◀───────────┘
//! 任意状态 ──shutdown──▶ Shutdown（终态）
//! ```
//!
//! ## 契约（What）
//! - 地址在创建后不可变；只有 Ready 时才持有传输；
//! - 建连超时取 `max(min_connect_timeout, 当前退避)`；
//! - 连接存活超过 `min_stable_duration` 后退避归零；
//! - 关闭 Ready 的子连接时先排空传输，宽限期结束仍未关闭则强制关闭；
//! - 退避等待可被关闭立即打断。

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::address::Address;
use crate::backoff::{Backoff, BackoffConfig};
use crate::clientconn::{ControlEvent, EventSender};
use crate::config::TransportConfig;
use crate::connectivity::ConnectivityState;
use crate::error::ClientError;
use crate::transport::{
    ChannelCredentials, CloseReason, ConnectOptions, Connector, Lifecycle, Transport,
};

/// 子连接编号，在所属 ClientConn 内唯一。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubConnId(u64);

impl SubConnId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subconn-{}", self.0)
    }
}

/// 投递给负载均衡策略的状态更新。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubConnState {
    pub state: ConnectivityState,
    /// 进入 TransientFailure 的原因。
    pub error: Option<ClientError>,
}

/// 子连接共享的建连依赖。
pub(crate) struct SubConnContext {
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) credentials: Arc<dyn ChannelCredentials>,
    pub(crate) transport: TransportConfig,
    pub(crate) backoff: BackoffConfig,
    pub(crate) authority: String,
    pub(crate) close_grace_period: Duration,
    pub(crate) events: EventSender,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    Connect,
    Shutdown,
}

#[derive(Debug)]
struct Status {
    state: ConnectivityState,
    last_error: Option<ClientError>,
    attempts: u64,
}

struct SubConnShared {
    id: SubConnId,
    address: Address,
    transport: ArcSwapOption<Transport>,
    status: Mutex<Status>,
}

/// 子连接句柄，克隆廉价；相等性与哈希只看编号。
#[derive(Clone)]
pub struct SubConn {
    shared: Arc<SubConnShared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl PartialEq for SubConn {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for SubConn {}

impl Hash for SubConn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state);
    }
}

impl fmt::Debug for SubConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubConn")
            .field("id", &self.shared.id)
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .finish()
    }
}

impl SubConn {
    /// 创建子连接并启动驱动任务，初始状态为 Idle。
    pub(crate) fn spawn(id: SubConnId, address: Address, context: Arc<SubConnContext>) -> SubConn {
        let (commands, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(SubConnShared {
            id,
            address,
            transport: ArcSwapOption::empty(),
            status: Mutex::new(Status {
                state: ConnectivityState::Idle,
                last_error: None,
                attempts: 0,
            }),
        });
        let driver = Driver {
            backoff: Backoff::new(context.backoff, id.get()),
            shared: Arc::clone(&shared),
            commands: receiver,
            context,
        };
        tokio::spawn(driver.run());
        SubConn { shared, commands }
    }

    pub fn id(&self) -> SubConnId {
        self.shared.id
    }

    pub fn address(&self) -> &Address {
        &self.shared.address
    }

    /// 请求建连；仅在 Idle 时生效。
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// 当前传输；只有 Ready 时存在。
    pub fn transport(&self) -> Option<Transport> {
        self.shared
            .transport
            .load_full()
            .map(|transport| Transport::clone(&transport))
    }

    /// 最近一次观察到的状态，仅用于诊断；策略应以事件为准。
    pub fn state(&self) -> ConnectivityState {
        self.shared.status.lock().state
    }

    pub fn last_error(&self) -> Option<ClientError> {
        self.shared.status.lock().last_error.clone()
    }

    /// 累计建连尝试次数。
    pub fn attempts(&self) -> u64 {
        self.shared.status.lock().attempts
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// 一次等待的结局。
enum Wake<T> {
    Done(T),
    Shutdown,
}

struct Driver {
    shared: Arc<SubConnShared>,
    commands: mpsc::UnboundedReceiver<Command>,
    context: Arc<SubConnContext>,
    backoff: Backoff,
}

impl Driver {
    async fn run(mut self) {
        let mut next = ConnectivityState::Idle;
        loop {
            next = match next {
                ConnectivityState::Idle => match self.commands.recv().await {
                    Some(Command::Connect) => ConnectivityState::Connecting,
                    Some(Command::Shutdown) | None => break,
                },
                ConnectivityState::Connecting => match self.connect().await {
                    Wake::Done(state) => state,
                    Wake::Shutdown => break,
                },
                ConnectivityState::TransientFailure => {
                    let delay = self.backoff.next_delay();
                    match self.wait(tokio::time::sleep(delay)).await {
                        Wake::Done(()) => ConnectivityState::Connecting,
                        Wake::Shutdown => break,
                    }
                }
                ConnectivityState::Ready | ConnectivityState::Shutdown => break,
            };
        }

        self.shared.transport.store(None);
        self.publish(ConnectivityState::Shutdown, None);
    }

    /// 驱动 `future`，期间忽略重复的 Connect，收到关闭立即返回。
    async fn wait<F: std::future::Future>(&mut self, future: F) -> Wake<F::Output> {
        tokio::pin!(future);
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Connect) => continue,
                    Some(Command::Shutdown) | None => return Wake::Shutdown,
                },
                output = &mut future => return Wake::Done(output),
            }
        }
    }

    /// 一次建连尝试；成功后停留在 Ready 直到传输失效。
    async fn connect(&mut self) -> Wake<ConnectivityState> {
        self.shared.status.lock().attempts += 1;
        self.publish(ConnectivityState::Connecting, None);

        let timeout = self
            .context
            .transport
            .min_connect_timeout
            .max(self.backoff.current());
        let address = self.shared.address.clone();
        let context = Arc::clone(&self.context);
        let attempt = tokio::time::timeout(timeout, establish(address.clone(), context, timeout));

        let outcome = self.wait(attempt).await;
        let transport = match outcome {
            Wake::Shutdown => return Wake::Shutdown,
            Wake::Done(Ok(Ok(transport))) => transport,
            Wake::Done(Ok(Err(err))) => return Wake::Done(self.fail(err)),
            Wake::Done(Err(_elapsed)) => {
                let err = ClientError::ConnectTimeout {
                    address: address.to_string(),
                };
                return Wake::Done(self.fail(err));
            }
        };

        self.shared
            .transport
            .store(Some(Arc::new(transport.clone())));
        self.publish(ConnectivityState::Ready, None);
        self.serve(transport).await
    }

    fn fail(&mut self, err: ClientError) -> ConnectivityState {
        tracing::debug!(
            subconn = %self.shared.id,
            address = %self.shared.address,
            error = %err,
            "connection attempt failed"
        );
        self.publish(ConnectivityState::TransientFailure, Some(err));
        ConnectivityState::TransientFailure
    }

    /// Ready 阶段：等待传输排空或关闭。
    async fn serve(&mut self, transport: Transport) -> Wake<ConnectivityState> {
        let mut lifecycle = transport.lifecycle();
        let settled = async {
            match lifecycle.wait_for(|current| *current != Lifecycle::Active).await {
                Ok(current) => current.clone(),
                Err(_) => Lifecycle::Closed(CloseReason::Fatal(ClientError::transport_fatal(
                    "transport dropped",
                ))),
            }
        };

        let woke = self.wait(settled).await;
        let settled = match woke {
            Wake::Done(settled) => settled,
            Wake::Shutdown => {
                self.shared.transport.store(None);
                self.retire(transport);
                return Wake::Shutdown;
            }
        };

        self.shared.transport.store(None);
        if self.backoff.observe_connection(transport.age()) {
            tracing::trace!(subconn = %self.shared.id, "connection was stable, backoff reset");
        }
        match settled {
            Lifecycle::Closed(CloseReason::Fatal(err)) => Wake::Done(self.fail(err)),
            _ => {
                self.publish(ConnectivityState::Idle, None);
                Wake::Done(ConnectivityState::Idle)
            }
        }
    }

    /// 关闭时排空传输，并在宽限期后强制关闭。
    fn retire(&self, transport: Transport) {
        transport.drain();
        if transport.is_closed() {
            return;
        }
        let grace = self.context.close_grace_period;
        let id = self.shared.id;
        tokio::spawn(async move {
            if tokio::time::timeout(grace, transport.closed()).await.is_err() {
                tracing::debug!(
                    subconn = %id,
                    active_streams = transport.active_streams(),
                    "grace period elapsed, closing transport"
                );
                transport.close(ClientError::transport_fatal(
                    "subconnection shut down before the stream completed",
                ));
            }
        });
    }

    fn publish(&self, state: ConnectivityState, error: Option<ClientError>) {
        {
            let mut status = self.shared.status.lock();
            status.state = state;
            if let Some(err) = &error {
                status.last_error = Some(err.clone());
            }
        }
        tracing::debug!(
            subconn = %self.shared.id,
            address = %self.shared.address,
            %state,
            "subconn state changed"
        );
        let _ = self.context.events.send(ControlEvent::SubConnState {
            id: self.shared.id,
            update: SubConnState { state, error },
        });
    }
}

async fn establish(
    address: Address,
    context: Arc<SubConnContext>,
    timeout: Duration,
) -> Result<Transport, ClientError> {
    let options = ConnectOptions {
        authority: context.authority.clone(),
        timeout,
    };
    let io = context.connector.connect(&address, &options).await?;
    let io = context.credentials.handshake(&context.authority, io).await?;
    Transport::handshake(io, &context.authority, &context.transport).await
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::contract::CallOptions;
    use crate::test_stubs::MockConnector;
    use crate::transport::InsecureCredentials;

    struct Fixture {
        subconn: SubConn,
        connector: MockConnector,
        events: mpsc::UnboundedReceiver<ControlEvent>,
    }

    impl Fixture {
        fn new(backoff: BackoffConfig) -> Self {
            let connector = MockConnector::new();
            let (events_tx, events) = mpsc::unbounded_channel();
            let mut transport = TransportConfig::default();
            transport.min_connect_timeout = Duration::from_secs(1);
            let context = Arc::new(SubConnContext {
                connector: Arc::new(connector.clone()),
                credentials: Arc::new(InsecureCredentials),
                transport,
                backoff,
                authority: "svc.test".to_owned(),
                close_grace_period: Duration::from_millis(100),
                events: events_tx,
            });
            let subconn = SubConn::spawn(SubConnId::new(1), Address::new("a:1"), context);
            Self {
                subconn,
                connector,
                events,
            }
        }

        /// 在 `within` 内等到下一次状态变化。
        async fn next_state(&mut self, within: Duration) -> ConnectivityState {
            let event = tokio::time::timeout(within, self.events.recv())
                .await
                .expect("等待子连接状态超时")
                .expect("事件通道已关闭");
            match event {
                ControlEvent::SubConnState { update, .. } => update.state,
                other => panic!("子连接不应投递 {other:?}"),
            }
        }
    }

    fn backoff(base_delay: Duration, max_delay: Duration, min_stable_duration: Duration) -> BackoffConfig {
        BackoffConfig {
            base_delay,
            multiplier: 10.0,
            jitter: 0.0,
            max_delay,
            min_stable_duration,
        }
    }

    const PROMPT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn shutdown_interrupts_backoff_wait() {
        let long = Duration::from_secs(30);
        let mut fixture = Fixture::new(backoff(long, long, long));
        fixture.connector.refuse("a:1");

        fixture.subconn.connect();
        assert_eq!(fixture.next_state(PROMPT).await, ConnectivityState::Connecting);
        assert_eq!(fixture.next_state(PROMPT).await, ConnectivityState::TransientFailure);

        fixture.subconn.shutdown();
        assert_eq!(
            fixture.next_state(PROMPT).await,
            ConnectivityState::Shutdown,
            "退避等待应被关闭立即打断"
        );
        assert_eq!(fixture.subconn.state(), ConnectivityState::Shutdown);
        assert_eq!(fixture.connector.attempts("a:1"), 1);
    }

    #[tokio::test]
    async fn stable_connection_resets_backoff() {
        let mut fixture = Fixture::new(backoff(
            Duration::from_millis(40),
            Duration::from_secs(4),
            Duration::from_millis(150),
        ));
        fixture.connector.refuse("a:1");

        // 两次失败后退避推进到 4 秒一档。
        fixture.subconn.connect();
        for _ in 0..2 {
            assert_eq!(fixture.next_state(PROMPT).await, ConnectivityState::Connecting);
            assert_eq!(
                fixture.next_state(PROMPT).await,
                ConnectivityState::TransientFailure
            );
        }
        fixture.connector.serve("a:1");
        assert_eq!(fixture.next_state(PROMPT).await, ConnectivityState::Connecting);
        assert_eq!(fixture.next_state(PROMPT).await, ConnectivityState::Ready);

        // 存活超过稳定阈值后，带着在途流被对端断开。
        tokio::time::sleep(Duration::from_millis(200)).await;
        let transport = fixture.subconn.transport().expect("Ready 时应持有传输");
        let _stream = transport
            .open_stream("/hang", &CallOptions::new())
            .expect("打开流失败");
        fixture.connector.refuse("a:1");
        fixture
            .connector
            .last_peer("a:1")
            .expect("应有对端")
            .close();
        assert_eq!(
            fixture.next_state(PROMPT).await,
            ConnectivityState::TransientFailure
        );

        // 退避已归零，下一次尝试按基础间隔发生，而不是 4 秒之后。
        assert_eq!(
            fixture.next_state(Duration::from_secs(1)).await,
            ConnectivityState::Connecting,
            "稳定连接失效后退避应重置"
        );
        fixture.subconn.shutdown();
    }

    #[tokio::test]
    async fn short_lived_connection_keeps_backoff() {
        let mut fixture = Fixture::new(backoff(
            Duration::from_millis(40),
            Duration::from_secs(4),
            Duration::from_secs(30),
        ));
        fixture.connector.refuse("a:1");

        fixture.subconn.connect();
        for _ in 0..2 {
            assert_eq!(fixture.next_state(PROMPT).await, ConnectivityState::Connecting);
            assert_eq!(
                fixture.next_state(PROMPT).await,
                ConnectivityState::TransientFailure
            );
        }
        fixture.connector.serve("a:1");
        assert_eq!(fixture.next_state(PROMPT).await, ConnectivityState::Connecting);
        assert_eq!(fixture.next_state(PROMPT).await, ConnectivityState::Ready);

        let transport = fixture.subconn.transport().expect("Ready 时应持有传输");
        let _stream = transport
            .open_stream("/hang", &CallOptions::new())
            .expect("打开流失败");
        fixture
            .connector
            .last_peer("a:1")
            .expect("应有对端")
            .close();
        assert_eq!(
            fixture.next_state(PROMPT).await,
            ConnectivityState::TransientFailure
        );

        let early = tokio::time::timeout(Duration::from_secs(1), fixture.events.recv()).await;
        assert!(early.is_err(), "未达到稳定阈值时不应重置退避");
        fixture.subconn.shutdown();
    }
}
