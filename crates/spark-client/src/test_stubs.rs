//! 测试桩：内存连接器与会说帧协议的回显服务端。
//!
//! # 教案式说明
//! - **意图 (Why)**：ClientConn 的大部分行为（建连失败、退避、排空、流控、保活）都依赖对端配合，
//!   用内存双工管道和一个最小服务端即可在不触碰网络的前提下覆盖这些路径；
//!   TCP 传输的集成测试也复用 [`EchoPeer`]，只是把管道换成真实套接字。
//! - **契约 (What)**：
//!   - [`EchoPeer`] 支持的方法：`/echo` 逐条回显、`/hang` 永不响应、
//!     `/fail` 以非零状态结束、`/whoami` 返回服务端名称；其它方法以 `UNIMPLEMENTED` 结束；
//!   - 服务端遵守客户端通告的窗口与帧长上限；默认在收到数据后立即归还额度，
//!     关闭自动归还后只能通过 [`PeerHandle::grant`] 手动归还；
//!   - [`MockConnector`] 按地址配置行为，并统计每个地址的建连次数。
//! - **风险 (Trade-offs)**：仅供测试使用，不做任何资源上限控制。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::address::Address;
use crate::config::TransportConfig;
use crate::error::ClientError;
use crate::transport::frame::{
    CODE_NO_ERROR, CODE_PROTOCOL_ERROR, Frame, Settings, decode_message, encode_message,
};
use crate::transport::{BoxedIo, ConnectOptions, Connector};

/// `/fail` 返回的状态码。
pub const STATUS_FAILED: u32 = 13;
/// 未知方法返回的状态码。
pub const STATUS_UNIMPLEMENTED: u32 = 12;

/// 回显服务端的参数。
#[derive(Clone, Debug)]
pub struct PeerOptions {
    /// `/whoami` 返回的名称。
    pub name: String,
    /// 服务端通告给客户端的参数。
    pub settings: Settings,
    /// 收到数据后是否立即归还额度。
    pub auto_credit: bool,
    /// 是否回应 PING。
    pub answer_pings: bool,
}

impl Default for PeerOptions {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            name: "echo-peer".to_owned(),
            settings: Settings {
                stream_window: transport.initial_stream_window,
                connection_window: transport.initial_connection_window,
                max_frame_size: transport.max_frame_size,
            },
            auto_credit: true,
            answer_pings: true,
        }
    }
}

impl PeerOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
enum PeerCommand {
    GoAway,
    Grant { stream: u32, increment: u32 },
    Close,
}

#[derive(Debug, Default)]
struct PeerStats {
    streams_opened: AtomicUsize,
    pings: AtomicUsize,
    resets: AtomicUsize,
    closed: AtomicBool,
}

/// 控制运行中的 [`EchoPeer`]。
#[derive(Clone)]
pub struct PeerHandle {
    commands: mpsc::UnboundedSender<PeerCommand>,
    stats: Arc<PeerStats>,
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("streams_opened", &self.streams_opened())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PeerHandle {
    /// 发送 GOAWAY：已接受的流继续完成，之后新到的流被拒绝。
    pub fn goaway(&self) {
        let _ = self.commands.send(PeerCommand::GoAway);
    }

    /// 手动归还额度；`stream == 0` 表示连接级。
    pub fn grant(&self, stream: u32, increment: u32) {
        let _ = self.commands.send(PeerCommand::Grant { stream, increment });
    }

    /// 立即断开连接，不发送 GOAWAY。
    pub fn close(&self) {
        let _ = self.commands.send(PeerCommand::Close);
    }

    /// 已接受的流数量。
    pub fn streams_opened(&self) -> usize {
        self.stats.streams_opened.load(Ordering::Acquire)
    }

    /// 收到的 PING 数量（不含 ACK）。
    pub fn pings(&self) -> usize {
        self.stats.pings.load(Ordering::Acquire)
    }

    /// 收到的客户端 RESET 数量。
    pub fn resets(&self) -> usize {
        self.stats.resets.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.stats.closed.load(Ordering::Acquire)
    }
}

/// 最小的帧协议服务端。
pub struct EchoPeer<IO> {
    io: IO,
    options: PeerOptions,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    stats: Arc<PeerStats>,
    streams: HashMap<u32, PeerStream>,
    /// 客户端通告的参数，握手后才可用。
    client: Settings,
    connection_credit: i64,
    last_stream: u32,
    going_away: bool,
    out: BytesMut,
}

struct PeerStream {
    method: String,
    inbound: BytesMut,
    credit: i64,
    outbound: BytesMut,
    trailers: Option<(u32, String)>,
}

impl<IO> EchoPeer<IO>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// 在 `io` 上启动服务端任务。
    pub fn spawn(io: IO, options: PeerOptions) -> PeerHandle {
        let (commands, receiver) = mpsc::unbounded_channel();
        let stats = Arc::new(PeerStats::default());
        let peer = EchoPeer {
            io,
            options,
            commands: receiver,
            stats: Arc::clone(&stats),
            streams: HashMap::new(),
            client: Settings {
                stream_window: 0,
                connection_window: 0,
                max_frame_size: 0,
            },
            connection_credit: 0,
            last_stream: 0,
            going_away: false,
            out: BytesMut::new(),
        };
        tokio::spawn(peer.run());
        PeerHandle { commands, stats }
    }

    async fn run(mut self) {
        if let Err(err) = self.serve().await {
            tracing::debug!(peer = %self.options.name, error = %err, "echo peer stopped");
        }
        self.stats.closed.store(true, Ordering::Release);
    }

    async fn serve(&mut self) -> Result<(), ClientError> {
        let io_error = |err: std::io::Error| ClientError::transport_fatal(err.to_string());
        Frame::Preface.encode(&mut self.out);
        Frame::Settings(self.options.settings).encode(&mut self.out);
        self.flush_out().await.map_err(io_error)?;

        let mut buf = BytesMut::with_capacity(16 * 1024);
        loop {
            loop {
                match Frame::decode(&mut buf, self.options.settings.max_frame_size) {
                    Ok(Some(frame)) => self.on_frame(frame),
                    Ok(None) => break,
                    Err(err) => {
                        Frame::GoAway {
                            last_stream: self.last_stream,
                            code: CODE_PROTOCOL_ERROR,
                            debug: err.to_string(),
                        }
                        .encode(&mut self.out);
                        let _ = self.flush_out().await;
                        return Err(err);
                    }
                }
            }
            self.flush_out().await.map_err(io_error)?;

            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(PeerCommand::Close) | None => return Ok(()),
                    Some(command) => self.on_command(command),
                },
                read = self.io.read_buf(&mut buf) => {
                    if read.map_err(io_error)? == 0 {
                        return Ok(());
                    }
                }
            }
            self.flush_out().await.map_err(io_error)?;
        }
    }

    async fn flush_out(&mut self) -> std::io::Result<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        self.io.write_all(&self.out).await?;
        self.out.clear();
        self.io.flush().await
    }

    fn on_command(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::GoAway => {
                self.going_away = true;
                Frame::GoAway {
                    last_stream: self.last_stream,
                    code: CODE_NO_ERROR,
                    debug: "server shutting down".to_owned(),
                }
                .encode(&mut self.out);
            }
            PeerCommand::Grant { stream, increment } => {
                Frame::WindowUpdate { stream, increment }.encode(&mut self.out);
            }
            PeerCommand::Close => {}
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Preface => {}
            Frame::Settings(settings) => {
                self.client = settings;
                self.connection_credit = i64::from(settings.connection_window);
            }
            Frame::Headers { stream, method } => {
                if self.going_away {
                    Frame::Reset {
                        stream,
                        code: CODE_NO_ERROR,
                    }
                    .encode(&mut self.out);
                    return;
                }
                self.last_stream = self.last_stream.max(stream);
                self.stats.streams_opened.fetch_add(1, Ordering::AcqRel);
                self.streams.insert(
                    stream,
                    PeerStream {
                        method,
                        inbound: BytesMut::new(),
                        credit: i64::from(self.client.stream_window),
                        outbound: BytesMut::new(),
                        trailers: None,
                    },
                );
            }
            Frame::Data {
                stream,
                payload,
                end_stream,
            } => self.on_data(stream, &payload, end_stream),
            Frame::WindowUpdate { stream: 0, increment } => {
                self.connection_credit += i64::from(increment);
                let ids: Vec<u32> = self.streams.keys().copied().collect();
                for id in ids {
                    self.pump(id);
                }
            }
            Frame::WindowUpdate { stream, increment } => {
                if let Some(entry) = self.streams.get_mut(&stream) {
                    entry.credit += i64::from(increment);
                    self.pump(stream);
                }
            }
            Frame::Ping { payload, ack: false } => {
                self.stats.pings.fetch_add(1, Ordering::AcqRel);
                if self.options.answer_pings {
                    Frame::Ping { payload, ack: true }.encode(&mut self.out);
                }
            }
            Frame::Ping { ack: true, .. } => {}
            Frame::Reset { stream, .. } => {
                self.stats.resets.fetch_add(1, Ordering::AcqRel);
                self.streams.remove(&stream);
            }
            Frame::GoAway { .. } | Frame::Trailers { .. } => {}
        }
    }

    fn on_data(&mut self, stream: u32, payload: &[u8], end_stream: bool) {
        let len = payload.len() as u32;
        if self.options.auto_credit && len > 0 {
            Frame::WindowUpdate {
                stream: 0,
                increment: len,
            }
            .encode(&mut self.out);
            if !end_stream && self.streams.contains_key(&stream) {
                Frame::WindowUpdate {
                    stream,
                    increment: len,
                }
                .encode(&mut self.out);
            }
        }

        let name = self.options.name.clone();
        let Some(entry) = self.streams.get_mut(&stream) else {
            return;
        };
        entry.inbound.extend_from_slice(payload);
        while let Some(message) = decode_message(&mut entry.inbound) {
            if entry.method == "/echo" {
                entry.outbound.extend_from_slice(&encode_message(&message));
            }
        }
        if end_stream {
            entry.trailers = Some(match entry.method.as_str() {
                "/echo" => (0, String::new()),
                "/whoami" => {
                    entry
                        .outbound
                        .extend_from_slice(&encode_message(name.as_bytes()));
                    (0, String::new())
                }
                "/fail" => (STATUS_FAILED, "failure requested".to_owned()),
                // `/hang` 永不结束。
                "/hang" => return,
                other => (STATUS_UNIMPLEMENTED, format!("unknown method {other}")),
            });
        }
        self.pump(stream);
    }

    /// 在额度允许的范围内发送积压数据，全部发出后再发送 TRAILERS。
    fn pump(&mut self, stream: u32) {
        let max_frame = i64::from(self.client.max_frame_size.max(1));
        let Some(entry) = self.streams.get_mut(&stream) else {
            return;
        };
        while !entry.outbound.is_empty() {
            let allowed = entry
                .credit
                .min(self.connection_credit)
                .min(max_frame)
                .min(entry.outbound.len() as i64);
            if allowed <= 0 {
                return;
            }
            let chunk = entry.outbound.split_to(allowed as usize).freeze();
            entry.credit -= allowed;
            self.connection_credit -= allowed;
            Frame::Data {
                stream,
                payload: chunk,
                end_stream: false,
            }
            .encode(&mut self.out);
        }
        if let Some((code, message)) = entry.trailers.take() {
            Frame::Trailers {
                stream,
                code,
                message,
            }
            .encode(&mut self.out);
            self.streams.remove(&stream);
        }
    }
}

/// 地址上的模拟行为。
#[derive(Clone, Debug)]
pub enum Behavior {
    /// 建连成功并运行 [`EchoPeer`]。
    Serve(PeerOptions),
    /// 等待一段时间后建连成功。
    ServeAfter(Duration, PeerOptions),
    /// 立即拒绝。
    Refuse,
    /// 永不完成，由建连超时打断。
    Hang,
}

#[derive(Debug, Default)]
struct MockState {
    behaviors: HashMap<String, Behavior>,
    attempts: HashMap<String, usize>,
    peers: HashMap<String, Vec<PeerHandle>>,
}

/// 基于内存双工管道的连接器；未配置的地址一律拒绝。
#[derive(Clone, Debug, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, addr: &str, behavior: Behavior) -> &Self {
        self.state
            .lock()
            .behaviors
            .insert(addr.to_owned(), behavior);
        self
    }

    /// 以地址作为服务端名称提供回显服务。
    pub fn serve(&self, addr: &str) -> &Self {
        self.set(addr, Behavior::Serve(PeerOptions::named(addr)))
    }

    pub fn serve_after(&self, addr: &str, delay: Duration) -> &Self {
        self.set(addr, Behavior::ServeAfter(delay, PeerOptions::named(addr)))
    }

    pub fn refuse(&self, addr: &str) -> &Self {
        self.set(addr, Behavior::Refuse)
    }

    pub fn hang(&self, addr: &str) -> &Self {
        self.set(addr, Behavior::Hang)
    }

    /// 该地址累计的建连次数。
    pub fn attempts(&self, addr: &str) -> usize {
        self.state.lock().attempts.get(addr).copied().unwrap_or(0)
    }

    /// 该地址上启动过的全部服务端，按建连顺序排列。
    pub fn peers(&self, addr: &str) -> Vec<PeerHandle> {
        self.state.lock().peers.get(addr).cloned().unwrap_or_default()
    }

    pub fn last_peer(&self, addr: &str) -> Option<PeerHandle> {
        self.state
            .lock()
            .peers
            .get(addr)
            .and_then(|peers| peers.last().cloned())
    }

    fn accept(&self, addr: &str, options: PeerOptions) -> BoxedIo {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handle = EchoPeer::spawn(server, options);
        self.state
            .lock()
            .peers
            .entry(addr.to_owned())
            .or_default()
            .push(handle);
        Box::new(client)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        address: &Address,
        _options: &ConnectOptions,
    ) -> Result<BoxedIo, ClientError> {
        let addr = address.addr();
        let behavior = {
            let mut state = self.state.lock();
            *state.attempts.entry(addr.to_owned()).or_default() += 1;
            state.behaviors.get(addr).cloned()
        };
        match behavior {
            Some(Behavior::Serve(options)) => Ok(self.accept(addr, options)),
            Some(Behavior::ServeAfter(delay, options)) => {
                tokio::time::sleep(delay).await;
                Ok(self.accept(addr, options))
            }
            Some(Behavior::Hang) => std::future::pending().await,
            Some(Behavior::Refuse) | None => {
                Err(ClientError::connection(addr, "connection refused"))
            }
        }
    }
}
