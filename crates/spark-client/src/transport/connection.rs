//! 多路复用传输：一条字节流上承载多个并发流。
//!
//! # 教案级说明
//!
//! ## 意图（Why）
//! - 每个 Ready 的子连接恰好持有一个 [`Transport`]，所有经由该子连接的调用共享它；
//! - 传输负责流的编号、帧的收发、两级流量控制、保活以及排空/关闭语义。
//!
//! ## 逻辑（How）
//! - 三个后台任务：写任务批量编码并刷出帧；读任务解码并分发到各流的事件队列；
//!   可选的保活任务周期性发送 PING 并在应答超时时强制关闭；
//! - 生命周期通过 `watch` 通道广播 `Active → Draining → Closed`，子连接据此迁移状态；
//! - 关闭的收尾逻辑集中在 `finalize`，由状态锁保证只执行一次：失败所有流、关闭窗口、
//!   释放写端、逐个调用关闭回调。
//!
//! ## 契约（What）
//! - 排空或关闭后 [`Transport::open_stream`] 返回 [`ClientError::GoingAway`]；
//! - 本端发起的排空在最后一个流结束后以 [`CloseReason::Graceful`] 关闭；
//! - 关闭回调恰好被调用一次，迟到注册的回调立即执行；
//! - 对端超出接收窗口、发送畸形帧均视为协议违例，传输以 [`CloseReason::Fatal`] 终止。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::config::TransportConfig;
use crate::contract::CallOptions;
use crate::error::ClientError;
use crate::transport::connector::BoxedIo;
use crate::transport::flow::{RecvWindow, SendWindow};
use crate::transport::frame::{
    CODE_NO_ERROR, CODE_PROTOCOL_ERROR, Frame, HEADER_LEN, Settings,
};
use crate::transport::stream::{ClientStream, StreamEvent};

/// 单次写入前合并的最大字节数。
const WRITE_BATCH_LIMIT: usize = 64 * 1024;
/// 客户端流编号的上限，超过后传输进入排空。
const MAX_STREAM_ID: u32 = (1 << 31) - 1;

/// GOAWAY 负载中 `last_stream` 与 `code` 占用的字节数。
const GOAWAY_FIXED_LEN: usize = 8;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// 传输关闭的原因。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// 本端排空完成。
    Graceful,
    /// 对端 GOAWAY 后排空完成，或对端在无活跃流时干净地断开。
    Remote,
    /// 本端强制关闭。
    Local(ClientError),
    /// IO 故障、协议违例或保活超时。
    Fatal(ClientError),
}

impl CloseReason {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CloseReason::Fatal(_))
    }

    pub fn error(&self) -> Option<&ClientError> {
        match self {
            CloseReason::Local(err) | CloseReason::Fatal(err) => Some(err),
            CloseReason::Graceful | CloseReason::Remote => None,
        }
    }

    /// 终结时仍存活的流收到的错误。
    fn stream_error(&self) -> ClientError {
        self.error().cloned().unwrap_or(ClientError::GoingAway)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Graceful => f.write_str("graceful"),
            CloseReason::Remote => f.write_str("remote"),
            CloseReason::Local(err) => write!(f, "local: {err}"),
            CloseReason::Fatal(err) => write!(f, "fatal: {err}"),
        }
    }
}

/// 传输生命周期。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    /// 不再接受新流，已有流继续运行。
    Draining,
    Closed(CloseReason),
}

impl Lifecycle {
    pub fn is_closed(&self) -> bool {
        matches!(self, Lifecycle::Closed(_))
    }
}

type ClosedHook = Box<dyn FnOnce(&CloseReason) + Send>;

/// 排空的发起方，决定排空完成时的关闭原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DrainOrigin {
    Local,
    Remote,
}

pub(crate) struct StreamSlot {
    pub(crate) events: mpsc::UnboundedSender<StreamEvent>,
    pub(crate) send_window: Arc<SendWindow>,
    pub(crate) recv_window: Arc<RecvWindow>,
}

impl StreamSlot {
    fn terminate(self, event: StreamEvent) {
        let _ = self.events.send(event);
        self.send_window.close();
    }
}

struct TransportState {
    streams: HashMap<u32, StreamSlot>,
    next_stream_id: u32,
    draining: Option<DrainOrigin>,
    closed: Option<CloseReason>,
    hooks: Vec<ClosedHook>,
    writer: Option<mpsc::UnboundedSender<Frame>>,
}

pub(crate) struct TransportInner {
    id: u64,
    authority: String,
    config: TransportConfig,
    peer: Settings,
    /// 本端发送时使用的帧长上限：双方通告值中的较小者。
    pub(crate) send_max_frame: usize,
    pub(crate) conn_send: SendWindow,
    pub(crate) conn_recv: RecvWindow,
    state: Mutex<TransportState>,
    lifecycle: watch::Sender<Lifecycle>,
    ping_ack: watch::Sender<u64>,
    established_at: Instant,
}

/// 多路复用传输的句柄，克隆廉价。
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.inner.id)
            .field("authority", &self.inner.authority)
            .field("active_streams", &self.active_streams())
            .finish()
    }
}

impl Transport {
    /// 在已建立（且已完成凭据握手）的字节流上交换前言与 SETTINGS，并启动后台任务。
    ///
    /// 必须在 Tokio 运行时内调用。
    pub async fn handshake(
        mut io: BoxedIo,
        authority: &str,
        config: &TransportConfig,
    ) -> Result<Transport, ClientError> {
        let local = Settings {
            stream_window: config.initial_stream_window,
            connection_window: config.initial_connection_window,
            max_frame_size: config.max_frame_size,
        };
        let io_error = |err: std::io::Error| ClientError::connection(authority, err.to_string());

        let mut out = BytesMut::with_capacity(2 * HEADER_LEN + 32);
        Frame::Preface.encode(&mut out);
        Frame::Settings(local).encode(&mut out);
        io.write_all(&out).await.map_err(io_error)?;
        io.flush().await.map_err(io_error)?;

        let mut buf = BytesMut::with_capacity(8 * 1024);
        let mut seen_preface = false;
        let peer = loop {
            match Frame::decode(&mut buf, local.max_frame_size)? {
                Some(Frame::Preface) if !seen_preface => seen_preface = true,
                Some(Frame::Settings(settings)) if seen_preface => break settings,
                Some(other) => {
                    return Err(ClientError::protocol(format!(
                        "unexpected frame during handshake on stream {}",
                        other.stream_id()
                    )));
                }
                None => {
                    let read = io.read_buf(&mut buf).await.map_err(io_error)?;
                    if read == 0 {
                        return Err(ClientError::connection(
                            authority,
                            "peer closed the connection during handshake",
                        ));
                    }
                }
            }
        };
        if peer.max_frame_size == 0 {
            return Err(ClientError::protocol("peer advertised a zero max frame size"));
        }

        Ok(Transport::start(io, buf, authority, config.clone(), peer))
    }

    fn start(
        io: BoxedIo,
        buffered: BytesMut,
        authority: &str,
        config: TransportConfig,
        peer: Settings,
    ) -> Transport {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (lifecycle, _) = watch::channel(Lifecycle::Active);
        let (ping_ack, _) = watch::channel(0u64);
        let send_max_frame = peer.max_frame_size.min(config.max_frame_size) as usize;

        let inner = Arc::new(TransportInner {
            id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
            authority: authority.to_owned(),
            conn_send: SendWindow::new(peer.connection_window),
            conn_recv: RecvWindow::new(config.initial_connection_window),
            send_max_frame,
            peer,
            state: Mutex::new(TransportState {
                streams: HashMap::new(),
                next_stream_id: 1,
                draining: None,
                closed: None,
                hooks: Vec::new(),
                writer: Some(writer_tx),
            }),
            lifecycle,
            ping_ack,
            established_at: Instant::now(),
            config,
        });

        let (reader, writer) = tokio::io::split(io);
        tokio::spawn(write_loop(Arc::clone(&inner), writer_rx, writer));
        tokio::spawn(read_loop(Arc::clone(&inner), reader, buffered));
        if let Some(interval) = inner.config.keepalive_time {
            let timeout = inner.config.keepalive_timeout;
            tokio::spawn(keepalive_loop(Arc::clone(&inner), interval, timeout));
        }

        tracing::debug!(
            transport = inner.id,
            authority = %inner.authority,
            peer_stream_window = peer.stream_window,
            peer_connection_window = peer.connection_window,
            "transport established"
        );
        Transport { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn authority(&self) -> &str {
        &self.inner.authority
    }

    /// 建立后经过的时长。
    pub fn age(&self) -> Duration {
        self.inner.established_at.elapsed()
    }

    /// 新建一个流并发送 HEADERS。
    ///
    /// 排空或关闭后返回 [`ClientError::GoingAway`]：此时请求从未到达对端，可安全改用其它连接。
    /// 方法名放不进一个 HEADERS 帧时返回 [`ClientError::InvalidArgument`]，不分配流编号也不写出任何字节。
    pub fn open_stream(&self, method: &str, options: &CallOptions) -> Result<ClientStream, ClientError> {
        let inner = &self.inner;
        if method.len() > inner.send_max_frame {
            return Err(ClientError::invalid_argument(format!(
                "method name of {} bytes exceeds the frame limit of {} bytes",
                method.len(),
                inner.send_max_frame
            )));
        }
        let (id, slot_windows, events) = {
            let mut state = inner.state.lock();
            if state.closed.is_some() || state.draining.is_some() {
                return Err(ClientError::GoingAway);
            }
            let Some(writer) = state.writer.clone() else {
                return Err(ClientError::GoingAway);
            };
            let id = state.next_stream_id;
            if id > MAX_STREAM_ID {
                return Err(ClientError::GoingAway);
            }
            state.next_stream_id = id.saturating_add(2);

            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let send_window = Arc::new(SendWindow::new(inner.peer.stream_window));
            let recv_window = Arc::new(RecvWindow::new(inner.config.initial_stream_window));
            state.streams.insert(
                id,
                StreamSlot {
                    events: events_tx,
                    send_window: Arc::clone(&send_window),
                    recv_window: Arc::clone(&recv_window),
                },
            );
            if writer
                .send(Frame::Headers {
                    stream: id,
                    method: method.to_owned(),
                })
                .is_err()
            {
                state.streams.remove(&id);
                return Err(ClientError::GoingAway);
            }
            (id, (send_window, recv_window), events_rx)
        };

        tracing::trace!(transport = inner.id, stream = id, method, "stream opened");
        let (send_window, recv_window) = slot_windows;
        Ok(ClientStream::new(
            id,
            Arc::clone(inner),
            send_window,
            recv_window,
            events,
            options,
        ))
    }

    /// 本端发起优雅排空：发送 GOAWAY，拒绝新流，最后一个流结束后关闭。
    pub fn drain(&self) {
        self.inner.drain(DrainOrigin::Local);
    }

    /// 强制关闭：所有存活的流以 `err` 失败。
    pub fn close(&self, err: ClientError) {
        self.inner.send_frame(Frame::GoAway {
            last_stream: 0,
            code: CODE_NO_ERROR,
            debug: self.inner.goaway_debug(err.to_string()),
        });
        self.inner.finalize(CloseReason::Local(err));
    }

    /// 订阅生命周期变化。
    pub fn lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.inner.lifecycle.subscribe()
    }

    /// 注册关闭回调；传输已关闭时立即执行。
    pub fn on_closed(&self, hook: impl FnOnce(&CloseReason) + Send + 'static) {
        let reason = {
            let mut state = self.inner.state.lock();
            match &state.closed {
                Some(reason) => reason.clone(),
                None => {
                    state.hooks.push(Box::new(hook));
                    return;
                }
            }
        };
        hook(&reason);
    }

    /// 等待传输关闭并返回原因。
    pub async fn closed(&self) -> CloseReason {
        let mut lifecycle = self.lifecycle();
        loop {
            if let Lifecycle::Closed(reason) = &*lifecycle.borrow_and_update() {
                return reason.clone();
            }
            if lifecycle.changed().await.is_err() {
                return self
                    .close_reason()
                    .unwrap_or(CloseReason::Fatal(ClientError::transport_fatal("transport dropped")));
            }
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.state.lock().closed.clone()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.state.lock().draining.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed.is_some()
    }

    /// 可以承载新流：既未排空也未关闭。
    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock();
        state.closed.is_none() && state.draining.is_none()
    }

    pub fn active_streams(&self) -> usize {
        self.inner.active_streams()
    }
}

impl TransportInner {
    pub(crate) fn send_frame(&self, frame: Frame) -> bool {
        let state = self.state.lock();
        match &state.writer {
            Some(writer) => writer.send(frame).is_ok(),
            None => false,
        }
    }

    fn active_streams(&self) -> usize {
        self.state.lock().streams.len()
    }

    /// GOAWAY 的描述串，截断到整帧不超过发送帧长上限。
    fn goaway_debug(&self, detail: String) -> String {
        truncate_utf8(detail, self.send_max_frame.saturating_sub(GOAWAY_FIXED_LEN))
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }

    /// 本端取消或放弃一个流：通知对端并从流表移除。
    pub(crate) fn reset_stream(&self, id: u32, code: u32) {
        let removed = self.state.lock().streams.remove(&id);
        if let Some(slot) = removed {
            self.send_frame(Frame::Reset { stream: id, code });
            slot.send_window.close();
            tracing::trace!(transport = self.id, stream = id, code, "stream reset locally");
            self.maybe_finish_drain();
        }
    }

    /// 为仍在流表中的流归还接收额度。
    pub(crate) fn stream_credit(&self, id: u32, increment: u32) {
        let active = self.state.lock().streams.contains_key(&id);
        if active {
            self.send_frame(Frame::WindowUpdate {
                stream: id,
                increment,
            });
        }
    }

    /// 归还连接级接收额度。
    pub(crate) fn consume_connection(&self, len: usize) {
        if let Some(increment) = self.conn_recv.on_consume(len) {
            self.send_frame(Frame::WindowUpdate {
                stream: 0,
                increment,
            });
        }
    }

    fn drain(&self, origin: DrainOrigin) {
        let empty = {
            let mut state = self.state.lock();
            if state.closed.is_some() || state.draining.is_some() {
                return;
            }
            state.draining = Some(origin);
            if origin == DrainOrigin::Local {
                if let Some(writer) = &state.writer {
                    let _ = writer.send(Frame::GoAway {
                        last_stream: 0,
                        code: CODE_NO_ERROR,
                        debug: self.goaway_debug("client draining".to_owned()),
                    });
                }
            }
            state.streams.is_empty()
        };
        self.lifecycle.send_if_modified(|current| {
            if *current == Lifecycle::Active {
                *current = Lifecycle::Draining;
                true
            } else {
                false
            }
        });
        tracing::debug!(transport = self.id, ?origin, "transport draining");
        if empty {
            self.finish_drain(origin);
        }
    }

    fn maybe_finish_drain(&self) {
        let origin = {
            let state = self.state.lock();
            if state.closed.is_some() || !state.streams.is_empty() {
                return;
            }
            state.draining
        };
        if let Some(origin) = origin {
            self.finish_drain(origin);
        }
    }

    fn finish_drain(&self, origin: DrainOrigin) {
        let reason = match origin {
            DrainOrigin::Local => CloseReason::Graceful,
            DrainOrigin::Remote => CloseReason::Remote,
        };
        self.finalize(reason);
    }

    /// 关闭收尾，只执行一次。
    fn finalize(&self, reason: CloseReason) {
        let (streams, hooks, writer) = {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(reason.clone());
            (
                std::mem::take(&mut state.streams),
                std::mem::take(&mut state.hooks),
                state.writer.take(),
            )
        };

        let stream_error = reason.stream_error();
        let failed = streams.len();
        for (_, slot) in streams {
            slot.terminate(StreamEvent::Failed(stream_error.clone()));
        }
        self.conn_send.close();
        drop(writer);
        self.lifecycle
            .send_replace(Lifecycle::Closed(reason.clone()));

        if reason.is_fatal() {
            tracing::warn!(
                transport = self.id,
                authority = %self.authority,
                failed_streams = failed,
                %reason,
                "transport closed"
            );
        } else {
            tracing::debug!(
                transport = self.id,
                authority = %self.authority,
                failed_streams = failed,
                %reason,
                "transport closed"
            );
        }

        for hook in hooks {
            hook(&reason);
        }
    }

    fn fail_protocol(&self, err: ClientError) {
        self.send_frame(Frame::GoAway {
            last_stream: 0,
            code: CODE_PROTOCOL_ERROR,
            debug: self.goaway_debug(err.to_string()),
        });
        self.finalize(CloseReason::Fatal(err));
    }

    fn on_eof(&self) {
        if self.active_streams() > 0 {
            self.finalize(CloseReason::Fatal(ClientError::transport_fatal(
                "connection closed by peer with streams in flight",
            )));
        } else {
            self.finalize(CloseReason::Remote);
        }
    }

    fn on_remote_goaway(&self, last_stream: u32, code: u32, detail: &str) {
        let refused: Vec<StreamSlot> = {
            let mut state = self.state.lock();
            let ids: Vec<u32> = state
                .streams
                .keys()
                .copied()
                .filter(|id| *id > last_stream)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.streams.remove(&id))
                .collect()
        };
        tracing::debug!(
            transport = self.id,
            last_stream,
            code,
            detail,
            refused = refused.len(),
            "peer sent GOAWAY"
        );
        for slot in refused {
            slot.terminate(StreamEvent::Failed(ClientError::GoingAway));
        }
        self.drain(DrainOrigin::Remote);
        self.maybe_finish_drain();
    }

    /// 分发一帧；返回错误表示连接级违例。
    fn dispatch(&self, frame: Frame) -> Result<(), ClientError> {
        match frame {
            Frame::Data {
                stream,
                payload,
                end_stream,
            } => {
                let len = payload.len();
                if !self.conn_recv.on_receive(len) {
                    return Err(ClientError::protocol("peer exceeded the connection receive window"));
                }
                let delivered = {
                    let state = self.state.lock();
                    match state.streams.get(&stream) {
                        Some(slot) => {
                            if !slot.recv_window.on_receive(len) {
                                return Err(ClientError::protocol(format!(
                                    "peer exceeded the receive window of stream {stream}"
                                )));
                            }
                            slot.events
                                .send(StreamEvent::Data {
                                    payload,
                                    end_stream,
                                })
                                .is_ok()
                        }
                        None => false,
                    }
                };
                if !delivered {
                    // 流已被本端放弃，数据直接丢弃并归还连接额度。
                    self.consume_connection(len);
                }
            }
            Frame::Trailers {
                stream,
                code,
                message,
            } => {
                let removed = self.state.lock().streams.remove(&stream);
                if let Some(slot) = removed {
                    slot.terminate(StreamEvent::Trailers { code, message });
                    self.maybe_finish_drain();
                }
            }
            Frame::Reset { stream, code } => {
                let removed = self.state.lock().streams.remove(&stream);
                if let Some(slot) = removed {
                    slot.terminate(StreamEvent::Reset { code });
                    self.maybe_finish_drain();
                }
            }
            Frame::WindowUpdate { stream: 0, increment } => self.conn_send.add_credit(increment),
            Frame::WindowUpdate { stream, increment } => {
                let state = self.state.lock();
                if let Some(slot) = state.streams.get(&stream) {
                    slot.send_window.add_credit(increment);
                }
            }
            Frame::Ping { payload, ack: false } => {
                self.send_frame(Frame::Ping { payload, ack: true });
            }
            Frame::Ping { payload, ack: true } => {
                self.ping_ack.send_replace(payload);
            }
            Frame::GoAway {
                last_stream,
                code,
                debug,
            } => self.on_remote_goaway(last_stream, code, &debug),
            Frame::Headers { stream, .. } => {
                tracing::trace!(transport = self.id, stream, "ignoring response headers");
            }
            Frame::Settings(_) => {
                tracing::trace!(transport = self.id, "ignoring settings update");
            }
            Frame::Preface => {
                return Err(ClientError::protocol("duplicate connection preface"));
            }
        }
        Ok(())
    }
}

/// 在字符边界上把 `text` 截断到至多 `limit` 字节。
fn truncate_utf8(mut text: String, limit: usize) -> String {
    if text.len() > limit {
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

async fn closed(lifecycle: &mut watch::Receiver<Lifecycle>) {
    let _ = lifecycle.wait_for(Lifecycle::is_closed).await;
}

async fn write_loop(
    inner: Arc<TransportInner>,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    mut writer: WriteHalf<BoxedIo>,
) {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    while let Some(frame) = frames.recv().await {
        frame.encode(&mut buf);
        while buf.len() < WRITE_BATCH_LIMIT {
            match frames.try_recv() {
                Ok(frame) => frame.encode(&mut buf),
                Err(_) => break,
            }
        }
        let written = match writer.write_all(&buf).await {
            Ok(()) => writer.flush().await,
            Err(err) => Err(err),
        };
        buf.clear();
        if let Err(err) = written {
            inner.finalize(CloseReason::Fatal(ClientError::transport_fatal(format!(
                "write failed: {err}"
            ))));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(inner: Arc<TransportInner>, mut reader: ReadHalf<BoxedIo>, mut buf: BytesMut) {
    let mut lifecycle = inner.lifecycle.subscribe();
    loop {
        loop {
            match Frame::decode(&mut buf, inner.config.max_frame_size) {
                Ok(Some(frame)) => {
                    if let Err(err) = inner.dispatch(frame) {
                        inner.fail_protocol(err);
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    inner.fail_protocol(err);
                    return;
                }
            }
        }
        if inner.is_closed() {
            return;
        }

        let read = tokio::select! {
            biased;
            _ = closed(&mut lifecycle) => return,
            read = reader.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                inner.on_eof();
                return;
            }
            Ok(_) => {}
            Err(err) => {
                inner.finalize(CloseReason::Fatal(ClientError::transport_fatal(format!(
                    "read failed: {err}"
                ))));
                return;
            }
        }
    }
}

async fn keepalive_loop(inner: Arc<TransportInner>, interval: Duration, timeout: Duration) {
    let mut lifecycle = inner.lifecycle.subscribe();
    let mut acks = inner.ping_ack.subscribe();
    let mut sequence = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = closed(&mut lifecycle) => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if !inner.config.keepalive_without_calls && inner.active_streams() == 0 {
            continue;
        }

        sequence += 1;
        if !inner.send_frame(Frame::Ping {
            payload: sequence,
            ack: false,
        }) {
            return;
        }
        let acked = tokio::select! {
            biased;
            _ = closed(&mut lifecycle) => return,
            acked = tokio::time::timeout(timeout, acks.wait_for(|seen| *seen >= sequence)) => {
                acked.map(|result| result.is_ok())
            }
        };
        match acked {
            Ok(true) => {}
            Ok(false) => return,
            Err(_) => {
                inner.finalize(CloseReason::Fatal(ClientError::transport_fatal(
                    "keepalive ping not acknowledged",
                )));
                return;
            }
        }
    }
}
