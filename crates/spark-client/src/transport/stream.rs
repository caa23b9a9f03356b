//! 单个 RPC 的流。
//!
//! # 教案式说明
//! - **意图 (Why)**：流是调用与传输之间唯一的接触面，调用方只通过它收发消息和读取终态；
//! - **契约 (What)**：
//!   - 发送先申请流级额度、再申请连接级额度，额度不足时挂起而不自旋；
//!   - 每一个挂起点都受调用截止与取消约束，触发时向对端发送 RESET 并以
//!     `DeadlineExceeded`/`Cancelled` 结束本流，同一传输上的其它流不受影响；
//!   - 读取到的数据在交给调用方时归还接收额度；
//!   - 未完成即被丢弃的流会被重置并移出流表；
//! - **风险 (Trade-offs)**：`send_message` 与 `recv_message` 需要 `&mut self`，
//!   需要全双工的调用方应自行拆分任务并通过通道转发。

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::contract::{CallOptions, Cancellation, Deadline, Interrupted, guard};
use crate::error::ClientError;
use crate::transport::connection::TransportInner;
use crate::transport::flow::{RecvWindow, SendWindow};
use crate::transport::frame::{
    CODE_CANCEL, Frame, check_message_len, decode_message, encode_message,
};

/// 读循环投递给流的事件。
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data { payload: Bytes, end_stream: bool },
    Trailers { code: u32, message: String },
    Reset { code: u32 },
    Failed(ClientError),
}

/// 客户端发起的流。
pub struct ClientStream {
    id: u32,
    transport: Arc<TransportInner>,
    send_window: Arc<SendWindow>,
    recv_window: Arc<RecvWindow>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    inbound: BytesMut,
    deadline: Deadline,
    cancellation: Option<Cancellation>,
    send_closed: bool,
    remote_closed: bool,
    outcome: Option<Result<(), ClientError>>,
}

impl fmt::Debug for ClientStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStream")
            .field("id", &self.id)
            .field("send_closed", &self.send_closed)
            .field("outcome", &self.outcome)
            .finish()
    }
}

impl ClientStream {
    pub(crate) fn new(
        id: u32,
        transport: Arc<TransportInner>,
        send_window: Arc<SendWindow>,
        recv_window: Arc<RecvWindow>,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        options: &CallOptions,
    ) -> Self {
        Self {
            id,
            transport,
            send_window,
            recv_window,
            events,
            inbound: BytesMut::new(),
            deadline: options.deadline(),
            cancellation: options.cancellation().cloned(),
            send_closed: false,
            remote_closed: false,
            outcome: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// 是否已经得到终态（正常结束、重置或失败）。
    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// 发送一条消息；消息按帧长上限与可用额度切分。
    ///
    /// 超过 [`MAX_MESSAGE_LEN`](crate::transport::frame::MAX_MESSAGE_LEN) 的消息以
    /// [`ClientError::InvalidArgument`] 拒绝，流保持可用。
    pub async fn send_message(&mut self, message: Bytes) -> Result<(), ClientError> {
        self.poll_events();
        if let Some(outcome) = &self.outcome {
            return Err(match outcome {
                Err(err) => err.clone(),
                Ok(()) => ClientError::protocol("stream already completed"),
            });
        }
        if self.send_closed {
            return Err(ClientError::protocol("send after close_send"));
        }
        check_message_len(message.len())?;

        let mut pending = encode_message(&message);
        while !pending.is_empty() {
            let want = pending.len().min(self.transport.send_max_frame);
            let stream_window = Arc::clone(&self.send_window);
            let acquired = guard(
                self.deadline,
                self.cancellation.as_ref(),
                stream_window.acquire(want),
            )
            .await;
            let stream_credit = match acquired {
                Ok(Ok(credit)) => credit,
                Ok(Err(_)) => return Err(self.closed_error()),
                Err(interrupted) => return Err(self.interrupt(interrupted)),
            };

            let transport = Arc::clone(&self.transport);
            let acquired = guard(
                self.deadline,
                self.cancellation.as_ref(),
                transport.conn_send.acquire(stream_credit),
            )
            .await;
            let credit = match acquired {
                Ok(Ok(credit)) => credit,
                Ok(Err(_)) => {
                    self.send_window.release(stream_credit);
                    return Err(self.closed_error());
                }
                Err(interrupted) => {
                    self.send_window.release(stream_credit);
                    return Err(self.interrupt(interrupted));
                }
            };
            if credit < stream_credit {
                self.send_window.release(stream_credit - credit);
            }

            let chunk = pending.split_to(credit);
            if !self.transport.send_frame(Frame::Data {
                stream: self.id,
                payload: chunk,
                end_stream: false,
            }) {
                return Err(self.closed_error());
            }
        }
        Ok(())
    }

    /// 半关闭发送方向。
    pub fn close_send(&mut self) {
        if self.send_closed {
            return;
        }
        self.send_closed = true;
        if self.outcome.is_none() {
            self.transport.send_frame(Frame::Data {
                stream: self.id,
                payload: Bytes::new(),
                end_stream: true,
            });
        }
    }

    /// 读取下一条消息；对端正常结束后返回 `Ok(None)`，非零状态以 [`ClientError::Status`] 返回。
    pub async fn recv_message(&mut self) -> Result<Option<Bytes>, ClientError> {
        loop {
            if let Some(message) = decode_message(&mut self.inbound) {
                return Ok(Some(message));
            }
            if let Some(outcome) = &self.outcome {
                return match outcome {
                    Ok(()) if self.inbound.is_empty() => Ok(None),
                    Ok(()) => Err(ClientError::protocol("stream ended inside a message")),
                    Err(err) => Err(err.clone()),
                };
            }
            self.next_event().await?;
        }
    }

    /// 等待终态，期间收到的消息被丢弃。
    pub async fn finish(&mut self) -> Result<(), ClientError> {
        loop {
            if let Some(outcome) = &self.outcome {
                return outcome.clone();
            }
            self.next_event().await?;
            self.inbound.clear();
        }
    }

    /// 取消本流：向对端发送 RESET，之后的所有操作返回 [`ClientError::Cancelled`]。
    pub fn cancel(&mut self) {
        self.reset(ClientError::Cancelled);
    }

    async fn next_event(&mut self) -> Result<(), ClientError> {
        let next = guard(self.deadline, self.cancellation.as_ref(), self.events.recv()).await;
        match next {
            Ok(Some(event)) => {
                self.apply(event);
                Ok(())
            }
            Ok(None) => {
                self.outcome = Some(Err(ClientError::transport_fatal(
                    "transport released the stream without a status",
                )));
                Ok(())
            }
            Err(interrupted) => Err(self.interrupt(interrupted)),
        }
    }

    fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Data {
                payload,
                end_stream,
            } => {
                let len = payload.len();
                self.inbound.extend_from_slice(&payload);
                if end_stream {
                    self.remote_closed = true;
                }
                if let Some(increment) = self.recv_window.on_consume(len) {
                    if !self.remote_closed {
                        self.transport.stream_credit(self.id, increment);
                    }
                }
                self.transport.consume_connection(len);
            }
            StreamEvent::Trailers { code, message } => {
                self.remote_closed = true;
                self.outcome = Some(if code == 0 {
                    Ok(())
                } else {
                    Err(ClientError::Status { code, message })
                });
            }
            StreamEvent::Reset { code } => {
                self.remote_closed = true;
                self.outcome = Some(Err(ClientError::StreamReset { code }));
            }
            StreamEvent::Failed(err) => {
                self.remote_closed = true;
                self.outcome = Some(Err(err));
            }
        }
    }

    /// 非阻塞地吸收已到达的事件。
    fn poll_events(&mut self) {
        while self.outcome.is_none() {
            match self.events.try_recv() {
                Ok(event) => self.apply(event),
                Err(_) => break,
            }
        }
    }

    /// 额度通道关闭时的错误：优先使用事件队列里的终态。
    fn closed_error(&mut self) -> ClientError {
        self.poll_events();
        match &self.outcome {
            Some(Err(err)) => err.clone(),
            Some(Ok(())) => ClientError::protocol("stream completed before the message was sent"),
            None => {
                let err = ClientError::GoingAway;
                self.outcome = Some(Err(err.clone()));
                err
            }
        }
    }

    fn interrupt(&mut self, interrupted: Interrupted) -> ClientError {
        let err = ClientError::from(interrupted);
        self.reset(err.clone());
        err
    }

    fn reset(&mut self, err: ClientError) {
        if self.outcome.is_none() {
            self.transport.reset_stream(self.id, CODE_CANCEL);
            self.outcome = Some(Err(err));
        }
        self.release_pending();
    }

    /// 归还尚未被读取的数据占用的连接额度。
    fn release_pending(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            if let StreamEvent::Data { payload, .. } = event {
                self.transport.consume_connection(payload.len());
            }
        }
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        if self.outcome.is_none() {
            self.transport.reset_stream(self.id, CODE_CANCEL);
        }
        self.release_pending();
    }
}
