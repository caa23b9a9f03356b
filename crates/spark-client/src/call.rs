//! 调用路径：挑选子连接、打开流、交换消息。
//!
//! # 教案级说明
//!
//! ## 逻辑（How）
//! 1. 读取当前 Picker 快照并挑选；
//! 2. `Complete`：在子连接的传输上打开流；传输已消失或正在排空时等待下一代 Picker；
//! 3. `Defer`：等待下一代 Picker；
//! 4. `TransientFailure`：快速失败的调用立即失败，否则记住错误并等待；
//! 5. `Fail`：立即失败；
//! 6. 每一次等待都受调用截止与取消约束。
//!
//! ## 契约（What）
//! - 截止到达时，若期间见过 TransientFailure，返回携带该原因的 `Unavailable`，
//!   否则返回 `DeadlineExceeded`；
//! - 不会在截止之前因为“没有可用连接”而失败（快速失败除外）；
//! - 调用路径不获取任何全局锁，也不经过控制队列。

use bytes::Bytes;

use crate::balancer::{PickInfo, PickResult};
use crate::clientconn::ClientConn;
use crate::contract::{CallOptions, Interrupted, guard};
use crate::error::ClientError;
use crate::transport::ClientStream;

impl ClientConn {
    /// 为 `method` 打开一个流。
    pub async fn new_stream(
        &self,
        method: &str,
        options: &CallOptions,
    ) -> Result<ClientStream, ClientError> {
        let shared = &self.inner.shared;
        let mut generations = shared.subscribe_generations();
        let info = PickInfo { method };
        let mut last_transient: Option<ClientError> = None;

        loop {
            generations.borrow_and_update();
            if shared.is_closed() {
                return Err(ClientError::Closed);
            }
            let snapshot = shared.snapshot();
            match snapshot.pick(&info) {
                PickResult::Complete(subconn) => match subconn.transport() {
                    Some(transport) => match transport.open_stream(method, options) {
                        Ok(stream) => {
                            tracing::trace!(
                                method,
                                subconn = %subconn.id(),
                                stream = stream.id(),
                                generation = snapshot.generation(),
                                "stream opened"
                            );
                            return Ok(stream);
                        }
                        Err(ClientError::GoingAway) => {
                            tracing::trace!(subconn = %subconn.id(), "picked transport is going away");
                        }
                        Err(err) => return Err(err),
                    },
                    None => {
                        tracing::trace!(subconn = %subconn.id(), "picked subconn has no transport");
                    }
                },
                PickResult::Defer => {}
                PickResult::TransientFailure(err) => {
                    if options.fail_fast() {
                        return Err(into_unavailable(err));
                    }
                    last_transient = Some(err);
                }
                PickResult::Fail(err) => return Err(err),
            }

            let waited = guard(
                options.deadline(),
                options.cancellation(),
                generations.changed(),
            )
            .await;
            match waited {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(ClientError::Closed),
                Err(Interrupted::Deadline) => {
                    return Err(match last_transient {
                        Some(err) => into_unavailable(err),
                        None => ClientError::DeadlineExceeded,
                    });
                }
                Err(Interrupted::Cancelled) => return Err(ClientError::Cancelled),
            }
        }
    }

    /// 一元调用：发送一条请求，接收一条响应。
    pub async fn unary(
        &self,
        method: &str,
        request: Bytes,
        options: &CallOptions,
    ) -> Result<Bytes, ClientError> {
        let mut stream = self.new_stream(method, options).await?;
        stream.send_message(request).await?;
        stream.close_send();
        let response = stream
            .recv_message()
            .await?
            .ok_or_else(|| ClientError::protocol("stream ended without a response"))?;
        stream.finish().await?;
        Ok(response)
    }
}

/// 已经是 `Unavailable` 的错误原样返回，其余包装为 `Unavailable`。
fn into_unavailable(err: ClientError) -> ClientError {
    match err {
        ClientError::Unavailable { .. } => err,
        other => ClientError::unavailable("no subconnection is ready", Some(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_is_not_wrapped_twice() {
        let inner = ClientError::unavailable("all addresses failed to connect", None);
        assert_eq!(into_unavailable(inner.clone()), inner);

        let wrapped = into_unavailable(ClientError::connection("10.0.0.1:80", "refused"));
        assert_eq!(wrapped.code(), "spark.client.call.unavailable");
        assert_eq!(
            wrapped.last_error().map(ClientError::code),
            Some("spark.client.subconn.connect_failed")
        );
    }
}
