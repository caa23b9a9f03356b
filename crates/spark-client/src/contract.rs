//! 调用级契约原语：取消、截止与调用选项。
//!
//! 调用路径在每一个挂起点（等待新 Picker、等待流控额度、等待消息）都同时监听截止与取消，
//! 任一触发都必须立即解除挂起，而不是等到下一次 Picker 发布。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Poll;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::time::Instant;

use crate::error::ClientError;

/// 取消原语，统一表达调用的可中断性。
///
/// # 逻辑解析（How）
/// - 内部使用 [`AtomicBool`] 表达取消状态，并通过 [`Arc`] 支持多方共享；
/// - `cancel` 在首次成功设置取消位时返回 `true`，后续重复调用返回 `false`；
/// - 额外持有一个 [`Notify`]，使挂起中的调用能在取消发生的瞬间被唤醒，而不依赖轮询；
/// - [`Cancellation::child`] 派生的子令牌持有父令牌的引用：父令牌取消时子令牌随之取消，
///   反之则不然。
///
/// # 契约说明（What）
/// - **前置条件**：构造时处于“未取消”状态；
/// - **后置条件**：一旦 `cancel` 成功，`is_cancelled` 全局可见，所有 `cancelled().await` 立即完成。
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
    flag: AtomicBool,
    notify: Notify,
    parent: Option<Cancellation>,
}

impl Cancellation {
    /// 创建处于“未取消”状态的取消令牌。
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询当前是否已被标记取消（包括经由任一祖先令牌）。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
            || self
                .inner
                .parent
                .as_ref()
                .is_some_and(Cancellation::is_cancelled)
    }

    /// 将当前令牌标记为取消。
    ///
    /// 返回值为 `true` 表示本次调用首次触发取消；返回 `false` 表示之前已被取消
    /// （包括祖先令牌已取消的情形）。不影响父令牌。
    pub fn cancel(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let first = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// 派生子令牌：随本令牌一同取消，但自身的取消不会向上传播。
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(CancellationState {
                parent: Some(self.clone()),
                ..CancellationState::default()
            }),
        }
    }

    /// 等待取消发生（本令牌或任一祖先）。
    pub async fn cancelled(&self) {
        let chain: Vec<&CancellationState> =
            std::iter::successors(Some(self), |&token| token.inner.parent.as_ref())
                .map(|token| &*token.inner)
                .collect();
        loop {
            let mut waits: Vec<Pin<Box<Notified<'_>>>> = chain
                .iter()
                .map(|state| Box::pin(state.notify.notified()))
                .collect();
            for wait in &mut waits {
                wait.as_mut().enable();
            }
            if self.is_cancelled() {
                return;
            }
            std::future::poll_fn(|cx| {
                if waits.iter_mut().any(|wait| wait.as_mut().poll(cx).is_ready()) {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            })
            .await;
        }
    }
}

/// 截止原语，描述操作的最迟完成时间。
///
/// `Deadline` 可以为空（未设置），此时代表调用方未施加硬超时限制。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deadline {
    instant: Option<Instant>,
}

impl Deadline {
    /// 创建未设置截止时间的实例。
    pub const fn none() -> Self {
        Self { instant: None }
    }

    /// 根据绝对时间点构造截止时间。
    pub fn at(instant: Instant) -> Self {
        Self {
            instant: Some(instant),
        }
    }

    /// 以当前时刻加持续时间生成截止时间。
    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    /// 返回内部时间点。
    pub fn instant(&self) -> Option<Instant> {
        self.instant
    }

    /// 判断是否已经超时。
    pub fn is_expired(&self) -> bool {
        match self.instant {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// 距离截止的剩余时长；未设置时返回 `None`。
    pub fn remaining(&self) -> Option<Duration> {
        self.instant
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// 取两个截止中更早的一个。
    pub fn min(self, other: Deadline) -> Deadline {
        match (self.instant, other.instant) {
            (Some(a), Some(b)) => Deadline::at(a.min(b)),
            (Some(_), None) => self,
            (None, _) => other,
        }
    }
}

/// 单次调用的选项。
///
/// # 契约说明（What）
/// - `deadline`：整个调用（挑选连接 + 消息交换）的截止；
/// - `fail_fast`：为 `true` 时，Picker 报告 TransientFailure 会立即让调用失败；
///   默认 `false`，调用会一直等待新的 Picker 直到截止；
/// - `cancellation`：外部取消令牌。
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    deadline: Deadline,
    fail_fast: bool,
    cancellation: Option<Cancellation>,
}

impl CallOptions {
    /// 创建默认选项：无截止、等待就绪、不可取消。
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置相对超时。
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Deadline::after(timeout);
        self
    }

    /// 设置绝对截止。
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// 设置是否快速失败。
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// 绑定取消令牌。
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    pub fn cancellation(&self) -> Option<&Cancellation> {
        self.cancellation.as_ref()
    }
}

/// 挂起被打断的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Interrupted {
    Deadline,
    Cancelled,
}

impl From<Interrupted> for ClientError {
    fn from(value: Interrupted) -> Self {
        match value {
            Interrupted::Deadline => ClientError::DeadlineExceeded,
            Interrupted::Cancelled => ClientError::Cancelled,
        }
    }
}

/// 在截止与取消的约束下驱动 `future`。
///
/// 进入前先检查一次：已超时或已取消的调用不会再触碰 `future`。
pub(crate) async fn guard<F>(
    deadline: Deadline,
    cancellation: Option<&Cancellation>,
    future: F,
) -> Result<F::Output, Interrupted>
where
    F: Future,
{
    if cancellation.is_some_and(Cancellation::is_cancelled) {
        return Err(Interrupted::Cancelled);
    }
    if deadline.is_expired() {
        return Err(Interrupted::Deadline);
    }

    let cancelled = async {
        match cancellation {
            Some(token) => token.cancelled().await,
            None => std::future::pending::<()>().await,
        }
    };
    let expired = async {
        match deadline.instant() {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancelled => Err(Interrupted::Cancelled),
        _ = expired => Err(Interrupted::Deadline),
        output = future => Ok(output),
    }
}
