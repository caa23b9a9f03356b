//! 流量控制窗口。
//!
//! 发送窗口由调用方任务扣减、由读循环根据 WINDOW_UPDATE 补充；接收窗口由读循环扣减、
//! 由应用读取消息时归还。两侧都只使用原子量与 [`Notify`]，不持有任何锁跨越 `await`。

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use tokio::sync::Notify;

/// 窗口已经关闭（传输终结或流结束），不会再有额度。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WindowClosed;

/// 发送方向的额度。
///
/// # 契约说明（What）
/// - [`SendWindow::acquire`] 在额度为零时挂起，不自旋；
/// - 关闭后所有挂起的 `acquire` 立即返回 [`WindowClosed`]；
/// - 额度可能被对端的 SETTINGS 调整为负值，此时发送方等待补充直到转正。
#[derive(Debug)]
pub(crate) struct SendWindow {
    available: AtomicI64,
    closed: AtomicBool,
    notify: Notify,
}

impl SendWindow {
    pub(crate) fn new(initial: u32) -> Self {
        Self {
            available: AtomicI64::new(i64::from(initial)),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// 申请至多 `max` 字节，返回实际获得的额度（至少 1）。
    pub(crate) async fn acquire(&self, max: usize) -> Result<usize, WindowClosed> {
        let max = i64::try_from(max).unwrap_or(i64::MAX);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return Err(WindowClosed);
            }
            let current = self.available.load(Ordering::Acquire);
            if current > 0 {
                let take = current.min(max);
                if self
                    .available
                    .compare_exchange(current, current - take, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(take as usize);
                }
                continue;
            }
            notified.await;
        }
    }

    /// 归还未使用的额度。
    pub(crate) fn release(&self, amount: usize) {
        self.add_credit(amount as u32);
    }

    /// 补充额度并唤醒等待者。
    pub(crate) fn add_credit(&self, increment: u32) {
        if increment == 0 {
            return;
        }
        self.available
            .fetch_add(i64::from(increment), Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    pub(crate) fn available(&self) -> i64 {
        self.available.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// 接收方向的额度。
///
/// `in_flight` 记录已收到但尚未归还的字节，超过窗口即为对端违例；
/// `unacked` 记录已被应用消费但尚未通告的字节，达到窗口一半时合并为一次 WINDOW_UPDATE。
#[derive(Debug)]
pub(crate) struct RecvWindow {
    window: i64,
    in_flight: AtomicI64,
    unacked: AtomicI64,
}

impl RecvWindow {
    pub(crate) fn new(window: u32) -> Self {
        Self {
            window: i64::from(window),
            in_flight: AtomicI64::new(0),
            unacked: AtomicI64::new(0),
        }
    }

    /// 读循环收到 `len` 字节时调用；返回 `false` 表示对端超出了窗口。
    pub(crate) fn on_receive(&self, len: usize) -> bool {
        let len = len as i64;
        let after = self.in_flight.fetch_add(len, Ordering::AcqRel) + len;
        after <= self.window
    }

    /// 应用消费 `len` 字节时调用；返回需要通告给对端的增量。
    pub(crate) fn on_consume(&self, len: usize) -> Option<u32> {
        if len == 0 {
            return None;
        }
        let len = len as i64;
        let pending = self.unacked.fetch_add(len, Ordering::AcqRel) + len;
        if pending < self.window / 2 {
            return None;
        }
        let mut current = pending;
        loop {
            if current < self.window / 2 {
                return None;
            }
            match self
                .unacked
                .compare_exchange(current, 0, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.in_flight.fetch_sub(current, Ordering::AcqRel);
                    return u32::try_from(current).ok();
                }
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn acquire_suspends_until_credit() {
        let window = Arc::new(SendWindow::new(4));
        assert_eq!(window.acquire(10).await, Ok(4));

        let waiter = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.acquire(10).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "额度为零时发送方应挂起");

        window.add_credit(6);
        assert_eq!(waiter.await.unwrap(), Ok(6));
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let window = Arc::new(SendWindow::new(0));
        let waiter = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.acquire(1).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        window.close();
        assert_eq!(waiter.await.unwrap(), Err(WindowClosed));
    }

    #[test]
    fn recv_window_batches_updates_at_half() {
        let window = RecvWindow::new(100);
        assert!(window.on_receive(60));
        assert_eq!(window.on_consume(30), None);
        assert_eq!(window.on_consume(25), Some(55));
        assert!(window.on_receive(95));
        assert!(!window.on_receive(1), "超过窗口应被判定为违例");
    }
}
