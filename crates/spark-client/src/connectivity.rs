//! 连通性状态与聚合规则。
//!
//! 子连接、负载均衡策略与 ClientConn 共用同一套五态：
//! `Idle`、`Connecting`、`Ready`、`TransientFailure`、`Shutdown`。

use std::fmt;

/// 连通性状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    /// 终态，没有任何出边。
    Shutdown,
}

impl ConnectivityState {
    /// 全部五个状态，便于穷举测试。
    pub const ALL: [ConnectivityState; 5] = [
        ConnectivityState::Idle,
        ConnectivityState::Connecting,
        ConnectivityState::Ready,
        ConnectivityState::TransientFailure,
        ConnectivityState::Shutdown,
    ];

    pub fn is_terminal(self) -> bool {
        self == ConnectivityState::Shutdown
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        };
        f.write_str(label)
    }
}

/// 将子连接状态聚合为策略整体状态的规则。
///
/// 策略可以替换默认实现，以适配多于两态并发更新时的特定优先级。
pub trait StateAggregator: Send + Sync + 'static {
    fn aggregate(&self, states: &[ConnectivityState]) -> ConnectivityState;
}

/// 默认优先级：
///
/// 1. 任一子连接 Ready ⇒ Ready；
/// 2. 否则任一 Connecting ⇒ Connecting；
/// 3. 否则存在 TransientFailure 且没有 Idle ⇒ TransientFailure；
/// 4. 其余情况 ⇒ Idle。
///
/// Shutdown 的子连接不参与前三条判断。
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultAggregator;

impl StateAggregator for DefaultAggregator {
    fn aggregate(&self, states: &[ConnectivityState]) -> ConnectivityState {
        aggregate(states.iter().copied())
    }
}

/// 以默认优先级聚合任意状态序列。
pub fn aggregate(states: impl IntoIterator<Item = ConnectivityState>) -> ConnectivityState {
    let mut connecting = false;
    let mut idle = false;
    let mut transient_failure = false;

    for state in states {
        match state {
            ConnectivityState::Ready => return ConnectivityState::Ready,
            ConnectivityState::Connecting => connecting = true,
            ConnectivityState::Idle => idle = true,
            ConnectivityState::TransientFailure => transient_failure = true,
            ConnectivityState::Shutdown => {}
        }
    }

    if connecting {
        ConnectivityState::Connecting
    } else if transient_failure && !idle {
        ConnectivityState::TransientFailure
    } else {
        ConnectivityState::Idle
    }
}
