//! Picker：调用路径上的无锁挑选器。
//!
//! # 教案级说明
//!
//! ## 意图（Why）
//! - 每一次调用都要挑一个子连接，热路径上不能获取任何全局锁；
//! - 负载均衡策略在控制线程上生成不可变的 Picker，ClientConn 以快照方式原子发布，
//!   调用方读取快照后即可并发调用 [`Picker::pick`]。
//!
//! ## 契约（What）
//! - `pick` 不阻塞，不修改策略状态，可被无限并发调用，均摊 O(1)；
//! - 发布后的快照从不被修改，新状态总是以新快照替换旧快照；
//! - 结果分为四类：`Complete`（使用该子连接）、`Defer`（等待下一代 Picker）、
//!   `TransientFailure`（暂时不可用，默认等待，快速失败的调用立即失败）、`Fail`（立即失败）。

use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::BuildHasher;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::clientconn::{ControlEvent, EventSender};
use crate::connectivity::ConnectivityState;
use crate::error::ClientError;
use crate::subconn::SubConn;

/// 一次挑选的上下文。
#[derive(Clone, Copy, Debug)]
pub struct PickInfo<'a> {
    /// 完整方法名，例如 `/echo`。
    pub method: &'a str,
}

/// 挑选结果。
#[derive(Clone, Debug)]
pub enum PickResult {
    Complete(SubConn),
    Defer,
    TransientFailure(ClientError),
    Fail(ClientError),
}

pub trait Picker: Send + Sync + 'static {
    fn pick(&self, info: &PickInfo<'_>) -> PickResult;
}

/// 已发布的 Picker 快照。
#[derive(Clone)]
pub struct PickerSnapshot {
    generation: u64,
    state: ConnectivityState,
    picker: Arc<dyn Picker>,
}

impl fmt::Debug for PickerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickerSnapshot")
            .field("generation", &self.generation)
            .field("state", &self.state)
            .finish()
    }
}

impl PickerSnapshot {
    pub(crate) fn new(generation: u64, state: ConnectivityState, picker: Arc<dyn Picker>) -> Self {
        Self {
            generation,
            state,
            picker,
        }
    }

    /// 单调递增的代数。
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 发布时的聚合状态。
    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn pick(&self, info: &PickInfo<'_>) -> PickResult {
        self.picker.pick(info)
    }
}

/// 总是让调用等待下一代 Picker。
#[derive(Clone, Copy, Debug, Default)]
pub struct DeferPicker;

impl Picker for DeferPicker {
    fn pick(&self, _info: &PickInfo<'_>) -> PickResult {
        PickResult::Defer
    }
}

/// 总是返回同一个错误。
#[derive(Clone, Debug)]
pub struct ErrorPicker {
    error: ClientError,
    terminal: bool,
}

impl ErrorPicker {
    /// 暂时不可用：调用默认等待，快速失败的调用立即以该错误失败。
    pub fn transient(error: ClientError) -> Self {
        Self {
            error,
            terminal: false,
        }
    }

    /// 立即失败。
    pub fn fail(error: ClientError) -> Self {
        Self {
            error,
            terminal: true,
        }
    }
}

impl Picker for ErrorPicker {
    fn pick(&self, _info: &PickInfo<'_>) -> PickResult {
        if self.terminal {
            PickResult::Fail(self.error.clone())
        } else {
            PickResult::TransientFailure(self.error.clone())
        }
    }
}

/// 策略处于 Idle 时使用：首次挑选时请求退出空闲，调用等待下一代 Picker。
#[derive(Debug)]
pub struct IdlePicker {
    events: EventSender,
    requested: AtomicBool,
}

impl IdlePicker {
    pub(crate) fn new(events: EventSender) -> Self {
        Self {
            events,
            requested: AtomicBool::new(false),
        }
    }
}

impl Picker for IdlePicker {
    fn pick(&self, _info: &PickInfo<'_>) -> PickResult {
        if !self.requested.swap(true, Ordering::AcqRel) {
            let _ = self.events.send(ControlEvent::ExitIdle);
        }
        PickResult::Defer
    }
}

/// 在 Ready 子连接之间轮转。
///
/// 调度表在构造时固定：地址的 `weight` 属性决定它在表中重复的次数；
/// 起始位置随机，避免多个客户端同时把第一批请求打到同一个后端。
pub struct RoundRobinPicker {
    schedule: Vec<SubConn>,
    cursor: AtomicUsize,
}

impl fmt::Debug for RoundRobinPicker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundRobinPicker")
            .field("schedule", &self.schedule.len())
            .finish()
    }
}

impl RoundRobinPicker {
    /// `ready` 不得为空。
    pub fn new(ready: Vec<SubConn>) -> Self {
        let start = random_seed() as usize;
        Self::with_start(ready, start)
    }

    /// 以按权重展开的调度表构造。
    pub fn weighted(ready: &[SubConn]) -> Self {
        let schedule = ready
            .iter()
            .flat_map(|subconn| {
                std::iter::repeat_n(subconn.clone(), subconn.address().weight() as usize)
            })
            .collect();
        Self::new(schedule)
    }

    fn with_start(schedule: Vec<SubConn>, start: usize) -> Self {
        let start = if schedule.is_empty() {
            0
        } else {
            start % schedule.len()
        };
        Self {
            schedule,
            cursor: AtomicUsize::new(start),
        }
    }
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _info: &PickInfo<'_>) -> PickResult {
        if self.schedule.is_empty() {
            return PickResult::Defer;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.schedule.len();
        PickResult::Complete(self.schedule[index].clone())
    }
}

/// 总是挑同一个子连接。
#[derive(Clone, Debug)]
pub struct SinglePicker {
    subconn: SubConn,
}

impl SinglePicker {
    pub fn new(subconn: SubConn) -> Self {
        Self { subconn }
    }
}

impl Picker for SinglePicker {
    fn pick(&self, _info: &PickInfo<'_>) -> PickResult {
        PickResult::Complete(self.subconn.clone())
    }
}

fn random_seed() -> u64 {
    RandomState::new().hash_one(0x5eed_u64)
}
