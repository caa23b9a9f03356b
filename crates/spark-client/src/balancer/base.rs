use std::collections::hash_map::RandomState;
use std::collections::{HashMap, HashSet};
use std::hash::BuildHasher;

use crate::address::Address;
use crate::backoff::mix64;
use crate::balancer::BalancerHandle;
use crate::connectivity::ConnectivityState;
use crate::error::ClientError;
use crate::subconn::{SubConn, SubConnState};

#[derive(Clone, Debug)]
struct Entry {
    subconn: SubConn,
    state: ConnectivityState,
}

/// 策略持有的子连接集合，按最近一次解析结果的地址顺序排列。
///
/// # 教案式说明
/// - **意图 (Why)**：各策略共享“按地址调和子连接”的逻辑，避免每个策略各写一遍；
/// - **契约 (What)**：
///   - [`SubConnSet::reconcile`] 之后，集合中的地址与传入列表完全一致：
///     新地址创建子连接，消失的地址优雅移除，保留的地址复用原子连接；
///   - 对同一地址列表重复调用不会创建或移除任何子连接；
///   - 状态只由 [`SubConnSet::update`] 修改，未知子连接的事件被忽略。
#[derive(Debug, Default)]
pub struct SubConnSet {
    entries: Vec<Entry>,
    last_error: Option<ClientError>,
}

impl SubConnSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 调和到 `addresses`，返回新建的子连接。
    pub fn reconcile(
        &mut self,
        handle: &BalancerHandle,
        addresses: &[Address],
    ) -> Result<Vec<SubConn>, ClientError> {
        let mut existing: HashMap<Address, Entry> = self
            .entries
            .drain(..)
            .map(|entry| (entry.subconn.address().clone(), entry))
            .collect();

        let mut entries = Vec::with_capacity(addresses.len());
        let mut added = Vec::new();
        let mut failure = None;
        for address in addresses {
            if let Some(entry) = existing.remove(address) {
                entries.push(entry);
                continue;
            }
            match handle.new_subconn(address.clone()) {
                Ok(subconn) => {
                    added.push(subconn.clone());
                    entries.push(Entry {
                        subconn,
                        state: ConnectivityState::Idle,
                    });
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        for (_, stale) in existing {
            handle.remove_subconn(&stale.subconn);
        }
        self.entries = entries;
        match failure {
            Some(err) => Err(err),
            None => Ok(added),
        }
    }

    /// 记录子连接的新状态；返回该子连接是否属于集合。
    pub fn update(&mut self, subconn: &SubConn, update: &SubConnState) -> bool {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.subconn == *subconn)
        else {
            return false;
        };
        entry.state = update.state;
        if let Some(err) = &update.error {
            self.last_error = Some(err.clone());
        }
        true
    }

    /// 只保留 `keep`，其余全部移除。
    pub fn retain_only(&mut self, handle: &BalancerHandle, keep: &SubConn) {
        self.entries.retain(|entry| {
            if entry.subconn == *keep {
                true
            } else {
                handle.remove_subconn(&entry.subconn);
                false
            }
        });
    }

    pub fn remove_all(&mut self, handle: &BalancerHandle) {
        for entry in self.entries.drain(..) {
            handle.remove_subconn(&entry.subconn);
        }
    }

    pub fn state_of(&self, subconn: &SubConn) -> Option<ConnectivityState> {
        self.entries
            .iter()
            .find(|entry| entry.subconn == *subconn)
            .map(|entry| entry.state)
    }

    pub fn states(&self) -> Vec<ConnectivityState> {
        self.entries.iter().map(|entry| entry.state).collect()
    }

    /// 按地址顺序返回 Ready 的子连接。
    pub fn ready(&self) -> Vec<SubConn> {
        self.with_state(ConnectivityState::Ready)
    }

    pub fn with_state(&self, state: ConnectivityState) -> Vec<SubConn> {
        self.entries
            .iter()
            .filter(|entry| entry.state == state)
            .map(|entry| entry.subconn.clone())
            .collect()
    }

    pub fn subconns(&self) -> impl Iterator<Item = &SubConn> {
        self.entries.iter().map(|entry| &entry.subconn)
    }

    pub fn position(&self, subconn: &SubConn) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.subconn == *subconn)
    }

    pub fn get(&self, index: usize) -> Option<&SubConn> {
        self.entries.get(index).map(|entry| &entry.subconn)
    }

    /// 最近一次 TransientFailure 的原因。
    pub fn last_error(&self) -> Option<&ClientError> {
        self.last_error.as_ref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Fisher–Yates 洗牌，种子取自进程级随机源。
pub(crate) fn shuffle<T>(items: &mut [T]) {
    let mut state = RandomState::new().hash_one(items.len());
    for index in (1..items.len()).rev() {
        state = mix64(state);
        let pick = (state % (index as u64 + 1)) as usize;
        items.swap(index, pick);
    }
}

/// 两个地址列表是否包含相同的地址，忽略顺序。
pub(crate) fn same_address_set(left: &[Address], right: &[Address]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let left: HashSet<&Address> = left.iter().collect();
    let right: HashSet<&Address> = right.iter().collect();
    left == right
}

/// 地址列表为空时发布的错误。
pub(crate) fn no_backends() -> ClientError {
    ClientError::unavailable("resolver returned no usable backends", None)
}
