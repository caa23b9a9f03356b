//! `pick_first`：按地址顺序逐个尝试，使用第一个连通的地址。
//!
//! # 教案式说明
//! - **逻辑 (How)**：
//!   1. 解析结果到达后为每个地址建立 Idle 子连接，从第一个开始建连；
//!   2. 当前尝试失败后转向下一个地址；全部失败时发布 TransientFailure，
//!      失败的子连接按各自退避继续重连，谁先连通就选谁；
//!   3. 选中后移除其余子连接，所有调用都走选中的连接；
//!   4. 选中的连接被对端排空或断开后回到 Idle，首次挑选（或显式 connect）时重新扫描；
//!      致命错误则立即重新扫描。
//! - **契约 (What)**：配置只接受 `{"shuffle_address_list": bool}`；
//!   选中的地址仍在新解析结果中时保持连接不变；
//!   扫描进行中收到地址集合相同的解析结果时不重置扫描，也不发布新 Picker。

use std::sync::Arc;

use crate::address::Address;
use crate::balancer::base::{no_backends, same_address_set, shuffle};
use crate::balancer::{
    Balancer, BalancerBuilder, BalancerHandle, DeferPicker, ErrorPicker, Picker, SinglePicker,
    SubConnSet, parse_config_object,
};
use crate::connectivity::ConnectivityState;
use crate::error::ClientError;
use crate::resolver::ResolverState;
use crate::subconn::{SubConn, SubConnState};

pub const NAME: &str = "pick_first";

const SHUFFLE_KEY: &str = "shuffle_address_list";

#[derive(Clone, Copy, Debug, Default)]
pub struct PickFirstBuilder;

impl BalancerBuilder for PickFirstBuilder {
    fn name(&self) -> &str {
        NAME
    }

    fn build(&self, handle: BalancerHandle) -> Box<dyn Balancer> {
        Box::new(PickFirst {
            handle,
            subconns: SubConnSet::new(),
            addresses: Vec::new(),
            selected: None,
            cursor: 0,
            state: ConnectivityState::Idle,
            no_backends: false,
        })
    }
}

struct PickFirst {
    handle: BalancerHandle,
    subconns: SubConnSet,
    /// 最近一次解析结果（可能已洗牌），重新扫描时使用。
    addresses: Vec<Address>,
    selected: Option<SubConn>,
    /// 扫描中当前尝试的位置。
    cursor: usize,
    state: ConnectivityState,
    /// 当前发布的是“没有可用后端”的 Picker。
    no_backends: bool,
}

impl PickFirst {
    fn publish(&mut self, state: ConnectivityState, picker: Arc<dyn Picker>) {
        self.state = state;
        self.no_backends = false;
        self.handle.update_state(state, picker);
    }

    /// 从第一个地址开始一轮扫描。
    fn start_scan(&mut self) -> Result<(), ClientError> {
        self.selected = None;
        self.subconns.reconcile(&self.handle, &self.addresses)?;
        self.cursor = 0;
        if let Some(first) = self.subconns.get(0) {
            first.connect();
        }
        if self.state != ConnectivityState::TransientFailure {
            self.publish(ConnectivityState::Connecting, Arc::new(DeferPicker));
        }
        Ok(())
    }

    /// 当前尝试失败，转向下一个地址；全部尝试过则发布 TransientFailure。
    fn advance(&mut self) {
        self.cursor += 1;
        match self.subconns.get(self.cursor) {
            Some(next) => next.connect(),
            None => {
                let err = ClientError::unavailable(
                    "all addresses failed to connect",
                    self.subconns.last_error().cloned(),
                );
                self.publish(
                    ConnectivityState::TransientFailure,
                    Arc::new(ErrorPicker::transient(err)),
                );
                self.handle.resolve_now();
            }
        }
    }

    fn select(&mut self, subconn: &SubConn) {
        self.subconns.retain_only(&self.handle, subconn);
        self.selected = Some(subconn.clone());
        tracing::debug!(address = %subconn.address(), "pick_first selected address");
        self.publish(
            ConnectivityState::Ready,
            Arc::new(SinglePicker::new(subconn.clone())),
        );
    }
}

impl Balancer for PickFirst {
    fn update_resolver_state(&mut self, state: &ResolverState) -> Result<(), ClientError> {
        let config = parse_config_object(state.config(), NAME, &[SHUFFLE_KEY])?;
        let shuffle_addresses = match config.get(SHUFFLE_KEY) {
            None => false,
            Some(serde_json::Value::Bool(flag)) => *flag,
            Some(_) => {
                return Err(ClientError::invalid_config(format!(
                    "{NAME} config field `{SHUFFLE_KEY}` must be a boolean"
                )));
            }
        };

        let mut addresses = state.addresses().to_vec();
        if addresses.is_empty() {
            if self.no_backends {
                return Ok(());
            }
            self.subconns.remove_all(&self.handle);
            self.addresses.clear();
            self.selected = None;
            self.publish(
                ConnectivityState::TransientFailure,
                Arc::new(ErrorPicker::transient(no_backends())),
            );
            self.no_backends = true;
            self.handle.resolve_now();
            return Ok(());
        }
        let scanning = self.selected.is_none()
            && matches!(
                self.state,
                ConnectivityState::Connecting | ConnectivityState::TransientFailure
            );
        if scanning && same_address_set(&addresses, &self.addresses) {
            tracing::trace!("pick_first scan in progress, address set unchanged");
            return Ok(());
        }
        if shuffle_addresses {
            shuffle(&mut addresses);
        }
        self.addresses = addresses;

        if let Some(selected) = &self.selected {
            if self.addresses.contains(selected.address()) {
                return Ok(());
            }
        }
        if self.state == ConnectivityState::Idle && self.selected.is_none() && !self.subconns.is_empty()
        {
            // 空闲中只更新候选地址，等待退出空闲。
            self.subconns.reconcile(&self.handle, &self.addresses)?;
            return Ok(());
        }
        self.start_scan()
    }

    fn resolver_error(&mut self, error: ClientError) {
        if self.subconns.is_empty() {
            self.publish(
                ConnectivityState::TransientFailure,
                Arc::new(ErrorPicker::transient(error)),
            );
        } else {
            tracing::debug!(error = %error, "resolver error ignored, keeping current addresses");
        }
    }

    fn update_subconn_state(&mut self, subconn: &SubConn, update: &SubConnState) {
        if !self.subconns.update(subconn, update) {
            return;
        }
        let is_selected = self.selected.as_ref() == Some(subconn);
        match update.state {
            ConnectivityState::Ready => {
                if self.selected.is_none() || is_selected {
                    self.select(subconn);
                }
            }
            ConnectivityState::Connecting => {
                if self.selected.is_none()
                    && self.state != ConnectivityState::TransientFailure
                    && self.state != ConnectivityState::Connecting
                {
                    self.publish(ConnectivityState::Connecting, Arc::new(DeferPicker));
                }
            }
            ConnectivityState::TransientFailure => {
                if is_selected {
                    if let Err(err) = self.start_scan() {
                        tracing::debug!(error = %err, "pick_first rescan failed");
                    }
                } else if self.selected.is_none()
                    && self.subconns.position(subconn) == Some(self.cursor)
                {
                    self.advance();
                }
            }
            ConnectivityState::Idle => {
                if is_selected {
                    self.selected = None;
                    let picker = self.handle.idle_picker();
                    self.publish(ConnectivityState::Idle, picker);
                }
            }
            ConnectivityState::Shutdown => {}
        }
    }

    fn exit_idle(&mut self) {
        if self.state != ConnectivityState::Idle || self.addresses.is_empty() {
            return;
        }
        if let Err(err) = self.start_scan() {
            tracing::debug!(error = %err, "pick_first failed to exit idle");
        }
    }

    fn close(&mut self) {
        self.subconns.remove_all(&self.handle);
        self.selected = None;
    }
}
