use std::sync::Arc;

use tokio::sync::mpsc;

use crate::balancer::{Balancer, ErrorPicker};
use crate::clientconn::{ConnShared, ControlEvent};
use crate::connectivity::ConnectivityState;
use crate::error::ClientError;
use crate::resolver::{Resolver, ResolverState};
use crate::subconn::{SubConnId, SubConnState};

/// 控制任务：唯一持有策略与解析器，按到达顺序处理事件。
pub(super) struct Worker {
    shared: Arc<ConnShared>,
    balancer: Box<dyn Balancer>,
    resolver: Option<Box<dyn Resolver>>,
    events: mpsc::UnboundedReceiver<ControlEvent>,
}

impl Worker {
    pub(super) fn new(
        shared: Arc<ConnShared>,
        balancer: Box<dyn Balancer>,
        resolver: Box<dyn Resolver>,
        events: mpsc::UnboundedReceiver<ControlEvent>,
    ) -> Self {
        Self {
            shared,
            balancer,
            resolver: Some(resolver),
            events,
        }
    }

    pub(super) async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                ControlEvent::ResolverUpdate { state, reply } => {
                    let verdict = self.on_resolver_update(&state);
                    if let Some(reply) = reply {
                        let _ = reply.send(verdict);
                    }
                }
                ControlEvent::ResolverError(err) => {
                    tracing::debug!(target_uri = %self.shared.target(), error = %err, "resolver reported an error");
                    self.balancer.resolver_error(err);
                }
                ControlEvent::SubConnState { id, update } => self.on_subconn_state(id, update),
                ControlEvent::ExitIdle => self.balancer.exit_idle(),
                ControlEvent::ResolveNow => {
                    if let Some(resolver) = &self.resolver {
                        resolver.resolve_now();
                    }
                }
                ControlEvent::Close => break,
            }
        }
        self.shutdown();
    }

    fn on_resolver_update(&mut self, state: &ResolverState) -> Result<(), ClientError> {
        tracing::debug!(
            target_uri = %self.shared.target(),
            addresses = state.addresses().len(),
            note = state.note().unwrap_or_default(),
            "resolver state received"
        );
        let verdict = self.balancer.update_resolver_state(state);
        if let Err(err) = &verdict {
            tracing::warn!(
                target_uri = %self.shared.target(),
                error = %err,
                "balancer rejected resolver state, keeping the previous one"
            );
        }
        verdict
    }

    fn on_subconn_state(&mut self, id: SubConnId, update: SubConnState) {
        // 已移除的子连接仍可能送来迟到的事件（包括自身的 Shutdown），直接丢弃。
        let Some(subconn) = self.shared.lookup_subconn(id) else {
            tracing::trace!(subconn = %id, state = %update.state, "dropping event of removed subconn");
            return;
        };
        self.balancer.update_subconn_state(&subconn, &update);
    }

    fn shutdown(&mut self) {
        if !self.shared.mark_closed() {
            tracing::trace!("client connection already closed");
        }
        if let Some(resolver) = self.resolver.take() {
            resolver.close();
        }
        self.balancer.close();
        for subconn in self.shared.take_subconns() {
            subconn.shutdown();
        }
        self.shared.install(
            ConnectivityState::Shutdown,
            Arc::new(ErrorPicker::fail(ClientError::Closed)),
        );

        self.events.close();
        let mut discarded = 0usize;
        while let Ok(event) = self.events.try_recv() {
            discarded += 1;
            if let ControlEvent::ResolverUpdate {
                reply: Some(reply), ..
            } = event
            {
                let _ = reply.send(Err(ClientError::Closed));
            }
        }
        tracing::debug!(target_uri = %self.shared.target(), discarded, "client connection closed");
        self.shared.mark_terminated();
    }
}
