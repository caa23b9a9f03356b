use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::ClientError;
use crate::resolver::{BuildOptions, Resolver, ResolverBuilder, ResolverHandle, ResolverState};
use crate::target::Target;

/// 由调用方驱动的解析器工厂。
///
/// # 教案式说明
/// - **意图 (Why)**：测试与自带服务发现的应用需要直接把地址推给 ClientConn；
/// - **契约 (What)**：`build` 之前设置的初始状态会在构建时立即提交；
///   [`ManualResolver`] 控制器在构建后可反复提交状态或错误，并统计 `resolve_now` 次数；
///   一个工厂只应服务一个 ClientConn，重复构建时后者覆盖前者。
#[derive(Clone)]
pub struct ManualResolverBuilder {
    scheme: String,
    shared: Arc<ManualShared>,
}

struct ManualShared {
    handle: Mutex<Option<ResolverHandle>>,
    initial: Mutex<Option<ResolverState>>,
    resolve_now: AtomicUsize,
    closed: AtomicBool,
}

impl fmt::Debug for ManualResolverBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualResolverBuilder")
            .field("scheme", &self.scheme)
            .finish()
    }
}

impl ManualResolverBuilder {
    pub fn new(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            shared: Arc::new(ManualShared {
                handle: Mutex::new(None),
                initial: Mutex::new(None),
                resolve_now: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// 设置构建时立即提交的状态。
    pub fn with_initial_state(self, state: ResolverState) -> Self {
        *self.shared.initial.lock() = Some(state);
        self
    }

    /// 获取控制器。
    pub fn resolver(&self) -> ManualResolver {
        ManualResolver {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl ResolverBuilder for ManualResolverBuilder {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn build(
        &self,
        _target: &Target,
        handle: ResolverHandle,
        _options: &BuildOptions,
    ) -> Result<Box<dyn Resolver>, ClientError> {
        if let Some(initial) = self.shared.initial.lock().clone() {
            handle.send_state(initial)?;
        }
        self.shared.closed.store(false, Ordering::Release);
        *self.shared.handle.lock() = Some(handle);
        Ok(Box::new(ManualResolver {
            shared: Arc::clone(&self.shared),
        }))
    }
}

/// 手动解析器的控制器，同时也是交给 ClientConn 的 [`Resolver`]。
#[derive(Clone)]
pub struct ManualResolver {
    shared: Arc<ManualShared>,
}

impl fmt::Debug for ManualResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualResolver")
            .field("resolve_now_requests", &self.resolve_now_requests())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ManualResolver {
    fn handle(&self) -> Result<ResolverHandle, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        self.shared
            .handle
            .lock()
            .clone()
            .ok_or_else(|| ClientError::resolution("manual resolver has not been built"))
    }

    /// 提交状态并等待负载均衡策略的裁决。
    pub async fn update_state(&self, state: ResolverState) -> Result<(), ClientError> {
        self.handle()?.update_state(state).await
    }

    /// 报告解析失败。
    pub fn report_error(&self, err: ClientError) -> Result<(), ClientError> {
        self.handle()?.report_error(err)
    }

    /// 累计收到的 `resolve_now` 请求数。
    pub fn resolve_now_requests(&self) -> usize {
        self.shared.resolve_now.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Resolver for ManualResolver {
    fn resolve_now(&self) {
        self.shared.resolve_now.fetch_add(1, Ordering::AcqRel);
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.handle.lock().take();
    }
}
