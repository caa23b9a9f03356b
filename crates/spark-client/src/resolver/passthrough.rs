use crate::address::Address;
use crate::error::ClientError;
use crate::resolver::{BuildOptions, Resolver, ResolverBuilder, ResolverHandle, ResolverState};
use crate::target::Target;

/// `passthrough:///host:port`：endpoint 原样作为唯一地址，由连接器自行处理名称。
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughResolverBuilder;

impl ResolverBuilder for PassthroughResolverBuilder {
    fn scheme(&self) -> &str {
        "passthrough"
    }

    fn build(
        &self,
        target: &Target,
        handle: ResolverHandle,
        _options: &BuildOptions,
    ) -> Result<Box<dyn Resolver>, ClientError> {
        let state = ResolverState::new([Address::new(target.endpoint())]);
        handle.send_state(state)?;
        Ok(Box::new(FixedResolver))
    }
}

/// `static:///a:1,b:2`：逗号分隔的固定地址列表。
#[derive(Clone, Copy, Debug, Default)]
pub struct StaticResolverBuilder;

impl ResolverBuilder for StaticResolverBuilder {
    fn scheme(&self) -> &str {
        "static"
    }

    fn build(
        &self,
        target: &Target,
        handle: ResolverHandle,
        _options: &BuildOptions,
    ) -> Result<Box<dyn Resolver>, ClientError> {
        let addresses: Vec<Address> = target
            .endpoint()
            .split(',')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(Address::from)
            .collect();
        if addresses.is_empty() {
            return Err(ClientError::InvalidTarget {
                target: target.to_string(),
                reason: "static target lists no addresses".to_owned(),
            });
        }
        handle.send_state(ResolverState::new(addresses))?;
        Ok(Box::new(FixedResolver))
    }
}

/// 结果不会变化的解析器，`resolve_now` 无事可做。
struct FixedResolver;

impl Resolver for FixedResolver {
    fn resolve_now(&self) {}

    fn close(&self) {}
}
