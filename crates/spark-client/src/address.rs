use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// 权重提示的属性键，轮询策略据此在调度表中重复地址。
pub const ATTR_WEIGHT: &str = "weight";
/// 地域提示的属性键，仅供策略使用，传输层不解释。
pub const ATTR_LOCALITY: &str = "locality";

/// 地址的不透明属性表。
///
/// 属性只对负载均衡策略有意义（权重、地域等），传输层从不读取。
/// 使用有序映射，使相等性、哈希与排序都是结构化的。
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Attributes(BTreeMap<String, String>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回附加了新键值的属性表。
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// 一个具体的网络端点。
///
/// 值对象：克隆廉价（内部为 `Arc<str>`），相等性由网络位置与属性共同决定。
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    addr: Arc<str>,
    attributes: Attributes,
}

impl Address {
    pub fn new(addr: impl Into<Arc<str>>) -> Self {
        Self {
            addr: addr.into(),
            attributes: Attributes::default(),
        }
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// 网络位置，例如 `10.0.0.1:443` 或 `unix:/run/app.sock`。
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// 解析 `weight` 属性；缺失或非法时为 1，结果至少为 1。
    pub fn weight(&self) -> u32 {
        self.attributes
            .get(ATTR_WEIGHT)
            .and_then(|raw| raw.parse::<u32>().ok())
            .unwrap_or(1)
            .max(1)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attributes.is_empty() {
            write!(f, "Address({})", self.addr)
        } else {
            write!(f, "Address({}, {:?})", self.addr, self.attributes)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Address::new(value)
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Address::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_structural() {
        let a = Address::new("10.0.0.1:80");
        let b = Address::from("10.0.0.1:80");
        assert_eq!(a, b);

        let weighted = a
            .clone()
            .with_attributes(Attributes::new().with(ATTR_WEIGHT, "3"));
        assert_ne!(a, weighted);
        assert_eq!(weighted.weight(), 3);
        assert_eq!(a.weight(), 1);
    }

    #[test]
    fn invalid_weight_falls_back_to_one() {
        let addr = Address::new("x:1").with_attributes(Attributes::new().with(ATTR_WEIGHT, "0"));
        assert_eq!(addr.weight(), 1);
        let addr = Address::new("x:1").with_attributes(Attributes::new().with(ATTR_WEIGHT, "abc"));
        assert_eq!(addr.weight(), 1);
    }
}
