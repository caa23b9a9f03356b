use std::fmt;
use std::str::FromStr;

use crate::error::ClientError;

/// 未显式声明 scheme 时使用的默认解析器。
pub const DEFAULT_SCHEME: &str = "dns";

/// 应用请求连接的逻辑目标 `{scheme, authority, endpoint}`。
///
/// # 契约说明（What）
/// - 接受 `scheme://authority/endpoint` 与 `scheme:///endpoint` 两种形式；
/// - 不含 `://` 的字符串整体视为 endpoint，并使用默认 scheme；
/// - 创建后不可变，ClientConn 生命周期内只解析一次。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
    scheme: String,
    authority: String,
    endpoint: String,
}

impl Target {
    /// 以给定默认 scheme 解析目标串。
    pub fn parse_with_default(raw: &str, default_scheme: &str) -> Result<Self, ClientError> {
        let invalid = |reason: &str| ClientError::InvalidTarget {
            target: raw.to_owned(),
            reason: reason.to_owned(),
        };

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("target is empty"));
        }

        let (scheme, rest) = match trimmed.split_once("://") {
            Some((scheme, rest)) => (scheme, Some(rest)),
            None => (default_scheme, None),
        };
        if !is_valid_scheme(scheme) {
            return Err(invalid("scheme must start with a letter and contain only [a-z0-9+.-]"));
        }

        let (authority, endpoint) = match rest {
            Some(rest) => match rest.split_once('/') {
                Some((authority, endpoint)) => (authority, endpoint),
                None => return Err(invalid("missing `/` between authority and endpoint")),
            },
            None => ("", trimmed),
        };
        if endpoint.is_empty() {
            return Err(invalid("endpoint is empty"));
        }

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            authority: authority.to_owned(),
            endpoint: endpoint.to_owned(),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// 传输握手时使用的权威名：显式 authority 优先，否则取 endpoint。
    pub fn dial_authority(&self) -> &str {
        if self.authority.is_empty() {
            &self.endpoint
        } else {
            &self.authority
        }
    }
}

impl FromStr for Target {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Target::parse_with_default(s, DEFAULT_SCHEME)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.authority, self.endpoint)
    }
}

fn is_valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_form() {
        let target: Target = "dns://8.8.8.8/example.org:443".parse().unwrap();
        assert_eq!(target.scheme(), "dns");
        assert_eq!(target.authority(), "8.8.8.8");
        assert_eq!(target.endpoint(), "example.org:443");
        assert_eq!(target.dial_authority(), "8.8.8.8");
    }

    #[test]
    fn parses_empty_authority() {
        let target: Target = "static:///10.0.0.1:80,10.0.0.2:80".parse().unwrap();
        assert_eq!(target.scheme(), "static");
        assert_eq!(target.authority(), "");
        assert_eq!(target.endpoint(), "10.0.0.1:80,10.0.0.2:80");
    }

    #[test]
    fn bare_endpoint_uses_default_scheme() {
        let target = Target::parse_with_default("localhost:50051", "passthrough").unwrap();
        assert_eq!(target.scheme(), "passthrough");
        assert_eq!(target.endpoint(), "localhost:50051");
        assert_eq!(target.dial_authority(), "localhost:50051");
    }

    #[test]
    fn rejects_malformed_targets() {
        for raw in ["", "dns://", "dns://host", "1dns:///x", "dns:///"] {
            let err = raw.parse::<Target>().unwrap_err();
            assert_eq!(err.code(), "spark.client.target.invalid", "{raw}");
        }
    }
}
