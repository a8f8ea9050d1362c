use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use thiserror::Error;

use crate::error::SocketError;
use crate::option::SslEnabled;

/// URL 未显式给出端口时使用的默认端口。
pub const DEFAULT_PORT: u16 = 9559;

/// 支持的传输方案。
///
/// - `tcp`：明文；
/// - `tcps`：单向 TLS，不校验对端证书；
/// - `tcpsm`：双向 TLS，双方证书都必须通过校验。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TcpScheme {
    Tcp,
    Tcps,
    Tcpsm,
}

impl TcpScheme {
    pub const fn as_str(self) -> &'static str {
        match self {
            TcpScheme::Tcp => "tcp",
            TcpScheme::Tcps => "tcps",
            TcpScheme::Tcpsm => "tcpsm",
        }
    }

    pub const fn ssl_enabled(self) -> SslEnabled {
        SslEnabled(!matches!(self, TcpScheme::Tcp))
    }
}

impl FromStr for TcpScheme {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TcpScheme::Tcp),
            "tcps" => Ok(TcpScheme::Tcps),
            "tcpsm" => Ok(TcpScheme::Tcpsm),
            other => Err(UrlError::UnsupportedScheme(other.to_owned())),
        }
    }
}

impl fmt::Display for TcpScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// URL 解析失败的原因。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum UrlError {
    #[error("url is empty")]
    Empty,
    #[error("url `{0}` has no scheme")]
    MissingScheme(String),
    #[error("unsupported scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("url `{0}` has no host")]
    MissingHost(String),
    #[error("invalid port in `{0}`")]
    InvalidPort(String),
}

impl From<UrlError> for SocketError {
    fn from(error: UrlError) -> Self {
        SocketError::bad_address(error.to_string())
    }
}

/// 端点：方案 + 主机 + 端口，构造后不可变。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Url {
    scheme: TcpScheme,
    host: String,
    port: u16,
}

impl Url {
    pub fn new(scheme: TcpScheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// 解析 `scheme://host[:port]` 形式的 URL，IPv6 主机需用方括号包裹。
    pub fn parse(input: &str) -> Result<Self, UrlError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(UrlError::Empty);
        }
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| UrlError::MissingScheme(input.to_owned()))?;
        let scheme = scheme.parse::<TcpScheme>()?;
        let authority = rest.split('/').next().unwrap_or_default();

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| UrlError::MissingHost(input.to_owned()))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => Some(port),
                None if tail.is_empty() => None,
                None => return Err(UrlError::InvalidPort(input.to_owned())),
            };
            (host, port)
        } else if authority.matches(':').count() > 1 {
            (authority, None)
        } else {
            match authority.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(UrlError::MissingHost(input.to_owned()));
        }
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| UrlError::InvalidPort(input.to_owned()))?,
            None => DEFAULT_PORT,
        };
        Ok(Self::new(scheme, host, port))
    }

    pub fn scheme(&self) -> TcpScheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 返回替换端口后的新 URL。
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.scheme, self.host.clone(), port)
    }

    /// 返回替换主机后的新 URL。
    pub fn with_host(&self, host: impl Into<String>) -> Self {
        Self::new(self.scheme, host, self.port)
    }

    /// 主机是否为 `0.0.0.0` 或 `::` 这类通配地址。
    pub fn is_wildcard(&self) -> bool {
        self.host
            .parse::<IpAddr>()
            .map(|ip| ip.is_unspecified())
            .unwrap_or(false)
    }
}

impl FromStr for Url {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Url::parse(s)
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_scheme() {
        for (text, scheme) in [
            ("tcp://a:1", TcpScheme::Tcp),
            ("tcps://a:1", TcpScheme::Tcps),
            ("TCPSM://a:1", TcpScheme::Tcpsm),
        ] {
            assert_eq!(Url::parse(text).map(|url| url.scheme()), Ok(scheme));
        }
    }

    #[test]
    fn missing_port_falls_back_to_default() {
        let url = Url::parse("tcp://example.org").expect("url");
        assert_eq!(url.port(), DEFAULT_PORT);
        assert_eq!(url.host(), "example.org");
    }

    #[test]
    fn bracketed_ipv6_round_trips_through_display() {
        let url = Url::parse("tcps://[::1]:4000").expect("url");
        assert_eq!(url.host(), "::1");
        assert_eq!(url.to_string(), "tcps://[::1]:4000");
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(Url::parse(""), Err(UrlError::Empty));
        assert!(matches!(Url::parse("127.0.0.1:9"), Err(UrlError::MissingScheme(_))));
        assert!(matches!(Url::parse("udp://h:1"), Err(UrlError::UnsupportedScheme(_))));
        assert!(matches!(Url::parse("tcp://:12"), Err(UrlError::MissingHost(_))));
        assert!(matches!(Url::parse("tcp://h:99999"), Err(UrlError::InvalidPort(_))));
    }

    #[test]
    fn wildcard_detection() {
        assert!(Url::parse("tcp://0.0.0.0:0").expect("url").is_wildcard());
        assert!(Url::parse("tcp://[::]:0").expect("url").is_wildcard());
        assert!(!Url::parse("tcp://127.0.0.1:0").expect("url").is_wildcard());
    }

    #[test]
    fn url_errors_become_bad_address() {
        let err = SocketError::from(UrlError::Empty);
        assert_eq!(err.kind(), crate::ErrorKind::BadAddress);
    }
}
