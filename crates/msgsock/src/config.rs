//! 套接字与监听器共用的不可变配置。
//!
//! 环境变量只在进程边缘解析一次（[`SocketConfig::from_env`]），状态机只接收解析后的值。

use std::time::Duration;

use msgsock_core::codec::DEFAULT_MAX_PAYLOAD;
use msgsock_core::{Ipv6Enabled, ReuseAddressEnabled};
use msgsock_transport::{DEFAULT_PING_TIMEOUT, FatalAcceptErrors, SocketTuning};
use thiserror::Error;

pub const ENV_MAX_MESSAGE_PAYLOAD: &str = "MSGSOCK_MAX_MESSAGE_PAYLOAD";
pub const ENV_TCP_PING_TIMEOUT: &str = "MSGSOCK_TCP_PING_TIMEOUT";
pub const ENV_SOCKET_TIME_WARN_THRESHOLD: &str = "MSGSOCK_SOCKET_TIME_WARN_THRESHOLD";
pub const ENV_ENABLE_IPV6: &str = "MSGSOCK_ENABLE_IPV6";

pub const DEFAULT_ACCEPTOR_RESTART_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_ENDPOINT_RESCAN_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_ACCEPT_QUEUE_CAPACITY: usize = 128;

/// 环境变量取值无法解析。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name}: `{value}` is not a valid {expected}")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// 套接字配置。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - `max_payload`：单条报文声明负载的上限，默认 50,000,000 字节；
/// - `tcp_ping_timeout`：保活超时，默认 30 秒，`None` 表示不调整内核保活，低于 10 秒会被抬升；
/// - `dispatch_warn_threshold`：报文分发耗时超过该值时记录告警，默认关闭；
/// - `ipv6` 默认关闭，`reuse_address` 默认开启；
/// - `fatal_accept_errors` / `acceptor_restart_backoff` / `endpoint_rescan_interval` /
///   `accept_queue_capacity` 仅供监听器使用。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocketConfig {
    max_payload: usize,
    tcp_ping_timeout: Option<Duration>,
    dispatch_warn_threshold: Option<Duration>,
    ipv6: Ipv6Enabled,
    reuse_address: ReuseAddressEnabled,
    fatal_accept_errors: FatalAcceptErrors,
    acceptor_restart_backoff: Duration,
    endpoint_rescan_interval: Duration,
    accept_queue_capacity: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            tcp_ping_timeout: Some(DEFAULT_PING_TIMEOUT),
            dispatch_warn_threshold: None,
            ipv6: Ipv6Enabled::disabled(),
            reuse_address: ReuseAddressEnabled::enabled(),
            fatal_accept_errors: FatalAcceptErrors::default(),
            acceptor_restart_backoff: DEFAULT_ACCEPTOR_RESTART_BACKOFF,
            endpoint_rescan_interval: DEFAULT_ENDPOINT_RESCAN_INTERVAL,
            accept_queue_capacity: DEFAULT_ACCEPT_QUEUE_CAPACITY,
        }
    }
}

impl SocketConfig {
    /// 从进程环境读取配置，未设置的变量保留默认值。
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// 从任意键值序列读取配置，便于测试与嵌入方注入。
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let value = value.as_ref().trim();
            match key.as_ref() {
                ENV_MAX_MESSAGE_PAYLOAD => {
                    config.max_payload = parse(ENV_MAX_MESSAGE_PAYLOAD, value, "byte count")?;
                }
                ENV_TCP_PING_TIMEOUT => {
                    let seconds: u64 = parse(ENV_TCP_PING_TIMEOUT, value, "number of seconds")?;
                    config.tcp_ping_timeout =
                        (seconds != 0).then(|| Duration::from_secs(seconds));
                }
                ENV_SOCKET_TIME_WARN_THRESHOLD => {
                    let millis: u64 =
                        parse(ENV_SOCKET_TIME_WARN_THRESHOLD, value, "number of milliseconds")?;
                    config.dispatch_warn_threshold = Some(Duration::from_millis(millis));
                }
                ENV_ENABLE_IPV6 => {
                    let disabled = value.is_empty()
                        || value == "0"
                        || value.eq_ignore_ascii_case("false");
                    config.ipv6 = Ipv6Enabled::from(!disabled);
                }
                _ => {}
            }
        }
        Ok(config)
    }

    pub fn with_max_payload(mut self, bytes: usize) -> Self {
        self.max_payload = bytes;
        self
    }

    pub fn with_tcp_ping_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tcp_ping_timeout = timeout;
        self
    }

    pub fn with_dispatch_warn_threshold(mut self, threshold: Option<Duration>) -> Self {
        self.dispatch_warn_threshold = threshold;
        self
    }

    pub fn with_ipv6(mut self, ipv6: Ipv6Enabled) -> Self {
        self.ipv6 = ipv6;
        self
    }

    pub fn with_reuse_address(mut self, reuse: ReuseAddressEnabled) -> Self {
        self.reuse_address = reuse;
        self
    }

    pub fn with_fatal_accept_errors(mut self, fatal: FatalAcceptErrors) -> Self {
        self.fatal_accept_errors = fatal;
        self
    }

    pub fn with_acceptor_restart_backoff(mut self, backoff: Duration) -> Self {
        self.acceptor_restart_backoff = backoff;
        self
    }

    pub fn with_endpoint_rescan_interval(mut self, interval: Duration) -> Self {
        self.endpoint_rescan_interval = interval;
        self
    }

    /// 尚未被 `next_connection` 取走的已接受连接上限，至少为 1。
    pub fn with_accept_queue_capacity(mut self, capacity: usize) -> Self {
        self.accept_queue_capacity = capacity.max(1);
        self
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn tcp_ping_timeout(&self) -> Option<Duration> {
        self.tcp_ping_timeout
    }

    pub fn dispatch_warn_threshold(&self) -> Option<Duration> {
        self.dispatch_warn_threshold
    }

    pub fn ipv6(&self) -> Ipv6Enabled {
        self.ipv6
    }

    pub fn reuse_address(&self) -> ReuseAddressEnabled {
        self.reuse_address
    }

    pub fn fatal_accept_errors(&self) -> &FatalAcceptErrors {
        &self.fatal_accept_errors
    }

    pub fn acceptor_restart_backoff(&self) -> Duration {
        self.acceptor_restart_backoff
    }

    pub fn endpoint_rescan_interval(&self) -> Duration {
        self.endpoint_rescan_interval
    }

    pub fn accept_queue_capacity(&self) -> usize {
        self.accept_queue_capacity
    }

    /// 建连后施加的套接字调优，保活超时在这里被抬升到下限。
    pub fn tuning(&self) -> SocketTuning {
        SocketTuning::from_ping_timeout(self.tcp_ping_timeout)
    }
}

fn parse<T: std::str::FromStr>(
    name: &'static str,
    value: &str,
    expected: &'static str,
) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_owned(),
        expected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgsock_transport::MIN_PING_TIMEOUT;

    #[test]
    fn defaults() {
        let config = SocketConfig::default();
        assert_eq!(config.max_payload(), 50_000_000);
        assert_eq!(config.tcp_ping_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.dispatch_warn_threshold(), None);
        assert!(!config.ipv6().is_enabled());
        assert!(config.reuse_address().is_enabled());
        assert_eq!(config.acceptor_restart_backoff(), Duration::from_secs(60));
    }

    #[test]
    fn reads_every_variable() {
        let config = SocketConfig::from_vars([
            (ENV_MAX_MESSAGE_PAYLOAD, "1024"),
            (ENV_TCP_PING_TIMEOUT, "45"),
            (ENV_SOCKET_TIME_WARN_THRESHOLD, "250"),
            (ENV_ENABLE_IPV6, "1"),
            ("UNRELATED", "x"),
        ])
        .expect("valid vars");
        assert_eq!(config.max_payload(), 1024);
        assert_eq!(config.tcp_ping_timeout(), Some(Duration::from_secs(45)));
        assert_eq!(
            config.dispatch_warn_threshold(),
            Some(Duration::from_millis(250))
        );
        assert!(config.ipv6().is_enabled());
    }

    #[test]
    fn zero_ping_timeout_disables_keepalive_tuning() {
        let config = SocketConfig::from_vars([(ENV_TCP_PING_TIMEOUT, "0")]).expect("valid");
        assert_eq!(config.tcp_ping_timeout(), None);
        assert_eq!(config.tuning().keepalive_interval(), None);
    }

    #[test]
    fn short_ping_timeout_is_clamped_when_tuning() {
        let config = SocketConfig::default().with_tcp_ping_timeout(Some(Duration::from_secs(1)));
        assert_eq!(config.tuning().ping_timeout(), Some(MIN_PING_TIMEOUT));
    }

    #[test]
    fn ipv6_flag_accepts_false_spellings() {
        for value in ["0", "false", "FALSE", ""] {
            let config = SocketConfig::from_vars([(ENV_ENABLE_IPV6, value)]).expect("valid");
            assert!(!config.ipv6().is_enabled(), "{value:?}");
        }
    }

    #[test]
    fn malformed_numbers_are_reported() {
        let err = SocketConfig::from_vars([(ENV_MAX_MESSAGE_PAYLOAD, "lots")]).expect_err("bad");
        assert_eq!(
            err,
            ConfigError::Invalid {
                name: ENV_MAX_MESSAGE_PAYLOAD,
                value: "lots".to_owned(),
                expected: "byte count",
            }
        );
    }
}
