use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use msgsock_core::{ReuseAddressEnabled, SocketError};
use tokio::io::{AsyncRead, AsyncWrite};

/// 保活超时的下限；更小的值会被抬升到该值。
pub const MIN_PING_TIMEOUT: Duration = Duration::from_secs(10);
/// 默认保活超时。
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(30);
/// 连接空闲多久后开始发送保活探测。
pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);
/// 判定连接失效前允许丢失的探测次数。
pub const KEEPALIVE_PROBES: u32 = 10;

/// 建连后统一施加的套接字调优。
///
/// 始终关闭 Nagle 合并；若给出保活超时，则按“超时 / 探测次数”推导探测间隔。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SocketTuning {
    ping_timeout: Option<Duration>,
}

impl SocketTuning {
    /// 根据保活超时构造调优参数，`None` 表示沿用内核默认保活策略。
    pub fn from_ping_timeout(timeout: Option<Duration>) -> Self {
        Self {
            ping_timeout: timeout.map(|timeout| timeout.max(MIN_PING_TIMEOUT)),
        }
    }

    pub fn nodelay(&self) -> bool {
        true
    }

    pub fn ping_timeout(&self) -> Option<Duration> {
        self.ping_timeout
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.ping_timeout.map(|timeout| timeout / KEEPALIVE_PROBES)
    }
}

impl Default for SocketTuning {
    fn default() -> Self {
        Self::from_ping_timeout(Some(DEFAULT_PING_TIMEOUT))
    }
}

/// 与读写半部分离的关闭句柄。
///
/// 发送循环与接收循环各自持有流的一半时，拆除路径仍需能强制关闭底层连接。
pub trait ShutdownHandle: Send + Sync + fmt::Debug {
    /// 关闭双向数据流。
    fn shutdown(&self) -> io::Result<()>;
    /// 释放句柄自身持有的资源，可重复调用。
    fn close(&self);
}

pub type SharedShutdown = Arc<dyn ShutdownHandle>;

/// 已建立的字节流连接。
pub trait NetSocket: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// 施加 [`SocketTuning`]，只能在连接建立之后调用。
    fn tune(&self, tuning: &SocketTuning) -> io::Result<()>;

    fn shutdown_handle(&self) -> io::Result<SharedShutdown>;
}

/// 处于监听状态的套接字。
#[async_trait]
pub trait NetListener: Send + Sync + 'static {
    type Socket: NetSocket;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    async fn accept(&self) -> Result<Self::Socket, SocketError>;
}

/// 可替换的底层网络能力。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 状态机、连接器与接入循环只依赖该 trait，生产环境使用真实套接字，测试则替换为脚本化的内存网络；
/// - TLS 包装建立在 [`NetSocket`] 的 `AsyncRead + AsyncWrite` 之上，因此测试替身同样能跑真实握手。
///
/// ## 契约（What）
/// - `resolve`：主机名 + 端口 → 有序候选地址；
/// - `connect`：建立 TCP 连接，无法创建套接字时返回
///   [`ErrorKind::SocketCreationFailed`](msgsock_core::ErrorKind::SocketCreationFailed)；
/// - `listen`：依次执行打开 → 设置地址复用 → 绑定 → 监听，任一步失败都带上对应步骤的错误码；
/// - `local_interfaces`：本机网卡地址，用于通配地址监听时发布具体端点。
#[async_trait]
pub trait Network: Send + Sync + 'static {
    type Socket: NetSocket;
    type Listener: NetListener<Socket = Self::Socket>;

    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, SocketError>;

    async fn connect(&self, addr: SocketAddr) -> Result<Self::Socket, SocketError>;

    fn listen(
        &self,
        addr: SocketAddr,
        reuse: ReuseAddressEnabled,
    ) -> Result<Self::Listener, SocketError>;

    fn local_interfaces(&self) -> Result<Vec<IpAddr>, SocketError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_timeout_is_clamped() {
        let tuning = SocketTuning::from_ping_timeout(Some(Duration::from_secs(2)));
        assert_eq!(tuning.ping_timeout(), Some(MIN_PING_TIMEOUT));
        assert_eq!(tuning.keepalive_interval(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn keepalive_can_be_left_to_the_kernel() {
        let tuning = SocketTuning::from_ping_timeout(None);
        assert!(tuning.nodelay());
        assert_eq!(tuning.keepalive_interval(), None);
    }

    #[test]
    fn default_interval_splits_timeout_across_probes() {
        assert_eq!(
            SocketTuning::default().keepalive_interval(),
            Some(Duration::from_secs(3))
        );
    }
}
