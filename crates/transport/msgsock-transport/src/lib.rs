#![doc = r#"
# msgsock-transport

## 设计动机（Why）
- **可替换的网络**：状态机只依赖 [`Network`] trait，生产环境走 Tokio 套接字，测试替换为脚本化的内存网络；
- **集中取消**：解析、建连、握手、接受连接共用一个 [`StopSignal`]，取消动作只在 [`Connector`] 与 [`AcceptLoop`] 中实现；
- **证书热替换**：[`TlsContext`] 通过 `ArcSwap` 保存身份，新连接即时使用替换后的证书。

## 核心契约（What）
- [`Resolver`]：URL → 首个可接受端点，按 IPv6 开关过滤；
- [`Connector`]：客户端路径（解析 + 建连 + 调优 + 可选握手）与服务端路径（调优 + 可选握手）收敛为 [`ConnectedSocket`]；
- [`AcceptLoop`]：绑定监听端点并持续接受连接，致命错误以 [`AcceptOutcome::Fatal`] 交还调用方；
- [`verify_mode`]：按握手角色与方案决定是否校验对端证书。

## 实现策略（How）
- `rustls` + `tokio-rustls` 完成握手，显式使用 `ring` 提供者；
- `socket2` 设置地址复用、保活与用户超时，`if-addrs` 枚举本机网卡。

## 风险与考量（Trade-offs）
- 内存网络不模拟 TCP 半关闭与内核保活，只保证字节流语义与错误注入；
- 致命接受错误集合与平台相关，由 [`FatalAcceptErrors`] 提供可配置的默认值。
"#]
#![cfg_attr(
    not(feature = "runtime-tokio"),
    doc = r#"## 功能开关：`runtime-tokio`

默认启用基于 Tokio 与 socket2 的真实网络实现。禁用后仍可使用 trait、连接器与内存网络，
但不会链接真实套接字代码。
"#
)]

mod acceptor;
mod connector;
mod network;
mod resolver;
mod stop;
mod stream;
mod tls;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;
#[cfg(feature = "runtime-tokio")]
mod tokio_net;

pub use acceptor::{AcceptLoop, AcceptOutcome, FatalAcceptErrors};
pub use connector::Connector;
pub use network::{
    DEFAULT_PING_TIMEOUT, KEEPALIVE_IDLE, KEEPALIVE_PROBES, MIN_PING_TIMEOUT, NetListener,
    NetSocket, Network, SharedShutdown, ShutdownHandle, SocketTuning,
};
pub use resolver::{Resolver, acceptable};
pub use stop::StopSignal;
pub use stream::{ConnectedSocket, MessageStream};
pub use tls::{TlsContext, TlsIdentity, VerifyMode, map_handshake_error, server_name, verify_mode};

#[cfg(feature = "runtime-tokio")]
pub use tokio_net::{TokioListener, TokioNetwork, TokioSocket};
