#![doc = r#"
# msgsock

## 设计动机（Why）
- **一个句柄管一条连接**：[`MessageSocket`] 把建连、握手、FIFO 发送、顺序接收与拆除收拢在同一状态机里；
- **服务端自愈**：[`ServerListener`] 在监听套接字失效后按退避重建，并在通配地址上持续发布可达端点；
- **配置只在边缘解析**：环境变量经 [`SocketConfig::from_env`] 解析一次，状态机只看到类型化的值。

## 核心契约（What）
- 客户端：`MessageSocket::new` → `connect(url)` → `send` / `on_message` → `disconnect`；
- 服务端：`ServerListener::listen(url)` → `next_connection` → 注册观察者 → `ensure_reading`；
- 所有完成信号都是可克隆的 [`Completion`](msgsock_core::Completion)，任何结束路径都恰好兑现一次。

## 风险与考量（Trade-offs）
- 观察者在接收任务中同步执行，耗时回调会推迟同一连接的下一次读取；
- 发送队列不设上限，背压由调用方根据 `send` 的返回值与连接状态自行控制。
"#]

mod config;
mod receiver;
mod sender;
mod server;
mod socket;
mod state;

pub use config::{
    ConfigError, DEFAULT_ACCEPT_QUEUE_CAPACITY, DEFAULT_ACCEPTOR_RESTART_BACKOFF, DEFAULT_ENDPOINT_RESCAN_INTERVAL,
    ENV_ENABLE_IPV6, ENV_MAX_MESSAGE_PAYLOAD, ENV_SOCKET_TIME_WARN_THRESHOLD, ENV_TCP_PING_TIMEOUT,
    SocketConfig,
};
pub use receiver::{read_message, receive_loop};
pub use sender::{SendCompletion, Sender};
pub use server::ServerListener;
pub use socket::{MessageObserver, MessageSocket, SocketEvent, WeakMessageSocket};
pub use state::SocketStatus;

/// 基于 Tokio 真实套接字的客户端与服务端类型。
#[cfg(feature = "runtime-tokio")]
pub type TcpMessageSocket = MessageSocket<msgsock_transport::TokioNetwork>;

#[cfg(feature = "runtime-tokio")]
pub type TcpServerListener = ServerListener<msgsock_transport::TokioNetwork>;
