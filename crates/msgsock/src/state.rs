use std::fmt;
use std::net::SocketAddr;

use msgsock_core::error::SHUTDOWN;
use msgsock_core::{Completion, Promise, SocketError, map_io_error};
use msgsock_transport::{ConnectedSocket, MessageStream, SharedShutdown, StopSignal};
use tokio::io::WriteHalf;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::sender::Sender;

/// 对外可见的连接状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl SocketStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            SocketStatus::Disconnected => "disconnected",
            SocketStatus::Connecting => "connecting",
            SocketStatus::Connected => "connected",
            SocketStatus::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for SocketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) type Writer<S> = WriteHalf<MessageStream<S>>;

/// 连接状态：任一时刻恰有一个变体有效，迁移时整体替换。
pub(crate) enum State<S> {
    Disconnected,
    Connecting(Connecting<S>),
    Connected(Connected<S>),
    Disconnecting(Disconnecting),
}

impl<S> State<S> {
    pub(crate) fn status(&self) -> SocketStatus {
        match self {
            State::Disconnected => SocketStatus::Disconnected,
            State::Connecting(_) => SocketStatus::Connecting,
            State::Connected(_) => SocketStatus::Connected,
            State::Disconnecting(_) => SocketStatus::Disconnecting,
        }
    }
}

/// 建连或握手进行中。
///
/// `disconnect` 是“断开完成”的义务：建连期间到达的断开请求拿到它的 Future，
/// 最终执行拆除的状态负责兑现。服务端套接字握手成功后，连接先停放在 `parked`，
/// 等 `ensure_reading` 取走后才开始读取。
pub(crate) struct Connecting<S> {
    pub(crate) stop: StopSignal,
    pub(crate) established: Completion<()>,
    pub(crate) disconnect: Promise<()>,
    pub(crate) parked: Option<ConnectedSocket<S>>,
}

/// 已连接：持有发送队列、接收任务与关闭句柄。
pub(crate) struct Connected<S> {
    pub(crate) stop: StopSignal,
    pub(crate) sender: Sender<Writer<S>>,
    pub(crate) shutdown: SharedShutdown,
    pub(crate) reader: JoinHandle<()>,
    pub(crate) peer: SocketAddr,
    pub(crate) disconnect: Promise<()>,
}

/// 拆除进行中，`done` 在传输彻底关闭后完成。
pub(crate) struct Disconnecting {
    pub(crate) done: Completion<()>,
}

/// 强制关闭传输，可重复调用；关闭失败只记录，句柄总会被释放。
pub(crate) fn force_close(shutdown: &SharedShutdown) {
    if let Err(err) = shutdown_both(shutdown) {
        debug!(error = %err, "shutdown failed");
    }
    shutdown.close();
}

fn shutdown_both(shutdown: &SharedShutdown) -> Result<(), SocketError> {
    shutdown
        .shutdown()
        .map_err(|err| map_io_error(SHUTDOWN, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgsock_transport::ShutdownHandle;
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Default)]
    struct NotConnected {
        closed: AtomicBool,
    }

    impl ShutdownHandle for NotConnected {
        fn shutdown(&self) -> io::Result<()> {
            Err(io::Error::from(io::ErrorKind::NotConnected))
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn failed_shutdown_still_releases_the_handle() {
        let handle = Arc::new(NotConnected::default());
        let shared: SharedShutdown = handle.clone();
        let err = shutdown_both(&shared).expect_err("peer already gone");
        assert_eq!(err.code(), SHUTDOWN.code);
        assert_eq!(err.io_kind(), Some(io::ErrorKind::NotConnected));

        force_close(&shared);
        assert!(handle.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn status_names() {
        let state: State<()> = State::Disconnected;
        assert_eq!(state.status(), SocketStatus::Disconnected);
        assert_eq!(SocketStatus::Disconnecting.to_string(), "disconnecting");
    }
}
