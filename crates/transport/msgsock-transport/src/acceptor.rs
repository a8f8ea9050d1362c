use std::io;
use std::net::SocketAddr;

use msgsock_core::error::{ACCEPT, BIND};
use msgsock_core::{ReuseAddressEnabled, SocketError, map_io_error};
use tracing::{debug, error};

use crate::network::{NetListener, Network};
use crate::stop::StopSignal;

/// 会让接入循环整体拆除并延迟重建的接受错误。
///
/// 这些值与平台相关，按可配置常量处理：默认集合覆盖“监听套接字本身已失效”的情形，
/// 其余错误（如对端在排队期间重置）只报告给处理器，接入循环立即继续。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FatalAcceptErrors {
    kinds: Vec<io::ErrorKind>,
    raw_codes: Vec<i32>,
}

impl FatalAcceptErrors {
    /// 空集合：任何接受错误都不致命。
    pub fn none() -> Self {
        Self {
            kinds: Vec::new(),
            raw_codes: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: io::ErrorKind) -> Self {
        if !self.kinds.contains(&kind) {
            self.kinds.push(kind);
        }
        self
    }

    pub fn with_raw_code(mut self, code: i32) -> Self {
        if !self.raw_codes.contains(&code) {
            self.raw_codes.push(code);
        }
        self
    }

    pub fn is_fatal(&self, error: &SocketError) -> bool {
        error
            .raw_os_error()
            .is_some_and(|code| self.raw_codes.contains(&code))
            || error.io_kind().is_some_and(|kind| self.kinds.contains(&kind))
    }
}

impl Default for FatalAcceptErrors {
    fn default() -> Self {
        let set = Self::none()
            .with_kind(io::ErrorKind::InvalidInput)
            .with_kind(io::ErrorKind::PermissionDenied)
            .with_kind(io::ErrorKind::Unsupported)
            .with_kind(io::ErrorKind::ConnectionReset)
            .with_kind(io::ErrorKind::NetworkDown);
        #[cfg(unix)]
        let set = set
            .with_raw_code(libc::EBADF)
            .with_raw_code(libc::EFAULT)
            .with_raw_code(libc::ENOTSOCK)
            .with_raw_code(libc::EPROTO)
            .with_raw_code(libc::EOPNOTSUPP);
        set
    }
}

/// 接入循环结束的原因。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// 停止信号被触发。
    Stopped,
    /// 处理器返回 `false`。
    HandlerDone,
    /// 遇到致命错误，监听器需要重建。
    Fatal(SocketError),
}

/// 已绑定的监听端点与其接入循环。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - `bind`：打开 → 地址复用 → 绑定 → 监听，任一步失败都带对应错误码返回；
/// - `run`：反复接受连接并交给处理器 `FnMut(Result<Socket, SocketError>) -> bool`，
///   返回 `true` 继续；普通错误同样交给处理器；
/// - 致命错误不进入处理器，直接以 [`AcceptOutcome::Fatal`] 结束，由调用方安排重建。
pub struct AcceptLoop<L> {
    listener: L,
    local: SocketAddr,
    fatal: FatalAcceptErrors,
}

impl<L: NetListener> AcceptLoop<L> {
    pub fn bind<N>(
        network: &N,
        addr: SocketAddr,
        reuse: ReuseAddressEnabled,
        fatal: FatalAcceptErrors,
    ) -> Result<Self, SocketError>
    where
        N: Network<Listener = L>,
    {
        let listener = network.listen(addr, reuse)?;
        let local = listener
            .local_addr()
            .map_err(|err| map_io_error(BIND, err))?;
        debug!(%local, "listening");
        Ok(Self {
            listener,
            local,
            fatal,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub async fn run<F>(&self, mut handler: F, stop: &StopSignal) -> AcceptOutcome
    where
        F: FnMut(Result<L::Socket, SocketError>) -> bool,
    {
        loop {
            let accepted = stop.run(ACCEPT, self.listener.accept()).await;
            match accepted {
                Err(err) if err.is_aborted() && stop.is_triggered() => {
                    return AcceptOutcome::Stopped;
                }
                Err(err) if self.fatal.is_fatal(&err) => {
                    error!(local = %self.local, error = %err, "fatal accept error");
                    return AcceptOutcome::Fatal(err);
                }
                accepted => {
                    if !handler(accepted) {
                        return AcceptOutcome::HandlerDone;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockNetwork;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 2, 0, 1)), 9000)
    }

    #[test]
    fn default_set_matches_listener_failures() {
        let fatal = FatalAcceptErrors::default();
        let invalid = map_io_error(ACCEPT, io::Error::from(io::ErrorKind::InvalidInput));
        assert!(fatal.is_fatal(&invalid));
        let refused = map_io_error(ACCEPT, io::Error::from(io::ErrorKind::ConnectionAborted));
        assert!(!fatal.is_fatal(&refused));
        assert!(!FatalAcceptErrors::none().is_fatal(&invalid));
    }

    #[cfg(unix)]
    #[test]
    fn raw_codes_are_matched() {
        let err = map_io_error(ACCEPT, io::Error::from_raw_os_error(libc::ENOTSOCK));
        assert!(FatalAcceptErrors::default().is_fatal(&err));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn success_success_fatal_invokes_handler_twice() {
        let network = MockNetwork::new();
        let acceptor = AcceptLoop::bind(
            &network,
            addr(),
            ReuseAddressEnabled::enabled(),
            FatalAcceptErrors::default(),
        )
        .expect("bind");
        let _first = network.connect(addr()).await.expect("first");
        let _second = network.connect(addr()).await.expect("second");
        assert!(network.inject_accept_error(addr(), io::ErrorKind::InvalidInput));

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let outcome = acceptor
            .run(
                |accepted| {
                    assert!(accepted.is_ok());
                    seen.fetch_add(1, Ordering::SeqCst);
                    true
                },
                &StopSignal::new(),
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(outcome, AcceptOutcome::Fatal(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ordinary_errors_reach_the_handler() {
        let network = MockNetwork::new();
        let acceptor = AcceptLoop::bind(
            &network,
            addr(),
            ReuseAddressEnabled::enabled(),
            FatalAcceptErrors::default(),
        )
        .expect("bind");
        network.inject_accept_error(addr(), io::ErrorKind::ConnectionAborted);
        let mut errors = 0;
        let outcome = acceptor
            .run(
                |accepted| {
                    errors += usize::from(accepted.is_err());
                    false
                },
                &StopSignal::new(),
            )
            .await;
        assert_eq!(errors, 1);
        assert_eq!(outcome, AcceptOutcome::HandlerDone);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_ends_the_loop() {
        let network = MockNetwork::new();
        let acceptor = AcceptLoop::bind(
            &network,
            addr(),
            ReuseAddressEnabled::enabled(),
            FatalAcceptErrors::default(),
        )
        .expect("bind");
        let stop = StopSignal::new();
        stop.trigger();
        let outcome = acceptor.run(|_| true, &stop).await;
        assert_eq!(outcome, AcceptOutcome::Stopped);
    }
}
