use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use msgsock_core::error::{ACCEPT, BIND, CONFIGURE, CONNECT, LISTEN, OPEN, RESOLVE};
use msgsock_core::{ErrorKind, ReuseAddressEnabled, SocketError, map_io_error};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener as TokioTcpListener, TcpSocket, TcpStream};

use crate::network::{
    KEEPALIVE_IDLE, NetListener, NetSocket, Network, SharedShutdown, ShutdownHandle, SocketTuning,
};

const LISTEN_BACKLOG: i32 = 1024;

/// 基于 Tokio 与 socket2 的生产网络实现。
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioNetwork;

#[async_trait]
impl Network for TokioNetwork {
    type Socket = TokioSocket;
    type Listener = TokioListener;

    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, SocketError> {
        tokio::net::lookup_host((host, port))
            .await
            .map(|entries| entries.collect())
            .map_err(|err| {
                SocketError::new(
                    ErrorKind::HostNotFound,
                    RESOLVE.code,
                    format!("{} `{host}`: {err}", RESOLVE.message),
                )
                .with_io(&err)
            })
    }

    async fn connect(&self, addr: SocketAddr) -> Result<Self::Socket, SocketError> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(creation_error)?;
        let stream = socket
            .connect(addr)
            .await
            .map_err(|err| map_io_error(CONNECT, err))?;
        TokioSocket::new(stream).map_err(|err| map_io_error(CONFIGURE, err))
    }

    fn listen(
        &self,
        addr: SocketAddr,
        reuse: ReuseAddressEnabled,
    ) -> Result<Self::Listener, SocketError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(creation_error)?;
        socket
            .set_reuse_address(reuse.is_enabled())
            .map_err(|err| map_io_error(OPEN, err))?;
        socket
            .bind(&addr.into())
            .map_err(|err| map_io_error(BIND, err))?;
        socket
            .listen(LISTEN_BACKLOG)
            .map_err(|err| map_io_error(LISTEN, err))?;
        socket
            .set_nonblocking(true)
            .map_err(|err| map_io_error(LISTEN, err))?;
        let inner = TokioTcpListener::from_std(socket.into())
            .map_err(|err| map_io_error(LISTEN, err))?;
        Ok(TokioListener { inner })
    }

    fn local_interfaces(&self) -> Result<Vec<IpAddr>, SocketError> {
        if_addrs::get_if_addrs()
            .map(|interfaces| interfaces.into_iter().map(|iface| iface.ip()).collect())
            .map_err(|err| map_io_error(RESOLVE, err))
    }
}

fn creation_error(err: io::Error) -> SocketError {
    SocketError::new(
        ErrorKind::SocketCreationFailed,
        OPEN.code,
        format!("{}: {}", OPEN.message, err),
    )
    .with_io(&err)
}

/// Tokio 监听器。
#[derive(Debug)]
pub struct TokioListener {
    inner: TokioTcpListener,
}

#[async_trait]
impl NetListener for TokioListener {
    type Socket = TokioSocket;

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    async fn accept(&self) -> Result<Self::Socket, SocketError> {
        let (stream, _) = self
            .inner
            .accept()
            .await
            .map_err(|err| map_io_error(ACCEPT, err))?;
        TokioSocket::new(stream).map_err(|err| map_io_error(ACCEPT, err))
    }
}

/// Tokio TCP 连接，附带一个复制出的描述符用于强制关闭。
#[derive(Debug)]
pub struct TokioSocket {
    stream: TcpStream,
    control: Arc<DuplicatedSocket>,
}

impl TokioSocket {
    fn new(stream: TcpStream) -> io::Result<Self> {
        let control = SockRef::from(&stream).try_clone()?;
        Ok(Self {
            stream,
            control: Arc::new(DuplicatedSocket {
                socket: Mutex::new(Some(control)),
            }),
        })
    }
}

impl NetSocket for TokioSocket {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn tune(&self, tuning: &SocketTuning) -> io::Result<()> {
        self.stream.set_nodelay(tuning.nodelay())?;
        let Some(keepalive) = keepalive(tuning) else {
            return Ok(());
        };
        let sock = SockRef::from(&self.stream);
        sock.set_tcp_keepalive(&keepalive)?;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        sock.set_tcp_user_timeout(tuning.ping_timeout())?;
        Ok(())
    }

    fn shutdown_handle(&self) -> io::Result<SharedShutdown> {
        Ok(self.control.clone())
    }
}

/// 由保活超时推导内核保活参数；未设置超时时沿用内核默认。
fn keepalive(tuning: &SocketTuning) -> Option<TcpKeepalive> {
    tuning.ping_timeout()?;
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "windows"
    ))]
    let keepalive = keepalive.with_interval(tuning.keepalive_interval()?);
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd"
    ))]
    let keepalive = keepalive.with_retries(crate::network::KEEPALIVE_PROBES);
    Some(keepalive)
}

impl AsyncRead for TokioSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TokioSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// 与连接共享同一内核套接字的副本描述符。
#[derive(Debug)]
struct DuplicatedSocket {
    socket: Mutex<Option<Socket>>,
}

impl ShutdownHandle for DuplicatedSocket {
    fn shutdown(&self) -> io::Result<()> {
        match self.socket.lock().as_ref() {
            Some(socket) => socket.shutdown(Shutdown::Both),
            None => Ok(()),
        }
    }

    fn close(&self) {
        self.socket.lock().take();
    }
}
