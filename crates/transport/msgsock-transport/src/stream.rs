use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio_rustls::TlsStream;

use crate::network::SharedShutdown;

/// 明文或 TLS 包装后的字节流。
#[derive(Debug)]
pub enum MessageStream<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
}

impl<S> MessageStream<S> {
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for MessageStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MessageStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Self::Plain(stream) => stream.is_write_vectored(),
            Self::Tls(stream) => stream.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// 握手完成、可以收发报文的连接。
///
/// 读写两半会分别交给接收循环与发送循环；`shutdown` 句柄留给状态机，
/// 拆除时即使两半仍被循环持有也能强制关闭底层连接。
#[derive(Debug)]
pub struct ConnectedSocket<S> {
    stream: MessageStream<S>,
    shutdown: SharedShutdown,
    peer: SocketAddr,
    local: Option<SocketAddr>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ConnectedSocket<S> {
    pub fn new(
        stream: MessageStream<S>,
        shutdown: SharedShutdown,
        peer: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Self {
        Self {
            stream,
            shutdown,
            peer,
            local,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    pub fn shutdown_handle(&self) -> SharedShutdown {
        self.shutdown.clone()
    }

    /// 拆分为读半、写半与关闭句柄。
    pub fn into_split(
        self,
    ) -> (
        ReadHalf<MessageStream<S>>,
        WriteHalf<MessageStream<S>>,
        SharedShutdown,
    ) {
        let (reader, writer) = tokio::io::split(self.stream);
        (reader, writer, self.shutdown)
    }
}
