use std::sync::Arc;

use msgsock_core::error::{CONFIGURE, CONNECT, HANDSHAKE};
use msgsock_core::{
    HandshakeSide, Ipv6Enabled, OperationKind, SocketError, TcpScheme, Url, aborted_error,
    map_io_error,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::network::{NetSocket, Network, SharedShutdown, SocketTuning};
use crate::resolver::Resolver;
use crate::stop::StopSignal;
use crate::stream::{ConnectedSocket, MessageStream};
use crate::tls::{TlsContext, map_handshake_error, server_name};

/// 建连与握手的统一入口。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 客户端路径（解析 → TCP 建连 → 调优 → 可选握手）与服务端路径（调优 → 可选握手）
///   收敛到同一个结果类型，状态机无需区分两者；
/// - 每个长步骤都与同一个 [`StopSignal`] 竞速，取消动作只在这里实现一次。
///
/// ## 契约（What）
/// - 成功返回 [`ConnectedSocket`]；失败返回携带步骤错误码的 [`SocketError`]；
/// - 被停止时返回 [`ErrorKind::OperationAborted`](msgsock_core::ErrorKind::OperationAborted)，
///   已经打开的套接字会先被关闭再丢弃；
/// - 调优失败只记录告警，不终止建连。
#[derive(Debug)]
pub struct Connector<N: Network> {
    network: Arc<N>,
    resolver: Resolver<N>,
    tls: Arc<TlsContext>,
    tuning: SocketTuning,
}

impl<N: Network> Clone for Connector<N> {
    fn clone(&self) -> Self {
        Self {
            network: Arc::clone(&self.network),
            resolver: self.resolver.clone(),
            tls: Arc::clone(&self.tls),
            tuning: self.tuning,
        }
    }
}

impl<N: Network> Connector<N> {
    pub fn new(network: Arc<N>, tls: Arc<TlsContext>, tuning: SocketTuning) -> Self {
        Self {
            resolver: Resolver::new(Arc::clone(&network)),
            network,
            tls,
            tuning,
        }
    }

    pub fn network(&self) -> &Arc<N> {
        &self.network
    }

    pub fn tls(&self) -> &Arc<TlsContext> {
        &self.tls
    }

    /// 客户端路径：解析目标、建立 TCP 连接，再按方案决定是否握手。
    pub async fn connect(
        &self,
        url: &Url,
        ipv6: Ipv6Enabled,
        stop: &StopSignal,
    ) -> Result<ConnectedSocket<N::Socket>, SocketError> {
        let endpoint = self.resolver.resolve(url, ipv6, stop).await?;
        let socket = stop.run(CONNECT, self.network.connect(endpoint)).await?;
        debug!(%url, %endpoint, "tcp connected");
        self.finish(socket, HandshakeSide::Client, url.scheme(), Some(url.host()), stop)
            .await
    }

    /// 服务端路径：复用已接受的套接字，只做调优与可选握手。
    pub async fn handshake_accepted(
        &self,
        socket: N::Socket,
        scheme: TcpScheme,
        stop: &StopSignal,
    ) -> Result<ConnectedSocket<N::Socket>, SocketError> {
        self.finish(socket, HandshakeSide::Server, scheme, None, stop)
            .await
    }

    async fn finish(
        &self,
        socket: N::Socket,
        side: HandshakeSide,
        scheme: TcpScheme,
        host: Option<&str>,
        stop: &StopSignal,
    ) -> Result<ConnectedSocket<N::Socket>, SocketError> {
        if let Err(err) = socket.tune(&self.tuning) {
            warn!(error = %err, "socket tuning failed");
        }
        let shutdown = socket
            .shutdown_handle()
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let peer = socket
            .peer_addr()
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let local = socket.local_addr().ok();

        if !scheme.ssl_enabled().is_enabled() {
            if stop.is_triggered() {
                return Err(abort(&shutdown, HANDSHAKE));
            }
            return Ok(ConnectedSocket::new(
                MessageStream::Plain(socket),
                shutdown,
                peer,
                local,
            ));
        }

        let handshake = self.handshake(socket, side, scheme, host);
        match stop.run(HANDSHAKE, handshake).await {
            Ok(stream) => {
                debug!(%peer, ?side, %scheme, "tls handshake complete");
                Ok(ConnectedSocket::new(stream, shutdown, peer, local))
            }
            Err(err) => {
                close(&shutdown);
                Err(err)
            }
        }
    }

    async fn handshake(
        &self,
        socket: N::Socket,
        side: HandshakeSide,
        scheme: TcpScheme,
        host: Option<&str>,
    ) -> Result<MessageStream<N::Socket>, SocketError> {
        let stream = match side {
            HandshakeSide::Client => {
                let name = server_name(host.unwrap_or_default())?;
                let connector = TlsConnector::from(self.tls.client_config(scheme)?);
                let stream = connector
                    .connect(name, socket)
                    .await
                    .map_err(map_handshake_error)?;
                tokio_rustls::TlsStream::Client(stream)
            }
            HandshakeSide::Server => {
                let acceptor = TlsAcceptor::from(self.tls.server_config(scheme)?);
                let stream = acceptor.accept(socket).await.map_err(map_handshake_error)?;
                tokio_rustls::TlsStream::Server(stream)
            }
        };
        Ok(MessageStream::Tls(Box::new(stream)))
    }
}

fn close(shutdown: &SharedShutdown) {
    let _ = shutdown.shutdown();
    shutdown.close();
}

fn abort(shutdown: &SharedShutdown, kind: OperationKind) -> SocketError {
    close(shutdown);
    aborted_error(kind)
}
