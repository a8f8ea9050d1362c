use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use msgsock_core::{Ipv6Enabled, SocketError, Url};
use msgsock_transport::{
    AcceptLoop, AcceptOutcome, Connector, Network, Resolver, StopSignal, TlsContext, acceptable,
};
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::SocketConfig;
use crate::socket::MessageSocket;

const ACCEPT_ERROR_CAPACITY: usize = 64;

/// 服务端监听器：绑定端点、持续接受连接，并把每个连接包装成建连中的 [`MessageSocket`]。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 接入循环可能因监听套接字失效而整体退出，监听器负责在退避后原地重建，调用方只看到连接流；
/// - 绑定在通配地址时，对外可达的端点随网卡变化，需要周期性重新发布。
///
/// ## 契约（What）
/// - `listen`：解析并绑定 URL，端口 0 由系统分配，发布的端点带真实端口；
///   TLS 方案要求 [`TlsContext`] 已配置身份，否则立即失败；
/// - `next_connection`：按接受顺序返回新套接字，监听器关闭且队列耗尽后返回 `None`；
/// - 每个连接的握手方案都取自监听 URL，而非与客户端协商；
/// - 致命接受错误先广播给 `subscribe_accept_errors` 的订阅者，再在
///   `acceptor_restart_backoff` 之后重建，每个致命错误恰好安排一次重建；
/// - `close` 停止接受与重扫，已交出的套接字不受影响。
///
/// ## 风险与考量（Trade-offs）
/// - 退避期间的入站连接会被拒绝，监听器不会排队；
/// - 端点列表只在内容变化时推送，订阅方拿不到“重扫过但没变化”的信号；
/// - 待取连接数受 `accept_queue_capacity` 限制，队列满时新连接被记录后丢弃，
///   丢弃会中止其握手并关闭底层连接。
pub struct ServerListener<N: Network> {
    url: Url,
    local: SocketAddr,
    stop: StopSignal,
    connections: AsyncMutex<mpsc::Receiver<MessageSocket<N>>>,
    accept_errors: broadcast::Sender<SocketError>,
    endpoints: watch::Receiver<Vec<Url>>,
    restarts: Arc<AtomicUsize>,
}

impl<N: Network> ServerListener<N> {
    pub async fn listen(
        network: Arc<N>,
        tls: Arc<TlsContext>,
        config: SocketConfig,
        url: &str,
    ) -> Result<Self, SocketError> {
        let url = Url::parse(url)?;
        Self::listen_url(network, tls, config, url).await
    }

    pub async fn listen_url(
        network: Arc<N>,
        tls: Arc<TlsContext>,
        config: SocketConfig,
        url: Url,
    ) -> Result<Self, SocketError> {
        if url.scheme().ssl_enabled().is_enabled() {
            tls.server_config(url.scheme())?;
        }
        let stop = StopSignal::new();
        let addr = Resolver::new(Arc::clone(&network))
            .resolve_bind(&url, config.ipv6(), &stop)
            .await?;
        let acceptor = AcceptLoop::bind(
            network.as_ref(),
            addr,
            config.reuse_address(),
            config.fatal_accept_errors().clone(),
        )?;
        let local = acceptor.local_addr();
        let url = url.with_port(local.port());
        info!(%url, %local, "listening");

        let initial = published_endpoints(network.as_ref(), &url, config.ipv6())
            .unwrap_or_else(|err| {
                warn!(%url, error = %err, "interface scan failed");
                Vec::new()
            });
        let (publish, endpoints) = watch::channel(initial);
        if url.is_wildcard() {
            tokio::spawn(rescan(
                Arc::clone(&network),
                url.clone(),
                config.ipv6(),
                config.endpoint_rescan_interval(),
                publish,
                stop.clone(),
            ));
        }

        let (queue, connections) = mpsc::channel(config.accept_queue_capacity());
        let (accept_errors, _) = broadcast::channel(ACCEPT_ERROR_CAPACITY);
        let restarts = Arc::new(AtomicUsize::new(0));
        let connector = Connector::new(Arc::clone(&network), tls, config.tuning());
        let task = AcceptTask {
            network,
            connector,
            config,
            url: url.clone(),
            local,
            queue,
            accept_errors: accept_errors.clone(),
            restarts: Arc::clone(&restarts),
            stop: stop.clone(),
        };
        tokio::spawn(task.run(acceptor));

        Ok(Self {
            url,
            local,
            stop,
            connections: AsyncMutex::new(connections),
            accept_errors,
            endpoints,
            restarts,
        })
    }

    /// 监听 URL，端口为实际绑定的端口。
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// 等待下一个被接受的连接。
    pub async fn next_connection(&self) -> Option<MessageSocket<N>> {
        self.connections.lock().await.recv().await
    }

    pub fn subscribe_accept_errors(&self) -> broadcast::Receiver<SocketError> {
        self.accept_errors.subscribe()
    }

    pub fn watch_endpoints(&self) -> watch::Receiver<Vec<Url>> {
        self.endpoints.clone()
    }

    /// 当前发布的端点快照。
    pub fn endpoints(&self) -> Vec<Url> {
        self.endpoints.borrow().clone()
    }

    /// 已安排的接入循环重建次数。
    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_triggered()
    }

    /// 停止接受连接与端点重扫，可重复调用。
    pub fn close(&self) {
        if self.stop.trigger() {
            debug!(url = %self.url, "listener closed");
        }
    }
}

impl<N: Network> fmt::Debug for ServerListener<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerListener")
            .field("url", &self.url)
            .field("local", &self.local)
            .field("closed", &self.is_closed())
            .field("restarts", &self.restarts())
            .finish()
    }
}

impl<N: Network> Drop for ServerListener<N> {
    fn drop(&mut self) {
        self.stop.trigger();
    }
}

/// 接入任务持有的全部状态，不反向引用监听器句柄。
struct AcceptTask<N: Network> {
    network: Arc<N>,
    connector: Connector<N>,
    config: SocketConfig,
    url: Url,
    local: SocketAddr,
    queue: mpsc::Sender<MessageSocket<N>>,
    accept_errors: broadcast::Sender<SocketError>,
    restarts: Arc<AtomicUsize>,
    stop: StopSignal,
}

impl<N: Network> AcceptTask<N> {
    async fn run(self, mut acceptor: AcceptLoop<N::Listener>) {
        loop {
            let outcome = acceptor
                .run(|accepted| self.on_accept(accepted), &self.stop)
                .await;
            drop(acceptor);
            let fatal = match outcome {
                AcceptOutcome::Fatal(fatal) => fatal,
                finished => {
                    debug!(url = %self.url, outcome = ?finished, "accept loop finished");
                    return;
                }
            };
            let _ = self.accept_errors.send(fatal);
            acceptor = match self.rebind().await {
                Some(acceptor) => acceptor,
                None => return,
            };
        }
    }

    fn on_accept(&self, accepted: Result<N::Socket, SocketError>) -> bool {
        match accepted {
            Ok(socket) => {
                let socket = MessageSocket::accepted(
                    self.connector.clone(),
                    self.config.clone(),
                    socket,
                    self.url.scheme(),
                );
                match self.queue.try_send(socket) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(socket)) => {
                        warn!(
                            url = %self.url,
                            socket = socket.id(),
                            "accept queue full, dropping connection"
                        );
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            }
            Err(err) => {
                warn!(url = %self.url, error = %err, "accept failed");
                let _ = self.accept_errors.send(err);
                true
            }
        }
    }

    /// 退避后重新绑定同一端点；绑定失败则继续退避，停止信号到达时放弃。
    async fn rebind(&self) -> Option<AcceptLoop<N::Listener>> {
        let backoff = self.config.acceptor_restart_backoff();
        loop {
            let scheduled = self.restarts.fetch_add(1, Ordering::AcqRel) + 1;
            error!(
                url = %self.url,
                backoff_secs = backoff.as_secs(),
                restart = scheduled,
                "acceptor restart scheduled"
            );
            tokio::select! {
                _ = self.stop.stopped() => return None,
                _ = tokio::time::sleep(backoff) => {}
            }
            match AcceptLoop::bind(
                self.network.as_ref(),
                self.local,
                self.config.reuse_address(),
                self.config.fatal_accept_errors().clone(),
            ) {
                Ok(acceptor) => {
                    info!(url = %self.url, "acceptor restarted");
                    return Some(acceptor);
                }
                Err(err) => {
                    error!(url = %self.url, error = %err, "acceptor restart failed");
                    let _ = self.accept_errors.send(err);
                }
            }
        }
    }
}

/// 通配地址展开为每块网卡一个端点；具体地址原样发布。
fn published_endpoints<N: Network>(
    network: &N,
    url: &Url,
    ipv6: Ipv6Enabled,
) -> Result<Vec<Url>, SocketError> {
    if !url.is_wildcard() {
        return Ok(vec![url.clone()]);
    }
    let mut endpoints: Vec<Url> = Vec::new();
    for ip in network.local_interfaces()? {
        if !acceptable(&SocketAddr::new(ip, url.port()), ipv6) {
            continue;
        }
        let endpoint = url.with_host(ip.to_string());
        if !endpoints.contains(&endpoint) {
            endpoints.push(endpoint);
        }
    }
    Ok(endpoints)
}

async fn rescan<N: Network>(
    network: Arc<N>,
    url: Url,
    ipv6: Ipv6Enabled,
    interval: std::time::Duration,
    publish: watch::Sender<Vec<Url>>,
    stop: StopSignal,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // 第一次 tick 立即完成，初始列表已在绑定时发布。
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.stopped() => return,
            _ = ticker.tick() => {}
        }
        match published_endpoints(network.as_ref(), &url, ipv6) {
            Ok(next) => {
                let changed = publish.send_if_modified(|current| {
                    if *current == next {
                        return false;
                    }
                    *current = next;
                    true
                });
                if changed {
                    debug!(%url, endpoints = publish.borrow().len(), "endpoints republished");
                }
            }
            Err(err) => warn!(%url, error = %err, "interface scan failed"),
        }
    }
}
