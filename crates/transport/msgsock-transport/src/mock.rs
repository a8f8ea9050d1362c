//! 脚本化的内存网络，用于替换真实套接字。
//!
//! - 连接以 [`tokio::io::duplex`] 管道实现，TLS 握手可以原样跑在其上；
//! - 主机解析、接受错误与网卡列表均可由测试脚本指定；
//! - 每类操作都有计数器，便于断言“从未触碰网络”。

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use msgsock_core::error::{ACCEPT, BIND, CONNECT, RESOLVE};
use msgsock_core::{ErrorKind, ReuseAddressEnabled, SocketError, aborted_error, map_io_error};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use crate::network::{NetListener, NetSocket, Network, SharedShutdown, ShutdownHandle, SocketTuning};

const DUPLEX_CAPACITY: usize = 64 * 1024;
const FIRST_EPHEMERAL_PORT: u16 = 40_000;

/// 某个主机名的解析脚本。
#[derive(Clone, Debug)]
pub enum HostScript {
    /// 按顺序返回这些地址，端口取调用方给定值。
    Resolve(Vec<IpAddr>),
    /// 解析失败。
    Fail,
    /// 永不完成，用于测试中途中止。
    Hang,
}

/// 各类操作的累计次数快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MockStats {
    pub resolves: usize,
    pub connects: usize,
    pub listens: usize,
    pub accepts: usize,
    pub tunes: usize,
    pub shutdowns: usize,
}

impl MockStats {
    /// 任何一次网络访问都会让该值大于零。
    pub fn total(&self) -> usize {
        self.resolves + self.connects + self.listens + self.accepts + self.tunes + self.shutdowns
    }
}

#[derive(Debug, Default)]
struct Counters {
    resolves: AtomicUsize,
    connects: AtomicUsize,
    listens: AtomicUsize,
    accepts: AtomicUsize,
    tunes: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

enum MockAccept {
    Connection(MockSocket),
    Error(io::ErrorKind),
}

struct Registration {
    id: u64,
    queue: mpsc::UnboundedSender<MockAccept>,
}

#[derive(Default)]
struct MockInner {
    hosts: DashMap<String, HostScript>,
    listeners: DashMap<SocketAddr, Registration>,
    interfaces: Mutex<Vec<IpAddr>>,
    counters: Arc<Counters>,
    next_port: AtomicU16,
    next_listener: AtomicU64,
}

/// 内存网络句柄，克隆后共享同一张“网络”。
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<MockInner>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为主机名指定解析脚本；未脚本化的主机若是 IP 字面量则原样返回，否则解析失败。
    pub fn script_host(&self, host: impl Into<String>, script: HostScript) {
        self.inner.hosts.insert(host.into(), script);
    }

    /// 替换 `local_interfaces` 返回的地址列表。
    pub fn set_interfaces(&self, interfaces: Vec<IpAddr>) {
        *self.inner.interfaces.lock() = interfaces;
    }

    /// 让监听在 `addr` 上的接入循环在下一次接受时收到指定错误。
    pub fn inject_accept_error(&self, addr: SocketAddr, kind: io::ErrorKind) -> bool {
        self.registration(addr)
            .map(|queue| queue.send(MockAccept::Error(kind)).is_ok())
            .unwrap_or(false)
    }

    pub fn is_listening(&self, addr: SocketAddr) -> bool {
        self.inner.listeners.contains_key(&addr)
    }

    pub fn stats(&self) -> MockStats {
        let counters = &self.inner.counters;
        MockStats {
            resolves: counters.resolves.load(Ordering::Relaxed),
            connects: counters.connects.load(Ordering::Relaxed),
            listens: counters.listens.load(Ordering::Relaxed),
            accepts: counters.accepts.load(Ordering::Relaxed),
            tunes: counters.tunes.load(Ordering::Relaxed),
            shutdowns: counters.shutdowns.load(Ordering::Relaxed),
        }
    }

    fn allocate_port(&self) -> u16 {
        FIRST_EPHEMERAL_PORT.wrapping_add(self.inner.next_port.fetch_add(1, Ordering::Relaxed))
    }

    fn registration(&self, addr: SocketAddr) -> Option<mpsc::UnboundedSender<MockAccept>> {
        let wildcard = SocketAddr::new(unspecified_like(addr.ip()), addr.port());
        self.inner
            .listeners
            .get(&addr)
            .or_else(|| self.inner.listeners.get(&wildcard))
            .map(|registration| registration.queue.clone())
    }

    fn socket(&self, io: DuplexStream, local: SocketAddr, peer: SocketAddr) -> MockSocket {
        MockSocket {
            io,
            local,
            peer,
            control: Arc::new(MockShutdown {
                counters: Arc::clone(&self.inner.counters),
            }),
            counters: Arc::clone(&self.inner.counters),
        }
    }
}

fn unspecified_like(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

fn loopback_like(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
    }
}

fn not_found(host: &str) -> SocketError {
    SocketError::new(
        ErrorKind::HostNotFound,
        RESOLVE.code,
        format!("{} `{host}`: unknown host", RESOLVE.message),
    )
}

#[async_trait]
impl Network for MockNetwork {
    type Socket = MockSocket;
    type Listener = MockListener;

    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, SocketError> {
        Counters::bump(&self.inner.counters.resolves);
        let script = self.inner.hosts.get(host).map(|entry| entry.value().clone());
        match script {
            Some(HostScript::Resolve(ips)) => Ok(ips
                .into_iter()
                .map(|ip| SocketAddr::new(ip, port))
                .collect()),
            Some(HostScript::Fail) => Err(not_found(host)),
            Some(HostScript::Hang) => std::future::pending().await,
            None => host
                .parse::<IpAddr>()
                .map(|ip| vec![SocketAddr::new(ip, port)])
                .map_err(|_| not_found(host)),
        }
    }

    async fn connect(&self, addr: SocketAddr) -> Result<Self::Socket, SocketError> {
        Counters::bump(&self.inner.counters.connects);
        let refused = || map_io_error(CONNECT, io::Error::from(io::ErrorKind::ConnectionRefused));
        let queue = self.registration(addr).ok_or_else(refused)?;
        let local = SocketAddr::new(loopback_like(addr.ip()), self.allocate_port());
        let (client_io, server_io) = tokio::io::duplex(DUPLEX_CAPACITY);
        let client = self.socket(client_io, local, addr);
        let server = self.socket(server_io, addr, local);
        queue
            .send(MockAccept::Connection(server))
            .map_err(|_| refused())?;
        Ok(client)
    }

    fn listen(
        &self,
        addr: SocketAddr,
        _reuse: ReuseAddressEnabled,
    ) -> Result<Self::Listener, SocketError> {
        Counters::bump(&self.inner.counters.listens);
        let addr = if addr.port() == 0 {
            SocketAddr::new(addr.ip(), self.allocate_port())
        } else {
            addr
        };
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let (queue, receiver) = mpsc::unbounded_channel();
        match self.inner.listeners.entry(addr) {
            Entry::Occupied(_) => {
                return Err(map_io_error(BIND, io::Error::from(io::ErrorKind::AddrInUse)));
            }
            Entry::Vacant(slot) => {
                slot.insert(Registration { id, queue });
            }
        }
        Ok(MockListener {
            addr,
            id,
            receiver: AsyncMutex::new(receiver),
            network: Arc::downgrade(&self.inner),
            counters: Arc::clone(&self.inner.counters),
        })
    }

    fn local_interfaces(&self) -> Result<Vec<IpAddr>, SocketError> {
        Ok(self.inner.interfaces.lock().clone())
    }
}

/// 内存网络上的监听器，析构时注销自身。
pub struct MockListener {
    addr: SocketAddr,
    id: u64,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<MockAccept>>,
    network: Weak<MockInner>,
    counters: Arc<Counters>,
}

#[async_trait]
impl NetListener for MockListener {
    type Socket = MockSocket;

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    async fn accept(&self) -> Result<Self::Socket, SocketError> {
        let next = self.receiver.lock().await.recv().await;
        Counters::bump(&self.counters.accepts);
        match next {
            Some(MockAccept::Connection(socket)) => Ok(socket),
            Some(MockAccept::Error(kind)) => Err(map_io_error(ACCEPT, io::Error::from(kind))),
            None => Err(aborted_error(ACCEPT)),
        }
    }
}

impl Drop for MockListener {
    fn drop(&mut self) {
        if let Some(inner) = self.network.upgrade() {
            inner
                .listeners
                .remove_if(&self.addr, |_, registration| registration.id == self.id);
        }
    }
}

/// 内存管道连接。
#[derive(Debug)]
pub struct MockSocket {
    io: DuplexStream,
    local: SocketAddr,
    peer: SocketAddr,
    control: Arc<MockShutdown>,
    counters: Arc<Counters>,
}

#[derive(Debug)]
struct MockShutdown {
    counters: Arc<Counters>,
}

impl ShutdownHandle for MockShutdown {
    fn shutdown(&self) -> io::Result<()> {
        Counters::bump(&self.counters.shutdowns);
        Ok(())
    }

    fn close(&self) {}
}

impl NetSocket for MockSocket {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }

    fn tune(&self, _tuning: &SocketTuning) -> io::Result<()> {
        Counters::bump(&self.counters.tunes);
        Ok(())
    }

    fn shutdown_handle(&self) -> io::Result<SharedShutdown> {
        Ok(self.control.clone())
    }
}

impl AsyncRead for MockSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}
