use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use msgsock_core::error::{CONNECT, HANDSHAKE};
use msgsock_core::message::{SERVER_FUNCTION_AUTHENTICATE, SERVICE_SERVER};
use msgsock_core::{
    CapabilityMap, Completion, ErrorKind, Message, MessageAddress, MessageType, Promise,
    SocketError, TcpScheme, Url, aborted_error, completed, next_message_id,
};
use msgsock_transport::{ConnectedSocket, Connector, NetSocket, Network, StopSignal, TlsContext};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::SocketConfig;
use crate::receiver::receive_loop;
use crate::sender::{SendCompletion, Sender};
use crate::state::{Connected, Connecting, Disconnecting, SocketStatus, State, force_close};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

const EVENT_CAPACITY: usize = 32;

/// 报文观察者，按注册顺序在状态锁之外调用。
pub type MessageObserver = Arc<dyn Fn(&Message) + Send + Sync>;

/// 连接生命周期事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    Connected,
    /// 已连接的套接字断开；`reason` 为空表示主动断开。
    Disconnected { reason: Option<SocketError> },
}

/// 面向报文的套接字句柄。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“断开 → 建连中 → 已连接 → 拆除中”的状态机、发送队列与接收循环收拢到一个句柄上；
/// - 所有跨任务回调只持有弱引用：句柄析构后回调升级失败即静默退出，而不是访问已释放的状态。
///
/// ## 契约（What）
/// - `connect`：URL 非法或方案不受支持时返回已失败的 Future，且不访问网络；非断开状态下调用同样失败；
/// - `disconnect`：幂等；断开状态下立即完成且不触碰传输，建连中或已连接时触发停止信号，
///   返回的 Future 在传输彻底关闭后完成；
/// - `send`：仅在已连接时入队并返回 `true`，否则返回 `false` 且队列不变；
/// - 析构时若仍处于已连接状态，会同步关闭传输。
///
/// ## 实现策略（How）
/// - 状态由一把可重入锁保护，每次读写都持锁；观察者与事件通知总在释放锁之后执行，
///   容忍通知内部再次调用本句柄；
/// - 建连与握手在独立任务中运行，结果通过 [`Promise`] 交付，全部句柄丢弃时等待方收到中止错误。
pub struct MessageSocket<N: Network> {
    inner: Arc<SocketInner<N>>,
}

impl<N: Network> Clone for MessageSocket<N> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<N: Network> fmt::Debug for MessageSocket<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSocket")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .field("remote", &self.remote_endpoint())
            .finish()
    }
}

/// 不持有所有权的套接字句柄，供观察者回调引用自身所在的套接字。
pub struct WeakMessageSocket<N: Network> {
    inner: Weak<SocketInner<N>>,
}

impl<N: Network> Clone for WeakMessageSocket<N> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<N: Network> WeakMessageSocket<N> {
    pub fn upgrade(&self) -> Option<MessageSocket<N>> {
        self.inner.upgrade().map(|inner| MessageSocket { inner })
    }
}

struct SocketInner<N: Network> {
    id: u64,
    config: SocketConfig,
    connector: Connector<N>,
    state: ReentrantMutex<RefCell<State<N::Socket>>>,
    remote: Mutex<Option<Url>>,
    observers: RwLock<Vec<MessageObserver>>,
    events: broadcast::Sender<SocketEvent>,
    capabilities: Mutex<CapabilityMap>,
    capabilities_received: AtomicBool,
}

/// 建连或握手结果落地后需要在锁外执行的动作。
enum Settled {
    Connected,
    Parked,
    Failed {
        error: SocketError,
        disconnect: Promise<()>,
    },
}

enum Activation {
    Started,
    Already,
    Unavailable(SocketStatus),
}

impl<N: Network> MessageSocket<N> {
    /// 创建处于断开状态的客户端套接字。
    pub fn new(network: Arc<N>, tls: Arc<TlsContext>, config: SocketConfig) -> Self {
        let connector = Connector::new(network, tls, config.tuning());
        Self::with_connector(connector, config)
    }

    /// 以共享的连接器创建客户端套接字。
    pub fn with_connector(connector: Connector<N>, config: SocketConfig) -> Self {
        Self {
            inner: Arc::new(SocketInner::new(connector, config, State::Disconnected)),
        }
    }

    /// 包装一个刚被接受的连接：处于建连中，只执行服务端握手。
    ///
    /// 握手是否启用 TLS 由监听器的方案决定。握手完成后需调用 [`MessageSocket::ensure_reading`]
    /// 才会进入已连接状态并开始读取。
    pub fn accepted(
        connector: Connector<N>,
        config: SocketConfig,
        socket: N::Socket,
        scheme: TcpScheme,
    ) -> Self {
        let stop = StopSignal::new();
        let handshake = Promise::new();
        let state = State::Connecting(Connecting {
            stop: stop.clone(),
            established: handshake.future(),
            disconnect: Promise::new(),
            parked: None,
        });
        let inner = Arc::new(SocketInner::new(connector, config, state));
        if let Ok(peer) = socket.peer_addr() {
            *inner.remote.lock() = Some(Url::new(scheme, peer.ip().to_string(), peer.port()));
        }
        debug!(socket = inner.id, %scheme, "accepted connection");

        let weak = Arc::downgrade(&inner);
        let connector = inner.connector.clone();
        tokio::spawn(async move {
            let result = connector.handshake_accepted(socket, scheme, &stop).await;
            match weak.upgrade() {
                Some(inner) => inner.settle(result, handshake, false),
                None => {
                    handshake.set_error(aborted_error(HANDSHAKE));
                }
            }
        });
        Self { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &SocketConfig {
        &self.inner.config
    }

    pub fn status(&self) -> SocketStatus {
        self.inner.with_state(|state| state.status())
    }

    pub fn is_connected(&self) -> bool {
        self.status() == SocketStatus::Connected
    }

    /// 最近一次连接的远端 URL；服务端套接字为对端地址配上监听方案。
    pub fn remote_endpoint(&self) -> Option<Url> {
        self.inner.remote.lock().clone()
    }

    pub fn downgrade(&self) -> WeakMessageSocket<N> {
        WeakMessageSocket {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// 解析 URL 并发起连接。
    pub fn connect(&self, url: &str) -> Completion<()> {
        match Url::parse(url) {
            Ok(url) => self.connect_url(url),
            Err(err) => {
                debug!(socket = self.inner.id, url, error = %err, "rejected connect url");
                completed(Err(err.into()))
            }
        }
    }

    /// 连接到已解析的 URL。
    pub fn connect_url(&self, url: Url) -> Completion<()> {
        let inner = &self.inner;
        if url.host().is_empty() || url.port() == 0 {
            return completed(Err(SocketError::bad_address(format!(
                "{url}: host and port are required"
            ))));
        }
        let stop = StopSignal::new();
        let established = Promise::new();
        let admitted = inner.with_state(|state| match state {
            State::Disconnected => {
                *state = State::Connecting(Connecting {
                    stop: stop.clone(),
                    established: established.future(),
                    disconnect: Promise::new(),
                    parked: None,
                });
                Ok(())
            }
            other => Err(SocketError::invalid_state(format!(
                "connect requires a disconnected socket, current state is {}",
                other.status()
            ))),
        });
        if let Err(err) = admitted {
            return completed(Err(err));
        }

        *inner.remote.lock() = Some(url.clone());
        inner.reset_capabilities();
        debug!(socket = inner.id, %url, "connecting");

        let weak = Arc::downgrade(inner);
        let connector = inner.connector.clone();
        let ipv6 = inner.config.ipv6();
        let future = established.future();
        tokio::spawn(async move {
            let result = connector.connect(&url, ipv6, &stop).await;
            match weak.upgrade() {
                Some(inner) => inner.settle(result, established, true),
                None => {
                    established.set_error(aborted_error(CONNECT));
                }
            }
        });
        future
    }

    /// 断开连接，幂等。
    pub fn disconnect(&self) -> Completion<()> {
        self.inner.begin_disconnect(None)
    }

    /// 在已连接时入队一条报文。
    pub fn send(&self, message: impl Into<Arc<Message>>) -> bool {
        let message = message.into();
        let (accepted, status) = self.inner.with_state(|state| match state {
            State::Connected(connected) => (
                connected.sender.send(Arc::clone(&message)),
                SocketStatus::Connected,
            ),
            other => (false, other.status()),
        });
        if !accepted {
            warn!(
                socket = self.inner.id,
                id = message.id(),
                %status,
                "send dropped"
            );
        }
        accepted
    }

    /// 发送能力表。
    pub fn send_capabilities(&self, capabilities: &CapabilityMap) -> bool {
        let message = Message::builder(
            MessageType::Capability,
            MessageAddress::new(next_message_id(), SERVICE_SERVER, 0, 0),
        )
        .payload(capabilities.encode())
        .build();
        self.send(message)
    }

    /// 对端已声明的能力快照。
    pub fn remote_capabilities(&self) -> CapabilityMap {
        self.inner.capabilities.lock().clone()
    }

    /// 注册报文观察者。
    pub fn on_message<F>(&self, observer: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner.observers.write().push(Arc::new(observer));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.inner.events.subscribe()
    }

    /// 确保套接字处于读取状态。
    ///
    /// 建连中时等待建连或握手完成；服务端套接字在此处从停放状态进入已连接并启动接收循环。
    /// 握手失败时返回该错误，套接字停在断开状态。
    pub async fn ensure_reading(&self) -> Result<bool, SocketError> {
        let pending = self.inner.with_state(|state| match state {
            State::Connected(_) => Ok(None),
            State::Connecting(connecting) => Ok(Some(connecting.established.clone())),
            other => Err(SocketError::invalid_state(format!(
                "cannot start reading while {}",
                other.status()
            ))),
        })?;
        if let Some(established) = pending {
            established.await?;
        }

        let inner = &self.inner;
        let activation = inner.with_state(|state| match state {
            State::Connected(_) => Activation::Already,
            State::Connecting(connecting) => match connecting.parked.take() {
                Some(socket) => {
                    let disconnect = connecting.disconnect.clone();
                    *state = State::Connected(inner.activate(socket, disconnect));
                    Activation::Started
                }
                None => Activation::Unavailable(SocketStatus::Connecting),
            },
            other => Activation::Unavailable(other.status()),
        });
        match activation {
            Activation::Started => {
                debug!(socket = inner.id, "reading");
                let _ = inner.events.send(SocketEvent::Connected);
                Ok(true)
            }
            Activation::Already => Ok(true),
            Activation::Unavailable(status) => Err(SocketError::invalid_state(format!(
                "cannot start reading while {status}"
            ))),
        }
    }
}

impl<N: Network> SocketInner<N> {
    fn new(connector: Connector<N>, config: SocketConfig, state: State<N::Socket>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
            config,
            connector,
            state: ReentrantMutex::new(RefCell::new(state)),
            remote: Mutex::new(None),
            observers: RwLock::new(Vec::new()),
            events,
            capabilities: Mutex::new(CapabilityMap::new()),
            capabilities_received: AtomicBool::new(false),
        }
    }

    /// 持锁访问状态；闭包内不得调用任何外部通知。
    fn with_state<R>(&self, f: impl FnOnce(&mut State<N::Socket>) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    fn reset_capabilities(&self) {
        *self.capabilities.lock() = CapabilityMap::new();
        self.capabilities_received.store(false, Ordering::Release);
    }

    /// 落地建连（客户端）或握手（服务端）的结果。
    fn settle(
        self: &Arc<Self>,
        result: Result<ConnectedSocket<N::Socket>, SocketError>,
        established: Promise<()>,
        client: bool,
    ) {
        let settled = self.with_state(|state| {
            let State::Connecting(connecting) = state else {
                if let Ok(socket) = &result {
                    force_close(&socket.shutdown_handle());
                }
                return Err(SocketError::invalid_state(format!(
                    "connection settled while {}",
                    state.status()
                )));
            };
            let disconnect = connecting.disconnect.clone();
            match result {
                Ok(socket) if connecting.stop.is_triggered() => {
                    force_close(&socket.shutdown_handle());
                    *state = State::Disconnected;
                    Ok(Settled::Failed {
                        error: aborted_error(if client { CONNECT } else { HANDSHAKE }),
                        disconnect,
                    })
                }
                Ok(socket) if client => {
                    *state = State::Connected(self.activate(socket, disconnect));
                    Ok(Settled::Connected)
                }
                Ok(socket) => {
                    connecting.parked = Some(socket);
                    Ok(Settled::Parked)
                }
                Err(error) => {
                    *state = State::Disconnected;
                    Ok(Settled::Failed { error, disconnect })
                }
            }
        });

        match settled {
            Ok(Settled::Connected) => {
                debug!(socket = self.id, "connected");
                let _ = self.events.send(SocketEvent::Connected);
                established.set_value(());
            }
            Ok(Settled::Parked) => {
                debug!(socket = self.id, "handshake complete");
                established.set_value(());
            }
            Ok(Settled::Failed { error, disconnect }) => {
                debug!(socket = self.id, error = %error, "connection failed");
                disconnect.set_value(());
                established.set_error(error);
            }
            Err(error) => {
                established.set_error(error);
            }
        }
    }

    /// 拆分连接并启动发送队列与接收循环，返回已连接状态。
    fn activate(
        self: &Arc<Self>,
        socket: ConnectedSocket<N::Socket>,
        disconnect: Promise<()>,
    ) -> Connected<N::Socket> {
        let peer = socket.peer_addr();
        let stop = StopSignal::new();
        let (reader, writer, shutdown) = socket.into_split();

        let weak = Arc::downgrade(self);
        let on_complete: SendCompletion = Arc::new(
            move |message: &Message, result: Result<(), SocketError>| match result {
                Ok(()) => true,
                Err(error) => {
                    if !error.is_aborted() {
                        warn!(id = message.id(), error = %error, "write failed");
                        if let Some(inner) = weak.upgrade() {
                            // 拆除结果由 disconnect 的等待方观察。
                            let _ = inner.begin_disconnect(Some(error));
                        }
                    }
                    false
                }
            },
        );
        let sender = Sender::new(self.id, writer, stop.clone(), on_complete);

        let weak = Arc::downgrade(self);
        let reader = tokio::spawn(receive_loop(
            reader,
            self.config.max_payload(),
            stop.clone(),
            move |next| match weak.upgrade() {
                Some(inner) => inner.on_receive(next),
                None => false,
            },
        ));

        Connected {
            stop,
            sender,
            shutdown,
            reader,
            peer,
            disconnect,
        }
    }

    fn on_receive(self: &Arc<Self>, next: Result<&Message, SocketError>) -> bool {
        match next {
            Ok(message) => {
                self.dispatch(message);
                true
            }
            Err(error) if error.is_aborted() => false,
            Err(error) => {
                if error.kind() == ErrorKind::MalformedHeader {
                    warn!(socket = self.id, error = %error, "protocol fault");
                } else {
                    debug!(socket = self.id, error = %error, "read loop ended");
                }
                let _ = self.begin_disconnect(Some(error));
                false
            }
        }
    }

    fn dispatch(&self, message: &Message) {
        if self.absorb_capabilities(message) {
            return;
        }
        let observers = self.observers.read().clone();
        let started = Instant::now();
        for observer in &observers {
            observer(message);
        }
        let elapsed = started.elapsed();
        if let Some(threshold) = self.config.dispatch_warn_threshold()
            && elapsed > threshold
        {
            warn!(
                socket = self.id,
                id = message.id(),
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = threshold.as_millis() as u64,
                "message dispatch exceeded threshold"
            );
        }
    }

    /// 解析能力报文，返回是否已被消费。
    fn absorb_capabilities(&self, message: &Message) -> bool {
        if message.kind() == MessageType::Error {
            return false;
        }
        let capability = message.kind() == MessageType::Capability;
        let authenticate = !self.capabilities_received.load(Ordering::Acquire)
            && message.service() == SERVICE_SERVER
            && message.function() == SERVER_FUNCTION_AUTHENTICATE;
        if !capability && !authenticate {
            return false;
        }
        match CapabilityMap::decode(message.payload()) {
            Ok(map) => {
                debug!(socket = self.id, entries = map.len(), "capabilities received");
                self.capabilities.lock().merge(map);
                self.capabilities_received.store(true, Ordering::Release);
            }
            Err(err) => {
                warn!(socket = self.id, id = message.id(), error = %err, "unreadable capability map");
            }
        }
        capability
    }

    /// 发起断开并返回完成信号；由最终执行拆除的状态兑现。
    fn begin_disconnect(self: &Arc<Self>, reason: Option<SocketError>) -> Completion<()> {
        let mut torn_down = None;
        let mut released = None;
        let done = self.with_state(|state| match state {
            State::Disconnected => completed(Ok(())),
            State::Disconnecting(disconnecting) => disconnecting.done.clone(),
            State::Connecting(connecting) => match connecting.parked.take() {
                Some(socket) => {
                    force_close(&socket.shutdown_handle());
                    released = Some(connecting.disconnect.clone());
                    *state = State::Disconnected;
                    completed(Ok(()))
                }
                None => {
                    connecting.stop.trigger();
                    connecting.disconnect.future()
                }
            },
            State::Connected(connected) => {
                let done = connected.disconnect.future();
                let previous = std::mem::replace(
                    state,
                    State::Disconnecting(Disconnecting { done: done.clone() }),
                );
                if let State::Connected(connected) = previous {
                    torn_down = Some(connected);
                }
                done
            }
        });
        if let Some(disconnect) = released {
            disconnect.set_value(());
        }
        if let Some(connected) = torn_down {
            self.teardown(connected, reason);
        }
        done
    }

    /// 停止循环、强制关闭传输，待两个循环都退出后进入断开状态。
    fn teardown(self: &Arc<Self>, connected: Connected<N::Socket>, reason: Option<SocketError>) {
        debug!(
            socket = self.id,
            peer = %connected.peer,
            reason = ?reason,
            "disconnecting"
        );
        let Connected {
            stop,
            sender,
            shutdown,
            reader,
            disconnect,
            ..
        } = connected;
        stop.trigger();
        force_close(&shutdown);

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let _ = reader.await;
            sender.close().await;
            drop(sender);
            match weak.upgrade() {
                Some(inner) => inner.finish_disconnect(disconnect, reason),
                None => {
                    disconnect.set_value(());
                }
            }
        });
    }

    fn finish_disconnect(&self, disconnect: Promise<()>, reason: Option<SocketError>) {
        self.with_state(|state| {
            if matches!(state, State::Disconnecting(_)) {
                *state = State::Disconnected;
            }
        });
        debug!(socket = self.id, "disconnected");
        let _ = self.events.send(SocketEvent::Disconnected { reason });
        disconnect.set_value(());
    }
}

impl<N: Network> Drop for SocketInner<N> {
    fn drop(&mut self) {
        let state = std::mem::replace(self.state.get_mut().get_mut(), State::Disconnected);
        match state {
            State::Connected(connected) => {
                debug!(socket = self.id, "dropped while connected");
                connected.stop.trigger();
                force_close(&connected.shutdown);
                connected.disconnect.set_value(());
            }
            State::Connecting(connecting) => {
                connecting.stop.trigger();
                if let Some(socket) = connecting.parked {
                    force_close(&socket.shutdown_handle());
                }
                connecting.disconnect.set_value(());
            }
            State::Disconnecting(_) | State::Disconnected => {}
        }
    }
}
