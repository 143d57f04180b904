//! 传输连接
//!
//! [`TransportConnection`] 是连接复用的基本单位：它拥有一条原始套接字，按需在其上
//! 建立代理隧道与 TLS，协商应用层协议，对 HTTP/2 再启动一个多路复用会话。
//!
//! 建立过程只走一次，状态严格按下面的顺序推进（方括号内的步骤视路线与地址而定）：
//!
//! ```text
//! Idle -> SocketConnecting -> [TunnelNegotiating] -> [TlsHandshaking]
//!      -> ProtocolNegotiated -> Active -> Quiescing -> Closed
//! ```
//!
//! 协商结果（协议、握手、传输）在连接成功后一次性写入，之后只读；
//! 会被并发修改的只有记账字段（分配数、失败计数、`no_new_exchanges` 等），
//! 由连接自己的锁保护。连接池持有池锁时可以再获取连接锁，反之不行。

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use tokio::time::Instant;

use crate::address::{Address, Protocol, Route};
use crate::codec::{Codec, Http1Transport, Http2Transport};
use crate::common::io::{BufferedStream, CancelHandle};
use crate::config::ConnectConfig;
use crate::error::{Error, User};
use crate::failure::FailureTracker;
use crate::listener::ConnectionListener;
use crate::pool;
use crate::proto::h2::{Session, SessionObserver};
use crate::rt::BoxedIo;
use crate::tls::{Handshake, HostnameVerifier};

mod establish;

/// 进程内唯一的连接编号，用于日志与事件关联。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> ConnectionId {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// 编号的数值。
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// 连接的生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// 尚未开始连接
    Idle,
    /// 正在打开原始套接字（含 SOCKS 握手）
    SocketConnecting,
    /// 正在通过 HTTP 代理建立 CONNECT 隧道
    TunnelNegotiating,
    /// 正在进行 TLS 握手与对端校验
    TlsHandshaking,
    /// 应用层协议已确定
    ProtocolNegotiated,
    /// 可以承载交换
    Active,
    /// 不再承载新交换，进行中的交换继续完成
    Quiescing,
    /// 已关闭，终态
    Closed,
}

/// 一条已建立（或正在建立）的传输连接。
///
/// 通过 [`TransportConnection::new`] 创建，调用一次 [`connect`](TransportConnection::connect)
/// 完成建立。通常由 [`ConnectionPool`](crate::pool::ConnectionPool) 管理。
pub struct TransportConnection {
    id: ConnectionId,
    route: Route,
    config: ConnectConfig,
    tracker: FailureTracker,
    connect_started: AtomicBool,
    /// 协商结果，连接成功时写入一次
    link: OnceLock<Link>,
    cancel: CancelHandle,
    books: Mutex<Books>,
}

struct Link {
    protocol: Protocol,
    handshake: Option<Handshake>,
    transport: Transport,
}

enum Transport {
    /// 独占的缓冲流；编解码器使用期间被取走
    Http1(Mutex<Option<BufferedStream<BoxedIo>>>),
    Http2(Session),
}

/// 连接的可变记账，由连接锁保护。
pub(crate) struct Books {
    pub(crate) state: State,
    pub(crate) allocations: usize,
    pub(crate) allocation_limit: usize,
    pub(crate) no_new_exchanges: bool,
    pub(crate) route_failure_count: usize,
    pub(crate) success_count: usize,
    pub(crate) refused_stream_count: usize,
    pub(crate) idle_since: Instant,
}

impl Books {
    fn can_allocate(&self) -> bool {
        self.state == State::Active
            && !self.no_new_exchanges
            && self.allocations < self.allocation_limit
    }
}

impl TransportConnection {
    /// 为 `route` 创建一个尚未连接的传输连接。
    ///
    /// 失败路线记录在连接私有的路线库中；由连接池创建的连接共享池的路线库。
    pub fn new(route: Route, config: ConnectConfig) -> Arc<TransportConnection> {
        TransportConnection::with_tracker(route, config, FailureTracker::default())
    }

    pub(crate) fn with_tracker(
        route: Route,
        config: ConnectConfig,
        tracker: FailureTracker,
    ) -> Arc<TransportConnection> {
        Arc::new(TransportConnection {
            id: ConnectionId::next(),
            route,
            config,
            tracker,
            connect_started: AtomicBool::new(false),
            link: OnceLock::new(),
            cancel: CancelHandle::new(),
            books: Mutex::new(Books {
                state: State::Idle,
                allocations: 0,
                allocation_limit: 1,
                no_new_exchanges: false,
                route_failure_count: 0,
                success_count: 0,
                refused_stream_count: 0,
                idle_since: Instant::now(),
            }),
        })
    }

    pub(crate) fn books(&self) -> MutexGuard<'_, Books> {
        self.books.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 迁移到 `state` 并通知监听器。`Closed` 是终态，之后的迁移被忽略。
    fn set_state(&self, state: State) {
        {
            let mut books = self.books();
            if books.state == State::Closed || books.state == state {
                return;
            }
            books.state = state;
        }
        trace!("{} {:?}", self.id, state);
        self.config.listener.state_changed(self.id, &self.route, state);
    }

    // ===== 资格与健康 =====

    /// 该连接能否为 `address` 承载一个新交换。
    ///
    /// 主机相同时只要求有空闲分配名额且未停止接新；主机不同时（连接合并）还要求：
    /// HTTP/2 连接、`routes` 中有一条与本连接相同 IP 的直连路线、
    /// 目标使用标准主机名校验器、已协商的证书覆盖新主机，且证书固定接受新主机。
    pub fn is_eligible(&self, address: &Address, routes: Option<&[Route]>) -> bool {
        let link = match self.link.get() {
            Some(link) => link,
            None => return false,
        };
        if !self.books().can_allocate() {
            return false;
        }
        self.covers(link, address, routes)
    }

    fn covers(&self, link: &Link, address: &Address, routes: Option<&[Route]>) -> bool {
        let own = self.route.address();
        if !own.equals_non_host(address) {
            return false;
        }
        if own.host() == address.host() {
            return true;
        }

        // 以下是连接合并
        if !link.protocol.is_multiplexed() {
            return false;
        }
        match routes {
            Some(routes) if self.shares_direct_ip(routes) => {}
            _ => return false,
        }
        if !address.hostname_verifier().is_standard() {
            return false;
        }
        let handshake = match link.handshake {
            Some(ref handshake) => handshake,
            None => return false,
        };
        if !HostnameVerifier::Standard.verify(address.host(), handshake) {
            return false;
        }
        address
            .certificate_pinner()
            .check(address.host(), &handshake.peer_certificates)
            .is_ok()
    }

    fn shares_direct_ip(&self, candidates: &[Route]) -> bool {
        self.route.proxy().is_direct()
            && candidates.iter().any(|candidate| {
                candidate.proxy().is_direct() && candidate.socket_addr() == self.route.socket_addr()
            })
    }

    /// 在连接池锁内原子地检查资格并占用一个分配名额。
    pub(crate) fn try_allocate(
        self: &Arc<Self>,
        address: &Address,
        routes: Option<&[Route]>,
        pool: Weak<pool::Shared>,
    ) -> Option<Allocation> {
        let link = self.link.get()?;
        if !self.covers(link, address, routes) {
            return None;
        }
        {
            let mut books = self.books();
            if !books.can_allocate() {
                return None;
            }
            books.allocations += 1;
        }
        Some(Allocation {
            conn: self.clone(),
            pool,
        })
    }

    /// 为刚建立的连接占用一个分配名额，不检查资格。
    pub(crate) fn allocate(self: &Arc<Self>, pool: Weak<pool::Shared>) -> Allocation {
        self.books().allocations += 1;
        Allocation {
            conn: self.clone(),
            pool,
        }
    }

    /// 连接是否仍然可用。
    ///
    /// 已取消或已关闭的连接不健康；HTTP/2 连接询问会话本身（驱动任务存活、保活 PING 未超时）。
    /// HTTP/1.1 连接在 `extensive` 为真且已空闲超过阈值时，会用很短的读超时试探一次，
    /// 以发现对端已半关闭的套接字，试探不消耗数据，也不改变原有的读超时。
    pub async fn is_healthy(&self, extensive: bool) -> bool {
        if self.cancel.is_canceled() {
            return false;
        }
        let (idle_since, no_new_exchanges) = {
            let books = self.books();
            if books.state == State::Closed {
                return false;
            }
            (books.idle_since, books.no_new_exchanges)
        };
        let link = match self.link.get() {
            Some(link) => link,
            None => return false,
        };

        let slot = match link.transport {
            Transport::Http2(ref session) => return session.is_healthy(),
            Transport::Http1(ref slot) => slot,
        };
        if !extensive || idle_since.elapsed() < self.config.idle_probe_threshold {
            return true;
        }

        let mut borrowed = Borrowed::take(slot);
        match borrowed.stream {
            Some(ref mut stream) => stream.probe_healthy(self.config.health_probe_timeout).await,
            // 流被编解码器取走，无法试探
            None => !no_new_exchanges,
        }
    }

    // ===== 编解码器 =====

    /// 为 `allocation` 上的一个交换创建编解码器入口。
    ///
    /// HTTP/1.1 交出独占的缓冲流并应用 `config` 中的读写超时；
    /// HTTP/2 交出会话的 `SendRequest` 句柄。
    pub fn new_codec(&self, allocation: Allocation, config: &ConnectConfig) -> crate::Result<Codec> {
        debug_assert!(std::ptr::eq(&*allocation.conn, self));
        let link = self
            .link
            .get()
            .ok_or_else(|| Error::new_user(User::NotConnected))?;

        match link.transport {
            Transport::Http1(ref slot) => {
                let mut stream = lock(slot)
                    .take()
                    .ok_or_else(|| Error::new_user(User::NotConnected).with("stream is in use"))?;
                stream.set_read_timeout(config.read_timeout);
                stream.set_write_timeout(config.write_timeout);
                Ok(Codec::Http1(Http1Transport::new(stream, allocation)))
            }
            Transport::Http2(ref session) => {
                let tx = match session.send_request() {
                    Some(tx) if session.is_healthy() => tx,
                    _ => return Err(Error::new_shutdown()),
                };
                Ok(Codec::Http2(Http2Transport::new(tx, allocation)))
            }
        }
    }

    /// HTTP/1.1 交换结束后归还缓冲流。
    pub(crate) fn restore_stream(&self, stream: BufferedStream<BoxedIo>) {
        if let Some(Link {
            transport: Transport::Http1(ref slot),
            ..
        }) = self.link.get()
        {
            if self.books().state != State::Closed {
                *lock(slot) = Some(stream);
            }
        }
    }

    pub(crate) fn listener(&self) -> &dyn ConnectionListener {
        &*self.config.listener
    }

    pub(crate) fn record_success(&self) {
        self.books().success_count += 1;
    }

    pub(crate) fn track_failure(&self, err: &Error) {
        self.tracker.track_failure(self, err);
    }

    // ===== 关闭 =====

    /// 停止承载新交换，进行中的交换继续完成。
    pub fn quiesce(&self) {
        let first = {
            let mut books = self.books();
            !std::mem::replace(&mut books.no_new_exchanges, true)
        };
        if first {
            self.quiesced();
        }
    }

    /// `no_new_exchanges` 刚被置位后调用，必须在连接锁之外。
    pub(crate) fn quiesced(&self) {
        debug!("{} no new exchanges", self.id);
        if let Some(Link {
            transport: Transport::Http2(ref session),
            ..
        }) = self.link.get()
        {
            session.shutdown_gracefully();
        }
        if self.books().state == State::Active {
            self.set_state(State::Quiescing);
        }
    }

    /// 立即取消：唤醒并中止套接字上所有挂起的读写，停止 HTTP/2 驱动任务。
    ///
    /// 不等待进行中的交换。可以在任何时刻、从任何任务调用，包括连接建立期间。
    pub fn cancel(&self) {
        debug!("{} canceled", self.id);
        self.cancel.cancel();
        if let Some(Link {
            transport: Transport::Http2(ref session),
            ..
        }) = self.link.get()
        {
            session.cancel();
        }
        self.set_state(State::Closed);
    }

    /// 关闭连接：取消所有 I/O 并释放套接字。
    pub fn close(&self) {
        self.books().no_new_exchanges = true;
        self.cancel();
        if let Some(Link {
            transport: Transport::Http1(ref slot),
            ..
        }) = self.link.get()
        {
            let stream = lock(slot).take();
            drop(stream);
        }
    }

    // ===== 访问器 =====

    /// 连接编号。
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// 连接使用的路线。
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// 协商出的应用层协议；连接完成前为 `None`。
    pub fn protocol(&self) -> Option<Protocol> {
        self.link.get().map(|link| link.protocol)
    }

    /// TLS 握手结果；明文连接或连接完成前为 `None`。
    pub fn handshake(&self) -> Option<&Handshake> {
        self.link.get().and_then(|link| link.handshake.as_ref())
    }

    /// 当前状态。
    pub fn state(&self) -> State {
        self.books().state
    }

    /// 是否为多路复用（HTTP/2）连接。
    pub fn is_multiplexed(&self) -> bool {
        self.protocol().map_or(false, |p| p.is_multiplexed())
    }

    /// 允许的最大并发交换数。
    ///
    /// 初始为 1，只会被 HTTP/2 会话的 SETTINGS 回调更新。
    pub fn allocation_limit(&self) -> usize {
        self.books().allocation_limit
    }

    /// 当前进行中的交换数。
    pub fn allocations(&self) -> usize {
        self.books().allocations
    }

    /// 是否已停止承载新交换。
    pub fn no_new_exchanges(&self) -> bool {
        self.books().no_new_exchanges
    }

    /// 被计入路线的失败次数。
    pub fn route_failure_count(&self) -> usize {
        self.books().route_failure_count
    }

    /// 成功完成的交换数。
    pub fn success_count(&self) -> usize {
        self.books().success_count
    }

    /// 连接在 `now` 时已空闲的时长；有进行中的交换时为 `None`。
    pub fn idle_duration(&self, now: Instant) -> Option<Duration> {
        let books = self.books();
        if books.allocations > 0 {
            return None;
        }
        Some(now.saturating_duration_since(books.idle_since))
    }

    #[cfg(test)]
    pub(crate) fn new_multiplexed_for_test(route: Route, config: ConnectConfig) -> Arc<TransportConnection> {
        let conn = TransportConnection::new(route, config);
        let _ = conn.link.set(Link {
            protocol: Protocol::Http2,
            handshake: None,
            transport: Transport::Http1(Mutex::new(None)),
        });
        conn.books().state = State::Active;
        conn
    }
}

impl SessionObserver for TransportConnection {
    fn on_settings_updated(&self, max_concurrent_streams: usize) {
        self.books().allocation_limit = max_concurrent_streams;
        trace!("{} allocation limit {}", self.id, max_concurrent_streams);
    }
}

impl fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let books = self.books();
        f.debug_struct("TransportConnection")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("protocol", &self.link.get().map(|link| link.protocol))
            .field("state", &books.state)
            .field("allocations", &books.allocations)
            .field("allocation_limit", &books.allocation_limit)
            .field("no_new_exchanges", &books.no_new_exchanges)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 健康试探期间从连接中借出缓冲流，离开作用域时归还。
struct Borrowed<'a> {
    slot: &'a Mutex<Option<BufferedStream<BoxedIo>>>,
    stream: Option<BufferedStream<BoxedIo>>,
}

impl<'a> Borrowed<'a> {
    fn take(slot: &'a Mutex<Option<BufferedStream<BoxedIo>>>) -> Borrowed<'a> {
        let stream = lock(slot).take();
        Borrowed { slot, stream }
    }
}

impl Drop for Borrowed<'_> {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            *lock(self.slot) = Some(stream);
        }
    }
}

// ===== impl Allocation =====

/// 连接上的一个分配名额，代表一个进行中的交换。
///
/// 丢弃即释放名额；连接因此变为空闲时通知所属的连接池。
pub struct Allocation {
    conn: Arc<TransportConnection>,
    pool: Weak<pool::Shared>,
}

impl Allocation {
    /// 名额所属的连接。
    pub fn connection(&self) -> &Arc<TransportConnection> {
        &self.conn
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        let became_idle = {
            let mut books = self.conn.books();
            books.allocations = books.allocations.saturating_sub(1);
            if books.allocations == 0 {
                books.idle_since = Instant::now();
                true
            } else {
                false
            }
        };
        trace!("{} released", self.conn.id);
        self.conn.config.listener.connection_released(self.conn.id);

        if became_idle {
            if let Some(pool) = self.pool.upgrade() {
                pool::connection_became_idle(&pool, &self.conn);
            }
        }
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("connection", &self.conn.id)
            .finish()
    }
}
