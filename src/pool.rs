//! 连接池
//!
//! [`ConnectionPool`] 是传输连接的共享登记处：
//!
//! - [`acquire`](ConnectionPool::acquire) 找一个有资格且健康的已有连接；
//! - [`put`](ConnectionPool::put) 接纳新建立的连接，先做一次合并检查，避免对同一目标保留两条
//!   可合并的 HTTP/2 连接；
//! - [`connect`](ConnectionPool::connect) 把上面两者与逐路线的连接尝试串起来；
//! - 后台清理任务按 keep-alive 与最大空闲数驱逐空闲连接。
//!
//! 登记表的增删与分配计数的变化都在池锁内完成；任何 I/O（健康试探、关闭套接字）都在锁外进行。

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::address::{Address, Route};
use crate::config::{ConnectConfig, PoolConfig};
use crate::connection::{Allocation, State, TransportConnection};
use crate::error::{Error, User};
use crate::failure::{FailureTracker, RouteDatabase};

/// 传输连接池。克隆得到的是同一个池的句柄。
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    tracker: FailureTracker,
}

struct PoolState {
    connections: Vec<Arc<TransportConnection>>,
    sweep_scheduled: bool,
}

/// [`ConnectionPool::connect`] 的结果。
#[derive(Debug)]
pub struct Connected {
    allocation: Allocation,
    recovered: Option<Error>,
}

impl ConnectionPool {
    /// 用 `config` 创建一个空的连接池。
    pub fn new(config: PoolConfig) -> ConnectionPool {
        ConnectionPool {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(PoolState {
                    connections: Vec::new(),
                    sweep_scheduled: false,
                }),
                tracker: FailureTracker::default(),
            }),
        }
    }

    /// 池内连接共享的失败路线库，路线规划器据此推迟最近失败的路线。
    pub fn route_database(&self) -> &Arc<RouteDatabase> {
        self.shared.tracker.route_database()
    }

    /// 池内连接共享的失败记账。
    pub fn failure_tracker(&self) -> &FailureTracker {
        &self.shared.tracker
    }

    /// 为 `address` 找一个有资格承载新交换、且健康的已有连接。
    ///
    /// `routes` 用于判断能否合并到其他主机的 HTTP/2 连接；`extensive` 控制是否对
    /// 空闲已久的 HTTP/1.1 连接做读试探。试探失败的连接不再承载新交换。
    pub async fn acquire(
        &self,
        address: &Address,
        routes: Option<&[Route]>,
        extensive: bool,
    ) -> Option<Allocation> {
        loop {
            let allocation = {
                let state = self.shared.state();
                state.connections.iter().find_map(|conn| {
                    conn.try_allocate(address, routes, Arc::downgrade(&self.shared))
                })
            }?;

            let conn = allocation.connection().clone();
            if conn.is_healthy(extensive).await {
                trace!("{} reused for {}", conn.id(), address);
                conn.listener().connection_acquired(conn.id());
                return Some(allocation);
            }

            debug!("{} is unhealthy, not reusing it", conn.id());
            conn.quiesce();
            drop(allocation);
        }
    }

    /// 接纳一个刚建立的连接，并为调用方分配一个名额。
    ///
    /// 新连接是 HTTP/2 且池中已有可合并的 HTTP/2 连接时（并发建立的两条连接），
    /// 使用已有连接，新连接被关闭。
    pub fn put(
        &self,
        conn: Arc<TransportConnection>,
        routes: Option<&[Route]>,
    ) -> crate::Result<Allocation> {
        if conn.state() != State::Active {
            return Err(Error::new_user(User::NotConnected));
        }

        let weak = Arc::downgrade(&self.shared);
        let (allocation, redundant) = {
            let mut state = self.shared.state();
            let existing = if conn.is_multiplexed() {
                let address = conn.route().address();
                state
                    .connections
                    .iter()
                    .filter(|other| other.is_multiplexed())
                    .find_map(|other| other.try_allocate(address, routes, weak.clone()))
            } else {
                None
            };

            match existing {
                Some(existing) => (existing, Some(conn)),
                None => {
                    state.connections.push(conn.clone());
                    schedule_sweep(&self.shared, &mut state);
                    (conn.allocate(weak), None)
                }
            }
        };

        if let Some(redundant) = redundant {
            debug!(
                "{} coalesced onto {}, closing it",
                redundant.id(),
                allocation.connection().id()
            );
            redundant.close();
        }

        let conn = allocation.connection();
        conn.listener().connection_acquired(conn.id());
        Ok(allocation)
    }

    /// 为 `address` 取得一个连接上的分配名额。
    ///
    /// 先尝试复用；否则按顺序在 `routes` 上建立新连接（最近失败过的路线排在最后）。
    /// 某条路线失败后，只有允许重试且错误可恢复时才继续下一条。
    /// 全部失败时返回路线错误，每条路线的错误按顺序作为被抑制的错误保存。
    pub async fn connect(
        &self,
        address: &Address,
        routes: &[Route],
        config: &ConnectConfig,
    ) -> crate::Result<Connected> {
        if let Some(allocation) = self.acquire(address, Some(routes), true).await {
            return Ok(Connected {
                allocation,
                recovered: None,
            });
        }

        let database = self.route_database();
        let (preferred, postponed): (Vec<&Route>, Vec<&Route>) =
            routes.iter().partition(|route| !database.should_postpone(route));

        let mut failure: Option<Error> = None;
        for route in preferred.into_iter().chain(postponed) {
            let conn = TransportConnection::with_tracker(
                route.clone(),
                config.clone(),
                self.shared.tracker.clone(),
            );

            match conn.connect().await {
                Ok(()) => {
                    self.shared.tracker.connected(route);
                    let allocation = self.put(conn, Some(routes))?;
                    return Ok(Connected {
                        allocation,
                        recovered: failure,
                    });
                }
                Err(err) => {
                    let last = err.last_attempt().unwrap_or(&err);
                    self.shared.tracker.connect_failed(route, last);
                    let recoverable = config.retry_on_connection_failure && is_recoverable(last);
                    failure.get_or_insert_with(Error::new_route).add_attempt(err);
                    if !recoverable {
                        break;
                    }
                }
            }
        }

        Err(failure.unwrap_or_else(|| Error::new_route().with("no route to connect")))
    }

    /// 执行一次清理，返回距离下次需要清理的时长；池为空时返回 `None`。
    ///
    /// 空闲最久的连接超过 keep-alive，或空闲连接数超过上限时，驱逐它并返回零；
    /// 否则返回它距离过期的剩余时间。
    pub fn cleanup(&self, now: Instant) -> Option<Duration> {
        cleanup(&self.shared, now)
    }

    /// 关闭所有空闲连接；忙碌的连接不再承载新交换，结束后被关闭。
    ///
    /// 忙碌连接在池锁内被标记为不再承载新交换，之后释放最后一个名额时
    /// 由 `connection_became_idle` 立即移除。
    pub fn evict_all(&self) {
        let mut idle = Vec::new();
        let mut draining = Vec::new();
        {
            let mut state = self.shared.state();
            state.connections.retain(|conn| {
                let mut books = conn.books();
                if books.allocations == 0 {
                    idle.push(conn.clone());
                    return false;
                }
                if !std::mem::replace(&mut books.no_new_exchanges, true) {
                    draining.push(conn.clone());
                }
                true
            });
        }

        for conn in idle {
            conn.close();
        }
        for conn in draining {
            conn.quiesced();
        }
    }

    /// 池中的连接数。
    pub fn connection_count(&self) -> usize {
        self.shared.state().connections.len()
    }

    /// 池中空闲（没有进行中交换）的连接数。
    pub fn idle_connection_count(&self) -> usize {
        let now = Instant::now();
        self.shared
            .state()
            .connections
            .iter()
            .filter(|conn| conn.idle_duration(now).is_some())
            .count()
    }
}

impl Default for ConnectionPool {
    fn default() -> ConnectionPool {
        ConnectionPool::new(PoolConfig::default())
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.shared.config)
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 路线失败之后是否值得尝试下一条路线。
///
/// 隧道被拒、对端未通过校验、取消与用法错误换路线也不会有不同结果。
fn is_recoverable(err: &Error) -> bool {
    !(err.is_tunnel() || err.is_peer_unverified() || err.is_canceled() || err.is_user())
}

fn cleanup(shared: &Arc<Shared>, now: Instant) -> Option<Duration> {
    let keep_alive = shared.config.keep_alive;
    let evicted = {
        let mut state = shared.state();
        let mut in_use = 0;
        let mut idle = 0;
        let mut longest: Option<(usize, Duration)> = None;

        for (index, conn) in state.connections.iter().enumerate() {
            match conn.idle_duration(now) {
                None => in_use += 1,
                Some(duration) => {
                    idle += 1;
                    if longest.map_or(true, |(_, longest)| duration > longest) {
                        longest = Some((index, duration));
                    }
                }
            }
        }

        match longest {
            Some((index, duration))
                if duration >= keep_alive || idle > shared.config.max_idle_connections =>
            {
                state.connections.remove(index)
            }
            Some((_, duration)) => return Some(keep_alive - duration),
            None if in_use > 0 => return Some(keep_alive),
            None => {
                state.sweep_scheduled = false;
                return None;
            }
        }
    };

    debug!("evicting idle {}", evicted.id());
    evicted.close();
    Some(Duration::ZERO)
}

fn schedule_sweep(shared: &Arc<Shared>, state: &mut PoolState) {
    if state.sweep_scheduled {
        return;
    }
    state.sweep_scheduled = true;

    let weak = Arc::downgrade(shared);
    shared.config.exec.execute(async move {
        loop {
            let delay = match weak.upgrade() {
                Some(shared) => match cleanup(&shared, Instant::now()) {
                    Some(delay) => delay,
                    None => return,
                },
                // 池已被丢弃
                None => return,
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    });
}

/// 连接的最后一个分配名额被释放。
///
/// 已停止接新的连接，或池不保留空闲连接时，立即移除并关闭；否则确保清理任务在运行。
pub(crate) fn connection_became_idle(shared: &Arc<Shared>, conn: &Arc<TransportConnection>) {
    let removed = {
        let mut state = shared.state();
        if conn.no_new_exchanges() || shared.config.max_idle_connections == 0 {
            let before = state.connections.len();
            state.connections.retain(|other| !Arc::ptr_eq(other, conn));
            state.connections.len() != before
        } else {
            schedule_sweep(shared, &mut state);
            false
        }
    };

    if removed {
        debug!("{} idle and draining, closing it", conn.id());
        conn.close();
    }
}

impl Connected {
    /// 取得的分配名额。
    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    /// 名额所属的连接。
    pub fn connection(&self) -> &Arc<TransportConnection> {
        self.allocation.connection()
    }

    /// 成功之前在其他路线上失败的尝试；第一条路线就成功时为 `None`。
    pub fn recovered(&self) -> Option<&Error> {
        self.recovered.as_ref()
    }

    /// 取出分配名额。
    pub fn into_allocation(self) -> Allocation {
        self.allocation
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::connect::SocketFactory;
    use crate::mock::{eventually, DuplexFactory, FakeTls, RecordingListener};
    use crate::rt::{BoxSendFuture, Executor};
    use crate::tls::TlsConnect;

    /// 从不运行任务的执行器，让清理只在测试显式调用时发生。
    struct Parked;

    impl Executor<BoxSendFuture> for Parked {
        fn execute(&self, _fut: BoxSendFuture) {}
    }

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 80))
    }

    fn cleartext(factory: &DuplexFactory) -> Address {
        Address::builder("example.com", 80)
            .socket_factory(Arc::new(factory.clone()))
            .build()
            .unwrap()
    }

    fn parked(max_idle: usize, keep_alive: Duration) -> ConnectionPool {
        let mut config = PoolConfig::new();
        config
            .max_idle_connections(max_idle)
            .keep_alive(keep_alive)
            .executor(Parked);
        ConnectionPool::new(config)
    }

    async fn checkout(pool: &ConnectionPool, address: &Address) -> Connected {
        let routes = [Route::direct(address.clone(), addr(1))];
        pool.connect(address, &routes, &ConnectConfig::default())
            .await
            .expect("connect")
    }

    #[tokio::test]
    async fn idle_connection_is_reused() {
        let listener = Arc::new(RecordingListener::default());
        let mut config = ConnectConfig::default();
        config.listener(listener.clone());
        let pool = parked(5, Duration::from_secs(60));
        let address = cleartext(&DuplexFactory::silent());
        let routes = [Route::direct(address.clone(), addr(1))];

        let connected = pool.connect(&address, &routes, &config).await.expect("connect");
        assert!(connected.recovered().is_none());
        let conn = connected.connection().clone();
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(pool.idle_connection_count(), 0);

        // HTTP/1.1 连接同一时间只承载一个交换
        assert!(pool.acquire(&address, None, false).await.is_none());

        drop(connected);
        assert_eq!(pool.idle_connection_count(), 1);
        let again = pool.acquire(&address, None, true).await.expect("reuse");
        assert!(Arc::ptr_eq(again.connection(), &conn));
        assert_eq!(listener.acquired.load(Ordering::SeqCst), 2);
        assert_eq!(listener.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn draining_connection_is_removed_when_idle() {
        let pool = parked(5, Duration::from_secs(60));
        let address = cleartext(&DuplexFactory::silent());
        let connected = checkout(&pool, &address).await;
        let conn = connected.connection().clone();

        conn.quiesce();
        assert!(pool.acquire(&address, None, false).await.is_none());
        assert_eq!(pool.connection_count(), 1);

        drop(connected);
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(conn.state(), State::Closed);
    }

    #[tokio::test]
    async fn zero_max_idle_closes_on_release() {
        let pool = parked(0, Duration::from_secs(60));
        let address = cleartext(&DuplexFactory::silent());
        let connected = checkout(&pool, &address).await;
        let conn = connected.connection().clone();

        drop(connected);
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(conn.state(), State::Closed);
    }

    #[tokio::test]
    async fn unhealthy_connection_is_not_reused() {
        let pool = parked(5, Duration::from_secs(60));
        let address = cleartext(&DuplexFactory::closing());
        let mut config = ConnectConfig::default();
        config.idle_probe_threshold(Duration::ZERO);
        let routes = [Route::direct(address.clone(), addr(1))];
        drop(pool.connect(&address, &routes, &config).await.expect("connect"));

        let mut reused = 0;
        while let Some(allocation) = pool.acquire(&address, None, true).await {
            drop(allocation);
            reused += 1;
            assert!(reused < 100, "closed peer never detected");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn cleanup_evicts_past_keep_alive() {
        let keep_alive = Duration::from_secs(10);
        let pool = parked(5, keep_alive);
        let address = cleartext(&DuplexFactory::silent());
        let first = checkout(&pool, &address).await;
        let second = checkout(&pool, &address).await;
        assert!(!Arc::ptr_eq(first.connection(), second.connection()));

        let now = Instant::now();
        assert_eq!(pool.cleanup(now), Some(keep_alive));

        drop(first);
        drop(second);
        let now = Instant::now();
        let delay = pool.cleanup(now).expect("idle connections");
        assert!(delay <= keep_alive && delay > Duration::from_secs(9));

        let later = now + Duration::from_secs(11);
        assert_eq!(pool.cleanup(later), Some(Duration::ZERO));
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(pool.cleanup(later), Some(Duration::ZERO));
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(pool.cleanup(later), None);
    }

    #[tokio::test]
    async fn cleanup_evicts_longest_idle_over_limit() {
        let pool = parked(1, Duration::from_secs(60));
        let address = cleartext(&DuplexFactory::silent());
        let first = checkout(&pool, &address).await;
        let second = checkout(&pool, &address).await;
        let oldest = first.connection().clone();
        let newest = second.connection().clone();

        drop(first);
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(second);

        assert_eq!(pool.cleanup(Instant::now()), Some(Duration::ZERO));
        assert_eq!(oldest.state(), State::Closed);
        assert_eq!(newest.state(), State::Active);
        assert!(pool.cleanup(Instant::now()).expect("remaining") > Duration::ZERO);
    }

    #[tokio::test]
    async fn background_sweep_runs_on_executor() {
        let mut config = PoolConfig::new();
        config.keep_alive(Duration::from_millis(20));
        let pool = ConnectionPool::new(config);
        let address = cleartext(&DuplexFactory::silent());
        drop(checkout(&pool, &address).await);

        eventually(|| pool.connection_count() == 0).await;
    }

    #[tokio::test]
    async fn evict_all_closes_idle_and_drains_busy() {
        let pool = parked(5, Duration::from_secs(60));
        let address = cleartext(&DuplexFactory::silent());
        let busy = checkout(&pool, &address).await;
        let idle = checkout(&pool, &address).await;
        let idle_conn = idle.connection().clone();
        drop(idle);

        pool.evict_all();
        assert_eq!(idle_conn.state(), State::Closed);
        assert_eq!(pool.connection_count(), 1);
        let busy_conn = busy.connection().clone();
        assert!(busy_conn.no_new_exchanges());

        drop(busy);
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(busy_conn.state(), State::Closed);
    }

    #[tokio::test]
    async fn evict_all_closes_connection_released_concurrently() {
        let pool = parked(5, Duration::from_secs(60));
        let address = cleartext(&DuplexFactory::silent());

        for _ in 0..50 {
            let connected = checkout(&pool, &address).await;
            let conn = connected.connection().clone();
            let barrier = std::sync::Barrier::new(2);

            std::thread::scope(|s| {
                s.spawn(|| {
                    barrier.wait();
                    drop(connected);
                });
                barrier.wait();
                pool.evict_all();
            });

            assert_eq!(pool.connection_count(), 0);
            assert_eq!(conn.state(), State::Closed);
        }
    }

    #[tokio::test]
    async fn failed_route_is_postponed() {
        let pool = parked(5, Duration::from_secs(60));
        let factory = DuplexFactory::silent().refuse(addr(1));
        let address = cleartext(&factory);
        let routes = [
            Route::direct(address.clone(), addr(1)),
            Route::direct(address.clone(), addr(2)),
        ];

        let connected = pool
            .connect(&address, &routes, &ConnectConfig::default())
            .await
            .expect("second route");
        assert_eq!(connected.connection().route().socket_addr(), addr(2));
        let recovered = connected.recovered().expect("first route failed");
        assert!(recovered.is_route());
        assert_eq!(recovered.suppressed().len(), 1);
        assert!(recovered.suppressed()[0].is_route());
        assert!(recovered.suppressed()[0].suppressed()[0].is_io());
        assert!(pool.route_database().should_postpone(&routes[0]));
        assert!(!pool.route_database().should_postpone(&routes[1]));

        // 失败过的路线排到最后
        let again = pool
            .connect(&address, &routes, &ConnectConfig::default())
            .await
            .expect("connect");
        assert!(again.recovered().is_none());
        assert_eq!(factory.connects(), vec![addr(1), addr(2), addr(2)]);
    }

    #[tokio::test]
    async fn no_next_route_when_retry_disabled() {
        let pool = parked(5, Duration::from_secs(60));
        let factory = DuplexFactory::silent().refuse(addr(1));
        let address = cleartext(&factory);
        let routes = [
            Route::direct(address.clone(), addr(1)),
            Route::direct(address.clone(), addr(2)),
        ];
        let mut config = ConnectConfig::default();
        config.retry_on_connection_failure(false);

        let err = pool.connect(&address, &routes, &config).await.unwrap_err();
        assert!(err.is_route());
        assert_eq!(err.suppressed().len(), 1);
        assert_eq!(factory.connects(), vec![addr(1)]);
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn connect_without_routes_fails() {
        let pool = parked(5, Duration::from_secs(60));
        let address = cleartext(&DuplexFactory::silent());
        let err = pool
            .connect(&address, &[], &ConnectConfig::default())
            .await
            .unwrap_err();
        assert!(err.is_route());
    }

    #[tokio::test]
    async fn put_rejects_unconnected() {
        let pool = parked(5, Duration::from_secs(60));
        let address = cleartext(&DuplexFactory::silent());
        let conn = TransportConnection::new(
            Route::direct(address, addr(1)),
            ConnectConfig::default(),
        );
        let err = pool.put(conn, None).unwrap_err();
        assert!(err.is_user());
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn put_coalesces_concurrent_h2_connections() {
        let pool = parked(5, Duration::from_secs(60));
        let factory: Arc<dyn SocketFactory> = Arc::new(DuplexFactory::h2(100));
        let tls: Arc<dyn TlsConnect> = Arc::new(
            FakeTls::new()
                .for_hosts(&["a.example.com", "b.example.com"])
                .server_alpn(&[b"h2"]),
        );
        let address = |host: &str| {
            Address::builder(host, 443)
                .socket_factory(factory.clone())
                .tls(tls.clone())
                .build()
                .unwrap()
        };
        let a = address("a.example.com");
        let b = address("b.example.com");
        let b_routes = [Route::direct(b.clone(), addr(1))];

        let first = TransportConnection::new(Route::direct(a, addr(1)), ConnectConfig::default());
        first.connect().await.expect("connect a");
        eventually(|| first.allocation_limit() > 1).await;
        let first_allocation = pool.put(first.clone(), None).expect("put a");

        let second = TransportConnection::new(b_routes[0].clone(), ConnectConfig::default());
        second.connect().await.expect("connect b");
        let coalesced = pool.put(second.clone(), Some(&b_routes)).expect("put b");

        assert!(Arc::ptr_eq(coalesced.connection(), &first));
        assert_eq!(second.state(), State::Closed);
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(first.allocations(), 2);
        drop(first_allocation);
        drop(coalesced);
        assert_eq!(pool.idle_connection_count(), 1);
    }
}
