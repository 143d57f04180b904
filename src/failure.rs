//! 失败记账
//!
//! - [`RouteDatabase`] 记住最近连接失败的路线，路线规划器据此把它们排到最后；
//! - [`FailureTracker`] 根据交换失败的类型决定连接是否应停止承载新交换。
//!
//! 锁顺序：连接池锁 → 连接记账锁 → 路线库锁。

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::address::Route;
use crate::connection::TransportConnection;
use crate::Error;

/// 失败路线的黑名单。
///
/// 某条路线连接失败后被记入；之后在这条路线上连接成功会把它移除。
#[derive(Default)]
pub struct RouteDatabase {
    failed: Mutex<HashSet<Route>>,
}

impl RouteDatabase {
    /// 创建空的路线库。
    pub fn new() -> RouteDatabase {
        RouteDatabase::default()
    }

    /// 记录一次到 `route` 的连接失败。
    pub fn failed(&self, route: &Route) {
        self.routes().insert(route.clone());
    }

    /// 记录一次到 `route` 的成功连接。
    pub fn connected(&self, route: &Route) {
        self.routes().remove(route);
    }

    /// `route` 最近是否失败过，规划器应优先尝试其他路线。
    pub fn should_postpone(&self, route: &Route) -> bool {
        self.routes().contains(route)
    }

    fn routes(&self) -> MutexGuard<'_, HashSet<Route>> {
        self.failed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for RouteDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteDatabase")
            .field("failed", &self.routes().len())
            .finish()
    }
}

/// 把交换与连接失败折算到连接和路线上。
#[derive(Clone, Debug)]
pub struct FailureTracker {
    routes: Arc<RouteDatabase>,
}

impl FailureTracker {
    /// 使用 `routes` 记录失败路线。
    pub fn new(routes: Arc<RouteDatabase>) -> FailureTracker {
        FailureTracker { routes }
    }

    /// 失败路线库。
    pub fn route_database(&self) -> &Arc<RouteDatabase> {
        &self.routes
    }

    /// 记录 `conn` 上一次交换的失败。
    ///
    /// - `REFUSED_STREAM`：第一次容忍（同一连接上重试一次），第二次起连接停止承载新交换；
    /// - `CANCEL`：对端只是放弃了单个流，不影响连接与路线；
    /// - 其他流重置：连接停止承载新交换；
    /// - 非多路复用连接上的错误或会话已关闭：连接停止承载新交换，
    ///   如果该连接从未成功完成过交换，路线也被记为失败。
    pub fn track_failure(&self, conn: &TransportConnection, err: &Error) {
        let mut route_failed = false;
        let quiesced = {
            let mut books = conn.books();
            let before = books.no_new_exchanges;

            if err.is_stream() {
                if err.is_refused_stream() {
                    books.refused_stream_count += 1;
                    if books.refused_stream_count > 1 {
                        books.no_new_exchanges = true;
                        books.route_failure_count += 1;
                    }
                } else if err.is_stream_canceled() {
                    // 单个流被取消，不计入
                } else {
                    books.no_new_exchanges = true;
                    books.route_failure_count += 1;
                }
            } else if !conn.is_multiplexed() || err.is_shutdown() {
                books.no_new_exchanges = true;
                if books.success_count == 0 {
                    route_failed = true;
                    books.route_failure_count += 1;
                }
            }

            trace!(
                "{} failure tracked: {} (route failures={}, no new exchanges={})",
                conn.id(),
                err,
                books.route_failure_count,
                books.no_new_exchanges
            );
            !before && books.no_new_exchanges
        };

        if route_failed {
            self.connect_failed(conn.route(), err);
        }
        if quiesced {
            conn.quiesced();
        }
    }

    /// 记录 `route` 上的一次连接失败。取消不算路线失败。
    pub fn connect_failed(&self, route: &Route, err: &Error) {
        if err.is_canceled() {
            return;
        }
        debug!("route failed: {:?}: {}", route, err);
        self.routes.failed(route);
    }

    /// 记录 `route` 上的一次成功连接。
    pub fn connected(&self, route: &Route) {
        self.routes.connected(route);
    }
}

impl Default for FailureTracker {
    fn default() -> FailureTracker {
        FailureTracker::new(Arc::new(RouteDatabase::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use crate::address::{Address, Route};
    use crate::config::ConnectConfig;
    use crate::error::{Error, Handshake};

    fn route(port: u16) -> Route {
        let address = Address::builder("example.com", 443).build().unwrap();
        Route::direct(address, SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn reset(reason: h2::Reason) -> Error {
        Error::new_h2(h2::Error::from(reason))
    }

    #[test]
    fn route_database_postpones_failed_routes() {
        let db = RouteDatabase::new();
        let r1 = route(1);
        assert!(!db.should_postpone(&r1));
        db.failed(&r1);
        assert!(db.should_postpone(&r1));
        assert!(!db.should_postpone(&route(2)));
        db.connected(&r1);
        assert!(!db.should_postpone(&r1));
    }

    #[test]
    fn second_refused_stream_quiesces_multiplexed_connection() {
        let tracker = FailureTracker::default();
        let conn = TransportConnection::new_multiplexed_for_test(route(1), ConnectConfig::default());

        tracker.track_failure(&conn, &reset(h2::Reason::REFUSED_STREAM));
        assert!(!conn.no_new_exchanges());
        assert_eq!(conn.route_failure_count(), 0);

        tracker.track_failure(&conn, &reset(h2::Reason::REFUSED_STREAM));
        assert!(conn.no_new_exchanges());
        assert_eq!(conn.route_failure_count(), 1);
    }

    #[test]
    fn canceled_streams_are_not_penalized() {
        let tracker = FailureTracker::default();
        let conn = TransportConnection::new_multiplexed_for_test(route(1), ConnectConfig::default());

        for _ in 0..3 {
            tracker.track_failure(&conn, &reset(h2::Reason::CANCEL));
        }
        assert!(!conn.no_new_exchanges());
        assert_eq!(conn.route_failure_count(), 0);
        assert!(!tracker.route_database().should_postpone(conn.route()));
    }

    #[test]
    fn other_stream_resets_quiesce_immediately() {
        let tracker = FailureTracker::default();
        let conn = TransportConnection::new_multiplexed_for_test(route(1), ConnectConfig::default());

        tracker.track_failure(&conn, &reset(h2::Reason::INTERNAL_ERROR));
        assert!(conn.no_new_exchanges());
        assert_eq!(conn.route_failure_count(), 1);
    }

    #[test]
    fn shutdown_on_fresh_connection_marks_route() {
        let tracker = FailureTracker::default();
        let conn = TransportConnection::new_multiplexed_for_test(route(1), ConnectConfig::default());

        tracker.track_failure(&conn, &Error::new_shutdown());
        assert!(conn.no_new_exchanges());
        assert_eq!(conn.route_failure_count(), 1);
        assert!(tracker.route_database().should_postpone(conn.route()));
    }

    #[test]
    fn io_failure_after_success_spares_the_route() {
        let tracker = FailureTracker::default();
        let conn = TransportConnection::new(route(1), ConnectConfig::default());
        conn.books().success_count = 1;

        tracker.track_failure(&conn, &Error::new_io(std::io::ErrorKind::BrokenPipe.into()));
        assert!(conn.no_new_exchanges());
        assert_eq!(conn.route_failure_count(), 0);
        assert!(!tracker.route_database().should_postpone(conn.route()));
    }

    #[test]
    fn canceled_connects_do_not_fail_routes() {
        let tracker = FailureTracker::default();
        let r = route(1);
        tracker.connect_failed(&r, &Error::new_canceled());
        assert!(!tracker.route_database().should_postpone(&r));
        tracker.connect_failed(&r, &Error::new_handshake(Handshake::Negotiation));
        assert!(tracker.route_database().should_postpone(&r));
    }
}
