//! 连接事件监听
//!
//! [`ConnectionListener`] 是观察连接生命周期的唯一通道：状态迁移、
//! 单次连接尝试失败、分配与释放。所有方法都有空的默认实现。
//!
//! 回调在持有连接内部锁之外、但可能在 HTTP/2 驱动任务上被调用，实现者不应阻塞。

use crate::address::Route;
use crate::connection::{ConnectionId, State};
use crate::Error;

/// 连接事件监听器。
pub trait ConnectionListener: Send + Sync + 'static {
    /// 连接 `id` 在 `route` 上进入了新状态 `state`。
    fn state_changed(&self, id: ConnectionId, route: &Route, state: State) {
        let _ = (id, route, state);
    }

    /// `route` 上的一次连接尝试失败。
    fn connect_failed(&self, route: &Route, err: &Error) {
        let _ = (route, err);
    }

    /// 连接 `id` 被分配给了一个新的交换。
    fn connection_acquired(&self, id: ConnectionId) {
        let _ = id;
    }

    /// 连接 `id` 上的一个交换结束，分配被释放。
    fn connection_released(&self, id: ConnectionId) {
        let _ = id;
    }
}

/// 忽略所有事件的监听器。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopListener;

impl ConnectionListener for NoopListener {}
