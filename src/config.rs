//! 连接与连接池的配置
//!
//! 所有配置都采用 `&mut self` 风格的 setter，并提供 `Default`。默认值不属于稳定 API。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::common::exec::Exec;
use crate::connect::MAX_TUNNEL_ATTEMPTS;
use crate::listener::{ConnectionListener, NoopListener};
use crate::rt::Executor;

// 默认连接窗口 5MB，协议默认的 64KB 对吞吐量限制较大
const DEFAULT_CONN_WINDOW: u32 = 1024 * 1024 * 5; // 5mb
const DEFAULT_STREAM_WINDOW: u32 = 1024 * 1024 * 2; // 2mb
const DEFAULT_MAX_FRAME_SIZE: u32 = 1024 * 16; // 16kb
const DEFAULT_MAX_SEND_BUF_SIZE: usize = 1024 * 1024; // 1mb
const DEFAULT_MAX_HEADER_LIST_SIZE: u32 = 1024 * 16; // 16kb

/// 收到服务端第一个 SETTINGS 帧之前允许打开的并发流数量。
///
/// 取协议建议对端至少通告的值，尽量避免被 `REFUSED_STREAM` 拒绝。
const DEFAULT_INITIAL_MAX_SEND_STREAMS: usize = 100;

/// 单个传输连接的建立与使用配置。
#[derive(Clone)]
pub struct ConnectConfig {
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) retry_on_connection_failure: bool,
    pub(crate) health_probe_timeout: Duration,
    pub(crate) idle_probe_threshold: Duration,
    pub(crate) max_tunnel_attempts: usize,
    pub(crate) user_agent: String,
    pub(crate) http2: Http2Config,
    pub(crate) listener: Arc<dyn ConnectionListener>,
    pub(crate) exec: Exec,
}

impl ConnectConfig {
    /// 使用默认值创建配置。
    pub fn new() -> ConnectConfig {
        ConnectConfig::default()
    }

    /// 建立套接字的超时时间，默认 10 秒。
    pub fn connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connect_timeout = timeout;
        self
    }

    /// 读超时，作用于隧道往返、TLS 握手以及交给 HTTP/1.1 编解码器的流；`None` 表示不限制。
    pub fn read_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.read_timeout = timeout;
        self
    }

    /// 写超时；`None` 表示不限制。
    pub fn write_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.write_timeout = timeout;
        self
    }

    /// 连接失败时是否尝试下一个策略或路线，默认开启。
    pub fn retry_on_connection_failure(&mut self, enabled: bool) -> &mut Self {
        self.retry_on_connection_failure = enabled;
        self
    }

    /// 深度健康检查时探测读的超时时间，默认 1 毫秒。
    ///
    /// 太小的值可能低于操作系统的计时精度。
    pub fn health_probe_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.health_probe_timeout = timeout;
        self
    }

    /// 空闲时间达到该阈值的连接才会执行深度健康检查，默认 10 秒。
    pub fn idle_probe_threshold(&mut self, threshold: Duration) -> &mut Self {
        self.idle_probe_threshold = threshold;
        self
    }

    /// 代理要求重新认证并关闭连接时，CONNECT 的最大尝试次数，默认 [`MAX_TUNNEL_ATTEMPTS`]。
    pub fn max_tunnel_attempts(&mut self, attempts: usize) -> &mut Self {
        self.max_tunnel_attempts = attempts.max(1);
        self
    }

    /// CONNECT 请求中的 `User-Agent`。
    pub fn user_agent(&mut self, user_agent: impl Into<String>) -> &mut Self {
        self.user_agent = user_agent.into();
        self
    }

    /// HTTP/2 会话配置。
    pub fn http2(&mut self) -> &mut Http2Config {
        &mut self.http2
    }

    /// 设置连接事件监听器。
    pub fn listener(&mut self, listener: Arc<dyn ConnectionListener>) -> &mut Self {
        self.listener = listener;
        self
    }

    /// 设置用于运行 HTTP/2 驱动任务的执行器，默认使用 `tokio::spawn`。
    pub fn executor<E>(&mut self, exec: E) -> &mut Self
    where
        E: Executor<crate::rt::BoxSendFuture> + Send + Sync + 'static,
    {
        self.exec = Exec::new(exec);
        self
    }
}

impl Default for ConnectConfig {
    fn default() -> ConnectConfig {
        ConnectConfig {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Some(Duration::from_secs(10)),
            write_timeout: Some(Duration::from_secs(10)),
            retry_on_connection_failure: true,
            health_probe_timeout: Duration::from_millis(1),
            idle_probe_threshold: Duration::from_secs(10),
            max_tunnel_attempts: MAX_TUNNEL_ATTEMPTS,
            user_agent: concat!("hyper-conduit/", env!("CARGO_PKG_VERSION")).to_owned(),
            http2: Http2Config::default(),
            listener: Arc::new(NoopListener),
            exec: Exec::default(),
        }
    }
}

impl fmt::Debug for ConnectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("retry_on_connection_failure", &self.retry_on_connection_failure)
            .field("health_probe_timeout", &self.health_probe_timeout)
            .field("max_tunnel_attempts", &self.max_tunnel_attempts)
            .field("http2", &self.http2)
            .finish()
    }
}

/// HTTP/2 会话配置。
#[derive(Clone, Debug)]
pub struct Http2Config {
    pub(crate) initial_conn_window_size: u32,
    pub(crate) initial_stream_window_size: u32,
    pub(crate) initial_max_send_streams: usize,
    pub(crate) max_frame_size: u32,
    pub(crate) max_header_list_size: u32,
    pub(crate) max_send_buffer_size: usize,
    pub(crate) ping_interval: Option<Duration>,
}

impl Http2Config {
    /// 连接级初始流量控制窗口。
    pub fn initial_connection_window_size(&mut self, size: u32) -> &mut Self {
        self.initial_conn_window_size = size;
        self
    }

    /// 流级初始流量控制窗口。
    pub fn initial_stream_window_size(&mut self, size: u32) -> &mut Self {
        self.initial_stream_window_size = size;
        self
    }

    /// 收到服务端 SETTINGS 之前的并发流上限，同时是连接的初始分配上限。
    pub fn initial_max_send_streams(&mut self, max: usize) -> &mut Self {
        self.initial_max_send_streams = max;
        self
    }

    /// 最大帧大小。
    pub fn max_frame_size(&mut self, size: u32) -> &mut Self {
        self.max_frame_size = size;
        self
    }

    /// 最大头部列表大小。
    pub fn max_header_list_size(&mut self, size: u32) -> &mut Self {
        self.max_header_list_size = size;
        self
    }

    /// 每个流的最大发送缓冲。
    pub fn max_send_buffer_size(&mut self, size: usize) -> &mut Self {
        self.max_send_buffer_size = size;
        self
    }

    /// 保活 PING 的间隔；`None` 表示不发送。
    ///
    /// 下一次到期时上一个 PING 仍未收到 PONG，会话即被标记为不健康。
    pub fn ping_interval(&mut self, interval: Option<Duration>) -> &mut Self {
        self.ping_interval = interval;
        self
    }
}

impl Default for Http2Config {
    fn default() -> Http2Config {
        Http2Config {
            initial_conn_window_size: DEFAULT_CONN_WINDOW,
            initial_stream_window_size: DEFAULT_STREAM_WINDOW,
            initial_max_send_streams: DEFAULT_INITIAL_MAX_SEND_STREAMS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: DEFAULT_MAX_HEADER_LIST_SIZE,
            max_send_buffer_size: DEFAULT_MAX_SEND_BUF_SIZE,
            ping_interval: None,
        }
    }
}

/// 连接池配置。
#[derive(Clone)]
pub struct PoolConfig {
    pub(crate) max_idle_connections: usize,
    pub(crate) keep_alive: Duration,
    pub(crate) exec: Exec,
}

impl PoolConfig {
    /// 使用默认值创建配置。
    pub fn new() -> PoolConfig {
        PoolConfig::default()
    }

    /// 最多保留的空闲连接数，默认 5。
    pub fn max_idle_connections(&mut self, max: usize) -> &mut Self {
        self.max_idle_connections = max;
        self
    }

    /// 空闲连接的保活时长，默认 5 分钟。
    pub fn keep_alive(&mut self, keep_alive: Duration) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    /// 设置用于运行清扫任务的执行器，默认使用 `tokio::spawn`。
    pub fn executor<E>(&mut self, exec: E) -> &mut Self
    where
        E: Executor<crate::rt::BoxSendFuture> + Send + Sync + 'static,
    {
        self.exec = Exec::new(exec);
        self
    }
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            max_idle_connections: 5,
            keep_alive: Duration::from_secs(5 * 60),
            exec: Exec::default(),
        }
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("max_idle_connections", &self.max_idle_connections)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ConnectConfig::default();
        assert_eq!(config.health_probe_timeout, Duration::from_millis(1));
        assert_eq!(config.max_tunnel_attempts, 21);
        assert!(config.retry_on_connection_failure);
        assert!(config.user_agent.starts_with("hyper-conduit/"));

        let pool = PoolConfig::default();
        assert_eq!(pool.max_idle_connections, 5);
        assert_eq!(pool.keep_alive, Duration::from_secs(300));
    }

    #[test]
    fn setters_chain() {
        let mut config = ConnectConfig::new();
        config
            .connect_timeout(Duration::from_millis(250))
            .max_tunnel_attempts(3)
            .retry_on_connection_failure(false);
        config.http2().initial_max_send_streams(8).ping_interval(Some(Duration::from_secs(1)));

        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.max_tunnel_attempts, 3);
        assert!(!config.retry_on_connection_failure);
        assert_eq!(config.http2.initial_max_send_streams, 8);
    }
}
