//! HTTP/2 会话
//!
//! 连接核心不实现 HTTP/2 帧，只负责：
//!
//! - 在协商好的字节流上完成 h2 客户端握手；
//! - 把 `h2::client::Connection` 交给执行器上的驱动任务 `SessionTask` 持续轮询；
//! - 在驱动任务中观察对端 SETTINGS 带来的并发流上限变化，通过 [`SessionObserver`]
//!   回报给所属连接。对端的首个 SETTINGS 应用之前不回报，上限保持为 1；
//! - 可选的保活 PING（见 `ping` 子模块）。
//!
//! ```text
//! TransportConnection ──owns──> Session ──SendRequest──> 编解码器
//!         ^                        │
//!         │ on_settings_updated    │ oneshot (取消)
//!         └──── SessionTask <──────┘
//!                   └─> h2::client::Connection
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_channel::oneshot;
use h2::client::{Builder, Connection, SendRequest};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};

use self::ping::Ponger;
use crate::common::exec::Exec;
use crate::config::Http2Config;

mod ping;

/// HTTP/2 会话事件的接收方，由所属的传输连接实现。
///
/// 回调在会话的驱动任务上执行，不能阻塞。
///
/// 握手时通过 `SETTINGS_ENABLE_PUSH = 0` 关闭了服务端推送，对端发起的任何流
/// 都由 h2 作为连接级 PROTOCOL_ERROR 处理，不会交给观察者。
pub(crate) trait SessionObserver: Send + Sync + 'static {
    /// 对端的并发流上限发生了变化。
    fn on_settings_updated(&self, max_concurrent_streams: usize);
}

/// 正在运行的 HTTP/2 会话句柄。
///
/// 会话自己持有的 `SendRequest` 被放弃、且编解码器手里的克隆都被丢弃后，
/// h2 在最后一个流结束时发送 GOAWAY 并关闭连接。
pub(crate) struct Session {
    tx: Mutex<Option<SendRequest<Bytes>>>,
    shared: Arc<Shared>,
    /// 发送即立即停止驱动任务
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

#[derive(Default)]
struct Shared {
    closed: AtomicBool,
    failed_ping: AtomicBool,
}

fn new_builder(config: &Http2Config) -> Builder {
    let mut builder = Builder::default();
    builder
        .initial_max_send_streams(config.initial_max_send_streams)
        .initial_window_size(config.initial_stream_window_size)
        .initial_connection_window_size(config.initial_conn_window_size)
        .max_frame_size(config.max_frame_size)
        .max_header_list_size(config.max_header_list_size)
        .max_send_buffer_size(config.max_send_buffer_size)
        .enable_push(false);
    builder
}

/// 在 `io` 上完成 HTTP/2 客户端握手，并在 `exec` 上启动驱动任务。
pub(crate) async fn handshake<T>(
    io: T,
    config: &Http2Config,
    observer: Weak<dyn SessionObserver>,
    exec: &Exec,
) -> crate::Result<Session>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (tx, mut conn) = new_builder(config)
        .handshake::<_, Bytes>(io)
        .await
        .map_err(crate::Error::new_h2)?;

    let ponger = conn
        .ping_pong()
        .map(|ping_pong| Ponger::new(ping_pong, config.ping_interval));

    let shared = Arc::new(Shared::default());
    let (cancel_tx, cancel_rx) = oneshot::channel();

    exec.execute(SessionTask {
        conn,
        ponger,
        cancel: Some(cancel_rx),
        observer,
        last_limit: None,
        guard: CloseOnDrop(shared.clone()),
    });

    Ok(Session {
        tx: Mutex::new(Some(tx)),
        shared,
        cancel: Mutex::new(Some(cancel_tx)),
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    /// 会话是否仍可承载新流：驱动任务仍在运行，且保活 PING 没有超时。
    pub(crate) fn is_healthy(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire) && !self.shared.failed_ping.load(Ordering::Acquire)
    }

    /// 用于发起新流的句柄；会话已开始优雅关闭时为 `None`。
    pub(crate) fn send_request(&self) -> Option<SendRequest<Bytes>> {
        lock(&self.tx).clone()
    }

    /// 立即停止驱动任务，不等待进行中的流。
    pub(crate) fn cancel(&self) {
        if let Some(tx) = lock(&self.cancel).take() {
            let _ = tx.send(());
        }
    }

    /// 不再承载新流，进行中的流结束后关闭。
    pub(crate) fn shutdown_gracefully(&self) {
        let tx = lock(&self.tx).take();
        drop(tx);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .field("failed_ping", &self.shared.failed_ping.load(Ordering::Relaxed))
            .finish()
    }
}

/// 驱动任务结束（包括被执行器丢弃）时标记会话已关闭。
struct CloseOnDrop(Arc<Shared>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.closed.store(true, Ordering::Release);
    }
}

pin_project! {
    /// 驱动 h2 连接的后台任务。
    struct SessionTask<T> {
        #[pin]
        conn: Connection<T, Bytes>,
        ponger: Option<Ponger>,
        cancel: Option<oneshot::Receiver<()>>,
        observer: Weak<dyn SessionObserver>,
        last_limit: Option<usize>,
        guard: CloseOnDrop,
    }
}

impl<T> Future for SessionTask<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut this = self.project();

        if let Some(rx) = this.cancel.as_mut() {
            match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(())) => {
                    debug!("http2 session canceled");
                    return Poll::Ready(());
                }
                // 会话句柄已丢弃，继续驱动直到 h2 自行关闭
                Poll::Ready(Err(_canceled)) => *this.cancel = None,
                Poll::Pending => {}
            }
        }

        let polled = this.conn.as_mut().poll(cx);

        let settled = match this.ponger.as_mut() {
            Some(ponger) => {
                if let Err(_timed_out) = ponger.poll(cx) {
                    debug!("http2 keep-alive timed out");
                    this.guard.0.failed_ping.store(true, Ordering::Release);
                    return Poll::Ready(());
                }
                ponger.is_settled()
            }
            None => false,
        };

        let limit = this.conn.max_concurrent_send_streams();
        if settled && *this.last_limit != Some(limit) {
            *this.last_limit = Some(limit);
            trace!("http2 max concurrent send streams: {}", limit);
            if let Some(observer) = this.observer.upgrade() {
                observer.on_settings_updated(limit);
            }
        }

        match polled {
            Poll::Ready(Ok(())) => {
                debug!("http2 session closed");
                Poll::Ready(())
            }
            Poll::Ready(Err(_err)) => {
                debug!("http2 session error: {}", _err);
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
