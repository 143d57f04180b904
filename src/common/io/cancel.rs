//! 可取消的 I/O 包装器
//!
//! 每个原始套接字在创建后立即被 `Cancelable` 包装。连接被取消时，
//! `CancelHandle::cancel` 翻转共享标志并唤醒挂起的读写，之后所有读写都以
//! `ConnectionAborted` 失败，效果等同于强制关闭套接字。

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use atomic_waker::AtomicWaker;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// 连接级取消句柄，可跨线程克隆。
#[derive(Clone)]
pub(crate) struct CancelHandle {
    shared: Arc<Shared>,
}

struct Shared {
    canceled: AtomicBool,
    read_task: AtomicWaker,
    write_task: AtomicWaker,
}

/// 在取消句柄翻转后拒绝一切读写的 I/O 包装器。
pub(crate) struct Cancelable<T> {
    io: T,
    handle: CancelHandle,
}

impl CancelHandle {
    pub(crate) fn new() -> Self {
        CancelHandle {
            shared: Arc::new(Shared {
                canceled: AtomicBool::new(false),
                read_task: AtomicWaker::new(),
                write_task: AtomicWaker::new(),
            }),
        }
    }

    /// 取消所有包装在此句柄下的 I/O，幂等。
    pub(crate) fn cancel(&self) {
        if !self.shared.canceled.swap(true, Ordering::AcqRel) {
            self.shared.read_task.wake();
            self.shared.write_task.wake();
        }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.shared.canceled.load(Ordering::Acquire)
    }

    pub(crate) fn wrap<T>(&self, io: T) -> Cancelable<T> {
        Cancelable {
            io,
            handle: self.clone(),
        }
    }

    /// 注册 waker 后再检查一次标志，避免错过与注册并发发生的取消。
    fn poll_canceled(&self, waker: &AtomicWaker, cx: &mut Context<'_>) -> bool {
        if self.is_canceled() {
            return true;
        }
        waker.register(cx.waker());
        self.is_canceled()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection canceled")
}

impl<T> AsyncRead for Cancelable<T>
where
    T: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = &mut *self;
        if me.handle.poll_canceled(&me.handle.shared.read_task, cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut me.io).poll_read(cx, buf)
    }
}

impl<T> AsyncWrite for Cancelable<T>
where
    T: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = &mut *self;
        if me.handle.poll_canceled(&me.handle.shared.write_task, cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut me.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = &mut *self;
        if me.handle.poll_canceled(&me.handle.shared.write_task, cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut me.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.handle.is_canceled() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn cancel_wakes_blocked_read() {
        let (client, _server) = tokio::io::duplex(64);
        let handle = CancelHandle::new();
        let mut io = handle.wrap(client);

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            io.read(&mut buf).await
        });
        tokio::task::yield_now().await;
        handle.cancel();

        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn writes_fail_after_cancel() {
        let (client, _server) = tokio::io::duplex(64);
        let handle = CancelHandle::new();
        let mut io = handle.wrap(client);
        io.write_all(b"ok").await.unwrap();

        handle.cancel();
        assert!(handle.is_canceled());
        let err = io.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }
}
