//! 带缓冲与超时控制的传输流
//!
//! `BufferedStream` 同时充当源（source）与汇（sink）：
//!
//! - 读方向维护一个 `BytesMut` 预读缓冲，实现 `AsyncBufRead`，隧道响应头解析、
//!   健康检查探测都直接在这个缓冲上进行，不会丢失已读到的字节；
//! - 写方向累积小块写入，`poll_flush` 时统一写出。
//!
//! 读、写方向各有一个可选超时。超时语义与套接字的 `SO_TIMEOUT` 一致：
//! 单次操作在超时时间内没有任何进展即失败，失败时返回 `io::ErrorKind::TimedOut`。

use std::cmp;
use std::fmt;
use std::future::{poll_fn, Future};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use futures_core::ready;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

use crate::error::TimedOut;

/// 单次从底层读取的块大小
const READ_CHUNK_SIZE: usize = 8192;
/// 写缓冲的上限，超过后先写出再接收新数据
const MAX_WRITE_BUF_SIZE: usize = 16 * 1024;

/// 源/汇两端带缓冲的传输流。
///
/// 通过 [`set_read_timeout`](BufferedStream::set_read_timeout) 与
/// [`set_write_timeout`](BufferedStream::set_write_timeout) 控制读写超时，
/// 编解码器层在每次交换前按调用方的超时配置设置它们。
pub struct BufferedStream<T> {
    io: T,
    read_buf: BytesMut,
    write_buf: BytesMut,
    read_timer: Deadline,
    write_timer: Deadline,
}

/// 单个方向的超时状态。
///
/// 只在底层返回 `Pending` 时才创建 `Sleep`，底层一旦有进展就清除。
struct Deadline {
    timeout: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl<T> BufferedStream<T> {
    /// 用空缓冲包装一个传输流，初始时没有读写超时。
    pub fn new(io: T) -> Self {
        BufferedStream {
            io,
            read_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            write_buf: BytesMut::new(),
            read_timer: Deadline::new(),
            write_timer: Deadline::new(),
        }
    }

    /// 当前的读超时。
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timer.timeout
    }

    /// 设置读超时，`None` 表示不限时。
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timer.set(timeout);
    }

    /// 当前的写超时。
    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timer.timeout
    }

    /// 设置写超时，`None` 表示不限时。
    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timer.set(timeout);
    }

    /// 已读入缓冲、尚未被消费的字节。
    pub fn buffered(&self) -> &[u8] {
        &self.read_buf
    }

    /// 底层传输流的引用。
    pub fn get_ref(&self) -> &T {
        &self.io
    }

    /// 底层传输流的可变引用。
    ///
    /// 直接读写底层流会绕过缓冲，调用方需自行保证顺序。
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.io
    }

    /// 拆出底层传输流以及尚未消费的已读字节。
    ///
    /// 尚未写出的数据会被丢弃，调用前应先 flush。
    pub fn into_parts(self) -> (T, Bytes) {
        debug_assert!(self.write_buf.is_empty(), "unflushed writes discarded");
        (self.io, self.read_buf.freeze())
    }
}

impl<T> BufferedStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// 从底层再读一块数据追加到读缓冲，返回新读到的字节数，0 表示 EOF。
    fn poll_read_more(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let len = self.read_buf.len();
        self.read_buf.resize(len + READ_CHUNK_SIZE, 0);
        let mut buf = ReadBuf::new(&mut self.read_buf[len..]);
        let polled = Pin::new(&mut self.io).poll_read(cx, &mut buf);
        let n = buf.filled().len();
        self.read_buf.truncate(len + n);

        match polled {
            Poll::Ready(result) => {
                self.read_timer.clear();
                Poll::Ready(result.map(|()| n))
            }
            Poll::Pending => self.read_timer.poll_expired(cx).map(Err),
        }
    }

    pub(crate) async fn read_more(&mut self) -> io::Result<usize> {
        poll_fn(|cx| self.poll_read_more(cx)).await
    }

    /// 把写缓冲全部写给底层传输流。
    fn poll_flush_buf(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            match Pin::new(&mut self.io).poll_write(cx, &self.write_buf) {
                Poll::Ready(Ok(0)) => {
                    self.write_timer.clear();
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    self.write_timer.clear();
                    self.write_buf.advance(n);
                }
                Poll::Ready(Err(err)) => {
                    self.write_timer.clear();
                    return Poll::Ready(Err(err));
                }
                Poll::Pending => return self.write_timer.poll_expired(cx).map(Err),
            }
        }
        Poll::Ready(Ok(()))
    }

    /// 检测对端是否已经半关闭，不消费任何数据。
    ///
    /// 临时把读超时设为 `probe`，尝试读取一次：
    ///
    /// - 读到数据，或在 `probe` 内没有任何数据（超时）：健康；
    /// - 读到 EOF 或其他错误：不健康。
    ///
    /// 无论结果如何（包括 future 被中途丢弃），原来的读超时都会被恢复。
    pub(crate) async fn probe_healthy(&mut self, probe: Duration) -> bool {
        if !self.read_buf.is_empty() {
            return true;
        }

        let mut guard = RestoreReadTimeout::new(self, probe);
        let result = poll_fn(|cx| guard.stream.poll_read_more(cx)).await;
        drop(guard);

        match result {
            Ok(0) => {
                trace!("health probe read EOF");
                false
            }
            Ok(_) => true,
            Err(ref err) if err.kind() == io::ErrorKind::TimedOut => true,
            Err(_err) => {
                trace!("health probe failed: {}", _err);
                false
            }
        }
    }
}

/// 离开作用域时恢复原读超时。
struct RestoreReadTimeout<'a, T> {
    stream: &'a mut BufferedStream<T>,
    saved: Option<Duration>,
}

impl<'a, T> RestoreReadTimeout<'a, T> {
    fn new(stream: &'a mut BufferedStream<T>, probe: Duration) -> Self {
        let saved = stream.read_timeout();
        stream.set_read_timeout(Some(probe));
        RestoreReadTimeout { stream, saved }
    }
}

impl<T> Drop for RestoreReadTimeout<'_, T> {
    fn drop(&mut self) {
        self.stream.set_read_timeout(self.saved);
    }
}

impl<T> AsyncRead for BufferedStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if me.read_buf.is_empty() {
            ready!(me.poll_read_more(cx))?;
        }
        let n = cmp::min(buf.remaining(), me.read_buf.len());
        buf.put_slice(&me.read_buf[..n]);
        me.read_buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl<T> AsyncBufRead for BufferedStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let me = self.get_mut();
        if me.read_buf.is_empty() {
            ready!(me.poll_read_more(cx))?;
        }
        Poll::Ready(Ok(&me.read_buf[..]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        self.get_mut().read_buf.advance(amt);
    }
}

impl<T> AsyncWrite for BufferedStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        if me.write_buf.len() >= MAX_WRITE_BUF_SIZE {
            ready!(me.poll_flush_buf(cx))?;
        }
        let n = cmp::min(buf.len(), MAX_WRITE_BUF_SIZE - me.write_buf.len());
        me.write_buf.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        ready!(me.poll_flush_buf(cx))?;
        match Pin::new(&mut me.io).poll_flush(cx) {
            Poll::Ready(result) => {
                me.write_timer.clear();
                Poll::Ready(result)
            }
            Poll::Pending => me.write_timer.poll_expired(cx).map(Err),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        ready!(me.poll_flush_buf(cx))?;
        Pin::new(&mut me.io).poll_shutdown(cx)
    }
}

impl<T: fmt::Debug> fmt::Debug for BufferedStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedStream")
            .field("io", &self.io)
            .field("read_buf", &self.read_buf.len())
            .field("write_buf", &self.write_buf.len())
            .field("read_timeout", &self.read_timer.timeout)
            .field("write_timeout", &self.write_timer.timeout)
            .finish()
    }
}

// ===== impl Deadline =====

impl Deadline {
    fn new() -> Self {
        Deadline {
            timeout: None,
            sleep: None,
        }
    }

    fn set(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
        self.sleep = None;
    }

    fn clear(&mut self) {
        self.sleep = None;
    }

    /// 底层返回 `Pending` 时调用：超时未到返回 `Pending`，已到返回超时错误。
    fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        let timeout = match self.timeout {
            Some(timeout) => timeout,
            None => return Poll::Pending,
        };
        let sleep = self
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
        ready!(sleep.as_mut().poll(cx));
        self.sleep = None;
        Poll::Ready(io::Error::new(io::ErrorKind::TimedOut, TimedOut))
    }
}
