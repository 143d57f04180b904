//! 编解码器入口
//!
//! 连接核心不解析 HTTP 报文，只把协商好的传输交给外部编解码器：
//!
//! - HTTP/1.1：独占的 [`BufferedStream`]，交换结束后通过 [`Http1Transport::finish`] 归还；
//! - HTTP/2：会话的 `SendRequest` 句柄，每个交换各持有一份。
//!
//! 两者都持有一个 [`Allocation`]，丢弃即释放连接上的分配名额。

use std::fmt;
use std::future::poll_fn;

use bytes::Bytes;
use h2::client::SendRequest;

use crate::common::io::BufferedStream;
use crate::connection::{Allocation, TransportConnection};
use crate::rt::BoxedIo;
use crate::Error;

/// 一个交换使用的传输，由 [`TransportConnection::new_codec`] 创建。
#[derive(Debug)]
pub enum Codec {
    /// HTTP/1.1 连接上的独占缓冲流
    Http1(Http1Transport),
    /// HTTP/2 会话上的一个新流入口
    Http2(Http2Transport),
}

impl Codec {
    /// 传输所属的连接。
    pub fn connection(&self) -> &TransportConnection {
        match self {
            Codec::Http1(transport) => transport.connection(),
            Codec::Http2(transport) => transport.connection(),
        }
    }

    /// 报告交换失败，交给失败记账决定连接与路线的后果。
    pub fn track_failure(&self, err: &Error) {
        self.connection().track_failure(err)
    }
}

/// HTTP/1.1 交换的传输。
///
/// 没有调用 [`finish`](Http1Transport::finish) 就被丢弃时，流的状态无法确定，
/// 连接不再承载新交换。
pub struct Http1Transport {
    stream: Option<BufferedStream<BoxedIo>>,
    allocation: Allocation,
}

impl Http1Transport {
    pub(crate) fn new(stream: BufferedStream<BoxedIo>, allocation: Allocation) -> Http1Transport {
        Http1Transport {
            stream: Some(stream),
            allocation,
        }
    }

    /// 交换使用的缓冲流。
    pub fn stream(&mut self) -> &mut BufferedStream<BoxedIo> {
        match self.stream {
            Some(ref mut stream) => stream,
            // stream 只在消费 self 的方法中被取走
            None => unreachable!("stream taken before drop"),
        }
    }

    /// 传输所属的连接。
    pub fn connection(&self) -> &TransportConnection {
        self.allocation.connection()
    }

    /// 交换完整结束：归还流，记一次成功，释放分配名额。
    pub fn finish(mut self) {
        if let Some(stream) = self.stream.take() {
            let conn = self.allocation.connection();
            conn.record_success();
            conn.restore_stream(stream);
        }
    }

    /// 取走流用于协议升级，连接不再承载新交换。
    pub fn into_io(mut self) -> BufferedStream<BoxedIo> {
        let stream = self.stream.take();
        self.allocation.connection().quiesce();
        match stream {
            Some(stream) => stream,
            None => unreachable!("stream taken before drop"),
        }
    }

    /// 报告交换失败。
    pub fn track_failure(&self, err: &Error) {
        self.connection().track_failure(err)
    }
}

impl Drop for Http1Transport {
    fn drop(&mut self) {
        if self.stream.take().is_some() {
            trace!("{} exchange abandoned", self.allocation.connection().id());
            self.allocation.connection().quiesce();
        }
    }
}

impl fmt::Debug for Http1Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http1Transport")
            .field("connection", &self.allocation.connection().id())
            .finish()
    }
}

/// HTTP/2 交换的传输。
pub struct Http2Transport {
    tx: SendRequest<Bytes>,
    allocation: Allocation,
}

impl Http2Transport {
    pub(crate) fn new(tx: SendRequest<Bytes>, allocation: Allocation) -> Http2Transport {
        Http2Transport { tx, allocation }
    }

    /// 等待会话可以接受新流，返回发起请求的句柄。
    pub async fn ready(&mut self) -> crate::Result<&mut SendRequest<Bytes>> {
        let tx = &mut self.tx;
        poll_fn(|cx| tx.poll_ready(cx))
            .await
            .map_err(Error::new_h2)?;
        Ok(&mut self.tx)
    }

    /// 传输所属的连接。
    pub fn connection(&self) -> &TransportConnection {
        self.allocation.connection()
    }

    /// 交换完整结束：记一次成功。丢弃传输即释放分配名额。
    pub fn record_success(&self) {
        self.connection().record_success();
    }

    /// 报告交换失败。
    pub fn track_failure(&self, err: &Error) {
        self.connection().track_failure(err)
    }
}

impl fmt::Debug for Http2Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http2Transport")
            .field("connection", &self.allocation.connection().id())
            .finish()
    }
}
