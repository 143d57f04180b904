//! 套接字建立与代理协商
//!
//! - [`SocketFactory`]：打开原始套接字，默认实现 [`TcpSocketFactory`]；
//! - [`ProxyAuthenticator`]：代理返回 407 时生成带凭据的新 CONNECT 请求；
//! - `tunnel`：HTTP 代理的 CONNECT 隧道；
//! - `socks`：SOCKS5 代理握手。

use std::io;
use std::net::SocketAddr;

use futures_core::future::BoxFuture;
use tokio::net::TcpStream;

use crate::address::Route;
use crate::rt::BoxedIo;

pub(crate) mod socks;
pub(crate) mod tunnel;

pub use self::tunnel::MAX_TUNNEL_ATTEMPTS;

/// 原始套接字工厂。
pub trait SocketFactory: Send + Sync + 'static {
    /// 连接到 `addr`。连接超时由调用方施加。
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxedIo>>;
}

/// 基于 tokio `TcpStream` 的套接字工厂，连接后设置 `TCP_NODELAY`。
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpSocketFactory;

impl SocketFactory for TcpSocketFactory {
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxedIo>> {
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            if let Err(_err) = stream.set_nodelay(true) {
                warn!("error trying to set TCP_NODELAY: {}", _err);
            }
            Ok(Box::new(stream) as BoxedIo)
        })
    }
}

/// 代理认证器。
///
/// 代理对 CONNECT 返回 `407` 时被调用，返回下一次 CONNECT 要使用的请求，
/// 返回 `None` 表示放弃认证，此次连接以隧道错误失败。
///
/// 返回请求中只有头部会被发送；缺少的 `Host`、`Proxy-Connection` 与 `User-Agent`
/// 会被自动补上。
///
/// 在发出第一个 CONNECT 之前，认证器还会收到一个合成的 `407` 挑战，
/// 其 `Proxy-Authenticate` 头为 `OkHttp-Preemptive`，可借此抢先提供凭据。
pub trait ProxyAuthenticator: Send + Sync + 'static {
    /// 针对 `route` 上的 `response` 挑战生成新请求。
    fn authenticate(
        &self,
        route: &Route,
        response: &http::Response<()>,
    ) -> Option<http::Request<()>>;
}

/// 从不提供凭据的认证器。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProxyAuthentication;

impl ProxyAuthenticator for NoProxyAuthentication {
    fn authenticate(&self, _: &Route, _: &http::Response<()>) -> Option<http::Request<()>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn tcp_factory_connects_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"hi").await.unwrap();
        });

        let mut io = TcpSocketFactory.connect(addr).await.expect("connect");
        let mut buf = [0u8; 2];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_factory_reports_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpSocketFactory.connect(addr).await.err().expect("refused");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
