//! 异步字节流抽象
//!
//! 连接核心直接使用 tokio 的 `AsyncRead` / `AsyncWrite`：h2 与 tokio-rustls 都基于它们，
//! 不再需要额外的兼容层。

use tokio::io::{AsyncRead, AsyncWrite};

/// 连接核心能够驱动的字节流。
///
/// 任何 `AsyncRead + AsyncWrite + Send + Unpin + 'static` 的类型都自动实现此 trait，
/// 套接字工厂与 TLS 连接器通过 [`BoxedIo`] 交换类型擦除后的流。
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// 类型擦除后的字节流。
pub type BoxedIo = Box<dyn Io>;

#[cfg(test)]
impl std::fmt::Debug for dyn Io {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Io")
    }
}
