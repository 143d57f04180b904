// 以下 lint 属性控制编译器的警告行为，确保代码质量：
#![deny(missing_docs)]                                           // 所有公共 API 必须有文档注释
#![deny(missing_debug_implementations)]                          // 所有公共类型必须实现 Debug trait
#![cfg_attr(test, deny(rust_2018_idioms))]                       // 测试时要求使用 Rust 2018 惯用写法
#![cfg_attr(all(test, feature = "full"), deny(unreachable_pub))] // 测试+full 模式下，禁止不可达的 pub 声明
#![cfg_attr(all(test, feature = "full"), deny(warnings))]        // 测试+full 模式下，将所有警告视为错误
#![cfg_attr(docsrs, feature(doc_cfg))]                           // docs.rs 构建时启用 doc_cfg feature，用于在文档中显示 feature 标记

//! # hyper-conduit
//!
//! HTTP 客户端的连接核心：负责建立、复用与回收传输连接，不关心报文本身。
//!
//! 一条连接从原始套接字开始，视路线与目标地址依次经过：
//!
//! - SOCKS 握手，或者经 HTTP 代理的 `CONNECT` 隧道（含 407 代理认证）；
//! - TLS 握手：按 [`CipherSuitePolicy`](tls::CipherSuitePolicy) 列表选择协议版本与密码套件，
//!   协商失败时在新套接字上回退到下一个策略，随后做主机名校验与证书固定；
//! - ALPN 协议协商，HTTP/2 连接上再启动一个多路复用会话。
//!
//! 建立好的 [`TransportConnection`] 交给 [`ConnectionPool`] 管理。连接池按地址复用连接，
//! 在证书与 IP 都允许时把不同主机合并到同一条 HTTP/2 连接上，
//! 并在后台按 keep-alive 与空闲上限驱逐连接。交换失败通过 [`FailureTracker`] 记账，
//! 最近失败过的路线记录在 [`RouteDatabase`] 中，下次连接时排到最后。
//!
//! HTTP/1.1 的报文读写由调用方完成：连接核心只交出一个 [`BufferedStream`]，
//! HTTP/2 则交出 `h2` 的 `SendRequest` 句柄。
//!
//! ## 示例
//!
//! ```no_run
//! use std::net::SocketAddr;
//!
//! use hyper_conduit::{Address, Codec, ConnectConfig, ConnectionPool, Route};
//!
//! # async fn run() -> hyper_conduit::Result<()> {
//! let address = Address::builder("example.com", 80).build()?;
//! let routes = [Route::direct(address.clone(), SocketAddr::from(([93, 184, 216, 34], 80)))];
//!
//! let pool = ConnectionPool::default();
//! let config = ConnectConfig::default();
//! let connected = pool.connect(&address, &routes, &config).await?;
//! let conn = connected.connection().clone();
//!
//! match conn.new_codec(connected.into_allocation(), &config)? {
//!     Codec::Http1(transport) => {
//!         // 在 transport.stream() 上读写一个完整的 HTTP/1.1 交换
//!         transport.finish();
//!     }
//!     Codec::Http2(transport) => drop(transport),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Optional Features
//!
//! - `rustls`（默认启用）：基于 rustls 的 [`TlsConnect`](tls::TlsConnect) 实现。
//! - `tracing`（默认启用）：通过 `tracing` 输出调试日志。

pub use crate::address::{Address, Builder as AddressBuilder, Protocol, Proxy, Route};
pub use crate::codec::{Codec, Http1Transport, Http2Transport};
pub use crate::common::io::BufferedStream;
pub use crate::config::{ConnectConfig, Http2Config, PoolConfig};
pub use crate::connection::{Allocation, ConnectionId, State, TransportConnection};
pub use crate::error::{Error, Result};
pub use crate::failure::{FailureTracker, RouteDatabase};
pub use crate::listener::{ConnectionListener, NoopListener};
pub use crate::pool::{Connected, ConnectionPool};

// `cfg_feature!` 等宏需要在其余模块之前可见
#[macro_use]
mod cfg;

// 日志宏 trace!、debug! 等
#[macro_use]
mod trace;

mod address;
mod codec;
mod common;
mod config;
/// 套接字工厂与代理认证。
pub mod connect;
mod connection;
mod error;
mod failure;
mod listener;
#[cfg(test)]
mod mock;
mod pool;
mod proto;
/// 运行时抽象：执行器与字节流。
pub mod rt;
/// TLS 策略、握手抽象、主机名校验与证书固定。
pub mod tls;
