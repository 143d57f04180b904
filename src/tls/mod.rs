//! TLS 协商相关类型
//!
//! 连接核心不直接实现 TLS，而是通过 [`TlsConnect`] 使用外部的 TLS 套接字工厂：
//!
//! - [`CipherSuitePolicy`]：不可变的协议版本/密码套件组合目录；
//! - [`ConnectionSelector`]：按顺序尝试候选策略，握手失败时回退到下一个；
//! - [`HostnameVerifier`] 与 [`CertificatePinner`]：握手完成后的信任策略；
//! - `RustlsConnector`（`rustls` feature）：基于 rustls 的默认实现。

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use futures_core::future::BoxFuture;
use rustls_pki_types::CertificateDer;

use crate::rt::BoxedIo;

mod policy;
mod selector;
mod verify;

pub use self::policy::{CipherSuitePolicy, PolicyBuilder};
pub use self::selector::{ConnectionSelector, SelectedPolicy};
pub use self::verify::{CertificatePinner, HostnameVerifier, PinnerBuilder, VerifyHostname};
pub(crate) use self::verify::dns_names;

cfg_rustls! {
    mod rustls_connector;

    pub use self::rustls_connector::RustlsConnector;
}

/// TLS 协议版本。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TlsVersion {
    /// TLS 1.3
    Tls13,
    /// TLS 1.2
    Tls12,
    /// TLS 1.1，已不安全
    Tls11,
    /// TLS 1.0，已不安全
    Tls10,
    /// SSL 3.0，已不安全
    Ssl30,
}

impl TlsVersion {
    /// 协议版本的标准名称，例如 `TLSv1.3`。
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls13 => "TLSv1.3",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls10 => "TLSv1",
            TlsVersion::Ssl30 => "SSLv3",
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 以 IANA 名称标识的密码套件，例如 `TLS_AES_128_GCM_SHA256`。
///
/// 比较时忽略 `TLS_` 与 `SSL_` 前缀的差异，老式实现常用 `SSL_` 前缀命名同一套件。
#[derive(Clone, Debug, Eq)]
pub struct CipherSuite(Cow<'static, str>);

impl CipherSuite {
    /// 由静态字符串构造，可用于常量。
    pub const fn from_static(name: &'static str) -> CipherSuite {
        CipherSuite(Cow::Borrowed(name))
    }

    /// 由运行时字符串构造。
    pub fn new(name: impl Into<String>) -> CipherSuite {
        CipherSuite(Cow::Owned(name.into()))
    }

    /// 套件名称。
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn key(&self) -> &str {
        let name = self.as_str();
        name.strip_prefix("TLS_")
            .or_else(|| name.strip_prefix("SSL_"))
            .unwrap_or(name)
    }
}

impl PartialEq for CipherSuite {
    fn eq(&self, other: &CipherSuite) -> bool {
        self.key() == other.key()
    }
}

impl std::hash::Hash for CipherSuite {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state)
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 回退信号套件（RFC 7507）。
///
/// 只在非首次尝试时附加，告知服务端这是一次降级重试，能识别降级攻击的服务端可以据此拒绝。
pub const TLS_FALLBACK_SCSV: CipherSuite = CipherSuite::from_static("TLS_FALLBACK_SCSV");

/// TLS 实现的能力，启动时解析一次。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TlsCapabilities {
    /// 是否支持 ALPN 协议协商
    pub alpn: bool,
    /// 是否支持 SNI
    pub sni: bool,
    /// 是否支持发送 `TLS_FALLBACK_SCSV`
    pub fallback_scsv: bool,
}

/// 一次握手使用的参数，由选中的策略与地址共同决定。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsParams {
    /// 启用的协议版本
    pub versions: Vec<TlsVersion>,
    /// 启用的密码套件，非首次尝试时可能以 `TLS_FALLBACK_SCSV` 结尾
    pub cipher_suites: Vec<CipherSuite>,
    /// 需要通过 ALPN 提供的协议标识；策略不支持扩展时为空
    pub alpn_protocols: Vec<Vec<u8>>,
    /// 是否发送 SNI
    pub sni: bool,
}

/// 握手完成后协商出的参数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    /// 协商的协议版本
    pub tls_version: TlsVersion,
    /// 协商的密码套件
    pub cipher_suite: CipherSuite,
    /// 对端证书链，叶子证书在前
    pub peer_certificates: Vec<CertificateDer<'static>>,
    /// ALPN 选中的协议标识
    pub alpn: Option<Vec<u8>>,
}

/// [`TlsConnect::connect`] 的失败原因。
#[derive(Debug)]
pub enum HandshakeError {
    /// 握手期间的套接字错误，不会换策略重试
    Io(io::Error),
    /// 协议版本或密码套件协商失败，可以换下一个策略重试
    Negotiation(Box<dyn StdError + Send + Sync>),
    /// 对端证书链未通过校验
    Certificate(Box<dyn StdError + Send + Sync>),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::Io(err) => write!(f, "handshake I/O error: {}", err),
            HandshakeError::Negotiation(err) => write!(f, "handshake negotiation failed: {}", err),
            HandshakeError::Certificate(err) => write!(f, "certificate rejected: {}", err),
        }
    }
}

impl StdError for HandshakeError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            HandshakeError::Io(err) => Some(err),
            HandshakeError::Negotiation(err) | HandshakeError::Certificate(err) => Some(&**err),
        }
    }
}

impl From<HandshakeError> for crate::Error {
    fn from(err: HandshakeError) -> crate::Error {
        use crate::error::Handshake as Kind;
        match err {
            HandshakeError::Io(io) => crate::Error::new_io(io),
            HandshakeError::Negotiation(cause) => {
                crate::Error::new_handshake(Kind::Negotiation).with(cause)
            }
            HandshakeError::Certificate(cause) => {
                crate::Error::new_handshake(Kind::Certificate).with(cause)
            }
        }
    }
}

/// TLS 套接字工厂。
///
/// 实现者描述自己创建的套接字启用/支持的协议版本与密码套件，
/// 并负责在给定的字节流上完成握手。没有配置 `TlsConnect` 的地址只能走明文。
pub trait TlsConnect: Send + Sync + 'static {
    /// 套接字默认启用的协议版本。
    fn enabled_versions(&self) -> Vec<TlsVersion>;

    /// 套接字默认启用的密码套件。
    fn enabled_cipher_suites(&self) -> Vec<CipherSuite>;

    /// 套接字支持（但不一定默认启用）的密码套件。
    fn supported_cipher_suites(&self) -> Vec<CipherSuite> {
        self.enabled_cipher_suites()
    }

    /// 实现的扩展能力。
    fn capabilities(&self) -> TlsCapabilities;

    /// 在 `io` 上以 `params` 与 `host` 完成握手。
    ///
    /// 主机名校验与证书固定由连接核心在握手之后完成，实现者只需校验证书链本身。
    fn connect(
        &self,
        io: BoxedIo,
        host: &str,
        params: TlsParams,
    ) -> BoxFuture<'static, Result<(BoxedIo, Handshake), HandshakeError>>;
}
