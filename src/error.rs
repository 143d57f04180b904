//! 错误与结果类型模块
//!
//! 本模块定义了连接核心对外暴露的唯一错误类型 [`Error`]。建立连接、TLS 握手、
//! 代理隧道、HTTP/2 会话中可能发生的所有错误都被统一封装在 `Error` 中，
//! 调用方通过 `is_*` 方法判断错误类别。
//!
//! 分类与失败语义的对应关系：
//!
//! - **路线失败**（`is_route`）：某条路线上所有尝试都失败后汇总抛出，每一次尝试都
//!   作为被抑制的错误保存在 [`Error::suppressed`] 中，最后一次尝试同时是 `source()`。
//! - **隧道失败**（`is_tunnel`）：代理拒绝 CONNECT、认证次数耗尽或返回意外状态码。
//! - **握手失败**（`is_handshake`）：TLS 协商或证书校验失败。
//! - **流失败**（`is_stream`）：HTTP/2 单个流被重置，连接本身可能仍然可用。
//!
//! `Error` 内部使用 `Box<ErrorImpl>`，栈上只占一个指针宽度。

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// 本 crate 方法常用的 Result 类型别名。
pub type Result<T> = std::result::Result<T, Error>;

/// 类型擦除的错误原因。
pub(crate) type Cause = Box<dyn StdError + Send + Sync>;

/// 建立、复用或使用传输连接时可能发生的错误。
///
/// # 格式化
///
/// `Display` 只打印当前层级的描述。完整的原因链请通过 `source()` 遍历；
/// 路线失败还可以通过 [`Error::suppressed`] 查看每一次连接尝试。
/// 错误消息的具体措辞不属于稳定 API。
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
    /// 被抑制的错误；对路线失败而言即每一次连接尝试的错误，按时间顺序排列
    suppressed: Vec<Error>,
}

#[derive(Debug)]
pub(super) enum Kind {
    /// 一条或多条路线上的连接尝试全部失败
    Route,
    /// 代理隧道建立失败
    Tunnel(Tunnel),
    /// TLS 握手或证书校验失败
    Handshake(Handshake),
    /// HTTP/2 单个流被对端重置
    Stream,
    /// 多路复用会话已关闭（GOAWAY 或驱动任务结束）
    Shutdown,
    /// 读写套接字时发生的 `io::Error`
    Io,
    /// 连接被主动取消
    Canceled,
    /// 来自 h2 库的其他错误
    Http2,
    /// 调用方使用方式错误
    User(User),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Tunnel {
    /// CONNECT 收到了 200 与 407 之外的状态码
    UnexpectedStatus,
    /// 代理认证器无法为 407 挑战生成新的请求
    AuthenticationFailed,
    /// 代理反复要求重新认证并关闭连接，超过了最大尝试次数
    TooManyAttempts,
    /// 代理在 200 响应之后、TLS ClientHello 之前就发送了数据
    BufferedBytes,
    /// 代理响应头无法解析或过大
    Malformed,
    /// SOCKS5 代理拒绝了 CONNECT
    Socks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Handshake {
    /// 协议版本或密码套件协商失败，可以换下一个策略重试
    Negotiation,
    /// 对端证书链被拒绝
    Certificate,
    /// 主机名校验器或证书固定（pinning）拒绝了对端
    PeerUnverified,
    /// 没有任何候选策略与套接字启用的协议版本相交
    NoAcceptablePolicy,
    /// ALPN 选出了无法识别的应用层协议
    UnexpectedProtocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum User {
    /// 对同一个连接对象第二次调用 connect
    AlreadyConnected,
    /// 明文目标，但策略列表中没有 cleartext 条目
    CleartextNotPermitted,
    /// 要求 H2 prior knowledge 的地址配置了 TLS
    PriorKnowledgeWithTls,
    /// 地址配置不合法
    InvalidAddress,
    /// 在连接完成之前请求编解码器
    NotConnected,
    /// 证书固定的 pin 格式不合法
    InvalidPin,
}

/// 哨兵类型：标识错误由读写超时引起。
#[derive(Debug)]
pub(crate) struct TimedOut;

impl Error {
    /// 如果所有路线或候选策略上的连接尝试都失败了，返回 `true`。
    pub fn is_route(&self) -> bool {
        matches!(self.inner.kind, Kind::Route)
    }

    /// 如果代理隧道（CONNECT 或 SOCKS）建立失败，返回 `true`。
    pub fn is_tunnel(&self) -> bool {
        matches!(self.inner.kind, Kind::Tunnel(_))
    }

    /// 如果是 TLS 握手或对端校验失败，返回 `true`。
    pub fn is_handshake(&self) -> bool {
        matches!(self.inner.kind, Kind::Handshake(_))
    }

    /// 如果是对端证书未通过主机名校验或证书固定，返回 `true`。
    pub fn is_peer_unverified(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::Handshake(Handshake::PeerUnverified) | Kind::Handshake(Handshake::Certificate)
        )
    }

    /// 如果 HTTP/2 单个流被重置，返回 `true`。
    pub fn is_stream(&self) -> bool {
        matches!(self.inner.kind, Kind::Stream)
    }

    /// 如果 HTTP/2 流被以 `REFUSED_STREAM` 重置，返回 `true`。
    pub fn is_refused_stream(&self) -> bool {
        self.is_stream() && self.h2_reason() == Some(h2::Reason::REFUSED_STREAM)
    }

    /// 如果 HTTP/2 流被以 `CANCEL` 重置，返回 `true`。
    pub fn is_stream_canceled(&self) -> bool {
        self.is_stream() && self.h2_reason() == Some(h2::Reason::CANCEL)
    }

    /// 如果多路复用会话已经关闭，返回 `true`。
    pub fn is_shutdown(&self) -> bool {
        matches!(self.inner.kind, Kind::Shutdown)
    }

    /// 如果是套接字 I/O 错误，返回 `true`。
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// 如果连接被取消，返回 `true`。
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// 如果错误由调用方的错误用法引起，返回 `true`。
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// 如果错误（或其原因链中的某一层）由超时引起，返回 `true`。
    ///
    /// 路线失败的 `source()` 是最后一次尝试，因此会沿着最后一次尝试继续查找。
    pub fn is_timeout(&self) -> bool {
        if self.find_source::<TimedOut>().is_some() {
            return true;
        }
        self.find_source::<io::Error>()
            .map_or(false, |io| io.kind() == io::ErrorKind::TimedOut)
    }

    /// 被抑制的错误。
    ///
    /// 对路线失败而言，这里按顺序保存了每一次连接尝试的错误。
    pub fn suppressed(&self) -> &[Error] {
        &self.inner.suppressed
    }

    pub(super) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl {
                kind,
                cause: None,
                suppressed: Vec::new(),
            }),
        }
    }

    pub(super) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    /// 是否值得用下一个候选策略重新握手。
    ///
    /// 只有协商层面的失败可以回退；证书、对端校验、超时与取消都不重试。
    pub(crate) fn is_retryable_handshake(&self) -> bool {
        matches!(self.inner.kind, Kind::Handshake(Handshake::Negotiation))
    }

    pub(crate) fn find_source<E: StdError + 'static>(&self) -> Option<&E> {
        let mut cause = self.source();
        while let Some(err) = cause {
            if let Some(typed) = err.downcast_ref() {
                return Some(typed);
            }
            cause = err.source();
        }

        None
    }

    /// 从原因链中提取 h2 的 Reason 码。
    pub(crate) fn h2_reason(&self) -> Option<h2::Reason> {
        self.find_source::<h2::Error>()
            .and_then(|h2_err| h2_err.reason())
    }

    /// 创建一个空的路线失败，随后通过 [`Error::add_attempt`] 追加每一次尝试。
    pub(super) fn new_route() -> Error {
        Error::new(Kind::Route)
    }

    /// 把一次连接尝试的错误追加到路线失败上。
    ///
    /// 连接池按路线汇总时，`attempt` 本身就是某条路线的路线失败，保持嵌套不展开。
    pub(crate) fn add_attempt(&mut self, attempt: Error) {
        debug_assert!(self.is_route());
        self.inner.suppressed.push(attempt);
    }

    /// 最近一次连接尝试的错误。
    pub(crate) fn last_attempt(&self) -> Option<&Error> {
        self.inner.suppressed.last()
    }

    pub(super) fn new_io(cause: io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(super) fn new_timeout(what: &'static str) -> Error {
        Error::new_io(io::Error::new(io::ErrorKind::TimedOut, what))
    }

    pub(super) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(super) fn new_shutdown() -> Error {
        Error::new(Kind::Shutdown)
    }

    pub(super) fn new_tunnel(tunnel: Tunnel) -> Error {
        Error::new(Kind::Tunnel(tunnel))
    }

    pub(super) fn new_handshake(handshake: Handshake) -> Error {
        Error::new(Kind::Handshake(handshake))
    }

    pub(super) fn new_user(user: User) -> Error {
        Error::new(Kind::User(user))
    }

    /// 创建一个来自 h2 库的错误。
    ///
    /// I/O 错误转换为 `Kind::Io`，GOAWAY 转换为 `Kind::Shutdown`，
    /// RST_STREAM 转换为 `Kind::Stream`，其余为 `Kind::Http2`。
    pub(super) fn new_h2(cause: h2::Error) -> Error {
        if cause.is_io() {
            match cause.into_io() {
                Some(io) => Error::new_io(io),
                None => Error::new(Kind::Io),
            }
        } else if cause.is_go_away() {
            Error::new(Kind::Shutdown).with(cause)
        } else if cause.is_reset() || cause.reason().is_some() {
            // 由裸 Reason 构造的错误同样按流重置处理
            Error::new(Kind::Stream).with(cause)
        } else {
            Error::new(Kind::Http2).with(cause)
        }
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Route => "failed to connect on every attempted route",
            Kind::Tunnel(Tunnel::UnexpectedStatus) => "unexpected response code for CONNECT",
            Kind::Tunnel(Tunnel::AuthenticationFailed) => "failed to authenticate with proxy",
            Kind::Tunnel(Tunnel::TooManyAttempts) => "too many tunnel connections attempted",
            Kind::Tunnel(Tunnel::BufferedBytes) => "TLS tunnel buffered too many bytes",
            Kind::Tunnel(Tunnel::Malformed) => "malformed proxy response",
            Kind::Tunnel(Tunnel::Socks) => "SOCKS proxy rejected the connection",
            Kind::Handshake(Handshake::Negotiation) => "TLS handshake failed",
            Kind::Handshake(Handshake::Certificate) => "peer certificate rejected",
            Kind::Handshake(Handshake::PeerUnverified) => "peer not verified",
            Kind::Handshake(Handshake::NoAcceptablePolicy) => {
                "unable to find acceptable TLS protocols"
            }
            Kind::Handshake(Handshake::UnexpectedProtocol) => "unexpected protocol negotiated",
            Kind::Stream => "stream error received",
            Kind::Shutdown => "connection shutdown",
            Kind::Io => "connection error",
            Kind::Canceled => "connection was canceled",
            Kind::Http2 => "http2 error",
            Kind::User(User::AlreadyConnected) => "connection already connected",
            Kind::User(User::CleartextNotPermitted) => {
                "CLEARTEXT communication not enabled for client"
            }
            Kind::User(User::PriorKnowledgeWithTls) => {
                "H2 prior knowledge cannot be used with TLS"
            }
            Kind::User(User::InvalidAddress) => "invalid address",
            Kind::User(User::NotConnected) => "connection is not connected",
            Kind::User(User::InvalidPin) => "invalid certificate pin",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("hyper_conduit::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        if !self.inner.suppressed.is_empty() {
            f.field(&self.inner.suppressed);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        if let Some(ref cause) = self.inner.cause {
            return Some(&**cause as &(dyn StdError + 'static));
        }
        // 路线失败没有单独的原因，最后一次尝试即为原因
        self.inner
            .suppressed
            .last()
            .map(|last| last as &(dyn StdError + 'static))
    }
}

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}
