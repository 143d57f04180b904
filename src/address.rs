//! 目标端点描述：`Address`、`Route` 与应用层协议
//!
//! [`Address`] 是不可变的逻辑端点：主机、端口、代理以及全部 TLS/信任策略。
//! [`Route`] 是到达某个 `Address` 的一条具体路径：一个代理加一个已解析的套接字地址。
//! 路线列表由外部的路线规划器给出，本 crate 不做 DNS 解析。

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::connect::{NoProxyAuthentication, ProxyAuthenticator, SocketFactory, TcpSocketFactory};
use crate::error::{Error, User};
use crate::tls::{CertificatePinner, CipherSuitePolicy, HostnameVerifier, TlsConnect};

/// 应用层协议。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// HTTP/1.1
    Http11,
    /// 通过 ALPN 协商的 HTTP/2
    Http2,
    /// 明文上、不经协商直接使用的 HTTP/2（prior knowledge）
    H2PriorKnowledge,
}

impl Protocol {
    /// ALPN 协议标识。prior knowledge 不参与 ALPN。
    pub fn alpn_id(&self) -> Option<&'static [u8]> {
        match self {
            Protocol::Http11 => Some(b"http/1.1"),
            Protocol::Http2 => Some(b"h2"),
            Protocol::H2PriorKnowledge => None,
        }
    }

    /// 由 ALPN 协商结果得到协议。
    pub fn from_alpn(id: &[u8]) -> Option<Protocol> {
        match id {
            b"http/1.1" => Some(Protocol::Http11),
            b"h2" => Some(Protocol::Http2),
            _ => None,
        }
    }

    /// 是否为多路复用协议。
    pub fn is_multiplexed(&self) -> bool {
        matches!(self, Protocol::Http2 | Protocol::H2PriorKnowledge)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Http11 => "http/1.1",
            Protocol::Http2 => "h2",
            Protocol::H2PriorKnowledge => "h2_prior_knowledge",
        })
    }
}

/// 代理。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Proxy {
    /// 直连
    Direct,
    /// HTTP 代理；HTTPS 目标通过 CONNECT 隧道
    Http(SocketAddr),
    /// SOCKS5 代理
    Socks(SocketAddr),
}

impl Proxy {
    /// 是否直连。
    pub fn is_direct(&self) -> bool {
        matches!(self, Proxy::Direct)
    }
}

/// 不可变的逻辑端点描述，克隆开销很小。
///
/// 两个地址“非主机相等”（除主机名外其余字段都相同）时，
/// 它们的连接才有可能被合并到同一个 HTTP/2 连接上。
#[derive(Clone)]
pub struct Address {
    inner: Arc<Inner>,
}

struct Inner {
    host: String,
    port: u16,
    proxy: Proxy,
    socket_factory: Arc<dyn SocketFactory>,
    tls: Option<Arc<dyn TlsConnect>>,
    proxy_authenticator: Arc<dyn ProxyAuthenticator>,
    hostname_verifier: HostnameVerifier,
    certificate_pinner: CertificatePinner,
    policies: Vec<CipherSuitePolicy>,
    protocols: Vec<Protocol>,
}

/// [`Address`] 的构建器。
pub struct Builder {
    host: String,
    port: u16,
    proxy: Proxy,
    socket_factory: Arc<dyn SocketFactory>,
    tls: Option<Arc<dyn TlsConnect>>,
    proxy_authenticator: Arc<dyn ProxyAuthenticator>,
    hostname_verifier: HostnameVerifier,
    certificate_pinner: CertificatePinner,
    policies: Vec<CipherSuitePolicy>,
    protocols: Vec<Protocol>,
}

impl Address {
    /// 以主机与端口创建构建器。
    ///
    /// 默认直连、明文、策略列表为 `[MODERN_TLS, CLEARTEXT]`、协议列表为 `[h2, http/1.1]`。
    pub fn builder(host: impl Into<String>, port: u16) -> Builder {
        Builder {
            host: host.into(),
            port,
            proxy: Proxy::Direct,
            socket_factory: Arc::new(TcpSocketFactory),
            tls: None,
            proxy_authenticator: Arc::new(NoProxyAuthentication),
            hostname_verifier: HostnameVerifier::Standard,
            certificate_pinner: CertificatePinner::none(),
            policies: vec![CipherSuitePolicy::MODERN_TLS, CipherSuitePolicy::CLEARTEXT],
            protocols: vec![Protocol::Http2, Protocol::Http11],
        }
    }

    /// 主机名（小写）。
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// 端口。
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// 配置的代理。
    pub fn proxy(&self) -> Proxy {
        self.inner.proxy
    }

    /// 是否要求 TLS。
    pub fn is_tls(&self) -> bool {
        self.inner.tls.is_some()
    }

    /// TLS 套接字工厂，明文地址为 `None`。
    pub fn tls(&self) -> Option<&Arc<dyn TlsConnect>> {
        self.inner.tls.as_ref()
    }

    /// 原始套接字工厂。
    pub fn socket_factory(&self) -> &Arc<dyn SocketFactory> {
        &self.inner.socket_factory
    }

    /// 代理认证器。
    pub fn proxy_authenticator(&self) -> &Arc<dyn ProxyAuthenticator> {
        &self.inner.proxy_authenticator
    }

    /// 主机名校验器。
    pub fn hostname_verifier(&self) -> &HostnameVerifier {
        &self.inner.hostname_verifier
    }

    /// 证书固定器。
    pub fn certificate_pinner(&self) -> &CertificatePinner {
        &self.inner.certificate_pinner
    }

    /// 有序的候选策略列表。
    pub fn policies(&self) -> &[CipherSuitePolicy] {
        &self.inner.policies
    }

    /// 可接受的应用层协议。
    pub fn protocols(&self) -> &[Protocol] {
        &self.inner.protocols
    }

    /// 除主机名之外的所有字段是否都相同。
    ///
    /// 工厂、认证器等 trait 对象按实例比较。
    pub fn equals_non_host(&self, other: &Address) -> bool {
        let (a, b) = (&*self.inner, &*other.inner);
        a.port == b.port
            && a.proxy == b.proxy
            && same_instance(&a.socket_factory, &b.socket_factory)
            && match (&a.tls, &b.tls) {
                (Some(x), Some(y)) => same_instance(x, y),
                (None, None) => true,
                _ => false,
            }
            && same_instance(&a.proxy_authenticator, &b.proxy_authenticator)
            && a.hostname_verifier.same(&b.hostname_verifier)
            && a.certificate_pinner == b.certificate_pinner
            && a.policies == b.policies
            && a.protocols == b.protocols
    }
}

fn same_instance<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl PartialEq for Address {
    fn eq(&self, other: &Address) -> bool {
        self.inner.host == other.inner.host && self.equals_non_host(other)
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.host.hash(state);
        self.inner.port.hash(state);
        self.inner.proxy.hash(state);
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .field("proxy", &self.inner.proxy)
            .field("tls", &self.is_tls())
            .field("protocols", &self.inner.protocols)
            .finish()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.inner.host, self.inner.port)
    }
}

impl Builder {
    /// 使用代理。
    pub fn proxy(&mut self, proxy: Proxy) -> &mut Self {
        self.proxy = proxy;
        self
    }

    /// 使用自定义原始套接字工厂。
    pub fn socket_factory(&mut self, factory: Arc<dyn SocketFactory>) -> &mut Self {
        self.socket_factory = factory;
        self
    }

    /// 要求 TLS，并使用 `tls` 完成握手。
    pub fn tls(&mut self, tls: Arc<dyn TlsConnect>) -> &mut Self {
        self.tls = Some(tls);
        self
    }

    /// 设置代理认证器。
    pub fn proxy_authenticator(&mut self, authenticator: Arc<dyn ProxyAuthenticator>) -> &mut Self {
        self.proxy_authenticator = authenticator;
        self
    }

    /// 设置主机名校验器。
    pub fn hostname_verifier(&mut self, verifier: HostnameVerifier) -> &mut Self {
        self.hostname_verifier = verifier;
        self
    }

    /// 设置证书固定器。
    pub fn certificate_pinner(&mut self, pinner: CertificatePinner) -> &mut Self {
        self.certificate_pinner = pinner;
        self
    }

    /// 设置有序的候选策略列表。
    pub fn policies(&mut self, policies: Vec<CipherSuitePolicy>) -> &mut Self {
        self.policies = policies;
        self
    }

    /// 设置可接受的应用层协议。
    pub fn protocols(&mut self, protocols: Vec<Protocol>) -> &mut Self {
        self.protocols = protocols;
        self
    }

    /// 校验并构建地址。
    ///
    /// - 主机名不能为空，端口不能为 0；
    /// - 协议列表必须包含 `http/1.1` 或 `h2_prior_knowledge`；
    /// - `h2_prior_knowledge` 只能单独出现。
    pub fn build(&self) -> crate::Result<Address> {
        let invalid = |msg: String| Error::new_user(User::InvalidAddress).with(msg);

        let host = self.host.trim_matches(|c| c == '[' || c == ']').to_ascii_lowercase();
        if host.is_empty() {
            return Err(invalid("empty host".into()));
        }
        if self.port == 0 {
            return Err(invalid(format!("unexpected port: {}", self.port)));
        }

        let mut protocols = Vec::with_capacity(self.protocols.len());
        for protocol in &self.protocols {
            if !protocols.contains(protocol) {
                protocols.push(*protocol);
            }
        }
        if !protocols.contains(&Protocol::H2PriorKnowledge) && !protocols.contains(&Protocol::Http11)
        {
            return Err(invalid(format!(
                "protocols must contain h2_prior_knowledge or http/1.1: {:?}",
                protocols
            )));
        }
        if protocols.contains(&Protocol::H2PriorKnowledge) && protocols.len() > 1 {
            return Err(invalid(format!(
                "protocols containing h2_prior_knowledge cannot use other protocols: {:?}",
                protocols
            )));
        }
        if self.policies.is_empty() {
            return Err(invalid("no cipher suite policies".into()));
        }

        Ok(Address {
            inner: Arc::new(Inner {
                host,
                port: self.port,
                proxy: self.proxy,
                socket_factory: self.socket_factory.clone(),
                tls: self.tls.clone(),
                proxy_authenticator: self.proxy_authenticator.clone(),
                hostname_verifier: self.hostname_verifier.clone(),
                certificate_pinner: self.certificate_pinner.clone(),
                policies: self.policies.clone(),
                protocols,
            }),
        })
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("proxy", &self.proxy)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// 到达 [`Address`] 的一条具体路径。
///
/// `socket_addr` 是实际要连接的地址：直连时是目标 IP，走代理时是代理地址。
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Route {
    address: Address,
    proxy: Proxy,
    socket_addr: SocketAddr,
}

impl Route {
    /// 直连路线。
    pub fn direct(address: Address, socket_addr: SocketAddr) -> Route {
        Route {
            address,
            proxy: Proxy::Direct,
            socket_addr,
        }
    }

    /// 经由地址配置的代理的路线；地址直连时等同于 [`Route::direct`]。
    ///
    /// 走代理时连接的是代理本身，`target` 只在直连时使用。
    pub fn new(address: Address, target: SocketAddr) -> Route {
        let (proxy, socket_addr) = match address.proxy() {
            Proxy::Direct => (Proxy::Direct, target),
            Proxy::Http(proxy) => (Proxy::Http(proxy), proxy),
            Proxy::Socks(proxy) => (Proxy::Socks(proxy), proxy),
        };
        Route {
            address,
            proxy,
            socket_addr,
        }
    }

    /// 所属地址。
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// 本路线使用的代理。
    pub fn proxy(&self) -> Proxy {
        self.proxy
    }

    /// 实际连接的套接字地址。
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// 是否需要 CONNECT 隧道：HTTPS 目标经由 HTTP 代理。
    pub fn requires_tunnel(&self) -> bool {
        self.address.is_tls() && matches!(self.proxy, Proxy::Http(_))
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Route({} via {:?} at {})", self.address, self.proxy, self.socket_addr)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::FakeTls;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn prior_knowledge_must_be_alone() {
        let err = Address::builder("example.com", 80)
            .protocols(vec![Protocol::H2PriorKnowledge, Protocol::Http11])
            .build()
            .unwrap_err();
        assert!(err.is_user());

        let ok = Address::builder("example.com", 80)
            .protocols(vec![Protocol::H2PriorKnowledge])
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn protocols_need_http11_or_prior_knowledge() {
        let err = Address::builder("example.com", 443)
            .protocols(vec![Protocol::Http2])
            .build()
            .unwrap_err();
        assert!(err.is_user());
    }

    #[test]
    fn host_is_normalized_and_validated() {
        let address = Address::builder("Example.COM", 443).build().unwrap();
        assert_eq!(address.host(), "example.com");
        assert!(Address::builder("", 443).build().is_err());
        assert!(Address::builder("example.com", 0).build().is_err());
    }

    #[test]
    fn non_host_equality_compares_everything_but_host() {
        let tls: Arc<dyn TlsConnect> = Arc::new(FakeTls::new());
        let factory: Arc<dyn SocketFactory> = Arc::new(TcpSocketFactory);
        let build = |host: &str, port: u16| {
            Address::builder(host, port)
                .tls(tls.clone())
                .socket_factory(factory.clone())
                .build()
                .unwrap()
        };
        let a = build("a.example.com", 443);
        let b = build("b.example.com", 443);
        assert!(a.equals_non_host(&b));
        assert_ne!(a, b);
        assert!(!a.equals_non_host(&build("b.example.com", 8443)));

        // 不同的 TLS 工厂实例
        let other_tls = Address::builder("b.example.com", 443)
            .tls(Arc::new(FakeTls::new()))
            .socket_factory(factory.clone())
            .build()
            .unwrap();
        assert!(!a.equals_non_host(&other_tls));
    }

    #[test]
    fn tunnel_only_for_tls_over_http_proxy() {
        let tls = Address::builder("example.com", 443)
            .tls(Arc::new(FakeTls::new()))
            .proxy(Proxy::Http(addr(3128)))
            .build()
            .unwrap();
        let route = Route::new(tls.clone(), addr(443));
        assert!(route.requires_tunnel());
        assert_eq!(route.socket_addr(), addr(3128));

        let plain = Address::builder("example.com", 80)
            .proxy(Proxy::Http(addr(3128)))
            .build()
            .unwrap();
        assert!(!Route::new(plain, addr(80)).requires_tunnel());

        let socks = Address::builder("example.com", 443)
            .tls(Arc::new(FakeTls::new()))
            .proxy(Proxy::Socks(addr(1080)))
            .build()
            .unwrap();
        assert!(!Route::new(socks, addr(443)).requires_tunnel());
    }

    #[test]
    fn alpn_round_trip() {
        assert_eq!(Protocol::from_alpn(b"h2"), Some(Protocol::Http2));
        assert_eq!(Protocol::Http11.alpn_id(), Some(&b"http/1.1"[..]));
        assert_eq!(Protocol::H2PriorKnowledge.alpn_id(), None);
        assert_eq!(Protocol::from_alpn(b"spdy/3.1"), None);
    }
}
