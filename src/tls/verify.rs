//! 握手完成后的信任策略：主机名校验与证书固定
//!
//! 证书链本身由 TLS 实现校验；这里只回答“这张证书是否属于这个主机”，
//! 以及“这条证书链是否命中了为该主机配置的 pin”。

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rustls_pki_types::{CertificateDer, ServerName};
use sha2::{Digest, Sha256};

use super::Handshake;
use crate::error::{Error, Handshake as HandshakeKind, User};

/// 自定义主机名校验。
pub trait VerifyHostname: Send + Sync + 'static {
    /// `handshake` 的对端证书是否对 `host` 有效。
    fn verify(&self, host: &str, handshake: &Handshake) -> bool;
}

/// 主机名校验器。
///
/// `Standard` 按 RFC 6125 用叶子证书的 subjectAltName 匹配主机名，不依赖任何连接状态，
/// 是唯一允许连接合并（coalescing）的校验器。
#[derive(Clone)]
pub enum HostnameVerifier {
    /// 内置的标准校验
    Standard,
    /// 用户提供的校验逻辑
    Custom(Arc<dyn VerifyHostname>),
}

impl HostnameVerifier {
    /// 校验 `handshake` 的对端证书是否对 `host` 有效。
    pub fn verify(&self, host: &str, handshake: &Handshake) -> bool {
        match self {
            HostnameVerifier::Standard => verify_standard(host, &handshake.peer_certificates),
            HostnameVerifier::Custom(custom) => custom.verify(host, handshake),
        }
    }

    /// 是否为内置的标准校验器。
    pub fn is_standard(&self) -> bool {
        matches!(self, HostnameVerifier::Standard)
    }

    /// 两个校验器是否相同：标准校验器彼此相同，自定义校验器按实例比较。
    pub(crate) fn same(&self, other: &HostnameVerifier) -> bool {
        match (self, other) {
            (HostnameVerifier::Standard, HostnameVerifier::Standard) => true,
            (HostnameVerifier::Custom(a), HostnameVerifier::Custom(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            _ => false,
        }
    }
}

impl Default for HostnameVerifier {
    fn default() -> Self {
        HostnameVerifier::Standard
    }
}

impl fmt::Debug for HostnameVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostnameVerifier::Standard => f.write_str("Standard"),
            HostnameVerifier::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

fn verify_standard(host: &str, certificates: &[CertificateDer<'static>]) -> bool {
    let leaf = match certificates.first() {
        Some(leaf) => leaf,
        None => return false,
    };
    let cert = match webpki::EndEntityCert::try_from(leaf) {
        Ok(cert) => cert,
        Err(_err) => {
            trace!("unparseable peer certificate: {:?}", _err);
            return false;
        }
    };
    let name = match ServerName::try_from(host) {
        Ok(name) => name,
        Err(_) => return false,
    };
    cert.verify_is_valid_for_subject_name(&name).is_ok()
}

/// 证书中声明的 DNS 名称，用于主机名校验失败时的诊断信息。
pub(crate) fn dns_names(certificate: &CertificateDer<'_>) -> Vec<String> {
    match webpki::EndEntityCert::try_from(certificate) {
        Ok(cert) => cert.valid_dns_names().map(str::to_owned).collect(),
        Err(_) => Vec::new(),
    }
}

/// 证书固定：把主机名模式映射到证书的 SHA-256 指纹。
///
/// 模式支持三种写法：
///
/// - `example.com`：只匹配该主机；
/// - `*.example.com`：匹配恰好多一级的子域名；
/// - `**.example.com`：匹配任意层级的子域名以及 `example.com` 本身。
///
/// pin 的格式为 `sha256/<base64>`，指纹按整张证书的 DER 编码计算。
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CertificatePinner {
    pins: Vec<Pin>,
}

#[derive(Clone, PartialEq, Eq)]
struct Pin {
    pattern: String,
    hash: [u8; 32],
}

/// [`CertificatePinner`] 的构建器。
#[derive(Debug, Default)]
pub struct PinnerBuilder {
    pins: Vec<Pin>,
}

impl CertificatePinner {
    /// 创建构建器。
    pub fn builder() -> PinnerBuilder {
        PinnerBuilder::default()
    }

    /// 没有任何 pin 的固定器，接受所有主机。
    pub fn none() -> CertificatePinner {
        CertificatePinner::default()
    }

    /// 计算证书的 pin，格式为 `sha256/<base64>`。
    pub fn pin(certificate: &CertificateDer<'_>) -> String {
        format!("sha256/{}", STANDARD.encode(sha256(certificate)))
    }

    /// 校验 `certificates` 是否满足为 `host` 配置的 pin。
    ///
    /// 没有为 `host` 配置 pin 时直接通过；否则证书链中至少一张证书必须命中。
    pub fn check(&self, host: &str, certificates: &[CertificateDer<'_>]) -> crate::Result<()> {
        let host = host.to_ascii_lowercase();
        let mut matching = self.pins.iter().filter(|pin| pin.matches(&host)).peekable();
        if matching.peek().is_none() {
            return Ok(());
        }
        let pinned: Vec<&Pin> = matching.collect();

        for cert in certificates {
            let hash = sha256(cert);
            if pinned.iter().any(|pin| pin.hash == hash) {
                return Ok(());
            }
        }

        let mut message = String::from("Certificate pinning failure!\n  Peer certificate chain:");
        for cert in certificates {
            message.push_str("\n    ");
            message.push_str(&CertificatePinner::pin(cert));
        }
        message.push_str(&format!("\n  Pinned certificates for {}:", host));
        for pin in &pinned {
            message.push_str(&format!("\n    sha256/{}", STANDARD.encode(pin.hash)));
        }
        debug!("{}", message);
        Err(Error::new_handshake(HandshakeKind::PeerUnverified).with(message))
    }

    /// 是否至少配置了一个 pin。
    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}

impl fmt::Debug for CertificatePinner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.pins.iter()).finish()
    }
}

impl PinnerBuilder {
    /// 为 `pattern` 添加一个 `sha256/<base64>` 格式的 pin。
    pub fn add(&mut self, pattern: &str, pin: &str) -> crate::Result<&mut Self> {
        let invalid = |msg: String| Error::new_user(User::InvalidPin).with(msg);

        let encoded = pin
            .strip_prefix("sha256/")
            .ok_or_else(|| invalid(format!("pins must start with 'sha256/': {}", pin)))?;
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|e| invalid(format!("invalid pin encoding {}: {}", pin, e)))?;
        let hash: [u8; 32] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| invalid(format!("invalid pin length: {}", pin)))?;

        let pattern = pattern.to_ascii_lowercase();
        let valid_pattern = match pattern.strip_prefix("**.").or_else(|| pattern.strip_prefix("*.")) {
            Some(rest) => !rest.is_empty() && !rest.contains('*'),
            None => !pattern.is_empty() && !pattern.contains('*'),
        };
        if !valid_pattern {
            return Err(invalid(format!("unexpected pattern: {}", pattern)));
        }

        self.pins.push(Pin { pattern, hash });
        Ok(self)
    }

    /// 构建固定器。
    pub fn build(&mut self) -> CertificatePinner {
        CertificatePinner {
            pins: std::mem::take(&mut self.pins),
        }
    }
}

impl Pin {
    fn matches(&self, host: &str) -> bool {
        if let Some(suffix) = self.pattern.strip_prefix("**.") {
            // 任意层级，包括裸域名
            host == suffix
                || host
                    .strip_suffix(suffix)
                    .map_or(false, |prefix| prefix.ends_with('.'))
        } else if let Some(suffix) = self.pattern.strip_prefix("*.") {
            // 恰好一级
            host.strip_suffix(suffix)
                .and_then(|prefix| prefix.strip_suffix('.'))
                .map_or(false, |label| !label.is_empty() && !label.contains('.'))
        } else {
            host == self.pattern
        }
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sha256/{}", self.pattern, STANDARD.encode(self.hash))
    }
}

fn sha256(certificate: &CertificateDer<'_>) -> [u8; 32] {
    Sha256::digest(certificate.as_ref()).into()
}
