use std::borrow::Cow;
use std::fmt;

use super::{CipherSuite, TlsVersion, TLS_FALLBACK_SCSV};

/// 可接受的协议版本与密码套件组合。
///
/// 策略本身不可变，协商时与套接字实际启用的集合求交集。
/// `cipher_suites` / `tls_versions` 为 `None` 表示接受套接字启用的全部取值。
#[derive(Clone, PartialEq, Eq)]
pub struct CipherSuitePolicy {
    is_tls: bool,
    supports_tls_extensions: bool,
    cipher_suites: Option<Cow<'static, [CipherSuite]>>,
    tls_versions: Option<Cow<'static, [TlsVersion]>>,
}

/// [`CipherSuitePolicy`] 的构建器。
#[derive(Clone, Debug)]
pub struct PolicyBuilder {
    is_tls: bool,
    supports_tls_extensions: bool,
    cipher_suites: Option<Vec<CipherSuite>>,
    tls_versions: Option<Vec<TlsVersion>>,
}

// 最严格的一组：只有前向保密的 AEAD 套件
const RESTRICTED_CIPHER_SUITES: &[CipherSuite] = &[
    CipherSuite::from_static("TLS_AES_128_GCM_SHA256"),
    CipherSuite::from_static("TLS_AES_256_GCM_SHA384"),
    CipherSuite::from_static("TLS_CHACHA20_POLY1305_SHA256"),
    CipherSuite::from_static("TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256"),
    CipherSuite::from_static("TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256"),
    CipherSuite::from_static("TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384"),
    CipherSuite::from_static("TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384"),
    CipherSuite::from_static("TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256"),
    CipherSuite::from_static("TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256"),
];

// 在上面的基础上加入仍被广泛部署的 CBC 与静态 RSA 套件
const APPROVED_CIPHER_SUITES: &[CipherSuite] = &[
    CipherSuite::from_static("TLS_AES_128_GCM_SHA256"),
    CipherSuite::from_static("TLS_AES_256_GCM_SHA384"),
    CipherSuite::from_static("TLS_CHACHA20_POLY1305_SHA256"),
    CipherSuite::from_static("TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256"),
    CipherSuite::from_static("TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256"),
    CipherSuite::from_static("TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384"),
    CipherSuite::from_static("TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384"),
    CipherSuite::from_static("TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256"),
    CipherSuite::from_static("TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256"),
    CipherSuite::from_static("TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA"),
    CipherSuite::from_static("TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA"),
    CipherSuite::from_static("TLS_RSA_WITH_AES_128_GCM_SHA256"),
    CipherSuite::from_static("TLS_RSA_WITH_AES_256_GCM_SHA384"),
    CipherSuite::from_static("TLS_RSA_WITH_AES_128_CBC_SHA"),
    CipherSuite::from_static("TLS_RSA_WITH_AES_256_CBC_SHA"),
    CipherSuite::from_static("TLS_RSA_WITH_3DES_EDE_CBC_SHA"),
];

impl CipherSuitePolicy {
    /// 安全但兼容性较差，只接受 TLS 1.3/1.2 与前向保密的 AEAD 套件。
    pub const RESTRICTED_TLS: CipherSuitePolicy = CipherSuitePolicy {
        is_tls: true,
        supports_tls_extensions: true,
        cipher_suites: Some(Cow::Borrowed(RESTRICTED_CIPHER_SUITES)),
        tls_versions: Some(Cow::Borrowed(&[TlsVersion::Tls13, TlsVersion::Tls12])),
    };

    /// 现代 TLS 配置，默认的首选策略。
    pub const MODERN_TLS: CipherSuitePolicy = CipherSuitePolicy {
        is_tls: true,
        supports_tls_extensions: true,
        cipher_suites: Some(Cow::Borrowed(APPROVED_CIPHER_SUITES)),
        tls_versions: Some(Cow::Borrowed(&[TlsVersion::Tls13, TlsVersion::Tls12])),
    };

    /// 向后兼容的回退配置，额外接受 TLS 1.1/1.0。
    pub const COMPATIBLE_TLS: CipherSuitePolicy = CipherSuitePolicy {
        is_tls: true,
        supports_tls_extensions: true,
        cipher_suites: Some(Cow::Borrowed(APPROVED_CIPHER_SUITES)),
        tls_versions: Some(Cow::Borrowed(&[
            TlsVersion::Tls13,
            TlsVersion::Tls12,
            TlsVersion::Tls11,
            TlsVersion::Tls10,
        ])),
    };

    /// 明文 HTTP。策略列表中没有它时，明文目标会被直接拒绝。
    pub const CLEARTEXT: CipherSuitePolicy = CipherSuitePolicy {
        is_tls: false,
        supports_tls_extensions: false,
        cipher_suites: None,
        tls_versions: None,
    };

    /// 以 `base` 为起点构建新策略。
    pub fn builder(base: &CipherSuitePolicy) -> PolicyBuilder {
        PolicyBuilder {
            is_tls: base.is_tls,
            supports_tls_extensions: base.supports_tls_extensions,
            cipher_suites: base.cipher_suites.as_ref().map(|s| s.to_vec()),
            tls_versions: base.tls_versions.as_ref().map(|v| v.to_vec()),
        }
    }

    /// 是否为 TLS 策略（否则为明文）。
    pub fn is_tls(&self) -> bool {
        self.is_tls
    }

    /// 是否允许使用 SNI、ALPN 等 TLS 扩展。
    pub fn supports_tls_extensions(&self) -> bool {
        self.supports_tls_extensions
    }

    /// 接受的密码套件，`None` 表示套接字启用的全部套件。
    pub fn cipher_suites(&self) -> Option<&[CipherSuite]> {
        self.cipher_suites.as_deref()
    }

    /// 接受的协议版本，`None` 表示套接字启用的全部版本。
    pub fn tls_versions(&self) -> Option<&[TlsVersion]> {
        self.tls_versions.as_deref()
    }

    /// 该策略能否用于启用了给定版本与套件的套接字。
    ///
    /// 协议版本与密码套件都必须至少有一个交集。
    pub fn is_compatible(&self, enabled_versions: &[TlsVersion], enabled_suites: &[CipherSuite]) -> bool {
        if !self.is_tls {
            return false;
        }
        if let Some(ref versions) = self.tls_versions {
            if !versions.iter().any(|v| enabled_versions.contains(v)) {
                return false;
            }
        }
        if let Some(ref suites) = self.cipher_suites {
            if !suites.iter().any(|s| enabled_suites.contains(s)) {
                return false;
            }
        }
        true
    }

    /// 计算套接字最终启用的版本与套件。
    ///
    /// 结果保持套接字自身的偏好顺序。`is_fallback` 且套接字支持回退信号时，
    /// 在套件末尾追加 [`TLS_FALLBACK_SCSV`]。
    pub(crate) fn intersect(
        &self,
        enabled_versions: &[TlsVersion],
        enabled_suites: &[CipherSuite],
        supported_suites: &[CipherSuite],
        is_fallback: bool,
    ) -> (Vec<TlsVersion>, Vec<CipherSuite>) {
        let versions = match self.tls_versions {
            Some(ref allowed) => enabled_versions
                .iter()
                .filter(|v| allowed.contains(v))
                .copied()
                .collect(),
            None => enabled_versions.to_vec(),
        };

        let mut suites: Vec<CipherSuite> = match self.cipher_suites {
            Some(ref allowed) => enabled_suites
                .iter()
                .filter(|s| allowed.contains(s))
                .cloned()
                .collect(),
            None => enabled_suites.to_vec(),
        };

        if is_fallback
            && supported_suites.contains(&TLS_FALLBACK_SCSV)
            && !suites.contains(&TLS_FALLBACK_SCSV)
        {
            suites.push(TLS_FALLBACK_SCSV);
        }

        (versions, suites)
    }
}

impl fmt::Debug for CipherSuitePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_tls {
            return f.write_str("CipherSuitePolicy()");
        }
        f.debug_struct("CipherSuitePolicy")
            .field("cipher_suites", &self.cipher_suites)
            .field("tls_versions", &self.tls_versions)
            .field("supports_tls_extensions", &self.supports_tls_extensions)
            .finish()
    }
}

impl PolicyBuilder {
    /// 只接受这些密码套件。
    pub fn cipher_suites(&mut self, suites: &[CipherSuite]) -> &mut Self {
        self.cipher_suites = Some(suites.to_vec());
        self
    }

    /// 接受套接字启用的全部密码套件。
    pub fn all_cipher_suites(&mut self) -> &mut Self {
        self.cipher_suites = None;
        self
    }

    /// 只接受这些协议版本。
    pub fn tls_versions(&mut self, versions: &[TlsVersion]) -> &mut Self {
        self.tls_versions = Some(versions.to_vec());
        self
    }

    /// 接受套接字启用的全部协议版本。
    pub fn all_tls_versions(&mut self) -> &mut Self {
        self.tls_versions = None;
        self
    }

    /// 是否允许 TLS 扩展（SNI、ALPN）。
    pub fn supports_tls_extensions(&mut self, enabled: bool) -> &mut Self {
        self.supports_tls_extensions = enabled;
        self
    }

    /// 构建策略。明文起点构建出的始终是 [`CipherSuitePolicy::CLEARTEXT`]。
    pub fn build(&self) -> CipherSuitePolicy {
        if !self.is_tls {
            return CipherSuitePolicy::CLEARTEXT;
        }
        CipherSuitePolicy {
            is_tls: true,
            supports_tls_extensions: self.supports_tls_extensions,
            cipher_suites: self.cipher_suites.clone().map(Cow::Owned),
            tls_versions: self.tls_versions.clone().map(Cow::Owned),
        }
    }
}
