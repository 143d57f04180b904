//! 基于 rustls 的 [`TlsConnect`] 实现
//!
//! rustls 只实现 TLS 1.2 与 1.3，也不支持发送 `TLS_FALLBACK_SCSV`；
//! 因此这里报告的能力是：ALPN、SNI 可用，回退信号不可用。
//! 每次握手都用选中策略的版本与套件临时构建一个 `ClientConfig`。

use std::fmt;
use std::io;
use std::sync::Arc;

use futures_core::future::BoxFuture;
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, ProtocolVersion, RootCertStore, SupportedProtocolVersion};
use rustls_pki_types::ServerName;
use tokio_rustls::TlsConnector;

use super::{
    CipherSuite, Handshake, HandshakeError, TlsCapabilities, TlsConnect, TlsParams, TlsVersion,
};
use crate::rt::BoxedIo;

/// 使用 rustls（ring 加密后端）完成握手的 TLS 套接字工厂。
#[derive(Clone)]
pub struct RustlsConnector {
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
}

impl RustlsConnector {
    /// 用给定的根证书创建连接器。
    pub fn new(roots: RootCertStore) -> Self {
        RustlsConnector::with_provider(roots, rustls::crypto::ring::default_provider())
    }

    /// 用给定的根证书与加密后端创建连接器。
    pub fn with_provider(roots: RootCertStore, provider: CryptoProvider) -> Self {
        RustlsConnector {
            roots: Arc::new(roots),
            provider: Arc::new(provider),
        }
    }

    fn client_config(&self, params: &TlsParams) -> Result<ClientConfig, HandshakeError> {
        let cipher_suites = self
            .provider
            .cipher_suites
            .iter()
            .filter(|suite| params.cipher_suites.contains(&suite_name(suite)))
            .copied()
            .collect::<Vec<_>>();
        if cipher_suites.is_empty() {
            return Err(HandshakeError::Negotiation(
                format!("no supported cipher suite in {:?}", params.cipher_suites).into(),
            ));
        }

        let versions = params
            .versions
            .iter()
            .filter_map(|version| match version {
                TlsVersion::Tls13 => Some(&rustls::version::TLS13),
                TlsVersion::Tls12 => Some(&rustls::version::TLS12),
                _ => None,
            })
            .collect::<Vec<&'static SupportedProtocolVersion>>();
        if versions.is_empty() {
            return Err(HandshakeError::Negotiation(
                format!("no supported protocol version in {:?}", params.versions).into(),
            ));
        }

        let provider = CryptoProvider {
            cipher_suites,
            ..(*self.provider).clone()
        };
        let mut config = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&versions)
            .map_err(|e| HandshakeError::Negotiation(Box::new(e)))?
            .with_root_certificates(self.roots.clone())
            .with_no_client_auth();
        config.alpn_protocols = params.alpn_protocols.clone();
        config.enable_sni = params.sni;
        Ok(config)
    }
}

impl TlsConnect for RustlsConnector {
    fn enabled_versions(&self) -> Vec<TlsVersion> {
        vec![TlsVersion::Tls13, TlsVersion::Tls12]
    }

    fn enabled_cipher_suites(&self) -> Vec<CipherSuite> {
        self.provider.cipher_suites.iter().map(suite_name).collect()
    }

    fn capabilities(&self) -> TlsCapabilities {
        TlsCapabilities {
            alpn: true,
            sni: true,
            fallback_scsv: false,
        }
    }

    fn connect(
        &self,
        io: BoxedIo,
        host: &str,
        params: TlsParams,
    ) -> BoxFuture<'static, Result<(BoxedIo, Handshake), HandshakeError>> {
        let config = self.client_config(&params);
        let server_name = ServerName::try_from(host.to_owned());

        Box::pin(async move {
            let connector = TlsConnector::from(Arc::new(config?));
            let server_name = server_name.map_err(|e| HandshakeError::Negotiation(Box::new(e)))?;

            let stream = connector
                .connect(server_name, io)
                .await
                .map_err(classify)?;

            let (_, session) = stream.get_ref();
            let tls_version = match session.protocol_version() {
                Some(ProtocolVersion::TLSv1_3) => TlsVersion::Tls13,
                Some(ProtocolVersion::TLSv1_2) => TlsVersion::Tls12,
                other => {
                    return Err(HandshakeError::Negotiation(
                        format!("unexpected protocol version {:?}", other).into(),
                    ))
                }
            };
            let cipher_suite = match session.negotiated_cipher_suite() {
                Some(suite) => suite_name(&suite),
                None => return Err(HandshakeError::Negotiation("no negotiated cipher suite".into())),
            };
            let handshake = Handshake {
                tls_version,
                cipher_suite,
                peer_certificates: session
                    .peer_certificates()
                    .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect())
                    .unwrap_or_default(),
                alpn: session.alpn_protocol().map(|p| p.to_vec()),
            };

            Ok((Box::new(stream) as BoxedIo, handshake))
        })
    }
}

impl fmt::Debug for RustlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsConnector")
            .field("roots", &self.roots.len())
            .field("cipher_suites", &self.provider.cipher_suites.len())
            .finish()
    }
}

/// rustls 的 TLS 1.3 套件以 `TLS13_` 开头，转换为 IANA 名称。
fn suite_name(suite: &rustls::SupportedCipherSuite) -> CipherSuite {
    let name = format!("{:?}", suite.suite());
    match name.strip_prefix("TLS13_") {
        Some(rest) => CipherSuite::new(format!("TLS_{}", rest)),
        None => CipherSuite::new(name),
    }
}

/// 区分证书被拒、协商失败与普通 I/O 错误。
fn classify(err: io::Error) -> HandshakeError {
    let tls_err = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .cloned();
    match tls_err {
        Some(rustls::Error::InvalidCertificate(reason)) => {
            HandshakeError::Certificate(format!("invalid peer certificate: {:?}", reason).into())
        }
        Some(other) => HandshakeError::Negotiation(Box::new(other)),
        None => HandshakeError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_suites_use_iana_names() {
        let connector = RustlsConnector::new(RootCertStore::empty());
        let suites = connector.enabled_cipher_suites();
        assert!(suites.contains(&CipherSuite::from_static("TLS_AES_128_GCM_SHA256")));
        assert!(suites.contains(&CipherSuite::from_static(
            "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256"
        )));
        assert!(!suites.iter().any(|s| s.as_str().starts_with("TLS13_")));
    }

    #[test]
    fn config_rejects_params_without_shared_suites() {
        let connector = RustlsConnector::new(RootCertStore::empty());
        let params = TlsParams {
            versions: vec![TlsVersion::Tls12],
            cipher_suites: vec![CipherSuite::from_static("TLS_RSA_WITH_3DES_EDE_CBC_SHA")],
            alpn_protocols: Vec::new(),
            sni: true,
        };
        assert!(matches!(
            connector.client_config(&params),
            Err(HandshakeError::Negotiation(_))
        ));
    }

    #[test]
    fn config_applies_alpn_and_sni() {
        let connector = RustlsConnector::new(RootCertStore::empty());
        let params = TlsParams {
            versions: vec![TlsVersion::Tls13],
            cipher_suites: connector.enabled_cipher_suites(),
            alpn_protocols: vec![b"h2".to_vec(), b"http/1.1".to_vec()],
            sni: false,
        };
        let config = connector.client_config(&params).expect("config");
        assert_eq!(config.alpn_protocols, params.alpn_protocols);
        assert!(!config.enable_sni);
    }
}
