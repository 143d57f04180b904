//! 测试用的假 TLS、内存套接字工厂与事件记录器。

use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_core::future::BoxFuture;
use rustls_pki_types::CertificateDer;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::address::Route;
use crate::connect::SocketFactory;
use crate::connection::{ConnectionId, State};
use crate::listener::ConnectionListener;
use crate::rt::BoxedIo;
use crate::tls::{
    CipherSuite, Handshake, HandshakeError, TlsCapabilities, TlsConnect, TlsParams, TlsVersion,
    TLS_FALLBACK_SCSV,
};
use crate::Error;

/// 不做任何加密的 TLS 工厂：字节流原样透传，握手结果由配置决定。
#[derive(Clone)]
pub(crate) struct FakeTls {
    versions: Vec<TlsVersion>,
    suites: Vec<CipherSuite>,
    fallback_scsv: bool,
    failures: Arc<AtomicUsize>,
    certificates: Vec<CertificateDer<'static>>,
    server_alpn: Vec<Vec<u8>>,
    forced_alpn: Option<Vec<u8>>,
    params: Arc<Mutex<Vec<TlsParams>>>,
}

impl FakeTls {
    pub(crate) fn new() -> FakeTls {
        FakeTls {
            versions: vec![TlsVersion::Tls13, TlsVersion::Tls12],
            suites: vec![
                CipherSuite::from_static("TLS_AES_128_GCM_SHA256"),
                CipherSuite::from_static("TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256"),
            ],
            fallback_scsv: false,
            failures: Arc::new(AtomicUsize::new(0)),
            certificates: Vec::new(),
            server_alpn: Vec::new(),
            forced_alpn: None,
            params: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn versions(mut self, versions: &[TlsVersion]) -> FakeTls {
        self.versions = versions.to_vec();
        self
    }

    pub(crate) fn cipher_suites(mut self, suites: &[CipherSuite]) -> FakeTls {
        self.suites = suites.to_vec();
        self
    }

    pub(crate) fn fallback_scsv(mut self, enabled: bool) -> FakeTls {
        self.fallback_scsv = enabled;
        self
    }

    /// 前 `n` 次握手以协商失败结束。
    pub(crate) fn fail_negotiations(self, n: usize) -> FakeTls {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    /// 对端出示一张覆盖 `hosts` 的自签名证书。
    pub(crate) fn for_hosts(mut self, hosts: &[&str]) -> FakeTls {
        self.certificates = vec![certificate(hosts)];
        self
    }

    /// 对端通过 ALPN 接受的协议，按偏好排列。
    pub(crate) fn server_alpn(mut self, protocols: &[&[u8]]) -> FakeTls {
        self.server_alpn = protocols.iter().map(|p| p.to_vec()).collect();
        self
    }

    /// 对端无视客户端的提议，总是选择 `protocol`。
    pub(crate) fn force_alpn(mut self, protocol: &[u8]) -> FakeTls {
        self.forced_alpn = Some(protocol.to_vec());
        self
    }

    /// 对端出示的叶子证书。
    pub(crate) fn leaf(&self) -> &CertificateDer<'static> {
        self.certificates.first().expect("for_hosts not called")
    }

    /// 每次握手收到的参数。
    pub(crate) fn params(&self) -> Vec<TlsParams> {
        self.params.lock().unwrap().clone()
    }
}

impl TlsConnect for FakeTls {
    fn enabled_versions(&self) -> Vec<TlsVersion> {
        self.versions.clone()
    }

    fn enabled_cipher_suites(&self) -> Vec<CipherSuite> {
        self.suites.clone()
    }

    fn supported_cipher_suites(&self) -> Vec<CipherSuite> {
        let mut suites = self.suites.clone();
        if self.fallback_scsv {
            suites.push(TLS_FALLBACK_SCSV);
        }
        suites
    }

    fn capabilities(&self) -> TlsCapabilities {
        TlsCapabilities {
            alpn: true,
            sni: true,
            fallback_scsv: self.fallback_scsv,
        }
    }

    fn connect(
        &self,
        io: BoxedIo,
        _host: &str,
        params: TlsParams,
    ) -> BoxFuture<'static, Result<(BoxedIo, Handshake), HandshakeError>> {
        self.params.lock().unwrap().push(params.clone());
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let handshake = Handshake {
            tls_version: params.versions.first().copied().unwrap_or(TlsVersion::Tls12),
            cipher_suite: params
                .cipher_suites
                .first()
                .cloned()
                .unwrap_or_else(|| CipherSuite::from_static("TLS_AES_128_GCM_SHA256")),
            peer_certificates: self.certificates.clone(),
            alpn: self.forced_alpn.clone().or_else(|| {
                self.server_alpn
                    .iter()
                    .find(|p| params.alpn_protocols.contains(p))
                    .cloned()
            }),
        };

        Box::pin(async move {
            if fail {
                return Err(HandshakeError::Negotiation("handshake_failure alert".into()));
            }
            Ok((io, handshake))
        })
    }
}

pub(crate) fn certificate(hosts: &[&str]) -> CertificateDer<'static> {
    let names = hosts.iter().map(|h| h.to_string()).collect::<Vec<_>>();
    rcgen::generate_simple_self_signed(names)
        .expect("rcgen")
        .cert
        .der()
        .clone()
}

type Serve = Arc<dyn Fn(DuplexStream) -> BoxFuture<'static, ()> + Send + Sync>;

/// 每次连接创建一条内存管道，对端交给 `serve` 在新任务中处理。
#[derive(Clone)]
pub(crate) struct DuplexFactory {
    serve: Serve,
    refused: HashSet<SocketAddr>,
    connects: Arc<Mutex<Vec<SocketAddr>>>,
}

impl DuplexFactory {
    pub(crate) fn new<F, Fut>(serve: F) -> DuplexFactory
    where
        F: Fn(DuplexStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        DuplexFactory {
            serve: Arc::new(move |io| -> BoxFuture<'static, ()> { Box::pin(serve(io)) }),
            refused: HashSet::new(),
            connects: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 对端保持连接但从不发送数据。
    pub(crate) fn silent() -> DuplexFactory {
        DuplexFactory::new(|io| async move {
            let mut io = io;
            let mut buf = [0u8; 1024];
            while let Ok(n) = io.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        })
    }

    /// 对端立即关闭连接。
    pub(crate) fn closing() -> DuplexFactory {
        DuplexFactory::new(|io| async move { drop(io) })
    }

    /// 对端是接受任意流并返回 200 的 HTTP/2 服务端。
    pub(crate) fn h2(max_concurrent_streams: u32) -> DuplexFactory {
        DuplexFactory::new(move |io| crate::proto::h2::tests::serve(io, max_concurrent_streams))
    }

    /// 对端是接受 CONNECT 的 HTTP 代理，隧道建立后保持沉默。
    pub(crate) fn tunneling_proxy() -> DuplexFactory {
        DuplexFactory::new(|mut io| async move {
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                match io.read(&mut byte).await {
                    Ok(1) => head.push(byte[0]),
                    _ => return,
                }
            }
            if io
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .is_err()
            {
                return;
            }
            let mut buf = [0u8; 1024];
            while let Ok(n) = io.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        })
    }

    /// 连接 `addr` 时返回连接被拒绝。
    pub(crate) fn refuse(mut self, addr: SocketAddr) -> DuplexFactory {
        self.refused.insert(addr);
        self
    }

    /// 按顺序记录的连接目标。
    pub(crate) fn connects(&self) -> Vec<SocketAddr> {
        self.connects.lock().unwrap().clone()
    }
}

impl SocketFactory for DuplexFactory {
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxedIo>> {
        self.connects.lock().unwrap().push(addr);
        if self.refused.contains(&addr) {
            return Box::pin(async { Err(io::Error::from(io::ErrorKind::ConnectionRefused)) });
        }
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn((self.serve)(server));
        Box::pin(async move { Ok(Box::new(client) as BoxedIo) })
    }
}

/// 记录所有连接事件的监听器。
#[derive(Default)]
pub(crate) struct RecordingListener {
    pub(crate) states: Mutex<Vec<State>>,
    pub(crate) failures: AtomicUsize,
    pub(crate) acquired: AtomicUsize,
    pub(crate) released: AtomicUsize,
}

impl RecordingListener {
    pub(crate) fn states(&self) -> Vec<State> {
        self.states.lock().unwrap().clone()
    }
}

impl ConnectionListener for RecordingListener {
    fn state_changed(&self, _: ConnectionId, _: &Route, state: State) {
        self.states.lock().unwrap().push(state);
    }

    fn connect_failed(&self, _: &Route, _: &Error) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_acquired(&self, _: ConnectionId) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_released(&self, _: ConnectionId) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// 轮询直到 `check` 成立，最多约一秒。
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
