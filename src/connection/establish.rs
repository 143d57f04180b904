//! 连接建立过程：套接字 → [SOCKS] → [隧道] → [TLS] → 协议 → [HTTP/2 会话]。

use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};

use super::{Link, State, Transport, TransportConnection};
use crate::address::{Address, Protocol, Proxy};
use crate::common::io::BufferedStream;
use crate::connect::{socks, tunnel};
use crate::error::{Error, Handshake as HandshakeKind, Tunnel, User};
use crate::proto::h2::{self as session, SessionObserver};
use crate::rt::BoxedIo;
use crate::tls::{
    dns_names, CertificatePinner, ConnectionSelector, Handshake, TlsConnect, TlsParams,
};

impl TransportConnection {
    /// 建立连接。每个连接只能调用一次。
    ///
    /// TLS 握手在协商层面失败、且允许重试时，换用下一个候选策略在新套接字上重来。
    /// 失败时返回路线错误，其中按顺序保存了每一次尝试的错误；连接进入 `Closed`。
    pub async fn connect(self: &Arc<Self>) -> crate::Result<()> {
        if self.connect_started.swap(true, Ordering::AcqRel) {
            return Err(Error::new_user(User::AlreadyConnected));
        }

        let address = self.route.address().clone();
        let mut failure = Error::new_route();

        if let Err(err) = check_protocols(&address) {
            self.config.listener.connect_failed(&self.route, &err);
            failure.add_attempt(err);
            self.set_state(State::Closed);
            return Err(failure);
        }

        let mut selector = ConnectionSelector::new(address.policies().to_vec());
        loop {
            let attempt = self.connect_attempt(&address, &mut selector).await;
            let err = match attempt {
                Ok(link) if !self.cancel.is_canceled() => {
                    let protocol = link.protocol;
                    let _ = self.link.set(link);
                    self.set_state(State::Active);
                    debug!("{} connected to {} using {}", self.id, self.route, protocol);
                    return Ok(());
                }
                Ok(_) => Error::new_canceled(),
                Err(err) if self.cancel.is_canceled() && !err.is_canceled() => {
                    Error::new_canceled().with(err)
                }
                Err(err) => err,
            };

            debug!("{} connect attempt failed: {}", self.id, err);
            self.config.listener.connect_failed(&self.route, &err);
            let retry = self.config.retry_on_connection_failure
                && address.is_tls()
                && !err.is_canceled()
                && selector.notify_failure(&err);
            failure.add_attempt(err);

            if !retry {
                self.set_state(State::Closed);
                return Err(failure);
            }
            trace!("{} retrying with the next TLS policy", self.id);
        }
    }

    async fn connect_attempt(
        self: &Arc<Self>,
        address: &Address,
        selector: &mut ConnectionSelector,
    ) -> crate::Result<Link> {
        self.set_state(State::SocketConnecting);
        let mut stream = self.open_socket().await?;

        if let Proxy::Socks(_) = self.route.proxy() {
            socks::handshake(&mut stream, address).await?;
        }

        if self.route.requires_tunnel() {
            self.set_state(State::TunnelNegotiating);
            stream = tunnel::establish(stream, &self.route, &self.config, || self.open_socket()).await?;
        }

        let (protocol, handshake, mut stream) = match address.tls() {
            Some(tls) => {
                self.set_state(State::TlsHandshaking);
                let (stream, handshake) = self
                    .tls_handshake(tls.as_ref(), address, selector, stream)
                    .await?;
                let protocol = match handshake.alpn.as_deref() {
                    None => Protocol::Http11,
                    Some(id) => Protocol::from_alpn(id).ok_or_else(|| {
                        Error::new_handshake(HandshakeKind::UnexpectedProtocol)
                            .with(format!("unexpected protocol: {}", String::from_utf8_lossy(id)))
                    })?,
                };
                (protocol, Some(handshake), stream)
            }
            None if address.protocols() == [Protocol::H2PriorKnowledge] => {
                (Protocol::H2PriorKnowledge, None, stream)
            }
            None => (Protocol::Http11, None, stream),
        };
        self.set_state(State::ProtocolNegotiated);

        let transport = if protocol.is_multiplexed() {
            // 会话驱动任务持续读取，超时由保活 PING 负责
            stream.set_read_timeout(None);
            stream.set_write_timeout(None);
            let observer: Weak<dyn SessionObserver> = Arc::downgrade(self) as Weak<TransportConnection>;
            let session =
                session::handshake(stream, &self.config.http2, observer, &self.config.exec).await?;
            Transport::Http2(session)
        } else {
            Transport::Http1(Mutex::new(Some(stream)))
        };

        Ok(Link {
            protocol,
            handshake,
            transport,
        })
    }

    /// 打开到路线套接字地址（目标或代理）的原始套接字，施加连接超时。
    pub(super) async fn open_socket(&self) -> crate::Result<BufferedStream<BoxedIo>> {
        let addr = self.route.socket_addr();
        let factory = self.route.address().socket_factory();
        trace!("{} connecting to {}", self.id, addr);

        let io = match tokio::time::timeout(self.config.connect_timeout, factory.connect(addr)).await {
            Ok(Ok(io)) => io,
            Ok(Err(err)) => {
                let kind = err.kind();
                return Err(Error::new_io(io::Error::new(
                    kind,
                    format!("failed to connect to {}: {}", addr, err),
                )));
            }
            Err(_elapsed) => return Err(Error::new_timeout("connect timed out")),
        };
        if self.cancel.is_canceled() {
            return Err(Error::new_canceled());
        }

        Ok(self.buffered(Box::new(self.cancel.wrap(io))))
    }

    fn buffered(&self, io: BoxedIo) -> BufferedStream<BoxedIo> {
        let mut stream = BufferedStream::new(io);
        stream.set_read_timeout(self.config.read_timeout);
        stream.set_write_timeout(self.config.write_timeout);
        stream
    }

    /// 用选择器给出的下一个策略握手，随后校验主机名与证书固定。
    async fn tls_handshake(
        &self,
        tls: &dyn TlsConnect,
        address: &Address,
        selector: &mut ConnectionSelector,
        stream: BufferedStream<BoxedIo>,
    ) -> crate::Result<(BufferedStream<BoxedIo>, Handshake)> {
        let selected = selector.configure(tls)?;
        let capabilities = tls.capabilities();
        let extensions = selected.policy.supports_tls_extensions();
        let alpn_protocols = if extensions && capabilities.alpn {
            address
                .protocols()
                .iter()
                .filter_map(Protocol::alpn_id)
                .map(<[u8]>::to_vec)
                .collect()
        } else {
            Vec::new()
        };
        let params = TlsParams {
            versions: selected.versions,
            cipher_suites: selected.cipher_suites,
            alpn_protocols,
            sni: extensions && capabilities.sni,
        };

        let (io, leftover) = stream.into_parts();
        if !leftover.is_empty() {
            return Err(Error::new_tunnel(Tunnel::BufferedBytes));
        }

        let connecting = tls.connect(io, address.host(), params);
        let (io, handshake) = match self.config.read_timeout {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_elapsed| Error::new_timeout("TLS handshake timed out"))??,
            None => connecting.await?,
        };

        if !address.hostname_verifier().verify(address.host(), &handshake) {
            let detail = match handshake.peer_certificates.first() {
                Some(leaf) => format!(
                    "hostname {} not verified:\n    certificate: {}\n    subjectAltNames: {:?}",
                    address.host(),
                    CertificatePinner::pin(leaf),
                    dns_names(leaf)
                ),
                None => format!("hostname {} not verified (no certificates)", address.host()),
            };
            return Err(Error::new_handshake(HandshakeKind::PeerUnverified).with(detail));
        }
        address
            .certificate_pinner()
            .check(address.host(), &handshake.peer_certificates)?;

        trace!(
            "{} TLS established: {} {} alpn={:?}",
            self.id,
            handshake.tls_version,
            handshake.cipher_suite,
            handshake.alpn.as_deref().map(String::from_utf8_lossy)
        );
        Ok((self.buffered(io), handshake))
    }
}

/// 明文目标必须允许明文；HTTP/2 prior knowledge 不能与 TLS 同用。
fn check_protocols(address: &Address) -> crate::Result<()> {
    if address.is_tls() {
        if address.protocols().contains(&Protocol::H2PriorKnowledge) {
            return Err(Error::new_user(User::PriorKnowledgeWithTls));
        }
    } else if !address.policies().iter().any(|policy| !policy.is_tls()) {
        return Err(Error::new_user(User::CleartextNotPermitted));
    }
    Ok(())
}
