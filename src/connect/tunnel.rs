//! 通过 HTTP 代理建立 CONNECT 隧道
//!
//! HTTPS 目标经 HTTP 代理访问时，先在明文套接字上发送 `CONNECT host:port`，
//! 代理返回 `200` 后这条套接字就成为到目标的透明字节通道，随后在其上进行 TLS 握手。
//!
//! 为了不把敏感头部泄露给代理，CONNECT 只携带最小头部集合：
//! `Host`、`Proxy-Connection` 与 `User-Agent`，以及认证器给出的凭据。

use std::future::Future;
use std::pin::Pin;

use bytes::BytesMut;
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, PROXY_AUTHENTICATE, USER_AGENT};
use http::{Method, Request, Response, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncWriteExt};

use crate::address::{Address, Route};
use crate::common::io::BufferedStream;
use crate::config::ConnectConfig;
use crate::error::{Error, Tunnel, User};
use crate::rt::BoxedIo;

/// 代理反复以 `407` + `Connection: close` 要求重新认证时，CONNECT 的最大尝试次数。
///
/// 可通过 [`ConnectConfig::max_tunnel_attempts`] 覆盖。
pub const MAX_TUNNEL_ATTEMPTS: usize = 21;

/// 代理响应头的最大长度
const MAX_RESPONSE_HEAD: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;

/// 抢先认证时合成挑战所带的 `Proxy-Authenticate` 值
const PREEMPTIVE_CHALLENGE: &str = "OkHttp-Preemptive";

static PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// 在已连接到代理的 `stream` 上建立隧道。
///
/// 代理要求关闭连接时，用 `reconnect` 打开一条新的套接字并重发带新凭据的 CONNECT。
/// 每发送一次 CONNECT 计为一次尝试，超过 `config.max_tunnel_attempts` 后以
/// `TooManyAttempts` 失败。
pub(crate) async fn establish<F, Fut>(
    mut stream: BufferedStream<BoxedIo>,
    route: &Route,
    config: &ConnectConfig,
    mut reconnect: F,
) -> crate::Result<BufferedStream<BoxedIo>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<BufferedStream<BoxedIo>>>,
{
    let authority = authority(route.address());
    let mut request = initial_request(route, &authority, config)?;
    let mut attempts = 0;

    loop {
        attempts += 1;
        trace!("CONNECT {} via {:?} (attempt {})", authority, route.proxy(), attempts);
        let response = round_trip(&mut stream, &request, &authority).await?;

        match response.status() {
            StatusCode::OK => {
                // 代理不应在 ClientHello 之前发送任何数据
                if !stream.buffered().is_empty() {
                    return Err(Error::new_tunnel(Tunnel::BufferedBytes));
                }
                debug!("tunnel established to {} via {:?}", authority, route.proxy());
                return Ok(stream);
            }
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                let next = route
                    .address()
                    .proxy_authenticator()
                    .authenticate(route, &response)
                    .ok_or_else(|| Error::new_tunnel(Tunnel::AuthenticationFailed))?;
                request = with_defaults(next, &authority, config)?;

                if attempts >= config.max_tunnel_attempts {
                    return Err(Error::new_tunnel(Tunnel::TooManyAttempts).with(format!(
                        "too many tunnel connections attempted: {}",
                        attempts
                    )));
                }

                if wants_close(&response) {
                    debug!("proxy closed the connection after 407, reconnecting");
                    drop(stream);
                    stream = reconnect().await?;
                } else {
                    skip_body(&mut stream, &response).await?;
                }
            }
            status => {
                return Err(Error::new_tunnel(Tunnel::UnexpectedStatus)
                    .with(format!("unexpected response code for CONNECT: {}", status.as_u16())));
            }
        }
    }
}

/// `host:port` 形式的隧道目标，IPv6 地址加方括号。
fn authority(address: &Address) -> String {
    if address.host().contains(':') {
        format!("[{}]:{}", address.host(), address.port())
    } else {
        format!("{}:{}", address.host(), address.port())
    }
}

/// 第一个 CONNECT 请求。
///
/// 先给认证器一个合成的 `407` 挑战，认证器据此可以抢先提供凭据。
fn initial_request(
    route: &Route,
    authority: &str,
    config: &ConnectConfig,
) -> crate::Result<Request<()>> {
    let request = connect_request(authority)?;

    let challenge = Response::builder()
        .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
        .version(Version::HTTP_11)
        .header(PROXY_AUTHENTICATE, PREEMPTIVE_CHALLENGE)
        .body(())
        .map_err(|e| Error::new_tunnel(Tunnel::Malformed).with(e))?;

    match route
        .address()
        .proxy_authenticator()
        .authenticate(route, &challenge)
    {
        Some(preemptive) => with_defaults(preemptive, authority, config),
        None => with_defaults(request, authority, config),
    }
}

fn connect_request(authority: &str) -> crate::Result<Request<()>> {
    Request::builder()
        .method(Method::CONNECT)
        .uri(authority)
        .version(Version::HTTP_11)
        .body(())
        .map_err(|e| Error::new_user(User::InvalidAddress).with(e))
}

/// 补齐 CONNECT 必需的头部，认证器给出的值优先。
fn with_defaults(
    mut request: Request<()>,
    authority: &str,
    config: &ConnectConfig,
) -> crate::Result<Request<()>> {
    let invalid = |e: http::header::InvalidHeaderValue| Error::new_user(User::InvalidAddress).with(e);
    let headers = request.headers_mut();
    if !headers.contains_key(HOST) {
        headers.insert(HOST, HeaderValue::from_str(authority).map_err(invalid)?);
    }
    if !headers.contains_key(&PROXY_CONNECTION) {
        headers.insert(PROXY_CONNECTION.clone(), HeaderValue::from_static("Keep-Alive"));
    }
    if !headers.contains_key(USER_AGENT) {
        headers.insert(USER_AGENT, HeaderValue::from_str(&config.user_agent).map_err(invalid)?);
    }
    Ok(request)
}

/// 发送一次 CONNECT 并读取响应头。
async fn round_trip(
    stream: &mut BufferedStream<BoxedIo>,
    request: &Request<()>,
    authority: &str,
) -> crate::Result<Response<()>> {
    let mut head = BytesMut::with_capacity(256);
    head.extend_from_slice(b"CONNECT ");
    head.extend_from_slice(authority.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in request.headers() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");

    stream.write_all(&head).await.map_err(Error::new_io)?;
    stream.flush().await.map_err(Error::new_io)?;

    loop {
        if let Some((response, len)) = parse_head(stream.buffered())? {
            Pin::new(&mut *stream).consume(len);
            return Ok(response);
        }
        if stream.buffered().len() >= MAX_RESPONSE_HEAD {
            return Err(Error::new_tunnel(Tunnel::Malformed).with("proxy response head too large"));
        }
        let n = stream.read_more().await.map_err(Error::new_io)?;
        if n == 0 {
            return Err(Error::new_io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unexpected end of stream reading CONNECT response",
            )));
        }
    }
}

/// 解析响应头，返回响应及头部占用的字节数；数据不完整时返回 `None`。
fn parse_head(buf: &[u8]) -> crate::Result<Option<(Response<()>, usize)>> {
    let malformed = |msg: String| Error::new_tunnel(Tunnel::Malformed).with(msg);

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    let len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(malformed(format!("invalid CONNECT response: {}", e))),
    };

    let code = parsed.code.unwrap_or_default();
    let mut builder = Response::builder().version(Version::HTTP_11).status(code);
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| malformed(format!("invalid header name: {}", e)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| malformed(format!("invalid header value: {}", e)))?;
        builder = builder.header(name, value);
    }
    let response = builder
        .body(())
        .map_err(|e| malformed(format!("invalid CONNECT response: {}", e)))?;
    Ok(Some((response, len)))
}

fn wants_close(response: &Response<()>) -> bool {
    response
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

/// 丢弃 `407` 的响应体，保证同一条套接字上的下一次 CONNECT 从干净的位置开始。
async fn skip_body(
    stream: &mut BufferedStream<BoxedIo>,
    response: &Response<()>,
) -> crate::Result<()> {
    let mut remaining = match response.headers().get(CONTENT_LENGTH) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                Error::new_tunnel(Tunnel::Malformed).with("invalid Content-Length in CONNECT response")
            })?,
        None => return Ok(()),
    };

    while remaining > 0 {
        if stream.buffered().is_empty() {
            let n = stream.read_more().await.map_err(Error::new_io)?;
            if n == 0 {
                return Err(Error::new_io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }
        let n = std::cmp::min(remaining, stream.buffered().len() as u64) as usize;
        Pin::new(&mut *stream).consume(n);
        remaining -= n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use http::header::PROXY_AUTHORIZATION;
    use tokio::io::AsyncReadExt;

    use crate::address::Proxy;
    use crate::connect::ProxyAuthenticator;
    use crate::mock::FakeTls;

    /// 记录挑战并总是给出 Basic 凭据的认证器
    #[derive(Default)]
    struct Basic {
        challenges: Mutex<Vec<String>>,
    }

    impl ProxyAuthenticator for Basic {
        fn authenticate(&self, _: &Route, response: &Response<()>) -> Option<Request<()>> {
            let challenge = response
                .headers()
                .get(PROXY_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_owned();
            let preemptive = challenge == PREEMPTIVE_CHALLENGE;
            self.challenges.lock().unwrap().push(challenge);
            if preemptive {
                return None;
            }
            Some(
                Request::builder()
                    .method(Method::CONNECT)
                    .uri("example.com:443")
                    .header(PROXY_AUTHORIZATION, "Basic dXNlcjpwYXNz")
                    .body(())
                    .unwrap(),
            )
        }
    }

    fn route(authenticator: Option<Arc<dyn ProxyAuthenticator>>) -> Route {
        let proxy = SocketAddr::from(([127, 0, 0, 1], 3128));
        let mut builder = Address::builder("example.com", 443);
        builder.tls(Arc::new(FakeTls::new())).proxy(Proxy::Http(proxy));
        if let Some(authenticator) = authenticator {
            builder.proxy_authenticator(authenticator);
        }
        Route::new(builder.build().unwrap(), SocketAddr::from(([10, 0, 0, 1], 443)))
    }

    fn buffered(io: impl crate::rt::Io) -> BufferedStream<BoxedIo> {
        BufferedStream::new(Box::new(io) as BoxedIo)
    }

    fn connect_head(config: &ConnectConfig, extra: &str) -> String {
        format!(
            "CONNECT example.com:443 HTTP/1.1\r\nhost: example.com:443\r\nproxy-connection: Keep-Alive\r\nuser-agent: {}\r\n{}\r\n",
            config.user_agent, extra
        )
    }

    async fn no_reconnect() -> crate::Result<BufferedStream<BoxedIo>> {
        panic!("unexpected reconnect")
    }

    #[tokio::test]
    async fn established_on_200() {
        let config = ConnectConfig::default();
        let mock = tokio_test::io::Builder::new()
            .write(connect_head(&config, "").as_bytes())
            .read(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .build();

        let stream = establish(buffered(mock), &route(None), &config, no_reconnect)
            .await
            .expect("tunnel");
        assert!(stream.buffered().is_empty());
    }

    #[tokio::test]
    async fn bytes_after_200_are_rejected() {
        let config = ConnectConfig::default();
        let mock = tokio_test::io::Builder::new()
            .write(connect_head(&config, "").as_bytes())
            .read(b"HTTP/1.1 200 OK\r\n\r\n\x16\x03\x01")
            .build();

        let err = establish(buffered(mock), &route(None), &config, no_reconnect)
            .await
            .unwrap_err();
        assert!(err.is_tunnel());
    }

    #[tokio::test]
    async fn unexpected_status_is_an_error() {
        let config = ConnectConfig::default();
        let mock = tokio_test::io::Builder::new()
            .write(connect_head(&config, "").as_bytes())
            .read(b"HTTP/1.1 503 Service Unavailable\r\n\r\n")
            .build();

        let err = establish(buffered(mock), &route(None), &config, no_reconnect)
            .await
            .unwrap_err();
        assert!(err.is_tunnel());
    }

    #[tokio::test]
    async fn missing_credentials_fail_authentication() {
        let config = ConnectConfig::default();
        let mock = tokio_test::io::Builder::new()
            .write(connect_head(&config, "").as_bytes())
            .read(b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n")
            .build();

        let err = establish(buffered(mock), &route(None), &config, no_reconnect)
            .await
            .unwrap_err();
        assert!(err.is_tunnel());
    }

    #[tokio::test]
    async fn reauthenticates_on_same_socket_after_skipping_body() {
        let config = ConnectConfig::default();
        let authenticator = Arc::new(Basic::default());
        let mock = tokio_test::io::Builder::new()
            .write(connect_head(&config, "").as_bytes())
            .read(b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"x\"\r\nContent-Length: 5\r\n\r\nnope!")
            .write(b"CONNECT example.com:443 HTTP/1.1\r\nproxy-authorization: Basic dXNlcjpwYXNz\r\n")
            .write(format!("host: example.com:443\r\nproxy-connection: Keep-Alive\r\nuser-agent: {}\r\n\r\n", config.user_agent).as_bytes())
            .read(b"HTTP/1.1 200 OK\r\n\r\n")
            .build();

        establish(buffered(mock), &route(Some(authenticator.clone())), &config, no_reconnect)
            .await
            .expect("tunnel");

        let challenges = authenticator.challenges.lock().unwrap();
        assert_eq!(*challenges, vec![PREEMPTIVE_CHALLENGE.to_owned(), "Basic realm=\"x\"".to_owned()]);
    }

    /// 总是返回 `407` + `Connection: close` 的代理
    async fn closing_proxy() -> crate::Result<BufferedStream<BoxedIo>> {
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut head = Vec::new();
            let mut buf = [0u8; 512];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match server.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                }
            }
            let _ = server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nConnection: close\r\n\r\n")
                .await;
        });
        Ok(buffered(client))
    }

    #[tokio::test]
    async fn tunnel_attempts_are_bounded() {
        let config = ConnectConfig::default();
        let sockets = AtomicUsize::new(1);
        let first = closing_proxy().await.unwrap();

        let err = establish(first, &route(Some(Arc::new(Basic::default()))), &config, || {
            sockets.fetch_add(1, Ordering::SeqCst);
            closing_proxy()
        })
        .await
        .unwrap_err();

        assert!(err.is_tunnel());
        assert_eq!(sockets.load(Ordering::SeqCst), MAX_TUNNEL_ATTEMPTS);
    }

    #[tokio::test]
    async fn tunnel_attempt_bound_is_configurable() {
        let mut config = ConnectConfig::default();
        config.max_tunnel_attempts(3);
        let sockets = AtomicUsize::new(1);
        let first = closing_proxy().await.unwrap();

        let err = establish(first, &route(Some(Arc::new(Basic::default()))), &config, || {
            sockets.fetch_add(1, Ordering::SeqCst);
            closing_proxy()
        })
        .await
        .unwrap_err();
        assert!(err.is_tunnel());
        assert_eq!(sockets.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn ipv6_authority_is_bracketed() {
        let address = Address::builder("[::1]", 443).build().unwrap();
        assert_eq!(authority(&address), "[::1]:443");
    }
}
