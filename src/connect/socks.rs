//! SOCKS5 代理握手（RFC 1928，仅无认证方式）
//!
//! 握手在原始套接字上完成，之后套接字即为到目标的透明通道，TLS 在其上进行。
//! 目标以域名形式交给代理解析；主机名本身是 IP 字面量时使用对应的地址类型。

use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::Address;
use crate::error::{Error, Tunnel};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_METHOD_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;

/// 请求代理连接到 `address`。
pub(crate) async fn handshake<T>(io: &mut T, address: &Address) -> crate::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    io.write_all(&[SOCKS5_VERSION, 1, AUTH_METHOD_NONE])
        .await
        .map_err(Error::new_io)?;
    io.flush().await.map_err(Error::new_io)?;

    let mut method = [0u8; 2];
    io.read_exact(&mut method).await.map_err(Error::new_io)?;
    if method[0] != SOCKS5_VERSION {
        return Err(socks_error(format!("unexpected SOCKS version: {:#04x}", method[0])));
    }
    if method[1] != AUTH_METHOD_NONE {
        return Err(socks_error(format!(
            "SOCKS proxy requires unsupported authentication method: {:#04x}",
            method[1]
        )));
    }

    let request = connect_request(address)?;
    io.write_all(&request).await.map_err(Error::new_io)?;
    io.flush().await.map_err(Error::new_io)?;

    // VER | REP | RSV | ATYP
    let mut reply = [0u8; 4];
    io.read_exact(&mut reply).await.map_err(Error::new_io)?;
    if reply[0] != SOCKS5_VERSION {
        return Err(socks_error(format!("unexpected SOCKS version: {:#04x}", reply[0])));
    }
    if reply[1] != REPLY_SUCCEEDED {
        return Err(socks_error(format!(
            "SOCKS CONNECT to {} failed: {} ({:#04x})",
            address,
            reply_message(reply[1]),
            reply[1]
        )));
    }

    // 绑定地址对客户端没有用处，读出丢弃
    let bound_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            io.read_exact(&mut len).await.map_err(Error::new_io)?;
            len[0] as usize
        }
        other => return Err(socks_error(format!("invalid SOCKS address type: {:#04x}", other))),
    };
    let mut bound = vec![0u8; bound_len + 2];
    io.read_exact(&mut bound).await.map_err(Error::new_io)?;

    trace!("SOCKS tunnel established to {}", address);
    Ok(())
}

fn connect_request(address: &Address) -> crate::Result<Vec<u8>> {
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    match address.host().parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let host = address.host().as_bytes();
            let len = u8::try_from(host.len())
                .map_err(|_| socks_error(format!("hostname too long for SOCKS: {}", address.host())))?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host);
        }
    }
    request.extend_from_slice(&address.port().to_be_bytes());
    Ok(request)
}

fn socks_error(msg: String) -> Error {
    Error::new_tunnel(Tunnel::Socks).with(msg)
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connects_by_domain_name() {
        let address = Address::builder("example.com", 443).build().unwrap();
        let mut mock = tokio_test::io::Builder::new()
            .write(&[5, 1, 0])
            .read(&[5, 0])
            .write(&[5, 1, 0, 3, 11])
            .write(b"example.com")
            .write(&[0x01, 0xbb])
            .read(&[5, 0, 0, 1, 10, 0, 0, 1, 0x1f, 0x90])
            .build();

        handshake(&mut mock, &address).await.expect("socks");
    }

    #[tokio::test]
    async fn connects_by_ip_literal() {
        let address = Address::builder("10.1.2.3", 80).build().unwrap();
        let mut mock = tokio_test::io::Builder::new()
            .write(&[5, 1, 0])
            .read(&[5, 0])
            .write(&[5, 1, 0, 1, 10, 1, 2, 3, 0, 80])
            .read(&[5, 0, 0, 3, 4])
            .read(b"host")
            .read(&[0, 80])
            .build();

        handshake(&mut mock, &address).await.expect("socks");
    }

    #[tokio::test]
    async fn rejected_connect_is_a_tunnel_error() {
        let address = Address::builder("example.com", 443).build().unwrap();
        let mut mock = tokio_test::io::Builder::new()
            .write(&[5, 1, 0])
            .read(&[5, 0])
            .write(&[5, 1, 0, 3, 11])
            .write(b"example.com")
            .write(&[0x01, 0xbb])
            .read(&[5, 5, 0, 1])
            .build();

        let err = handshake(&mut mock, &address).await.unwrap_err();
        assert!(err.is_tunnel());
    }

    #[tokio::test]
    async fn authentication_required_is_unsupported() {
        let address = Address::builder("example.com", 443).build().unwrap();
        let mut mock = tokio_test::io::Builder::new()
            .write(&[5, 1, 0])
            .read(&[5, 0xff])
            .build();

        let err = handshake(&mut mock, &address).await.unwrap_err();
        assert!(err.is_tunnel());
    }
}
