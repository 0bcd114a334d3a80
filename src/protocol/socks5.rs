//! SOCKS5 inbound (CONNECT only, no authentication)

use async_trait::async_trait;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::{Address, AsyncReadWrite, Result};
use crate::error::Error;

use super::InboundHandshake;

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 CONNECT handshake
///
/// Success is acknowledged as soon as the request parses, before the far end
/// has reached the destination.
#[derive(Debug, Default, Clone, Copy)]
pub struct Socks5Inbound;

impl Socks5Inbound {
    pub fn new() -> Self {
        Self
    }
}

fn reply(code: u8) -> [u8; 10] {
    [SOCKS5_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

#[async_trait]
impl InboundHandshake for Socks5Inbound {
    async fn handshake(&self, stream: &mut (dyn AsyncReadWrite + Unpin + Send)) -> Result<Address> {
        // 1. Read version and auth methods
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await?;

        if buf[0] != SOCKS5_VERSION {
            return Err(Error::Protocol(format!(
                "Unsupported SOCKS version: {}",
                buf[0]
            )));
        }

        let nmethods = buf[1] as usize;
        let mut methods = vec![0u8; nmethods];
        stream.read_exact(&mut methods).await?;

        // 2. Only "no authentication" is offered
        if !methods.contains(&AUTH_NONE) {
            stream.write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE]).await?;
            return Err(Error::Protocol("No acceptable auth method".into()));
        }
        stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;

        // 3. Read request
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;

        if header[0] != SOCKS5_VERSION {
            return Err(Error::Protocol("Invalid SOCKS version in request".into()));
        }

        let cmd = header[1];
        let atyp = header[3];

        if cmd != CMD_CONNECT {
            stream.write_all(&reply(REP_CMD_NOT_SUPPORTED)).await?;
            return Err(Error::Unsupported(format!("SOCKS5 command {}", cmd)));
        }

        // 4. Parse address
        let address = match atyp {
            ATYP_IPV4 => {
                let mut addr = [0u8; 4];
                stream.read_exact(&mut addr).await?;
                let port = stream.read_u16().await?;
                Address::Socket(SocketAddr::new(Ipv4Addr::from(addr).into(), port))
            }
            ATYP_DOMAIN => {
                let len = stream.read_u8().await? as usize;
                let mut domain = vec![0u8; len];
                stream.read_exact(&mut domain).await?;
                let port = stream.read_u16().await?;
                let domain = String::from_utf8_lossy(&domain).to_string();
                Address::Domain(domain, port)
            }
            ATYP_IPV6 => {
                let mut addr = [0u8; 16];
                stream.read_exact(&mut addr).await?;
                let port = stream.read_u16().await?;
                Address::Socket(SocketAddr::new(Ipv6Addr::from(addr).into(), port))
            }
            _ => {
                stream.write_all(&reply(REP_ATYP_NOT_SUPPORTED)).await?;
                return Err(Error::Unsupported(format!(
                    "SOCKS5 address type {}",
                    atyp
                )));
            }
        };

        // 5. Optimistic success
        stream.write_all(&reply(REP_SUCCESS)).await?;
        stream.flush().await?;

        Ok(address)
    }

    fn name(&self) -> &'static str {
        "socks5"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn run(request: Vec<u8>) -> (Result<Address>, Vec<u8>) {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&request).await.unwrap();

        let result = Socks5Inbound::new().handshake(&mut server).await;
        drop(server);

        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.unwrap();
        (result, replies)
    }

    #[tokio::test]
    async fn test_connect_domain() {
        let mut request = vec![5, 1, 0, 5, 1, 0, 3, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());

        let (result, replies) = run(request).await;
        assert_eq!(result.unwrap(), Address::domain("example.com", 443));
        assert_eq!(&replies[..2], &[5, 0]);
        assert_eq!(&replies[2..4], &[5, REP_SUCCESS]);
    }

    #[tokio::test]
    async fn test_connect_ipv4() {
        let request = vec![5, 1, 0, 5, 1, 0, 1, 10, 0, 0, 7, 0x1F, 0x90];
        let (result, _) = run(request).await;
        assert_eq!(
            result.unwrap(),
            Address::Socket("10.0.0.7:8080".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_connect_ipv6() {
        let mut request = vec![5, 1, 0, 5, 1, 0, 4];
        request.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        request.extend_from_slice(&80u16.to_be_bytes());
        let (result, _) = run(request).await;
        assert_eq!(result.unwrap().host(), "::1");
    }

    #[tokio::test]
    async fn test_bind_rejected() {
        let request = vec![5, 1, 0, 5, 2, 0, 1, 127, 0, 0, 1, 0, 80];
        let (result, replies) = run(request).await;
        assert!(result.is_err());
        assert_eq!(&replies[2..4], &[5, REP_CMD_NOT_SUPPORTED]);
    }

    #[tokio::test]
    async fn test_unknown_atyp_rejected() {
        let request = vec![5, 1, 0, 5, 1, 0, 9];
        let (result, replies) = run(request).await;
        assert!(result.is_err());
        assert_eq!(&replies[2..4], &[5, REP_ATYP_NOT_SUPPORTED]);
    }

    #[tokio::test]
    async fn test_auth_required_rejected() {
        let request = vec![5, 1, 2];
        let (result, replies) = run(request).await;
        assert!(result.is_err());
        assert_eq!(replies, vec![5, AUTH_NO_ACCEPTABLE]);
    }

    #[tokio::test]
    async fn test_wrong_version() {
        let (result, _) = run(vec![4, 1, 0]).await;
        assert!(result.is_err());
    }
}
