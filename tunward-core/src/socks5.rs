//! SOCKS5 CONNECT client (RFC 1928, RFC 1929).
//!
//! This is the one wire protocol where byte-exact framing is a
//! compatibility requirement: greeting, optional username/password
//! sub-negotiation, CONNECT request, reply with echoed bound address.

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::socket_protect;
use std::net::SocketAddrV4;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NONE: u8 = 0x00;
const METHOD_USERNAME_PASSWORD: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;

/// Zero-progress reads are retried this many times with a short backoff
/// before the fill loop gives up.
const FILL_RETRY_LIMIT: u32 = 50;
const FILL_RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// SOCKS5 client bound to one proxy endpoint
pub struct Socks5Client {
    server: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
}

impl Socks5Client {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            server: config.address.clone(),
            port: config.port,
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }

    pub fn with_credentials(
        server: impl Into<String>,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            server: server.into(),
            port,
            username,
            password,
        }
    }

    fn has_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Establish a tunnel to `dest` through the proxy. On success the
    /// returned stream relays raw bytes to/from the destination.
    ///
    /// The control connection is opened through the protected dialer so
    /// it cannot be captured by the tunnel itself.
    pub async fn connect(&self, dest: SocketAddrV4, timeout: Duration) -> Result<TcpStream> {
        let endpoint = format!("{}:{}", self.server, self.port);
        debug!("SOCKS5: connecting to {} for target {}", endpoint, dest);

        let mut stream = socket_protect::connect_protected_timeout(&endpoint, timeout)
            .await
            .map_err(|e| {
                Error::proxy_with_target(
                    format!("Failed to connect to SOCKS5 server {}: {}", endpoint, e),
                    dest.to_string(),
                )
            })?;
        let _ = stream.set_nodelay(true);

        self.negotiate_auth(&mut stream, timeout).await?;
        self.send_connect(&mut stream, dest).await?;
        self.read_connect_reply(&mut stream, timeout).await?;

        debug!("SOCKS5: tunnel established to {}", dest);
        Ok(stream)
    }

    async fn negotiate_auth(&self, stream: &mut TcpStream, timeout: Duration) -> Result<()> {
        let greeting: &[u8] = if self.has_auth() {
            &[SOCKS_VERSION, 2, METHOD_NONE, METHOD_USERNAME_PASSWORD]
        } else {
            &[SOCKS_VERSION, 1, METHOD_NONE]
        };

        stream
            .write_all(greeting)
            .await
            .map_err(|e| Error::network(format!("SOCKS5 greeting failed: {}", e)))?;

        let mut response = [0u8; 2];
        read_full(stream, &mut response, timeout).await?;

        if response[0] != SOCKS_VERSION {
            return Err(Error::protocol(format!(
                "Invalid SOCKS version in response: {}",
                response[0]
            )));
        }

        match response[1] {
            METHOD_NONE => Ok(()),
            METHOD_USERNAME_PASSWORD => match (&self.username, &self.password) {
                (Some(user), Some(pass)) => {
                    self.negotiate_userpass(stream, user, pass, timeout).await
                }
                _ => Err(Error::auth(
                    "Server requires authentication but no credentials configured",
                )),
            },
            METHOD_NO_ACCEPTABLE => Err(Error::protocol("No acceptable authentication methods")),
            other => Err(Error::protocol(format!(
                "Unsupported SOCKS5 auth method: {}",
                other
            ))),
        }
    }

    async fn negotiate_userpass(
        &self,
        stream: &mut TcpStream,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<()> {
        let mut frame = Vec::with_capacity(3 + username.len() + password.len());
        frame.push(AUTH_VERSION);
        frame.push(username.len() as u8);
        frame.extend_from_slice(username.as_bytes());
        frame.push(password.len() as u8);
        frame.extend_from_slice(password.as_bytes());

        stream
            .write_all(&frame)
            .await
            .map_err(|e| Error::network(format!("SOCKS5 auth send failed: {}", e)))?;

        let mut response = [0u8; 2];
        read_full(stream, &mut response, timeout).await?;

        if response[1] != 0x00 {
            return Err(Error::auth("SOCKS5 username/password authentication failed"));
        }
        Ok(())
    }

    async fn send_connect(&self, stream: &mut TcpStream, dest: SocketAddrV4) -> Result<()> {
        let mut request = [0u8; 10];
        request[0] = SOCKS_VERSION;
        request[1] = CMD_CONNECT;
        request[2] = 0x00;
        request[3] = ATYP_IPV4;
        request[4..8].copy_from_slice(&dest.ip().octets());
        request[8..10].copy_from_slice(&dest.port().to_be_bytes());

        stream
            .write_all(&request)
            .await
            .map_err(|e| Error::network(format!("SOCKS5 CONNECT send failed: {}", e)))
    }

    async fn read_connect_reply(&self, stream: &mut TcpStream, timeout: Duration) -> Result<()> {
        let mut header = [0u8; 4];
        read_full(stream, &mut header, timeout).await?;

        if header[0] != SOCKS_VERSION {
            return Err(Error::protocol(format!(
                "Invalid SOCKS version in CONNECT reply: {}",
                header[0]
            )));
        }

        if header[1] != REPLY_SUCCEEDED {
            return Err(Error::proxy(format!(
                "SOCKS5 connect failed: {} (code: {})",
                reply_code_message(header[1]),
                header[1]
            )));
        }

        // Consume the echoed bound-address block; its length depends on
        // the address type the server chose.
        match header[3] {
            ATYP_IPV4 => {
                let mut addr_port = [0u8; 6];
                read_full(stream, &mut addr_port, timeout).await?;
            }
            ATYP_IPV6 => {
                let mut addr_port = [0u8; 18];
                read_full(stream, &mut addr_port, timeout).await?;
            }
            ATYP_DOMAIN => {
                let mut len_buf = [0u8; 1];
                read_full(stream, &mut len_buf, timeout).await?;
                let mut addr_port = vec![0u8; len_buf[0] as usize + 2];
                read_full(stream, &mut addr_port, timeout).await?;
            }
            other => {
                return Err(Error::protocol(format!(
                    "Unsupported address type in SOCKS5 reply: {}",
                    other
                )))
            }
        }

        Ok(())
    }
}

/// Map RFC 1928 reply codes to descriptive failure reasons
fn reply_code_message(code: u8) -> &'static str {
    match code {
        0x01 => "General SOCKS server failure",
        0x02 => "Connection not allowed by ruleset",
        0x03 => "Network unreachable",
        0x04 => "Host unreachable",
        0x05 => "Connection refused",
        0x06 => "TTL expired",
        0x07 => "Command not supported",
        0x08 => "Address type not supported",
        _ => "Unknown error",
    }
}

/// Fill `buf` completely from the stream. Reads that make no progress
/// are retried with a short backoff up to `FILL_RETRY_LIMIT` attempts;
/// EOF before the expected byte count is a hard failure.
async fn read_full(stream: &mut TcpStream, buf: &mut [u8], timeout: Duration) -> Result<()> {
    let expected = buf.len();
    let mut total = 0usize;
    let mut retries = 0u32;

    while total < expected {
        let read = tokio::time::timeout(timeout, stream.read(&mut buf[total..])).await;
        match read {
            Ok(Ok(0)) => {
                return Err(Error::protocol(format!(
                    "SOCKS5 stream closed early: expected {} bytes, got {}",
                    expected, total
                )));
            }
            Ok(Ok(n)) => {
                total += n;
                retries = 0;
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => {
                retries += 1;
                if retries >= FILL_RETRY_LIMIT {
                    return Err(Error::network(format!(
                        "SOCKS5 read stalled after {} retries",
                        retries
                    )));
                }
                tokio::time::sleep(FILL_RETRY_BACKOFF).await;
            }
            Ok(Err(e)) => return Err(Error::network(format!("SOCKS5 read failed: {}", e))),
            Err(_) => {
                return Err(Error::Timeout {
                    message: format!(
                        "SOCKS5 read timed out: expected {} bytes, got {}",
                        expected, total
                    ),
                    operation: Some("socks5_read".to_string()),
                })
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn dest() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80)
    }

    async fn spawn_server<F, Fut>(handler: F) -> SocketAddr
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handler(stream).await;
        });
        addr
    }

    fn client_for(addr: SocketAddr) -> Socks5Client {
        Socks5Client::with_credentials("127.0.0.1", addr.port(), None, None)
    }

    #[tokio::test]
    async fn test_connect_no_auth_success() {
        let addr = spawn_server(|mut stream| async move {
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..4], &[0x05, 0x01, 0x00, 0x01]);
            assert_eq!(&request[4..8], &[93, 184, 216, 34]);
            assert_eq!(u16::from_be_bytes([request[8], request[9]]), 80);

            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            // tunnel established: echo one message
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        })
        .await;

        let client = client_for(addr);
        let mut stream = client.connect(dest(), TIMEOUT).await.unwrap();

        stream.write_all(b"hello").await.unwrap();
        let mut echo = [0u8; 5];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"hello");
    }

    #[tokio::test]
    async fn test_connect_refused_reply_code() {
        let addr = spawn_server(|mut stream| async move {
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();
            stream
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        })
        .await;

        let client = client_for(addr);
        let err = client.connect(dest(), TIMEOUT).await.unwrap_err();
        assert!(err.to_string().contains("Connection refused"));
    }

    #[tokio::test]
    async fn test_userpass_subnegotiation() {
        let addr = spawn_server(|mut stream| async move {
            let mut greeting = [0u8; 4];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x02, 0x00, 0x02]);
            stream.write_all(&[0x05, 0x02]).await.unwrap();

            // version, ulen, "alice", plen, "secret"
            let mut auth = [0u8; 14];
            stream.read_exact(&mut auth).await.unwrap();
            assert_eq!(auth[0], 0x01);
            assert_eq!(auth[1], 5);
            assert_eq!(&auth[2..7], b"alice");
            assert_eq!(auth[7], 6);
            assert_eq!(&auth[8..14], b"secret");
            stream.write_all(&[0x01, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        })
        .await;

        let client = Socks5Client::with_credentials(
            "127.0.0.1",
            addr.port(),
            Some("alice".to_string()),
            Some("secret".to_string()),
        );
        client.connect(dest(), TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn test_server_wants_auth_without_credentials() {
        let addr = spawn_server(|mut stream| async move {
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x02]).await.unwrap();
        })
        .await;

        let client = client_for(addr);
        let err = client.connect(dest(), TIMEOUT).await.unwrap_err();
        assert_eq!(err.code(), "AUTH");
    }

    #[tokio::test]
    async fn test_no_acceptable_methods() {
        let addr = spawn_server(|mut stream| async move {
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0xFF]).await.unwrap();
        })
        .await;

        let client = client_for(addr);
        let err = client.connect(dest(), TIMEOUT).await.unwrap_err();
        assert!(err.to_string().contains("No acceptable"));
    }

    #[tokio::test]
    async fn test_eof_mid_handshake_is_hard_failure() {
        let addr = spawn_server(|mut stream| async move {
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            // one byte of a two-byte reply, then close
            stream.write_all(&[0x05]).await.unwrap();
        })
        .await;

        let client = client_for(addr);
        let err = client.connect(dest(), TIMEOUT).await.unwrap_err();
        assert!(err.to_string().contains("closed early"));
    }

    #[tokio::test]
    async fn test_domain_bound_address_is_consumed() {
        let addr = spawn_server(|mut stream| async move {
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();

            // reply with a domain-typed bound address
            let mut reply = vec![0x05, 0x00, 0x00, 0x03, 0x07];
            reply.extend_from_slice(b"example");
            reply.extend_from_slice(&80u16.to_be_bytes());
            stream.write_all(&reply).await.unwrap();

            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
        })
        .await;

        let client = client_for(addr);
        let mut stream = client.connect(dest(), TIMEOUT).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();
    }
}
