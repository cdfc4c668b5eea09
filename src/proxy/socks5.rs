//! SOCKS5 proxy implementation (RFC 1928, RFC 1929)
//!
//! Only CONNECT is supported. The reply is deferred to the handler so that
//! the client learns whether the tunnel could reach the destination.

use super::{accept_retry_delay, Address, ProxyError, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// Username/password sub-negotiation version
const AUTH_VERSION: u8 = 0x01;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl From<u8> for Reply {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Reply::Succeeded,
            0x02 => Reply::ConnectionNotAllowed,
            0x03 => Reply::NetworkUnreachable,
            0x04 => Reply::HostUnreachable,
            0x05 => Reply::ConnectionRefused,
            0x06 => Reply::TtlExpired,
            0x07 => Reply::CommandNotSupported,
            0x08 => Reply::AddressTypeNotSupported,
            _ => Reply::GeneralFailure,
        }
    }
}

/// A negotiated CONNECT request awaiting its reply
#[derive(Debug)]
pub struct Socks5Request {
    pub stream: TcpStream,
    pub address: Address,
    pub peer: SocketAddr,
}

impl Socks5Request {
    /// Report success and hand back the client stream
    pub async fn succeed(mut self) -> Result<TcpStream, ProxyError> {
        self.stream.write_all(&make_reply(Reply::Succeeded)).await?;
        Ok(self.stream)
    }

    /// Report failure and close
    pub async fn fail(mut self, reply: Reply) -> Result<(), ProxyError> {
        self.stream.write_all(&make_reply(reply)).await?;
        self.stream.shutdown().await.ok();
        Ok(())
    }
}

/// SOCKS5 proxy server
pub struct Socks5Server {
    listener: TcpListener,
    /// Optional username/password authentication
    auth: Option<(String, String)>,
}

impl Socks5Server {
    /// Create a new SOCKS5 server
    pub async fn bind(addr: SocketAddr) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            auth: None,
        })
    }

    /// Enable username/password authentication
    pub fn with_auth(mut self, username: String, password: String) -> Self {
        self.auth = Some((username, password));
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and handle incoming connections until `shutdown` flips
    pub async fn run<F, Fut>(
        &self,
        handler: F,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ProxyError>
    where
        F: Fn(Socks5Request) -> Fut + Clone + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("SOCKS5 accept failed: {}", e);
                            if let Some(delay) = accept_retry_delay(&e) {
                                tokio::time::sleep(delay).await;
                            }
                            continue;
                        }
                    };
                    debug!("New SOCKS5 connection from {}", peer);

                    let handler = handler.clone();
                    let auth = self.auth.clone();

                    tokio::spawn(async move {
                        match Self::handle_connection(stream, peer, auth).await {
                            Ok(request) => handler(request).await,
                            Err(e) => debug!("SOCKS5 negotiation with {} failed: {}", peer, e),
                        }
                    });
                }
                _ = shutdown.changed() => {
                    debug!("SOCKS5 server on {} stopping", self.listener.local_addr()?);
                    return Ok(());
                }
            }
        }
    }

    /// Negotiate up to the request; the reply is left to the caller
    async fn handle_connection(
        mut stream: TcpStream,
        peer: SocketAddr,
        auth: Option<(String, String)>,
    ) -> Result<Socks5Request, ProxyError> {
        // Read greeting
        let mut buf = [0u8; 258];
        stream.read_exact(&mut buf[..2]).await?;

        if buf[0] != SOCKS_VERSION {
            return Err(ProxyError::InvalidSocksVersion(buf[0]));
        }

        let nmethods = buf[1] as usize;
        stream.read_exact(&mut buf[..nmethods]).await?;

        // Select authentication method
        let method = if auth.is_some() {
            if buf[..nmethods].contains(&(AuthMethod::UsernamePassword as u8)) {
                AuthMethod::UsernamePassword
            } else {
                AuthMethod::NoAcceptable
            }
        } else if buf[..nmethods].contains(&(AuthMethod::NoAuth as u8)) {
            AuthMethod::NoAuth
        } else {
            AuthMethod::NoAcceptable
        };

        // Send method selection
        stream.write_all(&[SOCKS_VERSION, method as u8]).await?;

        if method == AuthMethod::NoAcceptable {
            return Err(ProxyError::AuthenticationFailed);
        }

        if let (AuthMethod::UsernamePassword, Some((expected_user, expected_pass))) =
            (method, &auth)
        {
            stream.read_exact(&mut buf[..2]).await?;
            if buf[0] != AUTH_VERSION {
                return Err(ProxyError::AuthenticationFailed);
            }
            let ulen = buf[1] as usize;
            stream.read_exact(&mut buf[..ulen]).await?;
            let username = String::from_utf8_lossy(&buf[..ulen]).to_string();

            stream.read_exact(&mut buf[..1]).await?;
            let plen = buf[0] as usize;
            stream.read_exact(&mut buf[..plen]).await?;
            let password = String::from_utf8_lossy(&buf[..plen]).to_string();

            let success = username == *expected_user && password == *expected_pass;
            stream
                .write_all(&[AUTH_VERSION, if success { 0x00 } else { 0x01 }])
                .await?;

            if !success {
                return Err(ProxyError::AuthenticationFailed);
            }
        }

        // Read request
        stream.read_exact(&mut buf[..4]).await?;

        if buf[0] != SOCKS_VERSION {
            return Err(ProxyError::InvalidSocksVersion(buf[0]));
        }

        let command = match Command::try_from(buf[1]) {
            Ok(command) => command,
            Err(e) => {
                stream.write_all(&make_reply(Reply::CommandNotSupported)).await?;
                return Err(e);
            }
        };

        // buf[2] is reserved
        let address = match buf[3] {
            ATYP_IPV4 => {
                let mut ip = [0u8; 4];
                stream.read_exact(&mut ip).await?;
                Address::Ipv4(ip, stream.read_u16().await?)
            }
            ATYP_DOMAIN => {
                stream.read_exact(&mut buf[..1]).await?;
                let len = buf[0] as usize;
                stream.read_exact(&mut buf[..len]).await?;
                let domain = String::from_utf8_lossy(&buf[..len]).to_string();
                Address::Domain(domain, stream.read_u16().await?)
            }
            ATYP_IPV6 => {
                let mut ip = [0u8; 16];
                stream.read_exact(&mut ip).await?;
                Address::Ipv6(ip, stream.read_u16().await?)
            }
            other => {
                stream
                    .write_all(&make_reply(Reply::AddressTypeNotSupported))
                    .await?;
                return Err(ProxyError::UnsupportedAddressType(other));
            }
        };

        debug!("SOCKS5 {:?} to {} from {}", command, address, peer);

        match command {
            Command::Connect => Ok(Socks5Request {
                stream,
                address,
                peer,
            }),
            Command::Bind | Command::UdpAssociate => {
                stream.write_all(&make_reply(Reply::CommandNotSupported)).await?;
                Err(ProxyError::UnsupportedCommand(command as u8))
            }
        }
    }
}

/// Build a reply with an unspecified bind address (0.0.0.0:0)
fn make_reply(reply: Reply) -> [u8; 10] {
    [SOCKS_VERSION, reply as u8, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn server(auth: Option<(&str, &str)>) -> (SocketAddr, watch::Sender<bool>, tokio::sync::mpsc::Receiver<Address>) {
        let mut server = Socks5Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        if let Some((user, pass)) = auth {
            server = server.with_auth(user.to_string(), pass.to_string());
        }
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (seen_tx, seen_rx) = tokio::sync::mpsc::channel(4);

        tokio::spawn(async move {
            server
                .run(
                    move |request: Socks5Request| {
                        let seen_tx = seen_tx.clone();
                        async move {
                            let _ = seen_tx.send(request.address.clone()).await;
                            if request.address.port() == 1 {
                                let _ = request.fail(Reply::ConnectionRefused).await;
                            } else if let Ok(mut stream) = request.succeed().await {
                                let _ = stream.write_all(b"tunneled").await;
                            }
                        }
                    },
                    stop_rx,
                )
                .await
        });

        (addr, stop_tx, seen_rx)
    }

    #[tokio::test]
    async fn test_connect_domain() {
        let (addr, _stop, mut seen) = server(None).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::Succeeded as u8);

        let mut body = [0u8; 8];
        client.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"tunneled");
        assert_eq!(seen.recv().await.unwrap().to_string(), "example.com:443");
    }

    #[tokio::test]
    async fn test_abrupt_clients_do_not_stop_listener() {
        let (addr, _stop, mut seen) = server(None).await;

        for i in 0..32 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            if i % 2 == 0 {
                let _ = client.write_all(&[0x05]).await;
            }
        }

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::Succeeded as u8);
        assert_eq!(seen.recv().await.unwrap().to_string(), "127.0.0.1:80");
    }

    #[tokio::test]
    async fn test_failure_reply() {
        let (addr, _stop, _seen) = server(None).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 1])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::ConnectionRefused as u8);
    }

    #[tokio::test]
    async fn test_username_password() {
        let (addr, _stop, _seen) = server(Some(("user", "pass"))).await;

        // Wrong password is rejected
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x02]);
        client
            .write_all(&[0x01, 4, b'u', b's', b'e', b'r', 4, b'n', b'o', b'p', b'e'])
            .await
            .unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x01]);

        // No-auth offer is refused outright
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn test_unsupported_command() {
        let (addr, _stop, _seen) = server(None).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        // BIND
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::CommandNotSupported as u8);
    }

    #[test]
    fn test_reply_codes() {
        assert_eq!(Reply::from(0x05), Reply::ConnectionRefused);
        assert_eq!(Reply::from(0x42), Reply::GeneralFailure);
    }
}
