//! # SOCKS5 Proxy
//!
//! Minimal RFC 1928 server: the no-authentication method and the `CONNECT`
//! command. Before anything is relayed the requested destination is passed to
//! a [`ConnectionAuthorizer`]; a rejection is answered with reply code `0x02`
//! ("connection not allowed by ruleset").

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::filter::DomainFilter;
use super::http_proxy::CONNECT_TIMEOUT;
use super::proxy::{ProxyHandle, ProxyKind, bind_loopback};
use crate::sandbox::SandboxResult;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 reply codes used by this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Destination requested by a SOCKS client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// The host part, as the domain filter sees it.
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub peer: Option<SocketAddr>,
    pub target: TargetAddr,
}

/// Decides whether a SOCKS `CONNECT` may proceed.
pub trait ConnectionAuthorizer: Send + Sync {
    fn authorize(&self, request: &ConnectRequest) -> bool;
}

impl ConnectionAuthorizer for DomainFilter {
    fn authorize(&self, request: &ConnectRequest) -> bool {
        let host = request.target.host();
        let allowed = self.is_allowed(&host);
        if !allowed {
            debug!(domain = %host, "SOCKS5 proxy blocked request");
        }
        allowed
    }
}

/// Bind the SOCKS5 proxy on `127.0.0.1:<port>` and start serving.
pub async fn start_socks_proxy<A>(
    authorizer: Arc<A>,
    port: u16,
    shutdown: CancellationToken,
) -> SandboxResult<ProxyHandle>
where
    A: ConnectionAuthorizer + ?Sized + 'static,
{
    let (listener, port) = bind_loopback(port).await?;
    info!(port, "SOCKS5 proxy listening");

    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let authorizer = authorizer.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_client(stream, peer, authorizer.as_ref()).await {
                                debug!(%peer, error = %e, "SOCKS5 connection error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "SOCKS5 proxy failed to accept connection"),
                },
            }
        }
    });

    Ok(ProxyHandle::new(ProxyKind::Socks, port, shutdown, task))
}

async fn serve_client<A>(mut client: TcpStream, peer: SocketAddr, authorizer: &A) -> io::Result<()>
where
    A: ConnectionAuthorizer + ?Sized,
{
    let Some(target) = negotiate(&mut client).await? else {
        return Ok(());
    };

    let request = ConnectRequest {
        peer: Some(peer),
        target,
    };
    if !authorizer.authorize(&request) {
        return write_reply(&mut client, Reply::NotAllowed, None).await;
    }

    let mut upstream = match dial(&request.target).await {
        Ok(stream) => stream,
        Err(reply) => {
            debug!(target = %request.target, ?reply, "SOCKS5 dial failed");
            return write_reply(&mut client, reply, None).await;
        }
    };

    write_reply(&mut client, Reply::Succeeded, upstream.local_addr().ok()).await?;
    let (up, down) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    debug!(target = %request.target, up, down, "SOCKS5 relay closed");
    Ok(())
}

/// Run the method negotiation and read the request.
///
/// Returns `None` when the client was already sent a failure reply.
pub async fn negotiate<S>(stream: &mut S) -> io::Result<Option<TargetAddr>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported SOCKS version {}", header[0]),
        ));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        return Ok(None);
    }
    stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    let [version, command, _reserved, address_type] = request;
    if version != VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported SOCKS version {version}"),
        ));
    }

    let target = match address_type {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::from((Ipv4Addr::from(ip), port)))
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::from((Ipv6Addr::from(ip), port)))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; len as usize];
            stream.read_exact(&mut name).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Domain(String::from_utf8_lossy(&name).into_owned(), port)
        }
        _ => {
            write_reply(stream, Reply::AddressTypeNotSupported, None).await?;
            return Ok(None);
        }
    };

    if command != CMD_CONNECT {
        write_reply(stream, Reply::CommandNotSupported, None).await?;
        return Ok(None);
    }

    Ok(Some(target))
}

async fn dial(target: &TargetAddr) -> Result<TcpStream, Reply> {
    let connect = async {
        match target {
            TargetAddr::Ip(addr) => TcpStream::connect(addr).await,
            TargetAddr::Domain(domain, port) => TcpStream::connect((domain.as_str(), *port)).await,
        }
    };

    match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            Err(Reply::ConnectionRefused)
        }
        Ok(Err(_)) | Err(_) => Err(Reply::HostUnreachable),
    }
}

async fn write_reply<S>(stream: &mut S, reply: Reply, bound: Option<SocketAddr>) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bound = bound.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
    let mut message = vec![VERSION, reply as u8, 0x00];
    match bound {
        SocketAddr::V4(addr) => {
            message.push(ATYP_IPV4);
            message.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            message.push(ATYP_IPV6);
            message.extend_from_slice(&addr.ip().octets());
        }
    }
    message.extend_from_slice(&bound.port().to_be_bytes());
    stream.write_all(&message).await?;
    stream.flush().await
}
