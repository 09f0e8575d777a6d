//! Shared lifecycle for the loopback proxies.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::sandbox::{SandboxError, SandboxResult};

/// Which proxy a handle belongs to, for logs and the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Socks,
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyKind::Http => write!(f, "HTTP"),
            ProxyKind::Socks => write!(f, "SOCKS5"),
        }
    }
}

/// A running proxy: the bound port plus the accept loop task.
///
/// Dropping the handle does not stop the proxy; call [`ProxyHandle::stop`]
/// or cancel the token the proxy was started with.
#[derive(Debug)]
pub struct ProxyHandle {
    kind: ProxyKind,
    port: u16,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    pub(crate) fn new(
        kind: ProxyKind,
        port: u16,
        shutdown: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            kind,
            port,
            shutdown,
            task,
        }
    }

    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }

    /// Close the listener and wait for the accept loop to exit.
    ///
    /// Connections already being relayed are left to finish on their own.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            debug!(kind = %self.kind, error = %e, "proxy task ended abnormally");
        }
        debug!(kind = %self.kind, port = self.port, "proxy stopped");
    }
}

/// Bind a loopback listener. Port 0 picks an ephemeral port.
pub(crate) async fn bind_loopback(port: u16) -> SandboxResult<(TcpListener, u16)> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| SandboxError::ProxyBindFailed { addr, source })?;
    let bound = listener
        .local_addr()
        .map_err(|source| SandboxError::ProxyBindFailed { addr, source })?
        .port();
    Ok((listener, bound))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ephemeral_port_is_reported() {
        let (_listener, port) = bind_loopback(0).await.unwrap();
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn port_in_use_is_a_bind_failure() {
        let (_listener, port) = bind_loopback(0).await.unwrap();
        let err = bind_loopback(port).await.unwrap_err();
        assert!(matches!(err, SandboxError::ProxyBindFailed { .. }));
    }
}
