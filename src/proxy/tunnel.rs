//! CONNECT tunnel implementation
//!
//! Dials the CONNECT target, answers `200` with no body, then relays raw bytes
//! between the upgraded client connection and the target. Tunnel traffic is
//! never parsed, logged or recorded.

use std::fmt;
use std::io;
use std::time::Duration;

use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::error::{Result, TrailError};
use crate::proxy::forward::{empty, ProxyBody};
use crate::proxy::scope::{OperationScope, ScopeEnd};

/// Lifecycle of one tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Connecting,
    Relaying,
    Closed,
}

/// Direction of one relay pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToOrigin,
    OriginToClient,
}

/// What ended a relay
#[derive(Debug)]
pub enum RelayEnd {
    /// A pump reached end-of-stream after copying `bytes`
    Finished { direction: Direction, bytes: u64 },
    /// A pump hit an I/O error
    Failed { direction: Direction, error: io::Error },
    /// The operation scope ended first
    Scope(ScopeEnd),
}

impl RelayEnd {
    fn from_pump(direction: Direction, result: io::Result<u64>) -> Self {
        match result {
            Ok(bytes) => RelayEnd::Finished { direction, bytes },
            Err(error) => RelayEnd::Failed { direction, error },
        }
    }
}

/// Configuration for CONNECT tunnels
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Bound on the TCP dial to the target
    pub connect_timeout: Duration,
    /// Bound on the relay's lifetime, `None` to relay until a side closes
    pub tunnel_timeout: Option<Duration>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            tunnel_timeout: None,
        }
    }
}

/// `host:port` named by a CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    /// Parse the authority-form target; the port defaults to 443
    pub fn from_request<B>(req: &Request<B>) -> Result<Self> {
        let authority = req
            .uri()
            .authority()
            .ok_or_else(|| TrailError::InvalidRequest("CONNECT target must be host:port".into()))?;

        let host = authority.host();
        if host.is_empty() {
            return Err(TrailError::InvalidRequest("Missing host in CONNECT target".into()));
        }

        Ok(Self {
            host: host.to_string(),
            port: authority.port_u16().unwrap_or(443),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr())
    }
}

/// Handles CONNECT tunnel requests
pub struct TunnelHandler {
    config: TunnelConfig,
}

impl TunnelHandler {
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    /// Dial the target and, on success, answer `200` and start relaying once
    /// the client connection has been handed over.
    #[instrument(skip(self, req, scope), fields(uri = %req.uri()))]
    pub async fn establish<B>(
        &self,
        mut req: Request<B>,
        scope: &OperationScope,
    ) -> Result<Response<ProxyBody>> {
        let target = ConnectTarget::from_request(&req)?;

        // Claim the connection before dialing so an unupgradable one never opens a socket
        let on_upgrade = req
            .extensions_mut()
            .remove::<OnUpgrade>()
            .ok_or(TrailError::UpgradeUnavailable)?;

        debug!(state = ?TunnelState::Connecting, connect_target = %target, "Dialing CONNECT target");
        let origin = scope.run(self.dial(&target)).await?;

        let relay_scope = scope.child(self.config.tunnel_timeout);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    debug!(state = ?TunnelState::Relaying, connect_target = %target, "Tunnel established");
                    let client = TokioIo::new(upgraded);
                    let end = relay(client, origin, &relay_scope).await;
                    debug!(state = ?TunnelState::Closed, connect_target = %target, end = ?end, "Tunnel closed");
                }
                Err(e) => {
                    debug!(state = ?TunnelState::Closed, connect_target = %target, "CONNECT upgrade failed: {}", e);
                }
            }
        });

        // The client's bytes only flow once this response has been written
        Ok(Response::new(empty()))
    }

    async fn dial(&self, target: &ConnectTarget) -> Result<TcpStream> {
        match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(target.addr()))
            .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(TrailError::ConnectFailed(format!("{}: {}", target, e))),
            Err(_) => Err(TrailError::Timeout),
        }
    }
}

/// Copy bytes both ways until either direction ends, then close both sides.
///
/// Neither pump outlives the other: the first one to finish (or the scope
/// ending) shuts down both write halves and drops both streams.
pub async fn relay<C, S>(client: C, origin: S, scope: &OperationScope) -> RelayEnd
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut origin_read, mut origin_write) = tokio::io::split(origin);

    let end = tokio::select! {
        result = tokio::io::copy(&mut client_read, &mut origin_write) => {
            RelayEnd::from_pump(Direction::ClientToOrigin, result)
        }
        result = tokio::io::copy(&mut origin_read, &mut client_write) => {
            RelayEnd::from_pump(Direction::OriginToClient, result)
        }
        end = scope.ended() => RelayEnd::Scope(end),
    };

    let _ = origin_write.shutdown().await;
    let _ = client_write.shutdown().await;

    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_relay_copies_both_ways_until_client_closes() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (origin, mut origin_peer) = tokio::io::duplex(1024);

        let relay_handle = tokio::spawn(async move {
            relay(client, origin, &OperationScope::unbounded()).await
        });

        client_peer.write_all(b"hello from client").await.unwrap();
        let mut buf = vec![0u8; 17];
        origin_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from client");

        origin_peer.write_all(b"hello from server").await.unwrap();
        let mut buf = vec![0u8; 17];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from server");

        client_peer.shutdown().await.unwrap();

        let end = tokio::time::timeout(Duration::from_secs(1), relay_handle)
            .await
            .expect("relay did not stop after client closed")
            .unwrap();
        assert!(matches!(
            end,
            RelayEnd::Finished {
                direction: Direction::ClientToOrigin,
                bytes: 17
            }
        ));

        // The origin side sees its stream closed as well
        let mut rest = Vec::new();
        let n = origin_peer.read_to_end(&mut rest).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_relay_stops_when_origin_closes() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (origin, mut origin_peer) = tokio::io::duplex(1024);

        let relay_handle = tokio::spawn(async move {
            relay(client, origin, &OperationScope::unbounded()).await
        });

        origin_peer.write_all(b"bye").await.unwrap();
        origin_peer.shutdown().await.unwrap();

        let mut received = Vec::new();
        client_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");

        let end = relay_handle.await.unwrap();
        assert!(matches!(
            end,
            RelayEnd::Finished {
                direction: Direction::OriginToClient,
                bytes: 3
            }
        ));
    }

    #[tokio::test]
    async fn test_relay_ends_with_scope() {
        let (client, _client_peer) = tokio::io::duplex(64);
        let (origin, _origin_peer) = tokio::io::duplex(64);
        let scope = OperationScope::unbounded();
        let cancel = scope.clone();

        let relay_handle = tokio::spawn(async move { relay(client, origin, &scope).await });
        cancel.cancel();

        let end = relay_handle.await.unwrap();
        assert!(matches!(end, RelayEnd::Scope(ScopeEnd::Cancelled)));
    }

    #[tokio::test]
    async fn test_relay_deadline() {
        let (client, _client_peer) = tokio::io::duplex(64);
        let (origin, _origin_peer) = tokio::io::duplex(64);
        let scope = OperationScope::unbounded().child(Some(Duration::from_millis(20)));

        let end = relay(client, origin, &scope).await;
        assert!(matches!(end, RelayEnd::Scope(ScopeEnd::DeadlineExceeded)));
    }

    #[test]
    fn test_connect_target_parsing() {
        let req = Request::connect("example.com:8443").body(()).unwrap();
        let target = ConnectTarget::from_request(&req).unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 8443);

        let req = Request::connect("example.com").body(()).unwrap();
        let target = ConnectTarget::from_request(&req).unwrap();
        assert_eq!(target.addr(), "example.com:443");
    }

    #[tokio::test]
    async fn test_dial_refused_is_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let handler = TunnelHandler::new(TunnelConfig::default());
        let target = ConnectTarget {
            host: addr.ip().to_string(),
            port: addr.port(),
        };

        let err = handler.dial(&target).await.unwrap_err();
        assert!(matches!(err, TrailError::ConnectFailed(_)));
        assert!(err.is_server_error());
    }

    #[tokio::test]
    async fn test_establish_without_upgrade_handle() {
        let handler = TunnelHandler::new(TunnelConfig::default());
        let req = Request::connect("127.0.0.1:9").body(()).unwrap();

        let err = handler
            .establish(req, &OperationScope::unbounded())
            .await
            .unwrap_err();
        assert!(matches!(err, TrailError::UpgradeUnavailable));
    }
}
