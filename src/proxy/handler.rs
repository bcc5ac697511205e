//! Request dispatch
//!
//! Routes CONNECT to the tunnel handler and everything else to the forwarder.
//! This is also where errors stop: whatever goes wrong below becomes a status
//! code for the client and a log line, never a failure of the connection task.

use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, Response, StatusCode};
use tracing::{error, instrument, warn};

use crate::config::ProxyServerConfig;
use crate::error::Result;
use crate::proxy::forward::{full, ForwarderConfig, HttpForwarder, ProxyBody};
use crate::proxy::scope::OperationScope;
use crate::proxy::tunnel::{TunnelConfig, TunnelHandler};
use crate::repository::TransactionSink;

/// Configuration for proxy handler
#[derive(Debug, Clone)]
pub struct ProxyHandlerConfig {
    /// Timeout for origin and CONNECT target dials
    pub connect_timeout: Duration,
    /// Timeout for a forwarded exchange, `None` for no bound
    pub request_timeout: Option<Duration>,
    /// Lifetime bound for tunnels, `None` for no bound
    pub tunnel_timeout: Option<Duration>,
}

impl Default for ProxyHandlerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Some(Duration::from_secs(30)),
            tunnel_timeout: None,
        }
    }
}

impl From<&ProxyServerConfig> for ProxyHandlerConfig {
    fn from(config: &ProxyServerConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            tunnel_timeout: config.tunnel_timeout(),
        }
    }
}

/// Proxy request handler
pub struct ProxyHandler {
    forwarder: HttpForwarder,
    tunnels: TunnelHandler,
}

impl ProxyHandler {
    pub fn new(config: ProxyHandlerConfig, sink: Arc<dyn TransactionSink>) -> Self {
        let forwarder = HttpForwarder::new(
            ForwarderConfig {
                connect_timeout: config.connect_timeout,
                request_timeout: config.request_timeout,
            },
            sink,
        );
        let tunnels = TunnelHandler::new(TunnelConfig {
            connect_timeout: config.connect_timeout,
            tunnel_timeout: config.tunnel_timeout,
        });

        Self { forwarder, tunnels }
    }

    /// Handle an incoming proxy request
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        scope: &OperationScope,
    ) -> Result<Response<ProxyBody>> {
        if req.method() == Method::CONNECT {
            return self.tunnels.establish(req, scope).await;
        }

        self.forwarder.forward(req, scope).await
    }

    /// Handle a request, turning any failure into a bare status response
    #[instrument(skip(self, req, scope), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn serve(&self, req: Request<Incoming>, scope: &OperationScope) -> Response<ProxyBody> {
        match self.handle(req, scope).await {
            Ok(response) => response,
            Err(e) => {
                if e.is_client_error() {
                    warn!(error = %e, "Rejected proxy request");
                } else {
                    error!(error = %e, "Proxy request failed");
                }
                error_response(e.status_code())
            }
        }
    }
}

/// Create an error response carrying only the status and its reason phrase
pub fn error_response(status: StatusCode) -> Response<ProxyBody> {
    let reason = status.canonical_reason().unwrap_or("Error");
    let mut response = Response::new(full(reason));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("text/plain"));
    response
}
