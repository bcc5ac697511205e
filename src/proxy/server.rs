//! Proxy server implementation using hyper
//!
//! Accepts client connections and serves each one as HTTP/1.1 with upgrade
//! support, so CONNECT requests can take over the socket.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::config::ProxyServerConfig;
use crate::error::{Result, TrailError};
use crate::proxy::handler::{ProxyHandler, ProxyHandlerConfig};
use crate::proxy::scope::OperationScope;
use crate::repository::TransactionSink;

/// Proxy server
pub struct ProxyServer {
    config: ProxyServerConfig,
    handler: Arc<ProxyHandler>,
}

impl ProxyServer {
    /// Create a new proxy server recording transactions into `sink`
    pub fn new(config: ProxyServerConfig, sink: Arc<dyn TransactionSink>) -> Self {
        let handler = Arc::new(ProxyHandler::new(ProxyHandlerConfig::from(&config), sink));

        Self { config, handler }
    }

    /// Bind the configured address and serve until `shutdown` is cancelled
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| TrailError::InvalidConfig(format!("Invalid proxy server address: {}", e)))?;

        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!("Proxy server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = self.handler.clone();
                            let shutdown = shutdown.clone();

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    client_addr,
                                    handler,
                                    shutdown,
                                ).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Proxy server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle a single connection
    async fn handle_connection(
        stream: TcpStream,
        client_addr: SocketAddr,
        handler: Arc<ProxyHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let io = TokioIo::new(stream);
        let connection_id = Uuid::new_v4();
        debug!(%connection_id, client = %client_addr, "Accepted connection");

        let request_shutdown = shutdown.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            let scope = OperationScope::new(request_shutdown.child_token());

            async move { Ok::<_, Infallible>(handler.serve(req, &scope).await) }
        });

        let conn = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades();
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = shutdown.cancelled() => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };

        debug!(%connection_id, "Connection closed");
        Ok(result?)
    }
}
