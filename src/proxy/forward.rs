//! Plain-HTTP forwarding
//!
//! Sends an absolute-form proxy request to its origin over a fresh HTTP/1.1
//! connection, records the transaction, and hands the origin's response back
//! untouched. Redirects are never followed.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST};
use hyper::{HeaderMap, Request, Response, Uri, Version};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, instrument, warn};

use crate::error::{Result, TrailError};
use crate::models::TransactionRecord;
use crate::proxy::extract;
use crate::proxy::scope::OperationScope;
use crate::repository::TransactionSink;

/// Body type of every response the proxy writes
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Configuration for the forwarder
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Bound on the TCP dial to the origin
    pub connect_timeout: Duration,
    /// Bound on dial plus response headers, `None` for no bound
    pub request_timeout: Option<Duration>,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Origin host and port taken from an absolute request URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginTarget {
    pub host: String,
    pub port: u16,
}

impl OriginTarget {
    pub fn from_uri(uri: &Uri) -> Result<Self> {
        match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("http") => {}
            Some(other) => return Err(TrailError::UnsupportedScheme(other.to_string())),
            None => {
                return Err(TrailError::InvalidRequest(
                    "Proxy requests need an absolute URI".to_string(),
                ))
            }
        }

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TrailError::InvalidRequest("Missing host in URI".to_string()))?;

        Ok(Self {
            host: host.to_string(),
            port: uri.port_u16().unwrap_or(80),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value for a `Host` header: the port is left out when it is the default
    pub fn host_header(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            self.addr()
        }
    }
}

impl fmt::Display for OriginTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr())
    }
}

/// Forwards plain-HTTP requests and records each completed transaction
pub struct HttpForwarder {
    config: ForwarderConfig,
    sink: Arc<dyn TransactionSink>,
}

impl HttpForwarder {
    pub fn new(config: ForwarderConfig, sink: Arc<dyn TransactionSink>) -> Self {
        Self { config, sink }
    }

    /// Forward one request and return the origin's response for the client.
    ///
    /// The transaction is recorded before the response is returned, so it is
    /// stored before any byte of it reaches the client.
    #[instrument(skip(self, req, scope), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        scope: &OperationScope,
    ) -> Result<Response<ProxyBody>> {
        let target = OriginTarget::from_uri(req.uri())?;
        let scope = scope.child(self.config.request_timeout);

        let (parts, body) = req.into_parts();
        let body = scope
            .run(async {
                body.collect()
                    .await
                    .map(|collected| collected.to_bytes())
                    .map_err(|e| TrailError::InvalidRequest(format!("Failed to read body: {}", e)))
            })
            .await?;

        let outbound = build_outbound_request(&parts, &target, body.clone())?;
        let response = scope.run(self.exchange(&target, outbound)).await?;

        debug!(
            origin = %target,
            status = response.status().as_u16(),
            "Origin responded"
        );

        let (request_snapshot, response_snapshot) = extract::capture(&parts, &body, &response);
        self.record(extract::transaction_record(&request_snapshot, &response_snapshot))
            .await;

        let (response_parts, incoming) = response.into_parts();
        Ok(Response::from_parts(response_parts, incoming.boxed()))
    }

    /// Dial the origin and exchange one request for response headers
    async fn exchange(
        &self,
        target: &OriginTarget,
        request: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>> {
        let dial = TcpStream::connect(target.addr());
        let stream = tokio::time::timeout(self.config.connect_timeout, dial)
            .await
            .map_err(|_| TrailError::Timeout)?
            .map_err(|e| {
                TrailError::OriginUnreachable(format!("TCP connect to {} failed: {}", target, e))
            })?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(io)
            .await
            .map_err(|e| TrailError::UpstreamProtocol(format!("Handshake failed: {}", e)))?;

        // Drives the connection until the response body is fully read
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Origin connection ended: {}", e);
            }
        });

        sender
            .send_request(request)
            .await
            .map_err(|e| TrailError::UpstreamProtocol(format!("Request failed: {}", e)))
    }

    async fn record(&self, record: TransactionRecord) {
        if let Err(e) = self.sink.persist(&record).await {
            warn!(error = %e, "Failed to record transaction");
        }
    }
}

/// Rebuild the client's request for the origin: path-form target, proxy and
/// hop-by-hop headers removed, `Host` taken from the target authority.
pub fn build_outbound_request(
    parts: &http::request::Parts,
    target: &OriginTarget,
    body: Bytes,
) -> Result<Request<Full<Bytes>>> {
    let path: Uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse()
        .map_err(|e| TrailError::InvalidRequest(format!("Invalid request target: {}", e)))?;

    let mut headers = HeaderMap::with_capacity(parts.headers.len());
    for (name, value) in &parts.headers {
        if !is_hop_by_hop_header(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    // The absolute-form authority names the origin; a client Host header never overrides it
    let host = HeaderValue::from_str(&target.host_header())
        .map_err(|e| TrailError::InvalidRequest(format!("Invalid host: {}", e)))?;
    headers.insert(HOST, host);

    let mut request = Request::new(Full::new(body));
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = path;
    *request.version_mut() = Version::HTTP_11;
    *request.headers_mut() = headers;

    Ok(request)
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Method;

    fn parts(builder: http::request::Builder) -> http::request::Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_origin_target_from_absolute_uri() {
        let uri: Uri = "http://example.com/a?b=c".parse().unwrap();
        let target = OriginTarget::from_uri(&uri).unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 80);
        assert_eq!(target.host_header(), "example.com");

        let uri: Uri = "http://127.0.0.1:8081/".parse().unwrap();
        let target = OriginTarget::from_uri(&uri).unwrap();
        assert_eq!(target.addr(), "127.0.0.1:8081");
        assert_eq!(target.host_header(), "127.0.0.1:8081");
    }

    #[test]
    fn test_origin_target_rejects_non_proxy_targets() {
        let uri: Uri = "/relative".parse().unwrap();
        assert!(matches!(
            OriginTarget::from_uri(&uri),
            Err(TrailError::InvalidRequest(_))
        ));

        let uri: Uri = "https://example.com/".parse().unwrap();
        assert!(matches!(
            OriginTarget::from_uri(&uri),
            Err(TrailError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_outbound_request_strips_proxy_framing() {
        let parts = parts(
            Request::builder()
                .method(Method::POST)
                .uri("http://example.com:8080/submit?x=1")
                .header("Proxy-Connection", "keep-alive")
                .header("Proxy-Authorization", "Basic Zm9vOmJhcg==")
                .header("Connection", "keep-alive")
                .header("X-Test", "v1")
                .header("X-Test", "v2"),
        );
        let target = OriginTarget::from_uri(&parts.uri).unwrap();

        let request = build_outbound_request(&parts, &target, Bytes::from_static(b"a=1")).unwrap();

        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri(), "/submit?x=1");
        assert!(request.headers().get("proxy-connection").is_none());
        assert!(request.headers().get("proxy-authorization").is_none());
        assert!(request.headers().get("connection").is_none());
        assert_eq!(request.headers().get_all("x-test").iter().count(), 2);
        assert_eq!(request.headers()[HOST], "example.com:8080");
    }

    #[test]
    fn test_outbound_host_follows_uri_authority() {
        let parts = parts(Request::get("http://example.com").header("Host", "example.com"));
        let target = OriginTarget::from_uri(&parts.uri).unwrap();

        let request = build_outbound_request(&parts, &target, Bytes::new()).unwrap();

        assert_eq!(request.uri(), "/");
        assert_eq!(request.headers().get_all(HOST).iter().count(), 1);
        assert_eq!(request.headers()[HOST], "example.com");

        let parts = parts_with_host("http://127.0.0.1:8081/a", "evil.example");
        let target = OriginTarget::from_uri(&parts.uri).unwrap();

        let request = build_outbound_request(&parts, &target, Bytes::new()).unwrap();

        assert_eq!(request.headers().get_all(HOST).iter().count(), 1);
        assert_eq!(request.headers()[HOST], "127.0.0.1:8081");
    }

    fn parts_with_host(uri: &str, host: &str) -> http::request::Parts {
        parts(Request::get(uri).header("Host", host))
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("Proxy-Connection"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(!is_hop_by_hop_header("content-type"));
        assert!(!is_hop_by_hop_header("cookie"));
    }
}
