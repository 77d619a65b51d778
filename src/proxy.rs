use crate::config::ServerConfig;
use crate::error::{json_error_response, service_unavailable_response, ProxyErrorCode, ProxyUpstreamUnavailable};
use crate::pool::ConnectionPool;
use crate::registry::Endpoint;
use crate::routes::{RouteEntry, SharedRouteTable};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Upper bound on an upstream's upgrade response head
const MAX_UPGRADE_RESPONSE_HEAD: usize = 16 * 1024;

/// Per-request limits applied by the proxy
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Max time to wait for the upstream's response head
    pub request_timeout: Duration,
    /// Request body cap in bytes
    pub max_body_bytes: u64,
    /// Retry-After value for 503 responses
    pub retry_after: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for ProxySettings {
    fn from(server: &ServerConfig) -> Self {
        Self {
            request_timeout: server.request_timeout(),
            max_body_bytes: server.max_body_bytes,
            retry_after: server.retry_after(),
        }
    }
}

/// The reverse proxy in front of every routed service
pub struct ProxyServer {
    routes: SharedRouteTable,
    settings: Arc<ProxySettings>,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
}

impl ProxyServer {
    pub fn new(
        routes: SharedRouteTable,
        settings: ProxySettings,
        shutdown_rx: watch::Receiver<bool>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            routes,
            settings: Arc::new(settings),
            shutdown_rx,
            pool,
        }
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let routes = Arc::clone(&self.routes);
                            let settings = Arc::clone(&self.settings);
                            let pool = Arc::clone(&self.pool);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, routes, settings, pool).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    routes: SharedRouteTable,
    settings: Arc<ProxySettings>,
    pool: Arc<ConnectionPool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let routes = Arc::clone(&routes);
        let settings = Arc::clone(&settings);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, routes, settings, pool, addr).await }
    });

    // HTTP/1.1 with upgrades, or HTTP/2 cleartext
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    routes: SharedRouteTable,
    settings: Arc<ProxySettings>,
    pool: Arc<ConnectionPool>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Overwrite rather than append: this proxy is the first hop
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    // Exactly one snapshot for the whole request
    let table = routes.load_full();
    let path = req.uri().path().to_string();

    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let route = match table.lookup(&path) {
        Some(route) => route.clone(),
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::UnknownRoute,
                format!("No route for {}", path),
            ));
        }
    };

    if !route.active {
        let unavailable = ProxyUpstreamUnavailable {
            service: route.service.clone(),
            prefix: route.prefix.clone(),
        };
        debug!(request_id, error = %unavailable, "Rejecting request");
        return Ok(service_unavailable_response(&unavailable, settings.retry_after));
    }

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let upstream_path = route.upstream_path(path_and_query);

    // Check for WebSocket/HTTP upgrade request
    if is_upgrade_request(&req) {
        return handle_upgrade(req, route, upstream_path, request_id, &settings).await;
    }

    if let Some(length) = declared_content_length(&req) {
        if length > settings.max_body_bytes {
            warn!(
                service = %route.service,
                request_id,
                content_length = length,
                max_body_bytes = settings.max_body_bytes,
                "Request body too large"
            );
            return Ok(json_error_response(
                ProxyErrorCode::PayloadTooLarge,
                format!("Request body exceeds {} bytes", settings.max_body_bytes),
            ));
        }
    }

    let limit = usize::try_from(settings.max_body_bytes).unwrap_or(usize::MAX);
    let (parts, body) = req.into_parts();
    let req = Request::from_parts(parts, Limited::new(body, limit));

    let request_timeout = settings.request_timeout;
    let result = tokio::time::timeout(
        request_timeout,
        pool.send_request(req, &route.upstream, &upstream_path),
    )
    .await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) if e.is_body_too_large() => {
            warn!(service = %route.service, request_id, "Streaming request body exceeded the cap");
            Ok(json_error_response(
                ProxyErrorCode::PayloadTooLarge,
                format!("Request body exceeds {} bytes", settings.max_body_bytes),
            ))
        }
        Ok(Err(e)) => {
            error!(service = %route.service, upstream = %route.upstream, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to reach service '{}'", route.service),
            ))
        }
        Err(_) => {
            warn!(
                service = %route.service,
                upstream = %route.upstream,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Service '{}' did not respond within {} seconds",
                    route.service,
                    request_timeout.as_secs()
                ),
            ))
        }
    }
}

fn declared_content_length(req: &Request<Incoming>) -> Option<u64> {
    req.headers()
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Check if a request is a connection upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Get the value of the Upgrade header
fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

/// Forward bytes bidirectionally between client and upstream connections
///
/// `early` holds bytes the upstream sent right after its 101 response head.
async fn forward_bidirectional(
    client: Upgraded,
    mut upstream: TcpStream,
    early: Vec<u8>,
    service: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);

    if !early.is_empty() {
        if let Err(e) = client_io.write_all(&early).await {
            debug!(service, request_id, error = %e, "Failed to relay early upstream bytes");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream).await {
        Ok((client_to_upstream, upstream_to_client)) => {
            debug!(
                service,
                request_id,
                client_to_upstream,
                upstream_to_client,
                "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(service, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Build the raw HTTP upgrade request to send upstream
fn build_upgrade_request<B>(req: &Request<B>, route: &RouteEntry, upstream_path: &str) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), upstream_path);

    // Forward all headers except Host, which is rewritten below
    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}\r\n", route.upstream));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Read an HTTP response head, returning it and any bytes received after it
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed connection before responding",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_UPGRADE_RESPONSE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
    }
}

/// Parse an HTTP response head into its status and headers
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Parse status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Step of the upstream upgrade handshake that failed
#[derive(Debug)]
enum HandshakeError {
    Connect(std::io::Error),
    Send(std::io::Error),
    Read(std::io::Error),
}

/// Connect upstream, send the upgrade request and read its response head
async fn upstream_handshake(
    upstream: &Endpoint,
    raw_request: &[u8],
) -> Result<(TcpStream, Vec<u8>, Vec<u8>), HandshakeError> {
    let mut stream = TcpStream::connect((upstream.host.as_str(), upstream.port))
        .await
        .map_err(HandshakeError::Connect)?;
    stream.write_all(raw_request).await.map_err(HandshakeError::Send)?;
    let (head, early) = read_response_head(&mut stream).await.map_err(HandshakeError::Read)?;
    Ok((stream, head, early))
}

/// Relay a connection upgrade: forward the handshake, then copy bytes both ways
async fn handle_upgrade(
    req: Request<Incoming>,
    route: RouteEntry,
    upstream_path: String,
    request_id: String,
    settings: &ProxySettings,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let service = route.service.clone();
    let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
    debug!(service, request_id, upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, &route, &upstream_path);

    let handshake = tokio::time::timeout(
        settings.request_timeout,
        upstream_handshake(&route.upstream, &raw_request),
    )
    .await;

    let (upstream, head, early) = match handshake {
        Ok(Ok(parts)) => parts,
        Ok(Err(HandshakeError::Connect(e))) => {
            error!(service, upstream = %route.upstream, error = %e, "Failed to connect upstream for upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to reach service '{}'", service),
            ));
        }
        Ok(Err(HandshakeError::Send(e))) => {
            error!(service, error = %e, "Failed to send upgrade request upstream");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to send upgrade request: {}", e),
            ));
        }
        Ok(Err(HandshakeError::Read(e))) => {
            error!(service, error = %e, "Failed to read upgrade response");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to read upgrade response: {}", e),
            ));
        }
        Err(_) => {
            warn!(
                service,
                upstream = %route.upstream,
                timeout_secs = settings.request_timeout.as_secs(),
                "Upgrade handshake timed out"
            );
            return Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Service '{}' did not answer the upgrade within {} seconds",
                    service,
                    settings.request_timeout.as_secs()
                ),
            ));
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&head) {
        Some(parsed) => parsed,
        None => {
            error!(service, "Failed to parse upgrade response");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Invalid upgrade response from upstream",
            ));
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(service, status = %status, "Upstream rejected upgrade request");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            let name_lower = name.to_lowercase();
            if name_lower == "content-length" || name_lower == "transfer-encoding" {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .unwrap_or_else(|_| json_error_response(ProxyErrorCode::InternalError, "Invalid upstream response")));
    }

    info!(service, request_id, upgrade_type, "Upgrade successful");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        // Skip hop-by-hop headers that hyper handles
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    let response = match response.body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed()) {
        Ok(response) => response,
        Err(e) => {
            error!(service, error = %e, "Invalid upgrade response headers");
            return Ok(json_error_response(
                ProxyErrorCode::InternalError,
                "Invalid upgrade response from upstream",
            ));
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(service, request_id, "Client upgrade complete, starting forwarding");
                forward_bidirectional(upgraded, upstream, early, &service, &request_id).await;
            }
            Err(e) => {
                error!(service, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}
