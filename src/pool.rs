//! Connection pool for upstream HTTP connections
//!
//! One pooled client forwards proxied requests; a second, with an empty body type, serves
//! HTTP health probes so that probing never competes with proxied traffic for idle connections.

use crate::registry::Endpoint;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Request body as forwarded upstream: the client's body behind the size cap
pub type ProxyBody = Limited<Incoming>;

/// Error type for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Error from the HTTP client
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building a request
    #[error("request build error: {0}")]
    RequestBuild(String),
}

impl PoolError {
    /// The upstream could not be connected to
    pub fn is_connect(&self) -> bool {
        matches!(self, PoolError::Client(e) if e.is_connect())
    }

    /// The request body grew past the configured cap while streaming
    pub fn is_body_too_large(&self) -> bool {
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(err) = source {
            if err.is::<http_body_util::LengthLimitError>() {
                return true;
            }
            source = err.source();
        }
        false
    }
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests made through the pool
    pub total_requests: AtomicU64,
    /// Total number of health check requests
    pub health_checks: AtomicU64,
}

impl PoolStats {
    /// Record a regular request
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a health check request
    pub fn record_health_check(&self) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_health_checks(&self) -> u64 {
        self.health_checks.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl From<&crate::config::ServerConfig> for PoolConfig {
    fn from(server: &crate::config::ServerConfig) -> Self {
        Self {
            max_idle_per_host: server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(server.pool_idle_timeout_secs),
        }
    }
}

/// A connection pool for HTTP connections to upstream services
pub struct ConnectionPool {
    /// Main client for proxying requests
    client: Client<HttpConnector, ProxyBody>,
    /// Dedicated client for health checks (uses Empty body type)
    health_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let health_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            health_client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get pool statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request through the connection pool to `upstream`
    ///
    /// `path_and_query` replaces the request's own path, so routes that strip their
    /// prefix pass the rewritten path here.
    pub async fn send_request(
        &self,
        req: Request<ProxyBody>,
        upstream: &Endpoint,
        path_and_query: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = format!("http://{}{}", upstream, path_and_query);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .version(hyper::Version::HTTP_11);

        // Copy headers
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let upstream_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = self.client.request(upstream_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// GET `path` on `endpoint` and return the response status
    pub async fn check_http(&self, endpoint: &Endpoint, path: &str) -> Result<StatusCode, PoolError> {
        let uri = format!("http://{}{}", endpoint, path);

        let req = Request::builder()
            .method("GET")
            .uri(&uri)
            .header("Connection", "keep-alive")
            .header("User-Agent", concat!("devgate/", env!("CARGO_PKG_VERSION")))
            .body(Empty::<Bytes>::new())
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_health_check();

        let response = self.health_client.request(req).await?;
        Ok(response.status())
    }
}
