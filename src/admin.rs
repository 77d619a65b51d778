//! Local control API served while `up` runs
//!
//! `status`, `logs` and `down` talk to a running stack through this server.

use crate::instance::StackStatus;
use crate::logs::LogLine;
use crate::pool::PoolStats;
use crate::supervisor::ProcessSupervisor;
use futures::StreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

/// Version information for the orchestrator
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

pub type AdminBody = UnsyncBoxBody<Bytes, Infallible>;

/// Requests the admin API hands to the main task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Stop every service in reverse dependency order and exit
    Shutdown,
}

pub type ControlSender = mpsc::UnboundedSender<ControlRequest>;
pub type ControlReceiver = mpsc::UnboundedReceiver<ControlRequest>;

fn full(body: impl Into<Bytes>) -> AdminBody {
    Full::new(body.into()).boxed_unsync()
}

/// Helper to create a simple response
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<AdminBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<AdminBody> {
    let mut response = response(status, body.to_string());
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn json_error(status: StatusCode, message: &str) -> Response<AdminBody> {
    json_response(status, &serde_json::json!({ "error": message }))
}

/// Shared state behind every admin request
struct AdminState {
    status_rx: watch::Receiver<StackStatus>,
    supervisor: Arc<ProcessSupervisor>,
    pool_stats: Arc<PoolStats>,
    control: ControlSender,
    auth_token: Option<String>,
}

/// Admin API server for the CLI commands
pub struct AdminServer {
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        status_rx: watch::Receiver<StackStatus>,
        supervisor: Arc<ProcessSupervisor>,
        pool_stats: Arc<PoolStats>,
        control: ControlSender,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state: Arc::new(AdminState {
                status_rx,
                supervisor,
                pool_stats,
                control,
                auth_token: None,
            }),
            shutdown_rx,
        }
    }

    /// Require `Authorization: Bearer <token>` on everything but `/health` and `/version`
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        if let Some(state) = Arc::get_mut(&mut self.state) {
            state.auth_token = token.filter(|t| !t.is_empty());
        }
        self
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, auth = self.state.auth_token.is_some(), "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(stream: S, state: Arc<AdminState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_admin_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: Option<&str>) -> bool {
    let Some(expected) = expected_token else {
        return true;
    };
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected))
        .unwrap_or(false)
}

fn follow_requested(query: Option<&str>) -> bool {
    !query
        .unwrap_or("")
        .split('&')
        .any(|pair| pair == "follow=false" || pair == "follow=0")
}

async fn handle_admin_request<B>(
    req: Request<B>,
    state: Arc<AdminState>,
) -> Result<Response<AdminBody>, Infallible> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    let public = matches!((&method, path.as_str()), (&Method::GET, "/health") | (&Method::GET, "/version"));
    if !public && !check_auth(&req, state.auth_token.as_deref()) {
        warn!(path = %path, "Unauthorized admin API request");
        return Ok(json_error(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => {
            let phase = state.status_rx.borrow().phase;
            json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "status": "ok",
                    "phase": phase,
                    "proxied_requests": state.pool_stats.get_total_requests(),
                    "health_checks": state.pool_stats.get_health_checks(),
                }),
            )
        }

        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        (&Method::GET, "/services") => {
            let status = state.status_rx.borrow().clone();
            match serde_json::to_value(&status) {
                Ok(body) => json_response(StatusCode::OK, &body),
                Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            }
        }

        (&Method::GET, p) if p.starts_with("/logs/") => {
            let name = p.trim_start_matches("/logs/");
            let known = state.status_rx.borrow().service(name).is_some();
            if name.is_empty() || !known {
                json_error(StatusCode::NOT_FOUND, &format!("unknown service '{}'", name))
            } else {
                log_response(&state, name, follow_requested(req.uri().query()))
            }
        }

        (&Method::POST, "/shutdown") => {
            if state.control.send(ControlRequest::Shutdown).is_err() {
                json_error(StatusCode::SERVICE_UNAVAILABLE, "already shutting down")
            } else {
                info!("Shutdown requested via admin API");
                json_response(StatusCode::ACCEPTED, &serde_json::json!({ "status": "shutting down" }))
            }
        }

        _ => json_error(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

/// Captured output as plain text: the backlog, then live lines when following
fn log_response(state: &AdminState, name: &str, follow: bool) -> Response<AdminBody> {
    let Some(buffer) = state.supervisor.logs(name) else {
        // Never started, so nothing was captured yet
        return response(StatusCode::OK, Bytes::new());
    };

    let (backlog, rx) = buffer.subscribe();
    let backlog = futures::stream::iter(backlog);

    let lines = if follow {
        backlog.chain(follow_lines(name.to_string(), rx)).boxed()
    } else {
        backlog.boxed()
    };

    let body = StreamBody::new(lines.map(|line| Ok::<_, Infallible>(Frame::data(Bytes::from(line.render())))));

    let mut response = Response::new(body.boxed_unsync());
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn follow_lines(
    service: String,
    rx: broadcast::Receiver<LogLine>,
) -> impl futures::Stream<Item = LogLine> + Send + 'static {
    futures::stream::unfold((service, rx), |(service, mut rx)| async move {
        loop {
            match rx.recv().await {
                Ok(line) => return Some((line, (service, rx))),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(service = %service, skipped, "Log follower lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}
