//! Error taxonomy for the orchestrator and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Process exit codes of the `devgate` binary
pub mod exit_code {
    pub const SUCCESS: u8 = 0;
    pub const STARTUP_ABORTED: u8 = 1;
    pub const INVALID_CONFIG: u8 = 2;
    pub const INTERRUPTED: u8 = 130;
}

/// A service definition field failed validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Path of the offending field, e.g. `services[2].depends_on`
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// The dependency graph contains a cycle
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("dependency cycle: {}", .cycle.join(" -> "))]
pub struct CyclicDependencyError {
    /// Services on the cycle; the first name is repeated at the end
    pub cycle: Vec<String>,
}

/// Errors produced while turning raw definitions into a registry
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Cycle(#[from] CyclicDependencyError),
}

/// A service never passed its readiness probe within the configured timeout
#[derive(Debug, Clone, thiserror::Error)]
#[error("service '{service}' did not become healthy within {}s (last probe: {last_failure})", .timeout.as_secs_f64())]
pub struct HealthTimeoutError {
    pub service: String,
    pub timeout: Duration,
    pub last_failure: String,
}

/// How a process terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum ExitStatusInfo {
    /// Exited with a status code
    Code(i32),
    /// Killed by a signal
    Signal(i32),
    /// The status could not be determined
    Unknown,
}

impl ExitStatusInfo {
    pub fn from_status(status: &std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitStatusInfo::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitStatusInfo::Signal(signal);
            }
        }
        ExitStatusInfo::Unknown
    }

    /// True for a zero exit code
    pub fn success(&self) -> bool {
        matches!(self, ExitStatusInfo::Code(0))
    }
}

impl fmt::Display for ExitStatusInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatusInfo::Code(code) => write!(f, "exit code {}", code),
            ExitStatusInfo::Signal(signal) => write!(f, "killed by signal {}", signal),
            ExitStatusInfo::Unknown => write!(f, "unknown exit status"),
        }
    }
}

/// A supervised process exited without being asked to
#[derive(Debug, Clone, thiserror::Error)]
#[error("service '{service}' exited unexpectedly ({status})")]
pub struct ProcessExitError {
    pub service: String,
    pub status: ExitStatusInfo,
}

/// Startup stopped because a service failed before dependents could be launched
#[derive(Debug, Clone, thiserror::Error)]
#[error("startup aborted: service '{failed}' failed ({cause}){}", blocked_suffix(.blocked))]
pub struct StartupAbortedError {
    /// The first service that failed
    pub failed: String,
    /// Observed cause for the failed service
    pub cause: String,
    /// Further services that failed in the same run
    pub also_failed: Vec<String>,
    /// Services never dispatched because a dependency failed
    pub blocked: Vec<String>,
}

fn blocked_suffix(blocked: &[String]) -> String {
    if blocked.is_empty() {
        String::new()
    } else {
        format!("; not started: {}", blocked.join(", "))
    }
}

/// A proxied request matched a route whose service is not healthy
#[derive(Debug, Clone, thiserror::Error)]
#[error("route '{prefix}' is unavailable: service '{service}' is not healthy")]
pub struct ProxyUpstreamUnavailable {
    pub service: String,
    pub prefix: String,
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No route prefix matches the request path
    UnknownRoute,
    /// The route's service is not healthy
    ServiceUnavailable,
    /// Request body exceeds the configured cap
    PayloadTooLarge,
    /// Request timed out waiting for the upstream
    RequestTimeout,
    /// Failed to connect to the upstream
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownRoute => StatusCode::NOT_FOUND,
            ProxyErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownRoute => "UNKNOWN_ROUTE",
            ProxyErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ProxyErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// 503 for a route whose service is not healthy, with retry guidance
pub fn service_unavailable_response(
    unavailable: &ProxyUpstreamUnavailable,
    retry_after: Duration,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = json_error_response(ProxyErrorCode::ServiceUnavailable, unavailable.to_string());
    response.headers_mut().insert(
        hyper::header::RETRY_AFTER,
        hyper::header::HeaderValue::from(retry_after.as_secs().max(1)),
    );
    response
}
