//! Readiness and liveness probing
//!
//! A probe answers one question, "is this service ready right now?", and each watch task
//! reports its results to the scheduler as events. Watches never change instance state
//! themselves.

use crate::error::HealthTimeoutError;
use crate::event::{Event, EventSender, ProbePhase};
use crate::pool::ConnectionPool;
use crate::registry::{HealthProbe, ServiceSpec};
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

/// Why a probe did not succeed; every variant means "not healthy yet"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    /// Nothing is listening yet
    ConnectionRefused,
    /// HTTP probe answered outside 200..300
    Status(u16),
    /// The probe did not finish within the per-probe timeout
    Timeout,
    /// Exec probe exited non-zero (`None` when killed by a signal)
    ExitCode(Option<i32>),
    /// Any other I/O or protocol error
    Io(String),
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeFailure::ConnectionRefused => write!(f, "connection refused"),
            ProbeFailure::Status(status) => write!(f, "unexpected status {}", status),
            ProbeFailure::Timeout => write!(f, "probe timed out"),
            ProbeFailure::ExitCode(Some(code)) => write!(f, "probe exited with code {}", code),
            ProbeFailure::ExitCode(None) => write!(f, "probe killed by signal"),
            ProbeFailure::Io(e) => write!(f, "{}", e),
        }
    }
}

pub type ProbeOutcome = Result<(), ProbeFailure>;

/// Executes health probes and spawns the watch tasks that poll them
#[derive(Clone)]
pub struct HealthChecker {
    pool: Arc<ConnectionPool>,
}

impl HealthChecker {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Run a single probe for `spec`, bounded by its per-probe timeout
    pub async fn probe(&self, spec: &ServiceSpec) -> ProbeOutcome {
        let probe_timeout = spec.health.probe_timeout;
        match &spec.health_probe {
            HealthProbe::Tcp { endpoint } => {
                match timeout(
                    probe_timeout,
                    TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
                )
                .await
                {
                    // Connection accepted; dropping the stream closes it
                    Ok(Ok(_stream)) => Ok(()),
                    Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                        Err(ProbeFailure::ConnectionRefused)
                    }
                    Ok(Err(e)) => Err(ProbeFailure::Io(e.to_string())),
                    Err(_) => Err(ProbeFailure::Timeout),
                }
            }
            HealthProbe::Http { endpoint, path } => {
                match timeout(probe_timeout, self.pool.check_http(endpoint, path)).await {
                    Ok(Ok(status)) if status.is_success() => Ok(()),
                    Ok(Ok(status)) => Err(ProbeFailure::Status(status.as_u16())),
                    Ok(Err(e)) if e.is_connect() => Err(ProbeFailure::ConnectionRefused),
                    Ok(Err(e)) => Err(ProbeFailure::Io(e.to_string())),
                    Err(_) => Err(ProbeFailure::Timeout),
                }
            }
            HealthProbe::Exec { argv } => {
                let Some((program, args)) = argv.split_first() else {
                    return Err(ProbeFailure::Io("empty probe command".to_string()));
                };
                let mut cmd = Command::new(program);
                cmd.args(args)
                    .envs(&spec.env)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true);
                if let Some(dir) = &spec.working_dir {
                    cmd.current_dir(dir);
                }

                // A timed-out probe is dropped, which kills it
                match timeout(probe_timeout, cmd.status()).await {
                    Ok(Ok(status)) if status.success() => Ok(()),
                    Ok(Ok(status)) => Err(ProbeFailure::ExitCode(status.code())),
                    Ok(Err(e)) => Err(ProbeFailure::Io(format!("failed to run probe: {}", e))),
                    Err(_) => Err(ProbeFailure::Timeout),
                }
            }
        }
    }

    /// Poll until the first success or the overall deadline
    ///
    /// Every probe result is reported as an [`Event::Probe`]; reaching the deadline reports
    /// [`Event::HealthTimeout`]. Aborting the returned handle cancels the watch.
    pub fn spawn_readiness(&self, spec: Arc<ServiceSpec>, attempt: u64, events: EventSender) -> JoinHandle<()> {
        let checker = self.clone();
        tokio::spawn(async move { checker.watch_readiness(&spec, attempt, &events).await })
    }

    /// Re-probe a healthy instance on its liveness interval until aborted
    ///
    /// Returns `None` when liveness monitoring is disabled for the service.
    pub fn spawn_liveness(
        &self,
        spec: Arc<ServiceSpec>,
        attempt: u64,
        events: EventSender,
    ) -> Option<JoinHandle<()>> {
        let interval = spec.health.liveness_interval?;
        let checker = self.clone();
        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let outcome = checker.probe(&spec).await;
                if let Err(failure) = &outcome {
                    warn!(service = %spec.name, attempt, %failure, "Liveness probe failed");
                }
                let event = Event::Probe {
                    service: spec.name.clone(),
                    attempt,
                    phase: ProbePhase::Liveness,
                    outcome,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
        }))
    }

    async fn watch_readiness(&self, spec: &ServiceSpec, attempt: u64, events: &EventSender) {
        let deadline = Instant::now() + spec.health.timeout;
        let mut last_failure = ProbeFailure::Timeout;

        debug!(
            service = %spec.name,
            attempt,
            probe = %spec.health_probe,
            timeout_secs = spec.health.timeout.as_secs(),
            "Starting readiness polling"
        );

        loop {
            let outcome = match timeout_at(deadline, self.probe(spec)).await {
                Ok(outcome) => outcome,
                Err(_) => break,
            };

            let healthy = outcome.is_ok();
            if let Err(failure) = &outcome {
                debug!(service = %spec.name, attempt, %failure, "Health check failed");
                last_failure = failure.clone();
            }

            let event = Event::Probe {
                service: spec.name.clone(),
                attempt,
                phase: ProbePhase::Readiness,
                outcome,
            };
            if events.send(event).is_err() || healthy {
                return;
            }

            if timeout_at(deadline, tokio::time::sleep(spec.health.interval))
                .await
                .is_err()
            {
                break;
            }
        }

        let _ = events.send(Event::HealthTimeout {
            service: spec.name.clone(),
            attempt,
            error: HealthTimeoutError {
                service: spec.name.clone(),
                timeout: spec.health.timeout,
                last_failure: last_failure.to_string(),
            },
        });
    }
}
