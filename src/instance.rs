//! Per-service runtime state owned by the scheduler
//!
//! [`ServiceInstance`] is mutated only inside the scheduler's event loop. The serializable
//! [`StackStatus`] snapshot is what the admin API and the `status` command see.

use crate::registry::Registry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Lifecycle state of a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// Waiting for its launch wave
    Pending,
    /// Process is being spawned
    Starting,
    /// Process is running, readiness probe not yet passed
    HealthChecking,
    /// Ready to accept traffic
    Healthy,
    /// Was healthy, liveness probes are failing
    Degraded,
    /// Stop requested, waiting for the process to exit
    Stopping,
    /// Stopped on request or exited cleanly
    Stopped,
    /// Gave up on this service
    Failed,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Failed)
    }

    /// Healthy or degraded: the instance passed readiness at least once
    pub fn is_up(&self) -> bool {
        matches!(self, InstanceState::Healthy | InstanceState::Degraded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Starting => "starting",
            InstanceState::HealthChecking => "health-checking",
            InstanceState::Healthy => "healthy",
            InstanceState::Degraded => "degraded",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an instance is failing, remembered until the restart policy has run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The readiness deadline passed
    HealthTimeout(String),
    /// The process exited without a stop request
    Exited { message: String, clean: bool },
}

impl FailureCause {
    pub fn message(&self) -> &str {
        match self {
            FailureCause::HealthTimeout(message) => message,
            FailureCause::Exited { message, .. } => message,
        }
    }

    /// A zero exit code; `on-failure` does not restart these
    pub fn is_clean_exit(&self) -> bool {
        matches!(self, FailureCause::Exited { clean: true, .. })
    }
}

/// One service's current attempt
#[derive(Debug)]
pub struct ServiceInstance {
    pub name: String,
    /// Incremented on every start; events for older attempts are stale
    pub attempt: u64,
    pub state: InstanceState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_check_at: Option<DateTime<Utc>>,
    /// Set on every transition into Healthy; feeds the backoff reset
    pub healthy_since: Option<Instant>,
    /// Readiness or liveness watch for the current attempt
    pub probe_task: Option<JoinHandle<()>>,
    pub process_alive: bool,
    /// Failure waiting for the process to exit before the restart policy runs
    pub pending_failure: Option<FailureCause>,
    pub consecutive_failures: u32,
    pub restarts: u32,
    pub last_error: Option<String>,
}

impl ServiceInstance {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attempt: 0,
            state: InstanceState::Pending,
            pid: None,
            started_at: None,
            last_health_check_at: None,
            healthy_since: None,
            probe_task: None,
            process_alive: false,
            pending_failure: None,
            consecutive_failures: 0,
            restarts: 0,
            last_error: None,
        }
    }

    /// Cancel whichever health watch is running
    pub fn abort_probe(&mut self) {
        if let Some(task) = self.probe_task.take() {
            task.abort();
        }
    }

    /// How long the instance has been continuously healthy
    pub fn healthy_for(&self) -> Option<std::time::Duration> {
        self.healthy_since.map(|since| since.elapsed())
    }
}

impl Drop for ServiceInstance {
    fn drop(&mut self) {
        self.abort_probe();
    }
}

/// Overall phase of the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StackPhase {
    Starting,
    Running,
    /// Startup stopped at a failed service; healthy services keep running
    Aborted,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for StackPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StackPhase::Starting => "starting",
            StackPhase::Running => "running",
            StackPhase::Aborted => "aborted",
            StackPhase::ShuttingDown => "shutting-down",
            StackPhase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: InstanceState,
    pub attempt: u64,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub restarts: u32,
    pub route: Option<String>,
    pub last_error: Option<String>,
    /// Failed dependency that kept this service from starting
    pub blocked_by: Option<String>,
    pub restart_pending: bool,
}

impl ServiceStatus {
    /// State shown to users, noting blocked services and pending restarts
    pub fn display_state(&self) -> String {
        match &self.blocked_by {
            Some(dependency) => format!("blocked ({})", dependency),
            None if self.restart_pending => format!("{} (restarting)", self.state),
            None => self.state.to_string(),
        }
    }
}

/// Snapshot of every service, published after each transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackStatus {
    pub phase: StackPhase,
    pub services: Vec<ServiceStatus>,
}

impl StackStatus {
    /// Every service stopped; what `status` reports when nothing is running
    pub fn stopped(registry: &Registry) -> Self {
        let services = registry
            .specs()
            .iter()
            .map(|spec| ServiceStatus {
                name: spec.name.clone(),
                state: InstanceState::Stopped,
                attempt: 0,
                pid: None,
                started_at: None,
                last_health_check_at: None,
                restarts: 0,
                route: spec.route.as_ref().map(|r| r.prefix.clone()),
                last_error: None,
                blocked_by: None,
                restart_pending: false,
            })
            .collect();
        Self {
            phase: StackPhase::Stopped,
            services,
        }
    }

    pub fn service(&self, name: &str) -> Option<&ServiceStatus> {
        self.services.iter().find(|s| s.name == name)
    }
}
