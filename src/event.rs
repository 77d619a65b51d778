//! Events reported to the scheduler's event loop by process and health tasks

use crate::error::{ExitStatusInfo, HealthTimeoutError};
use crate::health::ProbeFailure;
use tokio::sync::mpsc;

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Which health watch produced a probe result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePhase {
    /// Waiting for a fresh instance to become healthy
    Readiness,
    /// Re-probing an instance that was already healthy
    Liveness,
}

/// Every event carries the attempt number of the instance it concerns; events for
/// an older attempt are ignored.
#[derive(Debug, Clone)]
pub enum Event {
    Probe {
        service: String,
        attempt: u64,
        phase: ProbePhase,
        outcome: Result<(), ProbeFailure>,
    },
    HealthTimeout {
        service: String,
        attempt: u64,
        error: HealthTimeoutError,
    },
    Exited {
        service: String,
        attempt: u64,
        status: ExitStatusInfo,
        /// The exit followed a stop request
        requested: bool,
    },
    RestartDue {
        service: String,
        /// The attempt that failed
        attempt: u64,
    },
}

impl Event {
    pub fn service(&self) -> &str {
        match self {
            Event::Probe { service, .. }
            | Event::HealthTimeout { service, .. }
            | Event::Exited { service, .. }
            | Event::RestartDue { service, .. } => service,
        }
    }

    pub fn attempt(&self) -> u64 {
        match self {
            Event::Probe { attempt, .. }
            | Event::HealthTimeout { attempt, .. }
            | Event::Exited { attempt, .. }
            | Event::RestartDue { attempt, .. } => *attempt,
        }
    }
}
