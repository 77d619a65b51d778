//! Process lifecycle for individual services
//!
//! Each spawned process is owned by its own task, which waits for either the process to
//! exit or a stop request. Every exit, requested or not, is reported to the scheduler as an
//! [`Event::Exited`].

use crate::error::ExitStatusInfo;
use crate::event::{Event, EventSender};
use crate::lockfile::{clear_stale_pid_file, pid_is_alive, PidFileState};
use crate::logs::{LogBuffer, OutputStream};
use crate::registry::ServiceSpec;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Errors that prevent a process from being spawned
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("service '{service}': failed to clear pid file {}: {source}", .path.display())]
    PidFile {
        service: String,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("service '{service}': failed to spawn `{program}`: {source}")]
    Spawn {
        service: String,
        program: String,
        source: std::io::Error,
    },
}

/// Result of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new process was spawned
    Started { pid: u32 },
    /// A process for this service is still running; nothing was spawned
    AlreadyRunning { pid: u32, attempt: u64 },
}

/// Snapshot of a supervised process
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub attempt: u64,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub exit: Option<ExitStatusInfo>,
}

impl ProcessInfo {
    pub fn is_running(&self) -> bool {
        self.exit.is_none()
    }
}

/// Internal state for a supervised process
struct ProcessEntry {
    attempt: u64,
    pid: u32,
    started_at: DateTime<Utc>,
    /// Taken by the first stop request
    stop_tx: Option<oneshot::Sender<Duration>>,
    exit_rx: watch::Receiver<Option<ExitStatusInfo>>,
}

impl ProcessEntry {
    fn exit(&self) -> Option<ExitStatusInfo> {
        *self.exit_rx.borrow()
    }
}

/// Starts, stops and watches service processes
pub struct ProcessSupervisor {
    processes: DashMap<String, Mutex<ProcessEntry>>,
    logs: DashMap<String, Arc<LogBuffer>>,
    events: EventSender,
    log_capacity: usize,
}

impl ProcessSupervisor {
    pub fn new(events: EventSender, log_capacity: usize) -> Self {
        Self {
            processes: DashMap::new(),
            logs: DashMap::new(),
            events,
            log_capacity,
        }
    }

    /// Spawn the service's process unless one is already running
    pub fn start(&self, spec: &ServiceSpec, attempt: u64) -> Result<StartOutcome, StartError> {
        if let Some(entry) = self.processes.get(&spec.name) {
            let guard = entry.lock();
            if guard.exit().is_none() {
                debug!(service = %spec.name, pid = guard.pid, "Process already running");
                return Ok(StartOutcome::AlreadyRunning {
                    pid: guard.pid,
                    attempt: guard.attempt,
                });
            }
        }

        // No supervised process is alive, so any pid file is left over from an earlier run
        if let Some(path) = &spec.pid_file {
            match clear_stale_pid_file(path) {
                Ok(PidFileState::Removed(pid)) => {
                    let recycled = pid.is_some_and(pid_is_alive);
                    info!(
                        service = %spec.name,
                        path = %path.display(),
                        stale_pid = ?pid,
                        recycled,
                        "Removed stale pid file"
                    );
                }
                Ok(PidFileState::Absent) => {}
                Err(source) => {
                    return Err(StartError::PidFile {
                        service: spec.name.clone(),
                        path: path.clone(),
                        source,
                    })
                }
            }
        }

        let (program, args) = spec
            .command
            .split_first()
            .map(|(program, args)| (program.as_str(), args))
            .unwrap_or(("", &[]));

        info!(service = %spec.name, attempt, command = %shell_words::join(&spec.command), "Starting service");

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.envs(&spec.env);
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = spec.working_dir {
            cmd.current_dir(working_dir);
        }

        // Own process group so signals reach every descendant
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| StartError::Spawn {
            service: spec.name.clone(),
            program: program.to_string(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);
        info!(service = %spec.name, pid, attempt, "Service process spawned");

        let buffer = self.log_buffer(&spec.name);
        if let Some(stdout) = child.stdout.take() {
            capture_output(spec.name.clone(), OutputStream::Stdout, stdout, Arc::clone(&buffer));
        }
        if let Some(stderr) = child.stderr.take() {
            capture_output(spec.name.clone(), OutputStream::Stderr, stderr, buffer);
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        self.processes.insert(
            spec.name.clone(),
            Mutex::new(ProcessEntry {
                attempt,
                pid,
                started_at: Utc::now(),
                stop_tx: Some(stop_tx),
                exit_rx,
            }),
        );

        tokio::spawn(supervise(
            spec.name.clone(),
            attempt,
            child,
            spec.pid_file.clone(),
            stop_rx,
            exit_tx,
            self.events.clone(),
        ));

        Ok(StartOutcome::Started { pid })
    }

    /// Ask the process to stop without waiting for it
    ///
    /// Returns false when there is no running process or a stop is already under way.
    pub fn request_stop(&self, name: &str, grace: Duration) -> bool {
        let Some(entry) = self.processes.get(name) else {
            return false;
        };
        let mut guard = entry.lock();
        if guard.exit().is_some() {
            return false;
        }
        match guard.stop_tx.take() {
            Some(tx) => tx.send(grace).is_ok(),
            None => false,
        }
    }

    /// Stop the process and wait until it has exited
    ///
    /// SIGTERM goes to the process group, then SIGKILL after `grace`. Stopping a service that is
    /// not running is a no-op returning its last exit status, if any.
    pub async fn stop(&self, name: &str, grace: Duration) -> Option<ExitStatusInfo> {
        let mut exit_rx = {
            let entry = self.processes.get(name)?;
            let mut guard = entry.lock();
            if let Some(tx) = guard.stop_tx.take() {
                let _ = tx.send(grace);
            }
            guard.exit_rx.clone()
        };

        exit_rx
            .wait_for(Option::is_some)
            .await
            .map(|status| *status)
            .ok()
            .flatten()
    }

    /// Stop any running process for the service, then start a fresh one
    pub async fn restart(
        &self,
        spec: &ServiceSpec,
        attempt: u64,
    ) -> Result<StartOutcome, StartError> {
        self.stop(&spec.name, spec.shutdown_grace_period).await;
        self.start(spec, attempt)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.processes
            .get(name)
            .map(|entry| entry.lock().exit().is_none())
            .unwrap_or(false)
    }

    pub fn process_info(&self, name: &str) -> Option<ProcessInfo> {
        self.processes.get(name).map(|entry| {
            let guard = entry.lock();
            ProcessInfo {
                attempt: guard.attempt,
                pid: guard.pid,
                started_at: guard.started_at,
                exit: guard.exit(),
            }
        })
    }

    /// Names of services with a live process
    pub fn running(&self) -> Vec<String> {
        self.processes
            .iter()
            .filter(|entry| entry.value().lock().exit().is_none())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Captured output for a service, kept across restarts
    pub fn logs(&self, name: &str) -> Option<Arc<LogBuffer>> {
        self.logs.get(name).map(|b| Arc::clone(b.value()))
    }

    fn log_buffer(&self, name: &str) -> Arc<LogBuffer> {
        Arc::clone(
            self.logs
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(LogBuffer::new(self.log_capacity)))
                .value(),
        )
    }
}

/// Owns the child until it exits, terminating it on request
async fn supervise(
    service: String,
    attempt: u64,
    mut child: Child,
    pid_file: Option<PathBuf>,
    stop_rx: oneshot::Receiver<Duration>,
    exit_tx: watch::Sender<Option<ExitStatusInfo>>,
    events: EventSender,
) {
    let (result, requested) = tokio::select! {
        result = child.wait() => (result, false),
        grace = stop_rx => match grace {
            Ok(grace) => (terminate(&service, &mut child, grace).await, true),
            // The entry was replaced; keep waiting for the process
            Err(_) => (child.wait().await, false),
        },
    };

    let status = match result {
        Ok(status) => ExitStatusInfo::from_status(&status),
        Err(e) => {
            warn!(service = %service, error = %e, "Error waiting for service process");
            ExitStatusInfo::Unknown
        }
    };

    if requested {
        info!(service = %service, attempt, %status, "Service process stopped");
    } else if status.success() {
        info!(service = %service, attempt, %status, "Service process exited");
    } else {
        warn!(service = %service, attempt, %status, "Service process exited unexpectedly");
    }

    if let Some(path) = pid_file {
        if let Ok(PidFileState::Removed(_)) = clear_stale_pid_file(&path) {
            debug!(service = %service, path = %path.display(), "Removed pid file left by exited process");
        }
    }

    exit_tx.send_replace(Some(status));
    let _ = events.send(Event::Exited {
        service,
        attempt,
        status,
        requested,
    });
}

async fn terminate(
    service: &str,
    child: &mut Child,
    grace: Duration,
) -> std::io::Result<std::process::ExitStatus> {
    let pid = child.id();

    if let Some(pid) = pid {
        info!(service, pid, "Sending SIGTERM to process group");

        #[cfg(unix)]
        signal_group(pid, libc::SIGTERM);

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                service,
                grace_period_secs = grace.as_secs_f64(),
                "Grace period exceeded, sending SIGKILL"
            );
            #[cfg(unix)]
            {
                if let Some(pid) = pid {
                    signal_group(pid, libc::SIGKILL);
                }
            }
            let _ = child.start_kill();
            child.wait().await
        }
    };

    // Leave nothing of the group behind once the leader is gone
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            signal_group(pid, libc::SIGKILL);
        }
    }

    status
}

/// Send `signal` to the process group led by `pid`
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pgid <= 0 {
        return false;
    }
    unsafe { libc::kill(-pgid, signal) == 0 }
}

fn capture_output<R>(service: String, stream: OutputStream, reader: R, buffer: Arc<LogBuffer>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut raw = Vec::new();
        // Drain until EOF; a closed read end would SIGPIPE the service
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(service = %service, %stream, error = %e, "Failed to read service output");
                    break;
                }
            }
            if raw.last() == Some(&b'\n') {
                raw.pop();
                if raw.last() == Some(&b'\r') {
                    raw.pop();
                }
            }
            let line = String::from_utf8_lossy(&raw).into_owned();
            match stream {
                OutputStream::Stdout => info!(target: "service", service = %service, stream = "stdout", "{}", line),
                OutputStream::Stderr => warn!(target: "service", service = %service, stream = "stderr", "{}", line),
            }
            buffer.push(stream, line);
        }
    });
}
