//! Dependency-ordered startup, restart policy and reverse-order shutdown
//!
//! The scheduler owns every [`ServiceInstance`]. Process and health tasks never touch
//! instance state; they report through the event queue and the scheduler applies each
//! event on its own task, one at a time.

use crate::backoff::RestartBackoff;
use crate::config::{RestartPolicy, ServiceDefaults};
use crate::error::{ExitStatusInfo, HealthTimeoutError, ProcessExitError, StartupAbortedError};
use crate::event::{Event, EventReceiver, EventSender, ProbePhase};
use crate::health::{HealthChecker, ProbeFailure};
use crate::instance::{FailureCause, InstanceState, ServiceInstance, ServiceStatus, StackPhase, StackStatus};
use crate::registry::Registry;
use crate::routes::{set_service_active, SharedRouteTable};
use crate::supervisor::{ProcessSupervisor, StartOutcome};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Launch waves: every member of wave k depends only on members of earlier waves
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchPlan {
    waves: Vec<Vec<String>>,
}

impl LaunchPlan {
    /// Compute the plan for an acyclic registry
    ///
    /// A service's wave is one past the highest wave among its dependencies. Within a
    /// wave, services keep their declaration order.
    pub fn from_registry(registry: &Registry) -> Self {
        let mut levels: HashMap<&str, usize> = HashMap::new();
        for spec in registry.specs() {
            level_of(registry, &spec.name, &mut levels);
        }

        let depth = levels.values().copied().max().map(|max| max + 1).unwrap_or(0);
        let mut waves = vec![Vec::new(); depth];
        for spec in registry.specs() {
            if let Some(&level) = levels.get(spec.name.as_str()) {
                waves[level].push(spec.name.clone());
            }
        }

        Self { waves }
    }

    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    /// Waves in stop order: dependents before their dependencies
    pub fn shutdown_waves(&self) -> Vec<Vec<String>> {
        self.waves.iter().rev().cloned().collect()
    }

    pub fn wave_of(&self, name: &str) -> Option<usize> {
        self.waves.iter().position(|wave| wave.iter().any(|n| n == name))
    }
}

fn level_of<'a>(registry: &'a Registry, name: &'a str, levels: &mut HashMap<&'a str, usize>) -> usize {
    if let Some(&level) = levels.get(name) {
        return level;
    }
    let Some(spec) = registry.get(name) else {
        return 0;
    };
    let level = spec
        .dependencies
        .iter()
        .map(|dep| level_of(registry, dep, levels) + 1)
        .max()
        .unwrap_or(0);
    levels.insert(spec.name.as_str(), level);
    level
}

/// Restart backoff parameters
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_reset: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&ServiceDefaults::default())
    }
}

impl From<&ServiceDefaults> for SchedulerSettings {
    fn from(defaults: &ServiceDefaults) -> Self {
        Self {
            backoff_base: defaults.restart_backoff_base(),
            backoff_max: defaults.restart_backoff_max(),
            backoff_reset: defaults.restart_backoff_reset(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Stop everything as soon as startup is aborted
    pub abort_on_failure: bool,
}

#[derive(Debug)]
pub struct RunOutcome {
    /// Set when startup did not bring every service up
    pub aborted: Option<StartupAbortedError>,
}

pub struct Scheduler {
    registry: Arc<Registry>,
    plan: LaunchPlan,
    supervisor: Arc<ProcessSupervisor>,
    health: HealthChecker,
    routes: SharedRouteTable,
    events_tx: EventSender,
    events_rx: EventReceiver,
    settings: SchedulerSettings,
    instances: HashMap<String, ServiceInstance>,
    backoff: HashMap<String, RestartBackoff>,
    pending_restarts: HashMap<String, JoinHandle<()>>,
    /// Services left undispatched, with the dependency that was not healthy
    blocked: HashMap<String, String>,
    startup_order: Vec<String>,
    shutdown_order: Vec<String>,
    shutting_down: bool,
    phase: StackPhase,
    status_tx: watch::Sender<StackStatus>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<Registry>,
        supervisor: Arc<ProcessSupervisor>,
        health: HealthChecker,
        routes: SharedRouteTable,
        events_tx: EventSender,
        events_rx: EventReceiver,
        settings: SchedulerSettings,
    ) -> Self {
        let plan = LaunchPlan::from_registry(&registry);
        let instances = registry
            .names()
            .map(|name| (name.to_string(), ServiceInstance::new(name)))
            .collect();
        let (status_tx, _) = watch::channel(StackStatus {
            phase: StackPhase::Starting,
            services: Vec::new(),
        });

        let scheduler = Self {
            registry,
            plan,
            supervisor,
            health,
            routes,
            events_tx,
            events_rx,
            settings,
            instances,
            backoff: HashMap::new(),
            pending_restarts: HashMap::new(),
            blocked: HashMap::new(),
            startup_order: Vec::new(),
            shutdown_order: Vec::new(),
            shutting_down: false,
            phase: StackPhase::Starting,
            status_tx,
        };
        scheduler.publish_status();
        scheduler
    }

    pub fn plan(&self) -> &LaunchPlan {
        &self.plan
    }

    pub fn instance(&self, name: &str) -> Option<&ServiceInstance> {
        self.instances.get(name)
    }

    pub fn state(&self, name: &str) -> Option<InstanceState> {
        self.instances.get(name).map(|i| i.state)
    }

    /// Services in the order they first became healthy
    pub fn startup_order(&self) -> &[String] {
        &self.startup_order
    }

    /// Services in the order their processes exited during shutdown
    pub fn shutdown_order(&self) -> &[String] {
        &self.shutdown_order
    }

    pub fn status(&self) -> StackStatus {
        self.status_tx.borrow().clone()
    }

    /// Receiver that sees a fresh [`StackStatus`] after every transition
    pub fn subscribe_status(&self) -> watch::Receiver<StackStatus> {
        self.status_tx.subscribe()
    }

    /// Start the stack, keep it supervised until `shutdown_rx` turns true, then stop it
    pub async fn run(&mut self, mut shutdown_rx: watch::Receiver<bool>, options: RunOptions) -> RunOutcome {
        let startup = tokio::select! {
            result = self.start_all() => Some(result),
            _ = shutdown_requested(&mut shutdown_rx) => None,
        };

        let aborted = match startup {
            Some(Ok(())) => None,
            Some(Err(e)) => {
                error!(error = %e, "Startup aborted");
                Some(e)
            }
            None => {
                info!("Shutdown requested during startup");
                self.shutdown_all().await;
                return RunOutcome { aborted: None };
            }
        };

        if aborted.is_some() && options.abort_on_failure {
            self.shutdown_all().await;
            return RunOutcome { aborted };
        }

        loop {
            let event = tokio::select! {
                event = self.events_rx.recv() => event,
                _ = shutdown_requested(&mut shutdown_rx) => None,
            };
            match event {
                Some(event) => self.apply(event),
                None => break,
            }
        }

        self.shutdown_all().await;
        RunOutcome { aborted }
    }

    /// Launch every wave in order, waiting for each to settle before the next
    ///
    /// Services whose dependencies are not healthy are never dispatched. Services that did
    /// come up keep running when startup is aborted.
    pub async fn start_all(&mut self) -> Result<(), StartupAbortedError> {
        self.set_phase(StackPhase::Starting);
        let mut failed: Vec<String> = Vec::new();

        for (index, wave) in self.plan.waves().to_vec().into_iter().enumerate() {
            let mut dispatched = Vec::new();

            for name in wave {
                let Some(spec) = self.registry.get(&name).cloned() else {
                    continue;
                };
                let unhealthy_dependency = spec
                    .dependencies
                    .iter()
                    .find(|dep| self.state(dep) != Some(InstanceState::Healthy))
                    .cloned();

                if let Some(dependency) = unhealthy_dependency {
                    warn!(service = %name, dependency = %dependency, "Not starting service: dependency is not healthy");
                    self.blocked.insert(name, dependency);
                    continue;
                }

                self.start_service(&name);
                dispatched.push(name);
            }
            self.publish_status();

            debug!(wave = index, services = ?dispatched, "Waiting for launch wave to settle");
            self.wait_settled(&dispatched).await;

            failed.extend(
                dispatched
                    .into_iter()
                    .filter(|name| !self.state(name).is_some_and(|s| s.is_up())),
            );
        }

        let mut blocked: Vec<String> = self.blocked.keys().cloned().collect();
        blocked.sort_by_key(|name| self.registry.declaration_index(name));

        let Some((first, rest)) = failed.split_first() else {
            self.set_phase(StackPhase::Running);
            info!(services = self.registry.len(), "All services are healthy");
            return Ok(());
        };

        let cause = self
            .instances
            .get(first)
            .and_then(|i| i.last_error.clone())
            .unwrap_or_else(|| "did not become healthy".to_string());

        self.set_phase(StackPhase::Aborted);
        Err(StartupAbortedError {
            failed: first.clone(),
            cause,
            also_failed: rest.to_vec(),
            blocked,
        })
    }

    /// Start a service unless it already has a live instance
    ///
    /// Returns whether a new attempt was dispatched.
    pub fn start_service(&mut self, name: &str) -> bool {
        let Some(spec) = self.registry.get(name).cloned() else {
            warn!(service = %name, "Unknown service");
            return false;
        };
        let instance = self
            .instances
            .entry(name.to_string())
            .or_insert_with(|| ServiceInstance::new(name));

        if !(instance.state == InstanceState::Pending || instance.state.is_terminal()) || instance.process_alive {
            debug!(service = %name, state = %instance.state, "Service already has a live instance");
            return false;
        }

        instance.attempt += 1;
        instance.state = InstanceState::Starting;
        instance.pending_failure = None;
        instance.consecutive_failures = 0;
        instance.healthy_since = None;
        instance.last_health_check_at = None;
        instance.abort_probe();
        let attempt = instance.attempt;

        match self.supervisor.start(&spec, attempt) {
            Ok(StartOutcome::Started { pid }) => {
                instance.pid = Some(pid);
                instance.started_at = Some(Utc::now());
                instance.process_alive = true;
                instance.state = InstanceState::HealthChecking;
                instance.probe_task = Some(self.health.spawn_readiness(
                    Arc::clone(&spec),
                    attempt,
                    self.events_tx.clone(),
                ));
            }
            Ok(StartOutcome::AlreadyRunning { pid, attempt: running }) => {
                // Adopt the live process so its exit event still matches
                info!(service = %name, pid, attempt = running, "Adopting running process");
                instance.attempt = running;
                instance.pid = Some(pid);
                instance.process_alive = true;
                instance.state = InstanceState::HealthChecking;
                instance.probe_task = Some(self.health.spawn_readiness(
                    Arc::clone(&spec),
                    running,
                    self.events_tx.clone(),
                ));
            }
            Err(e) => {
                error!(service = %name, error = %e, "Failed to start service");
                instance.state = InstanceState::Failed;
                instance.pid = None;
                instance.process_alive = false;
                instance.last_error = Some(e.to_string());
            }
        }

        true
    }

    /// Apply one event from a process or health task
    ///
    /// Events for an attempt other than the instance's current one are dropped.
    pub fn apply(&mut self, event: Event) {
        let current = self.instances.get(event.service()).map(|i| i.attempt);
        if current != Some(event.attempt()) {
            debug!(
                service = %event.service(),
                attempt = event.attempt(),
                current = ?current,
                "Ignoring stale event"
            );
            return;
        }

        match event {
            Event::Probe {
                service,
                phase: ProbePhase::Readiness,
                outcome,
                ..
            } => self.on_readiness(&service, outcome),
            Event::Probe {
                service,
                phase: ProbePhase::Liveness,
                outcome,
                ..
            } => self.on_liveness(&service, outcome),
            Event::HealthTimeout { service, error, .. } => self.on_health_timeout(&service, error),
            Event::Exited {
                service,
                status,
                requested,
                ..
            } => self.on_exit(&service, status, requested),
            Event::RestartDue { service, .. } => self.on_restart_due(&service),
        }

        self.publish_status();
    }

    /// Stop every service, dependents strictly before their dependencies
    ///
    /// Members of one shutdown wave are stopped concurrently.
    pub async fn shutdown_all(&mut self) {
        info!("Stopping all services");
        self.shutting_down = true;
        self.set_phase(StackPhase::ShuttingDown);

        for (_, handle) in self.pending_restarts.drain() {
            handle.abort();
        }
        for instance in self.instances.values_mut() {
            instance.abort_probe();
        }
        for spec in self.registry.specs() {
            set_service_active(&self.routes, &spec.name, false);
        }

        for wave in self.plan.shutdown_waves() {
            let mut waiting = Vec::new();
            for name in wave {
                let Some(grace) = self.registry.get(&name).map(|s| s.shutdown_grace_period) else {
                    continue;
                };
                let Some(instance) = self.instances.get_mut(&name) else {
                    continue;
                };
                if !instance.process_alive {
                    if !instance.state.is_terminal() {
                        instance.state = InstanceState::Stopped;
                    }
                    continue;
                }
                instance.state = InstanceState::Stopping;
                self.supervisor.request_stop(&name, grace);
                waiting.push(name);
            }
            self.publish_status();

            if !waiting.is_empty() {
                debug!(services = ?waiting, "Waiting for shutdown wave");
            }
            while waiting
                .iter()
                .any(|name| self.instances.get(name).is_some_and(|i| i.process_alive))
            {
                match self.events_rx.recv().await {
                    Some(event) => self.apply(event),
                    None => break,
                }
            }
        }

        self.set_phase(StackPhase::Stopped);
        info!(stopped = ?self.shutdown_order, "All services stopped");
    }

    /// Wait until every member is up, settled, or has failed at least once
    ///
    /// A member that fails and is scheduled for restart counts as failed for this wave; its
    /// restarts carry on in the background.
    async fn wait_settled(&mut self, names: &[String]) {
        let mut failed_once: HashSet<&str> = HashSet::new();
        loop {
            for name in names {
                if self
                    .instances
                    .get(name)
                    .is_some_and(|i| i.state == InstanceState::Failed && !i.process_alive)
                {
                    failed_once.insert(name.as_str());
                }
            }
            if names
                .iter()
                .all(|name| failed_once.contains(name.as_str()) || self.is_settled(name))
            {
                return;
            }
            match self.events_rx.recv().await {
                Some(event) => self.apply(event),
                None => return,
            }
        }
    }

    /// Up, or terminal with no process left and no restart scheduled
    fn is_settled(&self, name: &str) -> bool {
        match self.instances.get(name) {
            Some(instance) => {
                instance.state.is_up()
                    || (instance.state.is_terminal()
                        && !instance.process_alive
                        && !self.pending_restarts.contains_key(name))
            }
            None => true,
        }
    }

    fn on_readiness(&mut self, name: &str, outcome: Result<(), ProbeFailure>) {
        let Some(spec) = self.registry.get(name).cloned() else {
            return;
        };
        let Some(instance) = self.instances.get_mut(name) else {
            return;
        };
        instance.last_health_check_at = Some(Utc::now());
        if instance.state != InstanceState::HealthChecking {
            return;
        }

        match outcome {
            Ok(()) => {
                info!(service = %name, attempt = instance.attempt, pid = ?instance.pid, "Service is healthy");
                instance.state = InstanceState::Healthy;
                instance.healthy_since = Some(Instant::now());
                instance.consecutive_failures = 0;
                instance.last_error = None;
                instance.probe_task = self
                    .health
                    .spawn_liveness(spec, instance.attempt, self.events_tx.clone());

                if !self.startup_order.iter().any(|n| n == name) {
                    self.startup_order.push(name.to_string());
                }
                if set_service_active(&self.routes, name, true) {
                    debug!(service = %name, "Route activated");
                }
            }
            Err(failure) => {
                instance.last_error = Some(failure.to_string());
            }
        }
    }

    fn on_liveness(&mut self, name: &str, outcome: Result<(), ProbeFailure>) {
        let Some(spec) = self.registry.get(name).cloned() else {
            return;
        };
        let Some(instance) = self.instances.get_mut(name) else {
            return;
        };
        instance.last_health_check_at = Some(Utc::now());
        if !instance.state.is_up() {
            return;
        }

        match outcome {
            Ok(()) => {
                instance.consecutive_failures = 0;
                if instance.state == InstanceState::Degraded {
                    info!(service = %name, "Service recovered");
                    instance.state = InstanceState::Healthy;
                    instance.healthy_since = Some(Instant::now());
                    instance.last_error = None;
                    set_service_active(&self.routes, name, true);
                }
            }
            Err(failure) => {
                instance.consecutive_failures += 1;
                instance.last_error = Some(failure.to_string());

                if instance.state == InstanceState::Healthy {
                    warn!(service = %name, %failure, "Service degraded");
                    instance.state = InstanceState::Degraded;
                    instance.healthy_since = None;
                    set_service_active(&self.routes, name, false);
                }

                if instance.consecutive_failures >= spec.health.unhealthy_threshold {
                    warn!(
                        service = %name,
                        failures = instance.consecutive_failures,
                        "Service unhealthy, waiting for readiness again"
                    );
                    instance.abort_probe();
                    instance.state = InstanceState::HealthChecking;
                    instance.consecutive_failures = 0;
                    instance.probe_task = Some(self.health.spawn_readiness(
                        spec,
                        instance.attempt,
                        self.events_tx.clone(),
                    ));
                }
            }
        }
    }

    fn on_health_timeout(&mut self, name: &str, error: HealthTimeoutError) {
        let Some(grace) = self.registry.get(name).map(|s| s.shutdown_grace_period) else {
            return;
        };
        let Some(instance) = self.instances.get_mut(name) else {
            return;
        };
        if instance.state != InstanceState::HealthChecking {
            return;
        }

        error!(service = %name, error = %error, "Health check timed out");
        instance.abort_probe();
        instance.state = InstanceState::Failed;
        instance.last_error = Some(error.to_string());
        set_service_active(&self.routes, name, false);

        let cause = FailureCause::HealthTimeout(error.to_string());
        if instance.process_alive {
            // The restart policy runs once the exit event arrives
            instance.pending_failure = Some(cause);
            self.supervisor.request_stop(name, grace);
        } else {
            self.on_failure(name, cause, None);
        }
    }

    fn on_exit(&mut self, name: &str, status: ExitStatusInfo, requested: bool) {
        let shutting_down = self.shutting_down;
        let Some(instance) = self.instances.get_mut(name) else {
            return;
        };
        instance.process_alive = false;
        instance.pid = None;
        instance.abort_probe();
        let healthy_for = instance.healthy_for();
        instance.healthy_since = None;
        set_service_active(&self.routes, name, false);

        if shutting_down || instance.state == InstanceState::Stopping {
            instance.state = InstanceState::Stopped;
            if shutting_down {
                self.shutdown_order.push(name.to_string());
            }
            return;
        }

        if let Some(cause) = instance.pending_failure.take() {
            self.on_failure(name, cause, healthy_for);
            return;
        }

        if requested {
            instance.state = InstanceState::Stopped;
            return;
        }

        let err = ProcessExitError {
            service: name.to_string(),
            status,
        };
        error!(service = %name, error = %err, "Service exited");
        instance.state = InstanceState::Failed;
        let cause = FailureCause::Exited {
            message: err.to_string(),
            clean: status.success(),
        };
        self.on_failure(name, cause, healthy_for);
    }

    /// Apply the restart policy after an unexpected exit or a health timeout
    fn on_failure(&mut self, name: &str, cause: FailureCause, healthy_for: Option<Duration>) {
        let Some(spec) = self.registry.get(name).cloned() else {
            return;
        };
        let Some(instance) = self.instances.get_mut(name) else {
            return;
        };
        instance.last_error = Some(cause.message().to_string());

        let restart = !self.shutting_down
            && match spec.restart_policy {
                RestartPolicy::Never => false,
                RestartPolicy::OnFailure => !cause.is_clean_exit(),
                RestartPolicy::Always => true,
            };

        if !restart {
            instance.state = if cause.is_clean_exit() {
                InstanceState::Stopped
            } else {
                InstanceState::Failed
            };
            info!(service = %name, state = %instance.state, policy = ?spec.restart_policy, "Service will not be restarted");
            return;
        }

        if let Some(max) = spec.max_restarts {
            if instance.restarts >= max {
                error!(service = %name, restarts = instance.restarts, "Restart limit reached, giving up");
                instance.state = InstanceState::Failed;
                return;
            }
        }

        instance.state = InstanceState::Failed;
        let settings = &self.settings;
        let delay = self
            .backoff
            .entry(name.to_string())
            .or_insert_with(|| RestartBackoff::new(settings.backoff_base, settings.backoff_max, settings.backoff_reset))
            .next_delay(healthy_for);

        info!(
            service = %name,
            attempt = instance.attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling restart"
        );

        let events = self.events_tx.clone();
        let service = name.to_string();
        let attempt = instance.attempt;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::RestartDue { service, attempt });
        });
        if let Some(previous) = self.pending_restarts.insert(name.to_string(), handle) {
            previous.abort();
        }
    }

    fn on_restart_due(&mut self, name: &str) {
        if self.pending_restarts.remove(name).is_none() || self.shutting_down {
            return;
        }
        if let Some(instance) = self.instances.get_mut(name) {
            instance.restarts += 1;
            info!(service = %name, restarts = instance.restarts, "Restarting service");
        }
        self.start_service(name);
    }

    fn set_phase(&mut self, phase: StackPhase) {
        self.phase = phase;
        self.publish_status();
    }

    fn publish_status(&self) {
        let services = self
            .registry
            .specs()
            .iter()
            .map(|spec| {
                let instance = self.instances.get(&spec.name);
                ServiceStatus {
                    name: spec.name.clone(),
                    state: instance.map(|i| i.state).unwrap_or(InstanceState::Pending),
                    attempt: instance.map(|i| i.attempt).unwrap_or(0),
                    pid: instance.and_then(|i| i.pid),
                    started_at: instance.and_then(|i| i.started_at),
                    last_health_check_at: instance.and_then(|i| i.last_health_check_at),
                    restarts: instance.map(|i| i.restarts).unwrap_or(0),
                    route: spec.route.as_ref().map(|r| r.prefix.clone()),
                    last_error: instance.and_then(|i| i.last_error.clone()),
                    blocked_by: self.blocked.get(&spec.name).cloned(),
                    restart_pending: self.pending_restarts.contains_key(&spec.name),
                }
            })
            .collect();

        self.status_tx.send_replace(StackStatus {
            phase: self.phase,
            services,
        });
    }
}

/// Resolves once the flag turns true; never resolves if the sender is gone
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
