//! Validated, immutable service definitions

use crate::config::{CommandLine, Config, ProbeKind, RestartPolicy, ServiceConfig, ServiceDefaults};
use crate::error::{CyclicDependencyError, RegistryError, ValidationError};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Host and port a service listens on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// How readiness of a service is determined
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthProbe {
    /// Connection accepted
    Tcp { endpoint: Endpoint },
    /// GET returns a 2xx status
    Http { endpoint: Endpoint, path: String },
    /// Command exits 0
    Exec { argv: Vec<String> },
}

impl fmt::Display for HealthProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthProbe::Tcp { endpoint } => write!(f, "tcp://{}", endpoint),
            HealthProbe::Http { endpoint, path } => write!(f, "http://{}{}", endpoint, path),
            HealthProbe::Exec { argv } => write!(f, "exec `{}`", shell_words::join(argv)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSettings {
    /// Delay between readiness probes
    pub interval: Duration,
    /// Overall readiness deadline
    pub timeout: Duration,
    /// Deadline for a single probe
    pub probe_timeout: Duration,
    /// Re-probe interval once healthy; `None` disables liveness monitoring
    pub liveness_interval: Option<Duration>,
    pub unhealthy_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    /// Path prefix, always beginning with `/`
    pub prefix: String,
    pub strip_prefix: bool,
}

/// Validated description of one service
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Direct dependencies, in declaration order
    pub dependencies: Vec<String>,
    pub endpoint: Option<Endpoint>,
    pub health_probe: HealthProbe,
    pub health: HealthSettings,
    pub route: Option<RouteSpec>,
    pub restart_policy: RestartPolicy,
    pub max_restarts: Option<u32>,
    pub working_dir: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    /// Global environment merged with the service's own entries and `PORT`
    pub env: BTreeMap<String, String>,
    pub shutdown_grace_period: Duration,
}

/// The set of services, read-only after load
#[derive(Debug, Clone, Default)]
pub struct Registry {
    specs: Vec<Arc<ServiceSpec>>,
    index: HashMap<String, usize>,
}

impl Registry {
    /// Build the registry from a parsed configuration file
    pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
        Self::load(
            &config.services,
            &config.defaults,
            &config.env,
            &config.base_dir,
        )
    }

    /// Validate raw definitions and produce the registry
    ///
    /// Fails on the first invalid field, or with the cycle path when the
    /// dependency graph is not acyclic.
    pub fn load(
        definitions: &[ServiceConfig],
        defaults: &ServiceDefaults,
        global_env: &BTreeMap<String, String>,
        base_dir: &Path,
    ) -> Result<Self, RegistryError> {
        let mut index = HashMap::new();
        for (i, def) in definitions.iter().enumerate() {
            let field = format!("services[{}].name", i);
            if def.name.is_empty() {
                return Err(ValidationError::new(field, "service name must not be empty").into());
            }
            if def.name.contains(char::is_whitespace) {
                return Err(ValidationError::new(
                    field,
                    format!("service name '{}' must not contain whitespace", def.name),
                )
                .into());
            }
            if index.insert(def.name.clone(), i).is_some() {
                return Err(ValidationError::new(
                    field,
                    format!("duplicate service name '{}'", def.name),
                )
                .into());
            }
        }

        let mut prefixes: HashMap<String, &str> = HashMap::new();
        let mut specs = Vec::with_capacity(definitions.len());
        for (i, def) in definitions.iter().enumerate() {
            let spec = build_spec(i, def, defaults, global_env, base_dir, &index)?;
            if let Some(route) = &spec.route {
                let key = normalize_prefix(&route.prefix).to_string();
                if let Some(other) = prefixes.insert(key, &def.name) {
                    return Err(ValidationError::new(
                        format!("services[{}].route", i),
                        format!(
                            "route '{}' of '{}' is already used by '{}'",
                            route.prefix, def.name, other
                        ),
                    )
                    .into());
                }
            }
            specs.push(Arc::new(spec));
        }

        let registry = Self { specs, index };
        registry.check_acyclic()?;
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ServiceSpec>> {
        self.index.get(name).map(|&i| &self.specs[i])
    }

    /// All services in declaration order
    pub fn specs(&self) -> &[Arc<ServiceSpec>] {
        &self.specs
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.iter().map(|s| s.name.as_str())
    }

    /// Position of a service in the configuration file
    pub fn declaration_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    fn check_acyclic(&self) -> Result<(), CyclicDependencyError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        fn visit(
            registry: &Registry,
            i: usize,
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
        ) -> Result<(), CyclicDependencyError> {
            marks[i] = Mark::InProgress;
            stack.push(i);
            for dep in &registry.specs[i].dependencies {
                let j = registry.index[dep];
                match marks[j] {
                    Mark::Done => {}
                    Mark::Unvisited => visit(registry, j, marks, stack)?,
                    Mark::InProgress => {
                        let start = stack.iter().position(|&k| k == j).unwrap_or(0);
                        let mut cycle: Vec<String> = stack[start..]
                            .iter()
                            .map(|&k| registry.specs[k].name.clone())
                            .collect();
                        cycle.push(registry.specs[j].name.clone());
                        return Err(CyclicDependencyError { cycle });
                    }
                }
            }
            stack.pop();
            marks[i] = Mark::Done;
            Ok(())
        }

        let mut marks = vec![Mark::Unvisited; self.specs.len()];
        let mut stack = Vec::new();
        for i in 0..self.specs.len() {
            if marks[i] == Mark::Unvisited {
                visit(self, i, &mut marks, &mut stack)?;
            }
        }
        Ok(())
    }
}

fn build_spec(
    i: usize,
    def: &ServiceConfig,
    defaults: &ServiceDefaults,
    global_env: &BTreeMap<String, String>,
    base_dir: &Path,
    index: &HashMap<String, usize>,
) -> Result<ServiceSpec, ValidationError> {
    let field = |name: &str| format!("services[{}].{}", i, name);
    let service = &def.name;

    let command = match &def.command {
        None => {
            return Err(ValidationError::new(
                field("command"),
                format!("service '{}' has no command", service),
            ))
        }
        Some(command) => parse_command(command).map_err(|msg| {
            ValidationError::new(field("command"), format!("service '{}': {}", service, msg))
        })?,
    };

    let mut dependencies: Vec<String> = Vec::with_capacity(def.depends_on.len());
    for dep in &def.depends_on {
        if dep == service {
            return Err(ValidationError::new(
                field("depends_on"),
                format!("service '{}' depends on itself", service),
            ));
        }
        if !index.contains_key(dep) {
            return Err(ValidationError::new(
                field("depends_on"),
                format!("service '{}' depends on unknown service '{}'", service, dep),
            ));
        }
        if !dependencies.contains(dep) {
            dependencies.push(dep.clone());
        }
    }

    if def.port == Some(0) {
        return Err(ValidationError::new(
            field("port"),
            format!("service '{}': port must be greater than 0", service),
        ));
    }
    let host = def.host.clone().unwrap_or_else(|| "127.0.0.1".to_string());
    let endpoint = def.port.map(|port| Endpoint::new(host.clone(), port));

    let health_config = def.health.clone().unwrap_or_default();
    let probe_endpoint = |kind: &str| -> Result<Endpoint, ValidationError> {
        health_config
            .port
            .or(def.port)
            .map(|port| Endpoint::new(host.clone(), port))
            .ok_or_else(|| {
                ValidationError::new(
                    field(if def.health.is_some() { "health.port" } else { "health" }),
                    format!(
                        "service '{}' needs a port for its {} health probe",
                        service, kind
                    ),
                )
            })
    };
    let health_probe = match health_config.kind {
        ProbeKind::Tcp => HealthProbe::Tcp {
            endpoint: probe_endpoint("tcp")?,
        },
        ProbeKind::Http => {
            let path = health_config.path(defaults).to_string();
            if !path.starts_with('/') {
                return Err(ValidationError::new(
                    field("health.path"),
                    format!("health path '{}' must begin with '/'", path),
                ));
            }
            HealthProbe::Http {
                endpoint: probe_endpoint("http")?,
                path,
            }
        }
        ProbeKind::Exec => {
            let argv = match &health_config.command {
                Some(command) => parse_command(command).map_err(|msg| {
                    ValidationError::new(field("health.command"), format!("service '{}': {}", service, msg))
                })?,
                None => {
                    return Err(ValidationError::new(
                        field("health.command"),
                        format!("service '{}': exec health probe requires a command", service),
                    ))
                }
            };
            HealthProbe::Exec { argv }
        }
    };

    let health = HealthSettings {
        interval: health_config.interval(defaults),
        timeout: health_config.timeout(defaults),
        probe_timeout: health_config.probe_timeout(defaults),
        liveness_interval: defaults.liveness_interval_ms.map(Duration::from_millis),
        unhealthy_threshold: defaults.unhealthy_threshold.max(1),
    };

    let route = match &def.route {
        None => None,
        Some(prefix) => {
            if !prefix.starts_with('/') {
                return Err(ValidationError::new(
                    field("route"),
                    format!("route '{}' must begin with '/'", prefix),
                ));
            }
            if def.port.is_none() {
                return Err(ValidationError::new(
                    field("port"),
                    format!("service '{}' has a route but no port", service),
                ));
            }
            Some(RouteSpec {
                prefix: prefix.clone(),
                strip_prefix: def.strip_prefix,
            })
        }
    };

    let mut env = global_env.clone();
    env.extend(def.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    if let Some(port) = def.port {
        env.entry("PORT".to_string()).or_insert_with(|| port.to_string());
    }

    let resolve = |p: &String| {
        let path = Path::new(p);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    };

    Ok(ServiceSpec {
        name: service.clone(),
        command,
        dependencies,
        endpoint,
        health_probe,
        health,
        route,
        restart_policy: def.restart,
        max_restarts: def.max_restarts,
        working_dir: def.working_dir.as_ref().map(resolve),
        pid_file: def.pid_file.as_ref().map(resolve),
        env,
        shutdown_grace_period: def.shutdown_grace_period(defaults),
    })
}

fn parse_command(command: &CommandLine) -> Result<Vec<String>, String> {
    let argv = command.to_argv()?;
    match argv.first() {
        Some(program) if !program.is_empty() => Ok(argv),
        _ => Err("command must not be empty".to_string()),
    }
}

/// Prefix with any trailing `/` removed; the root prefix becomes empty
pub(crate) fn normalize_prefix(prefix: &str) -> &str {
    prefix.trim_end_matches('/')
}
