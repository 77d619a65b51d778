use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors raised while reading the configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to read env file {}: {source}", .path.display())]
    EnvFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{}:{line}: expected KEY=VALUE", .path.display())]
    EnvSyntax { path: PathBuf, line: usize },
}

/// Top-level configuration file
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Optional dotenv-style file merged into the global environment
    pub env_file: Option<String>,

    /// Proxy and admin server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Global default settings for services
    #[serde(default)]
    pub defaults: ServiceDefaults,

    /// Environment set passed to every service
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Service definitions in declaration order
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Directory relative paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Proxy listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the local control API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the control API (optional)
    pub admin_token: Option<String>,

    /// Maximum idle connections per upstream (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for an upstream response (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Request body cap in bytes (default: 64 MiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,

    /// Retry-After value sent with 503 responses
    #[serde(default = "default_retry_after")]
    pub retry_after_secs: u64,

    /// Directory for the orchestrator's own pid file
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after_secs)
    }

    pub fn admin_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.admin_port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            max_body_bytes: default_max_body_bytes(),
            retry_after_secs: default_retry_after(),
            state_dir: default_state_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceDefaults {
    /// Default readiness probe interval in milliseconds
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,

    /// Default overall readiness timeout in seconds
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,

    /// Default timeout of a single probe in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Default path for HTTP probes
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Default grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// First restart delay in milliseconds
    #[serde(default = "default_backoff_base")]
    pub restart_backoff_base_ms: u64,

    /// Upper bound for the restart delay in seconds
    #[serde(default = "default_backoff_max")]
    pub restart_backoff_max_secs: u64,

    /// Continuous health after which the backoff resets, in seconds
    #[serde(default = "default_backoff_reset")]
    pub restart_backoff_reset_secs: u64,

    /// Liveness re-probe interval in milliseconds (disabled when unset)
    pub liveness_interval_ms: Option<u64>,

    /// Consecutive liveness failures before the service is re-checked from scratch
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Captured output lines kept per service
    #[serde(default = "default_log_buffer_lines")]
    pub log_buffer_lines: usize,
}

impl ServiceDefaults {
    pub fn restart_backoff_base(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_base_ms)
    }

    pub fn restart_backoff_max(&self) -> Duration {
        Duration::from_secs(self.restart_backoff_max_secs)
    }

    pub fn restart_backoff_reset(&self) -> Duration {
        Duration::from_secs(self.restart_backoff_reset_secs)
    }
}

impl Default for ServiceDefaults {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_interval(),
            health_timeout_secs: default_health_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            health_path: default_health_path(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            restart_backoff_base_ms: default_backoff_base(),
            restart_backoff_max_secs: default_backoff_max(),
            restart_backoff_reset_secs: default_backoff_reset(),
            liveness_interval_ms: None,
            unhealthy_threshold: default_unhealthy_threshold(),
            log_buffer_lines: default_log_buffer_lines(),
        }
    }
}

/// Restart policy applied after an unexpected exit or a health timeout
#[derive(Debug, Deserialize, serde::Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart (default)
    #[default]
    Never,
    /// Restart on non-zero exit, signal, or health timeout
    OnFailure,
    /// Restart on any unexpected exit
    Always,
}

/// A start command, either an argument array or a single shell-quoted string
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum CommandLine {
    Argv(Vec<String>),
    Line(String),
}

impl CommandLine {
    /// Split into an argument vector; no shell is involved
    pub fn to_argv(&self) -> Result<Vec<String>, String> {
        match self {
            CommandLine::Argv(argv) => Ok(argv.clone()),
            CommandLine::Line(line) => shell_words::split(line).map_err(|e| e.to_string()),
        }
    }
}

/// Probe type for a service's health check
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// TCP connect (default)
    #[default]
    Tcp,
    /// HTTP GET expecting a 2xx status
    Http,
    /// Command expected to exit 0
    Exec,
}

/// `[services.health]` table
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HealthConfig {
    #[serde(default, rename = "type")]
    pub kind: ProbeKind,

    /// Port to probe (defaults to the service port)
    pub port: Option<u16>,

    /// Path for HTTP probes (overrides default)
    pub path: Option<String>,

    /// Command for exec probes
    pub command: Option<CommandLine>,

    /// Probe interval in milliseconds (overrides default)
    pub interval_ms: Option<u64>,

    /// Overall readiness timeout in seconds (overrides default)
    pub timeout_secs: Option<u64>,

    /// Single probe timeout in seconds (overrides default)
    pub probe_timeout_secs: Option<u64>,
}

impl HealthConfig {
    pub fn interval(&self, defaults: &ServiceDefaults) -> Duration {
        Duration::from_millis(self.interval_ms.unwrap_or(defaults.health_check_interval_ms))
    }

    pub fn timeout(&self, defaults: &ServiceDefaults) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(defaults.health_timeout_secs))
    }

    pub fn probe_timeout(&self, defaults: &ServiceDefaults) -> Duration {
        Duration::from_secs(
            self.probe_timeout_secs
                .unwrap_or(defaults.probe_timeout_secs),
        )
    }

    pub fn path<'a>(&'a self, defaults: &'a ServiceDefaults) -> &'a str {
        self.path.as_deref().unwrap_or(&defaults.health_path)
    }
}

/// Raw, unvalidated definition of a single service
///
/// The `command` is executed directly with the orchestrator's permissions, so
/// configuration files should only come from trusted sources.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServiceConfig {
    /// Unique service name
    #[serde(default)]
    pub name: String,

    /// Command to start the service
    pub command: Option<CommandLine>,

    /// Services that must be healthy before this one starts
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Upstream host (default: 127.0.0.1)
    pub host: Option<String>,

    /// Port the service listens on
    pub port: Option<u16>,

    /// Path prefix served through the proxy
    pub route: Option<String>,

    /// Remove the route prefix before forwarding
    #[serde(default)]
    pub strip_prefix: bool,

    #[serde(default)]
    pub restart: RestartPolicy,

    /// Maximum restarts before the service is left failed
    pub max_restarts: Option<u32>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Lock or pid artifact to clear before start when its owner is gone
    pub pid_file: Option<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Health probe (defaults to TCP on `port`)
    pub health: Option<HealthConfig>,

    /// Grace period in seconds between SIGTERM and SIGKILL (overrides default)
    pub shutdown_grace_period_secs: Option<u64>,
}

impl ServiceConfig {
    /// Create a new service config with defaults
    pub fn new(name: &str, command: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            command: Some(CommandLine::Argv(
                command.iter().map(|s| s.to_string()).collect(),
            )),
            ..Default::default()
        }
    }

    /// Set dependencies (builder pattern)
    pub fn with_depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Set the listen port (builder pattern)
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the route prefix (builder pattern)
    pub fn with_route(mut self, prefix: &str) -> Self {
        self.route = Some(prefix.to_string());
        self
    }

    /// Set the health probe (builder pattern)
    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = Some(health);
        self
    }

    /// Set the restart policy (builder pattern)
    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: &[(&str, &str)]) -> Self {
        self.env = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self
    }

    pub fn shutdown_grace_period(&self, defaults: &ServiceDefaults) -> Duration {
        Duration::from_secs(
            self.shutdown_grace_period_secs
                .unwrap_or(defaults.shutdown_grace_period_secs),
        )
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    9990
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_body_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_retry_after() -> u64 {
    5
}

fn default_state_dir() -> String {
    ".devgate".to_string()
}

fn default_health_interval() -> u64 {
    1000
}

fn default_health_timeout() -> u64 {
    60
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_shutdown_grace_period() -> u64 {
    10
}

fn default_backoff_base() -> u64 {
    1000
}

fn default_backoff_max() -> u64 {
    30
}

fn default_backoff_reset() -> u64 {
    60
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_log_buffer_lines() -> usize {
    1000
}

impl Config {
    /// Read and parse a configuration file, merging its env file if one is named
    ///
    /// Service definitions are not validated here; see [`crate::registry::Registry::from_config`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        if let Some(env_file) = config.env_file.clone() {
            let env_path = config.resolve_path(&env_file);
            let file_env = load_env_file(&env_path)?;
            for (key, value) in file_env {
                // Entries in [env] take precedence over the env file
                config.env.entry(key).or_insert(value);
            }
        }

        Ok(config)
    }

    /// Resolve a path from the file against the config file's directory
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.resolve_path(&self.server.state_dir)
    }
}

/// Parse a dotenv-style file: `KEY=VALUE` lines, `#` comments, optional `export`
pub fn load_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::EnvFile {
        path: path.to_path_buf(),
        source,
    })?;
    parse_env(&content).map_err(|line| ConfigError::EnvSyntax {
        path: path.to_path_buf(),
        line,
    })
}

fn parse_env(content: &str) -> Result<HashMap<String, String>, usize> {
    let mut env = HashMap::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            return Err(idx + 1);
        };
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(idx + 1);
        }
        let value = value.trim();
        let value = unquote(value, '"')
            .or_else(|| unquote(value, '\''))
            .unwrap_or(value);
        env.insert(key.to_string(), value.to_string());
    }

    Ok(env)
}

fn unquote(value: &str, quote: char) -> Option<&str> {
    value
        .strip_prefix(quote)
        .and_then(|v| v.strip_suffix(quote))
}
