//! Integration tests for devgate

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use devgate::admin::{AdminServer, ControlRequest};
use devgate::client::AdminClient;
use devgate::config::Config;
use devgate::error::RegistryError;
use devgate::health::HealthChecker;
use devgate::instance::{InstanceState, StackPhase};
use devgate::pool::{ConnectionPool, PoolConfig};
use devgate::proxy::{ProxyServer, ProxySettings};
use devgate::registry::Registry;
use devgate::routes::{set_service_active, RouteTable, SharedRouteTable};
use devgate::scheduler::{RunOptions, Scheduler, SchedulerSettings};
use devgate::supervisor::ProcessSupervisor;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

/// A port nothing is listening on
fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Write `toml` to a temporary devgate.toml and load it
fn load_config(toml: &str) -> (Config, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devgate.toml");
    std::fs::write(&path, toml).unwrap();
    (Config::load(&path).unwrap(), dir)
}

/// Everything `up` wires together, minus the listeners
struct Stack {
    scheduler: Scheduler,
    supervisor: Arc<ProcessSupervisor>,
    routes: SharedRouteTable,
    pool: Arc<ConnectionPool>,
}

fn stack(config: &Config) -> Stack {
    let registry = Arc::new(Registry::from_config(config).unwrap());
    let routes = RouteTable::from_registry(&registry).into_shared();
    let pool = Arc::new(ConnectionPool::new(PoolConfig::from(&config.server)));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let supervisor = Arc::new(ProcessSupervisor::new(
        events_tx.clone(),
        config.defaults.log_buffer_lines,
    ));
    let scheduler = Scheduler::new(
        registry,
        Arc::clone(&supervisor),
        HealthChecker::new(Arc::clone(&pool)),
        Arc::clone(&routes),
        events_tx,
        events_rx,
        SchedulerSettings::from(&config.defaults),
    );
    Stack {
        scheduler,
        supervisor,
        routes,
        pool,
    }
}

/// Minimal HTTP backend that answers every request with its own request head
async fn echo_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                let mut len = 0;
                loop {
                    match stream.read(&mut buf[len..]).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => len += n,
                    }
                    if buf[..len].windows(4).any(|w| w == b"\r\n\r\n") || len == buf.len() {
                        break;
                    }
                }
                let head = String::from_utf8_lossy(&buf[..len]).to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    head.len(),
                    head
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    port
}

/// Backend that answers every request with the number of body bytes it received
async fn counting_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let service = hyper::service::service_fn(|req: Request<Incoming>| async move {
                    let body = req.into_body().collect().await?.to_bytes();
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body.len().to_string()))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    port
}

/// Upstream that accepts any upgrade, greets with `hello`, then echoes
async fn upgrade_echo_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut chunk = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&chunk[..n]),
                    }
                }
                let greeting =
                    b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\nhello";
                if stream.write_all(greeting).await.is_err() {
                    return;
                }
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&chunk[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

/// Read until a full response head arrives, returning it and whatever followed
async fn read_head(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before a response head");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            return (String::from_utf8_lossy(&buf).to_string(), rest);
        }
    }
}

/// Serve the proxy on an ephemeral port
async fn start_proxy(
    routes: SharedRouteTable,
    pool: Arc<ConnectionPool>,
    settings: ProxySettings,
    shutdown_rx: watch::Receiver<bool>,
) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let proxy = ProxyServer::new(routes, settings, shutdown_rx, pool);
    tokio::spawn(proxy.serve(listener));
    port
}

/// Send a raw HTTP request and read the whole response
async fn http_request(port: u16, request: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(String::from_utf8_lossy(&response).to_string())
}

/// Send a simple HTTP request and get response
async fn http_get(port: u16, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        path, port
    );
    http_request(port, &request).await
}

fn exec_ready(dir: &Path, name: &str) -> String {
    format!(
        r#"{{ type = "exec", command = ["test", "-f", "{}/{}.ready"], interval_ms = 50, timeout_secs = 5 }}"#,
        dir.display(),
        name
    )
}

// ============================================================================
// Configuration and Registry Tests
// ============================================================================

#[test]
fn test_full_config_parsing() {
    let (config, dir) = load_config(
        r#"
[server]
port = 8081
admin_port = 9991
request_timeout_secs = 10
max_body_bytes = 1024

[defaults]
health_check_interval_ms = 250
health_timeout_secs = 20

[env]
DATABASE_URL = "postgres://localhost/dev"

[[services]]
name = "db"
command = "postgres -D ./data -p 5432"
port = 5432
pid_file = "data/postmaster.pid"

[[services]]
name = "api"
command = ["cargo", "run", "--bin", "api"]
depends_on = ["db"]
port = 3000
route = "/api"
strip_prefix = true
restart = "on-failure"
env = { RUST_LOG = "debug" }
health = { type = "http", path = "/healthz" }
"#,
    );

    assert_eq!(config.server.port, 8081);
    assert_eq!(config.server.max_body_bytes, 1024);
    assert_eq!(config.base_dir, dir.path());

    let registry = Registry::from_config(&config).unwrap();
    let db = registry.get("db").unwrap();
    assert_eq!(db.command, vec!["postgres", "-D", "./data", "-p", "5432"]);
    assert_eq!(db.pid_file.as_deref(), Some(dir.path().join("data/postmaster.pid").as_path()));
    assert_eq!(db.health.interval, Duration::from_millis(250));
    assert_eq!(db.health.timeout, Duration::from_secs(20));

    let api = registry.get("api").unwrap();
    assert_eq!(api.dependencies, vec!["db".to_string()]);
    assert_eq!(api.env.get("DATABASE_URL").map(String::as_str), Some("postgres://localhost/dev"));
    assert_eq!(api.env.get("RUST_LOG").map(String::as_str), Some("debug"));
    assert_eq!(api.env.get("PORT").map(String::as_str), Some("3000"));
    assert_eq!(api.health_probe.to_string(), "http://127.0.0.1:3000/healthz");
    assert!(api.route.as_ref().unwrap().strip_prefix);
}

#[test]
fn test_cycle_rejected_at_load() {
    let (config, _dir) = load_config(
        r#"
[[services]]
name = "a"
command = "a"
port = 1
depends_on = ["b"]

[[services]]
name = "b"
command = "b"
port = 2
depends_on = ["a"]
"#,
    );

    match Registry::from_config(&config) {
        Err(RegistryError::Cycle(err)) => {
            assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
        }
        other => panic!("expected a cycle error, got {:?}", other.map(|r| r.len())),
    }
}

#[test]
fn test_invalid_field_is_named() {
    let (config, _dir) = load_config(
        r#"
[[services]]
name = "web"
command = "vite"
port = 5173
route = "/"

[[services]]
name = "api"
command = "api"
depends_on = ["database"]
"#,
    );

    let err = Registry::from_config(&config).unwrap_err();
    assert!(err.to_string().contains("services[1].depends_on"));
    assert!(err.to_string().contains("database"));
}

// ============================================================================
// Startup Ordering Tests
// ============================================================================

#[tokio::test]
async fn test_dependents_start_after_dependencies_are_healthy() {
    let dir = tempfile::tempdir().unwrap();
    let d = dir.path().display().to_string();
    let (config, _config_dir) = load_config(&format!(
        r#"
[[services]]
name = "api"
command = ["sh", "-c", "if [ -f '{d}/db.ready' ]; then touch '{d}/api.ready'; fi; exec sleep 30"]
depends_on = ["db"]
health = {api_health}
shutdown_grace_period_secs = 2

[[services]]
name = "db"
command = ["sh", "-c", "sleep 0.3; touch '{d}/db.ready'; exec sleep 30"]
health = {db_health}
shutdown_grace_period_secs = 2
"#,
        d = d,
        api_health = exec_ready(dir.path(), "api"),
        db_health = exec_ready(dir.path(), "db"),
    ));

    let mut stack = stack(&config);
    stack.scheduler.start_all().await.unwrap();

    // api only creates its marker if db was already healthy when it was spawned
    assert!(dir.path().join("api.ready").exists());
    assert_eq!(stack.scheduler.startup_order(), &["db".to_string(), "api".to_string()]);

    stack.scheduler.shutdown_all().await;
}

#[tokio::test]
async fn test_failed_dependency_aborts_startup() {
    let cache = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cache_port = cache.local_addr().unwrap().port();

    let (config, _dir) = load_config(&format!(
        r#"
[defaults]
shutdown_grace_period_secs = 2

[[services]]
name = "db"
command = "sleep 30"
port = {db_port}
health = {{ type = "tcp", interval_ms = 50, timeout_secs = 1 }}

[[services]]
name = "cache"
command = "sleep 30"
port = {cache_port}
health = {{ type = "tcp", interval_ms = 50 }}

[[services]]
name = "api"
command = "sleep 30"
port = {api_port}
depends_on = ["db", "cache"]
health = {{ type = "http", path = "/health", interval_ms = 50 }}
"#,
        db_port = closed_port(),
        cache_port = cache_port,
        api_port = closed_port(),
    ));

    let mut stack = stack(&config);
    let err = stack.scheduler.start_all().await.unwrap_err();

    assert_eq!(err.failed, "db");
    assert!(err.cause.contains("connection refused"));
    assert_eq!(err.blocked, vec!["api".to_string()]);
    assert!(err.to_string().contains("not started: api"));

    assert_eq!(stack.scheduler.state("cache"), Some(InstanceState::Healthy));
    assert_eq!(stack.scheduler.state("db"), Some(InstanceState::Failed));
    assert_eq!(stack.scheduler.state("api"), Some(InstanceState::Pending));
    assert!(stack.supervisor.process_info("api").is_none());

    // Healthy services keep running after the abort
    assert!(stack.supervisor.is_running("cache"));
    assert!(!stack.supervisor.is_running("db"));

    stack.scheduler.shutdown_all().await;
    assert!(!stack.supervisor.is_running("cache"));
}

#[tokio::test]
async fn test_independent_chains_keep_starting() {
    let dir = tempfile::tempdir().unwrap();
    let (config, _config_dir) = load_config(&format!(
        r#"
[defaults]
shutdown_grace_period_secs = 2

[[services]]
name = "broken"
command = "sleep 30"
health = {{ type = "exec", command = "false", interval_ms = 50, timeout_secs = 1 }}

[[services]]
name = "queue"
command = ["sh", "-c", "touch '{d}/queue.ready'; exec sleep 30"]
health = {queue_health}

[[services]]
name = "worker"
command = ["sh", "-c", "touch '{d}/worker.ready'; exec sleep 30"]
depends_on = ["queue"]
health = {worker_health}
"#,
        d = dir.path().display(),
        queue_health = exec_ready(dir.path(), "queue"),
        worker_health = exec_ready(dir.path(), "worker"),
    ));

    let mut stack = stack(&config);
    let err = stack.scheduler.start_all().await.unwrap_err();

    assert_eq!(err.failed, "broken");
    assert!(err.blocked.is_empty());
    assert_eq!(stack.scheduler.state("queue"), Some(InstanceState::Healthy));
    assert_eq!(stack.scheduler.state("worker"), Some(InstanceState::Healthy));

    stack.scheduler.shutdown_all().await;
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_shutdown_order_is_reverse_of_startup() {
    let dir = tempfile::tempdir().unwrap();
    let mut toml = String::from("[defaults]\nshutdown_grace_period_secs = 2\n");
    for (name, deps) in [("web", "[\"api\"]"), ("api", "[\"db\"]"), ("db", "[]")] {
        toml.push_str(&format!(
            r#"
[[services]]
name = "{name}"
command = ["sh", "-c", "touch '{d}/{name}.ready'; exec sleep 30"]
depends_on = {deps}
health = {health}
"#,
            name = name,
            d = dir.path().display(),
            deps = deps,
            health = exec_ready(dir.path(), name),
        ));
    }
    let (config, _config_dir) = load_config(&toml);

    let mut stack = stack(&config);
    stack.scheduler.start_all().await.unwrap();
    let startup: Vec<String> = stack.scheduler.startup_order().to_vec();
    assert_eq!(startup, vec!["db", "api", "web"]);

    stack.scheduler.shutdown_all().await;
    let mut reversed = startup.clone();
    reversed.reverse();
    assert_eq!(stack.scheduler.shutdown_order(), reversed.as_slice());

    for name in ["web", "api", "db"] {
        assert_eq!(stack.scheduler.state(name), Some(InstanceState::Stopped));
        assert!(!stack.supervisor.is_running(name));
    }
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (config, _config_dir) = load_config(&format!(
        r#"
[[services]]
name = "db"
command = ["sh", "-c", "touch '{d}/db.ready'; exec sleep 30"]
health = {health}
shutdown_grace_period_secs = 2
"#,
        d = dir.path().display(),
        health = exec_ready(dir.path(), "db"),
    ));

    let mut stack = stack(&config);
    stack.scheduler.start_all().await.unwrap();
    let pid = stack.supervisor.process_info("db").unwrap().pid;

    // Start on a healthy instance changes nothing
    assert!(!stack.scheduler.start_service("db"));
    assert_eq!(stack.supervisor.process_info("db").unwrap().pid, pid);
    assert_eq!(stack.scheduler.state("db"), Some(InstanceState::Healthy));

    // stop; stop
    let first = stack.supervisor.stop("db", Duration::from_secs(2)).await;
    let second = stack.supervisor.stop("db", Duration::from_secs(2)).await;
    assert!(first.is_some());
    assert_eq!(first, second);
    assert!(!stack.supervisor.is_running("db"));

    stack.scheduler.shutdown_all().await;
}

#[tokio::test]
async fn test_restart_policy_always_with_limit() {
    let (config, _dir) = load_config(
        r#"
[defaults]
restart_backoff_base_ms = 50
restart_backoff_max_secs = 1

[[services]]
name = "flaky"
command = ["sh", "-c", "sleep 0.3"]
restart = "always"
max_restarts = 2
health = { type = "exec", command = "true", interval_ms = 50 }
"#,
    );

    let mut stack = stack(&config);
    let mut status_rx = stack.scheduler.subscribe_status();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let run = tokio::spawn(async move {
        let outcome = stack.scheduler.run(shutdown_rx, RunOptions::default()).await;
        (outcome, stack)
    });

    let settled = tokio::time::timeout(
        Duration::from_secs(15),
        status_rx.wait_for(|status| {
            status.service("flaky").is_some_and(|s| {
                s.restarts == 2 && s.state == InstanceState::Failed && !s.restart_pending
            })
        }),
    )
    .await;
    assert!(settled.is_ok(), "service did not exhaust its restarts");

    shutdown_tx.send(true).unwrap();
    let (outcome, stack) = run.await.unwrap();
    assert!(outcome.aborted.is_none());

    let status = stack.scheduler.status();
    assert_eq!(status.phase, StackPhase::Stopped);
    let flaky = status.service("flaky").unwrap();
    assert_eq!(flaky.attempt, 3);
    assert!(flaky.last_error.as_deref().unwrap().contains("exited unexpectedly"));
}

#[tokio::test]
async fn test_abort_on_failure_stops_everything() {
    let dir = tempfile::tempdir().unwrap();
    let (config, _config_dir) = load_config(&format!(
        r#"
[defaults]
shutdown_grace_period_secs = 2

[[services]]
name = "cache"
command = ["sh", "-c", "touch '{d}/cache.ready'; exec sleep 30"]
health = {health}

[[services]]
name = "db"
command = "sleep 30"
health = {{ type = "exec", command = "false", interval_ms = 50, timeout_secs = 1 }}
"#,
        d = dir.path().display(),
        health = exec_ready(dir.path(), "cache"),
    ));

    let mut stack = stack(&config);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let outcome = stack
        .scheduler
        .run(shutdown_rx, RunOptions { abort_on_failure: true })
        .await;

    let aborted = outcome.aborted.expect("startup should abort");
    assert_eq!(aborted.failed, "db");
    assert!(!stack.supervisor.is_running("cache"));
    assert_eq!(stack.scheduler.state("cache"), Some(InstanceState::Stopped));
}

// ============================================================================
// Proxy Tests
// ============================================================================

#[tokio::test]
async fn test_proxy_routes_to_healthy_service() {
    let backend_port = echo_backend().await;
    let (config, _dir) = load_config(&format!(
        r#"
[[services]]
name = "api"
command = "sleep 30"
port = {backend_port}
route = "/api"
strip_prefix = true
health = {{ type = "http", path = "/health", interval_ms = 50 }}
shutdown_grace_period_secs = 2
"#,
        backend_port = backend_port,
    ));

    let mut stack = stack(&config);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy_port = start_proxy(
        Arc::clone(&stack.routes),
        Arc::clone(&stack.pool),
        ProxySettings::from(&config.server),
        shutdown_rx,
    )
    .await;

    // Route exists but the service is not healthy yet
    let unavailable = http_get(proxy_port, "/api/users").await.unwrap();
    assert!(unavailable.starts_with("HTTP/1.1 503"));
    assert!(unavailable.to_lowercase().contains("retry-after: 5"));
    assert!(unavailable.to_lowercase().contains("x-proxy-error: service_unavailable"));

    stack.scheduler.start_all().await.unwrap();

    let response = http_get(proxy_port, "/api/users?page=2").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {}", response);
    assert!(response.contains("GET /users?page=2 HTTP/1.1"));
    let lower = response.to_lowercase();
    assert!(lower.contains("x-forwarded-for: 127.0.0.1"));
    assert!(lower.contains("x-forwarded-proto: http"));
    assert!(lower.contains("x-request-id: "));

    let missing = http_get(proxy_port, "/static/app.js").await.unwrap();
    assert!(missing.starts_with("HTTP/1.1 404"));
    assert!(missing.to_lowercase().contains("x-proxy-error: unknown_route"));

    stack.scheduler.shutdown_all().await;
    let after = http_get(proxy_port, "/api/users").await.unwrap();
    assert!(after.starts_with("HTTP/1.1 503"));
}

#[tokio::test]
async fn test_proxy_propagates_request_id() {
    let backend_port = echo_backend().await;
    let routes = RouteTable::new(vec![devgate::routes::RouteEntry {
        prefix: "/".to_string(),
        service: "web".to_string(),
        upstream: devgate::registry::Endpoint::new("127.0.0.1", backend_port),
        strip_prefix: false,
        active: true,
    }])
    .into_shared();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy_port = start_proxy(
        routes,
        Arc::new(ConnectionPool::new(PoolConfig::default())),
        ProxySettings::default(),
        shutdown_rx,
    )
    .await;

    let response = http_request(
        proxy_port,
        "GET /index.html HTTP/1.1\r\nHost: app.localhost\r\nX-Request-ID: abc-123\r\nConnection: close\r\n\r\n",
    )
    .await
    .unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    let lower = response.to_lowercase();
    assert!(lower.contains("x-request-id: abc-123"));
    assert!(lower.contains("x-forwarded-host: app.localhost"));
    assert!(response.contains("GET /index.html HTTP/1.1"));
}

#[tokio::test]
async fn test_proxy_rejects_oversized_body() {
    let backend_port = echo_backend().await;
    let routes = RouteTable::new(vec![devgate::routes::RouteEntry {
        prefix: "/upload".to_string(),
        service: "files".to_string(),
        upstream: devgate::registry::Endpoint::new("127.0.0.1", backend_port),
        strip_prefix: false,
        active: true,
    }])
    .into_shared();

    let settings = ProxySettings {
        max_body_bytes: 16,
        ..ProxySettings::default()
    };
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy_port = start_proxy(
        routes,
        Arc::new(ConnectionPool::new(PoolConfig::default())),
        settings,
        shutdown_rx,
    )
    .await;

    let body = "x".repeat(64);
    let response = http_request(
        proxy_port,
        &format!(
            "POST /upload HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        ),
    )
    .await
    .unwrap();
    assert!(response.starts_with("HTTP/1.1 413"));
    assert!(response.to_lowercase().contains("x-proxy-error: payload_too_large"));
}

#[tokio::test]
async fn test_proxy_upstream_down_returns_502() {
    let routes = RouteTable::new(vec![devgate::routes::RouteEntry {
        prefix: "/api".to_string(),
        service: "api".to_string(),
        upstream: devgate::registry::Endpoint::new("127.0.0.1", closed_port()),
        strip_prefix: false,
        active: true,
    }])
    .into_shared();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy_port = start_proxy(
        routes,
        Arc::new(ConnectionPool::new(PoolConfig::default())),
        ProxySettings::default(),
        shutdown_rx,
    )
    .await;

    let response = http_get(proxy_port, "/api").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 502"));
    assert!(response.contains("api"));
}

#[tokio::test]
async fn test_route_swap_visible_to_next_request() {
    let backend_port = echo_backend().await;
    let routes = RouteTable::new(vec![devgate::routes::RouteEntry {
        prefix: "/api".to_string(),
        service: "api".to_string(),
        upstream: devgate::registry::Endpoint::new("127.0.0.1", backend_port),
        strip_prefix: false,
        active: false,
    }])
    .into_shared();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy_port = start_proxy(
        Arc::clone(&routes),
        Arc::new(ConnectionPool::new(PoolConfig::default())),
        ProxySettings::default(),
        shutdown_rx,
    )
    .await;

    assert!(http_get(proxy_port, "/api").await.unwrap().starts_with("HTTP/1.1 503"));
    assert!(set_service_active(&routes, "api", true));
    assert!(http_get(proxy_port, "/api").await.unwrap().starts_with("HTTP/1.1 200"));
    assert!(set_service_active(&routes, "api", false));
    assert!(http_get(proxy_port, "/api").await.unwrap().starts_with("HTTP/1.1 503"));
}

#[tokio::test]
async fn test_proxy_streams_large_body() {
    let backend_port = counting_backend().await;
    let routes = RouteTable::new(vec![devgate::routes::RouteEntry {
        prefix: "/upload".to_string(),
        service: "files".to_string(),
        upstream: devgate::registry::Endpoint::new("127.0.0.1", backend_port),
        strip_prefix: false,
        active: true,
    }])
    .into_shared();

    let settings = ProxySettings {
        max_body_bytes: 8 * 1024 * 1024,
        ..ProxySettings::default()
    };
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy_port = start_proxy(
        routes,
        Arc::new(ConnectionPool::new(PoolConfig::default())),
        settings,
        shutdown_rx,
    )
    .await;

    let size = 4 * 1024 * 1024;
    let body = "x".repeat(size);
    let response = tokio::time::timeout(
        Duration::from_secs(30),
        http_request(
            proxy_port,
            &format!(
                "POST /upload HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                size, body
            ),
        ),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with(&format!("\r\n\r\n{}", size)), "{}", response);
}

#[tokio::test]
async fn test_proxy_relays_upgraded_connection() {
    let backend_port = upgrade_echo_backend().await;
    let routes = RouteTable::new(vec![devgate::routes::RouteEntry {
        prefix: "/ws".to_string(),
        service: "realtime".to_string(),
        upstream: devgate::registry::Endpoint::new("127.0.0.1", backend_port),
        strip_prefix: false,
        active: true,
    }])
    .into_shared();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy_port = start_proxy(
        routes,
        Arc::new(ConnectionPool::new(PoolConfig::default())),
        ProxySettings::default(),
        shutdown_rx,
    )
    .await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    stream
        .write_all(b"GET /ws HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n")
        .await
        .unwrap();

    let (head, mut received) = tokio::time::timeout(Duration::from_secs(5), read_head(&mut stream))
        .await
        .unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "{}", head);
    assert!(head.to_lowercase().contains("upgrade: echo"));

    // Bytes the upstream sent right after its 101 reach the client first
    let mut chunk = [0u8; 64];
    while received.len() < 5 {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0);
        received.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(received, b"hello");

    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn test_proxy_upgrade_times_out_on_silent_upstream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stream);
    });

    let routes = RouteTable::new(vec![devgate::routes::RouteEntry {
        prefix: "/ws".to_string(),
        service: "realtime".to_string(),
        upstream: devgate::registry::Endpoint::new("127.0.0.1", backend_port),
        strip_prefix: false,
        active: true,
    }])
    .into_shared();

    let settings = ProxySettings {
        request_timeout: Duration::from_secs(1),
        ..ProxySettings::default()
    };
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy_port = start_proxy(
        routes,
        Arc::new(ConnectionPool::new(PoolConfig::default())),
        settings,
        shutdown_rx,
    )
    .await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    stream
        .write_all(b"GET /ws HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n")
        .await
        .unwrap();

    let (head, _) = tokio::time::timeout(Duration::from_secs(5), read_head(&mut stream))
        .await
        .unwrap();
    assert!(head.starts_with("HTTP/1.1 504"), "{}", head);
    assert!(head.to_lowercase().contains("x-proxy-error: request_timeout"));
}

// ============================================================================
// Admin API Tests
// ============================================================================

#[tokio::test]
async fn test_admin_status_and_shutdown_via_client() {
    let dir = tempfile::tempdir().unwrap();
    let (config, _config_dir) = load_config(&format!(
        r#"
[[services]]
name = "db"
command = ["sh", "-c", "echo booting; touch '{d}/db.ready'; exec sleep 30"]
health = {health}
shutdown_grace_period_secs = 2
"#,
        d = dir.path().display(),
        health = exec_ready(dir.path(), "db"),
    ));

    let mut stack = stack(&config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let admin_port = listener.local_addr().unwrap().port();
    let admin = AdminServer::new(
        stack.scheduler.subscribe_status(),
        Arc::clone(&stack.supervisor),
        stack.pool.stats(),
        control_tx,
        shutdown_rx,
    )
    .with_auth_token(Some("s3cret".to_string()));
    tokio::spawn(admin.serve(listener));

    stack.scheduler.start_all().await.unwrap();

    let base = format!("http://127.0.0.1:{}", admin_port);
    let unauthorized = AdminClient::new(base.clone(), None);
    assert!(unauthorized.status().await.is_err());

    let client = AdminClient::new(base, Some("s3cret".to_string()));
    let status = client.status().await.unwrap().unwrap();
    assert_eq!(status.phase, StackPhase::Running);
    let db = status.service("db").unwrap();
    assert_eq!(db.state, InstanceState::Healthy);
    assert!(db.pid.is_some());

    let mut logs = Vec::new();
    client.stream_logs("db", false, &mut logs).await.unwrap();
    assert!(String::from_utf8_lossy(&logs).contains("stdout | booting"));

    assert!(client.shutdown().await.unwrap());
    assert_eq!(control_rx.recv().await, Some(ControlRequest::Shutdown));

    stack.scheduler.shutdown_all().await;
    shutdown_tx.send(true).unwrap();
}
