use clap::{Parser, Subcommand};
use devgate::admin::{AdminServer, ControlReceiver, PKG_NAME, VERSION};
use devgate::client::AdminClient;
use devgate::config::Config;
use devgate::error::exit_code;
use devgate::health::HealthChecker;
use devgate::instance::StackStatus;
use devgate::lockfile::PidFile;
use devgate::pool::{ConnectionPool, PoolConfig};
use devgate::proxy::{ProxySettings, ProxyServer};
use devgate::registry::Registry;
use devgate::routes::RouteTable;
use devgate::scheduler::{RunOptions, Scheduler, SchedulerSettings};
use devgate::supervisor::ProcessSupervisor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "devgate", version, about = "Run interdependent development services behind one proxy")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "devgate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start every service in dependency order and serve the proxy until interrupted
    Up {
        /// Stop all services as soon as startup fails
        #[arg(long)]
        abort_on_failure: bool,
    },
    /// Stop a running stack in reverse dependency order
    Down,
    /// Show the state of every service
    Status,
    /// Print a service's captured output
    Logs {
        /// Service name
        name: String,
        /// Print the buffered lines and exit
        #[arg(long)]
        no_follow: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Signal,
    Admin,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging; stdout is left to command output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                "devgate=info"
                    .parse()
                    .unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::INFO.into()),
            ),
        )
        .init();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %cli.config.display(), error = %e, "Failed to load configuration");
            return ExitCode::from(exit_code::INVALID_CONFIG);
        }
    };

    let registry = match Registry::from_config(&config) {
        Ok(registry) => registry,
        Err(e) => {
            error!(path = %cli.config.display(), error = %e, "Invalid service definitions");
            return ExitCode::from(exit_code::INVALID_CONFIG);
        }
    };

    let result = match cli.command {
        Command::Up { abort_on_failure } => up(config, registry, abort_on_failure).await,
        Command::Down => down(&config, &registry).await,
        Command::Status => status(&config, &registry).await,
        Command::Logs { name, no_follow } => logs(&config, &registry, &name, !no_follow).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{:#}", e), "Command failed");
            ExitCode::FAILURE
        }
    }
}

async fn up(config: Config, registry: Registry, abort_on_failure: bool) -> anyhow::Result<u8> {
    print_startup_banner(&config, &registry);

    let state_dir = config.state_dir();
    std::fs::create_dir_all(&state_dir).map_err(|e| {
        anyhow::anyhow!("Failed to create state directory '{}': {}", state_dir.display(), e)
    })?;
    let pid_file = PidFile::create(&state_dir.join("devgate.pid"))?;
    info!(path = %pid_file.path().display(), "PID file written and locked");

    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid proxy bind address");
            anyhow::anyhow!("Invalid proxy bind address: {}", e)
        })?;
    let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid admin bind address: {}", e))?;

    // Bind both ports before any service starts
    let proxy_listener = TcpListener::bind(proxy_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind proxy to {}: {}", proxy_addr, e))?;
    let admin_listener = TcpListener::bind(admin_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind admin API to {}: {}", admin_addr, e))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();

    let registry = Arc::new(registry);
    let routes = RouteTable::from_registry(&registry).into_shared();
    let pool = Arc::new(ConnectionPool::new(PoolConfig::from(&config.server)));
    let supervisor = Arc::new(ProcessSupervisor::new(
        events_tx.clone(),
        config.defaults.log_buffer_lines,
    ));
    let health = HealthChecker::new(Arc::clone(&pool));

    let mut scheduler = Scheduler::new(
        Arc::clone(&registry),
        Arc::clone(&supervisor),
        health,
        Arc::clone(&routes),
        events_tx,
        events_rx,
        SchedulerSettings::from(&config.defaults),
    );

    let proxy = ProxyServer::new(
        routes,
        ProxySettings::from(&config.server),
        shutdown_rx.clone(),
        Arc::clone(&pool),
    );
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.serve(proxy_listener).await {
            error!(error = %e, "Proxy server error");
        }
    });

    let admin = AdminServer::new(
        scheduler.subscribe_status(),
        Arc::clone(&supervisor),
        pool.stats(),
        control_tx,
        shutdown_rx.clone(),
    )
    .with_auth_token(config.server.admin_token.clone());
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin.serve(admin_listener).await {
            error!(error = %e, "Admin server error");
        }
    });

    info!(url = %format!("http://{}", proxy_addr), "Proxy ready");

    let run = scheduler.run(shutdown_rx, RunOptions { abort_on_failure });
    tokio::pin!(run);

    enum Finished<T> {
        Run(T),
        Stop(StopReason),
    }

    let finished = tokio::select! {
        outcome = &mut run => Finished::Run(outcome),
        reason = wait_for_stop(&mut control_rx) => Finished::Stop(reason),
    };

    let (outcome, reason) = match finished {
        Finished::Run(outcome) => (outcome, None),
        Finished::Stop(reason) => {
            let _ = shutdown_tx.send(true);
            (run.await, Some(reason))
        }
    };

    // Signal shutdown to the proxy and admin servers
    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = admin_handle.await;
    })
    .await;

    drop(pid_file);
    info!("Shutdown complete");

    let code = if let Some(aborted) = outcome.aborted {
        error!(error = %aborted, "Exiting after failed startup");
        exit_code::STARTUP_ABORTED
    } else if reason == Some(StopReason::Signal) {
        exit_code::INTERRUPTED
    } else {
        exit_code::SUCCESS
    };
    Ok(code)
}

/// Wait for Ctrl+C, SIGTERM, or a shutdown request from the admin API
async fn wait_for_stop(control_rx: &mut ControlReceiver) -> StopReason {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let control = async {
        if control_rx.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = interrupt => {
            info!("Received SIGINT (Ctrl+C), shutting down...");
            StopReason::Signal
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
            StopReason::Signal
        }
        _ = control => {
            info!("Shutdown requested, stopping services...");
            StopReason::Admin
        }
    }
}

async fn down(config: &Config, registry: &Registry) -> anyhow::Result<u8> {
    let client = AdminClient::new(config.server.admin_url(), config.server.admin_token.clone());

    if !client.shutdown().await? {
        println!("devgate is not running");
        return Ok(exit_code::SUCCESS);
    }
    println!("Stopping services...");

    // Every wave may use its full grace period
    let limit = registry
        .specs()
        .iter()
        .map(|s| s.shutdown_grace_period)
        .sum::<Duration>()
        + Duration::from_secs(10);
    let deadline = tokio::time::Instant::now() + limit;

    while tokio::time::Instant::now() < deadline {
        match client.status().await {
            Ok(None) => {
                println!("Stopped");
                return Ok(exit_code::SUCCESS);
            }
            Ok(Some(_)) | Err(_) => tokio::time::sleep(Duration::from_millis(200)).await,
        }
    }

    warn!(timeout_secs = limit.as_secs(), "Stack is still shutting down");
    Ok(exit_code::SUCCESS)
}

async fn status(config: &Config, registry: &Registry) -> anyhow::Result<u8> {
    let client = AdminClient::new(config.server.admin_url(), config.server.admin_token.clone());
    let status = client
        .status()
        .await?
        .unwrap_or_else(|| StackStatus::stopped(registry));
    print_status(&status);
    Ok(exit_code::SUCCESS)
}

fn print_status(status: &StackStatus) {
    println!("stack: {}", status.phase);
    println!(
        "{:<16} {:<24} {:>8} {:>9}  {}",
        "SERVICE", "STATE", "PID", "RESTARTS", "ROUTE"
    );
    for service in &status.services {
        println!(
            "{:<16} {:<24} {:>8} {:>9}  {}",
            service.name,
            service.display_state(),
            service.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            service.restarts,
            service.route.as_deref().unwrap_or("-"),
        );
        if let Some(err) = &service.last_error {
            println!("{:<16} last error: {}", "", err);
        }
    }
}

async fn logs(config: &Config, registry: &Registry, name: &str, follow: bool) -> anyhow::Result<u8> {
    if registry.get(name).is_none() {
        error!(
            service = name,
            known = ?registry.names().collect::<Vec<_>>(),
            "Unknown service"
        );
        return Ok(exit_code::INVALID_CONFIG);
    }

    let client = AdminClient::new(config.server.admin_url(), config.server.admin_token.clone());
    let mut stdout = tokio::io::stdout();
    client.stream_logs(name, follow, &mut stdout).await?;
    Ok(exit_code::SUCCESS)
}

fn print_startup_banner(config: &Config, registry: &Registry) {
    info!(name = PKG_NAME, version = VERSION, "Starting development stack");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        admin_auth = config.server.admin_token.is_some(),
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        max_body_bytes = config.server.max_body_bytes,
        "Proxy settings"
    );
    info!(
        health_check_interval_ms = config.defaults.health_check_interval_ms,
        health_timeout_secs = config.defaults.health_timeout_secs,
        liveness_interval_ms = ?config.defaults.liveness_interval_ms,
        unhealthy_threshold = config.defaults.unhealthy_threshold,
        "Health check settings"
    );
    info!(
        shutdown_grace_period_secs = config.defaults.shutdown_grace_period_secs,
        restart_backoff_base_ms = config.defaults.restart_backoff_base_ms,
        restart_backoff_max_secs = config.defaults.restart_backoff_max_secs,
        "Lifecycle settings"
    );
    info!(
        service_count = registry.len(),
        services = ?registry.names().collect::<Vec<_>>(),
        "Configured services"
    );
}
