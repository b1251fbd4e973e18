//! podforward: on-demand `kubectl port-forward` sessions behind an HTTP API

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use podforward_api::{ApiServer, ApiServerConfig};
use podforward_kubectl::{KubectlConfig, KubectlTunnel};
use podforward_session::{parse_port_range, Reaper, SessionConfig, SessionManager};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Port-forward proxy: opens time-limited tunnels to pods on request
#[derive(Parser, Debug)]
#[command(name = "podforward")]
#[command(about = "Serve on-demand port-forwards to Kubernetes pods", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    args: ServeArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP API (default)
    Serve,
    /// Validate the configuration, print it and check kubectl
    CheckConfig,
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// HTTP API port
    #[arg(long, env = "PORT", default_value = "8080")]
    port: u16,

    /// Address the HTTP API listens on
    #[arg(long, default_value = "0.0.0.0")]
    listen_address: String,

    /// Session lifetime in seconds
    #[arg(long, env = "FORWARD_TIMEOUT", default_value = "3600")]
    forward_timeout: u64,

    /// Namespace the proxy is deployed for (informational)
    #[arg(long, env = "KUBECTL_NAMESPACE")]
    namespace: Option<String>,

    /// Maximum number of concurrent sessions
    #[arg(long, env = "PODFORWARD_MAX_SESSIONS", default_value = "64")]
    max_sessions: usize,

    /// Seconds between reaper passes
    #[arg(long, env = "PODFORWARD_REAPER_INTERVAL", default_value = "5")]
    reaper_interval: u64,

    /// Seconds ended sessions stay queryable
    #[arg(long, env = "PODFORWARD_GRACE_PERIOD", default_value = "60")]
    grace_period: u64,

    /// Seconds to wait for a tunnel to come up
    #[arg(long, env = "PODFORWARD_ESTABLISH_TIMEOUT", default_value = "15")]
    establish_timeout: u64,

    /// Local ports handed to tunnels (e.g. "9000-9999")
    #[arg(long, env = "PODFORWARD_PORT_RANGE", default_value = "9000-9999")]
    port_range: String,

    /// Address tunnels listen on
    #[arg(long, env = "PODFORWARD_BIND_ADDRESS", default_value = "0.0.0.0")]
    bind_address: String,

    /// Seconds kubectl gets to exit after SIGTERM before it is killed
    #[arg(long, env = "PODFORWARD_STOP_GRACE", default_value = "5")]
    stop_grace: u64,

    /// kubectl executable
    #[arg(long, env = "KUBECTL_PATH", default_value = "kubectl")]
    kubectl: String,

    /// kubectl context to use
    #[arg(long, env = "KUBECTL_CONTEXT")]
    context: Option<String>,

    /// kubeconfig file to use
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl ServeArgs {
    fn session_config(&self) -> Result<SessionConfig> {
        let port_range = parse_port_range(&self.port_range).context("Invalid --port-range")?;
        let config = SessionConfig::default()
            .with_max_sessions(self.max_sessions)
            .with_session_timeout(Duration::from_secs(self.forward_timeout))
            .with_reaper_interval(Duration::from_secs(self.reaper_interval))
            .with_grace_period(Duration::from_secs(self.grace_period))
            .with_establish_timeout(Duration::from_secs(self.establish_timeout))
            .with_port_range(port_range)
            .with_bind_address(self.bind_address.clone());
        config.validate().context("Invalid session configuration")?;
        Ok(config)
    }

    fn kubectl_config(&self) -> KubectlConfig {
        KubectlConfig::new(self.kubectl.clone())
            .with_context(self.context.clone())
            .with_kubeconfig(self.kubeconfig.clone())
            .with_stop_grace(Duration::from_secs(self.stop_grace))
    }

    fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.listen_address, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address '{}'", self.listen_address))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.args.log_level)?;

    match cli.command {
        Some(Commands::CheckConfig) => check_config(&cli.args).await,
        Some(Commands::Serve) | None => serve(cli.args).await,
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();

    Ok(())
}

async fn check_config(args: &ServeArgs) -> Result<()> {
    let config = args.session_config()?;
    let api_addr = args.api_addr()?;

    println!("API address:        {}", api_addr);
    println!("Session timeout:    {}s", config.session_timeout.as_secs());
    println!("Max sessions:       {}", config.max_sessions);
    println!("Reaper interval:    {}s", config.reaper_interval.as_secs());
    println!("Grace period:       {}s", config.grace_period.as_secs());
    println!("Establish timeout:  {}s", config.establish_timeout.as_secs());
    println!(
        "Local ports:        {}-{}",
        config.port_range.start(),
        config.port_range.end()
    );
    println!("Tunnel bind:        {}", config.bind_address);
    println!("kubectl stop grace: {}s", args.stop_grace);

    let kubectl = KubectlTunnel::new(args.kubectl_config());
    let version = kubectl
        .client_version()
        .await
        .with_context(|| format!("'{}' is not usable", args.kubectl))?;
    println!("kubectl:            {}", version);

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.session_config()?;
    let api_addr = args.api_addr()?;

    info!("Starting podforward");
    info!(
        timeout_secs = config.session_timeout.as_secs(),
        max_sessions = config.max_sessions,
        namespace = args.namespace.as_deref().unwrap_or("-"),
        "Session settings"
    );

    let kubectl = KubectlTunnel::new(args.kubectl_config());
    match kubectl.client_version().await {
        Ok(version) => info!("Using {}", version),
        Err(e) => warn!("kubectl check failed, port-forwards will fail: {}", e),
    }

    let manager = SessionManager::new(config, Arc::new(kubectl));
    let shutdown = CancellationToken::new();
    let reaper = Reaper::new(manager.clone()).spawn(shutdown.clone());

    let server = ApiServer::new(
        ApiServerConfig {
            bind_addr: api_addr,
            enable_cors: true,
        },
        manager.clone(),
    );
    let server_shutdown = shutdown.clone();
    let mut server_handle =
        tokio::spawn(server.start(async move { server_shutdown.cancelled().await }));

    info!("Press Ctrl+C to stop");

    let server_result = tokio::select! {
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Shutdown signal received, stopping port-forwards..."),
                Err(err) => error!("Error listening for shutdown signal: {}", err),
            }
            None
        }
        result = &mut server_handle => {
            error!("API server stopped unexpectedly");
            Some(result)
        }
    };

    // Reaper is stopped before the final teardown
    shutdown.cancel();
    if let Err(e) = reaper.await {
        warn!("Reaper task failed: {}", e);
    }
    manager.shutdown().await;

    let server_result = match server_result {
        Some(result) => result,
        None => server_handle.await,
    };
    server_result.context("API server task failed")??;

    info!("podforward stopped");
    Ok(())
}
