//! orchestrdb Kubernetes Operator
//!
//! Watches `Database` and `User` custom resources and provisions the matching
//! databases, login roles and grants on PostgreSQL servers.

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use orchestrdb_operator::config::OperatorConfig;
use orchestrdb_operator::controller::run_operator;
use orchestrdb_operator::leader::{LeaderElectionConfig, LeaderElector, DEFAULT_LEASE_NAME};
use orchestrdb_operator::password::{MAX_PASSWORD_LENGTH, MIN_PASSWORD_LENGTH};
use orchestrdb_operator::registry::ResourceRegistry;
use orchestrdb_operator::store::KubeStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// orchestrdb Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "orchestrdb-operator")]
#[command(about = "Kubernetes operator that provisions PostgreSQL databases and users")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Length of generated user passwords
    #[arg(
        long,
        env = "PASSWORD_LENGTH",
        default_value_t = 32,
        value_parser = parse_password_length
    )]
    password_length: usize,

    /// Apply the CRDs with server-side apply before starting
    #[arg(long, env = "INSTALL_CRDS", default_value = "false")]
    install_crds: bool,

    /// Enable leader election so only one replica reconciles
    #[arg(long = "leader-elect", env = "LEADER_ELECTION", default_value = "false")]
    leader_election: bool,

    /// Name of the leader election Lease
    #[arg(long, env = "LEADER_ELECTION_ID", default_value = DEFAULT_LEASE_NAME)]
    leader_election_id: String,

    /// Namespace of the Lease (defaults to the client's namespace)
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE")]
    leader_election_namespace: Option<String>,

    /// Identity of this replica in the Lease
    #[arg(long, env = "POD_NAME")]
    leader_election_identity: Option<String>,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

fn parse_password_length(value: &str) -> std::result::Result<usize, String> {
    let length: usize = value
        .parse()
        .map_err(|_| format!("'{}' is not a number", value))?;
    if !(MIN_PASSWORD_LENGTH..=MAX_PASSWORD_LENGTH).contains(&length) {
        return Err(format!(
            "must be between {} and {}",
            MIN_PASSWORD_LENGTH, MAX_PASSWORD_LENGTH
        ));
    }
    Ok(length)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let registry = ResourceRegistry::with_builtin_kinds();

    // Handle CRD printing
    if args.print_crd {
        print!("{}", registry.crds_yaml()?);
        return Ok(());
    }

    init_logging(&args)?;

    let _ = rustls::crypto::ring::default_provider().install_default();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        },
        "Starting orchestrdb operator"
    );

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let config = OperatorConfig::default()
        .with_namespace(args.namespace.clone())
        .with_password_length(args.password_length);

    if args.install_crds {
        registry
            .install(&client, &config.field_manager)
            .await
            .context("Failed to install CRDs")?;
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        shutdown.cancel();
    });

    if args.leader_election {
        let election = leader_election_config(&args, client.default_namespace());
        let store = Arc::new(KubeStore::new(client.clone(), config.field_manager.clone()));
        let elector = LeaderElector::new(store, election);
        let registry = &registry;

        elector
            .run(cancel, move |leading| {
                run_operator(client, config, registry, leading)
            })
            .await
            .context("Controller failed")?;
    } else {
        run_operator(client, config, &registry, cancel)
            .await
            .context("Controller failed")?;
    }

    info!("Operator stopped");
    Ok(())
}

/// Lease settings from the command line
fn leader_election_config(args: &Args, client_namespace: &str) -> LeaderElectionConfig {
    let namespace = args
        .leader_election_namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| client_namespace.to_string());
    let identity = args
        .leader_election_identity
        .clone()
        .filter(|id| !id.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| format!("orchestrdb-operator-{}", std::process::id()));

    LeaderElectionConfig::new(namespace, identity).with_lease_name(&args.leader_election_id)
}

/// Initialize logging subsystem
///
/// `RUST_LOG` overrides `--log-level` when set.
fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.to_string().to_lowercase()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    // Keep the server running
    std::future::pending::<()>().await;

    Ok(())
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

/// Resolve on SIGINT or SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_length_parser() {
        assert_eq!(parse_password_length("32"), Ok(32));
        assert!(parse_password_length("7").is_err());
        assert!(parse_password_length("129").is_err());
        assert!(parse_password_length("abc").is_err());
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["orchestrdb-operator"]);
        assert_eq!(args.password_length, 32);
        assert_eq!(args.namespace, "");
        assert!(!args.install_crds);
        assert!(!args.print_crd);
        assert!(!args.leader_election);
        assert_eq!(args.leader_election_id, "orchestrdb-operator.mertsaygi.net");
    }

    #[test]
    fn test_leader_election_flags() {
        let args = Args::parse_from([
            "orchestrdb-operator",
            "--leader-elect",
            "--leader-election-namespace",
            "operators",
            "--leader-election-identity",
            "orchestrdb-0",
        ]);
        assert!(args.leader_election);

        let config = leader_election_config(&args, "default");
        assert_eq!(config.namespace, "operators");
        assert_eq!(config.identity, "orchestrdb-0");
        assert_eq!(config.lease_name, "orchestrdb-operator.mertsaygi.net");
    }

    #[test]
    fn test_lease_namespace_falls_back_to_client() {
        let args = Args::parse_from(["orchestrdb-operator", "--leader-election-identity", "x"]);
        assert_eq!(leader_election_config(&args, "apps").namespace, "apps");
    }
}
