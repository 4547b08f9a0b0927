//! ISM Kubernetes Operator
//!
//! Watches Broker, ServiceInstance and ServiceBinding custom resources and
//! drives the referenced Open Service Brokers to match them.

use anyhow::{Context, Result};
use clap::Parser;
use ism_operator::config::OperatorConfig;
use ism_operator::controller::run_controllers;
use ism_operator::crd;
use ism_operator::osb::HttpClientFactory;
use ism_operator::store::KubeStore;
use kube::Client;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// ISM Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "ism-operator")]
#[command(about = "Kubernetes operator for Open Service Broker backed services")]
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

    /// Concurrent reconciles per controller
    #[arg(long, env = "WORKERS", default_value = "10")]
    workers: usize,

    /// Timeout of each broker request in seconds
    #[arg(long, env = "BROKER_TIMEOUT_SECS", default_value = "60")]
    broker_timeout_secs: u64,

    /// Seconds between full resyncs
    #[arg(long, env = "RESYNC_SECS", default_value = "600")]
    resync_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn operator_config(&self) -> Result<OperatorConfig> {
        let config = OperatorConfig {
            watch_namespace: if self.namespace.is_empty() {
                None
            } else {
                Some(self.namespace.clone())
            },
            workers: self.workers,
            broker_timeout: Duration::from_secs(self.broker_timeout_secs),
            resync_period: Duration::from_secs(self.resync_secs),
            ..Default::default()
        };
        Ok(config.validated()?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    init_logging(&args)?;

    let config = args
        .operator_config()
        .context("Invalid operator configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = config.watch_namespace.as_deref().unwrap_or("all"),
        workers = config.workers,
        "Starting ISM Kubernetes Operator"
    );

    install_metrics_exporter(args.metrics_addr)?;

    let shutdown = CancellationToken::new();
    let running = Arc::new(AtomicBool::new(false));

    let health_addr = args.health_addr;
    let health = HealthProbe {
        running: running.clone(),
        shutdown: shutdown.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = serve_health(health_addr, health).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let store = Arc::new(KubeStore::new(client));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("Shutdown requested, finishing in-flight reconciles");
            shutdown.cancel();
        });
    }

    running.store(true, Ordering::SeqCst);
    run_controllers(store, Arc::new(HttpClientFactory), &config, shutdown).await;
    running.store(false, Ordering::SeqCst);

    info!("Operator stopped");
    Ok(())
}

/// Install the tracing subscriber; `RUST_LOG` takes precedence over `--log-level`
fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str().to_lowercase()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true);

    let installed = if args.log_json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))
}

/// Resolve on SIGINT, or SIGTERM on unix
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
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
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Serve Prometheus metrics from a background listener
fn install_metrics_exporter(addr: SocketAddr) -> Result<()> {
    info!(address = %addr, "Starting metrics server");
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")
}

/// What the health endpoints report
struct HealthProbe {
    /// Set while the controllers are running
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Running,
    Stopping,
}

impl HealthProbe {
    fn phase(&self) -> Phase {
        if self.shutdown.is_cancelled() {
            Phase::Stopping
        } else if self.running.load(Ordering::SeqCst) {
            Phase::Running
        } else {
            Phase::Starting
        }
    }
}

/// HTTP response for a probe of `path`.
///
/// `/healthz` fails once shutdown began; `/readyz` only passes while the
/// controllers run.
fn health_response(path: &str, phase: Phase) -> String {
    let (status, body) = match (path, phase) {
        ("/healthz", Phase::Stopping) | ("/readyz", Phase::Stopping) => {
            ("503 Service Unavailable", "stopping")
        }
        ("/readyz", Phase::Starting) => ("503 Service Unavailable", "starting"),
        ("/healthz", _) | ("/readyz", _) => ("200 OK", "ok"),
        _ => ("404 Not Found", "not found"),
    };
    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}

/// Path of the request line, e.g. `/healthz` for `GET /healthz HTTP/1.1`
fn request_path(request: &[u8]) -> &str {
    std::str::from_utf8(request)
        .ok()
        .and_then(|text| text.split_whitespace().nth(1))
        .map(|path| path.split('?').next().unwrap_or(path))
        .unwrap_or("/")
}

/// Answer liveness and readiness probes
async fn serve_health(addr: SocketAddr, probe: HealthProbe) -> Result<()> {
    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;
    let probe = Arc::new(probe);

    loop {
        let (mut socket, _) = listener.accept().await?;
        let probe = probe.clone();

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let Ok(read) = socket.read(&mut buf).await else {
                return;
            };
            let response = health_response(request_path(&buf[..read]), probe.phase());
            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

/// Print the YAML of all CRDs for installation
fn print_crd() -> Result<()> {
    for definition in crd::all_crds() {
        let yaml = serde_yaml::to_string(&definition)?;
        println!("---\n{}", yaml);
    }

    Ok(())
}
