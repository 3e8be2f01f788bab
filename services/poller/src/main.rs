// poller: Zone poller agent entry point.
//
// Loads and validates configuration, builds the TLS client and metrics
// registry, starts the connection stream, and handles shutdown signals with
// a graceful-shutdown force timer.

use poller::config;
use poller::metrics::PollerMetrics;
use poller::stream::ConnectionStream;
use poller::tls::TlsClient;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "poller starting");

    // Parse optional --config <path> and --insecure arguments.
    // Defaults to /etc/zone-poller/poller.toml when not supplied.
    let args: Vec<String> = std::env::args().collect();
    let config_path = match args.iter().position(|a| a == "--config") {
        Some(i) => match args.get(i + 1) {
            Some(p) => std::path::PathBuf::from(p),
            None => {
                eprintln!("FATAL: --config requires a path argument");
                std::process::exit(1);
            }
        },
        None => std::path::PathBuf::from("/etc/zone-poller/poller.toml"),
    };
    let insecure = args.iter().any(|a| a == "--insecure");

    let mut cfg = match config::load_config_from_path(&config_path) {
        Ok(cfg) => {
            info!(
                zones = cfg.zones.len(),
                use_srv = cfg.endpoints.use_srv,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if insecure {
        cfg.tls.insecure = true;
    }

    info!(agent_id = %cfg.agent_id, "assigned unique identifier");

    let tls = match TlsClient::build(&cfg.tls) {
        Ok(tls) => tls,
        Err(e) => {
            eprintln!("FATAL: failed to build TLS client: {}", e);
            std::process::exit(1);
        }
    };

    let metrics = Arc::new(PollerMetrics::new());
    let graceful_shutdown = cfg.timeouts.graceful_shutdown;

    let cancel = CancellationToken::new();
    let stream = ConnectionStream::new(cfg, tls, metrics, &cancel);
    stream.connect();

    // Wait for Ctrl-C or SIGTERM.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("shutdown: SIGINT received"),
                    _ = sigterm.recv() => info!("shutdown: SIGTERM received"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                tokio::signal::ctrl_c().await.ok();
                info!("shutdown: SIGINT received");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown: Ctrl-C received");
    }

    // Force-terminate if cancellation does not complete in time.
    tokio::spawn(async move {
        tokio::time::sleep(graceful_shutdown).await;
        warn!("forcing immediate shutdown");
        std::process::exit(0);
    });

    stream.stop();
    cancel.cancel();

    // Brief delay to let tasks observe cancellation and unwind.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    info!("poller shutdown complete");
}
