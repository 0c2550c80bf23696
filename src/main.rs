use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use nntp_gateway::{AppState, BufferPool, Dispatcher, Pool, build_router, load_config};

/// Article-sized buffers retained between requests; beyond this, rentals
/// allocate and free
const BUFFER_POOL_RETAINED: usize = 64;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Directory for the optional nntp-gateway.log file
    #[arg(long)]
    log_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = nntp_gateway::logging::init(args.log_dir.as_deref());

    let config = load_config(&args.config)?;

    info!("Loaded {} upstream server(s):", config.servers.len());
    for server in &config.servers {
        info!(
            "  - {} (tls: {}, posting: {}, connections: {})",
            server.host, server.tls, server.posting, server.connections
        );
    }

    let pool = Pool::new(config.servers.clone(), config.idle_conn_expiry());
    let state = AppState {
        dispatcher: Dispatcher::new(pool),
        buffers: BufferPool::new(config.article_size_limit, BUFFER_POOL_RETAINED),
        article_size_limit: config.article_size_limit,
        default_newsgroup: config.default_newsgroup.clone(),
    };
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.host, config.port))?;

    if let (Some(cert), Some(key)) = (&config.cert_file, &config.key_file) {
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
            .await
            .context("failed to load TLS certificate or key")?;

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            shutdown_handle.graceful_shutdown(None);
        });

        info!("Listening at https://{addr}");
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("HTTPS server error")?;
    } else {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        info!("Listening at http://{addr}");
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                shutdown_signal().await;
                info!("Shutdown signal received");
            })
            .await
            .context("HTTP server error")?;
    }

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
