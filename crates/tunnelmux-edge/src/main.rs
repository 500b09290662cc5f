//! tunnelmux-edge: transparent TCP interception proxy.
//!
//! Accepts intercepted client connections, recovers each one's original
//! destination, and multiplexes all of them as sessions over a single
//! framed tunnel to a tunnelmux gateway.

mod config;
mod dispatcher;
mod proxy;
mod session;
mod tls;
mod tunnel;

use clap::Parser;
use config::EdgeConfig;
use dispatcher::Dispatcher;
use proxy::{ProxyListener, SockNameResolver};
use std::path::PathBuf;
use std::sync::Arc;
use tls::TlsClient;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tunnel::TunnelClient;

/// tunnelmux-edge: transparent interception proxy
#[derive(Parser, Debug)]
#[command(name = "tunnelmux-edge", version, about = "Transparent TCP interception proxy")]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "tunnelmux-edge.toml")]
    config: String,

    /// Listen address for intercepted connections (overrides config)
    #[arg(long)]
    listen: Option<String>,

    /// Gateway address, host:port (overrides config)
    #[arg(long)]
    server: Option<String>,

    /// Debug logging (same as --log-level debug)
    #[arg(short, long)]
    debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let level = if cli.debug { "debug" } else { cli.log_level.as_str() };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config = match EdgeConfig::load(
        &PathBuf::from(&cli.config),
        cli.listen.as_deref(),
        cli.server.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen,
        server = %config.server,
        tls = config.tls.is_some(),
        "starting tunnelmux-edge"
    );

    let tls = match config.tls.as_ref().map(TlsClient::from_settings).transpose() {
        Ok(tls) => tls,
        Err(e) => {
            error!(error = %e, "failed to set up TLS");
            std::process::exit(1);
        }
    };
    if config.tls.as_ref().is_some_and(|t| t.insecure_skip_verify) {
        warn!("gateway certificate verification is disabled");
    }

    let (events_tx, events_rx) = mpsc::channel(config.queue_capacity);

    let tunnel = TunnelClient::new(
        config.server.clone(),
        tls,
        config.retry_interval,
        events_tx.clone(),
    );
    let mut tunnel_state = tunnel.state();
    tokio::spawn(tunnel.run());
    tokio::spawn(async move {
        while tunnel_state.changed().await.is_ok() {
            let state = *tunnel_state.borrow_and_update();
            debug!(?state, "tunnel state changed");
        }
    });

    let listener = match ProxyListener::bind(
        &config.listen,
        config.transparent,
        Arc::new(SockNameResolver),
        events_tx,
        config.read_buffer_size,
    ) {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, listen = %config.listen, "failed to bind listener");
            std::process::exit(1);
        }
    };

    let dispatcher = tokio::spawn(Dispatcher::new(events_rx).run());

    tokio::select! {
        _ = listener.accept_loop() => {
            warn!("accept loop ended");
        }
        _ = dispatcher => {
            error!("dispatcher stopped unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    info!("tunnelmux-edge stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
