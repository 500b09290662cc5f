//! tunnelmux-gateway: far end of the edge tunnel.
//!
//! Accepts tunnel connections from edges, dials each session's original
//! destination, and relays bytes between the destination and the tunnel.

mod config;
mod relay;
mod server;
mod tls;

use clap::Parser;
use config::GatewayConfig;
use server::{GatewayServer, TunnelSettings};
use std::path::PathBuf;
use tracing::{error, info, warn};

/// tunnelmux-gateway: tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "tunnelmux-gateway", version, about = "Tunnel endpoint for tunnelmux edges")]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "tunnelmux-gateway.toml")]
    config: String,

    /// Listen address for tunnel connections (overrides config)
    #[arg(long)]
    listen: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Generate a self-signed development certificate into DIR and use it
    #[arg(long, value_name = "DIR")]
    generate_cert: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let (cert, key) = match &cli.generate_cert {
        Some(dir) => match tls::generate_self_signed_cert(dir) {
            Ok((c, k)) => {
                info!(cert = %c.display(), key = %k.display(), "generated self-signed certificate");
                (
                    Some(c.to_string_lossy().into_owned()),
                    Some(k.to_string_lossy().into_owned()),
                )
            }
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        },
        None => (cli.cert.clone(), cli.key.clone()),
    };

    let config = match GatewayConfig::load(
        &PathBuf::from(&cli.config),
        cli.listen.as_deref(),
        cert.as_deref(),
        key.as_deref(),
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
        tls = config.tls.is_some(),
        "starting tunnelmux-gateway"
    );

    let acceptor = match &config.tls {
        Some((cert, key)) => match tls::load_acceptor(cert, key) {
            Ok(acceptor) => Some(acceptor),
            Err(e) => {
                error!(error = %e, "failed to load TLS config");
                std::process::exit(1);
            }
        },
        None => {
            warn!("TLS disabled, tunnel traffic is unencrypted");
            None
        }
    };

    let settings = TunnelSettings {
        connect_timeout: config.connect_timeout,
        queue_capacity: config.queue_capacity,
        read_buffer_size: config.read_buffer_size,
    };
    let server = match GatewayServer::bind(&config.listen, acceptor, settings).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };

    tokio::select! {
        _ = server.accept_loop() => {}
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    info!("tunnelmux-gateway stopped");
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
