//! Gateway configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tunnelmux_core::{TunnelError, TunnelResult};

const MIN_READ_BUFFER: usize = 4 * 1024;
const MAX_READ_BUFFER: usize = 10 * 1024;

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    /// Bind address for tunnel connections from edges.
    pub listen: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Bound of each tunnel's outbound frame queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default)]
    pub tls: TlsSection,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            listen: None,
            connect_timeout_secs: default_connect_timeout(),
            queue_capacity: default_queue_capacity(),
            read_buffer_size: default_read_buffer_size(),
            tls: TlsSection::default(),
        }
    }
}

/// `[tls]` section. TLS is on when both files are given.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsSection {
    pub cert: Option<String>,
    pub key: Option<String>,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_queue_capacity() -> usize {
    10_000
}
fn default_read_buffer_size() -> usize {
    MAX_READ_BUFFER
}

/// Resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen: String,
    pub connect_timeout: Duration,
    pub queue_capacity: usize,
    pub read_buffer_size: usize,
    /// Certificate and key PEM paths.
    pub tls: Option<(PathBuf, PathBuf)>,
}

impl GatewayConfig {
    /// Load config from the TOML file, then apply CLI overrides. A missing
    /// file is fine when `listen` comes from the command line.
    pub fn load(
        config_path: &Path,
        cli_listen: Option<&str>,
        cli_cert: Option<&str>,
        cli_key: Option<&str>,
    ) -> TunnelResult<Self> {
        let expanded = expand_tilde(config_path);
        let file = if expanded.exists() {
            info!(path = %expanded.display(), "loading config file");
            let content = std::fs::read_to_string(&expanded)?;
            toml::from_str::<ConfigFile>(&content)
                .map_err(|e| TunnelError::Config(format!("config parse error: {e}")))?
        } else if cli_listen.is_some() {
            ConfigFile::default()
        } else {
            return Err(TunnelError::Config(format!(
                "config file {} does not exist",
                expanded.display()
            )));
        };

        let listen = cli_listen
            .map(str::to_string)
            .or(file.listen)
            .ok_or_else(|| TunnelError::Config("missing `listen` address".into()))?;
        listen
            .parse::<std::net::SocketAddr>()
            .map_err(|e| TunnelError::Config(format!("invalid listen address {listen}: {e}")))?;

        if file.connect_timeout_secs == 0 || file.queue_capacity == 0 {
            return Err(TunnelError::Config(
                "connect_timeout_secs and queue_capacity must be positive".into(),
            ));
        }
        if !(MIN_READ_BUFFER..=MAX_READ_BUFFER).contains(&file.read_buffer_size) {
            return Err(TunnelError::Config(format!(
                "read_buffer_size must be within {MIN_READ_BUFFER}..={MAX_READ_BUFFER}"
            )));
        }

        let cert = cli_cert.map(str::to_string).or(file.tls.cert);
        let key = cli_key.map(str::to_string).or(file.tls.key);
        let tls = match (cert, key) {
            (Some(cert), Some(key)) => Some((expand_tilde_str(&cert), expand_tilde_str(&key))),
            (None, None) => None,
            _ => {
                return Err(TunnelError::Config(
                    "tls needs both `cert` and `key`".into(),
                ))
            }
        };

        Ok(Self {
            listen,
            connect_timeout: Duration::from_secs(file.connect_timeout_secs),
            queue_capacity: file.queue_capacity,
            read_buffer_size: file.read_buffer_size,
            tls,
        })
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    expand_tilde_str(&path.to_string_lossy())
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
