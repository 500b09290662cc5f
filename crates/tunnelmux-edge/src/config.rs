//! Edge configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tunnelmux_core::{TunnelError, TunnelResult};

/// Smallest and largest accepted client read buffer.
const MIN_READ_BUFFER: usize = 4 * 1024;
const MAX_READ_BUFFER: usize = 10 * 1024;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    /// Bind address of the transparent listener.
    pub listen: Option<String>,
    /// Gateway address (`host:port`).
    pub server: Option<String>,
    #[serde(default = "default_true")]
    pub transparent: bool,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default)]
    pub tls: TlsSection,
}

/// `[tls]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsSection {
    #[serde(default)]
    pub enabled: bool,
    /// SNI / verification name; defaults to the host part of `server`.
    pub server_name: Option<String>,
    /// PEM file with the CA certificates trusted for the gateway.
    pub ca_cert: Option<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

fn default_true() -> bool {
    true
}
fn default_retry_interval() -> u64 {
    5
}
fn default_queue_capacity() -> usize {
    10_000
}
fn default_read_buffer_size() -> usize {
    MAX_READ_BUFFER
}

/// Resolved TLS settings for the tunnel.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub server_name: String,
    pub ca_cert: Option<PathBuf>,
    pub insecure_skip_verify: bool,
}

/// Resolved edge configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub listen: String,
    pub server: String,
    pub transparent: bool,
    pub retry_interval: Duration,
    pub queue_capacity: usize,
    pub read_buffer_size: usize,
    pub tls: Option<TlsSettings>,
}

impl EdgeConfig {
    /// Load config from the TOML file, then apply CLI overrides.
    ///
    /// The file may only be absent when both `listen` and `server` come
    /// from the command line.
    pub fn load(
        config_path: &Path,
        cli_listen: Option<&str>,
        cli_server: Option<&str>,
    ) -> TunnelResult<Self> {
        let expanded = expand_tilde(config_path);
        let file_config = if expanded.exists() {
            info!(path = %expanded.display(), "loading config file");
            let content = std::fs::read_to_string(&expanded)?;
            toml::from_str::<ConfigFile>(&content)
                .map_err(|e| TunnelError::Config(format!("config parse error: {e}")))?
        } else if cli_listen.is_some() && cli_server.is_some() {
            info!(path = %expanded.display(), "config file not found, using CLI values");
            ConfigFile {
                transparent: default_true(),
                retry_interval_secs: default_retry_interval(),
                queue_capacity: default_queue_capacity(),
                read_buffer_size: default_read_buffer_size(),
                ..ConfigFile::default()
            }
        } else {
            return Err(TunnelError::Config(format!(
                "config file {} does not exist",
                expanded.display()
            )));
        };

        Self::resolve(file_config, cli_listen, cli_server)
    }

    fn resolve(
        file: ConfigFile,
        cli_listen: Option<&str>,
        cli_server: Option<&str>,
    ) -> TunnelResult<Self> {
        let listen = cli_listen
            .map(str::to_string)
            .or(file.listen)
            .ok_or_else(|| TunnelError::Config("missing `listen` address".into()))?;
        let server = cli_server
            .map(str::to_string)
            .or(file.server)
            .ok_or_else(|| TunnelError::Config("missing `server` address".into()))?;

        listen
            .parse::<std::net::SocketAddr>()
            .map_err(|e| TunnelError::Config(format!("invalid listen address {listen}: {e}")))?;
        let server_host = split_host(&server)?;

        if file.retry_interval_secs == 0 {
            return Err(TunnelError::Config("retry_interval_secs must be positive".into()));
        }
        if file.queue_capacity == 0 {
            return Err(TunnelError::Config("queue_capacity must be positive".into()));
        }
        if !(MIN_READ_BUFFER..=MAX_READ_BUFFER).contains(&file.read_buffer_size) {
            return Err(TunnelError::Config(format!(
                "read_buffer_size must be within {MIN_READ_BUFFER}..={MAX_READ_BUFFER}"
            )));
        }

        let tls = if file.tls.enabled {
            if file.tls.ca_cert.is_none() && !file.tls.insecure_skip_verify {
                return Err(TunnelError::Config(
                    "tls requires `ca_cert` or `insecure_skip_verify = true`".into(),
                ));
            }
            Some(TlsSettings {
                server_name: file.tls.server_name.unwrap_or_else(|| server_host.to_string()),
                ca_cert: file.tls.ca_cert.as_deref().map(expand_tilde_str),
                insecure_skip_verify: file.tls.insecure_skip_verify,
            })
        } else {
            None
        };

        Ok(Self {
            listen,
            server,
            transparent: file.transparent,
            retry_interval: Duration::from_secs(file.retry_interval_secs),
            queue_capacity: file.queue_capacity,
            read_buffer_size: file.read_buffer_size,
            tls,
        })
    }
}

/// Host part of a `host:port` string.
fn split_host(addr: &str) -> TunnelResult<&str> {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(host.trim_start_matches('[').trim_end_matches(']'))
        }
        _ => Err(TunnelError::Config(format!(
            "invalid server address {addr}, expected host:port"
        ))),
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parse_minimal_config() {
        let file = write_config(
            r#"
listen = "0.0.0.0:12345"
server = "gw.example.com:9000"
"#,
        );
        let cfg = EdgeConfig::load(file.path(), None, None).unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:12345");
        assert_eq!(cfg.server, "gw.example.com:9000");
        assert!(cfg.transparent);
        assert_eq!(cfg.retry_interval, Duration::from_secs(5));
        assert_eq!(cfg.queue_capacity, 10_000);
        assert_eq!(cfg.read_buffer_size, 10 * 1024);
        assert!(cfg.tls.is_none());
    }

    #[test]
    fn cli_overrides_file() {
        let file = write_config(
            r#"
listen = "0.0.0.0:12345"
server = "gw.example.com:9000"
"#,
        );
        let cfg = EdgeConfig::load(file.path(), Some("127.0.0.1:1"), None).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:1");
        assert_eq!(cfg.server, "gw.example.com:9000");
    }

    #[test]
    fn missing_file_without_cli_values_fails() {
        let err = EdgeConfig::load(Path::new("/nonexistent/edge.toml"), None, None);
        assert!(matches!(err, Err(TunnelError::Config(_))));
    }

    #[test]
    fn missing_file_with_cli_values_uses_defaults() {
        let cfg = EdgeConfig::load(
            Path::new("/nonexistent/edge.toml"),
            Some("127.0.0.1:12345"),
            Some("127.0.0.1:9000"),
        )
        .unwrap();
        assert!(cfg.transparent);
        assert_eq!(cfg.queue_capacity, 10_000);
    }

    #[test]
    fn missing_server_fails() {
        let file = write_config(r#"listen = "0.0.0.0:12345""#);
        assert!(EdgeConfig::load(file.path(), None, None).is_err());
    }

    #[test]
    fn unparsable_file_fails() {
        let file = write_config("listen = [");
        assert!(matches!(
            EdgeConfig::load(file.path(), None, None),
            Err(TunnelError::Config(_))
        ));
    }

    #[test]
    fn read_buffer_bounds_enforced() {
        let file = write_config(
            r#"
listen = "0.0.0.0:12345"
server = "gw:9000"
read_buffer_size = 1024
"#,
        );
        assert!(EdgeConfig::load(file.path(), None, None).is_err());
    }

    #[test]
    fn tls_defaults_server_name_to_host() {
        let file = write_config(
            r#"
listen = "0.0.0.0:12345"
server = "gw.example.com:9000"

[tls]
enabled = true
insecure_skip_verify = true
"#,
        );
        let cfg = EdgeConfig::load(file.path(), None, None).unwrap();
        let tls = cfg.tls.unwrap();
        assert_eq!(tls.server_name, "gw.example.com");
        assert!(tls.insecure_skip_verify);
    }

    #[test]
    fn tls_without_trust_source_fails() {
        let file = write_config(
            r#"
listen = "0.0.0.0:12345"
server = "gw.example.com:9000"

[tls]
enabled = true
"#,
        );
        assert!(EdgeConfig::load(file.path(), None, None).is_err());
    }
}
