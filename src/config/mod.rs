//! Configuration for podrelay
//!
//! YAML application config plus kubeconfig discovery. The config file is
//! optional; missing keys fall back to defaults, and a missing file means
//! "all defaults" the same way an empty one does.

mod kubeconfig;

pub use kubeconfig::{resolve_kubeconfigs, validate_clusters, ResolvedCluster};

use std::path::Path;

use anyhow::{bail, Context as _, Result};
use serde::Deserialize;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// SOCKS5 listen address.
    pub listen_address: String,
    /// HTTP proxy listen address; empty disables the HTTP front end.
    pub http_listen_address: String,
    /// PAC server listen address; empty disables the PAC server.
    pub pac_listen_address: String,
    /// Skip loading `~/.kube/config`.
    pub skip_default_kubeconfig: bool,
    /// Skip the `KUBECONFIG` environment variable.
    pub skip_kubeconfig_env: bool,
    /// Explicit kubeconfig paths or glob patterns; `~` is expanded.
    pub kubeconfigs: Vec<String>,
    /// Logging configuration.
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_address: "127.0.0.1:9080".to_string(),
            http_listen_address: String::new(),
            pac_listen_address: String::new(),
            skip_default_kubeconfig: false,
            skip_kubeconfig_env: false,
            kubeconfigs: Vec::new(),
            log: LogConfig::default(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `debug`, `info`, `warn` or `error`.
    pub level: String,
    /// `text` or `json`.
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Load and validate the configuration file.
///
/// A missing file yields the defaults; a present but malformed file is a
/// hard error.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("reading config file {}", path.display()))
        }
    };

    let config = parse_config(&content)
        .with_context(|| format!("parsing config file {}", path.display()))?;

    config.validate()?;

    Ok(config)
}

/// Parse configuration from a YAML string; empty input means defaults.
pub fn parse_config(content: &str) -> Result<Config> {
    if content.trim().is_empty() {
        return Ok(Config::default());
    }

    serde_yaml::from_str(content).context("invalid YAML")
}

impl Config {
    /// Check that the static fields are well-formed.
    pub fn validate(&self) -> Result<()> {
        validate_listen_address("listenAddress", &self.listen_address)?;

        if !self.http_listen_address.is_empty() {
            validate_listen_address("httpListenAddress", &self.http_listen_address)?;
        }

        if !self.pac_listen_address.is_empty() {
            validate_listen_address("pacListenAddress", &self.pac_listen_address)?;
        }

        Ok(())
    }
}

fn validate_listen_address(key: &str, addr: &str) -> Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        bail!("invalid {key} {addr:?}: missing port");
    };

    if host.is_empty() {
        bail!("invalid {key} {addr:?}: missing host");
    }

    port.parse::<u16>()
        .with_context(|| format!("invalid {key} {addr:?}: bad port"))?;

    Ok(())
}

/// Install the process-wide tracing subscriber from the log configuration.
pub fn setup_logging(log: &LogConfig) -> Result<()> {
    let level = match log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        other => bail!("unknown log level {other:?}"),
    };

    match log.format.to_lowercase().as_str() {
        "json" => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .json()
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "text" => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_target(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        other => bail!("unknown log format {other:?}"),
    }

    Ok(())
}
