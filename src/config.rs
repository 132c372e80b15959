use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use crate::cli::Cli;
use crate::discovery::DEFAULT_REFRESH_INTERVAL;
use crate::proxy::DEFAULT_CONNECT_TIMEOUT;

/// Default drain window for open connections on shutdown.
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub bind_ip: IpAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub private_ports: Vec<u16>,
    pub proxy_connect_timeout_secs: u64,
    pub refresh_interval_ms: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            label: None,
            private_ports: Vec::new(),
            proxy_connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL.as_millis() as u64,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
        }
    }
}

impl Config {
    /// Defaults, then `motarei.toml`, `motarei.json`, an optional extra
    /// file and `MOTAREI_*` variables, each overriding the previous.
    pub fn figment(extra_file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("motarei.toml"))
            .merge(Json::file("motarei.json"));

        if let Some(path) = extra_file {
            figment = match path.extension().and_then(|ext| ext.to_str()) {
                Some("json") => figment.merge(Json::file(path)),
                _ => figment.merge(Toml::file(path)),
            };
        }

        figment.merge(Env::prefixed("MOTAREI_"))
    }

    /// Load the configuration with command-line flags on top.
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let config: Config = Self::figment(cli.config.as_deref())
            .merge(Serialized::defaults(cli))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.label.as_deref().map_or(true, |l| l.trim().is_empty()) {
            anyhow::bail!("a container label is required (--label or MOTAREI_LABEL)");
        }
        if self.proxy_connect_timeout_secs == 0 {
            anyhow::bail!("proxy_connect_timeout_secs must be greater than zero");
        }
        if self.refresh_interval_ms == 0 {
            anyhow::bail!("refresh_interval_ms must be greater than zero");
        }
        Ok(())
    }

    /// The label selector; empty if unset.
    pub fn label(&self) -> &str {
        self.label.as_deref().map(str::trim).unwrap_or_default()
    }

    /// Explicit private ports, or `None` to infer them.
    pub fn explicit_ports(&self) -> Option<Vec<u16>> {
        (!self.private_ports.is_empty()).then(|| self.private_ports.clone())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_connect_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
