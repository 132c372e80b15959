//! Command-line flags.
//!
//! Every flag is optional so that a flag left out does not shadow the same
//! setting from a config file or the environment; the fields that were given
//! are merged on top of the other layers by [`Config::load`](crate::config::Config::load).

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::Serialize;

#[derive(Debug, Default, Parser, Serialize)]
#[command(name = "motarei", version, about)]
pub struct Cli {
    /// IP address to bind
    #[arg(long = "bind", value_name = "IP")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<IpAddr>,

    /// Label to filter containers, e.g. app=nginx
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Private port to forward (repeatable); inferred from the newest
    /// matching container when omitted
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub private_ports: Vec<u16>,

    /// Timeout of a connection attempt to an upstream, in seconds
    #[arg(long = "proxy-connect-timeout", value_name = "SECS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_connect_timeout_secs: Option<u64>,

    /// Period of the container discovery refresh, in milliseconds
    #[arg(long, value_name = "MS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_interval_ms: Option<u64>,

    /// How long to wait for open connections on shutdown, in seconds
    #[arg(long, value_name = "SECS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_grace_secs: Option<u64>,

    /// Extra configuration file (TOML, or JSON with a .json extension)
    #[arg(short, long, value_name = "PATH")]
    #[serde(skip)]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::parse_from([
            "motarei",
            "-l",
            "app=nginx",
            "--bind",
            "127.0.0.1",
            "-p",
            "80",
            "--port",
            "443",
            "--proxy-connect-timeout",
            "5",
        ]);
        assert_eq!(cli.label.as_deref(), Some("app=nginx"));
        assert_eq!(cli.bind_ip, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(cli.private_ports, vec![80, 443]);
        assert_eq!(cli.proxy_connect_timeout_secs, Some(5));
        assert_eq!(cli.refresh_interval_ms, None);
    }
}
