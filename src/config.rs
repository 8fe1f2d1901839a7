use std::{net::SocketAddr, str::FromStr};

use clap::Parser;
use http::uri::Scheme;

/// The port of the in-VM editor. Clients of this port expect the gateway to
/// leave its service worker out and answer pre-flights itself.
pub const VSCODE_PORT: u16 = 39_378;

/// The in-VM proxy that fans scoped requests out to the right workspace.
pub const SCOPED_PROXY_PORT: u16 = 39_379;

pub const DEFAULT_DOMAINS: &[&str] = &["cmux.sh", "cmux.localhost", "cmux.app"];

#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    pub backend_host: String,
    pub backend_scheme: Scheme,
    pub morph_domain_suffix: Option<String>,
    pub workspace_domain_suffix: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            backend_host: "127.0.0.1".to_string(),
            backend_scheme: Scheme::HTTP,
            morph_domain_suffix: None,
            workspace_domain_suffix: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub domains: Vec<String>,
    pub raw_ports: Vec<u16>,
    pub upstream: UpstreamConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            domains: DEFAULT_DOMAINS.iter().map(|d| d.to_string()).collect(),
            raw_ports: vec![VSCODE_PORT],
            upstream: UpstreamConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn is_raw_port(&self, port: u16) -> bool {
        self.raw_ports.contains(&port)
    }
}

#[derive(Parser, Debug)]
#[command(name = "cmux-gateway", author, version)]
pub struct Options {
    /// Full socket address to bind; takes precedence over --port
    #[arg(long, env = "GLOBAL_PROXY_BIND")]
    pub bind: Option<SocketAddr>,
    /// Port to bind on all interfaces when --bind is not given
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,
    /// Host used for targets without a provider domain suffix
    #[arg(long, env = "GLOBAL_PROXY_BACKEND_HOST", default_value = "127.0.0.1")]
    pub backend_host: String,
    /// Scheme used for targets without a provider domain suffix
    #[arg(long, env = "GLOBAL_PROXY_BACKEND_SCHEME", default_value = "http", value_parser = parse_scheme)]
    pub backend_scheme: Scheme,
    #[arg(long, env = "GLOBAL_PROXY_MORPH_DOMAIN_SUFFIX")]
    pub morph_domain_suffix: Option<String>,
    #[arg(long, env = "GLOBAL_PROXY_WORKSPACE_DOMAIN_SUFFIX")]
    pub workspace_domain_suffix: Option<String>,
    /// Apex domains served by the gateway
    #[arg(
        long = "domain",
        env = "GLOBAL_PROXY_DOMAINS",
        value_delimiter = ',',
        default_values_t = DEFAULT_DOMAINS.iter().map(|d| d.to_string())
    )]
    pub domains: Vec<String>,
    /// Ports whose responses skip the service worker and get permissive CORS
    #[arg(
        long = "raw-port",
        env = "GLOBAL_PROXY_RAW_PORTS",
        value_delimiter = ',',
        default_values_t = [VSCODE_PORT]
    )]
    pub raw_ports: Vec<u16>,
}

impl Options {
    pub fn into_config(self) -> GatewayConfig {
        let bind_addr = self
            .bind
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], self.port)));
        let domains = self
            .domains
            .iter()
            .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();

        GatewayConfig {
            bind_addr,
            domains,
            raw_ports: self.raw_ports,
            upstream: UpstreamConfig {
                backend_host: self.backend_host,
                backend_scheme: self.backend_scheme,
                morph_domain_suffix: self.morph_domain_suffix.and_then(normalize_suffix),
                workspace_domain_suffix: self.workspace_domain_suffix.and_then(normalize_suffix),
            },
        }
    }
}

fn parse_scheme(value: &str) -> Result<Scheme, String> {
    Scheme::from_str(value).map_err(|_| format!("backend scheme '{}' is invalid", value))
}

pub fn normalize_suffix(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('.') {
        Some(trimmed.to_string())
    } else {
        Some(format!(".{}", trimmed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_gets_single_leading_dot() {
        assert_eq!(
            normalize_suffix("http.cloud.morph.so".to_string()).as_deref(),
            Some(".http.cloud.morph.so")
        );
        assert_eq!(
            normalize_suffix(" .vm.freestyle.sh ".to_string()).as_deref(),
            Some(".vm.freestyle.sh")
        );
        assert_eq!(normalize_suffix("   ".to_string()), None);
    }

    #[test]
    fn options_default_to_cmux_domains_and_vscode_raw_port() {
        let options = Options::parse_from(["cmux-gateway"]);
        let config = options.into_config();
        assert_eq!(config.domains, vec!["cmux.sh", "cmux.localhost", "cmux.app"]);
        assert!(config.is_raw_port(VSCODE_PORT));
        assert!(!config.is_raw_port(5173));
        assert_eq!(config.upstream.backend_scheme, Scheme::HTTP);
    }

    #[test]
    fn options_accept_comma_separated_lists() {
        let options = Options::parse_from([
            "cmux-gateway",
            "--domain",
            "example.dev,.Other.Test",
            "--raw-port",
            "39378,6080",
            "--morph-domain-suffix",
            "http.cloud.morph.so",
            "--bind",
            "127.0.0.1:9999",
        ]);
        let config = options.into_config();
        assert_eq!(config.domains, vec!["example.dev", "other.test"]);
        assert_eq!(config.raw_ports, vec![39_378, 6080]);
        assert_eq!(
            config.upstream.morph_domain_suffix.as_deref(),
            Some(".http.cloud.morph.so")
        );
        assert_eq!(config.bind_addr, SocketAddr::from(([127, 0, 0, 1], 9999)));
    }
}
