//! Hostname parsing: turns `<subdomain>.<gateway domain>` into the backend
//! coordinates a request should be proxied to.
//!
//! Three naming schemes share the wildcard namespace and are tried in a fixed
//! order, first match wins:
//!
//! 1. `port-<port>-<vm id>` (legacy Morph naming)
//! 2. `cmux-<vm id>[-<scope>]-<port>` (scoped Morph naming)
//! 3. `<workspace>-<port>-<vm slug>` (Freestyle naming)
//!
//! A `port-` label whose second segment is not a port falls through to the
//! later schemes; a `cmux-` label is always parsed as scoped and rejected if
//! malformed.

use http::{HeaderMap, header};
use serde::Serialize;

use crate::error::RouteError;

pub const LEGACY_PREFIX: &str = "port-";
pub const SCOPED_PREFIX: &str = "cmux-";
pub const BASE_SCOPE: &str = "base";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "scheme", rename_all = "kebab-case")]
pub enum RoutingTarget {
    #[serde(rename_all = "camelCase")]
    LegacyPort { port: u16, vm_id: String },
    #[serde(rename_all = "camelCase")]
    Scoped {
        vm_id: String,
        scope: String,
        port: u16,
    },
    #[serde(rename_all = "camelCase")]
    Freestyle {
        workspace: String,
        port: u16,
        vm_slug: String,
    },
}

impl RoutingTarget {
    pub fn port(&self) -> u16 {
        match self {
            RoutingTarget::LegacyPort { port, .. }
            | RoutingTarget::Scoped { port, .. }
            | RoutingTarget::Freestyle { port, .. } => *port,
        }
    }

    /// The value for the internal workspace header, if the backend should
    /// receive one. The base scope means "no workspace".
    pub fn workspace_header(&self) -> Option<&str> {
        match self {
            RoutingTarget::LegacyPort { .. } => None,
            RoutingTarget::Scoped { scope, .. } if is_base_scope(scope) => None,
            RoutingTarget::Scoped { scope, .. } => Some(scope),
            RoutingTarget::Freestyle { workspace, .. } => Some(workspace),
        }
    }

    /// Subdomain label addressing the same VM and scope at another port.
    ///
    /// Every label produced here parses back to a target of the same scheme.
    pub fn subdomain_for_port(&self, port: u16) -> String {
        match self {
            RoutingTarget::LegacyPort { vm_id, .. } => format!("{LEGACY_PREFIX}{port}-{vm_id}"),
            RoutingTarget::Scoped { vm_id, scope, .. } => {
                format!("{SCOPED_PREFIX}{vm_id}-{scope}-{port}")
            }
            RoutingTarget::Freestyle {
                workspace, vm_slug, ..
            } => format!("{workspace}-{port}-{vm_slug}"),
        }
    }

    pub fn host_for_port(&self, port: u16, domain: &str) -> String {
        format!("{}.{}", self.subdomain_for_port(port), domain)
    }
}

fn is_base_scope(scope: &str) -> bool {
    scope.is_empty() || scope.eq_ignore_ascii_case(BASE_SCOPE)
}

/// A request host split against the configured gateway domains.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayHost {
    pub subdomain: Option<String>,
    pub domain: String,
}

pub fn extract_host(headers: &HeaderMap) -> Option<String> {
    if let Some(forwarded) = headers
        .get("x-forwarded-host")
        .and_then(|value| value.to_str().ok())
    {
        return Some(normalize_host(forwarded));
    }

    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(normalize_host)
}

pub fn normalize_host(value: &str) -> String {
    let mut host = value.trim().to_ascii_lowercase();
    if let Some(idx) = host.rfind(':')
        && host[idx + 1..].chars().all(|c| c.is_ascii_digit())
    {
        host.truncate(idx);
    }
    host
}

pub fn match_gateway_host(host: &str, domains: &[String]) -> Option<GatewayHost> {
    for domain in domains {
        if host == domain {
            return Some(GatewayHost {
                subdomain: None,
                domain: domain.clone(),
            });
        }
        if let Some(prefix) = host
            .strip_suffix(domain.as_str())
            .and_then(|rest| rest.strip_suffix('.'))
        {
            let subdomain = (!prefix.is_empty()).then(|| prefix.to_string());
            return Some(GatewayHost {
                subdomain,
                domain: domain.clone(),
            });
        }
    }
    None
}

pub fn parse_subdomain(subdomain: &str) -> Result<RoutingTarget, RouteError> {
    if let Some(target) = parse_legacy(subdomain)? {
        return Ok(target);
    }

    if let Some(rest) = subdomain.strip_prefix(SCOPED_PREFIX) {
        return parse_scoped(rest);
    }

    parse_freestyle(subdomain)
}

fn segments(value: &str) -> Vec<&str> {
    value.split('-').filter(|s| !s.is_empty()).collect()
}

fn is_port_segment(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

fn parse_port(segment: &str, err: RouteError) -> Result<u16, RouteError> {
    if !is_port_segment(segment) {
        return Err(err);
    }
    segment.parse::<u16>().map_err(|_| err)
}

/// Returns `Ok(None)` when the label does not have the legacy shape at all.
fn parse_legacy(subdomain: &str) -> Result<Option<RoutingTarget>, RouteError> {
    if !subdomain.starts_with(LEGACY_PREFIX) {
        return Ok(None);
    }
    let parts = segments(subdomain);
    if parts.len() < 3 || !is_port_segment(parts[1]) {
        return Ok(None);
    }
    let port = parse_port(parts[1], RouteError::InvalidPort)?;
    Ok(Some(RoutingTarget::LegacyPort {
        port,
        vm_id: parts[2..].join("-"),
    }))
}

fn parse_scoped(rest: &str) -> Result<RoutingTarget, RouteError> {
    let parts = segments(rest);
    if parts.len() < 2 {
        return Err(RouteError::InvalidScopedSubdomain);
    }
    let port = parse_port(parts[parts.len() - 1], RouteError::InvalidScopedPort)?;
    let scope = parts[1..parts.len() - 1].join("-");
    let scope = if is_base_scope(&scope) {
        BASE_SCOPE.to_string()
    } else {
        scope
    };
    Ok(RoutingTarget::Scoped {
        vm_id: parts[0].to_string(),
        scope,
        port,
    })
}

fn parse_freestyle(subdomain: &str) -> Result<RoutingTarget, RouteError> {
    let parts = segments(subdomain);
    if parts.len() < 3 {
        return Err(RouteError::InvalidSubdomain);
    }
    let vm_slug = parts[parts.len() - 1];
    let port = parse_port(parts[parts.len() - 2], RouteError::InvalidPort)?;
    let workspace = parts[..parts.len() - 2].join("-");
    let target = RoutingTarget::Freestyle {
        workspace,
        port,
        vm_slug: vm_slug.to_string(),
    };
    // Only reachable through a leading dash: the canonical label would be
    // claimed by one of the prefixed schemes.
    let label = target.subdomain_for_port(port);
    if label.starts_with(SCOPED_PREFIX) || !matches!(parse_legacy(&label), Ok(None)) {
        return Err(RouteError::InvalidSubdomain);
    }
    Ok(target)
}
