use http::{HeaderValue, Response, header};
use hyper::Body;
use url::{Host, Url};

use crate::routing::RoutingTarget;

/// `localhost`, the unspecified addresses, and every loopback IP. These only
/// mean something inside the backend VM.
pub fn is_loopback_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => domain.eq_ignore_ascii_case("localhost"),
        Host::Ipv4(ip) => ip.is_loopback() || ip.is_unspecified(),
        Host::Ipv6(ip) => ip.is_loopback() || ip.is_unspecified(),
    }
}

/// Maps an absolute loopback URL onto the gateway subdomain for its port.
///
/// Returns `None` when there is nothing to rewrite: relative or unparsable
/// locations, non-loopback hosts, or a result identical to the input.
pub fn rewrite_location(location: &str, target: &RoutingTarget, domain: &str) -> Option<String> {
    let mut url = Url::parse(location).ok()?;
    if !url.host().as_ref().is_some_and(is_loopback_host) {
        return None;
    }
    let port = url.port_or_known_default()?;
    let host = target.host_for_port(port, domain);

    url.set_scheme("https").ok()?;
    url.set_host(Some(&host)).ok()?;
    url.set_port(None).ok()?;

    let rewritten = url.to_string();
    (rewritten != location).then_some(rewritten)
}

pub fn rewrite_redirect(
    mut response: Response<Body>,
    target: &RoutingTarget,
    domain: &str,
) -> Response<Body> {
    let rewritten = response
        .headers()
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|location| rewrite_location(location, target, domain));

    if let Some(location) = rewritten
        && let Ok(value) = HeaderValue::from_str(&location)
    {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}
