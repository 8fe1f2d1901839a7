use std::sync::Arc;

use futures_util::future::BoxFuture;
use http::{HeaderMap, HeaderValue, Request, Response, Uri, header, uri::Scheme};
use hyper::{Body, Client, client::HttpConnector};
use hyper_rustls::HttpsConnectorBuilder;

use crate::{
    config::{SCOPED_PROXY_PORT, UpstreamConfig},
    error::GatewayError,
    routing::RoutingTarget,
};

pub type HttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

pub type UpstreamFuture = BoxFuture<'static, Result<Response<Body>, hyper::Error>>;

pub const PROXIED_HEADER: &str = "x-cmux-proxied";
pub const PORT_HEADER: &str = "x-cmux-port-internal";
pub const WORKSPACE_HEADER: &str = "x-cmux-workspace-internal";

/// Sends one request to a backend. The hyper client never follows
/// redirects, so `3xx` responses come back for the redirect rewriter.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, request: Request<Body>) -> UpstreamFuture;
}

impl Transport for HttpClient {
    fn send(&self, request: Request<Body>) -> UpstreamFuture {
        Box::pin(self.request(request))
    }
}

impl<T: Transport> Transport for Arc<T> {
    fn send(&self, request: Request<Body>) -> UpstreamFuture {
        (**self).send(request)
    }
}

pub fn build_http_client() -> HttpClient {
    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .build();
    Client::builder().build(https)
}

/// Scheme and authority of the backend a target is served from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundOrigin {
    pub scheme: Scheme,
    pub authority: String,
}

impl OutboundOrigin {
    pub fn for_target(target: &RoutingTarget, upstream: &UpstreamConfig) -> Self {
        let provider_host = match (
            target,
            &upstream.morph_domain_suffix,
            &upstream.workspace_domain_suffix,
        ) {
            (RoutingTarget::LegacyPort { port, vm_id }, Some(suffix), _) => {
                Some(format!("port-{port}-morphvm-{vm_id}{suffix}"))
            }
            (RoutingTarget::Scoped { vm_id, .. }, Some(suffix), _) => {
                Some(format!("port-{SCOPED_PROXY_PORT}-morphvm-{vm_id}{suffix}"))
            }
            (RoutingTarget::Freestyle { vm_slug, .. }, _, Some(suffix)) => {
                Some(format!("{vm_slug}{suffix}"))
            }
            _ => None,
        };

        match provider_host {
            Some(authority) => OutboundOrigin {
                scheme: Scheme::HTTPS,
                authority,
            },
            None => OutboundOrigin {
                scheme: upstream.backend_scheme.clone(),
                authority: format!("{}:{}", upstream.backend_host, target.port()),
            },
        }
    }

    pub fn uri_for(&self, path_and_query: &str) -> Result<Uri, GatewayError> {
        let uri = format!("{}://{}{}", self.scheme.as_str(), self.authority, path_and_query)
            .parse::<Uri>()?;
        Ok(uri)
    }
}

/// True when the request has already been through a gateway.
pub fn is_proxied(headers: &HeaderMap) -> bool {
    headers
        .get(PROXIED_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub fn mark_proxied(headers: &mut HeaderMap) {
    headers.insert(PROXIED_HEADER, HeaderValue::from_static("true"));
}

/// Rewrites an inbound request in place into the request for `origin`.
///
/// Inbound headers are kept, except that the internal routing headers are
/// always derived from `target`, never taken from the caller.
pub fn build_outbound_request(
    mut req: Request<Body>,
    target: &RoutingTarget,
    origin: &OutboundOrigin,
) -> Result<Request<Body>, GatewayError> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    *req.uri_mut() = origin.uri_for(&path_and_query)?;

    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&origin.authority) {
        headers.insert(header::HOST, value);
    }

    headers.remove(WORKSPACE_HEADER);
    headers.insert(PORT_HEADER, HeaderValue::from(target.port()));
    if let Some(workspace) = target.workspace_header()
        && let Ok(value) = HeaderValue::from_str(workspace)
    {
        headers.insert(WORKSPACE_HEADER, value);
    }

    mark_proxied(headers);
    Ok(req)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::parse_subdomain;

    fn morph_upstream() -> UpstreamConfig {
        UpstreamConfig {
            morph_domain_suffix: Some(".http.cloud.morph.so".to_string()),
            workspace_domain_suffix: Some(".vm.freestyle.sh".to_string()),
            ..UpstreamConfig::default()
        }
    }

    #[test]
    fn provider_origins_follow_target_scheme() {
        let upstream = morph_upstream();

        let scoped = parse_subdomain("cmux-abc123-staging-9000").unwrap();
        assert_eq!(
            OutboundOrigin::for_target(&scoped, &upstream),
            OutboundOrigin {
                scheme: Scheme::HTTPS,
                authority: "port-39379-morphvm-abc123.http.cloud.morph.so".to_string()
            }
        );

        let legacy = parse_subdomain("port-5173-abc123").unwrap();
        assert_eq!(
            OutboundOrigin::for_target(&legacy, &upstream).authority,
            "port-5173-morphvm-abc123.http.cloud.morph.so"
        );

        let freestyle = parse_subdomain("ws-3000-slug").unwrap();
        assert_eq!(
            OutboundOrigin::for_target(&freestyle, &upstream).authority,
            "slug.vm.freestyle.sh"
        );
    }

    #[test]
    fn without_suffix_targets_use_backend_host_and_port() {
        let target = parse_subdomain("cmux-abc123-9000").unwrap();
        let origin = OutboundOrigin::for_target(&target, &UpstreamConfig::default());
        assert_eq!(origin.scheme, Scheme::HTTP);
        assert_eq!(origin.authority, "127.0.0.1:9000");
        assert_eq!(
            origin.uri_for("/a?b=c").unwrap().to_string(),
            "http://127.0.0.1:9000/a?b=c"
        );
    }

    #[test]
    fn outbound_request_overlays_internal_headers() {
        let target = parse_subdomain("cmux-abc123-9000").unwrap();
        let origin = OutboundOrigin::for_target(&target, &morph_upstream());
        let req = Request::builder()
            .uri("/path?q=1")
            .header("host", "cmux-abc123-9000.cmux.sh")
            .header(WORKSPACE_HEADER, "spoofed")
            .header("x-custom", "kept")
            .body(Body::empty())
            .unwrap();

        let out = build_outbound_request(req, &target, &origin).unwrap();
        assert_eq!(
            out.uri().to_string(),
            "https://port-39379-morphvm-abc123.http.cloud.morph.so/path?q=1"
        );
        let headers = out.headers();
        assert_eq!(headers[header::HOST], "port-39379-morphvm-abc123.http.cloud.morph.so");
        assert_eq!(headers[PORT_HEADER], "9000");
        assert_eq!(headers[PROXIED_HEADER], "true");
        assert_eq!(headers["x-custom"], "kept");
        assert!(headers.get(WORKSPACE_HEADER).is_none());
    }

    #[test]
    fn outbound_request_sets_workspace_for_named_scopes() {
        for (label, workspace) in [
            ("cmux-abc123-feature-9000", "feature"),
            ("my-ws-3000-slug", "my-ws"),
        ] {
            let target = parse_subdomain(label).unwrap();
            let origin = OutboundOrigin::for_target(&target, &UpstreamConfig::default());
            let req = Request::builder()
                .uri("/")
                .header(WORKSPACE_HEADER, "spoofed")
                .body(Body::empty())
                .unwrap();
            let out = build_outbound_request(req, &target, &origin).unwrap();
            assert_eq!(out.headers()[WORKSPACE_HEADER], workspace);
            assert_eq!(out.headers().get_all(WORKSPACE_HEADER).iter().count(), 1);
        }
    }

    #[test]
    fn loop_marker_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_proxied(&headers));
        headers.insert(PROXIED_HEADER, HeaderValue::from_static("TRUE"));
        assert!(is_proxied(&headers));
        headers.insert(PROXIED_HEADER, HeaderValue::from_static("false"));
        assert!(!is_proxied(&headers));
        mark_proxied(&mut headers);
        assert!(is_proxied(&headers));
    }
}
