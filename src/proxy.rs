use chrono::Utc;
use http::{
    HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri, Version, header,
};
use hyper::{Body, body};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::{
    assets::{SERVICE_WORKER_PATH, SERVICE_WORKER_REGISTRATION, head_script, service_worker_response},
    config::GatewayConfig,
    encoding::{ContentCoding, decode_body},
    error::RouteError,
    headers::{add_cors_headers, preflight_response, strip_csp_headers, strip_payload_headers},
    html::{HtmlOptions, rewrite_html_stream},
    redirect::rewrite_redirect,
    routing::{RoutingTarget, extract_host, match_gateway_host, parse_subdomain},
    script::{ScriptSource, rewrite_script},
    upstream::{OutboundOrigin, Transport, build_outbound_request, is_proxied},
    websocket,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const GIT_COMMIT: &str = match option_env!("GIT_COMMIT") {
    Some(commit) => commit,
    None => "unknown",
};

/// Per-response rewriting policy, derived from the routing target.
#[derive(Clone, Copy, Debug)]
pub struct RewriteContext<'a> {
    pub target: &'a RoutingTarget,
    pub domain: &'a str,
    /// Port in the raw set: no service worker, CSP stripped from headers
    /// and meta tags.
    pub raw_port: bool,
    /// Add wildcard CORS headers and answer pre-flights locally.
    pub cors: bool,
    /// The request path names a script file (`.js`/`.mjs`).
    pub script_path: bool,
}

impl<'a> RewriteContext<'a> {
    pub fn new(
        target: &'a RoutingTarget,
        domain: &'a str,
        config: &GatewayConfig,
        path: &str,
    ) -> Self {
        let raw_port = config.is_raw_port(target.port());
        RewriteContext {
            target,
            domain,
            raw_port,
            cors: raw_port || matches!(target, RoutingTarget::Scoped { .. }),
            script_path: path.ends_with(".js") || path.ends_with(".mjs"),
        }
    }

    fn html_options(&self) -> HtmlOptions {
        HtmlOptions {
            head_script: head_script(self.target, self.domain),
            service_worker_registration: (!self.raw_port)
                .then(|| SERVICE_WORKER_REGISTRATION.to_string()),
            strip_csp_meta: self.raw_port,
        }
    }

    fn content_kind(&self, headers: &HeaderMap) -> ContentKind {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.contains("text/html") {
            ContentKind::Html
        } else if content_type.contains("javascript") || content_type.contains("ecmascript") {
            ContentKind::Script
        } else if self.script_path
            && (content_type.is_empty()
                || content_type.starts_with("text/plain")
                || content_type.starts_with("application/octet-stream"))
        {
            ContentKind::Script
        } else {
            ContentKind::Other
        }
    }

    fn apply_header_policy(&self, headers: &mut HeaderMap, kind: ContentKind) {
        if kind == ContentKind::Html || self.raw_port {
            strip_csp_headers(headers);
        }
        if self.cors {
            add_cors_headers(headers);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ContentKind {
    Html,
    Script,
    Other,
}

/// The request pipeline. One instance is shared by every connection.
pub struct Gateway<T> {
    config: GatewayConfig,
    transport: T,
}

impl<T: Transport> Gateway<T> {
    pub fn new(config: GatewayConfig, transport: T) -> Self {
        Self { config, transport }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let path = req.uri().path().to_string();
        if path == "/health" {
            return json_response(
                StatusCode::OK,
                json!({
                    "status": "healthy",
                    "timestamp": Utc::now().to_rfc3339(),
                }),
            );
        }

        let Some(host) = extract_host(req.headers()) else {
            return route_error_response(RouteError::MissingHost);
        };

        let gateway_host = match_gateway_host(&host, &self.config.domains);
        let subdomain = gateway_host.as_ref().and_then(|h| h.subdomain.as_deref());
        if path == "/version" && subdomain.is_none() {
            return version_response();
        }

        let Some(gateway_host) = gateway_host else {
            return route_error_response(RouteError::UnknownDomain);
        };
        let Some(subdomain) = gateway_host.subdomain.as_deref() else {
            return text_response(StatusCode::OK, "cmux!");
        };

        if path == SERVICE_WORKER_PATH {
            return service_worker_response();
        }

        let target = match parse_subdomain(subdomain) {
            Ok(target) => target,
            Err(err) => {
                debug!(%host, %err, "rejected subdomain");
                return route_error_response(err);
            }
        };

        if is_proxied(req.headers()) {
            warn!(%host, "request already carries the proxied marker");
            return text_response(StatusCode::LOOP_DETECTED, "Loop detected in proxy");
        }

        let context = RewriteContext::new(&target, &gateway_host.domain, &self.config, &path);
        if context.cors && req.method() == Method::OPTIONS {
            return preflight_response();
        }

        let origin = OutboundOrigin::for_target(&target, &self.config.upstream);
        debug!(%host, ?target, authority = %origin.authority, "routing request");

        if websocket::is_websocket_upgrade(req.headers()) {
            return websocket::passthrough(&self.transport, req, &target, &origin).await;
        }

        self.forward(req, &context, &origin).await
    }

    async fn forward(
        &self,
        req: Request<Body>,
        context: &RewriteContext<'_>,
        origin: &OutboundOrigin,
    ) -> Response<Body> {
        let outbound = match build_outbound_request(req, context.target, origin) {
            Ok(outbound) => outbound,
            Err(err) => {
                warn!(%err, "failed to build upstream request");
                return text_response(StatusCode::BAD_GATEWAY, "Failed to build upstream URI");
            }
        };

        let head_fallback = (outbound.method() == Method::HEAD).then(|| HeadFallback {
            headers: outbound.headers().clone(),
            uri: outbound.uri().clone(),
            version: outbound.version(),
        });

        let response = match self.transport.send(outbound).await {
            Ok(response) => response,
            Err(err) => {
                warn!(%err, authority = %origin.authority, "upstream fetch failed");
                return text_response(StatusCode::BAD_GATEWAY, "Upstream fetch failed");
            }
        };

        if let Some(fallback) = head_fallback.as_ref()
            && matches!(
                response.status(),
                StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
            )
            && let Some(response) = self.head_via_get(fallback.clone(), context).await
        {
            return response;
        }

        let response = transform_response(response, context, head_fallback.is_some()).await;
        finish_response(response, context)
    }

    /// Retries a `HEAD` the backend refused as a `GET` and answers with the
    /// headers the rewritten `GET` would carry.
    async fn head_via_get(
        &self,
        fallback: HeadFallback,
        context: &RewriteContext<'_>,
    ) -> Option<Response<Body>> {
        let mut get = Request::builder()
            .method(Method::GET)
            .uri(fallback.uri)
            .version(fallback.version)
            .body(Body::empty())
            .ok()?;
        *get.headers_mut() = fallback.headers;
        get.headers_mut().remove(header::CONTENT_LENGTH);

        let response = match self.transport.send(get).await {
            Ok(response) => response,
            Err(err) => {
                warn!(%err, "HEAD fallback GET failed");
                return None;
            }
        };
        let response = finish_response(transform_response(response, context, false).await, context);

        let (mut parts, body) = response.into_parts();
        let drained = match body::to_bytes(body).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "failed to drain HEAD fallback body");
                return None;
            }
        };
        parts.headers.remove(header::TRANSFER_ENCODING);
        parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(drained.len()));
        Some(Response::from_parts(parts, Body::empty()))
    }
}

/// What is needed to replay a `HEAD` request as a `GET`.
#[derive(Clone)]
struct HeadFallback {
    headers: HeaderMap,
    uri: Uri,
    version: Version,
}

fn finish_response(response: Response<Body>, context: &RewriteContext<'_>) -> Response<Body> {
    rewrite_redirect(response, context.target, context.domain)
}

fn is_bodyless(status: StatusCode, head_request: bool) -> bool {
    head_request
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// Applies the content-type specific rewrite and the header policy.
pub async fn transform_response(
    response: Response<Body>,
    context: &RewriteContext<'_>,
    head_request: bool,
) -> Response<Body> {
    let (mut parts, body) = response.into_parts();
    let kind = context.content_kind(&parts.headers);
    context.apply_header_policy(&mut parts.headers, kind);

    if kind == ContentKind::Other || is_bodyless(parts.status, head_request) {
        return Response::from_parts(parts, body);
    }

    let encoding = parts
        .headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok());
    let Some(coding) = ContentCoding::from_header(encoding) else {
        debug!(?encoding, "unsupported content-encoding; passing body through");
        return Response::from_parts(parts, body);
    };

    match kind {
        ContentKind::Html => {
            strip_payload_headers(&mut parts.headers);
            let body = rewrite_html_stream(body, coding, context.html_options());
            Response::from_parts(parts, body)
        }
        ContentKind::Script => {
            let bytes = match body::to_bytes(body).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(%err, "failed to read upstream script");
                    return text_response(StatusCode::BAD_GATEWAY, "Failed to read upstream body");
                }
            };
            let decoded = match decode_body(&bytes, coding) {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!(%err, "failed to decode upstream script; skipping rewrite");
                    return Response::from_parts(parts, Body::from(bytes));
                }
            };
            let rewritten = match String::from_utf8(decoded) {
                Ok(source) => rewrite_script(&source, ScriptSource::External)
                    .into_owned()
                    .into_bytes(),
                Err(err) => err.into_bytes(),
            };
            strip_payload_headers(&mut parts.headers);
            parts
                .headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
            Response::from_parts(parts, Body::from(rewritten))
        }
        ContentKind::Other => Response::from_parts(parts, body),
    }
}

fn route_error_response(err: RouteError) -> Response<Body> {
    text_response(err.status(), &err.to_string())
}

fn version_response() -> Response<Body> {
    json_response(
        StatusCode::OK,
        json!({
            "version": VERSION,
            "git_commit": GIT_COMMIT,
        }),
    )
}

pub(crate) fn text_response(status: StatusCode, body: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn json_response(status: StatusCode, value: Value) -> Response<Body> {
    let mut response = Response::new(Body::from(value.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::upstream::{PORT_HEADER, PROXIED_HEADER, UpstreamFuture, WORKSPACE_HEADER};

    type Responder = fn(&Request<Body>) -> Response<Body>;

    /// Answers every request from `respond` and remembers what it was sent.
    struct CountingTransport {
        calls: AtomicUsize,
        seen: Mutex<Vec<(Method, Uri, HeaderMap)>>,
        respond: Responder,
    }

    impl CountingTransport {
        fn new(respond: Responder) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                respond,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Transport for CountingTransport {
        fn send(&self, request: Request<Body>) -> UpstreamFuture {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push((
                request.method().clone(),
                request.uri().clone(),
                request.headers().clone(),
            ));
            let response = (self.respond)(&request);
            Box::pin(async move { Ok(response) })
        }
    }

    fn ok_text(_: &Request<Body>) -> Response<Body> {
        Response::new(Body::from("ok"))
    }

    fn gateway(respond: Responder) -> Gateway<CountingTransport> {
        Gateway::new(GatewayConfig::default(), CountingTransport::new(respond))
    }

    fn request(method: Method, host: &str, path: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: Response<Body>) -> String {
        let bytes = body::to_bytes(response.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn loop_marked_request_never_reaches_upstream() {
        let gateway = gateway(ok_text);
        let mut req = request(Method::GET, "port-8080-vm1.cmux.sh", "/");
        req.headers_mut()
            .insert(PROXIED_HEADER, HeaderValue::from_static("true"));

        let response = gateway.handle(req).await;
        assert_eq!(response.status(), StatusCode::LOOP_DETECTED);
        assert_eq!(body_text(response).await, "Loop detected in proxy");
        assert_eq!(gateway.transport.calls(), 0);
    }

    #[tokio::test]
    async fn local_routes_answer_without_upstream() {
        let gateway = gateway(ok_text);

        let health = gateway.handle(request(Method::GET, "anything", "/health")).await;
        assert_eq!(health.status(), StatusCode::OK);
        let json: Value = serde_json::from_str(&body_text(health).await).unwrap();
        assert_eq!(json["status"], "healthy");

        let version = gateway.handle(request(Method::GET, "cmux.sh", "/version")).await;
        let json: Value = serde_json::from_str(&body_text(version).await).unwrap();
        assert_eq!(json["version"], VERSION);

        let apex = gateway.handle(request(Method::GET, "cmux.app", "/")).await;
        assert_eq!(body_text(apex).await, "cmux!");

        let sw = gateway
            .handle(request(Method::GET, "port-8080-vm1.cmux.sh", SERVICE_WORKER_PATH))
            .await;
        assert_eq!(sw.headers()[header::CONTENT_TYPE], "application/javascript");

        assert_eq!(gateway.transport.calls(), 0);
    }

    #[tokio::test]
    async fn bad_hosts_are_rejected_with_reason() {
        let gateway = gateway(ok_text);
        let cases = [
            ("example.com", "Not a cmux domain"),
            ("cmux-vm1-abc.cmux.sh", "Invalid port in cmux proxy subdomain"),
            ("cmux-.cmux.sh", "Invalid cmux proxy subdomain"),
            ("justoneword.cmux.sh", "Invalid cmux subdomain"),
            ("ws-99999-slug.cmux.sh", "Invalid port in subdomain"),
        ];
        for (host, reason) in cases {
            let response = gateway.handle(request(Method::GET, host, "/")).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{host}");
            assert_eq!(body_text(response).await, reason, "{host}");
        }

        let mut missing = request(Method::GET, "x", "/");
        missing.headers_mut().remove(header::HOST);
        let response = gateway.handle(missing).await;
        assert_eq!(
            body_text(response).await,
            "Missing host header for proxied request"
        );
        assert_eq!(gateway.transport.calls(), 0);
    }

    #[tokio::test]
    async fn scoped_preflight_is_answered_locally() {
        let gateway = gateway(ok_text);
        let response = gateway
            .handle(request(Method::OPTIONS, "cmux-vm1-9000.cmux.sh", "/api"))
            .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        assert_eq!(gateway.transport.calls(), 0);

        let legacy = gateway
            .handle(request(Method::OPTIONS, "port-8080-vm1.cmux.sh", "/api"))
            .await;
        assert_eq!(legacy.status(), StatusCode::OK);
        assert_eq!(gateway.transport.calls(), 1);
    }

    #[tokio::test]
    async fn outbound_request_carries_routing_headers() {
        let gateway = gateway(ok_text);
        let response = gateway
            .handle(request(Method::GET, "cmux-vm1-feature-9000.cmux.sh", "/a?b=1"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");

        let seen = gateway.transport.seen.lock().unwrap();
        let (method, uri, headers) = &seen[0];
        assert_eq!(*method, Method::GET);
        assert_eq!(uri.to_string(), "http://127.0.0.1:9000/a?b=1");
        assert_eq!(headers[PORT_HEADER], "9000");
        assert_eq!(headers[WORKSPACE_HEADER], "feature");
        assert_eq!(headers[PROXIED_HEADER], "true");
    }

    #[tokio::test]
    async fn javascript_is_rewritten_and_payload_headers_dropped() {
        fn script(_: &Request<Body>) -> Response<Body> {
            Response::builder()
                .header(header::CONTENT_TYPE, "application/javascript")
                .header(header::ETAG, "\"abc\"")
                .header(header::CONTENT_LENGTH, "29")
                .body(Body::from("console.log(window.location);"))
                .unwrap()
        }
        let gateway = gateway(script);
        let response = gateway
            .handle(request(Method::GET, "port-3000-vm1.cmux.sh", "/app.js"))
            .await;
        assert!(response.headers().get(header::ETAG).is_none());
        let expected_len = response.headers()[header::CONTENT_LENGTH].clone();
        let text = body_text(response).await;
        assert_eq!(expected_len, text.len().to_string().as_str());
        assert!(text.ends_with("console.log(window.__cmuxLocation);"));
    }

    #[tokio::test]
    async fn html_gets_head_block_and_loses_csp() {
        fn page(_: &Request<Body>) -> Response<Body> {
            Response::builder()
                .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
                .header("content-security-policy", "default-src 'self'")
                .body(Body::from("<html><head></head><body></body></html>"))
                .unwrap()
        }
        let gateway = gateway(page);
        let response = gateway
            .handle(request(Method::GET, "port-3000-vm1.cmux.sh", "/"))
            .await;
        assert!(response.headers().get("content-security-policy").is_none());
        let html = body_text(response).await;
        assert!(html.contains("window.__CMUX_PROXY_CONFIG"));
        assert!(html.contains("serviceWorker.register"));
    }

    #[tokio::test]
    async fn loopback_redirects_point_back_through_the_gateway() {
        fn redirect(_: &Request<Body>) -> Response<Body> {
            Response::builder()
                .status(StatusCode::FOUND)
                .header(header::LOCATION, "http://localhost:5173/login")
                .body(Body::empty())
                .unwrap()
        }
        let gateway = gateway(redirect);
        let response = gateway
            .handle(request(Method::GET, "ws-3000-slug.cmux.app", "/"))
            .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://ws-5173-slug.cmux.app/login"
        );
    }

    #[tokio::test]
    async fn created_location_is_rewritten_too() {
        fn created(_: &Request<Body>) -> Response<Body> {
            Response::builder()
                .status(StatusCode::CREATED)
                .header(header::LOCATION, "http://127.0.0.1:8080/items/7")
                .body(Body::empty())
                .unwrap()
        }
        let gateway = gateway(created);
        let response = gateway
            .handle(request(Method::POST, "cmux-abc123-9000.cmux.app", "/items"))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://cmux-abc123-base-8080.cmux.app/items/7"
        );
    }

    #[tokio::test]
    async fn refused_head_is_replayed_as_get() {
        fn head_refused(req: &Request<Body>) -> Response<Body> {
            if req.method() == Method::HEAD {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
                response
            } else {
                Response::builder()
                    .header(header::CONTENT_TYPE, "text/css")
                    .body(Body::from("body { color: red; }"))
                    .unwrap()
            }
        }
        let gateway = gateway(head_refused);
        let response = gateway
            .handle(request(Method::HEAD, "port-3000-vm1.cmux.sh", "/style.css"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "20");
        assert_eq!(gateway.transport.calls(), 2);
        let seen = gateway.transport.seen.lock().unwrap();
        assert_eq!(seen[1].0, Method::GET);
        drop(seen);
        assert!(body_text(response).await.is_empty());
    }

    #[test]
    fn content_kind_uses_type_then_path() {
        let target = parse_subdomain("port-3000-vm1").unwrap();
        let config = GatewayConfig::default();
        let by_path = RewriteContext::new(&target, "cmux.sh", &config, "/chunk.mjs");
        let by_type = RewriteContext::new(&target, "cmux.sh", &config, "/api");

        let mut headers = HeaderMap::new();
        assert_eq!(by_path.content_kind(&headers), ContentKind::Script);
        assert_eq!(by_type.content_kind(&headers), ContentKind::Other);

        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/javascript"));
        assert_eq!(by_type.content_kind(&headers), ContentKind::Script);

        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert_eq!(by_path.content_kind(&headers), ContentKind::Other);

        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("TEXT/HTML"));
        assert_eq!(by_path.content_kind(&headers), ContentKind::Html);
    }

    #[test]
    fn raw_ports_get_cors_and_no_service_worker() {
        let config = GatewayConfig::default();
        let target = parse_subdomain("port-39378-vm1").unwrap();
        let context = RewriteContext::new(&target, "cmux.sh", &config, "/");
        assert!(context.raw_port && context.cors);
        let options = context.html_options();
        assert!(options.strip_csp_meta);
        assert!(options.service_worker_registration.is_none());

        let mut headers = HeaderMap::new();
        headers.insert("content-security-policy", HeaderValue::from_static("x"));
        context.apply_header_policy(&mut headers, ContentKind::Other);
        assert!(headers.get("content-security-policy").is_none());
        assert_eq!(headers["access-control-allow-origin"], "*");
    }
}
