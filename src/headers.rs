use http::{HeaderMap, HeaderValue, Response, StatusCode};
use hyper::Body;

/// Headers describing the exact bytes of a body. Any of them is wrong once
/// the body has been rewritten.
pub const PAYLOAD_HEADERS: &[&str] = &[
    "content-length",
    "content-encoding",
    "transfer-encoding",
    "content-md5",
    "content-digest",
    "etag",
];

const CSP_HEADERS: &[&str] = &[
    "content-security-policy",
    "content-security-policy-report-only",
    "x-frame-options",
    "frame-options",
];

pub fn strip_payload_headers(headers: &mut HeaderMap) {
    for name in PAYLOAD_HEADERS {
        headers.remove(*name);
    }
}

pub fn strip_csp_headers(headers: &mut HeaderMap) {
    for name in CSP_HEADERS {
        headers.remove(*name);
    }
}

pub fn add_cors_headers(headers: &mut HeaderMap) {
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, PUT, DELETE, PATCH, OPTIONS, HEAD"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "access-control-expose-headers",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "access-control-allow-credentials",
        HeaderValue::from_static("true"),
    );
    headers.insert("access-control-max-age", HeaderValue::from_static("86400"));
}

/// Answer to a CORS pre-flight that never reaches the backend.
pub fn preflight_response() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    add_cors_headers(response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_headers_are_removed_others_kept() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", HeaderValue::from_static("10"));
        headers.insert("content-encoding", HeaderValue::from_static("gzip"));
        headers.insert("etag", HeaderValue::from_static("\"abc\""));
        headers.insert("content-digest", HeaderValue::from_static("sha-256=:x:"));
        headers.insert("content-type", HeaderValue::from_static("text/javascript"));

        strip_payload_headers(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.get("content-type").is_some());
    }

    #[test]
    fn csp_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-security-policy",
            HeaderValue::from_static("default-src 'self'"),
        );
        headers.insert(
            "content-security-policy-report-only",
            HeaderValue::from_static("default-src 'self'"),
        );
        headers.insert("x-frame-options", HeaderValue::from_static("DENY"));

        strip_csp_headers(&mut headers);

        assert!(headers.is_empty());
    }

    #[test]
    fn preflight_carries_wildcard_cors() {
        let response = preflight_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let headers = response.headers();
        assert_eq!(headers["access-control-allow-origin"], "*");
        assert_eq!(headers["access-control-allow-credentials"], "true");
        assert_eq!(headers["access-control-max-age"], "86400");
    }
}
