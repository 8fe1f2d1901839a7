use http::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("failed to build upstream uri: {0}")]
    UpstreamUri(#[from] http::uri::InvalidUri),
}

/// Reasons a request hostname cannot be turned into a routing target.
///
/// The display strings double as the plain-text body of the 400 response.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("Missing host header for proxied request")]
    MissingHost,
    #[error("Not a cmux domain")]
    UnknownDomain,
    #[error("Invalid cmux proxy subdomain")]
    InvalidScopedSubdomain,
    #[error("Invalid port in cmux proxy subdomain")]
    InvalidScopedPort,
    #[error("Invalid cmux subdomain")]
    InvalidSubdomain,
    #[error("Invalid port in subdomain")]
    InvalidPort,
}

impl RouteError {
    pub fn status(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }
}
