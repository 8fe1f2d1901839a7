use std::io;

use http::{HeaderMap, Request, Response, StatusCode, header::UPGRADE};
use hyper::{Body, upgrade::Upgraded};
use tokio::io::{AsyncWriteExt, copy_bidirectional};
use tracing::{error, warn};

use crate::{
    proxy::text_response,
    routing::RoutingTarget,
    upstream::{OutboundOrigin, Transport, build_outbound_request},
};

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Forwards an upgrade request and, if the backend switches protocols,
/// splices the two upgraded connections together. Frames are never
/// inspected. Any other backend answer is returned to the client as-is.
pub async fn passthrough<T: Transport>(
    transport: &T,
    mut req: Request<Body>,
    target: &RoutingTarget,
    origin: &OutboundOrigin,
) -> Response<Body> {
    let client_upgrade = hyper::upgrade::on(&mut req);

    let mut outbound = match build_outbound_request(req, target, origin) {
        Ok(outbound) => outbound,
        Err(err) => {
            warn!(%err, "failed to build upstream websocket request");
            return text_response(
                StatusCode::BAD_GATEWAY,
                "Failed to build upstream websocket URI",
            );
        }
    };
    *outbound.body_mut() = Body::empty();

    let mut response = match transport.send(outbound).await {
        Ok(response) => response,
        Err(err) => {
            error!(%err, "upstream websocket request error");
            return text_response(
                StatusCode::BAD_GATEWAY,
                "Failed to connect to websocket backend",
            );
        }
    };

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return response;
    }

    let backend_stream = match hyper::upgrade::on(&mut response).await {
        Ok(upgraded) => upgraded,
        Err(err) => {
            error!(%err, "upstream websocket upgrade failed");
            return text_response(
                StatusCode::BAD_GATEWAY,
                "Failed to upgrade websocket backend",
            );
        }
    };

    let mut client_response = Response::new(Body::empty());
    *client_response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *client_response.headers_mut() = response.headers().clone();

    tokio::spawn(async move {
        match client_upgrade.await {
            Ok(client_stream) => {
                if let Err(err) = tunnel(client_stream, backend_stream).await {
                    warn!(%err, "websocket tunnel error");
                }
            }
            Err(err) => {
                warn!(%err, "client upgrade error");
                let mut backend_stream = backend_stream;
                let _ = backend_stream.shutdown().await;
            }
        }
    });

    client_response
}

async fn tunnel(mut client: Upgraded, mut backend: Upgraded) -> io::Result<()> {
    let result = copy_bidirectional(&mut client, &mut backend).await;
    let _ = client.shutdown().await;
    let _ = backend.shutdown().await;
    result.map(|_| ())
}
