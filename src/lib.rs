pub mod assets;
pub mod config;
pub mod encoding;
pub mod error;
pub mod headers;
pub mod html;
pub mod proxy;
pub mod redirect;
pub mod routing;
pub mod script;
pub mod upstream;
pub mod websocket;

use std::{net::SocketAddr, sync::Arc};

use hyper::{
    server::conn::AddrStream,
    service::{make_service_fn, service_fn},
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{error, info};

pub use config::{GatewayConfig, Options, UpstreamConfig};
pub use error::{GatewayError, RouteError};
pub use proxy::{Gateway, RewriteContext};
pub use routing::RoutingTarget;
pub use upstream::Transport;

pub struct GatewayHandle {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl GatewayHandle {
    /// Stops accepting connections and waits for in-flight requests.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

/// Binds `config.bind_addr` and serves the gateway with the default
/// hyper/rustls transport. Port 0 picks an ephemeral port; the bound
/// address is on the returned handle.
pub async fn spawn_gateway(config: GatewayConfig) -> Result<GatewayHandle, GatewayError> {
    spawn_gateway_with(config, upstream::build_http_client()).await
}

pub async fn spawn_gateway_with<T: Transport>(
    config: GatewayConfig,
    transport: T,
) -> Result<GatewayHandle, GatewayError> {
    let listener = std::net::TcpListener::bind(config.bind_addr)?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;

    let gateway = Arc::new(Gateway::new(config, transport));

    let make_svc = make_service_fn(move |_conn: &AddrStream| {
        let gateway = gateway.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let gateway = gateway.clone();
                async move { Ok::<_, hyper::Error>(gateway.handle(req).await) }
            }))
        }
    });

    let server = hyper::Server::from_tcp(listener)?.serve(make_svc);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let graceful = server.with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
    });
    let task = tokio::spawn(async move {
        if let Err(err) = graceful.await {
            error!(%err, "gateway server error");
        }
    });

    info!(addr = %local_addr, "gateway listening");
    Ok(GatewayHandle {
        addr: local_addr,
        shutdown: Some(shutdown_tx),
        task,
    })
}
