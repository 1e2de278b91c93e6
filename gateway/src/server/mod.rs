use crate::config::{ApiDefinition, GatewayConfig};
use crate::pipeline::assembler::SharedHandles;
use crate::proxy;
use crate::proxy::BoxBody;
use crate::router::{loader, RoutingTable};
use anyhow::Result;
use arc_swap::ArcSwap;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub type HttpClient = hyper_util::client::legacy::Client<HttpConnector, BoxBody>;

/// Shared gateway state, cheaply cloneable.
///
/// The routing table lives behind an `ArcSwap`: requests `load` the
/// current generation lock-free, reloads build a full replacement
/// off-path and swap the pointer.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub table: Arc<ArcSwap<RoutingTable>>,
    pub shared: SharedHandles,
    pub client: HttpClient,
    /// Serializes reloads so concurrent swaps cannot lose a generation.
    reload_mu: Arc<std::sync::Mutex<()>>,
}

impl GatewayState {
    pub fn new(config: Arc<GatewayConfig>, shared: SharedHandles) -> Self {
        let client = hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build_http();
        Self {
            config,
            table: Arc::new(ArcSwap::new(Arc::new(RoutingTable::empty()))),
            shared,
            client,
            reload_mu: Arc::new(std::sync::Mutex::new(())),
        }
    }

    /// Atomic reload: compile and chain every definition off-path, then in
    /// one critical section release the outgoing generation's resources
    /// and swap the live table. In-flight requests keep the generation
    /// they started with until their guards drop.
    pub fn load_apis(&self, defs: &[ApiDefinition]) {
        let _guard = self.reload_mu.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.table.load_full();
        let next =
            loader::build_routing_table(defs, &self.shared, &self.config, Some(current.as_ref()));
        let count = next.api_count();
        current.release_all();
        self.table.store(Arc::new(next));
        info!(apis = count, "initialised API definitions");
    }
}

/// Install the JSON tracing subscriber used in production. Tests install
/// their own plain subscriber instead.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();
}

/// Run the proxy listener until `shutdown` fires, then stop accepting and
/// let in-flight connections drain.
pub async fn run_proxy_server(
    listener: TcpListener,
    state: GatewayState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    info!("server: proxy listening, addr={}", listener.local_addr()?);

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: proxy: stop accepting new connections");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("server: proxy: accept failed, error={}", e);
                continue;
            }
        };
        metrics::gauge!("gateway_connections_active").increment(1.0);

        let state = state.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let state_inner = state.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state_inner.clone();
                async move { proxy::handle_request(req, state, peer_addr).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: proxy: connection error, peer={}, error={}", peer_addr, e);
                }
            }
            metrics::gauge!("gateway_connections_active").decrement(1.0);
        });
    }

    Ok(())
}
