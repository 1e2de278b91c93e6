#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use portico_gateway::config::GatewayConfig;
use portico_gateway::hooks::NoopHookDispatcher;
use portico_gateway::pipeline::assembler::SharedHandles;
use portico_gateway::pipeline::gates::ApiRateLimiter;
use portico_gateway::pipeline::transforms::NoJqTransformer;
use portico_gateway::proxy::breaker::BreakerRegistry;
use portico_gateway::server;
use portico_gateway::session::store::{
    InMemoryOauthStore, InMemorySessionStore, KeyHasher, SessionManager,
};
use portico_gateway::trace::NoopTracer;
use portico_gateway::cache::TtlCache;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Parser)]
#[command(name = "portico-gateway", about = "API gateway data plane")]
struct Cli {
    /// Path to gateway config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Listen address (overrides the config file)
    #[arg(short, long)]
    listen: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    server::init_tracing();

    let mut config = GatewayConfig::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    let config = Arc::new(config);

    // Standalone mode wires the in-memory stores; clustered deployments
    // inject their own store implementations here.
    let sessions = Arc::new(SessionManager::new(
        Arc::new(InMemorySessionStore::new()),
        KeyHasher::new(config.hash_keys),
    ));
    let org_sessions = Arc::new(SessionManager::new(
        Arc::new(InMemorySessionStore::new()),
        KeyHasher::new(false),
    ));
    let shared = SharedHandles {
        sessions,
        org_sessions,
        oauth_clients: Arc::new(InMemoryOauthStore::new()),
        util_cache: Arc::new(TtlCache::new()),
        response_cache: Arc::new(TtlCache::new()),
        hook_dispatcher: Arc::new(NoopHookDispatcher),
        jq: Arc::new(NoJqTransformer),
        virtual_handler: None,
        api_limiter: Arc::new(ApiRateLimiter::new()),
        breakers: Arc::new(BreakerRegistry::new()),
        tracer: Arc::new(NoopTracer),
    };

    let state = server::GatewayState::new(config.clone(), shared);
    state.load_apis(&config.apis);

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    let shutdown = Arc::new(Notify::new());

    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(listener, state, shutdown).await }
    });

    wait_for_shutdown().await;
    shutdown.notify_waiters();
    state.shared.tracer.close();

    if let Err(e) = proxy_handle.await? {
        tracing::error!("server: proxy task error: {}", e);
    }
    tracing::info!("server: shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }
}
