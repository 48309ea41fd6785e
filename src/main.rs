use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chat_gateway::{
    AccessControl, AppConfig, AppState, GenerationDispatcher, GenerationLimits, ModelRegistry,
    build_router, cors_layer, model::loader_for,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        ?config.listen_addr,
        dev_mode = config.dev_mode,
        backend = ?config.backend,
        default_model = %config.default_model,
        "starting chat gateway"
    );
    if config.dev_mode {
        tracing::warn!(
            "dev mode: loopback callers are always allowed; a missing key or whitelist file \
             disables that check"
        );
    }

    let access = Arc::new(AccessControl::load(&config)?);
    let registry = Arc::new(ModelRegistry::from_config(&config, loader_for(&config)?)?);
    if config.preload_default_model {
        if let Err(err) = registry.preload_current().await {
            tracing::warn!(error = ?err, "default model preload failed, will retry on demand");
        }
    }
    let dispatcher = Arc::new(GenerationDispatcher::new(GenerationLimits::from(&config)));

    let state = AppState {
        access,
        registry,
        dispatcher,
    };
    let router = build_router(state, cors_layer(&config));

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
