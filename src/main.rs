use anyhow::{Context, Result};
use axum::http::StatusCode;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use linkpulse::allocator::Allocator;
use linkpulse::analytics::{AggregationReader, EnrichmentWorker, GeoResolver, Ingestor};
use linkpulse::api::{self, AppState};
use linkpulse::config::Config;
use linkpulse::redirect::{self, RedirectState};
use linkpulse::storage::{self, CachedLinkRegistry};
use linkpulse::token;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Loaded configuration");

    let backends = storage::connect(&config.database).await?;

    token::init_token_hmac_key(config.access_token.secret.as_deref());

    // Code allocation
    let allocator = Allocator::new(
        backends.counters.clone(),
        config.allocator.counter_key.clone(),
        config.allocator.block_size,
    )?;
    allocator.ensure_counter(config.allocator.start).await?;
    info!(
        "🔢 Short codes: width {}, block size {}",
        config.allocator.code_width, config.allocator.block_size
    );

    let links = Arc::new(CachedLinkRegistry::new(
        backends.links.clone(),
        config.cache.max_entries,
        Duration::from_secs(config.cache.ttl_secs),
    ));

    // Analytics pipeline
    let analytics = &config.analytics;
    let (ingestor, worker) = if analytics.enabled {
        let worker = Arc::new(EnrichmentWorker::new(
            backends.buffer.clone(),
            backends.analytics.clone(),
            backends.links.clone(),
            GeoResolver::from_config(analytics),
            analytics.claim_lease(),
        ));
        info!(
            "📊 Analytics enabled (worker every {:?}, claim lease {:?})",
            analytics.worker_interval(),
            analytics.claim_lease()
        );
        (
            Some(Ingestor::new(backends.buffer.clone())),
            Some(worker.spawn(analytics.worker_interval())),
        )
    } else {
        info!("📊 Analytics disabled");
        (None, None)
    };

    // Create routers
    let api_router = api::create_api_router(Arc::new(AppState {
        allocator: Arc::new(allocator),
        links: Arc::clone(&links),
        reader: Arc::new(AggregationReader::new(
            backends.analytics.clone(),
            analytics.query_timeout(),
        )),
        code_width: config.allocator.code_width,
        token_ttl: Duration::from_secs(config.access_token.ttl_secs),
    }));

    let redirect_status = StatusCode::from_u16(config.redirect.status_code)
        .context("invalid redirect status code")?;
    let redirect_router = redirect::create_redirect_router(Arc::new(RedirectState {
        links,
        ingestor,
        analytics_config: analytics.clone(),
        redirect_status,
    }));

    // Start API server
    let api_addr = format!("{}:{}", config.api_server.host, config.api_server.port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr).await?;
    info!("🚀 API server listening on http://{}", api_addr);
    info!("   - API endpoints available at http://{}/api/...", api_addr);

    // Start redirect server
    let redirect_addr = format!(
        "{}:{}",
        config.redirect_server.host, config.redirect_server.port
    );
    let redirect_listener = tokio::net::TcpListener::bind(&redirect_addr).await?;
    info!("🚀 Redirect server listening on http://{}", redirect_addr);

    // Run both servers concurrently until Ctrl+C
    tokio::try_join!(
        axum::serve(
            api_listener,
            api_router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal()),
        axum::serve(
            redirect_listener,
            redirect_router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal()),
    )?;

    if let Some(worker) = worker {
        worker.shutdown().await;
    }
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
