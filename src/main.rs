//! Crypto market-data ingestion and analytics backend: normalizes ticker,
//! kline, trade, order-book and book-ticker streams from pluggable
//! providers into bounded in-memory stores, derives footprint/volume-profile
//! analytics, and serves both REST and WebSocket surfaces over them.

use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{middleware as axum_mw, routing::get, Router};
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cryptofeed_backend::api::{self, ws, AppState};
use cryptofeed_backend::config::Config;
use cryptofeed_backend::dispatch::DispatchHub;
use cryptofeed_backend::middleware::{request_logging_simple, RateLimitConfig, RateLimitLayer};
use cryptofeed_backend::provider::exchange::ExchangeProvider;
use cryptofeed_backend::provider::mock::{MockProvider, Scenario};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("starting market-data backend");

    let config = Config::from_env();
    let bind_addr = config.bind_addr.clone();
    let hub = DispatchHub::new(config.clone());

    register_providers(&hub, &config);

    tokio::spawn(hub.footprint().clone().run_auto_close_sweep());

    if let Err(e) = hub.bootstrap().await {
        tracing::warn!(error = %e, "startup subscription bootstrap failed");
    }

    let rate_limiter = RateLimitLayer::new(RateLimitConfig::default());
    tokio::spawn(rate_limit_cleanup_loop(rate_limiter.clone()));

    let state = AppState { hub: hub.clone() };

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(api::trading::routes())
        .merge(api::footprint::routes())
        .merge(api::orderflow::routes())
        .merge(ws::routes())
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(request_logging_simple))
        .layer(axum_mw::from_fn_with_state(rate_limiter, cryptofeed_backend::middleware::rate_limit::rate_limit_middleware));

    let addr: SocketAddr = bind_addr.parse().context("invalid BIND_ADDR")?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "market-data API listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("server error")?;

    Ok(())
}

/// Registers the mock provider (always available) and, when
/// `ENABLE_EXCHANGE_PROVIDER` is set, the live Binance-backed provider.
fn register_providers(hub: &Arc<DispatchHub>, config: &Config) {
    let scenario = Scenario::parse(&config.mock_scenario);
    let mock = MockProvider::new(
        "mock",
        config.bootstrap_symbols.clone(),
        config.mock_ticker_ms,
        config.mock_default_volatility,
        scenario,
    );
    hub.register(Arc::new(mock));

    if env::var("ENABLE_EXCHANGE_PROVIDER").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false) {
        let exchange = ExchangeProvider::new("exchange", config.bootstrap_symbols.clone());
        hub.register(exchange);
    }
}

async fn rate_limit_cleanup_loop(limiter: RateLimitLayer) {
    let mut ticker = tokio::time::interval(Duration::from_secs(300));
    loop {
        ticker.tick().await;
        limiter.cleanup();
    }
}

async fn health_check() -> &'static str {
    "ok"
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cryptofeed_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    let _ = dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let root_env = manifest_dir.join("../.env");
    if root_env.exists() {
        let _ = dotenv::from_path(&root_env);
    }
}
