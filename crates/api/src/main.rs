#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Inkwell API Server
//!
//! Billing endpoints, the gateway webhook, and cron/admin triggers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use inkwell_api::{create_router, AppState, Config};
use inkwell_billing::{
    BillingConfig, BillingDeps, BillingKeyCipher, BillingService, HttpGatewayClient,
    LogAlertSink, LogMailer, MemoryBillingStore, MemoryJobLock,
};
use inkwell_shared::{create_pool, run_migrations};
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,inkwell_api=debug,inkwell_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Inkwell API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    let (billing, pool) = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let pool = create_pool(url).await?;
            run_migrations(&pool).await?;
            tracing::info!("Database ready");
            (BillingService::from_env(pool.clone()).await?, Some(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, running billing on the in-memory store (dev only)");
            (in_memory_billing()?, None)
        }
    };

    let state = AppState::new(billing, config.clone(), pool);

    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();
    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .allow_credentials(true);

    let app = create_router(state)
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Real gateway, everything else in process
fn in_memory_billing() -> anyhow::Result<BillingService> {
    let config = BillingConfig::from_env()?;
    let catalog = Arc::new(config.load_catalog()?);
    let cipher = BillingKeyCipher::from_base64(&config.billing_key_encryption_key)?;
    let webhook_secret = config.gateway.webhook_secret.clone();
    let gateway = Arc::new(HttpGatewayClient::new(config.gateway)?);

    Ok(BillingService::with_components(BillingDeps {
        store: Arc::new(MemoryBillingStore::new()),
        gateway,
        alerts: Arc::new(LogAlertSink),
        mailer: Arc::new(LogMailer),
        lock: Arc::new(MemoryJobLock::new()),
        catalog,
        cipher,
        policy: config.policy,
        webhook_secret,
    }))
}
