//! Tunnelshop API Server

use std::net::SocketAddr;

use axum::http::{header, HeaderValue, Method};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tunnelshop_api::{create_router, AppState, Config};
use tunnelshop_billing::BillingService;
use tunnelshop_shared::{create_pool, init_tracing, run_migrations};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing("info,tunnelshop_api=debug,tunnelshop_billing=debug");
    tracing::info!("Starting Tunnelshop API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!(?config, "Configuration loaded");

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;

    let billing = BillingService::from_env(pool)?;
    tracing::info!(
        rails = ?billing.intake.providers().methods(),
        "Billing service initialized"
    );

    // Claims orphaned by a previous process are resumed before serving.
    match billing.recovery.run().await {
        Ok(summary) => tracing::info!(?summary, "Startup recovery sweep complete"),
        Err(e) => tracing::error!(error = %e, "Startup recovery sweep failed"),
    }

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
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT]);

    let addr: SocketAddr = config.bind_address.parse()?;
    let app = create_router(AppState::new(billing, config))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
