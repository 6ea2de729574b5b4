use axum::{
    middleware as axum_mw,
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

mod config;
mod db;
mod error;
mod middleware;
mod models;
mod routes;
mod services;
mod store;

use config::Config;
use middleware::rate_limit::RateLimiter;
use store::{BillingStore, PgBillingStore};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BillingStore>,
    pub config: Arc<Config>,
    pub rate_limiter: RateLimiter,
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // --- Webhook routes (raw body, signature-verified, no tenant) ---
    let webhook_routes = Router::new()
        .route("/stripe", post(routes::webhooks::stripe_webhook))
        .route("/flutterwave", post(routes::webhooks::flutterwave_webhook));

    // --- Tenant routes ---
    let billing_routes = Router::new()
        .route("/plans", get(routes::billing::plans))
        .route("/wallet", get(routes::billing::get_wallet))
        .route(
            "/wallet/transactions",
            get(routes::billing::list_transactions),
        )
        .route(
            "/usage",
            get(routes::billing::usage_summary).post(routes::billing::record_usage),
        )
        .route("/limits/:resource", get(routes::billing::check_limit))
        .route(
            "/limits/:resource/reserve-check",
            post(routes::billing::reserve_check),
        )
        .route(
            "/addons",
            get(routes::billing::list_addons).post(routes::billing::purchase_addon),
        )
        .route("/addons/:addOnId", delete(routes::billing::cancel_addon))
        .route("/notifications", get(routes::billing::notifications))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::rate_limit::rate_limit,
        ))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::tenant::resolve_tenant,
        ));

    // --- Operator routes ---
    let internal_routes = Router::new()
        .route("/ledger/drift", get(routes::internal::ledger_drift))
        .route("/webhooks/failed", get(routes::internal::failed_webhooks))
        .route(
            "/wallets/:tenantId/refunds",
            post(routes::internal::refund),
        )
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::internal::require_internal_key,
        ));

    let api = Router::new()
        .nest("/webhooks", webhook_routes)
        .nest("/billing", billing_routes);

    Router::new()
        .nest("/api/v1", api)
        .nest("/internal", internal_routes)
        .route("/health", get(routes::health::health))
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .json()
        .init();

    let pool = db::create_pool(&config).await?;
    db::run_migrations(&pool).await?;

    let rate_limiter =
        RateLimiter::new(config.rate_limit.max_requests, config.rate_limit.window_secs);

    if config.stripe.webhook_secret.is_empty() {
        tracing::warn!("STRIPE_WEBHOOK_SECRET not set; Stripe webhooks will be rejected");
    }
    if config.flutterwave.secret_hash.is_empty() {
        tracing::warn!("FLW_SECRET_HASH not set; Flutterwave webhooks will be rejected");
    }
    if config.tenant.api_key_secret.is_empty() {
        tracing::warn!("TENANT_API_KEY_SECRET not set; tenant API keys will be rejected");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(env = %config.node_env, "Billing ledger initialized");
    let state = AppState {
        store: Arc::new(PgBillingStore::new(pool)),
        config: Arc::new(config),
        rate_limiter,
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Listening");
    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
