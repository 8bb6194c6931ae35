//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{admin, customers, health, webhooks};
use crate::state::AppState;

/// Maximum concurrent requests for general API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Maximum webhooks reconciled at once. Each holds a blocking-pool thread for
/// its unit of work.
const WEBHOOK_MAX_CONCURRENT_REQUESTS: usize = 32;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Customers (identity auth)
/// - `POST /v1/customers` - Provision the caller's customer
/// - `GET /v1/me/orders` - Payment history
/// - `POST /v1/me/billing-portal` - Hosted billing portal URL
///
/// ## Admin (admin auth)
/// - `GET /v1/admin/subscriptions/:id` - Subscription with customer and product
/// - `GET /v1/admin/reviews` - Refused and unresolved events
///
/// ## Webhooks (Signature verification)
/// - `POST /webhooks/stripe` - Stripe webhooks
/// - `POST /webhooks/lago` - Lago webhooks
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    let api_routes = Router::new()
        // Customers
        .route("/customers", post(customers::create_customer))
        .route("/me/orders", get(customers::list_orders))
        .route("/me/billing-portal", post(customers::billing_portal))
        // Admin
        .route("/admin/subscriptions/:id", get(admin::get_subscription))
        .route("/admin/reviews", get(admin::list_reviews))
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    let webhook_routes = Router::new()
        .route("/stripe", post(webhooks::stripe_webhook))
        .route("/lago", post(webhooks::lago_webhook))
        .layer(ConcurrencyLimitLayer::new(WEBHOOK_MAX_CONCURRENT_REQUESTS));

    Router::new()
        .route("/health", get(health::health))
        .nest("/v1", api_routes)
        .nest("/webhooks", webhook_routes)
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
