//! Webhook handlers for Stripe and Lago.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use z_recon_core::Provider;

use crate::adapter::InboundWebhook;
use crate::error::ApiError;
use crate::state::AppState;

/// Webhook response.
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    /// Whether the webhook was accepted.
    pub received: bool,
    /// Outcome label of the ledger record.
    pub outcome: String,
    /// Whether this delivery repeated an already processed event.
    pub duplicate: bool,
}

/// Handle Stripe webhooks.
pub async fn stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, ApiError> {
    let webhook = InboundWebhook {
        body,
        signature: header(&headers, "stripe-signature"),
        delivery_id: None,
        received_at: Utc::now(),
    };
    receive(&state, Provider::Stripe, webhook).await
}

/// Handle Lago webhooks.
pub async fn lago_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, ApiError> {
    let webhook = InboundWebhook {
        body,
        signature: header(&headers, "x-lago-signature"),
        delivery_id: header(&headers, "x-lago-unique-key"),
        received_at: Utc::now(),
    };
    receive(&state, Provider::Lago, webhook).await
}

async fn receive(
    state: &AppState,
    provider: Provider,
    webhook: InboundWebhook,
) -> Result<Json<WebhookResponse>, ApiError> {
    let disposition = state.reconciler().handle(provider, webhook).await?;

    Ok(Json(WebhookResponse {
        received: true,
        outcome: disposition.record().outcome.label().to_string(),
        duplicate: disposition.is_duplicate(),
    }))
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}
