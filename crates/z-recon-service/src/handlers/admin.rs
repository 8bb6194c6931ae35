//! Admin handlers: subscription lookup and the review queue.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use z_recon_core::{AuditRecord, Period, Subscription, SubscriptionId};

use crate::auth::AuthAdmin;
use crate::error::ApiError;
use crate::state::AppState;

/// Default page size for the review queue.
const DEFAULT_REVIEWS_LIMIT: usize = 100;

/// Largest page size for the review queue.
const MAX_REVIEWS_LIMIT: usize = 1000;

/// Customer summary in a subscription detail.
#[derive(Debug, Serialize, Deserialize)]
pub struct CustomerSummary {
    /// Customer ID.
    pub id: String,
    /// Contact email.
    pub email: String,
    /// Billing provider account.
    pub billing_ref: Option<String>,
}

/// Product summary in a subscription detail.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProductSummary {
    /// Product ID.
    pub id: String,
    /// Plan code.
    pub code: String,
    /// Display name.
    pub name: String,
}

/// A subscription joined with its customer and product.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubscriptionDetail {
    /// Subscription ID.
    pub id: String,
    /// Current status.
    pub status: String,
    /// Provider reference (`stripe:sub_...`).
    pub provider_ref: String,
    /// Current billing period.
    pub current_period: Option<Period>,
    /// Provider time of the newest applied event.
    pub last_event_at: String,
    /// Created timestamp.
    pub created_at: String,
    /// Updated timestamp.
    pub updated_at: String,
    /// The subscribed customer, if the record still resolves.
    pub customer: Option<CustomerSummary>,
    /// The subscribed product, if the record still resolves.
    pub product: Option<ProductSummary>,
}

/// Look up one subscription.
pub async fn get_subscription(
    State(state): State<Arc<AppState>>,
    AuthAdmin(admin): AuthAdmin,
    Path(id): Path<String>,
) -> Result<Json<SubscriptionDetail>, ApiError> {
    let id = id
        .parse::<SubscriptionId>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let subscription = state
        .store
        .get_subscription(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("subscription {id}")))?;

    tracing::debug!(admin_id = %admin.admin_id, subscription_id = %id, "Subscription lookup");

    let customer = state
        .store
        .get_customer(&subscription.customer_id)?
        .map(|c| CustomerSummary {
            id: c.id.to_string(),
            email: c.email,
            billing_ref: c.billing_ref.map(|r| r.to_string()),
        });
    let product = state
        .store
        .get_product(&subscription.product_id)?
        .map(|p| ProductSummary {
            id: p.id.to_string(),
            code: p.code,
            name: p.name,
        });

    Ok(Json(detail(&subscription, customer, product)))
}

fn detail(
    subscription: &Subscription,
    customer: Option<CustomerSummary>,
    product: Option<ProductSummary>,
) -> SubscriptionDetail {
    SubscriptionDetail {
        id: subscription.id.to_string(),
        status: subscription.status.to_string(),
        provider_ref: subscription.provider_ref().to_string(),
        current_period: subscription.current_period,
        last_event_at: subscription.last_event_at.to_rfc3339(),
        created_at: subscription.created_at.to_rfc3339(),
        updated_at: subscription.updated_at.to_rfc3339(),
        customer,
        product,
    }
}

/// Review queue query parameters.
#[derive(Debug, Deserialize)]
pub struct ReviewsQuery {
    /// Maximum records to return.
    pub limit: Option<usize>,
}

/// Review queue response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReviewsResponse {
    /// Newest first.
    pub reviews: Vec<AuditRecord>,
}

/// List refused and unresolved events, newest first.
pub async fn list_reviews(
    State(state): State<Arc<AppState>>,
    AuthAdmin(_admin): AuthAdmin,
    Query(query): Query<ReviewsQuery>,
) -> Result<Json<ReviewsResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_REVIEWS_LIMIT)
        .clamp(1, MAX_REVIEWS_LIMIT);

    let reviews = state.store.list_audit(limit)?;
    Ok(Json(ReviewsResponse { reviews }))
}
