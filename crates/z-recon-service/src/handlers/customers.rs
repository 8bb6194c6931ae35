//! Customer handlers: provisioning, order history and the billing portal.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use z_recon_core::{Customer, CustomerProfile, PaymentIntent, ProductId};

use crate::auth::{AuthCustomer, AuthIdentity};
use crate::error::ApiError;
use crate::state::AppState;

/// Default page size for order history.
const DEFAULT_ORDERS_LIMIT: usize = 50;

/// Largest page size for order history.
const MAX_ORDERS_LIMIT: usize = 200;

/// Customer response.
#[derive(Debug, Serialize, Deserialize)]
pub struct CustomerResponse {
    /// Customer ID.
    pub id: String,
    /// Contact email.
    pub email: String,
    /// Display name.
    pub name: Option<String>,
    /// Billing provider account, once linked (`stripe:cus_...`).
    pub billing_ref: Option<String>,
    /// Created timestamp.
    pub created_at: String,
    /// Whether this request created the customer.
    pub created: bool,
}

impl CustomerResponse {
    fn new(customer: &Customer, created: bool) -> Self {
        Self {
            id: customer.id.to_string(),
            email: customer.email.clone(),
            name: customer.name.clone(),
            billing_ref: customer.billing_ref.as_ref().map(ToString::to_string),
            created_at: customer.created_at.to_rfc3339(),
            created,
        }
    }
}

/// Create customer request.
#[derive(Debug, Default, Deserialize)]
pub struct CreateCustomerRequest {
    /// Contact email; defaults to the token's email claim.
    #[serde(default)]
    pub email: Option<String>,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
}

/// Create the caller's customer, or return it if it already exists.
pub async fn create_customer(
    State(state): State<Arc<AppState>>,
    AuthIdentity(identity): AuthIdentity,
    Json(body): Json<CreateCustomerRequest>,
) -> Result<(StatusCode, Json<CustomerResponse>), ApiError> {
    let email = body
        .email
        .or(identity.email)
        .ok_or_else(|| ApiError::BadRequest("email is required".into()))?;

    let provisioned = state.provisioner().get_or_create(
        &identity.subject,
        &email,
        CustomerProfile { name: body.name },
    )?;

    let status = if provisioned.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(CustomerResponse::new(&provisioned.customer, provisioned.created)),
    ))
}

/// Order history query parameters.
#[derive(Debug, Deserialize)]
pub struct OrdersQuery {
    /// Maximum orders to return.
    pub limit: Option<usize>,
}

/// One order in the history.
#[derive(Debug, Serialize, Deserialize)]
pub struct OrderResponse {
    /// Payment intent ID.
    pub id: String,
    /// Provider that took the payment.
    pub provider: String,
    /// Amount in minor units.
    pub amount_minor: i64,
    /// Amount refunded so far, in minor units.
    pub refunded_minor: i64,
    /// Currency code.
    pub currency: String,
    /// Payment status.
    pub status: String,
    /// Product name, when the payment was for a known product.
    pub product_name: Option<String>,
    /// Subscription the payment belongs to.
    pub subscription_id: Option<String>,
    /// Created timestamp.
    pub created_at: String,
}

impl OrderResponse {
    fn new(payment: &PaymentIntent, product_name: Option<String>) -> Self {
        Self {
            id: payment.id.to_string(),
            provider: payment.provider.to_string(),
            amount_minor: payment.amount_minor,
            refunded_minor: payment.refunded_minor,
            currency: payment.currency.to_string(),
            status: payment.status.to_string(),
            product_name,
            subscription_id: payment.subscription_id.map(|id| id.to_string()),
            created_at: payment.created_at.to_rfc3339(),
        }
    }
}

/// Orders response.
#[derive(Debug, Serialize, Deserialize)]
pub struct OrdersResponse {
    /// Newest first.
    pub orders: Vec<OrderResponse>,
}

/// List the caller's payments, newest first.
pub async fn list_orders(
    State(state): State<Arc<AppState>>,
    auth: AuthCustomer,
    Query(query): Query<OrdersQuery>,
) -> Result<Json<OrdersResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ORDERS_LIMIT)
        .clamp(1, MAX_ORDERS_LIMIT);

    let payments = state
        .store
        .list_payments_by_customer(&auth.customer.id, limit)?;

    let mut names: HashMap<ProductId, Option<String>> = HashMap::new();
    let mut orders = Vec::with_capacity(payments.len());
    for payment in &payments {
        let product_name = match payment.product_id {
            Some(product_id) => match names.get(&product_id) {
                Some(name) => name.clone(),
                None => {
                    let name = state.store.get_product(&product_id)?.map(|p| p.name);
                    names.insert(product_id, name.clone());
                    name
                }
            },
            None => None,
        };
        orders.push(OrderResponse::new(payment, product_name));
    }

    Ok(Json(OrdersResponse { orders }))
}

/// Billing portal request.
#[derive(Debug, Default, Deserialize)]
pub struct PortalRequest {
    /// Where the portal sends the customer back to.
    #[serde(default)]
    pub return_url: Option<String>,
}

/// Billing portal response.
#[derive(Debug, Serialize, Deserialize)]
pub struct PortalResponse {
    /// Hosted portal URL.
    pub url: String,
}

/// Open the hosted billing portal at the caller's billing provider.
pub async fn billing_portal(
    State(state): State<Arc<AppState>>,
    auth: AuthCustomer,
    Json(body): Json<PortalRequest>,
) -> Result<Json<PortalResponse>, ApiError> {
    let billing_ref = auth
        .customer
        .billing_ref
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("No billing account linked yet".into()))?;

    let return_url = body
        .return_url
        .unwrap_or_else(|| format!("{}/billing", state.config.frontend_url));

    let url = state.portal.portal_url(billing_ref, &return_url).await?;

    tracing::info!(
        customer_id = %auth.customer.id,
        provider = %billing_ref.provider,
        "Billing portal opened"
    );

    Ok(Json(PortalResponse { url }))
}
