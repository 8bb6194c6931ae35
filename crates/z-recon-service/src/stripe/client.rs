//! Stripe API client.

use std::time::Duration;

use reqwest::Client;

use super::types::{BillingPortalSession, StripeErrorResponse};

/// Error type for Stripe operations.
#[derive(Debug, thiserror::Error)]
pub enum StripeError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Stripe API returned an error.
    #[error("Stripe API error: {error_type} - {message}")]
    Api {
        /// Error type.
        error_type: String,
        /// Error message.
        message: String,
        /// Error code.
        code: Option<String>,
    },
}

/// Stripe API client.
#[derive(Debug, Clone)]
pub struct StripeClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl StripeClient {
    /// Default Stripe API base URL.
    pub const BASE_URL: &'static str = "https://api.stripe.com/v1";

    /// Create a new Stripe client.
    ///
    /// # Arguments
    ///
    /// * `api_key` - Stripe secret API key (`sk_test_...` or `sk_live_...`)
    pub fn new(api_key: impl Into<String>) -> Result<Self, StripeError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            base_url: Self::BASE_URL.to_string(),
            api_key: api_key.into(),
        })
    }

    /// Point the client at another API root.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Open a billing portal session for a Stripe customer.
    pub async fn create_billing_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<BillingPortalSession, StripeError> {
        let params = [("customer", customer_id), ("return_url", return_url)];

        let response = self
            .client
            .post(format!("{}/billing_portal/sessions", self.base_url))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .form(&params)
            .send()
            .await?;

        self.handle_response(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, StripeError> {
        let status = response.status();

        if status.is_success() {
            return Ok(response.json().await?);
        }

        match response.json::<StripeErrorResponse>().await {
            Ok(stripe_error) => Err(StripeError::Api {
                error_type: stripe_error.error.error_type,
                message: stripe_error.error.message,
                code: stripe_error.error.code,
            }),
            Err(_) => Err(StripeError::Api {
                error_type: "unknown".to_string(),
                message: format!("HTTP {status}"),
                code: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn portal_session_is_created() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/billing_portal/sessions"))
            .and(header_exists("authorization"))
            .and(body_string_contains("customer=cus_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "bps_1",
                "customer": "cus_1",
                "url": "https://billing.stripe.com/session/abc"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = StripeClient::new("sk_test").unwrap().with_base_url(server.uri());
        let session = client
            .create_billing_portal_session("cus_1", "https://app.example/billing")
            .await
            .unwrap();
        assert_eq!(session.url, "https://billing.stripe.com/session/abc");
    }

    #[tokio::test]
    async fn api_errors_are_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/billing_portal/sessions"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {
                    "type": "invalid_request_error",
                    "message": "No such customer: 'cus_x'",
                    "code": "resource_missing"
                }
            })))
            .mount(&server)
            .await;

        let client = StripeClient::new("sk_test").unwrap().with_base_url(server.uri());
        let err = client
            .create_billing_portal_session("cus_x", "https://app.example")
            .await
            .unwrap_err();
        match err {
            StripeError::Api { code, .. } => assert_eq!(code.as_deref(), Some("resource_missing")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
