//! Lago API client.

use std::time::Duration;

use reqwest::Client;

use super::types::{LagoErrorResponse, PortalUrlResponse};

/// Error type for Lago operations.
#[derive(Debug, thiserror::Error)]
pub enum LagoError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Lago API returned an error.
    #[error("Lago API error: {status} - {error}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message.
        error: String,
        /// Error code.
        code: Option<String>,
    },
}

/// Lago API client.
#[derive(Debug, Clone)]
pub struct LagoClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl LagoClient {
    /// Create a new Lago client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Lago API URL (e.g., `"http://localhost:3000"`)
    /// * `api_key` - Lago API key
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, LagoError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// Get the hosted customer portal URL for a customer's external ID.
    pub async fn customer_portal_url(&self, external_id: &str) -> Result<String, LagoError> {
        let url = format!(
            "{}/api/v1/customers/{}/portal_url",
            self.base_url, external_id
        );

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;

        self.handle_response::<PortalUrlResponse>(response)
            .await
            .map(|r| r.customer.portal_url)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, LagoError> {
        let status = response.status();

        if status.is_success() {
            return Ok(response.json().await?);
        }

        match response.json::<LagoErrorResponse>().await {
            Ok(lago_error) => {
                let error = match &lago_error.error_details {
                    Some(details) => format!("{} - details: {}", lago_error.error, details),
                    None => lago_error.error,
                };
                Err(LagoError::Api {
                    status: lago_error.status,
                    error,
                    code: lago_error.code,
                })
            }
            Err(_) => Err(LagoError::Api {
                status: status.as_u16(),
                error: format!("HTTP {status}"),
                code: None,
            }),
        }
    }
}
