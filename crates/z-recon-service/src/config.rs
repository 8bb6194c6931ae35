//! Service configuration.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Storage backend selected by `STORE_BACKEND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// In-process store; state is lost on restart.
    Memory,
    /// `RocksDB` under `DATA_DIR` (requires the `rocksdb-backend` feature).
    RocksDb,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "rocksdb" | "rocks" => Ok(Self::RocksDb),
            other => Err(format!("unknown store backend: {other}")),
        }
    }
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Storage backend (default: memory).
    pub store_backend: StoreBackend,

    /// Path to `RocksDB` data directory (default: "/data/z-recon").
    pub data_dir: String,

    /// Product catalog JSON file loaded at start-up.
    pub catalog_path: Option<String>,

    /// ZID JWT validation base URL (default: `<https://zid.zero.tech>`).
    pub auth_base_url: String,

    /// Expected JWT audience (default: "z-recon").
    pub auth_audience: String,

    /// Admin API key for the admin endpoints.
    pub admin_api_key: Option<String>,

    /// Stripe API key (optional).
    pub stripe_api_key: Option<String>,

    /// Stripe API base URL.
    pub stripe_api_url: String,

    /// Stripe webhook signing secret. The Stripe webhook is disabled without it.
    pub stripe_webhook_secret: Option<String>,

    /// Accepted clock skew for Stripe signature timestamps.
    pub stripe_signature_tolerance_seconds: u64,

    /// Lago API URL (optional).
    pub lago_api_url: Option<String>,

    /// Lago API key (optional).
    pub lago_api_key: Option<String>,

    /// Lago webhook secret. The Lago webhook is disabled without it.
    pub lago_webhook_secret: Option<String>,

    /// Notification sink URL. Notifications are only logged without it.
    pub notify_url: Option<String>,

    /// Bearer token for the notification sink.
    pub notify_api_key: Option<String>,

    /// Timeout of one notification attempt.
    pub notify_timeout_seconds: u64,

    /// Attempts per notification before it is dropped.
    pub notify_max_attempts: u32,

    /// Frontend URL, the default billing-portal return URL.
    pub frontend_url: String,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Deadline for the unit of work of one webhook.
    pub webhook_deadline_seconds: u64,

    /// How long after creation a customer may still get the welcome notification.
    pub welcome_window_seconds: i64,

    /// Ledger retention. Records are kept forever when unset.
    pub ledger_retention_days: Option<u32>,
}

/// Lago secrets file structure.
#[derive(Debug, Deserialize)]
struct LagoSecrets {
    api_url: String,
    api_key: String,
    #[serde(default)]
    webhook_secret: Option<String>,
}

/// Stripe secrets file structure.
#[derive(Debug, Deserialize)]
struct StripeSecrets {
    api_key: String,
    #[serde(default)]
    webhook_secret: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let (lago_api_url, lago_api_key, lago_webhook_secret) = load_lago_secrets();
        let (stripe_api_key, stripe_webhook_secret) = load_stripe_secrets();

        Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            store_backend: env_parse("STORE_BACKEND").unwrap_or(defaults.store_backend),
            data_dir: std::env::var("DATA_DIR").unwrap_or(defaults.data_dir),
            catalog_path: std::env::var("CATALOG_PATH").ok(),
            auth_base_url: std::env::var("AUTH_BASE_URL").unwrap_or(defaults.auth_base_url),
            auth_audience: std::env::var("AUTH_AUDIENCE").unwrap_or(defaults.auth_audience),
            admin_api_key: std::env::var("ADMIN_API_KEY").ok(),
            stripe_api_key,
            stripe_api_url: std::env::var("STRIPE_API_URL").unwrap_or(defaults.stripe_api_url),
            stripe_webhook_secret,
            stripe_signature_tolerance_seconds: env_parse("STRIPE_SIGNATURE_TOLERANCE_SECONDS")
                .unwrap_or(defaults.stripe_signature_tolerance_seconds),
            lago_api_url,
            lago_api_key,
            lago_webhook_secret,
            notify_url: std::env::var("NOTIFY_URL").ok(),
            notify_api_key: std::env::var("NOTIFY_API_KEY").ok(),
            notify_timeout_seconds: env_parse("NOTIFY_TIMEOUT_SECONDS")
                .unwrap_or(defaults.notify_timeout_seconds),
            notify_max_attempts: env_parse("NOTIFY_MAX_ATTEMPTS")
                .unwrap_or(defaults.notify_max_attempts),
            frontend_url: std::env::var("FRONTEND_URL").unwrap_or(defaults.frontend_url),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|s| parse_list(&s))
                .unwrap_or(defaults.cors_origins),
            max_body_bytes: env_parse("MAX_BODY_BYTES").unwrap_or(defaults.max_body_bytes),
            request_timeout_seconds: env_parse("REQUEST_TIMEOUT_SECONDS")
                .unwrap_or(defaults.request_timeout_seconds),
            webhook_deadline_seconds: env_parse("WEBHOOK_DEADLINE_SECONDS")
                .unwrap_or(defaults.webhook_deadline_seconds),
            welcome_window_seconds: env_parse("WELCOME_WINDOW_SECONDS")
                .unwrap_or(defaults.welcome_window_seconds),
            ledger_retention_days: env_parse("LEDGER_RETENTION_DAYS"),
        }
    }

    /// Deadline for one webhook's unit of work.
    #[must_use]
    pub const fn webhook_deadline(&self) -> Duration {
        Duration::from_secs(self.webhook_deadline_seconds)
    }

    /// Welcome-notification window.
    #[must_use]
    pub fn welcome_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.welcome_window_seconds)
    }

    /// Ledger retention, if pruning is enabled.
    #[must_use]
    pub fn ledger_retention(&self) -> Option<chrono::Duration> {
        self.ledger_retention_days
            .filter(|days| *days > 0)
            .map(|days| chrono::Duration::days(i64::from(days)))
    }
}

/// Parse an environment variable, ignoring unset or malformed values.
fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key = %key, value = %raw, "Ignoring malformed configuration value");
            None
        }
    }
}

/// Split a comma-separated list, dropping empty entries.
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Load Lago secrets from file or environment.
fn load_lago_secrets() -> (Option<String>, Option<String>, Option<String>) {
    let secret_paths = [
        ".secrets/lago.json",
        "z-recon/.secrets/lago.json",
        "../.secrets/lago.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<LagoSecrets>(path) {
            tracing::info!(path = %path, "Loaded Lago secrets from file");
            return (
                Some(secrets.api_url),
                Some(secrets.api_key),
                secrets
                    .webhook_secret
                    .or_else(|| std::env::var("LAGO_WEBHOOK_SECRET").ok()),
            );
        }
    }

    tracing::debug!("Lago secrets file not found, using environment variables");
    (
        std::env::var("LAGO_API_URL").ok(),
        std::env::var("LAGO_API_KEY").ok(),
        std::env::var("LAGO_WEBHOOK_SECRET").ok(),
    )
}

/// Load Stripe secrets from file or environment.
fn load_stripe_secrets() -> (Option<String>, Option<String>) {
    let secret_paths = [
        ".secrets/stripe.json",
        "z-recon/.secrets/stripe.json",
        "../.secrets/stripe.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<StripeSecrets>(path) {
            tracing::info!(path = %path, "Loaded Stripe secrets from file");
            return (
                Some(secrets.api_key),
                secrets
                    .webhook_secret
                    .or_else(|| std::env::var("STRIPE_WEBHOOK_SECRET").ok()),
            );
        }
    }

    tracing::debug!("Stripe secrets file not found, using environment variables");
    (
        std::env::var("STRIPE_API_KEY").ok(),
        std::env::var("STRIPE_WEBHOOK_SECRET").ok(),
    )
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            store_backend: StoreBackend::Memory,
            data_dir: "/data/z-recon".into(),
            catalog_path: None,
            auth_base_url: "https://zid.zero.tech".into(),
            auth_audience: "z-recon".into(),
            admin_api_key: None,
            stripe_api_key: None,
            stripe_api_url: "https://api.stripe.com/v1".into(),
            stripe_webhook_secret: None,
            stripe_signature_tolerance_seconds: 300,
            lago_api_url: None,
            lago_api_key: None,
            lago_webhook_secret: None,
            notify_url: None,
            notify_api_key: None,
            notify_timeout_seconds: 5,
            notify_max_attempts: 5,
            frontend_url: "http://localhost:3000".into(),
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
            webhook_deadline_seconds: 10,
            welcome_window_seconds: 60,
            ledger_retention_days: None,
        }
    }
}
