//! Payment providers and provider-side references.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// The closed set of payment providers the reconciler accepts events from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Stripe (payments, checkout, subscriptions).
    Stripe,
    /// Lago (usage-based billing and subscriptions).
    Lago,
}

impl Provider {
    /// All providers, in a stable order.
    pub const ALL: [Provider; 2] = [Provider::Stripe, Provider::Lago];

    /// Lowercase provider name as used in routes and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Provider::Stripe => "stripe",
            Provider::Lago => "lago",
        }
    }

    /// Single-byte tag used as a key prefix by storage backends.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Provider::Stripe => 1,
            Provider::Lago => 2,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stripe" => Ok(Provider::Stripe),
            "lago" => Ok(Provider::Lago),
            other => Err(CoreError::UnknownProvider(other.to_string())),
        }
    }
}

/// An identifier that only has meaning inside one provider
/// (`cus_...`, `sub_...`, a Lago `lago_id`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderRef {
    /// Provider that issued the identifier.
    pub provider: Provider,
    /// Provider-side identifier.
    pub id: String,
}

impl ProviderRef {
    /// Create a provider reference.
    #[must_use]
    pub fn new(provider: Provider, id: impl Into<String>) -> Self {
        Self {
            provider,
            id: id.into(),
        }
    }
}

impl fmt::Display for ProviderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_names_parse_back() {
        for provider in Provider::ALL {
            assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
        }
        assert!("paypal".parse::<Provider>().is_err());
    }

    #[test]
    fn provider_ref_display_includes_provider() {
        let r = ProviderRef::new(Provider::Stripe, "sub_123");
        assert_eq!(r.to_string(), "stripe:sub_123");
    }
}
