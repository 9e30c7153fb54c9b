//! Upstream data provider abstraction
//!
//! Each provider exposes a support check, a fetch returning the raw upstream
//! body, and a pure normalization step. Failures are typed so the fallback
//! chain can decide whether to continue, cool the provider down, or stop.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Logical aggregator operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Latest quote for one symbol
    Quote,
    /// Daily price history for one symbol
    History,
    /// Exchange rate between two currencies
    FxRate,
}

impl Operation {
    /// Configuration key for this operation
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::History => "history",
            Self::FxRate => "fx_rate",
        }
    }
}

/// Raw upstream response, prior to normalization
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// Response body text (JSON, CSV, or XML depending on the provider)
    pub body: String,
    /// The request parameters that produced this response, echoed so
    /// `normalize` stays pure
    pub params: Value,
}

/// Typed provider failure kinds
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Upstream quota exhausted; try the next provider
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Temporary failure (network, 5xx); try the next provider
    #[error("transient: {0}")]
    Transient(String),
    /// Provider is down or rejecting credentials; cool it down
    #[error("unavailable: {0}")]
    PermanentUnavailable(String),
    /// The data is canonically absent; do not try later providers
    #[error("not found: {0}")]
    NotFound(String),
    /// Upstream answered with an unparseable payload
    #[error("malformed: {0}")]
    Malformed(String),
}

/// An upstream data source consulted by the aggregator.
///
/// Implementations must be `Send + Sync` so they can be shared across
/// concurrent fetches; `normalize` is pure.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    /// Stable provider id, referenced by `aggregator.provider_order`
    fn id(&self) -> &str;

    /// Whether this provider can serve the operation with these parameters
    fn supports(&self, operation: Operation, params: &Value) -> bool;

    /// Fetch the raw upstream response within `remaining` time
    async fn fetch(
        &self,
        operation: Operation,
        params: &Value,
        remaining: Duration,
    ) -> std::result::Result<RawResponse, ProviderError>;

    /// Normalize a raw response into the operation's canonical shape
    fn normalize(
        &self,
        operation: Operation,
        raw: &RawResponse,
    ) -> std::result::Result<Value, ProviderError>;
}

/// Map an HTTP status from an upstream API onto a provider error kind
#[must_use]
pub fn classify_status(provider: &str, status: reqwest::StatusCode) -> ProviderError {
    if status.as_u16() == 429 {
        ProviderError::RateLimited(format!("{provider} returned 429"))
    } else if status.as_u16() == 404 {
        ProviderError::NotFound(format!("{provider} returned 404"))
    } else if status.as_u16() == 401 || status.as_u16() == 403 {
        ProviderError::PermanentUnavailable(format!("{provider} rejected credentials ({status})"))
    } else if status.is_server_error() {
        ProviderError::Transient(format!("{provider} returned {status}"))
    } else {
        ProviderError::Malformed(format!("{provider} returned unexpected {status}"))
    }
}
