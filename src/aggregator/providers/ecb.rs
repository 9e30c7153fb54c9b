//! ECB reference-rate provider
//!
//! Parses the European Central Bank's daily `eurofxref-daily.xml` feed.
//! Rates are EUR-based; cross rates are derived as `rate(to) / rate(from)`
//! with EUR itself pinned at 1.0.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::Event;
use serde_json::{Value, json};

use crate::aggregator::{Operation, Provider, ProviderError, RawResponse, classify_status};
use crate::config::ProviderConfig;

const DEFAULT_BASE_URL: &str = "https://www.ecb.europa.eu";
const FEED_PATH: &str = "/stats/eurofxref/eurofxref-daily.xml";

/// ECB daily reference-rate feed client
pub struct EcbProvider {
    client: reqwest::Client,
    base_url: String,
}

impl EcbProvider {
    /// Build from per-provider configuration
    #[must_use]
    pub fn from_config(config: Option<&ProviderConfig>) -> Self {
        let base_url = config
            .and_then(|c| c.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn currency_pair(params: &Value) -> Option<(String, String)> {
        let from = params.get("from").and_then(Value::as_str)?;
        let to = params.get("to").and_then(Value::as_str)?;
        Some((from.to_uppercase(), to.to_uppercase()))
    }

    /// Parse the feed into `(as_of_date, currency -> EUR rate)`
    fn parse_feed(body: &str) -> Result<(String, HashMap<String, f64>), ProviderError> {
        let mut reader = Reader::from_str(body);
        reader.config_mut().trim_text(true);

        let mut rates = HashMap::new();
        let mut as_of = String::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(e) | Event::Empty(e)) if e.name().as_ref() == b"Cube" => {
                    let mut currency = None;
                    let mut rate = None;
                    for attr in e.attributes().flatten() {
                        let value = String::from_utf8_lossy(&attr.value).into_owned();
                        match attr.key.as_ref() {
                            b"time" => as_of = value,
                            b"currency" => currency = Some(value),
                            b"rate" => rate = value.parse::<f64>().ok(),
                            _ => {}
                        }
                    }
                    if let (Some(currency), Some(rate)) = (currency, rate) {
                        rates.insert(currency, rate);
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(ProviderError::Malformed(format!("ecb: XML parse: {e}")));
                }
            }
        }

        if rates.is_empty() {
            return Err(ProviderError::Malformed("ecb: feed carried no rates".into()));
        }
        rates.insert("EUR".to_string(), 1.0);
        Ok((as_of, rates))
    }

    fn cross_rate(
        rates: &HashMap<String, f64>,
        from: &str,
        to: &str,
    ) -> Result<f64, ProviderError> {
        let from_rate = rates
            .get(from)
            .ok_or_else(|| ProviderError::NotFound(format!("ecb: no rate for '{from}'")))?;
        let to_rate = rates
            .get(to)
            .ok_or_else(|| ProviderError::NotFound(format!("ecb: no rate for '{to}'")))?;
        Ok(to_rate / from_rate)
    }
}

#[async_trait]
impl Provider for EcbProvider {
    fn id(&self) -> &str {
        "ecb"
    }

    fn supports(&self, operation: Operation, params: &Value) -> bool {
        operation == Operation::FxRate && Self::currency_pair(params).is_some()
    }

    async fn fetch(
        &self,
        _operation: Operation,
        params: &Value,
        remaining: Duration,
    ) -> Result<RawResponse, ProviderError> {
        let url = format!("{}{FEED_PATH}", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(remaining)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Transient(format!("ecb: timeout: {e}"))
                } else {
                    ProviderError::Transient(format!("ecb: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status("ecb", status));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transient(format!("ecb: body read: {e}")))?;
        Ok(RawResponse {
            body,
            params: params.clone(),
        })
    }

    fn normalize(
        &self,
        operation: Operation,
        raw: &RawResponse,
    ) -> Result<Value, ProviderError> {
        if operation != Operation::FxRate {
            return Err(ProviderError::Malformed("ecb: unsupported operation".into()));
        }
        let (from, to) = Self::currency_pair(&raw.params)
            .ok_or_else(|| ProviderError::Malformed("ecb: missing currency pair".into()))?;

        let (as_of, rates) = Self::parse_feed(&raw.body)?;
        let rate = Self::cross_rate(&rates, &from, &to)?;

        Ok(json!({
            "from": from,
            "to": to,
            "rate": rate,
            "asOf": as_of,
        }))
    }
}
