//! Yahoo Finance chart API provider
//!
//! Serves quotes and daily price history from the public chart endpoint
//! (`/v8/finance/chart/{symbol}`). No credential is required; when one is
//! configured it is sent as a `crumb` query parameter and kept out of all
//! error text.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::aggregator::{Operation, Provider, ProviderError, RawResponse, classify_status};
use crate::config::ProviderConfig;
use crate::secrets::{Credential, redact};

const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";

/// Yahoo Finance chart API client
pub struct YahooProvider {
    client: reqwest::Client,
    base_url: String,
    credential: Option<Credential>,
}

impl YahooProvider {
    /// Build from per-provider configuration
    #[must_use]
    pub fn from_config(config: Option<&ProviderConfig>) -> Self {
        let base_url = config
            .and_then(|c| c.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            credential: config.and_then(|c| c.credential.clone()),
        }
    }

    fn symbol(params: &Value) -> Option<&str> {
        params.get("symbol").and_then(Value::as_str)
    }

    fn chart_result(raw: &RawResponse) -> Result<Value, ProviderError> {
        let body: Value = serde_json::from_str(&raw.body)
            .map_err(|e| ProviderError::Malformed(format!("yahoo: invalid JSON: {e}")))?;

        if let Some(err) = body.pointer("/chart/error") {
            if !err.is_null() {
                let code = err.get("code").and_then(Value::as_str).unwrap_or("error");
                if code == "Not Found" {
                    return Err(ProviderError::NotFound("yahoo: unknown symbol".into()));
                }
                return Err(ProviderError::Malformed(format!("yahoo: chart error {code}")));
            }
        }

        body.pointer("/chart/result/0")
            .cloned()
            .ok_or_else(|| ProviderError::Malformed("yahoo: missing chart result".into()))
    }

    fn normalize_quote(raw: &RawResponse) -> Result<Value, ProviderError> {
        let result = Self::chart_result(raw)?;
        let meta = result
            .get("meta")
            .ok_or_else(|| ProviderError::Malformed("yahoo: missing meta".into()))?;

        let price = meta
            .get("regularMarketPrice")
            .and_then(Value::as_f64)
            .ok_or_else(|| ProviderError::Malformed("yahoo: missing market price".into()))?;
        let symbol = meta
            .get("symbol")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Malformed("yahoo: missing symbol".into()))?;

        Ok(json!({
            "symbol": symbol,
            "price": price,
            "currency": meta.get("currency").and_then(Value::as_str).unwrap_or("USD"),
            "previousClose": meta.get("chartPreviousClose").and_then(Value::as_f64),
            "exchange": meta.get("exchangeName").and_then(Value::as_str),
            "marketTime": meta.get("regularMarketTime").and_then(Value::as_i64),
        }))
    }

    fn normalize_history(raw: &RawResponse) -> Result<Value, ProviderError> {
        let result = Self::chart_result(raw)?;
        let symbol = result
            .pointer("/meta/symbol")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Malformed("yahoo: missing symbol".into()))?
            .to_string();

        let timestamps = result
            .get("timestamp")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::Malformed("yahoo: missing timestamps".into()))?;
        let closes = result
            .pointer("/indicators/quote/0/close")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::Malformed("yahoo: missing closes".into()))?;

        let points: Vec<Value> = timestamps
            .iter()
            .zip(closes.iter())
            .filter_map(|(ts, close)| {
                let ts = ts.as_i64()?;
                let close = close.as_f64()?;
                Some(json!({"time": ts, "close": close}))
            })
            .collect();

        if points.is_empty() {
            return Err(ProviderError::Malformed("yahoo: empty history".into()));
        }

        Ok(json!({"symbol": symbol, "points": points}))
    }
}

#[async_trait]
impl Provider for YahooProvider {
    fn id(&self) -> &str {
        "yahoo"
    }

    fn supports(&self, operation: Operation, params: &Value) -> bool {
        matches!(operation, Operation::Quote | Operation::History)
            && Self::symbol(params).is_some()
    }

    async fn fetch(
        &self,
        operation: Operation,
        params: &Value,
        remaining: Duration,
    ) -> Result<RawResponse, ProviderError> {
        let symbol = Self::symbol(params)
            .ok_or_else(|| ProviderError::Malformed("yahoo: missing symbol param".into()))?;
        let range = match operation {
            Operation::Quote => "1d",
            Operation::History => params
                .get("range")
                .and_then(Value::as_str)
                .unwrap_or("1mo"),
            Operation::FxRate => {
                return Err(ProviderError::Malformed("yahoo: unsupported operation".into()));
            }
        };

        let url = format!("{}/v8/finance/chart/{symbol}", self.base_url);
        let mut request = self
            .client
            .get(&url)
            .query(&[("interval", "1d"), ("range", range)])
            .timeout(remaining);
        if let Some(cred) = &self.credential {
            request = request.query(&[("crumb", cred.expose())]);
        }

        let response = request.send().await.map_err(|e| {
            let msg = redact(&e.to_string(), self.credential.as_ref());
            if e.is_timeout() {
                ProviderError::Transient(format!("yahoo: timeout: {msg}"))
            } else {
                ProviderError::Transient(format!("yahoo: {msg}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status("yahoo", status));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transient(format!("yahoo: body read: {e}")))?;
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
        match operation {
            Operation::Quote => Self::normalize_quote(raw),
            Operation::History => Self::normalize_history(raw),
            Operation::FxRate => {
                Err(ProviderError::Malformed("yahoo: unsupported operation".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(body: String) -> RawResponse {
        RawResponse {
            body,
            params: Value::Null,
        }
    }

    fn chart_body() -> String {
        json!({
            "chart": {
                "result": [{
                    "meta": {
                        "symbol": "AAPL",
                        "currency": "USD",
                        "exchangeName": "NMS",
                        "regularMarketPrice": 187.23,
                        "chartPreviousClose": 185.10,
                        "regularMarketTime": 1_700_000_000
                    },
                    "timestamp": [1_699_900_000, 1_700_000_000],
                    "indicators": {"quote": [{"close": [185.1, 187.23]}]}
                }],
                "error": null
            }
        })
        .to_string()
    }

    #[test]
    fn supports_requires_symbol() {
        let p = YahooProvider::from_config(None);
        assert!(p.supports(Operation::Quote, &json!({"symbol": "AAPL"})));
        assert!(p.supports(Operation::History, &json!({"symbol": "AAPL"})));
        assert!(!p.supports(Operation::Quote, &json!({})));
        assert!(!p.supports(Operation::FxRate, &json!({"symbol": "AAPL"})));
    }

    #[test]
    fn quote_normalizes_to_canonical_shape() {
        let raw = raw(chart_body());
        let data = YahooProvider::normalize_quote(&raw).unwrap();
        assert_eq!(data["symbol"], "AAPL");
        assert_eq!(data["price"], 187.23);
        assert_eq!(data["currency"], "USD");
        assert_eq!(data["previousClose"], 185.10);
    }

    #[test]
    fn history_pairs_timestamps_with_closes() {
        let raw = raw(chart_body());
        let data = YahooProvider::normalize_history(&raw).unwrap();
        let points = data["points"].as_array().unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1]["close"], 187.23);
    }

    #[test]
    fn chart_error_not_found_maps_to_not_found() {
        let raw = raw(
            json!({
                "chart": {"result": null, "error": {"code": "Not Found", "description": "No data"}}
            })
            .to_string(),
        );
        assert!(matches!(
            YahooProvider::normalize_quote(&raw),
            Err(ProviderError::NotFound(_))
        ));
    }

    #[test]
    fn garbage_body_is_malformed() {
        let raw = raw("<html>rate limited</html>".to_string());
        assert!(matches!(
            YahooProvider::normalize_quote(&raw),
            Err(ProviderError::Malformed(_))
        ));
    }
}
