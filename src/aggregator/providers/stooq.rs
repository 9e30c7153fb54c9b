//! Stooq CSV quote provider
//!
//! Keyless fallback source. The `/q/l/` endpoint returns one CSV line per
//! symbol: `Symbol,Date,Time,Open,High,Low,Close,Volume`. Unknown symbols
//! come back with `N/D` fields rather than an HTTP error.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::aggregator::{Operation, Provider, ProviderError, RawResponse, classify_status};
use crate::config::ProviderConfig;

const DEFAULT_BASE_URL: &str = "https://stooq.com";

/// Stooq CSV endpoint client
pub struct StooqProvider {
    client: reqwest::Client,
    base_url: String,
}

impl StooqProvider {
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

    /// Stooq uses exchange-suffixed lowercase symbols; bare US tickers get
    /// a `.us` suffix.
    fn stooq_symbol(symbol: &str) -> String {
        let lower = symbol.to_lowercase();
        if lower.contains('.') {
            lower
        } else {
            format!("{lower}.us")
        }
    }

    fn parse_csv_quote(raw: &RawResponse) -> Result<Value, ProviderError> {
        // Skip the header if present; take the first data line.
        let line = raw
            .body
            .lines()
            .find(|l| !l.trim().is_empty() && !l.starts_with("Symbol"))
            .ok_or_else(|| ProviderError::Malformed("stooq: empty body".into()))?;

        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 8 {
            return Err(ProviderError::Malformed(format!(
                "stooq: expected 8 CSV fields, got {}",
                fields.len()
            )));
        }

        if fields[6] == "N/D" {
            return Err(ProviderError::NotFound(format!(
                "stooq: no data for '{}'",
                fields[0]
            )));
        }

        let close: f64 = fields[6]
            .parse()
            .map_err(|e| ProviderError::Malformed(format!("stooq: bad close: {e}")))?;
        let open: Option<f64> = fields[3].parse().ok();
        let volume: Option<u64> = fields[7].trim().parse().ok();

        let symbol = fields[0]
            .trim_end_matches(".US")
            .trim_end_matches(".us")
            .to_uppercase();

        Ok(json!({
            "symbol": symbol,
            "price": close,
            "currency": "USD",
            "open": open,
            "date": fields[1],
            "volume": volume,
        }))
    }
}

#[async_trait]
impl Provider for StooqProvider {
    fn id(&self) -> &str {
        "stooq"
    }

    fn supports(&self, operation: Operation, params: &Value) -> bool {
        operation == Operation::Quote
            && params.get("symbol").and_then(Value::as_str).is_some()
    }

    async fn fetch(
        &self,
        _operation: Operation,
        params: &Value,
        remaining: Duration,
    ) -> Result<RawResponse, ProviderError> {
        let symbol = params
            .get("symbol")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Malformed("stooq: missing symbol param".into()))?;

        let url = format!("{}/q/l/", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("s", Self::stooq_symbol(symbol).as_str()),
                ("f", "sd2t2ohlcv"),
                ("h", ""),
                ("e", "csv"),
            ])
            .timeout(remaining)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Transient(format!("stooq: timeout: {e}"))
                } else {
                    ProviderError::Transient(format!("stooq: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status("stooq", status));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transient(format!("stooq: body read: {e}")))?;
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
            Operation::Quote => Self::parse_csv_quote(raw),
            _ => Err(ProviderError::Malformed("stooq: unsupported operation".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(body: &str) -> RawResponse {
        RawResponse {
            body: body.to_string(),
            params: Value::Null,
        }
    }

    #[test]
    fn symbol_suffixing() {
        assert_eq!(StooqProvider::stooq_symbol("AAPL"), "aapl.us");
        assert_eq!(StooqProvider::stooq_symbol("SAP.DE"), "sap.de");
    }

    #[test]
    fn csv_quote_parses() {
        let raw = raw(
            "Symbol,Date,Time,Open,High,Low,Close,Volume\n\
             AAPL.US,2024-03-01,22:00:07,179.55,180.53,177.38,179.66,73488997\n",
        );
        let data = StooqProvider::parse_csv_quote(&raw).unwrap();
        assert_eq!(data["symbol"], "AAPL");
        assert_eq!(data["price"], 179.66);
        assert_eq!(data["volume"], 73_488_997u64);
        assert_eq!(data["date"], "2024-03-01");
    }

    #[test]
    fn nd_fields_are_not_found() {
        let raw = raw("NOPE.US,N/D,N/D,N/D,N/D,N/D,N/D,N/D\n");
        assert!(matches!(
            StooqProvider::parse_csv_quote(&raw),
            Err(ProviderError::NotFound(_))
        ));
    }

    #[test]
    fn short_line_is_malformed() {
        let raw = raw("AAPL.US,2024-03-01\n");
        assert!(matches!(
            StooqProvider::parse_csv_quote(&raw),
            Err(ProviderError::Malformed(_))
        ));
    }

    #[test]
    fn supports_only_quotes_with_symbol() {
        let p = StooqProvider::from_config(None);
        assert!(p.supports(Operation::Quote, &json!({"symbol": "AAPL"})));
        assert!(!p.supports(Operation::History, &json!({"symbol": "AAPL"})));
        assert!(!p.supports(Operation::Quote, &json!({})));
    }
}
