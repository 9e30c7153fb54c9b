//! Market data tool set
//!
//! All three tools are served through the multi-source aggregator; the
//! handlers only normalize parameters (symbols and currencies uppercase so
//! equivalent requests share a cache fingerprint) and forward.

use std::sync::Arc;

use serde_json::{Value, json};

use super::Spoke;
use crate::aggregator::{Aggregator, Operation};
use crate::registry::ToolDescriptor;
use crate::{Error, Result};

/// Register the market tools on a spoke
pub fn install(spoke: &Spoke, aggregator: Arc<Aggregator>) {
    let agg = Arc::clone(&aggregator);
    spoke.register_tool(stock_quote_descriptor(), move |args, ctx| {
        let agg = Arc::clone(&agg);
        async move {
            let symbol = required_upper(&args, "symbol")?;
            agg.request(Operation::Quote, json!({"symbol": symbol}), &ctx)
                .await
        }
    });

    let agg = Arc::clone(&aggregator);
    spoke.register_tool(price_history_descriptor(), move |args, ctx| {
        let agg = Arc::clone(&agg);
        async move {
            let symbol = required_upper(&args, "symbol")?;
            let range = args
                .get("range")
                .and_then(Value::as_str)
                .unwrap_or("1mo")
                .to_string();
            agg.request(
                Operation::History,
                json!({"symbol": symbol, "range": range}),
                &ctx,
            )
            .await
        }
    });

    let agg = aggregator;
    spoke.register_tool(exchange_rate_descriptor(), move |args, ctx| {
        let agg = Arc::clone(&agg);
        async move {
            let from = required_upper(&args, "from")?;
            let to = required_upper(&args, "to")?;
            agg.request(Operation::FxRate, json!({"from": from, "to": to}), &ctx)
                .await
        }
    });
}

fn required_upper(args: &Value, key: &str) -> Result<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_uppercase)
        .ok_or_else(|| Error::InvalidParams(format!("'{key}' is required")))
}

fn stock_quote_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        qualified_name: "market.stock_quote".to_string(),
        description: "Latest quote for a stock symbol, with provider fallback".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "symbol": {"type": "string", "minLength": 1, "maxLength": 12}
            },
            "required": ["symbol"]
        }),
        output_schema: Some(quote_output_schema()),
        owning_service: String::new(),
    }
}

fn price_history_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        qualified_name: "market.price_history".to_string(),
        description: "Daily closing prices for a symbol over a range".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "symbol": {"type": "string", "minLength": 1, "maxLength": 12},
                "range": {
                    "type": "string",
                    "enum": ["5d", "1mo", "3mo", "6mo", "1y"],
                    "default": "1mo"
                }
            },
            "required": ["symbol"]
        }),
        output_schema: None,
        owning_service: String::new(),
    }
}

fn exchange_rate_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        qualified_name: "market.exchange_rate".to_string(),
        description: "Exchange rate between two currencies (ECB reference rates)".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "from": {"type": "string", "minLength": 3, "maxLength": 3},
                "to": {"type": "string", "minLength": 3, "maxLength": 3}
            },
            "required": ["from", "to"]
        }),
        output_schema: None,
        owning_service: String::new(),
    }
}

fn quote_output_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "data": {
                "type": "object",
                "properties": {
                    "symbol": {"type": "string"},
                    "price": {"type": "number"},
                    "currency": {"type": "string"}
                }
            },
            "metadata": {
                "type": "object",
                "properties": {
                    "source": {"type": "string"},
                    "fetchedAt": {"type": "string"},
                    "cacheHit": {"type": "boolean"},
                    "fallbackChain": {"type": "array", "items": {"type": "string"}}
                }
            }
        }
    })
}
