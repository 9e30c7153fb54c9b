//! Portfolio construction tool set
//!
//! Reference implementations: inverse-volatility weighting and
//! drift-to-target rebalance orders.

use serde_json::{Value, json};

use super::Spoke;
use crate::registry::ToolDescriptor;
use crate::{Error, Result};

/// Register the portfolio tools on a spoke
pub fn install(spoke: &Spoke) {
    spoke.register_tool(optimize_descriptor(), |args, _ctx| async move {
        optimize(&args)
    });
    spoke.register_tool(rebalance_descriptor(), |args, _ctx| async move {
        rebalance(&args)
    });
}

/// Inverse-volatility weights: weight_i = (1/vol_i) / sum(1/vol_j).
fn optimize(args: &Value) -> Result<Value> {
    let assets = args
        .get("assets")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::InvalidParams("'assets' must be an array".to_string()))?;
    if assets.is_empty() {
        return Err(Error::InvalidParams("'assets' must not be empty".to_string()));
    }

    let mut parsed: Vec<(String, f64)> = Vec::with_capacity(assets.len());
    for (i, asset) in assets.iter().enumerate() {
        let symbol = asset
            .get("symbol")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidParams(format!("assets[{i}].symbol is required")))?;
        let vol = asset
            .get("volatility")
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                Error::InvalidParams(format!("assets[{i}].volatility is required"))
            })?;
        if vol <= 0.0 {
            return Err(Error::InvalidParams(format!(
                "assets[{i}].volatility must be > 0"
            )));
        }
        parsed.push((symbol.to_uppercase(), vol));
    }

    let inverse_sum: f64 = parsed.iter().map(|(_, v)| 1.0 / v).sum();
    let weights: Vec<Value> = parsed
        .iter()
        .map(|(symbol, vol)| {
            json!({
                "symbol": symbol,
                "weight": (1.0 / vol) / inverse_sum,
                "volatility": vol,
            })
        })
        .collect();

    Ok(json!({"weights": weights, "method": "inverse_volatility"}))
}

/// Orders that move current holdings to target weights. Holdings absent
/// from the targets are sold in full; drift below `tolerance` is left alone.
fn rebalance(args: &Value) -> Result<Value> {
    let holdings = args
        .get("holdings")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::InvalidParams("'holdings' must be an array".to_string()))?;
    let targets = args
        .get("targets")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::InvalidParams("'targets' must be an object".to_string()))?;
    let tolerance = args
        .get("tolerance")
        .and_then(Value::as_f64)
        .unwrap_or(0.001);

    let target_sum: f64 = targets.values().filter_map(Value::as_f64).sum();
    if (target_sum - 1.0).abs() > 1e-6 {
        return Err(Error::InvalidParams(format!(
            "'targets' weights must sum to 1.0, got {target_sum}"
        )));
    }

    let mut values: Vec<(String, f64)> = Vec::with_capacity(holdings.len());
    for (i, holding) in holdings.iter().enumerate() {
        let symbol = holding
            .get("symbol")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidParams(format!("holdings[{i}].symbol is required")))?;
        let value = holding
            .get("value")
            .and_then(Value::as_f64)
            .ok_or_else(|| Error::InvalidParams(format!("holdings[{i}].value is required")))?;
        if value < 0.0 {
            return Err(Error::InvalidParams(format!(
                "holdings[{i}].value must be >= 0"
            )));
        }
        values.push((symbol.to_uppercase(), value));
    }

    let total: f64 = values.iter().map(|(_, v)| v).sum();
    if total <= 0.0 {
        return Err(Error::InvalidParams(
            "total portfolio value must be > 0".to_string(),
        ));
    }

    let mut orders = Vec::new();
    // Sells and trims for held symbols.
    for (symbol, value) in &values {
        let target_weight = targets.get(symbol).and_then(Value::as_f64).unwrap_or(0.0);
        let target_value = target_weight * total;
        let delta = target_value - value;
        if delta.abs() / total <= tolerance {
            continue;
        }
        orders.push(json!({
            "symbol": symbol,
            "action": if delta > 0.0 { "buy" } else { "sell" },
            "amount": delta.abs(),
        }));
    }
    // Buys for target symbols not currently held.
    for (symbol, weight) in targets {
        if values.iter().any(|(held, _)| held == symbol) {
            continue;
        }
        let target_value = weight.as_f64().unwrap_or(0.0) * total;
        if target_value / total > tolerance {
            orders.push(json!({
                "symbol": symbol,
                "action": "buy",
                "amount": target_value,
            }));
        }
    }

    Ok(json!({
        "orders": orders,
        "totalValue": total,
        "tolerance": tolerance,
    }))
}

fn optimize_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        qualified_name: "portfolio.optimize".to_string(),
        description: "Inverse-volatility portfolio weights".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "assets": {"type": "array", "items": {"type": "object"}}
            },
            "required": ["assets"]
        }),
        output_schema: None,
        owning_service: String::new(),
    }
}

fn rebalance_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        qualified_name: "portfolio.rebalance".to_string(),
        description: "Orders moving current holdings to target weights".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "holdings": {"type": "array", "items": {"type": "object"}},
                "targets": {"type": "object"},
                "tolerance": {"type": "number", "minimum": 0.0, "maximum": 0.5, "default": 0.001}
            },
            "required": ["holdings", "targets"]
        }),
        output_schema: None,
        owning_service: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_volatility_weights_sum_to_one() {
        let args = json!({
            "assets": [
                {"symbol": "aapl", "volatility": 0.2},
                {"symbol": "msft", "volatility": 0.1},
            ]
        });
        let out = optimize(&args).unwrap();
        let weights = out["weights"].as_array().unwrap();
        let total: f64 = weights
            .iter()
            .map(|w| w["weight"].as_f64().unwrap())
            .sum();
        assert!((total - 1.0).abs() < 1e-12);
        // Lower volatility earns the larger weight, 2:1 here.
        assert_eq!(weights[0]["symbol"], "AAPL");
        let aapl = weights[0]["weight"].as_f64().unwrap();
        let msft = weights[1]["weight"].as_f64().unwrap();
        assert!((msft / aapl - 2.0).abs() < 1e-9);
    }

    #[test]
    fn zero_volatility_rejected() {
        let args = json!({"assets": [{"symbol": "AAPL", "volatility": 0.0}]});
        assert!(matches!(optimize(&args), Err(Error::InvalidParams(_))));
    }

    #[test]
    fn rebalance_emits_buy_and_sell_orders() {
        let args = json!({
            "holdings": [
                {"symbol": "AAPL", "value": 8000.0},
                {"symbol": "MSFT", "value": 2000.0},
            ],
            "targets": {"AAPL": 0.5, "MSFT": 0.5}
        });
        let out = rebalance(&args).unwrap();
        let orders = out["orders"].as_array().unwrap();
        assert_eq!(orders.len(), 2);
        let aapl = orders.iter().find(|o| o["symbol"] == "AAPL").unwrap();
        assert_eq!(aapl["action"], "sell");
        assert_eq!(aapl["amount"], 3000.0);
        let msft = orders.iter().find(|o| o["symbol"] == "MSFT").unwrap();
        assert_eq!(msft["action"], "buy");
        assert_eq!(msft["amount"], 3000.0);
    }

    #[test]
    fn rebalance_buys_unheld_targets_and_sells_dropped_holdings() {
        let args = json!({
            "holdings": [{"symbol": "AAPL", "value": 10_000.0}],
            "targets": {"MSFT": 1.0}
        });
        let out = rebalance(&args).unwrap();
        let orders = out["orders"].as_array().unwrap();
        assert_eq!(orders.len(), 2);
        assert!(orders.iter().any(|o| o["symbol"] == "AAPL" && o["action"] == "sell"));
        assert!(orders.iter().any(|o| o["symbol"] == "MSFT" && o["action"] == "buy"));
    }

    #[test]
    fn drift_within_tolerance_is_left_alone() {
        let args = json!({
            "holdings": [
                {"symbol": "AAPL", "value": 5001.0},
                {"symbol": "MSFT", "value": 4999.0},
            ],
            "targets": {"AAPL": 0.5, "MSFT": 0.5},
            "tolerance": 0.01
        });
        let out = rebalance(&args).unwrap();
        assert!(out["orders"].as_array().unwrap().is_empty());
    }

    #[test]
    fn targets_must_sum_to_one() {
        let args = json!({
            "holdings": [{"symbol": "AAPL", "value": 100.0}],
            "targets": {"AAPL": 0.7}
        });
        assert!(matches!(rebalance(&args), Err(Error::InvalidParams(_))));
    }
}
