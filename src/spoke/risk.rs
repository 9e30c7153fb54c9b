//! Risk analysis tool set
//!
//! Reference implementations: historical-simulation VaR and annualized
//! volatility over caller-supplied return series.

use serde_json::{Value, json};

use super::Spoke;
use crate::registry::ToolDescriptor;
use crate::{Error, Result};

/// Register the risk tools on a spoke
pub fn install(spoke: &Spoke) {
    spoke.register_tool(value_at_risk_descriptor(), |args, _ctx| async move {
        value_at_risk(&args)
    });
    spoke.register_tool(volatility_descriptor(), |args, _ctx| async move {
        volatility(&args)
    });
}

fn returns_from(args: &Value) -> Result<Vec<f64>> {
    let returns: Vec<f64> = args
        .get("returns")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default();
    if returns.is_empty() {
        return Err(Error::InvalidParams(
            "'returns' must be a non-empty array of numbers".to_string(),
        ));
    }
    Ok(returns)
}

/// Historical-simulation VaR: the loss at the `(1 - confidence)` quantile
/// of the observed return distribution, scaled to the portfolio value.
fn value_at_risk(args: &Value) -> Result<Value> {
    let mut returns = returns_from(args)?;
    let confidence = args
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.95);
    let portfolio_value = args
        .get("portfolio_value")
        .and_then(Value::as_f64)
        .unwrap_or(1.0);

    returns.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let index = (((1.0 - confidence) * returns.len() as f64).floor() as usize)
        .min(returns.len() - 1);
    let quantile = returns[index];
    let var = (-quantile * portfolio_value).max(0.0);

    Ok(json!({
        "valueAtRisk": var,
        "confidence": confidence,
        "portfolioValue": portfolio_value,
        "observations": returns.len(),
        "quantileReturn": quantile,
    }))
}

/// Sample standard deviation of returns, annualized by `periods_per_year`.
fn volatility(args: &Value) -> Result<Value> {
    let returns = returns_from(args)?;
    if returns.len() < 2 {
        return Err(Error::InvalidParams(
            "'returns' needs at least 2 observations".to_string(),
        ));
    }
    let periods = args
        .get("periods_per_year")
        .and_then(Value::as_f64)
        .unwrap_or(252.0);

    #[allow(clippy::cast_precision_loss)]
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let stddev = variance.sqrt();

    Ok(json!({
        "volatility": stddev,
        "annualizedVolatility": stddev * periods.sqrt(),
        "periodsPerYear": periods,
        "observations": returns.len(),
    }))
}

fn value_at_risk_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        qualified_name: "risk.value_at_risk".to_string(),
        description: "Historical-simulation value at risk over a return series".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "returns": {"type": "array", "items": {"type": "number"}},
                "confidence": {"type": "number", "minimum": 0.5, "maximum": 0.999, "default": 0.95},
                "portfolio_value": {"type": "number", "minimum": 0.0, "default": 1.0}
            },
            "required": ["returns"]
        }),
        output_schema: None,
        owning_service: String::new(),
    }
}

fn volatility_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        qualified_name: "risk.volatility".to_string(),
        description: "Annualized volatility of a return series".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "returns": {"type": "array", "items": {"type": "number"}},
                "periods_per_year": {"type": "integer", "minimum": 1, "maximum": 366, "default": 252}
            },
            "required": ["returns"]
        }),
        output_schema: None,
        owning_service: String::new(),
    }
}
