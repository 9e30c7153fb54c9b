//! JSON Schema validation for tool arguments
//!
//! Validates caller-supplied arguments against a tool's declared
//! `inputSchema` before the handler runs, producing error messages that
//! tell the caller exactly what to fix.
//!
//! # Validation steps (in order)
//!
//! 1. **Required parameters** – every name under `required:` must be
//!    present and non-null.
//! 2. **Unknown parameters** – keys outside `properties:` are rejected
//!    only when the schema declares `additionalProperties: false`.
//! 3. **Type validation with coercion** – values are checked against the
//!    declared type; `"123"` → `123` and `"true"` → `true` are applied
//!    automatically.
//! 4. **Enum values** – after coercion, the value must be one of the
//!    declared options.
//! 5. **Constraints** – `minimum` / `maximum`, `minLength` / `maxLength`,
//!    and element types for arrays (`items.type`).

use std::fmt::Write as _;

use serde_json::Value;

/// A single validation violation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationViolation {
    /// Parameter name (empty for top-level issues)
    pub param: String,
    /// Human-readable description of the problem
    pub message: String,
}

impl ValidationViolation {
    fn new(param: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            message: message.into(),
        }
    }
}

/// The result of validating arguments against a schema
#[derive(Debug, Clone)]
pub struct SchemaValidationResult {
    /// All violations found; empty means the arguments are valid
    pub violations: Vec<ValidationViolation>,
    /// Arguments after safe type coercions
    pub coerced: Value,
}

impl SchemaValidationResult {
    /// Returns `true` if there are no violations
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// Format all violations into one actionable error string
    #[must_use]
    pub fn format_error(&self) -> String {
        let mut out = String::from("argument validation failed: ");
        for (i, v) in self.violations.iter().enumerate() {
            if i > 0 {
                out.push_str("; ");
            }
            if v.param.is_empty() {
                let _ = write!(out, "{}", v.message);
            } else {
                let _ = write!(out, "'{}' {}", v.param, v.message);
            }
        }
        out
    }
}

/// Validate `arguments` against `input_schema`.
///
/// A null or empty schema accepts any object. On success, use `coerced`
/// for the handler call.
#[must_use]
pub fn validate_arguments(arguments: &Value, input_schema: &Value) -> SchemaValidationResult {
    if input_schema.is_null() || input_schema == &Value::Object(serde_json::Map::new()) {
        return SchemaValidationResult {
            violations: Vec::new(),
            coerced: arguments.clone(),
        };
    }

    let Some(properties) = input_schema.get("properties").and_then(Value::as_object) else {
        return SchemaValidationResult {
            violations: Vec::new(),
            coerced: arguments.clone(),
        };
    };

    let required: Vec<&str> = input_schema
        .get("required")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let arg_map = match arguments {
        Value::Object(m) => m.clone(),
        Value::Null => serde_json::Map::new(),
        _ => {
            return SchemaValidationResult {
                violations: vec![ValidationViolation::new("", "arguments must be a JSON object")],
                coerced: arguments.clone(),
            };
        }
    };

    let mut violations = Vec::new();
    let mut coerced_map = serde_json::Map::new();

    // Step 1 – required parameters.
    for name in &required {
        match arg_map.get(*name) {
            None => violations.push(ValidationViolation::new(*name, "is required")),
            Some(Value::Null) => {
                violations.push(ValidationViolation::new(*name, "must not be null"));
            }
            _ => {}
        }
    }

    // Step 2 – unknown parameters, only when explicitly forbidden.
    let additional_forbidden =
        input_schema.get("additionalProperties") == Some(&Value::Bool(false));
    for key in arg_map.keys() {
        if !properties.contains_key(key.as_str()) {
            if additional_forbidden {
                let known: Vec<&str> = properties.keys().map(String::as_str).collect();
                violations.push(ValidationViolation::new(
                    key,
                    format!("is unknown — valid parameters are: {}", known.join(", ")),
                ));
            } else {
                coerced_map.insert(key.clone(), arg_map[key].clone());
            }
        }
    }

    if !violations.is_empty() {
        return SchemaValidationResult {
            violations,
            coerced: arguments.clone(),
        };
    }

    // Steps 3-5 – per-property validation.
    for (name, prop_schema) in properties {
        let Some(raw_value) = arg_map.get(name.as_str()) else {
            // Optional parameter not provided: apply a declared default.
            if let Some(default) = prop_schema.get("default") {
                coerced_map.insert(name.clone(), default.clone());
            }
            continue;
        };
        if raw_value.is_null() {
            continue;
        }

        let (coerced_value, prop_violations) = validate_property(name, raw_value, prop_schema);
        violations.extend(prop_violations);
        coerced_map.insert(name.clone(), coerced_value);
    }

    let coerced = if violations.is_empty() {
        Value::Object(coerced_map)
    } else {
        arguments.clone()
    };

    SchemaValidationResult {
        violations,
        coerced,
    }
}

fn validate_property(
    name: &str,
    value: &Value,
    prop_schema: &Value,
) -> (Value, Vec<ValidationViolation>) {
    let declared_type = prop_schema.get("type").and_then(Value::as_str);
    let mut violations = Vec::new();

    let coerced = if let Some(ty) = declared_type {
        match try_coerce(value, ty) {
            Ok(v) => v,
            Err(msg) => {
                violations.push(ValidationViolation::new(name, msg));
                value.clone()
            }
        }
    } else {
        value.clone()
    };

    if violations.is_empty() {
        // Enum check (after coercion).
        if let Some(enum_values) = prop_schema.get("enum").and_then(Value::as_array) {
            if !enum_values.contains(&coerced) {
                let options: Vec<String> =
                    enum_values.iter().map(display_value).collect();
                violations.push(ValidationViolation::new(
                    name,
                    format!("must be one of: {}", options.join(", ")),
                ));
            }
        }

        // Numeric range.
        if let Some(num) = coerced.as_f64() {
            if let Some(min) = prop_schema.get("minimum").and_then(Value::as_f64) {
                if num < min {
                    violations.push(ValidationViolation::new(
                        name,
                        format!("must be >= {min}"),
                    ));
                }
            }
            if let Some(max) = prop_schema.get("maximum").and_then(Value::as_f64) {
                if num > max {
                    violations.push(ValidationViolation::new(
                        name,
                        format!("must be <= {max}"),
                    ));
                }
            }
        }

        // String length.
        if let Some(s) = coerced.as_str() {
            if let Some(min) = prop_schema.get("minLength").and_then(Value::as_u64) {
                if (s.len() as u64) < min {
                    violations.push(ValidationViolation::new(
                        name,
                        format!("must be at least {min} characters"),
                    ));
                }
            }
            if let Some(max) = prop_schema.get("maxLength").and_then(Value::as_u64) {
                if (s.len() as u64) > max {
                    violations.push(ValidationViolation::new(
                        name,
                        format!("must be at most {max} characters"),
                    ));
                }
            }
        }

        // Array element types.
        if let (Some(items), Some(arr)) = (
            prop_schema.get("items").and_then(|i| i.get("type")).and_then(Value::as_str),
            coerced.as_array(),
        ) {
            for (i, item) in arr.iter().enumerate() {
                if !type_matches(item, items) {
                    violations.push(ValidationViolation::new(
                        name,
                        format!("element {i} must be of type {items}"),
                    ));
                    break;
                }
            }
        }
    }

    (coerced, violations)
}

fn try_coerce(value: &Value, ty: &str) -> Result<Value, String> {
    if type_matches(value, ty) {
        return Ok(value.clone());
    }

    // Safe string coercions.
    if let Some(s) = value.as_str() {
        match ty {
            "integer" => {
                if let Ok(n) = s.parse::<i64>() {
                    return Ok(Value::from(n));
                }
            }
            "number" => {
                if let Ok(n) = s.parse::<f64>() {
                    if let Some(v) = serde_json::Number::from_f64(n) {
                        return Ok(Value::Number(v));
                    }
                }
            }
            "boolean" => match s {
                "true" => return Ok(Value::Bool(true)),
                "false" => return Ok(Value::Bool(false)),
                _ => {}
            },
            _ => {}
        }
    }

    Err(format!("must be of type {ty}, got {}", type_name(value)))
}

fn type_matches(value: &Value, ty: &str) -> bool {
    match ty {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn display_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn quote_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "symbol": {"type": "string", "minLength": 1, "maxLength": 12},
                "range": {"type": "string", "enum": ["1mo", "3mo", "6mo", "1y"], "default": "1mo"},
                "limit": {"type": "integer", "minimum": 1, "maximum": 500}
            },
            "required": ["symbol"]
        })
    }

    #[test]
    fn valid_arguments_pass_with_defaults_applied() {
        let result = validate_arguments(&json!({"symbol": "AAPL"}), &quote_schema());
        assert!(result.is_valid());
        assert_eq!(result.coerced["symbol"], "AAPL");
        assert_eq!(result.coerced["range"], "1mo", "default must be applied");
    }

    #[test]
    fn missing_required_is_rejected() {
        let result = validate_arguments(&json!({}), &quote_schema());
        assert!(!result.is_valid());
        assert!(result.format_error().contains("'symbol' is required"));
    }

    #[test]
    fn null_required_is_rejected() {
        let result = validate_arguments(&json!({"symbol": null}), &quote_schema());
        assert!(!result.is_valid());
    }

    #[test]
    fn wrong_enum_value_is_rejected() {
        let result =
            validate_arguments(&json!({"symbol": "AAPL", "range": "2y"}), &quote_schema());
        assert!(!result.is_valid());
        assert!(result.format_error().contains("must be one of"));
    }

    #[test]
    fn numeric_range_is_enforced() {
        let result =
            validate_arguments(&json!({"symbol": "AAPL", "limit": 0}), &quote_schema());
        assert!(!result.is_valid());
        assert!(result.format_error().contains(">= 1"));

        let result =
            validate_arguments(&json!({"symbol": "AAPL", "limit": 501}), &quote_schema());
        assert!(!result.is_valid());
    }

    #[test]
    fn string_numbers_coerce_for_numeric_types() {
        let result =
            validate_arguments(&json!({"symbol": "AAPL", "limit": "25"}), &quote_schema());
        assert!(result.is_valid());
        assert_eq!(result.coerced["limit"], 25);
    }

    #[test]
    fn additional_properties_accepted_unless_forbidden() {
        // Default: extras pass through.
        let result =
            validate_arguments(&json!({"symbol": "AAPL", "extra": 1}), &quote_schema());
        assert!(result.is_valid());
        assert_eq!(result.coerced["extra"], 1);

        // Forbidden: extras are violations.
        let mut schema = quote_schema();
        schema["additionalProperties"] = json!(false);
        let result = validate_arguments(&json!({"symbol": "AAPL", "extra": 1}), &schema);
        assert!(!result.is_valid());
        assert!(result.format_error().contains("unknown"));
    }

    #[test]
    fn array_item_types_are_checked() {
        let schema = json!({
            "type": "object",
            "properties": {
                "returns": {"type": "array", "items": {"type": "number"}}
            },
            "required": ["returns"]
        });
        let ok = validate_arguments(&json!({"returns": [0.01, -0.02]}), &schema);
        assert!(ok.is_valid());

        let bad = validate_arguments(&json!({"returns": [0.01, "x"]}), &schema);
        assert!(!bad.is_valid());
        assert!(bad.format_error().contains("element 1"));
    }

    #[test]
    fn empty_schema_accepts_anything() {
        let result = validate_arguments(&json!({"whatever": true}), &Value::Null);
        assert!(result.is_valid());
    }

    #[test]
    fn non_object_arguments_rejected() {
        let result = validate_arguments(&json!([1, 2]), &quote_schema());
        assert!(!result.is_valid());
    }
}
