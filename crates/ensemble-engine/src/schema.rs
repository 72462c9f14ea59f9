//! Argument validation against a tool's declared JSON schema.
//!
//! Covers the subset tools in this workspace declare: `type` (single or
//! list), `required`, `properties`, `additionalProperties: false`, `enum`,
//! `items`, `minimum`/`maximum` and `minLength`/`maxLength`. Unknown keywords
//! are ignored.

use serde_json::{Map, Value};

/// Validate `args` against `schema`. On failure returns every violation,
/// each prefixed with the JSON path of the offending value.
pub fn validate_arguments(schema: &Value, args: &Value) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    validate_node(schema, args, "$", &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_node(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        // `true`, `{}` or anything non-object accepts all values
        return;
    };

    if let Some(expected) = schema.get("type") {
        if !type_matches(expected, value) {
            errors.push(format!(
                "{path}: expected {}, got {}",
                describe_type(expected),
                json_type(value)
            ));
            return;
        }
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(value) {
            errors.push(format!("{path}: value {value} is not one of {}", Value::Array(allowed.clone())));
        }
    }

    match value {
        Value::Object(map) => validate_object(schema, map, path, errors),
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    validate_node(item_schema, item, &format!("{path}[{i}]"), errors);
                }
            }
        }
        Value::String(s) => {
            let len = s.chars().count() as u64;
            if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                if len < min {
                    errors.push(format!("{path}: length {len} is below minLength {min}"));
                }
            }
            if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
                if len > max {
                    errors.push(format!("{path}: length {len} exceeds maxLength {max}"));
                }
            }
        }
        Value::Number(n) => {
            if let Some(x) = n.as_f64() {
                if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                    if x < min {
                        errors.push(format!("{path}: {n} is below minimum {min}"));
                    }
                }
                if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                    if x > max {
                        errors.push(format!("{path}: {n} exceeds maximum {max}"));
                    }
                }
            }
        }
        Value::Bool(_) | Value::Null => {}
    }
}

fn validate_object(
    schema: &Map<String, Value>,
    map: &Map<String, Value>,
    path: &str,
    errors: &mut Vec<String>,
) {
    if let Some(Value::Array(required)) = schema.get("required") {
        for key in required.iter().filter_map(Value::as_str) {
            if !map.contains_key(key) {
                errors.push(format!("{path}: missing required property '{key}'"));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    let closed = matches!(schema.get("additionalProperties"), Some(Value::Bool(false)));

    for (key, child) in map {
        match properties.and_then(|p| p.get(key)) {
            Some(child_schema) => validate_node(child_schema, child, &format!("{path}.{key}"), errors),
            None if closed => errors.push(format!("{path}: unexpected property '{key}'")),
            None => {}
        }
    }
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(t) => single_type_matches(t, value),
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .any(|t| single_type_matches(t, value)),
        _ => true,
    }
}

fn single_type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => match value {
            Value::Number(n) => n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0),
            _ => false,
        },
        _ => true,
    }
}

fn describe_type(expected: &Value) -> String {
    match expected {
        Value::String(t) => t.clone(),
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" | "),
        other => other.to_string(),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Object(_) => "object",
        Value::Array(_) => "array",
        Value::String(_) => "string",
        Value::Bool(_) => "boolean",
        Value::Null => "null",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "minLength": 1},
                "limit": {"type": "integer", "minimum": 1, "maximum": 50},
                "mode": {"type": "string", "enum": ["web", "news"]},
                "tags": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    #[test]
    fn valid_arguments_pass() {
        let args = json!({"query": "tokio", "limit": 10, "mode": "news", "tags": ["rust"]});
        assert!(validate_arguments(&search_schema(), &args).is_ok());
    }

    #[test]
    fn missing_required_property() {
        let errors = validate_arguments(&search_schema(), &json!({"limit": 5})).unwrap_err();
        assert_eq!(errors, vec!["$: missing required property 'query'"]);
    }

    #[test]
    fn wrong_type_reports_path() {
        let errors = validate_arguments(&search_schema(), &json!({"query": 42})).unwrap_err();
        assert_eq!(errors, vec!["$.query: expected string, got integer"]);
    }

    #[test]
    fn collects_every_violation() {
        let args = json!({"query": "", "limit": 99, "mode": "images", "extra": true});
        let errors = validate_arguments(&search_schema(), &args).unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("minLength")));
        assert!(errors.iter().any(|e| e.contains("maximum 50")));
        assert!(errors.iter().any(|e| e.contains("is not one of")));
        assert!(errors.iter().any(|e| e.contains("unexpected property 'extra'")));
    }

    #[test]
    fn array_items_are_checked() {
        let errors =
            validate_arguments(&search_schema(), &json!({"query": "q", "tags": ["ok", 3]})).unwrap_err();
        assert_eq!(errors, vec!["$.tags[1]: expected string, got integer"]);
    }

    #[test]
    fn type_lists_and_integers() {
        let schema = json!({"type": ["integer", "null"]});
        assert!(validate_arguments(&schema, &json!(3)).is_ok());
        assert!(validate_arguments(&schema, &json!(3.0)).is_ok());
        assert!(validate_arguments(&schema, &Value::Null).is_ok());
        assert!(validate_arguments(&schema, &json!(3.5)).is_err());
    }

    #[test]
    fn arguments_must_be_an_object_when_declared() {
        let errors = validate_arguments(&search_schema(), &json!("tokio")).unwrap_err();
        assert_eq!(errors, vec!["$: expected object, got string"]);
    }

    #[test]
    fn open_schema_accepts_anything() {
        assert!(validate_arguments(&json!({}), &json!({"anything": [1, 2]})).is_ok());
        assert!(validate_arguments(&json!(true), &json!(null)).is_ok());
    }
}
