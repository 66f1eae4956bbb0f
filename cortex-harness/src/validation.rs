//! Structural tool-input validation.
//!
//! A validation pass runs before any tool call reaches its adapter. It
//! intentionally avoids semantic parsing (no bash/SQL validation): the goal
//! is to stop obviously malformed calls (missing keys, empty strings, wrong
//! primitive types) across all tools in a domain-agnostic way.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::provider::ToolSpec;

/// Build a `{tool_name: input_schema}` map from the declared tool list.
///
/// Only object-shaped schemas are preserved; anything else opts out of
/// validation rather than failing it.
#[must_use]
pub fn build_tool_schema_map(tool_defs: &[ToolSpec]) -> BTreeMap<String, Value> {
    let mut schema_map = BTreeMap::new();
    for tool in tool_defs {
        let name = tool.name.trim();
        if !name.is_empty() && tool.input_schema.is_object() {
            schema_map.insert(name.to_string(), tool.input_schema.clone());
        }
    }
    schema_map
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Validate a tool input against its declared schema.
///
/// Returns `None` when the input is acceptable, otherwise the error text to
/// hand back to the model. The validator honors exactly `type`,
/// `properties`, `required`, and `additionalProperties`.
#[must_use]
pub fn validate_tool_input(
    tool_name: &str,
    tool_input: &Value,
    schema: Option<&Value>,
) -> Option<String> {
    let schema = schema?.as_object()?;

    if schema.get("type").and_then(Value::as_str) == Some("object") && !tool_input.is_object() {
        return Some(format!(
            "{tool_name} expects object input, got {}",
            type_name(tool_input)
        ));
    }
    let Some(input) = tool_input.as_object() else {
        return Some(format!(
            "{tool_name} expects object input, got {}",
            type_name(tool_input)
        ));
    };

    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|key| !input.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        return Some(format!("{tool_name} missing required keys: {missing:?}"));
    }

    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
        let mut unknown: Vec<&String> = input
            .keys()
            .filter(|key| !properties.contains_key(*key))
            .collect();
        if !unknown.is_empty() {
            unknown.sort();
            return Some(format!("{tool_name} input had unknown keys: {unknown:?}"));
        }
    }

    for (key, spec) in &properties {
        let Some(value) = input.get(key) else {
            continue;
        };
        let expected = spec.get("type").and_then(Value::as_str);
        match expected {
            Some("string") => {
                let ok = value.as_str().is_some_and(|text| !text.trim().is_empty());
                if !ok {
                    return Some(format!(
                        "{tool_name} requires non-empty string {key}, got {value}"
                    ));
                }
            }
            Some("object") => {
                if !value.is_object() {
                    return Some(format!("{tool_name} requires object {key}, got {value}"));
                }
            }
            Some("array") => {
                if !value.is_array() {
                    return Some(format!("{tool_name} requires array {key}, got {value}"));
                }
            }
            _ => {}
        }
    }

    None
}
