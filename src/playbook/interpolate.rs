//! Variable interpolation for playbook values
//!
//! Expands `${name}` placeholders inside strings, recursing through lists
//! and maps. Missing names are left literal so partially-bound steps stay
//! inspectable. Substitution is pure and idempotent for a stable variable
//! map.

use serde_json::Value;
use std::collections::HashMap;

/// Recursively substitute `${name}` placeholders in a value tree
pub fn substitute(value: &Value, variables: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_str(s, variables)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| substitute(v, variables)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Substitute placeholders inside a single string
pub fn substitute_str(text: &str, variables: &HashMap<String, Value>) -> String {
    if !text.contains("${") {
        return text.to_string();
    }

    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match variables.get(name) {
                    Some(value) => result.push_str(&render(value)),
                    // Unknown name stays literal
                    None => {
                        result.push_str("${");
                        result.push_str(name);
                        result.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            // Unterminated placeholder, keep as-is
            None => {
                result.push_str("${");
                rest = after;
            }
        }
    }
    result.push_str(rest);
    result
}

/// Render a value the way it should appear inside a string
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
