//! Structured condition evaluation for step gating and validations
//!
//! Conditions are small predicate objects evaluated against a flat
//! context map after interpolation. Unknown condition types evaluate to
//! false so misconfigured predicates fail closed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::interpolate::{render, substitute};

/// A structured boolean predicate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    /// Condition type: equals/eq, not_equals/ne, contains, http_status,
    /// status_code, truthy, falsy, greater_than, less_than
    #[serde(rename = "type")]
    pub kind: String,
    /// Left-hand operand
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<Value>,
    /// Right-hand operand
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<Value>,
    /// Single operand for truthy/falsy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Condition {
    /// Interpolate operands against a variable map
    pub fn interpolated(&self, variables: &HashMap<String, Value>) -> Condition {
        Condition {
            kind: self.kind.clone(),
            left: self.left.as_ref().map(|v| substitute(v, variables)),
            right: self.right.as_ref().map(|v| substitute(v, variables)),
            value: self.value.as_ref().map(|v| substitute(v, variables)),
        }
    }
}

/// Evaluate one condition against a context map.
/// Operands are interpolated against the context first.
pub fn evaluate(condition: &Condition, context: &HashMap<String, Value>) -> bool {
    let cond = condition.interpolated(context);
    let left = cond.left.as_ref();
    let right = cond.right.as_ref();

    match cond.kind.as_str() {
        "equals" | "eq" => stringify(left) == stringify(right),
        "not_equals" | "ne" => stringify(left) != stringify(right),
        "contains" => stringify(left).contains(&stringify(right)),
        "http_status" | "status_code" => {
            let expected = right.and_then(as_i64).unwrap_or(200);
            match left.and_then(as_i64) {
                Some(actual) => actual == expected,
                None => false,
            }
        }
        "truthy" => coerce_bool(cond.value.as_ref()),
        "falsy" => !coerce_bool(cond.value.as_ref()),
        "greater_than" => match (left.and_then(as_f64), right.and_then(as_f64)) {
            (Some(l), Some(r)) => l > r,
            _ => false,
        },
        "less_than" => match (left.and_then(as_f64), right.and_then(as_f64)) {
            (Some(l), Some(r)) => l < r,
            _ => false,
        },
        // Unknown condition type defaults to false for safety
        _ => false,
    }
}

/// Evaluate a list of conditions; all must pass. Empty list passes.
pub fn evaluate_all(conditions: &[Condition], context: &HashMap<String, Value>) -> bool {
    conditions.iter().all(|c| evaluate(c, context))
}

fn stringify(value: Option<&Value>) -> String {
    value.map(render).unwrap_or_default()
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Coerce a value to boolean: booleans pass through, numbers are nonzero,
/// strings match "1", "true", "yes", "on" case-insensitively.
pub fn coerce_bool(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => {
            matches!(s.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(kind: &str, left: Value, right: Value) -> Condition {
        Condition {
            kind: kind.to_string(),
            left: Some(left),
            right: Some(right),
            value: None,
        }
    }

    #[test]
    fn test_equals_stringified() {
        let ctx = HashMap::new();
        assert!(evaluate(&cond("equals", json!("active"), json!("active")), &ctx));
        assert!(evaluate(&cond("eq", json!(5), json!("5")), &ctx));
        assert!(!evaluate(&cond("equals", json!("a"), json!("b")), &ctx));
        assert!(evaluate(&cond("ne", json!("a"), json!("b")), &ctx));
    }

    #[test]
    fn test_contains() {
        let ctx = HashMap::new();
        assert!(evaluate(&cond("contains", json!("hello world"), json!("world")), &ctx));
        assert!(!evaluate(&cond("contains", json!("hello"), json!("x")), &ctx));
    }

    #[test]
    fn test_http_status_default_200() {
        let ctx = HashMap::new();
        let mut c = cond("http_status", json!(200), Value::Null);
        c.right = None;
        assert!(evaluate(&c, &ctx));
        assert!(evaluate(&cond("status_code", json!("503"), json!(503)), &ctx));
        assert!(!evaluate(&cond("http_status", json!(500), json!(200)), &ctx));
    }

    #[test]
    fn test_truthy_falsy() {
        let ctx = HashMap::new();
        for v in [json!(true), json!(1), json!("yes"), json!("ON")] {
            let c = Condition {
                kind: "truthy".to_string(),
                left: None,
                right: None,
                value: Some(v),
            };
            assert!(evaluate(&c, &ctx));
        }
        let c = Condition {
            kind: "falsy".to_string(),
            left: None,
            right: None,
            value: Some(json!("no")),
        };
        assert!(evaluate(&c, &ctx));
    }

    #[test]
    fn test_numeric_comparisons() {
        let ctx = HashMap::new();
        assert!(evaluate(&cond("greater_than", json!(2.5), json!("1")), &ctx));
        assert!(evaluate(&cond("less_than", json!("1"), json!(2)), &ctx));
        assert!(!evaluate(&cond("greater_than", json!("abc"), json!(1)), &ctx));
    }

    #[test]
    fn test_unknown_type_fails_closed() {
        let ctx = HashMap::new();
        assert!(!evaluate(&cond("spaceship", json!(1), json!(1)), &ctx));
    }

    #[test]
    fn test_interpolated_operands() {
        let mut ctx = HashMap::new();
        ctx.insert("current_status".to_string(), json!("active"));
        let c = cond("not_equals", json!("${current_status}"), json!("active"));
        assert!(!evaluate(&c, &ctx));
    }
}
