//! Playbook data model, parsing and structural validation
//!
//! Playbooks arrive as YAML or JSON documents. Parsing normalizes the
//! document (auto-assigned step ids, defaulted approval messages) and
//! validation enforces the structural invariants before any side effects
//! occur.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::core::error::{EngineError, Result};

use super::conditions::Condition;
use super::interpolate::substitute;

/// Supported step actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Do nothing, optionally after a delay
    Noop,
    /// Sleep for a number of seconds
    Wait,
    /// Perform an HTTP request
    HttpRequest,
    /// Run a shell command (hard-gated at engine construction)
    Shell,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Noop => write!(f, "noop"),
            Self::Wait => write!(f, "wait"),
            Self::HttpRequest => write!(f, "http_request"),
            Self::Shell => write!(f, "shell"),
        }
    }
}

/// Declared playbook parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Parameter name
    pub name: String,
    /// Whether the caller must supply a value
    #[serde(default)]
    pub required: bool,
    /// Human description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Playbook prerequisite check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrerequisiteSpec {
    /// Check type; only "non_empty" is currently defined
    #[serde(rename = "type")]
    pub kind: String,
    /// Parameter the check applies to
    pub param: String,
}

/// Output export mapping from step outputs into run variables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputMapping {
    /// Variable name to export as
    pub name: String,
    /// Output key to read, or "value" for a literal
    #[serde(default = "default_output_source")]
    pub from: String,
    /// Literal value when `from` is "value"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

fn default_output_source() -> String {
    "value".to_string()
}

/// Per-step retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Base delay in seconds
    pub base_delay: f64,
    /// Delay ceiling in seconds
    pub max_delay: f64,
    /// Exponential rather than fixed delay growth
    pub exponential_backoff: bool,
    /// Error categories eligible for retry; empty means all
    pub retry_on_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: 1.0,
            max_delay: 60.0,
            exponential_backoff: true,
            retry_on_errors: vec![
                "timeout".to_string(),
                "network".to_string(),
                "temporary".to_string(),
            ],
        }
    }
}

/// Rollback descriptor attached to a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackSpec {
    /// Inverse action to perform
    pub action: ActionKind,
    /// Action arguments
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Human description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Human approval gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalGate {
    /// Message shown to approvers
    #[serde(default)]
    pub message: String,
    /// Approvers who may satisfy the gate
    pub required_approvers: Vec<String>,
    /// Seconds before the gate expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Proceed automatically when the gate expires
    #[serde(default)]
    pub auto_approve_after_timeout: bool,
}

/// One unit of work inside a playbook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique id within the playbook; auto-assigned `step_N` when absent
    #[serde(default)]
    pub id: String,
    /// Display name, defaults to the id
    #[serde(default)]
    pub name: String,
    /// Action to perform
    pub action: ActionKind,
    /// Action-specific arguments
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Step ids that must be completed or skipped first
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Steps sharing a non-empty group may run concurrently in a wave
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    /// Gate conditions; any failure skips the step
    #[serde(default)]
    pub when: Vec<Condition>,
    /// External pre-execution checks, keyed by "type"
    #[serde(default)]
    pub validators: Vec<Map<String, Value>>,
    /// Post-execution predicates over params, variables and outputs
    #[serde(default)]
    pub validations: Vec<Condition>,
    /// Output exports into the run's variable map
    #[serde(default)]
    pub outputs: Vec<OutputMapping>,
    /// Retry policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// Rollback descriptors registered on completion
    #[serde(default, deserialize_with = "one_or_many")]
    pub rollback: Vec<RollbackSpec>,
    /// Human approval gate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_gate: Option<ApprovalGate>,
}

impl Step {
    /// Produce a copy with args, conditions, outputs and rollback args
    /// interpolated against the given variable map.
    pub fn interpolated(&self, variables: &HashMap<String, Value>) -> Step {
        let mut step = self.clone();
        step.args = substitute_map(&self.args, variables);
        step.when = self.when.iter().map(|c| c.interpolated(variables)).collect();
        step.validations = self
            .validations
            .iter()
            .map(|c| c.interpolated(variables))
            .collect();
        step.outputs = self
            .outputs
            .iter()
            .map(|o| OutputMapping {
                name: o.name.clone(),
                from: o.from.clone(),
                value: o.value.as_ref().map(|v| substitute(v, variables)),
            })
            .collect();
        step.rollback = self
            .rollback
            .iter()
            .map(|r| RollbackSpec {
                action: r.action,
                args: substitute_map(&r.args, variables),
                description: r.description.clone(),
            })
            .collect();
        step
    }
}

fn substitute_map(map: &Map<String, Value>, variables: &HashMap<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| (k.clone(), substitute(v, variables)))
        .collect()
}

/// Accept a single rollback object or a list of them
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<RollbackSpec>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(RollbackSpec),
        Many(Vec<RollbackSpec>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(spec) => vec![spec],
        OneOrMany::Many(specs) => specs,
    })
}

/// A declarative playbook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    /// Format version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    /// Playbook name
    #[serde(default)]
    pub name: String,
    /// Human description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Organizational category
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Declared parameters
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// Prerequisite checks evaluated before execution
    #[serde(default)]
    pub prerequisites: Vec<PrerequisiteSpec>,
    /// Keep running later waves after a step failure
    #[serde(default)]
    pub continue_on_failure: bool,
    /// Ordered step list
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Playbook {
    /// Parse a playbook from a YAML or JSON document and normalize it.
    /// JSON is attempted first, then YAML.
    pub fn parse(raw: &str) -> Result<Playbook> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(EngineError::playbook_validation("Empty playbook content"));
        }

        let mut playbook: Playbook = match serde_json::from_str(trimmed) {
            Ok(p) => p,
            Err(_) => serde_yaml::from_str(trimmed).map_err(|e| {
                EngineError::playbook_validation(format!("Failed to parse playbook content: {}", e))
            })?,
        };
        playbook.normalize();
        playbook.validate()?;
        Ok(playbook)
    }

    /// Fill in auto-assigned step ids, default names and gate messages
    pub fn normalize(&mut self) {
        for (idx, step) in self.steps.iter_mut().enumerate() {
            if step.id.is_empty() {
                step.id = format!("step_{}", idx + 1);
            }
            if step.name.is_empty() {
                step.name = step.id.clone();
            }
            if let Some(gate) = &mut step.approval_gate {
                if gate.message.is_empty() {
                    gate.message = format!("Approval required for step: {}", step.id);
                }
            }
        }
    }

    /// Enforce structural invariants
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(EngineError::playbook_validation("Playbook 'name' is required"));
        }
        if self.steps.is_empty() {
            return Err(EngineError::playbook_validation(
                "Playbook must include non-empty 'steps' list",
            ));
        }
        for param in &self.parameters {
            if param.name.is_empty() {
                return Err(EngineError::playbook_validation(
                    "Each parameter must have a 'name'",
                ));
            }
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(EngineError::playbook_validation(format!(
                    "Duplicate step id: {}",
                    step.id
                )));
            }
        }

        let ids: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(EngineError::playbook_validation(format!(
                        "Step {} depends on unknown step: {}",
                        step.id, dep
                    )));
                }
                if dep == &step.id {
                    return Err(EngineError::playbook_validation(format!(
                        "Step {} depends on itself",
                        step.id
                    )));
                }
            }
            if let Some(group) = &step.parallel_group {
                if group.is_empty() {
                    return Err(EngineError::playbook_validation(format!(
                        "Step {} parallel_group must be a non-empty string",
                        step.id
                    )));
                }
            }
            if let Some(gate) = &step.approval_gate {
                if gate.required_approvers.is_empty() {
                    return Err(EngineError::playbook_validation(format!(
                        "Step {} approval_gate must specify required_approvers",
                        step.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Check declared prerequisites against supplied parameters
    pub fn check_prerequisites(&self, parameters: &HashMap<String, Value>) -> Result<()> {
        for prereq in &self.prerequisites {
            if prereq.kind == "non_empty" {
                let present = parameters
                    .get(&prereq.param)
                    .map(|v| match v {
                        Value::String(s) => !s.is_empty(),
                        Value::Null => false,
                        _ => true,
                    })
                    .unwrap_or(false);
                if !present {
                    return Err(EngineError::playbook_validation(format!(
                        "Prerequisite failed: parameter '{}' must be non-empty",
                        prereq.param
                    )));
                }
            }
        }
        for param in &self.parameters {
            if param.required && !parameters.contains_key(&param.name) {
                return Err(EngineError::playbook_validation(format!(
                    "Required parameter missing: {}",
                    param.name
                )));
            }
        }
        Ok(())
    }

    /// Find a step by id
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BASIC: &str = r#"
name: Basic
steps:
  - id: s1
    action: noop
    args: {message: "hello"}
  - action: wait
    args: {seconds: 1}
    depends_on: [s1]
"#;

    #[test]
    fn test_parse_yaml_and_normalize() {
        let playbook = Playbook::parse(BASIC).unwrap();
        assert_eq!(playbook.name, "Basic");
        assert_eq!(playbook.steps[0].id, "s1");
        assert_eq!(playbook.steps[1].id, "step_2");
        assert_eq!(playbook.steps[1].name, "step_2");
        assert_eq!(playbook.steps[1].action, ActionKind::Wait);
    }

    #[test]
    fn test_parse_json() {
        let playbook = Playbook::parse(
            r#"{"name": "J", "steps": [{"id": "a", "action": "noop"}]}"#,
        )
        .unwrap();
        assert_eq!(playbook.steps[0].action, ActionKind::Noop);
    }

    #[test]
    fn test_duplicate_step_id_rejected() {
        let raw = r#"
name: Dup
steps:
  - {id: s1, action: noop}
  - {id: s1, action: noop}
"#;
        assert!(Playbook::parse(raw).is_err());
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let raw = r#"
name: Bad
steps:
  - {id: s1, action: noop, depends_on: [ghost]}
"#;
        let err = Playbook::parse(raw).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_rollback_single_or_list() {
        let raw = r#"
name: R
steps:
  - id: s1
    action: noop
    rollback: {action: noop, args: {message: "undo"}}
  - id: s2
    action: noop
    rollback:
      - {action: noop}
      - {action: wait, args: {seconds: 1}}
"#;
        let playbook = Playbook::parse(raw).unwrap();
        assert_eq!(playbook.steps[0].rollback.len(), 1);
        assert_eq!(playbook.steps[1].rollback.len(), 2);
    }

    #[test]
    fn test_approval_gate_requires_approvers() {
        let raw = r#"
name: A
steps:
  - id: s1
    action: noop
    approval_gate: {required_approvers: []}
"#;
        assert!(Playbook::parse(raw).is_err());
    }

    #[test]
    fn test_prerequisite_non_empty() {
        let raw = r#"
name: P
prerequisites:
  - {type: non_empty, param: service_name}
steps:
  - {id: s1, action: noop}
"#;
        let playbook = Playbook::parse(raw).unwrap();
        let mut params = HashMap::new();
        assert!(playbook.check_prerequisites(&params).is_err());
        params.insert("service_name".to_string(), json!(""));
        assert!(playbook.check_prerequisites(&params).is_err());
        params.insert("service_name".to_string(), json!("nginx"));
        assert!(playbook.check_prerequisites(&params).is_ok());
    }

    #[test]
    fn test_step_interpolation() {
        let raw = r#"
name: I
steps:
  - id: s1
    action: noop
    args: {message: "svc=${service}"}
    outputs:
      - {name: out, from: value, value: "${service}"}
"#;
        let playbook = Playbook::parse(raw).unwrap();
        let mut vars = HashMap::new();
        vars.insert("service".to_string(), json!("redis"));
        let step = playbook.steps[0].interpolated(&vars);
        assert_eq!(step.args["message"], json!("svc=redis"));
        assert_eq!(step.outputs[0].value, Some(json!("redis")));
    }
}
