//! Rule linting
//!
//! Structural and semantic checks over rules before they are stored or
//! activated. Results carry a level (error, warning, info) and a
//! category so hosts can decide what blocks a write and what is merely
//! surfaced.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::model::{ConditionOperator, Rule, RuleActionType};

/// Severity of a validation finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    /// Blocks the operation
    Error,
    /// Surfaced but non-blocking
    Warning,
    /// Informational only
    Info,
}

/// What aspect of the rule a finding concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCategory {
    /// Malformed structure
    Syntax,
    /// Contradictory or ineffective logic
    Logic,
    /// Evaluation cost concerns
    Performance,
    /// Potentially unsafe configuration
    Security,
    /// Interop with other rules
    Compatibility,
    /// Convention adherence
    Style,
}

/// One validation finding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleValidationResult {
    /// Severity
    pub level: ValidationLevel,
    /// Aspect
    pub category: ValidationCategory,
    /// What was found
    pub message: String,
    /// Offending field, when attributable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// How to fix it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl RuleValidationResult {
    fn new(
        level: ValidationLevel,
        category: ValidationCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            level,
            category,
            message: message.into(),
            field: None,
            suggestion: None,
        }
    }

    fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Validation report for a set of rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSetReport {
    /// Findings per rule id
    pub results: HashMap<String, Vec<RuleValidationResult>>,
    /// Cross-rule conflicts
    pub conflicts: Vec<String>,
    /// No error-level findings anywhere
    pub valid: bool,
}

/// Validate one rule, producing findings across all categories
pub fn validate_rule(rule: &Rule) -> Vec<RuleValidationResult> {
    let mut results = Vec::new();

    // Syntax
    if rule.name.trim().is_empty() {
        results.push(
            RuleValidationResult::new(
                ValidationLevel::Error,
                ValidationCategory::Syntax,
                "Rule name is empty",
            )
            .with_field("name"),
        );
    }
    if rule.description.trim().is_empty() {
        results.push(
            RuleValidationResult::new(
                ValidationLevel::Warning,
                ValidationCategory::Style,
                "Rule has no description",
            )
            .with_field("description")
            .with_suggestion("Describe what the rule enforces and why"),
        );
    }
    if rule.actions.is_empty() {
        results.push(
            RuleValidationResult::new(
                ValidationLevel::Error,
                ValidationCategory::Logic,
                "Rule has no actions and can never affect behavior",
            )
            .with_field("actions"),
        );
    }

    // Conditions
    for (idx, condition) in rule.conditions.iter().enumerate() {
        if condition.field.trim().is_empty() {
            results.push(
                RuleValidationResult::new(
                    ValidationLevel::Error,
                    ValidationCategory::Syntax,
                    format!("Condition {} has an empty field", idx),
                )
                .with_field(format!("conditions[{}].field", idx)),
            );
        }
        if condition.operator == ConditionOperator::Regex {
            if let Some(pattern) = condition.value.as_str() {
                if Regex::new(pattern).is_err() {
                    results.push(
                        RuleValidationResult::new(
                            ValidationLevel::Error,
                            ValidationCategory::Syntax,
                            format!("Condition {} has an invalid regex: {}", idx, pattern),
                        )
                        .with_field(format!("conditions[{}].value", idx)),
                    );
                }
            } else {
                results.push(
                    RuleValidationResult::new(
                        ValidationLevel::Error,
                        ValidationCategory::Syntax,
                        format!("Condition {} regex value must be a string", idx),
                    )
                    .with_field(format!("conditions[{}].value", idx)),
                );
            }
        }
        if condition.operator == ConditionOperator::In && !condition.value.is_array() {
            results.push(
                RuleValidationResult::new(
                    ValidationLevel::Warning,
                    ValidationCategory::Logic,
                    format!(
                        "Condition {} uses 'in' with a non-list value; falls back to substring",
                        idx
                    ),
                )
                .with_field(format!("conditions[{}].value", idx)),
            );
        }
    }

    let regex_count = rule
        .conditions
        .iter()
        .filter(|c| c.operator == ConditionOperator::Regex)
        .count();
    if regex_count > 3 {
        results.push(
            RuleValidationResult::new(
                ValidationLevel::Warning,
                ValidationCategory::Performance,
                format!("{} regex conditions on one rule", regex_count),
            )
            .with_suggestion("Prefer eq/contains operators where possible"),
        );
    }
    if rule.conditions.len() > 10 {
        results.push(RuleValidationResult::new(
            ValidationLevel::Warning,
            ValidationCategory::Performance,
            format!("Rule has {} conditions", rule.conditions.len()),
        ));
    }

    // Actions
    let mut seen_set_targets: HashMap<&str, usize> = HashMap::new();
    for (idx, action) in rule.actions.iter().enumerate() {
        if action.target.trim().is_empty() {
            results.push(
                RuleValidationResult::new(
                    ValidationLevel::Error,
                    ValidationCategory::Syntax,
                    format!("Action {} has an empty target", idx),
                )
                .with_field(format!("actions[{}].target", idx)),
            );
        }
        if action.action_type == RuleActionType::Block && action.value.is_null() {
            results.push(
                RuleValidationResult::new(
                    ValidationLevel::Warning,
                    ValidationCategory::Style,
                    format!("Block action {} carries no reason", idx),
                )
                .with_suggestion("Set the value to a human-readable reason"),
            );
        }
        if action.action_type == RuleActionType::Invoke {
            let target = action.target.to_lowercase();
            if target.contains("shell") || target.contains("exec") || target.contains("command") {
                results.push(
                    RuleValidationResult::new(
                        ValidationLevel::Warning,
                        ValidationCategory::Security,
                        format!("Invoke action {} targets an execution surface", idx),
                    )
                    .with_field(format!("actions[{}].target", idx)),
                );
            }
        }
        if action.action_type == RuleActionType::Set {
            if let Some(prev) = seen_set_targets.insert(action.target.as_str(), idx) {
                results.push(
                    RuleValidationResult::new(
                        ValidationLevel::Warning,
                        ValidationCategory::Logic,
                        format!(
                            "Actions {} and {} both set target '{}'; the later one wins",
                            prev, idx, action.target
                        ),
                    )
                    .with_field(format!("actions[{}].target", idx)),
                );
            }
        }
    }

    // Compatibility
    if let Some(parent_id) = &rule.parent_rule_id {
        if parent_id == &rule.id {
            results.push(
                RuleValidationResult::new(
                    ValidationLevel::Error,
                    ValidationCategory::Compatibility,
                    "Rule names itself as parent",
                )
                .with_field("parent_rule_id"),
            );
        }
    }
    if let (Some(from), Some(until)) = (rule.effective_from, rule.effective_until) {
        if from >= until {
            results.push(
                RuleValidationResult::new(
                    ValidationLevel::Error,
                    ValidationCategory::Logic,
                    "Temporal window is empty (effective_from >= effective_until)",
                )
                .with_field("effective_from"),
            );
        }
    }

    results
}

/// Whether a finding list contains no errors
pub fn is_valid(results: &[RuleValidationResult]) -> bool {
    results.iter().all(|r| r.level != ValidationLevel::Error)
}

/// Validate a set of rules together, reporting pairwise conflicts:
/// equal-priority active rules that `set` the same target to different
/// values with no conditions separating them.
pub fn validate_rule_set(rules: &[Rule]) -> RuleSetReport {
    let mut results = HashMap::new();
    let mut valid = true;
    for rule in rules {
        let findings = validate_rule(rule);
        if !is_valid(&findings) {
            valid = false;
        }
        results.insert(rule.id.clone(), findings);
    }

    let mut conflicts = Vec::new();
    for (i, a) in rules.iter().enumerate() {
        for b in rules.iter().skip(i + 1) {
            if a.priority != b.priority || !a.conditions.is_empty() || !b.conditions.is_empty() {
                continue;
            }
            for action_a in &a.actions {
                if action_a.action_type != RuleActionType::Set {
                    continue;
                }
                for action_b in &b.actions {
                    if action_b.action_type == RuleActionType::Set
                        && action_a.target == action_b.target
                        && action_a.value != action_b.value
                    {
                        conflicts.push(format!(
                            "Rules {} and {} set '{}' to different values at equal priority",
                            a.id, b.id, action_a.target
                        ));
                    }
                }
            }
        }
    }

    RuleSetReport {
        results,
        conflicts,
        valid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::{
        RuleAction, RuleCondition, RulePriority, RuleScope, RuleType,
    };
    use serde_json::{json, Map};

    fn valid_rule() -> Rule {
        let mut rule = Rule::new(
            "Concise responses",
            RuleType::Communication,
            RuleScope::Global,
            RulePriority::Normal,
            "tests",
        );
        rule.description = "Keep responses short".to_string();
        rule.actions.push(RuleAction {
            action_type: RuleActionType::Set,
            target: "response_style".to_string(),
            value: json!("concise"),
            parameters: Map::new(),
        });
        rule
    }

    #[test]
    fn test_valid_rule_has_no_errors() {
        let findings = validate_rule(&valid_rule());
        assert!(is_valid(&findings));
    }

    #[test]
    fn test_empty_name_and_actions_are_errors() {
        let mut rule = valid_rule();
        rule.name = "  ".to_string();
        rule.actions.clear();
        let findings = validate_rule(&rule);
        assert!(!is_valid(&findings));
        assert!(findings
            .iter()
            .any(|f| f.category == ValidationCategory::Syntax));
        assert!(findings
            .iter()
            .any(|f| f.category == ValidationCategory::Logic));
    }

    #[test]
    fn test_invalid_regex_condition() {
        let mut rule = valid_rule();
        rule.conditions.push(RuleCondition {
            field: "agent_id".to_string(),
            operator: ConditionOperator::Regex,
            value: json!("[unclosed"),
            case_sensitive: true,
        });
        let findings = validate_rule(&rule);
        assert!(!is_valid(&findings));
    }

    #[test]
    fn test_duplicate_set_target_warning() {
        let mut rule = valid_rule();
        rule.actions.push(RuleAction {
            action_type: RuleActionType::Set,
            target: "response_style".to_string(),
            value: json!("detailed"),
            parameters: Map::new(),
        });
        let findings = validate_rule(&rule);
        assert!(is_valid(&findings));
        assert!(findings
            .iter()
            .any(|f| f.level == ValidationLevel::Warning
                && f.category == ValidationCategory::Logic));
    }

    #[test]
    fn test_empty_temporal_window_is_error() {
        let mut rule = valid_rule();
        let now = chrono::Utc::now();
        rule.effective_from = Some(now);
        rule.effective_until = Some(now - chrono::Duration::hours(1));
        assert!(!is_valid(&validate_rule(&rule)));
    }

    #[test]
    fn test_rule_set_conflict_detection() {
        let a = valid_rule();
        let mut b = valid_rule();
        b.actions[0].value = json!("detailed");

        let report = validate_rule_set(&[a, b]);
        assert_eq!(report.conflicts.len(), 1);
        assert!(report.valid);
    }
}
