//! Rule evaluation - from context to behavior configuration
//!
//! Selects applicable rules for a context, resolves per-target conflicts
//! according to the winning rule's policy, and folds actions into a flat
//! behavior configuration map. Every evaluation is recorded for
//! analytics with its timing and a hash of the context.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::awareness::AwarenessPublisher;
use crate::core::error::Result;

use super::model::{
    ConditionOperator, ConflictResolution, Rule, RuleAction, RuleActionType, RuleCondition,
};
use super::store::RuleStore;

/// Result of one evaluation
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EvaluationOutcome {
    /// Behavior configuration folded from winning actions
    pub configuration: Map<String, Value>,
    /// Ids of rules that matched the context
    pub applied_rules: Vec<String>,
    /// Evaluation wall time in milliseconds
    pub evaluation_time_ms: u64,
    /// Hash of the sorted-key context
    pub context_hash: String,
}

/// Evaluates rules from a store against caller contexts.
/// Cheap and synchronous; safe to call from concurrent tasks.
pub struct RuleEvaluator {
    store: Arc<RuleStore>,
    publisher: Arc<AwarenessPublisher>,
}

impl RuleEvaluator {
    /// Create an evaluator over a store
    pub fn new(store: Arc<RuleStore>, publisher: Arc<AwarenessPublisher>) -> Self {
        Self { store, publisher }
    }

    /// Evaluate all applicable rules and return the merged behavior
    /// configuration
    pub fn evaluate(&self, context: &HashMap<String, Value>) -> Result<EvaluationOutcome> {
        let rules = self.store.active_rules()?;
        self.evaluate_with_rules(&rules, context)
    }

    /// Evaluate a pre-selected rule set (e.g. one produced by the
    /// inheritance resolver) against a context
    pub fn evaluate_with_rules(
        &self,
        rules: &[Rule],
        context: &HashMap<String, Value>,
    ) -> Result<EvaluationOutcome> {
        let start = Instant::now();
        let now = Utc::now();

        let applicable: Vec<&Rule> = rules
            .iter()
            .filter(|rule| rule.is_applicable_at(now) && rule_matches_context(rule, context))
            .collect();

        let (configuration, conflicts) = build_configuration(&applicable, context);
        let applied_rules: Vec<String> = applicable.iter().map(|r| r.id.clone()).collect();
        let evaluation_time_ms = start.elapsed().as_millis() as u64;
        let context_hash = hash_context(context);

        for conflict in &conflicts {
            if let Err(e) = self.store.record_conflict(
                &conflict.rule_ids,
                "target_overlap",
                conflict.strategy,
                Some(&conflict.winner),
                &json!(context),
            ) {
                warn!("Failed to record rule conflict: {}", e);
            }
        }

        let result_summary = json!({
            "targets": configuration.keys().collect::<Vec<_>>(),
            "applied_rules": applied_rules,
        });
        let agent_id = context
            .get("agent_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let machine_id = context
            .get("machine_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        if let Err(e) = self.store.record_evaluation(
            &applied_rules,
            agent_id,
            machine_id,
            &json!(context),
            &result_summary,
            evaluation_time_ms,
        ) {
            warn!("Failed to record rule evaluation: {}", e);
        }

        self.publisher.emit(
            &format!("Rules evaluated: {} applied", applied_rules.len()),
            "rules",
            json!({
                "applied_rules": applied_rules,
                "evaluation_time_ms": evaluation_time_ms,
                "context_hash": context_hash,
            }),
            &["rules", "evaluation"],
        );

        Ok(EvaluationOutcome {
            configuration,
            applied_rules,
            evaluation_time_ms,
            context_hash,
        })
    }
}

struct ResolvedConflict {
    rule_ids: Vec<String>,
    strategy: ConflictResolution,
    winner: String,
}

/// Fold matching rules into a configuration map, resolving per-target
/// conflicts. Returns the configuration with `_rule_applications`
/// attached, plus the conflicts that were resolved.
fn build_configuration(
    rules: &[&Rule],
    _context: &HashMap<String, Value>,
) -> (Map<String, Value>, Vec<ResolvedConflict>) {
    let mut by_target: BTreeMap<String, Vec<(&Rule, &RuleAction)>> = BTreeMap::new();
    for &rule in rules {
        for action in &rule.actions {
            by_target
                .entry(action.target.clone())
                .or_default()
                .push((rule, action));
        }
    }

    let mut configuration = Map::new();
    let mut applications = Vec::new();
    let mut conflicts = Vec::new();

    for (target, mut candidates) in by_target {
        if candidates.len() == 1 {
            let (rule, action) = candidates[0];
            let current = configuration.get(&target).cloned();
            configuration.insert(target.clone(), apply_action(action, current.as_ref()));
            applications.push(json!({
                "rule_id": rule.id,
                "target": target,
                "action": action.action_type,
            }));
            continue;
        }

        // The highest-priority rule in the group chooses the policy
        candidates.sort_by(|a, b| {
            b.0.priority
                .value()
                .cmp(&a.0.priority.value())
                .then(a.0.created_at.cmp(&b.0.created_at))
        });
        let strategy = candidates[0].0.conflict_resolution;
        let (rule, action) = resolve_conflict(&candidates, strategy);

        let current = configuration.get(&target).cloned();
        configuration.insert(target.clone(), apply_action(action, current.as_ref()));
        applications.push(json!({
            "rule_id": rule.id,
            "target": target,
            "action": action.action_type,
            "conflict_resolved": true,
        }));
        conflicts.push(ResolvedConflict {
            rule_ids: candidates.iter().map(|(r, _)| r.id.clone()).collect(),
            strategy,
            winner: rule.id.clone(),
        });
    }

    configuration.insert("_rule_applications".to_string(), Value::Array(applications));
    (configuration, conflicts)
}

/// Pick the winning (rule, action) pair for a contested target
fn resolve_conflict<'a>(
    candidates: &[(&'a Rule, &'a RuleAction)],
    strategy: ConflictResolution,
) -> (&'a Rule, &'a RuleAction) {
    let winner = match strategy {
        ConflictResolution::MostSpecific => candidates.iter().max_by(|a, b| {
            a.0.scope
                .rank()
                .cmp(&b.0.scope.rank())
                .then(a.0.priority.value().cmp(&b.0.priority.value()))
                .then(a.0.created_at.cmp(&b.0.created_at))
        }),
        ConflictResolution::LatestCreated => candidates
            .iter()
            .max_by(|a, b| a.0.created_at.cmp(&b.0.created_at)),
        // highest_priority and everything else: max priority, ties
        // broken by most recent creation
        _ => candidates.iter().max_by(|a, b| {
            a.0.priority
                .value()
                .cmp(&b.0.priority.value())
                .then(a.0.created_at.cmp(&b.0.created_at))
        }),
    };
    winner.copied().unwrap_or(candidates[0])
}

/// Fold one action into the current value for its target
pub fn apply_action(action: &RuleAction, current: Option<&Value>) -> Value {
    match action.action_type {
        RuleActionType::Set => action.value.clone(),
        RuleActionType::Append => match current {
            Some(Value::Array(items)) => {
                let mut items = items.clone();
                items.push(action.value.clone());
                Value::Array(items)
            }
            _ => action.value.clone(),
        },
        RuleActionType::Merge => match current {
            Some(Value::Object(map)) => {
                let mut merged = map.clone();
                if let Value::Object(incoming) = &action.value {
                    for (k, v) in incoming {
                        merged.insert(k.clone(), v.clone());
                    }
                }
                Value::Object(merged)
            }
            _ => action.value.clone(),
        },
        RuleActionType::Validate => json!({
            "validation": action.value,
            "current": current.cloned(),
        }),
        RuleActionType::Block => json!({
            "blocked": true,
            "reason": action.value,
        }),
        RuleActionType::Transform | RuleActionType::Invoke => action.value.clone(),
    }
}

/// Whether every condition of a rule holds in the context. Rules with
/// no conditions apply universally.
pub fn rule_matches_context(rule: &Rule, context: &HashMap<String, Value>) -> bool {
    rule.conditions
        .iter()
        .all(|condition| condition_matches(condition, context))
}

/// Evaluate one rule condition against a context map
pub fn condition_matches(condition: &RuleCondition, context: &HashMap<String, Value>) -> bool {
    // Presence operators come first: they do not need a field value
    match condition.operator {
        ConditionOperator::Exists => return context.contains_key(&condition.field),
        ConditionOperator::NotExists => return !context.contains_key(&condition.field),
        _ => {}
    }

    let Some(field_value) = context.get(&condition.field) else {
        return false;
    };

    let (field_str, expected_str) = if condition.case_sensitive {
        (stringify(field_value), stringify(&condition.value))
    } else {
        (
            stringify(field_value).to_lowercase(),
            stringify(&condition.value).to_lowercase(),
        )
    };

    match condition.operator {
        ConditionOperator::Eq => {
            if condition.case_sensitive {
                field_value == &condition.value || field_str == expected_str
            } else {
                field_str == expected_str
            }
        }
        ConditionOperator::Ne => {
            if condition.case_sensitive {
                field_value != &condition.value && field_str != expected_str
            } else {
                field_str != expected_str
            }
        }
        ConditionOperator::In => match &condition.value {
            Value::Array(items) => {
                if condition.case_sensitive {
                    items.contains(field_value)
                } else {
                    items
                        .iter()
                        .any(|item| stringify(item).to_lowercase() == field_str)
                }
            }
            Value::String(_) => expected_str.contains(&field_str),
            _ => false,
        },
        ConditionOperator::Regex => {
            let pattern = if condition.case_sensitive {
                format!(r"\A(?:{})", stringify(&condition.value))
            } else {
                format!(r"(?i)\A(?:{})", stringify(&condition.value))
            };
            match regex::Regex::new(&pattern) {
                Ok(regex) => regex.is_match(&stringify(field_value)),
                Err(_) => false,
            }
        }
        ConditionOperator::Contains => field_str.contains(&expected_str),
        ConditionOperator::Startswith => field_str.starts_with(&expected_str),
        ConditionOperator::Endswith => field_str.ends_with(&expected_str),
        ConditionOperator::Gt => compare_numeric(field_value, &condition.value, |a, b| a > b),
        ConditionOperator::Lt => compare_numeric(field_value, &condition.value, |a, b| a < b),
        ConditionOperator::Gte => compare_numeric(field_value, &condition.value, |a, b| a >= b),
        ConditionOperator::Lte => compare_numeric(field_value, &condition.value, |a, b| a <= b),
        ConditionOperator::Exists | ConditionOperator::NotExists => unreachable!(),
    }
}

fn compare_numeric(left: &Value, right: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (as_f64(left), as_f64(right)) {
        (Some(l), Some(r)) => op(l, r),
        _ => false,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// md5 hash of the context serialized with keys sorted at every level
pub fn hash_context(context: &HashMap<String, Value>) -> String {
    fn canonical(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, canonical(v))).collect();
                serde_json::to_value(sorted).unwrap_or(Value::Null)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
            other => other.clone(),
        }
    }

    let sorted: BTreeMap<&String, Value> =
        context.iter().map(|(k, v)| (k, canonical(v))).collect();
    let serialized = serde_json::to_string(&sorted).unwrap_or_default();
    format!("{:x}", md5::compute(serialized.as_bytes()))
}

/// Parse a conflict resolution name, falling back to highest priority
pub fn resolution_or_default(name: &str) -> ConflictResolution {
    ConflictResolution::from_str(name).unwrap_or(ConflictResolution::HighestPriority)
}
