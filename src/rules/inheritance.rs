//! Rule inheritance and scope overrides
//!
//! Rules layer from general to specific scopes (global, project,
//! machine, agent, session); a more specific layer overrides a more
//! general one per (rule_type, name) key. A rule with a parent is
//! materialized by merging the parent into the child: conditions are
//! AND-combined, actions and metadata are child-wins. Merges always
//! produce a new rule, never a mutation of either source.

use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::core::error::{EngineError, Result};

use super::evaluator::rule_matches_context;
use super::model::{
    ConditionOperator, ConflictResolution, Rule, RuleAction, RuleCondition, RulePriority,
    RuleScope,
};
use super::store::RuleStore;

/// Warn when an inheritance chain grows deeper than this
const CHAIN_DEPTH_WARNING: usize = 3;

/// Caller identity used to select scope layers
#[derive(Debug, Clone, Default)]
pub struct InheritanceContext {
    /// Agent identity
    pub agent_id: String,
    /// Machine identity
    pub machine_id: String,
    /// Optional project
    pub project_id: Option<String>,
    /// Optional session
    pub session_id: Option<String>,
    /// Optional user
    pub user_id: Option<String>,
    /// Agent capabilities
    pub capabilities: Vec<String>,
    /// Agent role
    pub role: Option<String>,
}

impl InheritanceContext {
    /// Flatten into a context map for condition matching
    pub fn as_context_map(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("agent_id".to_string(), json!(self.agent_id));
        map.insert("machine_id".to_string(), json!(self.machine_id));
        if let Some(project_id) = &self.project_id {
            map.insert("project_id".to_string(), json!(project_id));
        }
        if let Some(session_id) = &self.session_id {
            map.insert("session_id".to_string(), json!(session_id));
        }
        if let Some(user_id) = &self.user_id {
            map.insert("user_id".to_string(), json!(user_id));
        }
        if !self.capabilities.is_empty() {
            map.insert("capabilities".to_string(), json!(self.capabilities));
        }
        if let Some(role) = &self.role {
            map.insert("role".to_string(), json!(role));
        }
        map
    }
}

/// Report from inheritance chain validation
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChainReport {
    /// No blocking issues found
    pub valid: bool,
    /// Blocking problems
    pub issues: Vec<String>,
    /// Non-blocking observations
    pub warnings: Vec<String>,
    /// Chain length
    pub depth: usize,
    /// Rule ids along the chain, child first
    pub chain: Vec<String>,
}

/// Resolves effective rules for a context, applying scope layering and
/// parent inheritance
pub struct InheritanceResolver {
    store: Arc<RuleStore>,
}

impl InheritanceResolver {
    /// Create a resolver over a store
    pub fn new(store: Arc<RuleStore>) -> Self {
        Self { store }
    }

    /// Effective rules for a context: scope layers general to specific,
    /// later layers overriding per (rule_type, name), parents merged
    /// into children. Sorted by priority, highest first.
    pub fn effective_rules(&self, context: &InheritanceContext) -> Result<Vec<Rule>> {
        let context_map = context.as_context_map();

        let mut layers: Vec<RuleScope> = vec![RuleScope::Global];
        if context.project_id.is_some() {
            layers.push(RuleScope::Project);
        }
        layers.push(RuleScope::Machine);
        layers.push(RuleScope::Agent);
        if context.session_id.is_some() {
            layers.push(RuleScope::Session);
        }

        // Later (more specific) layers override earlier ones per key
        let mut by_key: HashMap<(String, String), Rule> = HashMap::new();
        for scope in layers {
            for rule in self.store.rules_by_scope(scope)? {
                if !rule_matches_context(&rule, &context_map) {
                    continue;
                }
                let materialized = match &rule.parent_rule_id {
                    Some(parent_id) => match self.store.get_rule(parent_id)? {
                        Some(parent) => merge_inherited(&parent, &rule),
                        None => rule,
                    },
                    None => rule,
                };
                let key = (
                    materialized.rule_type.to_string(),
                    materialized.name.clone(),
                );
                by_key.insert(key, materialized);
            }
        }

        let mut rules: Vec<Rule> = by_key.into_values().collect();
        rules.sort_by(|a, b| {
            b.priority
                .value()
                .cmp(&a.priority.value())
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(rules)
    }

    /// Validate the inheritance chain starting at a rule
    pub fn validate_chain(&self, rule_id: &str) -> Result<ChainReport> {
        let mut issues = Vec::new();
        let mut warnings = Vec::new();
        let mut chain = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();

        let Some(rule) = self.store.get_rule(rule_id)? else {
            return Err(EngineError::RuleNotFound {
                id: rule_id.to_string(),
            });
        };

        let mut current = Some(rule.clone());
        while let Some(rule) = current {
            if !visited.insert(rule.id.clone()) {
                issues.push(format!(
                    "Circular inheritance detected in chain: {}",
                    chain.join(" -> ")
                ));
                break;
            }
            chain.push(rule.id.clone());

            if let Some(parent_id) = &rule.parent_rule_id {
                match self.store.get_rule(parent_id)? {
                    Some(parent) => {
                        if rule.scope.rank() <= parent.scope.rank() {
                            issues.push(format!(
                                "Invalid scope inheritance: {} inheriting from {}",
                                rule.scope, parent.scope
                            ));
                        }
                        let parent_targets: HashSet<&str> =
                            parent.actions.iter().map(|a| a.target.as_str()).collect();
                        let overlapping: Vec<&str> = rule
                            .actions
                            .iter()
                            .map(|a| a.target.as_str())
                            .filter(|t| parent_targets.contains(t))
                            .collect();
                        if !overlapping.is_empty() {
                            warnings.push(format!(
                                "Actions override parent for targets: {}",
                                overlapping.join(", ")
                            ));
                        }
                        current = Some(parent);
                    }
                    None => {
                        issues.push(format!("Parent rule not found: {}", parent_id));
                        current = None;
                    }
                }
            } else {
                current = None;
            }
        }

        if chain.len() > CHAIN_DEPTH_WARNING {
            warnings.push(format!(
                "Inheritance chain is deep ({} levels), consider flattening",
                chain.len()
            ));
        }

        Ok(ChainReport {
            valid: issues.is_empty(),
            issues,
            warnings,
            depth: chain.len(),
            chain,
        })
    }

    /// Create an override of a base rule for a specific scope and
    /// context. The override inherits from the base rule and carries
    /// conditions matching the given filters.
    pub fn create_override(
        &self,
        base_rule_id: &str,
        scope: RuleScope,
        context_filters: &HashMap<String, Value>,
        override_actions: Vec<RuleAction>,
        created_by: &str,
    ) -> Result<String> {
        let Some(base) = self.store.get_rule(base_rule_id)? else {
            return Err(EngineError::RuleNotFound {
                id: base_rule_id.to_string(),
            });
        };
        if scope.rank() <= base.scope.rank() {
            return Err(EngineError::Inheritance {
                message: format!(
                    "Override scope {} is not more specific than base scope {}",
                    scope, base.scope
                ),
            });
        }

        let mut rule = Rule::new(
            format!("{} Override ({})", base.name, scope),
            base.rule_type,
            scope,
            RulePriority::High,
            created_by,
        );
        rule.description = format!("Override of {} for {} context", base.name, scope);
        rule.conditions = context_filters
            .iter()
            .map(|(field, value)| RuleCondition {
                field: field.clone(),
                operator: ConditionOperator::Eq,
                value: value.clone(),
                case_sensitive: true,
            })
            .collect();
        rule.actions = override_actions;
        rule.tags = base.tags.clone();
        rule.tags.push("override".to_string());
        rule.parent_rule_id = Some(base.id.clone());
        rule.conflict_resolution = ConflictResolution::MostSpecific;
        rule.metadata
            .insert("override_for".to_string(), json!(base.id));

        self.store.create_rule(&mut rule, Some("Scope override"))
    }
}

/// Merge a parent rule into a child, producing a new materialized rule.
/// Conditions are AND-combined with child winning per (field, operator);
/// actions are child-wins per target with the rest unioned; tags unite;
/// metadata shallow-merges with child winning.
pub fn merge_inherited(parent: &Rule, child: &Rule) -> Rule {
    let mut merged = child.clone();

    let mut conditions = child.conditions.clone();
    for parent_condition in &parent.conditions {
        let duplicated = conditions.iter().any(|c| {
            c.field == parent_condition.field && c.operator == parent_condition.operator
        });
        if !duplicated {
            conditions.push(parent_condition.clone());
        }
    }
    merged.conditions = conditions;

    let child_targets: HashSet<&str> = child.actions.iter().map(|a| a.target.as_str()).collect();
    let mut actions: Vec<RuleAction> = parent
        .actions
        .iter()
        .filter(|a| !child_targets.contains(a.target.as_str()))
        .cloned()
        .collect();
    actions.extend(child.actions.iter().cloned());
    merged.actions = actions;

    let mut tags = parent.tags.clone();
    for tag in &child.tags {
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }
    merged.tags = tags;

    let mut metadata: Map<String, Value> = parent.metadata.clone();
    for (key, value) in &child.metadata {
        metadata.insert(key.clone(), value.clone());
    }
    metadata.insert("inherited_from".to_string(), json!(parent.id));
    merged.metadata = metadata;

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::{RuleActionType, RuleType};
    use serde_json::json;

    fn rule(name: &str, scope: RuleScope) -> Rule {
        Rule::new(
            name,
            RuleType::Communication,
            scope,
            RulePriority::Normal,
            "tests",
        )
    }

    fn action(target: &str, value: Value) -> RuleAction {
        RuleAction {
            action_type: RuleActionType::Set,
            target: target.to_string(),
            value,
            parameters: Map::new(),
        }
    }

    fn condition(field: &str, value: Value) -> RuleCondition {
        RuleCondition {
            field: field.to_string(),
            operator: ConditionOperator::Eq,
            value,
            case_sensitive: true,
        }
    }

    #[test]
    fn test_merge_child_wins_per_target() {
        let mut parent = rule("base", RuleScope::Global);
        parent.actions = vec![action("style", json!("concise")), action("emoji", json!(false))];
        let mut child = rule("child", RuleScope::Agent);
        child.parent_rule_id = Some(parent.id.clone());
        child.actions = vec![action("style", json!("detailed"))];

        let merged = merge_inherited(&parent, &child);
        assert_eq!(merged.actions.len(), 2);
        let style = merged.actions.iter().find(|a| a.target == "style").unwrap();
        assert_eq!(style.value, json!("detailed"));
        assert!(merged.actions.iter().any(|a| a.target == "emoji"));
        assert_eq!(merged.metadata["inherited_from"], json!(parent.id));
    }

    #[test]
    fn test_merge_conditions_and_combined() {
        let mut parent = rule("base", RuleScope::Global);
        parent.conditions = vec![
            condition("project_id", json!("p1")),
            condition("task_type", json!("review")),
        ];
        let mut child = rule("child", RuleScope::Agent);
        child.conditions = vec![condition("task_type", json!("code_generation"))];

        let merged = merge_inherited(&parent, &child);
        assert_eq!(merged.conditions.len(), 2);
        // Child wins the duplicated (field, operator) pair
        let task = merged
            .conditions
            .iter()
            .find(|c| c.field == "task_type")
            .unwrap();
        assert_eq!(task.value, json!("code_generation"));
    }

    #[test]
    fn test_merge_associative_for_disjoint_targets() {
        let mut a = rule("a", RuleScope::Global);
        a.actions = vec![action("one", json!(1))];
        let mut b = rule("b", RuleScope::Machine);
        b.actions = vec![action("two", json!(2))];
        let mut c = rule("c", RuleScope::Agent);
        c.actions = vec![action("three", json!(3))];

        let left = merge_inherited(&merge_inherited(&a, &b), &c);
        let right = merge_inherited(&a, &merge_inherited(&b, &c));

        let targets = |r: &Rule| {
            let mut t: Vec<(String, Value)> = r
                .actions
                .iter()
                .map(|x| (x.target.clone(), x.value.clone()))
                .collect();
            t.sort_by(|x, y| x.0.cmp(&y.0));
            t
        };
        assert_eq!(targets(&left), targets(&right));
    }

    #[test]
    fn test_merge_never_mutates_sources() {
        let mut parent = rule("base", RuleScope::Global);
        parent.actions = vec![action("style", json!("concise"))];
        let child = rule("child", RuleScope::Agent);

        let parent_before = parent.actions.clone();
        let child_before = child.actions.clone();
        let _merged = merge_inherited(&parent, &child);
        assert_eq!(parent.actions, parent_before);
        assert_eq!(child.actions, child_before);
    }

    #[test]
    fn test_tag_union() {
        let mut parent = rule("base", RuleScope::Global);
        parent.tags = vec!["shared".to_string(), "parent".to_string()];
        let mut child = rule("child", RuleScope::Agent);
        child.tags = vec!["shared".to_string(), "child".to_string()];

        let merged = merge_inherited(&parent, &child);
        assert_eq!(merged.tags.len(), 3);
    }
}
