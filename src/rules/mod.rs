//! Rule governance engine
//!
//! Typed, scoped, prioritized rules govern agent behavior around each
//! execution. The store persists rules with versioned history; the
//! evaluator folds matching rules into a behavior configuration; the
//! inheritance resolver layers scopes and materializes parent merges;
//! the advanced dispatcher adds conditional, cascading, scheduled,
//! context-aware, compliance and security-adaptive lanes.

pub mod advanced;
pub mod evaluator;
pub mod inheritance;
pub mod model;
pub mod store;
pub mod templates;
pub mod validation;

pub use advanced::{
    AdvancedConfig, AdvancedEvaluation, AdvancedRule, AdvancedRuleDispatcher, AdvancedRuleType,
    CascadingAction, ComplianceAuditRecord, ComplianceAuditor, ComplianceConfig,
    ComplianceFramework, ConditionalTrigger, ContextAdaptation, SecurityAdaptiveConfig,
    ThreatMonitor, TimeBasedSchedule, TriggerType,
};
pub use evaluator::{EvaluationOutcome, RuleEvaluator};
pub use inheritance::{ChainReport, InheritanceContext, InheritanceResolver};
pub use model::{
    ConditionOperator, ConflictResolution, DependencyType, Rule, RuleAction, RuleActionType,
    RuleAssignment, RuleChangeType, RuleCondition, RuleDependency, RulePriority, RuleScope,
    RuleStatus, RuleTemplate, RuleType, RuleVersion, TemplateParameter, TemplateParameterType,
};
pub use store::{
    ExportEnvelope, ExportFormat, RuleAnalytics, RuleStatistics, RuleStore, SemanticIndexer,
};
pub use validation::{
    validate_rule, validate_rule_set, RuleSetReport, RuleValidationResult, ValidationCategory,
    ValidationLevel,
};
