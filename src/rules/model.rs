//! Rule data model
//!
//! Typed, scoped, prioritized rules with versioned history, dependencies,
//! scope assignments and parameterized templates. Wire names are
//! snake_case throughout so rules round-trip cleanly through YAML/JSON
//! export and the SQLite store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::core::error::{EngineError, Result};

/// Rule classification types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    /// Attribution of produced work
    Authorship,
    /// Code formatting and style
    CodingStyle,
    /// Security enforcement
    Security,
    /// Regulatory and policy compliance
    Compliance,
    /// System operation preferences
    Operational,
    /// Response style and format
    Communication,
    /// Development workflow and process
    Workflow,
    /// API and service integration
    Integration,
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Authorship => "authorship",
            Self::CodingStyle => "coding_style",
            Self::Security => "security",
            Self::Compliance => "compliance",
            Self::Operational => "operational",
            Self::Communication => "communication",
            Self::Workflow => "workflow",
            Self::Integration => "integration",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for RuleType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "authorship" => Ok(Self::Authorship),
            "coding_style" => Ok(Self::CodingStyle),
            "security" => Ok(Self::Security),
            "compliance" => Ok(Self::Compliance),
            "operational" => Ok(Self::Operational),
            "communication" => Ok(Self::Communication),
            "workflow" => Ok(Self::Workflow),
            "integration" => Ok(Self::Integration),
            other => Err(EngineError::rule_validation(format!(
                "Unknown rule type: {}",
                other
            ))),
        }
    }
}

/// Rule application scope, from least to most specific
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// Network-wide rules
    Global,
    /// Project-specific rules
    Project,
    /// Machine-specific rules
    Machine,
    /// Agent-specific rules
    Agent,
    /// Session-specific rules
    Session,
}

impl RuleScope {
    /// Specificity rank: global < project < machine < agent < session
    pub fn rank(&self) -> u8 {
        match self {
            Self::Global => 1,
            Self::Project => 2,
            Self::Machine => 3,
            Self::Agent => 4,
            Self::Session => 5,
        }
    }
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Global => "global",
            Self::Project => "project",
            Self::Machine => "machine",
            Self::Agent => "agent",
            Self::Session => "session",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for RuleScope {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "global" => Ok(Self::Global),
            "project" => Ok(Self::Project),
            "machine" => Ok(Self::Machine),
            "agent" => Ok(Self::Agent),
            "session" => Ok(Self::Session),
            other => Err(EngineError::rule_validation(format!(
                "Unknown rule scope: {}",
                other
            ))),
        }
    }
}

/// Rule evaluation priority buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulePriority {
    /// Suggestions and recommendations
    Advisory,
    /// Convenience preferences
    Low,
    /// Standard preferences
    Normal,
    /// Important behavior rules
    High,
    /// System-critical rules
    Critical,
}

impl RulePriority {
    /// Numeric bucket value used for ordering and storage
    pub fn value(&self) -> i64 {
        match self {
            Self::Advisory => 100,
            Self::Low => 250,
            Self::Normal => 500,
            Self::High => 750,
            Self::Critical => 1000,
        }
    }

    /// Convert a stored bucket value back into a priority
    pub fn from_value(value: i64) -> Result<Self> {
        match value {
            100 => Ok(Self::Advisory),
            250 => Ok(Self::Low),
            500 => Ok(Self::Normal),
            750 => Ok(Self::High),
            1000 => Ok(Self::Critical),
            other => Err(EngineError::rule_validation(format!(
                "Unknown priority value: {}",
                other
            ))),
        }
    }
}

/// Rule lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    /// Eligible for evaluation
    Active,
    /// Temporarily disabled
    Inactive,
    /// Kept for history only
    Deprecated,
    /// Evaluated but flagged as experimental
    Testing,
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Deprecated => "deprecated",
            Self::Testing => "testing",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for RuleStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "deprecated" => Ok(Self::Deprecated),
            "testing" => Ok(Self::Testing),
            other => Err(EngineError::rule_validation(format!(
                "Unknown rule status: {}",
                other
            ))),
        }
    }
}

/// Conflict resolution strategies for rules targeting the same behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Highest numeric priority wins, newest created breaks ties
    HighestPriority,
    /// Most specific scope wins
    MostSpecific,
    /// Most recently created wins
    LatestCreated,
    /// Reserved for multi-node agreement
    Consensus,
    /// Explicit override relationship
    Override,
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::HighestPriority => "highest_priority",
            Self::MostSpecific => "most_specific",
            Self::LatestCreated => "latest_created",
            Self::Consensus => "consensus",
            Self::Override => "override",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for ConflictResolution {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "highest_priority" => Ok(Self::HighestPriority),
            "most_specific" => Ok(Self::MostSpecific),
            "latest_created" => Ok(Self::LatestCreated),
            "consensus" => Ok(Self::Consensus),
            "override" => Ok(Self::Override),
            other => Err(EngineError::rule_validation(format!(
                "Unknown conflict resolution: {}",
                other
            ))),
        }
    }
}

/// Condition operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOperator {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Member of a list value
    In,
    /// Regex match against the stringified field
    Regex,
    /// Substring containment
    Contains,
    /// String prefix
    Startswith,
    /// String suffix
    Endswith,
    /// Numeric greater-than
    Gt,
    /// Numeric less-than
    Lt,
    /// Numeric greater-or-equal
    Gte,
    /// Numeric less-or-equal
    Lte,
    /// Field present in context
    Exists,
    /// Field absent from context
    NotExists,
}

/// Rule application condition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleCondition {
    /// Context field to evaluate
    pub field: String,
    /// Comparison operator
    pub operator: ConditionOperator,
    /// Expected value(s)
    #[serde(default)]
    pub value: Value,
    /// Case-sensitive string comparison
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
}

fn default_true() -> bool {
    true
}

/// Rule action types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleActionType {
    /// Overwrite the target value
    Set,
    /// Push onto a list target
    Append,
    /// Shallow-merge into a map target
    Merge,
    /// Record an observation without changing the target
    Validate,
    /// Mark the target blocked
    Block,
    /// Transform the target through a named function
    Transform,
    /// Invoke a named collaborator
    Invoke,
}

/// Rule enforcement action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleAction {
    /// Action to take
    pub action_type: RuleActionType,
    /// Target behavior or field
    pub target: String,
    /// Action value
    #[serde(default)]
    pub value: Value,
    /// Extra parameters
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

/// A governance rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Stable identifier
    pub id: String,
    /// Short name
    pub name: String,
    /// Human description
    pub description: String,
    /// Classification
    pub rule_type: RuleType,
    /// Application scope
    pub scope: RuleScope,
    /// Evaluation priority
    pub priority: RulePriority,
    /// Lifecycle status
    pub status: RuleStatus,
    /// Conditions; empty means universally applicable
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    /// Actions folded into the behavior configuration
    #[serde(default)]
    pub actions: Vec<RuleAction>,
    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Creator
    pub created_by: String,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// Last updater
    pub updated_by: String,
    /// Monotonically increasing version
    #[serde(default = "default_version")]
    pub version: i64,
    /// Parent rule for inheritance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_rule_id: Option<String>,
    /// Conflict resolution policy
    #[serde(default = "default_resolution")]
    pub conflict_resolution: ConflictResolution,
    /// Temporal window start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_from: Option<DateTime<Utc>>,
    /// Temporal window end
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_until: Option<DateTime<Utc>>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_version() -> i64 {
    1
}

fn default_resolution() -> ConflictResolution {
    ConflictResolution::HighestPriority
}

impl Rule {
    /// Convenience constructor with sensible defaults
    pub fn new(
        name: impl Into<String>,
        rule_type: RuleType,
        scope: RuleScope,
        priority: RulePriority,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let created_by = created_by.into();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            rule_type,
            scope,
            priority,
            status: RuleStatus::Active,
            conditions: Vec::new(),
            actions: Vec::new(),
            tags: Vec::new(),
            created_at: now,
            created_by: created_by.clone(),
            updated_at: now,
            updated_by: created_by,
            version: 1,
            parent_rule_id: None,
            conflict_resolution: ConflictResolution::HighestPriority,
            effective_from: None,
            effective_until: None,
            metadata: Map::new(),
        }
    }

    /// Whether the rule is eligible for evaluation at the given time:
    /// active status and inside the temporal window when one is set.
    pub fn is_applicable_at(&self, now: DateTime<Utc>) -> bool {
        if self.status != RuleStatus::Active {
            return false;
        }
        if let Some(from) = self.effective_from {
            if now < from {
                return false;
            }
        }
        if let Some(until) = self.effective_until {
            if now > until {
                return false;
            }
        }
        true
    }
}

/// Types of rule changes recorded in version history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleChangeType {
    /// Rule created
    Created,
    /// Rule content updated
    Updated,
    /// Status changed to active
    Activated,
    /// Status changed to inactive
    Deactivated,
    /// Status changed to deprecated
    Deprecated,
    /// Rule removed
    Deleted,
    /// Rule arrived via import
    Imported,
    /// Rule left via export
    Exported,
}

impl fmt::Display for RuleChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Activated => "activated",
            Self::Deactivated => "deactivated",
            Self::Deprecated => "deprecated",
            Self::Deleted => "deleted",
            Self::Imported => "imported",
            Self::Exported => "exported",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for RuleChangeType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "updated" => Ok(Self::Updated),
            "activated" => Ok(Self::Activated),
            "deactivated" => Ok(Self::Deactivated),
            "deprecated" => Ok(Self::Deprecated),
            "deleted" => Ok(Self::Deleted),
            "imported" => Ok(Self::Imported),
            "exported" => Ok(Self::Exported),
            other => Err(EngineError::rule_validation(format!(
                "Unknown change type: {}",
                other
            ))),
        }
    }
}

/// Immutable version history entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleVersion {
    /// Entry id
    pub id: String,
    /// Versioned rule
    pub rule_id: String,
    /// Version number at change time
    pub version: i64,
    /// What happened
    pub change_type: RuleChangeType,
    /// Rule snapshot
    pub rule_data: Value,
    /// Who made the change
    pub changed_by: String,
    /// When
    pub changed_at: DateTime<Utc>,
    /// Optional reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_reason: Option<String>,
}

/// Relationship kinds between rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// The rule needs the other active
    Requires,
    /// The rules cannot both be active
    Conflicts,
    /// The rule builds on the other
    Enhances,
    /// The rule supersedes the other
    Replaces,
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Requires => "requires",
            Self::Conflicts => "conflicts",
            Self::Enhances => "enhances",
            Self::Replaces => "replaces",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for DependencyType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "requires" => Ok(Self::Requires),
            "conflicts" => Ok(Self::Conflicts),
            "enhances" => Ok(Self::Enhances),
            "replaces" => Ok(Self::Replaces),
            other => Err(EngineError::rule_validation(format!(
                "Unknown dependency type: {}",
                other
            ))),
        }
    }
}

/// Dependency relationship between two rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDependency {
    /// Entry id
    pub id: String,
    /// Depending rule
    pub rule_id: String,
    /// Depended-on rule
    pub depends_on_rule_id: String,
    /// Relationship kind
    pub dependency_type: DependencyType,
    /// When the relationship was recorded
    pub created_at: DateTime<Utc>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Binding of a rule to a concrete scope target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleAssignment {
    /// Entry id
    pub id: String,
    /// Assigned rule
    pub rule_id: String,
    /// Scope kind
    pub scope_type: RuleScope,
    /// Concrete scope identifier
    pub scope_id: String,
    /// Priority bucket override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_override: Option<i64>,
    /// Temporal window start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_from: Option<DateTime<Utc>>,
    /// Temporal window end
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_until: Option<DateTime<Utc>>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Typed template parameter kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateParameterType {
    /// UTF-8 string
    String,
    /// Whole number
    Integer,
    /// Floating point number
    Float,
    /// true/false
    Boolean,
    /// List of values
    List,
}

/// One typed parameter of a rule template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateParameter {
    /// Parameter name referenced by placeholders
    pub name: String,
    /// Expected type
    #[serde(rename = "type")]
    pub kind: TemplateParameterType,
    /// Whether instantiation must supply a value
    #[serde(default)]
    pub required: bool,
    /// Default used when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    /// Closed set of permitted values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<Value>>,
    /// Regex a string value must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_pattern: Option<String>,
}

/// Parameterized rule template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleTemplate {
    /// Template id
    pub id: String,
    /// Template name
    pub name: String,
    /// Human description
    pub description: String,
    /// Rule type produced on instantiation
    pub rule_type: RuleType,
    /// Typed parameters
    #[serde(default)]
    pub parameters: Vec<TemplateParameter>,
    /// Template body rendered into a rule
    pub template_data: Value,
    /// Organizational category
    pub category: String,
    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Creator
    pub created_by: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_priority_values() {
        assert_eq!(RulePriority::Advisory.value(), 100);
        assert_eq!(RulePriority::Low.value(), 250);
        assert_eq!(RulePriority::Normal.value(), 500);
        assert_eq!(RulePriority::High.value(), 750);
        assert_eq!(RulePriority::Critical.value(), 1000);
        assert_eq!(RulePriority::from_value(750).unwrap(), RulePriority::High);
        assert!(RulePriority::from_value(123).is_err());
    }

    #[test]
    fn test_scope_rank_ordering() {
        assert!(RuleScope::Global.rank() < RuleScope::Project.rank());
        assert!(RuleScope::Project.rank() < RuleScope::Machine.rank());
        assert!(RuleScope::Machine.rank() < RuleScope::Agent.rank());
        assert!(RuleScope::Agent.rank() < RuleScope::Session.rank());
    }

    #[test]
    fn test_applicability_window() {
        let mut rule = Rule::new(
            "r",
            RuleType::Communication,
            RuleScope::Global,
            RulePriority::Normal,
            "tests",
        );
        let now = Utc::now();
        assert!(rule.is_applicable_at(now));

        rule.effective_from = Some(now + Duration::hours(1));
        assert!(!rule.is_applicable_at(now));

        rule.effective_from = Some(now - Duration::hours(2));
        rule.effective_until = Some(now - Duration::hours(1));
        assert!(!rule.is_applicable_at(now));

        rule.effective_until = Some(now + Duration::hours(1));
        assert!(rule.is_applicable_at(now));

        rule.status = RuleStatus::Inactive;
        assert!(!rule.is_applicable_at(now));
    }

    #[test]
    fn test_enum_string_roundtrip() {
        for s in ["global", "project", "machine", "agent", "session"] {
            assert_eq!(RuleScope::from_str(s).unwrap().to_string(), s);
        }
        for s in ["created", "updated", "deleted", "imported"] {
            assert_eq!(RuleChangeType::from_str(s).unwrap().to_string(), s);
        }
        assert_eq!(
            ConflictResolution::from_str("most_specific")
                .unwrap()
                .to_string(),
            "most_specific"
        );
    }

    #[test]
    fn test_condition_serde_wire_names() {
        let condition: RuleCondition = serde_json::from_str(
            r#"{"field": "task_type", "operator": "startswith", "value": "code"}"#,
        )
        .unwrap();
        assert_eq!(condition.operator, ConditionOperator::Startswith);
        assert!(condition.case_sensitive);
    }
}
