//! Advanced rule dispatch
//!
//! Specialized evaluation lanes layered on top of the base evaluator:
//! conditional triggers with cooldowns, cascading rules that schedule
//! other rules, cron-scheduled rules, context-aware adaptation,
//! compliance auditing and security-adaptive responses. Each lane
//! filters for its own advanced type; results merge into one record
//! alongside the base configuration.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::awareness::AwarenessPublisher;
use crate::core::error::Result;

use super::evaluator::{apply_action, rule_matches_context};
use super::model::{Rule, RuleAction, RuleCondition};
use super::store::RuleStore;

/// Metadata key carrying the advanced configuration on a stored rule
pub const ADVANCED_METADATA_KEY: &str = "advanced";

/// Window within which a cron schedule counts as due
const SCHEDULE_WINDOW_SECS: i64 = 60;
/// Threat level above which escalation fires
const ESCALATION_THRESHOLD: f64 = 0.8;

/// Advanced rule specializations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvancedRuleType {
    /// Fires when its trigger conditions hold, with a cooldown
    Conditional,
    /// Triggers other rules after a delay
    Cascading,
    /// Runs on a cron schedule
    TimeBased,
    /// Adapts its actions to observed context patterns
    ContextAware,
    /// Evaluated with an audit trail
    Compliance,
    /// Responds to the current threat level
    SecurityAdaptive,
}

/// Trigger mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Evaluate on every dispatch
    Immediate,
    /// Evaluate per schedule
    Scheduled,
    /// Evaluate on external events
    EventDriven,
    /// Evaluate when a threshold is crossed
    ThresholdBased,
    /// Evaluate on matched patterns
    PatternMatched,
    /// Evaluate when the context changes
    ContextChanged,
}

/// Supported compliance frameworks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceFramework {
    /// EU data protection
    Gdpr,
    /// SOC 2
    Soc2,
    /// US healthcare
    Hipaa,
    /// Payment card industry
    PciDss,
    /// ISO 27001
    Iso27001,
    /// NIST frameworks
    Nist,
    /// Host-defined framework
    Custom,
}

/// Cron-based schedule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeBasedSchedule {
    /// Cron expression (5 or 6 fields; 5-field forms gain a seconds
    /// column of 0)
    pub cron_expression: String,
    /// Schedule timezone label (informational; evaluation uses UTC)
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Do not run before
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    /// Do not run after
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    /// Lifetime execution cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_executions: Option<u32>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Conditional trigger configuration. The predicate grammar is the rule
/// condition set, never a general expression language.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalTrigger {
    /// Conditions that must all hold for the trigger to fire
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    /// Context fields the trigger is allowed to read
    #[serde(default)]
    pub required_context_fields: Vec<String>,
    /// Re-evaluation interval hint in seconds
    #[serde(default = "default_evaluation_interval")]
    pub evaluation_interval: u64,
    /// Seconds the trigger stays quiet after firing
    #[serde(default = "default_cooldown")]
    pub cooldown_period: u64,
}

fn default_evaluation_interval() -> u64 {
    60
}

fn default_cooldown() -> u64 {
    300
}

/// One cascading edge from a primary rule to target rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadingAction {
    /// Rules to evaluate when the primary fires
    pub target_rule_ids: Vec<String>,
    /// Delay in seconds before the cascade runs
    #[serde(default)]
    pub trigger_delay: u64,
    /// Forward the triggering context to targets
    #[serde(default = "default_true")]
    pub pass_context: bool,
    /// Context keys overridden for the cascade
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_override: Option<Map<String, Value>>,
}

fn default_true() -> bool {
    true
}

/// Context-aware adaptation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextAdaptation {
    /// Context fields considered for pattern matching
    #[serde(default)]
    pub adaptation_fields: Vec<String>,
    /// Record adaptations for learning
    #[serde(default = "default_true")]
    pub learning_enabled: bool,
    /// Score at or above which the adapted variant applies
    #[serde(default = "default_adaptation_threshold")]
    pub adaptation_threshold: f64,
    /// Historical window in seconds
    #[serde(default = "default_historical_window")]
    pub historical_window: u64,
}

fn default_adaptation_threshold() -> f64 {
    0.8
}

fn default_historical_window() -> u64 {
    86_400
}

/// Compliance lane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceConfig {
    /// Governing framework
    pub framework: ComplianceFramework,
    /// Framework control identifier
    pub control_id: String,
    /// Severity label
    pub severity_level: String,
    /// Record an audit entry per evaluation
    #[serde(default = "default_true")]
    pub audit_required: bool,
    /// Evidence collection flag
    #[serde(default)]
    pub evidence_collection: bool,
    /// Remediation hints
    #[serde(default)]
    pub remediation_actions: Vec<String>,
}

/// Security-adaptive lane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityAdaptiveConfig {
    /// Threat level at or above which responses activate
    #[serde(default = "default_threat_threshold")]
    pub threat_level_threshold: f64,
    /// Rules notified on escalation
    #[serde(default)]
    pub escalation_rules: Vec<String>,
    /// Indicators the monitor should watch
    #[serde(default)]
    pub threat_indicators: Vec<String>,
    /// Response actions per level (low/medium/high/critical)
    #[serde(default)]
    pub response_actions: HashMap<String, Vec<RuleAction>>,
}

fn default_threat_threshold() -> f64 {
    0.5
}

/// The advanced configuration block attached to a rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedConfig {
    /// Which lane evaluates this rule
    pub advanced_type: AdvancedRuleType,
    /// Trigger mechanism
    #[serde(default = "default_trigger")]
    pub trigger_type: TriggerType,
    /// Cron schedule for time-based rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<TimeBasedSchedule>,
    /// Trigger for conditional rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional_trigger: Option<ConditionalTrigger>,
    /// Cascade edges for cascading rules
    #[serde(default)]
    pub cascading_actions: Vec<CascadingAction>,
    /// Adaptation config for context-aware rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_adaptation: Option<ContextAdaptation>,
    /// Compliance lane config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliance: Option<ComplianceConfig>,
    /// Security lane config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityAdaptiveConfig>,
}

fn default_trigger() -> TriggerType {
    TriggerType::Immediate
}

/// A rule paired with its advanced configuration
#[derive(Debug, Clone)]
pub struct AdvancedRule {
    /// The underlying rule
    pub rule: Rule,
    /// Advanced configuration
    pub config: AdvancedConfig,
}

impl AdvancedRule {
    /// Extract the advanced configuration from a stored rule's metadata
    pub fn from_rule(rule: &Rule) -> Option<AdvancedRule> {
        let raw = rule.metadata.get(ADVANCED_METADATA_KEY)?;
        match serde_json::from_value::<AdvancedConfig>(raw.clone()) {
            Ok(config) => Some(AdvancedRule {
                rule: rule.clone(),
                config,
            }),
            Err(e) => {
                warn!("Rule {} carries malformed advanced config: {}", rule.id, e);
                None
            }
        }
    }

    /// Embed an advanced configuration into a rule's metadata
    pub fn attach(rule: &mut Rule, config: &AdvancedConfig) -> Result<()> {
        rule.metadata.insert(
            ADVANCED_METADATA_KEY.to_string(),
            serde_json::to_value(config)?,
        );
        Ok(())
    }
}

/// Reads the current threat level from an external monitor
#[async_trait]
pub trait ThreatMonitor: Send + Sync {
    /// Current threat level in 0..=1
    async fn current_threat_level(&self, context: &HashMap<String, Value>) -> f64;
}

/// Audit record for one compliance rule evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceAuditRecord {
    /// Audit entry id
    pub audit_id: String,
    /// Audited rule
    pub rule_id: String,
    /// Governing framework
    pub framework: ComplianceFramework,
    /// Framework control identifier
    pub control_id: String,
    /// Severity label
    pub severity_level: String,
    /// When the evaluation ran
    pub executed_at: DateTime<Utc>,
    /// compliant or non_compliant
    pub compliance_status: String,
}

/// Records compliance audit entries. The default implementation pushes
/// records to the awareness sink.
#[async_trait]
pub trait ComplianceAuditor: Send + Sync {
    /// Record one audit entry
    async fn audit(&self, record: &ComplianceAuditRecord) -> anyhow::Result<()>;
}

/// Lane result: conditional rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalOutcome {
    /// Evaluated rule
    pub rule_id: String,
    /// Whether the trigger fired
    pub triggered: bool,
    /// Action results when triggered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Why the trigger did not fire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Lane result: cascading rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadingOutcome {
    /// Primary rule
    pub primary_rule_id: String,
    /// Targets scheduled
    pub cascading_rule_ids: Vec<String>,
    /// Delay before the cascade runs
    pub delay_seconds: u64,
    /// When the cascade is due
    pub scheduled_for: DateTime<Utc>,
}

/// Lane result: time-based rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeBasedOutcome {
    /// Evaluated rule
    pub rule_id: String,
    /// Whether the schedule was due and the rule ran
    pub executed: bool,
    /// Lifetime execution count after this dispatch
    pub execution_count: u32,
    /// Action results when executed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Lane result: context-aware rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextAwareOutcome {
    /// Evaluated rule
    pub rule_id: String,
    /// Whether the adapted variant applied
    pub adapted: bool,
    /// Computed adaptation score
    pub adaptation_score: f64,
    /// Action results
    pub result: Value,
}

/// Lane result: compliance rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceOutcome {
    /// Evaluated rule
    pub rule_id: String,
    /// Governing framework
    pub framework: ComplianceFramework,
    /// Control identifier
    pub control_id: String,
    /// Severity label
    pub severity_level: String,
    /// compliant or non_compliant
    pub compliance_status: String,
    /// Audit entry id
    pub audit_id: String,
}

/// Lane result: security-adaptive rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityOutcome {
    /// Evaluated rule
    pub rule_id: String,
    /// Observed threat level
    pub threat_level: f64,
    /// Whether the threshold was exceeded
    pub threshold_exceeded: bool,
    /// Response bucket applied (low/medium/high/critical)
    pub response_level: String,
    /// Whether escalation fired
    pub escalated: bool,
    /// Action results
    pub result: Value,
}

/// Merged output of one advanced dispatch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdvancedEvaluation {
    /// Conditional lane
    pub conditional: Vec<ConditionalOutcome>,
    /// Cascading lane
    pub cascading: Vec<CascadingOutcome>,
    /// Time-based lane
    pub time_based: Vec<TimeBasedOutcome>,
    /// Context-aware lane
    pub context_aware: Vec<ContextAwareOutcome>,
    /// Compliance lane
    pub compliance: Vec<ComplianceOutcome>,
    /// Security lane
    pub security: Vec<SecurityOutcome>,
}

/// Dispatches advanced rules through their specialized lanes
pub struct AdvancedRuleDispatcher {
    store: Arc<RuleStore>,
    publisher: Arc<AwarenessPublisher>,
    threat_monitor: Option<Arc<dyn ThreatMonitor>>,
    auditor: Option<Arc<dyn ComplianceAuditor>>,
    cooldowns: Mutex<HashMap<String, DateTime<Utc>>>,
    execution_counts: Mutex<HashMap<String, u32>>,
}

impl AdvancedRuleDispatcher {
    /// Create a dispatcher over a store
    pub fn new(store: Arc<RuleStore>, publisher: Arc<AwarenessPublisher>) -> Self {
        Self {
            store,
            publisher,
            threat_monitor: None,
            auditor: None,
            cooldowns: Mutex::new(HashMap::new()),
            execution_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a threat monitor for the security lane
    pub fn with_threat_monitor(mut self, monitor: Arc<dyn ThreatMonitor>) -> Self {
        self.threat_monitor = Some(monitor);
        self
    }

    /// Attach a compliance auditor
    pub fn with_auditor(mut self, auditor: Arc<dyn ComplianceAuditor>) -> Self {
        self.auditor = Some(auditor);
        self
    }

    /// Pull active advanced rules from the store and dispatch them
    pub async fn evaluate(&self, context: &HashMap<String, Value>) -> Result<AdvancedEvaluation> {
        let rules: Vec<AdvancedRule> = self
            .store
            .active_rules()?
            .iter()
            .filter_map(AdvancedRule::from_rule)
            .collect();
        Ok(self.dispatch(&rules, context).await)
    }

    /// Dispatch a pre-selected advanced rule set against a context
    pub async fn dispatch(
        &self,
        rules: &[AdvancedRule],
        context: &HashMap<String, Value>,
    ) -> AdvancedEvaluation {
        let now = Utc::now();
        let mut evaluation = AdvancedEvaluation::default();

        for advanced in rules {
            if !advanced.rule.is_applicable_at(now) {
                continue;
            }
            match advanced.config.advanced_type {
                AdvancedRuleType::Conditional => {
                    evaluation
                        .conditional
                        .push(self.conditional_lane(advanced, context).await);
                }
                AdvancedRuleType::Cascading => {
                    evaluation
                        .cascading
                        .extend(self.cascading_lane(advanced, context));
                }
                AdvancedRuleType::TimeBased => {
                    if let Some(outcome) = self.time_based_lane(advanced).await {
                        evaluation.time_based.push(outcome);
                    }
                }
                AdvancedRuleType::ContextAware => {
                    if let Some(outcome) = self.context_aware_lane(advanced, context) {
                        evaluation.context_aware.push(outcome);
                    }
                }
                AdvancedRuleType::Compliance => {
                    if let Some(outcome) = self.compliance_lane(advanced, context).await {
                        evaluation.compliance.push(outcome);
                    }
                }
                AdvancedRuleType::SecurityAdaptive => {
                    if let Some(outcome) = self.security_lane(advanced, context).await {
                        evaluation.security.push(outcome);
                    }
                }
            }
        }

        evaluation
    }

    async fn conditional_lane(
        &self,
        advanced: &AdvancedRule,
        context: &HashMap<String, Value>,
    ) -> ConditionalOutcome {
        let rule_id = advanced.rule.id.clone();
        let Some(trigger) = &advanced.config.conditional_trigger else {
            return ConditionalOutcome {
                rule_id,
                triggered: false,
                result: None,
                reason: Some("no conditional trigger configured".to_string()),
            };
        };

        // Cooldown
        {
            let cooldowns = self.cooldowns.lock().await;
            if let Some(last) = cooldowns.get(&rule_id) {
                let elapsed = (Utc::now() - *last).num_seconds();
                if elapsed < trigger.cooldown_period as i64 {
                    return ConditionalOutcome {
                        rule_id,
                        triggered: false,
                        result: None,
                        reason: Some("cooldown active".to_string()),
                    };
                }
            }
        }

        // Restricted context: the trigger sees only its declared fields
        let restricted: HashMap<String, Value> = if trigger.required_context_fields.is_empty() {
            context.clone()
        } else {
            trigger
                .required_context_fields
                .iter()
                .filter_map(|field| context.get(field).map(|v| (field.clone(), v.clone())))
                .collect()
        };

        let fired = trigger
            .conditions
            .iter()
            .all(|condition| super::evaluator::condition_matches(condition, &restricted));

        if !fired {
            return ConditionalOutcome {
                rule_id,
                triggered: false,
                result: None,
                reason: Some("conditions not met".to_string()),
            };
        }

        self.cooldowns
            .lock()
            .await
            .insert(rule_id.clone(), Utc::now());

        let result = apply_rule_actions(&advanced.rule);
        self.publisher.emit(
            &format!("Conditional rule triggered: {}", advanced.rule.name),
            "rules",
            json!({"rule_id": rule_id, "rule_type": "conditional"}),
            &["rules", "conditional"],
        );

        ConditionalOutcome {
            rule_id,
            triggered: true,
            result: Some(result),
            reason: None,
        }
    }

    fn cascading_lane(
        &self,
        advanced: &AdvancedRule,
        context: &HashMap<String, Value>,
    ) -> Vec<CascadingOutcome> {
        let mut outcomes = Vec::new();

        for cascade in &advanced.config.cascading_actions {
            let mut cascade_context: HashMap<String, Value> = if cascade.pass_context {
                context.clone()
            } else {
                HashMap::new()
            };
            if let Some(overrides) = &cascade.condition_override {
                for (key, value) in overrides {
                    cascade_context.insert(key.clone(), value.clone());
                }
            }

            let store = self.store.clone();
            let publisher = self.publisher.clone();
            let targets = cascade.target_rule_ids.clone();
            let delay = cascade.trigger_delay;
            tokio::spawn(async move {
                if delay > 0 {
                    tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                }
                for target_id in &targets {
                    match store.get_rule(target_id) {
                        Ok(Some(target)) => {
                            if rule_matches_context(&target, &cascade_context) {
                                let result = apply_rule_actions(&target);
                                publisher.emit(
                                    &format!("Cascading rule executed: {}", target.name),
                                    "rules",
                                    json!({
                                        "rule_id": target_id,
                                        "rule_type": "cascading",
                                        "result": result,
                                    }),
                                    &["rules", "cascading"],
                                );
                            }
                        }
                        Ok(None) => warn!("Cascading target rule not found: {}", target_id),
                        Err(e) => warn!("Cascading target lookup failed: {}", e),
                    }
                }
            });

            outcomes.push(CascadingOutcome {
                primary_rule_id: advanced.rule.id.clone(),
                cascading_rule_ids: cascade.target_rule_ids.clone(),
                delay_seconds: cascade.trigger_delay,
                scheduled_for: Utc::now() + Duration::seconds(cascade.trigger_delay as i64),
            });
        }

        outcomes
    }

    async fn time_based_lane(&self, advanced: &AdvancedRule) -> Option<TimeBasedOutcome> {
        let schedule = advanced.config.schedule.as_ref()?;
        let rule_id = advanced.rule.id.clone();
        let now = Utc::now();

        if let Some(start) = schedule.start_date {
            if now < start {
                return None;
            }
        }
        if let Some(end) = schedule.end_date {
            if now > end {
                return None;
            }
        }

        let parsed = parse_cron(&schedule.cron_expression);
        let Some(parsed) = parsed else {
            warn!(
                "Rule {} carries an invalid cron expression: {}",
                rule_id, schedule.cron_expression
            );
            return None;
        };

        let due = parsed
            .upcoming(Utc)
            .next()
            .map(|next| (next - now).num_seconds() <= SCHEDULE_WINDOW_SECS)
            .unwrap_or(false);

        let mut counts = self.execution_counts.lock().await;
        let count = counts.entry(rule_id.clone()).or_insert(0);

        if !due {
            return Some(TimeBasedOutcome {
                rule_id,
                executed: false,
                execution_count: *count,
                result: None,
            });
        }
        if let Some(max) = schedule.max_executions {
            if *count >= max {
                debug!("Rule {} hit its execution cap ({})", rule_id, max);
                return Some(TimeBasedOutcome {
                    rule_id,
                    executed: false,
                    execution_count: *count,
                    result: None,
                });
            }
        }

        *count += 1;
        let execution_count = *count;
        drop(counts);

        let result = apply_rule_actions(&advanced.rule);
        self.publisher.emit(
            &format!("Scheduled rule executed: {}", advanced.rule.name),
            "rules",
            json!({
                "rule_id": rule_id,
                "rule_type": "time_based",
                "cron_expression": schedule.cron_expression,
                "execution_count": execution_count,
            }),
            &["rules", "scheduled"],
        );

        Some(TimeBasedOutcome {
            rule_id,
            executed: true,
            execution_count,
            result: Some(result),
        })
    }

    fn context_aware_lane(
        &self,
        advanced: &AdvancedRule,
        context: &HashMap<String, Value>,
    ) -> Option<ContextAwareOutcome> {
        let adaptation = advanced.config.context_adaptation.as_ref()?;
        let rule_id = advanced.rule.id.clone();

        let since = Utc::now() - Duration::seconds(adaptation.historical_window as i64);
        let history = self
            .store
            .evaluation_contexts(Some(&rule_id), since)
            .unwrap_or_default();

        // Score: share of recent evaluations whose adaptation fields
        // match the current context
        let score = if history.is_empty() || adaptation.adaptation_fields.is_empty() {
            0.0
        } else {
            let matching = history
                .iter()
                .filter(|past| {
                    adaptation.adaptation_fields.iter().all(|field| {
                        past.get(field).is_some() && past.get(field) == context.get(field)
                    })
                })
                .count();
            matching as f64 / history.len() as f64
        };

        let adapted = score >= adaptation.adaptation_threshold;
        let result = apply_rule_actions(&advanced.rule);

        if adapted && adaptation.learning_enabled {
            self.publisher.emit(
                &format!("Rule adapted to context: {}", advanced.rule.name),
                "rules",
                json!({
                    "rule_id": rule_id,
                    "rule_type": "context_aware",
                    "adaptation_score": score,
                }),
                &["rules", "adaptation"],
            );
        }

        Some(ContextAwareOutcome {
            rule_id,
            adapted,
            adaptation_score: score,
            result,
        })
    }

    async fn compliance_lane(
        &self,
        advanced: &AdvancedRule,
        context: &HashMap<String, Value>,
    ) -> Option<ComplianceOutcome> {
        let config = advanced.config.compliance.as_ref()?;
        let rule_id = advanced.rule.id.clone();

        let matched = rule_matches_context(&advanced.rule, context);
        let compliance_status = if matched { "compliant" } else { "non_compliant" };

        let record = ComplianceAuditRecord {
            audit_id: Uuid::new_v4().to_string(),
            rule_id: rule_id.clone(),
            framework: config.framework,
            control_id: config.control_id.clone(),
            severity_level: config.severity_level.clone(),
            executed_at: Utc::now(),
            compliance_status: compliance_status.to_string(),
        };

        if config.audit_required {
            match &self.auditor {
                Some(auditor) => {
                    if let Err(e) = auditor.audit(&record).await {
                        warn!("Compliance auditor rejected record: {}", e);
                    }
                }
                None => {
                    self.publisher.emit(
                        &format!(
                            "Compliance audit: {:?} {}",
                            record.framework, record.control_id
                        ),
                        "audit",
                        serde_json::to_value(&record).unwrap_or(Value::Null),
                        &["rules", "compliance", "audit"],
                    );
                }
            }
        }

        Some(ComplianceOutcome {
            rule_id,
            framework: config.framework,
            control_id: config.control_id.clone(),
            severity_level: config.severity_level.clone(),
            compliance_status: compliance_status.to_string(),
            audit_id: record.audit_id,
        })
    }

    async fn security_lane(
        &self,
        advanced: &AdvancedRule,
        context: &HashMap<String, Value>,
    ) -> Option<SecurityOutcome> {
        let config = advanced.config.security.as_ref()?;
        let rule_id = advanced.rule.id.clone();

        let threat_level = match &self.threat_monitor {
            Some(monitor) => monitor.current_threat_level(context).await.clamp(0.0, 1.0),
            None => 0.0,
        };
        let exceeded = threat_level >= config.threat_level_threshold;
        let response_level = categorize_threat_level(threat_level).to_string();

        let actions: &[RuleAction] = if exceeded {
            config
                .response_actions
                .get(&response_level)
                .map(|a| a.as_slice())
                .unwrap_or(&advanced.rule.actions)
        } else {
            &advanced.rule.actions
        };
        let result = apply_actions(actions);

        let escalated = exceeded
            && threat_level > ESCALATION_THRESHOLD
            && !config.escalation_rules.is_empty();
        if escalated {
            for escalation_rule in &config.escalation_rules {
                self.publisher.emit(
                    &format!("Security escalation triggered by {}", advanced.rule.name),
                    "security",
                    json!({
                        "rule_id": rule_id,
                        "escalation_rule": escalation_rule,
                        "threat_level": threat_level,
                    }),
                    &["rules", "security", "escalation"],
                );
            }
        }
        if exceeded {
            self.publisher.emit(
                &format!("Security adaptive rule triggered: {}", advanced.rule.name),
                "security",
                json!({
                    "rule_id": rule_id,
                    "threat_level": threat_level,
                    "response_level": response_level,
                }),
                &["rules", "security"],
            );
        }

        Some(SecurityOutcome {
            rule_id,
            threat_level,
            threshold_exceeded: exceeded,
            response_level,
            escalated,
            result,
        })
    }
}

/// Apply all of a rule's actions into a standalone result fragment
fn apply_rule_actions(rule: &Rule) -> Value {
    apply_actions(&rule.actions)
}

fn apply_actions(actions: &[RuleAction]) -> Value {
    let results: Vec<Value> = actions
        .iter()
        .map(|action| {
            json!({
                "action_type": action.action_type,
                "target": action.target,
                "result": apply_action(action, None),
            })
        })
        .collect();
    json!({ "action_results": results })
}

/// Bucket a threat level into a response category
pub fn categorize_threat_level(threat_level: f64) -> &'static str {
    if threat_level >= 0.9 {
        "critical"
    } else if threat_level >= 0.7 {
        "high"
    } else if threat_level >= 0.5 {
        "medium"
    } else {
        "low"
    }
}

/// Parse a cron expression, tolerating the common 5-field form by
/// prepending a seconds column
fn parse_cron(expression: &str) -> Option<Schedule> {
    if let Ok(schedule) = Schedule::from_str(expression) {
        return Some(schedule);
    }
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        return Schedule::from_str(&format!("0 {}", expression)).ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::{RuleActionType, RulePriority, RuleScope, RuleType};
    use tempfile::TempDir;

    fn store() -> (Arc<RuleStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            RuleStore::open(
                dir.path().join("rules.db"),
                Arc::new(AwarenessPublisher::disabled()),
                "test-machine",
            )
            .unwrap(),
        );
        (store, dir)
    }

    fn base_rule(name: &str) -> Rule {
        let mut rule = Rule::new(
            name,
            RuleType::Operational,
            RuleScope::Global,
            RulePriority::Normal,
            "tests",
        );
        rule.actions.push(RuleAction {
            action_type: RuleActionType::Set,
            target: "mode".to_string(),
            value: json!("strict"),
            parameters: Map::new(),
        });
        rule
    }

    fn advanced(name: &str, config: AdvancedConfig) -> AdvancedRule {
        let mut rule = base_rule(name);
        AdvancedRule::attach(&mut rule, &config).unwrap();
        AdvancedRule::from_rule(&rule).unwrap()
    }

    #[test]
    fn test_threat_buckets() {
        assert_eq!(categorize_threat_level(0.95), "critical");
        assert_eq!(categorize_threat_level(0.9), "critical");
        assert_eq!(categorize_threat_level(0.75), "high");
        assert_eq!(categorize_threat_level(0.5), "medium");
        assert_eq!(categorize_threat_level(0.2), "low");
    }

    #[test]
    fn test_cron_five_field_form() {
        assert!(parse_cron("* * * * *").is_some());
        assert!(parse_cron("0 3 * * 1").is_some());
        assert!(parse_cron("not a cron").is_none());
    }

    #[test]
    fn test_advanced_config_roundtrip_through_metadata() {
        let config = AdvancedConfig {
            advanced_type: AdvancedRuleType::Conditional,
            trigger_type: TriggerType::Immediate,
            schedule: None,
            conditional_trigger: Some(ConditionalTrigger {
                conditions: vec![],
                required_context_fields: vec!["task_type".to_string()],
                evaluation_interval: 60,
                cooldown_period: 10,
            }),
            cascading_actions: vec![],
            context_adaptation: None,
            compliance: None,
            security: None,
        };
        let mut rule = base_rule("roundtrip");
        AdvancedRule::attach(&mut rule, &config).unwrap();
        let parsed = AdvancedRule::from_rule(&rule).unwrap();
        assert_eq!(parsed.config.advanced_type, AdvancedRuleType::Conditional);
    }

    #[tokio::test]
    async fn test_conditional_cooldown() {
        let (store, _dir) = store();
        let dispatcher =
            AdvancedRuleDispatcher::new(store, Arc::new(AwarenessPublisher::disabled()));

        let rule = advanced(
            "cooldown",
            AdvancedConfig {
                advanced_type: AdvancedRuleType::Conditional,
                trigger_type: TriggerType::Immediate,
                schedule: None,
                conditional_trigger: Some(ConditionalTrigger {
                    conditions: vec![RuleCondition {
                        field: "task_type".to_string(),
                        operator: crate::rules::model::ConditionOperator::Eq,
                        value: json!("deploy"),
                        case_sensitive: true,
                    }],
                    required_context_fields: vec!["task_type".to_string()],
                    evaluation_interval: 60,
                    cooldown_period: 300,
                }),
                cascading_actions: vec![],
                context_adaptation: None,
                compliance: None,
                security: None,
            },
        );

        let mut context = HashMap::new();
        context.insert("task_type".to_string(), json!("deploy"));

        let first = dispatcher.dispatch(&[rule.clone()], &context).await;
        assert!(first.conditional[0].triggered);

        let second = dispatcher.dispatch(&[rule], &context).await;
        assert!(!second.conditional[0].triggered);
        assert_eq!(second.conditional[0].reason.as_deref(), Some("cooldown active"));
    }

    #[tokio::test]
    async fn test_time_based_every_second_schedule() {
        let (store, _dir) = store();
        let dispatcher =
            AdvancedRuleDispatcher::new(store, Arc::new(AwarenessPublisher::disabled()));

        let rule = advanced(
            "scheduled",
            AdvancedConfig {
                advanced_type: AdvancedRuleType::TimeBased,
                trigger_type: TriggerType::Scheduled,
                schedule: Some(TimeBasedSchedule {
                    cron_expression: "* * * * * *".to_string(),
                    timezone: "UTC".to_string(),
                    start_date: None,
                    end_date: None,
                    max_executions: Some(1),
                }),
                conditional_trigger: None,
                cascading_actions: vec![],
                context_adaptation: None,
                compliance: None,
                security: None,
            },
        );

        let first = dispatcher.dispatch(&[rule.clone()], &HashMap::new()).await;
        assert!(first.time_based[0].executed);
        assert_eq!(first.time_based[0].execution_count, 1);

        // Execution cap reached
        let second = dispatcher.dispatch(&[rule], &HashMap::new()).await;
        assert!(!second.time_based[0].executed);
    }

    #[tokio::test]
    async fn test_security_lane_buckets_and_escalation() {
        struct FixedThreat(f64);

        #[async_trait]
        impl ThreatMonitor for FixedThreat {
            async fn current_threat_level(&self, _context: &HashMap<String, Value>) -> f64 {
                self.0
            }
        }

        let (store, _dir) = store();
        let dispatcher =
            AdvancedRuleDispatcher::new(store, Arc::new(AwarenessPublisher::disabled()))
                .with_threat_monitor(Arc::new(FixedThreat(0.85)));

        let mut response_actions = HashMap::new();
        response_actions.insert(
            "high".to_string(),
            vec![RuleAction {
                action_type: RuleActionType::Block,
                target: "shell_access".to_string(),
                value: json!("threat level high"),
                parameters: Map::new(),
            }],
        );

        let rule = advanced(
            "secure",
            AdvancedConfig {
                advanced_type: AdvancedRuleType::SecurityAdaptive,
                trigger_type: TriggerType::ThresholdBased,
                schedule: None,
                conditional_trigger: None,
                cascading_actions: vec![],
                context_adaptation: None,
                compliance: None,
                security: Some(SecurityAdaptiveConfig {
                    threat_level_threshold: 0.5,
                    escalation_rules: vec!["escalate-1".to_string()],
                    threat_indicators: vec![],
                    response_actions,
                }),
            },
        );

        let outcome = dispatcher.dispatch(&[rule], &HashMap::new()).await;
        let security = &outcome.security[0];
        assert!(security.threshold_exceeded);
        assert_eq!(security.response_level, "high");
        assert!(security.escalated);
        let results = security.result["action_results"].as_array().unwrap();
        assert_eq!(results[0]["target"], json!("shell_access"));
    }

    #[tokio::test]
    async fn test_compliance_lane_records_audit() {
        use std::sync::Mutex as StdMutex;

        struct Recorder(StdMutex<Vec<ComplianceAuditRecord>>);

        #[async_trait]
        impl ComplianceAuditor for Recorder {
            async fn audit(&self, record: &ComplianceAuditRecord) -> anyhow::Result<()> {
                self.0.lock().unwrap().push(record.clone());
                Ok(())
            }
        }

        let (store, _dir) = store();
        let recorder = Arc::new(Recorder(StdMutex::new(Vec::new())));
        let dispatcher =
            AdvancedRuleDispatcher::new(store, Arc::new(AwarenessPublisher::disabled()))
                .with_auditor(recorder.clone());

        let rule = advanced(
            "gdpr",
            AdvancedConfig {
                advanced_type: AdvancedRuleType::Compliance,
                trigger_type: TriggerType::Immediate,
                schedule: None,
                conditional_trigger: None,
                cascading_actions: vec![],
                context_adaptation: None,
                compliance: Some(ComplianceConfig {
                    framework: ComplianceFramework::Gdpr,
                    control_id: "art-32".to_string(),
                    severity_level: "high".to_string(),
                    audit_required: true,
                    evidence_collection: false,
                    remediation_actions: vec![],
                }),
                security: None,
            },
        );

        let outcome = dispatcher.dispatch(&[rule], &HashMap::new()).await;
        assert_eq!(outcome.compliance[0].compliance_status, "compliant");
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }
}
