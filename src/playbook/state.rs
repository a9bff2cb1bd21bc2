//! Execution state machines and per-run context

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::model::{ActionKind, ApprovalGate};

/// Run-level states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Registered, not yet scheduled
    Pending,
    /// Waves are being scheduled
    Running,
    /// Pause latch honored at a wave boundary
    Paused,
    /// All waves finished with no failed step
    Completed,
    /// At least one step failed
    Failed,
    /// Cancel latch honored
    Cancelled,
    /// Rollback sweep in progress
    RollingBack,
    /// Rollback sweep finished
    RolledBack,
}

impl ExecutionState {
    /// Whether the run can no longer make forward progress
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::RolledBack
        )
    }
}

/// Step-level states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Not yet started
    Pending,
    /// Currently executing
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Gate conditions not met
    Skipped,
    /// Waiting on a human approval
    WaitingApproval,
    /// Rollback action executing
    RollingBack,
    /// Rollback action done
    RolledBack,
}

impl StepState {
    /// Whether the step will not run again within this execution
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::RolledBack
        )
    }
}

/// Result of one validation check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    /// Whether the check passed
    pub valid: bool,
    /// Human-readable explanation
    pub message: String,
    /// Structured details
    #[serde(default)]
    pub details: Value,
}

impl ValidationOutcome {
    /// A passing result
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            valid: true,
            message: message.into(),
            details: Value::Null,
        }
    }

    /// A failing result
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: message.into(),
            details: Value::Null,
        }
    }

    /// Attach structured details
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Rollback action registered when a step completes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackAction {
    /// Step that registered the action
    pub step_id: String,
    /// Inverse action
    pub action: ActionKind,
    /// Action arguments
    pub args: Map<String, Value>,
    /// Human description
    pub description: String,
}

/// Recorded outcome of one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step id
    pub step_id: String,
    /// Display name
    pub name: String,
    /// When execution started
    pub started_at: Option<DateTime<Utc>>,
    /// When execution finished
    pub finished_at: Option<DateTime<Utc>>,
    /// Current state
    pub state: StepState,
    /// Outputs produced by the action
    pub outputs: HashMap<String, Value>,
    /// Error text when failed
    pub error: Option<String>,
    /// Pre- and post-execution validation results
    pub validation_results: Vec<ValidationOutcome>,
    /// Number of retries performed
    pub retry_count: u32,
    /// Rollback actions registered by this step
    pub rollback_actions: Vec<RollbackAction>,
    /// Approvers recorded against the gate
    pub approvals: Vec<String>,
    /// Parallel group membership
    pub parallel_group: Option<String>,
    /// Declared dependencies
    pub dependencies: Vec<String>,
}

impl StepResult {
    /// Initialize a pending result for a step
    pub fn pending(
        step_id: &str,
        name: &str,
        parallel_group: Option<String>,
        dependencies: Vec<String>,
    ) -> Self {
        Self {
            step_id: step_id.to_string(),
            name: name.to_string(),
            started_at: None,
            finished_at: None,
            state: StepState::Pending,
            outputs: HashMap::new(),
            error: None,
            validation_results: Vec::new(),
            retry_count: 0,
            rollback_actions: Vec::new(),
            approvals: Vec::new(),
            parallel_group,
            dependencies,
        }
    }

    /// Wall-clock duration in seconds, when finished
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// Per-run execution context, owned by the supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Run identifier
    pub run_id: String,
    /// Host-assigned playbook identifier
    pub playbook_id: i64,
    /// Host-assigned version identifier
    pub version_id: i64,
    /// Run state
    pub state: ExecutionState,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
    /// Caller-supplied parameters, immutable for the run
    pub parameters: HashMap<String, Value>,
    /// Variables exported by step outputs
    pub variables: HashMap<String, Value>,
    /// Per-step results
    pub step_results: HashMap<String, StepResult>,
    /// Index of the next wave to schedule
    pub current_wave_index: usize,
    /// Parallel group membership index
    pub parallel_groups: HashMap<String, Vec<String>>,
    /// Approval gates keyed by step id
    pub approval_gates: HashMap<String, ApprovalGate>,
    /// LIFO stack of registered rollback actions
    pub rollback_stack: Vec<RollbackAction>,
    /// Errors accumulated outside step results
    pub error_log: Vec<String>,
    /// Pause latch, checked between waves
    pub pause_requested: bool,
    /// Cancel latch, checked between waves
    pub cancel_requested: bool,
}

impl ExecutionContext {
    /// Create a fresh context in the pending state
    pub fn new(run_id: String, parameters: HashMap<String, Value>) -> Self {
        Self {
            run_id,
            playbook_id: 0,
            version_id: 0,
            state: ExecutionState::Pending,
            started_at: Utc::now(),
            finished_at: None,
            parameters,
            variables: HashMap::new(),
            step_results: HashMap::new(),
            current_wave_index: 0,
            parallel_groups: HashMap::new(),
            approval_gates: HashMap::new(),
            rollback_stack: Vec::new(),
            error_log: Vec::new(),
            pause_requested: false,
            cancel_requested: false,
        }
    }

    /// Combined parameters and variables view used for interpolation
    pub fn scope(&self) -> HashMap<String, Value> {
        let mut scope = self.parameters.clone();
        scope.extend(self.variables.clone());
        scope
    }

    /// Wall-clock duration in seconds, when finished
    pub fn duration_secs(&self) -> Option<f64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }

    /// Copy-out status snapshot
    pub fn snapshot(&self) -> ExecutionStatus {
        ExecutionStatus {
            run_id: self.run_id.clone(),
            state: self.state,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_secs: self.duration_secs(),
            current_wave_index: self.current_wave_index,
            total_steps: self.step_results.len(),
            completed_steps: self
                .step_results
                .values()
                .filter(|r| r.state == StepState::Completed)
                .count(),
            failed_steps: self
                .step_results
                .values()
                .filter(|r| r.state == StepState::Failed)
                .count(),
            parameters: self.parameters.clone(),
            variables: self.variables.clone(),
            error_log: self.error_log.clone(),
            step_results: self.step_results.clone(),
        }
    }
}

/// Serializable status snapshot returned by the control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatus {
    /// Run identifier
    pub run_id: String,
    /// Run state
    pub state: ExecutionState,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run finished
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in seconds
    pub duration_secs: Option<f64>,
    /// Index of the next wave to schedule
    pub current_wave_index: usize,
    /// Total number of steps
    pub total_steps: usize,
    /// Steps completed so far
    pub completed_steps: usize,
    /// Steps failed so far
    pub failed_steps: usize,
    /// Caller-supplied parameters
    pub parameters: HashMap<String, Value>,
    /// Variables exported so far
    pub variables: HashMap<String, Value>,
    /// Errors accumulated outside step results
    pub error_log: Vec<String>,
    /// Per-step results
    pub step_results: HashMap<String, StepResult>,
}

/// Compact listing entry for active executions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Run identifier
    pub run_id: String,
    /// Run state
    pub state: ExecutionState,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration in seconds
    pub duration_secs: Option<f64>,
    /// Host-assigned playbook identifier
    pub playbook_id: i64,
}
