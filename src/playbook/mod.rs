//! Playbook execution engine
//!
//! Declarative playbooks run as ordered waves of steps with variable
//! interpolation, pre/post validation, retry with circuit breaking,
//! pause/resume, cancellation, rollback, dry-run and approval gates.

pub mod actions;
pub mod conditions;
pub mod interpolate;
pub mod model;
pub mod plan;
pub mod retry;
pub mod runner;
pub mod state;
pub mod supervisor;
pub mod validators;

pub use actions::ActionExecutor;
pub use conditions::{evaluate as evaluate_condition, Condition};
pub use interpolate::{substitute, substitute_str};
pub use model::{
    ActionKind, ApprovalGate, OutputMapping, ParameterSpec, Playbook, PrerequisiteSpec,
    RetryConfig, RollbackSpec, Step,
};
pub use plan::build_execution_plan;
pub use retry::{
    ErrorCategory, ErrorClassifier, ErrorContext, ErrorPattern, RecoveryHandler, RetryDecision,
    RetryStrategy,
};
pub use runner::{StepOutcome, StepRunner};
pub use state::{
    ExecutionContext, ExecutionState, ExecutionStatus, ExecutionSummary, RollbackAction,
    StepResult, StepState, ValidationOutcome,
};
pub use supervisor::PlaybookEngine;
pub use validators::{ApprovalHandler, RollbackHandler, StepValidator, ValidatorRegistry};
