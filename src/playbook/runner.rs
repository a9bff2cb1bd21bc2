//! Step runner - drives one step through its full pipeline
//!
//! Pre-validation, approval gating, interpolation, retried action
//! execution with post-validation, output export and rollback
//! registration. Failures never propagate past the runner; they are
//! contained in the step's result.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::awareness::AwarenessPublisher;

use super::actions::ActionExecutor;
use super::conditions;
use super::model::Step;
use super::retry::{ErrorClassifier, ErrorContext};
use super::state::{ExecutionContext, RollbackAction, StepState, ValidationOutcome};
use super::validators::{ApprovalHandler, ValidatorRegistry};

/// Outcome of running one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Step finished successfully
    Completed,
    /// Gate conditions not met, step skipped
    Skipped,
    /// Step failed after exhausting retries
    Failed,
    /// Step parked waiting on human approval
    AwaitingApproval,
}

/// Executes individual steps against a shared execution context
pub struct StepRunner {
    executor: Arc<ActionExecutor>,
    classifier: Arc<ErrorClassifier>,
    validators: Arc<ValidatorRegistry>,
    approval: Arc<RwLock<Option<Arc<dyn ApprovalHandler>>>>,
    publisher: Arc<AwarenessPublisher>,
}

impl StepRunner {
    /// Assemble a runner from its collaborators
    pub fn new(
        executor: Arc<ActionExecutor>,
        classifier: Arc<ErrorClassifier>,
        validators: Arc<ValidatorRegistry>,
        approval: Arc<RwLock<Option<Arc<dyn ApprovalHandler>>>>,
        publisher: Arc<AwarenessPublisher>,
    ) -> Self {
        Self {
            executor,
            classifier,
            validators,
            approval,
            publisher,
        }
    }

    /// Run one step to an outcome
    pub async fn run_step(&self, step: &Step, context: &Arc<RwLock<ExecutionContext>>) -> StepOutcome {
        let (run_id, scope, ctx_snapshot, already_approved) = {
            let mut ctx = context.write().await;
            let result = ctx
                .step_results
                .entry(step.id.clone())
                .or_insert_with(|| {
                    super::state::StepResult::pending(
                        &step.id,
                        &step.name,
                        step.parallel_group.clone(),
                        step.depends_on.clone(),
                    )
                });
            result.state = StepState::Running;
            if result.started_at.is_none() {
                result.started_at = Some(Utc::now());
            }
            let approved = step
                .approval_gate
                .as_ref()
                .map(|gate| {
                    result
                        .approvals
                        .iter()
                        .any(|a| gate.required_approvers.contains(a))
                })
                .unwrap_or(false);
            (ctx.run_id.clone(), ctx.scope(), ctx.clone(), approved)
        };

        // Gate conditions: any failure skips the step, which is not a failure
        if !conditions::evaluate_all(&step.when, &scope) {
            debug!("Step {} skipped: when conditions not met", step.id);
            let mut ctx = context.write().await;
            if let Some(result) = ctx.step_results.get_mut(&step.id) {
                result.state = StepState::Skipped;
                result.finished_at = Some(Utc::now());
            }
            return StepOutcome::Skipped;
        }

        // External pre-execution validators
        let mut pre_results: Vec<ValidationOutcome> = Vec::new();
        for config in &step.validators {
            let Some(kind) = config.get("type").and_then(Value::as_str) else {
                continue;
            };
            match self.validators.get(kind).await {
                Some(validator) => {
                    pre_results.push(validator.validate(config, &ctx_snapshot).await);
                }
                None => warn!("No validator registered for type '{}', skipping", kind),
            }
        }
        let pre_failed = pre_results.iter().any(|r| !r.valid);
        if !pre_results.is_empty() {
            let mut ctx = context.write().await;
            if let Some(result) = ctx.step_results.get_mut(&step.id) {
                result.validation_results.extend(pre_results);
            }
        }
        if pre_failed {
            return self
                .fail_step(step, context, "Pre-execution validation failed".to_string())
                .await;
        }

        // Approval gate
        if let Some(gate) = &step.approval_gate {
            if !already_approved {
                // Expired gates either auto-approve or fail
                let waited = (Utc::now() - ctx_snapshot
                    .step_results
                    .get(&step.id)
                    .and_then(|r| r.started_at)
                    .unwrap_or_else(Utc::now))
                .num_seconds();
                let expired = gate
                    .timeout_seconds
                    .map(|t| waited >= t as i64)
                    .unwrap_or(false);

                if expired {
                    if !gate.auto_approve_after_timeout {
                        return self
                            .fail_step(step, context, "approval not granted".to_string())
                            .await;
                    }
                    warn!("Approval gate for step {} expired, auto-approving", step.id);
                } else {
                    let handler = self.approval.read().await.clone();
                    match handler {
                        Some(handler) => {
                            let approved =
                                handler.request_approval(gate).await.unwrap_or(false);
                            if !approved {
                                let mut ctx = context.write().await;
                                if let Some(result) = ctx.step_results.get_mut(&step.id) {
                                    result.state = StepState::WaitingApproval;
                                }
                                self.publisher.emit(
                                    &format!("Step waiting for approval: {}", step.name),
                                    "playbook_execution",
                                    json!({"run_id": run_id, "step_id": step.id}),
                                    &["playbook", "approval"],
                                );
                                return StepOutcome::AwaitingApproval;
                            }
                        }
                        None => {
                            warn!(
                                "Approval gate configured but no handler available for step {}",
                                step.id
                            );
                        }
                    }
                }
            }
        }

        // Interpolate the step against parameters and variables
        let istep = step.interpolated(&scope);
        let retry = istep.retry.clone().unwrap_or_default();

        // Retried execution loop
        let mut attempt: u32 = 0;
        loop {
            {
                let mut ctx = context.write().await;
                if let Some(result) = ctx.step_results.get_mut(&step.id) {
                    result.retry_count = attempt;
                }
            }

            let error_message = match self.executor.execute(istep.action, &istep.args).await {
                Ok(outputs) => {
                    // Post-validation sees params, variables and this step's outputs
                    let mut validation_scope = scope.clone();
                    validation_scope.extend(outputs.clone());
                    let post_results: Vec<ValidationOutcome> = istep
                        .validations
                        .iter()
                        .map(|v| {
                            if conditions::evaluate(v, &validation_scope) {
                                ValidationOutcome::ok(format!("Validation passed: {}", v.kind))
                            } else {
                                ValidationOutcome::fail(format!("Validation failed: {}", v.kind))
                                    .with_details(json!({"condition": v}))
                            }
                        })
                        .collect();
                    let failed: Vec<String> = post_results
                        .iter()
                        .filter(|r| !r.valid)
                        .map(|r| r.message.clone())
                        .collect();
                    {
                        let mut ctx = context.write().await;
                        if let Some(result) = ctx.step_results.get_mut(&step.id) {
                            result.validation_results.extend(post_results);
                        }
                    }
                    if failed.is_empty() {
                        return self.complete_step(&istep, context, outputs, &run_id).await;
                    }
                    failed.join("; ")
                }
                Err(e) => format!("{:#}", e),
            };

            let decision = self
                .classifier
                .decide(&ErrorContext {
                    step_id: step.id.clone(),
                    run_id: run_id.clone(),
                    error_message: error_message.clone(),
                    attempt_number: attempt,
                })
                .await;

            let category_allowed = retry.retry_on_errors.is_empty()
                || retry
                    .retry_on_errors
                    .iter()
                    .any(|c| c == &decision.category.to_string());
            let attempts_left = attempt + 1 < retry.max_attempts;

            if !decision.should_retry || !attempts_left || !category_allowed {
                let reason = if !attempts_left {
                    format!(
                        "{} (failed after {} attempts)",
                        error_message,
                        attempt + 1
                    )
                } else {
                    format!("{} ({})", error_message, decision.reason)
                };
                return self.fail_step(step, context, reason).await;
            }

            warn!(
                "Step {} failed (attempt {}), retrying in {:.2}s: {}",
                step.id,
                attempt + 1,
                decision.delay_seconds,
                error_message
            );
            self.publisher.emit(
                &format!("Retry attempt for step: {}", step.name),
                "playbook_execution",
                json!({
                    "run_id": run_id,
                    "step_id": step.id,
                    "attempt_number": attempt,
                    "delay_seconds": decision.delay_seconds,
                    "error_category": decision.category.to_string(),
                }),
                &["playbook", "retry"],
            );

            if decision.delay_seconds > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(decision.delay_seconds)).await;
            }
            attempt += 1;
        }
    }

    async fn complete_step(
        &self,
        step: &Step,
        context: &Arc<RwLock<ExecutionContext>>,
        outputs: HashMap<String, Value>,
        run_id: &str,
    ) -> StepOutcome {
        {
            let mut ctx = context.write().await;

            // Export declared outputs into the run's variable map
            for mapping in &step.outputs {
                if mapping.name.is_empty() {
                    continue;
                }
                if mapping.from == "value" {
                    ctx.variables.insert(
                        mapping.name.clone(),
                        mapping.value.clone().unwrap_or(Value::Null),
                    );
                } else if let Some(value) = outputs.get(&mapping.from) {
                    ctx.variables.insert(mapping.name.clone(), value.clone());
                }
            }

            // Rollback actions register only on full completion
            let rollback_actions: Vec<RollbackAction> = step
                .rollback
                .iter()
                .map(|spec| RollbackAction {
                    step_id: step.id.clone(),
                    action: spec.action,
                    args: spec.args.clone(),
                    description: spec
                        .description
                        .clone()
                        .unwrap_or_else(|| "Rollback action".to_string()),
                })
                .collect();
            ctx.rollback_stack.extend(rollback_actions.clone());

            if let Some(result) = ctx.step_results.get_mut(&step.id) {
                result.outputs = outputs;
                result.rollback_actions = rollback_actions;
                result.state = StepState::Completed;
                result.finished_at = Some(Utc::now());
            }
        }

        self.classifier.record_success(&step.id);
        self.publisher.emit(
            &format!("Step completed: {}", step.name),
            "playbook_execution",
            json!({"run_id": run_id, "step_id": step.id}),
            &["playbook", "execution"],
        );
        StepOutcome::Completed
    }

    async fn fail_step(
        &self,
        step: &Step,
        context: &Arc<RwLock<ExecutionContext>>,
        error: String,
    ) -> StepOutcome {
        let run_id = {
            let mut ctx = context.write().await;
            if let Some(result) = ctx.step_results.get_mut(&step.id) {
                result.state = StepState::Failed;
                result.error = Some(error.clone());
                result.finished_at = Some(Utc::now());
            }
            ctx.run_id.clone()
        };
        self.publisher.emit(
            &format!("Step failed: {} - {}", step.name, error),
            "playbook_execution",
            json!({"run_id": run_id, "step_id": step.id, "error": error}),
            &["playbook", "execution", "failure"],
        );
        StepOutcome::Failed
    }
}
