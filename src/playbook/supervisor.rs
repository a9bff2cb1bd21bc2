//! Execution supervisor - owns runs and drives their waves
//!
//! One engine instance supervises many runs. Each run's context lives
//! behind its own lock; the registry of active executions sits behind a
//! single coarse mutex that all external control operations dispatch
//! through. Status snapshots are returned by value.

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::awareness::AwarenessPublisher;
use crate::core::error::Result;
use crate::core::EngineConfig;

use super::actions::ActionExecutor;
use super::conditions;
use super::model::Playbook;
use super::plan::build_execution_plan;
use super::retry::{ErrorClassifier, RecoveryHandler};
use super::runner::{StepOutcome, StepRunner};
use super::state::{
    ExecutionContext, ExecutionState, ExecutionStatus, ExecutionSummary, StepResult, StepState,
    ValidationOutcome,
};
use super::validators::{ApprovalHandler, RollbackHandler, StepValidator, ValidatorRegistry};

#[derive(Clone)]
struct ExecutionHandle {
    playbook: Arc<Playbook>,
    plan: Arc<Vec<Vec<String>>>,
    context: Arc<RwLock<ExecutionContext>>,
}

struct EngineInner {
    executor: Arc<ActionExecutor>,
    classifier: Arc<ErrorClassifier>,
    validators: Arc<ValidatorRegistry>,
    approval: Arc<RwLock<Option<Arc<dyn ApprovalHandler>>>>,
    rollback_handlers: RwLock<HashMap<String, Arc<dyn RollbackHandler>>>,
    publisher: Arc<AwarenessPublisher>,
    runner: Arc<StepRunner>,
    executions: Mutex<HashMap<String, ExecutionHandle>>,
    semaphore: Arc<Semaphore>,
}

/// Playbook execution engine with pause/resume, cancellation, rollback,
/// dry-run and approval gates.
#[derive(Clone)]
pub struct PlaybookEngine {
    inner: Arc<EngineInner>,
}

impl PlaybookEngine {
    /// Create an engine without an awareness sink
    pub fn new(config: EngineConfig) -> Self {
        Self::with_publisher(config, Arc::new(AwarenessPublisher::disabled()))
    }

    /// Create an engine publishing awareness events through the given
    /// publisher
    pub fn with_publisher(config: EngineConfig, publisher: Arc<AwarenessPublisher>) -> Self {
        let executor = Arc::new(ActionExecutor::new(&config));
        let classifier = Arc::new(ErrorClassifier::new());
        let validators = Arc::new(ValidatorRegistry::new());
        let approval: Arc<RwLock<Option<Arc<dyn ApprovalHandler>>>> = Arc::new(RwLock::new(None));
        let runner = Arc::new(StepRunner::new(
            executor.clone(),
            classifier.clone(),
            validators.clone(),
            approval.clone(),
            publisher.clone(),
        ));

        Self {
            inner: Arc::new(EngineInner {
                executor,
                classifier,
                validators,
                approval,
                rollback_handlers: RwLock::new(HashMap::new()),
                publisher,
                runner,
                executions: Mutex::new(HashMap::new()),
                semaphore: Arc::new(Semaphore::new(config.max_parallel_steps.max(1))),
            }),
        }
    }

    /// Set the human approval collaborator
    pub async fn set_approval_handler(&self, handler: Arc<dyn ApprovalHandler>) {
        *self.inner.approval.write().await = Some(handler);
    }

    /// Register an external step validator under a type name
    pub async fn register_validator(&self, name: &str, validator: Arc<dyn StepValidator>) {
        self.inner.validators.register(name, validator).await;
    }

    /// Register a rollback handler for an action name
    pub async fn register_rollback_handler(&self, name: &str, handler: Arc<dyn RollbackHandler>) {
        self.inner
            .rollback_handlers
            .write()
            .await
            .insert(name.to_string(), handler);
    }

    /// Register a named recovery handler used by the retry planner
    pub async fn register_recovery_handler(&self, name: &str, handler: Arc<dyn RecoveryHandler>) {
        self.inner.classifier.add_handler(name, handler).await;
    }

    /// Access the error classifier, e.g. to add custom patterns
    pub fn classifier(&self) -> Arc<ErrorClassifier> {
        self.inner.classifier.clone()
    }

    /// Execute a playbook and return a status snapshot once the run
    /// reaches a terminal state, pauses, or parks on an approval gate.
    pub async fn execute_playbook(
        &self,
        playbook: Playbook,
        parameters: HashMap<String, serde_json::Value>,
        run_id: Option<String>,
        dry_run: bool,
    ) -> Result<ExecutionStatus> {
        playbook.validate()?;
        playbook.check_prerequisites(&parameters)?;
        let plan = build_execution_plan(&playbook.steps)?;

        let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut context = ExecutionContext::new(run_id.clone(), parameters);
        for step in &playbook.steps {
            context.step_results.insert(
                step.id.clone(),
                StepResult::pending(
                    &step.id,
                    &step.name,
                    step.parallel_group.clone(),
                    step.depends_on.clone(),
                ),
            );
            if let Some(group) = &step.parallel_group {
                context
                    .parallel_groups
                    .entry(group.clone())
                    .or_default()
                    .push(step.id.clone());
            }
            if let Some(gate) = &step.approval_gate {
                context.approval_gates.insert(step.id.clone(), gate.clone());
            }
        }

        let handle = ExecutionHandle {
            playbook: Arc::new(playbook),
            plan: Arc::new(plan),
            context: Arc::new(RwLock::new(context)),
        };
        self.inner
            .executions
            .lock()
            .await
            .insert(run_id.clone(), handle.clone());

        self.inner.publisher.emit(
            &format!("Playbook execution started: {}", handle.playbook.name),
            "playbook_execution",
            json!({"run_id": run_id, "playbook_name": handle.playbook.name, "dry_run": dry_run}),
            &["playbook", "execution"],
        );

        {
            let mut ctx = handle.context.write().await;
            ctx.state = ExecutionState::Running;
        }

        if dry_run {
            self.dry_run_execution(&handle).await;
        } else {
            self.run_waves(handle.clone()).await;
        }

        let snapshot = handle.context.read().await.snapshot();
        Ok(snapshot)
    }

    /// Request a pause at the next wave boundary
    pub async fn pause_execution(&self, run_id: &str) -> bool {
        let executions = self.inner.executions.lock().await;
        if let Some(handle) = executions.get(run_id) {
            let mut ctx = handle.context.write().await;
            if ctx.state == ExecutionState::Running {
                ctx.pause_requested = true;
                info!("Pause requested for execution {}", run_id);
                return true;
            }
        }
        false
    }

    /// Resume a paused execution from the next unfinished wave
    pub async fn resume_execution(&self, run_id: &str) -> bool {
        let handle = {
            let executions = self.inner.executions.lock().await;
            executions.get(run_id).cloned()
        };
        let Some(handle) = handle else {
            return false;
        };
        {
            let mut ctx = handle.context.write().await;
            if ctx.state != ExecutionState::Paused {
                return false;
            }
            ctx.state = ExecutionState::Running;
            ctx.pause_requested = false;
        }
        info!("Resuming execution {}", run_id);
        let engine = self.clone();
        tokio::spawn(async move { engine.run_waves(handle).await });
        true
    }

    /// Cancel a running or paused execution. In-flight steps are not
    /// forcibly killed; no further waves are scheduled.
    pub async fn cancel_execution(&self, run_id: &str) -> bool {
        let executions = self.inner.executions.lock().await;
        if let Some(handle) = executions.get(run_id) {
            let mut ctx = handle.context.write().await;
            if matches!(ctx.state, ExecutionState::Running | ExecutionState::Paused) {
                ctx.cancel_requested = true;
                ctx.state = ExecutionState::Cancelled;
                ctx.finished_at = Some(Utc::now());
                info!("Execution {} cancelled", run_id);
                return true;
            }
        }
        false
    }

    /// Roll back a failed or completed execution, running registered
    /// rollback actions in reverse order. Errors are logged and never
    /// stop the sweep.
    pub async fn rollback_execution(&self, run_id: &str) -> bool {
        let handle = {
            let executions = self.inner.executions.lock().await;
            executions.get(run_id).cloned()
        };
        let Some(handle) = handle else {
            return false;
        };

        let stack = {
            let mut ctx = handle.context.write().await;
            if !matches!(
                ctx.state,
                ExecutionState::Failed | ExecutionState::Completed
            ) {
                return false;
            }
            ctx.state = ExecutionState::RollingBack;
            ctx.rollback_stack.clone()
        };

        for action in stack.iter().rev() {
            {
                let mut ctx = handle.context.write().await;
                if let Some(result) = ctx.step_results.get_mut(&action.step_id) {
                    result.state = StepState::RollingBack;
                }
            }

            let handler = {
                let handlers = self.inner.rollback_handlers.read().await;
                handlers.get(&action.action.to_string()).cloned()
            };
            let outcome = match handler {
                Some(handler) => {
                    let snapshot = handle.context.read().await.clone();
                    handler.rollback(&action.args, &snapshot).await
                }
                None => self
                    .inner
                    .executor
                    .execute(action.action, &action.args)
                    .await
                    .map(|_| ()),
            };

            let mut ctx = handle.context.write().await;
            if let Err(e) = outcome {
                error!("Rollback action failed for {}: {}", action.step_id, e);
                ctx.error_log
                    .push(format!("Rollback failed for {}: {}", action.step_id, e));
            }
            if let Some(result) = ctx.step_results.get_mut(&action.step_id) {
                result.state = StepState::RolledBack;
            }
        }

        let rolled_back = {
            let mut ctx = handle.context.write().await;
            ctx.state = ExecutionState::RolledBack;
            ctx.finished_at = Some(Utc::now());
            ctx.rollback_stack.len()
        };

        self.inner.publisher.emit(
            "Playbook execution rolled back",
            "playbook_execution",
            json!({"run_id": run_id, "rollback_actions": rolled_back}),
            &["playbook", "rollback"],
        );
        true
    }

    /// Record an approval for a step waiting on its gate. When the
    /// approver satisfies the gate the run is re-scheduled.
    pub async fn approve_step(&self, run_id: &str, step_id: &str, approver: &str) -> bool {
        let handle = {
            let executions = self.inner.executions.lock().await;
            executions.get(run_id).cloned()
        };
        let Some(handle) = handle else {
            return false;
        };

        let satisfied = {
            let mut ctx = handle.context.write().await;
            let Some(gate) = ctx.approval_gates.get(step_id).cloned() else {
                return false;
            };
            let Some(result) = ctx.step_results.get_mut(step_id) else {
                return false;
            };
            if result.state != StepState::WaitingApproval {
                return false;
            }
            result.approvals.push(approver.to_string());
            if gate.required_approvers.iter().any(|a| a == approver) {
                result.state = StepState::Pending;
                true
            } else {
                false
            }
        };

        if satisfied {
            info!("Step {} approved by {}, resuming {}", step_id, approver, run_id);
            let engine = self.clone();
            tokio::spawn(async move { engine.run_waves(handle).await });
        }
        satisfied
    }

    /// Copy-out status snapshot for a run
    pub async fn get_execution_status(&self, run_id: &str) -> Option<ExecutionStatus> {
        let executions = self.inner.executions.lock().await;
        match executions.get(run_id) {
            Some(handle) => Some(handle.context.read().await.snapshot()),
            None => None,
        }
    }

    /// List all known executions
    pub async fn list_active_executions(&self) -> Vec<ExecutionSummary> {
        let executions = self.inner.executions.lock().await;
        let mut summaries = Vec::with_capacity(executions.len());
        for handle in executions.values() {
            let ctx = handle.context.read().await;
            summaries.push(ExecutionSummary {
                run_id: ctx.run_id.clone(),
                state: ctx.state,
                started_at: ctx.started_at,
                duration_secs: ctx.duration_secs(),
                playbook_id: ctx.playbook_id,
            });
        }
        summaries
    }

    /// Drive waves until the run finishes, pauses, cancels or parks on
    /// an approval gate.
    async fn run_waves(&self, handle: ExecutionHandle) {
        loop {
            let wave_ids = {
                let mut ctx = handle.context.write().await;
                if ctx.cancel_requested || ctx.state == ExecutionState::Cancelled {
                    if ctx.state != ExecutionState::Cancelled {
                        ctx.state = ExecutionState::Cancelled;
                        ctx.finished_at = Some(Utc::now());
                    }
                    return;
                }
                if ctx.pause_requested {
                    ctx.state = ExecutionState::Paused;
                    return;
                }
                if ctx.current_wave_index >= handle.plan.len() {
                    drop(ctx);
                    self.finalize(&handle).await;
                    return;
                }
                handle.plan[ctx.current_wave_index].clone()
            };

            // Steps already terminal are not re-run on wave re-entry
            let runnable: Vec<String> = {
                let ctx = handle.context.read().await;
                wave_ids
                    .iter()
                    .filter(|id| {
                        ctx.step_results
                            .get(*id)
                            .map(|r| !r.state.is_terminal())
                            .unwrap_or(true)
                    })
                    .cloned()
                    .collect()
            };

            let outcomes = if runnable.len() <= 1 {
                let mut outcomes = Vec::new();
                for id in &runnable {
                    if let Some(step) = handle.playbook.step(id) {
                        outcomes.push(
                            self.inner.runner.run_step(step, &handle.context).await,
                        );
                    }
                }
                outcomes
            } else {
                let mut tasks = Vec::with_capacity(runnable.len());
                for id in &runnable {
                    let Some(step) = handle.playbook.step(id).cloned() else {
                        continue;
                    };
                    let runner = self.inner.runner.clone();
                    let context = handle.context.clone();
                    let semaphore = self.inner.semaphore.clone();
                    tasks.push(tokio::spawn(async move {
                        let _permit = semaphore.acquire_owned().await;
                        runner.run_step(&step, &context).await
                    }));
                }
                futures::future::join_all(tasks)
                    .await
                    .into_iter()
                    .map(|r| r.unwrap_or(StepOutcome::Failed))
                    .collect()
            };

            if outcomes
                .iter()
                .any(|o| *o == StepOutcome::AwaitingApproval)
            {
                // The run stays registered; approve_step re-schedules it
                return;
            }

            let failed = outcomes.iter().any(|o| *o == StepOutcome::Failed);
            if failed && !handle.playbook.continue_on_failure {
                self.finalize(&handle).await;
                return;
            }

            let mut ctx = handle.context.write().await;
            ctx.current_wave_index += 1;
        }
    }

    async fn finalize(&self, handle: &ExecutionHandle) {
        let (run_id, state, failed_steps) = {
            let mut ctx = handle.context.write().await;
            let failed = ctx
                .step_results
                .values()
                .filter(|r| r.state == StepState::Failed)
                .count();
            ctx.state = if failed > 0 {
                ExecutionState::Failed
            } else {
                ExecutionState::Completed
            };
            ctx.finished_at = Some(Utc::now());
            (ctx.run_id.clone(), ctx.state, failed)
        };

        self.inner.publisher.emit(
            &format!("Playbook execution finished: {:?}", state),
            "playbook_execution",
            json!({"run_id": run_id, "final_state": state, "failed_steps": failed_steps}),
            &["playbook", "execution"],
        );
    }

    /// Dry-run: pre-validate every step without executing actions
    async fn dry_run_execution(&self, handle: &ExecutionHandle) {
        let scope = {
            let ctx = handle.context.read().await;
            ctx.scope()
        };
        let snapshot = handle.context.read().await.clone();

        let mut run_failed = false;
        for step in &handle.playbook.steps {
            let mut results: Vec<ValidationOutcome> = Vec::new();

            for condition in &step.when {
                if !conditions::evaluate(condition, &scope) {
                    results.push(
                        ValidationOutcome::fail(format!(
                            "When condition not met: {}",
                            condition.kind
                        ))
                        .with_details(json!({"condition": condition})),
                    );
                }
            }
            for config in &step.validators {
                let Some(kind) = config.get("type").and_then(serde_json::Value::as_str) else {
                    continue;
                };
                if let Some(validator) = self.inner.validators.get(kind).await {
                    results.push(validator.validate(config, &snapshot).await);
                } else {
                    warn!("No validator registered for type '{}', skipping", kind);
                }
            }

            let invalid = results.iter().any(|r| !r.valid);
            let mut ctx = handle.context.write().await;
            if let Some(result) = ctx.step_results.get_mut(&step.id) {
                let now = Utc::now();
                result.started_at = Some(now);
                result.finished_at = Some(now);
                result.validation_results = results;
                if invalid {
                    result.state = StepState::Failed;
                    result.error = Some("Pre-execution validation failed".to_string());
                } else {
                    result.state = StepState::Completed;
                }
            }
            if invalid {
                run_failed = true;
                break;
            }
        }

        let mut ctx = handle.context.write().await;
        ctx.state = if run_failed {
            ExecutionState::Failed
        } else {
            ExecutionState::Completed
        };
        ctx.finished_at = Some(Utc::now());
    }
}
