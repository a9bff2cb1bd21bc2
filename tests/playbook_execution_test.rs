//! End-to-end playbook execution tests
//!
//! These exercise the full engine without touching the network: waves,
//! variable passing, skipping, failure containment, pause/resume,
//! cancellation, dry-run, rollback and approval gates.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use apiary::playbook::{
    ApprovalGate, ApprovalHandler, ExecutionState, Playbook, PlaybookEngine, RollbackHandler,
    StepState, StepValidator, ValidationOutcome,
};
use apiary::EngineConfig;

fn engine() -> PlaybookEngine {
    PlaybookEngine::new(EngineConfig::default())
}

fn params(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

async fn wait_for_state(
    engine: &PlaybookEngine,
    run_id: &str,
    state: ExecutionState,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(status) = engine.get_execution_status(run_id).await {
            if status.state == state {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_basic_sequential_execution() {
    let playbook = Playbook::parse(
        r#"
name: Basic
steps:
  - id: s1
    action: noop
    args: {message: "checking ${service}"}
    outputs:
      - {name: check_message, from: message}
  - id: s2
    action: wait
    args: {seconds: 0.05}
    depends_on: [s1]
  - id: s3
    action: noop
    args: {message: "done"}
    depends_on: [s2]
    validations:
      - {type: equals, left: "${check_message}", right: "checking nginx"}
"#,
    )
    .unwrap();

    let engine = engine();
    let status = engine
        .execute_playbook(playbook, params(&[("service", json!("nginx"))]), None, false)
        .await
        .unwrap();

    assert_eq!(status.state, ExecutionState::Completed);
    assert_eq!(status.completed_steps, 3);
    assert_eq!(status.failed_steps, 0);
    assert_eq!(status.variables["check_message"], json!("checking nginx"));

    for result in status.step_results.values() {
        assert_eq!(result.state, StepState::Completed);
        let started = result.started_at.unwrap();
        let finished = result.finished_at.unwrap();
        assert!(finished >= started);
    }
}

#[tokio::test]
async fn test_parallel_wave_wall_clock() {
    let playbook = Playbook::parse(
        r#"
name: Parallel
steps:
  - {id: p1, action: wait, args: {seconds: 0.3}, parallel_group: g}
  - {id: p2, action: wait, args: {seconds: 0.3}, parallel_group: g}
  - {id: p3, action: wait, args: {seconds: 0.3}, parallel_group: g}
  - {id: done, action: noop, depends_on: [p1, p2, p3]}
"#,
    )
    .unwrap();

    let engine = engine();
    let start = Instant::now();
    let status = engine
        .execute_playbook(playbook, HashMap::new(), None, false)
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(status.state, ExecutionState::Completed);
    assert_eq!(status.completed_steps, 4);
    // Three 0.3s steps in one wave: well under the 0.9s sequential time
    assert!(
        elapsed < Duration::from_millis(700),
        "parallel wave took {:?}",
        elapsed
    );
}

#[tokio::test]
async fn test_when_condition_skips_step() {
    let playbook = Playbook::parse(
        r#"
name: Skip
steps:
  - id: maybe
    action: noop
    when:
      - {type: equals, left: "${mode}", right: "full"}
  - id: always
    action: noop
    depends_on: [maybe]
"#,
    )
    .unwrap();

    let engine = engine();
    let status = engine
        .execute_playbook(playbook, params(&[("mode", json!("quick"))]), None, false)
        .await
        .unwrap();

    // Skipping is not failure; the dependent step still runs
    assert_eq!(status.state, ExecutionState::Completed);
    assert_eq!(status.step_results["maybe"].state, StepState::Skipped);
    assert_eq!(status.step_results["always"].state, StepState::Completed);
}

#[tokio::test]
async fn test_post_validation_failure_fails_step() {
    let playbook = Playbook::parse(
        r#"
name: Validate
steps:
  - id: s1
    action: noop
    args: {message: "hello"}
    validations:
      - {type: equals, left: "${missing_var}", right: "expected"}
  - id: s2
    action: noop
    depends_on: [s1]
"#,
    )
    .unwrap();

    let engine = engine();
    let start = Instant::now();
    let status = engine
        .execute_playbook(playbook, HashMap::new(), None, false)
        .await
        .unwrap();

    // Validation failures are classified no-retry, so this is fast
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(status.state, ExecutionState::Failed);
    let failed = &status.step_results["s1"];
    assert_eq!(failed.state, StepState::Failed);
    assert!(failed.error.as_ref().unwrap().contains("Validation failed"));
    // The later wave never ran
    assert_eq!(status.step_results["s2"].state, StepState::Pending);
}

#[tokio::test]
async fn test_continue_on_failure_runs_later_waves() {
    let playbook = Playbook::parse(
        r#"
name: Continue
continue_on_failure: true
steps:
  - id: bad
    action: noop
    validations:
      - {type: equals, left: "a", right: "b"}
  - id: good
    action: noop
    depends_on: []
"#,
    )
    .unwrap();

    let engine = engine();
    let status = engine
        .execute_playbook(playbook, HashMap::new(), None, false)
        .await
        .unwrap();

    assert_eq!(status.state, ExecutionState::Failed);
    assert_eq!(status.step_results["bad"].state, StepState::Failed);
    assert_eq!(status.step_results["good"].state, StepState::Completed);
}

#[tokio::test]
async fn test_pause_and_resume() {
    let playbook = Playbook::parse(
        r#"
name: Pausable
steps:
  - {id: s1, action: wait, args: {seconds: 0.1}}
  - {id: s2, action: wait, args: {seconds: 0.5}, depends_on: [s1]}
  - {id: s3, action: noop, depends_on: [s2]}
"#,
    )
    .unwrap();

    let engine = engine();
    let run_id = "pause-test".to_string();
    let task = {
        let engine = engine.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move {
            engine
                .execute_playbook(playbook, HashMap::new(), Some(run_id), false)
                .await
                .unwrap()
        })
    };

    // Request the pause while the second wave is in flight
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(engine.pause_execution(&run_id).await);

    let paused_status = task.await.unwrap();
    assert_eq!(paused_status.state, ExecutionState::Paused);
    assert_eq!(paused_status.step_results["s2"].state, StepState::Completed);
    assert_eq!(paused_status.step_results["s3"].state, StepState::Pending);

    assert!(engine.resume_execution(&run_id).await);
    assert!(
        wait_for_state(&engine, &run_id, ExecutionState::Completed, Duration::from_secs(3)).await
    );
    let status = engine.get_execution_status(&run_id).await.unwrap();
    assert_eq!(status.completed_steps, 3);
}

#[tokio::test]
async fn test_cancel_stops_scheduling() {
    let playbook = Playbook::parse(
        r#"
name: Cancellable
steps:
  - {id: s1, action: wait, args: {seconds: 0.1}}
  - {id: s2, action: wait, args: {seconds: 0.4}, depends_on: [s1]}
  - {id: s3, action: noop, depends_on: [s2]}
"#,
    )
    .unwrap();

    let engine = engine();
    let run_id = "cancel-test".to_string();
    let task = {
        let engine = engine.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move {
            engine
                .execute_playbook(playbook, HashMap::new(), Some(run_id), false)
                .await
                .unwrap()
        })
    };

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(engine.cancel_execution(&run_id).await);

    let status = task.await.unwrap();
    assert_eq!(status.state, ExecutionState::Cancelled);
    // No new step starts after cancellation
    assert_eq!(status.step_results["s3"].state, StepState::Pending);
}

#[tokio::test]
async fn test_dry_run_has_no_side_effects() {
    let playbook = Playbook::parse(
        r#"
name: DryRun
steps:
  - {id: slow, action: wait, args: {seconds: 10}}
  - id: web
    action: http_request
    args: {method: GET, url: "https://service.internal/health"}
    depends_on: [slow]
    outputs:
      - {name: status_code, from: status_code}
"#,
    )
    .unwrap();

    let engine = engine();
    let start = Instant::now();
    let status = engine
        .execute_playbook(playbook, HashMap::new(), None, true)
        .await
        .unwrap();

    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(status.state, ExecutionState::Completed);
    assert_eq!(status.completed_steps, 2);
    // Nothing executed, nothing exported
    assert!(status.variables.is_empty());
}

#[tokio::test]
async fn test_rollback_runs_in_reverse_order() {
    struct OrderRecorder {
        order: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RollbackHandler for OrderRecorder {
        async fn rollback(
            &self,
            args: &Map<String, Value>,
            _context: &apiary::playbook::ExecutionContext,
        ) -> anyhow::Result<()> {
            let label = args
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            self.order.lock().unwrap().push(label);
            Ok(())
        }
    }

    let playbook = Playbook::parse(
        r#"
name: Reversible
steps:
  - id: first
    action: noop
    rollback: {action: noop, args: {message: "undo-first"}}
  - id: second
    action: noop
    depends_on: [first]
    rollback: {action: noop, args: {message: "undo-second"}}
"#,
    )
    .unwrap();

    let engine = engine();
    let recorder = Arc::new(OrderRecorder {
        order: Mutex::new(Vec::new()),
    });
    engine.register_rollback_handler("noop", recorder.clone()).await;

    let run_id = "rollback-test".to_string();
    let status = engine
        .execute_playbook(playbook, HashMap::new(), Some(run_id.clone()), false)
        .await
        .unwrap();
    assert_eq!(status.state, ExecutionState::Completed);
    // One rollback action per completed step
    let total_actions: usize = status
        .step_results
        .values()
        .map(|r| r.rollback_actions.len())
        .sum();
    assert_eq!(total_actions, 2);

    assert!(engine.rollback_execution(&run_id).await);
    let status = engine.get_execution_status(&run_id).await.unwrap();
    assert_eq!(status.state, ExecutionState::RolledBack);
    assert_eq!(status.step_results["first"].state, StepState::RolledBack);
    assert_eq!(status.step_results["second"].state, StepState::RolledBack);

    let order = recorder.order.lock().unwrap().clone();
    assert_eq!(order, vec!["undo-second", "undo-first"]);
}

#[tokio::test]
async fn test_approval_gate_flow() {
    struct AlwaysPark;

    #[async_trait]
    impl ApprovalHandler for AlwaysPark {
        async fn request_approval(&self, _gate: &ApprovalGate) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    let playbook = Playbook::parse(
        r#"
name: Gated
steps:
  - id: gated
    action: noop
    approval_gate:
      message: "Deploy to production?"
      required_approvers: [alice, bob]
  - id: after
    action: noop
    depends_on: [gated]
"#,
    )
    .unwrap();

    let engine = engine();
    engine.set_approval_handler(Arc::new(AlwaysPark)).await;

    let run_id = "approval-test".to_string();
    let status = engine
        .execute_playbook(playbook, HashMap::new(), Some(run_id.clone()), false)
        .await
        .unwrap();
    assert_eq!(status.step_results["gated"].state, StepState::WaitingApproval);

    // An unlisted approver does not satisfy the gate
    assert!(!engine.approve_step(&run_id, "gated", "mallory").await);

    assert!(engine.approve_step(&run_id, "gated", "alice").await);
    assert!(
        wait_for_state(&engine, &run_id, ExecutionState::Completed, Duration::from_secs(3)).await
    );
    let status = engine.get_execution_status(&run_id).await.unwrap();
    assert_eq!(status.step_results["gated"].state, StepState::Completed);
    assert_eq!(status.step_results["after"].state, StepState::Completed);
    assert!(status.step_results["gated"]
        .approvals
        .contains(&"alice".to_string()));
}

#[tokio::test]
async fn test_external_validator_failure() {
    struct AlwaysInvalid;

    #[async_trait]
    impl StepValidator for AlwaysInvalid {
        async fn validate(
            &self,
            _config: &Map<String, Value>,
            _context: &apiary::playbook::ExecutionContext,
        ) -> ValidationOutcome {
            ValidationOutcome::fail("service is not running")
        }
    }

    let playbook = Playbook::parse(
        r#"
name: Checked
steps:
  - id: s1
    action: noop
    validators:
      - {type: service_running, service: nginx}
"#,
    )
    .unwrap();

    let engine = engine();
    engine
        .register_validator("service_running", Arc::new(AlwaysInvalid))
        .await;

    let status = engine
        .execute_playbook(playbook, HashMap::new(), None, false)
        .await
        .unwrap();
    assert_eq!(status.state, ExecutionState::Failed);
    let result = &status.step_results["s1"];
    assert_eq!(
        result.error.as_deref(),
        Some("Pre-execution validation failed")
    );
    assert!(result.validation_results.iter().any(|v| !v.valid));
}

#[tokio::test]
async fn test_shell_disabled_by_default() {
    let playbook = Playbook::parse(
        r#"
name: Shelly
steps:
  - id: s1
    action: shell
    args: {command: "echo hi"}
    retry: {max_attempts: 1}
"#,
    )
    .unwrap();

    let engine = engine();
    let status = engine
        .execute_playbook(playbook, HashMap::new(), None, false)
        .await
        .unwrap();
    assert_eq!(status.state, ExecutionState::Failed);
    assert!(status.step_results["s1"]
        .error
        .as_ref()
        .unwrap()
        .contains("disabled"));
}

#[tokio::test]
async fn test_shell_enabled_exports_outputs() {
    let config = EngineConfig {
        allow_unsafe_shell: true,
        ..EngineConfig::default()
    };
    let engine = PlaybookEngine::new(config);

    let playbook = Playbook::parse(
        r#"
name: ShellOk
steps:
  - id: s1
    action: shell
    args: {command: "echo hello-from-shell"}
    outputs:
      - {name: greeting, from: stdout}
    validations:
      - {type: equals, left: "${greeting}", right: "hello-from-shell"}
"#,
    )
    .unwrap();

    let status = engine
        .execute_playbook(playbook, HashMap::new(), None, false)
        .await
        .unwrap();
    assert_eq!(status.state, ExecutionState::Completed);
    assert_eq!(status.variables["greeting"], json!("hello-from-shell"));
}

#[tokio::test]
async fn test_variables_flow_between_waves() {
    let playbook = Playbook::parse(
        r#"
name: Variables
steps:
  - id: produce
    action: noop
    args: {message: "from-step-one"}
    outputs:
      - {name: token, from: message}
      - {name: fixed, from: value, value: 42}
  - id: consume
    action: noop
    args: {message: "got ${token} and ${fixed}"}
    depends_on: [produce]
    outputs:
      - {name: combined, from: message}
"#,
    )
    .unwrap();

    let engine = engine();
    let status = engine
        .execute_playbook(playbook, HashMap::new(), None, false)
        .await
        .unwrap();
    assert_eq!(status.state, ExecutionState::Completed);
    assert_eq!(status.variables["token"], json!("from-step-one"));
    assert_eq!(status.variables["fixed"], json!(42));
    assert_eq!(
        status.variables["combined"],
        json!("got from-step-one and 42")
    );
}

#[tokio::test]
async fn test_circular_dependencies_rejected_before_side_effects() {
    // Parsing accepts cycles; planning rejects them before any side effect
    let playbook = Playbook::parse(
        r#"
name: Cycle
steps:
  - {id: a, action: noop, depends_on: [b]}
  - {id: b, action: noop, depends_on: [a]}
"#,
    )
    .unwrap();

    let engine = engine();
    let err = engine
        .execute_playbook(playbook, HashMap::new(), Some("cycle-test".to_string()), false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Cannot resolve dependencies"));
    // The run was never registered
    assert!(engine.get_execution_status("cycle-test").await.is_none());
}

#[tokio::test]
async fn test_list_active_executions() {
    let playbook = Playbook::parse(
        r#"
name: Listed
steps:
  - {id: s1, action: noop}
"#,
    )
    .unwrap();

    let engine = engine();
    engine
        .execute_playbook(playbook, HashMap::new(), Some("listed-run".to_string()), false)
        .await
        .unwrap();

    let executions = engine.list_active_executions().await;
    assert!(executions.iter().any(|e| e.run_id == "listed-run"));
}

#[tokio::test]
async fn test_missing_required_parameter_rejected() {
    let playbook = Playbook::parse(
        r#"
name: Needy
parameters:
  - {name: service_name, required: true}
prerequisites:
  - {type: non_empty, param: service_name}
steps:
  - {id: s1, action: noop}
"#,
    )
    .unwrap();

    let engine = engine();
    let err = engine
        .execute_playbook(playbook, HashMap::new(), None, false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("service_name"));
}
