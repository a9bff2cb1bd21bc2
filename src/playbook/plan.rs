//! Execution planning - ordered waves honoring dependencies
//!
//! The planner walks steps in declared order and groups them into waves.
//! A step becomes eligible once every dependency is satisfied by earlier
//! waves; parallelism is opt-in through `parallel_group`. Steps inside
//! one wave never depend on each other.

use std::collections::HashSet;

use crate::core::error::{EngineError, Result};

use super::model::Step;

/// Build the ordered list of execution waves for a validated playbook
pub fn build_execution_plan(steps: &[Step]) -> Result<Vec<Vec<String>>> {
    let mut plan: Vec<Vec<String>> = Vec::new();
    let mut done: HashSet<&str> = HashSet::new();

    while done.len() < steps.len() {
        let mut wave: Vec<String> = Vec::new();

        for step in steps {
            if done.contains(step.id.as_str()) || wave.iter().any(|id| id == &step.id) {
                continue;
            }
            // Eligibility counts only earlier waves, never wave-mates
            if !step.depends_on.iter().all(|dep| done.contains(dep.as_str())) {
                continue;
            }
            if wave.is_empty() {
                wave.push(step.id.clone());
            } else if step.parallel_group.is_some() {
                wave.push(step.id.clone());
            } else {
                // Sequential step terminates the current wave
                break;
            }
        }

        if wave.is_empty() {
            let remaining: Vec<String> = steps
                .iter()
                .filter(|s| !done.contains(s.id.as_str()))
                .map(|s| s.id.clone())
                .collect();
            return Err(EngineError::UnresolvableDependencies { steps: remaining });
        }

        for id in &wave {
            // Clone-free lookup: the id came from `steps` above
            let step = steps.iter().find(|s| &s.id == id);
            if let Some(step) = step {
                done.insert(step.id.as_str());
            }
        }
        plan.push(wave);
    }

    Ok(plan)
}
