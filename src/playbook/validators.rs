//! Pluggable step validation and rollback contracts
//!
//! Concrete checks (service status, disk space, port probes) live outside
//! the engine; this module defines the contracts and the registries the
//! step runner and rollback sweep dispatch through.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::model::ApprovalGate;
use super::state::{ExecutionContext, ValidationOutcome};

/// External pre-execution check, selected by the `type` key of a step's
/// validator entry.
#[async_trait]
pub trait StepValidator: Send + Sync {
    /// Run the check against a snapshot of the execution context
    async fn validate(
        &self,
        config: &Map<String, Value>,
        context: &ExecutionContext,
    ) -> ValidationOutcome;
}

/// External rollback side effect, selected by rollback action name
#[async_trait]
pub trait RollbackHandler: Send + Sync {
    /// Perform the rollback. Errors are logged, never propagated.
    async fn rollback(
        &self,
        args: &Map<String, Value>,
        context: &ExecutionContext,
    ) -> anyhow::Result<()>;
}

/// Human approval collaborator. Returning false parks the step in
/// `waiting_approval` until `approve_step` is called.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Decide whether the gate is satisfied right now
    async fn request_approval(&self, gate: &ApprovalGate) -> anyhow::Result<bool>;
}

/// Registry of named step validators
#[derive(Default)]
pub struct ValidatorRegistry {
    validators: RwLock<HashMap<String, Arc<dyn StepValidator>>>,
}

impl ValidatorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a validator under a type name
    pub async fn register(&self, name: &str, validator: Arc<dyn StepValidator>) {
        self.validators
            .write()
            .await
            .insert(name.to_string(), validator);
    }

    /// Look up a validator by type name
    pub async fn get(&self, name: &str) -> Option<Arc<dyn StepValidator>> {
        self.validators.read().await.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysValid;

    #[async_trait]
    impl StepValidator for AlwaysValid {
        async fn validate(
            &self,
            _config: &Map<String, Value>,
            _context: &ExecutionContext,
        ) -> ValidationOutcome {
            ValidationOutcome::ok("fine")
        }
    }

    #[tokio::test]
    async fn test_registry_roundtrip() {
        let registry = ValidatorRegistry::new();
        registry.register("always", Arc::new(AlwaysValid)).await;
        assert!(registry.get("always").await.is_some());
        assert!(registry.get("missing").await.is_none());
    }
}
