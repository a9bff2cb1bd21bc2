//! Apiary: declarative playbook execution with rule-based behavior
//! governance
//!
//! Two cooperating cores: a playbook execution engine (ordered waves of
//! steps with validation, retries, circuit breaking, pause/resume,
//! rollback and approval gates) and a rules engine (typed, scoped,
//! prioritized rules folded into behavior configurations, with
//! inheritance, conflict resolution and scheduled/conditional lanes).
//! Both publish structured events to an external memory sink through
//! the awareness publisher.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod awareness;
pub mod core;
pub mod playbook;
pub mod rules;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export core types
pub use crate::core::{
    config::EngineConfig,
    error::{EngineError, Result},
    logging::initialize_default_logging,
};

// Re-export major subsystems
pub use awareness::{AwarenessPublisher, BroadcastBus, MemorySink, RuleChangeEvent};
pub use playbook::{Playbook, PlaybookEngine};
pub use rules::{RuleEvaluator, RuleStore};
