//! Awareness publishing - best-effort event feed to the external memory sink
//!
//! The engine pushes structured records about executions and rule changes
//! to a host-provided memory sink and, for rule changes, to a pub/sub
//! broadcast bus. Emission never fails the caller: events flow through a
//! bounded queue drained by a background task, and overflow drops the
//! event rather than blocking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Capacity of the local event queue before drop-on-overflow kicks in
const QUEUE_CAPACITY: usize = 1024;

/// External memory sink contract. Implementations must be cheap;
/// the publisher already serializes calls through its queue.
#[async_trait]
pub trait MemorySink: Send + Sync {
    /// Store one awareness record
    async fn store_memory(
        &self,
        content: &str,
        category: &str,
        metadata: Value,
        tags: &[String],
    ) -> anyhow::Result<()>;
}

/// Pub/sub bus for rule change events across nodes
#[async_trait]
pub trait BroadcastBus: Send + Sync {
    /// Publish one rule change event
    async fn publish(&self, event: RuleChangeEvent) -> anyhow::Result<()>;
}

/// One record pushed to the memory sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwarenessEvent {
    /// Human-readable summary line
    pub content: String,
    /// Sink category, e.g. "playbook_execution" or "rules"
    pub category: String,
    /// Structured payload
    pub metadata: Value,
    /// Free-form tags
    pub tags: Vec<String>,
}

/// Rule change notification broadcast to other nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleChangeEvent {
    /// Affected rule id
    pub rule_id: String,
    /// Change type name (created, updated, activated, ...)
    pub change_type: String,
    /// Snapshot of the rule data at change time
    pub rule_data: Value,
    /// When the change happened
    pub timestamp: DateTime<Utc>,
    /// Machine that performed the change
    pub source_machine: String,
}

enum Outbound {
    Memory(AwarenessEvent),
    Broadcast(RuleChangeEvent),
}

/// Write-only publisher in front of the memory sink and broadcast bus
pub struct AwarenessPublisher {
    tx: Option<mpsc::Sender<Outbound>>,
    dropped: AtomicU64,
}

impl AwarenessPublisher {
    /// Create a publisher draining into the given sink and bus.
    ///
    /// Must be called from within a tokio runtime; the drain task is
    /// spawned immediately.
    pub fn new(sink: Option<Arc<dyn MemorySink>>, bus: Option<Arc<dyn BroadcastBus>>) -> Self {
        if sink.is_none() && bus.is_none() {
            return Self::disabled();
        }

        let (tx, mut rx) = mpsc::channel::<Outbound>(QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                match outbound {
                    Outbound::Memory(event) => {
                        if let Some(sink) = &sink {
                            if let Err(e) = sink
                                .store_memory(
                                    &event.content,
                                    &event.category,
                                    event.metadata,
                                    &event.tags,
                                )
                                .await
                            {
                                warn!("Memory sink rejected event: {}", e);
                            }
                        }
                    }
                    Outbound::Broadcast(event) => {
                        if let Some(bus) = &bus {
                            if let Err(e) = bus.publish(event).await {
                                warn!("Broadcast bus rejected event: {}", e);
                            }
                        }
                    }
                }
            }
        });

        Self {
            tx: Some(tx),
            dropped: AtomicU64::new(0),
        }
    }

    /// Create a publisher that silently discards everything.
    /// Useful for tests and hosts without a memory sink.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: AtomicU64::new(0),
        }
    }

    /// Emit one record toward the memory sink. Never fails.
    pub fn emit(&self, content: &str, category: &str, metadata: Value, tags: &[&str]) {
        let Some(tx) = &self.tx else {
            return;
        };
        let event = AwarenessEvent {
            content: content.to_string(),
            category: category.to_string(),
            metadata,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        };
        if tx.try_send(Outbound::Memory(event)).is_err() {
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("Awareness queue full, dropped event ({} total)", n);
        }
    }

    /// Broadcast a rule change event on the bus. Never fails.
    pub fn broadcast_change(&self, event: RuleChangeEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.try_send(Outbound::Broadcast(event)).is_err() {
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("Awareness queue full, dropped broadcast ({} total)", n);
        }
    }

    /// Number of events dropped due to queue overflow
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
